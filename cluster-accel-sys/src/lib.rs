//! Raw device ABI for cluster acceleration structure builds.
//!
//! These are the argument records a build command consumes from device
//! memory, declared field-for-field after the *OptiX* cluster acceleration
//! API (`OptixClusterAccelBuildInput*Args`). The native headers declare the
//! packed counts and the base primitive info as C bit-fields; since bit-field
//! layout is not portable across compilers, every bit-field group is declared
//! here as the single `u32` word it occupies, together with the shift/width of
//! each field. Packing values into those words is done by the safe wrapper
//! crate.
//!
//! All records are `#[repr(C)]`, naturally aligned, little-endian and free of
//! padding, so they are [`Pod`](bytemuck::Pod).

pub mod optix;

pub use optix::*;
