//! # Descriptor Validation
//!
//! Rules are checked in order and the first violation is reported:
//!
//! 1. [`Op`](ValidationRule::Op) – the operation is known and its limits
//!    belong to the right family.
//! 2. [`Limits`](ValidationRule::Limits) – every required limit is nonzero.
//! 3. [`ArgCount`](ValidationRule::ArgCount) – `arg_count` is nonzero and
//!    within `max_arg_count`.
//! 4. [`ArgsBuffer`](ValidationRule::ArgsBuffer) – the argument buffer is set
//!    and the stride holds at least one record.
//! 5. [`ModeParams`](ValidationRule::ModeParams) – the buffers the build mode
//!    requires are set.
//!
//! Sizing only depends on the operation and its limits, so
//! [`validate_for_sizing()`] stops after rule 2.
use crate::desc::{BuildMode, ClusterAccelBuildDesc, ClusterAccelBuildOp, Limits, LimitsFamily};
use crate::error::Result;
use derive_more::Display;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationRule {
    #[display("op")]
    Op = 1,
    #[display("limits")]
    Limits = 2,
    #[display("arg count")]
    ArgCount = 3,
    #[display("args buffer")]
    ArgsBuffer = 4,
    #[display("mode parameters")]
    ModeParams = 5,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown cluster acceleration build op {0}")]
    UnknownOp(u32),

    #[error("{op} takes {expected} limits, got {actual} limits")]
    LimitsFamilyMismatch {
        op: ClusterAccelBuildOp,
        expected: LimitsFamily,
        actual: LimitsFamily,
    },

    #[error("Limit `{field}` must be nonzero")]
    ZeroLimit { field: &'static str },

    #[error("`arg_count` must be nonzero")]
    ZeroArgCount,

    #[error("`arg_count` {arg_count} exceeds `max_arg_count` {max_arg_count}")]
    ArgCountExceedsLimit { arg_count: u32, max_arg_count: u32 },

    #[error("`args_buffer` is null")]
    NullArgsBuffer,

    #[error("`args_stride_in_bytes` {stride} is smaller than the {record_size} byte {op} record")]
    ArgsStrideTooSmall {
        op: ClusterAccelBuildOp,
        stride: u32,
        record_size: u32,
    },

    #[error("{mode} build requires `{field}`")]
    MissingModeBuffer {
        mode: &'static str,
        field: &'static str,
    },
}

impl ValidationError {
    /// The rule this error violates.
    pub fn rule(&self) -> ValidationRule {
        match self {
            Self::UnknownOp(_) | Self::LimitsFamilyMismatch { .. } => ValidationRule::Op,
            Self::ZeroLimit { .. } => ValidationRule::Limits,
            Self::ZeroArgCount | Self::ArgCountExceedsLimit { .. } => ValidationRule::ArgCount,
            Self::NullArgsBuffer | Self::ArgsStrideTooSmall { .. } => ValidationRule::ArgsBuffer,
            Self::MissingModeBuffer { .. } => ValidationRule::ModeParams,
        }
    }

    /// Name of the offending descriptor field.
    pub fn field(&self) -> &'static str {
        match self {
            Self::UnknownOp(_) => "op",
            Self::LimitsFamilyMismatch { .. } => "limits",
            Self::ZeroLimit { field } => *field,
            Self::ZeroArgCount | Self::ArgCountExceedsLimit { .. } => "arg_count",
            Self::NullArgsBuffer => "args_buffer",
            Self::ArgsStrideTooSmall { .. } => "args_stride_in_bytes",
            Self::MissingModeBuffer { field, .. } => *field,
        }
    }
}

fn nonzero(value: u32, field: &'static str) -> std::result::Result<(), ValidationError> {
    if 0 == value {
        Err(ValidationError::ZeroLimit { field })
    } else {
        Ok(())
    }
}

fn check_op_and_limits(desc: &ClusterAccelBuildDesc) -> std::result::Result<(), ValidationError> {
    let op = desc.op();
    if op.limits_family() != desc.limits().family() {
        return Err(ValidationError::LimitsFamilyMismatch {
            op,
            expected: op.limits_family(),
            actual: desc.limits().family(),
        });
    }

    match desc.limits() {
        Limits::Triangles(limits) => {
            nonzero(limits.max_arg_count, "max_arg_count")?;
            nonzero(limits.max_triangle_count_per_arg, "max_triangle_count_per_arg")?;
            nonzero(limits.max_vertex_count_per_arg, "max_vertex_count_per_arg")?;
            nonzero(
                limits.max_unique_sbt_index_count_per_arg,
                "max_unique_sbt_index_count_per_arg",
            )?;
        }
        Limits::Clusters(limits) => {
            nonzero(limits.max_arg_count, "max_arg_count")?;
            nonzero(limits.max_total_cluster_count, "max_total_cluster_count")?;
            nonzero(limits.max_cluster_count_per_arg, "max_cluster_count_per_arg")?;
        }
    }
    Ok(())
}

fn required(
    address: crate::DeviceAddress,
    mode: &'static str,
    field: &'static str,
) -> std::result::Result<(), ValidationError> {
    if address.is_null() {
        Err(ValidationError::MissingModeBuffer { mode, field })
    } else {
        Ok(())
    }
}

fn check_all(desc: &ClusterAccelBuildDesc) -> std::result::Result<(), ValidationError> {
    check_op_and_limits(desc)?;

    let max_arg_count = desc.limits().max_arg_count();
    if 0 == desc.arg_count {
        return Err(ValidationError::ZeroArgCount);
    }
    if desc.arg_count > max_arg_count {
        return Err(ValidationError::ArgCountExceedsLimit {
            arg_count: desc.arg_count,
            max_arg_count,
        });
    }

    if desc.args_buffer.is_null() {
        return Err(ValidationError::NullArgsBuffer);
    }
    let record_size = desc.op().args_record_size();
    if desc.args_stride_in_bytes < record_size {
        return Err(ValidationError::ArgsStrideTooSmall {
            op: desc.op(),
            stride: desc.args_stride_in_bytes,
            record_size,
        });
    }

    match &desc.mode {
        BuildMode::Implicit(p) => {
            required(p.output_buffer, "implicit", "output_buffer")?;
            required(p.temp_buffer, "implicit", "temp_buffer")?;
            required(p.output_handles_buffer, "implicit", "output_handles_buffer")?;
        }
        BuildMode::ExplicitDestinations(p) => {
            required(p.temp_buffer, "explicit_destinations", "temp_buffer")?;
            required(
                p.dest_addresses_buffer,
                "explicit_destinations",
                "dest_addresses_buffer",
            )?;
        }
        BuildMode::GetSizes(p) => {
            required(p.temp_buffer, "get_sizes", "temp_buffer")?;
            required(p.output_sizes_buffer, "get_sizes", "output_sizes_buffer")?;
        }
    }
    Ok(())
}

/// Checks all five rules.
pub fn validate(desc: &ClusterAccelBuildDesc) -> Result<()> {
    check_all(desc)?;
    Ok(())
}

/// Checks the rules sizing depends on: the operation and its limits.
pub fn validate_for_sizing(desc: &ClusterAccelBuildDesc) -> Result<()> {
    check_op_and_limits(desc)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{GetSizesParams, ImplicitBuildParams, LimitsClusters, LimitsTriangles};
    use crate::{DeviceAddress, Error};

    fn triangle_limits() -> LimitsTriangles {
        LimitsTriangles {
            max_arg_count: 4,
            max_triangle_count_per_arg: 2,
            max_vertex_count_per_arg: 4,
            max_unique_sbt_index_count_per_arg: 1,
            position_truncate_bit_count: 0,
        }
    }

    fn implicit() -> ImplicitBuildParams {
        ImplicitBuildParams {
            output_buffer: DeviceAddress::new(0x1000),
            temp_buffer: DeviceAddress::new(0x2000),
            output_handles_buffer: DeviceAddress::new(0x3000),
            ..Default::default()
        }
    }

    fn rule_of(result: Result<()>) -> ValidationRule {
        match result {
            Err(Error::DescriptorInvalid(err)) => err.rule(),
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_complete_descriptor() {
        let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits())
            .with_args(DeviceAddress::new(0x4000), 72, 4)
            .with_mode(implicit());
        assert!(validate(&desc).is_ok());
    }

    #[test]
    fn first_violation_wins() {
        // Zero limits, zero arg count and a null args buffer: limits first.
        let desc = ClusterAccelBuildDesc::blas_from_clas(LimitsClusters::default());
        assert_eq!(rule_of(validate(&desc)), ValidationRule::Limits);

        let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits());
        assert_eq!(rule_of(validate(&desc)), ValidationRule::ArgCount);

        let desc = desc.with_args(DeviceAddress::NULL, 72, 1);
        assert_eq!(rule_of(validate(&desc)), ValidationRule::ArgsBuffer);

        let desc = desc.with_args(DeviceAddress::new(0x4000), 72, 1);
        assert_eq!(rule_of(validate(&desc)), ValidationRule::ModeParams);
    }

    #[test]
    fn reports_offending_field() {
        let desc = ClusterAccelBuildDesc::clas_from_triangles(LimitsTriangles {
            max_vertex_count_per_arg: 0,
            ..triangle_limits()
        });
        let Err(Error::DescriptorInvalid(err)) = validate(&desc) else {
            panic!("expected a validation error");
        };
        assert_eq!(err.field(), "max_vertex_count_per_arg");

        let desc = ClusterAccelBuildDesc::clas_from_templates(triangle_limits())
            .with_args(DeviceAddress::new(0x4000), 16, 1)
            .with_mode(implicit());
        let Err(Error::DescriptorInvalid(err)) = validate(&desc) else {
            panic!("expected a validation error");
        };
        assert_eq!(
            err,
            ValidationError::ArgsStrideTooSmall {
                op: ClusterAccelBuildOp::ClasFromTemplates,
                stride: 16,
                record_size: 32,
            }
        );
    }

    #[test]
    fn arg_count_is_bounded_by_limits() {
        let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits())
            .with_args(DeviceAddress::new(0x4000), 72, 5)
            .with_mode(implicit());
        let Err(Error::DescriptorInvalid(err)) = validate(&desc) else {
            panic!("expected a validation error");
        };
        assert_eq!(
            err,
            ValidationError::ArgCountExceedsLimit {
                arg_count: 5,
                max_arg_count: 4
            }
        );
    }

    #[test]
    fn get_sizes_requires_sizes_buffer() {
        let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits())
            .with_args(DeviceAddress::new(0x4000), 72, 1)
            .with_mode(GetSizesParams {
                temp_buffer: DeviceAddress::new(0x2000),
                ..Default::default()
            });
        let Err(Error::DescriptorInvalid(err)) = validate(&desc) else {
            panic!("expected a validation error");
        };
        assert_eq!(err.field(), "output_sizes_buffer");
    }

    #[test]
    fn sizing_scope_ignores_buffers() {
        let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits());
        assert!(validate_for_sizing(&desc).is_ok());
        assert!(validate(&desc).is_err());
    }
}
