//! # Size Queries
//!
//! Before a build can be recorded the caller allocates its result and
//! scratch memory. How much is a function of the operation and its limits
//! alone, so sizes can be queried (and cached) before any argument record
//! exists.
//!
//! The reported `result_size` covers the *packed result layout* used by
//! [`CommandEncoder::build_cluster_acceleration_structure_into()`]:
//!
//! ```text
//! result ─┬─ handle table: max_arg_count × 8 bytes, padded to 128
//!         └─ structure storage, as reported by the backend
//! ```
//!
//! [`CommandEncoder::build_cluster_acceleration_structure_into()`]:
//! crate::CommandEncoder::build_cluster_acceleration_structure_into
use crate::backend::ClusterAccelBackend;
use crate::desc::{ClusterAccelBuildDesc, ClusterAccelBuildOp, Limits};
use crate::error::{Error, Result};
use crate::align_up;
use crate::validate::validate_for_sizing;
use cluster_accel_sys as sys;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Memory requirements of one build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ClusterAccelSizes {
    /// Bytes of result memory, handle table included.
    pub result_size: u64,
    /// Bytes of scratch memory the build may clobber.
    pub scratch_size: u64,
}

impl ClusterAccelSizes {
    /// Bytes of structure storage, i.e. what an implicit build with a
    /// separate handles buffer needs in `output_buffer`.
    pub fn storage_size(&self, limits: &Limits) -> u64 {
        handle_table_size(limits.max_arg_count())
            .map_or(self.result_size, |table| self.result_size.saturating_sub(table))
    }
}

/// Size of the handle table at the head of a packed result.
pub fn handle_table_size(max_arg_count: u32) -> Option<u64> {
    u64::from(max_arg_count)
        .checked_mul(sys::HANDLE_STRIDE_IN_BYTES.into())
        .and_then(|bytes| align_up(bytes, sys::CLAS_BYTE_ALIGNMENT))
}

/// Asks `backend` for the sizes of `desc`, without caching.
pub fn query_sizes(
    backend: &dyn ClusterAccelBackend,
    desc: &ClusterAccelBuildDesc,
) -> Result<ClusterAccelSizes> {
    validate_for_sizing(desc)?;

    let op = desc.op();
    let storage = backend.cluster_accel_sizes(op, desc.limits())?;
    if 0 == storage.result_size || 0 == storage.scratch_size {
        return Err(Error::SizingFailure {
            op,
            reason: format!("backend `{}` reported an empty size", backend.name()),
        });
    }

    let result_size = handle_table_size(desc.limits().max_arg_count())
        .and_then(|table| table.checked_add(storage.result_size))
        .ok_or_else(|| Error::SizingFailure {
            op,
            reason: "result size overflows u64".into(),
        })?;

    let sizes = ClusterAccelSizes {
        result_size,
        scratch_size: storage.scratch_size,
    };
    log::debug!(
        "{op} sizes on `{}`: result {} bytes, scratch {} bytes",
        backend.name(),
        sizes.result_size,
        sizes.scratch_size
    );
    Ok(sizes)
}

/// Memoises size queries by operation and limits.
///
/// Sizes do not depend on the argument buffer or the build mode, so every
/// descriptor with the same operation and limits shares an entry.
#[derive(Debug, Default)]
pub struct SizeCache {
    entries: Mutex<HashMap<(ClusterAccelBuildOp, Limits), ClusterAccelSizes>>,
}

impl SizeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached sizes for `desc` or queries and caches them.
    ///
    /// Failed queries are not cached.
    pub fn get_or_query(
        &self,
        backend: &dyn ClusterAccelBackend,
        desc: &ClusterAccelBuildDesc,
    ) -> Result<ClusterAccelSizes> {
        let key = (desc.op(), *desc.limits());
        if let Some(sizes) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            log::trace!("{} sizes served from cache", key.0);
            return Ok(*sizes);
        }

        let sizes = query_sizes(backend, desc)?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, sizes);
        Ok(sizes)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
