//! Handle readback.
//!
//! Builds report per-argument failure only through zero handles, so every
//! build should be followed by a look at its handles once the device is
//! idle.
use crate::Handle;

/// Handles read back from a handle table, in argument order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandleReport {
    handles: Vec<Handle>,
}

impl HandleReport {
    pub fn new(handles: Vec<Handle>) -> Self {
        Self { handles }
    }

    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Handle> {
        self.handles.get(index).copied()
    }

    /// `true` if every argument produced a structure.
    pub fn all_built(&self) -> bool {
        self.handles.iter().all(|handle| handle.is_valid())
    }

    pub fn built_count(&self) -> usize {
        self.handles.iter().filter(|handle| handle.is_valid()).count()
    }

    /// Indices of the arguments that did not produce a structure.
    pub fn failed(&self) -> impl Iterator<Item = usize> + '_ {
        self.handles
            .iter()
            .enumerate()
            .filter(|(_, handle)| !handle.is_valid())
            .map(|(index, _)| index)
    }

    pub fn into_handles(self) -> Vec<Handle> {
        self.handles
    }
}

impl std::ops::Index<usize> for HandleReport {
    type Output = Handle;

    fn index(&self, index: usize) -> &Handle {
        &self.handles[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_failed_arguments() {
        let report = HandleReport::new(vec![
            Handle::from_raw(0x100),
            Handle::NULL,
            Handle::from_raw(0x200),
        ]);
        assert!(!report.all_built());
        assert_eq!(report.built_count(), 2);
        assert_eq!(report.failed().collect::<Vec<_>>(), vec![1]);
        assert_eq!(report[2].raw(), 0x200);
    }
}
