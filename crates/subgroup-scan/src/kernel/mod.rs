//! The three kernels of the hierarchy and their CPU emulation.
//!
//! Each kernel exists twice: as generated WGSL (see [`wgsl`]) for real
//! devices, and as an emulation over lockstep [`subgroup::Subgroup`]s and
//! barrier-checked [`workgroup::SharedMemory`] (see [`emulated`]). Both follow
//! the same [`crate::plan::SharedLayout`] and issue the same barriers.

use bytemuck::{Pod, Zeroable};
use core::fmt;

pub mod emulated;
pub mod subgroup;
pub mod workgroup;
#[cfg(feature = "wgpu")]
pub mod wgsl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    /// One combined value per workgroup.
    ///
    /// Bindings: `[input (read), partials (read_write)]`.
    Reduce,
    /// Inclusive scan of each workgroup, plus each workgroup's total.
    ///
    /// Bindings: `[input (read), output (read_write), partials (read_write)]`.
    ScanLocal,
    /// Adds the carry of all preceding workgroups to every element in place.
    ///
    /// Bindings: `[data (read_write), carries (read)]`.
    Propagate,
}

impl KernelKind {
    pub fn bindings(self) -> &'static [Access] {
        match self {
            Self::Reduce => &[Access::Read, Access::ReadWrite],
            Self::ScanLocal => &[Access::Read, Access::ReadWrite, Access::ReadWrite],
            Self::Propagate => &[Access::ReadWrite, Access::Read],
        }
    }

    pub fn entry_point(self) -> &'static str {
        match self {
            Self::Reduce => "reduce_cs",
            Self::ScanLocal => "scan_local_cs",
            Self::Propagate => "propagate_cs",
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// Per-dispatch parameters, laid out as a WGSL uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchParams {
    /// Valid elements at this level; lanes at or beyond it are padding.
    pub len: u32,
    /// Logical workgroups. The physical grid may be larger when it has to be
    /// folded into two dimensions; the excess exits uniformly.
    pub workgroup_count: u32,
    /// Physical grid width, used to linearize 2D workgroup ids.
    pub grid_width: u32,
    pub _pad: u32,
}

impl DispatchParams {
    pub fn new(len: u32, workgroup_count: u32) -> Self {
        Self {
            len,
            workgroup_count,
            grid_width: workgroup_count,
            _pad: 0,
        }
    }
}

/// Folds `workgroups` into an `x * y` grid with `x <= max_per_dimension`.
pub fn dispatch_grid(workgroups: u32, max_per_dimension: u32) -> [u32; 3] {
    if workgroups <= max_per_dimension {
        [workgroups, 1, 1]
    } else {
        [max_per_dimension, workgroups.div_ceil(max_per_dimension), 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_dispatches_stay_one_dimensional() {
        assert_eq!(dispatch_grid(1000, 65535), [1000, 1, 1]);
    }

    #[test]
    fn large_dispatches_fold_into_two_dimensions() {
        let [x, y, z] = dispatch_grid(65536, 65535);
        assert_eq!((x, y, z), (65535, 2, 1));
        assert!(x * y >= 65536);
    }

    #[test]
    fn params_match_uniform_layout() {
        assert_eq!(size_of::<DispatchParams>(), 16);
    }
}
