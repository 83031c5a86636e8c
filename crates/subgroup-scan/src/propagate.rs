//! The downward pass of a multi-level scan.
//!
//! After the local scans, element `i` of workgroup `k` only holds the combine
//! of its own workgroup up to `i`. The scanned totals one level up hold, at
//! `k - 1`, the combine of every workgroup before `k`; adding that carry makes
//! the prefix global. Levels are fixed from the top down, so every carry
//! read is already global itself.

use crate::device::{Device, DeviceBuffer, Dispatch};
use crate::element::Element;
use crate::error::Result;
use crate::kernel::{DispatchParams, KernelKind};
use crate::op::CombineOp;
use crate::plan::LevelPlan;

/// Adds `carries[k - 1]` to every valid element of workgroup `k > 0` of
/// `level`, then waits for the pass to complete.
///
/// Not idempotent: every call adds the carries again.
pub fn propagate_level<D: Device, T: Element, O: CombineOp<T>>(
    device: &D,
    workgroup_size: u32,
    level: LevelPlan,
    data: &DeviceBuffer<'_, D>,
    carries: &DeviceBuffer<'_, D>,
) -> Result<()> {
    tracing::debug!(
        len = level.len,
        workgroups = level.workgroups,
        "propagating carries"
    );
    device.dispatch::<T, O>(Dispatch {
        kernel: KernelKind::Propagate,
        workgroup_size,
        params: DispatchParams::new(level.len, level.workgroups),
        bindings: &[&**data, &**carries],
    })?;
    device.barrier()
}
