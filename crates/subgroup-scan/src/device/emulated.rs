//! A CPU device that behaves like a GPU, strictly.
//!
//! Subgroups run in lockstep and workgroups run in parallel on the rayon pool.
//! On top of executing the kernels it checks what a real device would leave
//! undefined:
//! - shared memory handed between subgroups without a barrier,
//! - a dispatch touching a buffer an earlier dispatch wrote, with no
//!   device barrier in between.
//!
//! Both are reported as [`Error::DispatchFailure`]. Every dispatch and barrier
//! is logged so callers can inspect the exact pass sequence afterwards.

use super::{Device, Dispatch};
use crate::capability::{DeviceCapabilities, SubgroupOperations};
use crate::element::Element;
use crate::error::{Error, Result};
use crate::kernel::emulated::{self as kernels, WorkgroupShape};
use crate::kernel::subgroup::Subgroup;
use crate::kernel::workgroup::Hazard;
use crate::kernel::{Access, KernelKind, dispatch_grid};
use crate::op::CombineOp;
use crate::plan::SharedLayout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Shape and behavior of an [`EmulatedDevice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorConfig {
    /// Lanes per subgroup. Must be a power of two.
    pub subgroup_size: u32,
    pub max_workgroup_invocations: u32,
    pub max_workgroups_per_dimension: u32,
    pub supported_operations: SubgroupOperations,
    /// Total bytes of live buffers before allocation fails.
    pub memory_limit_bytes: Option<u64>,
    /// Fails the dispatch issued after this many successful ones, once.
    pub fail_after_dispatches: Option<u32>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            subgroup_size: 32,
            max_workgroup_invocations: 256,
            max_workgroups_per_dimension: 65535,
            supported_operations: SubgroupOperations::all(),
            memory_limit_bytes: None,
            fail_after_dispatches: None,
        }
    }
}

impl EmulatorConfig {
    /// Reads a JSON config. Missing fields keep their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    #[must_use]
    pub fn subgroup_size(mut self, subgroup_size: u32) -> Self {
        self.subgroup_size = subgroup_size;
        self
    }

    #[must_use]
    pub fn max_workgroup_invocations(mut self, max_workgroup_invocations: u32) -> Self {
        self.max_workgroup_invocations = max_workgroup_invocations;
        self
    }

    #[must_use]
    pub fn max_workgroups_per_dimension(mut self, max_workgroups_per_dimension: u32) -> Self {
        self.max_workgroups_per_dimension = max_workgroups_per_dimension;
        self
    }

    #[must_use]
    pub fn supported_operations(mut self, supported_operations: SubgroupOperations) -> Self {
        self.supported_operations = supported_operations;
        self
    }

    #[must_use]
    pub fn memory_limit_bytes(mut self, memory_limit_bytes: u64) -> Self {
        self.memory_limit_bytes = Some(memory_limit_bytes);
        self
    }

    #[must_use]
    pub fn fail_after_dispatches(mut self, dispatches: u32) -> Self {
        self.fail_after_dispatches = Some(dispatches);
        self
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            subgroup_size: self.subgroup_size,
            max_workgroup_invocations: self.max_workgroup_invocations,
            max_workgroups_per_dimension: self.max_workgroups_per_dimension,
            supported_operations: self.supported_operations,
        }
    }
}

/// One dispatch as the device executed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kernel: KernelKind,
    /// Valid elements of the level the dispatch covered.
    pub len: u32,
    pub workgroups: u32,
    pub workgroup_size: u32,
    /// Physical grid the workgroups were laid out on.
    pub grid: [u32; 3],
    /// `workgroupBarrier`s each workgroup issued.
    pub barriers_per_workgroup: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Dispatch(DispatchRecord),
    Barrier,
}

/// Handle of an emulated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedBuffer {
    id: usize,
    len: u32,
}

#[derive(Debug)]
struct Allocation {
    label: String,
    words: Vec<u32>,
    /// Written by a dispatch not yet followed by a barrier.
    unordered_write: bool,
}

#[derive(Debug, Default)]
struct State {
    allocations: Vec<Option<Allocation>>,
    live_bytes: u64,
    dispatches_until_failure: Option<u32>,
    events: Vec<DeviceEvent>,
}

impl State {
    fn allocation(&mut self, buffer: &EmulatedBuffer) -> Result<&mut Allocation> {
        self.allocations
            .get_mut(buffer.id)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::DispatchFailure(format!("buffer {} was released", buffer.id)))
    }
}

#[derive(Debug)]
pub struct EmulatedDevice {
    config: EmulatorConfig,
    state: Mutex<State>,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl EmulatedDevice {
    pub fn new(config: EmulatorConfig) -> Self {
        let state = State {
            dispatches_until_failure: config.fail_after_dispatches,
            ..State::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|err| Error::DispatchFailure(format!("emulated device state: {err}")))
    }

    /// Every dispatch and barrier since creation or the last
    /// [`EmulatedDevice::clear_events`].
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DeviceEvent::Dispatch(record) => Some(record),
                DeviceEvent::Barrier => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.events.clear();
        }
    }

    /// Buffers allocated and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.allocations.iter().flatten().count())
            .unwrap_or_default()
    }

    /// Labels of the live buffers, in allocation order.
    pub fn live_labels(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| {
                state
                    .allocations
                    .iter()
                    .flatten()
                    .map(|allocation| allocation.label.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn shape(&self, workgroup_size: u32) -> Result<WorkgroupShape> {
        let caps = self.config.capabilities();
        caps.check_workgroup_size(workgroup_size)
            .map_err(|err| Error::DispatchFailure(err.to_string()))?;
        Ok(WorkgroupShape {
            workgroup_size,
            subgroup: Subgroup::new(caps.subgroup_size),
            layout: SharedLayout::new(workgroup_size, caps.subgroup_size, u32::BITS)?,
        })
    }
}

/// Checks that `buffer` holds at least `needed` words.
fn check_len(kernel: KernelKind, binding: usize, buffer: &EmulatedBuffer, needed: u32) -> Result<()> {
    if buffer.len < needed {
        return Err(Error::DispatchFailure(format!(
            "{kernel}: binding {binding} holds {} words, the dispatch needs {needed}",
            buffer.len
        )));
    }
    Ok(())
}

impl Device for EmulatedDevice {
    type Buffer = EmulatedBuffer;

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        let caps = self.config.capabilities();
        caps.validate()?;
        if !caps.subgroup_size.is_power_of_two() {
            return Err(Error::InconsistentCapabilities(format!(
                "subgroup size {} is not a power of two",
                caps.subgroup_size
            )));
        }
        Ok(caps)
    }

    fn allocate_buffer(&self, len: u32, label: &str) -> Result<EmulatedBuffer> {
        let bytes = u64::from(len) * 4;
        let mut state = self.state()?;
        if let Some(limit) = self.config.memory_limit_bytes {
            if state.live_bytes + bytes > limit {
                return Err(Error::AllocationFailure {
                    bytes,
                    reason: format!(
                        "{label}: {} of {limit} bytes already in use",
                        state.live_bytes
                    ),
                });
            }
        }
        state.live_bytes += bytes;
        let id = state.allocations.len();
        state.allocations.push(Some(Allocation {
            label: label.to_owned(),
            words: vec![0; len as usize],
            unordered_write: false,
        }));
        tracing::trace!(label, len, id, "allocated emulated buffer");
        Ok(EmulatedBuffer { id, len })
    }

    fn release_buffer(&self, buffer: &EmulatedBuffer) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(allocation) = state.allocations.get_mut(buffer.id).and_then(Option::take) {
            state.live_bytes -= allocation.words.len() as u64 * 4;
            tracing::trace!(label = %allocation.label, id = buffer.id, "released emulated buffer");
        }
    }

    fn upload(&self, buffer: &EmulatedBuffer, words: &[u32]) -> Result<()> {
        let mut state = self.state()?;
        let allocation = state.allocation(buffer)?;
        if words.len() > allocation.words.len() {
            return Err(Error::DispatchFailure(format!(
                "{}: cannot upload {} words into {}",
                allocation.label,
                words.len(),
                allocation.words.len()
            )));
        }
        allocation.words[..words.len()].copy_from_slice(words);
        Ok(())
    }

    fn download(&self, buffer: &EmulatedBuffer, len: u32) -> Result<Vec<u32>> {
        let mut state = self.state()?;
        let allocation = state.allocation(buffer)?;
        if allocation.unordered_write {
            return Err(Error::DispatchFailure(format!(
                "{} read back before a barrier ordered the dispatch writing it",
                allocation.label
            )));
        }
        allocation
            .words
            .get(..len as usize)
            .map(<[u32]>::to_vec)
            .ok_or_else(|| {
                Error::DispatchFailure(format!(
                    "{}: cannot read back {len} words of {}",
                    allocation.label,
                    allocation.words.len()
                ))
            })
    }

    fn dispatch<T: Element, O: CombineOp<T>>(
        &self,
        dispatch: Dispatch<'_, EmulatedBuffer>,
    ) -> Result<()> {
        let Dispatch {
            kernel,
            workgroup_size,
            params,
            bindings,
        } = dispatch;
        let access = kernel.bindings();
        if bindings.len() != access.len() {
            return Err(Error::DispatchFailure(format!(
                "{kernel} takes {} bindings, got {}",
                access.len(),
                bindings.len()
            )));
        }
        let shape = self.shape(workgroup_size)?;
        if params.workgroup_count != params.len.div_ceil(workgroup_size) {
            return Err(Error::DispatchFailure(format!(
                "{kernel}: {} workgroups cannot cover {} elements in groups of {workgroup_size}",
                params.workgroup_count, params.len
            )));
        }
        let max_per_dimension = self.config.max_workgroups_per_dimension;
        let grid = dispatch_grid(params.workgroup_count, max_per_dimension);
        if grid[1] > max_per_dimension {
            return Err(Error::DispatchFailure(format!(
                "{kernel}: {} workgroups exceed a {max_per_dimension}^2 grid",
                params.workgroup_count
            )));
        }
        match kernel {
            KernelKind::Reduce => {
                check_len(kernel, 0, bindings[0], params.len)?;
                check_len(kernel, 1, bindings[1], params.workgroup_count)?;
            }
            KernelKind::ScanLocal => {
                check_len(kernel, 0, bindings[0], params.len)?;
                check_len(kernel, 1, bindings[1], params.len)?;
                check_len(kernel, 2, bindings[2], params.workgroup_count)?;
            }
            KernelKind::Propagate => {
                check_len(kernel, 0, bindings[0], params.len)?;
                // Workgroup 0 reads no carry.
                check_len(kernel, 1, bindings[1], params.workgroup_count.saturating_sub(1))?;
            }
        }

        let mut state = self.state()?;
        if let Some(remaining) = state.dispatches_until_failure {
            if remaining == 0 {
                state.dispatches_until_failure = None;
                return Err(Error::DispatchFailure(format!(
                    "{kernel}: injected device failure"
                )));
            }
            state.dispatches_until_failure = Some(remaining - 1);
        }

        // Take every bound buffer out of the device for the duration of the
        // dispatch, checking pass ordering on the way.
        let mut words = Vec::with_capacity(bindings.len());
        let mut taken: Vec<usize> = Vec::with_capacity(bindings.len());
        let mut ordering = Ok(());
        for (binding, buffer) in bindings.iter().enumerate() {
            if taken.contains(&buffer.id) {
                ordering = Err(Error::DispatchFailure(format!(
                    "{kernel}: buffer {} is bound twice",
                    buffer.id
                )));
                break;
            }
            let allocation = match state.allocation(buffer) {
                Ok(allocation) => allocation,
                Err(err) => {
                    ordering = Err(err);
                    break;
                }
            };
            if allocation.unordered_write {
                ordering = Err(Error::DispatchFailure(format!(
                    "{kernel}: binding {binding} ({}) was written by a dispatch with no barrier since",
                    allocation.label
                )));
                break;
            }
            words.push(std::mem::take(&mut allocation.words));
            taken.push(buffer.id);
        }

        let result = ordering.and_then(|()| {
            let hazard = |hazard: Hazard| Error::DispatchFailure(format!("{kernel}: {hazard}"));
            match (kernel, words.as_mut_slice()) {
                (KernelKind::Reduce, [input, partials]) => {
                    kernels::reduce::<T, O>(&shape, params, input, partials).map_err(hazard)
                }
                (KernelKind::ScanLocal, [input, output, partials]) => {
                    kernels::scan_local::<T, O>(&shape, params, input, output, partials)
                        .map_err(hazard)
                }
                (KernelKind::Propagate, [data, carries]) => {
                    kernels::propagate::<T, O>(&shape, params, data, carries);
                    Ok(0)
                }
                _ => Err(Error::DispatchFailure(format!(
                    "{kernel}: bindings do not match the kernel"
                ))),
            }
        });

        // Return the storage whatever happened.
        for ((id, words), access) in taken.into_iter().zip(words).zip(access) {
            if let Some(allocation) = state.allocations[id].as_mut() {
                allocation.words = words;
                if result.is_ok() && *access == Access::ReadWrite {
                    allocation.unordered_write = true;
                }
            }
        }

        let barriers_per_workgroup = result?;
        let record = DispatchRecord {
            kernel,
            len: params.len,
            workgroups: params.workgroup_count,
            workgroup_size,
            grid,
            barriers_per_workgroup,
        };
        tracing::debug!(?record, "emulated dispatch");
        state.events.push(DeviceEvent::Dispatch(record));
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self.state()?;
        for allocation in state.allocations.iter_mut().flatten() {
            allocation.unordered_write = false;
        }
        state.events.push(DeviceEvent::Barrier);
        tracing::trace!("device barrier");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::DispatchParams;
    use crate::op::Sum;

    fn device() -> EmulatedDevice {
        EmulatedDevice::new(
            EmulatorConfig::default()
                .subgroup_size(4)
                .max_workgroup_invocations(8),
        )
    }

    #[test]
    fn second_pass_without_barrier_is_rejected() {
        let device = device();
        let input = device.allocate_buffer(16, "input").unwrap();
        let partials = device.allocate_buffer(2, "partials").unwrap();
        let total = device.allocate_buffer(1, "total").unwrap();
        device.upload(&input, &[1; 16]).unwrap();

        device
            .dispatch::<u32, Sum>(Dispatch {
                kernel: KernelKind::Reduce,
                workgroup_size: 8,
                params: DispatchParams::new(16, 2),
                bindings: &[&input, &partials],
            })
            .unwrap();
        let err = device
            .dispatch::<u32, Sum>(Dispatch {
                kernel: KernelKind::Reduce,
                workgroup_size: 8,
                params: DispatchParams::new(2, 1),
                bindings: &[&partials, &total],
            })
            .unwrap_err();
        assert!(matches!(err, Error::DispatchFailure(_)), "{err}");

        device.barrier().unwrap();
        device
            .dispatch::<u32, Sum>(Dispatch {
                kernel: KernelKind::Reduce,
                workgroup_size: 8,
                params: DispatchParams::new(2, 1),
                bindings: &[&partials, &total],
            })
            .unwrap();
        device.barrier().unwrap();
        assert_eq!(device.download(&total, 1).unwrap(), [16]);
    }

    #[test]
    fn transfers_past_the_end_are_errors() {
        let device = device();
        let buffer = device.allocate_buffer(4, "small").unwrap();
        let err = device.upload(&buffer, &[7; 5]).unwrap_err();
        assert!(matches!(err, Error::DispatchFailure(_)), "{err}");
        let err = device.download(&buffer, 5).unwrap_err();
        assert!(matches!(err, Error::DispatchFailure(_)), "{err}");

        device.upload(&buffer, &[7; 4]).unwrap();
        assert_eq!(device.download(&buffer, 4).unwrap(), [7; 4]);
    }

    #[test]
    fn memory_limit_fails_allocation() {
        let device = EmulatedDevice::new(EmulatorConfig::default().memory_limit_bytes(64));
        let first = device.allocate_buffer(12, "a").unwrap();
        let err = device.allocate_buffer(8, "b").unwrap_err();
        assert!(matches!(err, Error::AllocationFailure { bytes: 32, .. }));
        device.release_buffer(&first);
        device.allocate_buffer(16, "c").unwrap();
    }

    #[test]
    fn injected_failure_fires_once() {
        let device = EmulatedDevice::new(
            EmulatorConfig::default()
                .subgroup_size(4)
                .max_workgroup_invocations(8)
                .fail_after_dispatches(0),
        );
        let input = device.allocate_buffer(8, "input").unwrap();
        let total = device.allocate_buffer(1, "total").unwrap();
        let reduce = || {
            device.dispatch::<u32, Sum>(Dispatch {
                kernel: KernelKind::Reduce,
                workgroup_size: 8,
                params: DispatchParams::new(8, 1),
                bindings: &[&input, &total],
            })
        };
        assert!(reduce().unwrap_err().is_retryable());
        reduce().unwrap();
    }

    #[test]
    fn non_power_of_two_subgroups_are_inconsistent() {
        let device = EmulatedDevice::new(EmulatorConfig::default().subgroup_size(24));
        assert!(matches!(
            device.query_capabilities(),
            Err(Error::InconsistentCapabilities(_))
        ));
    }

    #[test]
    fn oversized_dispatch_folds_into_a_grid() {
        let device = EmulatedDevice::new(
            EmulatorConfig::default()
                .subgroup_size(4)
                .max_workgroup_invocations(4)
                .max_workgroups_per_dimension(3),
        );
        let input = device.allocate_buffer(20, "input").unwrap();
        let partials = device.allocate_buffer(5, "partials").unwrap();
        device.upload(&input, &[2; 20]).unwrap();
        device
            .dispatch::<u32, Sum>(Dispatch {
                kernel: KernelKind::Reduce,
                workgroup_size: 4,
                params: DispatchParams::new(20, 5),
                bindings: &[&input, &partials],
            })
            .unwrap();
        device.barrier().unwrap();
        assert_eq!(device.download(&partials, 5).unwrap(), [8; 5]);
        assert_eq!(device.dispatches()[0].grid, [3, 2, 1]);
    }
}
