//! Multi-pass orchestration of reductions and scans over a [`Device`].
//!
//! A call plans the level hierarchy from `N`, allocates every buffer it will
//! need up front, and then issues one dispatch per level with a device
//! barrier after each. Buffers are released when the call returns, whether it
//! succeeded or not.
//!
//! Buffers of a hierarchy of `L` levels:
//!
//! | buffer | length | written by |
//! |---|---|---|
//! | input | `N` | upload |
//! | `partials[l]` | workgroups of level `l` | level `l` (reduce or local scan) |
//! | `outputs[l]` (scan only) | length of level `l` | level `l` local scan, then propagation |
//!
//! Level `l > 0` reads `partials[l - 1]`. The last `partials` buffer has a
//! single element: the total.

use crate::capability::DeviceCapabilities;
use crate::config::{DEFAULT_WORKGROUP_SIZE, EngineConfig};
use crate::device::{Device, DeviceBuffer, Dispatch};
use crate::element::Element;
use crate::error::{Error, Result};
use crate::kernel::{DispatchParams, KernelKind};
use crate::op::{CombineOp, GroupOperation, Sum};
use crate::plan::{HierarchyPlan, LevelPlan, SharedLayout};
use crate::propagate::propagate_level;

/// Reduces and scans arrays on one device.
#[derive(Debug)]
pub struct Engine<D> {
    device: D,
    capabilities: DeviceCapabilities,
    workgroup_size: u32,
    config: EngineConfig,
}

impl<D: Device> Engine<D> {
    /// Queries `device` once and fixes the workgroup size for every call.
    pub fn new(device: D, config: EngineConfig) -> Result<Self> {
        let capabilities = device.query_capabilities()?;
        capabilities.validate()?;
        let workgroup_size = match config.workgroup_size {
            Some(workgroup_size) => {
                capabilities.check_workgroup_size(workgroup_size)?;
                workgroup_size
            }
            None => capabilities.default_workgroup_size(DEFAULT_WORKGROUP_SIZE),
        };
        // Reject a workgroup whose shared partials cannot be laid out.
        SharedLayout::new(
            workgroup_size,
            capabilities.subgroup_size,
            config.max_hierarchy_depth,
        )?;

        tracing::info!(
            subgroup_size = capabilities.subgroup_size,
            workgroup_size,
            operations = ?capabilities.supported_operations,
            "engine ready"
        );
        Ok(Self {
            device,
            capabilities,
            workgroup_size,
            config,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Plans `len` elements, after checking the device can run `operation`.
    fn plan<T: Element, O: CombineOp<T>>(
        &self,
        operation: GroupOperation,
        len: usize,
    ) -> Result<HierarchyPlan> {
        self.capabilities
            .require(O::required_operations(operation))?;
        HierarchyPlan::new(len, self.workgroup_size, self.config.max_hierarchy_depth)
    }

    /// Allocates `partials[l]` for every level.
    fn allocate_partials(&self, plan: &HierarchyPlan) -> Result<Vec<DeviceBuffer<'_, D>>> {
        plan.levels
            .iter()
            .enumerate()
            .map(|(depth, level)| {
                DeviceBuffer::new(
                    &self.device,
                    level.workgroups,
                    &format!("partials level {depth}"),
                )
            })
            .collect()
    }

    /// One dispatch of `kernel` over `level`, followed by a device barrier.
    fn pass<T: Element, O: CombineOp<T>>(
        &self,
        kernel: KernelKind,
        level: LevelPlan,
        bindings: &[&D::Buffer],
    ) -> Result<()> {
        tracing::debug!(%kernel, len = level.len, workgroups = level.workgroups, "pass");
        self.device.dispatch::<T, O>(Dispatch {
            kernel,
            workgroup_size: self.workgroup_size,
            params: DispatchParams::new(level.len, level.workgroups),
            bindings,
        })?;
        self.device.barrier()
    }

    /// Combines all of `input` with `O`. An empty input gives the identity.
    #[tracing::instrument(level = "debug", skip_all, fields(len = input.len(), ty = T::WGSL_TYPE, op = O::NAME))]
    pub fn reduce<T: Element, O: CombineOp<T>>(&self, input: &[T]) -> Result<T> {
        if input.is_empty() {
            self.capabilities
                .require(O::required_operations(GroupOperation::Reduce))?;
            return Ok(O::identity());
        }
        let plan = self.plan::<T, O>(GroupOperation::Reduce, input.len())?;

        let source = DeviceBuffer::new(&self.device, plan.levels[0].len, "input")?;
        let partials = self.allocate_partials(&plan)?;
        source.upload(input)?;

        for (depth, level) in plan.levels.iter().enumerate() {
            let src = match depth {
                0 => &source,
                _ => &partials[depth - 1],
            };
            self.pass::<T, O>(KernelKind::Reduce, *level, &[&**src, &*partials[depth]])?;
        }

        let total = partials[plan.depth() - 1].download::<T>(1)?;
        total
            .first()
            .copied()
            .ok_or_else(|| Error::DispatchFailure("empty readback of the reduced total".into()))
    }

    /// Inclusive scan: element `i` of the result combines `input[..=i]`.
    #[tracing::instrument(level = "debug", skip_all, fields(len = input.len(), ty = T::WGSL_TYPE, op = O::NAME))]
    pub fn scan<T: Element, O: CombineOp<T>>(&self, input: &[T]) -> Result<Vec<T>> {
        self.scan_as::<T, O>(GroupOperation::InclusiveScan, input)
    }

    /// Exclusive scan: element `i` of the result combines `input[..i]`, so
    /// the first element is the identity.
    #[tracing::instrument(level = "debug", skip_all, fields(len = input.len(), ty = T::WGSL_TYPE, op = O::NAME))]
    pub fn scan_exclusive<T: Element, O: CombineOp<T>>(&self, input: &[T]) -> Result<Vec<T>> {
        let mut scanned = self.scan_as::<T, O>(GroupOperation::ExclusiveScan, input)?;
        if !scanned.is_empty() {
            scanned.rotate_right(1);
            scanned[0] = O::identity();
        }
        Ok(scanned)
    }

    pub fn sum<T: Element>(&self, input: &[T]) -> Result<T> {
        self.reduce::<T, Sum>(input)
    }

    pub fn prefix_sum<T: Element>(&self, input: &[T]) -> Result<Vec<T>> {
        self.scan::<T, Sum>(input)
    }

    fn scan_as<T: Element, O: CombineOp<T>>(
        &self,
        operation: GroupOperation,
        input: &[T],
    ) -> Result<Vec<T>> {
        if input.is_empty() {
            self.capabilities
                .require(O::required_operations(operation))?;
            return Ok(Vec::new());
        }
        let plan = self.plan::<T, O>(operation, input.len())?;

        let source = DeviceBuffer::new(&self.device, plan.levels[0].len, "input")?;
        let outputs = plan
            .levels
            .iter()
            .enumerate()
            .map(|(depth, level)| {
                DeviceBuffer::new(&self.device, level.len, &format!("scan level {depth}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let partials = self.allocate_partials(&plan)?;
        source.upload(input)?;

        // Upward: scan every level locally, collecting workgroup totals into
        // the level above.
        for (depth, level) in plan.levels.iter().enumerate() {
            let src = match depth {
                0 => &source,
                _ => &partials[depth - 1],
            };
            self.pass::<T, O>(
                KernelKind::ScanLocal,
                *level,
                &[&**src, &*outputs[depth], &*partials[depth]],
            )?;
        }

        // Downward: once per level below the top, which is complete as is.
        for depth in (0..plan.depth() - 1).rev() {
            propagate_level::<D, T, O>(
                &self.device,
                self.workgroup_size,
                plan.levels[depth],
                &outputs[depth],
                &outputs[depth + 1],
            )?;
        }

        outputs[0].download(plan.levels[0].len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SubgroupOperations;
    use crate::device::{DeviceEvent, EmulatedDevice, EmulatorConfig};
    use crate::error::Error;
    use crate::op::Max;

    fn engine(subgroup_size: u32, workgroup_size: u32) -> Engine<EmulatedDevice> {
        let device = EmulatedDevice::new(
            EmulatorConfig::default()
                .subgroup_size(subgroup_size)
                .max_workgroup_invocations(workgroup_size),
        );
        Engine::new(device, EngineConfig::default().workgroup_size(workgroup_size)).unwrap()
    }

    #[test]
    fn default_workgroup_size_is_clamped_to_the_device() {
        let device = EmulatedDevice::new(EmulatorConfig::default().max_workgroup_invocations(128));
        let engine = Engine::new(device, EngineConfig::default()).unwrap();
        assert_eq!(engine.workgroup_size(), 128);
    }

    #[test]
    fn ragged_workgroup_size_is_rejected() {
        let device = EmulatedDevice::new(EmulatorConfig::default().subgroup_size(4));
        let err = Engine::new(device, EngineConfig::default().workgroup_size(10)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn single_level_scan_has_no_propagation() {
        let engine = engine(4, 8);
        assert_eq!(engine.prefix_sum(&[1u32; 8]).unwrap(), [1, 2, 3, 4, 5, 6, 7, 8]);
        let kernels: Vec<_> = engine.device().dispatches().iter().map(|r| r.kernel).collect();
        assert_eq!(kernels, [KernelKind::ScanLocal]);
    }

    #[test]
    fn every_pass_is_followed_by_a_barrier() {
        let engine = engine(4, 8);
        engine.sum(&[1u32; 100]).unwrap();
        let events = engine.device().events();
        assert_eq!(events.len(), 6);
        for pair in events.chunks(2) {
            assert!(matches!(pair, [DeviceEvent::Dispatch(_), DeviceEvent::Barrier]));
        }
    }

    #[test]
    fn exclusive_scan_starts_at_identity() {
        let engine = engine(4, 8);
        let values: Vec<i32> = (0..20).map(|i| (i * 7) % 11 - 5).collect();
        assert_eq!(
            engine.scan_exclusive::<i32, Max>(&values).unwrap(),
            crate::sequential::scan_exclusive::<i32, Max>(&values)
        );
    }

    #[test]
    fn capability_is_checked_before_allocating() {
        let device = EmulatedDevice::new(
            EmulatorConfig::default()
                .subgroup_size(4)
                .max_workgroup_invocations(8)
                .supported_operations(SubgroupOperations::BASIC | SubgroupOperations::ARITHMETIC),
        );
        let engine = Engine::new(device, EngineConfig::default()).unwrap();
        let err = engine.scan::<f32, Max>(&[1.0; 4]).unwrap_err();
        assert!(matches!(err, Error::CapabilityUnsupported { .. }), "{err}");
        assert!(engine.device().events().is_empty());
        assert_eq!(engine.device().live_buffers(), 0);

        // A reduction needs no relative shuffles.
        assert_eq!(engine.reduce::<f32, Max>(&[1.0, 3.0, 2.0]).unwrap(), 3.0);
    }
}
