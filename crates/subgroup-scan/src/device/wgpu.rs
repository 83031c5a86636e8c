//! A [`Device`] on top of `wgpu`, running the generated WGSL kernels.

use super::{Device, Dispatch};
use crate::capability::{DeviceCapabilities, SubgroupOperations};
use crate::element::Element;
use crate::error::{Error, Result};
use crate::kernel::wgsl::{self, KernelSource};
use crate::kernel::{DispatchParams, KernelKind, dispatch_grid};
use crate::op::CombineOp;
use crate::plan::SharedLayout;
use futures::executor::block_on;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wgpu::util::DeviceExt as _;

/// Largest workgroup used to probe the subgroup layout.
const PROBE_WORKGROUP_SIZE: u32 = 128;

#[derive(Debug)]
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    len: u32,
}

/// Pipelines are specialized on everything baked into the WGSL source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    kernel: KernelKind,
    element: &'static str,
    op: &'static str,
    workgroup_size: u32,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: DeviceCapabilities,
    pipelines: Mutex<HashMap<PipelineKey, wgpu::ComputePipeline>>,
    lost: Arc<Mutex<Option<String>>>,
}

impl core::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// The subgroup width of an adapter that reports `min..=max`.
///
/// Only a single width is accepted.
fn fixed_subgroup_size(min: u32, max: u32) -> Result<u32> {
    if min != max {
        return Err(Error::InconsistentCapabilities(format!(
            "adapter may run subgroups of {min} to {max} invocations, kernels need one fixed size"
        )));
    }
    if !min.is_power_of_two() {
        return Err(Error::InconsistentCapabilities(format!(
            "adapter reports subgroup size {min}"
        )));
    }
    Ok(min)
}

impl WgpuDevice {
    /// Opens the default high-performance adapter.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..wgpu::InstanceDescriptor::default()
        });
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| Error::DeviceUnavailable(err.to_string()))?;
        Self::from_adapter(&adapter)
    }

    /// Opens a device on `adapter` and probes its subgroup layout, blocking
    /// until both are done.
    pub fn from_adapter(adapter: &wgpu::Adapter) -> Result<Self> {
        let info = adapter.get_info();
        if !adapter.features().contains(wgpu::Features::SUBGROUP) {
            return Err(Error::CapabilityUnsupported {
                required: SubgroupOperations::BASIC | SubgroupOperations::ARITHMETIC,
                supported: SubgroupOperations::empty(),
            });
        }

        let limits = adapter.limits();
        // Kernels bake `S` in; it must not vary between pipelines.
        let subgroup_size = fixed_subgroup_size(limits.min_subgroup_size, limits.max_subgroup_size)?;
        let (device, queue) = block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("subgroup-scan device"),
            required_features: wgpu::Features::SUBGROUP,
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|err| Error::DeviceUnavailable(err.to_string()))?;

        let lost = Arc::new(Mutex::new(None));
        device.set_device_lost_callback({
            let lost = lost.clone();
            move |reason, message| {
                tracing::error!(?reason, detail = %message, "device lost");
                if let Ok(mut lost) = lost.lock() {
                    *lost = Some(format!("device lost ({reason:?}): {message}"));
                }
            }
        });

        let max_workgroup_invocations = limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x);
        let this = Self {
            device,
            queue,
            capabilities: DeviceCapabilities {
                subgroup_size,
                max_workgroup_invocations,
                max_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
                // WGSL exposes every class but clustered operations.
                supported_operations: SubgroupOperations::all()
                    .difference(SubgroupOperations::CLUSTERED),
            },
            pipelines: Mutex::new(HashMap::new()),
            lost,
        };

        let probed = this.probe_subgroup_size(max_workgroup_invocations)?;
        if probed != subgroup_size {
            return Err(Error::InconsistentCapabilities(format!(
                "adapter reports subgroups of {subgroup_size}, the probe ran with {probed}"
            )));
        }
        tracing::info!(
            adapter = %info.name,
            backend = ?info.backend,
            capabilities = ?this.capabilities,
            "opened wgpu device"
        );
        Ok(this)
    }

    /// Runs the probe kernel and returns the subgroup size, after checking
    /// that subgroup `k` holds invocations `k * S .. (k + 1) * S` in lane order.
    /// Every kernel relies on that layout.
    fn probe_subgroup_size(&self, max_workgroup_invocations: u32) -> Result<u32> {
        let workgroup_size = PROBE_WORKGROUP_SIZE.min(max_workgroup_invocations);
        let buffer = self.allocate_buffer(2 * workgroup_size, "subgroup probe")?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(wgsl::PROBE_ENTRY_POINT),
                source: wgpu::ShaderSource::Wgsl(wgsl::probe_source(workgroup_size).into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(wgsl::PROBE_ENTRY_POINT),
                layout: None,
                module: &module,
                entry_point: Some(wgsl::PROBE_ENTRY_POINT),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(wgsl::PROBE_ENTRY_POINT),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.buffer.as_entire_binding(),
            }],
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            self.release_buffer(&buffer);
            return Err(Error::DeviceUnavailable(format!("subgroup probe failed: {err}")));
        }

        let probe = self.download(&buffer, 2 * workgroup_size);
        self.release_buffer(&buffer);
        let probe = probe?;

        let subgroup_size = probe[1];
        if subgroup_size == 0 || !subgroup_size.is_power_of_two() {
            return Err(Error::InconsistentCapabilities(format!(
                "probe reported subgroup size {subgroup_size}"
            )));
        }
        if workgroup_size % subgroup_size != 0 {
            return Err(Error::InconsistentCapabilities(format!(
                "subgroup size {subgroup_size} does not divide the probe workgroup of {workgroup_size}"
            )));
        }
        for (local, pair) in (0u32..).zip(probe.chunks_exact(2)) {
            let &[lane, size] = pair else { continue };
            if size != subgroup_size || lane != local % subgroup_size {
                return Err(Error::InconsistentCapabilities(format!(
                    "invocation {local} reported lane {lane} of a subgroup of {size}, \
                     expected lane {} of {subgroup_size}",
                    local % subgroup_size
                )));
            }
        }
        tracing::debug!(subgroup_size, "probed subgroup layout");
        Ok(subgroup_size)
    }

    fn check_lost(&self) -> Result<()> {
        match self.lost.lock().ok().and_then(|lost| lost.clone()) {
            Some(message) => Err(Error::DispatchFailure(message)),
            None => Ok(()),
        }
    }

    fn pipeline<T: Element, O: CombineOp<T>>(
        &self,
        kernel: KernelKind,
        workgroup_size: u32,
    ) -> Result<wgpu::ComputePipeline> {
        let key = PipelineKey {
            kernel,
            element: T::WGSL_TYPE,
            op: O::NAME,
            workgroup_size,
        };
        let mut pipelines = self
            .pipelines
            .lock()
            .map_err(|err| Error::DispatchFailure(format!("pipeline cache: {err}")))?;
        if let Some(pipeline) = pipelines.get(&key) {
            return Ok(pipeline.clone());
        }

        let layout = SharedLayout::new(workgroup_size, self.capabilities.subgroup_size, u32::BITS)?;
        let source = KernelSource::<T, O>::new(kernel, workgroup_size, &layout).to_string();
        let label = format!("{kernel}<{}, {}, {workgroup_size}>", T::WGSL_TYPE, O::NAME);
        tracing::debug!(%label, "compiling kernel");
        tracing::trace!(%source, "kernel source");

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: None,
                module: &module,
                entry_point: Some(kernel.entry_point()),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(Error::DispatchFailure(format!("{label}: {err}")));
        }

        pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }
}

impl Device for WgpuDevice {
    type Buffer = WgpuBuffer;

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        self.capabilities.validate()?;
        Ok(self.capabilities)
    }

    fn allocate_buffer(&self, len: u32, label: &str) -> Result<WgpuBuffer> {
        let bytes = u64::from(len.max(1)) * 4;
        let limits = self.device.limits();
        let max = limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size));
        if bytes > max {
            return Err(Error::AllocationFailure {
                bytes,
                reason: format!("{label}: storage buffers are limited to {max} bytes"),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            buffer.destroy();
            return Err(Error::AllocationFailure {
                bytes,
                reason: format!("{label}: {err}"),
            });
        }
        Ok(WgpuBuffer { buffer, len })
    }

    fn release_buffer(&self, buffer: &WgpuBuffer) {
        buffer.buffer.destroy();
    }

    fn upload(&self, buffer: &WgpuBuffer, words: &[u32]) -> Result<()> {
        if !words.is_empty() {
            self.queue
                .write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(words));
        }
        Ok(())
    }

    fn download(&self, buffer: &WgpuBuffer, len: u32) -> Result<Vec<u32>> {
        let len = len.min(buffer.len);
        if len == 0 {
            return Ok(Vec::new());
        }
        let bytes = u64::from(len) * 4;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| Error::DispatchFailure(err.to_string()))?;
        self.check_lost()?;
        block_on(receiver)
            .map_err(|canceled| Error::DispatchFailure(format!("readback mapping: {canceled}")))?
            .map_err(|err| Error::DispatchFailure(format!("readback mapping failed: {err}")))?;

        let words = bytemuck::cast_slice::<u8, u32>(&slice.get_mapped_range()).to_vec();
        staging.unmap();
        staging.destroy();
        Ok(words)
    }

    fn dispatch<T: Element, O: CombineOp<T>>(&self, dispatch: Dispatch<'_, WgpuBuffer>) -> Result<()> {
        self.check_lost()?;
        let Dispatch {
            kernel,
            workgroup_size,
            params,
            bindings,
        } = dispatch;
        if bindings.len() != kernel.bindings().len() {
            return Err(Error::DispatchFailure(format!(
                "{kernel} takes {} bindings, got {}",
                kernel.bindings().len(),
                bindings.len()
            )));
        }
        let max_per_dimension = self.capabilities.max_workgroups_per_dimension;
        let [x, y, z] = dispatch_grid(params.workgroup_count, max_per_dimension);
        if y > max_per_dimension {
            return Err(Error::DispatchFailure(format!(
                "{kernel}: {} workgroups exceed a {max_per_dimension}^2 grid",
                params.workgroup_count
            )));
        }
        let params = DispatchParams {
            grid_width: x,
            ..params
        };

        let pipeline = self.pipeline::<T, O>(kernel, workgroup_size)?;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let uniform = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("dispatch params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        }];
        entries.extend((1u32..).zip(bindings).map(|(binding, buffer)| wgpu::BindGroupEntry {
            binding,
            resource: buffer.buffer.as_entire_binding(),
        }));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.entry_point()),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.entry_point()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry_point()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(Error::DispatchFailure(format!("{kernel}: {err}")));
        }
        tracing::debug!(%kernel, len = params.len, workgroups = params.workgroup_count, grid = ?[x, y, z], "dispatched");
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| Error::DispatchFailure(err.to_string()))?;
        self.check_lost()?;
        tracing::trace!("device barrier");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_subgroup_width_is_rejected() {
        let err = fixed_subgroup_size(16, 32).unwrap_err();
        assert!(matches!(err, Error::InconsistentCapabilities(_)), "{err}");
    }

    #[test]
    fn fixed_subgroup_width_is_accepted() {
        assert_eq!(fixed_subgroup_size(32, 32).unwrap(), 32);
        assert_eq!(fixed_subgroup_size(64, 64).unwrap(), 64);
        assert!(fixed_subgroup_size(0, 0).is_err());
    }
}
