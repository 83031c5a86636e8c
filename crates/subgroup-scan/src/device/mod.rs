//! The runtime boundary: buffers, dispatches and barriers.
//!
//! The engine only ever talks to a [`Device`]. Buffers are arrays of 32-bit
//! words; elements are reinterpreted on the way in and out.

use crate::capability::DeviceCapabilities;
use crate::element::Element;
use crate::error::{Error, Result};
use crate::kernel::{DispatchParams, KernelKind};
use crate::op::CombineOp;
use core::fmt;
use core::ops::Deref;

pub mod emulated;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use emulated::{DeviceEvent, DispatchRecord, EmulatedDevice, EmulatorConfig};
#[cfg(feature = "wgpu")]
pub use self::wgpu::WgpuDevice;

/// One kernel launch.
#[derive(Debug)]
pub struct Dispatch<'a, B> {
    pub kernel: KernelKind,
    pub workgroup_size: u32,
    pub params: DispatchParams,
    /// Storage buffers in the order of [`KernelKind::bindings`].
    pub bindings: &'a [&'a B],
}

pub trait Device: Send + Sync {
    type Buffer: fmt::Debug + Send + Sync;

    /// Static limits of the device. Called once per engine.
    fn query_capabilities(&self) -> Result<DeviceCapabilities>;

    /// Allocates `len` words of device storage.
    fn allocate_buffer(&self, len: u32, label: &str) -> Result<Self::Buffer>;

    /// Frees the storage behind `buffer`. The handle is not used afterwards.
    fn release_buffer(&self, buffer: &Self::Buffer);

    fn upload(&self, buffer: &Self::Buffer, words: &[u32]) -> Result<()>;

    /// Reads back the first `len` words, waiting for pending work.
    fn download(&self, buffer: &Self::Buffer, len: u32) -> Result<Vec<u32>>;

    /// Records one dispatch. Nothing orders it against earlier dispatches
    /// until [`Device::barrier`] is called.
    fn dispatch<T: Element, O: CombineOp<T>>(&self, dispatch: Dispatch<'_, Self::Buffer>)
    -> Result<()>;

    /// Device-wide barrier: every earlier dispatch completes and its writes
    /// become visible before any later one starts.
    fn barrier(&self) -> Result<()>;
}

/// A buffer released back to its device when dropped.
pub struct DeviceBuffer<'d, D: Device> {
    device: &'d D,
    buffer: D::Buffer,
    len: u32,
}

impl<'d, D: Device> DeviceBuffer<'d, D> {
    pub fn new(device: &'d D, len: u32, label: &str) -> Result<Self> {
        let buffer = device.allocate_buffer(len, label)?;
        Ok(Self {
            device,
            buffer,
            len,
        })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn upload<T: Element>(&self, values: &[T]) -> Result<()> {
        if values.len() > self.len as usize {
            return Err(Error::InvalidConfig(format!(
                "cannot upload {} elements into a buffer of {}",
                values.len(),
                self.len
            )));
        }
        self.device
            .upload(&self.buffer, crate::element::to_words(values))
    }

    pub fn download<T: Element>(&self, len: u32) -> Result<Vec<T>> {
        let words = self.device.download(&self.buffer, len.min(self.len))?;
        Ok(crate::element::from_words(words))
    }
}

impl<D: Device> Deref for DeviceBuffer<'_, D> {
    type Target = D::Buffer;

    fn deref(&self) -> &D::Buffer {
        &self.buffer
    }
}

impl<D: Device> fmt::Debug for DeviceBuffer<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("buffer", &self.buffer)
            .field("len", &self.len)
            .finish()
    }
}

impl<D: Device> Drop for DeviceBuffer<'_, D> {
    fn drop(&mut self) {
        self.device.release_buffer(&self.buffer);
    }
}
