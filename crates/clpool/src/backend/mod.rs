//! Compute driver abstraction.
//!
//! A [`Driver`] is the black-box boundary to the compute backend: it
//! enumerates platforms and devices and creates contexts, queues, memory
//! objects, programs and kernels. The runtime never interprets the native
//! objects beyond calling back into the driver with them.

pub mod simulated;

#[cfg(feature = "opencl")]
pub mod opencl;

use crate::config::DeviceTypeFilter;
use crate::error::{BackendKind, ComputeResult};
use crate::memory::ImageFormat;

/// Execution ordering of a command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOrdering {
    /// Commands run in submission order.
    InOrder,
    /// Commands may run out of submission order.
    OutOfOrder,
}

/// Extents of a 2-D image transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageRegion {
    /// Row count (height).
    pub rows: usize,
    /// Column count (width).
    pub cols: usize,
}

/// Core driver trait for compute backends.
///
/// All transfers and kernel runs are blocking: the call returns once the
/// backend reports completion.
pub trait Driver: Send + Sync + 'static {
    /// Native platform object.
    type Platform: Send + Sync + 'static;
    /// Native device object.
    type Device: Clone + Send + Sync + 'static;
    /// Native context object.
    type Context: Send + Sync + 'static;
    /// Native command queue.
    type Queue: Send + Sync + 'static;
    /// Native buffer or image.
    type Memory: Send + Sync + 'static;
    /// Native program.
    type Program: Send + Sync + 'static;
    /// Native kernel.
    type Kernel: Send + Sync + 'static;

    /// Which backend this driver talks to.
    fn kind(&self) -> BackendKind;

    /// Enumerate up to `max` platforms.
    fn platforms(&self, max: usize) -> ComputeResult<Vec<Self::Platform>>;

    /// Query a platform's name.
    fn platform_name(&self, platform: &Self::Platform) -> ComputeResult<String>;

    /// Enumerate up to `max` devices of a platform.
    fn devices(
        &self,
        platform: &Self::Platform,
        filter: DeviceTypeFilter,
        max: usize,
    ) -> ComputeResult<Vec<Self::Device>>;

    /// Query a device's name.
    fn device_name(&self, device: &Self::Device) -> ComputeResult<String>;

    /// Create a context over devices that all belong to `platform`.
    fn create_context(
        &self,
        platform: &Self::Platform,
        devices: &[Self::Device],
    ) -> ComputeResult<Self::Context>;

    /// Create a command queue for one device of a context.
    fn create_queue(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        ordering: QueueOrdering,
    ) -> ComputeResult<Self::Queue>;

    /// Allocate a read-write linear buffer of `size` bytes.
    fn create_buffer(&self, context: &Self::Context, size: usize) -> ComputeResult<Self::Memory>;

    /// Allocate a read-write single-channel 2-D image.
    fn create_image(
        &self,
        context: &Self::Context,
        format: ImageFormat,
        region: ImageRegion,
    ) -> ComputeResult<Self::Memory>;

    /// Blocking write of `data` to the start of a buffer.
    fn write_buffer(
        &self,
        queue: &Self::Queue,
        memory: &mut Self::Memory,
        data: &[u8],
    ) -> ComputeResult<()>;

    /// Blocking read from the start of a buffer into `out`.
    fn read_buffer(
        &self,
        queue: &Self::Queue,
        memory: &Self::Memory,
        out: &mut [u8],
    ) -> ComputeResult<()>;

    /// Blocking write of a full image region from tightly packed rows.
    fn write_image(
        &self,
        queue: &Self::Queue,
        memory: &mut Self::Memory,
        region: ImageRegion,
        data: &[u8],
    ) -> ComputeResult<()>;

    /// Blocking read of a full image region into tightly packed rows.
    fn read_image(
        &self,
        queue: &Self::Queue,
        memory: &Self::Memory,
        region: ImageRegion,
        out: &mut [u8],
    ) -> ComputeResult<()>;

    /// Create a program from source and build it for `devices`.
    ///
    /// A failed build returns [`ComputeError::BuildFailed`](crate::ComputeError::BuildFailed)
    /// carrying the driver's build log.
    fn build_program(
        &self,
        context: &Self::Context,
        devices: &[Self::Device],
        source: &str,
        options: &str,
    ) -> ComputeResult<Self::Program>;

    /// Create a kernel for a function of a built program.
    fn create_kernel(&self, program: &Self::Program, name: &str) -> ComputeResult<Self::Kernel>;

    /// Bind a memory object to a kernel argument slot.
    fn set_memory_arg(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        memory: &Self::Memory,
    ) -> ComputeResult<()>;

    /// Bind a `size_t` scalar to a kernel argument slot.
    fn set_size_arg(&self, kernel: &mut Self::Kernel, index: u32, value: usize) -> ComputeResult<()>;

    /// Enqueue an N-dimensional range and wait for it to finish.
    fn run_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global_work_size: &[usize],
    ) -> ComputeResult<()>;
}
