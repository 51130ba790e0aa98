//! OpenCL driver.
//!
//! Talks to the installed OpenCL ICD loader through the `opencl3` crate.
//!
//! ## Feature Flag
//!
//! Enable the `opencl` feature to use this backend:
//! ```toml
//! [dependencies]
//! clpool = { version = "0.1", features = ["opencl"] }
//! ```

use std::ffi::c_void;
use std::ptr;

use opencl3::command_queue::{CommandQueue, CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE};
use opencl3::context::Context;
use opencl3::device::{
    Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
use opencl3::kernel::Kernel;
use opencl3::memory::{
    Buffer, ClMem, Image, CL_FLOAT, CL_MEM_OBJECT_IMAGE2D, CL_MEM_READ_WRITE, CL_R,
    CL_UNSIGNED_INT32,
};
use opencl3::platform::{get_platforms, Platform};
use opencl3::program::Program;
use opencl3::types::{
    cl_command_queue_properties, cl_context_properties, cl_device_id, cl_device_type,
    cl_image_desc, cl_image_format, CL_BLOCKING,
};

use super::{Driver, ImageRegion, QueueOrdering};
use crate::config::DeviceTypeFilter;
use crate::error::{BackendKind, ComputeError, ComputeResult};
use crate::memory::ImageFormat;

const CL_CONTEXT_PLATFORM: cl_context_properties = 0x1084;

/// OpenCL platform.
pub struct ClPlatform(Platform);

/// OpenCL device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClDevice(cl_device_id);

/// OpenCL context.
pub struct ClContext(Context);

/// OpenCL command queue.
pub struct ClQueue(CommandQueue);

/// OpenCL buffer or image.
pub enum ClMemory {
    /// Linear byte buffer.
    Buffer(Buffer<u8>),
    /// Single-channel 2-D image.
    Image(Image),
}

impl ClMemory {
    fn raw(&self) -> opencl3::types::cl_mem {
        match self {
            ClMemory::Buffer(buffer) => buffer.get(),
            ClMemory::Image(image) => image.get(),
        }
    }
}

/// OpenCL program.
pub struct ClProgram(Program);

/// OpenCL kernel.
pub struct ClKernel(Kernel);

// SAFETY: OpenCL 1.2+ guarantees thread safety for platform, device, context,
// command queue, program, kernel and memory objects, except for kernel
// argument setting, which the runtime serializes behind its state lock. The
// wrapped raw pointers are opaque handles owned by the OpenCL runtime.
unsafe impl Send for ClPlatform {}
unsafe impl Sync for ClPlatform {}
unsafe impl Send for ClDevice {}
unsafe impl Sync for ClDevice {}
unsafe impl Send for ClContext {}
unsafe impl Sync for ClContext {}
unsafe impl Send for ClQueue {}
unsafe impl Sync for ClQueue {}
unsafe impl Send for ClMemory {}
unsafe impl Sync for ClMemory {}
unsafe impl Send for ClProgram {}
unsafe impl Sync for ClProgram {}
unsafe impl Send for ClKernel {}
unsafe impl Sync for ClKernel {}

fn device_type(filter: DeviceTypeFilter) -> cl_device_type {
    match filter {
        DeviceTypeFilter::All => CL_DEVICE_TYPE_ALL,
        DeviceTypeFilter::Cpu => CL_DEVICE_TYPE_CPU,
        DeviceTypeFilter::Gpu => CL_DEVICE_TYPE_GPU,
        DeviceTypeFilter::Accelerator => CL_DEVICE_TYPE_ACCELERATOR,
    }
}

fn image_format(format: ImageFormat) -> cl_image_format {
    cl_image_format {
        image_channel_order: CL_R,
        image_channel_data_type: match format {
            ImageFormat::RFloat => CL_FLOAT,
            ImageFormat::RUInt32 => CL_UNSIGNED_INT32,
        },
    }
}

fn queue_properties(ordering: QueueOrdering) -> cl_command_queue_properties {
    match ordering {
        QueueOrdering::InOrder => 0,
        QueueOrdering::OutOfOrder => CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE,
    }
}

fn image_origin_and_region(region: ImageRegion) -> ([usize; 3], [usize; 3]) {
    ([0, 0, 0], [region.cols, region.rows, 1])
}

fn err(message: impl Into<String>) -> ComputeError {
    ComputeError::backend(BackendKind::OpenCl, message)
}

/// Driver for the system's OpenCL platforms.
#[derive(Debug, Default)]
pub struct OpenClDriver;

impl OpenClDriver {
    /// Create the driver. No OpenCL call is made until discovery.
    pub fn new() -> Self {
        Self
    }
}

impl Driver for OpenClDriver {
    type Platform = ClPlatform;
    type Device = ClDevice;
    type Context = ClContext;
    type Queue = ClQueue;
    type Memory = ClMemory;
    type Program = ClProgram;
    type Kernel = ClKernel;

    fn kind(&self) -> BackendKind {
        BackendKind::OpenCl
    }

    fn platforms(&self, max: usize) -> ComputeResult<Vec<Self::Platform>> {
        Ok(get_platforms()?
            .into_iter()
            .take(max)
            .map(ClPlatform)
            .collect())
    }

    fn platform_name(&self, platform: &Self::Platform) -> ComputeResult<String> {
        Ok(platform.0.name()?.trim().to_string())
    }

    fn devices(
        &self,
        platform: &Self::Platform,
        filter: DeviceTypeFilter,
        max: usize,
    ) -> ComputeResult<Vec<Self::Device>> {
        Ok(platform
            .0
            .get_devices(device_type(filter))?
            .into_iter()
            .take(max)
            .map(ClDevice)
            .collect())
    }

    fn device_name(&self, device: &Self::Device) -> ComputeResult<String> {
        Ok(Device::new(device.0).name()?.trim().to_string())
    }

    fn create_context(
        &self,
        platform: &Self::Platform,
        devices: &[Self::Device],
    ) -> ComputeResult<Self::Context> {
        let ids: Vec<cl_device_id> = devices.iter().map(|d| d.0).collect();
        let properties = [
            CL_CONTEXT_PLATFORM,
            platform.0.id() as cl_context_properties,
            0,
        ];
        let context = Context::from_devices(&ids, &properties, None, ptr::null_mut())?;
        Ok(ClContext(context))
    }

    fn create_queue(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        ordering: QueueOrdering,
    ) -> ComputeResult<Self::Queue> {
        let properties = queue_properties(ordering);
        // SAFETY: `device` was discovered on this context's platform and the
        // runtime only creates queues for devices mapped to `context`.
        let queue = unsafe {
            CommandQueue::create_with_properties(&context.0, device.0, properties, 0)?
        };
        Ok(ClQueue(queue))
    }

    fn create_buffer(&self, context: &Self::Context, size: usize) -> ComputeResult<Self::Memory> {
        let buffer = unsafe {
            Buffer::<u8>::create(&context.0, CL_MEM_READ_WRITE, size, ptr::null_mut())?
        };
        Ok(ClMemory::Buffer(buffer))
    }

    fn create_image(
        &self,
        context: &Self::Context,
        format: ImageFormat,
        region: ImageRegion,
    ) -> ComputeResult<Self::Memory> {
        let format = image_format(format);
        // SAFETY: cl_image_desc is a plain C struct; all-zero is a valid
        // starting value and the used fields are set below.
        let mut desc: cl_image_desc = unsafe { std::mem::zeroed() };
        desc.image_type = CL_MEM_OBJECT_IMAGE2D;
        desc.image_width = region.cols;
        desc.image_height = region.rows;
        desc.image_depth = 1;

        let image = unsafe {
            Image::create(
                &context.0,
                CL_MEM_READ_WRITE,
                &format,
                &desc,
                ptr::null_mut(),
            )?
        };
        Ok(ClMemory::Image(image))
    }

    fn write_buffer(
        &self,
        queue: &Self::Queue,
        memory: &mut Self::Memory,
        data: &[u8],
    ) -> ComputeResult<()> {
        let ClMemory::Buffer(buffer) = memory else {
            return Err(err("buffer write on an image"));
        };
        unsafe {
            queue
                .0
                .enqueue_write_buffer(buffer, CL_BLOCKING, 0, data, &[])?;
        }
        Ok(())
    }

    fn read_buffer(
        &self,
        queue: &Self::Queue,
        memory: &Self::Memory,
        out: &mut [u8],
    ) -> ComputeResult<()> {
        let ClMemory::Buffer(buffer) = memory else {
            return Err(err("buffer read on an image"));
        };
        unsafe {
            queue
                .0
                .enqueue_read_buffer(buffer, CL_BLOCKING, 0, out, &[])?;
        }
        Ok(())
    }

    fn write_image(
        &self,
        queue: &Self::Queue,
        memory: &mut Self::Memory,
        region: ImageRegion,
        data: &[u8],
    ) -> ComputeResult<()> {
        let ClMemory::Image(image) = memory else {
            return Err(err("image write on a buffer"));
        };
        let (origin, extent) = image_origin_and_region(region);
        unsafe {
            queue.0.enqueue_write_image(
                image,
                CL_BLOCKING,
                origin.as_ptr(),
                extent.as_ptr(),
                0,
                0,
                data.as_ptr() as *mut c_void,
                &[],
            )?;
        }
        Ok(())
    }

    fn read_image(
        &self,
        queue: &Self::Queue,
        memory: &Self::Memory,
        region: ImageRegion,
        out: &mut [u8],
    ) -> ComputeResult<()> {
        let ClMemory::Image(image) = memory else {
            return Err(err("image read on a buffer"));
        };
        let (origin, extent) = image_origin_and_region(region);
        unsafe {
            queue.0.enqueue_read_image(
                image,
                CL_BLOCKING,
                origin.as_ptr(),
                extent.as_ptr(),
                0,
                0,
                out.as_mut_ptr() as *mut c_void,
                &[],
            )?;
        }
        Ok(())
    }

    fn build_program(
        &self,
        context: &Self::Context,
        devices: &[Self::Device],
        source: &str,
        options: &str,
    ) -> ComputeResult<Self::Program> {
        let ids: Vec<cl_device_id> = devices.iter().map(|d| d.0).collect();
        let mut program = Program::create_from_source(&context.0, source)?;

        if let Err(e) = program.build(&ids, options) {
            let log = ids
                .iter()
                .filter_map(|&id| program.get_build_log(id).ok())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(ComputeError::build(format!("{:?}", e), log));
        }
        Ok(ClProgram(program))
    }

    fn create_kernel(&self, program: &Self::Program, name: &str) -> ComputeResult<Self::Kernel> {
        Ok(ClKernel(Kernel::create(&program.0, name)?))
    }

    fn set_memory_arg(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        memory: &Self::Memory,
    ) -> ComputeResult<()> {
        let raw = memory.raw();
        unsafe {
            kernel.0.set_arg(index, &raw)?;
        }
        Ok(())
    }

    fn set_size_arg(&self, kernel: &mut Self::Kernel, index: u32, value: usize) -> ComputeResult<()> {
        unsafe {
            kernel.0.set_arg(index, &value)?;
        }
        Ok(())
    }

    fn run_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global_work_size: &[usize],
    ) -> ComputeResult<()> {
        let event = unsafe {
            queue.0.enqueue_nd_range_kernel(
                kernel.0.get(),
                global_work_size.len() as u32,
                ptr::null(),
                global_work_size.as_ptr(),
                ptr::null(),
                &[],
            )?
        };
        event.wait()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_mapping() {
        assert_eq!(device_type(DeviceTypeFilter::All), CL_DEVICE_TYPE_ALL);
        assert_eq!(device_type(DeviceTypeFilter::Gpu), CL_DEVICE_TYPE_GPU);
    }

    #[test]
    fn test_queue_properties_follow_ordering() {
        assert_eq!(queue_properties(QueueOrdering::InOrder), 0);
        assert_eq!(
            queue_properties(QueueOrdering::OutOfOrder),
            CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE
        );
    }

    #[test]
    fn test_image_region_is_width_first() {
        let (origin, extent) = image_origin_and_region(ImageRegion { rows: 3, cols: 5 });
        assert_eq!(origin, [0, 0, 0]);
        assert_eq!(extent, [5, 3, 1]);
    }

    #[test]
    fn test_image_format() {
        let format = image_format(ImageFormat::RUInt32);
        assert_eq!(format.image_channel_order, CL_R);
        assert_eq!(format.image_channel_data_type, CL_UNSIGNED_INT32);
    }
}
