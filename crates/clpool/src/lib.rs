//! # clpool
//!
//! Multi-platform compute device pooling.
//!
//! OpenCL requires every context to hold devices of a single platform. This
//! crate lets a caller treat the devices of several platforms as one pool:
//! it discovers which platform each device belongs to, splits a device
//! selection into one context per platform, remembers which context owns
//! each device so later operations route to the right one, and hands out
//! tracked 64-bit handles that can never be used after release.
//!
//! ## Features
//!
//! - Process-wide platform/device catalog, discovered once
//! - Per-session device to context mapping
//! - Typed buffers and 2-D images with transfer validation
//! - Program builds across every context of a session
//! - Kernel preparation with a trailing parameter-count argument
//! - A sentinel-returning host boundary over raw `u64` handles
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use clpool::prelude::*;
//!
//! let runtime = Runtime::new(OpenClDriver::new(), RuntimeConfig::default())?;
//! let session = runtime.init_session();
//! let devices = runtime.device_handles();
//!
//! let report = runtime.create_contexts(session, &devices)?;
//! println!("{} context(s) created", report.created.len());
//!
//! let programs = runtime.build_program(session, SOURCE)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `opencl`: OpenCL driver on top of `opencl3`. Without it only the
//!   simulated driver is available.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod handle;
pub mod host;
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod session;

// Re-export commonly used types
pub use backend::simulated::{SimulatedDriver, SimulatedTopology};
pub use backend::{Driver, ImageRegion, QueueOrdering};
pub use catalog::{Catalog, DeviceEntry, PlatformEntry};
pub use config::{DeviceClass, DeviceTypeFilter, RuntimeConfig};
pub use error::{BackendKind, ComputeError, ComputeResult};
pub use handle::{
    ContextHandle, DeviceHandle, Handle, HandleKind, KernelHandle, MemHandle, PlatformHandle,
    ProgramHandle, QueueHandle, SessionHandle,
};
pub use host::HostInterface;
pub use memory::{ElementType, HostElement, Layout, Matrix, MemoryDescriptor, MemoryShape};
pub use runtime::{ResourceCounts, Runtime};
pub use session::{ContextRecord, PartitionReport, Session};

#[cfg(feature = "opencl")]
pub use backend::opencl::OpenClDriver;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backend::simulated::{SimulatedDriver, SimulatedTopology};
    pub use crate::backend::{Driver, QueueOrdering};
    pub use crate::config::{DeviceTypeFilter, RuntimeConfig};
    pub use crate::error::{ComputeError, ComputeResult};
    pub use crate::handle::{DeviceHandle, Handle, MemHandle, SessionHandle};
    pub use crate::host::HostInterface;
    pub use crate::memory::{ElementType, Matrix};
    pub use crate::runtime::Runtime;
    pub use crate::session::PartitionReport;

    #[cfg(feature = "opencl")]
    pub use crate::backend::opencl::OpenClDriver;
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR_ADD: &str = r#"
        __kernel void vector_add(__global const float* a,
                                 __global const float* b,
                                 __global float* out,
                                 const ulong count) {
            size_t i = get_global_id(0);
            out[i] = a[i] + b[i];
        }
    "#;

    fn runtime() -> Runtime<SimulatedDriver> {
        let driver = SimulatedDriver::new(
            SimulatedTopology::new()
                .platform("Sim A", &["A0", "A1"])
                .platform("Sim B", &["B0"]),
        );
        Runtime::new(driver, RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_discovery() {
        let rt = runtime();
        assert_eq!(rt.find_platforms(), 2);
        assert_eq!(rt.device_names(), vec!["A0", "A1", "B0"]);
    }

    #[test]
    fn test_end_to_end_vector_add() {
        let rt = runtime();
        rt.driver().register_kernel("vector_add", |inv| {
            let a = inv.read_f32(0)?;
            let b = inv.read_f32(1)?;
            let n = inv.size_arg(3)?;
            assert_eq!(n, 3);
            let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
            inv.write_f32(2, &sum)
        });

        let session = rt.init_session();
        let devices = rt.device_handles();
        let report = rt.create_contexts(session, &devices).unwrap();
        assert_eq!(report.created.len(), 2);

        let device = devices[2];
        let queue = rt.create_in_order_queue(device, session).unwrap();
        let a = rt.create_buffer(device, session, ElementType::Float, 4).unwrap();
        let b = rt.create_buffer(device, session, ElementType::Float, 4).unwrap();
        let out = rt.create_buffer(device, session, ElementType::Float, 4).unwrap();
        rt.write_buffer(queue, a, &[1.0f64, 2.0, 3.0, 4.0]).unwrap();
        rt.write_buffer(queue, b, &[10.0f64, 20.0, 30.0, 40.0]).unwrap();

        let programs = rt.build_program(session, VECTOR_ADD).unwrap();
        assert_eq!(programs.len(), 2);
        let program = programs[1].unwrap();

        let kernel = rt.prepare_kernel(program, "vector_add", &[a, b, out]).unwrap();
        rt.run_kernel(kernel, queue, &[4]).unwrap();

        let result: Vec<f64> = rt.read_buffer(queue, out, 4).unwrap();
        assert_eq!(result, vec![11.0, 22.0, 33.0, 44.0]);
    }
}
