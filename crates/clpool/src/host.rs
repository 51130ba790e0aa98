//! Host boundary.
//!
//! [`HostInterface`] exposes the runtime to a host that only understands
//! 64-bit integers, strings and vectors. Handles cross the boundary as raw
//! `u64` values and no operation returns an error: a failure is logged and
//! reported as `0`, `false` or an empty vector.

use crate::backend::Driver;
use crate::error::{ComputeError, ComputeResult};
use crate::handle::{
    raw_or_null, DeviceHandle, Handle, KernelHandle, MemHandle, ProgramHandle, QueueHandle,
    SessionHandle,
};
use crate::memory::{ElementType, HostElement, Matrix};
use crate::runtime::Runtime;

/// Sentinel-returning facade over a [`Runtime`].
pub struct HostInterface<D: Driver> {
    runtime: Runtime<D>,
}

impl<D: Driver> HostInterface<D> {
    /// Wrap a runtime.
    pub fn new(runtime: Runtime<D>) -> Self {
        Self { runtime }
    }

    /// The wrapped runtime.
    pub fn runtime(&self) -> &Runtime<D> {
        &self.runtime
    }

    fn settle<T>(&self, operation: &'static str, result: ComputeResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(operation, "{}", e);
                None
            }
        }
    }

    fn raw_result<H: Handle>(&self, operation: &'static str, result: ComputeResult<H>) -> u64 {
        raw_or_null(self.settle(operation, result))
    }

    /// Discover and return the number of platforms.
    pub fn find_platforms(&self) -> u64 {
        self.runtime.find_platforms() as u64
    }

    /// Raw handles of every discovered device, platform-major.
    pub fn get_compute_device_ids(&self) -> Vec<u64> {
        self.runtime
            .device_handles()
            .into_iter()
            .map(u64::from)
            .collect()
    }

    /// Names of every discovered device, in the same order as the handles.
    pub fn get_compute_devices(&self) -> Vec<String> {
        self.runtime.device_names()
    }

    /// Discover (once) and open a new session.
    pub fn init(&self) -> u64 {
        self.runtime.discover();
        self.runtime.init_session().raw()
    }

    /// Close a session and release everything it created.
    pub fn end_session(&self, session: u64) -> bool {
        let result = SessionHandle::from_raw(session).and_then(|s| self.runtime.end_session(s));
        self.settle("end_session", result).is_some()
    }

    /// Partition devices into per-platform contexts of a session.
    ///
    /// Values that are not device handles are dropped. Returns the number of
    /// contexts created.
    pub fn create_context(&self, devices: &[u64], session: u64) -> u64 {
        let selection: Vec<DeviceHandle> = devices
            .iter()
            .filter_map(|&raw| match DeviceHandle::from_raw(raw) {
                Ok(device) => Some(device),
                Err(e) => {
                    tracing::debug!(raw, "Dropping selection entry: {}", e);
                    None
                }
            })
            .collect();

        let result = SessionHandle::from_raw(session)
            .and_then(|s| self.runtime.create_contexts(s, &selection));
        self.settle("create_context", result)
            .map(|report| report.created.len() as u64)
            .unwrap_or(0)
    }

    /// Create an in-order queue for a device.
    pub fn create_in_order_queue(&self, device: u64, session: u64) -> u64 {
        let result = device_and_session(device, session)
            .and_then(|(d, s)| self.runtime.create_in_order_queue(d, s));
        self.raw_result("create_in_order_queue", result)
    }

    /// Create an out-of-order queue for a device.
    pub fn create_out_of_order_queue(&self, device: u64, session: u64) -> u64 {
        let result = device_and_session(device, session)
            .and_then(|(d, s)| self.runtime.create_out_of_order_queue(d, s));
        self.raw_result("create_out_of_order_queue", result)
    }

    /// Release a queue.
    pub fn release_queue(&self, queue: u64) -> bool {
        let result = QueueHandle::from_raw(queue).and_then(|q| self.runtime.release_queue(q));
        self.settle("release_queue", result).is_some()
    }

    /// Allocate a linear buffer of `len` elements of type `tag`.
    ///
    /// An unknown tag yields `0` without any allocation.
    pub fn create_array(&self, device: u64, len: u64, tag: u64, session: u64) -> u64 {
        let result = ElementType::from_tag(tag).and_then(|element| {
            let (d, s) = device_and_session(device, session)?;
            self.runtime.create_buffer(d, s, element, to_usize(len)?)
        });
        self.raw_result("create_array", result)
    }

    /// Allocate a `rows x cols` image of type `tag`.
    ///
    /// An unknown tag yields `0` without any allocation.
    pub fn create_matrix(&self, device: u64, rows: u64, cols: u64, tag: u64, session: u64) -> u64 {
        let result = ElementType::from_tag(tag).and_then(|element| {
            let (d, s) = device_and_session(device, session)?;
            self.runtime
                .create_image(d, s, element, to_usize(rows)?, to_usize(cols)?)
        });
        self.raw_result("create_matrix", result)
    }

    fn write_array<T: HostElement>(
        &self,
        operation: &'static str,
        queue: u64,
        memory: u64,
        values: &[T],
    ) -> bool {
        let result = queue_and_memory(queue, memory)
            .and_then(|(q, m)| self.runtime.write_buffer(q, m, values));
        self.settle(operation, result).is_some()
    }

    fn read_array<T: HostElement>(
        &self,
        operation: &'static str,
        queue: u64,
        memory: u64,
        len: u64,
    ) -> Vec<T> {
        let result = queue_and_memory(queue, memory)
            .and_then(|(q, m)| self.runtime.read_buffer(q, m, to_usize(len)?));
        self.settle(operation, result).unwrap_or_default()
    }

    fn write_matrix<T: HostElement>(
        &self,
        operation: &'static str,
        queue: u64,
        memory: u64,
        rows: &[Vec<T>],
    ) -> bool {
        let result = queue_and_memory(queue, memory).and_then(|(q, m)| {
            let matrix = Matrix::from_rows(rows)?;
            self.runtime.write_image(q, m, &matrix)
        });
        self.settle(operation, result).is_some()
    }

    fn read_matrix<T: HostElement>(
        &self,
        operation: &'static str,
        queue: u64,
        memory: u64,
        rows: u64,
        cols: u64,
    ) -> Vec<Vec<T>> {
        let result = queue_and_memory(queue, memory).and_then(|(q, m)| {
            self.runtime
                .read_image::<T>(q, m, to_usize(rows)?, to_usize(cols)?)
        });
        self.settle(operation, result)
            .map(|matrix| matrix.to_rows())
            .unwrap_or_default()
    }

    /// Write unsigned integers to a buffer.
    pub fn write_int_array(&self, queue: u64, memory: u64, values: &[u64]) -> bool {
        self.write_array("write_int_array", queue, memory, values)
    }

    /// Read `len` unsigned integers from a buffer.
    pub fn read_int_array(&self, queue: u64, memory: u64, len: u64) -> Vec<u64> {
        self.read_array("read_int_array", queue, memory, len)
    }

    /// Write floats to a buffer.
    pub fn write_float_array(&self, queue: u64, memory: u64, values: &[f64]) -> bool {
        self.write_array("write_float_array", queue, memory, values)
    }

    /// Read `len` floats from a buffer.
    pub fn read_float_array(&self, queue: u64, memory: u64, len: u64) -> Vec<f64> {
        self.read_array("read_float_array", queue, memory, len)
    }

    /// Write unsigned integer rows to an image.
    pub fn write_int_matrix(&self, queue: u64, memory: u64, rows: &[Vec<u64>]) -> bool {
        self.write_matrix("write_int_matrix", queue, memory, rows)
    }

    /// Read an unsigned integer image as rows.
    pub fn read_int_matrix(&self, queue: u64, memory: u64, rows: u64, cols: u64) -> Vec<Vec<u64>> {
        self.read_matrix("read_int_matrix", queue, memory, rows, cols)
    }

    /// Write float rows to an image.
    pub fn write_float_matrix(&self, queue: u64, memory: u64, rows: &[Vec<f64>]) -> bool {
        self.write_matrix("write_float_matrix", queue, memory, rows)
    }

    /// Read a float image as rows.
    pub fn read_float_matrix(&self, queue: u64, memory: u64, rows: u64, cols: u64) -> Vec<Vec<f64>> {
        self.read_matrix("read_float_matrix", queue, memory, rows, cols)
    }

    /// Release a buffer or image.
    pub fn destroy_memory_area(&self, memory: u64) -> bool {
        let result = MemHandle::from_raw(memory).and_then(|m| self.runtime.release_memory(m));
        self.settle("destroy_memory_area", result).is_some()
    }

    /// Build a program for every context of a session.
    ///
    /// One entry per context in creation order, `0` where the build failed.
    pub fn create_program(&self, source: &str, session: u64) -> Vec<u64> {
        let result =
            SessionHandle::from_raw(session).and_then(|s| self.runtime.build_program(s, source));
        self.settle("create_program", result)
            .map(|programs| programs.into_iter().map(raw_or_null).collect())
            .unwrap_or_default()
    }

    /// Release a program.
    pub fn release_program(&self, program: u64) -> bool {
        let result =
            ProgramHandle::from_raw(program).and_then(|p| self.runtime.release_program(p));
        self.settle("release_program", result).is_some()
    }

    /// Create a kernel and bind memory parameters plus the trailing count.
    pub fn prepare_kernel(&self, program: u64, params: &[u64], name: &str) -> u64 {
        let result = ProgramHandle::from_raw(program).and_then(|p| {
            let params = params
                .iter()
                .map(|&raw| MemHandle::from_raw(raw))
                .collect::<ComputeResult<Vec<_>>>()?;
            self.runtime.prepare_kernel(p, name, &params)
        });
        self.raw_result("prepare_kernel", result)
    }

    /// Release a kernel.
    pub fn release_kernel(&self, kernel: u64) -> bool {
        let result = KernelHandle::from_raw(kernel).and_then(|k| self.runtime.release_kernel(k));
        self.settle("release_kernel", result).is_some()
    }

    /// Run a kernel over `dims` and wait for it.
    pub fn run_kernel(&self, kernel: u64, queue: u64, dims: &[u64]) -> bool {
        let result = KernelHandle::from_raw(kernel).and_then(|k| {
            let q = QueueHandle::from_raw(queue)?;
            let sizes = dims
                .iter()
                .map(|&d| to_usize(d))
                .collect::<ComputeResult<Vec<_>>>()?;
            self.runtime.run_kernel(k, q, &sizes)
        });
        self.settle("run_kernel", result).is_some()
    }
}

fn device_and_session(device: u64, session: u64) -> ComputeResult<(DeviceHandle, SessionHandle)> {
    Ok((DeviceHandle::from_raw(device)?, SessionHandle::from_raw(session)?))
}

fn queue_and_memory(queue: u64, memory: u64) -> ComputeResult<(QueueHandle, MemHandle)> {
    Ok((QueueHandle::from_raw(queue)?, MemHandle::from_raw(memory)?))
}

fn to_usize(value: u64) -> ComputeResult<usize> {
    usize::try_from(value)
        .map_err(|_| ComputeError::InvalidShape(format!("{} does not fit in usize", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::{SimulatedDriver, SimulatedTopology};
    use crate::config::RuntimeConfig;

    fn host() -> HostInterface<SimulatedDriver> {
        let driver = SimulatedDriver::new(SimulatedTopology::new().platform("Sim", &["D0"]));
        HostInterface::new(Runtime::new(driver, RuntimeConfig::default()).unwrap())
    }

    #[test]
    fn test_garbage_handles_become_sentinels() {
        let host = host();
        assert_eq!(host.create_in_order_queue(0, 0), 0);
        assert_eq!(host.create_array(12345, 4, 0, 0), 0);
        assert!(!host.destroy_memory_area(0));
        assert!(host.read_float_array(0, 0, 4).is_empty());
        assert!(host.create_program("kernel void f() {}", 0).is_empty());
        assert!(!host.run_kernel(0, 0, &[1]));
    }

    #[test]
    fn test_session_handle_is_nonzero() {
        let host = host();
        let session = host.init();
        assert_ne!(session, 0);
        assert_eq!(host.find_platforms(), 1);
        assert_eq!(host.get_compute_devices(), vec!["D0"]);
    }
}
