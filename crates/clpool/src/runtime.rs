//! The compute runtime.
//!
//! [`Runtime`] ties the catalog, the caller sessions and the handle tables
//! of every backend object together. Each operation takes handles, resolves
//! them to native objects under one lock, validates the request and only
//! then calls into the [`Driver`].
//!
//! ```rust,ignore
//! use clpool::prelude::*;
//!
//! let runtime = Runtime::new(driver, RuntimeConfig::default())?;
//! let session = runtime.init_session();
//! let devices = runtime.device_handles();
//! let report = runtime.create_contexts(session, &devices)?;
//!
//! let queue = runtime.create_in_order_queue(devices[0], session)?;
//! let buf = runtime.create_buffer(devices[0], session, ElementType::Float, 4)?;
//! runtime.write_buffer(queue, buf, &[1.0f64, 2.0, 3.0, 4.0])?;
//! ```

use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::backend::{Driver, ImageRegion, QueueOrdering};
use crate::catalog::Catalog;
use crate::config::RuntimeConfig;
use crate::error::{ComputeError, ComputeResult};
use crate::handle::{
    ContextHandle, DeviceHandle, Handle, KernelHandle, MemHandle, PlatformHandle, ProgramHandle,
    QueueHandle, SessionHandle,
};
use crate::memory::{ElementType, HostElement, Layout, Matrix, MemoryDescriptor};
use crate::registry::HandleTable;
use crate::session::{plan_partition, ContextRecord, PartitionReport, Session};

struct ContextEntry<D: Driver> {
    native: D::Context,
    session: SessionHandle,
    devices: Vec<DeviceHandle>,
}

struct QueueEntry<D: Driver> {
    native: D::Queue,
    context: ContextHandle,
}

struct MemoryEntry<D: Driver> {
    native: D::Memory,
    context: ContextHandle,
    descriptor: MemoryDescriptor,
}

struct ProgramEntry<D: Driver> {
    native: D::Program,
    context: ContextHandle,
}

struct KernelEntry<D: Driver> {
    native: D::Kernel,
    context: ContextHandle,
    params: Vec<MemHandle>,
}

struct RuntimeState<D: Driver> {
    sessions: HandleTable<SessionHandle, Session>,
    contexts: HandleTable<ContextHandle, ContextEntry<D>>,
    queues: HandleTable<QueueHandle, QueueEntry<D>>,
    memory: HandleTable<MemHandle, MemoryEntry<D>>,
    programs: HandleTable<ProgramHandle, ProgramEntry<D>>,
    kernels: HandleTable<KernelHandle, KernelEntry<D>>,
}

impl<D: Driver> RuntimeState<D> {
    fn new() -> Self {
        Self {
            sessions: HandleTable::new(),
            contexts: HandleTable::new(),
            queues: HandleTable::new(),
            memory: HandleTable::new(),
            programs: HandleTable::new(),
            kernels: HandleTable::new(),
        }
    }

    fn context_of_device(
        &self,
        session: SessionHandle,
        device: DeviceHandle,
    ) -> ComputeResult<(ContextHandle, &ContextEntry<D>)> {
        let context = self.sessions.get(session)?.resolve(device)?;
        Ok((context, self.contexts.get(context)?))
    }
}

/// Number of live objects of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    /// Live sessions.
    pub sessions: usize,
    /// Live contexts.
    pub contexts: usize,
    /// Live command queues.
    pub queues: usize,
    /// Live buffers and images.
    pub memory: usize,
    /// Live programs.
    pub programs: usize,
    /// Live kernels.
    pub kernels: usize,
}

/// Multi-platform compute runtime over a [`Driver`].
pub struct Runtime<D: Driver> {
    driver: D,
    config: RuntimeConfig,
    catalog: OnceLock<Catalog<D>>,
    state: Mutex<RuntimeState<D>>,
}

impl<D: Driver> Runtime<D> {
    /// Create a runtime. Discovery is deferred to the first use.
    pub fn new(driver: D, config: RuntimeConfig) -> ComputeResult<Self> {
        config.validate()?;
        Ok(Self {
            driver,
            config,
            catalog: OnceLock::new(),
            state: Mutex::new(RuntimeState::new()),
        })
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Populate the catalog on first call and return it.
    ///
    /// Later calls return the same catalog without touching the driver.
    pub fn discover(&self) -> &Catalog<D> {
        self.catalog
            .get_or_init(|| Catalog::discover(&self.driver, &self.config))
    }

    /// Whether discovery has already run.
    pub fn is_discovered(&self) -> bool {
        self.catalog.get().is_some()
    }

    /// Discover and report the number of platforms.
    pub fn find_platforms(&self) -> usize {
        let count = self.discover().platform_count();
        tracing::info!("Found {} platform(s)", count);
        count
    }

    /// Flattened device handles, platform-major.
    pub fn device_handles(&self) -> Vec<DeviceHandle> {
        self.discover().device_handles()
    }

    /// Flattened device names, in the order of [`device_handles`](Self::device_handles).
    pub fn device_names(&self) -> Vec<String> {
        self.discover().device_names(&self.driver)
    }

    /// Platform names in platform order.
    pub fn platform_names(&self) -> Vec<String> {
        self.discover().platform_names(&self.driver)
    }

    /// Create an empty session.
    pub fn init_session(&self) -> SessionHandle {
        let handle = self.state.lock().sessions.insert(Session::new());
        tracing::debug!(session = %handle, "Session created");
        handle
    }

    /// Snapshot of the contexts a session owns, in creation order.
    pub fn session_contexts(&self, session: SessionHandle) -> ComputeResult<Vec<ContextRecord>> {
        Ok(self.state.lock().sessions.get(session)?.records().to_vec())
    }

    /// Release a session, its contexts and every object created in them.
    pub fn end_session(&self, session: SessionHandle) -> ComputeResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let owned: HashSet<ContextHandle> = state.sessions.release(session)?.contexts().collect();
        let in_session = |context: &ContextHandle| owned.contains(context);

        let kernels = state.kernels.release_where(|k| in_session(&k.context)).len();
        let programs = state.programs.release_where(|p| in_session(&p.context)).len();
        let memory = state.memory.release_where(|m| in_session(&m.context)).len();
        let queues = state.queues.release_where(|q| in_session(&q.context)).len();
        let contexts = state.contexts.release_where(|c| c.session == session).len();

        tracing::debug!(
            session = %session,
            contexts,
            queues,
            memory,
            programs,
            kernels,
            "Session ended"
        );
        Ok(())
    }

    /// Partition a device selection into one new context per platform.
    ///
    /// Devices unknown to the catalog and devices already owned by a
    /// context of this session are left out and listed in the report. A
    /// failure on one platform does not stop the others.
    pub fn create_contexts(
        &self,
        session: SessionHandle,
        selection: &[DeviceHandle],
    ) -> ComputeResult<PartitionReport> {
        let catalog = self.discover();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let layout: Vec<(PlatformHandle, Vec<DeviceHandle>)> = catalog
            .platforms()
            .iter()
            .map(|p| {
                let devices = catalog
                    .devices_of(p.handle())
                    .map(|ds| ds.iter().map(|d| d.handle()).collect())
                    .unwrap_or_default();
                (p.handle(), devices)
            })
            .collect();

        let plan = {
            let current = state.sessions.get(session)?;
            plan_partition(
                layout.iter().map(|(p, ds)| (*p, ds.as_slice())),
                selection,
                current.mapping(),
            )
        };

        for device in &plan.unknown {
            tracing::warn!(device = device.raw(), "Selected device is not in the catalog");
        }
        for device in &plan.already_mapped {
            tracing::warn!(device = %device, "Device already has a context in this session");
        }

        let mut report = PartitionReport {
            unknown: plan.unknown,
            already_mapped: plan.already_mapped,
            ..Default::default()
        };

        for group in plan.groups {
            let platform = catalog.platform(group.platform)?;
            let natives = group
                .devices
                .iter()
                .map(|d| catalog.device(*d).map(|e| e.native().clone()))
                .collect::<ComputeResult<Vec<_>>>()?;

            match self.driver.create_context(platform.native(), &natives) {
                Ok(native) => {
                    let context = state.contexts.insert(ContextEntry {
                        native,
                        session,
                        devices: group.devices.clone(),
                    });
                    state.sessions.get_mut(session)?.add_record(ContextRecord {
                        context,
                        platform: group.platform,
                        devices: group.devices,
                    });
                    tracing::debug!(
                        context = %context,
                        platform = %group.platform,
                        "Context created"
                    );
                    report.created.push(context);
                }
                Err(e) => {
                    tracing::warn!(platform = %group.platform, "Context creation failed: {}", e);
                    report.failed.push((group.platform, e));
                }
            }
        }

        Ok(report)
    }

    /// Context owning `device` in `session`.
    pub fn resolve_context(
        &self,
        device: DeviceHandle,
        session: SessionHandle,
    ) -> ComputeResult<ContextHandle> {
        self.state.lock().sessions.get(session)?.resolve(device)
    }

    /// Create a command queue for a device in its owning context.
    pub fn create_queue(
        &self,
        device: DeviceHandle,
        session: SessionHandle,
        ordering: QueueOrdering,
    ) -> ComputeResult<QueueHandle> {
        let catalog = self.discover();
        let native_device = catalog.device(device)?.native();

        let mut state = self.state.lock();
        let (context, entry) = state.context_of_device(session, device)?;
        let native = self.driver.create_queue(&entry.native, native_device, ordering)?;

        let handle = state.queues.insert(QueueEntry { native, context });
        tracing::debug!(queue = %handle, device = %device, ?ordering, "Queue created");
        Ok(handle)
    }

    /// Create a queue whose commands run in submission order.
    pub fn create_in_order_queue(
        &self,
        device: DeviceHandle,
        session: SessionHandle,
    ) -> ComputeResult<QueueHandle> {
        self.create_queue(device, session, QueueOrdering::InOrder)
    }

    /// Create a queue whose commands may run out of submission order.
    pub fn create_out_of_order_queue(
        &self,
        device: DeviceHandle,
        session: SessionHandle,
    ) -> ComputeResult<QueueHandle> {
        self.create_queue(device, session, QueueOrdering::OutOfOrder)
    }

    /// Release a command queue.
    pub fn release_queue(&self, queue: QueueHandle) -> ComputeResult<()> {
        drop(self.state.lock().queues.release(queue)?);
        tracing::debug!(queue = %queue, "Queue released");
        Ok(())
    }

    /// Allocate a linear buffer of `len` elements in the device's context.
    pub fn create_buffer(
        &self,
        device: DeviceHandle,
        session: SessionHandle,
        element: ElementType,
        len: usize,
    ) -> ComputeResult<MemHandle> {
        let descriptor = MemoryDescriptor::linear(element, len)?;

        let mut state = self.state.lock();
        let (context, entry) = state.context_of_device(session, device)?;
        let native = self.driver.create_buffer(&entry.native, descriptor.byte_size())?;

        let handle = state.memory.insert(MemoryEntry {
            native,
            context,
            descriptor,
        });
        tracing::debug!(memory = %handle, %element, len, "Buffer created");
        Ok(handle)
    }

    /// Allocate a single-channel `rows x cols` image in the device's context.
    pub fn create_image(
        &self,
        device: DeviceHandle,
        session: SessionHandle,
        element: ElementType,
        rows: usize,
        cols: usize,
    ) -> ComputeResult<MemHandle> {
        let descriptor = MemoryDescriptor::image(element, rows, cols)?;

        let mut state = self.state.lock();
        let (context, entry) = state.context_of_device(session, device)?;
        let native = self.driver.create_image(
            &entry.native,
            element.image_format(),
            ImageRegion { rows, cols },
        )?;

        let handle = state.memory.insert(MemoryEntry {
            native,
            context,
            descriptor,
        });
        tracing::debug!(memory = %handle, %element, rows, cols, "Image created");
        Ok(handle)
    }

    /// Element type and shape of a memory object.
    pub fn memory_descriptor(&self, memory: MemHandle) -> ComputeResult<MemoryDescriptor> {
        Ok(self.state.lock().memory.get(memory)?.descriptor)
    }

    /// Blocking write of `values` to the start of a buffer.
    pub fn write_buffer<T: HostElement>(
        &self,
        queue: QueueHandle,
        memory: MemHandle,
        values: &[T],
    ) -> ComputeResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let q = state.queues.get(queue)?;
        let m = state.memory.get_mut(memory)?;

        check_context(q.context, m.context, "queue and buffer")?;
        m.descriptor.check_linear(T::ELEMENT, values.len())?;
        if values.is_empty() {
            return Ok(());
        }

        let bytes = T::stage(values, Layout::Linear)?;
        self.driver.write_buffer(&q.native, &mut m.native, &bytes)?;
        tracing::trace!(memory = %memory, len = values.len(), "Buffer written");
        Ok(())
    }

    /// Blocking read of the first `len` elements of a buffer.
    pub fn read_buffer<T: HostElement>(
        &self,
        queue: QueueHandle,
        memory: MemHandle,
        len: usize,
    ) -> ComputeResult<Vec<T>> {
        let state = self.state.lock();
        let q = state.queues.get(queue)?;
        let m = state.memory.get(memory)?;

        check_context(q.context, m.context, "queue and buffer")?;
        m.descriptor.check_linear(T::ELEMENT, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut bytes = vec![0u8; len * T::ELEMENT.width(Layout::Linear)];
        self.driver.read_buffer(&q.native, &m.native, &mut bytes)?;
        Ok(T::unstage(&bytes, Layout::Linear))
    }

    /// Blocking write of a full image.
    pub fn write_image<T: HostElement>(
        &self,
        queue: QueueHandle,
        memory: MemHandle,
        values: &Matrix<T>,
    ) -> ComputeResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let q = state.queues.get(queue)?;
        let m = state.memory.get_mut(memory)?;

        check_context(q.context, m.context, "queue and image")?;
        m.descriptor
            .check_image(T::ELEMENT, values.rows(), values.cols())?;

        let bytes = T::stage(values.as_slice(), Layout::Image)?;
        let region = ImageRegion {
            rows: values.rows(),
            cols: values.cols(),
        };
        self.driver.write_image(&q.native, &mut m.native, region, &bytes)?;
        tracing::trace!(memory = %memory, rows = region.rows, cols = region.cols, "Image written");
        Ok(())
    }

    /// Blocking read of a full `rows x cols` image.
    pub fn read_image<T: HostElement>(
        &self,
        queue: QueueHandle,
        memory: MemHandle,
        rows: usize,
        cols: usize,
    ) -> ComputeResult<Matrix<T>> {
        let state = self.state.lock();
        let q = state.queues.get(queue)?;
        let m = state.memory.get(memory)?;

        check_context(q.context, m.context, "queue and image")?;
        m.descriptor.check_image(T::ELEMENT, rows, cols)?;

        let mut bytes = vec![0u8; rows * cols * T::ELEMENT.width(Layout::Image)];
        self.driver
            .read_image(&q.native, &m.native, ImageRegion { rows, cols }, &mut bytes)?;
        Matrix::from_row_major(rows, cols, T::unstage(&bytes, Layout::Image))
    }

    /// Release a buffer or image.
    pub fn release_memory(&self, memory: MemHandle) -> ComputeResult<()> {
        drop(self.state.lock().memory.release(memory)?);
        tracing::debug!(memory = %memory, "Memory released");
        Ok(())
    }

    /// Build `source` once for every context of the session.
    ///
    /// The result has one entry per context in creation order; a failed
    /// build is logged with its build log and yields `None`.
    pub fn build_program(
        &self,
        session: SessionHandle,
        source: &str,
    ) -> ComputeResult<Vec<Option<ProgramHandle>>> {
        let catalog = self.discover();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let contexts: Vec<ContextHandle> = state.sessions.get(session)?.contexts().collect();
        let mut programs = Vec::with_capacity(contexts.len());

        for context in contexts {
            let entry = state.contexts.get(context)?;
            let devices = entry
                .devices
                .iter()
                .map(|d| catalog.device(*d).map(|e| e.native().clone()))
                .collect::<ComputeResult<Vec<_>>>()?;

            match self.driver.build_program(
                &entry.native,
                &devices,
                source,
                &self.config.build_options,
            ) {
                Ok(native) => {
                    let handle = state.programs.insert(ProgramEntry { native, context });
                    tracing::debug!(program = %handle, context = %context, "Program built");
                    programs.push(Some(handle));
                }
                Err(ComputeError::BuildFailed { message, log }) => {
                    tracing::warn!(context = %context, %log, "Program build failed: {}", message);
                    programs.push(None);
                }
                Err(e) => {
                    tracing::warn!(context = %context, "Program build failed: {}", e);
                    programs.push(None);
                }
            }
        }

        Ok(programs)
    }

    /// Release a program.
    pub fn release_program(&self, program: ProgramHandle) -> ComputeResult<()> {
        drop(self.state.lock().programs.release(program)?);
        tracing::debug!(program = %program, "Program released");
        Ok(())
    }

    /// Create a kernel and bind its arguments.
    ///
    /// Memory objects are bound positionally, followed by one trailing
    /// `size_t` argument holding the number of memory objects. The kernel
    /// source must declare that trailing argument. On any failure the
    /// partially bound kernel is dropped.
    pub fn prepare_kernel(
        &self,
        program: ProgramHandle,
        name: &str,
        params: &[MemHandle],
    ) -> ComputeResult<KernelHandle> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let p = state.programs.get(program)?;
        let mut native = self.driver.create_kernel(&p.native, name)?;

        for (index, &param) in params.iter().enumerate() {
            let m = state.memory.get(param)?;
            check_context(p.context, m.context, "program and kernel argument")?;
            self.driver
                .set_memory_arg(&mut native, arg_index(index)?, &m.native)?;
        }
        self.driver
            .set_size_arg(&mut native, arg_index(params.len())?, params.len())?;

        let context = p.context;
        let handle = state.kernels.insert(KernelEntry {
            native,
            context,
            params: params.to_vec(),
        });
        tracing::debug!(kernel = %handle, name, args = params.len(), "Kernel prepared");
        Ok(handle)
    }

    /// Execute a kernel over `global_work_size` and wait for completion.
    pub fn run_kernel(
        &self,
        kernel: KernelHandle,
        queue: QueueHandle,
        global_work_size: &[usize],
    ) -> ComputeResult<()> {
        if global_work_size.is_empty() || global_work_size.len() > 3 {
            return Err(ComputeError::InvalidShape(format!(
                "work dimensions must be 1 to 3, got {}",
                global_work_size.len()
            )));
        }
        if global_work_size.contains(&0) {
            return Err(ComputeError::InvalidShape(
                "global work size must be non-zero".to_string(),
            ));
        }

        let state = self.state.lock();
        let k = state.kernels.get(kernel)?;
        let q = state.queues.get(queue)?;
        check_context(q.context, k.context, "queue and kernel")?;
        for &param in &k.params {
            state.memory.get(param)?;
        }

        self.driver
            .run_kernel(&q.native, &k.native, global_work_size)?;
        tracing::debug!(kernel = %kernel, queue = %queue, ?global_work_size, "Kernel finished");
        Ok(())
    }

    /// Release a kernel.
    pub fn release_kernel(&self, kernel: KernelHandle) -> ComputeResult<()> {
        drop(self.state.lock().kernels.release(kernel)?);
        tracing::debug!(kernel = %kernel, "Kernel released");
        Ok(())
    }

    /// Number of live objects of each kind.
    pub fn resource_counts(&self) -> ResourceCounts {
        let state = self.state.lock();
        ResourceCounts {
            sessions: state.sessions.live_count(),
            contexts: state.contexts.live_count(),
            queues: state.queues.live_count(),
            memory: state.memory.live_count(),
            programs: state.programs.live_count(),
            kernels: state.kernels.live_count(),
        }
    }
}

fn check_context(a: ContextHandle, b: ContextHandle, what: &str) -> ComputeResult<()> {
    if a != b {
        return Err(ComputeError::ContextMismatch(format!(
            "{} belong to {} and {}",
            what, a, b
        )));
    }
    Ok(())
}

fn arg_index(index: usize) -> ComputeResult<u32> {
    u32::try_from(index)
        .map_err(|_| ComputeError::KernelError(format!("too many kernel arguments: {}", index)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::{SimulatedDriver, SimulatedTopology};

    fn runtime() -> Runtime<SimulatedDriver> {
        let driver = SimulatedDriver::new(
            SimulatedTopology::new()
                .platform("Sim A", &["A0", "A1"])
                .platform("Sim B", &["B0"]),
        );
        Runtime::new(driver, RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_discovery_is_lazy_and_idempotent() {
        let rt = runtime();
        assert!(!rt.is_discovered());
        assert_eq!(rt.find_platforms(), 2);
        assert!(rt.is_discovered());

        let first = rt.discover() as *const _;
        let second = rt.discover() as *const _;
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let driver = SimulatedDriver::new(SimulatedTopology::new());
        let config = RuntimeConfig {
            max_devices_per_platform: 0,
            ..Default::default()
        };
        assert!(Runtime::new(driver, config).is_err());
    }

    #[test]
    fn test_queue_requires_mapping() {
        let rt = runtime();
        let session = rt.init_session();
        let devices = rt.device_handles();

        assert!(matches!(
            rt.create_in_order_queue(devices[0], session),
            Err(ComputeError::NoContextForDevice(_))
        ));

        rt.create_contexts(session, &devices[..1]).unwrap();
        assert!(rt.create_in_order_queue(devices[0], session).is_ok());
        assert!(rt.create_out_of_order_queue(devices[0], session).is_ok());
    }

    #[test]
    fn test_cross_context_transfer_rejected() {
        let rt = runtime();
        let session = rt.init_session();
        let devices = rt.device_handles();
        rt.create_contexts(session, &devices).unwrap();

        let queue_b = rt.create_in_order_queue(devices[2], session).unwrap();
        let buf_a = rt
            .create_buffer(devices[0], session, ElementType::UInt, 4)
            .unwrap();

        let err = rt.write_buffer(queue_b, buf_a, &[1u64, 2]).unwrap_err();
        assert!(matches!(err, ComputeError::ContextMismatch(_)));
    }

    #[test]
    fn test_end_session_releases_everything() {
        let rt = runtime();
        let session = rt.init_session();
        let devices = rt.device_handles();
        rt.create_contexts(session, &devices).unwrap();

        let queue = rt.create_in_order_queue(devices[0], session).unwrap();
        let buf = rt
            .create_buffer(devices[0], session, ElementType::Float, 8)
            .unwrap();

        rt.end_session(session).unwrap();
        assert_eq!(rt.resource_counts(), ResourceCounts::default());
        assert!(rt.release_memory(buf).unwrap_err().is_released());
        assert!(rt.release_queue(queue).unwrap_err().is_released());
        assert!(rt.session_contexts(session).unwrap_err().is_released());
        assert!(rt.end_session(session).unwrap_err().is_released());
    }

    #[test]
    fn test_run_kernel_checks_dimensions() {
        let rt = runtime();
        let kernel = KernelHandle::from_index(0);
        let queue = QueueHandle::from_index(0);
        assert!(matches!(
            rt.run_kernel(kernel, queue, &[]),
            Err(ComputeError::InvalidShape(_))
        ));
        assert!(matches!(
            rt.run_kernel(kernel, queue, &[1, 1, 1, 1]),
            Err(ComputeError::InvalidShape(_))
        ));
        assert!(matches!(
            rt.run_kernel(kernel, queue, &[4, 0]),
            Err(ComputeError::InvalidShape(_))
        ));
    }
}
