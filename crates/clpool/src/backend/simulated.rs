//! In-memory simulated driver.
//!
//! This backend models a configurable set of platforms and devices entirely
//! in host memory. It enforces the same structural rules a real OpenCL
//! driver does (single-platform contexts, queues bound to context members,
//! argument counts matching the kernel signature) and can inject failures
//! per platform, which makes it the driver used by the test suite and by
//! the CLI `--simulate` mode.
//!
//! Kernels do nothing on their own; host-side implementations can be
//! registered with [`SimulatedDriver::register_kernel`] to give a kernel
//! name observable effects on the memory objects bound to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Driver, ImageRegion, QueueOrdering};
use crate::config::{DeviceClass, DeviceTypeFilter};
use crate::error::{BackendKind, ComputeError, ComputeResult};
use crate::memory::ImageFormat;

/// Description of one simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedDeviceSpec {
    /// Reported device name.
    pub name: String,
    /// Device class used by discovery filters.
    #[serde(default = "default_class")]
    pub class: DeviceClass,
}

fn default_class() -> DeviceClass {
    DeviceClass::Gpu
}

/// Description of one simulated platform and its injected faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedPlatformSpec {
    /// Reported platform name.
    pub name: String,
    /// Devices in enumeration order.
    #[serde(default)]
    pub devices: Vec<SimulatedDeviceSpec>,
    /// Device enumeration on this platform fails.
    #[serde(default)]
    pub fail_device_query: bool,
    /// Context creation on this platform fails.
    #[serde(default)]
    pub fail_context: bool,
    /// Program builds on this platform fail.
    #[serde(default)]
    pub fail_build: bool,
}

/// Platforms and devices exposed by a [`SimulatedDriver`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTopology {
    /// Platforms in enumeration order.
    #[serde(default)]
    pub platforms: Vec<SimulatedPlatformSpec>,
    /// Platform enumeration itself fails.
    #[serde(default)]
    pub fail_platform_query: bool,
}

impl SimulatedTopology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a platform with GPU devices of the given names.
    pub fn platform(mut self, name: &str, devices: &[&str]) -> Self {
        self.platforms.push(SimulatedPlatformSpec {
            name: name.to_string(),
            devices: devices
                .iter()
                .map(|d| SimulatedDeviceSpec {
                    name: d.to_string(),
                    class: DeviceClass::Gpu,
                })
                .collect(),
            fail_device_query: false,
            fail_context: false,
            fail_build: false,
        });
        self
    }

    /// Make context creation fail on the platform at `index`.
    pub fn failing_context(mut self, index: usize) -> Self {
        if let Some(p) = self.platforms.get_mut(index) {
            p.fail_context = true;
        }
        self
    }

    /// Make program builds fail on the platform at `index`.
    pub fn failing_build(mut self, index: usize) -> Self {
        if let Some(p) = self.platforms.get_mut(index) {
            p.fail_build = true;
        }
        self
    }

    /// Make device enumeration fail on the platform at `index`.
    pub fn failing_device_query(mut self, index: usize) -> Self {
        if let Some(p) = self.platforms.get_mut(index) {
            p.fail_device_query = true;
        }
        self
    }

    /// Total number of devices across all platforms.
    pub fn device_count(&self) -> usize {
        self.platforms.iter().map(|p| p.devices.len()).sum()
    }
}

/// Counters of driver calls, for observing what reached the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedStats {
    /// Contexts created.
    pub contexts_created: u64,
    /// Queues created.
    pub queues_created: u64,
    /// Queues created with out-of-order execution enabled.
    pub queues_out_of_order: u64,
    /// Linear buffers allocated.
    pub buffers_created: u64,
    /// Images allocated.
    pub images_created: u64,
    /// Memory objects dropped.
    pub memory_released: u64,
    /// Successful program builds.
    pub programs_built: u64,
    /// Failed program builds.
    pub build_failures: u64,
    /// Kernels created.
    pub kernels_created: u64,
    /// Kernel ranges executed.
    pub kernels_run: u64,
}

#[derive(Default)]
struct Counters {
    contexts_created: AtomicU64,
    queues_created: AtomicU64,
    queues_out_of_order: AtomicU64,
    buffers_created: AtomicU64,
    images_created: AtomicU64,
    memory_released: AtomicU64,
    programs_built: AtomicU64,
    build_failures: AtomicU64,
    kernels_created: AtomicU64,
    kernels_run: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SimulatedStats {
        SimulatedStats {
            contexts_created: self.contexts_created.load(Ordering::Relaxed),
            queues_created: self.queues_created.load(Ordering::Relaxed),
            queues_out_of_order: self.queues_out_of_order.load(Ordering::Relaxed),
            buffers_created: self.buffers_created.load(Ordering::Relaxed),
            images_created: self.images_created.load(Ordering::Relaxed),
            memory_released: self.memory_released.load(Ordering::Relaxed),
            programs_built: self.programs_built.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            kernels_created: self.kernels_created.load(Ordering::Relaxed),
            kernels_run: self.kernels_run.load(Ordering::Relaxed),
        }
    }
}

/// Simulated platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimPlatform {
    index: usize,
}

/// Simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimDevice {
    id: u64,
    platform: usize,
    index: usize,
}

/// Simulated context.
#[derive(Debug)]
pub struct SimContext {
    id: u64,
    platform: usize,
    devices: Vec<u64>,
}

/// Simulated command queue.
#[derive(Debug)]
pub struct SimQueue {
    context: u64,
    device: u64,
}

/// Simulated buffer or image.
pub struct SimMemory {
    id: u64,
    context: u64,
    image: Option<(ImageFormat, ImageRegion)>,
    bytes: Arc<Mutex<Vec<u8>>>,
    counters: Arc<Counters>,
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        Counters::bump(&self.counters.memory_released);
    }
}

/// Simulated program.
#[derive(Debug)]
pub struct SimProgram {
    context: u64,
    signatures: HashMap<String, usize>,
}

/// Value bound to a simulated kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimArg {
    /// Memory object, by simulated id.
    Memory(u64),
    /// `size_t` scalar.
    Size(usize),
}

/// Simulated kernel.
#[derive(Debug)]
pub struct SimKernel {
    name: String,
    context: u64,
    args: Vec<Option<SimArg>>,
}

/// Record of one executed kernel range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    /// Kernel function name.
    pub kernel: String,
    /// Global work size per dimension.
    pub global_work_size: Vec<usize>,
    /// Arguments bound at dispatch time.
    pub args: Vec<SimArg>,
}

/// Arguments handed to a host-side kernel implementation.
pub struct SimInvocation<'a> {
    global_work_size: &'a [usize],
    args: &'a [SimArg],
    memory: &'a HashMap<u64, Arc<Mutex<Vec<u8>>>>,
}

impl<'a> SimInvocation<'a> {
    /// Global work size per dimension.
    pub fn global_work_size(&self) -> &[usize] {
        self.global_work_size
    }

    /// Scalar value of a `size_t` argument.
    pub fn size_arg(&self, index: usize) -> ComputeResult<usize> {
        match self.args.get(index) {
            Some(SimArg::Size(value)) => Ok(*value),
            _ => Err(ComputeError::KernelError(format!(
                "argument {} is not a size_t",
                index
            ))),
        }
    }

    /// Read a memory argument as `f32` elements.
    pub fn read_f32(&self, index: usize) -> ComputeResult<Vec<f32>> {
        let bytes = self.memory_arg(index)?.lock().clone();
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Overwrite a memory argument with `f32` elements, starting at offset 0.
    pub fn write_f32(&self, index: usize, values: &[f32]) -> ComputeResult<()> {
        let store = self.memory_arg(index)?;
        let mut bytes = store.lock();
        if values.len() * 4 > bytes.len() {
            return Err(ComputeError::KernelError(format!(
                "argument {} is too small for {} floats",
                index,
                values.len()
            )));
        }
        for (chunk, value) in bytes.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        Ok(())
    }

    fn memory_arg(&self, index: usize) -> ComputeResult<&Arc<Mutex<Vec<u8>>>> {
        match self.args.get(index) {
            Some(SimArg::Memory(id)) => self.memory.get(id).ok_or_else(|| {
                ComputeError::KernelError(format!("argument {} refers to freed memory", index))
            }),
            _ => Err(ComputeError::KernelError(format!(
                "argument {} is not a memory object",
                index
            ))),
        }
    }
}

/// Host-side implementation of a simulated kernel.
pub type SimKernelFn = Arc<dyn Fn(&SimInvocation<'_>) -> ComputeResult<()> + Send + Sync>;

/// In-memory driver with a configurable topology.
pub struct SimulatedDriver {
    topology: SimulatedTopology,
    devices: Vec<Vec<SimDevice>>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
    memory: Mutex<HashMap<u64, Weak<Mutex<Vec<u8>>>>>,
    kernels: Mutex<HashMap<String, SimKernelFn>>,
    dispatches: Mutex<Vec<DispatchRecord>>,
}

impl SimulatedDriver {
    /// Create a driver exposing `topology`.
    pub fn new(topology: SimulatedTopology) -> Self {
        // Device ids are assigned up front so they stay stable across queries.
        let mut next = 1u64;
        let devices = topology
            .platforms
            .iter()
            .enumerate()
            .map(|(platform, spec)| {
                (0..spec.devices.len())
                    .map(|index| {
                        let id = next;
                        next += 1;
                        SimDevice { id, platform, index }
                    })
                    .collect()
            })
            .collect();

        Self {
            topology,
            devices,
            next_id: AtomicU64::new(next),
            counters: Arc::new(Counters::default()),
            memory: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            dispatches: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> SimulatedStats {
        self.counters.snapshot()
    }

    /// Kernel ranges executed so far.
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().clone()
    }

    /// Register a host-side implementation for kernels named `name`.
    pub fn register_kernel<F>(&self, name: &str, f: F)
    where
        F: Fn(&SimInvocation<'_>) -> ComputeResult<()> + Send + Sync + 'static,
    {
        self.kernels.lock().insert(name.to_string(), Arc::new(f));
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn platform_spec(&self, index: usize) -> ComputeResult<&SimulatedPlatformSpec> {
        self.topology
            .platforms
            .get(index)
            .ok_or_else(|| err(format!("CL_INVALID_PLATFORM ({})", index)))
    }

    fn allocate(
        &self,
        context: &SimContext,
        size: usize,
        image: Option<(ImageFormat, ImageRegion)>,
    ) -> SimMemory {
        let id = self.next_id();
        let bytes = Arc::new(Mutex::new(vec![0u8; size]));
        let mut memory = self.memory.lock();
        memory.retain(|_, store| store.strong_count() > 0);
        memory.insert(id, Arc::downgrade(&bytes));
        drop(memory);
        SimMemory {
            id,
            context: context.id,
            image,
            bytes,
            counters: self.counters.clone(),
        }
    }
}

fn err(message: impl Into<String>) -> ComputeError {
    ComputeError::backend(BackendKind::Simulated, message)
}

fn check_same_context(queue: &SimQueue, memory: &SimMemory) -> ComputeResult<()> {
    if queue.context != memory.context {
        return Err(err("CL_INVALID_CONTEXT: queue and memory object differ"));
    }
    Ok(())
}

/// Extract `kernel` function signatures and their parameter counts.
fn parse_kernel_signatures(source: &str) -> HashMap<String, usize> {
    let mut signatures = HashMap::new();
    let mut rest = source;

    while let Some(pos) = rest.find("kernel") {
        let after = &rest[pos + "kernel".len()..];
        rest = after;

        let mut words = after.split_whitespace();
        if words.next() != Some("void") {
            continue;
        }
        let Some(open) = after.find('(') else { break };
        let Some(close) = after[open..].find(')') else { break };

        let name = after[..open]
            .trim()
            .trim_start_matches("void")
            .trim()
            .to_string();
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            continue;
        }

        let params = after[open + 1..open + close].trim();
        let count = if params.is_empty() || params == "void" {
            0
        } else {
            params.split(',').count()
        };
        signatures.insert(name, count);
        rest = &after[open + close..];
    }
    signatures
}

fn check_balanced(source: &str) -> Result<(), String> {
    let mut depth: i64 = 0;
    for c in source.chars() {
        match c {
            '{' | '(' => depth += 1,
            '}' | ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return Err("unbalanced closing delimiter".to_string());
        }
    }
    if depth != 0 {
        return Err("unterminated block".to_string());
    }
    if let Some(line) = source.lines().find(|l| l.trim_start().starts_with("#error")) {
        return Err(line.trim().to_string());
    }
    Ok(())
}

impl Driver for SimulatedDriver {
    type Platform = SimPlatform;
    type Device = SimDevice;
    type Context = SimContext;
    type Queue = SimQueue;
    type Memory = SimMemory;
    type Program = SimProgram;
    type Kernel = SimKernel;

    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn platforms(&self, max: usize) -> ComputeResult<Vec<Self::Platform>> {
        if self.topology.fail_platform_query {
            return Err(err("CL_PLATFORM_NOT_FOUND_KHR"));
        }
        Ok((0..self.topology.platforms.len().min(max))
            .map(|index| SimPlatform { index })
            .collect())
    }

    fn platform_name(&self, platform: &Self::Platform) -> ComputeResult<String> {
        Ok(self.platform_spec(platform.index)?.name.clone())
    }

    fn devices(
        &self,
        platform: &Self::Platform,
        filter: DeviceTypeFilter,
        max: usize,
    ) -> ComputeResult<Vec<Self::Device>> {
        let spec = self.platform_spec(platform.index)?;
        if spec.fail_device_query {
            return Err(err("CL_DEVICE_NOT_FOUND"));
        }
        Ok(self.devices[platform.index]
            .iter()
            .zip(&spec.devices)
            .filter(|(_, d)| filter.admits(d.class))
            .map(|(device, _)| *device)
            .take(max)
            .collect())
    }

    fn device_name(&self, device: &Self::Device) -> ComputeResult<String> {
        let spec = self.platform_spec(device.platform)?;
        spec.devices
            .get(device.index)
            .map(|d| d.name.clone())
            .ok_or_else(|| err("CL_INVALID_DEVICE"))
    }

    fn create_context(
        &self,
        platform: &Self::Platform,
        devices: &[Self::Device],
    ) -> ComputeResult<Self::Context> {
        let spec = self.platform_spec(platform.index)?;
        if devices.is_empty() {
            return Err(err("CL_INVALID_VALUE: no devices"));
        }
        if devices.iter().any(|d| d.platform != platform.index) {
            return Err(err("CL_INVALID_DEVICE: device from another platform"));
        }
        if spec.fail_context {
            return Err(err("CL_OUT_OF_RESOURCES"));
        }

        Counters::bump(&self.counters.contexts_created);
        Ok(SimContext {
            id: self.next_id(),
            platform: platform.index,
            devices: devices.iter().map(|d| d.id).collect(),
        })
    }

    fn create_queue(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        ordering: QueueOrdering,
    ) -> ComputeResult<Self::Queue> {
        if !context.devices.contains(&device.id) {
            return Err(err("CL_INVALID_DEVICE: device not in context"));
        }
        Counters::bump(&self.counters.queues_created);
        if ordering == QueueOrdering::OutOfOrder {
            Counters::bump(&self.counters.queues_out_of_order);
        }
        Ok(SimQueue {
            context: context.id,
            device: device.id,
        })
    }

    fn create_buffer(&self, context: &Self::Context, size: usize) -> ComputeResult<Self::Memory> {
        if size == 0 {
            return Err(err("CL_INVALID_BUFFER_SIZE"));
        }
        Counters::bump(&self.counters.buffers_created);
        Ok(self.allocate(context, size, None))
    }

    fn create_image(
        &self,
        context: &Self::Context,
        format: ImageFormat,
        region: ImageRegion,
    ) -> ComputeResult<Self::Memory> {
        if region.rows == 0 || region.cols == 0 {
            return Err(err("CL_INVALID_IMAGE_SIZE"));
        }
        Counters::bump(&self.counters.images_created);
        let size = region.rows * region.cols * format.texel_size();
        Ok(self.allocate(context, size, Some((format, region))))
    }

    fn write_buffer(
        &self,
        queue: &Self::Queue,
        memory: &mut Self::Memory,
        data: &[u8],
    ) -> ComputeResult<()> {
        check_same_context(queue, memory)?;
        let mut bytes = memory.bytes.lock();
        if memory.image.is_some() || data.len() > bytes.len() {
            return Err(err("CL_INVALID_VALUE: write out of bounds"));
        }
        bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        queue: &Self::Queue,
        memory: &Self::Memory,
        out: &mut [u8],
    ) -> ComputeResult<()> {
        check_same_context(queue, memory)?;
        let bytes = memory.bytes.lock();
        if memory.image.is_some() || out.len() > bytes.len() {
            return Err(err("CL_INVALID_VALUE: read out of bounds"));
        }
        out.copy_from_slice(&bytes[..out.len()]);
        Ok(())
    }

    fn write_image(
        &self,
        queue: &Self::Queue,
        memory: &mut Self::Memory,
        region: ImageRegion,
        data: &[u8],
    ) -> ComputeResult<()> {
        check_same_context(queue, memory)?;
        match memory.image {
            Some((format, extent)) if extent == region => {
                let mut bytes = memory.bytes.lock();
                if data.len() != region.rows * region.cols * format.texel_size() {
                    return Err(err("CL_INVALID_VALUE: region size"));
                }
                bytes.copy_from_slice(data);
                Ok(())
            }
            _ => Err(err("CL_INVALID_VALUE: image region")),
        }
    }

    fn read_image(
        &self,
        queue: &Self::Queue,
        memory: &Self::Memory,
        region: ImageRegion,
        out: &mut [u8],
    ) -> ComputeResult<()> {
        check_same_context(queue, memory)?;
        match memory.image {
            Some((_, extent)) if extent == region => {
                let bytes = memory.bytes.lock();
                if out.len() != bytes.len() {
                    return Err(err("CL_INVALID_VALUE: region size"));
                }
                out.copy_from_slice(&bytes);
                Ok(())
            }
            _ => Err(err("CL_INVALID_VALUE: image region")),
        }
    }

    fn build_program(
        &self,
        context: &Self::Context,
        devices: &[Self::Device],
        source: &str,
        _options: &str,
    ) -> ComputeResult<Self::Program> {
        if devices.iter().any(|d| !context.devices.contains(&d.id)) {
            return Err(err("CL_INVALID_DEVICE: device not in context"));
        }

        let spec = self.platform_spec(context.platform)?;
        let outcome = if spec.fail_build {
            Err(format!("{}: compiler unavailable", spec.name))
        } else {
            check_balanced(source)
        };

        match outcome {
            Ok(()) => {
                Counters::bump(&self.counters.programs_built);
                Ok(SimProgram {
                    context: context.id,
                    signatures: parse_kernel_signatures(source),
                })
            }
            Err(log) => {
                Counters::bump(&self.counters.build_failures);
                Err(ComputeError::build("CL_BUILD_PROGRAM_FAILURE", log))
            }
        }
    }

    fn create_kernel(&self, program: &Self::Program, name: &str) -> ComputeResult<Self::Kernel> {
        let arity = *program
            .signatures
            .get(name)
            .ok_or_else(|| err(format!("CL_INVALID_KERNEL_NAME ({})", name)))?;

        Counters::bump(&self.counters.kernels_created);
        Ok(SimKernel {
            name: name.to_string(),
            context: program.context,
            args: vec![None; arity],
        })
    }

    fn set_memory_arg(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        memory: &Self::Memory,
    ) -> ComputeResult<()> {
        if memory.context != kernel.context {
            return Err(err("CL_INVALID_MEM_OBJECT: memory from another context"));
        }
        let slot = kernel
            .args
            .get_mut(index as usize)
            .ok_or_else(|| err(format!("CL_INVALID_ARG_INDEX ({})", index)))?;
        *slot = Some(SimArg::Memory(memory.id));
        Ok(())
    }

    fn set_size_arg(&self, kernel: &mut Self::Kernel, index: u32, value: usize) -> ComputeResult<()> {
        let slot = kernel
            .args
            .get_mut(index as usize)
            .ok_or_else(|| err(format!("CL_INVALID_ARG_INDEX ({})", index)))?;
        *slot = Some(SimArg::Size(value));
        Ok(())
    }

    fn run_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global_work_size: &[usize],
    ) -> ComputeResult<()> {
        if queue.context != kernel.context {
            return Err(err("CL_INVALID_CONTEXT: queue and kernel differ"));
        }
        if global_work_size.is_empty() || global_work_size.len() > 3 {
            return Err(err("CL_INVALID_WORK_DIMENSION"));
        }
        let args: Vec<SimArg> = kernel
            .args
            .iter()
            .copied()
            .collect::<Option<_>>()
            .ok_or_else(|| err("CL_INVALID_KERNEL_ARGS"))?;

        let host_fn = self.kernels.lock().get(&kernel.name).cloned();
        if let Some(f) = host_fn {
            let memory: HashMap<u64, Arc<Mutex<Vec<u8>>>> = self
                .memory
                .lock()
                .iter()
                .filter_map(|(id, weak)| weak.upgrade().map(|store| (*id, store)))
                .collect();
            f(&SimInvocation {
                global_work_size,
                args: &args,
                memory: &memory,
            })?;
        }

        tracing::trace!(kernel = %kernel.name, device = queue.device, "simulated dispatch");
        Counters::bump(&self.counters.kernels_run);
        self.dispatches.lock().push(DispatchRecord {
            kernel: kernel.name.clone(),
            global_work_size: global_work_size.to_vec(),
            args,
        });
        Ok(())
    }
}
