//! The platform: configuration, device memory, devices, and the handle tables of every API
//! object. Everything is torn down by [`Platform::shutdown`] or on drop.

mod enqueue;
mod events;
mod objects;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tiocl_devmgr::{BinaryLoader, BringUpError, KernelLibrary, MonitorImage, MonitorImageLoader};
use tiocl_shmem::{DeviceMemory, Heap, HeapError, SharedMemory, TransportError};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, PlatformConfig, HEAP_ALIGN};
use crate::context::Context;
use crate::device::{
    CustomDevice, Device, DeviceId, DeviceInfo, DeviceKind, Partition, RootDevice, SubDevice,
};
use crate::event::{Clock, Event};
use crate::flags::DeviceType;
use crate::handle::{DeviceHandle, EventHandle, HandleTable};
use crate::kernel::Kernel;
use crate::memobj::MemObject;
use crate::program::{Compiler, LibraryCompiler, Program};
use crate::queue::{CommandQueue, QueueWorker};
use crate::{ClError, ClResult};

pub use objects::{ContextInfo, KernelInfo, MemInfo, ProgramInfo, QueueInfo};

#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("device memory: {0}")]
    Memory(#[from] TransportError),
    #[error("device heap: {0}")]
    Heap(#[from] HeapError),
    #[error("device {device} failed to come up")]
    BringUp {
        device: u8,
        #[source]
        source: BringUpError,
    },
    #[error("could not start {what} worker")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Everything [`Platform::try_open`] needs.
#[derive(Clone)]
pub struct PlatformOptions {
    pub config: PlatformConfig,
    /// Kernels of the custom device, if it is enabled.
    pub builtin_kernels: KernelLibrary,
    pub compiler: Option<Arc<dyn Compiler>>,
    pub loader: Arc<dyn BinaryLoader>,
    pub monitor_image: Vec<u8>,
}

impl PlatformOptions {
    pub fn new(config: PlatformConfig) -> Self {
        Self {
            config,
            builtin_kernels: KernelLibrary::new(),
            compiler: Some(Arc::new(LibraryCompiler::default())),
            loader: Arc::new(MonitorImageLoader),
            monitor_image: MonitorImage::stock(),
        }
    }

    /// Source programs resolve their kernels against `library`.
    pub fn with_kernels(mut self, library: KernelLibrary) -> Self {
        self.compiler = Some(Arc::new(LibraryCompiler::new(library)));
        self
    }

    /// Enables the custom device with these built-in kernels.
    pub fn with_builtin_kernels(mut self, library: KernelLibrary) -> Self {
        self.builtin_kernels = library;
        self.config.custom_device = true;
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn without_compiler(mut self) -> Self {
        self.compiler = None;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn BinaryLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_monitor_image(mut self, image: Vec<u8>) -> Self {
        self.monitor_image = image;
        self
    }
}

impl Default for PlatformOptions {
    fn default() -> Self {
        Self::new(PlatformConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub profile: String,
}

pub struct Platform {
    config: PlatformConfig,
    clock: Clock,
    memory: Arc<dyn SharedMemory>,
    heap: Arc<Mutex<Heap>>,
    compiler: Option<Arc<dyn Compiler>>,
    devices: HandleTable<dyn Device>,
    /// Root and custom devices, in enumeration order.
    roots: Vec<DeviceHandle>,
    next_device_id: AtomicU32,
    contexts: HandleTable<Context>,
    queues: HandleTable<CommandQueue>,
    events: HandleTable<Event>,
    mems: HandleTable<MemObject>,
    programs: HandleTable<Program>,
    kernels: HandleTable<Kernel>,
    workers: Mutex<Vec<QueueWorker>>,
    next_map_id: AtomicU64,
    closed: AtomicBool,
}

impl Platform {
    /// Opens the platform, aborting the process if any device fails to come up.
    pub fn open(options: PlatformOptions) -> Self {
        match Self::try_open(options) {
            Ok(platform) => platform,
            Err(err) => {
                error!(%err, source = ?std::error::Error::source(&err), "platform bring-up failed");
                std::process::abort();
            }
        }
    }

    pub fn try_open(options: PlatformOptions) -> Result<Self, OpenError> {
        let PlatformOptions {
            config,
            builtin_kernels,
            compiler,
            loader,
            monitor_image,
        } = options;
        config.validate()?;
        if config.debug {
            info!(?config, "opening platform");
        } else {
            debug!(?config, "opening platform");
        }

        let memory: Arc<dyn SharedMemory> = Arc::new(DeviceMemory::new(
            config.device_memory_base,
            config.device_memory_bytes,
        )?);
        let heap = Heap::new(config.heap_base(), config.heap_bytes(), HEAP_ALIGN)?;

        let devices: HandleTable<dyn Device> = HandleTable::new(ClError::InvalidDevice);
        let mut roots = Vec::new();
        for index in 0..config.devices {
            let root = RootDevice::start(
                DeviceId(u32::from(index)),
                index,
                &config,
                Arc::clone(&memory),
                Arc::clone(&loader),
                monitor_image.clone(),
            )?;
            roots.push(devices.insert_pinned(Arc::new(root)));
        }
        let mut next_id = u32::from(config.devices);
        if config.custom_device {
            let custom = CustomDevice::start(
                DeviceId(next_id),
                builtin_kernels,
                Arc::clone(&memory),
                config.heap_bytes(),
            )?;
            roots.push(devices.insert_pinned(Arc::new(custom)));
            next_id += 1;
        }
        info!(devices = roots.len(), heap = config.heap_bytes(), "platform open");

        Ok(Self {
            config,
            clock: Clock::new(),
            memory,
            heap: Arc::new(Mutex::new(heap)),
            compiler,
            devices,
            roots,
            next_device_id: AtomicU32::new(next_id),
            contexts: HandleTable::new(ClError::InvalidContext),
            queues: HandleTable::new(ClError::InvalidCommandQueue),
            events: HandleTable::new(ClError::InvalidEvent),
            mems: HandleTable::new(ClError::InvalidMemObject),
            programs: HandleTable::new(ClError::InvalidProgram),
            kernels: HandleTable::new(ClError::InvalidKernel),
            workers: Mutex::new(Vec::new()),
            next_map_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn info(&self) -> PlatformInfo {
        PlatformInfo {
            name: "tiocl".to_string(),
            vendor: "tiocl".to_string(),
            version: format!("OpenCL 1.2 tiocl {}", env!("CARGO_PKG_VERSION")),
            profile: "FULL_PROFILE".to_string(),
        }
    }

    /// Stops every queue worker, then every device, then drops all objects. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            worker.shutdown();
        }
        for handle in &self.roots {
            if let Ok(device) = self.devices.get(*handle) {
                device.shutdown();
            }
        }
        self.kernels.drain();
        self.programs.drain();
        self.queues.drain();
        self.events.drain();
        self.mems.drain();
        self.contexts.drain();
        self.devices.drain();
        info!("platform closed");
    }

    fn check_open(&self) -> ClResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ClError::InvalidPlatform)
        } else {
            Ok(())
        }
    }

    pub(crate) fn register_event(&self, event: Arc<Event>) -> EventHandle {
        self.events.insert(event)
    }

    /// Root and custom devices whose type matches `device_type`.
    pub fn device_ids(&self, device_type: DeviceType) -> ClResult<Vec<DeviceHandle>> {
        self.check_open()?;
        if device_type.is_empty() {
            return Err(ClError::InvalidDeviceType);
        }
        let found: Vec<DeviceHandle> = self
            .roots
            .iter()
            .copied()
            .filter(|h| {
                self.devices
                    .get(*h)
                    .is_ok_and(|d| d.info().device_type.intersects(device_type))
            })
            .collect();
        if found.is_empty() {
            return Err(ClError::DeviceNotFound);
        }
        Ok(found)
    }

    pub fn device_info(&self, device: DeviceHandle) -> ClResult<DeviceInfo> {
        Ok(self.devices.get(device)?.info())
    }

    pub fn device(&self, device: DeviceHandle) -> ClResult<Arc<dyn Device>> {
        self.devices.get(device)
    }

    /// Splits `device`'s compute units into sub-devices.
    pub fn create_sub_devices(
        &self,
        device: DeviceHandle,
        partition: &Partition,
    ) -> ClResult<Vec<DeviceHandle>> {
        let parent = self.devices.get(device)?;
        let units = parent.compute_units();
        if parent.kind() == DeviceKind::Custom || units.len() < 2 {
            return Err(ClError::InvalidValue);
        }
        let groups = partition
            .split(&units)
            .ok_or(ClError::InvalidDevicePartitionCount)?;
        let handles = groups
            .into_iter()
            .map(|group| {
                let id = DeviceId(self.next_device_id.fetch_add(1, Ordering::Relaxed));
                let sub = SubDevice::new(id, Arc::clone(&parent), group, partition.clone());
                debug!(parent = %parent.id(), sub = %id, units = ?sub.compute_units(), "sub-device");
                self.devices.insert(Arc::new(sub))
            })
            .collect();
        Ok(handles)
    }

    /// No-op for root devices.
    pub fn retain_device(&self, device: DeviceHandle) -> ClResult<()> {
        self.devices.retain(device)
    }

    /// No-op for root devices.
    pub fn release_device(&self, device: DeviceHandle) -> ClResult<()> {
        self.devices.release(device).map(drop)
    }

    pub fn device_reference_count(&self, device: DeviceHandle) -> ClResult<u32> {
        self.devices.refcount(device)
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("devices", &self.roots)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn prune_finished(workers: &mut Vec<QueueWorker>) {
    let (done, live): (Vec<_>, Vec<_>) = workers.drain(..).partition(QueueWorker::is_finished);
    *workers = live;
    for worker in done {
        worker.shutdown();
    }
    if !workers.is_empty() && workers.len() % 64 == 0 {
        warn!(queues = workers.len(), "many live command queues");
    }
}
