use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tiocl_devmgr::{BinaryLoader, DeviceManager, DeviceManagerConfig, KernelTable, MonitorEnv};
use tiocl_mbox::{CoreMessage, HostMessage, KernelLaunch, Mailbox, MailboxError};
use tiocl_shmem::SharedMemory;
use tracing::{debug, error, info, trace, warn};

use super::exec::run_host;
use super::{
    CompletePending, CoreScheduler, CoreSet, Device, DeviceId, DeviceInfo, DeviceKind, DeviceWork,
    WorkQueue,
};
use crate::command::Command;
use crate::config::{PlatformConfig, CODE_WINDOW_BYTES, HANDSHAKE_TIMEOUT};
use crate::flags::ExecCapabilities;
use crate::platform::OpenError;
use crate::{ClError, ClResult};

/// How long the idle completion worker sleeps between stop checks.
const IDLE_WAIT: Duration = Duration::from_millis(20);

struct RootShared {
    id: DeviceId,
    units: CoreSet,
    mailboxes: BTreeMap<u8, Arc<Mailbox>>,
    memory: Arc<dyn SharedMemory>,
    kernels: Arc<KernelTable>,
    work: WorkQueue,
    pending: CompletePending,
    scheduler: CoreScheduler,
    lost: AtomicBool,
    stopping: AtomicBool,
    poll: Duration,
    kernel_timeout: Option<Duration>,
    info: DeviceInfo,
}

/// A device backed by compute cores.
///
/// A dispatch worker takes ready commands off the work queue: transfers run on the host, kernel
/// launches are posted to the cores' mailboxes. A completion worker collects the replies and hands
/// finished work back to the owning queue.
pub struct RootDevice {
    shared: Arc<RootShared>,
    manager: Mutex<DeviceManager>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RootDevice {
    /// Brings up the cores of device `index` and starts its workers.
    pub(crate) fn start(
        id: DeviceId,
        index: u8,
        config: &PlatformConfig,
        memory: Arc<dyn SharedMemory>,
        loader: Arc<dyn BinaryLoader>,
        monitor: Vec<u8>,
    ) -> Result<Self, OpenError> {
        let manager_config = DeviceManagerConfig {
            device: index,
            cores: config.compute_units.clone(),
            mailbox_bytes: config.mailbox_bytes,
            code_base: config.code_base(index),
            code_window: CODE_WINDOW_BYTES,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            poll: config.worker_poll,
        };
        let bring_up = |source| OpenError::BringUp {
            device: index,
            source,
        };
        let mut manager =
            DeviceManager::new(manager_config, Arc::clone(&memory), loader, monitor)
                .map_err(bring_up)?;
        let kernels = Arc::new(KernelTable::new());
        manager
            .bring_up(MonitorEnv {
                memory: Arc::clone(&memory),
                kernels: Arc::clone(&kernels),
                mhz: config.core_mhz,
                poll: config.worker_poll,
            })
            .map_err(bring_up)?;

        let mailboxes: BTreeMap<u8, Arc<Mailbox>> = manager
            .core_ids()
            .into_iter()
            .filter_map(|core| manager.mailbox(core).map(|m| (core, m)))
            .collect();
        let units: CoreSet = mailboxes.keys().copied().collect();
        let info = DeviceInfo {
            id,
            name: format!("tiocl accelerator {index}"),
            vendor: "tiocl".to_string(),
            version: "OpenCL 1.2 tiocl".to_string(),
            device_type: DeviceKind::Accelerator.device_type(),
            available: true,
            compute_units: units.iter().copied().collect(),
            max_clock_mhz: manager.frequency_mhz().unwrap_or(config.core_mhz),
            global_mem_size: config.heap_bytes(),
            max_mem_alloc_size: config.heap_bytes() / 4,
            max_work_group_size: 1024,
            max_work_item_dimensions: 3,
            execution_capabilities: ExecCapabilities::KERNEL | ExecCapabilities::NATIVE_KERNEL,
            built_in_kernels: Vec::new(),
            parent: None,
            partition: None,
        };
        let shared = Arc::new(RootShared {
            id,
            units,
            mailboxes,
            memory,
            kernels,
            work: WorkQueue::default(),
            pending: CompletePending::default(),
            scheduler: CoreScheduler::default(),
            lost: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            poll: config.worker_poll,
            kernel_timeout: config.kernel_timeout,
            info,
        });

        let device = Self {
            shared,
            manager: Mutex::new(manager),
            threads: Mutex::new(Vec::new()),
        };
        device.spawn("dispatch", RootShared::dispatch_loop)?;
        device.spawn("completion", RootShared::completion_loop)?;
        info!(device = %id, cores = ?device.shared.units, "root device ready");
        Ok(device)
    }

    fn spawn(&self, what: &'static str, body: fn(Arc<RootShared>)) -> Result<(), OpenError> {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("tiocl-{}-{what}", shared.id))
            .spawn(move || body(shared))
            .map_err(|source| {
                self.shutdown();
                OpenError::Spawn { what, source }
            })?;
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    /// Whether the core's monitor is still servicing its mailbox.
    pub fn core_alive(&self, core: u8) -> bool {
        self.shared.core_alive(core)
    }
}

impl RootShared {
    fn core_alive(&self, core: u8) -> bool {
        self.mailboxes.get(&core).is_some_and(|m| m.core_running())
    }

    fn available(&self) -> bool {
        !self.lost.load(Ordering::Acquire) && !self.stopping.load(Ordering::Acquire)
    }

    fn dispatch_loop(self: Arc<Self>) {
        let _span = tracing::debug_span!("dispatch", device = %self.id).entered();
        while let Some(work) = self.work.pop() {
            self.dispatch(work);
        }
        debug!("dispatch worker stopped");
    }

    fn dispatch(&self, mut work: DeviceWork) {
        if !self.available() {
            work.complete(Err(ClError::DeviceNotAvailable.code()));
            return;
        }
        let (launch, is_task) = match &work.command {
            Command::NdRange(launch) => (launch, false),
            Command::Task(launch) => (launch, true),
            _ => {
                work.running();
                let command = std::mem::replace(&mut work.command, Command::Marker);
                let result = run_host(&*self.memory, command);
                work.complete(result);
                return;
            }
        };

        let Some(entry) = launch.loaded.entry(self.id, &launch.name) else {
            warn!(kernel = %launch.name, "kernel not loaded on this device");
            work.complete(Err(ClError::InvalidProgramExecutable.code()));
            return;
        };
        let ndrange = launch.ndrange;
        let args = launch.wire_args();
        let name = launch.name.clone();
        let idx = self.pending.next_idx();

        let targets: Vec<u8> = if is_task && work.out_of_order {
            match self
                .scheduler
                .acquire(&work.units, idx, |core| self.core_alive(core))
            {
                Some(core) => vec![core],
                None => {
                    work.complete(Err(ClError::DeviceNotAvailable.code()));
                    self.declare_lost("no live core for task");
                    return;
                }
            }
        } else {
            work.units.iter().copied().collect()
        };
        let Ok(parts) = u8::try_from(targets.len()) else {
            warn!(kernel = %name, cores = targets.len(), "launch split over too many cores");
            work.complete(Err(ClError::OutOfResources.code()));
            return;
        };
        debug!(kernel = %name, work_idx = idx, cores = ?targets, items = ndrange.total_items(), "launch");

        work.running();
        self.pending.push(idx, work, targets.len());
        for (part, &core) in targets.iter().enumerate() {
            let launch = KernelLaunch {
                work_idx: idx,
                entry,
                part: part as u8,
                parts,
                ndrange,
                args: args.clone(),
            };
            let msg = if is_task {
                HostMessage::Task(launch)
            } else {
                HostMessage::NdrKernel(launch)
            };
            if let Err(err) = self.post(core, &msg) {
                self.declare_lost(&format!("launch on core {core} failed: {err}"));
                return;
            }
        }
        if self.lost.load(Ordering::Acquire) {
            self.fail_outstanding();
        }
    }

    fn post(&self, core: u8, msg: &HostMessage) -> Result<(), MailboxError> {
        let mailbox = self
            .mailboxes
            .get(&core)
            .ok_or(MailboxError::CoreStopped { core })?;
        loop {
            match mailbox.post(msg) {
                Err(MailboxError::Full { .. }) if self.available() => thread::sleep(self.poll),
                other => return other,
            }
        }
    }

    fn completion_loop(self: Arc<Self>) {
        let _span = tracing::debug_span!("completion", device = %self.id).entered();
        while !self.stopping.load(Ordering::Acquire) {
            let mut got = false;
            for mailbox in self.mailboxes.values() {
                loop {
                    match mailbox.take_reply() {
                        Ok(Some(msg)) => {
                            got = true;
                            self.on_reply(msg);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(%err, "bad reply");
                            break;
                        }
                    }
                }
            }
            if got {
                continue;
            }
            if self.pending.len() == 0 {
                self.pending.wait_for_work(IDLE_WAIT);
                continue;
            }
            self.check_liveness();
            thread::sleep(self.poll);
        }
        debug!("completion worker stopped");
    }

    fn on_reply(&self, msg: CoreMessage) {
        match msg {
            CoreMessage::Complete {
                core,
                work_idx,
                retcode,
                elapsed_ns,
            } => {
                trace!(core, work_idx, retcode, elapsed_ns, "core finished");
                self.scheduler.release(core, work_idx);
                if let Some((work, status)) = self.pending.complete_one(work_idx, retcode) {
                    work.complete(if status == 0 { Ok(()) } else { Err(status) });
                }
            }
            CoreMessage::Print { core, message } => {
                info!(target: "tiocl::printf", device = %self.id, core, "{message}");
            }
            CoreMessage::Error { core, message } => {
                warn!(core, %message, "core reported an error");
            }
            CoreMessage::Frequency { .. } | CoreMessage::ExitAck { .. } => {
                debug!(?msg, "unsolicited reply");
            }
        }
    }

    fn check_liveness(&self) {
        if let Some(core) = self.units.iter().copied().find(|c| !self.core_alive(*c)) {
            self.declare_lost(&format!("core {core} stopped responding"));
            return;
        }
        if let (Some(timeout), Some(age)) = (self.kernel_timeout, self.pending.oldest_age()) {
            if age > timeout {
                self.declare_lost(&format!("no reply within {timeout:?}"));
            }
        }
    }

    /// Marks the device unusable and fails everything it still holds. Logged once.
    fn declare_lost(&self, reason: &str) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            error!(device = %self.id, reason, "device lost, failing outstanding work");
        }
        self.fail_outstanding();
    }

    fn fail_outstanding(&self) {
        let code = ClError::DeviceNotAvailable.code();
        for work in self.pending.drain() {
            work.complete(Err(code));
        }
        for work in self.work.drain() {
            work.complete(Err(code));
        }
    }
}

impl Device for RootDevice {
    fn id(&self) -> DeviceId {
        self.shared.id
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            available: self.is_available(),
            ..self.shared.info.clone()
        }
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Accelerator
    }

    fn compute_units(&self) -> CoreSet {
        self.shared.units.clone()
    }

    fn root(&self) -> DeviceId {
        self.shared.id
    }

    fn is_available(&self) -> bool {
        self.shared.available()
    }

    fn push_event(&self, work: DeviceWork) -> ClResult<()> {
        if !self.shared.available() {
            return Err(ClError::DeviceNotAvailable);
        }
        self.shared.work.push(work);
        Ok(())
    }

    fn get_event(&self) -> Option<DeviceWork> {
        self.shared.work.pop()
    }

    fn got_enough_to_work_on(&self) -> bool {
        self.shared.work.len() >= self.shared.units.len()
    }

    fn push_complete_pending(&self, idx: u32, work: DeviceWork, count: usize) {
        self.shared.pending.push(idx, work, count);
    }

    fn get_complete_pending(&self, idx: u32, retcode: i32) -> Option<(DeviceWork, i32)> {
        self.shared.pending.complete_one(idx, retcode)
    }

    fn num_complete_pending(&self) -> usize {
        self.shared.pending.len()
    }

    fn mail_to(&self, msg: &HostMessage, units: &CoreSet) -> ClResult<()> {
        for &core in units {
            if !self.shared.units.contains(&core) {
                return Err(ClError::InvalidValue);
            }
            self.shared.post(core, msg).map_err(|err| {
                debug!(core, %err, "mail_to failed");
                ClError::DeviceNotAvailable
            })?;
        }
        Ok(())
    }

    fn mail_from(&self, units: &CoreSet) -> ClResult<Option<CoreMessage>> {
        for core in units {
            let mailbox = self.shared.mailboxes.get(core).ok_or(ClError::InvalidValue)?;
            if let Some(msg) = mailbox.take_reply().map_err(|_| ClError::OutOfResources)? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    fn mail_query(&self, units: &CoreSet) -> bool {
        units
            .iter()
            .filter_map(|core| self.shared.mailboxes.get(core))
            .any(|m| m.has_reply())
    }

    fn kernel_table(&self) -> Option<Arc<KernelTable>> {
        Some(Arc::clone(&self.shared.kernels))
    }

    fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let code = ClError::DeviceNotAvailable.code();
        for work in self.shared.work.stop() {
            work.complete(Err(code));
        }
        for work in self.shared.pending.drain() {
            work.complete(Err(code));
        }
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!(device = %self.shared.id, "device worker panicked");
            }
        }
        self.manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        info!(device = %self.shared.id, "root device stopped");
    }
}

impl Drop for RootDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootDevice")
            .field("id", &self.shared.id)
            .field("units", &self.shared.units)
            .field("lost", &self.shared.lost.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
