use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tiocl_devmgr::{retcode, KernelContext, KernelFn, KernelLibrary, KernelTable};
use tiocl_mbox::{CoreMessage, HostMessage};
use tiocl_shmem::SharedMemory;
use tracing::{debug, info, warn};

use super::exec::run_host;
use super::{CompletePending, CoreSet, Device, DeviceId, DeviceInfo, DeviceKind, DeviceWork, WorkQueue};
use crate::command::Command;
use crate::flags::ExecCapabilities;
use crate::platform::OpenError;
use crate::{ClError, ClResult};

/// The custom device's single unit.
const UNIT: u8 = 0;

struct CustomShared {
    id: DeviceId,
    builtins: KernelLibrary,
    memory: Arc<dyn SharedMemory>,
    work: WorkQueue,
    pending: CompletePending,
    stopping: AtomicBool,
    info: DeviceInfo,
}

/// Fixed-function device: built-in kernels only, executed on a host worker.
pub struct CustomDevice {
    shared: Arc<CustomShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CustomDevice {
    pub(crate) fn start(
        id: DeviceId,
        builtins: KernelLibrary,
        memory: Arc<dyn SharedMemory>,
        global_mem_size: u64,
    ) -> Result<Self, OpenError> {
        let info = DeviceInfo {
            id,
            name: "tiocl custom device".to_string(),
            vendor: "tiocl".to_string(),
            version: "OpenCL 1.2 tiocl".to_string(),
            device_type: DeviceKind::Custom.device_type(),
            available: true,
            compute_units: vec![UNIT],
            max_clock_mhz: 0,
            global_mem_size,
            max_mem_alloc_size: global_mem_size / 4,
            max_work_group_size: 1024,
            max_work_item_dimensions: 3,
            execution_capabilities: ExecCapabilities::KERNEL,
            built_in_kernels: builtins.names().map(str::to_string).collect(),
            parent: None,
            partition: None,
        };
        let shared = Arc::new(CustomShared {
            id,
            builtins,
            memory,
            work: WorkQueue::default(),
            pending: CompletePending::default(),
            stopping: AtomicBool::new(false),
            info,
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("tiocl-{id}-custom"))
            .spawn(move || worker.run())
            .map_err(|source| OpenError::Spawn {
                what: "custom device",
                source,
            })?;
        info!(device = %id, kernels = ?shared.info.built_in_kernels, "custom device ready");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl CustomShared {
    fn run(self: Arc<Self>) {
        let _span = tracing::debug_span!("custom", device = %self.id).entered();
        while let Some(mut work) = self.work.pop() {
            work.running();
            let body = match &work.command {
                Command::NdRange(launch) | Command::Task(launch) => Some((
                    Arc::clone(&launch.body),
                    launch.name.clone(),
                    launch.ndrange,
                    launch.wire_args(),
                )),
                _ => None,
            };
            let Some((body, name, ndrange, args)) = body else {
                let command = std::mem::replace(&mut work.command, Command::Marker);
                let result = run_host(&*self.memory, command);
                work.complete(result);
                continue;
            };
            let idx = self.pending.next_idx();
            self.pending.push(idx, work, 1);
            let rc = self.execute(&body, &name, &ndrange, &args);
            if let Some((work, status)) = self.pending.complete_one(idx, rc) {
                work.complete(if status == 0 { Ok(()) } else { Err(status) });
            }
        }
        debug!("custom device worker stopped");
    }

    fn execute(
        &self,
        body: &KernelFn,
        name: &str,
        ndrange: &tiocl_mbox::NdRange,
        args: &[tiocl_mbox::KernelArg],
    ) -> i32 {
        let ctx = KernelContext::new(UNIT, ndrange, 0..ndrange.total_items(), args, &*self.memory);
        let result = body(&ctx);
        for message in ctx.take_prints() {
            info!(target: "tiocl::printf", device = %self.id, "{message}");
        }
        match result {
            Ok(()) => retcode::SUCCESS,
            Err(fault) => {
                debug!(kernel = name, %fault, "built-in kernel failed");
                fault.retcode().unwrap_or(retcode::OUT_OF_RESOURCES)
            }
        }
    }
}

impl Device for CustomDevice {
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
        DeviceKind::Custom
    }

    fn compute_units(&self) -> CoreSet {
        CoreSet::from([UNIT])
    }

    fn root(&self) -> DeviceId {
        self.shared.id
    }

    fn is_available(&self) -> bool {
        !self.shared.stopping.load(Ordering::Acquire)
    }

    fn push_event(&self, work: DeviceWork) -> ClResult<()> {
        if !self.is_available() {
            return Err(ClError::DeviceNotAvailable);
        }
        self.shared.work.push(work);
        Ok(())
    }

    fn get_event(&self) -> Option<DeviceWork> {
        self.shared.work.pop()
    }

    fn got_enough_to_work_on(&self) -> bool {
        self.shared.work.len() > 0
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

    fn mail_to(&self, _msg: &HostMessage, _units: &CoreSet) -> ClResult<()> {
        Err(ClError::InvalidOperation)
    }

    fn mail_from(&self, _units: &CoreSet) -> ClResult<Option<CoreMessage>> {
        Err(ClError::InvalidOperation)
    }

    fn mail_query(&self, _units: &CoreSet) -> bool {
        false
    }

    fn builtin_kernels(&self) -> Vec<String> {
        self.shared.info.built_in_kernels.clone()
    }

    fn builtin_kernel(&self, name: &str) -> Option<(KernelFn, Option<u32>)> {
        let body = self.shared.builtins.get(name)?;
        Some((body, self.shared.builtins.arity(name)))
    }

    fn kernel_table(&self) -> Option<Arc<KernelTable>> {
        None
    }

    fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for work in self.shared.work.stop() {
            work.complete(Err(ClError::DeviceNotAvailable.code()));
        }
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = thread {
            if handle.join().is_err() {
                warn!(device = %self.shared.id, "custom device worker panicked");
            }
        }
    }
}

impl Drop for CustomDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for CustomDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomDevice")
            .field("id", &self.shared.id)
            .field("builtins", &self.shared.builtins)
            .finish()
    }
}
