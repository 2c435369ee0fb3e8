//! Devices: where ready commands go once their wait lists are complete.
//!
//! [`RootDevice`] drives a set of compute cores through their mailboxes, [`SubDevice`] is a
//! partition of another device, and [`CustomDevice`] runs fixed-function built-in kernels on a
//! host worker.

mod custom;
mod exec;
mod pending;
mod root;
mod scheduler;
mod sub;

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tiocl_devmgr::{KernelFn, KernelTable};
use tiocl_mbox::{CoreMessage, HostMessage};

use crate::command::Command;
use crate::event::Event;
use crate::flags::{DeviceType, ExecCapabilities};
use crate::queue::QueueWaker;
use crate::ClResult;

pub use custom::CustomDevice;
pub(crate) use pending::CompletePending;
pub use root::RootDevice;
pub(crate) use scheduler::CoreScheduler;
pub use sub::SubDevice;

/// Hardware ids of compute cores.
pub type CoreSet = BTreeSet<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Compute cores behind mailboxes, or a partition of them.
    Accelerator,
    /// Built-in kernels only.
    Custom,
}

impl DeviceKind {
    pub fn device_type(self) -> DeviceType {
        match self {
            DeviceKind::Accelerator => DeviceType::ACCELERATOR | DeviceType::DEFAULT,
            DeviceKind::Custom => DeviceType::CUSTOM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partition {
    /// As many sub-devices as fit, `n` compute units each.
    Equally(usize),
    /// One sub-device per entry with that many compute units.
    ByCounts(Vec<usize>),
}

impl Partition {
    /// Splits `units` into the requested groups.
    pub(crate) fn split(&self, units: &CoreSet) -> Option<Vec<CoreSet>> {
        let all: Vec<u8> = units.iter().copied().collect();
        let counts: Vec<usize> = match self {
            Partition::Equally(n) if *n > 0 && *n <= all.len() => vec![*n; all.len() / n],
            Partition::Equally(_) => return None,
            Partition::ByCounts(counts) => {
                let total = counts.iter().try_fold(0usize, |acc, c| acc.checked_add(*c));
                if counts.is_empty() || counts.contains(&0) || total.map_or(true, |t| t > all.len())
                {
                    return None;
                }
                counts.clone()
            }
        };
        let mut rest = all.as_slice();
        let mut groups = Vec::with_capacity(counts.len());
        for count in counts {
            let (group, tail) = rest.split_at(count);
            groups.push(group.iter().copied().collect());
            rest = tail;
        }
        Some(groups)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub device_type: DeviceType,
    pub available: bool,
    pub compute_units: Vec<u8>,
    pub max_clock_mhz: u32,
    pub global_mem_size: u64,
    pub max_mem_alloc_size: u64,
    pub max_work_group_size: u64,
    pub max_work_item_dimensions: u32,
    pub execution_capabilities: ExecCapabilities,
    pub built_in_kernels: Vec<String>,
    /// Parent device and how it was split, for sub-devices.
    pub parent: Option<DeviceId>,
    pub partition: Option<Partition>,
}

/// A ready command on its way through a device.
pub struct DeviceWork {
    pub(crate) event: Arc<Event>,
    pub(crate) command: Command,
    /// Compute units of the device the command was submitted to.
    pub(crate) units: CoreSet,
    pub(crate) out_of_order: bool,
    reply: QueueWaker,
}

impl DeviceWork {
    pub(crate) fn new(
        event: Arc<Event>,
        command: Command,
        units: CoreSet,
        out_of_order: bool,
        reply: QueueWaker,
    ) -> Self {
        Self {
            event,
            command,
            units,
            out_of_order,
            reply,
        }
    }

    pub fn event_id(&self) -> u64 {
        self.event.id()
    }

    /// The device accepted the command.
    pub(crate) fn running(&self) {
        self.reply.running(Arc::clone(&self.event));
    }

    pub(crate) fn complete(self, result: Result<(), i32>) {
        self.reply.completed(self.event, result);
    }
}

impl fmt::Debug for DeviceWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceWork")
            .field("event", &self.event.id())
            .field("command", &self.command)
            .field("units", &self.units)
            .finish()
    }
}

/// Blocking FIFO of ready work in front of a device's dispatch worker.
#[derive(Default)]
pub(crate) struct WorkQueue {
    inner: Mutex<WorkQueueState>,
    ready: Condvar,
}

#[derive(Default)]
struct WorkQueueState {
    items: VecDeque<DeviceWork>,
    stopping: bool,
}

impl WorkQueue {
    fn lock(&self) -> MutexGuard<'_, WorkQueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, work: DeviceWork) {
        self.lock().items.push_back(work);
        self.ready.notify_one();
    }

    /// Next item, blocking while empty. `None` once stopping.
    pub(crate) fn pop(&self) -> Option<DeviceWork> {
        let mut state = self.lock();
        loop {
            if state.stopping {
                return None;
            }
            if let Some(work) = state.items.pop_front() {
                return Some(work);
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub(crate) fn drain(&self) -> Vec<DeviceWork> {
        self.lock().items.drain(..).collect()
    }

    /// Wakes the worker and makes every later `pop` return `None`. Returns what was queued.
    pub(crate) fn stop(&self) -> Vec<DeviceWork> {
        let items = {
            let mut state = self.lock();
            state.stopping = true;
            state.items.drain(..).collect()
        };
        self.ready.notify_all();
        items
    }
}

/// A compute resource commands can be submitted to.
pub trait Device: Send + Sync + fmt::Debug {
    fn id(&self) -> DeviceId;

    fn info(&self) -> DeviceInfo;

    fn kind(&self) -> DeviceKind;

    fn compute_units(&self) -> CoreSet;

    /// The root device this one belongs to (itself for root devices).
    fn root(&self) -> DeviceId;

    fn is_available(&self) -> bool;

    /// Hands a ready command to the device's internal work queue.
    fn push_event(&self, work: DeviceWork) -> ClResult<()>;

    /// Next command for the dispatch worker; blocks, `None` once stopping.
    fn get_event(&self) -> Option<DeviceWork>;

    /// Whether the device already has enough queued to keep its units busy.
    fn got_enough_to_work_on(&self) -> bool;

    /// Parks `work` until `count` completions for `idx` have arrived.
    fn push_complete_pending(&self, idx: u32, work: DeviceWork, count: usize);

    /// Records one completion for `idx`. Returns the work and its combined status once the last
    /// one is in.
    fn get_complete_pending(&self, idx: u32, retcode: i32) -> Option<(DeviceWork, i32)>;

    fn num_complete_pending(&self) -> usize;

    /// Posts `msg` to every unit in `units`.
    fn mail_to(&self, msg: &HostMessage, units: &CoreSet) -> ClResult<()>;

    /// First available reply from any of `units`.
    fn mail_from(&self, units: &CoreSet) -> ClResult<Option<CoreMessage>>;

    /// Whether any of `units` has a reply waiting.
    fn mail_query(&self, units: &CoreSet) -> bool;

    fn builtin_kernels(&self) -> Vec<String> {
        Vec::new()
    }

    fn builtin_kernel(&self, _name: &str) -> Option<(KernelFn, Option<u32>)> {
        None
    }

    /// Table compiled kernels are registered in, for devices that run them.
    fn kernel_table(&self) -> Option<Arc<KernelTable>>;

    /// Stops the device's workers. Pending work fails with `DeviceNotAvailable`.
    fn shutdown(&self);
}
