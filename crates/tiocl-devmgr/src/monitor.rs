use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tiocl_mbox::layout::{MBOX_MAGIC, MBOX_VERSION};
use tiocl_mbox::{CoreMessage, HostMessage, KernelLaunch, Mailbox, MailboxError};
use tiocl_shmem::SharedMemory;
use tracing::{debug, error, trace, warn};

use crate::kernel::{retcode, KernelContext, KernelTable};

/// What every core's monitor needs besides its mailbox.
#[derive(Clone)]
pub struct MonitorEnv {
    pub memory: Arc<dyn SharedMemory>,
    pub kernels: Arc<KernelTable>,
    pub mhz: u32,
    /// Sleep between mailbox polls while idle.
    pub poll: Duration,
}

/// Clears the running flag however the monitor exits, including a panicking kernel.
struct RunningGuard(Arc<Mailbox>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.set_core_running(false);
    }
}

pub(crate) struct Monitor {
    device: u8,
    mailbox: Arc<Mailbox>,
    env: MonitorEnv,
    n_cores: u8,
    master_core: u8,
}

impl Monitor {
    pub(crate) fn new(device: u8, mailbox: Arc<Mailbox>, env: MonitorEnv) -> Self {
        Self {
            device,
            mailbox,
            env,
            n_cores: 1,
            master_core: 0,
        }
    }

    pub(crate) fn run(mut self) {
        let core = self.mailbox.core();
        let _running = RunningGuard(Arc::clone(&self.mailbox));
        let _span = tracing::debug_span!("core", device = self.device, core).entered();
        debug!("monitor started");

        loop {
            let msg = match self.mailbox.next_command() {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    thread::sleep(self.env.poll);
                    continue;
                }
                Err(MailboxError::Decode { source, .. }) => {
                    warn!(%source, "undecodable host message");
                    self.send(CoreMessage::Error {
                        core,
                        message: source.to_string(),
                    });
                    continue;
                }
                Err(err) => {
                    error!(%err, "mailbox unusable, halting core");
                    return;
                }
            };

            match msg {
                HostMessage::Exit => {
                    self.send(CoreMessage::ExitAck { core });
                    debug!("monitor exiting");
                    return;
                }
                HostMessage::ConfigureMonitor {
                    magic,
                    version,
                    n_cores,
                    master_core,
                } => {
                    if magic != MBOX_MAGIC || version != MBOX_VERSION {
                        self.send(CoreMessage::Error {
                            core,
                            message: format!("protocol mismatch: magic 0x{magic:08x} version {version}"),
                        });
                        continue;
                    }
                    self.n_cores = n_cores;
                    self.master_core = master_core;
                    trace!(n_cores, master_core, "monitor configured");
                }
                HostMessage::QueryFrequency => self.send(CoreMessage::Frequency {
                    core,
                    mhz: self.env.mhz,
                }),
                HostMessage::CacheInvalidate => trace!("cache invalidate"),
                HostMessage::NdrKernel(launch) | HostMessage::Task(launch) => {
                    if !self.execute(&launch) {
                        return;
                    }
                }
            }
        }
    }

    /// Runs this core's share of `launch`. Returns `false` if the core must go silent.
    fn execute(&self, launch: &KernelLaunch) -> bool {
        let core = self.mailbox.core();
        let Some((name, body)) = self.env.kernels.lookup(launch.entry) else {
            warn!(entry = launch.entry, "launch of unknown kernel entry");
            self.send(CoreMessage::Complete {
                core,
                work_idx: launch.work_idx,
                retcode: retcode::INVALID_KERNEL,
                elapsed_ns: 0,
            });
            return true;
        };

        let items = launch
            .ndrange
            .share(usize::from(launch.part), usize::from(launch.parts));
        let ctx = KernelContext::new(
            core,
            &launch.ndrange,
            items,
            &launch.args,
            &*self.env.memory,
        );
        let start = Instant::now();
        let result = body(&ctx);
        let elapsed_ns = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);

        for message in ctx.take_prints() {
            self.send(CoreMessage::Print { core, message });
        }

        let retcode = match result {
            Ok(()) => retcode::SUCCESS,
            Err(fault) => match fault.retcode() {
                Some(code) => {
                    debug!(kernel = %name, work_idx = launch.work_idx, %fault, "kernel failed");
                    code
                }
                None => {
                    error!(kernel = %name, work_idx = launch.work_idx, "core wedged in kernel");
                    return false;
                }
            },
        };
        trace!(
            kernel = %name,
            work_idx = launch.work_idx,
            retcode,
            elapsed_ns,
            master = core == self.master_core,
            n_cores = self.n_cores,
            "kernel share done"
        );
        self.send(CoreMessage::Complete {
            core,
            work_idx: launch.work_idx,
            retcode,
            elapsed_ns,
        });
        true
    }

    fn send(&self, msg: CoreMessage) {
        loop {
            match self.mailbox.reply(&msg) {
                Ok(()) => return,
                Err(MailboxError::Full { .. }) => thread::sleep(self.env.poll),
                Err(err) => {
                    warn!(%err, "dropping reply");
                    return;
                }
            }
        }
    }
}
