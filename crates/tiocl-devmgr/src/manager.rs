use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tiocl_mbox::{CoreMessage, HostMessage, Mailbox, MailboxError};
use tiocl_shmem::{DevicePtr, SharedMemory};
use tracing::{debug, info, warn};

use crate::image::{BinaryLoader, LoadedImage};
use crate::monitor::{Monitor, MonitorEnv};
use crate::BringUpError;

#[derive(Debug, Clone)]
pub struct DeviceManagerConfig {
    pub device: u8,
    /// Hardware ids of the cores this manager owns, in order. The first one is the master.
    pub cores: Vec<u8>,
    pub mailbox_bytes: usize,
    /// Start of the per-core code windows. Core `i` (by position) loads at
    /// `code_base + i * code_window`.
    pub code_base: DevicePtr,
    pub code_window: u64,
    pub handshake_timeout: Duration,
    pub poll: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Halted,
    Reset,
    Loaded,
    Running,
}

struct Core {
    id: u8,
    state: CoreState,
    mailbox: Arc<Mailbox>,
    thread: Option<JoinHandle<()>>,
}

/// Owns the cores of one root device and takes them through reset → load → run.
pub struct DeviceManager {
    config: DeviceManagerConfig,
    cores: Vec<Core>,
    memory: Arc<dyn SharedMemory>,
    loader: Arc<dyn BinaryLoader>,
    monitor: Vec<u8>,
    image: Option<LoadedImage>,
    mhz: Option<u32>,
}

impl DeviceManager {
    pub fn new(
        config: DeviceManagerConfig,
        memory: Arc<dyn SharedMemory>,
        loader: Arc<dyn BinaryLoader>,
        monitor: Vec<u8>,
    ) -> Result<Self, BringUpError> {
        if config.cores.is_empty() {
            return Err(BringUpError::NoCores);
        }
        let cores = config
            .cores
            .iter()
            .map(|&id| Core {
                id,
                state: CoreState::Halted,
                mailbox: Arc::new(Mailbox::new(id, config.mailbox_bytes)),
                thread: None,
            })
            .collect();
        Ok(Self {
            config,
            cores,
            memory,
            loader,
            monitor,
            image: None,
            mhz: None,
        })
    }

    pub fn device(&self) -> u8 {
        self.config.device
    }

    pub fn core_ids(&self) -> Vec<u8> {
        self.cores.iter().map(|c| c.id).collect()
    }

    pub fn state(&self, core: u8) -> Option<CoreState> {
        self.core(core).map(|c| c.state)
    }

    pub fn mailbox(&self, core: u8) -> Option<Arc<Mailbox>> {
        self.core(core).map(|c| Arc::clone(&c.mailbox))
    }

    /// Whether `core` was started and its monitor is still servicing the mailbox.
    pub fn core_alive(&self, core: u8) -> bool {
        self.core(core)
            .is_some_and(|c| c.state == CoreState::Running && c.mailbox.core_running())
    }

    /// Clock rate reported by the master core during the handshake.
    pub fn frequency_mhz(&self) -> Option<u32> {
        self.mhz
    }

    pub fn image(&self) -> Option<&LoadedImage> {
        self.image.as_ref()
    }

    fn core(&self, core: u8) -> Option<&Core> {
        self.cores.iter().find(|c| c.id == core)
    }

    fn expect_state(&self, expected: CoreState) -> Result<(), BringUpError> {
        match self.cores.iter().find(|c| c.state != expected) {
            Some(core) => Err(BringUpError::WrongState {
                core: core.id,
                state: core.state,
                expected,
            }),
            None => Ok(()),
        }
    }

    /// Halts every core and returns it to a clean reset state.
    pub fn reset(&mut self) -> Result<(), BringUpError> {
        self.stop_cores();
        for core in &mut self.cores {
            core.mailbox.reset();
            core.state = CoreState::Reset;
        }
        self.image = None;
        self.mhz = None;
        debug!(device = self.config.device, "cores reset");
        Ok(())
    }

    /// Validates the monitor image and copies it into every core's code window.
    pub fn load(&mut self) -> Result<(), BringUpError> {
        self.expect_state(CoreState::Reset)?;
        let image = self.loader.load(&self.monitor, self.config.code_window)?;
        for (i, core) in self.cores.iter_mut().enumerate() {
            let window = self.config.code_base + i as u64 * self.config.code_window;
            for segment in &image.segments {
                self.memory
                    .write(window + segment.offset, &segment.bytes)
                    .map_err(|source| BringUpError::Transport {
                        core: core.id,
                        source,
                    })?;
            }
            core.state = CoreState::Loaded;
        }
        info!(
            device = self.config.device,
            entry = image.entry,
            bytes = image.loaded_bytes(),
            "monitor loaded"
        );
        self.image = Some(image);
        Ok(())
    }

    /// Starts the monitor on every core and waits for the master to answer the handshake.
    pub fn run(&mut self, env: MonitorEnv) -> Result<(), BringUpError> {
        self.expect_state(CoreState::Loaded)?;
        let device = self.config.device;
        for core in &mut self.cores {
            core.mailbox.set_core_running(true);
            let mailbox = Arc::clone(&core.mailbox);
            let env = env.clone();
            let spawned = thread::Builder::new()
                .name(format!("tiocl-d{device}c{}", core.id))
                .spawn(move || Monitor::new(device, mailbox, env).run());
            match spawned {
                Ok(handle) => {
                    core.thread = Some(handle);
                    core.state = CoreState::Running;
                }
                Err(source) => {
                    core.mailbox.set_core_running(false);
                    return Err(BringUpError::Spawn {
                        core: core.id,
                        source,
                    });
                }
            }
        }

        let n_cores = self.cores.len() as u8;
        let master = &self.cores[0];
        for core in &self.cores {
            core.mailbox
                .post(&HostMessage::configure(n_cores, master.id))?;
        }
        master.mailbox.post(&HostMessage::QueryFrequency)?;

        let deadline = Instant::now() + self.config.handshake_timeout;
        let mhz = loop {
            match master.mailbox.take_reply()? {
                Some(CoreMessage::Frequency { mhz, .. }) => break mhz,
                Some(CoreMessage::Error { message, .. }) => {
                    warn!(device, core = master.id, %message, "monitor rejected handshake")
                }
                Some(other) => debug!(device, ?other, "ignoring early reply"),
                None if Instant::now() >= deadline => {
                    return Err(BringUpError::NoResponse { core: master.id });
                }
                None => thread::sleep(self.config.poll),
            }
        };
        self.mhz = Some(mhz);
        info!(device, cores = n_cores, mhz, "compute cores running");
        Ok(())
    }

    /// reset → load → run.
    pub fn bring_up(&mut self, env: MonitorEnv) -> Result<(), BringUpError> {
        self.reset()?;
        self.load()?;
        self.run(env)
    }

    /// Stops every core. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.stop_cores();
        for core in &mut self.cores {
            core.state = CoreState::Halted;
        }
    }

    fn stop_cores(&mut self) {
        for core in &self.cores {
            if core.thread.is_none() {
                continue;
            }
            while core.mailbox.core_running() {
                match core.mailbox.post(&HostMessage::Exit) {
                    Err(MailboxError::Full { .. }) => {
                        drain(&core.mailbox);
                        thread::sleep(self.config.poll);
                    }
                    _ => break,
                }
            }
        }
        for core in &mut self.cores {
            let Some(handle) = core.thread.take() else {
                continue;
            };
            // The monitor may block on a full reply ring until we drain it.
            while core.mailbox.core_running() {
                drain(&core.mailbox);
                thread::sleep(self.config.poll);
            }
            drain(&core.mailbox);
            if handle.join().is_err() {
                warn!(device = self.config.device, core = core.id, "core thread panicked");
            }
        }
    }
}

fn drain(mailbox: &Mailbox) {
    while let Ok(Some(msg)) = mailbox.take_reply() {
        debug!(core = mailbox.core(), ?msg, "reply drained during shutdown");
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("device", &self.config.device)
            .field("cores", &self.core_ids())
            .field("mhz", &self.mhz)
            .finish_non_exhaustive()
    }
}
