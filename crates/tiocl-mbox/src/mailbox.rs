use crate::protocol::{decode_core, decode_host, encode_core, encode_host, DecodeError};
use crate::ring::{PopError, PushError, RingBuffer};
use crate::{CoreMessage, HostMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailboxError {
    #[error("mailbox for core {core} is full")]
    Full { core: u8 },
    #[error("{len}-byte message does not fit in the mailbox for core {core}")]
    TooLarge { core: u8, len: usize },
    #[error("corrupt record in the mailbox for core {core}")]
    Corrupt { core: u8 },
    #[error("undecodable message in the mailbox for core {core}: {source}")]
    Decode {
        core: u8,
        #[source]
        source: DecodeError,
    },
    #[error("core {core} is not running")]
    CoreStopped { core: u8 },
}

/// Both directions of the link to one compute core.
#[derive(Debug)]
pub struct Mailbox {
    core: u8,
    to_core: RingBuffer,
    to_host: RingBuffer,
    /// Serialises host-side producers on `to_core`.
    post_lock: Mutex<()>,
    core_running: AtomicBool,
}

impl Mailbox {
    pub fn new(core: u8, capacity_bytes: usize) -> Self {
        Self {
            core,
            to_core: RingBuffer::new(capacity_bytes),
            to_host: RingBuffer::new(capacity_bytes),
            post_lock: Mutex::new(()),
            core_running: AtomicBool::new(false),
        }
    }

    pub fn core(&self) -> u8 {
        self.core
    }

    pub fn core_running(&self) -> bool {
        self.core_running.load(Ordering::Acquire)
    }

    pub fn set_core_running(&self, running: bool) {
        self.core_running.store(running, Ordering::Release);
    }

    /// Drops anything left in either direction. The core must be held in reset.
    pub fn reset(&self) {
        self.to_core.clear();
        self.to_host.clear();
    }

    /// Host side: queue a message for the core.
    pub fn post(&self, msg: &HostMessage) -> Result<(), MailboxError> {
        if !self.core_running() {
            return Err(MailboxError::CoreStopped { core: self.core });
        }
        let bytes = encode_host(msg);
        let _guard = self.post_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.to_core.try_push(&bytes).map_err(|e| self.push_error(e, bytes.len()))
    }

    /// Host side: whether a reply is waiting.
    pub fn has_reply(&self) -> bool {
        !self.to_host.is_empty()
    }

    /// Host side: next reply from the core, if any.
    pub fn take_reply(&self) -> Result<Option<CoreMessage>, MailboxError> {
        match self.to_host.try_pop() {
            Ok(bytes) => decode_core(&bytes)
                .map(Some)
                .map_err(|source| MailboxError::Decode {
                    core: self.core,
                    source,
                }),
            Err(PopError::Empty) => Ok(None),
            Err(PopError::Corrupt) => Err(MailboxError::Corrupt { core: self.core }),
        }
    }

    /// Core side: next message from the host, if any.
    pub fn next_command(&self) -> Result<Option<HostMessage>, MailboxError> {
        match self.to_core.try_pop() {
            Ok(bytes) => decode_host(&bytes)
                .map(Some)
                .map_err(|source| MailboxError::Decode {
                    core: self.core,
                    source,
                }),
            Err(PopError::Empty) => Ok(None),
            Err(PopError::Corrupt) => Err(MailboxError::Corrupt { core: self.core }),
        }
    }

    /// Core side: queue a reply for the host.
    pub fn reply(&self, msg: &CoreMessage) -> Result<(), MailboxError> {
        let bytes = encode_core(msg);
        self.to_host.try_push(&bytes).map_err(|e| self.push_error(e, bytes.len()))
    }

    fn push_error(&self, err: PushError, len: usize) -> MailboxError {
        match err {
            PushError::Full => MailboxError::Full { core: self.core },
            PushError::TooLarge => MailboxError::TooLarge {
                core: self.core,
                len,
            },
        }
    }
}
