use crate::CoreState;
use thiserror::Error;
use tiocl_mbox::MailboxError;
use tiocl_shmem::TransportError;

/// Why a monitor image was rejected by a [`crate::BinaryLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("image is {len} bytes, shorter than its header")]
    TooShort { len: usize },
    #[error("bad image magic 0x{found:08x}")]
    BadMagic { found: u32 },
    #[error("unsupported image version {found}")]
    UnsupportedVersion { found: u32 },
    #[error("image has no loadable segments")]
    NoSegments,
    #[error("segment {segment} is truncated")]
    Truncated { segment: usize },
    #[error("segment {segment} (offset 0x{offset:x}, {len} bytes) does not fit the 0x{window:x}-byte code window")]
    SegmentOutOfWindow {
        segment: usize,
        offset: u64,
        len: usize,
        window: u64,
    },
    #[error("entry point 0x{entry:x} is not inside any segment")]
    EntryOutsideImage { entry: u64 },
    #[error("{0} trailing bytes after the last segment")]
    TrailingBytes(usize),
}

/// Fatal failure while taking the cores through reset → load → run.
#[derive(Debug, Error)]
pub enum BringUpError {
    #[error("device has no compute units")]
    NoCores,
    #[error("core {core} is {state:?}, expected {expected:?}")]
    WrongState {
        core: u8,
        state: CoreState,
        expected: CoreState,
    },
    #[error("monitor image rejected: {0}")]
    Load(#[from] LoadError),
    #[error("writing the monitor into core {core}'s window failed: {source}")]
    Transport {
        core: u8,
        #[source]
        source: TransportError,
    },
    #[error("failed to start core {core}: {source}")]
    Spawn {
        core: u8,
        #[source]
        source: std::io::Error,
    },
    #[error("core {core} did not answer the monitor handshake")]
    NoResponse { core: u8 },
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
}
