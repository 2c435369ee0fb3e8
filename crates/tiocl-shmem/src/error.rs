use crate::DevicePtr;
use thiserror::Error;

/// Errors returned by [`crate::SharedMemory`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The requested range is not inside the shared window.
    #[error("device access out of range: addr=0x{addr:x} len={len} window=0x{base:x}+0x{size:x}")]
    OutOfRange {
        addr: DevicePtr,
        len: usize,
        base: DevicePtr,
        size: u64,
    },
    /// The window size cannot be represented by this host's `usize`.
    #[error("device window size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },
    /// The chosen backing chunk size is invalid (e.g. zero).
    #[error("invalid device memory chunk size {chunk_size}")]
    InvalidChunkSize { chunk_size: usize },
    /// `unmap` was handed a region that this transport never mapped, or already unmapped.
    #[error("region at 0x{addr:x} is not mapped")]
    NotMapped { addr: DevicePtr },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors returned by [`crate::Heap`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("out of device memory: requested {requested} bytes, largest free block is {largest_free}")]
    OutOfMemory { requested: u64, largest_free: u64 },
    #[error("0x{addr:x} is not the start of a live allocation")]
    UnknownAllocation { addr: DevicePtr },
    #[error("heap alignment {align} is not a power of two")]
    BadAlignment { align: u64 },
}

pub type HeapResult<T> = Result<T, HeapError>;
