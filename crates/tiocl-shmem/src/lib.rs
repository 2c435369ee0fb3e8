//! Shared-memory transport between the host runtime and device compute cores.
//!
//! Device memory is addressed with absolute `u64` device addresses. The host moves bytes through
//! a [`SharedMemory`] implementation and carves device addresses out of it with a [`Heap`].
#![forbid(unsafe_code)]

mod dram;
mod error;
mod heap;
mod transport;

pub use dram::DeviceMemory;
pub use error::{HeapError, HeapResult, TransportError, TransportResult};
pub use heap::{Heap, HeapStats};
pub use transport::{MapMode, MappedRegion, SharedMemory};

/// Absolute address in the device's view of shared memory.
pub type DevicePtr = u64;

/// Default physical base of the shared DDR window as seen by the compute cores.
pub const DEFAULT_DEVICE_BASE: DevicePtr = 0x8000_0000;
