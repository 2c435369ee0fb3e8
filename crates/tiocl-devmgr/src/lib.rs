//! Device manager for a set of compute cores.
//!
//! A [`DeviceManager`] takes its cores through reset → load → run. Each running core is a thread
//! executing the monitor loop: it pulls [`tiocl_mbox::HostMessage`]s from its mailbox, runs
//! kernels from the shared [`KernelTable`] against device memory, and replies with a work index
//! and return code.
#![forbid(unsafe_code)]

mod error;
pub mod image;
pub mod kernel;
mod manager;
mod monitor;

pub use error::{BringUpError, LoadError};
pub use image::{BinaryLoader, LoadedImage, MonitorImage, MonitorImageLoader, Segment};
pub use kernel::{
    retcode, BufferArg, KernelContext, KernelFault, KernelFn, KernelLibrary, KernelTable,
};
pub use manager::{CoreState, DeviceManager, DeviceManagerConfig};
pub use monitor::MonitorEnv;
