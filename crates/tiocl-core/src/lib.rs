//! OpenCL-style runtime for a DSP compute device.
//!
//! A [`Platform`] owns device memory, one [`RootDevice`](device::RootDevice) per configured
//! device (each a set of compute cores driven through mailboxes), an optional custom device for
//! built-in kernels, and handle tables for every API object. Commands go through a per-queue
//! scheduler worker that respects wait lists, in-order or out-of-order execution, and barriers,
//! then to the device, which reports completion back to the queue.
//!
//! ```no_run
//! use tiocl_core::{ArgValue, HostRegion, MemFlags, Platform, PlatformOptions, QueueProperties};
//! use tiocl_core::flags::DeviceType;
//!
//! # fn main() -> Result<(), tiocl_core::ClError> {
//! let platform = Platform::open(PlatformOptions::default());
//! let devices = platform.device_ids(DeviceType::ACCELERATOR)?;
//! let ctx = platform.create_context(&devices)?;
//! let queue = platform.create_command_queue(ctx, devices[0], QueueProperties::empty())?;
//! let buf = platform.create_buffer(ctx, MemFlags::READ_WRITE, 4, None)?;
//! platform.enqueue_write_buffer(queue, buf, true, 0, b"AAAA", &[])?;
//! let out = HostRegion::new(4);
//! platform.enqueue_read_buffer(queue, buf, true, 0, &out, &[])?;
//! assert_eq!(out.to_vec(), b"AAAA");
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

mod command;
pub mod config;
mod context;
pub mod device;
mod error;
pub mod event;
pub mod flags;
pub mod handle;
mod kernel;
mod memobj;
pub mod platform;
pub mod program;
mod queue;

pub use command::{HostRegion, MappedBuffer};
pub use config::{ConfigError, PlatformConfig};
pub use context::Context;
pub use device::{DeviceId, DeviceInfo, DeviceKind, Partition};
pub use error::{describe_status, ClError, ClResult};
pub use event::{CallbackTrigger, CommandType, EventInfo, EventStatus, ProfilingInfo};
pub use flags::{MapFlags, MemFlags, QueueProperties};
pub use handle::{
    ContextHandle, DeviceHandle, EventHandle, KernelHandle, MemHandle, ProgramHandle, QueueHandle,
};
pub use kernel::{ArgValue, Kernel};
pub use memobj::MemObject;
pub use platform::{
    ContextInfo, KernelInfo, MemInfo, OpenError, Platform, PlatformInfo, PlatformOptions,
    ProgramInfo, QueueInfo,
};
pub use program::{BuildInfo, BuildStatus, Compiler, LibraryCompiler};
pub use queue::CommandQueue;
