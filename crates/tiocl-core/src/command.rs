//! Work a command carries from enqueue to the device.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tiocl_devmgr::KernelFn;
use tiocl_mbox::{KernelArg, NdRange};
use tiocl_shmem::MappedRegion;

use crate::flags::MapFlags;
use crate::handle::MemHandle;
use crate::memobj::MemObject;
use crate::program::LoadedProgram;

/// Host memory a command reads into or that a mapping exposes.
///
/// Cloning shares the same bytes.
#[derive(Clone, Default)]
pub struct HostRegion(Arc<Mutex<Vec<u8>>>);

impl HostRegion {
    pub fn new(len: usize) -> Self {
        Self::from(vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<Vec<u8>> for HostRegion {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(bytes)))
    }
}

impl fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostRegion").field(&self.len()).finish()
    }
}

/// A live `enqueue_map_buffer` result.
#[derive(Debug, Clone)]
pub struct MappedBuffer {
    pub(crate) id: u64,
    pub mem: MemHandle,
    pub offset: u64,
    pub size: u64,
    pub flags: MapFlags,
    /// Host view of the mapped bytes. Valid once the map event completes.
    pub region: HostRegion,
}

pub(crate) struct Mapping {
    pub(crate) id: u64,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) flags: MapFlags,
    pub(crate) region: HostRegion,
    pub(crate) transport: Mutex<Option<MappedRegion>>,
}

pub(crate) enum LaunchArg {
    Mem(Arc<MemObject>),
    Scalar(Vec<u8>),
    Local(u64),
}

/// Kernel and arguments as they were when the launch was enqueued.
pub(crate) struct LaunchSnapshot {
    pub(crate) name: String,
    pub(crate) body: KernelFn,
    pub(crate) loaded: Arc<LoadedProgram>,
    pub(crate) ndrange: NdRange,
    pub(crate) args: Vec<LaunchArg>,
}

impl LaunchSnapshot {
    pub(crate) fn wire_args(&self) -> Vec<KernelArg> {
        self.args
            .iter()
            .map(|arg| match arg {
                LaunchArg::Mem(mem) => KernelArg::Buffer {
                    addr: mem.device_addr(),
                    size: mem.size(),
                },
                LaunchArg::Scalar(bytes) => KernelArg::Scalar(bytes.clone()),
                LaunchArg::Local(size) => KernelArg::Local { size: *size },
            })
            .collect()
    }
}

pub(crate) type NativeFn = Box<dyn FnOnce(&mut [Vec<u8>]) -> Result<(), i32> + Send>;

pub(crate) enum Command {
    ReadBuffer {
        src: Arc<MemObject>,
        offset: u64,
        dst: HostRegion,
    },
    WriteBuffer {
        dst: Arc<MemObject>,
        offset: u64,
        data: Vec<u8>,
    },
    CopyBuffer {
        src: Arc<MemObject>,
        dst: Arc<MemObject>,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    MapBuffer {
        mem: Arc<MemObject>,
        mapping: Arc<Mapping>,
    },
    UnmapMemObject {
        mem: Arc<MemObject>,
        mapping: Arc<Mapping>,
    },
    NdRange(LaunchSnapshot),
    Task(LaunchSnapshot),
    NativeKernel {
        f: NativeFn,
        mems: Vec<Arc<MemObject>>,
    },
    Marker,
    Barrier,
    WaitForEvents,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::ReadBuffer { .. } => "read_buffer",
            Command::WriteBuffer { .. } => "write_buffer",
            Command::CopyBuffer { .. } => "copy_buffer",
            Command::MapBuffer { .. } => "map_buffer",
            Command::UnmapMemObject { .. } => "unmap_mem_object",
            Command::NdRange(_) => "ndrange_kernel",
            Command::Task(_) => "task",
            Command::NativeKernel { .. } => "native_kernel",
            Command::Marker => "marker",
            Command::Barrier => "barrier",
            Command::WaitForEvents => "wait_for_events",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::NdRange(launch) | Command::Task(launch) => f
                .debug_struct(self.name())
                .field("kernel", &launch.name)
                .field("items", &launch.ndrange.total_items())
                .finish(),
            _ => f.write_str(self.name()),
        }
    }
}
