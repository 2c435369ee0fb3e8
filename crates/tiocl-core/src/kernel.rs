use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tiocl_devmgr::KernelFn;
use tiocl_mbox::NdRange;

use crate::command::{LaunchArg, LaunchSnapshot};
use crate::handle::{ContextHandle, MemHandle, ProgramHandle};
use crate::memobj::MemObject;
use crate::program::{LoadedProgram, Program};
use crate::{ClError, ClResult};

/// A value for one kernel argument slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Mem(MemHandle),
    /// Raw little-endian bytes of a by-value argument.
    Scalar(Vec<u8>),
    /// Size of a `__local` buffer.
    Local(u64),
}

impl ArgValue {
    pub fn u32(value: u32) -> Self {
        ArgValue::Scalar(value.to_le_bytes().to_vec())
    }

    pub fn i32(value: i32) -> Self {
        ArgValue::Scalar(value.to_le_bytes().to_vec())
    }

    pub fn u64(value: u64) -> Self {
        ArgValue::Scalar(value.to_le_bytes().to_vec())
    }

    pub fn f32(value: f32) -> Self {
        ArgValue::Scalar(value.to_le_bytes().to_vec())
    }
}

pub(crate) enum BoundArg {
    Mem(Arc<MemObject>),
    Scalar(Vec<u8>),
    Local(u64),
}

pub struct Kernel {
    program: Arc<Program>,
    program_handle: ProgramHandle,
    name: String,
    body: KernelFn,
    loaded: Arc<LoadedProgram>,
    args: Mutex<Vec<Option<BoundArg>>>,
}

impl Kernel {
    pub(crate) fn new(
        program: Arc<Program>,
        program_handle: ProgramHandle,
        name: &str,
    ) -> ClResult<Self> {
        let loaded = program.loaded().ok_or(ClError::InvalidProgramExecutable)?;
        let (body, arity) = loaded.kernel(name).ok_or(ClError::InvalidKernelName)?;
        let arity = arity.ok_or(ClError::InvalidKernelDefinition)?;
        program.kernel_created();
        Ok(Self {
            program,
            program_handle,
            name: name.to_string(),
            body,
            loaded,
            args: Mutex::new((0..arity).map(|_| None).collect()),
        })
    }

    fn args(&self) -> MutexGuard<'_, Vec<Option<BoundArg>>> {
        self.args.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> ContextHandle {
        self.program.context()
    }

    pub(crate) fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn program_handle(&self) -> ProgramHandle {
        self.program_handle
    }

    pub(crate) fn loaded(&self) -> &Arc<LoadedProgram> {
        &self.loaded
    }

    pub fn num_args(&self) -> u32 {
        self.args().len() as u32
    }

    pub(crate) fn set_arg(&self, index: u32, arg: BoundArg) -> ClResult<()> {
        let mut args = self.args();
        let slot = args
            .get_mut(index as usize)
            .ok_or(ClError::InvalidArgIndex)?;
        match &arg {
            BoundArg::Local(0) => return Err(ClError::InvalidArgSize),
            BoundArg::Scalar(bytes) if bytes.is_empty() => return Err(ClError::InvalidArgSize),
            _ => {}
        }
        *slot = Some(arg);
        Ok(())
    }

    /// Freezes the current arguments for a launch over `ndrange`.
    pub(crate) fn snapshot(&self, ndrange: NdRange) -> ClResult<LaunchSnapshot> {
        let args = self
            .args()
            .iter()
            .map(|slot| match slot {
                Some(BoundArg::Mem(mem)) => Ok(LaunchArg::Mem(Arc::clone(mem))),
                Some(BoundArg::Scalar(bytes)) => Ok(LaunchArg::Scalar(bytes.clone())),
                Some(BoundArg::Local(size)) => Ok(LaunchArg::Local(*size)),
                None => Err(ClError::InvalidKernelArgs),
            })
            .collect::<ClResult<Vec<_>>>()?;
        Ok(LaunchSnapshot {
            name: self.name.clone(),
            body: Arc::clone(&self.body),
            loaded: Arc::clone(&self.loaded),
            ndrange,
            args,
        })
    }

    /// Memory objects currently bound, for context checks at enqueue.
    pub(crate) fn bound_mems(&self) -> Vec<Arc<MemObject>> {
        self.args()
            .iter()
            .filter_map(|slot| match slot {
                Some(BoundArg::Mem(mem)) => Some(Arc::clone(mem)),
                _ => None,
            })
            .collect()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.program.kernel_released();
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("num_args", &self.num_args())
            .finish()
    }
}
