//! Creation, reference counting and queries of contexts, queues, memory objects, programs and
//! kernels.

use std::sync::{Arc, PoisonError};

use tracing::{debug, info};

use super::{prune_finished, Platform};
use crate::context::Context;
use crate::device::Device;
use crate::flags::{MemFlags, QueueProperties};
use crate::handle::{ContextHandle, DeviceHandle, KernelHandle, MemHandle, ProgramHandle, QueueHandle};
use crate::kernel::{ArgValue, BoundArg, Kernel};
use crate::memobj::{DeviceAllocation, MemObject};
use crate::program::{BuildInfo, BuildStatus, Program};
use crate::queue::CommandQueue;
use crate::{ClError, ClResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub devices: Vec<DeviceHandle>,
    pub reference_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub context: ContextHandle,
    pub device: DeviceHandle,
    pub properties: QueueProperties,
    pub reference_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemInfo {
    pub context: ContextHandle,
    pub flags: MemFlags,
    pub size: u64,
    /// Offset into the parent buffer; zero for buffers.
    pub offset: u64,
    pub is_sub_buffer: bool,
    pub map_count: usize,
    pub reference_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub context: ContextHandle,
    pub devices: Vec<DeviceHandle>,
    pub source: Option<String>,
    pub kernel_names: Vec<String>,
    pub reference_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub name: String,
    pub num_args: u32,
    pub context: ContextHandle,
    pub program: ProgramHandle,
    pub reference_count: u32,
}

impl Platform {
    pub fn create_context(&self, devices: &[DeviceHandle]) -> ClResult<ContextHandle> {
        self.check_open()?;
        if devices.is_empty() {
            return Err(ClError::InvalidValue);
        }
        let mut members: Vec<(DeviceHandle, Arc<dyn Device>)> = Vec::with_capacity(devices.len());
        for handle in devices {
            let device = self.devices.get(*handle)?;
            if !members.iter().any(|(h, _)| h == handle) {
                members.push((*handle, device));
            }
        }
        debug!(devices = members.len(), "context created");
        Ok(self.contexts.insert(Arc::new(Context::new(members))))
    }

    pub fn retain_context(&self, context: ContextHandle) -> ClResult<()> {
        self.contexts.retain(context)
    }

    pub fn release_context(&self, context: ContextHandle) -> ClResult<()> {
        self.contexts.release(context).map(drop)
    }

    pub fn context_info(&self, context: ContextHandle) -> ClResult<ContextInfo> {
        let ctx = self.contexts.get(context)?;
        Ok(ContextInfo {
            devices: ctx.device_handles(),
            reference_count: self.contexts.refcount(context)?,
        })
    }

    pub fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        properties: QueueProperties,
    ) -> ClResult<QueueHandle> {
        self.check_open()?;
        let ctx = self.contexts.get(context)?;
        let target = ctx.device(device).ok_or(ClError::InvalidDevice)?;
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        prune_finished(&mut workers);
        let handle = self.queues.try_insert_with(|handle| {
            let (queue, worker) = CommandQueue::spawn(
                handle,
                context,
                device,
                target,
                properties,
                self.clock,
                self.config.worker_poll,
            )?;
            workers.push(worker);
            Ok(Arc::new(queue))
        })?;
        debug!(queue = ?handle, ?properties, "command queue created");
        Ok(handle)
    }

    pub fn retain_command_queue(&self, queue: QueueHandle) -> ClResult<()> {
        self.queues.retain(queue)
    }

    /// The worker keeps running until everything already enqueued is finished.
    pub fn release_command_queue(&self, queue: QueueHandle) -> ClResult<()> {
        self.queues.release(queue).map(drop)
    }

    pub fn queue_info(&self, queue: QueueHandle) -> ClResult<QueueInfo> {
        let q = self.queues.get(queue)?;
        Ok(QueueInfo {
            context: q.context(),
            device: q.device_handle(),
            properties: q.properties(),
            reference_count: self.queues.refcount(queue)?,
        })
    }

    /// Allocates a buffer on the device heap, initialised from `host_data` when `COPY_HOST_PTR`
    /// or `USE_HOST_PTR` is set.
    pub fn create_buffer(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        size: u64,
        host_data: Option<&[u8]>,
    ) -> ClResult<MemHandle> {
        self.check_open()?;
        let ctx = self.contexts.get(context)?;
        if (flags & MemFlags::ACCESS).bits().count_ones() > 1 {
            return Err(ClError::InvalidValue);
        }
        let wants_host = flags.intersects(MemFlags::COPY_HOST_PTR | MemFlags::USE_HOST_PTR);
        if flags.contains(MemFlags::USE_HOST_PTR)
            && flags.intersects(MemFlags::COPY_HOST_PTR | MemFlags::ALLOC_HOST_PTR)
        {
            return Err(ClError::InvalidValue);
        }
        let max_alloc = ctx
            .devices()
            .iter()
            .map(|(_, d)| d.info().max_mem_alloc_size)
            .min()
            .unwrap_or(0);
        if size == 0 || size > max_alloc {
            return Err(ClError::InvalidBufferSize);
        }
        let init = match (wants_host, host_data) {
            (true, Some(data)) if data.len() as u64 >= size => Some(&data[..size as usize]),
            (false, None) => None,
            _ => return Err(ClError::InvalidHostPtr),
        };

        let storage = DeviceAllocation::new(&self.heap, size)?;
        let flags = (flags - MemFlags::ACCESS) | flags.access();
        let mem = MemObject::buffer(context, flags, size, storage);
        if let Some(bytes) = init {
            self.memory.write(mem.device_addr(), bytes).map_err(|err| {
                debug!(%err, "initial buffer copy failed");
                ClError::OutOfResources
            })?;
        }
        Ok(self.mems.insert(Arc::new(mem)))
    }

    pub fn create_sub_buffer(
        &self,
        buffer: MemHandle,
        flags: MemFlags,
        origin: u64,
        size: u64,
    ) -> ClResult<MemHandle> {
        self.check_open()?;
        let parent = self.mems.get(buffer)?;
        let sub = MemObject::sub_buffer(&parent, flags, origin, size)?;
        Ok(self.mems.insert(Arc::new(sub)))
    }

    pub fn retain_mem_object(&self, mem: MemHandle) -> ClResult<()> {
        self.mems.retain(mem)
    }

    /// Device memory is freed once no handle, sub-buffer or in-flight command refers to it.
    pub fn release_mem_object(&self, mem: MemHandle) -> ClResult<()> {
        self.mems.release(mem).map(drop)
    }

    pub fn mem_info(&self, mem: MemHandle) -> ClResult<MemInfo> {
        let obj = self.mems.get(mem)?;
        Ok(MemInfo {
            context: obj.context(),
            flags: obj.flags(),
            size: obj.size(),
            offset: obj.origin(),
            is_sub_buffer: obj.is_sub_buffer(),
            map_count: obj.map_count(),
            reference_count: self.mems.refcount(mem)?,
        })
    }

    pub fn create_program_with_source(
        &self,
        context: ContextHandle,
        source: &str,
    ) -> ClResult<ProgramHandle> {
        self.check_open()?;
        let ctx = self.contexts.get(context)?;
        if source.trim().is_empty() {
            return Err(ClError::InvalidValue);
        }
        let program = Program::with_source(context, ctx.devices().to_vec(), source.to_string());
        Ok(self.programs.insert(Arc::new(program)))
    }

    /// `names` is a `;` separated list; every listed device must provide every kernel.
    pub fn create_program_with_built_in_kernels(
        &self,
        context: ContextHandle,
        devices: &[DeviceHandle],
        names: &str,
    ) -> ClResult<ProgramHandle> {
        self.check_open()?;
        let ctx = self.contexts.get(context)?;
        let members = devices
            .iter()
            .map(|h| ctx.device(*h).map(|d| (*h, d)).ok_or(ClError::InvalidDevice))
            .collect::<ClResult<Vec<_>>>()?;
        let program = Program::with_built_in_kernels(context, members, names)?;
        Ok(self.programs.insert(Arc::new(program)))
    }

    /// Builds for `devices`, or for every device of the program when `None`.
    pub fn build_program(
        &self,
        program: ProgramHandle,
        devices: Option<&[DeviceHandle]>,
        options: &str,
    ) -> ClResult<()> {
        self.check_open()?;
        let prog = self.programs.get(program)?;
        let result = prog.build(devices, options, self.compiler.as_deref());
        match &result {
            Ok(()) => info!(program = ?program, kernels = ?prog.kernel_names(), "program built"),
            Err(err) => debug!(program = ?program, %err, "build_program failed"),
        }
        result
    }

    pub fn program_build_info(
        &self,
        program: ProgramHandle,
        device: DeviceHandle,
    ) -> ClResult<BuildInfo> {
        let prog = self.programs.get(program)?;
        if !prog.has_device(device) {
            return Err(ClError::InvalidDevice);
        }
        Ok(prog.build_info())
    }

    pub fn program_info(&self, program: ProgramHandle) -> ClResult<ProgramInfo> {
        let prog = self.programs.get(program)?;
        Ok(ProgramInfo {
            context: prog.context(),
            devices: prog.device_handles(),
            source: prog.source().map(str::to_string),
            kernel_names: prog.kernel_names(),
            reference_count: self.programs.refcount(program)?,
        })
    }

    pub fn retain_program(&self, program: ProgramHandle) -> ClResult<()> {
        self.programs.retain(program)
    }

    pub fn release_program(&self, program: ProgramHandle) -> ClResult<()> {
        self.programs.release(program).map(drop)
    }

    pub fn create_kernel(&self, program: ProgramHandle, name: &str) -> ClResult<KernelHandle> {
        self.check_open()?;
        let prog = self.programs.get(program)?;
        if prog.status() != BuildStatus::Built {
            return Err(ClError::InvalidProgramExecutable);
        }
        let kernel = Kernel::new(prog, program, name)?;
        Ok(self.kernels.insert(Arc::new(kernel)))
    }

    /// One kernel object per kernel in the program.
    pub fn create_kernels_in_program(&self, program: ProgramHandle) -> ClResult<Vec<KernelHandle>> {
        let prog = self.programs.get(program)?;
        if prog.status() != BuildStatus::Built {
            return Err(ClError::InvalidProgramExecutable);
        }
        prog.kernel_names()
            .iter()
            .map(|name| self.create_kernel(program, name))
            .collect()
    }

    pub fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue) -> ClResult<()> {
        let k = self.kernels.get(kernel)?;
        let bound = match value {
            ArgValue::Mem(handle) => {
                let mem = self.mems.get(handle)?;
                if mem.context() != k.context() {
                    return Err(ClError::InvalidMemObject);
                }
                BoundArg::Mem(mem)
            }
            ArgValue::Scalar(bytes) => BoundArg::Scalar(bytes),
            ArgValue::Local(size) => BoundArg::Local(size),
        };
        k.set_arg(index, bound)
    }

    pub fn kernel_info(&self, kernel: KernelHandle) -> ClResult<KernelInfo> {
        let k = self.kernels.get(kernel)?;
        Ok(KernelInfo {
            name: k.name().to_string(),
            num_args: k.num_args(),
            context: k.context(),
            program: k.program_handle(),
            reference_count: self.kernels.refcount(kernel)?,
        })
    }

    pub fn retain_kernel(&self, kernel: KernelHandle) -> ClResult<()> {
        self.kernels.retain(kernel)
    }

    pub fn release_kernel(&self, kernel: KernelHandle) -> ClResult<()> {
        self.kernels.release(kernel).map(drop)
    }
}
