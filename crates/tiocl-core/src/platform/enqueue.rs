//! Enqueue operations. Everything is validated here, on the caller's thread, before a command
//! reaches the queue; a returned event only ever fails for execution reasons.

use std::sync::{Arc, Mutex};

use tiocl_mbox::NdRange;
use tracing::trace;

use super::Platform;
use crate::command::{Command, HostRegion, MappedBuffer, Mapping};
use crate::event::{CallbackTrigger, CommandType, Event};
use crate::flags::{ExecCapabilities, MapFlags};
use crate::handle::{ContextHandle, EventHandle, KernelHandle, MemHandle, QueueHandle};
use crate::kernel::Kernel;
use crate::memobj::MemObject;
use crate::queue::CommandQueue;
use crate::{ClError, ClResult};

impl Platform {
    fn queue(&self, queue: QueueHandle) -> ClResult<Arc<CommandQueue>> {
        self.check_open()?;
        self.queues.get(queue)
    }

    /// Memory object of `queue`'s context.
    fn queue_mem(&self, queue: &CommandQueue, mem: MemHandle) -> ClResult<Arc<MemObject>> {
        let obj = self.mems.get(mem)?;
        if obj.context() != queue.context() {
            return Err(ClError::InvalidContext);
        }
        Ok(obj)
    }

    pub(crate) fn wait_list(
        &self,
        context: ContextHandle,
        handles: &[EventHandle],
    ) -> ClResult<Vec<Arc<Event>>> {
        handles
            .iter()
            .map(|handle| {
                let event = self
                    .events
                    .get(*handle)
                    .map_err(|_| ClError::InvalidEventWaitList)?;
                if event.context() != context {
                    return Err(ClError::InvalidContext);
                }
                Ok(event)
            })
            .collect()
    }

    fn submit(
        &self,
        queue: &CommandQueue,
        command_type: CommandType,
        command: Command,
        wait_list: &[EventHandle],
    ) -> ClResult<Arc<Event>> {
        let deps = self.wait_list(queue.context(), wait_list)?;
        Ok(queue.enqueue(command_type, command, deps))
    }

    /// Registers `event`, waiting for it first when `blocking`.
    fn finish_enqueue(&self, event: Arc<Event>, blocking: bool) -> ClResult<EventHandle> {
        let handle = self.register_event(Arc::clone(&event));
        if blocking && event.wait().is_error() {
            let _ = self.events.release(handle);
            return Err(ClError::ExecStatusErrorForEventsInWaitList);
        }
        Ok(handle)
    }

    /// Copies `data` into `mem` at `offset`.
    pub fn enqueue_write_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: u64,
        data: &[u8],
        wait_list: &[EventHandle],
    ) -> ClResult<EventHandle> {
        let q = self.queue(queue)?;
        let dst = self.queue_mem(&q, mem)?;
        if data.is_empty() {
            return Err(ClError::InvalidValue);
        }
        dst.check_region(offset, data.len() as u64)?;
        let command = Command::WriteBuffer {
            dst,
            offset,
            data: data.to_vec(),
        };
        let event = self.submit(&q, CommandType::WriteBuffer, command, wait_list)?;
        self.finish_enqueue(event, blocking)
    }

    /// Fills `dst` from `mem` at `offset`. `dst` is left untouched if the command fails.
    pub fn enqueue_read_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: u64,
        dst: &HostRegion,
        wait_list: &[EventHandle],
    ) -> ClResult<EventHandle> {
        let q = self.queue(queue)?;
        let src = self.queue_mem(&q, mem)?;
        if dst.is_empty() {
            return Err(ClError::InvalidValue);
        }
        src.check_region(offset, dst.len() as u64)?;
        let command = Command::ReadBuffer {
            src,
            offset,
            dst: dst.clone(),
        };
        let event = self.submit(&q, CommandType::ReadBuffer, command, wait_list)?;
        self.finish_enqueue(event, blocking)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_copy_buffer(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
        wait_list: &[EventHandle],
    ) -> ClResult<EventHandle> {
        let q = self.queue(queue)?;
        let src = self.queue_mem(&q, src)?;
        let dst = self.queue_mem(&q, dst)?;
        if size == 0 {
            return Err(ClError::InvalidValue);
        }
        src.check_region(src_offset, size)?;
        dst.check_region(dst_offset, size)?;
        if src.regions_overlap(src_offset, &dst, dst_offset, size) {
            return Err(ClError::MemCopyOverlap);
        }
        let command = Command::CopyBuffer {
            src,
            dst,
            src_offset,
            dst_offset,
            size,
        };
        let event = self.submit(&q, CommandType::CopyBuffer, command, wait_list)?;
        self.finish_enqueue(event, false)
    }

    /// Maps `size` bytes at `offset`. The returned region holds the bytes once the event
    /// completes; changes reach the device at unmap when `flags` include `WRITE`.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_map_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        flags: MapFlags,
        offset: u64,
        size: u64,
        wait_list: &[EventHandle],
    ) -> ClResult<(MappedBuffer, EventHandle)> {
        let q = self.queue(queue)?;
        let obj = self.queue_mem(&q, mem)?;
        if flags.is_empty() || size == 0 {
            return Err(ClError::InvalidValue);
        }
        obj.check_region(offset, size)?;
        let deps = self.wait_list(q.context(), wait_list)?;

        let region = HostRegion::new(size as usize);
        let mapping = Arc::new(Mapping {
            id: self.next_map_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            offset,
            size,
            flags,
            region: region.clone(),
            transport: Mutex::new(None),
        });
        obj.add_mapping(Arc::clone(&mapping));
        let mapped = MappedBuffer {
            id: mapping.id,
            mem,
            offset,
            size,
            flags,
            region,
        };
        let command = Command::MapBuffer {
            mem: Arc::clone(&obj),
            mapping,
        };
        let event = q.enqueue(CommandType::MapBuffer, command, deps);
        // A map that never happened has nothing to unmap.
        let owner = Arc::downgrade(&obj);
        let id = mapped.id;
        event.add_callback(
            CallbackTrigger::Complete,
            Box::new(move |status| {
                if let (true, Some(obj)) = (status.is_error(), owner.upgrade()) {
                    obj.take_mapping(id);
                }
            }),
        );
        let handle = self.finish_enqueue(event, blocking)?;
        Ok((mapped, handle))
    }

    pub fn enqueue_unmap_mem_object(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        mapped: &MappedBuffer,
        wait_list: &[EventHandle],
    ) -> ClResult<EventHandle> {
        let q = self.queue(queue)?;
        let obj = self.queue_mem(&q, mem)?;
        if mapped.mem != mem {
            return Err(ClError::InvalidValue);
        }
        let deps = self.wait_list(q.context(), wait_list)?;
        let mapping = obj.take_mapping(mapped.id).ok_or(ClError::InvalidValue)?;
        let command = Command::UnmapMemObject { mem: obj, mapping };
        let event = q.enqueue(CommandType::UnmapMemObject, command, deps);
        self.finish_enqueue(event, false)
    }

    /// The kernel must be runnable on the queue's device: placed on its root device by a build,
    /// or built in.
    fn launchable(&self, q: &CommandQueue, kernel: KernelHandle) -> ClResult<Arc<Kernel>> {
        let k = self.kernels.get(kernel)?;
        if k.context() != q.context() {
            return Err(ClError::InvalidContext);
        }
        let device = q.device();
        let placed = k.loaded().is_placed_on(device.root());
        let built_in = k.program().is_built_in() && device.builtin_kernel(k.name()).is_some();
        if !placed && !built_in {
            return Err(ClError::InvalidProgramExecutable);
        }
        if k.bound_mems().iter().any(|m| m.context() != q.context()) {
            return Err(ClError::InvalidContext);
        }
        Ok(k)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_nd_range_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        work_dim: u32,
        global_offset: Option<&[u64]>,
        global_size: &[u64],
        local_size: Option<&[u64]>,
        wait_list: &[EventHandle],
    ) -> ClResult<EventHandle> {
        let q = self.queue(queue)?;
        let k = self.launchable(&q, kernel)?;
        let info = q.device().info();
        let ndrange = ndrange(
            work_dim,
            global_offset,
            global_size,
            local_size,
            info.max_work_item_dimensions,
            info.max_work_group_size,
        )?;
        let launch = k.snapshot(ndrange)?;
        trace!(kernel = k.name(), items = ndrange.total_items(), "nd-range launch");
        let event = self.submit(&q, CommandType::NdRangeKernel, Command::NdRange(launch), wait_list)?;
        self.finish_enqueue(event, false)
    }

    /// A single work item.
    pub fn enqueue_task(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        wait_list: &[EventHandle],
    ) -> ClResult<EventHandle> {
        let q = self.queue(queue)?;
        let k = self.launchable(&q, kernel)?;
        let launch = k.snapshot(NdRange::TASK)?;
        let event = self.submit(&q, CommandType::Task, Command::Task(launch), wait_list)?;
        self.finish_enqueue(event, false)
    }

    /// Runs `f` on the host over copies of `mems`; the copies are written back when it succeeds.
    pub fn enqueue_native_kernel<F>(
        &self,
        queue: QueueHandle,
        f: F,
        mems: &[MemHandle],
        wait_list: &[EventHandle],
    ) -> ClResult<EventHandle>
    where
        F: FnOnce(&mut [Vec<u8>]) -> Result<(), i32> + Send + 'static,
    {
        let q = self.queue(queue)?;
        if !q
            .device()
            .info()
            .execution_capabilities
            .contains(ExecCapabilities::NATIVE_KERNEL)
        {
            return Err(ClError::InvalidOperation);
        }
        let mems = mems
            .iter()
            .map(|m| self.queue_mem(&q, *m))
            .collect::<ClResult<Vec<_>>>()?;
        let command = Command::NativeKernel {
            f: Box::new(f),
            mems,
        };
        let event = self.submit(&q, CommandType::NativeKernel, command, wait_list)?;
        self.finish_enqueue(event, false)
    }

    /// Completes once every command enqueued before it, and everything in `wait_list`, is done.
    /// Unlike a barrier, later commands on an out-of-order queue do not wait for it.
    pub fn enqueue_marker(
        &self,
        queue: QueueHandle,
        wait_list: &[EventHandle],
    ) -> ClResult<EventHandle> {
        let q = self.queue(queue)?;
        let event = self.submit(&q, CommandType::Marker, Command::Marker, wait_list)?;
        self.finish_enqueue(event, false)
    }

    /// Later commands wait for every earlier command (and `wait_list`).
    pub fn enqueue_barrier(
        &self,
        queue: QueueHandle,
        wait_list: &[EventHandle],
    ) -> ClResult<EventHandle> {
        let q = self.queue(queue)?;
        let event = self.submit(&q, CommandType::Barrier, Command::Barrier, wait_list)?;
        self.finish_enqueue(event, false)
    }

    pub fn enqueue_wait_for_events(
        &self,
        queue: QueueHandle,
        events: &[EventHandle],
    ) -> ClResult<EventHandle> {
        let q = self.queue(queue)?;
        if events.is_empty() {
            return Err(ClError::InvalidValue);
        }
        let event = self.submit(&q, CommandType::WaitForEvents, Command::WaitForEvents, events)?;
        self.finish_enqueue(event, false)
    }

    /// Returns once every command enqueued so far has been considered for submission.
    pub fn flush(&self, queue: QueueHandle) -> ClResult<()> {
        self.queue(queue)?.flush();
        Ok(())
    }

    /// Blocks until every command enqueued so far is complete or failed.
    pub fn finish(&self, queue: QueueHandle) -> ClResult<()> {
        self.queue(queue)?.finish();
        Ok(())
    }
}

/// Checks launch geometry and packs it for the wire. Unused dimensions are 1.
fn ndrange(
    work_dim: u32,
    offset: Option<&[u64]>,
    global: &[u64],
    local: Option<&[u64]>,
    max_dims: u32,
    max_group: u64,
) -> ClResult<NdRange> {
    if work_dim == 0 || work_dim > max_dims.min(3) {
        return Err(ClError::InvalidWorkDimension);
    }
    let dims = work_dim as usize;
    if global.len() != dims {
        return Err(ClError::InvalidValue);
    }
    let mut range = NdRange {
        work_dim: work_dim as u8,
        offset: [0; 3],
        global: [1; 3],
        local: [1; 3],
    };
    if global.contains(&0) {
        return Err(ClError::InvalidGlobalWorkSize);
    }
    range.global[..dims].copy_from_slice(global);
    if let Some(offset) = offset {
        if offset.len() != dims {
            return Err(ClError::InvalidGlobalOffset);
        }
        range.offset[..dims].copy_from_slice(offset);
    }
    if let Some(local) = local {
        if local.len() != dims || local.iter().zip(global).any(|(l, g)| *l == 0 || g % l != 0) {
            return Err(ClError::InvalidWorkGroupSize);
        }
        let group = local.iter().try_fold(1u64, |acc, l| acc.checked_mul(*l));
        if group.map_or(true, |g| g > max_group) {
            return Err(ClError::InvalidWorkGroupSize);
        }
        range.local[..dims].copy_from_slice(local);
    }
    Ok(range)
}
