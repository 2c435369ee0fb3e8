use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tiocl_core::flags::DeviceType;
use tiocl_core::{
    ArgValue, CallbackTrigger, ClError, ContextHandle, DeviceHandle, EventStatus, HostRegion,
    MapFlags, MemFlags, Platform, PlatformConfig, PlatformOptions, QueueHandle, QueueProperties,
};
use tiocl_devmgr::{KernelContext, KernelFault, KernelLibrary};

const SOURCE: &str = "\
__kernel void twice(__global uchar *buf) {}
__kernel void fill(__global uchar *buf, uint value) {}
__kernel void fail(__global uchar *buf) {}
";

fn twice(ctx: &KernelContext<'_>) -> Result<(), KernelFault> {
    for i in ctx.work_items() {
        let mut b = [0u8];
        ctx.read(0, i, &mut b)?;
        ctx.write(0, i, &[b[0].wrapping_mul(2)])?;
    }
    Ok(())
}

fn fill(ctx: &KernelContext<'_>) -> Result<(), KernelFault> {
    let value = ctx.scalar_u32(1)? as u8;
    for i in ctx.work_items() {
        ctx.write(0, i, &[value])?;
    }
    Ok(())
}

fn fail(_ctx: &KernelContext<'_>) -> Result<(), KernelFault> {
    Err(KernelFault::Failed(ClError::OutOfResources.code()))
}

fn library() -> KernelLibrary {
    KernelLibrary::new()
        .with_kernel_arity("twice", 1, twice)
        .with_kernel_arity("fill", 2, fill)
        .with_kernel_arity("fail", 1, fail)
}

struct Env {
    platform: Platform,
    device: DeviceHandle,
    ctx: ContextHandle,
}

fn env() -> Env {
    let config = PlatformConfig {
        device_memory_bytes: 16 << 20,
        worker_poll: Duration::from_micros(50),
        ..PlatformConfig::default()
    };
    let platform = Platform::try_open(PlatformOptions::new(config).with_kernels(library())).unwrap();
    let device = platform.device_ids(DeviceType::ACCELERATOR).unwrap()[0];
    let ctx = platform.create_context(&[device]).unwrap();
    Env {
        platform,
        device,
        ctx,
    }
}

impl Env {
    fn queue(&self, properties: QueueProperties) -> QueueHandle {
        self.platform
            .create_command_queue(self.ctx, self.device, properties)
            .unwrap()
    }

    fn kernel(&self, name: &str) -> tiocl_core::KernelHandle {
        let program = self
            .platform
            .create_program_with_source(self.ctx, SOURCE)
            .unwrap();
        self.platform.build_program(program, None, "").unwrap();
        self.platform.create_kernel(program, name).unwrap()
    }
}

#[test]
fn write_then_read_round_trips() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 8, None)
        .unwrap();
    env.platform
        .enqueue_write_buffer(q, buf, true, 2, b"tiocl", &[])
        .unwrap();
    let out = HostRegion::new(8);
    env.platform
        .enqueue_read_buffer(q, buf, true, 0, &out, &[])
        .unwrap();
    assert_eq!(out.to_vec(), b"\0\0tiocl\0");
}

#[test]
fn kernel_runs_across_every_core() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let data: Vec<u8> = (0..100).collect();
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::COPY_HOST_PTR, 100, Some(&data))
        .unwrap();
    let k = env.kernel("twice");
    env.platform.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
    env.platform
        .enqueue_nd_range_kernel(q, k, 1, None, &[100], None, &[])
        .unwrap();
    let out = HostRegion::new(100);
    env.platform
        .enqueue_read_buffer(q, buf, true, 0, &out, &[])
        .unwrap();
    let expected: Vec<u8> = data.iter().map(|b| b * 2).collect();
    assert_eq!(out.to_vec(), expected);
}

#[test]
fn arguments_are_captured_at_enqueue() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let k = env.kernel("fill");
    env.platform.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
    env.platform.set_kernel_arg(k, 1, ArgValue::u32(b'A'.into())).unwrap();
    env.platform
        .enqueue_nd_range_kernel(q, k, 1, None, &[4], None, &[])
        .unwrap();
    env.platform.set_kernel_arg(k, 1, ArgValue::u32(b'B'.into())).unwrap();

    let out = HostRegion::new(4);
    env.platform
        .enqueue_read_buffer(q, buf, true, 0, &out, &[])
        .unwrap();
    assert_eq!(out.to_vec(), b"AAAA");

    env.platform
        .enqueue_nd_range_kernel(q, k, 1, None, &[4], None, &[])
        .unwrap();
    env.platform
        .enqueue_read_buffer(q, buf, true, 0, &out, &[])
        .unwrap();
    assert_eq!(out.to_vec(), b"BBBB");
}

#[test]
fn unbound_arguments_are_rejected() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let k = env.kernel("fill");
    assert_eq!(
        env.platform.enqueue_task(q, k, &[]),
        Err(ClError::InvalidKernelArgs)
    );
    assert_eq!(
        env.platform.set_kernel_arg(k, 2, ArgValue::u32(0)),
        Err(ClError::InvalidArgIndex)
    );
}

#[test]
fn failed_kernel_poisons_the_dependent_read() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let k = env.kernel("fail");
    env.platform.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
    let launch = env
        .platform
        .enqueue_nd_range_kernel(q, k, 1, None, &[4], None, &[])
        .unwrap();
    let out = HostRegion::from(b"keep".to_vec());
    let read = env
        .platform
        .enqueue_read_buffer(q, buf, false, 0, &out, &[launch])
        .unwrap();

    assert_eq!(
        env.platform.wait_for_events(&[read]),
        Err(ClError::ExecStatusErrorForEventsInWaitList)
    );
    assert_eq!(
        env.platform.event_status(launch).unwrap(),
        EventStatus::Error(ClError::OutOfResources.code())
    );
    assert_eq!(
        env.platform.event_status(read).unwrap(),
        EventStatus::Error(ClError::ExecStatusErrorForEventsInWaitList.code())
    );
    assert_eq!(out.to_vec(), b"keep");

    assert_eq!(
        env.platform.enqueue_read_buffer(q, buf, true, 0, &out, &[launch]),
        Err(ClError::ExecStatusErrorForEventsInWaitList)
    );
}

#[test]
fn user_event_gates_commands_on_other_queues() {
    let env = env();
    let q1 = env.queue(QueueProperties::empty());
    let q2 = env.queue(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE);
    let gate = env.platform.create_user_event(env.ctx).unwrap();
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let write = env
        .platform
        .enqueue_write_buffer(q1, buf, false, 0, b"AAAA", &[gate])
        .unwrap();
    let out = HostRegion::new(4);
    let read = env
        .platform
        .enqueue_read_buffer(q2, buf, false, 0, &out, &[write])
        .unwrap();

    env.platform.flush(q1).unwrap();
    env.platform.flush(q2).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert!(!env.platform.event_status(read).unwrap().is_terminal());

    env.platform.set_user_event_status(gate, 0).unwrap();
    env.platform.wait_for_events(&[read]).unwrap();
    assert_eq!(out.to_vec(), b"AAAA");

    assert_eq!(
        env.platform.set_user_event_status(gate, 0),
        Err(ClError::InvalidOperation)
    );
    assert_eq!(
        env.platform.set_user_event_status(write, 0),
        Err(ClError::InvalidEvent)
    );
    let other = env.platform.create_user_event(env.ctx).unwrap();
    assert_eq!(
        env.platform.set_user_event_status(other, 1),
        Err(ClError::InvalidValue)
    );
}

#[test]
fn failed_user_event_fails_its_dependents() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let gate = env.platform.create_user_event(env.ctx).unwrap();
    let marker = env.platform.enqueue_marker(q, &[gate]).unwrap();
    env.platform.set_user_event_status(gate, -100).unwrap();
    env.platform.finish(q).unwrap();
    assert_eq!(
        env.platform.event_status(marker).unwrap(),
        EventStatus::Error(ClError::ExecStatusErrorForEventsInWaitList.code())
    );
}

#[test]
fn barrier_orders_an_out_of_order_queue() {
    let env = env();
    let q = env.queue(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE);
    let gate = env.platform.create_user_event(env.ctx).unwrap();
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    env.platform
        .enqueue_write_buffer(q, buf, false, 0, b"AAAA", &[gate])
        .unwrap();
    env.platform.enqueue_barrier(q, &[]).unwrap();
    env.platform
        .enqueue_write_buffer(q, buf, false, 0, b"BBBB", &[])
        .unwrap();
    env.platform.set_user_event_status(gate, 0).unwrap();
    env.platform.finish(q).unwrap();

    let out = HostRegion::new(4);
    env.platform
        .enqueue_read_buffer(q, buf, true, 0, &out, &[])
        .unwrap();
    assert_eq!(out.to_vec(), b"BBBB");
}

#[test]
fn callbacks_fire_once() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let gate = env.platform.create_user_event(env.ctx).unwrap();
    let write = env
        .platform
        .enqueue_write_buffer(q, buf, false, 0, b"AAAA", &[gate])
        .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    for trigger in [CallbackTrigger::Submitted, CallbackTrigger::Complete] {
        let fired = fired.clone();
        env.platform
            .set_event_callback(write, trigger, move |status| {
                assert!(!status.is_error());
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    env.platform.set_user_event_status(gate, 0).unwrap();
    env.platform.finish(q).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    let late = fired.clone();
    env.platform
        .set_event_callback(write, CallbackTrigger::Complete, move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[test]
fn profiling_timestamps_are_ordered() {
    let env = env();
    let q = env.queue(QueueProperties::PROFILING_ENABLE);
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let write = env
        .platform
        .enqueue_write_buffer(q, buf, true, 0, b"AAAA", &[])
        .unwrap();
    let info = env.platform.event_profiling_info(write).unwrap();
    assert!(info.queued <= info.submit);
    assert!(info.submit <= info.start);
    assert!(info.start <= info.end);

    let plain = env.queue(QueueProperties::empty());
    let write = env
        .platform
        .enqueue_write_buffer(plain, buf, true, 0, b"AAAA", &[])
        .unwrap();
    assert_eq!(
        env.platform.event_profiling_info(write),
        Err(ClError::ProfilingInfoNotAvailable)
    );
}

#[test]
fn map_write_reaches_the_device_at_unmap() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::COPY_HOST_PTR, 8, Some(&b"abcdefgh"[..]))
        .unwrap();
    let (mapped, _) = env
        .platform
        .enqueue_map_buffer(q, buf, true, MapFlags::READ | MapFlags::WRITE, 2, 4, &[])
        .unwrap();
    assert_eq!(mapped.region.to_vec(), b"cdef");
    assert_eq!(env.platform.mem_info(buf).unwrap().map_count, 1);
    mapped.region.lock().copy_from_slice(b"WXYZ");
    env.platform
        .enqueue_unmap_mem_object(q, buf, &mapped, &[])
        .unwrap();
    assert_eq!(
        env.platform.enqueue_unmap_mem_object(q, buf, &mapped, &[]),
        Err(ClError::InvalidValue)
    );

    let out = HostRegion::new(8);
    env.platform
        .enqueue_read_buffer(q, buf, true, 0, &out, &[])
        .unwrap();
    assert_eq!(out.to_vec(), b"abWXYZgh");
    assert_eq!(env.platform.mem_info(buf).unwrap().map_count, 0);
}

#[test]
fn failed_map_leaves_no_mapping_behind() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 8, None)
        .unwrap();
    let gate = env.platform.create_user_event(env.ctx).unwrap();
    let (mapped, map) = env
        .platform
        .enqueue_map_buffer(q, buf, false, MapFlags::WRITE, 0, 4, &[gate])
        .unwrap();
    assert_eq!(env.platform.mem_info(buf).unwrap().map_count, 1);

    env.platform.set_user_event_status(gate, -5).unwrap();
    assert_eq!(
        env.platform.wait_for_events(&[map]),
        Err(ClError::ExecStatusErrorForEventsInWaitList)
    );
    env.platform.finish(q).unwrap();
    assert_eq!(
        env.platform.event_status(map).unwrap(),
        EventStatus::Error(ClError::ExecStatusErrorForEventsInWaitList.code())
    );
    assert_eq!(env.platform.mem_info(buf).unwrap().map_count, 0);
    assert_eq!(
        env.platform.enqueue_unmap_mem_object(q, buf, &mapped, &[]),
        Err(ClError::InvalidValue)
    );
}

#[test]
fn wait_for_events_command_waits_only_for_its_list() {
    let env = env();
    let q = env.queue(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE);
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let held = env.platform.create_user_event(env.ctx).unwrap();
    let released = env.platform.create_user_event(env.ctx).unwrap();
    let write = env
        .platform
        .enqueue_write_buffer(q, buf, false, 0, b"AAAA", &[held])
        .unwrap();
    let wait = env
        .platform
        .enqueue_wait_for_events(q, &[released])
        .unwrap();
    assert_eq!(
        env.platform.enqueue_wait_for_events(q, &[]),
        Err(ClError::InvalidValue)
    );

    env.platform.set_user_event_status(released, 0).unwrap();
    env.platform.wait_for_events(&[wait]).unwrap();
    assert_eq!(
        env.platform.event_info(wait).unwrap().command_type,
        tiocl_core::CommandType::WaitForEvents
    );
    assert!(!env.platform.event_status(write).unwrap().is_terminal());

    env.platform.set_user_event_status(held, 0).unwrap();
    env.platform.finish(q).unwrap();
    assert_eq!(env.platform.event_status(write).unwrap(), EventStatus::Complete);
}

#[test]
fn marker_waits_for_everything_enqueued_before_it() {
    let env = env();
    let q = env.queue(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE);
    let a = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let b = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let done = env
        .platform
        .enqueue_write_buffer(q, a, true, 0, b"done", &[])
        .unwrap();
    let gate = env.platform.create_user_event(env.ctx).unwrap();
    let gated = env
        .platform
        .enqueue_write_buffer(q, a, false, 0, b"AAAA", &[gate])
        .unwrap();
    let bare = env.platform.enqueue_marker(q, &[]).unwrap();
    let listed = env.platform.enqueue_marker(q, &[done]).unwrap();

    // A marker does not hold back commands enqueued after it.
    let later = env
        .platform
        .enqueue_write_buffer(q, b, false, 0, b"BBBB", &[])
        .unwrap();
    env.platform.wait_for_events(&[later]).unwrap();
    env.platform.flush(q).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    for marker in [bare, listed] {
        assert!(!env.platform.event_status(marker).unwrap().is_terminal());
    }

    env.platform.set_user_event_status(gate, 0).unwrap();
    env.platform.wait_for_events(&[bare, listed]).unwrap();
    assert_eq!(env.platform.event_status(gated).unwrap(), EventStatus::Complete);
}

#[test]
fn out_of_order_queue_is_ordered_only_by_wait_lists() {
    let env = env();
    let q = env.queue(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE);
    let a = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let b = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    let gate = env.platform.create_user_event(env.ctx).unwrap();

    // A later command with nothing to wait for overtakes a held one.
    let held = env
        .platform
        .enqueue_write_buffer(q, a, false, 0, b"AAAA", &[gate])
        .unwrap();
    let free = env
        .platform
        .enqueue_write_buffer(q, b, false, 0, b"BBBB", &[])
        .unwrap();
    env.platform.wait_for_events(&[free]).unwrap();
    assert!(!env.platform.event_status(held).unwrap().is_terminal());
    env.platform.set_user_event_status(gate, 0).unwrap();

    // Commands linked by a wait list run in that order.
    let first = env
        .platform
        .enqueue_write_buffer(q, a, false, 0, b"1111", &[held])
        .unwrap();
    let second = env
        .platform
        .enqueue_write_buffer(q, a, false, 0, b"2222", &[first])
        .unwrap();
    let out = HostRegion::new(4);
    env.platform
        .enqueue_read_buffer(q, a, true, 0, &out, &[second])
        .unwrap();
    assert_eq!(out.to_vec(), b"2222");

    // Unlinked writes to the same buffer: enqueue order is only a tie-break, so either may land
    // last.
    let x = env
        .platform
        .enqueue_write_buffer(q, b, false, 0, b"xxxx", &[])
        .unwrap();
    let y = env
        .platform
        .enqueue_write_buffer(q, b, false, 0, b"yyyy", &[])
        .unwrap();
    let out = HostRegion::new(4);
    env.platform
        .enqueue_read_buffer(q, b, true, 0, &out, &[x, y])
        .unwrap();
    let last = out.to_vec();
    assert!(last == b"xxxx" || last == b"yyyy", "unexpected {last:?}");
}

#[test]
fn copies_between_buffers_and_rejects_overlap() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let a = env
        .platform
        .create_buffer(env.ctx, MemFlags::COPY_HOST_PTR, 4, Some(&b"1234"[..]))
        .unwrap();
    let b = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    env.platform.enqueue_copy_buffer(q, a, b, 1, 0, 3, &[]).unwrap();
    let out = HostRegion::new(3);
    env.platform
        .enqueue_read_buffer(q, b, true, 0, &out, &[])
        .unwrap();
    assert_eq!(out.to_vec(), b"234");
    assert_eq!(
        env.platform.enqueue_copy_buffer(q, a, a, 0, 1, 3, &[]),
        Err(ClError::MemCopyOverlap)
    );
}

#[test]
fn native_kernel_updates_buffers() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::COPY_HOST_PTR, 3, Some(&b"abc"[..]))
        .unwrap();
    env.platform
        .enqueue_native_kernel(
            q,
            |mems: &mut [Vec<u8>]| {
                mems[0].make_ascii_uppercase();
                Ok(())
            },
            &[buf],
            &[],
        )
        .unwrap();
    let out = HostRegion::new(3);
    env.platform
        .enqueue_read_buffer(q, buf, true, 0, &out, &[])
        .unwrap();
    assert_eq!(out.to_vec(), b"ABC");
}

#[test]
fn sub_buffer_writes_show_in_the_parent() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let parent = env
        .platform
        .create_buffer(env.ctx, MemFlags::COPY_HOST_PTR, 8, Some(&b"........"[..]))
        .unwrap();
    let sub = env
        .platform
        .create_sub_buffer(parent, MemFlags::empty(), 4, 4)
        .unwrap();
    let info = env.platform.mem_info(sub).unwrap();
    assert!(info.is_sub_buffer);
    assert_eq!(info.offset, 4);
    env.platform
        .enqueue_write_buffer(q, sub, true, 0, b"tail", &[])
        .unwrap();
    let out = HostRegion::new(8);
    env.platform
        .enqueue_read_buffer(q, parent, true, 0, &out, &[])
        .unwrap();
    assert_eq!(out.to_vec(), b"....tail");
    assert_eq!(
        env.platform.create_sub_buffer(parent, MemFlags::empty(), 6, 4),
        Err(ClError::InvalidBufferSize)
    );
    assert_eq!(
        env.platform.create_sub_buffer(sub, MemFlags::empty(), 0, 1),
        Err(ClError::InvalidMemObject)
    );
}

#[test]
fn reference_counts_follow_retain_and_release() {
    let env = env();
    let buf = env
        .platform
        .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, None)
        .unwrap();
    env.platform.retain_mem_object(buf).unwrap();
    env.platform.retain_mem_object(buf).unwrap();
    assert_eq!(env.platform.mem_info(buf).unwrap().reference_count, 3);
    for _ in 0..3 {
        env.platform.release_mem_object(buf).unwrap();
    }
    assert_eq!(env.platform.release_mem_object(buf), Err(ClError::InvalidMemObject));
    assert_eq!(env.platform.mem_info(buf), Err(ClError::InvalidMemObject));
}

#[test]
fn buffer_creation_is_validated() {
    let env = env();
    assert_eq!(
        env.platform
            .create_buffer(env.ctx, MemFlags::READ_ONLY | MemFlags::WRITE_ONLY, 4, None),
        Err(ClError::InvalidValue)
    );
    assert_eq!(
        env.platform
            .create_buffer(env.ctx, MemFlags::READ_WRITE, 0, None),
        Err(ClError::InvalidBufferSize)
    );
    assert_eq!(
        env.platform
            .create_buffer(env.ctx, MemFlags::COPY_HOST_PTR, 4, None),
        Err(ClError::InvalidHostPtr)
    );
    assert_eq!(
        env.platform
            .create_buffer(env.ctx, MemFlags::READ_WRITE, 4, Some(&b"data"[..])),
        Err(ClError::InvalidHostPtr)
    );
}

#[test]
fn build_failures_keep_a_log() {
    let env = env();
    let program = env
        .platform
        .create_program_with_source(env.ctx, "__kernel void nowhere(int x) {}\n")
        .unwrap();
    assert_eq!(
        env.platform.build_program(program, None, ""),
        Err(ClError::BuildProgramFailure)
    );
    let info = env.platform.program_build_info(program, env.device).unwrap();
    assert!(info.log.contains("program.cl:1: error"), "{}", info.log);
    assert_eq!(
        env.platform.create_kernel(program, "nowhere"),
        Err(ClError::InvalidProgramExecutable)
    );
    assert_eq!(
        env.platform.build_program(program, None, "-O3"),
        Err(ClError::InvalidBuildOptions)
    );
}

#[test]
fn finish_on_an_empty_queue_returns() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    env.platform.finish(q).unwrap();
    env.platform.release_command_queue(q).unwrap();
    assert_eq!(env.platform.finish(q), Err(ClError::InvalidCommandQueue));
}

#[test]
fn wait_lists_are_checked() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    let other_ctx = env.platform.create_context(&[env.device]).unwrap();
    let foreign = env.platform.create_user_event(other_ctx).unwrap();
    assert_eq!(
        env.platform.enqueue_marker(q, &[foreign]),
        Err(ClError::InvalidContext)
    );
    let gone = env.platform.create_user_event(env.ctx).unwrap();
    env.platform.release_event(gone).unwrap();
    assert_eq!(
        env.platform.enqueue_marker(q, &[gone]),
        Err(ClError::InvalidEventWaitList)
    );
    assert_eq!(env.platform.wait_for_events(&[]), Err(ClError::InvalidValue));
}

#[test]
fn shutdown_invalidates_every_handle() {
    let env = env();
    let q = env.queue(QueueProperties::empty());
    env.platform.shutdown();
    assert_eq!(env.platform.finish(q), Err(ClError::InvalidPlatform));
    assert_eq!(
        env.platform.create_context(&[env.device]),
        Err(ClError::InvalidPlatform)
    );
    env.platform.shutdown();
}
