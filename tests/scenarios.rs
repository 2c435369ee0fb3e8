//! End-to-end runs through the whole stack: platform bring-up, shared memory, mailboxes and the
//! simulated compute cores.

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::{Context as _, Result};
use pretty_assertions::assert_eq;
use tiocl_core::flags::DeviceType;
use tiocl_core::{
    ArgValue, CallbackTrigger, ClError, ContextHandle, DeviceHandle, EventStatus, HostRegion,
    MemFlags, Platform, PlatformConfig, PlatformOptions, QueueProperties,
};
use tiocl_devmgr::{KernelContext, KernelFault, KernelLibrary};

const SOURCE: &str = "\
__kernel void combine(__global const uchar *a, __global const uchar *b, __global uchar *c) {}
__kernel void broken(__global uchar *c) {}
";

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn combine(ctx: &KernelContext<'_>) -> Result<(), KernelFault> {
    for i in ctx.work_items() {
        let (mut a, mut b) = ([0u8], [0u8]);
        ctx.read(0, i, &mut a)?;
        ctx.read(1, i, &mut b)?;
        ctx.write(2, i, &[a[0].wrapping_add(b[0])])?;
    }
    Ok(())
}

fn broken(_ctx: &KernelContext<'_>) -> Result<(), KernelFault> {
    Err(KernelFault::Failed(ClError::OutOfResources.code()))
}

struct Session {
    platform: Platform,
    device: DeviceHandle,
    ctx: ContextHandle,
}

fn open(config: PlatformConfig) -> Result<Session> {
    init_tracing();
    let kernels = KernelLibrary::new()
        .with_kernel_arity("combine", 3, combine)
        .with_kernel_arity("broken", 1, broken);
    let platform = Platform::try_open(PlatformOptions::new(config).with_kernels(kernels))
        .context("open platform")?;
    let device = platform.device_ids(DeviceType::DEFAULT)?[0];
    let ctx = platform.create_context(&[device])?;
    tracing::debug!(?device, ?ctx, "session ready");
    Ok(Session {
        platform,
        device,
        ctx,
    })
}

fn small_config() -> PlatformConfig {
    PlatformConfig {
        device_memory_bytes: 16 << 20,
        worker_poll: Duration::from_micros(50),
        ..PlatformConfig::default()
    }
}

#[test]
fn write_write_combine_chain() -> Result<()> {
    let s = open(small_config())?;
    let p = &s.platform;
    let q = p.create_command_queue(s.ctx, s.device, QueueProperties::empty())?;
    let mk = || p.create_buffer(s.ctx, MemFlags::READ_WRITE, 4, None);
    let (a, b, c) = (mk()?, mk()?, mk()?);

    let program = p.create_program_with_source(s.ctx, SOURCE)?;
    p.build_program(program, None, "").context("build combine")?;
    let k = p.create_kernel(program, "combine")?;
    for (idx, mem) in [a, b, c].into_iter().enumerate() {
        p.set_kernel_arg(k, idx as u32, ArgValue::Mem(mem))?;
    }

    let wa = p.enqueue_write_buffer(q, a, false, 0, b"AAAA", &[])?;
    let wb = p.enqueue_write_buffer(q, b, false, 0, b"BBBB", &[wa])?;
    let run = p.enqueue_nd_range_kernel(q, k, 1, None, &[4], None, &[wb])?;
    p.finish(q)?;

    for ev in [wa, wb, run] {
        assert_eq!(p.event_status(ev)?, EventStatus::Complete);
    }
    let out = HostRegion::new(4);
    p.enqueue_read_buffer(q, c, true, 0, &out, &[])?;
    assert_eq!(out.to_vec(), vec![b'A'.wrapping_add(b'B'); 4]);
    Ok(())
}

#[test]
fn failing_kernel_leaves_host_memory_alone() -> Result<()> {
    let s = open(small_config())?;
    let p = &s.platform;
    let q = p.create_command_queue(s.ctx, s.device, QueueProperties::empty())?;
    let buf = p.create_buffer(s.ctx, MemFlags::COPY_HOST_PTR, 4, Some(&b"dev!"[..]))?;
    let program = p.create_program_with_source(s.ctx, SOURCE)?;
    p.build_program(program, None, "")?;
    let k = p.create_kernel(program, "broken")?;
    p.set_kernel_arg(k, 0, ArgValue::Mem(buf))?;

    let run = p.enqueue_nd_range_kernel(q, k, 1, None, &[4], None, &[])?;
    let out = HostRegion::from(b"host".to_vec());
    let read = p.enqueue_read_buffer(q, buf, false, 0, &out, &[run])?;
    p.finish(q)?;

    assert_eq!(
        p.event_status(run)?,
        EventStatus::Error(ClError::OutOfResources.code())
    );
    assert_eq!(
        p.event_status(read)?,
        EventStatus::Error(ClError::ExecStatusErrorForEventsInWaitList.code())
    );
    assert_eq!(out.to_vec(), b"host");
    Ok(())
}

#[test]
fn in_order_queue_runs_commands_one_at_a_time() -> Result<()> {
    let s = open(small_config())?;
    let p = &s.platform;
    let q = p.create_command_queue(s.ctx, s.device, QueueProperties::empty())?;
    let buf = p.create_buffer(s.ctx, MemFlags::READ_WRITE, 4, None)?;
    let gate = p.create_user_event(s.ctx)?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut events = Vec::new();
    for (i, data) in [b"1111", b"2222", b"3333"].into_iter().enumerate() {
        let wait = if i == 0 { vec![gate] } else { Vec::new() };
        let ev = p.enqueue_write_buffer(q, buf, false, 0, data, &wait)?;
        let order = order.clone();
        p.set_event_callback(ev, CallbackTrigger::Running, move |_| {
            order.lock().unwrap().push(i);
        })?;
        events.push(ev);
    }

    p.flush(q)?;
    std::thread::sleep(Duration::from_millis(20));
    assert!(order.lock().unwrap().is_empty());

    p.set_user_event_status(gate, 0)?;
    p.wait_for_events(&events)?;
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

    let out = HostRegion::new(4);
    p.enqueue_read_buffer(q, buf, true, 0, &out, &[])?;
    assert_eq!(out.to_vec(), b"3333");
    Ok(())
}

#[test]
fn configuration_from_environment_variables() -> Result<()> {
    let vars = [
        ("TIOCL_COMPUTE_UNIT_LIST", "0-1"),
        ("TIOCL_NUM_DEVICES", "2"),
        ("TIOCL_DEVICE_MEMORY_MB", "16"),
        ("TIOCL_WORKER_SLEEP_US", "50"),
    ];
    let config = PlatformConfig::from_lookup(|var| {
        vars.iter()
            .find(|(k, _)| *k == var)
            .map(|(_, v)| v.to_string())
    })
    .context("read configuration")?;
    let s = open(config)?;
    let p = &s.platform;

    let devices = p.device_ids(DeviceType::ACCELERATOR)?;
    assert_eq!(devices.len(), 2);
    for device in &devices {
        let info = p.device_info(*device)?;
        assert_eq!(info.compute_units, vec![0, 1]);
        assert!(info.available);
    }
    assert_eq!(
        p.device_ids(DeviceType::CUSTOM),
        Err(ClError::DeviceNotFound)
    );

    let ctx = p.create_context(&devices)?;
    let buf = p.create_buffer(ctx, MemFlags::READ_WRITE, 4, None)?;
    let q0 = p.create_command_queue(ctx, devices[0], QueueProperties::empty())?;
    let q1 = p.create_command_queue(ctx, devices[1], QueueProperties::empty())?;
    let write = p.enqueue_write_buffer(q0, buf, false, 0, b"dsp0", &[])?;
    let out = HostRegion::new(4);
    p.enqueue_read_buffer(q1, buf, true, 0, &out, &[write])?;
    assert_eq!(out.to_vec(), b"dsp0");

    p.shutdown();
    assert_eq!(
        p.device_ids(DeviceType::ALL),
        Err(ClError::InvalidPlatform)
    );
    Ok(())
}
