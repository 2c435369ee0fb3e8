#![forbid(unsafe_code)]

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tiocl_core::flags::DeviceType;
use tiocl_core::{
    describe_status, DeviceHandle, DeviceInfo, Partition, Platform, PlatformConfig,
    PlatformOptions,
};

#[derive(Parser, Debug)]
#[command(
    name = "tiocl-info",
    about = "Bring up the tiocl platform and describe it and its devices. Configuration comes from TIOCL_* environment variables."
)]
struct Args {
    /// Print a JSON report instead of text
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Also split every accelerator into sub-devices of this many compute units
    #[arg(long, value_name = "UNITS")]
    partition: Option<usize>,

    /// Expose the custom device (same as TIOCL_CUSTOM_DEVICE_ENABLE=1)
    #[arg(long, action = clap::ArgAction::SetTrue)]
    custom: bool,

    /// Describe a status code and exit without opening the platform
    #[arg(long, value_name = "CODE", allow_hyphen_values = true)]
    status: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    platform: PlatformReport,
    devices: Vec<DeviceReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlatformReport {
    name: String,
    vendor: String,
    version: String,
    profile: String,
    compute_units: Vec<u8>,
    root_devices: u8,
    device_memory_bytes: u64,
    heap_bytes: u64,
    mailbox_bytes: usize,
    worker_poll_us: u128,
    kernel_timeout_ms: Option<u128>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceReport {
    id: u32,
    name: String,
    vendor: String,
    version: String,
    device_type: Vec<&'static str>,
    available: bool,
    compute_units: Vec<u8>,
    max_clock_mhz: u32,
    global_mem_size: u64,
    max_mem_alloc_size: u64,
    max_work_group_size: u64,
    built_in_kernels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sub_devices: Vec<DeviceReport>,
}

impl From<DeviceInfo> for DeviceReport {
    fn from(info: DeviceInfo) -> Self {
        Self {
            id: info.id.0,
            name: info.name,
            vendor: info.vendor,
            version: info.version,
            device_type: info.device_type.iter_names().map(|(name, _)| name).collect(),
            available: info.available,
            compute_units: info.compute_units,
            max_clock_mhz: info.max_clock_mhz,
            global_mem_size: info.global_mem_size,
            max_mem_alloc_size: info.max_mem_alloc_size,
            max_work_group_size: info.max_work_group_size,
            built_in_kernels: info.built_in_kernels,
            parent: info.parent.map(|p| p.0),
            sub_devices: Vec::new(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> anyhow::Result<()> {
    if let Some(code) = args.status {
        println!("{code}: {}", describe_status(code));
        return Ok(());
    }
    if args.partition == Some(0) {
        bail!("--partition needs at least one compute unit per sub-device");
    }

    let mut config = PlatformConfig::from_env().context("read TIOCL_* configuration")?;
    if args.custom {
        config.custom_device = true;
    }
    let platform =
        Platform::try_open(PlatformOptions::new(config)).context("bring up the platform")?;
    let report = collect(&platform, args.partition)?;
    platform.shutdown();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }
    Ok(())
}

fn collect(platform: &Platform, partition: Option<usize>) -> anyhow::Result<Report> {
    let info = platform.info();
    let config = platform.config();
    let mut devices = Vec::new();
    for handle in platform.device_ids(DeviceType::ALL).context("list devices")? {
        let mut device = DeviceReport::from(platform.device_info(handle)?);
        if let Some(units) = partition {
            device.sub_devices = split(platform, handle, units)
                .with_context(|| format!("partition device {}", device.id))?;
        }
        devices.push(device);
    }
    tracing::debug!(devices = devices.len(), "collected device info");

    Ok(Report {
        platform: PlatformReport {
            name: info.name,
            vendor: info.vendor,
            version: info.version,
            profile: info.profile,
            compute_units: config.compute_units.clone(),
            root_devices: config.devices,
            device_memory_bytes: config.device_memory_bytes,
            heap_bytes: config.heap_bytes(),
            mailbox_bytes: config.mailbox_bytes,
            worker_poll_us: config.worker_poll.as_micros(),
            kernel_timeout_ms: config.kernel_timeout.map(|t| t.as_millis()),
        },
        devices,
    })
}

/// Sub-devices of an accelerator; custom and single-unit devices have none.
fn split(
    platform: &Platform,
    device: DeviceHandle,
    units: usize,
) -> anyhow::Result<Vec<DeviceReport>> {
    let info = platform.device_info(device)?;
    if !info.device_type.contains(DeviceType::ACCELERATOR) || info.compute_units.len() < 2 {
        return Ok(Vec::new());
    }
    let subs = platform.create_sub_devices(device, &Partition::Equally(units))?;
    let reports = subs
        .iter()
        .map(|sub| platform.device_info(*sub).map(DeviceReport::from))
        .collect::<Result<Vec<_>, _>>()?;
    for sub in subs {
        platform.release_device(sub)?;
    }
    Ok(reports)
}

fn print_text(report: &Report) {
    let p = &report.platform;
    println!("{} ({}), {}, {}", p.name, p.vendor, p.version, p.profile);
    println!(
        "  {} root device(s), compute units {:?}, heap {} KiB of {} KiB, mailbox {} bytes",
        p.root_devices,
        p.compute_units,
        p.heap_bytes / 1024,
        p.device_memory_bytes / 1024,
        p.mailbox_bytes
    );
    match p.kernel_timeout_ms {
        Some(ms) => println!("  poll {} us, kernel timeout {ms} ms", p.worker_poll_us),
        None => println!("  poll {} us, no kernel timeout", p.worker_poll_us),
    }
    for device in &report.devices {
        print_device(device, 0);
    }
}

fn print_device(device: &DeviceReport, depth: usize) {
    let pad = "  ".repeat(depth + 1);
    println!();
    println!("{pad}dev{}: {}", device.id, device.name);
    println!("{pad}  type: {}", device.device_type.join(" | "));
    println!(
        "{pad}  available: {}, compute units: {:?}, {} MHz",
        device.available, device.compute_units, device.max_clock_mhz
    );
    println!(
        "{pad}  global memory: {} KiB, max allocation: {} KiB, max work-group: {}",
        device.global_mem_size / 1024,
        device.max_mem_alloc_size / 1024,
        device.max_work_group_size
    );
    if !device.built_in_kernels.is_empty() {
        println!("{pad}  built-in kernels: {}", device.built_in_kernels.join(";"));
    }
    for sub in &device.sub_devices {
        print_device(sub, depth + 1);
    }
}
