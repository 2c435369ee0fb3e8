use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;
use tiocl_shmem::{DevicePtr, DEFAULT_DEVICE_BASE};

/// Bytes of device memory reserved per core for the monitor image.
pub const CODE_WINDOW_BYTES: u64 = 64 * 1024;
/// Alignment of every buffer allocation on the device heap.
pub const HEAP_ALIGN: u64 = 128;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Runtime configuration. [`PlatformConfig::from_env`] reads the `TIOCL_*` variables; anything
/// unset keeps its [`Default`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Hardware ids of the cores in every root device.
    pub compute_units: Vec<u8>,
    /// Number of root devices.
    pub devices: u8,
    pub device_memory_base: DevicePtr,
    pub device_memory_bytes: u64,
    /// Capacity of each direction of each core's mailbox.
    pub mailbox_bytes: usize,
    /// Idle sleep of the simulated cores and the completion workers.
    pub worker_poll: Duration,
    /// A core that has not answered a launch within this long is declared lost.
    pub kernel_timeout: Option<Duration>,
    /// Expose the built-in-kernel custom device.
    pub custom_device: bool,
    pub core_mhz: u32,
    pub debug: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            compute_units: (0..4).collect(),
            devices: 1,
            device_memory_base: DEFAULT_DEVICE_BASE,
            device_memory_bytes: 256 * 1024 * 1024,
            mailbox_bytes: tiocl_mbox::layout::DEFAULT_MAILBOX_BYTES,
            worker_poll: Duration::from_micros(100),
            kernel_timeout: None,
            custom_device: false,
            core_mhz: 600,
            debug: false,
        }
    }
}

impl PlatformConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`PlatformConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let get = |var: &'static str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (var, v))
        };

        if let Some((var, raw)) = get("TIOCL_COMPUTE_UNIT_LIST") {
            cfg.compute_units = parse_unit_list(&raw).ok_or(ConfigError::InvalidEnv {
                var,
                value: raw.clone(),
            })?;
        }
        if let Some((var, raw)) = get("TIOCL_NUM_DEVICES") {
            cfg.devices = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("TIOCL_DEVICE_MEMORY_MB") {
            let mb: u64 = parse(var, &raw)?;
            cfg.device_memory_bytes = mb
                .checked_mul(1024 * 1024)
                .ok_or(ConfigError::InvalidEnv { var, value: raw })?;
        }
        if let Some((var, raw)) = get("TIOCL_MAILBOX_BYTES") {
            cfg.mailbox_bytes = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("TIOCL_WORKER_SLEEP_US") {
            cfg.worker_poll = Duration::from_micros(parse(var, &raw)?);
        }
        if let Some((var, raw)) = get("TIOCL_KERNEL_TIMEOUT_MS") {
            let ms: u64 = parse(var, &raw)?;
            cfg.kernel_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some((var, raw)) = get("TIOCL_CUSTOM_DEVICE_ENABLE") {
            cfg.custom_device = parse_bool(var, &raw)?;
        }
        if let Some((var, raw)) = get("TIOCL_CORE_MHZ") {
            cfg.core_mhz = parse(var, &raw)?;
        }
        if let Some((var, raw)) = get("TIOCL_DEBUG") {
            cfg.debug = parse_bool(var, &raw)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compute_units.is_empty() {
            return Err(ConfigError::Invalid("no compute units"));
        }
        let unique: BTreeSet<_> = self.compute_units.iter().collect();
        if unique.len() != self.compute_units.len() {
            return Err(ConfigError::Invalid("duplicate compute unit"));
        }
        if self.compute_units.len() > usize::from(u8::MAX) {
            return Err(ConfigError::Invalid("too many compute units"));
        }
        if self.devices == 0 {
            return Err(ConfigError::Invalid("at least one device is required"));
        }
        if self.mailbox_bytes < tiocl_mbox::layout::MIN_RING_BYTES {
            return Err(ConfigError::Invalid("mailbox too small"));
        }
        if self.heap_bytes() == 0 {
            return Err(ConfigError::Invalid("device memory too small for code windows"));
        }
        Ok(())
    }

    /// Bytes reserved at the bottom of device memory for the per-core code windows.
    pub fn code_bytes(&self) -> u64 {
        u64::from(self.devices) * self.compute_units.len() as u64 * CODE_WINDOW_BYTES
    }

    pub fn code_base(&self, device: u8) -> DevicePtr {
        self.device_memory_base
            + u64::from(device) * self.compute_units.len() as u64 * CODE_WINDOW_BYTES
    }

    pub fn heap_base(&self) -> DevicePtr {
        self.device_memory_base + self.code_bytes()
    }

    pub fn heap_bytes(&self) -> u64 {
        self.device_memory_bytes.saturating_sub(self.code_bytes())
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: raw.to_string(),
        }),
    }
}

/// Parses `"0,1,2"` or `"0-3"` style lists, or any mix of the two.
fn parse_unit_list(raw: &str) -> Option<Vec<u8>> {
    let mut units = Vec::new();
    for part in raw.split(',').map(str::trim) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u8 = lo.trim().parse().ok()?;
                let hi: u8 = hi.trim().parse().ok()?;
                if lo > hi {
                    return None;
                }
                units.extend(lo..=hi);
            }
            None => units.push(part.parse().ok()?),
        }
    }
    Some(units)
}
