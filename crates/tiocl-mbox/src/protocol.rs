//! Mailbox message protocol.
//!
//! Every message starts with a little-endian `u16` tag. Host → core tags live in `0x00xx`,
//! core → host tags in `0x10xx`. Trailing bytes after a decoded message are a format violation.

use crate::layout::{MBOX_MAGIC, MBOX_VERSION};
use crate::NdRange;
use thiserror::Error;

/// Host → core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    /// First message after a core starts: tells the monitor its peers.
    ConfigureMonitor {
        magic: u32,
        version: u32,
        n_cores: u8,
        master_core: u8,
    },
    QueryFrequency,
    /// Run this core's share of an NDRange.
    NdrKernel(KernelLaunch),
    /// Run a single work item.
    Task(KernelLaunch),
    CacheInvalidate,
    Exit,
}

impl HostMessage {
    pub fn configure(n_cores: u8, master_core: u8) -> Self {
        HostMessage::ConfigureMonitor {
            magic: MBOX_MAGIC,
            version: MBOX_VERSION,
            n_cores,
            master_core,
        }
    }
}

/// Core → host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreMessage {
    Frequency { core: u8, mhz: u32 },
    /// A kernel share finished. `retcode` is 0 or a negative status.
    Complete {
        core: u8,
        work_idx: u32,
        retcode: i32,
        elapsed_ns: u64,
    },
    /// `printf` output from a kernel.
    Print { core: u8, message: String },
    /// The monitor rejected a message.
    Error { core: u8, message: String },
    ExitAck { core: u8 },
}

impl CoreMessage {
    pub fn core(&self) -> u8 {
        match self {
            CoreMessage::Frequency { core, .. }
            | CoreMessage::Complete { core, .. }
            | CoreMessage::Print { core, .. }
            | CoreMessage::Error { core, .. }
            | CoreMessage::ExitAck { core } => *core,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    pub work_idx: u32,
    /// Index into the core's kernel table.
    pub entry: u32,
    /// This core's position among the cores the launch was sent to.
    pub part: u8,
    pub parts: u8,
    pub ndrange: NdRange,
    pub args: Vec<KernelArg>,
}

/// One bound kernel argument as the core sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    Buffer { addr: u64, size: u64 },
    Scalar(Vec<u8>),
    Local { size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of message")]
    UnexpectedEof,
    #[error("invalid enum value {0}")]
    InvalidEnum(u8),
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("unknown tag 0x{0:04x}")]
    UnknownTag(u16),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
    #[error("message too large")]
    OversizedPayload,
}

/// Upper bound on a decoded message.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

const HOST_TAG_CONFIGURE: u16 = 0x0001;
const HOST_TAG_FREQUENCY: u16 = 0x0002;
const HOST_TAG_NDR_KERNEL: u16 = 0x0010;
const HOST_TAG_TASK: u16 = 0x0011;
const HOST_TAG_CACHE_INV: u16 = 0x0020;
const HOST_TAG_EXIT: u16 = 0x00ff;

const CORE_TAG_FREQUENCY: u16 = 0x1002;
const CORE_TAG_COMPLETE: u16 = 0x1010;
const CORE_TAG_PRINT: u16 = 0x1030;
const CORE_TAG_ERROR: u16 = 0x10fe;
const CORE_TAG_EXIT_ACK: u16 = 0x10ff;

const ARG_BUFFER: u8 = 0;
const ARG_SCALAR: u8 = 1;
const ARG_LOCAL: u8 = 2;

pub fn encode_host(msg: &HostMessage) -> Vec<u8> {
    let mut out = Vec::new();
    match msg {
        HostMessage::ConfigureMonitor {
            magic,
            version,
            n_cores,
            master_core,
        } => {
            push_u16(&mut out, HOST_TAG_CONFIGURE);
            push_u32(&mut out, *magic);
            push_u32(&mut out, *version);
            out.push(*n_cores);
            out.push(*master_core);
        }
        HostMessage::QueryFrequency => push_u16(&mut out, HOST_TAG_FREQUENCY),
        HostMessage::NdrKernel(launch) => {
            push_u16(&mut out, HOST_TAG_NDR_KERNEL);
            encode_launch(launch, &mut out);
        }
        HostMessage::Task(launch) => {
            push_u16(&mut out, HOST_TAG_TASK);
            encode_launch(launch, &mut out);
        }
        HostMessage::CacheInvalidate => push_u16(&mut out, HOST_TAG_CACHE_INV),
        HostMessage::Exit => push_u16(&mut out, HOST_TAG_EXIT),
    }
    out
}

pub fn encode_core(msg: &CoreMessage) -> Vec<u8> {
    let mut out = Vec::new();
    match msg {
        CoreMessage::Frequency { core, mhz } => {
            push_u16(&mut out, CORE_TAG_FREQUENCY);
            out.push(*core);
            push_u32(&mut out, *mhz);
        }
        CoreMessage::Complete {
            core,
            work_idx,
            retcode,
            elapsed_ns,
        } => {
            push_u16(&mut out, CORE_TAG_COMPLETE);
            out.push(*core);
            push_u32(&mut out, *work_idx);
            push_u32(&mut out, *retcode as u32);
            push_u64(&mut out, *elapsed_ns);
        }
        CoreMessage::Print { core, message } => {
            push_u16(&mut out, CORE_TAG_PRINT);
            out.push(*core);
            push_str(&mut out, message);
        }
        CoreMessage::Error { core, message } => {
            push_u16(&mut out, CORE_TAG_ERROR);
            out.push(*core);
            push_str(&mut out, message);
        }
        CoreMessage::ExitAck { core } => {
            push_u16(&mut out, CORE_TAG_EXIT_ACK);
            out.push(*core);
        }
    }
    out
}

fn encode_launch(launch: &KernelLaunch, out: &mut Vec<u8>) {
    push_u32(out, launch.work_idx);
    push_u32(out, launch.entry);
    out.push(launch.part);
    out.push(launch.parts);
    let nd = &launch.ndrange;
    out.push(nd.work_dim);
    for v in nd.offset.iter().chain(&nd.global).chain(&nd.local) {
        push_u64(out, *v);
    }
    push_u32(out, launch.args.len() as u32);
    for arg in &launch.args {
        match arg {
            KernelArg::Buffer { addr, size } => {
                out.push(ARG_BUFFER);
                push_u64(out, *addr);
                push_u64(out, *size);
            }
            KernelArg::Scalar(bytes) => {
                out.push(ARG_SCALAR);
                push_u32(out, bytes.len() as u32);
                out.extend_from_slice(bytes);
            }
            KernelArg::Local { size } => {
                out.push(ARG_LOCAL);
                push_u64(out, *size);
            }
        }
    }
}

pub fn decode_host(bytes: &[u8]) -> Result<HostMessage, DecodeError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(DecodeError::OversizedPayload);
    }
    let mut r = Reader::new(bytes);
    let msg = match r.read_u16()? {
        HOST_TAG_CONFIGURE => HostMessage::ConfigureMonitor {
            magic: r.read_u32()?,
            version: r.read_u32()?,
            n_cores: r.read_u8()?,
            master_core: r.read_u8()?,
        },
        HOST_TAG_FREQUENCY => HostMessage::QueryFrequency,
        HOST_TAG_NDR_KERNEL => HostMessage::NdrKernel(decode_launch(&mut r)?),
        HOST_TAG_TASK => HostMessage::Task(decode_launch(&mut r)?),
        HOST_TAG_CACHE_INV => HostMessage::CacheInvalidate,
        HOST_TAG_EXIT => HostMessage::Exit,
        tag => return Err(DecodeError::UnknownTag(tag)),
    };
    r.finish()?;
    Ok(msg)
}

pub fn decode_core(bytes: &[u8]) -> Result<CoreMessage, DecodeError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(DecodeError::OversizedPayload);
    }
    let mut r = Reader::new(bytes);
    let msg = match r.read_u16()? {
        CORE_TAG_FREQUENCY => CoreMessage::Frequency {
            core: r.read_u8()?,
            mhz: r.read_u32()?,
        },
        CORE_TAG_COMPLETE => CoreMessage::Complete {
            core: r.read_u8()?,
            work_idx: r.read_u32()?,
            retcode: r.read_u32()? as i32,
            elapsed_ns: r.read_u64()?,
        },
        CORE_TAG_PRINT => CoreMessage::Print {
            core: r.read_u8()?,
            message: r.read_str()?,
        },
        CORE_TAG_ERROR => CoreMessage::Error {
            core: r.read_u8()?,
            message: r.read_str()?,
        },
        CORE_TAG_EXIT_ACK => CoreMessage::ExitAck { core: r.read_u8()? },
        tag => return Err(DecodeError::UnknownTag(tag)),
    };
    r.finish()?;
    Ok(msg)
}

fn decode_launch(r: &mut Reader<'_>) -> Result<KernelLaunch, DecodeError> {
    let work_idx = r.read_u32()?;
    let entry = r.read_u32()?;
    let part = r.read_u8()?;
    let parts = r.read_u8()?;
    let work_dim = r.read_u8()?;
    let mut dims = [[0u64; 3]; 3];
    for dim in &mut dims {
        for v in dim.iter_mut() {
            *v = r.read_u64()?;
        }
    }
    let [offset, global, local] = dims;
    let n_args = r.read_u32()? as usize;
    // Each argument takes at least five bytes; reject counts the payload cannot hold.
    if n_args > r.remaining() / 5 {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut args = Vec::with_capacity(n_args);
    for _ in 0..n_args {
        let arg = match r.read_u8()? {
            ARG_BUFFER => KernelArg::Buffer {
                addr: r.read_u64()?,
                size: r.read_u64()?,
            },
            ARG_SCALAR => {
                let len = r.read_u32()? as usize;
                KernelArg::Scalar(r.read_bytes(len)?.to_vec())
            }
            ARG_LOCAL => KernelArg::Local {
                size: r.read_u64()?,
            },
            other => return Err(DecodeError::InvalidEnum(other)),
        };
        args.push(arg);
    }
    Ok(KernelLaunch {
        work_idx,
        entry,
        part,
        parts,
        ndrange: NdRange {
            work_dim,
            offset,
            global,
            local,
        },
        args,
    })
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    push_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_str(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }
}
