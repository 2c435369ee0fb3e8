//! Kernel bodies and the context a core runs them in.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tiocl_mbox::{KernelArg, NdRange};
use tiocl_shmem::{DevicePtr, SharedMemory, TransportError};

/// Status codes a core reports back for a kernel share.
pub mod retcode {
    pub const SUCCESS: i32 = 0;
    pub const OUT_OF_RESOURCES: i32 = -5;
    pub const INVALID_KERNEL: i32 = -48;
    pub const INVALID_KERNEL_ARGS: i32 = -52;
}

/// Ways a kernel body can stop early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelFault {
    #[error("argument {index} is missing or has the wrong kind")]
    BadArg { index: usize },
    #[error("access of {len} bytes at offset {offset} is outside argument {index}")]
    OutOfBounds { index: usize, offset: u64, len: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The kernel itself reports failure. Negative codes are passed through as the event status.
    #[error("kernel failed with status {0}")]
    Failed(i32),
    /// The core wedges: it stops servicing its mailbox and never replies.
    #[error("core stopped responding")]
    Hang,
}

impl KernelFault {
    /// Return code to report, or `None` if the core must go silent.
    pub fn retcode(&self) -> Option<i32> {
        Some(match self {
            KernelFault::BadArg { .. } => retcode::INVALID_KERNEL_ARGS,
            KernelFault::OutOfBounds { .. } | KernelFault::Transport(_) => {
                retcode::OUT_OF_RESOURCES
            }
            KernelFault::Failed(code) if *code < 0 => *code,
            KernelFault::Failed(_) => retcode::OUT_OF_RESOURCES,
            KernelFault::Hang => return None,
        })
    }
}

pub type KernelFn = Arc<dyn Fn(&KernelContext<'_>) -> Result<(), KernelFault> + Send + Sync>;

/// A buffer argument as seen from the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferArg {
    pub addr: DevicePtr,
    pub size: u64,
}

/// Everything a kernel body may touch while running one core's share of a launch.
pub struct KernelContext<'a> {
    core: u8,
    ndrange: &'a NdRange,
    items: Range<u64>,
    args: &'a [KernelArg],
    memory: &'a dyn SharedMemory,
    prints: RefCell<Vec<String>>,
}

impl<'a> KernelContext<'a> {
    pub fn new(
        core: u8,
        ndrange: &'a NdRange,
        items: Range<u64>,
        args: &'a [KernelArg],
        memory: &'a dyn SharedMemory,
    ) -> Self {
        Self {
            core,
            ndrange,
            items,
            args,
            memory,
            prints: RefCell::new(Vec::new()),
        }
    }

    pub fn core(&self) -> u8 {
        self.core
    }

    pub fn ndrange(&self) -> &NdRange {
        self.ndrange
    }

    /// Linear ids of the work items this core owns.
    pub fn work_items(&self) -> Range<u64> {
        self.items.clone()
    }

    pub fn global_id(&self, linear: u64) -> [u64; 3] {
        self.ndrange.global_id(linear)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn buffer(&self, index: usize) -> Result<BufferArg, KernelFault> {
        match self.args.get(index) {
            Some(KernelArg::Buffer { addr, size }) => Ok(BufferArg {
                addr: *addr,
                size: *size,
            }),
            _ => Err(KernelFault::BadArg { index }),
        }
    }

    pub fn scalar(&self, index: usize) -> Result<&'a [u8], KernelFault> {
        match self.args.get(index) {
            Some(KernelArg::Scalar(bytes)) => Ok(bytes),
            _ => Err(KernelFault::BadArg { index }),
        }
    }

    pub fn scalar_u32(&self, index: usize) -> Result<u32, KernelFault> {
        let bytes = self.scalar(index)?;
        let word: [u8; 4] = bytes
            .try_into()
            .map_err(|_| KernelFault::BadArg { index })?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn local_size(&self, index: usize) -> Result<u64, KernelFault> {
        match self.args.get(index) {
            Some(KernelArg::Local { size }) => Ok(*size),
            _ => Err(KernelFault::BadArg { index }),
        }
    }

    pub fn read(&self, index: usize, offset: u64, dst: &mut [u8]) -> Result<(), KernelFault> {
        let addr = self.checked_addr(index, offset, dst.len())?;
        Ok(self.memory.read(addr, dst)?)
    }

    pub fn read_vec(&self, index: usize, offset: u64, len: usize) -> Result<Vec<u8>, KernelFault> {
        let mut out = vec![0u8; len];
        self.read(index, offset, &mut out)?;
        Ok(out)
    }

    pub fn write(&self, index: usize, offset: u64, src: &[u8]) -> Result<(), KernelFault> {
        let addr = self.checked_addr(index, offset, src.len())?;
        Ok(self.memory.write(addr, src)?)
    }

    /// Kernel `printf`. Lines are forwarded to the host after the share completes.
    pub fn print(&self, message: impl Into<String>) {
        self.prints.borrow_mut().push(message.into());
    }

    pub fn take_prints(&self) -> Vec<String> {
        std::mem::take(&mut *self.prints.borrow_mut())
    }

    fn checked_addr(&self, index: usize, offset: u64, len: usize) -> Result<DevicePtr, KernelFault> {
        let buf = self.buffer(index)?;
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= buf.size => Ok(buf.addr + offset),
            _ => Err(KernelFault::OutOfBounds { index, offset, len }),
        }
    }
}

#[derive(Clone)]
struct LibraryKernel {
    body: KernelFn,
    arity: Option<u32>,
}

/// Host-registered kernel bodies, looked up by name when a program is built.
#[derive(Clone, Default)]
pub struct KernelLibrary {
    kernels: BTreeMap<String, LibraryKernel>,
}

impl KernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kernel<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&KernelContext<'_>) -> Result<(), KernelFault> + Send + Sync + 'static,
    {
        self.register(name, None, body);
        self
    }

    /// Like [`KernelLibrary::with_kernel`], also declaring how many arguments the body expects.
    pub fn with_kernel_arity<F>(mut self, name: &str, arity: u32, body: F) -> Self
    where
        F: Fn(&KernelContext<'_>) -> Result<(), KernelFault> + Send + Sync + 'static,
    {
        self.register(name, Some(arity), body);
        self
    }

    pub fn register<F>(&mut self, name: &str, arity: Option<u32>, body: F)
    where
        F: Fn(&KernelContext<'_>) -> Result<(), KernelFault> + Send + Sync + 'static,
    {
        self.kernels.insert(
            name.to_string(),
            LibraryKernel {
                body: Arc::new(body),
                arity,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<KernelFn> {
        self.kernels.get(name).map(|k| Arc::clone(&k.body))
    }

    /// Declared argument count, if the kernel was registered with one.
    pub fn arity(&self, name: &str) -> Option<u32> {
        self.kernels.get(name).and_then(|k| k.arity)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kernels.keys()).finish()
    }
}

struct TableEntry {
    name: String,
    body: KernelFn,
}

/// Kernels currently loaded on the cores, indexed by the entry id carried in launch messages.
#[derive(Default)]
pub struct KernelTable {
    entries: RwLock<HashMap<u32, TableEntry>>,
    next_entry: AtomicU32,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, body: KernelFn) -> u32 {
        let entry = self.next_entry.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                entry,
                TableEntry {
                    name: name.to_string(),
                    body,
                },
            );
        tracing::trace!(entry, name, "kernel registered");
        entry
    }

    pub fn unregister(&self, entry: u32) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entry)
            .is_some()
    }

    pub fn lookup(&self, entry: u32) -> Option<(String, KernelFn)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entry)
            .map(|e| (e.name.clone(), Arc::clone(&e.body)))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for KernelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelTable")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiocl_shmem::DeviceMemory;

    fn args() -> Vec<KernelArg> {
        vec![
            KernelArg::Buffer {
                addr: 0x100,
                size: 16,
            },
            KernelArg::Scalar(7u32.to_le_bytes().to_vec()),
            KernelArg::Local { size: 64 },
        ]
    }

    #[test]
    fn context_bounds_checks_buffer_access() {
        let mem = DeviceMemory::new(0, 0x1000).unwrap();
        let nd = NdRange::linear(4);
        let args = args();
        let ctx = KernelContext::new(0, &nd, 0..4, &args, &mem);

        ctx.write(0, 12, &[1, 2, 3, 4]).unwrap();
        assert_eq!(ctx.read_vec(0, 12, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            ctx.write(0, 13, &[0; 4]),
            Err(KernelFault::OutOfBounds {
                index: 0,
                offset: 13,
                len: 4
            })
        );
        assert_eq!(ctx.scalar_u32(1).unwrap(), 7);
        assert_eq!(ctx.local_size(2).unwrap(), 64);
        assert_eq!(ctx.buffer(1), Err(KernelFault::BadArg { index: 1 }));
    }

    #[test]
    fn fault_retcodes() {
        assert_eq!(KernelFault::Failed(-9).retcode(), Some(-9));
        assert_eq!(KernelFault::Failed(3).retcode(), Some(retcode::OUT_OF_RESOURCES));
        assert_eq!(
            KernelFault::BadArg { index: 0 }.retcode(),
            Some(retcode::INVALID_KERNEL_ARGS)
        );
        assert_eq!(KernelFault::Hang.retcode(), None);
    }

    fn noop(_ctx: &KernelContext<'_>) -> Result<(), KernelFault> {
        Ok(())
    }

    #[test]
    fn library_tracks_declared_arity() {
        let lib = KernelLibrary::new()
            .with_kernel("free", noop)
            .with_kernel_arity("fixed", 3, noop);
        assert_eq!(lib.arity("free"), None);
        assert_eq!(lib.arity("fixed"), Some(3));
        assert_eq!(lib.names().collect::<Vec<_>>(), vec!["fixed", "free"]);
        assert!(lib.get("missing").is_none());
    }

    #[test]
    fn table_entries_are_unique_and_removable() {
        let table = KernelTable::new();
        let body: KernelFn = Arc::new(noop);
        let a = table.register("a", Arc::clone(&body));
        let b = table.register("b", body);
        assert_ne!(a, b);
        assert_eq!(table.lookup(b).map(|(name, _)| name).as_deref(), Some("b"));
        assert!(table.unregister(a));
        assert!(!table.unregister(a));
        assert_eq!(table.len(), 1);
    }
}
