use crate::transport::check_range;
use crate::{DevicePtr, MapMode, MappedRegion, SharedMemory, TransportError, TransportResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

type Chunk = Mutex<Option<Box<[u8]>>>;

/// In-process shared DDR window.
///
/// Backed by lazily-allocated fixed-size chunks so a large window costs nothing until touched.
/// Each chunk has its own lock, so cores working on disjoint buffers do not serialise on each
/// other. Untouched memory reads as zero.
pub struct DeviceMemory {
    base: DevicePtr,
    size: u64,
    chunk_size: usize,
    chunks: Box<[Chunk]>,
    mappings: Mutex<HashMap<u64, (DevicePtr, usize)>>,
    next_token: AtomicU64,
}

impl DeviceMemory {
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(base: DevicePtr, size: u64) -> TransportResult<Self> {
        Self::with_chunk_size(base, size, Self::DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(base: DevicePtr, size: u64, chunk_size: usize) -> TransportResult<Self> {
        if chunk_size == 0 {
            return Err(TransportError::InvalidChunkSize { chunk_size });
        }
        base.checked_add(size)
            .ok_or(TransportError::SizeTooLarge { size })?;
        let chunk_size_u64 = chunk_size as u64;
        let chunk_count = size
            .checked_add(chunk_size_u64 - 1)
            .ok_or(TransportError::SizeTooLarge { size })?
            / chunk_size_u64;
        let chunk_count =
            usize::try_from(chunk_count).map_err(|_| TransportError::SizeTooLarge { size })?;
        let chunks = (0..chunk_count).map(|_| Mutex::new(None)).collect();
        Ok(Self {
            base,
            size,
            chunk_size,
            chunks,
            mappings: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Bytes of host memory currently backing the window.
    pub fn resident_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| lock(c).is_some())
            .count() as u64
            * self.chunk_size as u64
    }

    /// Number of regions handed out by `map` and not yet returned through `unmap`.
    pub fn outstanding_maps(&self) -> usize {
        lock(&self.mappings).len()
    }

    /// Splits `[addr, addr + len)` into per-chunk pieces and calls `f(chunk, chunk_off, buf_off, n)`.
    fn for_each_piece(
        &self,
        addr: DevicePtr,
        len: usize,
        mut f: impl FnMut(&Chunk, usize, usize, usize),
    ) -> TransportResult<()> {
        check_range(self.base, self.size, addr, len)?;
        let mut offset = addr - self.base;
        let mut done = 0usize;
        while done < len {
            let chunk_index = (offset / self.chunk_size as u64) as usize;
            let chunk_off = (offset % self.chunk_size as u64) as usize;
            let n = (self.chunk_size - chunk_off).min(len - done);
            let chunk = self.chunks.get(chunk_index).ok_or(TransportError::OutOfRange {
                addr,
                len,
                base: self.base,
                size: self.size,
            })?;
            f(chunk, chunk_off, done, n);
            done += n;
            offset += n as u64;
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedMemory for DeviceMemory {
    fn base(&self) -> DevicePtr {
        self.base
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, src: DevicePtr, dst: &mut [u8]) -> TransportResult<()> {
        self.for_each_piece(src, dst.len(), |chunk, chunk_off, buf_off, n| {
            let out = &mut dst[buf_off..buf_off + n];
            match lock(chunk).as_deref() {
                Some(data) => out.copy_from_slice(&data[chunk_off..chunk_off + n]),
                None => out.fill(0),
            }
        })
    }

    fn write(&self, dst: DevicePtr, src: &[u8]) -> TransportResult<()> {
        let chunk_size = self.chunk_size;
        self.for_each_piece(dst, src.len(), |chunk, chunk_off, buf_off, n| {
            let mut guard = lock(chunk);
            let data = guard.get_or_insert_with(|| vec![0u8; chunk_size].into_boxed_slice());
            data[chunk_off..chunk_off + n].copy_from_slice(&src[buf_off..buf_off + n]);
        })
    }

    fn map(&self, addr: DevicePtr, len: usize, mode: MapMode) -> TransportResult<MappedRegion> {
        let mut bytes = vec![0u8; len];
        if mode.reads() {
            self.read(addr, &mut bytes)?;
        } else {
            check_range(self.base, self.size, addr, len)?;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        lock(&self.mappings).insert(token, (addr, len));
        tracing::trace!(addr, len, ?mode, token, "mapped device range");
        Ok(MappedRegion::with_token(addr, mode, token, bytes))
    }

    fn unmap(&self, region: MappedRegion) -> TransportResult<()> {
        let addr = region.addr();
        {
            let mut mappings = lock(&self.mappings);
            match mappings.get(&region.token()) {
                Some(&(mapped_addr, mapped_len))
                    if mapped_addr == addr && mapped_len == region.len() =>
                {
                    mappings.remove(&region.token());
                }
                _ => return Err(TransportError::NotMapped { addr }),
            }
        }
        if region.mode().writes() {
            self.write(addr, region.as_slice())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_memory_reads_zero_and_costs_nothing() {
        let mem = DeviceMemory::new(0x8000_0000, 1 << 30).unwrap();
        let mut buf = [0xffu8; 16];
        mem.read(0x8000_1000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(mem.resident_bytes(), 0);
    }

    #[test]
    fn writes_span_chunk_boundaries() {
        let mem = DeviceMemory::with_chunk_size(0x1000, 64, 16).unwrap();
        let data: Vec<u8> = (0..40).collect();
        mem.write(0x1000 + 10, &data).unwrap();

        let mut out = vec![0u8; 40];
        mem.read(0x1000 + 10, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(mem.resident_bytes(), 48);
    }

    #[test]
    fn accesses_outside_window_fail() {
        let mem = DeviceMemory::with_chunk_size(0x1000, 64, 16).unwrap();
        assert!(matches!(
            mem.write(0x0fff, &[1]),
            Err(TransportError::OutOfRange { .. })
        ));
        let mut buf = [0u8; 2];
        assert!(mem.read(0x1000 + 63, &mut buf).is_err());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert_eq!(
            DeviceMemory::with_chunk_size(0, 64, 0).unwrap_err(),
            TransportError::InvalidChunkSize { chunk_size: 0 }
        );
    }
}
