use crate::{DevicePtr, TransportError, TransportResult};

/// Direction of a host mapping of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    Read,
    Write,
    ReadWrite,
}

impl MapMode {
    pub fn reads(self) -> bool {
        matches!(self, MapMode::Read | MapMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, MapMode::Write | MapMode::ReadWrite)
    }
}

/// Host-visible copy of a device range, produced by [`SharedMemory::map`].
///
/// Write-mode regions are flushed back to the device by [`SharedMemory::unmap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRegion {
    addr: DevicePtr,
    mode: MapMode,
    token: u64,
    bytes: Vec<u8>,
}

impl MappedRegion {
    pub fn new(addr: DevicePtr, mode: MapMode, bytes: Vec<u8>) -> Self {
        Self::with_token(addr, mode, 0, bytes)
    }

    pub fn with_token(addr: DevicePtr, mode: MapMode, token: u64, bytes: Vec<u8>) -> Self {
        Self {
            addr,
            mode,
            token,
            bytes,
        }
    }

    pub fn addr(&self) -> DevicePtr {
        self.addr
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-level access to memory shared between the host and the compute cores.
///
/// Every method takes `&self`: the host dispatch worker and all simulated cores hit the same
/// window concurrently. Keeping unsynchronised accesses to overlapping ranges apart is the
/// caller's job.
pub trait SharedMemory: Send + Sync {
    /// First device address of the window.
    fn base(&self) -> DevicePtr;

    /// Window size in bytes.
    fn size(&self) -> u64;

    fn read(&self, src: DevicePtr, dst: &mut [u8]) -> TransportResult<()>;

    fn write(&self, dst: DevicePtr, src: &[u8]) -> TransportResult<()>;

    /// Makes `len` bytes at `addr` visible to the host.
    fn map(&self, addr: DevicePtr, len: usize, mode: MapMode) -> TransportResult<MappedRegion> {
        check_range(self.base(), self.size(), addr, len)?;
        let mut bytes = vec![0u8; len];
        if mode.reads() {
            self.read(addr, &mut bytes)?;
        }
        Ok(MappedRegion::new(addr, mode, bytes))
    }

    fn unmap(&self, region: MappedRegion) -> TransportResult<()> {
        if region.mode().writes() {
            self.write(region.addr(), region.as_slice())?;
        }
        Ok(())
    }

    fn contains(&self, addr: DevicePtr, len: usize) -> bool {
        check_range(self.base(), self.size(), addr, len).is_ok()
    }

    /// Device-to-device copy. Overlapping ranges behave like `memmove`.
    fn copy(&self, src: DevicePtr, dst: DevicePtr, len: usize) -> TransportResult<()> {
        let mut tmp = vec![0u8; len];
        self.read(src, &mut tmp)?;
        self.write(dst, &tmp)
    }

    fn read_u32_le(&self, addr: DevicePtr) -> TransportResult<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32_le(&self, addr: DevicePtr, value: u32) -> TransportResult<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// Validates that `[addr, addr + len)` lies within `[base, base + size)`.
pub(crate) fn check_range(
    base: DevicePtr,
    size: u64,
    addr: DevicePtr,
    len: usize,
) -> TransportResult<()> {
    let err = TransportError::OutOfRange {
        addr,
        len,
        base,
        size,
    };
    let end = addr.checked_add(len as u64).ok_or(err.clone())?;
    let window_end = base.checked_add(size).ok_or(err.clone())?;
    if addr < base || end > window_end {
        return Err(err);
    }
    Ok(())
}
