use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tiocl_shmem::{DevicePtr, Heap};
use tracing::{trace, warn};

use crate::command::Mapping;
use crate::flags::MemFlags;
use crate::handle::ContextHandle;
use crate::{ClError, ClResult};

/// A range of the device heap, returned to the heap on drop.
pub(crate) struct DeviceAllocation {
    addr: DevicePtr,
    heap: Arc<Mutex<Heap>>,
}

impl DeviceAllocation {
    pub(crate) fn new(heap: &Arc<Mutex<Heap>>, size: u64) -> ClResult<Self> {
        let addr = heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .alloc(size)
            .map_err(|err| {
                warn!(size, %err, "device heap allocation failed");
                ClError::MemObjectAllocationFailure
            })?;
        trace!(addr, size, "device allocation");
        Ok(Self {
            addr,
            heap: Arc::clone(heap),
        })
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        let freed = self
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free(self.addr);
        if let Err(err) = freed {
            warn!(addr = self.addr, %err, "device allocation already gone");
        }
    }
}

enum MemKind {
    Buffer(DeviceAllocation),
    SubBuffer { parent: Arc<MemObject>, origin: u64 },
}

/// A buffer or a sub-buffer region of one.
pub struct MemObject {
    context: ContextHandle,
    flags: MemFlags,
    size: u64,
    kind: MemKind,
    maps: Mutex<HashMap<u64, Arc<Mapping>>>,
}

impl MemObject {
    pub(crate) fn buffer(
        context: ContextHandle,
        flags: MemFlags,
        size: u64,
        storage: DeviceAllocation,
    ) -> Self {
        Self {
            context,
            flags,
            size,
            kind: MemKind::Buffer(storage),
            maps: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn sub_buffer(
        parent: &Arc<MemObject>,
        flags: MemFlags,
        origin: u64,
        size: u64,
    ) -> ClResult<Self> {
        let flags = validate_sub_buffer(
            parent.flags,
            parent.is_sub_buffer(),
            parent.size,
            flags,
            origin,
            size,
        )?;
        Ok(Self {
            context: parent.context,
            flags,
            size,
            kind: MemKind::SubBuffer {
                parent: Arc::clone(parent),
                origin,
            },
            maps: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_sub_buffer(&self) -> bool {
        matches!(self.kind, MemKind::SubBuffer { .. })
    }

    pub fn origin(&self) -> u64 {
        match &self.kind {
            MemKind::Buffer(_) => 0,
            MemKind::SubBuffer { origin, .. } => *origin,
        }
    }

    pub fn device_addr(&self) -> DevicePtr {
        match &self.kind {
            MemKind::Buffer(storage) => storage.addr,
            MemKind::SubBuffer { parent, origin } => parent.device_addr() + origin,
        }
    }

    /// `[offset, offset + len)` must lie inside the object.
    pub(crate) fn check_region(&self, offset: u64, len: u64) -> ClResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ClError::InvalidValue),
        }
    }

    /// Whether two regions alias the same device bytes.
    pub(crate) fn regions_overlap(
        &self,
        offset: u64,
        other: &MemObject,
        other_offset: u64,
        len: u64,
    ) -> bool {
        let a = self.device_addr() + offset;
        let b = other.device_addr() + other_offset;
        len > 0 && a < b + len && b < a + len
    }

    fn maps(&self) -> MutexGuard<'_, HashMap<u64, Arc<Mapping>>> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_mapping(&self, mapping: Arc<Mapping>) {
        self.maps().insert(mapping.id, mapping);
    }

    pub(crate) fn take_mapping(&self, id: u64) -> Option<Arc<Mapping>> {
        self.maps().remove(&id)
    }

    pub fn map_count(&self) -> usize {
        self.maps().len()
    }
}

impl fmt::Debug for MemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemObject")
            .field("addr", &format_args!("{:#x}", self.device_addr()))
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("sub_buffer", &self.is_sub_buffer())
            .finish()
    }
}

/// Checks a sub-buffer request and returns the flags the sub-buffer ends up with.
pub(crate) fn validate_sub_buffer(
    parent_flags: MemFlags,
    parent_is_sub: bool,
    parent_size: u64,
    flags: MemFlags,
    origin: u64,
    size: u64,
) -> ClResult<MemFlags> {
    if parent_is_sub {
        return Err(ClError::InvalidMemObject);
    }
    if flags.intersects(MemFlags::HOST_PTR) || (flags & MemFlags::ACCESS).bits().count_ones() > 1 {
        return Err(ClError::InvalidValue);
    }
    let parent_access = parent_flags.access();
    let access = if flags.intersects(MemFlags::ACCESS) {
        flags.access()
    } else {
        parent_access
    };
    let conflict = match parent_access {
        a if a == MemFlags::WRITE_ONLY => access != MemFlags::WRITE_ONLY,
        a if a == MemFlags::READ_ONLY => access != MemFlags::READ_ONLY,
        _ => false,
    };
    if conflict {
        return Err(ClError::InvalidValue);
    }
    match origin.checked_add(size) {
        Some(end) if size > 0 && end <= parent_size => Ok(access),
        _ => Err(ClError::InvalidBufferSize),
    }
}
