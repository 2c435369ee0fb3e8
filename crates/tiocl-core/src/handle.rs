//! Generation-checked handle tables.
//!
//! Every API object lives in a typed table. A handle is a slot index plus the slot's generation
//! at insertion time; freeing a slot bumps its generation, so stale handles are rejected instead of
//! aliasing whatever reuses the slot.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::context::Context;
use crate::device::Device;
use crate::event::Event;
use crate::kernel::Kernel;
use crate::memobj::MemObject;
use crate::program::Program;
use crate::queue::CommandQueue;
use crate::{ClError, ClResult};

pub type ContextHandle = Handle<Context>;
pub type DeviceHandle = Handle<dyn Device>;
pub type QueueHandle = Handle<CommandQueue>;
pub type EventHandle = Handle<Event>;
pub type MemHandle = Handle<MemObject>;
pub type ProgramHandle = Handle<Program>;
pub type KernelHandle = Handle<Kernel>;

pub struct Handle<T: ?Sized> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> Box<T>>,
}

impl<T: ?Sized> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the handle into one integer, e.g. for logging or FFI.
    pub fn to_raw(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
}

impl<T: ?Sized> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Handle<T> {}

impl<T: ?Sized> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T: ?Sized> Eq for Handle<T> {}

impl<T: ?Sized> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_raw().hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Entry<T: ?Sized> {
    object: Arc<T>,
    refcount: u32,
    /// Pinned objects are never freed by `release`; retain/release still succeed.
    pinned: bool,
}

struct Slot<T: ?Sized> {
    generation: u32,
    entry: Option<Entry<T>>,
}

struct Slots<T: ?Sized> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

pub struct HandleTable<T: ?Sized> {
    inner: Mutex<Slots<T>>,
    invalid: ClError,
}

impl<T: ?Sized> HandleTable<T> {
    /// `invalid` is returned for any handle that does not name a live object.
    pub fn new(invalid: ClError) -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            invalid,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, object: Arc<T>) -> Handle<T> {
        self.insert_entry(object, false)
    }

    pub fn insert_pinned(&self, object: Arc<T>) -> Handle<T> {
        self.insert_entry(object, true)
    }

    fn insert_entry(&self, object: Arc<T>, pinned: bool) -> Handle<T> {
        let mut inner = self.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.entry = Some(Entry {
            object,
            refcount: 1,
            pinned,
        });
        Handle::new(index, slot.generation)
    }

    /// Inserts an object that needs to know its own handle.
    ///
    /// `build` runs under the table lock and must not touch this table.
    pub fn try_insert_with(
        &self,
        build: impl FnOnce(Handle<T>) -> ClResult<Arc<T>>,
    ) -> ClResult<Handle<T>> {
        let mut inner = self.lock();
        let (index, generation) = match inner.free.last() {
            Some(&index) => (index, inner.slots[index as usize].generation),
            None => (inner.slots.len() as u32, 0),
        };
        let handle = Handle::new(index, generation);
        let object = build(handle)?;
        if inner.free.last() == Some(&index) {
            inner.free.pop();
        } else {
            inner.slots.push(Slot {
                generation: 0,
                entry: None,
            });
        }
        inner.slots[index as usize].entry = Some(Entry {
            object,
            refcount: 1,
            pinned: false,
        });
        Ok(handle)
    }

    pub fn get(&self, handle: Handle<T>) -> ClResult<Arc<T>> {
        let inner = self.lock();
        Self::entry(&inner, handle)
            .map(|e| Arc::clone(&e.object))
            .ok_or(self.invalid)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        Self::entry(&self.lock(), handle).is_some()
    }

    pub fn retain(&self, handle: Handle<T>) -> ClResult<()> {
        let mut inner = self.lock();
        let entry = Self::entry_mut(&mut inner, handle).ok_or(self.invalid)?;
        if !entry.pinned {
            entry.refcount += 1;
        }
        Ok(())
    }

    /// Drops one reference. Returns the object when this was the last one.
    pub fn release(&self, handle: Handle<T>) -> ClResult<Option<Arc<T>>> {
        let mut inner = self.lock();
        let entry = Self::entry_mut(&mut inner, handle).ok_or(self.invalid)?;
        if entry.pinned {
            return Ok(None);
        }
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Ok(None);
        }
        let slot = &mut inner.slots[handle.index as usize];
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        Ok(entry.map(|e| e.object))
    }

    pub fn refcount(&self, handle: Handle<T>) -> ClResult<u32> {
        let inner = self.lock();
        Self::entry(&inner, handle)
            .map(|e| e.refcount)
            .ok_or(self.invalid)
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .map(|(i, s)| Handle::new(i as u32, s.generation))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every object regardless of reference counts.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        let mut freed = Vec::new();
        for (i, slot) in inner.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                freed.push(i as u32);
                out.push(entry.object);
            }
        }
        inner.free.extend(freed);
        out
    }

    fn entry(inner: &Slots<T>, handle: Handle<T>) -> Option<&Entry<T>> {
        inner
            .slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_ref())
    }

    fn entry_mut(inner: &mut Slots<T>, handle: Handle<T>) -> Option<&mut Entry<T>> {
        inner
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_mut())
    }
}

impl<T: ?Sized> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.len())
            .field("invalid", &self.invalid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_retains_need_n_plus_one_releases() {
        let table = HandleTable::new(ClError::InvalidMemObject);
        let h = table.insert(Arc::new(5u32));
        for _ in 0..3 {
            table.retain(h).unwrap();
        }
        for _ in 0..3 {
            assert!(table.release(h).unwrap().is_none());
            assert!(table.contains(h));
        }
        assert_eq!(table.release(h).unwrap().as_deref(), Some(&5));
        assert_eq!(table.get(h), Err(ClError::InvalidMemObject));
        assert_eq!(table.release(h), Err(ClError::InvalidMemObject));
    }

    #[test]
    fn stale_handles_never_alias_reused_slots() {
        let table = HandleTable::new(ClError::InvalidEvent);
        let old = table.insert(Arc::new("old"));
        table.release(old).unwrap();
        let new = table.insert(Arc::new("new"));
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(table.get(old), Err(ClError::InvalidEvent));
        assert_eq!(*table.get(new).unwrap(), "new");
    }

    #[test]
    fn pinned_objects_survive_release() {
        let table = HandleTable::new(ClError::InvalidDevice);
        let h = table.insert_pinned(Arc::new(1u8));
        table.retain(h).unwrap();
        assert!(table.release(h).unwrap().is_none());
        assert!(table.release(h).unwrap().is_none());
        assert_eq!(table.refcount(h).unwrap(), 1);
    }

    #[test]
    fn insert_with_sees_its_own_handle() {
        let table: HandleTable<(u32, u32)> = HandleTable::new(ClError::InvalidKernel);
        let first = table.insert(Arc::new((0, 0)));
        table.release(first).unwrap();
        let h = table
            .try_insert_with(|h| Ok(Arc::new((h.index(), h.generation()))))
            .unwrap();
        assert_eq!(*table.get(h).unwrap(), (h.index(), h.generation()));
        assert_eq!(h.generation(), 1);

        let err = table.try_insert_with(|_| Err(ClError::OutOfResources));
        assert_eq!(err, Err(ClError::OutOfResources));
        assert_eq!(table.len(), 1);
    }
}
