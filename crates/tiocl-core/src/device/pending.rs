use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::DeviceWork;

struct Entry {
    work: DeviceWork,
    remaining: usize,
    status: i32,
    issued: Instant,
}

/// Work sent to compute cores, keyed by work index, until every core involved has replied.
#[derive(Default)]
pub(crate) struct CompletePending {
    entries: Mutex<HashMap<u32, Entry>>,
    changed: Condvar,
    next_idx: AtomicU32,
}

impl CompletePending {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_idx(&self) -> u32 {
        self.next_idx.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn push(&self, idx: u32, work: DeviceWork, count: usize) {
        self.lock().insert(
            idx,
            Entry {
                work,
                remaining: count.max(1),
                status: 0,
                issued: Instant::now(),
            },
        );
        self.changed.notify_all();
    }

    /// One reply for `idx`. The first failing code wins.
    pub(crate) fn complete_one(&self, idx: u32, retcode: i32) -> Option<(DeviceWork, i32)> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&idx)?;
        if retcode < 0 && entry.status == 0 {
            entry.status = retcode;
        }
        entry.remaining -= 1;
        if entry.remaining > 0 {
            return None;
        }
        let entry = entries.remove(&idx)?;
        drop(entries);
        self.changed.notify_all();
        Some((entry.work, entry.status))
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Age of the longest-waiting entry.
    pub(crate) fn oldest_age(&self) -> Option<Duration> {
        self.lock().values().map(|e| e.issued.elapsed()).max()
    }

    pub(crate) fn drain(&self) -> Vec<DeviceWork> {
        let drained: Vec<_> = self.lock().drain().map(|(_, e)| e.work).collect();
        self.changed.notify_all();
        drained
    }

    /// Blocks while the table is empty, up to `timeout`. Returns whether there is work.
    pub(crate) fn wait_for_work(&self, timeout: Duration) -> bool {
        let entries = self.lock();
        let (entries, _) = self
            .changed
            .wait_timeout_while(entries, timeout, |e| e.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::context::Context;
    use crate::event::{CommandType, Event};
    use crate::handle::HandleTable;
    use crate::queue::tests::detached_waker;
    use crate::ClError;
    use std::sync::Arc;

    fn work() -> DeviceWork {
        let contexts: HandleTable<Context> = HandleTable::new(ClError::InvalidContext);
        let ctx = contexts.insert(Arc::new(Context::new(Vec::new())));
        let event = Arc::new(Event::new(CommandType::Marker, ctx, None, None, Vec::new()));
        DeviceWork::new(event, Command::Marker, Default::default(), false, detached_waker())
    }

    #[test]
    fn completes_after_the_last_reply() {
        let table = CompletePending::default();
        let idx = table.next_idx();
        table.push(idx, work(), 3);
        assert!(table.complete_one(idx, 0).is_none());
        assert!(table.complete_one(idx, -48).is_none());
        let (_, status) = table.complete_one(idx, -5).unwrap();
        assert_eq!(status, -48);
        assert_eq!(table.len(), 0);
        assert!(table.complete_one(idx, 0).is_none());
    }

    #[test]
    fn indices_are_unique() {
        let table = CompletePending::default();
        let a = table.next_idx();
        let b = table.next_idx();
        assert_ne!(a, b);
    }

    #[test]
    fn waiting_sees_new_entries() {
        let table = Arc::new(CompletePending::default());
        assert!(!table.wait_for_work(Duration::from_millis(1)));
        let t = Arc::clone(&table);
        let pusher = std::thread::spawn(move || t.push(0, work(), 1));
        assert!(table.wait_for_work(Duration::from_secs(5)));
        pusher.join().unwrap();
        assert!(table.oldest_age().is_some());
        assert_eq!(table.drain().len(), 1);
    }
}
