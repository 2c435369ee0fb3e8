use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::CoreSet;

#[derive(Default)]
struct Load {
    /// core -> work indices it is running
    busy: HashMap<u8, Vec<u32>>,
    cursor: usize,
}

/// Places single-core tasks round-robin, preferring idle cores.
#[derive(Default)]
pub(crate) struct CoreScheduler {
    load: Mutex<Load>,
}

impl CoreScheduler {
    /// Picks a core from `units` for work `idx`, skipping cores `alive` rejects.
    pub(crate) fn acquire(
        &self,
        units: &CoreSet,
        idx: u32,
        alive: impl Fn(u8) -> bool,
    ) -> Option<u8> {
        let mut load = self.load.lock().unwrap_or_else(PoisonError::into_inner);
        let candidates: Vec<u8> = units.iter().copied().filter(|c| alive(*c)).collect();
        if candidates.is_empty() {
            return None;
        }
        let start = load.cursor % candidates.len();
        let rotated = candidates[start..].iter().chain(&candidates[..start]);
        let outstanding = |core: &u8| load.busy.get(core).map_or(0, Vec::len);
        let core = *rotated.min_by_key(|c| outstanding(*c))?;
        load.cursor = load.cursor.wrapping_add(1);
        load.busy.entry(core).or_default().push(idx);
        Some(core)
    }

    pub(crate) fn release(&self, core: u8, idx: u32) {
        let mut load = self.load.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = load.busy.get_mut(&core) {
            running.retain(|i| *i != idx);
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self, core: u8) -> usize {
        let load = self.load.lock().unwrap_or_else(PoisonError::into_inner);
        load.busy.get(&core).map_or(0, Vec::len)
    }
}
