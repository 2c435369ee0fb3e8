use std::ops::Range;

/// Index space of a kernel launch.
///
/// Unused dimensions have a global and local size of 1 and an offset of 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NdRange {
    pub work_dim: u8,
    pub offset: [u64; 3],
    pub global: [u64; 3],
    pub local: [u64; 3],
}

impl NdRange {
    /// A single work item, as launched by `enqueue_task`.
    pub const TASK: NdRange = NdRange {
        work_dim: 1,
        offset: [0; 3],
        global: [1; 3],
        local: [1; 3],
    };

    pub fn linear(global: u64) -> Self {
        Self {
            work_dim: 1,
            offset: [0; 3],
            global: [global, 1, 1],
            local: [1; 3],
        }
    }

    pub fn total_items(&self) -> u64 {
        self.global.iter().product()
    }

    pub fn work_groups(&self) -> u64 {
        self.global
            .iter()
            .zip(self.local.iter())
            .map(|(g, l)| if *l == 0 { 0 } else { g / l })
            .product()
    }

    /// Linear work-item ids owned by participant `part` of `parts`.
    ///
    /// Shares are contiguous, disjoint, and cover every item; they differ in size by at most one.
    pub fn share(&self, part: usize, parts: usize) -> Range<u64> {
        if parts == 0 || part >= parts {
            return 0..0;
        }
        let total = u128::from(self.total_items());
        let parts = parts as u128;
        let part = part as u128;
        let start = total * part / parts;
        let end = total * (part + 1) / parts;
        start as u64..end as u64
    }

    /// Global id (including the offset) of linear work item `linear`.
    pub fn global_id(&self, linear: u64) -> [u64; 3] {
        let x = linear % self.global[0];
        let rest = linear / self.global[0];
        let y = rest % self.global[1];
        let z = rest / self.global[1];
        [
            x + self.offset[0],
            y + self.offset[1],
            z + self.offset[2],
        ]
    }
}

impl Default for NdRange {
    fn default() -> Self {
        Self::TASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_cover_the_range_without_gaps() {
        let nd = NdRange {
            work_dim: 2,
            offset: [0; 3],
            global: [7, 3, 1],
            local: [1; 3],
        };
        let mut next = 0;
        for part in 0..4 {
            let share = nd.share(part, 4);
            assert_eq!(share.start, next);
            next = share.end;
        }
        assert_eq!(next, 21);
        assert_eq!(nd.share(4, 4), 0..0);
    }

    #[test]
    fn task_lands_in_exactly_one_share() {
        assert_eq!(NdRange::TASK.share(0, 3), 0..0);
        assert_eq!(NdRange::TASK.share(1, 3), 0..0);
        assert_eq!(NdRange::TASK.share(2, 3), 0..1);
    }

    #[test]
    fn global_id_applies_offset() {
        let nd = NdRange {
            work_dim: 3,
            offset: [10, 20, 30],
            global: [4, 2, 2],
            local: [2, 1, 1],
        };
        assert_eq!(nd.global_id(0), [10, 20, 30]);
        assert_eq!(nd.global_id(5), [11, 21, 30]);
        assert_eq!(nd.global_id(15), [13, 21, 31]);
        assert_eq!(nd.work_groups(), 8);
    }
}
