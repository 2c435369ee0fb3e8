//! Bounded single-producer/single-consumer ring of variable-length records.
//!
//! Records are a length word followed by the payload packed into little-endian words. When a
//! record does not fit before the end of the ring, the producer writes [`WRAP_MARKER`] into the
//! next length slot and the record starts again at word 0.
//!
//! `head` and `tail` are monotonically increasing word counters; only the consumer stores `head`
//! and only the producer stores `tail`.

use crate::layout::{record_size, MIN_RING_BYTES, RECORD_ALIGN, WRAP_MARKER};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    Empty,
    /// A length word that cannot describe a committed record.
    Corrupt,
}

pub struct RingBuffer {
    words: Box<[AtomicU32]>,
    head: AtomicU64,
    tail: AtomicU64,
}

impl RingBuffer {
    /// Builds a ring of at least `capacity_bytes`, rounded up to whole words.
    pub fn new(capacity_bytes: usize) -> Self {
        let bytes = capacity_bytes.max(MIN_RING_BYTES);
        let n_words = bytes.div_ceil(RECORD_ALIGN);
        Self {
            words: (0..n_words).map(|_| AtomicU32::new(0)).collect(),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.words.len() * RECORD_ALIGN
    }

    fn cap(&self) -> u64 {
        self.words.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Bytes currently occupied, including wrap padding.
    pub fn used_bytes(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (tail.saturating_sub(head) as usize) * RECORD_ALIGN
    }

    pub fn try_push(&self, payload: &[u8]) -> Result<(), PushError> {
        if payload.len() >= WRAP_MARKER as usize {
            return Err(PushError::TooLarge);
        }
        let record_words = (record_size(payload.len()) / RECORD_ALIGN) as u64;
        let cap = self.cap();
        if record_words > cap {
            return Err(PushError::TooLarge);
        }

        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        let index = tail % cap;
        let remaining = cap - index;
        let padding = if remaining < record_words { remaining } else { 0 };

        let used = tail - head;
        if used + padding + record_words > cap {
            return Err(PushError::Full);
        }

        if padding > 0 {
            self.words[index as usize].store(WRAP_MARKER, Ordering::Relaxed);
        }
        let start = ((tail + padding) % cap) as usize;
        self.words[start].store(payload.len() as u32, Ordering::Relaxed);
        for (i, chunk) in payload.chunks(RECORD_ALIGN).enumerate() {
            let mut word = [0u8; RECORD_ALIGN];
            word[..chunk.len()].copy_from_slice(chunk);
            self.words[start + 1 + i].store(u32::from_le_bytes(word), Ordering::Relaxed);
        }

        // Publishes the record.
        self.tail
            .store(tail + padding + record_words, Ordering::Release);
        Ok(())
    }

    pub fn try_pop(&self) -> Result<Vec<u8>, PopError> {
        let cap = self.cap();
        let tail = self.tail.load(Ordering::Acquire);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            if head == tail {
                return Err(PopError::Empty);
            }
            let index = head % cap;
            let len = self.words[index as usize].load(Ordering::Relaxed);
            if len == WRAP_MARKER {
                head += cap - index;
                self.head.store(head, Ordering::Release);
                continue;
            }

            let len = len as usize;
            let record_words = (record_size(len) / RECORD_ALIGN) as u64;
            if record_words > cap - index || record_words > tail - head {
                return Err(PopError::Corrupt);
            }

            let mut out = Vec::with_capacity(len);
            let first = index as usize + 1;
            for word in &self.words[first..first + (record_words as usize - 1)] {
                out.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
            }
            out.truncate(len);

            self.head.store(head + record_words, Ordering::Release);
            return Ok(out);
        }
    }

    /// Discards everything in the ring.
    ///
    /// Only valid while neither side is running, e.g. while a core is held in reset.
    pub fn clear(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
    }

    pub fn push_spinning(&self, payload: &[u8]) {
        loop {
            match self.try_push(payload) {
                Ok(()) => return,
                Err(PushError::Full) => std::hint::spin_loop(),
                Err(PushError::TooLarge) => panic!("record too large for ring"),
            }
        }
    }

    pub fn pop_spinning(&self) -> Vec<u8> {
        loop {
            match self.try_pop() {
                Ok(v) => return v,
                Err(PopError::Empty) => std::hint::spin_loop(),
                Err(PopError::Corrupt) => panic!("corrupt ring record"),
            }
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity_bytes", &self.capacity_bytes())
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}
