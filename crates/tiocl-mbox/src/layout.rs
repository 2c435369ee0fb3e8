//! Mailbox layout constants shared by the host and the core monitor.

/// `b"TMBX"` as a little-endian `u32`.
pub const MBOX_MAGIC: u32 = 0x5842_4d54;

/// Wire protocol version. Bumped whenever a message layout changes.
pub const MBOX_VERSION: u32 = 1;

/// Rings store records in whole `u32` words.
pub const RECORD_ALIGN: usize = 4;

/// Stored in a record's length word when the rest of the ring is padding.
///
/// Zero-length payloads stay legal; a payload can never be this long.
pub const WRAP_MARKER: u32 = 0xFFFF_FFFF;

/// Capacity of each direction of a mailbox unless configured otherwise.
pub const DEFAULT_MAILBOX_BYTES: usize = 16 * 1024;

/// Smallest ring the host will build: one length word plus one payload word.
pub const MIN_RING_BYTES: usize = 2 * RECORD_ALIGN;

pub const fn align_up(v: usize, align: usize) -> usize {
    (v + (align - 1)) & !(align - 1)
}

/// Bytes consumed by one record carrying `payload_len` bytes.
pub const fn record_size(payload_len: usize) -> usize {
    RECORD_ALIGN + align_up(payload_len, RECORD_ALIGN)
}
