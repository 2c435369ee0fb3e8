//! Monitor images and the loader boundary.
//!
//! Image layout (little-endian):
//!
//! ```text
//! u32 magic  (b"TIMN")
//! u32 version
//! u32 entry  (offset inside the core's code window)
//! u32 segment_count
//! segment_count * { u32 offset, u32 len, len bytes }
//! ```

use crate::LoadError;

pub const IMAGE_MAGIC: u32 = u32::from_le_bytes(*b"TIMN");
pub const IMAGE_VERSION: u32 = 1;
const HEADER_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Offset inside the core's code window.
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// A validated image, ready to be copied into each core's code window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

impl LoadedImage {
    pub fn loaded_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.bytes.len()).sum()
    }
}

/// Turns a raw image into loadable segments.
pub trait BinaryLoader: Send + Sync {
    /// `window` is the size of the code window every segment must fit into.
    fn load(&self, image: &[u8], window: u64) -> Result<LoadedImage, LoadError>;
}

/// Loader for the [`MonitorImage`] format.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorImageLoader;

impl BinaryLoader for MonitorImageLoader {
    fn load(&self, image: &[u8], window: u64) -> Result<LoadedImage, LoadError> {
        if image.len() < HEADER_BYTES {
            return Err(LoadError::TooShort { len: image.len() });
        }
        let word = |at: usize| -> Result<u32, LoadError> {
            image
                .get(at..at + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or(LoadError::TooShort { len: image.len() })
        };

        let magic = word(0)?;
        if magic != IMAGE_MAGIC {
            return Err(LoadError::BadMagic { found: magic });
        }
        let version = word(4)?;
        if version != IMAGE_VERSION {
            return Err(LoadError::UnsupportedVersion { found: version });
        }
        let entry = u64::from(word(8)?);
        let count = word(12)? as usize;
        if count == 0 {
            return Err(LoadError::NoSegments);
        }

        let mut pos = HEADER_BYTES;
        let mut segments = Vec::new();
        for segment in 0..count {
            let header = image
                .get(pos..pos + 8)
                .ok_or(LoadError::Truncated { segment })?;
            let offset = u64::from(u32::from_le_bytes([header[0], header[1], header[2], header[3]]));
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            pos += 8;
            let bytes = image
                .get(pos..pos + len)
                .ok_or(LoadError::Truncated { segment })?;
            pos += len;
            if offset + len as u64 > window {
                return Err(LoadError::SegmentOutOfWindow {
                    segment,
                    offset,
                    len,
                    window,
                });
            }
            segments.push(Segment {
                offset,
                bytes: bytes.to_vec(),
            });
        }
        if pos != image.len() {
            return Err(LoadError::TrailingBytes(image.len() - pos));
        }
        let entry_mapped = segments
            .iter()
            .any(|s| entry >= s.offset && entry < s.offset + s.bytes.len() as u64);
        if !entry_mapped {
            return Err(LoadError::EntryOutsideImage { entry });
        }

        tracing::debug!(entry, segments = segments.len(), "monitor image validated");
        Ok(LoadedImage { entry, segments })
    }
}

/// Builder for images in the [`MonitorImageLoader`] format.
#[derive(Debug, Clone, Default)]
pub struct MonitorImage {
    entry: u32,
    segments: Vec<(u32, Vec<u8>)>,
}

impl MonitorImage {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn segment(mut self, offset: u32, bytes: impl Into<Vec<u8>>) -> Self {
        self.segments.push((offset, bytes.into()));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        out.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u32).to_le_bytes());
        for (offset, bytes) in &self.segments {
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        out
    }

    /// The stock monitor shipped with the runtime: a vector table and a text segment.
    pub fn stock() -> Vec<u8> {
        let mut text = b"tiocl-monitor".to_vec();
        text.resize(256, 0);
        MonitorImage::new(0x400)
            .segment(0x0, vec![0u8; 0x100])
            .segment(0x400, text)
            .to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stock_image_loads() {
        let image = MonitorImageLoader.load(&MonitorImage::stock(), 0x1000).unwrap();
        assert_eq!(image.entry, 0x400);
        assert_eq!(image.segments.len(), 2);
        assert_eq!(image.loaded_bytes(), 0x200);
    }

    #[test]
    fn header_problems_are_reported() {
        let mut bytes = MonitorImage::stock();
        bytes[0] = b'X';
        assert!(matches!(
            MonitorImageLoader.load(&bytes, 0x1000),
            Err(LoadError::BadMagic { .. })
        ));
        assert_eq!(
            MonitorImageLoader.load(&bytes[..8], 0x1000),
            Err(LoadError::TooShort { len: 8 })
        );
        assert_eq!(
            MonitorImageLoader.load(&MonitorImage::new(0).to_bytes(), 0x1000),
            Err(LoadError::NoSegments)
        );
    }

    #[test]
    fn segments_must_fit_the_window() {
        assert_eq!(
            MonitorImageLoader.load(&MonitorImage::stock(), 0x480),
            Err(LoadError::SegmentOutOfWindow {
                segment: 1,
                offset: 0x400,
                len: 256,
                window: 0x480
            })
        );
    }

    #[test]
    fn entry_must_land_in_a_segment() {
        let bytes = MonitorImage::new(0x800).segment(0, vec![1, 2, 3]).to_bytes();
        assert_eq!(
            MonitorImageLoader.load(&bytes, 0x1000),
            Err(LoadError::EntryOutsideImage { entry: 0x800 })
        );
    }

    #[test]
    fn truncated_segment_is_rejected() {
        let bytes = MonitorImage::stock();
        assert_eq!(
            MonitorImageLoader.load(&bytes[..bytes.len() - 1], 0x1000),
            Err(LoadError::Truncated { segment: 1 })
        );
    }
}
