//! Reassembly of fragmented decode units into one contiguous coded picture

use std::time::Instant;

use bytes::Bytes;

use crate::error::{AssemblyError, SetupError};

/// Zeroed tail kept past the usable capacity so engines that read ahead in
/// their bitstream parser never leave the buffer
pub const STAGING_PADDING: usize = 64;

/// Default largest coded picture the pipeline accepts
pub const DEFAULT_STAGING_CAPACITY: usize = 92 * 1024;

/// One coded picture as it arrived from the network, possibly split across
/// several packets. Fragment order is byte order.
#[derive(Debug, Clone)]
pub struct DecodeUnit {
    pub frame_number: u64,
    pub fragments: Vec<Bytes>,
    /// Length the sender declared for the whole picture
    pub total_len: usize,
    pub received_at: Instant,
}

impl DecodeUnit {
    /// Unit whose declared length is the sum of its fragments
    pub fn new(frame_number: u64, fragments: Vec<Bytes>) -> Self {
        let total_len = fragments.iter().map(Bytes::len).sum();
        Self::with_declared_len(frame_number, fragments, total_len)
    }

    pub fn with_declared_len(frame_number: u64, fragments: Vec<Bytes>, total_len: usize) -> Self {
        Self {
            frame_number,
            fragments,
            total_len,
            received_at: Instant::now(),
        }
    }

    /// Split `data` into fragments of at most `fragment_size` bytes
    /// without copying.
    pub fn split(frame_number: u64, data: Bytes, fragment_size: usize) -> Self {
        let fragment_size = fragment_size.max(1);
        let mut fragments = Vec::with_capacity(data.len().div_ceil(fragment_size));
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + fragment_size).min(data.len());
            fragments.push(data.slice(offset..end));
            offset = end;
        }
        Self::new(frame_number, fragments)
    }
}

/// Fixed-capacity arena a decode unit is laid out in before submission.
/// Allocated once at setup and overwritten by every assembly.
pub struct StagingBuffer {
    buf: Box<[u8]>,
    capacity: usize,
}

impl StagingBuffer {
    pub fn try_new(capacity: usize) -> Result<Self, SetupError> {
        let failed = |reason: String| SetupError::EngineAllocationFailure {
            what: "staging buffer",
            reason,
        };
        let len = capacity
            .checked_add(STAGING_PADDING)
            .ok_or_else(|| failed(format!("capacity {capacity} overflows with padding")))?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|e| failed(e.to_string()))?;
        buf.resize(len, 0);
        Ok(Self {
            buf: buf.into_boxed_slice(),
            capacity,
        })
    }

    /// Largest decode unit that fits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy the unit's fragments, in order, to the start of the arena and
    /// return the contiguous coded picture.
    ///
    /// Rejected units leave the arena untouched.
    pub fn assemble(&mut self, unit: &DecodeUnit) -> Result<&[u8], AssemblyError> {
        if unit.total_len > self.capacity {
            return Err(AssemblyError::TooLarge {
                len: unit.total_len,
                capacity: self.capacity,
            });
        }

        let actual: usize = unit.fragments.iter().map(Bytes::len).sum();
        if actual != unit.total_len {
            return Err(AssemblyError::LengthMismatch {
                declared: unit.total_len,
                actual,
            });
        }

        let mut len = 0;
        for fragment in &unit.fragments {
            self.buf[len..len + fragment.len()].copy_from_slice(fragment);
            len += fragment.len();
        }
        Ok(&self.buf[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(parts: &[&'static [u8]]) -> DecodeUnit {
        DecodeUnit::new(1, parts.iter().map(|p| Bytes::from_static(p)).collect())
    }

    #[test]
    fn fragments_concatenate_in_list_order() {
        let mut staging = StagingBuffer::try_new(16).unwrap();
        let coded = staging.assemble(&unit(&[b"ab", b"", b"cde", b"f"])).unwrap();
        assert_eq!(coded, b"abcdef");
    }

    #[test]
    fn exact_capacity_is_accepted() {
        let mut staging = StagingBuffer::try_new(4).unwrap();
        assert_eq!(staging.assemble(&unit(&[b"wxyz"])).unwrap(), b"wxyz");
    }

    #[test]
    fn oversized_unit_leaves_arena_untouched() {
        let mut staging = StagingBuffer::try_new(4).unwrap();
        staging.assemble(&unit(&[b"keep"])).unwrap();

        let err = staging.assemble(&unit(&[b"toolong"])).unwrap_err();
        assert_eq!(err, AssemblyError::TooLarge { len: 7, capacity: 4 });
        assert_eq!(&staging.buf[..4], b"keep");
    }

    #[test]
    fn declared_length_must_match_fragments() {
        let mut staging = StagingBuffer::try_new(16).unwrap();
        let short = DecodeUnit::with_declared_len(2, vec![Bytes::from_static(b"abc")], 5);
        assert_eq!(
            staging.assemble(&short).unwrap_err(),
            AssemblyError::LengthMismatch {
                declared: 5,
                actual: 3
            }
        );
    }

    #[test]
    fn split_is_lossless() {
        let data = Bytes::from((0u8..=200).collect::<Vec<_>>());
        let unit = DecodeUnit::split(7, data.clone(), 64);
        assert_eq!(unit.fragments.len(), 4);
        assert_eq!(unit.total_len, data.len());

        let mut staging = StagingBuffer::try_new(256).unwrap();
        assert_eq!(staging.assemble(&unit).unwrap(), &data[..]);
    }

    #[test]
    fn unallocatable_capacity_is_a_setup_error() {
        for capacity in [usize::MAX, usize::MAX - STAGING_PADDING, usize::MAX / 2] {
            assert!(matches!(
                StagingBuffer::try_new(capacity),
                Err(SetupError::EngineAllocationFailure {
                    what: "staging buffer",
                    ..
                })
            ));
        }
    }

    #[test]
    fn padding_tail_stays_zeroed() {
        let mut staging = StagingBuffer::try_new(4).unwrap();
        staging.assemble(&unit(&[b"\xff\xff\xff\xff"])).unwrap();
        assert!(staging.buf[4..].iter().all(|&b| b == 0));
        assert_eq!(staging.buf.len(), 4 + STAGING_PADDING);
    }
}
