//! Fixed-slot frame ring for handing decoded pictures to the render thread

use std::collections::TryReserveError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::decode::Picture;
use crate::PipelineStats;

/// Fewest slots that keep the render thread off the slot being written
pub const MIN_SLOTS: usize = 2;

/// Decode-side half of the ring.
///
/// Owns `N` picture slots and writes them round-robin. Only the picture a
/// reader can see is ever shared: a slot is written through `&mut` access
/// obtained from `Arc::get_mut`, so a render thread still holding an older
/// picture from the same slot forces that slot onto fresh storage instead of
/// being overwritten under it.
pub struct FrameRing {
    slots: Vec<Arc<Picture>>,
    next: usize,
    sequence: u64,
    shared: Arc<Shared>,
}

/// State both threads touch
struct Shared {
    current: ArcSwapOption<Picture>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
pub(crate) struct Stats {
    units_submitted: AtomicU64,
    units_rejected: AtomicU64,
    decode_errors: AtomicU64,
    pictures_published: AtomicU64,
    render_reads: AtomicU64,
    slot_replacements: AtomicU64,
}

impl Stats {
    pub(crate) fn unit_submitted(&self) {
        self.units_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unit_rejected(&self) {
        self.units_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            units_submitted: self.units_submitted.load(Ordering::Relaxed),
            units_rejected: self.units_rejected.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            pictures_published: self.pictures_published.load(Ordering::Relaxed),
            render_reads: self.render_reads.load(Ordering::Relaxed),
            slot_replacements: self.slot_replacements.load(Ordering::Relaxed),
        }
    }
}

/// Render-side handle to the newest published picture. Cheap to clone and
/// safe to poll from any thread at any time.
#[derive(Clone)]
pub struct FrameReader {
    shared: Arc<Shared>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                current: ArcSwapOption::empty(),
                stats: CachePadded::new(Stats::default()),
            }),
        }
    }

    /// Newest published picture, or `None` before the first decode.
    pub fn current(&self) -> Option<Arc<Picture>> {
        self.shared.stats.render_reads.fetch_add(1, Ordering::Relaxed);
        self.shared.current.load_full()
    }

    /// Sequence of the newest published picture without taking a reference
    pub fn latest_sequence(&self) -> Option<u64> {
        self.shared.current.load().as_ref().map(|p| p.sequence())
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &Stats {
        &self.shared.stats
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    /// Ring with its own reader. `slot_count` is raised to [`MIN_SLOTS`].
    pub fn new(slot_count: usize, width: u32, height: u32) -> Self {
        let slots = (0..slot_count.max(MIN_SLOTS))
            .map(|_| Arc::new(Picture::allocate(width, height)))
            .collect();
        Self::with_slots(&FrameReader::new(), slots)
    }

    /// Ring that publishes through an existing reader, allocating every slot
    /// up front.
    pub fn try_attach(
        reader: &FrameReader,
        slot_count: usize,
        width: u32,
        height: u32,
    ) -> Result<Self, TryReserveError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(slot_count.max(MIN_SLOTS))?;
        for _ in 0..slot_count.max(MIN_SLOTS) {
            slots.push(Arc::new(Picture::try_allocate(width, height)?));
        }
        Ok(Self::with_slots(reader, slots))
    }

    fn with_slots(reader: &FrameReader, slots: Vec<Arc<Picture>>) -> Self {
        Self {
            slots,
            next: 0,
            sequence: 0,
            shared: Arc::clone(&reader.shared),
        }
    }

    pub fn reader(&self) -> FrameReader {
        FrameReader {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot the next decoded picture goes into
    pub fn next_slot(&self) -> usize {
        self.next
    }

    /// Exclusive access to slot `index` for writing.
    ///
    /// Fails only when the slot is still held by a reader and fresh storage
    /// for it cannot be allocated; the slot is left as it was.
    pub fn slot_mut(&mut self, index: usize) -> Result<&mut Picture, TryReserveError> {
        let slot = &mut self.slots[index];
        if Arc::get_mut(slot).is_none() {
            // A reader still holds the last picture from this slot
            let replacement = Picture::try_allocate(slot.width(), slot.height())?;
            *slot = Arc::new(replacement);
            self.shared
                .stats
                .slot_replacements
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(Arc::make_mut(slot))
    }

    /// Make the picture in slot `index` the current one. Call only after the
    /// write into that slot has finished.
    pub fn publish(&mut self, index: usize) -> Arc<Picture> {
        self.sequence += 1;

        let picture = Arc::make_mut(&mut self.slots[index]);
        picture.meta.sequence = self.sequence;
        picture.meta.slot = index;
        picture.meta.decoded_at = Instant::now();

        let published = Arc::clone(&self.slots[index]);
        self.shared.current.store(Some(Arc::clone(&published)));
        self.next = (index + 1) % self.slots.len();

        self.shared
            .stats
            .pictures_published
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pictures_published").increment(1);
        published
    }

    /// Newest published picture
    pub fn current(&self) -> Option<Arc<Picture>> {
        self.shared.current.load_full()
    }

    /// Withdraw the current picture; readers see `None` until the next publish.
    pub fn reset(&mut self) {
        self.shared.current.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(ring: &mut FrameRing, value: u8) -> Arc<Picture> {
        let slot = ring.next_slot();
        ring.slot_mut(slot).unwrap().plane_mut(0).fill(value);
        ring.publish(slot)
    }

    #[test]
    fn empty_until_first_publish() {
        let ring = FrameRing::new(2, 4, 4);
        let reader = ring.reader();
        assert!(reader.current().is_none());
        assert_eq!(reader.latest_sequence(), None);
    }

    #[test]
    fn slots_alternate_round_robin() {
        let mut ring = FrameRing::new(2, 4, 4);
        let reader = ring.reader();

        let mut seen = Vec::new();
        for value in 1..=3 {
            write(&mut ring, value);
            let current = reader.current().unwrap();
            seen.push((current.slot(), current.sequence(), current.plane(0)[0]));
        }
        assert_eq!(seen, vec![(0, 1, 1), (1, 2, 2), (0, 3, 3)]);
    }

    #[test]
    fn slot_count_is_at_least_two() {
        assert_eq!(FrameRing::new(1, 2, 2).len(), MIN_SLOTS);
        assert_eq!(FrameRing::new(3, 2, 2).len(), 3);
    }

    #[test]
    fn unread_slot_storage_is_reused() {
        let mut ring = FrameRing::new(2, 8, 8);
        let first = write(&mut ring, 1).plane(0).as_ptr();
        write(&mut ring, 2);
        let third = write(&mut ring, 3).plane(0).as_ptr();
        assert_eq!(first, third);
        assert_eq!(ring.reader().stats().slot_replacements, 0);
    }

    #[test]
    fn held_picture_is_never_overwritten() {
        let mut ring = FrameRing::new(2, 8, 8);
        let reader = ring.reader();

        write(&mut ring, 1);
        let held = reader.current().unwrap();
        write(&mut ring, 2);
        // Wraps back to slot 0 while `held` is still alive
        write(&mut ring, 3);

        assert!(held.plane(0).iter().all(|&b| b == 1));
        assert_eq!(held.sequence(), 1);
        assert_eq!(reader.current().unwrap().plane(0)[0], 3);
        assert_eq!(reader.stats().slot_replacements, 1);
    }

    #[test]
    fn failed_replacement_leaves_held_picture_alone() {
        let mut ring = FrameRing::new(2, 8, 8);
        let reader = ring.reader();

        // Claim a size no allocation can satisfy
        let slot = ring.slot_mut(0).unwrap();
        slot.plane_mut(0).fill(7);
        slot.meta.width = u32::MAX - 1;
        slot.meta.height = u32::MAX - 1;
        ring.publish(0);
        let held = reader.current().unwrap();
        write(&mut ring, 2);

        assert!(ring.slot_mut(0).is_err());
        assert_eq!(reader.stats().slot_replacements, 0);
        assert!(held.plane(0).iter().all(|&b| b == 7));

        drop(held);
        assert!(ring.slot_mut(0).is_ok());
    }

    #[test]
    fn reset_withdraws_current() {
        let mut ring = FrameRing::new(2, 4, 4);
        write(&mut ring, 1);
        ring.reset();
        assert!(ring.current().is_none());
    }

    #[test]
    fn attached_ring_publishes_through_existing_reader() {
        let reader = FrameReader::new();
        let mut ring = FrameRing::try_attach(&reader, 2, 4, 4).unwrap();
        write(&mut ring, 9);
        assert_eq!(reader.current().unwrap().plane(0)[0], 9);
        assert_eq!(reader.stats().pictures_published, 1);
    }
}
