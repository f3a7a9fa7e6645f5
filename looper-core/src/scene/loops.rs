//! Committed loops and the slot pool they are claimed from.
//!
//! The audio thread never allocates a loop. The controller keeps a few empty
//! slots, each able to hold the longest possible loop, stocked in an SPSC
//! ring; the rollover protocol pops one, fills it while it is still uniquely
//! owned and only then shares it. Loops leaving a scene travel back through a
//! second ring so their memory is released (or recycled) on the control thread.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;

use crate::buffering::record::{RecordBuffer, N_CHANNELS};
use crate::error::{LooperError, Result};

/// Step applied by the controller's volume up/down actions.
pub const LOOP_VOL_INC: f32 = 0.1;

/// Empty slots handed to the audio thread.
pub type SlotProducer = ringbuf::HeapProd<Arc<Loop>>;
pub type SlotConsumer = ringbuf::HeapCons<Arc<Loop>>;

/// Loops removed from a scene on the audio thread.
pub type RetireProducer = ringbuf::HeapProd<Arc<Loop>>;
pub type RetireConsumer = ringbuf::HeapCons<Arc<Loop>>;

/// One recorded layer: two channels of `n_frames + 2 × margin` samples.
///
/// Sample data is frozen once the loop has been committed; only the gain and
/// the mute flag change afterwards.
#[derive(Debug)]
pub struct Loop {
    id: u64,
    channels: [Vec<f32>; N_CHANNELS],
    vol: AtomicU32,
    muted: AtomicBool,
}

impl Loop {
    /// An empty slot able to hold `frames` frames without reallocating.
    pub(crate) fn with_capacity(frames: usize) -> Result<Self> {
        let mut left = Vec::new();
        let mut right = Vec::new();
        left.try_reserve_exact(frames)
            .and_then(|_| right.try_reserve_exact(frames))
            .map_err(|_| LooperError::OutOfMemory { frames })?;
        Ok(Self {
            id: 0,
            channels: [left, right],
            vol: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
        })
    }

    /// Build a loop directly from sample data, bypassing the record buffer.
    pub fn from_samples(id: u64, left: Vec<f32>, right: Vec<f32>) -> Self {
        debug_assert_eq!(left.len(), right.len());
        Self {
            id,
            channels: [left, right],
            vol: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Frames per channel, margins included.
    pub fn n_frames(&self) -> usize {
        self.channels[0].len().min(self.channels[1].len())
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.channels[ch]
    }

    pub fn vol(&self) -> f32 {
        f32::from_bits(self.vol.load(Ordering::Relaxed))
    }

    /// Set the gain, clamped to [0, 1].
    pub fn set_vol(&self, vol: f32) {
        let vol = if vol.is_finite() { vol.clamp(0.0, 1.0) } else { 0.0 };
        self.vol.store(vol.to_bits(), Ordering::Relaxed);
    }

    /// Nudge the gain by `delta`, returning the clamped result.
    pub fn adjust_vol(&self, delta: f32) -> f32 {
        self.set_vol(self.vol() + delta);
        self.vol()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Returns the new mute state.
    pub fn toggle_muted(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::Relaxed)
    }

    /// A muted loop only drops out of the mix while its scene is muted too.
    pub fn is_audible(&self, scene_muted: bool) -> bool {
        !(scene_muted && self.is_muted())
    }

    /// Largest absolute sample across both channels.
    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|ch| ch.iter())
            .fold(0.0f32, |peak, s| peak.max(s.abs()))
    }

    fn slot_capacity(&self) -> usize {
        self.channels[0].capacity().min(self.channels[1].capacity())
    }

    /// Copy `recorded` frames starting at `start` out of the record buffer and
    /// pad with silence up to `len` frames.
    ///
    /// Refuses (returns `false`) instead of growing when the slot is too small
    /// or the span is out of range, so it never allocates.
    pub(crate) fn fill(
        &mut self,
        id: u64,
        record: &RecordBuffer,
        start: usize,
        recorded: usize,
        len: usize,
    ) -> bool {
        if self.slot_capacity() < len || recorded > len {
            return false;
        }
        let (Some(left), Some(right)) = (
            record.span(0, start, recorded),
            record.span(1, start, recorded),
        ) else {
            return false;
        };
        for (dst, src) in self.channels.iter_mut().zip([left, right]) {
            dst.clear();
            dst.extend_from_slice(src);
            dst.resize(len, 0.0);
        }
        self.id = id;
        self.set_vol(1.0);
        self.set_muted(false);
        true
    }
}

/// Create the slot handoff ring. The controller keeps the producer inside a
/// [`LoopPool`]; the engine claims from the consumer.
pub fn slot_channel(spare_slots: usize) -> (SlotProducer, SlotConsumer) {
    HeapRb::<Arc<Loop>>::new(spare_slots.max(1)).split()
}

/// Create the ring that returns loops to the control thread.
pub fn retire_channel(capacity: usize) -> (RetireProducer, RetireConsumer) {
    HeapRb::<Arc<Loop>>::new(capacity.max(1)).split()
}

/// Claim the next stocked slot if it is ready to be written.
///
/// A slot that is still shared, or too small for `len` frames, is pushed back
/// through `reject` rather than dropped here.
pub(crate) fn claim_slot(
    slots: &mut SlotConsumer,
    len: usize,
    mut reject: impl FnMut(Arc<Loop>),
) -> Option<Arc<Loop>> {
    let mut slot = slots.try_pop()?;
    let usable = Arc::get_mut(&mut slot)
        .map(|l| l.slot_capacity() >= len)
        .unwrap_or(false);
    if usable {
        Some(slot)
    } else {
        reject(slot);
        None
    }
}

/// Control-thread side of the slot pool.
pub struct LoopPool {
    slots: SlotProducer,
    target: usize,
    slot_frames: usize,
}

impl LoopPool {
    pub fn new(slots: SlotProducer, target: usize, slot_frames: usize) -> Self {
        Self {
            slots,
            target,
            slot_frames,
        }
    }

    /// Slots currently waiting for the audio thread.
    pub fn available(&self) -> usize {
        self.slots.occupied_len()
    }

    pub fn slot_frames(&self) -> usize {
        self.slot_frames
    }

    /// Future slots are sized for loops of up to `frames` frames.
    pub fn set_slot_frames(&mut self, frames: usize) {
        self.slot_frames = frames;
    }

    /// Allocate slots until the target stock is reached. Returns how many were
    /// added.
    ///
    /// Untouched capacity is not committed by the allocator, so a spare slot
    /// only costs resident memory once a loop is actually written into it.
    pub fn replenish(&mut self) -> Result<usize> {
        let mut added = 0;
        while self.available() < self.target && !self.slots.is_full() {
            let slot = Arc::new(Loop::with_capacity(self.slot_frames)?);
            if self.slots.try_push(slot).is_err() {
                break;
            }
            added += 1;
        }
        Ok(added)
    }

    /// Put a loop that left its scene back into stock. Returns `false` (and
    /// drops it here) when it is still shared, too small, or not needed.
    pub fn recycle(&mut self, mut retired: Arc<Loop>) -> bool {
        let reusable = Arc::get_mut(&mut retired)
            .map(|l| l.slot_capacity() >= self.slot_frames)
            .unwrap_or(false);
        if !reusable || self.available() >= self.target {
            return false;
        }
        self.slots.try_push(retired).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn record_with_ramp(frames: usize) -> RecordBuffer {
        let mut record = RecordBuffer::new(frames).unwrap();
        let (left, right) = record.channels_mut();
        for i in 0..frames {
            left[i] = i as f32;
            right[i] = -(i as f32);
        }
        record
    }

    #[test]
    fn fill_copies_the_requested_span() {
        let record = record_with_ramp(32);
        let mut slot = Loop::with_capacity(8).unwrap();
        assert!(slot.fill(7, &record, 4, 8, 8));
        assert_eq!(slot.id(), 7);
        assert_eq!(slot.n_frames(), 8);
        assert_eq!(slot.channel(0)[0], 4.0);
        assert_eq!(slot.channel(1)[7], -11.0);
    }

    #[test]
    fn fill_pads_unrecorded_tail_with_silence() {
        let record = record_with_ramp(32);
        let mut slot = Loop::with_capacity(8).unwrap();
        assert!(slot.fill(2, &record, 10, 5, 8));
        assert_eq!(slot.n_frames(), 8);
        assert_eq!(slot.channel(0)[4], 14.0);
        assert_eq!(&slot.channel(0)[5..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn fill_refuses_to_grow_a_small_slot() {
        let record = record_with_ramp(32);
        let mut slot = Loop::with_capacity(4).unwrap();
        assert!(!slot.fill(1, &record, 0, 8, 8));
        assert_eq!(slot.n_frames(), 0);
    }

    #[test]
    fn volume_is_clamped_to_unit_range() {
        let l = Loop::from_samples(1, vec![0.0; 4], vec![0.0; 4]);
        assert_abs_diff_eq!(l.adjust_vol(LOOP_VOL_INC), 1.0);
        l.set_vol(0.05);
        assert_abs_diff_eq!(l.adjust_vol(-LOOP_VOL_INC), 0.0);
        l.set_vol(f32::NAN);
        assert_abs_diff_eq!(l.vol(), 0.0);
    }

    #[test]
    fn muted_loop_stays_audible_unless_scene_is_muted() {
        let l = Loop::from_samples(1, vec![0.0; 4], vec![0.0; 4]);
        assert!(l.toggle_muted());
        assert!(l.is_audible(false));
        assert!(!l.is_audible(true));
        assert!(!l.toggle_muted());
        assert!(l.is_audible(true));
    }

    #[test]
    fn pool_stocks_up_to_target_and_recycles_unique_slots() {
        let (producer, mut consumer) = slot_channel(2);
        let mut pool = LoopPool::new(producer, 2, 16);
        assert_eq!(pool.replenish().unwrap(), 2);
        assert_eq!(pool.replenish().unwrap(), 0);

        let claimed = claim_slot(&mut consumer, 16, |_| panic!("slot should be usable")).unwrap();
        assert_eq!(pool.available(), 1);
        assert!(pool.recycle(claimed));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn shared_or_small_slots_are_not_recycled() {
        let (producer, _consumer) = slot_channel(2);
        let mut pool = LoopPool::new(producer, 2, 16);

        let shared = Arc::new(Loop::with_capacity(16).unwrap());
        let _other = Arc::clone(&shared);
        assert!(!pool.recycle(shared));
        assert!(!pool.recycle(Arc::new(Loop::with_capacity(8).unwrap())));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn undersized_slot_is_rejected_on_claim() {
        let (mut producer, mut consumer) = slot_channel(1);
        assert!(producer
            .try_push(Arc::new(Loop::with_capacity(4).unwrap()))
            .is_ok());
        let mut rejected = 0;
        assert!(claim_slot(&mut consumer, 8, |_| rejected += 1).is_none());
        assert_eq!(rejected, 1);
    }

    #[test]
    fn zero_target_pool_stays_empty() {
        let (producer, _consumer) = slot_channel(0);
        let mut pool = LoopPool::new(producer, 0, 16);
        assert_eq!(pool.replenish().unwrap(), 0);
        assert_eq!(pool.available(), 0);
    }
}
