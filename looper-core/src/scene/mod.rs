//! Scenes: independent banks of loops sharing one cycle length.
//!
//! Each scene exists twice. The audio thread owns a [`Scene`] with the loop
//! list and the cycle geometry; both threads share its [`SceneFlags`], whose
//! atomics carry the transport flags control → audio and the published
//! geometry audio → control.

pub mod loops;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;
use loops::Loop;

/// Upper bound on loops per scene unless configured otherwise.
pub const DEFAULT_MAX_LOOPS: usize = 9;

/// Number of scenes unless configured otherwise.
pub const DEFAULT_N_SCENES: usize = 3;

/// Where a scene is in its record/play cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    /// Not rolling, no loops.
    Idle,
    /// Rolling with no loops yet; the first rollover fixes the cycle length.
    RecordingBase,
    /// Rolling, loops audible, nothing armed.
    Playing,
    /// Rolling, the next rollover commits what was played over the mix.
    OverdubArmed,
}

impl TransportState {
    pub fn derive(is_rolling: bool, should_save_loop: bool, loop_count: usize) -> Self {
        match (is_rolling, loop_count, should_save_loop) {
            (false, _, _) => Self::Idle,
            (true, 0, true) => Self::RecordingBase,
            // A disarmed take with nothing committed plays silence until it is
            // re-armed, which makes the next rollover a base commit again.
            (true, 0, false) => Self::Playing,
            (true, _, true) => Self::OverdubArmed,
            (true, _, false) => Self::Playing,
        }
    }
}

/// Per-scene state visible to both threads.
#[derive(Debug, Default)]
pub struct SceneFlags {
    is_rolling: AtomicBool,
    should_save_loop: AtomicBool,
    is_muted: AtomicBool,
    loop_count: AtomicUsize,
    begin_frame: AtomicUsize,
    current_frame: AtomicUsize,
    end_frame: AtomicUsize,
}

impl SceneFlags {
    pub fn is_rolling(&self) -> bool {
        self.is_rolling.load(Ordering::Acquire)
    }

    pub fn should_save_loop(&self) -> bool {
        self.should_save_loop.load(Ordering::Relaxed)
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted.load(Ordering::Relaxed)
    }

    pub fn set_should_save_loop(&self, armed: bool) {
        self.should_save_loop.store(armed, Ordering::Relaxed);
    }

    /// Returns the new state.
    pub fn toggle_should_save_loop(&self) -> bool {
        !self.should_save_loop.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.is_muted.store(muted, Ordering::Relaxed);
    }

    /// Returns the new state.
    pub fn toggle_muted(&self) -> bool {
        !self.is_muted.fetch_xor(true, Ordering::Relaxed)
    }

    /// Arm and start the transport. The arm flag is published first so the
    /// audio thread never sees a rolling scene with a stale arm flag.
    pub fn start_rolling(&self) {
        self.should_save_loop.store(true, Ordering::Relaxed);
        self.is_rolling.store(true, Ordering::Release);
    }

    /// Committed loops, as last published by the audio thread.
    pub fn loop_count(&self) -> usize {
        self.loop_count.load(Ordering::Acquire)
    }

    pub fn begin_frame(&self) -> usize {
        self.begin_frame.load(Ordering::Relaxed)
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame.load(Ordering::Relaxed)
    }

    pub fn end_frame(&self) -> usize {
        self.end_frame.load(Ordering::Relaxed)
    }

    pub fn transport_state(&self) -> TransportState {
        TransportState::derive(self.is_rolling(), self.should_save_loop(), self.loop_count())
    }

    /// Position within the cycle in [0, 1].
    pub fn progress(&self) -> f32 {
        let begin = self.begin_frame();
        let span = self.end_frame().saturating_sub(begin);
        if span == 0 {
            return 0.0;
        }
        (self.current_frame().saturating_sub(begin) as f32 / span as f32).min(1.0)
    }

    fn clear(&self) {
        self.is_rolling.store(false, Ordering::Release);
        self.should_save_loop.store(false, Ordering::Relaxed);
        self.is_muted.store(false, Ordering::Relaxed);
    }
}

/// Audio-thread view of one scene.
#[derive(Debug)]
pub struct Scene {
    index: usize,
    loops: Vec<Arc<Loop>>,
    max_loops: usize,
    begin_frame: usize,
    current_frame: usize,
    end_frame: usize,
    /// Margin and window captured at the last reset; a rolling scene keeps its
    /// geometry across period-size changes.
    margin: usize,
    max_end: usize,
    /// The base take's end was declared by the user rather than left at the
    /// window limit.
    end_marked: bool,
    flags: Arc<SceneFlags>,
}

impl Scene {
    pub(crate) fn new(
        index: usize,
        max_loops: usize,
        metadata: &Metadata,
        flags: Arc<SceneFlags>,
    ) -> Self {
        let mut scene = Self {
            index,
            loops: Vec::with_capacity(max_loops),
            max_loops,
            begin_frame: 0,
            current_frame: 0,
            end_frame: 0,
            margin: 0,
            max_end: 0,
            end_marked: false,
            flags,
        };
        scene.set_window(metadata);
        scene
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn loops(&self) -> &[Arc<Loop>] {
        &self.loops
    }

    pub fn n_loops(&self) -> usize {
        self.loops.len()
    }

    pub fn max_loops(&self) -> usize {
        self.max_loops
    }

    pub fn begin_frame(&self) -> usize {
        self.begin_frame
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn end_frame(&self) -> usize {
        self.end_frame
    }

    /// Cycle length.
    pub fn n_frames(&self) -> usize {
        self.end_frame - self.begin_frame
    }

    /// Cycle length in bytes of one f32 channel.
    pub fn n_bytes(&self) -> usize {
        self.n_frames() * std::mem::size_of::<f32>()
    }

    pub fn margin(&self) -> usize {
        self.margin
    }

    pub fn max_end(&self) -> usize {
        self.max_end
    }

    pub fn is_end_marked(&self) -> bool {
        self.end_marked
    }

    pub fn flags(&self) -> &SceneFlags {
        &self.flags
    }

    pub fn is_rolling(&self) -> bool {
        self.flags.is_rolling()
    }

    pub fn should_save_loop(&self) -> bool {
        self.flags.should_save_loop()
    }

    pub fn is_muted(&self) -> bool {
        self.flags.is_muted()
    }

    /// No loop committed yet: the current take defines the cycle.
    pub fn is_base(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.loops.len() >= self.max_loops
    }

    pub fn transport_state(&self) -> TransportState {
        TransportState::derive(self.is_rolling(), self.should_save_loop(), self.loops.len())
    }

    pub(crate) fn advance(&mut self, frames: usize) {
        self.current_frame += frames;
    }

    /// Close the base take at `frame`, clamped to the window.
    pub(crate) fn mark_end(&mut self, frame: usize) {
        self.end_frame = frame.min(self.max_end);
        self.end_marked = true;
    }

    /// Reopen the base take up to the window limit.
    pub(crate) fn unmark_end(&mut self) {
        self.end_frame = self.max_end;
        self.end_marked = false;
    }

    pub(crate) fn set_cycle(&mut self, begin: usize, end: usize, current: usize) {
        self.begin_frame = begin;
        self.end_frame = end;
        self.current_frame = current;
    }

    /// Restart the cycle from its beginning, keeping loops and length.
    pub(crate) fn rewind(&mut self) {
        self.current_frame = self.begin_frame;
    }

    /// Append without reallocating. Hands the loop back if the scene is full.
    pub(crate) fn push_loop(&mut self, committed: Arc<Loop>) -> Result<(), Arc<Loop>> {
        if self.is_full() || self.loops.len() == self.loops.capacity() {
            return Err(committed);
        }
        self.loops.push(committed);
        Ok(())
    }

    /// Remove the loop with `id`, preserving the order of the rest.
    pub(crate) fn remove_loop(&mut self, id: u64) -> Option<Arc<Loop>> {
        let position = self.loops.iter().position(|l| l.id() == id)?;
        Some(self.loops.remove(position))
    }

    /// Canonical empty-scene geometry from the current metadata.
    pub(crate) fn set_window(&mut self, metadata: &Metadata) {
        self.margin = metadata.buffer_margin_size;
        self.max_end = metadata.end_frame;
        self.begin_frame = metadata.begin_frame;
        self.current_frame = metadata.begin_frame;
        self.end_frame = metadata.end_frame;
        self.end_marked = false;
    }

    /// Back to IDLE. Loops are handed to `retire` rather than dropped here.
    pub(crate) fn reset(&mut self, metadata: &Metadata, mut retire: impl FnMut(Arc<Loop>)) {
        for l in self.loops.drain(..) {
            retire(l);
        }
        self.flags.clear();
        self.set_window(metadata);
        self.publish();
    }

    /// Mirror geometry and loop count into the shared flags.
    pub(crate) fn publish(&self) {
        self.flags.begin_frame.store(self.begin_frame, Ordering::Relaxed);
        self.flags.current_frame.store(self.current_frame, Ordering::Relaxed);
        self.flags.end_frame.store(self.end_frame, Ordering::Relaxed);
        self.flags.loop_count.store(self.loops.len(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Timing;

    fn metadata() -> Metadata {
        Metadata::resolve(48_000, 512, 1 << 20, &Timing::default()).unwrap()
    }

    fn scene() -> Scene {
        Scene::new(0, 2, &metadata(), Arc::new(SceneFlags::default()))
    }

    #[test]
    fn transport_state_follows_flags_and_loop_count() {
        use TransportState::*;
        assert_eq!(TransportState::derive(false, true, 0), Idle);
        assert_eq!(TransportState::derive(true, true, 0), RecordingBase);
        assert_eq!(TransportState::derive(true, false, 0), Playing);
        assert_eq!(TransportState::derive(true, false, 2), Playing);
        assert_eq!(TransportState::derive(true, true, 2), OverdubArmed);
    }

    #[test]
    fn new_scene_starts_on_the_canonical_window() {
        let m = metadata();
        let s = scene();
        assert_eq!(s.begin_frame(), m.begin_frame);
        assert_eq!(s.current_frame(), m.begin_frame);
        assert_eq!(s.end_frame(), m.end_frame);
        assert_eq!(s.n_bytes(), s.n_frames() * 4);
        assert_eq!(s.transport_state(), TransportState::Idle);
    }

    #[test]
    fn push_stops_at_max_loops() {
        let mut s = scene();
        let make = |id| Arc::new(Loop::from_samples(id, vec![0.0; 4], vec![0.0; 4]));
        assert!(s.push_loop(make(1)).is_ok());
        assert!(s.push_loop(make(2)).is_ok());
        assert!(s.push_loop(make(3)).is_err());
        assert!(s.is_full());
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let mut s = Scene::new(0, 4, &metadata(), Arc::new(SceneFlags::default()));
        for id in 1..=3 {
            s.push_loop(Arc::new(Loop::from_samples(id, vec![], vec![])))
                .unwrap();
        }
        assert_eq!(s.remove_loop(2).map(|l| l.id()), Some(2));
        let ids: Vec<u64> = s.loops().iter().map(|l| l.id()).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(s.remove_loop(9).is_none());
    }

    #[test]
    fn reset_retires_loops_and_clears_flags() {
        let m = metadata();
        let mut s = scene();
        s.flags().start_rolling();
        s.flags().set_muted(true);
        s.push_loop(Arc::new(Loop::from_samples(1, vec![], vec![])))
            .unwrap();
        s.set_cycle(m.begin_frame, m.begin_frame + 48_000, m.begin_frame + 100);

        let mut retired = Vec::new();
        s.reset(&m, |l| retired.push(l));

        assert_eq!(retired.len(), 1);
        assert!(s.is_base());
        assert!(!s.is_rolling());
        assert!(!s.should_save_loop());
        assert!(!s.is_muted());
        assert_eq!(s.end_frame(), m.end_frame);
        assert_eq!(s.flags().loop_count(), 0);
        assert_eq!(s.flags().current_frame(), m.begin_frame);
    }

    #[test]
    fn marked_end_is_clamped_and_cleared_by_reset() {
        let m = metadata();
        let mut s = scene();
        s.mark_end(m.end_frame + 4096);
        assert_eq!(s.end_frame(), m.end_frame);
        assert!(s.is_end_marked());

        s.reset(&m, |_| {});
        assert!(!s.is_end_marked());

        s.mark_end(m.begin_frame + 1000);
        s.unmark_end();
        assert_eq!(s.end_frame(), s.max_end());
        assert!(!s.is_end_marked());
    }

    #[test]
    fn progress_is_fraction_of_cycle() {
        let m = metadata();
        let mut s = scene();
        s.set_cycle(m.begin_frame, m.begin_frame + 1000, m.begin_frame + 250);
        s.publish();
        assert!((s.flags().progress() - 0.25).abs() < 1e-6);
    }
}
