//! State shared between the audio thread and the controller.
//!
//! Every field has one writer. Scene selection, the monitor switch and the
//! per-scene flags are written by the controller and read by the engine; the
//! peak meter, diagnostics and published metadata go the other way. All of it
//! is plain atomics: a reader may see this period's value or the last one,
//! never a torn one.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::metadata::Metadata;
use crate::scene::SceneFlags;

pub struct SharedState {
    current_scene: AtomicUsize,
    next_scene: AtomicUsize,
    monitor_inputs: AtomicBool,
    scenes: Box<[Arc<SceneFlags>]>,
    peaks: PeakMeter,
    diagnostics: EngineDiagnostics,
    sample_rate: AtomicU32,
    frames_per_period: AtomicUsize,
    max_loop_frames: AtomicUsize,
    max_cycle_frames: AtomicUsize,
}

impl SharedState {
    pub(crate) fn new(n_scenes: usize, monitor_inputs: bool, metadata: &Metadata) -> Self {
        let shared = Self {
            current_scene: AtomicUsize::new(0),
            next_scene: AtomicUsize::new(0),
            monitor_inputs: AtomicBool::new(monitor_inputs),
            scenes: (0..n_scenes)
                .map(|_| Arc::new(SceneFlags::default()))
                .collect(),
            peaks: PeakMeter::default(),
            diagnostics: EngineDiagnostics::default(),
            sample_rate: AtomicU32::new(0),
            frames_per_period: AtomicUsize::new(0),
            max_loop_frames: AtomicUsize::new(0),
            max_cycle_frames: AtomicUsize::new(0),
        };
        shared.publish_metadata(metadata);
        shared
    }

    pub fn n_scenes(&self) -> usize {
        self.scenes.len()
    }

    pub fn scene(&self, index: usize) -> Option<&Arc<SceneFlags>> {
        self.scenes.get(index)
    }

    pub(crate) fn scene_flags(&self) -> &[Arc<SceneFlags>] {
        &self.scenes
    }

    pub fn current_scene(&self) -> usize {
        self.current_scene.load(Ordering::Acquire)
    }

    pub fn next_scene(&self) -> usize {
        self.next_scene.load(Ordering::Acquire)
    }

    /// Callers keep `index < n_scenes()`.
    pub(crate) fn set_current_scene(&self, index: usize) {
        self.current_scene.store(index, Ordering::Release);
    }

    pub(crate) fn set_next_scene(&self, index: usize) {
        self.next_scene.store(index, Ordering::Release);
    }

    pub fn monitor_inputs(&self) -> bool {
        self.monitor_inputs.load(Ordering::Relaxed)
    }

    pub fn set_monitor_inputs(&self, enabled: bool) {
        self.monitor_inputs.store(enabled, Ordering::Relaxed);
    }

    pub fn peaks(&self) -> &PeakMeter {
        &self.peaks
    }

    pub fn diagnostics(&self) -> &EngineDiagnostics {
        &self.diagnostics
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn frames_per_period(&self) -> usize {
        self.frames_per_period.load(Ordering::Relaxed)
    }

    /// Size the controller must give new loop slots.
    pub fn max_loop_frames(&self) -> usize {
        self.max_loop_frames.load(Ordering::Relaxed)
    }

    /// Longest cycle a base take may declare.
    pub fn max_cycle_frames(&self) -> usize {
        self.max_cycle_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn publish_metadata(&self, metadata: &Metadata) {
        self.sample_rate.store(metadata.sample_rate, Ordering::Relaxed);
        self.frames_per_period
            .store(metadata.frames_per_period, Ordering::Relaxed);
        self.max_loop_frames
            .store(metadata.max_loop_frames, Ordering::Relaxed);
        self.max_cycle_frames
            .store(metadata.max_cycle_frames(), Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Peak meter
// ---------------------------------------------------------------------------

/// Running per-channel maxima since the controller last looked.
///
/// Peaks are non-negative, and for non-negative floats the IEEE-754 bit
/// pattern orders like the value, so `fetch_max` on the raw bits is a
/// lock-free float max.
#[derive(Debug, Default)]
pub struct PeakMeter {
    input: [AtomicU32; 2],
    output: [AtomicU32; 2],
}

impl PeakMeter {
    pub(crate) fn record(&self, input: [f32; 2], output: [f32; 2]) {
        for (slot, peak) in self.input.iter().zip(input) {
            store_max(slot, peak);
        }
        for (slot, peak) in self.output.iter().zip(output) {
            store_max(slot, peak);
        }
    }

    /// Read and reset.
    pub fn take(&self) -> TransientPeaks {
        let take = |a: &AtomicU32| f32::from_bits(a.swap(0, Ordering::Relaxed));
        TransientPeaks {
            in_left: take(&self.input[0]),
            in_right: take(&self.input[1]),
            out_left: take(&self.output[0]),
            out_right: take(&self.output[1]),
        }
    }
}

fn store_max(slot: &AtomicU32, peak: f32) {
    let peak = peak.abs();
    if peak.is_finite() {
        slot.fetch_max(peak.to_bits(), Ordering::Relaxed);
    }
}

/// Instantaneous per-channel peaks for VU display: input is the live signal,
/// output is the loop mix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransientPeaks {
    pub in_left: f32,
    pub in_right: f32,
    pub out_left: f32,
    pub out_right: f32,
}

impl TransientPeaks {
    pub fn as_array(&self) -> [f32; 4] {
        [self.in_left, self.in_right, self.out_left, self.out_right]
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Counters bumped by the audio thread; the controller logs changes.
#[derive(Debug, Default)]
pub struct EngineDiagnostics {
    pub periods: AtomicUsize,
    pub rollovers: AtomicUsize,
    pub loops_committed: AtomicUsize,
    pub degenerate_rollovers: AtomicUsize,
    pub capacity_rollovers: AtomicUsize,
    pub rebase_failures: AtomicUsize,
    pub out_of_memory: AtomicUsize,
    pub events_dropped: AtomicUsize,
    pub retire_overflows: AtomicUsize,
    pub input_underruns: AtomicUsize,
    pub stream_errors: AtomicUsize,
}

impl EngineDiagnostics {
    pub fn reset(&self) {
        self.periods.store(0, Ordering::Relaxed);
        self.rollovers.store(0, Ordering::Relaxed);
        self.loops_committed.store(0, Ordering::Relaxed);
        self.degenerate_rollovers.store(0, Ordering::Relaxed);
        self.capacity_rollovers.store(0, Ordering::Relaxed);
        self.rebase_failures.store(0, Ordering::Relaxed);
        self.out_of_memory.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
        self.retire_overflows.store(0, Ordering::Relaxed);
        self.input_underruns.store(0, Ordering::Relaxed);
        self.stream_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            periods: self.periods.load(Ordering::Relaxed),
            rollovers: self.rollovers.load(Ordering::Relaxed),
            loops_committed: self.loops_committed.load(Ordering::Relaxed),
            degenerate_rollovers: self.degenerate_rollovers.load(Ordering::Relaxed),
            capacity_rollovers: self.capacity_rollovers.load(Ordering::Relaxed),
            rebase_failures: self.rebase_failures.load(Ordering::Relaxed),
            out_of_memory: self.out_of_memory.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            retire_overflows: self.retire_overflows.load(Ordering::Relaxed),
            input_underruns: self.input_underruns.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub periods: usize,
    pub rollovers: usize,
    pub loops_committed: usize,
    pub degenerate_rollovers: usize,
    pub capacity_rollovers: usize,
    pub rebase_failures: usize,
    pub out_of_memory: usize,
    pub events_dropped: usize,
    pub retire_overflows: usize,
    pub input_underruns: usize,
    pub stream_errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn peak_meter_keeps_maximum_magnitude_until_taken() {
        let meter = PeakMeter::default();
        meter.record([0.2, -0.7], [0.1, 0.0]);
        meter.record([-0.5, 0.3], [0.4, f32::NAN]);

        let peaks = meter.take();
        assert_abs_diff_eq!(peaks.in_left, 0.5);
        assert_abs_diff_eq!(peaks.in_right, 0.7);
        assert_abs_diff_eq!(peaks.out_left, 0.4);
        assert_abs_diff_eq!(peaks.out_right, 0.0);

        assert_eq!(meter.take(), TransientPeaks::default());
    }

    #[test]
    fn diagnostics_reset_zeroes_every_counter() {
        let diagnostics = EngineDiagnostics::default();
        EngineDiagnostics::bump(&diagnostics.rollovers);
        EngineDiagnostics::bump(&diagnostics.events_dropped);
        assert_eq!(diagnostics.snapshot().rollovers, 1);

        diagnostics.reset();
        assert_eq!(diagnostics.snapshot(), DiagnosticsSnapshot::default());
    }
}
