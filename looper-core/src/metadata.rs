//! Derived stream geometry.
//!
//! Everything the mixer and the rollover protocol index with is computed here
//! from three inputs: the sample rate, the period size the audio server calls
//! us with, and the record buffer capacity. The host re-resolves whenever
//! either of the first two changes.
//!
//! ```text
//!  0          begin_frame                               end_frame  capacity
//!  |-- margin --|---------------- record window ------------|-- margin --|
//! ```

use crate::error::{LooperError, Result};

/// Default lead-in/lead-out padding around every committed loop.
pub const DEFAULT_BUFFER_MARGIN_FRAMES: usize = 8192;

/// Default shortest accepted base loop.
pub const DEFAULT_MIN_LOOP_DURATION_MS: u32 = 1000;

/// User-tunable inputs to the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub min_loop_duration_ms: u32,
    /// Requested margin; rounded down to whole periods, never below one period.
    pub buffer_margin_frames: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            min_loop_duration_ms: DEFAULT_MIN_LOOP_DURATION_MS,
            buffer_margin_frames: DEFAULT_BUFFER_MARGIN_FRAMES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub sample_rate: u32,
    pub frames_per_period: usize,
    /// Shortest base loop the rollover protocol will commit.
    pub min_loop_size: usize,
    /// Padding copied before and after every loop for click-free splicing.
    pub buffer_margin_size: usize,
    /// Rollover is only observed at period granularity, so it lags by at most
    /// one period.
    pub trigger_latency_size: usize,
    /// Canonical start of every cycle.
    pub begin_frame: usize,
    /// Canonical end of an unbounded base recording: the last whole period that
    /// still leaves room for the lead-out margin.
    pub end_frame: usize,
    /// Longest loop buffer that can ever be committed, margins included.
    pub max_loop_frames: usize,
}

impl Metadata {
    pub fn resolve(
        sample_rate: u32,
        frames_per_period: usize,
        capacity: usize,
        timing: &Timing,
    ) -> Result<Self> {
        if sample_rate == 0 || frames_per_period == 0 {
            return Err(LooperError::InvalidMetadata {
                sample_rate,
                frames_per_period,
            });
        }
        let period = frames_per_period;

        let min_loop_frames =
            (sample_rate as u64 * timing.min_loop_duration_ms as u64 / 1000) as usize;
        let min_loop_size = min_loop_frames.max(period);
        let buffer_margin_size = whole_periods(timing.buffer_margin_frames, period);
        let trigger_latency_size = period;
        let begin_frame = buffer_margin_size;
        let end_frame = period * (capacity.saturating_sub(buffer_margin_size) / period);

        if end_frame < begin_frame + min_loop_size {
            let required = 2 * buffer_margin_size + min_loop_size.div_ceil(period) * period;
            return Err(LooperError::RecordBufferTooSmall { capacity, required });
        }

        Ok(Self {
            sample_rate,
            frames_per_period,
            min_loop_size,
            buffer_margin_size,
            trigger_latency_size,
            begin_frame,
            end_frame,
            max_loop_frames: end_frame - begin_frame + 2 * buffer_margin_size,
        })
    }

    /// Longest cycle the record window can hold.
    pub fn max_cycle_frames(&self) -> usize {
        self.end_frame - self.begin_frame
    }

    pub fn frames_to_seconds(&self, frames: usize) -> f32 {
        frames as f32 / self.sample_rate as f32
    }
}

/// Round down to whole periods, keeping at least one.
fn whole_periods(frames: usize, period: usize) -> usize {
    period * (frames / period).max(1)
}
