//! The record buffer: where the current cycle is mixed, heard and captured.
//!
//! It is not a modular ring. The mixer writes forward from `begin_frame`
//! and, at every rollover, the tail of the finished cycle is copied back to
//! the head ("rebase") so the next cycle can reuse the same frames.

use crate::error::{LooperError, Result};

/// Capacity used when none is requested: 2^22 frames ≈ 87.4 s at 48 kHz.
pub const DEFAULT_RECORD_BUFFER_FRAMES: usize = 1 << 22;

/// Stereo in, stereo out.
pub const N_CHANNELS: usize = 2;

pub struct RecordBuffer {
    channels: [Vec<f32>; N_CHANNELS],
}

impl RecordBuffer {
    /// Allocate a zeroed buffer of `capacity` frames per channel, or
    /// [`DEFAULT_RECORD_BUFFER_FRAMES`] when `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        let frames = if capacity == 0 {
            DEFAULT_RECORD_BUFFER_FRAMES
        } else {
            capacity
        };
        Ok(Self {
            channels: [zeroed_channel(frames)?, zeroed_channel(frames)?],
        })
    }

    pub fn capacity(&self) -> usize {
        self.channels[0].len()
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.channels[ch]
    }

    pub(crate) fn channels_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        let [left, right] = &mut self.channels;
        (left.as_mut_slice(), right.as_mut_slice())
    }

    /// `len` frames of one channel starting at `start`, if in range.
    pub fn span(&self, ch: usize, start: usize, len: usize) -> Option<&[f32]> {
        let end = start.checked_add(len)?;
        self.channels.get(ch)?.get(start..end)
    }

    /// Copy `[start, start + len)` to the head of both channels.
    ///
    /// Returns `false` without touching anything when the range is out of bounds.
    pub(crate) fn rebase(&mut self, start: usize, len: usize) -> bool {
        let Some(end) = start.checked_add(len) else {
            return false;
        };
        if end > self.capacity() {
            return false;
        }
        for channel in &mut self.channels {
            channel.copy_within(start..end, 0);
        }
        true
    }

    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }
}

fn zeroed_channel(frames: usize) -> Result<Vec<f32>> {
    let mut channel = Vec::new();
    channel
        .try_reserve_exact(frames)
        .map_err(|_| LooperError::OutOfMemory { frames })?;
    channel.resize(frames, 0.0);
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_falls_back_to_default() {
        let buffer = RecordBuffer::new(0).unwrap();
        assert_eq!(buffer.capacity(), DEFAULT_RECORD_BUFFER_FRAMES);
    }

    #[test]
    fn rebase_moves_tail_to_head_on_both_channels() {
        let mut buffer = RecordBuffer::new(16).unwrap();
        {
            let (left, right) = buffer.channels_mut();
            for i in 0..16 {
                left[i] = i as f32;
                right[i] = -(i as f32);
            }
        }

        assert!(buffer.rebase(10, 4));
        assert_eq!(&buffer.channel(0)[..4], &[10.0, 11.0, 12.0, 13.0]);
        assert_eq!(&buffer.channel(1)[..4], &[-10.0, -11.0, -12.0, -13.0]);
        // Untouched beyond the copied range.
        assert_eq!(buffer.channel(0)[4], 4.0);
    }

    #[test]
    fn rebase_handles_overlapping_ranges() {
        let mut buffer = RecordBuffer::new(8).unwrap();
        {
            let (left, _) = buffer.channels_mut();
            for (i, s) in left.iter_mut().enumerate() {
                *s = i as f32;
            }
        }
        assert!(buffer.rebase(2, 5));
        assert_eq!(&buffer.channel(0)[..5], &[2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn out_of_range_requests_are_refused() {
        let mut buffer = RecordBuffer::new(8).unwrap();
        assert!(!buffer.rebase(6, 4));
        assert!(buffer.span(0, 6, 4).is_none());
        assert_eq!(buffer.span(1, 4, 4).map(<[f32]>::len), Some(4));
    }
}
