//! Sample storage shared by the audio callbacks.
//!
//! Two kinds of buffer live here:
//!
//! - the [`record::RecordBuffer`], the two-channel staging area the mixer
//!   writes every period into and loops are cut from;
//! - a lock-free SPSC ring (`ringbuf::HeapRb<f32>`) carrying interleaved
//!   stereo input from the capture callback to the playback callback, whose
//!   `push_slice`/`pop_slice` are wait-free and allocation-free.

pub mod record;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the capture callback.
pub type InputProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the playback callback.
pub type InputConsumer = ringbuf::HeapCons<f32>;

/// Interleaved stereo samples buffered between capture and playback:
/// 2^15 samples ≈ 340 ms at 48 kHz.
pub const INPUT_RING_CAPACITY: usize = 1 << 15;

/// Create a matched producer/consumer pair for the duplex input transport.
pub fn create_input_ring(capacity: usize) -> (InputProducer, InputConsumer) {
    HeapRb::<f32>::new(capacity.max(2)).split()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_ring_moves_interleaved_frames_in_order() {
        let (mut producer, mut consumer) = create_input_ring(8);
        assert_eq!(producer.push_slice(&[0.1, -0.1, 0.2, -0.2]), 4);

        let mut out = [0.0f32; 4];
        assert_eq!(consumer.pop_slice(&mut out), 4);
        assert_eq!(out, [0.1, -0.1, 0.2, -0.2]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn input_ring_reports_short_writes_when_full() {
        let (mut producer, _consumer) = create_input_ring(4);
        assert_eq!(producer.push_slice(&[1.0; 6]), 4);
    }
}
