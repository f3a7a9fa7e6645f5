//! Per-period mixing.
//!
//! For a rolling scene every frame of the period is rebuilt in the record
//! buffer as `input + Σ loop × vol` and then copied to the hardware output,
//! so the record buffer always holds exactly what was heard.

use crate::buffering::record::RecordBuffer;
use crate::scene::Scene;

/// Peak magnitudes seen during one period.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct PeriodPeaks {
    pub input: [f32; 2],
    pub loops: [f32; 2],
}

/// Mix one chunk (at most one period) of a rolling scene.
///
/// `inputs` shorter than the outputs are padded with silence. Frames past the
/// scene's end wrap to the start of the next cycle so a rollover never leaves
/// a gap in playback.
pub(crate) fn mix_period(
    record: &mut RecordBuffer,
    scene: &Scene,
    inputs: [&[f32]; 2],
    outputs: [&mut [f32]; 2],
    monitor: bool,
) -> PeriodPeaks {
    let frames = outputs[0].len().min(outputs[1].len());
    let start = scene.current_frame();
    let end = scene.end_frame();
    let n_frames = scene.n_frames();
    let scene_muted = scene.is_muted();
    let mut peaks = PeriodPeaks::default();

    let (left, right) = record.channels_mut();
    for (ch, (ring, output)) in [left, right].into_iter().zip(outputs).enumerate() {
        let Some(region) = ring.get_mut(start..start + frames) else {
            output.fill(0.0);
            continue;
        };

        region.fill(0.0);
        for looped in scene.loops().iter().filter(|l| l.is_audible(scene_muted)) {
            let vol = looped.vol();
            let samples = looped.channel(ch);
            for (i, slot) in region.iter_mut().enumerate() {
                let mix_idx = start + i;
                let loop_idx = if mix_idx >= end {
                    mix_idx - n_frames
                } else {
                    mix_idx
                };
                if let Some(sample) = samples.get(loop_idx) {
                    *slot += sample * vol;
                }
            }
        }
        peaks.loops[ch] = peak(region);

        let input = inputs[ch];
        for (i, slot) in region.iter_mut().enumerate() {
            let sample = input.get(i).copied().unwrap_or(0.0);
            peaks.input[ch] = peaks.input[ch].max(sample.abs());
            if monitor {
                *slot += sample;
            }
        }

        output[..frames].copy_from_slice(region);
        output[frames..].fill(0.0);
    }
    peaks
}

/// Idle transport: the record buffer is left alone and the input is passed
/// straight through when monitoring is on.
pub(crate) fn passthrough(
    inputs: [&[f32]; 2],
    outputs: [&mut [f32]; 2],
    monitor: bool,
) -> PeriodPeaks {
    let mut peaks = PeriodPeaks::default();
    for (ch, output) in outputs.into_iter().enumerate() {
        for (i, slot) in output.iter_mut().enumerate() {
            let sample = inputs[ch].get(i).copied().unwrap_or(0.0);
            peaks.input[ch] = peaks.input[ch].max(sample.abs());
            *slot = if monitor { sample } else { 0.0 };
        }
    }
    peaks
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |p, s| p.max(s.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Metadata, Timing};
    use crate::scene::loops::Loop;
    use crate::scene::SceneFlags;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    const PERIOD: usize = 64;

    fn metadata() -> Metadata {
        let timing = Timing {
            min_loop_duration_ms: 10,
            buffer_margin_frames: 128,
        };
        Metadata::resolve(8_000, PERIOD, 8_192, &timing).unwrap()
    }

    /// A rolling scene with a 1000-frame cycle and constant-valued loops.
    fn scene_with_loops(values: &[(f32, f32)]) -> (Scene, Metadata) {
        let m = metadata();
        let flags = Arc::new(SceneFlags::default());
        flags.start_rolling();
        let mut scene = Scene::new(0, 9, &m, flags);
        let n = 1000;
        scene.set_cycle(m.begin_frame, m.begin_frame + n, m.begin_frame);
        for (id, &(value, vol)) in values.iter().enumerate() {
            let len = n + 2 * m.buffer_margin_size;
            let l = Loop::from_samples(id as u64, vec![value; len], vec![-value; len]);
            l.set_vol(vol);
            scene.push_loop(Arc::new(l)).unwrap();
        }
        (scene, m)
    }

    fn run(scene: &Scene, input: f32, monitor: bool) -> ([Vec<f32>; 2], PeriodPeaks, RecordBuffer) {
        let mut record = RecordBuffer::new(8_192).unwrap();
        let inputs = vec![input; PERIOD];
        let mut out_l = vec![9.0; PERIOD];
        let mut out_r = vec![9.0; PERIOD];
        let peaks = mix_period(
            &mut record,
            scene,
            [&inputs, &inputs],
            [&mut out_l, &mut out_r],
            monitor,
        );
        ([out_l, out_r], peaks, record)
    }

    #[test]
    fn output_is_sum_of_loop_samples_times_volume() {
        let (scene, _) = scene_with_loops(&[(0.5, 1.0), (0.25, 0.5), (0.1, 0.2)]);
        let ([left, right], _, _) = run(&scene, 0.0, true);
        let expected = 0.5 + 0.25 * 0.5 + 0.1 * 0.2;
        for (l, r) in left.iter().zip(&right) {
            assert_abs_diff_eq!(*l, expected, epsilon = 1e-6);
            assert_abs_diff_eq!(*r, -expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn mixing_does_not_depend_on_loop_order() {
        let loops = [(0.3, 0.9), (-0.2, 0.4), (0.7, 0.1)];
        let mut reversed = loops;
        reversed.reverse();
        let (a, _) = scene_with_loops(&loops);
        let (b, _) = scene_with_loops(&reversed);
        let ([la, _], _, _) = run(&a, 0.1, true);
        let ([lb, _], _, _) = run(&b, 0.1, true);
        for (x, y) in la.iter().zip(&lb) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
        }
    }

    #[test]
    fn individually_muted_loop_plays_while_scene_is_unmuted() {
        let (scene, _) = scene_with_loops(&[(0.5, 1.0)]);
        scene.loops()[0].set_muted(true);
        let ([left, _], _, _) = run(&scene, 0.0, true);
        assert_abs_diff_eq!(left[0], 0.5);

        scene.flags().set_muted(true);
        let ([left, _], _, _) = run(&scene, 0.0, true);
        assert_abs_diff_eq!(left[0], 0.0);

        // A muted scene still plays loops that are not muted themselves.
        scene.loops()[0].set_muted(false);
        let ([left, _], _, _) = run(&scene, 0.0, true);
        assert_abs_diff_eq!(left[0], 0.5);
    }

    #[test]
    fn monitoring_off_records_silence_instead_of_input() {
        let (scene, m) = scene_with_loops(&[]);
        let ([left, _], peaks, record) = run(&scene, 0.4, false);
        assert!(left.iter().all(|s| *s == 0.0));
        assert!(record.channel(0)[m.begin_frame..m.begin_frame + PERIOD]
            .iter()
            .all(|s| *s == 0.0));
        assert_abs_diff_eq!(peaks.input[0], 0.4);
    }

    #[test]
    fn record_buffer_holds_input_plus_loops() {
        let (scene, m) = scene_with_loops(&[(0.25, 1.0)]);
        let (_, peaks, record) = run(&scene, 0.5, true);
        assert_abs_diff_eq!(record.channel(0)[m.begin_frame], 0.75);
        assert_abs_diff_eq!(record.channel(1)[m.begin_frame], 0.25);
        assert_abs_diff_eq!(peaks.loops[0], 0.25);
        assert_abs_diff_eq!(peaks.input[1], 0.5);
    }

    #[test]
    fn frames_past_end_read_from_start_of_loop() {
        let m = metadata();
        let flags = Arc::new(SceneFlags::default());
        flags.start_rolling();
        let mut scene = Scene::new(0, 9, &m, flags);
        let n = 100;
        let b = m.begin_frame;
        scene.set_cycle(b, b + n, b + n - 10);
        let len = n + 2 * m.buffer_margin_size;
        let ramp: Vec<f32> = (0..len).map(|i| i as f32).collect();
        scene
            .push_loop(Arc::new(Loop::from_samples(0, ramp.clone(), ramp)))
            .unwrap();

        let ([left, _], _, _) = run(&scene, 0.0, true);
        // Last ten frames of the cycle, then the first frames of the next one.
        assert_abs_diff_eq!(left[9], (b + n - 1) as f32);
        assert_abs_diff_eq!(left[10], b as f32);
        assert_abs_diff_eq!(left[11], (b + 1) as f32);
    }

    #[test]
    fn passthrough_follows_monitor_switch() {
        let input = vec![0.3f32; 8];
        let mut l = vec![1.0; 8];
        let mut r = vec![1.0; 8];
        let peaks = passthrough([&input, &[]], [&mut l, &mut r], true);
        assert!(l.iter().all(|s| *s == 0.3));
        assert!(r.iter().all(|s| *s == 0.0));
        assert_abs_diff_eq!(peaks.input[0], 0.3);

        passthrough([&input, &input], [&mut l, &mut r], false);
        assert!(l.iter().all(|s| *s == 0.0));
    }
}
