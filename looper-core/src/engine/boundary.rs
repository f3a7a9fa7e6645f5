//! Rollover: what happens when a scene's position crosses its end frame.
//!
//! ```text
//!  capacity guard ─► min-length guard ─► auto-unmute ─► commit ─► rebase ─► scene switch
//! ```
//!
//! Runs inside the period callback, so every step is bounded: the commit
//! claims a pre-stocked slot, the rebase is one `copy_within` per channel.

use std::sync::Arc;

use ringbuf::traits::{Observer, Producer};

use super::{retire_loop, LooperEngine, RolloverPolicy};
use crate::engine::shared::EngineDiagnostics;
use crate::ipc::events::EngineEvent;
use crate::scene::loops::{claim_slot, Loop};

impl LooperEngine {
    pub(super) fn rollover(&mut self, index: usize) {
        EngineDiagnostics::bump(&self.shared.diagnostics().rollovers);

        let scene = &self.scenes[index];
        let begin = scene.begin_frame();
        let end = scene.end_frame();
        let overshoot = scene.current_frame() - end;
        let n_frames = end - begin;
        let is_base = scene.is_base();

        // A take that ran into the window limit overflows; one declared to end
        // exactly there does not.
        if is_base && !scene.is_end_marked() && end >= scene.max_end() {
            EngineDiagnostics::bump(&self.shared.diagnostics().capacity_rollovers);
            match self.config.rollover_policy {
                RolloverPolicy::Wrap => self.scenes[index].rewind(),
                RolloverPolicy::Reset => {
                    self.reset_scene(index);
                    self.emit(EngineEvent::CapacityExceeded { scene: index });
                    self.switch_scene_if_requested(index);
                }
            }
            return;
        }

        if is_base && n_frames < self.metadata.min_loop_size {
            // Spurious early close: keep recording the base take.
            EngineDiagnostics::bump(&self.shared.diagnostics().degenerate_rollovers);
            self.scenes[index].unmark_end();
            return;
        }

        if self.config.auto_unmute {
            self.scenes[index].flags().set_muted(false);
        }

        let scene = &self.scenes[index];
        let committed = if scene.should_save_loop() && !scene.is_full() {
            let margin = scene.margin();
            let recorded = scene.current_frame() - (begin - margin);
            let claimed = self.claim_loop(begin - margin, recorded, n_frames + 2 * margin);
            if claimed.is_none() {
                EngineDiagnostics::bump(&self.shared.diagnostics().out_of_memory);
                self.emit(EngineEvent::OutOfMemory { scene: index });
            }
            claimed
        } else {
            None
        };

        // The tail of this cycle becomes the lead-in of the next one, followed
        // by the frames already mixed past the end.
        let margin = self.scenes[index].margin();
        if !self.record.rebase(end - margin, margin + overshoot) {
            // Only reachable when the period grew under a rolling scene and the
            // last chunk ran off the buffer: the lead-in is gone.
            EngineDiagnostics::bump(&self.shared.diagnostics().rebase_failures);
            if let Some(looped) = committed {
                retire_loop(&mut self.retired, &self.shared, looped);
            }
            self.reset_scene(index);
            self.emit(EngineEvent::CapacityExceeded { scene: index });
            self.switch_scene_if_requested(index);
            return;
        }
        self.scenes[index].set_cycle(begin, end, begin + overshoot);

        if let Some(looped) = committed {
            self.append_loop(index, looped, is_base);
        }
        self.scenes[index].publish();

        self.switch_scene_if_requested(index);
    }

    /// Append a committed loop and announce it. Without room to announce it
    /// the loop is dropped like an allocation failure, so the controller never
    /// misses a loop that is playing.
    fn append_loop(&mut self, index: usize, looped: Arc<Loop>, is_base: bool) {
        if self.announced.is_full() {
            EngineDiagnostics::bump(&self.shared.diagnostics().out_of_memory);
            retire_loop(&mut self.retired, &self.shared, looped);
            self.emit(EngineEvent::OutOfMemory { scene: index });
            return;
        }
        let scene = &mut self.scenes[index];
        match scene.push_loop(Arc::clone(&looped)) {
            Ok(()) => {
                if is_base {
                    scene.flags().set_should_save_loop(false);
                }
                EngineDiagnostics::bump(&self.shared.diagnostics().loops_committed);
                // Room was checked above; the scene keeps its own reference.
                let _ = self.announced.try_push((index, looped));
            }
            Err(rejected) => {
                retire_loop(&mut self.retired, &self.shared, rejected);
                retire_loop(&mut self.retired, &self.shared, looped);
            }
        }
    }

    /// Take a slot from the pool and fill it with `[start, start + recorded)`
    /// of the record buffer, zero-padded to `len` frames.
    fn claim_loop(&mut self, start: usize, recorded: usize, len: usize) -> Option<Arc<Loop>> {
        let retired = &mut self.retired;
        let shared = &self.shared;
        let mut slot = claim_slot(&mut self.slots, len, |rejected| {
            retire_loop(retired, shared, rejected)
        })?;

        let id = self.next_loop_id;
        let filled = Arc::get_mut(&mut slot)
            .map(|l| l.fill(id, &self.record, start, recorded.min(len), len))
            .unwrap_or(false);
        if !filled {
            retire_loop(&mut self.retired, &self.shared, slot);
            return None;
        }
        self.next_loop_id += 1;
        Some(slot)
    }

    /// Realize a scene change requested while `index` was rolling.
    pub(super) fn switch_scene_if_requested(&mut self, index: usize) {
        let next = self.shared.next_scene();
        if next == index || next >= self.scenes.len() {
            return;
        }
        self.shared.set_current_scene(next);
        let incoming = &mut self.scenes[next];
        incoming.rewind();
        incoming.publish();
        self.emit(EngineEvent::SceneChanged { scene: next });
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{new_looper, EngineConfig, RolloverPolicy};
    use crate::ipc::events::EngineEvent;
    use crate::scene::TransportState;

    const PERIOD: usize = 64;
    const RATE: u32 = 8_000;

    fn config() -> EngineConfig {
        EngineConfig {
            record_buffer_frames: 4_096,
            min_loop_duration_ms: 50,
            buffer_margin_frames: 128,
            ..EngineConfig::default()
        }
    }

    fn run_periods(engine: &mut crate::LooperEngine, periods: usize, value: f32) {
        run_buffers(engine, PERIOD, periods, value);
    }

    fn run_buffers(engine: &mut crate::LooperEngine, frames: usize, calls: usize, value: f32) {
        let input = vec![value; frames];
        let mut l = vec![0.0; frames];
        let mut r = vec![0.0; frames];
        for _ in 0..calls {
            engine.process([&input, &input], [&mut l, &mut r]);
        }
    }

    #[test]
    fn early_close_of_base_take_is_ignored() {
        let (mut engine, mut controller) = new_looper(config(), RATE, PERIOD).unwrap();
        controller.toggle_state().unwrap();
        run_periods(&mut engine, 2, 0.1);
        // 128 frames recorded, well under the 400-frame minimum.
        controller.toggle_state().unwrap();
        run_periods(&mut engine, 1, 0.1);

        let scene = engine.scene(0).unwrap();
        assert_eq!(scene.n_loops(), 0);
        assert!(scene.should_save_loop());
        assert_eq!(scene.end_frame(), scene.max_end());
        assert_eq!(scene.transport_state(), TransportState::RecordingBase);
        assert_eq!(engine.shared().diagnostics().snapshot().degenerate_rollovers, 1);
    }

    #[test]
    fn full_window_resets_scene_by_default() {
        let (mut engine, mut controller) = new_looper(config(), RATE, PERIOD).unwrap();
        controller.toggle_state().unwrap();
        let window = engine.metadata().max_cycle_frames() / PERIOD;
        run_periods(&mut engine, window, 0.1);

        let scene = engine.scene(0).unwrap();
        assert!(!scene.is_rolling());
        assert_eq!(scene.transport_state(), TransportState::Idle);
        let events = controller.poll();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::CapacityExceeded { scene: 0 })));
    }

    #[test]
    fn full_window_restarts_take_with_wrap_policy() {
        let cfg = EngineConfig {
            rollover_policy: RolloverPolicy::Wrap,
            ..config()
        };
        let (mut engine, mut controller) = new_looper(cfg, RATE, PERIOD).unwrap();
        controller.toggle_state().unwrap();
        let window = engine.metadata().max_cycle_frames() / PERIOD;
        run_periods(&mut engine, window, 0.1);

        let scene = engine.scene(0).unwrap();
        assert!(scene.is_rolling());
        assert!(scene.should_save_loop());
        assert_eq!(scene.current_frame(), scene.begin_frame());
        assert!(controller.poll().is_empty());
    }

    #[test]
    fn declared_end_at_the_window_limit_commits() {
        let (mut engine, mut controller) = new_looper(config(), RATE, PERIOD).unwrap();
        let max = engine.metadata().max_cycle_frames();
        controller.toggle_state().unwrap();
        controller.mark_loop_end(0, Some(max)).unwrap();
        run_periods(&mut engine, max / PERIOD, 0.1);

        let scene = engine.scene(0).unwrap();
        assert_eq!(scene.n_loops(), 1);
        assert_eq!(scene.n_frames(), max);
        assert_eq!(scene.loops()[0].n_frames(), max + 2 * scene.margin());
        assert_eq!(scene.transport_state(), TransportState::Playing);
        assert_eq!(engine.shared().diagnostics().snapshot().capacity_rollovers, 0);
        let events = controller.poll();
        assert!(events
            .iter()
            .all(|e| !matches!(e, EngineEvent::CapacityExceeded { .. })));
        assert!(controller.mark_loop_end(0, Some(max + 1)).is_err());
    }

    #[test]
    fn cycle_running_off_the_buffer_after_a_period_change_resets_the_scene() {
        let (mut engine, mut controller) = new_looper(config(), RATE, PERIOD).unwrap();
        let max = engine.metadata().max_cycle_frames();
        controller.toggle_state().unwrap();
        controller.mark_loop_end(0, Some(max)).unwrap();
        run_periods(&mut engine, max / PERIOD, 0.1);
        controller.poll();
        assert_eq!(controller.scene(0).unwrap().n_loops(), 1);

        // Three periods in, the period quadruples. The scene keeps its
        // geometry, so the chunk that crosses the end runs past the buffer.
        run_periods(&mut engine, 3, 0.1);
        engine.set_metadata(RATE, 4 * PERIOD).unwrap();
        run_buffers(&mut engine, 4 * PERIOD, 15, 0.1);

        let scene = engine.scene(0).unwrap();
        assert_eq!(scene.transport_state(), TransportState::Idle);
        assert_eq!(scene.n_loops(), 0);
        assert_eq!(engine.shared().diagnostics().snapshot().rebase_failures, 1);
        let events = controller.poll();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::CapacityExceeded { scene: 0 })));
        assert_eq!(controller.scene(0).unwrap().n_loops(), 0);
    }

    #[test]
    fn overdub_commit_keeps_cycle_length_and_stays_armed() {
        let (mut engine, mut controller) = new_looper(config(), RATE, PERIOD).unwrap();
        controller.toggle_state().unwrap();
        controller.mark_loop_end(0, Some(640)).unwrap();
        run_periods(&mut engine, 10, 0.1);
        assert_eq!(engine.scene(0).unwrap().n_loops(), 1);
        assert_eq!(
            engine.scene(0).unwrap().transport_state(),
            TransportState::Playing
        );

        controller.poll();
        controller.toggle_state().unwrap();
        run_periods(&mut engine, 10, 0.2);

        let scene = engine.scene(0).unwrap();
        assert_eq!(scene.n_loops(), 2);
        assert_eq!(scene.n_frames(), 640);
        assert_eq!(scene.loops()[1].n_frames(), 640 + 2 * scene.margin());
        assert_eq!(scene.transport_state(), TransportState::OverdubArmed);
    }

    #[test]
    fn auto_unmute_clears_scene_mute_at_rollover() {
        let cfg = EngineConfig {
            auto_unmute: true,
            ..config()
        };
        let (mut engine, mut controller) = new_looper(cfg, RATE, PERIOD).unwrap();
        controller.toggle_state().unwrap();
        controller.mark_loop_end(0, Some(640)).unwrap();
        run_periods(&mut engine, 10, 0.1);
        controller.toggle_scene_muted();
        assert!(engine.scene(0).unwrap().is_muted());

        run_periods(&mut engine, 10, 0.1);
        assert!(!engine.scene(0).unwrap().is_muted());
    }
}
