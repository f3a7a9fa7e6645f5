//! `LooperController`: the control-thread half of the looper.
//!
//! Every user action lands here. Scalar edits (arm, mute, volume, scene
//! selection) are atomic stores the audio thread sees on its next period;
//! structural edits (end of a base take, delete, reset) are queued as
//! [`EngineCommand`]s. Call [`LooperController::poll`] and
//! [`LooperController::scan_peaks`] once per display tick.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use ringbuf::traits::Consumer;
use tracing::{debug, info, warn};

use crate::{
    engine::{
        command::{CommandSender, EngineCommand},
        shared::{DiagnosticsSnapshot, SharedState, TransientPeaks},
        EngineConfig,
    },
    error::{LooperError, Result},
    ipc::events::{AnnounceConsumer, EngineEvent, LoopStatus, LooperStatus, SceneStatus},
    scene::{
        loops::{Loop, LoopPool, RetireConsumer, LOOP_VOL_INC},
        SceneFlags, TransportState,
    },
};

/// Control-side list of a scene's loops, in recording order.
#[derive(Debug, Default)]
pub struct SceneView {
    loops: Vec<Arc<Loop>>,
}

impl SceneView {
    pub fn loops(&self) -> &[Arc<Loop>] {
        &self.loops
    }

    pub fn n_loops(&self) -> usize {
        self.loops.len()
    }
}

pub struct LooperController {
    shared: Arc<SharedState>,
    commands: CommandSender,
    events: Receiver<EngineEvent>,
    announced: AnnounceConsumer,
    retired: RetireConsumer,
    pool: LoopPool,
    scenes: Vec<SceneView>,
    auto_scene_change: bool,
    peaks_in: VecDeque<f32>,
    peaks_out: VecDeque<f32>,
    transient: TransientPeaks,
    reported: DiagnosticsSnapshot,
}

impl LooperController {
    pub(crate) fn new(
        shared: Arc<SharedState>,
        commands: CommandSender,
        events: Receiver<EngineEvent>,
        announced: AnnounceConsumer,
        retired: RetireConsumer,
        pool: LoopPool,
        config: &EngineConfig,
    ) -> Self {
        let scope_len = config.scope_len.max(1);
        let scenes = (0..shared.n_scenes()).map(|_| SceneView::default()).collect();
        Self {
            shared,
            commands,
            events,
            announced,
            retired,
            pool,
            scenes,
            auto_scene_change: config.auto_scene_change,
            peaks_in: VecDeque::from(vec![0.0; scope_len]),
            peaks_out: VecDeque::from(vec![0.0; scope_len]),
            transient: TransientPeaks::default(),
            reported: DiagnosticsSnapshot::default(),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn n_scenes(&self) -> usize {
        self.scenes.len()
    }

    pub fn current_scene(&self) -> usize {
        self.shared.current_scene()
    }

    pub fn next_scene(&self) -> usize {
        self.shared.next_scene()
    }

    pub fn scene(&self, index: usize) -> Option<&SceneView> {
        self.scenes.get(index)
    }

    pub fn transport_state(&self, scene: usize) -> Result<TransportState> {
        Ok(self.flags(scene)?.transport_state())
    }

    pub fn auto_scene_change(&self) -> bool {
        self.auto_scene_change
    }

    pub fn set_auto_scene_change(&mut self, enabled: bool) {
        self.auto_scene_change = enabled;
    }

    pub fn monitor_inputs(&self) -> bool {
        self.shared.monitor_inputs()
    }

    pub fn set_monitor_inputs(&self, enabled: bool) {
        self.shared.set_monitor_inputs(enabled);
    }

    /// Empty loop slots currently stocked for the audio thread.
    pub fn spare_slots(&self) -> usize {
        self.pool.available()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics().snapshot()
    }

    fn flags(&self, scene: usize) -> Result<&Arc<SceneFlags>> {
        self.shared
            .scene(scene)
            .ok_or(LooperError::SceneOutOfRange(scene))
    }

    fn loop_at(&self, scene: usize, position: usize) -> Result<&Arc<Loop>> {
        self.scenes
            .get(scene)
            .ok_or(LooperError::SceneOutOfRange(scene))?
            .loops
            .get(position)
            .ok_or(LooperError::LoopOutOfRange { scene, position })
    }

    // ── Transport ─────────────────────────────────────────────────────────

    /// The single record/play action on the current scene:
    /// IDLE → RECORDING_BASE, RECORDING_BASE → close the take,
    /// PLAYING ⇄ OVERDUB_ARMED.
    pub fn toggle_state(&mut self) -> Result<TransportState> {
        let index = self.current_scene();
        let flags = Arc::clone(self.flags(index)?);
        match flags.transport_state() {
            TransportState::Idle => {
                flags.start_rolling();
                info!(scene = index, "recording base loop");
            }
            TransportState::RecordingBase => {
                self.commands.send(EngineCommand::MarkLoopEnd {
                    scene: index,
                    frames: None,
                })?;
                debug!(scene = index, "closing base loop");
            }
            TransportState::Playing | TransportState::OverdubArmed => {
                let armed = flags.toggle_should_save_loop();
                debug!(scene = index, armed, "overdub arm toggled");
            }
        }
        Ok(flags.transport_state())
    }

    /// Declare where the base take of `scene` ends: `None` closes it at the
    /// current position, `Some(frames)` fixes the cycle length.
    pub fn mark_loop_end(&mut self, scene: usize, frames: Option<usize>) -> Result<()> {
        self.flags(scene)?;
        if let Some(frames) = frames {
            let max = self.shared.max_cycle_frames();
            if frames > max {
                return Err(LooperError::LoopExceedsCapacity { frames, max });
            }
        }
        self.commands
            .send(EngineCommand::MarkLoopEnd { scene, frames })
    }

    pub fn set_armed(&self, scene: usize, armed: bool) -> Result<()> {
        self.flags(scene)?.set_should_save_loop(armed);
        Ok(())
    }

    // ── Scene selection ───────────────────────────────────────────────────

    /// Select the scene to play after the current one. Takes effect at once
    /// when the current scene is idle, otherwise at its next rollover.
    pub fn set_next_scene(&mut self, scene: usize) -> Result<()> {
        self.flags(scene)?;
        self.shared.set_next_scene(scene);
        let current = self.current_scene();
        if !self.flags(current)?.is_rolling() {
            self.shared.set_current_scene(scene);
        }
        Ok(())
    }

    /// Switch to `scene` now if nothing is playing; while rolling the switch
    /// still waits for the rollover.
    pub fn set_current_scene(&mut self, scene: usize) -> Result<()> {
        self.set_next_scene(scene)
    }

    /// Advance the next-scene selection by one. Returns the new selection.
    pub fn toggle_scene(&mut self) -> Result<usize> {
        let next = (self.next_scene() + 1) % self.n_scenes();
        self.set_next_scene(next)?;
        Ok(next)
    }

    // ── Loop and scene edits ──────────────────────────────────────────────

    pub fn increment_loop_vol(&self, scene: usize, position: usize) -> Result<f32> {
        Ok(self.loop_at(scene, position)?.adjust_vol(LOOP_VOL_INC))
    }

    pub fn decrement_loop_vol(&self, scene: usize, position: usize) -> Result<f32> {
        Ok(self.loop_at(scene, position)?.adjust_vol(-LOOP_VOL_INC))
    }

    /// Returns the new mute state.
    pub fn toggle_loop_muted(&self, scene: usize, position: usize) -> Result<bool> {
        Ok(self.loop_at(scene, position)?.toggle_muted())
    }

    /// Mute or unmute the current scene. Returns the new mute state.
    pub fn toggle_scene_muted(&self) -> bool {
        self.shared
            .scene(self.current_scene())
            .map(|flags| flags.toggle_muted())
            .unwrap_or(false)
    }

    pub fn delete_loop(&mut self, scene: usize, position: usize) -> Result<()> {
        let loop_id = self.loop_at(scene, position)?.id();
        self.commands
            .send(EngineCommand::DeleteLoop { scene, loop_id })?;
        self.scenes[scene].loops.remove(position);
        info!(scene, position, loop_id, "loop deleted");
        Ok(())
    }

    pub fn delete_last_loop(&mut self) -> Result<()> {
        let scene = self.current_scene();
        let n_loops = self
            .scenes
            .get(scene)
            .ok_or(LooperError::SceneOutOfRange(scene))?
            .n_loops();
        if n_loops == 0 {
            return Err(LooperError::LoopOutOfRange { scene, position: 0 });
        }
        self.delete_loop(scene, n_loops - 1)
    }

    pub fn reset_scene(&mut self, scene: usize) -> Result<()> {
        self.flags(scene)?;
        self.commands.send(EngineCommand::ResetScene { scene })?;
        self.scenes[scene].loops.clear();
        info!(scene, "scene reset");
        Ok(())
    }

    pub fn reset_current_scene(&mut self) -> Result<()> {
        self.reset_scene(self.current_scene())
    }

    /// Reset every scene and return to scene 0.
    pub fn reset_all(&mut self) -> Result<()> {
        self.commands.send(EngineCommand::ResetAll)?;
        for view in &mut self.scenes {
            view.loops.clear();
        }
        info!("all scenes reset");
        Ok(())
    }

    // ── Per-tick work ─────────────────────────────────────────────────────

    /// Drain notifications from the audio thread, bring the scene views up to
    /// date, release retired loops and restock the slot pool.
    ///
    /// Returns the drained events for the display layer, new loops first.
    pub fn poll(&mut self) -> Vec<EngineEvent> {
        // Retirements are drained before announcements: a loop is always
        // announced before it is retired, so every retired loop seen here is
        // already integrated or about to be.
        let retired: Vec<Arc<Loop>> = self.retired.pop_iter().collect();
        let mut events: Vec<EngineEvent> = self
            .announced
            .pop_iter()
            .map(|(scene, looped)| EngineEvent::LoopCreated { scene, looped })
            .collect();
        events.extend(self.events.try_iter());

        for event in &events {
            self.integrate(event);
        }
        for gone in &retired {
            for view in &mut self.scenes {
                view.loops.retain(|l| !Arc::ptr_eq(l, gone));
            }
        }
        for gone in retired {
            self.pool.recycle(gone);
        }

        let slot_frames = self.shared.max_loop_frames();
        if slot_frames != self.pool.slot_frames() {
            self.pool.set_slot_frames(slot_frames);
        }
        if let Err(e) = self.pool.replenish() {
            warn!("could not restock loop slots: {e}");
        }

        self.report_diagnostics();
        events
    }

    fn integrate(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::LoopCreated { scene, looped } => {
                if let Some(view) = self.scenes.get_mut(*scene) {
                    view.loops.push(Arc::clone(looped));
                }
                info!(
                    scene = *scene,
                    loop_id = looped.id(),
                    frames = looped.n_frames(),
                    "loop committed"
                );
            }
            EngineEvent::SceneChanged { scene } => {
                info!(scene = *scene, "scene changed");
                if self.auto_scene_change {
                    self.advance_past_empty_scenes();
                }
            }
            EngineEvent::OutOfMemory { scene } => {
                warn!(scene = *scene, "no free loop slot, recording dropped");
            }
            EngineEvent::CapacityExceeded { scene } => {
                warn!(scene = *scene, "base loop exceeded the record buffer, scene reset");
            }
        }
    }

    /// Queue the following scene, skipping scenes with no loops.
    fn advance_past_empty_scenes(&mut self) {
        for _ in 0..self.n_scenes() {
            let Ok(next) = self.toggle_scene() else {
                return;
            };
            let has_loops = self
                .shared
                .scene(next)
                .map(|flags| flags.loop_count() > 0)
                .unwrap_or(false);
            if has_loops {
                return;
            }
        }
    }

    fn report_diagnostics(&mut self) {
        let now = self.diagnostics();
        let before = self.reported;
        if now.events_dropped > before.events_dropped {
            warn!(
                dropped = now.events_dropped - before.events_dropped,
                "engine notifications dropped"
            );
        }
        if now.rebase_failures > before.rebase_failures {
            warn!(
                failures = now.rebase_failures - before.rebase_failures,
                "cycle overran the record buffer, scene reset"
            );
        }
        if now.retire_overflows > before.retire_overflows {
            warn!(
                leaked = now.retire_overflows - before.retire_overflows,
                "retire queue overflowed"
            );
        }
        if now.input_underruns > before.input_underruns {
            debug!(
                underruns = now.input_underruns - before.input_underruns,
                "input underrun"
            );
        }
        if now.stream_errors > before.stream_errors {
            warn!(
                errors = now.stream_errors - before.stream_errors,
                "audio stream errors"
            );
        }
        self.reported = now;
    }

    // ── Peaks ─────────────────────────────────────────────────────────────

    /// Fold the peaks accumulated since the last call into the scope
    /// histories and the VU values.
    pub fn scan_peaks(&mut self) {
        let peaks = self.shared.peaks().take();
        let peak_in = ((peaks.in_left + peaks.in_right) / 2.0).min(1.0);
        let peak_out = ((peaks.out_left + peaks.out_right) / 2.0).min(1.0);

        self.peaks_in.push_front(peak_in);
        self.peaks_in.pop_back();
        self.peaks_out.push_front(peak_out);
        self.peaks_out.pop_back();
        self.transient = peaks;
    }

    /// Most recent first.
    pub fn peaks_in(&self) -> &VecDeque<f32> {
        &self.peaks_in
    }

    /// Most recent first.
    pub fn peaks_out(&self) -> &VecDeque<f32> {
        &self.peaks_out
    }

    pub fn transient_peaks(&self) -> TransientPeaks {
        self.transient
    }

    // ── Display ───────────────────────────────────────────────────────────

    pub fn status(&self) -> LooperStatus {
        let sample_rate = self.shared.sample_rate().max(1) as f32;
        let scenes = self
            .scenes
            .iter()
            .enumerate()
            .filter_map(|(index, view)| {
                let flags = self.shared.scene(index)?;
                let cycle = flags.end_frame().saturating_sub(flags.begin_frame());
                Some(SceneStatus {
                    index,
                    state: flags.transport_state(),
                    is_muted: flags.is_muted(),
                    progress: flags.progress(),
                    cycle_seconds: cycle as f32 / sample_rate,
                    loops: view
                        .loops
                        .iter()
                        .map(|l| LoopStatus {
                            id: l.id(),
                            vol: l.vol(),
                            is_muted: l.is_muted(),
                            frames: l.n_frames(),
                        })
                        .collect(),
                })
            })
            .collect();

        LooperStatus {
            current_scene: self.current_scene(),
            next_scene: self.next_scene(),
            monitor_inputs: self.monitor_inputs(),
            auto_scene_change: self.auto_scene_change,
            scenes,
            peaks: self.transient,
            diagnostics: self.diagnostics(),
        }
    }
}
