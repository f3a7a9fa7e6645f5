//! `LooperEngine`: the audio-thread half of the looper.
//!
//! ## Lifecycle
//!
//! ```text
//! new_looper(config, sample_rate, period)
//!     ├─► LooperEngine      → moved into the audio callback, process() per period
//!     └─► LooperController  → stays on the control thread
//! ```
//!
//! ## Threading
//!
//! `process()` never locks, allocates, logs or blocks. Anything it needs from
//! the control thread arrives as atomics in [`shared::SharedState`] or as an
//! [`command::EngineCommand`]; anything it reports goes out as an
//! [`EngineEvent`] (new loops on their own lossless ring). Loop memory comes from a pre-stocked slot ring and leaves
//! through the retire ring, so the last reference to a loop is never dropped
//! here.

mod boundary;
pub mod command;
pub(crate) mod mixer;
pub mod shared;

use std::sync::Arc;

use ringbuf::traits::{Consumer, Producer};
use serde::{Deserialize, Serialize};

use crate::{
    buffering::record::RecordBuffer,
    control::LooperController,
    error::Result,
    ipc::events::{
        announce_channel, event_channel, AnnounceProducer, EngineEvent, EventSender,
        EVENT_QUEUE_CAPACITY,
    },
    metadata::{Metadata, Timing, DEFAULT_BUFFER_MARGIN_FRAMES, DEFAULT_MIN_LOOP_DURATION_MS},
    scene::{
        loops::{retire_channel, slot_channel, Loop, LoopPool, RetireProducer, SlotConsumer},
        Scene, DEFAULT_MAX_LOOPS, DEFAULT_N_SCENES,
    },
};
use command::{command_channel, CommandConsumer, EngineCommand, COMMAND_QUEUE_CAPACITY};
use shared::{EngineDiagnostics, SharedState};

/// Default number of empty loop slots kept ready for the audio thread.
pub const DEFAULT_SPARE_LOOP_SLOTS: usize = 2;

/// Default length of the scope peak history.
pub const DEFAULT_SCOPE_LEN: usize = 100;

/// What to do when a base take fills the whole record window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloverPolicy {
    /// Restart the take from the beginning of the window and keep recording.
    Wrap,
    /// Abandon the take, return the scene to idle and report it.
    #[default]
    Reset,
}

/// Configuration for [`new_looper`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of scenes. Default: 3.
    pub n_scenes: usize,
    /// Loops a scene can hold. Default: 9.
    pub max_loops_per_scene: usize,
    /// Pass live input through to the output and into recordings. Default: true.
    pub monitor_inputs: bool,
    /// After a scene change, keep advancing past scenes without loops.
    /// Default: false.
    pub auto_scene_change: bool,
    /// Unmute the scene at every rollover so paused loops rejoin on the next
    /// cycle. Default: false.
    pub auto_unmute: bool,
    /// Default: [`RolloverPolicy::Reset`].
    pub rollover_policy: RolloverPolicy,
    /// Record buffer capacity in frames; 0 selects
    /// [`crate::buffering::record::DEFAULT_RECORD_BUFFER_FRAMES`].
    pub record_buffer_frames: usize,
    /// Shortest base loop accepted. Default: 1000 ms.
    pub min_loop_duration_ms: u32,
    /// Requested loop margin, rounded to whole periods. Default: 8192.
    pub buffer_margin_frames: usize,
    /// Empty loop slots kept stocked. 0 means every commit reports out of
    /// memory. Default: 2.
    pub spare_loop_slots: usize,
    /// Default: 8.
    pub event_queue_capacity: usize,
    /// Default: 64.
    pub command_queue_capacity: usize,
    /// Entries kept in each scope peak history. Default: 100.
    pub scope_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_scenes: DEFAULT_N_SCENES,
            max_loops_per_scene: DEFAULT_MAX_LOOPS,
            monitor_inputs: true,
            auto_scene_change: false,
            auto_unmute: false,
            rollover_policy: RolloverPolicy::Reset,
            record_buffer_frames: 0,
            min_loop_duration_ms: DEFAULT_MIN_LOOP_DURATION_MS,
            buffer_margin_frames: DEFAULT_BUFFER_MARGIN_FRAMES,
            spare_loop_slots: DEFAULT_SPARE_LOOP_SLOTS,
            event_queue_capacity: EVENT_QUEUE_CAPACITY,
            command_queue_capacity: COMMAND_QUEUE_CAPACITY,
            scope_len: DEFAULT_SCOPE_LEN,
        }
    }
}

impl EngineConfig {
    pub fn timing(&self) -> Timing {
        Timing {
            min_loop_duration_ms: self.min_loop_duration_ms,
            buffer_margin_frames: self.buffer_margin_frames,
        }
    }
}

/// Build an engine/controller pair for a stream at `sample_rate` with
/// `frames_per_period` frames per callback.
///
/// All memory the audio thread will ever touch is allocated here: the record
/// buffer, the scene loop lists, every queue, and the first stock of loop
/// slots.
///
/// # Errors
/// - `LooperError::OutOfMemory` when the record buffer or a slot cannot be allocated.
/// - `LooperError::InvalidMetadata` / `LooperError::RecordBufferTooSmall` for
///   unusable stream geometry.
pub fn new_looper(
    config: EngineConfig,
    sample_rate: u32,
    frames_per_period: usize,
) -> Result<(LooperEngine, LooperController)> {
    let record = RecordBuffer::new(config.record_buffer_frames)?;
    let metadata = Metadata::resolve(
        sample_rate,
        frames_per_period,
        record.capacity(),
        &config.timing(),
    )?;

    let n_scenes = config.n_scenes.max(1);
    let max_loops = config.max_loops_per_scene.max(1);
    let shared = Arc::new(SharedState::new(n_scenes, config.monitor_inputs, &metadata));
    let scenes: Vec<Scene> = shared
        .scene_flags()
        .iter()
        .enumerate()
        .map(|(index, flags)| Scene::new(index, max_loops, &metadata, Arc::clone(flags)))
        .collect();
    for scene in &scenes {
        scene.publish();
    }

    let (command_tx, commands) = command_channel(config.command_queue_capacity);
    let (events, event_rx) = event_channel(config.event_queue_capacity);
    let (slot_tx, slots) = slot_channel(config.spare_loop_slots);
    // Retired loops and rejected slots share the retire ring.
    let live_loops = n_scenes * max_loops + config.spare_loop_slots.max(1);
    let (retired, retired_rx) = retire_channel(2 * live_loops);
    // Every announced loop came out of a slot, and at most two stocks of slots
    // are handed over between drains.
    let (announced, announced_rx) = announce_channel(live_loops + config.spare_loop_slots);

    let mut pool = LoopPool::new(slot_tx, config.spare_loop_slots, metadata.max_loop_frames);
    pool.replenish()?;

    let controller = LooperController::new(
        Arc::clone(&shared),
        command_tx,
        event_rx,
        announced_rx,
        retired_rx,
        pool,
        &config,
    );
    let engine = LooperEngine {
        config,
        metadata,
        record,
        scenes,
        shared,
        commands,
        events,
        announced,
        slots,
        retired,
        next_loop_id: 1,
    };
    Ok((engine, controller))
}

/// Audio-thread engine context: owns the record buffer and the scenes.
pub struct LooperEngine {
    config: EngineConfig,
    metadata: Metadata,
    record: RecordBuffer,
    scenes: Vec<Scene>,
    shared: Arc<SharedState>,
    commands: CommandConsumer,
    events: EventSender,
    announced: AnnounceProducer,
    slots: SlotConsumer,
    retired: RetireProducer,
    next_loop_id: u64,
}

impl LooperEngine {
    /// Period callback. Output buffers longer than one period are processed
    /// in period-sized chunks; missing input frames read as silence.
    pub fn process(&mut self, inputs: [&[f32]; 2], outputs: [&mut [f32]; 2]) {
        self.apply_commands();

        let [out_left, out_right] = outputs;
        let frames = out_left.len().min(out_right.len());
        out_left[frames..].fill(0.0);
        out_right[frames..].fill(0.0);

        let period = self.metadata.frames_per_period;
        let mut offset = 0;
        while offset < frames {
            let len = period.min(frames - offset);
            let chunk_in = [
                input_chunk(inputs[0], offset, len),
                input_chunk(inputs[1], offset, len),
            ];
            let chunk_out = [
                &mut out_left[offset..offset + len],
                &mut out_right[offset..offset + len],
            ];
            self.process_chunk(chunk_in, chunk_out);
            offset += len;
        }
    }

    /// Sample-rate / period-size change callback.
    ///
    /// Idle scenes move to the new canonical window; scenes that are rolling
    /// or hold loops keep the geometry they were recorded with.
    pub fn set_metadata(&mut self, sample_rate: u32, frames_per_period: usize) -> Result<()> {
        let metadata = Metadata::resolve(
            sample_rate,
            frames_per_period,
            self.record.capacity(),
            &self.config.timing(),
        )?;
        self.metadata = metadata;
        self.shared.publish_metadata(&metadata);
        for scene in &mut self.scenes {
            if !scene.is_rolling() && scene.is_base() {
                scene.set_window(&metadata);
                scene.publish();
            }
        }
        Ok(())
    }

    /// Shutdown callback: hand every loop back to the controller and release
    /// the record buffer.
    pub fn shutdown(mut self) {
        for index in 0..self.scenes.len() {
            self.reset_scene(index);
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn scene(&self, index: usize) -> Option<&Scene> {
        self.scenes.get(index)
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn record_buffer(&self) -> &RecordBuffer {
        &self.record
    }

    pub fn current_scene(&self) -> usize {
        self.current_index()
    }

    fn current_index(&self) -> usize {
        self.shared.current_scene().min(self.scenes.len() - 1)
    }

    fn process_chunk(&mut self, inputs: [&[f32]; 2], outputs: [&mut [f32]; 2]) {
        EngineDiagnostics::bump(&self.shared.diagnostics().periods);
        let frames = outputs[0].len();
        let index = self.current_index();
        let monitor = self.shared.monitor_inputs();

        let peaks = if self.scenes[index].is_rolling() {
            let peaks = mixer::mix_period(
                &mut self.record,
                &self.scenes[index],
                inputs,
                outputs,
                monitor,
            );
            let scene = &mut self.scenes[index];
            scene.advance(frames);
            if scene.current_frame() >= scene.end_frame() {
                self.rollover(index);
            }
            self.scenes[index].publish();
            peaks
        } else {
            mixer::passthrough(inputs, outputs, monitor)
        };
        self.shared.peaks().record(peaks.input, peaks.loops);
    }

    fn apply_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                EngineCommand::MarkLoopEnd { scene, frames } => self.mark_loop_end(scene, frames),
                EngineCommand::DeleteLoop { scene, loop_id } => self.delete_loop(scene, loop_id),
                EngineCommand::ResetScene { scene } => self.abandon_scene(scene),
                EngineCommand::ResetAll => {
                    for index in 0..self.scenes.len() {
                        self.reset_scene(index);
                    }
                    self.shared.set_next_scene(0);
                    self.shared.set_current_scene(0);
                }
            }
        }
    }

    /// Close the base take of a rolling scene. An explicit length never
    /// places the end behind the write head or past the record window.
    fn mark_loop_end(&mut self, index: usize, frames: Option<usize>) {
        let Some(scene) = self.scenes.get_mut(index) else {
            return;
        };
        if !scene.is_rolling() || !scene.is_base() {
            return;
        }
        let end = match frames {
            None => scene.current_frame(),
            Some(n) => (scene.begin_frame() + n).max(scene.current_frame()),
        };
        scene.mark_end(end);
    }

    /// Remove one loop. A rolling scene left without loops has no cycle
    /// length to keep, so it goes back to IDLE.
    fn delete_loop(&mut self, index: usize, loop_id: u64) {
        let Some(scene) = self.scenes.get_mut(index) else {
            return;
        };
        let Some(removed) = scene.remove_loop(loop_id) else {
            return;
        };
        retire_loop(&mut self.retired, &self.shared, removed);
        if self.scenes[index].is_base() {
            self.abandon_scene(index);
        } else {
            self.scenes[index].publish();
        }
    }

    /// Reset a scene on request. If it was the one playing, a pending scene
    /// change no longer has a rollover to wait for and happens now.
    fn abandon_scene(&mut self, index: usize) {
        self.reset_scene(index);
        if index == self.current_index() {
            self.switch_scene_if_requested(index);
        }
    }

    fn reset_scene(&mut self, index: usize) {
        let metadata = self.metadata;
        let retired = &mut self.retired;
        let shared = &self.shared;
        if let Some(scene) = self.scenes.get_mut(index) {
            scene.reset(&metadata, |l| retire_loop(retired, shared, l));
        }
    }

    /// Queue a notification. New loops go through the announcement ring instead.
    fn emit(&mut self, event: EngineEvent) {
        let shared = &self.shared;
        self.events.send(event, |_| {
            EngineDiagnostics::bump(&shared.diagnostics().events_dropped);
        });
    }
}

/// Send a loop back to the control thread. If the retire ring is somehow full
/// the loop is leaked rather than freed on the audio thread.
fn retire_loop(retired: &mut RetireProducer, shared: &SharedState, looped: Arc<Loop>) {
    if let Err(looped) = retired.try_push(looped) {
        EngineDiagnostics::bump(&shared.diagnostics().retire_overflows);
        std::mem::forget(looped);
    }
}

fn input_chunk(input: &[f32], offset: usize, len: usize) -> &[f32] {
    let start = offset.min(input.len());
    let end = (offset + len).min(input.len());
    &input[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            record_buffer_frames: 4_096,
            min_loop_duration_ms: 50,
            buffer_margin_frames: 128,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn rejected_period_change_keeps_current_geometry() {
        let (mut engine, _controller) = new_looper(config(), 8_000, 64).unwrap();
        let before = *engine.metadata();

        assert!(engine.set_metadata(8_000, 4_096).is_err());
        assert!(engine.set_metadata(0, 64).is_err());
        assert_eq!(*engine.metadata(), before);
        assert_eq!(engine.shared().frames_per_period(), 64);
    }

    #[test]
    fn period_change_moves_idle_scenes_only() {
        let (mut engine, mut controller) = new_looper(config(), 8_000, 64).unwrap();
        controller.toggle_state().unwrap();
        let input = vec![0.0; 64];
        let mut l = vec![0.0; 64];
        let mut r = vec![0.0; 64];
        engine.process([&input, &input], [&mut l, &mut r]);

        engine.set_metadata(8_000, 256).unwrap();
        assert_eq!(engine.shared().frames_per_period(), 256);
        assert_eq!(engine.scene(0).unwrap().begin_frame(), 128);
        assert_eq!(engine.scene(1).unwrap().begin_frame(), 256);
    }
}
