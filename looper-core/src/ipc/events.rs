//! Engine notifications and display-facing status types.
//!
//! | Type | Direction | Transport |
//! |------|-----------|-----------|
//! | `EngineEvent` | audio → control | bounded `crossbeam_channel`, drop-oldest |
//! | loop announcements | audio → control | SPSC `ringbuf`, never overwritten |
//! | `EventNotice` | control → display | serde JSON |
//!
//! A new loop is the one fact the controller cannot rebuild later: without it
//! the loop plays but can never be muted, deleted or recycled. Loops are
//! therefore announced on their own ring, sized so it cannot fill, and only
//! the remaining notifications share the lossy queue.
//! | `LooperStatus` | control → display | serde JSON |

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use ringbuf::traits::Split;
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};

use crate::engine::shared::{DiagnosticsSnapshot, TransientPeaks};
use crate::scene::{loops::Loop, TransportState};

/// Queue depth between the audio and control threads.
pub const EVENT_QUEUE_CAPACITY: usize = 8;

// ---------------------------------------------------------------------------
// Engine events
// ---------------------------------------------------------------------------

/// Facts produced by the rollover protocol, consumed once by the controller.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A loop was committed and appended to `scene`.
    LoopCreated { scene: usize, looped: Arc<Loop> },
    /// The deferred scene switch took effect.
    SceneChanged { scene: usize },
    /// No loop slot was available; the take was dropped, playback continues.
    OutOfMemory { scene: usize },
    /// The base take ran past the record window and the scene was reset.
    CapacityExceeded { scene: usize },
}

impl EngineEvent {
    pub fn scene(&self) -> usize {
        match self {
            Self::LoopCreated { scene, .. }
            | Self::SceneChanged { scene }
            | Self::OutOfMemory { scene }
            | Self::CapacityExceeded { scene } => *scene,
        }
    }

    pub fn notice(&self) -> EventNotice {
        let (kind, looped) = match self {
            Self::LoopCreated { looped, .. } => (EventKind::LoopCreated, Some(looped)),
            Self::SceneChanged { .. } => (EventKind::SceneChanged, None),
            Self::OutOfMemory { .. } => (EventKind::OutOfMemory, None),
            Self::CapacityExceeded { .. } => (EventKind::CapacityExceeded, None),
        };
        EventNotice {
            kind,
            scene: self.scene(),
            loop_id: looped.map(|l| l.id()),
            loop_frames: looped.map(|l| l.n_frames()),
        }
    }
}

/// A committed loop and the scene it was appended to.
pub type LoopAnnouncement = (usize, Arc<Loop>);
pub type AnnounceProducer = ringbuf::HeapProd<LoopAnnouncement>;
pub type AnnounceConsumer = ringbuf::HeapCons<LoopAnnouncement>;

/// Create the loop announcement ring. The engine checks for room before it
/// appends a loop, so an announcement is never dropped.
pub fn announce_channel(capacity: usize) -> (AnnounceProducer, AnnounceConsumer) {
    HeapRb::<LoopAnnouncement>::new(capacity.max(1)).split()
}

/// Audio-thread half of the notification queue.
///
/// Sending never blocks: when the queue is full the oldest queued event is
/// evicted to make room. Evicted or undeliverable events are handed to the
/// caller to be counted.
pub struct EventSender {
    tx: Sender<EngineEvent>,
    /// Second handle on the queue, used only to evict.
    overflow: Receiver<EngineEvent>,
}

/// Create the notification queue. Capacity is clamped to at least one slot.
pub fn event_channel(capacity: usize) -> (EventSender, Receiver<EngineEvent>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (
        EventSender {
            tx,
            overflow: rx.clone(),
        },
        rx,
    )
}

impl EventSender {
    pub fn send(&self, event: EngineEvent, mut discard: impl FnMut(EngineEvent)) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                if let Ok(oldest) = self.overflow.try_recv() {
                    discard(oldest);
                }
                if let Err(err) = self.tx.try_send(event) {
                    discard(err.into_inner());
                }
            }
            Err(TrySendError::Disconnected(event)) => discard(event),
        }
    }
}

// ---------------------------------------------------------------------------
// Display notices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LoopCreated,
    SceneChanged,
    OutOfMemory,
    CapacityExceeded,
}

/// Serialisable summary of an [`EngineEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotice {
    pub kind: EventKind,
    pub scene: usize,
    pub loop_id: Option<u64>,
    /// Loop length in frames, margins included.
    pub loop_frames: Option<usize>,
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStatus {
    pub id: u64,
    pub vol: f32,
    pub is_muted: bool,
    pub frames: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneStatus {
    pub index: usize,
    pub state: TransportState,
    pub is_muted: bool,
    /// Position within the cycle in [0, 1].
    pub progress: f32,
    pub cycle_seconds: f32,
    pub loops: Vec<LoopStatus>,
}

/// Everything a display needs for one refresh.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LooperStatus {
    pub current_scene: usize,
    pub next_scene: usize,
    pub monitor_inputs: bool,
    pub auto_scene_change: bool,
    pub scenes: Vec<SceneStatus>,
    pub peaks: TransientPeaks,
    pub diagnostics: DiagnosticsSnapshot,
}
