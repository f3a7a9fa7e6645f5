//! # looper-core
//!
//! Real-time multi-scene audio looper engine.
//!
//! ## Architecture
//!
//! ```text
//! Input device ─► SPSC ring ─► output callback ─► LooperEngine::process ─► Output device
//!                                                   │  ▲
//!                               EngineEvent / Loop  │  │  EngineCommand, atomics
//!                                                   ▼  │
//!                                             LooperController (control thread)
//! ```
//!
//! The output callback is lock-free and allocation-free. Loop storage is
//! allocated by the controller and handed to the engine through a slot ring;
//! every loop the engine drops goes back the same way.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod control;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod metadata;
pub mod scene;

// Convenience re-exports for downstream crates
pub use control::{LooperController, SceneView};
pub use engine::{
    new_looper,
    shared::{DiagnosticsSnapshot, SharedState, TransientPeaks},
    EngineConfig, LooperEngine, RolloverPolicy,
};
pub use error::LooperError;
pub use ipc::events::{EngineEvent, EventKind, EventNotice, LooperStatus};
pub use metadata::Metadata;
pub use scene::{loops::Loop, Scene, TransportState};
