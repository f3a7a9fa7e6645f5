//! Messages crossing the audio/control thread boundary.
//!
//! Notifications flow audio → control over a bounded queue; the
//! serialisable status types are what a display layer consumes.

pub mod events;
