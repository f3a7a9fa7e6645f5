//! Structural requests from the controller, applied by the audio thread at
//! the start of the next period.
//!
//! Scalars (arm, mute, volume, scene selection) are atomics and never go
//! through here; only changes to a scene's loop list or geometry do.

use ringbuf::traits::{Producer, Split};
use ringbuf::HeapRb;

use crate::error::{LooperError, Result};

/// Default depth of the command queue.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    /// Close the base take of `scene`. `None` ends it at the current position;
    /// `Some(n)` declares an `n`-frame cycle.
    MarkLoopEnd { scene: usize, frames: Option<usize> },
    /// Remove the loop with `loop_id` from `scene`.
    DeleteLoop { scene: usize, loop_id: u64 },
    ResetScene { scene: usize },
    /// Reset every scene and select scene 0.
    ResetAll,
}

pub type CommandConsumer = ringbuf::HeapCons<EngineCommand>;

/// Controller half of the command queue.
pub struct CommandSender {
    inner: ringbuf::HeapProd<EngineCommand>,
}

pub fn command_channel(capacity: usize) -> (CommandSender, CommandConsumer) {
    let (inner, consumer) = HeapRb::<EngineCommand>::new(capacity.max(1)).split();
    (CommandSender { inner }, consumer)
}

impl CommandSender {
    pub fn send(&mut self, command: EngineCommand) -> Result<()> {
        self.inner
            .try_push(command)
            .map_err(|_| LooperError::CommandQueueFull)
    }
}
