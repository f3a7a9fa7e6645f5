use thiserror::Error;

/// All errors produced by looper-core.
#[derive(Debug, Error)]
pub enum LooperError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("input runs at {input} Hz but output runs at {output} Hz")]
    SampleRateMismatch { input: u32, output: u32 },

    #[error("invalid stream geometry: {sample_rate} Hz with {frames_per_period} frames per period")]
    InvalidMetadata {
        sample_rate: u32,
        frames_per_period: usize,
    },

    #[error("record buffer of {capacity} frames is too small, at least {required} frames are needed")]
    RecordBufferTooSmall { capacity: usize, required: usize },

    #[error("out of memory allocating {frames} frames")]
    OutOfMemory { frames: usize },

    #[error("loop of {frames} frames exceeds the {max} frame record window")]
    LoopExceedsCapacity { frames: usize, max: usize },

    #[error("scene {0} does not exist")]
    SceneOutOfRange(usize),

    #[error("scene {scene} has no loop at position {position}")]
    LoopOutOfRange { scene: usize, position: usize },

    #[error("engine command queue is full")]
    CommandQueueFull,
}

pub type Result<T> = std::result::Result<T, LooperError>;
