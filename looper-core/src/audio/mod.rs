//! Duplex audio host via the cpal backend.
//!
//! # Design constraints
//!
//! Both cpal data callbacks run on OS audio threads at elevated priority.
//! They **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The input callback converts to interleaved stereo f32 and pushes into an
//! SPSC ring. The output callback pops one period of input, runs
//! [`LooperEngine::process`] and writes the mix back in the device format.
//! Scratch buffers are sized before the streams are built.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioHost` must be created and dropped on the same thread.

pub mod device;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::Serialize;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BufferSize, Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream,
    StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use crate::{
    buffering::{
        create_input_ring, Consumer, InputConsumer, InputProducer, Observer, Producer,
        INPUT_RING_CAPACITY,
    },
    engine::shared::{EngineDiagnostics, SharedState},
};
use crate::{
    engine::LooperEngine,
    error::{LooperError, Result},
};

/// Period assumed when the device picks its own buffer size.
pub const DEFAULT_FRAMES_PER_PERIOD: usize = 512;

/// Largest number of frames the output callback hands the engine at once.
const SCRATCH_FRAMES: usize = 8192;

/// What the user asked for; [`StreamPlan::negotiate`] resolves it against
/// the devices that exist.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    /// Fixed callback size in frames. `None` leaves it to the device.
    pub buffer_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Running,
    Stopped,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub state: HostState,
    pub input_device: String,
    pub output_device: String,
    pub sample_rate: u32,
    pub frames_per_period: usize,
    pub last_error: Option<String>,
}

/// Devices and stream configs agreed on for both directions.
pub struct StreamPlan {
    #[cfg(feature = "audio-cpal")]
    input: Device,
    #[cfg(feature = "audio-cpal")]
    output: Device,
    #[cfg(feature = "audio-cpal")]
    input_config: StreamConfig,
    #[cfg(feature = "audio-cpal")]
    output_config: StreamConfig,
    #[cfg(feature = "audio-cpal")]
    input_format: SampleFormat,
    #[cfg(feature = "audio-cpal")]
    output_format: SampleFormat,
    pub input_name: String,
    pub output_name: String,
    pub sample_rate: u32,
    /// Period the engine should be built with.
    pub frames_per_period: usize,
    fixed_period: bool,
}

#[cfg(feature = "audio-cpal")]
impl StreamPlan {
    /// Open the preferred input and output devices (falling back to the
    /// defaults, then to the first available) and agree on one sample rate.
    ///
    /// # Errors
    /// - `LooperError::NoDefaultInputDevice` / `NoDefaultOutputDevice`
    /// - `LooperError::SampleRateMismatch` when the output cannot run at the
    ///   input's rate.
    pub fn negotiate(options: &HostOptions) -> Result<Self> {
        let host = cpal::default_host();
        let input = select_input(&host, options.input_device.as_deref())?;
        let output = select_output(&host, options.output_device.as_deref())?;
        let input_name = input.name().unwrap_or_default();
        let output_name = output.name().unwrap_or_default();

        if device::is_loopback_like_name(&input_name) {
            warn!(
                device = input_name.as_str(),
                "input looks like a loopback device; monitoring will feed the mix back into itself"
            );
        }

        let input_supported = input
            .default_input_config()
            .map_err(|e| LooperError::AudioDevice(e.to_string()))?;
        let sample_rate = input_supported.sample_rate().0;
        let (output_format, output_channels) = output_config_at(&output, sample_rate)?;

        let (buffer_size, frames_per_period, fixed_period) = match options.buffer_size {
            Some(frames) if frames > 0 => (BufferSize::Fixed(frames), frames as usize, true),
            _ => (BufferSize::Default, DEFAULT_FRAMES_PER_PERIOD, false),
        };

        let input_config = StreamConfig {
            channels: input_supported.channels(),
            sample_rate: SampleRate(sample_rate),
            buffer_size: buffer_size.clone(),
        };
        let output_config = StreamConfig {
            channels: output_channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size,
        };

        info!(
            input = input_name.as_str(),
            output = output_name.as_str(),
            sample_rate,
            frames_per_period,
            "audio config selected"
        );

        Ok(Self {
            input,
            output,
            input_config,
            output_config,
            input_format: input_supported.sample_format(),
            output_format,
            input_name,
            output_name,
            sample_rate,
            frames_per_period,
            fixed_period,
        })
    }
}

#[cfg(feature = "audio-cpal")]
fn select_input(host: &cpal::Host, preferred: Option<&str>) -> Result<Device> {
    if let Some(preferred_name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                let found = devices.find(|d| d.name().map(|n| n == preferred_name).unwrap_or(false));
                if let Some(found) = found {
                    return Ok(found);
                }
                warn!("preferred input device '{}' not found, falling back", preferred_name);
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }
    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }
    let mut devices = host
        .input_devices()
        .map_err(|e| LooperError::AudioDevice(e.to_string()))?;
    let fallback = devices.next().ok_or(LooperError::NoDefaultInputDevice)?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

#[cfg(feature = "audio-cpal")]
fn select_output(host: &cpal::Host, preferred: Option<&str>) -> Result<Device> {
    if let Some(preferred_name) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                let found = devices.find(|d| d.name().map(|n| n == preferred_name).unwrap_or(false));
                if let Some(found) = found {
                    return Ok(found);
                }
                warn!("preferred output device '{}' not found, falling back", preferred_name);
            }
            Err(e) => warn!("failed to list output devices while resolving preference: {e}"),
        }
    }
    if let Some(default) = host.default_output_device() {
        return Ok(default);
    }
    let mut devices = host
        .output_devices()
        .map_err(|e| LooperError::AudioDevice(e.to_string()))?;
    let fallback = devices.next().ok_or(LooperError::NoDefaultOutputDevice)?;
    warn!("no default output device, falling back to first available output");
    Ok(fallback)
}

/// Output format and channel count at `sample_rate`, preferring the device
/// default when it already matches.
#[cfg(feature = "audio-cpal")]
fn output_config_at(output: &Device, sample_rate: u32) -> Result<(SampleFormat, u16)> {
    let default = output
        .default_output_config()
        .map_err(|e| LooperError::AudioDevice(e.to_string()))?;
    if default.sample_rate().0 == sample_rate {
        return Ok((default.sample_format(), default.channels()));
    }
    let ranges = output
        .supported_output_configs()
        .map_err(|e| LooperError::AudioDevice(e.to_string()))?;
    ranges
        .filter(|r| r.min_sample_rate().0 <= sample_rate && sample_rate <= r.max_sample_rate().0)
        .max_by_key(|r| (r.sample_format() == SampleFormat::F32, r.channels() >= 2))
        .map(|r| (r.sample_format(), r.channels()))
        .ok_or(LooperError::SampleRateMismatch {
            input: sample_rate,
            output: default.sample_rate().0,
        })
}

#[cfg(not(feature = "audio-cpal"))]
impl StreamPlan {
    pub fn negotiate(_options: &HostOptions) -> Result<Self> {
        Err(LooperError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Handle to the running duplex stream.
///
/// **Not `Send`**: keep it on the thread that started it.
pub struct AudioHost {
    #[cfg(feature = "audio-cpal")]
    _input: Stream,
    #[cfg(feature = "audio-cpal")]
    _output: Stream,
    /// Shared flag: set to `false` to make both callbacks output silence.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<HostStatus>>,
}

#[cfg(feature = "audio-cpal")]
impl AudioHost {
    /// Build and start both streams; the engine moves into the output
    /// callback.
    pub fn start(plan: StreamPlan, engine: LooperEngine) -> Result<Self> {
        let shared = Arc::clone(engine.shared());
        let running = Arc::new(AtomicBool::new(true));
        let status = Arc::new(Mutex::new(HostStatus {
            state: HostState::Running,
            input_device: plan.input_name.clone(),
            output_device: plan.output_name.clone(),
            sample_rate: plan.sample_rate,
            frames_per_period: plan.frames_per_period,
            last_error: None,
        }));

        let (producer, consumer) = create_input_ring(INPUT_RING_CAPACITY);
        let input_errors = error_callback(Arc::clone(&status), Arc::clone(&shared));
        let output_errors = error_callback(Arc::clone(&status), shared);

        let input = match plan.input_format {
            SampleFormat::F32 => build_input::<f32>(&plan, producer, &running, input_errors),
            SampleFormat::F64 => build_input::<f64>(&plan, producer, &running, input_errors),
            SampleFormat::I16 => build_input::<i16>(&plan, producer, &running, input_errors),
            SampleFormat::I32 => build_input::<i32>(&plan, producer, &running, input_errors),
            SampleFormat::U8 => build_input::<u8>(&plan, producer, &running, input_errors),
            SampleFormat::U16 => build_input::<u16>(&plan, producer, &running, input_errors),
            fmt => Err(LooperError::AudioStream(format!(
                "unsupported input sample format: {fmt:?}"
            ))),
        }?;

        let feed = OutputFeed::new(engine, consumer, plan.sample_rate, !plan.fixed_period);
        let output = match plan.output_format {
            SampleFormat::F32 => build_output::<f32>(&plan, feed, &running, output_errors),
            SampleFormat::F64 => build_output::<f64>(&plan, feed, &running, output_errors),
            SampleFormat::I16 => build_output::<i16>(&plan, feed, &running, output_errors),
            SampleFormat::I32 => build_output::<i32>(&plan, feed, &running, output_errors),
            SampleFormat::U8 => build_output::<u8>(&plan, feed, &running, output_errors),
            SampleFormat::U16 => build_output::<u16>(&plan, feed, &running, output_errors),
            fmt => Err(LooperError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            ))),
        }?;

        input
            .play()
            .map_err(|e| LooperError::AudioStream(e.to_string()))?;
        output
            .play()
            .map_err(|e| LooperError::AudioStream(e.to_string()))?;
        info!("audio streams started");

        Ok(Self {
            _input: input,
            _output: output,
            running,
            status,
        })
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioHost {
    pub fn start(_plan: StreamPlan, _engine: LooperEngine) -> Result<Self> {
        Err(LooperError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl AudioHost {
    pub fn status(&self) -> HostStatus {
        self.status.lock().clone()
    }

    /// True once either device has gone away.
    pub fn is_disconnected(&self) -> bool {
        self.status.lock().state == HostState::Disconnected
    }

    /// Stop: signal both callbacks to output silence on their next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let mut status = self.status.lock();
        if status.state == HostState::Running {
            status.state = HostState::Stopped;
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn error_callback(
    status: Arc<Mutex<HostStatus>>,
    shared: Arc<SharedState>,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        error!("audio stream error: {err}");
        let mut status = status.lock();
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            status.state = HostState::Disconnected;
        } else {
            EngineDiagnostics::bump(&shared.diagnostics().stream_errors);
        }
        status.last_error = Some(err.to_string());
    }
}

#[cfg(feature = "audio-cpal")]
fn build_input<T>(
    plan: &StreamPlan,
    mut producer: InputProducer,
    running: &Arc<AtomicBool>,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = plan.input_config.channels.max(1) as usize;
    let running = Arc::clone(running);
    plan.input
        .build_input_stream(
            &plan.input_config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                for frame in data.chunks_exact(channels) {
                    // Whole frames only; the rest of this callback is dropped.
                    if producer.vacant_len() < 2 {
                        break;
                    }
                    let left = f32::from_sample(frame[0]);
                    let right = frame.get(1).map_or(left, |s| f32::from_sample(*s));
                    let _ = producer.try_push(left);
                    let _ = producer.try_push(right);
                }
            },
            on_error,
            None,
        )
        .map_err(|e| LooperError::AudioStream(e.to_string()))
}

/// Everything the output callback owns.
#[cfg(feature = "audio-cpal")]
struct OutputFeed {
    engine: LooperEngine,
    input: InputConsumer,
    sample_rate: u32,
    /// Adopt the first callback's frame count as the engine period.
    adapt_period: bool,
    in_left: Vec<f32>,
    in_right: Vec<f32>,
    out_left: Vec<f32>,
    out_right: Vec<f32>,
}

#[cfg(feature = "audio-cpal")]
impl OutputFeed {
    fn new(engine: LooperEngine, input: InputConsumer, sample_rate: u32, adapt_period: bool) -> Self {
        Self {
            engine,
            input,
            sample_rate,
            adapt_period,
            in_left: vec![0.0; SCRATCH_FRAMES],
            in_right: vec![0.0; SCRATCH_FRAMES],
            out_left: vec![0.0; SCRATCH_FRAMES],
            out_right: vec![0.0; SCRATCH_FRAMES],
        }
    }

    /// Run the engine over `frames` frames, leaving the mix in the output
    /// scratch buffers.
    fn render(&mut self, frames: usize) {
        let mut short = false;
        for i in 0..frames {
            match (self.input.try_pop(), self.input.try_pop()) {
                (Some(left), Some(right)) => {
                    self.in_left[i] = left;
                    self.in_right[i] = right;
                }
                _ => {
                    self.in_left[i] = 0.0;
                    self.in_right[i] = 0.0;
                    short = true;
                }
            }
        }
        if short {
            EngineDiagnostics::bump(&self.engine.shared().diagnostics().input_underruns);
        }
        self.engine.process(
            [&self.in_left[..frames], &self.in_right[..frames]],
            [&mut self.out_left[..frames], &mut self.out_right[..frames]],
        );
    }
}

#[cfg(feature = "audio-cpal")]
fn build_output<T>(
    plan: &StreamPlan,
    mut feed: OutputFeed,
    running: &Arc<AtomicBool>,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = plan.output_config.channels.max(1) as usize;
    let running = Arc::clone(running);
    plan.output
        .build_output_stream(
            &plan.output_config,
            move |data: &mut [T], _info| {
                if !running.load(Ordering::Relaxed) {
                    data.fill(T::EQUILIBRIUM);
                    return;
                }
                let frames = data.len() / channels;
                if feed.adapt_period {
                    feed.adapt_period = false;
                    let period = feed.engine.metadata().frames_per_period;
                    if frames != period && frames > 0 && frames <= SCRATCH_FRAMES {
                        // One-shot on the first callback; the old geometry stays on failure.
                        if let Err(e) = feed.engine.set_metadata(feed.sample_rate, frames) {
                            warn!(frames, period, "could not adopt callback period: {e}");
                        }
                    }
                }

                for block in data.chunks_mut(SCRATCH_FRAMES * channels) {
                    let n = block.len() / channels;
                    feed.render(n);
                    for (i, frame) in block.chunks_exact_mut(channels).enumerate() {
                        let (left, right) = (feed.out_left[i], feed.out_right[i]);
                        if channels == 1 {
                            frame[0] = T::from_sample((left + right) * 0.5);
                            continue;
                        }
                        frame[0] = T::from_sample(left);
                        frame[1] = T::from_sample(right);
                        for extra in &mut frame[2..] {
                            *extra = T::EQUILIBRIUM;
                        }
                    }
                }
            },
            on_error,
            None,
        )
        .map_err(|e| LooperError::AudioStream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_leave_everything_to_the_devices() {
        let options = HostOptions::default();
        assert!(options.input_device.is_none());
        assert!(options.output_device.is_none());
        assert!(options.buffer_size.is_none());
    }

    #[cfg(feature = "audio-cpal")]
    #[test]
    fn output_feed_runs_engine_and_counts_underruns() {
        use crate::engine::{new_looper, EngineConfig};

        let config = EngineConfig {
            record_buffer_frames: 1 << 14,
            buffer_margin_frames: 64,
            min_loop_duration_ms: 10,
            ..EngineConfig::default()
        };
        let (engine, _controller) = new_looper(config, 8_000, 32).unwrap();
        let shared = Arc::clone(engine.shared());
        let (mut producer, consumer) = create_input_ring(256);
        for _ in 0..16 {
            producer.try_push(0.25).unwrap();
            producer.try_push(-0.5).unwrap();
        }

        let mut feed = OutputFeed::new(engine, consumer, 8_000, false);
        feed.render(16);
        assert_eq!(feed.out_left[..16], [0.25; 16]);
        assert_eq!(feed.out_right[..16], [-0.5; 16]);
        assert_eq!(shared.diagnostics().snapshot().input_underruns, 0);

        feed.render(16);
        assert_eq!(feed.out_left[..16], [0.0; 16]);
        assert_eq!(shared.diagnostics().snapshot().input_underruns, 1);
    }
}
