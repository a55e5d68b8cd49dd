//! Real-time audio output pipeline for emulator frontends
//!
//! Bridges an emulation thread that produces samples at a variable rate to an
//! audio device that consumes them at a fixed rate. Samples pass through a
//! resampler whose ratio is continuously nudged by a rate controller so the
//! device buffer hovers around half full, keeping audio and video in sync
//! without audible glitches.
//!
//! # Features
//! - Lock-protected byte ring buffer with condvar backpressure
//! - Phase-continuous resamplers (linear, cubic, windowed sinc)
//! - Dynamic rate control bounded by a configurable delta
//! - Driver registry with null, simulated, threaded ALSA and rodio backends
//! - Dedicated writer/worker threads with underrun silence fill
//! - Rewind playback, sound-effect mixer and microphone capture
//!
//! # Crate feature flags
//! - `alsa` (opt-in, Linux): threaded ALSA playback/capture backend (`alsathread`)
//! - `streaming` (opt-in): pull-model playback through rodio (`rodio`)
//!
//! # Quick start
//! ```no_run
//! use emu_audio::{AudioConfig, AudioPipeline, DriverRegistry, InputTiming};
//!
//! let registry = DriverRegistry::with_defaults();
//! let config = AudioConfig::low_latency(48_000);
//! let timing = InputTiming::new(32_040.5, 60.0988, 60.0, 1);
//! let mut pipeline = AudioPipeline::init(&registry, config, timing).unwrap();
//!
//! // Called from the core's audio callback once per emulated frame
//! let frame = vec![0i16; 534 * 2];
//! let consumed = pipeline.push_samples_batch(&frame);
//! assert!(consumed <= 534);
//! ```

#![warn(missing_docs)]

pub mod config; // Settings consumed by the pipeline
pub mod convert; // Sample format conversion
pub mod driver; // Device contract, registry and backends
pub mod fifo; // Mutex + condvar guarded ring buffer
pub mod mixer; // Sound effect overlay
pub mod pipeline; // Orchestrator
pub mod rate_control; // Dynamic rate control
pub mod resampler; // Phase-continuous resamplers
pub mod rewind; // Reverse playback buffer
pub mod ring_buffer; // Byte FIFO
pub mod worker; // Device worker threads

/// Error types for audio pipeline operations
#[derive(thiserror::Error, Debug)]
pub enum AudioError {
    /// Buffer or thread resources could not be allocated
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The driver failed to open the device
    #[error("Driver initialization failed: {0}")]
    DriverInit(String),

    /// The driver's worker has died; no more audio can be written
    #[error("Audio driver is dead")]
    DriverDead,

    /// Hard device error reported by a backend
    #[error("Audio device error: {0}")]
    Device(String),

    /// No driver registered under the given name
    #[error("Unknown audio driver: {0}")]
    UnknownDriver(String),

    /// The driver does not implement an optional capability
    #[error("Unsupported capability: {0}")]
    Unsupported(&'static str),

    /// Worker thread could not be spawned or joined
    #[error("Thread error: {0}")]
    Thread(String),

    /// IO error from filesystem or device
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WAV decoding error
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Configuration parse error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for audio pipeline operations
pub type Result<T> = std::result::Result<T, AudioError>;

// Public API exports
pub use config::{AudioConfig, MicrophoneConfig};
pub use driver::{
    AudioDriver, DriverParams, DriverRegistry, Microphone, OpenedDriver, OpenedMicrophone,
};
pub use fifo::SharedFifo;
pub use mixer::{Mixer, MixerState};
pub use pipeline::{ActiveCallback, AudioFlags, AudioPipeline, BufferStatistics, PipelineStats};
pub use rate_control::{compute_ratio, InputTiming, RateControl};
pub use resampler::{AudioResampler, ResamplerQuality};
pub use rewind::RewindBuffer;
pub use ring_buffer::RingBuffer;
pub use worker::{DeviceError, WorkerState};
