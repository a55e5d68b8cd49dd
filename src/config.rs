//! Audio settings
//!
//! Everything the pipeline reads from the frontend's configuration, as one
//! serde-friendly struct. Missing fields in a JSON file fall back to
//! [`AudioConfig::default`].

use crate::rate_control::MAX_RATE_DELTA;
use crate::resampler::ResamplerQuality;
use crate::{AudioError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Microphone settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrophoneConfig {
    /// Open a microphone at init
    pub enable: bool,
    /// Capture device; `None` selects the backend default
    pub device: Option<String>,
    /// Rate the core wants captured audio at
    pub rate: u32,
    /// Capture latency in milliseconds
    pub latency_ms: u32,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        MicrophoneConfig {
            enable: false,
            device: None,
            rate: 48_000,
            latency_ms: 64,
        }
    }
}

/// Audio pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Registry name of the output driver
    pub driver: String,
    /// Output device; `None` selects the backend default
    pub device: Option<String>,
    /// Requested output rate in Hz
    pub output_rate: u32,
    /// Requested latency in milliseconds
    pub latency_ms: u32,
    /// Frames per device write; 0 lets the pipeline pick
    pub block_frames: usize,
    /// Adjust the resampling ratio to the buffer fill
    pub rate_control: bool,
    /// Maximum relative deviation from the nominal ratio
    pub rate_control_delta: f64,
    /// Largest core/display timing difference still synced to the display
    pub max_timing_skew: f64,
    /// Resampling kernel
    pub resampler_quality: ResamplerQuality,
    /// Output silence instead of the core's audio
    pub mute: bool,
    /// Core volume in dB
    pub volume_db: f32,
    /// Mixer volume in dB
    pub mixer_volume_db: f32,
    /// Silence the mixer
    pub mixer_mute: bool,
    /// Write to the device from a dedicated thread
    pub threaded: bool,
    /// Drop audio instead of blocking when the buffer is full
    pub nonblock: bool,
    /// Microphone settings
    pub microphone: MicrophoneConfig,
}

impl AudioConfig {
    /// Configuration optimized for low latency (64 ms)
    pub fn low_latency(output_rate: u32) -> Self {
        AudioConfig {
            output_rate,
            latency_ms: 64,
            ..Self::default()
        }
    }

    /// Configuration optimized for stability (128 ms, dedicated writer thread)
    pub fn stable(output_rate: u32) -> Self {
        AudioConfig {
            output_rate,
            latency_ms: 128,
            threaded: true,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AudioConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check ranges
    ///
    /// # Errors
    ///
    /// [`AudioError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.output_rate == 0 {
            return Err(AudioError::Config("output_rate must be positive".into()));
        }
        if self.latency_ms == 0 {
            return Err(AudioError::Config("latency_ms must be positive".into()));
        }
        if !(0.0..=MAX_RATE_DELTA).contains(&self.rate_control_delta) {
            return Err(AudioError::Config(format!(
                "rate_control_delta must be within 0..={MAX_RATE_DELTA}, got {}",
                self.rate_control_delta
            )));
        }
        if !(self.max_timing_skew >= 0.0 && self.max_timing_skew.is_finite()) {
            return Err(AudioError::Config(format!(
                "max_timing_skew must be a non-negative number, got {}",
                self.max_timing_skew
            )));
        }
        if !self.volume_db.is_finite() || !self.mixer_volume_db.is_finite() {
            return Err(AudioError::Config("volume must be a finite dB value".into()));
        }
        if self.microphone.enable && self.microphone.rate == 0 {
            return Err(AudioError::Config("microphone.rate must be positive".into()));
        }
        Ok(())
    }

    /// Frames covering the configured latency at `rate`
    pub fn latency_frames(&self, rate: u32) -> usize {
        (u64::from(rate) * u64::from(self.latency_ms) / 1000) as usize
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            driver: "null".to_string(),
            device: None,
            output_rate: 48_000,
            latency_ms: 64,
            block_frames: 0,
            rate_control: true,
            rate_control_delta: 0.005,
            max_timing_skew: 0.05,
            resampler_quality: ResamplerQuality::default(),
            mute: false,
            volume_db: 0.0,
            mixer_volume_db: 0.0,
            mixer_mute: false,
            threaded: false,
            nonblock: false,
            microphone: MicrophoneConfig::default(),
        }
    }
}
