//! Dynamic rate control
//!
//! The core produces samples at its own rate, paced by the video refresh; the
//! device consumes them at a fixed rate. Small clock differences between the
//! two would slowly drain or flood the device buffer. The controller nudges the
//! resampling ratio around its nominal value based on how full the buffer is:
//! a starving buffer gets slightly more output per input frame, an overfull one
//! slightly less. The deviation is bounded by `max_delta` so the pitch shift
//! stays inaudible.

use crate::{AudioError, Result};
use serde::{Deserialize, Serialize};

/// Upper limit accepted for the rate control delta
pub const MAX_RATE_DELTA: f64 = 0.5;

/// Timing reported by the core and the display
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputTiming {
    /// Core sample rate in Hz (may be fractional, e.g. 32040.5)
    pub sample_rate: f64,
    /// Core frames per second
    pub fps: f64,
    /// Display refresh rate in Hz
    pub refresh_rate: f64,
    /// Vsync swap interval (frames shown per refresh)
    pub swap_interval: u32,
}

impl InputTiming {
    /// Create timing information
    pub fn new(sample_rate: f64, fps: f64, refresh_rate: f64, swap_interval: u32) -> Self {
        InputTiming {
            sample_rate,
            fps,
            refresh_rate,
            swap_interval,
        }
    }

    /// Timing for a core that runs exactly at the display rate
    pub fn matched(sample_rate: f64, fps: f64) -> Self {
        Self::new(sample_rate, fps, fps, 1)
    }

    /// Effective refresh rate after the swap interval
    pub fn effective_refresh(&self) -> f64 {
        self.refresh_rate / f64::from(self.swap_interval.max(1))
    }

    /// Relative difference between core fps and effective refresh
    pub fn timing_skew(&self) -> f64 {
        let refresh = self.effective_refresh();
        if refresh <= 0.0 {
            return f64::INFINITY;
        }
        (1.0 - self.fps / refresh).abs()
    }

    /// Input rate after syncing the core to the display, see [`adjusted_input_rate`]
    pub fn adjusted_rate(&self, max_skew: f64) -> f64 {
        adjusted_input_rate(
            self.sample_rate,
            self.fps,
            self.refresh_rate,
            self.swap_interval,
            max_skew,
        )
    }
}

/// Input rate once the core is slaved to the display refresh
///
/// When the core's fps is within `max_skew` of `refresh / swap_interval`, the
/// core ends up running at the display rate, so its audio arrives
/// proportionally faster or slower: `input_rate * (refresh / swap) / fps`.
/// Beyond the skew limit the core keeps its own pace and the raw rate is used.
pub fn adjusted_input_rate(
    input_rate: f64,
    fps: f64,
    refresh: f64,
    swap_interval: u32,
    max_skew: f64,
) -> f64 {
    let target = refresh / f64::from(swap_interval.max(1));
    if fps <= 0.0 || target <= 0.0 || !fps.is_finite() || !target.is_finite() {
        return input_rate;
    }

    let skew = (1.0 - fps / target).abs();
    if skew <= max_skew {
        input_rate * target / fps
    } else {
        input_rate
    }
}

/// Resampling ratio for the current buffer fill
///
/// `ratio = nominal * (1 + k * (fill - 0.5))` with `k = -2 * max_delta`, clamped
/// to `[nominal * (1 - max_delta), nominal * (1 + max_delta)]`. A half-full
/// buffer returns `nominal` exactly. `fill` is clamped to `[0, 1]` and NaN is
/// read as half full; `max_delta` is clamped to `[0, MAX_RATE_DELTA]`.
pub fn compute_ratio(nominal: f64, fill: f64, max_delta: f64) -> f64 {
    let delta = if max_delta.is_nan() {
        0.0
    } else {
        max_delta.clamp(0.0, MAX_RATE_DELTA)
    };
    let fill = if fill.is_nan() {
        0.5
    } else {
        fill.clamp(0.0, 1.0)
    };

    let k = -2.0 * delta;
    let ratio = nominal * (1.0 + k * (fill - 0.5));
    ratio
        .max(nominal * (1.0 - delta))
        .min(nominal * (1.0 + delta))
}

/// Rate controller bound to one output rate and one input timing
#[derive(Debug, Clone)]
pub struct RateControl {
    /// Input rate after display sync
    input_rate: f64,
    /// Output rate / input rate
    nominal: f64,
    max_delta: f64,
    enabled: bool,
}

impl RateControl {
    /// Create a controller
    ///
    /// # Errors
    ///
    /// [`AudioError::Config`] if the output rate or the adjusted input rate is
    /// not positive, or `max_delta` is outside `[0, MAX_RATE_DELTA]`.
    pub fn new(output_rate: u32, timing: &InputTiming, max_skew: f64, max_delta: f64) -> Result<Self> {
        if !(0.0..=MAX_RATE_DELTA).contains(&max_delta) {
            return Err(AudioError::Config(format!(
                "Rate control delta {max_delta} outside 0..={MAX_RATE_DELTA}"
            )));
        }

        let mut control = RateControl {
            input_rate: 0.0,
            nominal: 1.0,
            max_delta,
            enabled: true,
        };
        control.set_input_timing(timing, max_skew)?;
        control.set_output_rate(output_rate)?;
        Ok(control)
    }

    /// Re-derive the nominal ratio for a new input timing
    pub fn set_input_timing(&mut self, timing: &InputTiming, max_skew: f64) -> Result<()> {
        let input_rate = timing.adjusted_rate(max_skew);
        if !(input_rate.is_finite() && input_rate > 0.0) {
            return Err(AudioError::Config(format!(
                "Input sample rate must be positive, got {}",
                timing.sample_rate
            )));
        }

        let output_rate = self.nominal * self.input_rate;
        self.input_rate = input_rate;
        if output_rate > 0.0 {
            self.nominal = output_rate / input_rate;
        }
        Ok(())
    }

    /// Re-derive the nominal ratio for the rate the device actually accepted
    pub fn set_output_rate(&mut self, output_rate: u32) -> Result<()> {
        if output_rate == 0 {
            return Err(AudioError::Config("Output rate must be positive".into()));
        }
        self.nominal = f64::from(output_rate) / self.input_rate;
        Ok(())
    }

    /// Ratio to use for a buffer `fill` fraction (nominal when disabled)
    pub fn ratio(&self, fill: f64) -> f64 {
        if self.enabled {
            compute_ratio(self.nominal, fill, self.max_delta)
        } else {
            self.nominal
        }
    }

    /// Output rate / adjusted input rate
    pub fn nominal(&self) -> f64 {
        self.nominal
    }

    /// Adjusted input rate in Hz
    pub fn input_rate(&self) -> f64 {
        self.input_rate
    }

    /// Maximum relative deviation from nominal
    pub fn max_delta(&self) -> f64 {
        self.max_delta
    }

    /// Inclusive ratio bounds
    pub fn bounds(&self) -> (f64, f64) {
        (
            self.nominal * (1.0 - self.max_delta),
            self.nominal * (1.0 + self.max_delta),
        )
    }

    /// Enable or disable fill-based adjustment
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether fill-based adjustment is on
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
