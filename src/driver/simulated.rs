//! Simulated PCM host
//!
//! A loopback "device" for the threaded backend: it consumes periods at the
//! negotiated rate (optionally sped up), remembers the most recent ones, and
//! can be told to stall or fail. Headless runs and the test suite use it in
//! place of real hardware.
//!
//! ```
//! use emu_audio::driver::simulated::{SimulatedConfig, SimulatedHost};
//! use emu_audio::DriverRegistry;
//!
//! let host = SimulatedHost::new(SimulatedConfig::default());
//! let mut registry = DriverRegistry::new();
//! host.register(&mut registry);
//! assert_eq!(registry.names(), vec!["simulated"]);
//! ```

use super::threaded::{PcmHost, PcmStreamInfo, ThreadedDriver};
use super::{DriverParams, DriverRegistry};
use crate::worker::{CaptureSource, DeviceError, PeriodSink};
use crate::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Registry name
pub const IDENT: &str = "simulated";

/// Simulated device settings
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedConfig {
    /// Rate the device "negotiates"; `None` accepts whatever is requested
    pub rate: Option<u32>,
    /// Capture rate; `None` accepts whatever is requested
    pub capture_rate: Option<u32>,
    /// Frames per period
    pub period_frames: usize,
    /// Periods per hardware buffer
    pub periods: usize,
    /// Take `f32` samples instead of `i16`
    pub use_float: bool,
    /// Playback speed relative to real time
    pub speed: f64,
    /// Number of recent periods kept for inspection
    pub history: usize,
    /// Names reported by the device list
    pub devices: Vec<String>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        SimulatedConfig {
            rate: None,
            capture_rate: None,
            period_frames: 256,
            periods: 4,
            use_float: false,
            speed: 1.0,
            history: 64,
            devices: vec!["default".to_string(), "loopback".to_string()],
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    held: bool,
    blocked: bool,
    errors: VecDeque<DeviceError>,
    recent: VecDeque<Vec<u8>>,
    periods_written: u64,
    bytes_written: u64,
    recoveries: u64,
    capture_sample: i16,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SimState>,
    gate: Condvar,
}

/// Loopback PCM host; clones share the same device
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    config: Arc<SimulatedConfig>,
    shared: Arc<Shared>,
}

impl SimulatedHost {
    /// Create a host
    pub fn new(config: SimulatedConfig) -> Self {
        SimulatedHost {
            config: Arc::new(config),
            shared: Arc::default(),
        }
    }

    /// Register this host as the `simulated` threaded driver
    pub fn register(&self, registry: &mut DriverRegistry) {
        let host = self.clone();
        let lister = self.clone();
        registry.register_with_devices(
            IDENT,
            move |params| ThreadedDriver::open(host.clone(), params),
            move || lister.device_list(),
        );
    }

    /// Stall the device: the next period write blocks until [`release`](Self::release)
    pub fn hold(&self) {
        self.shared.state.lock().held = true;
    }

    /// Let a held device continue
    pub fn release(&self) {
        self.shared.state.lock().held = false;
        self.shared.gate.notify_all();
    }

    /// Whether a period write is currently stalled by [`hold`](Self::hold)
    pub fn is_blocked(&self) -> bool {
        self.shared.state.lock().blocked
    }

    /// Make a future period write fail with `err` (errors are queued in order)
    pub fn inject_error(&self, err: DeviceError) {
        self.shared.state.lock().errors.push_back(err);
    }

    /// Periods accepted so far
    pub fn periods_written(&self) -> u64 {
        self.shared.state.lock().periods_written
    }

    /// Bytes accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.shared.state.lock().bytes_written
    }

    /// Transient errors the worker recovered from
    pub fn recoveries(&self) -> u64 {
        self.shared.state.lock().recoveries
    }

    /// Most recent periods, oldest first
    pub fn recent_periods(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().recent.iter().cloned().collect()
    }

    /// Value every captured sample will have
    pub fn set_capture_sample(&self, sample: i16) {
        self.shared.state.lock().capture_sample = sample;
    }

    fn stream_info(&self, rate: u32, channels: usize) -> PcmStreamInfo {
        let period_frames = self.config.period_frames.max(1);
        PcmStreamInfo {
            rate: if rate == 0 { 48_000 } else { rate },
            period_frames,
            buffer_frames: period_frames * self.config.periods.max(2),
            channels,
            use_float: self.config.use_float,
        }
    }

    fn period_duration(&self, info: &PcmStreamInfo) -> Duration {
        let speed = if self.config.speed > 0.0 {
            self.config.speed
        } else {
            1.0
        };
        Duration::from_secs_f64(info.period_frames as f64 / f64::from(info.rate) / speed)
    }
}

impl PcmHost for SimulatedHost {
    fn ident(&self) -> &'static str {
        IDENT
    }

    fn open_playback(&self, params: &DriverParams) -> Result<(Box<dyn PeriodSink>, PcmStreamInfo)> {
        let info = self.stream_info(self.config.rate.unwrap_or(params.rate), 2);
        let sink = SimulatedSink {
            shared: Arc::clone(&self.shared),
            pace: self.period_duration(&info),
            history: self.config.history,
        };
        Ok((Box::new(sink), info))
    }

    fn open_capture(&self, params: &DriverParams) -> Result<(Box<dyn CaptureSource>, PcmStreamInfo)> {
        let info = self.stream_info(self.config.capture_rate.unwrap_or(params.rate), 1);
        let source = SimulatedSource {
            shared: Arc::clone(&self.shared),
            pace: self.period_duration(&info),
            use_float: info.use_float,
        };
        Ok((Box::new(source), info))
    }

    fn device_list(&self) -> Vec<String> {
        self.config.devices.clone()
    }
}

struct SimulatedSink {
    shared: Arc<Shared>,
    pace: Duration,
    history: usize,
}

impl PeriodSink for SimulatedSink {
    fn write_period(&mut self, period: &[u8]) -> std::result::Result<(), DeviceError> {
        {
            let mut state = self.shared.state.lock();
            while state.held {
                state.blocked = true;
                self.shared.gate.wait(&mut state);
            }
            state.blocked = false;
            if let Some(err) = state.errors.pop_front() {
                return Err(err);
            }
        }

        thread::sleep(self.pace);

        let mut state = self.shared.state.lock();
        state.periods_written += 1;
        state.bytes_written += period.len() as u64;
        if self.history > 0 {
            if state.recent.len() == self.history {
                state.recent.pop_front();
            }
            state.recent.push_back(period.to_vec());
        }
        Ok(())
    }

    fn recover(&mut self, _err: &DeviceError) -> std::result::Result<(), DeviceError> {
        self.shared.state.lock().recoveries += 1;
        Ok(())
    }
}

struct SimulatedSource {
    shared: Arc<Shared>,
    pace: Duration,
    use_float: bool,
}

impl CaptureSource for SimulatedSource {
    fn read_period(&mut self, period: &mut [u8]) -> std::result::Result<usize, DeviceError> {
        thread::sleep(self.pace);
        let sample = self.shared.state.lock().capture_sample;

        if self.use_float {
            let bytes = (f32::from(sample) / 32768.0).to_ne_bytes();
            for chunk in period.chunks_exact_mut(4) {
                chunk.copy_from_slice(&bytes);
            }
        } else {
            let bytes = sample.to_ne_bytes();
            for chunk in period.chunks_exact_mut(2) {
                chunk.copy_from_slice(&bytes);
            }
        }
        Ok(period.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::AudioDriver;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_negotiated_rate_override() {
        let host = SimulatedHost::new(SimulatedConfig {
            rate: Some(44_100),
            ..SimulatedConfig::default()
        });
        let mut registry = DriverRegistry::new();
        host.register(&mut registry);

        let opened = registry
            .open(IDENT, &DriverParams::new(48_000, 64))
            .unwrap();
        assert_eq!(opened.rate, 44_100);
        assert_eq!(registry.device_list(IDENT).unwrap(), vec!["default", "loopback"]);
    }

    #[test]
    fn test_device_plays_silence_when_starved() {
        let host = SimulatedHost::new(SimulatedConfig {
            speed: 8.0,
            ..SimulatedConfig::default()
        });
        let _driver = ThreadedDriver::new(host.clone(), &DriverParams::new(48_000, 64)).unwrap();

        assert!(wait_until(|| host.periods_written() >= 3));
        let recent = host.recent_periods();
        assert!(recent.iter().all(|p| p.len() == 256 * 4));
        assert!(recent.iter().all(|p| p.iter().all(|&b| b == 0)));
    }

    #[test]
    fn test_written_audio_reaches_device() {
        let host = SimulatedHost::new(SimulatedConfig::default());
        let mut driver = ThreadedDriver::new(host.clone(), &DriverParams::new(48_000, 64)).unwrap();

        driver.write(&[0x5Au8; 256 * 4]).unwrap();
        assert!(wait_until(|| host
            .recent_periods()
            .iter()
            .any(|p| p.iter().all(|&b| b == 0x5A))));
    }

    #[test]
    fn test_transient_errors_are_recovered() {
        let host = SimulatedHost::new(SimulatedConfig {
            speed: 8.0,
            ..SimulatedConfig::default()
        });
        host.inject_error(DeviceError::Transient("xrun".into()));
        host.inject_error(DeviceError::Transient("xrun".into()));
        let driver = ThreadedDriver::new(host.clone(), &DriverParams::new(48_000, 64)).unwrap();

        assert!(wait_until(|| host.recoveries() == 2 && host.periods_written() > 0));
        assert!(driver.alive());
    }

    #[test]
    fn test_hold_blocks_worker() {
        let host = SimulatedHost::new(SimulatedConfig::default());
        let _driver = ThreadedDriver::new(host.clone(), &DriverParams::new(48_000, 64)).unwrap();

        host.hold();
        assert!(wait_until(|| host.is_blocked()));
        let written = host.periods_written();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(host.periods_written(), written);

        host.release();
        assert!(wait_until(|| host.periods_written() > written));
    }
}
