//! ALSA host for the threaded backend
//!
//! Opens interleaved PCM streams in blocking mode; the worker thread owns the
//! handle and does every `writei`/`readi`. Underruns, interrupted calls and
//! suspends are reported as transient and recovered in place; anything else
//! kills the worker.

use super::threaded::{PcmHost, PcmStreamInfo};
use super::DriverParams;
use crate::worker::{CaptureSource, DeviceError, PeriodSink};
use crate::{AudioError, Result};
use alsa::device_name::HintIter;
use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{Direction, ValueOr};
use log::warn;

/// Registry name
pub const IDENT: &str = "alsathread";

/// Device opened when none is configured
const DEFAULT_DEVICE: &str = "default";

/// Periods per hardware buffer
const PERIODS: usize = 4;

/// Shortest period we ask for
const MIN_PERIOD_FRAMES: usize = 32;

// Linux errno values ALSA reports for recoverable conditions
const EINTR: i32 = 4;
const EPIPE: i32 = 32;
const ESTRPIPE: i32 = 86;

/// System ALSA devices
#[derive(Debug, Clone, Copy, Default)]
pub struct AlsaHost;

fn classify(err: alsa::Error) -> DeviceError {
    match err.errno().abs() {
        EINTR | EPIPE | ESTRPIPE => DeviceError::Transient(err.to_string()),
        _ => DeviceError::Fatal(err.to_string()),
    }
}

fn init_err(device: &str, what: &str, err: alsa::Error) -> AudioError {
    AudioError::DriverInit(format!("[ALSA] {what} on '{device}': {err}"))
}

/// Configure `pcm` and return what the device accepted
fn configure(
    pcm: &PCM,
    device: &str,
    params: &DriverParams,
    channels: u32,
) -> Result<PcmStreamInfo> {
    let rate = if params.rate == 0 { 48_000 } else { params.rate };
    let buffer_frames = params.latency_frames(rate).max(MIN_PERIOD_FRAMES * PERIODS);
    let period_frames = (buffer_frames / PERIODS).max(MIN_PERIOD_FRAMES);

    let hwp = HwParams::any(pcm).map_err(|e| init_err(device, "Failed to query hw params", e))?;
    hwp.set_access(Access::RWInterleaved)
        .map_err(|e| init_err(device, "Interleaved access unsupported", e))?;

    let use_float = match hwp.set_format(Format::float()) {
        Ok(()) => true,
        Err(_) => {
            hwp.set_format(Format::s16())
                .map_err(|e| init_err(device, "Neither float nor s16 supported", e))?;
            false
        }
    };

    hwp.set_channels(channels)
        .map_err(|e| init_err(device, "Failed to set channels", e))?;
    hwp.set_rate(rate, ValueOr::Nearest)
        .map_err(|e| init_err(device, "Failed to set rate", e))?;
    hwp.set_period_size_near(period_frames as i64, ValueOr::Nearest)
        .map_err(|e| init_err(device, "Failed to set period size", e))?;
    hwp.set_buffer_size_near(buffer_frames as i64)
        .map_err(|e| init_err(device, "Failed to set buffer size", e))?;
    pcm.hw_params(&hwp)
        .map_err(|e| init_err(device, "Failed to apply hw params", e))?;

    let current = pcm
        .hw_params_current()
        .map_err(|e| init_err(device, "Failed to read back hw params", e))?;
    let actual_rate = current
        .get_rate()
        .map_err(|e| init_err(device, "Failed to read rate", e))?;
    let actual_period = current
        .get_period_size()
        .map_err(|e| init_err(device, "Failed to read period size", e))?;
    let actual_buffer = current
        .get_buffer_size()
        .map_err(|e| init_err(device, "Failed to read buffer size", e))?;

    let swp = pcm
        .sw_params_current()
        .map_err(|e| init_err(device, "Failed to query sw params", e))?;
    swp.set_start_threshold(actual_buffer / 2)
        .map_err(|e| init_err(device, "Failed to set start threshold", e))?;
    swp.set_avail_min(actual_period)
        .map_err(|e| init_err(device, "Failed to set avail min", e))?;
    pcm.sw_params(&swp)
        .map_err(|e| init_err(device, "Failed to apply sw params", e))?;
    pcm.prepare()
        .map_err(|e| init_err(device, "Failed to prepare", e))?;

    if actual_rate != rate {
        warn!("[ALSA] Requested {rate} Hz on '{device}', got {actual_rate} Hz");
    }

    Ok(PcmStreamInfo {
        rate: actual_rate,
        period_frames: actual_period.max(1) as usize,
        buffer_frames: actual_buffer.max(1) as usize,
        channels: channels as usize,
        use_float,
    })
}

fn recover_pcm(pcm: &PCM) -> std::result::Result<(), DeviceError> {
    if pcm.state() == State::Suspended {
        // Resume is optional for drivers; prepare works either way
        let _ = pcm.resume();
    }
    pcm.prepare()
        .map_err(|e| DeviceError::Fatal(format!("recover failed: {e}")))
}

impl PcmHost for AlsaHost {
    fn ident(&self) -> &'static str {
        IDENT
    }

    fn open_playback(&self, params: &DriverParams) -> Result<(Box<dyn PeriodSink>, PcmStreamInfo)> {
        let device = params.device.as_deref().unwrap_or(DEFAULT_DEVICE);
        let pcm = PCM::new(device, Direction::Playback, false)
            .map_err(|e| init_err(device, "Failed to open playback", e))?;
        let info = configure(&pcm, device, params, 2)?;

        let sink = AlsaSink {
            pcm,
            info,
            samples_f32: Vec::new(),
            samples_s16: Vec::new(),
        };
        Ok((Box::new(sink), info))
    }

    fn open_capture(&self, params: &DriverParams) -> Result<(Box<dyn CaptureSource>, PcmStreamInfo)> {
        let device = params.device.as_deref().unwrap_or(DEFAULT_DEVICE);
        let pcm = PCM::new(device, Direction::Capture, false)
            .map_err(|e| init_err(device, "Failed to open capture", e))?;
        let info = configure(&pcm, device, params, 1)?;
        pcm.start()
            .map_err(|e| init_err(device, "Failed to start capture", e))?;

        let source = AlsaSource {
            pcm,
            info,
            samples_f32: Vec::new(),
            samples_s16: Vec::new(),
        };
        Ok((Box::new(source), info))
    }

    fn device_list(&self) -> Vec<String> {
        let hints = match HintIter::new_str(None, "pcm") {
            Ok(hints) => hints,
            Err(e) => {
                warn!("[ALSA] Failed to enumerate devices: {e}");
                return Vec::new();
            }
        };

        hints
            .filter(|hint| hint.direction != Some(Direction::Capture))
            .filter_map(|hint| hint.name)
            .collect()
    }
}

struct AlsaSink {
    pcm: PCM,
    info: PcmStreamInfo,
    samples_f32: Vec<f32>,
    samples_s16: Vec<i16>,
}

impl PeriodSink for AlsaSink {
    fn write_period(&mut self, period: &[u8]) -> std::result::Result<(), DeviceError> {
        let channels = self.info.channels;
        if self.info.use_float {
            self.samples_f32.clear();
            crate::convert::f32_bytes_to_f32(period, &mut self.samples_f32);
            let io = self.pcm.io_f32().map_err(classify)?;
            let mut offset = 0;
            while offset < self.samples_f32.len() {
                let frames = io.writei(&self.samples_f32[offset..]).map_err(classify)?;
                offset += frames * channels;
            }
        } else {
            self.samples_s16.clear();
            self.samples_s16.extend(
                period
                    .chunks_exact(2)
                    .map(|b| i16::from_ne_bytes([b[0], b[1]])),
            );
            let io = self.pcm.io_i16().map_err(classify)?;
            let mut offset = 0;
            while offset < self.samples_s16.len() {
                let frames = io.writei(&self.samples_s16[offset..]).map_err(classify)?;
                offset += frames * channels;
            }
        }
        Ok(())
    }

    fn recover(&mut self, _err: &DeviceError) -> std::result::Result<(), DeviceError> {
        recover_pcm(&self.pcm)
    }
}

struct AlsaSource {
    pcm: PCM,
    info: PcmStreamInfo,
    samples_f32: Vec<f32>,
    samples_s16: Vec<i16>,
}

impl CaptureSource for AlsaSource {
    fn read_period(&mut self, period: &mut [u8]) -> std::result::Result<usize, DeviceError> {
        let channels = self.info.channels;
        if self.info.use_float {
            self.samples_f32.resize(period.len() / 4, 0.0);
            let io = self.pcm.io_f32().map_err(classify)?;
            let frames = io.readi(&mut self.samples_f32).map_err(classify)?;
            let bytes: &[u8] = bytemuck::cast_slice(&self.samples_f32[..frames * channels]);
            period[..bytes.len()].copy_from_slice(bytes);
            Ok(bytes.len())
        } else {
            self.samples_s16.resize(period.len() / 2, 0);
            let io = self.pcm.io_i16().map_err(classify)?;
            let frames = io.readi(&mut self.samples_s16).map_err(classify)?;
            let bytes: &[u8] = bytemuck::cast_slice(&self.samples_s16[..frames * channels]);
            period[..bytes.len()].copy_from_slice(bytes);
            Ok(bytes.len())
        }
    }

    fn recover(&mut self, _err: &DeviceError) -> std::result::Result<(), DeviceError> {
        recover_pcm(&self.pcm)?;
        self.pcm
            .start()
            .map_err(|e| DeviceError::Fatal(format!("restart failed: {e}")))
    }
}
