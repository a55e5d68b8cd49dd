//! Audio pipeline
//!
//! Owns everything between the core's sample callback and the device:
//!
//! ```text
//! core i16 ──► gain/mute ──► resampler(ratio) ──► mixer ──► f32 | i16 ──► ring ──► driver
//!                                 ▲                                        │
//!                                 └──────────── rate control ◄── fill ─────┘
//! ```
//!
//! In synchronous mode the producer drains the ring into the driver on every
//! push. In threaded mode a dedicated writer thread does that, and the
//! producer only blocks on the ring's condvar.

use crate::config::AudioConfig;
use crate::convert;
use crate::driver::{self, AudioDriver, DriverFactory, DriverParams, DriverRegistry, Microphone};
use crate::fifo::{FifoState, SharedFifo};
use crate::mixer::Mixer;
use crate::rate_control::{InputTiming, RateControl};
use crate::resampler::{self, AudioResampler};
use crate::rewind::RewindBuffer;
use crate::ring_buffer::RingBuffer;
use crate::worker::{DeviceError, PeriodSink, PlaybackWorker, WorkerState};
use crate::{AudioError, Result};
use bitflags::bitflags;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Largest slice of a batch converted in one pass
const MAX_CHUNK_FRAMES: usize = 2048;

/// Default flush granularity for single-sample pushes
const DEFAULT_BLOCK_FRAMES: usize = 512;

/// Fill snapshots kept for [`BufferStatistics`]
const FILL_HISTORY: usize = 8 * 1024;

/// Smallest rewind buffer, in frames
const MIN_REWIND_FRAMES: usize = 4096;

bitflags! {
    /// Pipeline status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AudioFlags: u8 {
        /// A driver is open and accepting samples
        const ACTIVE = 0x01;
        /// The device takes `f32` samples
        const USE_FLOAT = 0x02;
        /// Stopped by the frontend (pause, menu)
        const SUSPENDED = 0x04;
        /// A mixer stream is playing
        const MIXER_ACTIVE = 0x08;
        /// Audio is off until the next successful restart
        const HARD_DISABLE = 0x10;
        /// Dynamic rate control is enabled
        const CONTROL = 0x20;
        /// The microphone is recording
        const MIC_ACTIVE = 0x40;
    }
}

/// Where pushed samples go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveCallback {
    /// Straight to the output path
    #[default]
    Normal,
    /// Into the rewind buffer, played reversed at the frame boundary
    Rewind,
}

/// Counters since init
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    /// Frames that reached the output path
    pub frames_pushed: u64,
    /// Frames dropped because the buffer was full (nonblocking mode)
    pub frames_dropped: u64,
    /// Pushes that could not write everything
    pub overrun_count: u64,
    /// Ratio used by the most recent push
    pub ratio: f64,
    /// Fill fraction seen by the most recent push
    pub fill: f64,
}

/// Summary of recent buffer fill snapshots, all in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStatistics {
    /// Number of snapshots summarized
    pub samples: usize,
    /// Mean fill
    pub average_fill: f64,
    /// Standard deviation of the fill
    pub std_deviation: f64,
    /// Share of snapshots at or below a quarter full
    pub close_to_underrun: f64,
    /// Share of snapshots at or above three quarters full
    pub close_to_blocking: f64,
}

impl BufferStatistics {
    fn from_history(history: &VecDeque<f32>) -> Option<Self> {
        if history.is_empty() {
            return None;
        }

        let n = history.len() as f64;
        let mean = history.iter().map(|&f| f64::from(f)).sum::<f64>() / n;
        let variance = history
            .iter()
            .map(|&f| (f64::from(f) - mean).powi(2))
            .sum::<f64>()
            / n;
        let underrun = history.iter().filter(|&&f| f <= 0.25).count() as f64;
        let blocking = history.iter().filter(|&&f| f >= 0.75).count() as f64;

        Some(BufferStatistics {
            samples: history.len(),
            average_fill: mean * 100.0,
            std_deviation: variance.sqrt() * 100.0,
            close_to_underrun: underrun / n * 100.0,
            close_to_blocking: blocking / n * 100.0,
        })
    }
}

type SharedDriver = Arc<Mutex<Box<dyn AudioDriver>>>;

/// Feeds the writer thread's periods into the driver with blocking writes
///
/// A stopped driver returns short counts instead of waiting, so the sink
/// retries with the driver lock released until it is started again or the
/// writer shuts down.
struct DriverSink {
    driver: SharedDriver,
    /// The writer's own FIFO, checked so shutdown is not stuck behind a
    /// stopped driver
    fifo: Arc<SharedFifo>,
}

impl PeriodSink for DriverSink {
    fn write_period(&mut self, period: &[u8]) -> std::result::Result<(), DeviceError> {
        let mut written = 0;
        while written < period.len() {
            if self.fifo.is_dead() {
                return Ok(());
            }
            let accepted = self
                .driver
                .lock()
                .write(&period[written..])
                .map_err(|e| DeviceError::Fatal(e.to_string()))?;
            if accepted == 0 {
                // Let the device make room without holding the driver lock
                thread::sleep(Duration::from_millis(1));
            }
            written += accepted;
        }
        Ok(())
    }
}

/// Everything that depends on the opened driver
struct Output {
    // Declared first so the writer is joined before the driver is dropped
    writer: Option<PlaybackWorker>,
    driver: SharedDriver,
    fifo: Arc<SharedFifo>,
    rate: u32,
    use_float: bool,
    frame_bytes: usize,
}

impl Output {
    fn open(name: &str, factory: &DriverFactory, config: &AudioConfig) -> Result<Self> {
        let params = DriverParams {
            device: config.device.clone(),
            rate: config.output_rate,
            latency_ms: config.latency_ms,
            block_frames: config.block_frames,
        };
        let opened = driver::open_with(name, factory, &params)?;
        if opened.rate == 0 {
            return Err(AudioError::DriverInit(format!(
                "\"{name}\" driver negotiated a rate of 0 Hz"
            )));
        }

        let mut drv = opened.driver;
        // The writer thread always waits on the device
        drv.set_nonblock_state(!config.threaded && config.nonblock);
        let use_float = drv.use_float();
        let frame_bytes = 2 * if use_float { 4 } else { 2 };

        let latency_frames = config.latency_frames(opened.rate).max(1);
        let fifo = Arc::new(SharedFifo::new(latency_frames * frame_bytes + 1)?);
        let driver: SharedDriver = Arc::new(Mutex::new(drv));

        let writer = if config.threaded {
            let period_bytes = block_frames(config, opened.rate) * frame_bytes;
            let sink = DriverSink {
                driver: Arc::clone(&driver),
                fifo: Arc::clone(&fifo),
            };
            Some(PlaybackWorker::spawn(
                "audio-writer",
                Arc::clone(&fifo),
                sink,
                period_bytes,
            )?)
        } else {
            None
        };

        Ok(Output {
            writer,
            driver,
            fifo,
            rate: opened.rate,
            use_float,
            frame_bytes,
        })
    }

    fn is_threaded(&self) -> bool {
        self.writer.is_some()
    }

    fn writer_dead(&self) -> bool {
        self.writer
            .as_ref()
            .is_some_and(|w| w.state() == WorkerState::Dead)
    }

    /// Fill the rate controller should see
    ///
    /// Threaded mode uses the ring the writer drains. Synchronous mode empties
    /// the ring on every push, so the device's own buffer is the better
    /// signal when the driver reports it.
    fn fill(&self, ring: &RingBuffer) -> f64 {
        if !self.is_threaded() {
            let driver = self.driver.lock();
            if let (Some(avail), Some(size)) = (driver.write_avail(), driver.buffer_size()) {
                if size > 0 {
                    return size.saturating_sub(avail) as f64 / size as f64;
                }
            }
        }
        ring.fill_fraction()
    }
}

/// Frames per flush of single-sample pushes and per writer period
fn block_frames(config: &AudioConfig, rate: u32) -> usize {
    let latency_frames = config.latency_frames(rate).max(1);
    if config.block_frames > 0 {
        config.block_frames.min(latency_frames)
    } else {
        DEFAULT_BLOCK_FRAMES.min(latency_frames)
    }
}

/// Two video frames of core audio, so a rewound frame always fits
fn rewind_frames(timing: &InputTiming) -> usize {
    if timing.fps > 0.0 && timing.sample_rate.is_finite() && timing.fps.is_finite() {
        let per_frame = (timing.sample_rate / timing.fps).ceil().max(0.0) as usize;
        (per_frame * 2).max(MIN_REWIND_FRAMES)
    } else {
        MIN_REWIND_FRAMES
    }
}

/// Push `ring` into the driver until it is empty or the driver stops accepting
/// Move queued bytes from the FIFO into the driver
///
/// The FIFO lock is taken only around the ring copies, never across a device
/// write.
fn drain(
    driver: &Mutex<Box<dyn AudioDriver>>,
    fifo: &SharedFifo,
    scratch: &mut [u8],
) -> Result<usize> {
    let mut driver = driver.lock();
    let mut total = 0;
    loop {
        let n = fifo.lock().ring().peek(scratch);
        if n == 0 {
            break;
        }
        let accepted = driver.write(&scratch[..n])?;
        fifo.lock().ring_mut().consume(accepted);
        total += accepted;
        if accepted < n {
            break;
        }
    }
    Ok(total)
}

/// Open microphone plus the conversion to the rate the core asked for
struct PipelineMic {
    mic: Box<dyn Microphone>,
    device_rate: u32,
    rate: u32,
    resampler: Box<dyn AudioResampler>,
    pending: VecDeque<i16>,
    raw: Vec<u8>,
    decoded: Vec<f32>,
    resampled: Vec<f32>,
}

impl PipelineMic {
    /// Read and convert until `want` samples are pending or the device runs dry
    fn fill(&mut self, want: usize) -> Result<()> {
        let sample_bytes = if self.mic.use_float() { 4 } else { 2 };
        let ratio = f64::from(self.rate) / f64::from(self.device_rate);

        while self.pending.len() < want {
            let missing = want - self.pending.len();
            let frames = ((missing as f64 / ratio).ceil() as usize).max(1);
            self.raw.resize(frames * sample_bytes, 0);

            let read = self.mic.read(&mut self.raw)? / sample_bytes * sample_bytes;
            if read == 0 {
                break;
            }

            self.decoded.clear();
            if sample_bytes == 4 {
                convert::f32_bytes_to_f32(&self.raw[..read], &mut self.decoded);
            } else {
                convert::s16_bytes_to_f32(&self.raw[..read], &mut self.decoded);
            }
            self.resampled.clear();
            self.resampler
                .process(&self.decoded, ratio, &mut self.resampled);
            self.pending.extend(
                self.resampled
                    .iter()
                    .map(|&s| convert::f32_to_s16_sample(s)),
            );
        }
        Ok(())
    }
}

/// The audio output pipeline
pub struct AudioPipeline {
    config: AudioConfig,
    timing: InputTiming,
    driver_name: String,
    factory: DriverFactory,
    output: Option<Output>,
    negotiated_rate: u32,
    rate_control: RateControl,
    resampler: Box<dyn AudioResampler>,
    mixer: Mixer,
    rewind: RewindBuffer,
    mic: Option<PipelineMic>,
    callback: ActiveCallback,
    flags: AudioFlags,
    nonblock: bool,
    mute: bool,
    volume_gain: f32,
    driver_dead: bool,
    ratio: f64,
    block_frames: usize,
    stats: PipelineStats,
    fill_history: VecDeque<f32>,
    /// Single samples waiting for a full block
    pending: Vec<i16>,
    input: Vec<f32>,
    resampled: Vec<f32>,
    out_s16: Vec<i16>,
    out_bytes: Vec<u8>,
    drain_scratch: Vec<u8>,
    reversed: Vec<i16>,
}

impl std::fmt::Debug for AudioPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPipeline")
            .field("driver", &self.driver_name)
            .field("negotiated_rate", &self.negotiated_rate)
            .field("flags", &self.flags)
            .field("callback", &self.callback)
            .field("ratio", &self.ratio)
            .finish()
    }
}

impl AudioPipeline {
    /// Open the configured driver and build the pipeline around it
    ///
    /// The nominal ratio is computed from the rate the device actually
    /// negotiated, not the requested one. A microphone requested in the
    /// configuration that fails to open is logged and skipped.
    ///
    /// # Errors
    ///
    /// Configuration errors, an empty registry, or whatever the driver
    /// returns while opening. Everything built so far is released.
    pub fn init(registry: &DriverRegistry, config: AudioConfig, timing: InputTiming) -> Result<Self> {
        config.validate()?;
        let (driver_name, factory) = registry.factory(&config.driver)?;
        let output = Output::open(&driver_name, &factory, &config)?;
        let rate = output.rate;

        let mut rate_control = RateControl::new(
            rate,
            &timing,
            config.max_timing_skew,
            config.rate_control_delta,
        )?;
        rate_control.set_enabled(config.rate_control);

        let mut mixer = Mixer::new(rate);
        mixer.set_gain(convert::db_to_gain(config.mixer_volume_db));
        mixer.set_mute(config.mixer_mute);

        let mut flags = AudioFlags::ACTIVE;
        flags.set(AudioFlags::USE_FLOAT, output.use_float);
        flags.set(AudioFlags::CONTROL, config.rate_control);

        let block_frames = block_frames(&config, rate);
        info!(
            "[Audio] Output rate {} Hz ({}), nominal ratio {:.6}, {} ms buffer{}",
            rate,
            if output.use_float { "f32" } else { "s16" },
            rate_control.nominal(),
            config.latency_ms,
            if output.is_threaded() { ", threaded" } else { "" }
        );

        let mut pipeline = AudioPipeline {
            resampler: resampler::create(config.resampler_quality, 2),
            rewind: RewindBuffer::new(rewind_frames(&timing)),
            drain_scratch: vec![0; block_frames * output.frame_bytes],
            driver_name,
            factory,
            output: Some(output),
            negotiated_rate: rate,
            ratio: rate_control.nominal(),
            rate_control,
            mixer,
            mic: None,
            callback: ActiveCallback::Normal,
            flags,
            nonblock: false,
            mute: config.mute,
            volume_gain: convert::db_to_gain(config.volume_db),
            driver_dead: false,
            block_frames,
            stats: PipelineStats::default(),
            fill_history: VecDeque::with_capacity(FILL_HISTORY),
            pending: Vec::with_capacity(block_frames * 2),
            input: Vec::new(),
            resampled: Vec::new(),
            out_s16: Vec::new(),
            out_bytes: Vec::new(),
            reversed: Vec::new(),
            timing,
            config,
        };
        pipeline.set_nonblock(pipeline.config.nonblock);

        if pipeline.config.microphone.enable {
            if let Err(err) = pipeline.init_microphone() {
                warn!("[Microphone] Failed to initialize microphone: {err}");
            }
        }

        Ok(pipeline)
    }

    /// Push one stereo frame; flushed to the output every block
    ///
    /// Always reports the frame as consumed; drops caused by a full buffer
    /// show up in [`PipelineStats::frames_dropped`].
    pub fn push_sample(&mut self, left: i16, right: i16) -> usize {
        if self.callback == ActiveCallback::Rewind {
            self.rewind.push_frame(left, right);
            return 1;
        }

        self.pending.push(left);
        self.pending.push(right);
        if self.pending.len() >= self.block_frames * 2 {
            self.flush();
        }
        1
    }

    /// Push interleaved stereo frames; returns how many were consumed
    ///
    /// A trailing odd sample is ignored. In nonblocking mode the count is short
    /// when the buffer overflowed.
    pub fn push_samples_batch(&mut self, data: &[i16]) -> usize {
        let frames = data.len() / 2;
        if frames == 0 {
            return 0;
        }
        let data = &data[..frames * 2];

        match self.callback {
            ActiveCallback::Rewind => {
                self.rewind.push_batch(data);
                frames
            }
            ActiveCallback::Normal => {
                self.flush();
                self.output(data)
            }
        }
    }

    /// Send single samples still waiting for a full block
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        self.output(&pending);
        self.pending = pending;
        self.pending.clear();
    }

    fn output(&mut self, samples: &[i16]) -> usize {
        let frames = samples.len() / 2;
        if !self.flags.contains(AudioFlags::ACTIVE)
            || self
                .flags
                .intersects(AudioFlags::SUSPENDED | AudioFlags::HARD_DISABLE)
        {
            return frames;
        }

        let mut consumed = 0;
        for chunk in samples.chunks(MAX_CHUNK_FRAMES * 2) {
            match self.output_chunk(chunk) {
                Ok(n) => consumed += n,
                Err(err) => {
                    self.mark_driver_dead(&err);
                    return frames;
                }
            }
        }
        consumed
    }

    fn output_chunk(&mut self, chunk: &[i16]) -> Result<usize> {
        let frames = chunk.len() / 2;
        self.input.clear();
        if self.mute {
            self.input.resize(chunk.len(), 0.0);
        } else {
            convert::s16_to_f32(chunk, self.volume_gain, &mut self.input);
        }

        let Some(output) = self.output.as_ref() else {
            return Ok(frames);
        };
        let fifo = Arc::clone(&output.fifo);
        let threaded = output.is_threaded();

        // Fill snapshot, ratio and ring write under one lock acquisition
        let mut state = fifo.lock();
        if state.is_dead() {
            return Err(AudioError::DriverDead);
        }
        let fill = output.fill(state.ring());
        let ratio = self.rate_control.ratio(fill);
        self.record_fill(ratio, fill);
        self.render(ratio);

        let produced = self.out_bytes.len();
        let written = if threaded {
            self.write_threaded(&fifo, &mut state)?
        } else {
            self.write_sync(&fifo, &mut state)?
        };
        drop(state);

        let consumed = if written >= produced || produced == 0 {
            frames
        } else {
            (frames as u64 * written as u64 / produced as u64) as usize
        };
        if written < produced {
            self.stats.overrun_count += 1;
            debug!(
                "[Audio] Buffer full, dropped {} of {} bytes",
                produced - written,
                produced
            );
        }
        self.stats.frames_pushed += frames as u64;
        self.stats.frames_dropped += (frames - consumed) as u64;
        Ok(consumed)
    }

    fn record_fill(&mut self, ratio: f64, fill: f64) {
        self.ratio = ratio;
        self.stats.ratio = ratio;
        self.stats.fill = fill;
        if self.fill_history.len() == FILL_HISTORY {
            self.fill_history.pop_front();
        }
        self.fill_history.push_back(fill as f32);
    }

    /// Resample, mix and convert `self.input` into `self.out_bytes`
    fn render(&mut self, ratio: f64) {
        self.resampled.clear();
        self.resampler
            .process(&self.input, ratio, &mut self.resampled);

        let mixing = self.mixer.is_active();
        self.flags.set(AudioFlags::MIXER_ACTIVE, mixing);
        if mixing {
            self.mixer.mix_into(&mut self.resampled);
        }

        self.out_bytes.clear();
        if self.flags.contains(AudioFlags::USE_FLOAT) {
            self.out_bytes
                .extend_from_slice(convert::as_bytes(&self.resampled));
        } else {
            self.out_s16.clear();
            convert::f32_to_s16(&self.resampled, &mut self.out_s16);
            self.out_bytes
                .extend_from_slice(convert::as_bytes(&self.out_s16));
        }
    }

    /// Queue `self.out_bytes` for the writer thread
    fn write_threaded(
        &self,
        fifo: &SharedFifo,
        state: &mut MutexGuard<'_, FifoState>,
    ) -> Result<usize> {
        let bytes = &self.out_bytes;
        let frame_bytes = self.frame_bytes();
        let mut written = 0;

        loop {
            let room = state.ring().available_to_write() / frame_bytes * frame_bytes;
            let n = room.min(bytes.len() - written);
            if n > 0 {
                written += state.ring_mut().write(&bytes[written..written + n]);
                fifo.notify();
            }
            if written == bytes.len() || self.nonblock {
                return Ok(written);
            }

            fifo.wait(state);
            if state.is_dead() {
                return Err(AudioError::DriverDead);
            }
        }
    }

    /// Queue `self.out_bytes` and drain the ring into the driver
    ///
    /// The device write happens with the FIFO lock released.
    fn write_sync(
        &mut self,
        fifo: &SharedFifo,
        state: &mut MutexGuard<'_, FifoState>,
    ) -> Result<usize> {
        let Some(output) = self.output.as_ref() else {
            return Ok(self.out_bytes.len());
        };
        let frame_bytes = output.frame_bytes;
        let driver = Arc::clone(&output.driver);
        let bytes = &self.out_bytes;
        let scratch = &mut self.drain_scratch;
        let mut written = 0;

        loop {
            let ring = state.ring_mut();
            let room = ring.available_to_write() / frame_bytes * frame_bytes;
            let n = room.min(bytes.len() - written);
            written += ring.write(&bytes[written..written + n]);

            let drained =
                MutexGuard::unlocked(state, || drain(&driver, fifo, &mut scratch[..]))?;
            if written == bytes.len() || self.nonblock {
                return Ok(written);
            }
            if n == 0 && drained == 0 {
                // A blocking driver that accepts nothing would spin forever
                warn!("[Audio] Driver accepted no data in blocking mode");
                return Ok(written);
            }
        }
    }

    fn mark_driver_dead(&mut self, err: &AudioError) {
        if !self.driver_dead {
            error!(
                "[Audio] Audio driver \"{}\" died: {err}. Audio is disabled until restarted.",
                self.driver_name
            );
        }
        self.driver_dead = true;
        self.flags.remove(AudioFlags::ACTIVE);
    }

    fn frame_bytes(&self) -> usize {
        self.output.as_ref().map_or(4, |o| o.frame_bytes)
    }

    /// Drop audio instead of waiting when the buffer is full
    ///
    /// In threaded mode this only changes the push path; the writer thread
    /// always waits on the device. In synchronous mode the driver is switched
    /// too, since its write is part of the push.
    pub fn set_nonblock(&mut self, nonblock: bool) {
        self.nonblock = nonblock;
        if let Some(output) = self.output.as_ref() {
            if !output.is_threaded() {
                output.driver.lock().set_nonblock_state(nonblock);
            }
        }
        if let Some(mic) = self.mic.as_mut() {
            mic.mic.set_nonblock_state(nonblock);
        }
    }

    /// Whether pushes drop instead of waiting
    pub fn is_nonblock(&self) -> bool {
        self.nonblock
    }

    /// Suspend the feed, the device and the microphone
    pub fn stop(&mut self) -> bool {
        let Some(output) = self.output.as_ref() else {
            return false;
        };
        // Pause the writer first so the device can finish its period
        if let Some(writer) = output.writer.as_ref() {
            writer.set_paused(true);
        }
        let stopped = output.driver.lock().stop();
        if stopped {
            self.flags.insert(AudioFlags::SUSPENDED);
            self.flags.remove(AudioFlags::MIC_ACTIVE);
        } else {
            warn!("[Audio] Failed to stop \"{}\" driver", self.driver_name);
            // Still playing, so blocking pushes need the writer draining
            if let Some(writer) = output.writer.as_ref() {
                writer.set_paused(false);
            }
        }
        stopped
    }

    /// Resume after [`stop`](Self::stop)
    ///
    /// A dead driver is torn down and opened again with the same settings.
    ///
    /// # Errors
    ///
    /// The driver refused to start or could not be re-opened; audio stays off
    /// and later pushes are discarded.
    pub fn start(&mut self) -> Result<()> {
        let needs_restart = self.driver_dead
            || self
                .output
                .as_ref()
                .map_or(true, |o| o.writer_dead() || o.fifo.is_dead());
        if needs_restart {
            return self.restart();
        }

        let Some(output) = self.output.as_ref() else {
            return self.restart();
        };
        if !output.driver.lock().start(false) {
            error!(
                "[Audio] Failed to start \"{}\" driver. Will continue without audio.",
                self.driver_name
            );
            self.flags.remove(AudioFlags::ACTIVE);
            self.flags.insert(AudioFlags::HARD_DISABLE);
            return Err(AudioError::DriverInit(format!(
                "\"{}\" driver refused to start",
                self.driver_name
            )));
        }
        if let Some(writer) = output.writer.as_ref() {
            writer.set_paused(false);
        }

        self.flags.remove(AudioFlags::SUSPENDED);
        self.flags.insert(AudioFlags::ACTIVE);
        let mic_active = self.mic.as_ref().is_some_and(|m| m.mic.is_active());
        self.flags.set(AudioFlags::MIC_ACTIVE, mic_active);
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        info!("[Audio] Reinitializing \"{}\" driver", self.driver_name);
        let mic_state = self.mic.as_ref().map(|m| m.mic.is_active());
        self.mic = None;
        // Joins the writer before the old driver goes away
        self.output = None;

        let output = match Output::open(&self.driver_name, &self.factory, &self.config) {
            Ok(output) => output,
            Err(err) => {
                error!("[Audio] Failed to reinitialize audio driver: {err}. Will continue without audio.");
                self.flags.remove(AudioFlags::ACTIVE);
                self.flags.insert(AudioFlags::HARD_DISABLE);
                return Err(err);
            }
        };

        if output.rate != self.negotiated_rate {
            warn!(
                "[Audio] Device rate changed from {} Hz to {} Hz; mixer streams keep the old rate",
                self.negotiated_rate, output.rate
            );
            self.rate_control.set_output_rate(output.rate)?;
            self.negotiated_rate = output.rate;
        }
        self.block_frames = block_frames(&self.config, output.rate);
        self.drain_scratch = vec![0; self.block_frames * output.frame_bytes];
        self.flags.set(AudioFlags::USE_FLOAT, output.use_float);
        self.resampler.reset();
        self.output = Some(output);
        self.driver_dead = false;
        self.flags.remove(AudioFlags::SUSPENDED | AudioFlags::HARD_DISABLE);
        self.flags.insert(AudioFlags::ACTIVE);
        self.set_nonblock(self.nonblock);

        if let Some(active) = mic_state {
            match self.init_microphone() {
                Ok(()) => {
                    self.set_microphone_active(active);
                }
                Err(err) => warn!("[Microphone] Failed to reopen microphone: {err}"),
            }
        }
        Ok(())
    }

    /// Release the writer, the microphone and the driver
    ///
    /// The pipeline accepts and discards pushes afterwards. Also run on drop.
    pub fn deinit(&mut self) {
        self.mic = None;
        if self.output.take().is_some() {
            info!("[Audio] Deinitialized \"{}\" driver", self.driver_name);
        }
        self.flags
            .remove(AudioFlags::ACTIVE | AudioFlags::MIC_ACTIVE | AudioFlags::MIXER_ACTIVE);
    }

    /// Route pushes to the rewind buffer (true) or the output (false)
    ///
    /// Entering rewind empties the rewind buffer; call once per rewound frame.
    pub fn set_rewind(&mut self, rewinding: bool) {
        if rewinding {
            self.flush();
            self.rewind.clear();
            self.callback = ActiveCallback::Rewind;
        } else {
            self.callback = ActiveCallback::Normal;
        }
    }

    /// End of a rewound frame: play its audio backwards
    ///
    /// Returns the frames consumed by the output path.
    pub fn frame_is_reverse(&mut self) -> usize {
        let mut reversed = std::mem::take(&mut self.reversed);
        reversed.clear();
        self.rewind.flush_into(&mut reversed);
        let consumed = if reversed.is_empty() {
            0
        } else {
            self.output(&reversed)
        };
        self.reversed = reversed;
        consumed
    }

    /// Active sample destination
    pub fn callback(&self) -> ActiveCallback {
        self.callback
    }

    /// Rewind buffer
    pub fn rewind_buffer(&self) -> &RewindBuffer {
        &self.rewind
    }

    /// Open the configured microphone on the current driver
    ///
    /// The microphone starts inactive. Opening twice is a no-op.
    ///
    /// # Errors
    ///
    /// No driver is open, or it does not support capture.
    pub fn init_microphone(&mut self) -> Result<()> {
        if self.mic.is_some() {
            return Ok(());
        }
        let Some(output) = self.output.as_ref() else {
            return Err(AudioError::DriverDead);
        };

        let mic_config = &self.config.microphone;
        let params = DriverParams {
            device: mic_config.device.clone(),
            rate: mic_config.rate,
            latency_ms: mic_config.latency_ms,
            block_frames: 0,
        };
        let opened = output.driver.lock().init_microphone(&params)?;
        if opened.rate == 0 {
            return Err(AudioError::DriverInit(
                "Microphone negotiated a rate of 0 Hz".into(),
            ));
        }

        let mut mic = opened.mic;
        mic.set_active(false);
        mic.set_nonblock_state(self.nonblock);
        if opened.rate != mic_config.rate {
            info!(
                "[Microphone] Resampling from {} Hz to {} Hz",
                opened.rate, mic_config.rate
            );
        }

        self.mic = Some(PipelineMic {
            mic,
            device_rate: opened.rate,
            rate: mic_config.rate,
            resampler: resampler::create(self.config.resampler_quality, 1),
            pending: VecDeque::new(),
            raw: Vec::new(),
            decoded: Vec::new(),
            resampled: Vec::new(),
        });
        Ok(())
    }

    /// Close the microphone
    pub fn free_microphone(&mut self) {
        self.mic = None;
        self.flags.remove(AudioFlags::MIC_ACTIVE);
    }

    /// Start or stop recording; false if no microphone is open or it refused
    pub fn set_microphone_active(&mut self, active: bool) -> bool {
        let Some(mic) = self.mic.as_mut() else {
            return false;
        };
        if !mic.mic.set_active(active) {
            warn!("[Microphone] Device refused to {}", if active { "start" } else { "stop" });
            return false;
        }
        if !active {
            mic.pending.clear();
            mic.resampler.reset();
        }
        self.flags.set(
            AudioFlags::MIC_ACTIVE,
            active && !self.flags.contains(AudioFlags::SUSPENDED),
        );
        true
    }

    /// Whether the microphone is open and recording
    pub fn microphone_active(&self) -> bool {
        self.mic.as_ref().is_some_and(|m| m.mic.is_active())
    }

    /// Rate the microphone device negotiated
    pub fn microphone_device_rate(&self) -> Option<u32> {
        self.mic.as_ref().map(|m| m.device_rate)
    }

    /// Read mono samples at the configured microphone rate
    ///
    /// An inactive or suspended microphone fills `dest` with silence. Blocking
    /// reads fill `dest`; nonblocking reads return what was available.
    ///
    /// # Errors
    ///
    /// [`AudioError::Unsupported`] without an open microphone, or the
    /// microphone's own read error.
    pub fn read_microphone(&mut self, dest: &mut [i16]) -> Result<usize> {
        let suspended = self.flags.contains(AudioFlags::SUSPENDED);
        let Some(mic) = self.mic.as_mut() else {
            return Err(AudioError::Unsupported("microphone"));
        };

        if suspended || !mic.mic.is_active() {
            dest.fill(0);
            return Ok(dest.len());
        }

        mic.fill(dest.len())?;
        let n = dest.len().min(mic.pending.len());
        for (d, s) in dest.iter_mut().zip(mic.pending.drain(..n)) {
            *d = s;
        }
        Ok(n)
    }

    /// Core volume in dB
    pub fn set_volume_db(&mut self, db: f32) {
        self.volume_gain = convert::db_to_gain(db);
    }

    /// Replace the core's audio with silence, keeping timing
    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    /// Whether the core's audio is muted
    pub fn is_muted(&self) -> bool {
        self.mute
    }

    /// Turn dynamic rate control on or off
    pub fn set_rate_control(&mut self, enabled: bool) {
        self.rate_control.set_enabled(enabled);
        self.flags.set(AudioFlags::CONTROL, enabled);
    }

    /// New core timing (e.g. after the core changed its AV info)
    pub fn set_input_timing(&mut self, timing: InputTiming) -> Result<()> {
        self.rate_control
            .set_input_timing(&timing, self.config.max_timing_skew)?;
        let frames = rewind_frames(&timing);
        if frames != self.rewind.capacity_frames() {
            self.rewind = RewindBuffer::new(frames);
        }
        self.timing = timing;
        self.ratio = self.rate_control.nominal();
        Ok(())
    }

    /// Ratio used by the most recent push
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Output rate / adjusted input rate
    pub fn nominal_ratio(&self) -> f64 {
        self.rate_control.nominal()
    }

    /// Rate the device accepted
    pub fn negotiated_rate(&self) -> u32 {
        self.negotiated_rate
    }

    /// Name of the driver in use
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Current core timing
    pub fn input_timing(&self) -> &InputTiming {
        &self.timing
    }

    /// Settings the pipeline was built from
    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Fill fraction the rate controller would see now
    pub fn fill_fraction(&self) -> f64 {
        match self.output.as_ref() {
            Some(output) => {
                let state = output.fifo.lock();
                output.fill(state.ring())
            }
            None => 0.0,
        }
    }

    /// Bytes that can be pushed without blocking
    pub fn write_avail(&self) -> usize {
        let Some(output) = self.output.as_ref() else {
            return 0;
        };
        if !output.is_threaded() {
            if let Some(avail) = output.driver.lock().write_avail() {
                return avail;
            }
        }
        output.fifo.write_avail()
    }

    /// Total buffer in bytes
    pub fn buffer_size(&self) -> usize {
        let Some(output) = self.output.as_ref() else {
            return 0;
        };
        if !output.is_threaded() {
            if let Some(size) = output.driver.lock().buffer_size() {
                return size;
            }
        }
        output.fifo.capacity() - 1
    }

    /// Status bits
    pub fn flags(&self) -> AudioFlags {
        self.flags
    }

    /// Whether a driver is open and accepting samples
    pub fn is_active(&self) -> bool {
        self.flags.contains(AudioFlags::ACTIVE)
    }

    /// Whether the device is playing and its worker threads are alive
    pub fn is_alive(&self) -> bool {
        if self.driver_dead {
            return false;
        }
        self.output.as_ref().is_some_and(|o| {
            !o.writer_dead() && !o.fifo.is_dead() && o.driver.lock().alive()
        })
    }

    /// Counters since init
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Summary of recent fill snapshots; `None` before the first push
    pub fn buffer_statistics(&self) -> Option<BufferStatistics> {
        BufferStatistics::from_history(&self.fill_history)
    }

    /// Devices the current driver can open
    pub fn device_list(&self) -> Vec<String> {
        self.output
            .as_ref()
            .map(|o| o.driver.lock().device_list())
            .unwrap_or_default()
    }

    /// Sound effect mixer
    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    /// Sound effect mixer
    pub fn mixer_mut(&mut self) -> &mut Mixer {
        &mut self.mixer
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{SimulatedConfig, SimulatedHost};
    use crate::driver::OpenedDriver;
    use crate::mixer::StreamType;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Device that takes everything or nothing, and may refuse to stop
    struct ScriptedDriver {
        accept: bool,
        stoppable: bool,
    }

    impl AudioDriver for ScriptedDriver {
        fn ident(&self) -> &'static str {
            "scripted"
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            Ok(if self.accept { data.len() } else { 0 })
        }

        fn stop(&mut self) -> bool {
            self.stoppable
        }

        fn start(&mut self, _is_shutdown: bool) -> bool {
            true
        }

        fn alive(&self) -> bool {
            true
        }

        fn set_nonblock_state(&mut self, _nonblock: bool) {}

        fn use_float(&self) -> bool {
            false
        }
    }

    fn scripted_pipeline(accept: bool, stoppable: bool, config: AudioConfig) -> AudioPipeline {
        let mut registry = DriverRegistry::new();
        registry.register("scripted", move |params: &DriverParams| {
            Ok(OpenedDriver {
                driver: Box::new(ScriptedDriver { accept, stoppable }),
                rate: params.rate,
            })
        });
        let config = AudioConfig {
            driver: "scripted".into(),
            ..config
        };
        AudioPipeline::init(&registry, config, InputTiming::matched(48_000.0, 60.0)).unwrap()
    }

    fn null_pipeline(config: AudioConfig) -> AudioPipeline {
        let registry = DriverRegistry::with_defaults();
        let config = AudioConfig {
            driver: "null".into(),
            ..config
        };
        AudioPipeline::init(&registry, config, InputTiming::matched(48_000.0, 60.0)).unwrap()
    }

    fn simulated(config: AudioConfig) -> (AudioPipeline, SimulatedHost) {
        let host = SimulatedHost::new(SimulatedConfig::default());
        let mut registry = DriverRegistry::new();
        host.register(&mut registry);
        let config = AudioConfig {
            driver: "simulated".into(),
            ..config
        };
        let pipeline =
            AudioPipeline::init(&registry, config, InputTiming::matched(48_000.0, 60.0)).unwrap();
        (pipeline, host)
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_init_negotiates_and_sets_flags() {
        let pipeline = null_pipeline(AudioConfig::low_latency(44_100));
        assert_eq!(pipeline.negotiated_rate(), 44_100);
        assert_eq!(pipeline.driver_name(), "null");
        assert!((pipeline.nominal_ratio() - 44_100.0 / 48_000.0).abs() < 1e-9);
        assert!(pipeline.flags().contains(AudioFlags::ACTIVE | AudioFlags::CONTROL));
        assert!(!pipeline.flags().contains(AudioFlags::USE_FLOAT));
        assert_eq!(pipeline.callback(), ActiveCallback::Normal);
        assert!(pipeline.is_alive());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let registry = DriverRegistry::with_defaults();
        let config = AudioConfig {
            latency_ms: 0,
            ..AudioConfig::default()
        };
        let result = AudioPipeline::init(&registry, config, InputTiming::matched(48_000.0, 60.0));
        assert!(matches!(result, Err(AudioError::Config(_))));
    }

    #[test]
    fn test_failed_driver_open_is_reported() {
        let mut registry = DriverRegistry::new();
        registry.register("broken", |_params: &DriverParams| {
            Err(AudioError::DriverInit("no device".into()))
        });
        let config = AudioConfig {
            driver: "broken".into(),
            ..AudioConfig::default()
        };
        let result = AudioPipeline::init(&registry, config, InputTiming::matched(48_000.0, 60.0));
        assert!(matches!(result, Err(AudioError::DriverInit(_))));
    }

    #[test]
    fn test_blocking_push_consumes_everything() {
        let mut pipeline = null_pipeline(AudioConfig::low_latency(48_000));
        let frame = vec![1000i16; 800 * 2];
        for _ in 0..3 {
            assert_eq!(pipeline.push_samples_batch(&frame), 800);
        }
        let stats = pipeline.stats();
        assert_eq!(stats.frames_pushed, 2400);
        assert_eq!(stats.frames_dropped, 0);
        let (low, high) = (pipeline.nominal_ratio() * 0.995, pipeline.nominal_ratio() * 1.005);
        assert!(stats.ratio >= low - 1e-12 && stats.ratio <= high + 1e-12);
    }

    #[test]
    fn test_nonblocking_push_drops_overflow() {
        let mut pipeline = null_pipeline(AudioConfig {
            nonblock: true,
            ..AudioConfig::low_latency(48_000)
        });
        assert!(pipeline.is_nonblock());

        let frame = vec![0i16; 800 * 2];
        let mut short = false;
        for _ in 0..40 {
            if pipeline.push_samples_batch(&frame) < 800 {
                short = true;
            }
        }
        assert!(short);
        let stats = pipeline.stats();
        assert!(stats.overrun_count > 0);
        assert!(stats.frames_dropped > 0);
        // A full buffer pulls the ratio to its lower bound
        assert!(pipeline.ratio() < pipeline.nominal_ratio());
    }

    #[test]
    fn test_nonblocking_overflow_leaves_buffer_exactly_full() {
        let frame = vec![0i16; 800 * 2];

        // Synchronous: the device takes nothing, so the ring keeps what fit
        let mut pipeline = scripted_pipeline(
            false,
            true,
            AudioConfig {
                nonblock: true,
                ..AudioConfig::low_latency(48_000)
            },
        );
        for _ in 0..10 {
            pipeline.push_samples_batch(&frame);
        }
        assert!(pipeline.stats().frames_dropped > 0);
        assert_eq!(pipeline.write_avail(), 0);

        // Threaded: the writer takes at most one period before the device stalls it
        let mut pipeline = scripted_pipeline(
            false,
            true,
            AudioConfig {
                nonblock: true,
                threaded: true,
                ..AudioConfig::low_latency(48_000)
            },
        );
        for _ in 0..10 {
            pipeline.push_samples_batch(&frame);
        }
        thread::sleep(Duration::from_millis(50));
        pipeline.push_samples_batch(&frame);
        assert!(pipeline.stats().frames_dropped > 0);
        assert_eq!(pipeline.write_avail(), 0);
    }

    #[test]
    fn test_refused_stop_keeps_writer_draining() {
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut pipeline = scripted_pipeline(
                true,
                false,
                AudioConfig {
                    threaded: true,
                    ..AudioConfig::low_latency(48_000)
                },
            );
            assert!(!pipeline.stop());
            assert!(!pipeline.flags().contains(AudioFlags::SUSPENDED));

            // Several buffers' worth only fits if the writer is still draining
            let frame = vec![0i16; 800 * 2];
            for _ in 0..20 {
                assert_eq!(pipeline.push_samples_batch(&frame), 800);
            }
            done_tx.send(()).ok();
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_stop_while_writer_is_mid_write() {
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut pipeline, host) = simulated(AudioConfig {
                threaded: true,
                ..AudioConfig::low_latency(48_000)
            });
            let frame = vec![500i16; 800 * 2];
            for _ in 0..20 {
                pipeline.push_samples_batch(&frame);
                pipeline.push_samples_batch(&frame);
                // The writer is usually inside a device write here
                assert!(pipeline.stop());
                thread::sleep(Duration::from_millis(5));
                pipeline.start().unwrap();
            }

            pipeline.push_samples_batch(&frame);
            assert!(pipeline.stop());
            pipeline.deinit();
            done_tx.send(host.periods_written()).ok();
        });

        let periods = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(periods > 0);
    }

    #[test]
    fn test_single_samples_are_batched() {
        let mut pipeline = null_pipeline(AudioConfig {
            block_frames: 64,
            ..AudioConfig::low_latency(48_000)
        });
        for i in 0..63 {
            assert_eq!(pipeline.push_sample(i, -i), 1);
        }
        assert_eq!(pipeline.stats().frames_pushed, 0);
        pipeline.push_sample(0, 0);
        assert_eq!(pipeline.stats().frames_pushed, 64);

        pipeline.push_sample(1, 1);
        pipeline.flush();
        assert_eq!(pipeline.stats().frames_pushed, 65);
    }

    #[test]
    fn test_rewind_defers_until_frame_end() {
        let mut pipeline = null_pipeline(AudioConfig::low_latency(48_000));
        pipeline.set_rewind(true);
        assert_eq!(pipeline.callback(), ActiveCallback::Rewind);

        assert_eq!(pipeline.push_samples_batch(&[1, 1, 2, 2, 3, 3]), 3);
        pipeline.push_sample(4, 4);
        assert_eq!(pipeline.rewind_buffer().len_frames(), 4);
        assert_eq!(pipeline.stats().frames_pushed, 0);

        assert_eq!(pipeline.frame_is_reverse(), 4);
        assert!(pipeline.rewind_buffer().is_empty());
        assert_eq!(pipeline.stats().frames_pushed, 4);

        pipeline.set_rewind(false);
        assert_eq!(pipeline.callback(), ActiveCallback::Normal);
        assert_eq!(pipeline.frame_is_reverse(), 0);
    }

    #[test]
    fn test_stop_discards_and_start_resumes() {
        let mut pipeline = null_pipeline(AudioConfig::low_latency(48_000));
        assert!(pipeline.stop());
        assert!(pipeline.flags().contains(AudioFlags::SUSPENDED));
        assert!(!pipeline.is_alive());

        assert_eq!(pipeline.push_samples_batch(&[0; 200]), 100);
        assert_eq!(pipeline.stats().frames_pushed, 0);

        pipeline.start().unwrap();
        assert!(!pipeline.flags().contains(AudioFlags::SUSPENDED));
        assert!(pipeline.is_alive());
        pipeline.push_samples_batch(&[0; 200]);
        assert_eq!(pipeline.stats().frames_pushed, 100);
    }

    #[test]
    fn test_rate_control_toggle() {
        let mut pipeline = null_pipeline(AudioConfig {
            nonblock: true,
            ..AudioConfig::low_latency(48_000)
        });
        pipeline.set_rate_control(false);
        assert!(!pipeline.flags().contains(AudioFlags::CONTROL));
        pipeline.push_samples_batch(&[0; 1600]);
        assert_eq!(pipeline.ratio(), pipeline.nominal_ratio());
    }

    #[test]
    fn test_mixer_flag_follows_playback() {
        let mut pipeline = null_pipeline(AudioConfig::low_latency(48_000));
        let slot = pipeline
            .mixer_mut()
            .add_stream("blip", vec![0.25; 200], StreamType::System)
            .unwrap();
        pipeline.mixer_mut().play(slot);

        pipeline.push_samples_batch(&[0; 400]);
        assert!(pipeline.flags().contains(AudioFlags::MIXER_ACTIVE));
        // 100 frames, consumed by the first push
        pipeline.push_samples_batch(&[0; 400]);
        assert!(!pipeline.flags().contains(AudioFlags::MIXER_ACTIVE));
    }

    #[test]
    fn test_buffer_statistics() {
        let mut pipeline = null_pipeline(AudioConfig {
            nonblock: true,
            ..AudioConfig::low_latency(48_000)
        });
        assert!(pipeline.buffer_statistics().is_none());

        for _ in 0..20 {
            pipeline.push_samples_batch(&[0; 1600]);
        }
        let stats = pipeline.buffer_statistics().unwrap();
        assert_eq!(stats.samples, 20);
        assert!((0.0..=100.0).contains(&stats.average_fill));
        // Pushing far faster than real time ends up near full
        assert!(stats.close_to_blocking > 0.0);
    }

    #[test]
    fn test_deinit_discards_pushes() {
        let mut pipeline = null_pipeline(AudioConfig::low_latency(48_000));
        pipeline.deinit();
        assert!(!pipeline.is_active());
        assert!(!pipeline.is_alive());
        assert_eq!(pipeline.push_samples_batch(&[0; 64]), 32);
        assert_eq!(pipeline.write_avail(), 0);
    }

    #[test]
    fn test_threaded_mode_reaches_device() {
        let (mut pipeline, host) = simulated(AudioConfig::stable(48_000));
        let tone: Vec<i16> = (0..800).flat_map(|i| [(i * 37 % 2000) as i16 + 500; 2]).collect();
        for _ in 0..10 {
            assert_eq!(pipeline.push_samples_batch(&tone), 800);
        }
        assert!(wait_until(Duration::from_secs(2), || {
            host.recent_periods()
                .iter()
                .any(|p| p.iter().any(|&b| b != 0))
        }));
        assert!(pipeline.is_alive());
    }

    #[test]
    fn test_driver_death_and_restart() {
        let (mut pipeline, host) = simulated(AudioConfig::low_latency(48_000));
        host.inject_error(DeviceError::Fatal("unplugged".into()));
        assert!(wait_until(Duration::from_secs(2), || !pipeline.is_alive()));

        let frame = vec![0i16; 400 * 2];
        assert_eq!(pipeline.push_samples_batch(&frame), 400);
        assert!(!pipeline.is_active());
        // Later pushes are accepted silently
        assert_eq!(pipeline.push_samples_batch(&frame), 400);

        pipeline.start().unwrap();
        assert!(pipeline.is_active());
        assert!(pipeline.is_alive());
        assert_eq!(pipeline.push_samples_batch(&frame), 400);
    }

    #[test]
    fn test_microphone_reads_resampled_capture() {
        let config = AudioConfig {
            microphone: crate::config::MicrophoneConfig {
                enable: true,
                rate: 48_000,
                ..Default::default()
            },
            ..AudioConfig::low_latency(48_000)
        };
        let (mut pipeline, host) = simulated(config);
        host.set_capture_sample(1234);

        let mut buf = vec![7i16; 256];
        // Inactive microphones read silence
        assert_eq!(pipeline.read_microphone(&mut buf).unwrap(), 256);
        assert!(buf.iter().all(|&s| s == 0));

        assert!(pipeline.set_microphone_active(true));
        assert!(pipeline.flags().contains(AudioFlags::MIC_ACTIVE));
        assert_eq!(pipeline.microphone_device_rate(), Some(48_000));

        let mut captured = Vec::new();
        for _ in 0..4 {
            assert_eq!(pipeline.read_microphone(&mut buf).unwrap(), 256);
            captured.extend_from_slice(&buf);
        }
        assert_eq!(*captured.last().unwrap(), 1234);

        pipeline.free_microphone();
        assert!(matches!(
            pipeline.read_microphone(&mut buf),
            Err(AudioError::Unsupported(_))
        ));
    }

    #[test]
    fn test_microphone_unsupported_on_null_driver() {
        let mut pipeline = null_pipeline(AudioConfig::low_latency(48_000));
        assert!(matches!(
            pipeline.init_microphone(),
            Err(AudioError::Unsupported(_))
        ));
        assert!(!pipeline.set_microphone_active(true));
    }
}
