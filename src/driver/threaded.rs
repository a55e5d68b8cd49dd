//! Threaded device backend
//!
//! The hardware write happens on a dedicated worker thread; [`AudioDriver::write`]
//! only copies into a shared FIFO. This keeps a slow or stalling device from
//! holding up the emulation thread beyond the FIFO's capacity, and lets the
//! worker pad underruns with silence instead of letting the device starve.
//!
//! The platform side is abstracted as a [`PcmHost`], which opens a playback
//! sink (and optionally a capture source) with negotiated parameters. The ALSA
//! host and the simulated host both plug in here.

use super::{AudioDriver, DriverParams, Microphone, OpenedDriver, OpenedMicrophone};
use crate::fifo::SharedFifo;
use crate::worker::{CaptureSource, CaptureWorker, PeriodSink, PlaybackWorker};
use crate::{AudioError, Result};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Parameters the device actually accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmStreamInfo {
    /// Sample rate in Hz
    pub rate: u32,
    /// Frames per hardware period
    pub period_frames: usize,
    /// Frames in the whole hardware buffer
    pub buffer_frames: usize,
    /// Interleaved channels
    pub channels: usize,
    /// `f32` samples when true, `i16` otherwise
    pub use_float: bool,
}

impl PcmStreamInfo {
    /// Bytes per interleaved frame
    pub fn frame_bytes(&self) -> usize {
        let sample = if self.use_float { 4 } else { 2 };
        self.channels.max(1) * sample
    }

    /// Bytes per hardware period
    pub fn period_bytes(&self) -> usize {
        self.period_frames * self.frame_bytes()
    }

    /// Bytes in the whole hardware buffer
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_frames * self.frame_bytes()
    }
}

/// Platform device access used by [`ThreadedDriver`]
pub trait PcmHost: Send + 'static {
    /// Registry name of the backend built on this host
    fn ident(&self) -> &'static str;

    /// Open and configure an interleaved stereo playback stream
    fn open_playback(&self, params: &DriverParams) -> Result<(Box<dyn PeriodSink>, PcmStreamInfo)>;

    /// Open and configure a mono capture stream
    fn open_capture(
        &self,
        _params: &DriverParams,
    ) -> Result<(Box<dyn CaptureSource>, PcmStreamInfo)> {
        Err(AudioError::Unsupported("capture"))
    }

    /// Names of the devices this host can open
    fn device_list(&self) -> Vec<String> {
        Vec::new()
    }
}

/// [`AudioDriver`] running its device on a worker thread
pub struct ThreadedDriver<H: PcmHost> {
    host: H,
    fifo: Arc<SharedFifo>,
    worker: PlaybackWorker,
    info: PcmStreamInfo,
    nonblock: bool,
    is_paused: bool,
    /// Suspend flags of microphones opened through this driver
    mic_suspend: Vec<Arc<AtomicBool>>,
}

impl<H: PcmHost> ThreadedDriver<H> {
    /// Open the host's playback device and start the worker
    ///
    /// The FIFO holds exactly one hardware buffer.
    pub fn new(host: H, params: &DriverParams) -> Result<Self> {
        let (sink, info) = host.open_playback(params)?;
        if info.period_frames == 0 || info.buffer_frames < info.period_frames {
            return Err(AudioError::DriverInit(format!(
                "Device returned an unusable buffer layout ({} frames per period, {} frames total)",
                info.period_frames, info.buffer_frames
            )));
        }

        let fifo = Arc::new(SharedFifo::new(info.buffer_bytes() + 1)?);
        let worker = PlaybackWorker::spawn(
            &format!("{}-playback", host.ident()),
            Arc::clone(&fifo),
            sink,
            info.period_bytes(),
        )?;

        info!(
            "[Audio] [{}] Period size: {} frames, buffer size: {} frames",
            host.ident(),
            info.period_frames,
            info.buffer_frames
        );

        Ok(ThreadedDriver {
            host,
            fifo,
            worker,
            info,
            nonblock: false,
            is_paused: false,
            mic_suspend: Vec::new(),
        })
    }

    /// Registry factory
    pub fn open(host: H, params: &DriverParams) -> Result<OpenedDriver> {
        let driver = Self::new(host, params)?;
        let rate = driver.info.rate;
        Ok(OpenedDriver {
            driver: Box::new(driver),
            rate,
        })
    }

    /// Negotiated stream parameters
    pub fn stream_info(&self) -> PcmStreamInfo {
        self.info
    }

    fn set_mics_suspended(&mut self, suspended: bool) {
        // Flags of microphones that were dropped are pruned here
        self.mic_suspend.retain(|flag| Arc::strong_count(flag) > 1);
        for flag in &self.mic_suspend {
            flag.store(suspended, Ordering::Release);
        }
    }
}

impl<H: PcmHost> AudioDriver for ThreadedDriver<H> {
    fn ident(&self) -> &'static str {
        self.host.ident()
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        // Nothing drains the FIFO while paused, so never wait on it then
        self.fifo.write(data, self.nonblock || self.is_paused)
    }

    fn stop(&mut self) -> bool {
        self.is_paused = true;
        self.worker.set_paused(true);
        self.set_mics_suspended(true);
        true
    }

    fn start(&mut self, _is_shutdown: bool) -> bool {
        self.is_paused = false;
        self.worker.set_paused(false);
        self.set_mics_suspended(false);
        true
    }

    fn alive(&self) -> bool {
        !self.is_paused && !self.fifo.is_dead()
    }

    fn set_nonblock_state(&mut self, nonblock: bool) {
        self.nonblock = nonblock;
    }

    fn use_float(&self) -> bool {
        self.info.use_float
    }

    fn write_avail(&self) -> Option<usize> {
        Some(self.fifo.write_avail())
    }

    fn buffer_size(&self) -> Option<usize> {
        Some(self.info.buffer_bytes())
    }

    fn device_list(&self) -> Vec<String> {
        self.host.device_list()
    }

    fn init_microphone(&mut self, params: &DriverParams) -> Result<OpenedMicrophone> {
        let (source, info) = self.host.open_capture(params)?;
        if info.period_frames == 0 {
            return Err(AudioError::DriverInit(
                "Capture device returned a zero period".into(),
            ));
        }

        let fifo = Arc::new(SharedFifo::new(info.buffer_bytes().max(info.period_bytes()) + 1)?);
        let worker = CaptureWorker::spawn(
            &format!("{}-capture", self.host.ident()),
            Arc::clone(&fifo),
            source,
            info.period_bytes(),
        )?;

        let suspend = worker.suspend_flag();
        suspend.store(self.is_paused, Ordering::Release);
        self.mic_suspend.push(suspend);

        info!(
            "[Audio] [{}] Opened microphone at {} Hz",
            self.host.ident(),
            info.rate
        );

        Ok(OpenedMicrophone {
            mic: Box::new(ThreadedMicrophone {
                fifo,
                worker,
                info,
                nonblock: false,
            }),
            rate: info.rate,
        })
    }
}

/// Microphone fed by a [`CaptureWorker`]
pub struct ThreadedMicrophone {
    fifo: Arc<SharedFifo>,
    worker: CaptureWorker,
    info: PcmStreamInfo,
    nonblock: bool,
}

impl Microphone for ThreadedMicrophone {
    fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        if !self.worker.is_recording() {
            return Ok(0);
        }
        self.fifo.read(dest, self.nonblock)
    }

    fn set_active(&mut self, active: bool) -> bool {
        self.worker.set_enabled(active);
        if !active {
            self.fifo.clear();
        }
        true
    }

    fn is_active(&self) -> bool {
        self.worker.is_enabled()
    }

    fn set_nonblock_state(&mut self, nonblock: bool) {
        self.nonblock = nonblock;
    }

    fn use_float(&self) -> bool {
        self.info.use_float
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{SimulatedConfig, SimulatedHost};
    use crate::worker::DeviceError;
    use std::time::{Duration, Instant};

    fn open(config: SimulatedConfig) -> (ThreadedDriver<SimulatedHost>, SimulatedHost) {
        let host = SimulatedHost::new(config);
        let driver = ThreadedDriver::new(host.clone(), &DriverParams::new(48_000, 64)).unwrap();
        (driver, host)
    }

    #[test]
    fn test_fifo_holds_one_hardware_buffer() {
        let (driver, _host) = open(SimulatedConfig::default());
        let info = driver.stream_info();
        assert_eq!(driver.buffer_size(), Some(info.buffer_bytes()));
        assert!(driver.write_avail().unwrap() <= info.buffer_bytes());
        assert_eq!(driver.ident(), "simulated");
    }

    #[test]
    fn test_nonblocking_write_is_short_when_device_holds() {
        let (mut driver, host) = open(SimulatedConfig::default());
        host.hold();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !host.is_blocked() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(host.is_blocked());
        driver.set_nonblock_state(true);

        let buffer = driver.buffer_size().unwrap();
        let data = vec![1u8; buffer * 4];
        // The stalled worker holds no FIFO space, so exactly one buffer fits
        assert_eq!(driver.write(&data).unwrap(), buffer);
        assert_eq!(driver.write(&data).unwrap(), 0);
        host.release();
    }

    #[test]
    fn test_fatal_device_error_surfaces_as_dead_driver() {
        let (mut driver, host) = open(SimulatedConfig::default());
        host.inject_error(DeviceError::Fatal("device unplugged".into()));

        let deadline = Instant::now() + Duration::from_secs(2);
        while driver.alive() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!driver.alive());
        assert!(matches!(driver.write(&[0u8; 64]), Err(AudioError::DriverDead)));
    }

    #[test]
    fn test_stop_pauses_feed() {
        let (mut driver, host) = open(SimulatedConfig::default());
        assert!(driver.stop());
        assert!(!driver.alive());
        std::thread::sleep(Duration::from_millis(20));
        let written = host.periods_written();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(host.periods_written(), written);

        assert!(driver.start(false));
        assert!(driver.alive());
    }

    #[test]
    fn test_blocking_write_on_stopped_driver_does_not_wait() {
        let (mut driver, _host) = open(SimulatedConfig::default());
        let buffer = driver.buffer_size().unwrap();
        assert!(driver.stop());
        // Let a period already in flight reach the device
        std::thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        let data = vec![0u8; buffer * 2];
        assert_eq!(driver.write(&data).unwrap(), buffer);
        assert_eq!(driver.write(&data).unwrap(), 0);
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(driver.start(false));
        assert_eq!(driver.write(&[0u8; 64]).unwrap(), 64);
    }

    #[test]
    fn test_microphone_reads_captured_audio() {
        let (mut driver, host) = open(SimulatedConfig::default());
        host.set_capture_sample(1234);

        let mut opened = driver.init_microphone(&DriverParams::new(16_000, 64)).unwrap();
        assert_eq!(opened.rate, 16_000);
        assert!(opened.mic.is_active());
        assert!(!opened.mic.use_float());

        let mut dest = [0u8; 64];
        assert_eq!(opened.mic.read(&mut dest).unwrap(), 64);
        let first = i16::from_ne_bytes([dest[0], dest[1]]);
        assert_eq!(first, 1234);

        opened.mic.set_active(false);
        assert_eq!(opened.mic.read(&mut dest).unwrap(), 0);
    }
}
