//! Pull-model playback through rodio
//!
//! rodio asks for samples from its own mixer thread. The driver pushes into a
//! [`SharedFifo`]; a [`Source`] on the rodio side drains it one batch at a
//! time and plays silence when it runs dry. `OutputStream` is not `Send`, so a
//! dedicated thread owns the stream and the sink and takes commands over a
//! channel.

use super::{AudioDriver, DriverParams, OpenedDriver};
use crate::fifo::SharedFifo;
use crate::{AudioError, Result};
use log::error;
use rodio::{OutputStream, Sink, Source};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Registry name
pub const IDENT: &str = "rodio";

/// Interleaved stereo `f32`
const FRAME_BYTES: usize = 8;

/// Samples pulled from the FIFO per batch
const BATCH_SAMPLES: usize = 512;

/// Audio source that drains the FIFO
struct FifoSource {
    fifo: Arc<SharedFifo>,
    sample_rate: u32,
    bytes: Vec<u8>,
    /// Decoded batch
    buffer: Vec<f32>,
    buffer_pos: usize,
}

impl FifoSource {
    fn new(fifo: Arc<SharedFifo>, sample_rate: u32) -> Self {
        FifoSource {
            fifo,
            sample_rate,
            bytes: vec![0u8; BATCH_SAMPLES * 4],
            buffer: Vec::with_capacity(BATCH_SAMPLES),
            buffer_pos: 0,
        }
    }
}

impl Iterator for FifoSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buffer_pos >= self.buffer.len() {
            if self.fifo.is_dead() {
                return None;
            }
            // Underrun is zero-filled, which decodes to silence
            self.fifo.read_period(&mut self.bytes);
            self.buffer.clear();
            crate::convert::f32_bytes_to_f32(&self.bytes, &mut self.buffer);
            self.buffer_pos = 0;
        }

        let sample = self.buffer[self.buffer_pos];
        self.buffer_pos += 1;
        Some(sample)
    }
}

impl Source for FifoSource {
    fn current_frame_len(&self) -> Option<usize> {
        Some(BATCH_SAMPLES)
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

enum Command {
    Play,
    Pause,
    Shutdown,
}

/// rodio output driver
pub struct RodioDriver {
    fifo: Arc<SharedFifo>,
    commands: mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
    nonblock: bool,
    running: bool,
}

impl RodioDriver {
    /// Open the default output device
    pub fn new(params: &DriverParams) -> Result<Self> {
        let rate = if params.rate == 0 { 48_000 } else { params.rate };
        let frames = params.latency_frames(rate).max(BATCH_SAMPLES);
        let fifo = Arc::new(SharedFifo::new(frames * FRAME_BYTES + 1)?);

        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let source_fifo = Arc::clone(&fifo);

        let thread = thread::Builder::new()
            .name("rodio-output".into())
            .spawn(move || output_thread(source_fifo, rate, command_rx, ready_tx))
            .map_err(|e| AudioError::Thread(format!("Failed to spawn rodio thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                let _ = thread.join();
                return Err(AudioError::DriverInit(msg));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::DriverInit("rodio thread exited".into()));
            }
        }

        Ok(RodioDriver {
            fifo,
            commands,
            thread: Some(thread),
            nonblock: false,
            running: true,
        })
    }

    /// Registry factory
    pub fn open(params: &DriverParams) -> Result<OpenedDriver> {
        let driver = Self::new(params)?;
        Ok(OpenedDriver {
            driver: Box::new(driver),
            rate: if params.rate == 0 { 48_000 } else { params.rate },
        })
    }
}

fn output_thread(
    fifo: Arc<SharedFifo>,
    rate: u32,
    commands: mpsc::Receiver<Command>,
    ready: mpsc::Sender<std::result::Result<(), String>>,
) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to create audio stream: {e}")));
            return;
        }
    };
    let sink = match Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to create audio sink: {e}")));
            return;
        }
    };

    sink.append(FifoSource::new(Arc::clone(&fifo), rate));
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        match command {
            Command::Play => sink.play(),
            Command::Pause => sink.pause(),
            Command::Shutdown => break,
        }
    }

    fifo.mark_dead();
    sink.stop();
}

impl AudioDriver for RodioDriver {
    fn ident(&self) -> &'static str {
        IDENT
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        // A paused sink stops pulling, so waiting for room could last forever
        self.fifo.write(data, self.nonblock || !self.running)
    }

    fn stop(&mut self) -> bool {
        self.running = false;
        self.commands.send(Command::Pause).is_ok()
    }

    fn start(&mut self, _is_shutdown: bool) -> bool {
        self.running = true;
        self.commands.send(Command::Play).is_ok()
    }

    fn alive(&self) -> bool {
        self.running && !self.fifo.is_dead()
    }

    fn set_nonblock_state(&mut self, nonblock: bool) {
        self.nonblock = nonblock;
    }

    fn use_float(&self) -> bool {
        true
    }

    fn write_avail(&self) -> Option<usize> {
        Some(self.fifo.write_avail())
    }

    fn buffer_size(&self) -> Option<usize> {
        Some(self.fifo.capacity() - 1)
    }
}

impl Drop for RodioDriver {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        // A writer blocked on a full FIFO must not outlive the stream
        self.fifo.mark_dead();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("[Audio] rodio output thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rodio_driver_roundtrip() {
        let mut driver = match RodioDriver::new(&DriverParams::new(48_000, 64)) {
            Ok(driver) => driver,
            Err(err) => {
                eprintln!("Skipping rodio driver test (audio backend unavailable): {err}");
                return;
            }
        };

        assert!(driver.use_float());
        driver.set_nonblock_state(true);
        let silence = vec![0u8; 1024 * FRAME_BYTES];
        assert!(driver.write(&silence).unwrap() > 0);
        assert!(driver.stop());
        assert!(driver.start(false));
    }

    #[test]
    fn test_source_plays_silence_on_underrun() {
        let fifo = Arc::new(SharedFifo::new(4096).unwrap());
        let samples = [0.5f32, -0.5];
        fifo.write(crate::convert::as_bytes(&samples), true).unwrap();

        let mut source = FifoSource::new(Arc::clone(&fifo), 48_000);
        assert_eq!(source.next(), Some(0.5));
        assert_eq!(source.next(), Some(-0.5));
        assert_eq!(source.next(), Some(0.0));

        fifo.mark_dead();
        // Rest of the current batch, then the end of the stream
        let remaining = source.by_ref().count();
        assert_eq!(remaining, BATCH_SAMPLES - 3);
    }
}
