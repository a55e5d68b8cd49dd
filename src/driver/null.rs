//! Null audio driver
//!
//! Plays nothing, but behaves like a device with a buffer of the requested
//! latency that drains in real time. Blocking writes wait for room, so a
//! frontend synced to audio still runs at the right speed, and the reported
//! fill lets rate control work headless.

use super::{AudioDriver, DriverParams, OpenedDriver};
use crate::Result;
use std::thread;
use std::time::{Duration, Instant};

/// Registry name
pub const IDENT: &str = "null";

/// Rate used when the caller asks for 0 Hz
const FALLBACK_RATE: u32 = 48_000;

/// Latency used when the caller asks for 0 ms
const FALLBACK_LATENCY_MS: u32 = 64;

/// Interleaved stereo `i16`
const FRAME_BYTES: usize = 4;

/// Clocked discard
#[derive(Debug)]
pub struct NullDriver {
    rate: u32,
    buffer_bytes: usize,
    nonblock: bool,
    running: bool,
    /// Time at which everything written so far has "played"
    deadline: Option<Instant>,
}

impl NullDriver {
    /// Create the driver at `rate` with a buffer of `latency_ms`
    pub fn new(rate: u32, latency_ms: u32) -> Self {
        let rate = if rate == 0 { FALLBACK_RATE } else { rate };
        let latency_ms = if latency_ms == 0 {
            FALLBACK_LATENCY_MS
        } else {
            latency_ms
        };
        let frames = (u64::from(rate) * u64::from(latency_ms) / 1000).max(1) as usize;
        NullDriver {
            rate,
            buffer_bytes: frames * FRAME_BYTES,
            nonblock: false,
            running: true,
            deadline: None,
        }
    }

    /// Registry factory
    pub fn open(params: &DriverParams) -> Result<OpenedDriver> {
        let driver = NullDriver::new(params.rate, params.latency_ms);
        let rate = driver.rate;
        Ok(OpenedDriver {
            driver: Box::new(driver),
            rate,
        })
    }

    fn duration_of(&self, bytes: usize) -> Duration {
        let frames = (bytes / FRAME_BYTES) as u64;
        Duration::from_nanos(frames * 1_000_000_000 / u64::from(self.rate))
    }

    fn queued_bytes(&self, now: Instant) -> usize {
        let Some(deadline) = self.deadline else {
            return 0;
        };
        let pending = deadline.saturating_duration_since(now);
        let frames = pending.as_nanos() * u128::from(self.rate) / 1_000_000_000;
        (frames as usize * FRAME_BYTES).min(self.buffer_bytes)
    }

    /// Queue `bytes` behind what is already playing
    fn enqueue(&mut self, now: Instant, bytes: usize) -> Instant {
        // Resync after a stall instead of racing to catch up
        let start = match self.deadline {
            Some(deadline) if deadline > now => deadline,
            _ => now,
        };
        let deadline = start + self.duration_of(bytes);
        self.deadline = Some(deadline);
        deadline
    }
}

impl AudioDriver for NullDriver {
    fn ident(&self) -> &'static str {
        IDENT
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.running {
            return Ok(data.len());
        }

        let now = Instant::now();
        if self.nonblock {
            let room = self.buffer_bytes - self.queued_bytes(now);
            let accepted = room.min(data.len()) / FRAME_BYTES * FRAME_BYTES;
            if accepted > 0 {
                self.enqueue(now, accepted);
            }
            return Ok(accepted);
        }

        let deadline = self.enqueue(now, data.len());
        // Return once the buffer has room for what was just written
        if let Some(wait_until) = deadline.checked_sub(self.duration_of(self.buffer_bytes)) {
            if wait_until > now {
                thread::sleep(wait_until - now);
            }
        }
        Ok(data.len())
    }

    fn stop(&mut self) -> bool {
        self.running = false;
        self.deadline = None;
        true
    }

    fn start(&mut self, _is_shutdown: bool) -> bool {
        self.running = true;
        true
    }

    fn alive(&self) -> bool {
        self.running
    }

    fn set_nonblock_state(&mut self, nonblock: bool) {
        self.nonblock = nonblock;
    }

    fn use_float(&self) -> bool {
        false
    }

    fn write_avail(&self) -> Option<usize> {
        Some(self.buffer_bytes - self.queued_bytes(Instant::now()))
    }

    fn buffer_size(&self) -> Option<usize> {
        Some(self.buffer_bytes)
    }
}
