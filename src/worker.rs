//! Device worker threads
//!
//! A playback worker owns a device sink and drains a [`SharedFifo`] into it one
//! period at a time; a capture worker does the reverse for microphones. Both
//! follow the same lifecycle:
//!
//! ```text
//! Idle --spawn--> Running --stop()--> Draining --join--> Dead
//!                    |                                    ^
//!                    +---------- fatal device error ------+
//! ```
//!
//! The state lives in the FIFO's lock so producers blocked on the condvar see
//! a dying worker as soon as they wake up.

use crate::fifo::SharedFifo;
use crate::{AudioError, Result};
use log::{error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Lifecycle of a device worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No worker attached yet
    Idle,
    /// Worker loop is running
    Running,
    /// Stop was requested; the loop exits after the current device call
    Draining,
    /// Worker has exited (stopped or failed)
    Dead,
}

/// Error reported by a device sink or source
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Underrun, overrun, interrupted call or suspended stream; recoverable
    #[error("transient device error: {0}")]
    Transient(String),

    /// Unrecoverable device failure
    #[error("fatal device error: {0}")]
    Fatal(String),
}

impl From<DeviceError> for AudioError {
    fn from(err: DeviceError) -> Self {
        AudioError::Device(err.to_string())
    }
}

/// Hardware end of a playback worker
pub trait PeriodSink: Send {
    /// Write one full period; blocks for as long as the device needs
    fn write_period(&mut self, period: &[u8]) -> std::result::Result<(), DeviceError>;

    /// Try to bring the device back after a transient error
    fn recover(&mut self, err: &DeviceError) -> std::result::Result<(), DeviceError> {
        Err(err.clone())
    }
}

impl<S: PeriodSink + ?Sized> PeriodSink for Box<S> {
    fn write_period(&mut self, period: &[u8]) -> std::result::Result<(), DeviceError> {
        (**self).write_period(period)
    }

    fn recover(&mut self, err: &DeviceError) -> std::result::Result<(), DeviceError> {
        (**self).recover(err)
    }
}

/// Hardware end of a capture worker
pub trait CaptureSource: Send {
    /// Read up to one period; blocks for as long as the device needs
    fn read_period(&mut self, period: &mut [u8]) -> std::result::Result<usize, DeviceError>;

    /// Try to bring the device back after a transient error
    fn recover(&mut self, err: &DeviceError) -> std::result::Result<(), DeviceError> {
        Err(err.clone())
    }
}

impl<S: CaptureSource + ?Sized> CaptureSource for Box<S> {
    fn read_period(&mut self, period: &mut [u8]) -> std::result::Result<usize, DeviceError> {
        (**self).read_period(period)
    }

    fn recover(&mut self, err: &DeviceError) -> std::result::Result<(), DeviceError> {
        (**self).recover(err)
    }
}

/// Handle to a running worker thread
#[derive(Debug)]
struct WorkerHandle {
    fifo: Arc<SharedFifo>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn spawn<F>(name: &str, fifo: Arc<SharedFifo>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        // Running must be visible before the loop checks it
        fifo.lock().set_worker(WorkerState::Running);

        match thread::Builder::new().name(name.to_string()).spawn(body) {
            Ok(thread) => Ok(WorkerHandle {
                fifo,
                thread: Some(thread),
            }),
            Err(e) => {
                fifo.mark_dead();
                Err(AudioError::Thread(format!("Failed to spawn {name}: {e}")))
            }
        }
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        {
            let mut state = self.fifo.lock();
            if state.worker() == WorkerState::Running {
                state.set_worker(WorkerState::Draining);
            }
        }
        self.fifo.notify();

        if thread.join().is_err() {
            error!("[Audio] Worker thread panicked");
        }
        self.fifo.mark_dead();
    }

    fn state(&self) -> WorkerState {
        self.fifo.lock().worker()
    }
}

fn is_running(fifo: &SharedFifo) -> bool {
    fifo.lock().worker() == WorkerState::Running
}

fn die(fifo: &SharedFifo) {
    fifo.mark_dead();
}

/// Consumer thread draining a FIFO into a playback device
#[derive(Debug)]
pub struct PlaybackWorker {
    handle: WorkerHandle,
    paused: Arc<AtomicBool>,
}

impl PlaybackWorker {
    /// Spawn the worker; it writes `period_bytes` to `sink` per iteration
    pub fn spawn<S>(name: &str, fifo: Arc<SharedFifo>, sink: S, period_bytes: usize) -> Result<Self>
    where
        S: PeriodSink + 'static,
    {
        if period_bytes == 0 {
            return Err(AudioError::Config("Period size must be non-zero".into()));
        }

        let paused = Arc::new(AtomicBool::new(false));
        let loop_fifo = Arc::clone(&fifo);
        let loop_paused = Arc::clone(&paused);
        let thread_name = name.to_string();
        let handle = WorkerHandle::spawn(name, fifo, move || {
            playback_loop(&thread_name, &loop_fifo, sink, period_bytes, &loop_paused)
        })?;

        Ok(PlaybackWorker { handle, paused })
    }

    /// Stop feeding the device until resumed; the thread stays alive
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        self.handle.fifo.notify();
    }

    /// Whether the worker is paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    /// Set the dead flag, wake blocked producers and join the thread
    ///
    /// Safe to call while the worker is inside a device write: the call returns
    /// once that write completes and the loop observes the flag.
    pub fn stop(&mut self) {
        self.handle.stop();
    }
}

impl Drop for PlaybackWorker {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

fn playback_loop<S: PeriodSink>(
    name: &str,
    fifo: &SharedFifo,
    mut sink: S,
    period_bytes: usize,
    paused: &AtomicBool,
) {
    let mut period = vec![0u8; period_bytes];
    // Paused workers poll at roughly the rate a short period would play
    let idle_wait = Duration::from_millis(5);

    while is_running(fifo) {
        if paused.load(Ordering::Acquire) {
            let mut state = fifo.lock();
            if state.worker() == WorkerState::Running {
                fifo.wait_for(&mut state, idle_wait);
            }
            continue;
        }

        fifo.read_period(&mut period);

        match sink.write_period(&period) {
            Ok(()) => {}
            Err(err @ DeviceError::Transient(_)) => {
                if let Err(recover_err) = sink.recover(&err) {
                    error!("[Audio] [{name}] Failed to recover from error: {recover_err}");
                    break;
                }
                warn!("[Audio] [{name}] Recovered from {err}");
            }
            Err(err) => {
                error!("[Audio] [{name}] Error writing audio to device: {err}");
                break;
            }
        }
    }

    die(fifo);
}

/// Producer thread filling a FIFO from a capture device
#[derive(Debug)]
pub struct CaptureWorker {
    handle: WorkerHandle,
    enabled: Arc<AtomicBool>,
    suspended: Arc<AtomicBool>,
}

impl CaptureWorker {
    /// Spawn the worker; it reads up to `period_bytes` from `source` per iteration
    pub fn spawn<S>(
        name: &str,
        fifo: Arc<SharedFifo>,
        source: S,
        period_bytes: usize,
    ) -> Result<Self>
    where
        S: CaptureSource + 'static,
    {
        if period_bytes == 0 {
            return Err(AudioError::Config("Period size must be non-zero".into()));
        }

        let enabled = Arc::new(AtomicBool::new(true));
        let suspended = Arc::new(AtomicBool::new(false));
        let loop_fifo = Arc::clone(&fifo);
        let loop_enabled = Arc::clone(&enabled);
        let loop_suspended = Arc::clone(&suspended);
        let thread_name = name.to_string();
        let handle = WorkerHandle::spawn(name, fifo, move || {
            capture_loop(
                &thread_name,
                &loop_fifo,
                source,
                period_bytes,
                &loop_enabled,
                &loop_suspended,
            )
        })?;

        Ok(CaptureWorker {
            handle,
            enabled,
            suspended,
        })
    }

    /// Enable or disable recording (the microphone's own switch)
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether the microphone's own switch is on
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Shared flag the owning driver flips on stop/start
    pub fn suspend_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.suspended)
    }

    /// Whether captured audio is currently being queued
    pub fn is_recording(&self) -> bool {
        self.is_enabled() && !self.suspended.load(Ordering::Acquire)
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    /// Set the dead flag, wake blocked readers and join the thread
    pub fn stop(&mut self) {
        self.handle.stop();
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

fn capture_loop<S: CaptureSource>(
    name: &str,
    fifo: &SharedFifo,
    mut source: S,
    period_bytes: usize,
    enabled: &AtomicBool,
    suspended: &AtomicBool,
) {
    let mut period = vec![0u8; period_bytes];

    while is_running(fifo) {
        // The device is read even while disabled so it never overruns
        match source.read_period(&mut period) {
            Ok(read) => {
                if enabled.load(Ordering::Acquire) && !suspended.load(Ordering::Acquire) {
                    fifo.push_captured(&period[..read]);
                }
            }
            Err(err @ DeviceError::Transient(_)) => {
                if let Err(recover_err) = source.recover(&err) {
                    error!("[Audio] [{name}] Failed to recover from read error: {recover_err}");
                    break;
                }
                warn!("[Audio] [{name}] Recovered from {err}");
            }
            Err(err) => {
                error!("[Audio] [{name}] Read error: {err}");
                break;
            }
        }
    }

    die(fifo);
}
