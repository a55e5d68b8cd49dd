//! Ring buffer shared between a producer and one consumer thread
//!
//! The ring buffer and the worker state live behind a single mutex. One
//! condvar carries both "space became available" and "data became available"
//! signals; every waiter re-checks its condition in a loop, so sharing the
//! condvar between the two directions is safe. Blocking waits always release
//! the lock, and no device call is ever made while it is held.

use crate::ring_buffer::RingBuffer;
use crate::worker::WorkerState;
use crate::{AudioError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// State guarded by the FIFO lock
#[derive(Debug)]
pub struct FifoState {
    ring: RingBuffer,
    worker: WorkerState,
}

impl FifoState {
    /// Ring buffer (read-only view)
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Ring buffer (mutable view)
    pub fn ring_mut(&mut self) -> &mut RingBuffer {
        &mut self.ring
    }

    /// Lifecycle state of the attached worker
    pub fn worker(&self) -> WorkerState {
        self.worker
    }

    /// Move the attached worker to a new state
    pub fn set_worker(&mut self, state: WorkerState) {
        self.worker = state;
    }

    /// True once the consumer is going away; writers must stop waiting
    pub fn is_dead(&self) -> bool {
        matches!(self.worker, WorkerState::Draining | WorkerState::Dead)
    }
}

/// Mutex + condvar guarded ring buffer
#[derive(Debug)]
pub struct SharedFifo {
    state: Mutex<FifoState>,
    cond: Condvar,
}

impl SharedFifo {
    /// Create a FIFO with the given byte capacity (including the reserved slot)
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(SharedFifo {
            state: Mutex::new(FifoState {
                ring: RingBuffer::new(capacity)?,
                worker: WorkerState::Idle,
            }),
            cond: Condvar::new(),
        })
    }

    /// Acquire the FIFO lock
    pub fn lock(&self) -> MutexGuard<'_, FifoState> {
        self.state.lock()
    }

    /// Wait for a signal, releasing the lock while blocked
    pub fn wait(&self, guard: &mut MutexGuard<'_, FifoState>) {
        self.cond.wait(guard);
    }

    /// Wait for a signal or until `timeout` elapses; returns true on timeout
    pub fn wait_for(&self, guard: &mut MutexGuard<'_, FifoState>, timeout: Duration) -> bool {
        self.cond.wait_for(guard, timeout).timed_out()
    }

    /// Wake every waiter
    pub fn notify(&self) {
        self.cond.notify_all();
    }

    /// Write bytes from the producer side
    ///
    /// Nonblocking writes copy `min(available, data.len())` and return at once.
    /// Blocking writes wait on the condvar while the buffer is full until all of
    /// `data` is queued.
    ///
    /// # Errors
    ///
    /// [`AudioError::DriverDead`] if the consumer is dead on entry, or dies
    /// while a blocking write is waiting.
    pub fn write(&self, data: &[u8], nonblock: bool) -> Result<usize> {
        let mut state = self.lock();
        if state.is_dead() {
            return Err(AudioError::DriverDead);
        }

        if nonblock {
            let written = state.ring.write(data);
            drop(state);
            if written > 0 {
                self.notify();
            }
            return Ok(written);
        }

        let mut written = 0;
        while written < data.len() {
            if state.is_dead() {
                return Err(AudioError::DriverDead);
            }
            if state.ring.available_to_write() == 0 {
                self.wait(&mut state);
                continue;
            }
            written += state.ring.write(&data[written..]);
            self.notify();
        }
        Ok(written)
    }

    /// Read bytes from the consumer side of a capture FIFO
    ///
    /// Mirror image of [`SharedFifo::write`]: blocking reads wait until `dest`
    /// is filled.
    pub fn read(&self, dest: &mut [u8], nonblock: bool) -> Result<usize> {
        let mut state = self.lock();
        if state.is_dead() {
            return Err(AudioError::DriverDead);
        }

        if nonblock {
            let read = state.ring.read(dest);
            drop(state);
            if read > 0 {
                self.notify();
            }
            return Ok(read);
        }

        let mut read = 0;
        while read < dest.len() {
            if state.is_dead() {
                return Err(AudioError::DriverDead);
            }
            if state.ring.is_empty() {
                self.wait(&mut state);
                continue;
            }
            read += state.ring.read(&mut dest[read..]);
            self.notify();
        }
        Ok(read)
    }

    /// Fill one device period from the buffer
    ///
    /// Copies `min(period.len(), available)` bytes under the lock, signals the
    /// producer, then zero-fills the remainder outside the lock so an underrun
    /// plays silence instead of stale data. Returns the number of real bytes.
    pub fn read_period(&self, period: &mut [u8]) -> usize {
        let filled = {
            let mut state = self.lock();
            let filled = state.ring.read(period);
            self.notify();
            filled
        };

        period[filled..].fill(0);
        filled
    }

    /// Queue bytes captured by a device worker, dropping what does not fit
    pub fn push_captured(&self, data: &[u8]) -> usize {
        let written = self.lock().ring.write(data);
        self.notify();
        written
    }

    /// Snapshot of writable bytes
    pub fn write_avail(&self) -> usize {
        self.lock().ring.available_to_write()
    }

    /// Snapshot of readable bytes
    pub fn read_avail(&self) -> usize {
        self.lock().ring.available_to_read()
    }

    /// Capacity in bytes, including the reserved slot
    pub fn capacity(&self) -> usize {
        self.lock().ring.capacity()
    }

    /// Snapshot of the fill fraction
    pub fn fill_fraction(&self) -> f64 {
        self.lock().ring.fill_fraction()
    }

    /// Mark the consumer dead and wake every waiter
    pub fn mark_dead(&self) {
        self.lock().worker = WorkerState::Dead;
        self.notify();
    }

    /// True once the consumer is draining or dead
    pub fn is_dead(&self) -> bool {
        self.lock().is_dead()
    }

    /// Drop all queued data
    pub fn clear(&self) {
        self.lock().ring.clear();
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_nonblocking_write_returns_short_count() {
        let fifo = SharedFifo::new(16).unwrap();
        assert_eq!(fifo.write(&[1u8; 40], true).unwrap(), 15);
        assert_eq!(fifo.write_avail(), 0);
        assert_eq!(fifo.write(&[1u8; 4], true).unwrap(), 0);
    }

    #[test]
    fn test_blocking_write_waits_for_consumer() {
        const TICK_BYTES: usize = 256;
        let fifo = Arc::new(SharedFifo::new(1024).unwrap());
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();

        let (done_tx, done_rx) = mpsc::channel();
        let producer = {
            let fifo = Arc::clone(&fifo);
            let data = data.clone();
            thread::spawn(move || {
                let written = fifo.write(&data, false).unwrap();
                done_tx.send(written).unwrap();
            })
        };

        let mut received = Vec::new();
        let mut ticks = 0;
        let completed_after = loop {
            thread::sleep(Duration::from_millis(20));
            if let Ok(written) = done_rx.try_recv() {
                assert_eq!(written, 2048);
                break ticks;
            }
            let mut chunk = [0u8; TICK_BYTES];
            let read = fifo.lock().ring_mut().read(&mut chunk);
            fifo.notify();
            received.extend_from_slice(&chunk[..read]);
            ticks += 1;
            assert!(ticks < 100, "producer never completed");
        };
        producer.join().unwrap();

        assert!(completed_after >= 2, "completed after {completed_after} ticks");
        let mut rest = vec![0u8; fifo.read_avail()];
        fifo.lock().ring_mut().read(&mut rest);
        received.extend_from_slice(&rest);
        assert_eq!(received, data);
    }

    #[test]
    fn test_read_period_zero_fills_underrun() {
        let fifo = SharedFifo::new(1024).unwrap();
        fifo.write(&[0xABu8; 200], true).unwrap();

        let mut period = [0xFFu8; 512];
        assert_eq!(fifo.read_period(&mut period), 200);
        assert!(period[..200].iter().all(|&b| b == 0xAB));
        assert!(period[200..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dead_fifo_wakes_blocked_writer() {
        let fifo = Arc::new(SharedFifo::new(8).unwrap());
        fifo.write(&[0u8; 7], true).unwrap();

        let writer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || fifo.write(&[1u8; 4], false))
        };
        thread::sleep(Duration::from_millis(20));
        fifo.mark_dead();

        let result = writer.join().unwrap();
        assert!(matches!(result, Err(AudioError::DriverDead)));
    }

    #[test]
    fn test_blocking_read_waits_for_capture() {
        let fifo = Arc::new(SharedFifo::new(64).unwrap());
        let reader = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                let mut dest = [0u8; 8];
                let read = fifo.read(&mut dest, false).unwrap();
                (read, dest)
            })
        };

        thread::sleep(Duration::from_millis(10));
        fifo.push_captured(&[3u8; 5]);
        thread::sleep(Duration::from_millis(10));
        fifo.push_captured(&[4u8; 5]);

        let (read, dest) = reader.join().unwrap();
        assert_eq!(read, 8);
        assert_eq!(dest, [3, 3, 3, 3, 3, 4, 4, 4]);
        assert_eq!(fifo.read_avail(), 2);
    }
}
