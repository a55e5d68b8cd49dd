//! Byte ring buffer between sample production and device consumption
//!
//! A fixed-capacity FIFO with separate read and write cursors. One slot is
//! always kept free so a full buffer can be told apart from an empty one:
//! `available_to_read() + available_to_write() == capacity() - 1`.
//!
//! The buffer carries no locking and never blocks. Sharing between threads
//! goes through [`crate::fifo::SharedFifo`], which adds the mutex, condvar and
//! dead flag around it.

use crate::{AudioError, Result};

/// Largest capacity accepted by [`RingBuffer::new`] (512 MB)
pub const MAX_CAPACITY: usize = 512 * 1024 * 1024;

/// Fixed-capacity byte FIFO
#[derive(Debug)]
pub struct RingBuffer {
    /// Backing storage
    buffer: Box<[u8]>,
    /// Write cursor (producer), always < capacity
    write_pos: usize,
    /// Read cursor (consumer), always < capacity
    read_pos: usize,
}

impl RingBuffer {
    /// Create a new ring buffer holding at most `capacity - 1` bytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Requested capacity is below 2 (no usable byte once the reserved slot is taken)
    /// - Requested capacity exceeds [`MAX_CAPACITY`]
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(AudioError::Allocation(format!(
                "Ring buffer capacity must be at least 2 bytes, got {capacity}"
            )));
        }

        if capacity > MAX_CAPACITY {
            return Err(AudioError::Allocation(format!(
                "Ring buffer capacity {capacity} exceeds maximum safe size {MAX_CAPACITY}"
            )));
        }

        Ok(RingBuffer {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0,
        })
    }

    /// Total capacity in bytes, including the reserved slot
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of bytes that can be read
    pub fn available_to_read(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.capacity() - (self.read_pos - self.write_pos)
        }
    }

    /// Number of bytes that can be written without overwriting unread data
    pub fn available_to_write(&self) -> usize {
        self.capacity() - self.available_to_read() - 1
    }

    /// Fraction of the capacity currently holding unread data (0.0 to 1.0)
    pub fn fill_fraction(&self) -> f64 {
        self.available_to_read() as f64 / self.capacity() as f64
    }

    /// Check if there is nothing to read
    pub fn is_empty(&self) -> bool {
        self.write_pos == self.read_pos
    }

    /// Check if no more bytes can be written
    pub fn is_full(&self) -> bool {
        self.available_to_write() == 0
    }

    /// Write bytes to the buffer
    ///
    /// Returns the number of bytes actually copied, which is less than
    /// `data.len()` when the buffer fills up.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.available_to_write());
        if to_write == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first_part = to_write.min(capacity - self.write_pos);
        self.buffer[self.write_pos..self.write_pos + first_part]
            .copy_from_slice(&data[..first_part]);
        // Wrap-around
        if first_part < to_write {
            self.buffer[..to_write - first_part].copy_from_slice(&data[first_part..to_write]);
        }

        self.write_pos = (self.write_pos + to_write) % capacity;
        to_write
    }

    /// Copy the oldest unread bytes into `dest` without consuming them
    pub fn peek(&self, dest: &mut [u8]) -> usize {
        let to_read = dest.len().min(self.available_to_read());
        if to_read == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first_part = to_read.min(capacity - self.read_pos);
        dest[..first_part].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + first_part]);
        if first_part < to_read {
            dest[first_part..to_read].copy_from_slice(&self.buffer[..to_read - first_part]);
        }

        to_read
    }

    /// Discard up to `count` unread bytes, returning how many were dropped
    pub fn consume(&mut self, count: usize) -> usize {
        let count = count.min(self.available_to_read());
        self.read_pos = (self.read_pos + count) % self.capacity();
        count
    }

    /// Read the oldest unread bytes into `dest`
    ///
    /// Returns the number of bytes copied.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let read = self.peek(dest);
        self.consume(read)
    }

    /// Drop all unread data
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}
