//! Reverse playback buffer
//!
//! While the frontend rewinds, the core re-runs each frame and produces its
//! audio forwards. Those frames are stored back to front so that, at the end
//! of the video frame, the buffer holds the frame's audio in reverse and can be
//! played through the normal output path.

/// Frame-reversing sample store
#[derive(Debug, Clone)]
pub struct RewindBuffer {
    /// Interleaved stereo, filled from the end towards the start
    samples: Vec<i16>,
    /// Index of the oldest stored sample; `samples.len()` when empty
    start: usize,
    dropped_frames: u64,
}

impl RewindBuffer {
    /// Create a buffer holding up to `capacity_frames` stereo frames
    pub fn new(capacity_frames: usize) -> Self {
        let len = capacity_frames * 2;
        RewindBuffer {
            samples: vec![0; len],
            start: len,
            dropped_frames: 0,
        }
    }

    /// Capacity in frames
    pub fn capacity_frames(&self) -> usize {
        self.samples.len() / 2
    }

    /// Frames currently stored
    pub fn len_frames(&self) -> usize {
        (self.samples.len() - self.start) / 2
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.start == self.samples.len()
    }

    /// Frames discarded because the buffer was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Store one frame in front of the previous ones; returns false when full
    pub fn push_frame(&mut self, left: i16, right: i16) -> bool {
        if self.start < 2 {
            self.dropped_frames += 1;
            return false;
        }
        self.start -= 2;
        self.samples[self.start] = left;
        self.samples[self.start + 1] = right;
        true
    }

    /// Store interleaved stereo frames; returns how many were kept
    pub fn push_batch(&mut self, data: &[i16]) -> usize {
        let mut kept = 0;
        for frame in data.chunks_exact(2) {
            if self.push_frame(frame[0], frame[1]) {
                kept += 1;
            }
        }
        kept
    }

    /// Append the stored frames (newest first) to `out` and empty the buffer
    pub fn flush_into(&mut self, out: &mut Vec<i16>) {
        out.extend_from_slice(&self.samples[self.start..]);
        self.clear();
    }

    /// Drop everything stored
    pub fn clear(&mut self) {
        self.start = self.samples.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_come_out_reversed() {
        let mut rb = RewindBuffer::new(16);
        rb.push_frame(1, -1);
        rb.push_batch(&[2, -2, 3, -3]);
        assert_eq!(rb.len_frames(), 3);

        let mut out = Vec::new();
        rb.flush_into(&mut out);
        // Channel order inside each frame is kept
        assert_eq!(out, vec![3, -3, 2, -2, 1, -1]);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_full_buffer_drops_newest() {
        let mut rb = RewindBuffer::new(2);
        assert_eq!(rb.push_batch(&[1, 1, 2, 2, 3, 3, 4, 4]), 2);
        assert!(!rb.push_frame(5, 5));
        assert_eq!(rb.dropped_frames(), 3);

        let mut out = Vec::new();
        rb.flush_into(&mut out);
        assert_eq!(out, vec![2, 2, 1, 1]);
    }

    #[test]
    fn test_flush_appends() {
        let mut rb = RewindBuffer::new(4);
        let mut out = vec![9, 9];
        rb.push_frame(7, 8);
        rb.flush_into(&mut out);
        assert_eq!(out, vec![9, 9, 7, 8]);
    }
}
