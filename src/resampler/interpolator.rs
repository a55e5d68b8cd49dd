//! Generic fixed-tap interpolating resampler

use super::AudioResampler;
use std::marker::PhantomData;

/// Interpolation kernel over `TAPS` consecutive frames
///
/// The interpolated point lies between tap `TAPS / 2 - 1` and tap `TAPS / 2`,
/// `frac` of the way from the former to the latter.
pub trait Kernel: Send + 'static {
    /// Number of input frames the kernel reads per output frame
    const TAPS: usize;
    /// Identifier reported by the resampler
    const IDENT: &'static str;

    /// Fill `weights` (length `TAPS`) for a fractional offset in `[0, 1)`
    fn weights(frac: f64, weights: &mut [f32]);
}

/// Resampler driving a [`Kernel`] across block boundaries
///
/// The last `TAPS - 1` frames of each block are carried over as history and
/// `pos` (the read position into history + block) survives the call, so block
/// boundaries are invisible in the output.
#[derive(Debug, Clone)]
pub struct InterpolatingResampler<K: Kernel> {
    channels: usize,
    /// Read position relative to the start of the history
    pos: f64,
    /// Last `TAPS - 1` interleaved frames of the previous block
    history: Vec<f32>,
    /// History followed by the current block
    work: Vec<f32>,
    weights: Vec<f32>,
    _kernel: PhantomData<K>,
}

impl<K: Kernel> InterpolatingResampler<K> {
    /// Create a resampler for `channels` interleaved channels (at least 1)
    pub fn new(channels: usize) -> Self {
        let channels = channels.max(1);
        InterpolatingResampler {
            channels,
            pos: 0.0,
            history: vec![0.0; (K::TAPS - 1) * channels],
            work: Vec::new(),
            weights: vec![0.0; K::TAPS],
            _kernel: PhantomData,
        }
    }

    /// Current fractional read position (for diagnostics)
    pub fn phase(&self) -> f64 {
        self.pos
    }
}

fn sanitize_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() && ratio > 0.0 {
        ratio
    } else {
        1.0
    }
}

impl<K: Kernel> AudioResampler for InterpolatingResampler<K> {
    fn ident(&self) -> &'static str {
        K::IDENT
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn process(&mut self, input: &[f32], ratio: f64, output: &mut Vec<f32>) {
        let ch = self.channels;
        let frames = input.len() / ch;
        if frames == 0 {
            return;
        }

        let step = 1.0 / sanitize_ratio(ratio);

        self.work.clear();
        self.work.extend_from_slice(&self.history);
        self.work.extend_from_slice(&input[..frames * ch]);
        let total = self.work.len() / ch;

        output.reserve(((frames as f64 / step) as usize + 1) * ch);

        loop {
            let base = self.pos.floor() as usize;
            if base + K::TAPS > total {
                break;
            }

            K::weights(self.pos - base as f64, &mut self.weights);
            let window = &self.work[base * ch..(base + K::TAPS) * ch];
            for c in 0..ch {
                let sample = self
                    .weights
                    .iter()
                    .enumerate()
                    .map(|(tap, w)| w * window[tap * ch + c])
                    .sum();
                output.push(sample);
            }

            self.pos += step;
        }

        // Rebase onto the new history
        self.pos -= frames as f64;
        let keep = self.history.len();
        self.history
            .copy_from_slice(&self.work[self.work.len() - keep..]);
    }

    fn reset(&mut self) {
        self.pos = 0.0;
        self.history.fill(0.0);
    }
}
