//! Phase-continuous sample rate conversion
//!
//! Every resampler keeps its fractional read position and the last few input
//! frames between calls, so a stream fed in arbitrary block sizes (with the
//! ratio changing from block to block) comes out identical to the same stream
//! fed in one piece. Nothing is reset behind the caller's back.
//!
//! Three interpolation kernels are available, picked through
//! [`ResamplerQuality`]:
//!
//! | Quality | Kernel | Taps |
//! |---|---|---|
//! | `Lowest`, `Lower` | linear | 2 |
//! | `Normal` | cubic (Catmull-Rom) | 4 |
//! | `Higher`, `Highest` | windowed sinc (Lanczos, a = 4) | 8 |

mod cubic;
mod interpolator;
mod linear;
mod sinc;

pub use cubic::CatmullRom;
pub use interpolator::{InterpolatingResampler, Kernel};
pub use linear::Linear;
pub use sinc::Lanczos;

use crate::{AudioError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Linear resampler
pub type LinearResampler = InterpolatingResampler<Linear>;
/// Catmull-Rom cubic resampler
pub type CubicResampler = InterpolatingResampler<CatmullRom>;
/// Lanczos windowed-sinc resampler
pub type SincResampler = InterpolatingResampler<Lanczos>;

/// Stateful converter from the core's rate to the device rate
pub trait AudioResampler: Send {
    /// Short identifier ("linear", "cubic", "sinc")
    fn ident(&self) -> &'static str;

    /// Number of interleaved channels per frame
    fn channels(&self) -> usize;

    /// Resample interleaved `input`, appending the result to `output`
    ///
    /// `ratio` is output rate / input rate; roughly `frames * ratio` frames are
    /// appended. Non-positive or non-finite ratios are treated as 1.0. A
    /// trailing partial frame in `input` is ignored.
    fn process(&mut self, input: &[f32], ratio: f64, output: &mut Vec<f32>);

    /// Drop the kernel history and phase
    fn reset(&mut self);
}

/// Resampler quality setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResamplerQuality {
    /// Linear interpolation
    Lowest,
    /// Linear interpolation
    Lower,
    /// Cubic interpolation
    #[default]
    Normal,
    /// Windowed sinc
    Higher,
    /// Windowed sinc
    Highest,
}

impl ResamplerQuality {
    /// Identifier of the kernel this quality maps to
    pub fn kernel_ident(self) -> &'static str {
        match self {
            ResamplerQuality::Lowest | ResamplerQuality::Lower => Linear::IDENT,
            ResamplerQuality::Normal => CatmullRom::IDENT,
            ResamplerQuality::Higher | ResamplerQuality::Highest => Lanczos::IDENT,
        }
    }
}

impl fmt::Display for ResamplerQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResamplerQuality::Lowest => "lowest",
            ResamplerQuality::Lower => "lower",
            ResamplerQuality::Normal => "normal",
            ResamplerQuality::Higher => "higher",
            ResamplerQuality::Highest => "highest",
        };
        f.write_str(name)
    }
}

impl FromStr for ResamplerQuality {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lowest" => Ok(ResamplerQuality::Lowest),
            "lower" => Ok(ResamplerQuality::Lower),
            "normal" => Ok(ResamplerQuality::Normal),
            "higher" => Ok(ResamplerQuality::Higher),
            "highest" => Ok(ResamplerQuality::Highest),
            other => Err(AudioError::Config(format!(
                "Unknown resampler quality '{other}'"
            ))),
        }
    }
}

/// Create the resampler for a quality setting
pub fn create(quality: ResamplerQuality, channels: usize) -> Box<dyn AudioResampler> {
    match quality {
        ResamplerQuality::Lowest | ResamplerQuality::Lower => {
            Box::new(LinearResampler::new(channels))
        }
        ResamplerQuality::Normal => Box::new(CubicResampler::new(channels)),
        ResamplerQuality::Higher | ResamplerQuality::Highest => {
            Box::new(SincResampler::new(channels))
        }
    }
}

/// Create a resampler by kernel identifier
///
/// # Errors
///
/// [`AudioError::Config`] if no kernel is called `ident`.
pub fn create_by_ident(ident: &str, channels: usize) -> Result<Box<dyn AudioResampler>> {
    match ident {
        Linear::IDENT => Ok(Box::new(LinearResampler::new(channels))),
        CatmullRom::IDENT => Ok(Box::new(CubicResampler::new(channels))),
        Lanczos::IDENT => Ok(Box::new(SincResampler::new(channels))),
        other => Err(AudioError::Config(format!("Unknown resampler '{other}'"))),
    }
}

/// Identifiers accepted by [`create_by_ident`]
pub fn idents() -> [&'static str; 3] {
    [
        Linear::IDENT,
        CatmullRom::IDENT,
        Lanczos::IDENT,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(frames: usize, channels: usize, freq: f32, rate: f32) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let v = 0.5 * (2.0 * PI * freq * i as f32 / rate).sin();
                std::iter::repeat(v).take(channels)
            })
            .collect()
    }

    #[test]
    fn test_quality_mapping() {
        assert_eq!(create(ResamplerQuality::Lowest, 2).ident(), "linear");
        assert_eq!(create(ResamplerQuality::Lower, 2).ident(), "linear");
        assert_eq!(create(ResamplerQuality::Normal, 2).ident(), "cubic");
        assert_eq!(create(ResamplerQuality::Higher, 2).ident(), "sinc");
        assert_eq!(create(ResamplerQuality::Highest, 2).ident(), "sinc");
        assert_eq!(ResamplerQuality::default(), ResamplerQuality::Normal);
    }

    #[test]
    fn test_create_by_ident() {
        for ident in idents() {
            let rs = create_by_ident(ident, 1).unwrap();
            assert_eq!(rs.ident(), ident);
            assert_eq!(rs.channels(), 1);
        }
        assert!(create_by_ident("nearest", 2).is_err());
    }

    #[test]
    fn test_quality_parse() {
        assert_eq!(
            "Highest".parse::<ResamplerQuality>().unwrap(),
            ResamplerQuality::Highest
        );
        assert!("best".parse::<ResamplerQuality>().is_err());
        assert_eq!(ResamplerQuality::Lower.to_string(), "lower");
    }

    #[test]
    fn test_unity_ratio_is_one_to_one() {
        for ident in idents() {
            let mut rs = create_by_ident(ident, 2).unwrap();
            let mut out = Vec::new();
            for block in [1usize, 7, 128, 3, 534] {
                out.clear();
                rs.process(&vec![0.25f32; block * 2], 1.0, &mut out);
                assert_eq!(out.len(), block * 2, "{ident} block {block}");
            }
        }
    }

    #[test]
    fn test_chunked_equals_single_call() {
        // Step sizes 0.5 and 2.0 are exact in binary, so the phase sequence
        // does not depend on where the blocks are cut
        let input = sine(600, 2, 440.0, 32_000.0);
        for ident in idents() {
            for ratio in [2.0, 0.5] {
                let mut whole = Vec::new();
                create_by_ident(ident, 2)
                    .unwrap()
                    .process(&input, ratio, &mut whole);

                let mut rs = create_by_ident(ident, 2).unwrap();
                let mut chunked = Vec::new();
                let mut offset = 0;
                for (i, size) in [1usize, 17, 64, 3, 200].iter().cycle().enumerate() {
                    if offset >= 600 || i > 100 {
                        break;
                    }
                    let end = (offset + size).min(600);
                    rs.process(&input[offset * 2..end * 2], ratio, &mut chunked);
                    offset = end;
                }

                assert_eq!(whole.len(), chunked.len(), "{ident} @ {ratio}");
                for (a, b) in whole.iter().zip(&chunked) {
                    approx::assert_abs_diff_eq!(a, b, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_no_discontinuity_when_ratio_moves() {
        let input_rate = 32_000.0;
        let input = sine(32_000, 1, 440.0, input_rate);
        let nominal = 48_000.0 / input_rate as f64;

        for ident in idents() {
            let mut rs = create_by_ident(ident, 1).unwrap();
            let mut out = Vec::new();
            for (i, block) in input.chunks(533).enumerate() {
                // Alternate around nominal by +-0.5%
                let ratio = if i % 2 == 0 {
                    nominal * 1.005
                } else {
                    nominal * 0.995
                };
                rs.process(block, ratio, &mut out);
            }

            // 0.5 amplitude at 440 Hz moves at most ~0.029 per 48 kHz sample
            let max_step = out
                .windows(2)
                .skip(16)
                .map(|w| (w[1] - w[0]).abs())
                .fold(0.0f32, f32::max);
            assert!(max_step < 0.04, "{ident}: jump of {max_step}");

            let expected = 32_000.0 * nominal;
            let produced = out.len() as f64;
            assert!(
                (produced - expected).abs() < expected * 0.01,
                "{ident}: {produced} frames, expected about {expected}"
            );
        }
    }

    #[test]
    fn test_ratio_change_matches_stream_at_new_ratio() {
        // 2.0 then 0.8: steps 0.5 and 1.25 are exact, and the switch lands
        // on input frame 200, which the 1.25 grid also hits (k = 160)
        let input = sine(600, 1, 440.0, 32_000.0);
        let split = 200;
        let offset = 160;

        for ident in idents() {
            let mut whole = Vec::new();
            create_by_ident(ident, 1)
                .unwrap()
                .process(&input, 0.8, &mut whole);

            let mut rs = create_by_ident(ident, 1).unwrap();
            let mut chunked = Vec::new();
            rs.process(&input[..split], 2.0, &mut chunked);
            assert_eq!(chunked.len(), split * 2, "{ident}");
            rs.process(&input[split..], 0.8, &mut chunked);

            let tail = &chunked[split * 2..];
            let reference = &whole[offset..];
            assert_eq!(tail.len(), reference.len(), "{ident}");
            for (i, (a, b)) in tail.iter().zip(reference).enumerate() {
                assert!((a - b).abs() < 1e-5, "{ident}: sample {i} after the switch");
            }
        }
    }

    #[test]
    fn test_invalid_ratio_falls_back_to_unity() {
        for ratio in [0.0, -1.5, f64::NAN, f64::INFINITY] {
            let mut rs = create(ResamplerQuality::Normal, 2);
            let mut out = Vec::new();
            rs.process(&[0.1f32; 64], ratio, &mut out);
            assert_eq!(out.len(), 64);
        }
    }

    #[test]
    fn test_reset_clears_history() {
        let mut rs = create(ResamplerQuality::Lowest, 1);
        let mut out = Vec::new();
        rs.process(&[1.0f32; 8], 1.0, &mut out);
        rs.reset();

        out.clear();
        rs.process(&[0.0f32; 4], 1.0, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }
}
