//! Eight-tap Lanczos windowed sinc

use super::Kernel;
use std::f64::consts::PI;

/// Lobes of the Lanczos window
const LOBES: f64 = 4.0;
/// Two taps per lobe
const SINC_TAPS: usize = 8;

/// Lanczos (a = 4) windowed sinc
///
/// Weights are normalised to unit sum so DC passes through unchanged at every
/// phase.
#[derive(Debug, Clone, Copy)]
pub struct Lanczos;

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

impl Kernel for Lanczos {
    const TAPS: usize = SINC_TAPS;
    const IDENT: &'static str = "sinc";

    fn weights(frac: f64, weights: &mut [f32]) {
        let center = (SINC_TAPS / 2 - 1) as f64;
        let mut raw = [0.0f64; SINC_TAPS];
        let mut sum = 0.0;
        for (tap, w) in raw.iter_mut().enumerate() {
            let x = tap as f64 - center - frac;
            *w = if x.abs() < LOBES {
                sinc(x) * sinc(x / LOBES)
            } else {
                0.0
            };
            sum += *w;
        }

        for (out, w) in weights.iter_mut().zip(raw) {
            *out = (w / sum) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_phase_selects_one_tap() {
        let mut w = [0.0f32; 8];
        Lanczos::weights(0.0, &mut w);
        for (tap, weight) in w.iter().enumerate() {
            let expected = if tap == 3 { 1.0 } else { 0.0 };
            approx::assert_abs_diff_eq!(*weight, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_half_phase_is_symmetric() {
        let mut w = [0.0f32; 8];
        Lanczos::weights(0.5, &mut w);
        for tap in 0..4 {
            approx::assert_abs_diff_eq!(w[tap], w[7 - tap], epsilon = 1e-6);
        }
        approx::assert_abs_diff_eq!(w.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    }
}
