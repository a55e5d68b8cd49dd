//! Two-tap linear interpolation

use super::Kernel;

/// Straight line between the two nearest frames
#[derive(Debug, Clone, Copy)]
pub struct Linear;

impl Kernel for Linear {
    const TAPS: usize = 2;
    const IDENT: &'static str = "linear";

    fn weights(frac: f64, weights: &mut [f32]) {
        let t = frac as f32;
        weights[0] = 1.0 - t;
        weights[1] = t;
    }
}
