//! PSF-matching kernel derived from the measured PSF widths

use serde::{Deserialize, Serialize};

const PEAK_RATIO: f64 = 0.1;
const MAX_WIDTH: f64 = u32::MAX as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelKind {
    DoubleGaussian,
}

/// One kernel applied to every tile of the stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPsfKernel {
    pub kind: KernelKind,
    pub width: u32,
    pub height: u32,
    pub sigma1: f64,
    pub sigma2: f64,
    pub peak_ratio: f64,
}

/// Derive the matching kernel from the widest PSF.
///
/// `sigma1` is the largest sigma, `sigma2` twice that, and the kernel is
/// `floor(4 * sigma2) + 1` pixels square, capped at `u32::MAX`. `None` when
/// nothing was measured.
pub fn derive_kernel(sigmas: &[f64]) -> Option<MatchPsfKernel> {
    let max_sigma = sigmas
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .reduce(f64::max)?;

    let sigma1 = max_sigma;
    let sigma2 = 2.0 * max_sigma;
    let kwid = ((4.0 * sigma2).floor().max(0.0) + 1.0).min(MAX_WIDTH) as u32;

    Some(MatchPsfKernel {
        kind: KernelKind::DoubleGaussian,
        width: kwid,
        height: kwid,
        sigma1,
        sigma2,
        peak_ratio: PEAK_RATIO,
    })
}
