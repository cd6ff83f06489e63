//! FFT plumbing for the correlation engine.
//!
//! Transforms are pre-planned and shared through a process-wide cache keyed
//! by length and direction. The lock guards plan creation only; execution
//! runs concurrently on per-caller buffers.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

type PlanKey = (usize, bool);

static PLAN_CACHE: OnceLock<Mutex<HashMap<PlanKey, Arc<dyn Fft<f64>>>>> = OnceLock::new();

fn plan(len: usize, inverse: bool) -> Arc<dyn Fft<f64>> {
    let cache = PLAN_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match cache.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard
        .entry((len, inverse))
        .or_insert_with(|| {
            let mut planner = FftPlanner::new();
            if inverse {
                planner.plan_fft_inverse(len)
            } else {
                planner.plan_fft_forward(len)
            }
        })
        .clone()
}

/// In-place forward FFT.
pub fn forward_fft(buffer: &mut [Complex<f64>]) {
    plan(buffer.len(), false).process(buffer);
}

/// In-place inverse FFT, normalized by 1/N.
pub fn inverse_fft(buffer: &mut [Complex<f64>]) {
    let n = buffer.len();
    plan(n, true).process(buffer);
    let scale = 1.0 / n as f64;
    for v in buffer.iter_mut() {
        *v *= scale;
    }
}

/// Padded FFT length for cross-correlating two length-`nw` series without
/// circular wrap-around.
pub fn pad_length(nw: usize) -> usize {
    (2 * nw).next_power_of_two()
}

/// Cross-correlate a real series against a template whose padded FFT is
/// already available. Returns the raw (unnormalized) correlation, where index
/// `k` holds lag `k` and index `len - k` holds lag `-k`:
/// `c[k] = Σ_i s[i] · t[i - k]`.
pub fn cross_correlate(series: &[f64], template_fft: &[Complex<f64>]) -> Vec<f64> {
    let len = template_fft.len();
    let mut buf = vec![Complex::new(0.0, 0.0); len];
    for (i, &s) in series.iter().enumerate() {
        buf[i] = Complex::new(s, 0.0);
    }
    forward_fft(&mut buf);
    for (b, t) in buf.iter_mut().zip(template_fft) {
        *b *= t.conj();
    }
    inverse_fft(&mut buf);
    buf.into_iter().map(|c| c.re).collect()
}
