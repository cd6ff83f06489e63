//! Cross-correlation of a processed spectrum against reference templates.
//!
//! For every admissible template the engine locates the best redshift peak in
//! the FFT cross-correlation, refines it to sub-bin precision, and derives the
//! match metrics: `r` (peak signal-to-noise), `lap` (overlap fraction),
//! `rlap = r·lap`, the redshift uncertainty from the peak half-width, and the
//! cosine-weighted `rlap_cos`.

pub mod fft;

use crate::templates::Template;
use crate::types::{CorrelationTrace, Match, ProcessedSpectrum};
use thiserror::Error;

/// Correlation errors. Per-template failures are converted to rejected
/// matches by the pipeline rather than aborting the run.
#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("Non-finite correlation for template '{template}'")]
    NumericFailure { template: String },

    #[error("Grid mismatch: spectrum has {spectrum} bins, template '{template}' has {template_bins}")]
    GridMismatch {
        spectrum: usize,
        template: String,
        template_bins: usize,
    },
}

/// Redshift-search and acceptance settings for one analysis.
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// Minimum redshift searched.
    pub zmin: f64,
    /// Maximum redshift searched.
    pub zmax: f64,
    /// Window (bins) a peak must dominate, and the mask half-width used for
    /// the noise estimate.
    pub peak_window_size: usize,
    /// Minimum overlap fraction to admit a match.
    pub lapmin: f64,
    /// Minimum rlap to admit a match.
    pub rlapmin: f64,
    /// Evaluate only the lag closest to this redshift; disables peak search.
    pub forced_redshift: Option<f64>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            zmin: -0.01,
            zmax: 1.0,
            peak_window_size: 10,
            lapmin: 0.3,
            rlapmin: 5.0,
            forced_redshift: None,
        }
    }
}

/// Correlate one template against the spectrum.
pub fn correlate_template(
    spectrum: &ProcessedSpectrum,
    template: &Template,
    config: &CorrelationConfig,
) -> Result<Match, CorrelationError> {
    let nw = spectrum.grid.nw;
    if template.flat_flux.len() != nw {
        return Err(CorrelationError::GridMismatch {
            spectrum: nw,
            template: template.name.clone(),
            template_bins: template.flat_flux.len(),
        });
    }
    let dwlog = spectrum.grid.dwlog;
    let pad = fft::pad_length(nw);

    // Template FFT: precomputed at store load, computed here as a fallback.
    let owned_fft;
    let tpl_fft: &[num_complex::Complex<f64>] = match &template.fft {
        Some(f) => f,
        None => {
            let mut buf = vec![num_complex::Complex::new(0.0, 0.0); pad];
            for (i, &v) in template.flat_flux.iter().enumerate() {
                buf[i] = num_complex::Complex::new(v, 0.0);
            }
            fft::forward_fft(&mut buf);
            owned_fft = buf;
            &owned_fft
        }
    };

    let raw = fft::cross_correlate(&spectrum.tapered_flux, tpl_fft);

    // Normalize so a perfect self-match peaks near 1.
    let s_power: f64 = spectrum.tapered_flux.iter().map(|v| v * v).sum();
    let t_power: f64 = template.flat_flux.iter().map(|v| v * v).sum();
    let norm = (s_power * t_power).sqrt();
    if norm <= 0.0 || !norm.is_finite() {
        return Err(CorrelationError::NumericFailure {
            template: template.name.clone(),
        });
    }

    // Full lag window the grid supports.
    let half = (nw / 2) as i64;
    let lag_lo = -half;
    let lag_hi = half - 1;
    let value_at = |k: i64| -> f64 {
        let idx = if k >= 0 { k as usize } else { (pad as i64 + k) as usize };
        raw[idx] / norm
    };
    let corr: Vec<f64> = (lag_lo..=lag_hi).map(value_at).collect();
    if corr.iter().any(|v| !v.is_finite()) {
        return Err(CorrelationError::NumericFailure {
            template: template.name.clone(),
        });
    }
    let to_index = |k: i64| (k - lag_lo) as usize;

    // Lags admitted by the redshift search range.
    let lag_for_z = |z: f64| ((1.0 + z).ln() / dwlog).round() as i64;
    let kmin = (((1.0 + config.zmin).ln() / dwlog).ceil() as i64).max(lag_lo);
    let kmax = (((1.0 + config.zmax).ln() / dwlog).floor() as i64).min(lag_hi);

    let (peak_lag, refined_lag) = match config.forced_redshift {
        Some(zf) => {
            let k = lag_for_z(zf).clamp(lag_lo, lag_hi);
            (k, k as f64)
        }
        None => {
            if kmin > kmax {
                // Empty search range: nothing to match.
                return Ok(rejected_match(template, 0.0, 0.0, 0.0, 0.0, 0.0, None));
            }
            let idx = find_peak(&corr, to_index(kmin), to_index(kmax), config.peak_window_size);
            let k = idx as i64 + lag_lo;
            (k, refine_peak(&corr, idx, lag_lo))
        }
    };

    let height = corr[to_index(peak_lag)];
    let z = match config.forced_redshift {
        Some(zf) => zf,
        None => (refined_lag * dwlog).exp() - 1.0,
    };

    // Peak signal-to-noise from the correlation outside a masked window
    // around the peak, estimated separately on each side.
    let r = peak_snr(&corr, to_index(peak_lag), config.peak_window_size, height);

    let lap = overlap_fraction(spectrum, template, peak_lag, nw);
    let rlap = r * lap;

    let redshift_error = {
        let hw = half_width(&corr, to_index(peak_lag), height);
        (hw * dwlog * (1.0 + z)).abs().max(f64::EPSILON)
    };

    let rlap_cos = cosine_similarity(spectrum, template, peak_lag, nw)
        .map(|cos| rlap * cos.clamp(0.0, 1.0));

    if !rlap.is_finite() || !redshift_error.is_finite() {
        return Err(CorrelationError::NumericFailure {
            template: template.name.clone(),
        });
    }

    let trace = if kmin <= kmax {
        CorrelationTrace {
            z_axis: (kmin..=kmax)
                .map(|k| (k as f64 * dwlog).exp() - 1.0)
                .collect(),
            correlation: corr[to_index(kmin)..=to_index(kmax)].to_vec(),
        }
    } else {
        CorrelationTrace {
            z_axis: Vec::new(),
            correlation: Vec::new(),
        }
    };

    let rejected = lap < config.lapmin || rlap < config.rlapmin;
    Ok(Match {
        template_name: template.name.clone(),
        template_type: template.sn_type.clone(),
        template_subtype: template.subtype.clone(),
        age_days: template.age_days,
        redshift: z,
        redshift_error,
        r,
        lap,
        rlap,
        rlap_cos,
        rejected,
        correlation: Some(trace),
    })
}

fn rejected_match(
    template: &Template,
    z: f64,
    z_err: f64,
    r: f64,
    lap: f64,
    rlap: f64,
    trace: Option<CorrelationTrace>,
) -> Match {
    Match {
        template_name: template.name.clone(),
        template_type: template.sn_type.clone(),
        template_subtype: template.subtype.clone(),
        age_days: template.age_days,
        redshift: z,
        redshift_error: z_err,
        r,
        lap,
        rlap,
        rlap_cos: None,
        rejected: true,
        correlation: trace,
    }
}

/// Index of the best peak in `corr[lo..=hi]`: the highest value that is also
/// a local maximum within the peak window. Falls back to the plain argmax
/// when no local maximum exists in range.
fn find_peak(corr: &[f64], lo: usize, hi: usize, window: usize) -> usize {
    let half = (window / 2).max(1);
    let mut best: Option<(usize, f64)> = None;
    for i in lo..=hi {
        let v = corr[i];
        let w_lo = i.saturating_sub(half).max(lo);
        let w_hi = (i + half).min(hi);
        if (w_lo..=w_hi).all(|j| corr[j] <= v) && best.map_or(true, |(_, bv)| v > bv) {
            best = Some((i, v));
        }
    }
    match best {
        Some((i, _)) => i,
        None => {
            let mut arg = lo;
            for i in lo..=hi {
                if corr[i] > corr[arg] {
                    arg = i;
                }
            }
            arg
        }
    }
}

/// Sub-bin peak position (in lag units) from a parabola through the three
/// points around the maximum.
fn refine_peak(corr: &[f64], idx: usize, lag_lo: i64) -> f64 {
    let k = idx as i64 + lag_lo;
    if idx == 0 || idx + 1 >= corr.len() {
        return k as f64;
    }
    let ym = corr[idx - 1];
    let y0 = corr[idx];
    let yp = corr[idx + 1];
    let denom = ym - 2.0 * y0 + yp;
    if denom.abs() < 1e-300 {
        return k as f64;
    }
    let delta = 0.5 * (ym - yp) / denom;
    k as f64 + delta.clamp(-1.0, 1.0)
}

/// r = peak height / (√2 · noise RMS), where the noise is the correlation
/// outside `±window` of the peak, averaged from the left and right sides.
fn peak_snr(corr: &[f64], peak: usize, window: usize, height: f64) -> f64 {
    if height <= 0.0 {
        return 0.0;
    }
    let mask_lo = peak.saturating_sub(window);
    let mask_hi = (peak + window).min(corr.len() - 1);

    let rms = |range: std::ops::Range<usize>| -> Option<f64> {
        let n = range.len();
        if n == 0 {
            return None;
        }
        let s: f64 = corr[range].iter().map(|v| v * v).sum();
        Some((s / n as f64).sqrt())
    };

    let left = rms(0..mask_lo);
    let right = rms(mask_hi + 1..corr.len());
    let noise = match (left, right) {
        (Some(l), Some(r)) => ((l * l + r * r) / 2.0).sqrt(),
        (Some(l), None) => l,
        (None, Some(r)) => r,
        (None, None) => return 0.0,
    };
    if noise <= 0.0 {
        return 0.0;
    }
    height / (std::f64::consts::SQRT_2 * noise)
}

/// Full width of the peak at half its height, in fractional bins, halved.
fn half_width(corr: &[f64], peak: usize, height: f64) -> f64 {
    if height <= 0.0 {
        return 1.0;
    }
    let target = height / 2.0;

    let mut left = peak as f64;
    for i in (0..peak).rev() {
        if corr[i] <= target {
            let frac = (corr[i + 1] - target) / (corr[i + 1] - corr[i]).max(1e-300);
            left = (i + 1) as f64 - frac;
            break;
        }
        left = i as f64;
    }
    let mut right = peak as f64;
    for i in peak + 1..corr.len() {
        if corr[i] <= target {
            let frac = (corr[i - 1] - target) / (corr[i - 1] - corr[i]).max(1e-300);
            right = (i - 1) as f64 + frac;
            break;
        }
        right = i as f64;
    }
    ((right - left) / 2.0).max(0.5)
}

/// Fraction of the grid over which the spectrum and the lag-shifted template
/// both carry data.
fn overlap_fraction(
    spectrum: &ProcessedSpectrum,
    template: &Template,
    lag: i64,
    nw: usize,
) -> f64 {
    let s_lo = spectrum.left_edge as i64;
    let s_hi = spectrum.right_edge as i64;
    let t_lo = template.left_edge as i64 + lag;
    let t_hi = template.right_edge as i64 + lag;

    let lo = s_lo.max(t_lo).max(0);
    let hi = s_hi.min(t_hi).min(nw as i64 - 1);
    if hi < lo {
        return 0.0;
    }
    (((hi - lo + 1) as f64) / nw as f64).clamp(0.0, 1.0)
}

/// Cosine similarity between the flat spectrum and the shifted flat template
/// over their common support.
fn cosine_similarity(
    spectrum: &ProcessedSpectrum,
    template: &Template,
    lag: i64,
    nw: usize,
) -> Option<f64> {
    let s_lo = spectrum.left_edge as i64;
    let s_hi = spectrum.right_edge as i64;
    let t_lo = template.left_edge as i64 + lag;
    let t_hi = template.right_edge as i64 + lag;
    let lo = s_lo.max(t_lo).max(0);
    let hi = s_hi.min(t_hi).min(nw as i64 - 1);
    if hi < lo {
        return None;
    }

    let mut dot = 0.0;
    let mut ss = 0.0;
    let mut tt = 0.0;
    for i in lo..=hi {
        let t_idx = i - lag;
        if t_idx < 0 || t_idx >= nw as i64 {
            continue;
        }
        let s = spectrum.flat_flux[i as usize];
        let t = template.flat_flux[t_idx as usize];
        dot += s * t;
        ss += s * s;
        tt += t * t;
    }
    if ss <= 0.0 || tt <= 0.0 {
        return None;
    }
    Some(dot / (ss.sqrt() * tt.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridParams;
    use crate::templates::TemplateStore;

    /// Deterministic noise-like value in [-0.5, 0.5); a hash keeps the
    /// autocorrelation sidelobes low, unlike a sinusoid.
    fn hash_noise(i: usize, seed: f64) -> f64 {
        let x = ((i as f64 + seed) * 12.9898).sin() * 43758.5453;
        x - x.floor() - 0.5
    }

    /// Build a template whose flat flux is a feature-rich pattern with a
    /// rapidly decaying autocorrelation (hash noise smoothed over 7 bins).
    fn make_template_seeded(
        name: &str,
        sn_type: &str,
        subtype: &str,
        seed: f64,
        grid: &GridParams,
    ) -> Template {
        let nw = grid.nw;
        let lo = nw / 8;
        let hi = nw - nw / 8;
        let mut flat = vec![0.0; nw];
        let mut flux = vec![0.0; nw];
        for i in lo..hi {
            let mut acc = 0.0;
            for d in 0..7 {
                acc += hash_noise(i + d, seed);
            }
            flat[i] = 0.3 * (acc / 7.0);
            flux[i] = 1.0 + flat[i];
        }
        Template {
            name: name.to_string(),
            sn_type: sn_type.to_string(),
            subtype: subtype.to_string(),
            age_days: 0.0,
            phase: String::new(),
            redshift: 0.0,
            flat_flux: flat,
            flux,
            continuum: vec![1.0; nw],
            fft: None,
            left_edge: 0,
            right_edge: 0,
        }
    }

    fn make_template(name: &str, sn_type: &str, subtype: &str, grid: &GridParams) -> Template {
        make_template_seeded(name, sn_type, subtype, 1.0, grid)
    }

    /// A processed spectrum equal to the template shifted by `lag` bins.
    fn make_spectrum(template: &Template, lag: i64, grid: &GridParams) -> ProcessedSpectrum {
        let nw = grid.nw;
        let mut flat = vec![0.0; nw];
        for i in 0..nw {
            let src = i as i64 - lag;
            if src >= 0 && (src as usize) < nw {
                flat[i] = template.flat_flux[src as usize];
            }
        }
        let left = flat.iter().position(|&f| f != 0.0).unwrap_or(0);
        let right = flat.iter().rposition(|&f| f != 0.0).unwrap_or(nw - 1);
        let log_flux: Vec<f64> = flat.iter().map(|&f| f + 1.0).collect();
        ProcessedSpectrum {
            log_wave: grid.log_wave(),
            log_flux,
            flat_flux: flat.clone(),
            tapered_flux: flat,
            continuum: vec![1.0; nw],
            left_edge: left,
            right_edge: right,
            grid: *grid,
        }
    }

    fn prepared(template: Template, grid: &GridParams) -> Template {
        let store = TemplateStore::from_templates(vec![template], grid).unwrap();
        store.all()[0].clone()
    }

    #[test]
    fn test_self_match_at_zero_redshift() {
        let grid = GridParams::default();
        let tpl = prepared(make_template("t1", "Ia", "norm", &grid), &grid);
        let spec = make_spectrum(&tpl, 0, &grid);

        let m = correlate_template(&spec, &tpl, &CorrelationConfig::default()).unwrap();
        assert!(m.redshift.abs() < grid.dwlog, "z = {}", m.redshift);
        assert!(m.r > 5.0, "r = {}", m.r);
        assert!(!m.rejected);
        assert!(m.lap > 0.5);
    }

    #[test]
    fn test_shifted_match_recovers_redshift() {
        let grid = GridParams::default();
        let tpl = prepared(make_template("t1", "Ia", "norm", &grid), &grid);
        let lag = 30i64;
        let spec = make_spectrum(&tpl, lag, &grid);

        let m = correlate_template(&spec, &tpl, &CorrelationConfig::default()).unwrap();
        let expected_z = (lag as f64 * grid.dwlog).exp() - 1.0;
        assert!(
            (m.redshift - expected_z).abs() < 2.0 * grid.dwlog,
            "z = {} vs expected {}",
            m.redshift,
            expected_z
        );
        assert!(m.rlap > 4.0, "rlap = {}", m.rlap);
    }

    #[test]
    fn test_metric_bounds() {
        let grid = GridParams::default();
        let tpl = prepared(make_template("t1", "Ia", "norm", &grid), &grid);
        let spec = make_spectrum(&tpl, 12, &grid);

        let m = correlate_template(&spec, &tpl, &CorrelationConfig::default()).unwrap();
        assert!((0.0..=1.0).contains(&m.lap));
        assert!(m.rlap >= 0.0);
        if let Some(rc) = m.rlap_cos {
            assert!(rc >= 0.0);
            assert!(rc <= m.rlap + 1e-12, "rlap_cos {} > rlap {}", rc, m.rlap);
        }
    }

    #[test]
    fn test_forced_redshift_exact() {
        let grid = GridParams::default();
        let tpl = prepared(make_template("t1", "Ia", "norm", &grid), &grid);
        let spec = make_spectrum(&tpl, 30, &grid);

        let config = CorrelationConfig {
            forced_redshift: Some(0.012),
            ..Default::default()
        };
        let m = correlate_template(&spec, &tpl, &config).unwrap();
        assert_eq!(m.redshift, 0.012);
        assert!(m.rlap >= 0.0);
    }

    #[test]
    fn test_forced_redshift_weaker_than_peak() {
        let grid = GridParams::default();
        let tpl = prepared(make_template("t1", "Ia", "norm", &grid), &grid);
        let spec = make_spectrum(&tpl, 30, &grid);

        let free = correlate_template(&spec, &tpl, &CorrelationConfig::default()).unwrap();
        let forced = correlate_template(
            &spec,
            &tpl,
            &CorrelationConfig {
                forced_redshift: Some(0.012),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(forced.rlap <= free.rlap + 1e-9);
    }

    #[test]
    fn test_grid_mismatch_error() {
        let grid = GridParams::default();
        let small = GridParams::new(512, 2500.0, 10000.0).unwrap();
        let tpl = prepared(make_template("t1", "Ia", "norm", &small), &small);
        let big_tpl = prepared(make_template("t2", "Ia", "norm", &grid), &grid);
        let spec = make_spectrum(&big_tpl, 0, &grid);

        let err = correlate_template(&spec, &tpl, &CorrelationConfig::default()).unwrap_err();
        assert!(matches!(err, CorrelationError::GridMismatch { .. }));
    }

    #[test]
    fn test_zero_template_numeric_failure() {
        let grid = GridParams::default();
        let mut tpl = make_template("t1", "Ia", "norm", &grid);
        tpl.flat_flux = vec![0.0; grid.nw];
        tpl.flux = vec![0.0; grid.nw];
        let tpl = prepared(tpl, &grid);
        let good = prepared(make_template("t2", "Ia", "norm", &grid), &grid);
        let spec = make_spectrum(&good, 0, &grid);

        let err = correlate_template(&spec, &tpl, &CorrelationConfig::default()).unwrap_err();
        assert!(matches!(err, CorrelationError::NumericFailure { .. }));
    }

    #[test]
    fn test_mismatched_template_scores_lower() {
        let grid = GridParams::default();
        let ia = prepared(make_template("ia", "Ia", "norm", &grid), &grid);
        // A structurally different template from another seed.
        let other = prepared(
            make_template_seeded("ii", "II", "IIP", 77.0, &grid),
            &grid,
        );

        let spec = make_spectrum(&ia, 20, &grid);
        let m_ia = correlate_template(&spec, &ia, &CorrelationConfig::default()).unwrap();
        let m_other = correlate_template(&spec, &other, &CorrelationConfig::default()).unwrap();
        assert!(
            m_ia.best_metric() > m_other.best_metric(),
            "ia {} vs other {}",
            m_ia.best_metric(),
            m_other.best_metric()
        );
    }

    #[test]
    fn test_redshift_error_positive_and_scaled() {
        let grid = GridParams::default();
        let tpl = prepared(make_template("t1", "Ia", "norm", &grid), &grid);
        let spec = make_spectrum(&tpl, 30, &grid);
        let m = correlate_template(&spec, &tpl, &CorrelationConfig::default()).unwrap();
        assert!(m.redshift_error > 0.0);
        // Half-width of a sharp self-correlation peak stays within a few bins.
        assert!(m.redshift_error < 20.0 * grid.dwlog);
    }
}
