//! Spectrum preprocessing: clipping, smoothing, log rebinning, continuum
//! removal, and apodization.
//!
//! The chain is deterministic: a [`RawSpectrum`] plus a [`PreprocessOptions`]
//! always produces the same [`ProcessedSpectrum`]. Every applied step is
//! recorded in an ordered trace for reporting.

mod continuum;
mod filters;
mod rebin;

pub use continuum::{auto_gaussian_sigma, fit_continuum, nonzero_range, ContinuumMethod};
pub use filters::{
    apply_wavelength_masks, clip_aband, clip_host_emission_lines, clip_sky_lines, savgol_filter,
    savgol_filter_wavelength, GALAXY_LINES, SKY_LINES,
};
pub use rebin::{log_rebin, scale_to_mean};

use crate::grid::GridParams;
use crate::types::{ProcessedSpectrum, RawSpectrum, TraceStep};
use thiserror::Error;
use tracing::debug;

/// Minimum usable samples after cleaning and clipping.
const MIN_SAMPLES: usize = 10;

/// Preprocessing errors
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Invalid spectrum: {0}")]
    InvalidSpectrum(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Numeric failure in {stage}: non-finite values")]
    Numeric { stage: &'static str },
}

/// Configuration for the preprocessing chain. Unset options mean "skip".
#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    /// Savitzky-Golay window in pixels; 0 disables. Wins over `savgol_fwhm`.
    pub savgol_window: usize,
    /// Savitzky-Golay smoothing expressed as a wavelength FWHM (Å); 0 disables.
    pub savgol_fwhm: f64,
    /// Savitzky-Golay polynomial order (clamped to window − 1).
    pub savgol_order: usize,
    /// Remove the telluric A-band (7575-7675 Å).
    pub aband_remove: bool,
    /// Clip night-sky emission lines.
    pub skyclip: bool,
    /// Host-galaxy emission-line clipping redshift; negative disables.
    pub emclip_z: f64,
    /// Half-width (Å) for sky/emission clipping.
    pub emwidth: f64,
    /// User wavelength masks, each (min, max) Å.
    pub wavelength_masks: Vec<(f64, f64)>,
    /// Cosine taper percentage per edge of the data region, 0-50.
    pub apodize_percent: f64,
    /// Continuum model.
    pub continuum: ContinuumMethod,
    /// Divide log-rebinned flux by its mean over positive bins.
    pub scale_to_mean: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            savgol_window: 0,
            savgol_fwhm: 0.0,
            savgol_order: 3,
            aband_remove: false,
            skyclip: false,
            emclip_z: -1.0,
            emwidth: 40.0,
            wavelength_masks: Vec::new(),
            apodize_percent: 10.0,
            continuum: ContinuumMethod::default(),
            scale_to_mean: true,
        }
    }
}

impl PreprocessOptions {
    /// Validate ranges before running the chain.
    pub fn validate(&self) -> Result<(), PreprocessError> {
        if !(0.0..=50.0).contains(&self.apodize_percent) {
            return Err(PreprocessError::InvalidParameter(format!(
                "apodize_percent {} outside 0-50",
                self.apodize_percent
            )));
        }
        if self.emwidth <= 0.0 {
            return Err(PreprocessError::InvalidParameter(format!(
                "emwidth {} must be positive",
                self.emwidth
            )));
        }
        for &(a, b) in &self.wavelength_masks {
            if b < a {
                return Err(PreprocessError::InvalidParameter(format!(
                    "wavelength mask ({a}, {b}) has max < min"
                )));
            }
        }
        if let ContinuumMethod::Spline { knotnum } = self.continuum {
            if knotnum < 3 {
                return Err(PreprocessError::InvalidParameter(format!(
                    "spline knotnum {knotnum} below minimum of 3"
                )));
            }
        }
        Ok(())
    }
}

/// Run the full preprocessing chain.
///
/// Returns the processed spectrum and the ordered trace of applied steps.
pub fn preprocess(
    raw: &RawSpectrum,
    options: &PreprocessOptions,
    grid: &GridParams,
) -> Result<(ProcessedSpectrum, Vec<TraceStep>), PreprocessError> {
    options.validate()?;
    let mut trace = Vec::new();

    let mut spectrum = clean(raw)?;
    trace.push(TraceStep::new(
        "ingest",
        format!("{} finite samples", spectrum.len()),
    ));

    // Clipping on the linear-λ data.
    if options.aband_remove {
        spectrum = clip_aband(&spectrum);
        trace.push(TraceStep::new("clip_aband", "7575-7675 Å"));
    }
    if options.skyclip {
        spectrum = clip_sky_lines(&spectrum, options.emwidth);
        trace.push(TraceStep::new(
            "clip_sky_lines",
            format!("±{} Å", options.emwidth),
        ));
    }
    if options.emclip_z >= 0.0 {
        spectrum = clip_host_emission_lines(&spectrum, options.emclip_z, options.emwidth);
        trace.push(TraceStep::new(
            "clip_emission_lines",
            format!("z={:.4} ±{} Å", options.emclip_z, options.emwidth),
        ));
    }
    if !options.wavelength_masks.is_empty() {
        spectrum = apply_wavelength_masks(&spectrum, &options.wavelength_masks);
        trace.push(TraceStep::new(
            "wavelength_masks",
            format!("{} ranges", options.wavelength_masks.len()),
        ));
    }
    if spectrum.len() < MIN_SAMPLES {
        return Err(PreprocessError::InvalidSpectrum(format!(
            "fewer than {MIN_SAMPLES} samples remain after clipping"
        )));
    }

    // Smoothing on the linear-λ flux. An explicit pixel window wins over the
    // FWHM form when both are configured.
    if options.savgol_window > 0 {
        spectrum.flux = savgol_filter(&spectrum.flux, options.savgol_window, options.savgol_order);
        trace.push(TraceStep::new(
            "savgol",
            format!(
                "window={} order={}",
                options.savgol_window, options.savgol_order
            ),
        ));
    } else if options.savgol_fwhm > 0.0 {
        spectrum.flux = savgol_filter_wavelength(
            &spectrum.wave,
            &spectrum.flux,
            options.savgol_fwhm,
            options.savgol_order,
        );
        trace.push(TraceStep::new(
            "savgol",
            format!(
                "fwhm={} Å order={}",
                options.savgol_fwhm, options.savgol_order
            ),
        ));
    }

    // Onto the log grid.
    let mut log_flux = log_rebin(&spectrum, grid);
    trace.push(TraceStep::new(
        "log_rebin",
        format!("NW={} [{:.0}, {:.0}] Å", grid.nw, grid.w0, grid.w1),
    ));
    if nonzero_range(&log_flux).is_none() {
        return Err(PreprocessError::InvalidSpectrum(
            "no coverage on the wavelength grid".to_string(),
        ));
    }

    if options.scale_to_mean {
        let mean = scale_to_mean(&mut log_flux);
        trace.push(TraceStep::new("scale_to_mean", format!("mean={mean:.4e}")));
    }

    // Continuum removal. The knot phase follows the emission-clip redshift
    // hint when one was supplied.
    let izoff = if options.emclip_z > 0.0 {
        ((1.0 + options.emclip_z).ln() / grid.dwlog).round() as usize
    } else {
        0
    };
    let (flat, cont) = fit_continuum(&log_flux, options.continuum, izoff);
    trace.push(TraceStep::new(
        "continuum",
        match options.continuum {
            ContinuumMethod::Spline { knotnum } => format!("spline knotnum={knotnum}"),
            ContinuumMethod::Gaussian { sigma } => match sigma {
                Some(s) => format!("gaussian sigma={s:.1}"),
                None => "gaussian sigma=auto".to_string(),
            },
        },
    ));

    let (left_edge, right_edge) = nonzero_range(&log_flux).unwrap_or((0, grid.nw - 1));

    let tapered = apodize(&flat, left_edge, right_edge, options.apodize_percent);
    trace.push(TraceStep::new(
        "apodize",
        format!("{}% of [{left_edge}, {right_edge}]", options.apodize_percent),
    ));

    let processed = ProcessedSpectrum {
        log_wave: grid.log_wave(),
        log_flux,
        flat_flux: flat,
        tapered_flux: tapered,
        continuum: cont,
        left_edge,
        right_edge,
        grid: *grid,
    };
    verify_finite(&processed)?;

    debug!(
        left_edge,
        right_edge,
        steps = trace.len(),
        "preprocessing complete"
    );
    Ok((processed, trace))
}

/// Raised-cosine taper over `percent`% of the valid region at each end.
/// `n1`/`n2` delimit the valid (nonzero) region, inclusive.
pub fn apodize(arr: &[f64], n1: usize, n2: usize, percent: f64) -> Vec<f64> {
    let mut out = arr.to_vec();
    if n1 > n2 || n2 >= arr.len() || percent <= 0.0 {
        return out;
    }
    let valid_len = n2 - n1 + 1;
    let ns = ((valid_len as f64 * percent / 100.0).round() as usize).min(valid_len / 2);
    if ns < 1 {
        return out;
    }

    let ramp: Vec<f64> = if ns == 1 {
        vec![0.0]
    } else {
        (0..ns)
            .map(|i| 0.5 * (1.0 - (std::f64::consts::PI * i as f64 / (ns as f64 - 1.0)).cos()))
            .collect()
    };

    for (i, &r) in ramp.iter().enumerate() {
        out[n1 + i] *= r;
        out[n2 - i] *= r;
    }
    out
}

/// Drop non-finite rows and enforce ordering and minimum length.
fn clean(raw: &RawSpectrum) -> Result<RawSpectrum, PreprocessError> {
    let mut wave = Vec::with_capacity(raw.len());
    let mut flux = Vec::with_capacity(raw.len());
    for (&w, &f) in raw.wave.iter().zip(&raw.flux) {
        if w.is_finite() && f.is_finite() {
            wave.push(w);
            flux.push(f);
        }
    }
    if wave.len() < MIN_SAMPLES {
        return Err(PreprocessError::InvalidSpectrum(format!(
            "fewer than {MIN_SAMPLES} finite samples"
        )));
    }
    if wave.windows(2).any(|p| p[1] <= p[0]) {
        return Err(PreprocessError::InvalidSpectrum(
            "wavelengths not strictly increasing".to_string(),
        ));
    }
    Ok(RawSpectrum { wave, flux })
}

fn verify_finite(p: &ProcessedSpectrum) -> Result<(), PreprocessError> {
    let finite = |v: &[f64]| v.iter().all(|x| x.is_finite());
    if !finite(&p.log_flux) || !finite(&p.flat_flux) || !finite(&p.tapered_flux) {
        return Err(PreprocessError::Numeric {
            stage: "preprocess",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_raw(start: f64, end: f64, step: f64, f: impl Fn(f64) -> f64) -> RawSpectrum {
        let mut wave = Vec::new();
        let mut w = start;
        while w <= end + 1e-9 {
            wave.push(w);
            w += step;
        }
        let flux = wave.iter().map(|&w| f(w)).collect();
        RawSpectrum { wave, flux }
    }

    fn smooth_sn_like(w: f64) -> f64 {
        // Broad continuum with a couple of wiggles, always positive.
        let x = (w - 3500.0) / 5500.0;
        1.0 + 3.0 * x * (1.0 - x) + 0.2 * (w / 150.0).sin()
    }

    #[test]
    fn test_preprocess_edge_invariants() {
        let grid = GridParams::default();
        let raw = make_raw(3500.0, 9000.0, 1.0, smooth_sn_like);
        let (p, trace) = preprocess(&raw, &PreprocessOptions::default(), &grid).unwrap();

        assert_eq!(p.log_flux.len(), grid.nw);
        assert!(p.left_edge < p.right_edge);
        assert!(!trace.is_empty());

        // Everything zero outside the data region.
        for i in 0..grid.nw {
            if i < p.left_edge || i > p.right_edge {
                assert_eq!(p.flat_flux[i], 0.0, "flat at {i}");
                assert_eq!(p.tapered_flux[i], 0.0, "tapered at {i}");
                assert_eq!(p.continuum[i], 0.0, "continuum at {i}");
            }
        }

        // Taper leaves the interior untouched.
        let ns = ((p.data_span() as f64 * 0.10).round()) as usize;
        for i in p.left_edge + ns..=p.right_edge - ns {
            assert_eq!(p.tapered_flux[i], p.flat_flux[i], "interior at {i}");
        }
    }

    #[test]
    fn test_apodize_zero_percent_is_identity() {
        let grid = GridParams::default();
        let raw = make_raw(3500.0, 9000.0, 1.0, smooth_sn_like);
        let options = PreprocessOptions {
            apodize_percent: 0.0,
            ..Default::default()
        };
        let (p, _) = preprocess(&raw, &options, &grid).unwrap();
        assert_eq!(p.tapered_flux, p.flat_flux);
    }

    #[test]
    fn test_apodize_endpoints_zeroed() {
        let arr = vec![1.0; 100];
        let out = apodize(&arr, 0, 99, 10.0);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[99], 0.0);
        assert_eq!(out[50], 1.0);
    }

    #[test]
    fn test_empty_spectrum_rejected() {
        let grid = GridParams::default();
        let raw = RawSpectrum {
            wave: vec![],
            flux: vec![],
        };
        let err = preprocess(&raw, &PreprocessOptions::default(), &grid).unwrap_err();
        assert!(matches!(err, PreprocessError::InvalidSpectrum(_)));
    }

    #[test]
    fn test_nonfinite_rows_dropped() {
        let grid = GridParams::default();
        let mut raw = make_raw(3500.0, 9000.0, 1.0, smooth_sn_like);
        raw.flux[100] = f64::NAN;
        raw.flux[200] = f64::INFINITY;
        let (p, _) = preprocess(&raw, &PreprocessOptions::default(), &grid).unwrap();
        assert!(p.log_flux.iter().all(|f| f.is_finite()));
    }

    #[test]
    fn test_no_grid_coverage_rejected() {
        let grid = GridParams::default();
        // Entirely redward of the grid.
        let raw = make_raw(11000.0, 12000.0, 1.0, |_| 1.0);
        let err = preprocess(&raw, &PreprocessOptions::default(), &grid).unwrap_err();
        assert!(matches!(err, PreprocessError::InvalidSpectrum(_)));
    }

    #[test]
    fn test_masks_validated() {
        let options = PreprocessOptions {
            wavelength_masks: vec![(5000.0, 4000.0)],
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(PreprocessError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_apodize_percent_validated() {
        let options = PreprocessOptions {
            apodize_percent: 75.0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_trace_records_applied_steps() {
        let grid = GridParams::default();
        let raw = make_raw(3500.0, 9000.0, 1.0, smooth_sn_like);
        let options = PreprocessOptions {
            aband_remove: true,
            skyclip: true,
            savgol_window: 11,
            ..Default::default()
        };
        let (_, trace) = preprocess(&raw, &options, &grid).unwrap();
        let steps: Vec<&str> = trace.iter().map(|t| t.step.as_str()).collect();
        assert!(steps.contains(&"clip_aband"));
        assert!(steps.contains(&"clip_sky_lines"));
        assert!(steps.contains(&"savgol"));
        assert!(steps.contains(&"log_rebin"));
        assert!(steps.contains(&"continuum"));
        assert!(steps.contains(&"apodize"));
    }

    #[test]
    fn test_savgol_window_wins_over_fwhm() {
        let grid = GridParams::default();
        let raw = make_raw(3500.0, 9000.0, 1.0, smooth_sn_like);
        let options = PreprocessOptions {
            savgol_window: 11,
            savgol_fwhm: 30.0,
            ..Default::default()
        };
        let (_, trace) = preprocess(&raw, &options, &grid).unwrap();
        let savgol = trace.iter().find(|t| t.step == "savgol").unwrap();
        assert!(savgol.detail.contains("window=11"));
    }

    #[test]
    fn test_scaled_flux_mean_near_unity() {
        let grid = GridParams::default();
        let raw = make_raw(3500.0, 9000.0, 1.0, smooth_sn_like);
        let (p, _) = preprocess(&raw, &PreprocessOptions::default(), &grid).unwrap();
        let positive: Vec<f64> = p.log_flux.iter().copied().filter(|&f| f > 0.0).collect();
        let mean = positive.iter().sum::<f64>() / positive.len() as f64;
        assert!((mean - 1.0).abs() < 1e-9);
    }
}
