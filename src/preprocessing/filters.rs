//! Linear-wavelength filters: telluric/sky/emission clipping, user masks,
//! and Savitzky-Golay smoothing.
//!
//! All of these operate on the raw (λ, flux) arrays before log rebinning.
//! Clipping drops points, leaving a shorter but still monotonic spectrum.

use crate::types::RawSpectrum;

/// Telluric A-band range (Å).
pub const ABAND: (f64, f64) = (7575.0, 7675.0);

/// Night-sky emission lines (Å).
pub const SKY_LINES: [f64; 3] = [5577.0, 6300.2, 6364.0];

/// Rest-frame galaxy emission lines (Å) clipped when a host redshift is given:
/// [O II], Hβ, [O III] doublet, [N II]/Hα complex, [S II] doublet.
pub const GALAXY_LINES: [f64; 9] = [
    3727.3, 4861.3, 4958.9, 5006.8, 6548.1, 6562.8, 6583.6, 6716.4, 6730.8,
];

fn retain_outside(spectrum: &RawSpectrum, reject: impl Fn(f64) -> bool) -> RawSpectrum {
    let mut wave = Vec::with_capacity(spectrum.len());
    let mut flux = Vec::with_capacity(spectrum.len());
    for (&w, &f) in spectrum.wave.iter().zip(&spectrum.flux) {
        if !reject(w) {
            wave.push(w);
            flux.push(f);
        }
    }
    RawSpectrum { wave, flux }
}

/// Drop points inside the telluric A-band.
pub fn clip_aband(spectrum: &RawSpectrum) -> RawSpectrum {
    retain_outside(spectrum, |w| w >= ABAND.0 && w <= ABAND.1)
}

/// Drop points within `width` Å of each night-sky line.
pub fn clip_sky_lines(spectrum: &RawSpectrum, width: f64) -> RawSpectrum {
    retain_outside(spectrum, |w| {
        SKY_LINES.iter().any(|&l| w >= l - width && w <= l + width)
    })
}

/// Drop points within `width` Å of each galaxy emission line shifted to
/// redshift `z`. Negative `z` disables the clip.
pub fn clip_host_emission_lines(spectrum: &RawSpectrum, z: f64, width: f64) -> RawSpectrum {
    if z < 0.0 {
        return spectrum.clone();
    }
    retain_outside(spectrum, |w| {
        GALAXY_LINES.iter().any(|&l| {
            let ll = l * (1.0 + z);
            w >= ll - width && w <= ll + width
        })
    })
}

/// Drop points inside each `[a, b]` wavelength range. Ranges were validated
/// (a ≤ b) at configuration time.
pub fn apply_wavelength_masks(spectrum: &RawSpectrum, masks: &[(f64, f64)]) -> RawSpectrum {
    if masks.is_empty() {
        return spectrum.clone();
    }
    retain_outside(spectrum, |w| masks.iter().any(|&(a, b)| w >= a && w <= b))
}

/// Savitzky-Golay smoothing with a pixel window.
///
/// Window below 3 or beyond the data length degrades to a copy; even windows
/// grow by one; polynomial order is clamped to window − 1. Interior points use
/// the centered least-squares convolution; the first and last half-windows are
/// filled by evaluating the edge-window polynomial fit, matching the usual
/// "interp" boundary treatment.
pub fn savgol_filter(data: &[f64], window: usize, order: usize) -> Vec<f64> {
    let n = data.len();
    if window < 3 {
        return data.to_vec();
    }
    let mut w = if window % 2 == 0 { window + 1 } else { window };
    if w > n {
        // Cannot clamp to an odd window of at least 3: no-op.
        if n < 3 {
            return data.to_vec();
        }
        w = if n % 2 == 0 { n - 1 } else { n };
    }
    if w < 3 {
        return data.to_vec();
    }
    let order = order.min(w - 1);
    let half = w / 2;

    let weights = center_weights(w, order);
    let mut out = vec![0.0; n];
    for i in half..n - half {
        let mut acc = 0.0;
        for (j, &c) in weights.iter().enumerate() {
            acc += c * data[i - half + j];
        }
        out[i] = acc;
    }

    // Left edge: polynomial through the first window evaluated at 0..half.
    let left = polyfit_eval(&data[..w], order, (0..half).map(|i| i as f64 - half as f64));
    out[..half].copy_from_slice(&left);
    // Right edge: polynomial through the last window evaluated past its center.
    let right = polyfit_eval(
        &data[n - w..],
        order,
        (1..=half).map(|i| i as f64),
    );
    out[n - half..].copy_from_slice(&right);

    out
}

/// Savitzky-Golay smoothing with the window derived from a wavelength FWHM:
/// window ≈ 2·(FWHM/2.35) / mean pixel spacing, minimum 3, forced odd.
pub fn savgol_filter_wavelength(
    wave: &[f64],
    data: &[f64],
    fwhm_angstrom: f64,
    order: usize,
) -> Vec<f64> {
    if fwhm_angstrom <= 0.0 || wave.len() < 2 {
        return data.to_vec();
    }
    let avg_dwl = (wave[wave.len() - 1] - wave[0]) / (wave.len() - 1) as f64;
    if avg_dwl <= 0.0 {
        return data.to_vec();
    }
    let sigma = fwhm_angstrom / 2.35;
    let mut window = ((2.0 * sigma / avg_dwl) as usize).max(3);
    if window % 2 == 0 {
        window += 1;
    }
    savgol_filter(data, window, order)
}

/// Convolution weights for the window center: row 0 of (XᵀX)⁻¹Xᵀ where
/// X[i][j] = x_i^j over centered offsets x_i.
fn center_weights(window: usize, order: usize) -> Vec<f64> {
    let half = (window / 2) as i64;
    let m = order + 1;

    // Normal matrix XᵀX from power sums.
    let mut ata = vec![vec![0.0; m]; m];
    for r in 0..m {
        for c in 0..m {
            let mut s = 0.0;
            for x in -half..=half {
                s += (x as f64).powi((r + c) as i32);
            }
            ata[r][c] = s;
        }
    }
    // Solve (XᵀX) b = e0, then weight_i = Σ_j b_j x_i^j.
    let b = solve_linear(&mut ata, {
        let mut e0 = vec![0.0; m];
        e0[0] = 1.0;
        e0
    });

    (-half..=half)
        .map(|x| {
            let mut acc = 0.0;
            let mut xp = 1.0;
            for &bj in &b {
                acc += bj * xp;
                xp *= x as f64;
            }
            acc
        })
        .collect()
}

/// Least-squares polynomial through `data` (abscissa centered on the window
/// midpoint), evaluated at the given offsets from that midpoint.
fn polyfit_eval(data: &[f64], order: usize, at: impl Iterator<Item = f64>) -> Vec<f64> {
    let w = data.len();
    let half = (w / 2) as i64;
    let order = order.min(w - 1);
    let m = order + 1;

    let mut ata = vec![vec![0.0; m]; m];
    let mut aty = vec![0.0; m];
    for (i, &y) in data.iter().enumerate() {
        let x = i as f64 - half as f64;
        let mut xp = 1.0;
        let mut powers = Vec::with_capacity(m);
        for _ in 0..m {
            powers.push(xp);
            xp *= x;
        }
        for r in 0..m {
            aty[r] += powers[r] * y;
            for c in 0..m {
                ata[r][c] += powers[r] * powers[c];
            }
        }
    }
    let coeffs = solve_linear(&mut ata, aty);

    at.map(|x| {
        let mut acc = 0.0;
        let mut xp = 1.0;
        for &c in &coeffs {
            acc += c * xp;
            xp *= x;
        }
        acc
    })
    .collect()
}

/// Gaussian elimination with partial pivoting for the small SG normal systems.
fn solve_linear(a: &mut [Vec<f64>], mut rhs: Vec<f64>) -> Vec<f64> {
    let n = rhs.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                a[i][col]
                    .abs()
                    .partial_cmp(&a[j][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        a.swap(col, pivot);
        rhs.swap(col, pivot);
        let diag = a[col][col];
        if diag.abs() < 1e-300 {
            continue;
        }
        for row in col + 1..n {
            let factor = a[row][col] / diag;
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut acc = rhs[row];
        for k in row + 1..n {
            acc -= a[row][k] * x[k];
        }
        if a[row][row].abs() > 1e-300 {
            x[row] = acc / a[row][row];
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_spectrum(start: f64, end: f64, step: f64) -> RawSpectrum {
        let mut wave = Vec::new();
        let mut w = start;
        while w <= end {
            wave.push(w);
            w += step;
        }
        let flux = vec![1.0; wave.len()];
        RawSpectrum { wave, flux }
    }

    #[test]
    fn test_clip_aband_removes_band() {
        let s = linear_spectrum(7000.0, 8000.0, 1.0);
        let clipped = clip_aband(&s);
        assert!(clipped.wave.iter().all(|&w| !(7575.0..=7675.0).contains(&w)));
        assert!(clipped.len() < s.len());
    }

    #[test]
    fn test_clip_sky_lines_width() {
        let s = linear_spectrum(5500.0, 5700.0, 1.0);
        let clipped = clip_sky_lines(&s, 40.0);
        assert!(clipped.wave.iter().all(|&w| (w - 5577.0).abs() > 40.0));
    }

    #[test]
    fn test_emission_clip_disabled_for_negative_z() {
        let s = linear_spectrum(6500.0, 6600.0, 1.0);
        let clipped = clip_host_emission_lines(&s, -1.0, 40.0);
        assert_eq!(clipped.len(), s.len());
    }

    #[test]
    fn test_emission_clip_shifts_with_redshift() {
        let s = linear_spectrum(6500.0, 7300.0, 1.0);
        // Hα at z=0.1 sits at 7219.1 Å.
        let clipped = clip_host_emission_lines(&s, 0.1, 40.0);
        let ha = 6562.8 * 1.1;
        assert!(clipped.wave.iter().all(|&w| (w - ha).abs() > 40.0));
    }

    #[test]
    fn test_wavelength_masks() {
        let s = linear_spectrum(4000.0, 5000.0, 1.0);
        let clipped = apply_wavelength_masks(&s, &[(4200.0, 4300.0), (4800.0, 4850.0)]);
        assert!(clipped
            .wave
            .iter()
            .all(|&w| !(4200.0..=4300.0).contains(&w) && !(4800.0..=4850.0).contains(&w)));
    }

    #[test]
    fn test_savgol_preserves_polynomial() {
        // A cubic is reproduced exactly by an order-3 filter.
        let data: Vec<f64> = (0..50)
            .map(|i| {
                let x = i as f64;
                0.5 * x * x * x - 2.0 * x * x + x + 3.0
            })
            .collect();
        let smoothed = savgol_filter(&data, 11, 3);
        for (a, b) in data.iter().zip(&smoothed) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_savgol_order_clamped_to_window() {
        // Order >= window must clamp, not error; with order = window - 1 the
        // fit is exact so the data passes through unchanged.
        let data: Vec<f64> = (0..20).map(|i| (i as f64 * 0.3).sin()).collect();
        let smoothed = savgol_filter(&data, 5, 99);
        for (a, b) in data.iter().zip(&smoothed) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn test_savgol_window_larger_than_data() {
        let data = vec![1.0, 2.0];
        let smoothed = savgol_filter(&data, 11, 3);
        assert_eq!(smoothed, data);
    }

    #[test]
    fn test_savgol_even_window_promoted() {
        let data: Vec<f64> = (0..30).map(|i| i as f64).collect();
        // Window 10 behaves as 11; a line survives smoothing exactly.
        let smoothed = savgol_filter(&data, 10, 2);
        for (a, b) in data.iter().zip(&smoothed) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn test_savgol_smooths_noise() {
        // Deterministic zig-zag around a line: smoothing must shrink the wiggle.
        let data: Vec<f64> = (0..100)
            .map(|i| i as f64 * 0.1 + if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let smoothed = savgol_filter(&data, 11, 2);
        let wiggle: f64 = smoothed
            .windows(2)
            .map(|p| (p[1] - p[0] - 0.1).abs())
            .sum::<f64>();
        let raw_wiggle: f64 = data
            .windows(2)
            .map(|p| (p[1] - p[0] - 0.1).abs())
            .sum::<f64>();
        assert!(wiggle < raw_wiggle * 0.5);
    }

    #[test]
    fn test_savgol_fwhm_window_derivation() {
        let wave: Vec<f64> = (0..100).map(|i| 4000.0 + i as f64).collect();
        let data: Vec<f64> = (0..100).map(|i| i as f64).collect();
        // FWHM 10 Å at 1 Å spacing -> window about 2*10/2.35 ≈ 9 pixels.
        let smoothed = savgol_filter_wavelength(&wave, &data, 10.0, 3);
        assert_eq!(smoothed.len(), data.len());
        // Zero FWHM is a no-op.
        let same = savgol_filter_wavelength(&wave, &data, 0.0, 3);
        assert_eq!(same, data);
    }
}
