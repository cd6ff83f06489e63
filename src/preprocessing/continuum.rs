//! Continuum estimation and removal on the log-λ grid.
//!
//! Two models are supported: the knot-averaged natural cubic spline fit in
//! log10-flux space, and a Gaussian-filter local continuum with automatic
//! width selection. Both return `(flat, continuum)` where
//! `flat = flux/continuum - 1` on bins with data and 0 elsewhere.

use serde::{Deserialize, Serialize};

/// Continuum model selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ContinuumMethod {
    /// Knot-averaged natural cubic spline in log10 space.
    Spline {
        /// Number of averaging knots.
        knotnum: usize,
    },
    /// Gaussian-filtered local continuum.
    Gaussian {
        /// Filter σ in log-λ bins; `None` selects automatically.
        sigma: Option<f64>,
    },
}

impl Default for ContinuumMethod {
    fn default() -> Self {
        ContinuumMethod::Spline { knotnum: 13 }
    }
}

/// Fit and remove the continuum.
///
/// `izoff` offsets the spline knot phase (a redshift hint from the caller;
/// zero for none). After the fit, bins outside the observed data range are
/// forced to `flat = 0`, `continuum = 0`.
pub fn fit_continuum(flux: &[f64], method: ContinuumMethod, izoff: usize) -> (Vec<f64>, Vec<f64>) {
    let (mut flat, mut cont) = match method {
        ContinuumMethod::Spline { knotnum } => fit_continuum_spline(flux, knotnum, izoff),
        ContinuumMethod::Gaussian { sigma } => {
            let sigma = sigma.unwrap_or_else(|| auto_gaussian_sigma(flux));
            fit_continuum_gaussian(flux, sigma)
        }
    };

    if let Some((i0, i1)) = nonzero_range(flux) {
        for i in 0..flux.len() {
            if i < i0 || i > i1 {
                flat[i] = 0.0;
                cont[i] = 0.0;
            }
        }
    } else {
        flat.iter_mut().for_each(|v| *v = 0.0);
        cont.iter_mut().for_each(|v| *v = 0.0);
    }
    (flat, cont)
}

/// First and last index with flux > 0, if any.
pub fn nonzero_range(flux: &[f64]) -> Option<(usize, usize)> {
    let i0 = flux.iter().position(|&f| f > 0.0)?;
    let i1 = flux.iter().rposition(|&f| f > 0.0)?;
    Some((i0, i1))
}

/// Knot-averaged natural cubic spline continuum.
///
/// Usable range chops up to one zero/negative pixel off each end. Knots are
/// means of (i − 0.5, log10 flux) over windows of width ⌊n/knotnum⌋, phased by
/// `istart = (izoff % kw) − kw` when a redshift hint is given. The spline is
/// evaluated at every bin and exponentiated back to a linear continuum.
/// Degenerate inputs fall back to (flat = 0, continuum = 1).
fn fit_continuum_spline(flux: &[f64], knotnum: usize, izoff: usize) -> (Vec<f64>, Vec<f64>) {
    let n = flux.len();
    let trivial = || (vec![0.0; n], vec![1.0; n]);
    if n < 10 || knotnum < 3 {
        return trivial();
    }

    // Chop up to one positive pixel beyond leading non-positives at each end.
    let mut l1 = 0usize;
    let mut nuked = 0;
    while l1 < n - 1 && (flux[l1] <= 0.0 || nuked < 1) {
        if flux[l1] > 0.0 {
            nuked += 1;
        }
        l1 += 1;
    }
    let mut l2 = n - 1;
    nuked = 0;
    while l2 > 1 && (flux[l2] <= 0.0 || nuked < 1) {
        if flux[l2] > 0.0 {
            nuked += 1;
        }
        l2 -= 1;
    }
    if l2 < l1 || (l2 - l1) < 3 * knotnum {
        return trivial();
    }

    let kwidth = n / knotnum;
    if kwidth == 0 {
        return trivial();
    }
    let istart: i64 = if izoff > 0 {
        (izoff % kwidth) as i64 - kwidth as i64
    } else {
        0
    };

    let mut xknot = Vec::with_capacity(knotnum + 1);
    let mut yknot = Vec::with_capacity(knotnum + 1);
    let mut nave = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    for i in 0..n {
        if i > l1 && i < l2 && flux[i] > 0.0 {
            nave += 1.0;
            sum_x += i as f64 - 0.5;
            sum_y += flux[i].log10();
        }
        if (i as i64 - istart).rem_euclid(kwidth as i64) == 0 && nave > 0.0 {
            xknot.push(sum_x / nave);
            yknot.push(sum_y / nave);
            nave = 0.0;
            sum_x = 0.0;
            sum_y = 0.0;
        }
    }
    let nk = xknot.len();
    if nk < 3 {
        return trivial();
    }

    let y2 = natural_spline_second_derivatives(&xknot, &yknot);

    let mut cont = vec![0.0; n];
    for (j, c) in cont.iter_mut().enumerate() {
        let xp = j as f64 - 0.5;
        // Interval index for xp, clamped to the knot span.
        let mut idx = xknot.partition_point(|&xk| xk <= xp);
        idx = idx.saturating_sub(1).min(nk - 2);
        let h = xknot[idx + 1] - xknot[idx];
        let a = (xknot[idx + 1] - xp) / h;
        let b = (xp - xknot[idx]) / h;
        let logc = a * yknot[idx]
            + b * yknot[idx + 1]
            + ((a.powi(3) - a) * y2[idx] + (b.powi(3) - b) * y2[idx + 1]) * (h * h) / 6.0;
        *c = 10f64.powf(logc);
    }

    let mut flat = vec![0.0; n];
    for i in 0..n {
        if flux[i] > 0.0 && cont[i] > 0.0 {
            flat[i] = flux[i] / cont[i] - 1.0;
        }
    }
    (flat, cont)
}

/// Second derivatives of the natural cubic spline through (x, y).
fn natural_spline_second_derivatives(x: &[f64], y: &[f64]) -> Vec<f64> {
    let nk = x.len();
    let m = nk - 2;
    let mut y2 = vec![0.0; nk];
    if m == 0 {
        return y2;
    }

    let h: Vec<f64> = x.windows(2).map(|p| p[1] - p[0]).collect();
    let rhs: Vec<f64> = (0..m)
        .map(|i| 6.0 * ((y[i + 2] - y[i + 1]) / h[i + 1] - (y[i + 1] - y[i]) / h[i]))
        .collect();
    let diag: Vec<f64> = (0..m).map(|i| 2.0 * (h[i] + h[i + 1])).collect();
    let upper: Vec<f64> = (0..m).map(|i| h[i + 1]).collect();

    // Thomas algorithm; the system is strictly diagonally dominant.
    let mut u = vec![0.0; m];
    let mut z = vec![0.0; m];
    u[0] = diag[0];
    z[0] = rhs[0];
    for i in 1..m {
        let li = upper[i - 1] / u[i - 1];
        u[i] = diag[i] - li * upper[i - 1];
        z[i] = rhs[i] - li * z[i - 1];
    }
    y2[m] = z[m - 1] / u[m - 1];
    for i in (0..m - 1).rev() {
        y2[i + 1] = (z[i] - upper[i] * y2[i + 2]) / u[i];
    }
    y2
}

/// Gaussian-filter continuum over the trimmed core range, extrapolated
/// linearly to the rest of the grid with a 10%-of-edge floor.
fn fit_continuum_gaussian(flux: &[f64], sigma: f64) -> (Vec<f64>, Vec<f64>) {
    let n = flux.len();
    let Some((p0, p1)) = nonzero_range(flux) else {
        return (vec![0.0; n], vec![1.0; n]);
    };
    let n_pos = flux[p0..=p1].iter().filter(|&&f| f > 0.0).count();

    // Trim up to three low-value bins per end to keep edge artifacts out of
    // the continuum estimate.
    let mut i0 = p0;
    let mut i1 = p1;
    let n_edge_check = 3.min(n_pos / 10);
    if n_pos > 2 * n_edge_check {
        let mut valid: Vec<f64> = flux.iter().copied().filter(|&f| f > 0.0).collect();
        let threshold = median_in_place(&mut valid) * 0.2;
        for k in 0..n_edge_check {
            if p0 + k < n && flux[p0 + k] < threshold {
                i0 = p0 + k + 1;
            } else {
                break;
            }
        }
        for k in 0..n_edge_check {
            if p1 >= k && flux[p1 - k] < threshold {
                i1 = p1 - k - 1;
            } else {
                break;
            }
        }
    }
    if i1 <= i0 || i1 - i0 < 10 {
        i0 = p0;
        i1 = p1;
    }

    let core = gaussian_filter_mirror(&flux[i0..=i1], sigma);
    let core_len = core.len();

    let mut cont = vec![1.0; n];
    cont[i0..=i1].copy_from_slice(&core);

    // Linear extrapolation to the grid edges, floored at 10% of the edge value.
    if i0 > 0 && core_len >= 2 {
        let slope = core[1] - core[0];
        for idx in 0..i0 {
            let v = core[0] + slope * (idx as f64 - i0 as f64);
            cont[idx] = v.max(core[0] * 0.1);
        }
    }
    if i1 < n - 1 && core_len >= 2 {
        let slope = core[core_len - 1] - core[core_len - 2];
        for (offset, item) in cont.iter_mut().enumerate().skip(i1 + 1) {
            let v = core[core_len - 1] + slope * (offset as f64 - i1 as f64);
            *item = v.max(core[core_len - 1] * 0.1);
        }
    }

    let mut flat = vec![0.0; n];
    for i in 0..n {
        if flux[i] > 0.0 && cont[i] > 0.0 {
            flat[i] = flux[i] / cont[i] - 1.0;
        }
    }
    (flat, cont)
}

/// Automatic σ for the Gaussian continuum: NW/25 scaled by a noise factor in
/// [0.7, 1.5] derived from std/median of the valid flux, clamped to [10, 100].
pub fn auto_gaussian_sigma(flux: &[f64]) -> f64 {
    let mut base = flux.len() as f64 / 25.0;

    let valid: Vec<f64> = flux.iter().copied().filter(|&f| f > 0.0).collect();
    if valid.len() > 10 {
        let mut sorted = valid.clone();
        let median = median_in_place(&mut sorted);
        let mean = valid.iter().sum::<f64>() / valid.len() as f64;
        let var = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / valid.len() as f64;
        let noise_ratio = if median > 0.0 { var.sqrt() / median } else { 1.0 };
        let noise_factor = (1.0 + 0.2 * (noise_ratio - 0.1)).clamp(0.7, 1.5);
        base *= noise_factor;
    }

    base.clamp(10.0, 100.0)
}

/// Gaussian smoothing with mirrored boundaries (reflection about the end
/// samples, matching `gaussian_filter1d(..., mode="mirror")`).
fn gaussian_filter_mirror(data: &[f64], sigma: f64) -> Vec<f64> {
    let n = data.len();
    if n == 0 || sigma <= 0.0 {
        return data.to_vec();
    }
    let radius = (4.0 * sigma).round().max(1.0) as usize;
    let mut kernel = Vec::with_capacity(2 * radius + 1);
    let denom = 2.0 * sigma * sigma;
    for k in -(radius as i64)..=(radius as i64) {
        kernel.push((-(k as f64).powi(2) / denom).exp());
    }
    let norm: f64 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= norm;
    }

    let reflect = |idx: i64| -> usize {
        let mut i = idx;
        if n == 1 {
            return 0;
        }
        let period = 2 * (n as i64 - 1);
        i = i.rem_euclid(period);
        if i >= n as i64 {
            i = period - i;
        }
        i as usize
    };

    (0..n as i64)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(j, &k)| k * data[reflect(i + j as i64 - radius as i64)])
                .sum()
        })
        .collect()
}

fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}
