//! One-dimensional Gaussian mixture fitting by expectation-maximization.
//!
//! Redshift distributions are one-dimensional, so the mixture stores scalar
//! means and variances. Initialisation is k-means++ driven by a seeded RNG,
//! making fits reproducible for a given seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{Continuous, Normal};
use thiserror::Error;

/// Variance regularization added to every component, matching the usual EM
/// covariance floor. Keeps degenerate components finite and stops BIC from
/// rewarding pathological splits of near-identical redshifts.
const VARIANCE_FLOOR: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum GmmError {
    #[error("cannot fit {components} components to {points} points")]
    TooFewPoints { components: usize, points: usize },

    #[error("mixture fit diverged: {0}")]
    Diverged(String),
}

/// A fitted one-dimensional Gaussian mixture.
#[derive(Debug, Clone)]
pub struct Gmm1d {
    pub weights: Vec<f64>,
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
    /// Total log-likelihood of the training data.
    pub log_likelihood: f64,
    /// Whether EM reached the tolerance before the iteration cap.
    pub converged: bool,
    pub iterations: usize,
}

impl Gmm1d {
    /// Fit `k` components to `data` with EM.
    ///
    /// `tol` is the mean per-sample log-likelihood change below which EM
    /// stops; `max_iter` caps the iterations (a cap hit is reported through
    /// `converged = false`, never hidden).
    pub fn fit(
        data: &[f64],
        k: usize,
        seed: u64,
        tol: f64,
        max_iter: usize,
    ) -> Result<Self, GmmError> {
        let n = data.len();
        if k == 0 || n < k {
            return Err(GmmError::TooFewPoints {
                components: k,
                points: n,
            });
        }

        let mut means = kmeans_plus_plus_init(data, k, seed);
        let global_var = variance(data).max(VARIANCE_FLOOR);
        let mut variances = vec![global_var; k];
        let mut weights = vec![1.0 / k as f64; k];

        let mut prev_ll = f64::NEG_INFINITY;
        let mut converged = false;
        let mut iterations = 0;
        let mut log_likelihood = f64::NEG_INFINITY;
        let mut resp = vec![vec![0.0; k]; n];

        for iter in 0..max_iter {
            iterations = iter + 1;

            // E step.
            log_likelihood = e_step(data, &weights, &means, &variances, &mut resp)?;

            // M step.
            for c in 0..k {
                let nk: f64 = resp.iter().map(|row| row[c]).sum();
                if nk <= f64::MIN_POSITIVE {
                    // Empty component: park it on the global distribution.
                    weights[c] = f64::MIN_POSITIVE;
                    variances[c] = global_var;
                    continue;
                }
                weights[c] = nk / n as f64;
                let mu: f64 = data
                    .iter()
                    .zip(&resp)
                    .map(|(&x, row)| row[c] * x)
                    .sum::<f64>()
                    / nk;
                means[c] = mu;
                variances[c] = (data
                    .iter()
                    .zip(&resp)
                    .map(|(&x, row)| row[c] * (x - mu).powi(2))
                    .sum::<f64>()
                    / nk)
                    .max(VARIANCE_FLOOR);
            }
            let wsum: f64 = weights.iter().sum();
            for w in weights.iter_mut() {
                *w /= wsum;
            }

            if (log_likelihood - prev_ll).abs() / (n as f64) < tol {
                converged = true;
                break;
            }
            prev_ll = log_likelihood;
        }

        if !log_likelihood.is_finite() {
            return Err(GmmError::Diverged("non-finite log-likelihood".to_string()));
        }

        Ok(Self {
            weights,
            means,
            variances,
            log_likelihood,
            converged,
            iterations,
        })
    }

    /// Bayesian information criterion; lower is better. A 1-D mixture with k
    /// components has 3k - 1 free parameters.
    pub fn bic(&self, n: usize) -> f64 {
        let p = (3 * self.weights.len() - 1) as f64;
        -2.0 * self.log_likelihood + p * (n as f64).ln()
    }

    /// Posterior responsibilities γ[i][c]; each row sums to 1.
    pub fn responsibilities(&self, data: &[f64]) -> Vec<Vec<f64>> {
        let mut resp = vec![vec![0.0; self.weights.len()]; data.len()];
        // The parameters are finite by construction, so this cannot fail.
        let _ = e_step(data, &self.weights, &self.means, &self.variances, &mut resp);
        resp
    }

    /// Hard component assignment by maximum responsibility.
    pub fn predict(&self, data: &[f64]) -> Vec<usize> {
        self.responsibilities(data)
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| {
                        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(c, _)| c)
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn n_components(&self) -> usize {
        self.weights.len()
    }
}

/// One E step; fills `resp` and returns the total log-likelihood.
fn e_step(
    data: &[f64],
    weights: &[f64],
    means: &[f64],
    variances: &[f64],
    resp: &mut [Vec<f64>],
) -> Result<f64, GmmError> {
    let k = weights.len();
    let normals: Vec<Normal> = means
        .iter()
        .zip(variances)
        .map(|(&m, &v)| {
            Normal::new(m, v.sqrt().max(1e-154))
                .map_err(|e| GmmError::Diverged(e.to_string()))
        })
        .collect::<Result<_, _>>()?;

    let mut total = 0.0;
    for (i, &x) in data.iter().enumerate() {
        let mut log_p = vec![0.0; k];
        for c in 0..k {
            log_p[c] = weights[c].max(f64::MIN_POSITIVE).ln() + normals[c].ln_pdf(x);
        }
        let lse = log_sum_exp(&log_p);
        for c in 0..k {
            resp[i][c] = (log_p[c] - lse).exp();
        }
        total += lse;
    }
    Ok(total)
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

fn variance(data: &[f64]) -> f64 {
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n
}

/// k-means++ seeding: the first center is drawn uniformly, later centers
/// proportionally to squared distance from the nearest chosen center.
fn kmeans_plus_plus_init(data: &[f64], k: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = data.len();
    let mut centers = Vec::with_capacity(k);
    centers.push(data[rng.gen_range(0..n)]);

    while centers.len() < k {
        let dist2: Vec<f64> = data
            .iter()
            .map(|&x| {
                centers
                    .iter()
                    .map(|&c| (x - c).powi(2))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let total: f64 = dist2.iter().sum();
        if total <= 0.0 {
            // All points coincide with a center; spread duplicates.
            centers.push(data[rng.gen_range(0..n)]);
            continue;
        }
        let mut threshold = rng.gen_range(0.0..total);
        let mut chosen = data[n - 1];
        for (&x, &d) in data.iter().zip(&dist2) {
            if threshold <= d {
                chosen = x;
                break;
            }
            threshold -= d;
        }
        centers.push(chosen);
    }
    centers
}
