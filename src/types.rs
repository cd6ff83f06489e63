//! Core data records shared across the classification pipeline.
//!
//! These are plain serde-friendly structs: the preprocessor produces a
//! [`ProcessedSpectrum`], the correlator produces one [`Match`] per template,
//! and downstream stages only sort, filter, and aggregate them.

use crate::grid::GridParams;
use serde::{Deserialize, Serialize};

/// A raw observed spectrum: (wavelength Å, flux) pairs with strictly
/// increasing wavelengths and finite values after ingestion cleaning.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSpectrum {
    pub wave: Vec<f64>,
    pub flux: Vec<f64>,
}

impl RawSpectrum {
    pub fn len(&self) -> usize {
        self.wave.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wave.is_empty()
    }
}

/// One preprocessing step applied, in order, for reporting and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    /// Step name, e.g. "log_rebin" or "continuum_spline".
    pub step: String,
    /// Human-readable parameter summary.
    pub detail: String,
}

impl TraceStep {
    pub fn new(step: &str, detail: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            detail: detail.into(),
        }
    }
}

/// A spectrum on the fixed log-λ grid, ready for correlation.
///
/// All arrays have length `grid.nw`. Outside `[left_edge, right_edge]` every
/// flux array is exactly zero. `tapered_flux` equals `flat_flux` inside the
/// non-apodized interior and carries the cosine taper at the edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSpectrum {
    /// Bin center wavelengths (Å).
    pub log_wave: Vec<f64>,
    /// Scaled flux density on the log grid.
    pub log_flux: Vec<f64>,
    /// Continuum-removed flux (flux/continuum - 1); zero outside the data region.
    pub flat_flux: Vec<f64>,
    /// Apodized `flat_flux` used for correlation.
    pub tapered_flux: Vec<f64>,
    /// Continuum model; zero outside the data region.
    pub continuum: Vec<f64>,
    /// First bin with data.
    pub left_edge: usize,
    /// Last bin with data (inclusive).
    pub right_edge: usize,
    /// Grid this spectrum was sampled on.
    pub grid: GridParams,
}

impl ProcessedSpectrum {
    /// Number of bins in the data region.
    pub fn data_span(&self) -> usize {
        self.right_edge.saturating_sub(self.left_edge) + 1
    }
}

/// Which per-match quality metric drives ranking and clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    /// Correlation peak significance times overlap fraction.
    Rlap,
    /// `rlap` further weighted by capped cosine similarity.
    RlapCos,
}

impl Default for MetricKind {
    fn default() -> Self {
        MetricKind::RlapCos
    }
}

impl MetricKind {
    pub fn label(&self) -> &'static str {
        match self {
            MetricKind::Rlap => "RLAP",
            MetricKind::RlapCos => "RLAP-Cos",
        }
    }
}

/// Correlation curve kept for diagnostics on the best matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationTrace {
    /// Redshift axis, one entry per evaluated lag.
    pub z_axis: Vec<f64>,
    /// Normalized correlation at each lag.
    pub correlation: Vec<f64>,
}

/// Result of correlating one template against the observed spectrum.
///
/// Carries scalar copies of the template metadata so collections of matches
/// can be sorted and serialized without touching the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub template_name: String,
    pub template_type: String,
    pub template_subtype: String,
    pub age_days: f64,
    /// Best-peak redshift (or the forced redshift).
    pub redshift: f64,
    /// Redshift uncertainty from the peak half-width.
    pub redshift_error: f64,
    /// Correlation peak signal-to-noise.
    pub r: f64,
    /// Overlap fraction in [0, 1].
    pub lap: f64,
    /// r * lap.
    pub rlap: f64,
    /// rlap * capped cosine similarity, when computable.
    pub rlap_cos: Option<f64>,
    /// Below lapmin/rlapmin thresholds; kept for diagnostics only.
    pub rejected: bool,
    /// Correlation curve, retained for the top matches only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CorrelationTrace>,
}

impl Match {
    /// The metric value under the given ranking.
    pub fn metric(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Rlap => self.rlap,
            MetricKind::RlapCos => self.rlap_cos.unwrap_or(self.rlap),
        }
    }

    /// The best available metric (rlap_cos when present, rlap otherwise).
    pub fn best_metric(&self) -> f64 {
        self.rlap_cos.unwrap_or(self.rlap)
    }
}

/// Sort matches descending by metric, with a deterministic tie-break on
/// template name so identical runs produce identical orderings.
pub fn sort_matches_by_metric(matches: &mut [Match], kind: MetricKind) {
    matches.sort_by(|a, b| {
        b.metric(kind)
            .partial_cmp(&a.metric(kind))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.template_name.cmp(&b.template_name))
    });
}
