//! Type-aware GMM clustering of template matches in redshift space.
//!
//! Admitted matches are grouped by supernova type; each group is fit with
//! one-dimensional Gaussian mixtures over its raw redshifts, with the
//! component count chosen by BIC. Every component becomes a candidate
//! cluster. The winning cluster is the one with the highest penalized top-5
//! metric score, and carries a subtype vote plus confidence and quality
//! assessments.

pub mod gmm;
mod selection;

pub use selection::{
    choose_subtype_weighted_voting, penalized_top5, weighted_redshift, welch_p_value,
};

use crate::types::{Match, MetricKind};
use gmm::Gmm1d;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Clustering errors
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Clustering failed: {0}")]
    ClusteringFailed(String),
}

/// Lifecycle of a clustering attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusteringState {
    NotRun,
    InsufficientData,
    Succeeded,
}

/// Redshift-span quality classification against the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedshiftQuality {
    Tight,
    Moderate,
    Loose,
    VeryLoose,
}

impl RedshiftQuality {
    /// Classify a redshift span: tight ≤ q, moderate ≤ 2q, loose ≤ 4q.
    pub fn classify(span: f64, threshold: f64) -> Self {
        if span <= threshold {
            RedshiftQuality::Tight
        } else if span <= 2.0 * threshold {
            RedshiftQuality::Moderate
        } else if span <= 4.0 * threshold {
            RedshiftQuality::Loose
        } else {
            RedshiftQuality::VeryLoose
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RedshiftQuality::Tight => "tight",
            RedshiftQuality::Moderate => "moderate",
            RedshiftQuality::Loose => "loose",
            RedshiftQuality::VeryLoose => "very_loose",
        }
    }
}

/// Subtype vote outcome within the winning cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtypeInfo {
    pub best_subtype: String,
    /// Best score over the sum of all subtype scores, in [0, 1].
    pub confidence: f64,
    /// Margin over the runner-up as a percentage of its score.
    pub relative_margin_pct: f64,
    pub second_best_subtype: Option<String>,
}

/// One candidate cluster: a mixture component of one type's matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub sn_type: String,
    /// Component index within the type's mixture.
    pub cluster_id: usize,
    /// Member matches (correlation traces stripped).
    pub matches: Vec<Match>,
    pub mean_rlap: f64,
    pub std_rlap: f64,
    pub mean_metric: f64,
    pub std_metric: f64,
    /// Up to five best metric values, descending.
    pub top_5_values: Vec<f64>,
    pub top_5_mean: f64,
    /// 0.95^(5 - size) for clusters smaller than five, else 1.
    pub penalty_factor: f64,
    pub penalized_score: f64,
    pub weighted_mean_redshift: f64,
    pub weighted_redshift_uncertainty: f64,
    pub redshift_span: f64,
    pub redshift_quality: RedshiftQuality,
    pub subtype_info: Option<SubtypeInfo>,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.matches.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceLevel {
    pub fn label(&self) -> &'static str {
        match self {
            ConfidenceLevel::High => "high",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::VeryLow => "very_low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Significance {
    HighlySignificant,
    Significant,
    MarginallySignificant,
    NotSignificant,
    InsufficientData,
    NotApplicable,
}

impl Significance {
    pub fn label(&self) -> &'static str {
        match self {
            Significance::HighlySignificant => "highly_significant",
            Significance::Significant => "significant",
            Significance::MarginallySignificant => "marginally_significant",
            Significance::NotSignificant => "not_significant",
            Significance::InsufficientData => "insufficient_data",
            Significance::NotApplicable => "n/a",
        }
    }

    /// Classify a two-sample p-value.
    pub fn from_p_value(p: f64) -> Self {
        if p < 0.01 {
            Significance::HighlySignificant
        } else if p < 0.05 {
            Significance::Significant
        } else if p < 0.1 {
            Significance::MarginallySignificant
        } else {
            Significance::NotSignificant
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityCategory {
    High,
    Medium,
    Low,
}

impl QualityCategory {
    pub fn label(&self) -> &'static str {
        match self {
            QualityCategory::High => "high",
            QualityCategory::Medium => "medium",
            QualityCategory::Low => "low",
        }
    }
}

/// Confidence in the winning cluster versus the runner-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    pub level: ConfidenceLevel,
    pub description: String,
    pub margin_vs_second: f64,
    pub relative_margin: f64,
    pub significance: Significance,
    pub second_best_type: Option<String>,
}

/// Absolute quality of the winning cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub category: QualityCategory,
    pub description: String,
    pub mean_top_5: f64,
    pub penalized_score: f64,
    pub penalty_factor: f64,
    pub cluster_size: usize,
}

/// Per-type GMM convergence record; cap hits are reported, never hidden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeConvergence {
    pub sn_type: String,
    pub n_matches: usize,
    pub n_components: usize,
    pub converged: bool,
    pub iterations: usize,
    pub error: Option<String>,
}

/// Outcome of the clustering stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringResult {
    pub state: ClusteringState,
    pub metric: MetricKind,
    pub candidates: Vec<Cluster>,
    /// Index of the automatically chosen winner.
    pub best_index: Option<usize>,
    /// Externally supplied override; never replaces `best_index`.
    pub user_selected_index: Option<usize>,
    pub confidence: Option<ConfidenceAssessment>,
    pub quality: Option<QualityAssessment>,
    pub convergence: Vec<TypeConvergence>,
}

impl ClusteringResult {
    pub fn not_run(metric: MetricKind) -> Self {
        Self {
            state: ClusteringState::NotRun,
            metric,
            candidates: Vec::new(),
            best_index: None,
            user_selected_index: None,
            confidence: None,
            quality: None,
            convergence: Vec::new(),
        }
    }

    fn insufficient(metric: MetricKind) -> Self {
        Self {
            state: ClusteringState::InsufficientData,
            ..Self::not_run(metric)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == ClusteringState::Succeeded
    }

    pub fn best_cluster(&self) -> Option<&Cluster> {
        self.best_index.and_then(|i| self.candidates.get(i))
    }

    /// The cluster driving the reported classification: the user selection
    /// when present, the automatic winner otherwise.
    pub fn selected_cluster(&self) -> Option<&Cluster> {
        self.user_selected_index
            .and_then(|i| self.candidates.get(i))
            .or_else(|| self.best_cluster())
    }
}

/// Clusterer settings.
#[derive(Debug, Clone)]
pub struct ClusteringConfig {
    /// Minimum matches a type needs before it is clustered.
    pub min_matches_per_type: usize,
    pub max_clusters_per_type: usize,
    /// Redshift span threshold for quality classification.
    pub quality_threshold: f64,
    /// Minimum responsibility for subtype-vote membership.
    pub resp_cut: f64,
    /// RNG seed for mixture initialisation.
    pub seed: u64,
    pub tol: f64,
    pub max_iter: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_matches_per_type: 2,
            max_clusters_per_type: 10,
            quality_threshold: 0.02,
            resp_cut: 0.1,
            seed: 42,
            tol: 1e-6,
            max_iter: 200,
        }
    }
}

/// Cluster admitted matches by type and pick the winning cluster.
///
/// Returns `InsufficientData` when no type reaches the match minimum and
/// [`ClusterError::ClusteringFailed`] when every type's mixture fit failed
/// numerically; per-type failures otherwise just drop that type.
pub fn cluster_matches(
    matches: &[Match],
    metric: MetricKind,
    config: &ClusteringConfig,
) -> Result<ClusteringResult, ClusterError> {
    // Group by type in deterministic (lexical) order.
    let mut groups: BTreeMap<&str, Vec<&Match>> = BTreeMap::new();
    for m in matches.iter().filter(|m| !m.rejected) {
        groups.entry(&m.template_type).or_default().push(m);
    }
    groups.retain(|_, v| v.len() >= config.min_matches_per_type);

    if groups.is_empty() {
        return Ok(ClusteringResult::insufficient(metric));
    }

    let mut candidates = Vec::new();
    let mut convergence = Vec::new();
    for (sn_type, type_matches) in &groups {
        match cluster_type(sn_type, type_matches, metric, config) {
            Ok((mut clusters, record)) => {
                debug!(
                    sn_type,
                    clusters = clusters.len(),
                    converged = record.converged,
                    "type clustered"
                );
                convergence.push(record);
                candidates.append(&mut clusters);
            }
            Err(e) => {
                warn!(sn_type, error = %e, "type clustering failed");
                convergence.push(TypeConvergence {
                    sn_type: (*sn_type).to_string(),
                    n_matches: type_matches.len(),
                    n_components: 0,
                    converged: false,
                    iterations: 0,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    if candidates.is_empty() {
        return Err(ClusterError::ClusteringFailed(
            "all per-type mixture fits failed".to_string(),
        ));
    }

    selection::score_candidates(&mut candidates, metric);
    let best_index = selection::pick_best(&candidates);
    let confidence = best_index.map(|i| selection::assess_confidence(&candidates, i));
    let quality = best_index.map(|i| selection::assess_quality(&candidates[i], metric));

    Ok(ClusteringResult {
        state: ClusteringState::Succeeded,
        metric,
        candidates,
        best_index,
        user_selected_index: None,
        confidence,
        quality,
        convergence,
    })
}

/// Cluster one type's matches; returns its candidate clusters and the
/// convergence record.
fn cluster_type(
    sn_type: &str,
    type_matches: &[&Match],
    metric: MetricKind,
    config: &ClusteringConfig,
) -> Result<(Vec<Cluster>, TypeConvergence), gmm::GmmError> {
    let n = type_matches.len();
    let redshifts: Vec<f64> = type_matches.iter().map(|m| m.redshift).collect();
    let max_k = config.max_clusters_per_type.min(n / 2 + 1);

    // Too few members for a mixture: a single cluster holds everything.
    if max_k < 2 {
        let gamma = vec![vec![1.0]; n];
        let cluster = build_cluster(
            sn_type,
            0,
            (0..n).collect(),
            type_matches,
            &gamma,
            metric,
            config,
        );
        let record = TypeConvergence {
            sn_type: sn_type.to_string(),
            n_matches: n,
            n_components: 1,
            converged: true,
            iterations: 0,
            error: None,
        };
        return Ok((cluster.into_iter().collect(), record));
    }

    // BIC model selection over k = 1..max_k.
    let mut best: Option<(Gmm1d, f64)> = None;
    let mut last_err = None;
    for k in 1..=max_k {
        match Gmm1d::fit(&redshifts, k, config.seed, config.tol, config.max_iter) {
            Ok(model) => {
                let bic = model.bic(n);
                if best.as_ref().map_or(true, |(_, b)| bic < *b) {
                    best = Some((model, bic));
                }
            }
            Err(e) => last_err = Some(e),
        }
    }
    let (model, _) = match best {
        Some(b) => b,
        None => {
            return Err(last_err.unwrap_or(gmm::GmmError::TooFewPoints {
                components: 1,
                points: n,
            }))
        }
    };

    let labels = model.predict(&redshifts);
    let gamma = model.responsibilities(&redshifts);

    let mut clusters = Vec::new();
    for c in 0..model.n_components() {
        let indices: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == c)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            continue;
        }
        clusters.extend(build_cluster(
            sn_type,
            c,
            indices,
            type_matches,
            &gamma,
            metric,
            config,
        ));
    }

    let record = TypeConvergence {
        sn_type: sn_type.to_string(),
        n_matches: n,
        n_components: model.n_components(),
        converged: model.converged,
        iterations: model.iterations,
        error: None,
    };
    Ok((clusters, record))
}

/// Assemble a [`Cluster`] for component `cluster_id` from the member indices.
fn build_cluster(
    sn_type: &str,
    cluster_id: usize,
    indices: Vec<usize>,
    type_matches: &[&Match],
    gamma: &[Vec<f64>],
    metric: MetricKind,
    config: &ClusteringConfig,
) -> Option<Cluster> {
    if indices.is_empty() {
        return None;
    }
    let members: Vec<Match> = indices
        .iter()
        .map(|&i| {
            let mut m = type_matches[i].clone();
            m.correlation = None;
            m
        })
        .collect();

    let rlaps: Vec<f64> = members.iter().map(|m| m.rlap).collect();
    let metrics: Vec<f64> = members.iter().map(|m| m.metric(metric)).collect();
    let zs: Vec<f64> = members.iter().map(|m| m.redshift).collect();
    let z_errs: Vec<f64> = members.iter().map(|m| m.redshift_error).collect();

    let z_min = zs.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let z_max = zs.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let redshift_span = (z_max - z_min).max(0.0);

    let (wz, wz_err) = weighted_redshift(&zs, &z_errs);

    let subtype_info =
        choose_subtype_weighted_voting(type_matches, gamma, cluster_id, metric, config.resp_cut);

    Some(Cluster {
        sn_type: sn_type.to_string(),
        cluster_id,
        matches: members,
        mean_rlap: mean(&rlaps),
        std_rlap: std_dev(&rlaps),
        mean_metric: mean(&metrics),
        std_metric: std_dev(&metrics),
        top_5_values: Vec::new(),
        top_5_mean: 0.0,
        penalty_factor: 1.0,
        penalized_score: 0.0,
        weighted_mean_redshift: wz,
        weighted_redshift_uncertainty: wz_err,
        redshift_span,
        redshift_quality: RedshiftQuality::classify(redshift_span, config.quality_threshold),
        subtype_info,
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}
