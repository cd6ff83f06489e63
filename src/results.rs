//! Final result assembly: ranked matches, consensus classification, and the
//! pure cluster-override operation.

use crate::clustering::{Cluster, ClusteringResult};
use crate::types::{sort_matches_by_metric, Match, MetricKind, ProcessedSpectrum};
use serde::Serialize;
use thiserror::Error;

/// How many of the ranked matches keep their correlation trace.
const TRACES_KEPT: usize = 5;

/// Result assembly errors
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("No good matches above rlap/lap thresholds")]
    NoMatches,

    #[error("Cluster index {0} out of range")]
    InvalidClusterIndex(usize),
}

/// Everything returned to the caller for one analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub success: bool,
    /// The run was cancelled; statistics cover the templates finished so far.
    pub cancelled: bool,
    pub consensus_type: String,
    pub best_subtype: String,
    pub redshift: f64,
    pub redshift_error: f64,
    pub rlap: f64,
    pub template_name: String,
    /// Ranked matches restricted to the winning cluster (all ranked matches
    /// when clustering did not run).
    pub best_matches: Vec<Match>,
    /// Admitted matches ranked by the selected metric, truncated to the
    /// output limit.
    pub filtered_matches: Vec<Match>,
    pub clustering: ClusteringResult,
    /// Type shares over the chosen match set, descending.
    pub type_fractions: Vec<(String, f64)>,
    /// Subtype shares over the chosen match set, descending.
    pub subtype_fractions: Vec<(String, f64)>,
    /// Metric-weighted mean template age and its uncertainty, when any
    /// member carries an age.
    pub weighted_age: Option<(f64, f64)>,
    /// Wall-clock runtime. Excluded from serialization so identical inputs
    /// serialize identically.
    #[serde(skip_serializing)]
    pub runtime_sec: f64,
    /// The preprocessed spectrum the analysis ran on (not serialized).
    #[serde(skip_serializing)]
    pub processed: ProcessedSpectrum,
}

/// Assemble the final result from the correlation output and the clustering
/// outcome.
pub fn assemble(
    processed: ProcessedSpectrum,
    matches: &[Match],
    clustering: ClusteringResult,
    metric: MetricKind,
    max_output_templates: usize,
    runtime_sec: f64,
    cancelled: bool,
) -> Result<AnalysisResult, AssembleError> {
    let mut admitted: Vec<Match> = matches.iter().filter(|m| !m.rejected).cloned().collect();
    if admitted.is_empty() {
        return Err(AssembleError::NoMatches);
    }
    sort_matches_by_metric(&mut admitted, metric);
    admitted.truncate(max_output_templates);
    for m in admitted.iter_mut().skip(TRACES_KEPT) {
        m.correlation = None;
    }
    let filtered_matches = admitted;

    let mut result = match clustering.selected_cluster() {
        Some(cluster) => from_cluster(processed, &filtered_matches, cluster, metric),
        None => from_top_match(processed, &filtered_matches, metric),
    };

    result.clustering = clustering;
    result.runtime_sec = runtime_sec;
    result.cancelled = cancelled;
    Ok(result)
}

/// Re-derive a result for an externally chosen cluster. Pure: the input is
/// untouched, `best_cluster` is preserved, and only `user_selected_cluster`
/// plus the derived fields change.
pub fn choose_cluster(
    result: &AnalysisResult,
    index: usize,
) -> Result<AnalysisResult, AssembleError> {
    if index >= result.clustering.candidates.len() {
        return Err(AssembleError::InvalidClusterIndex(index));
    }
    let mut clustering = result.clustering.clone();
    clustering.user_selected_index = Some(index);

    let metric = clustering.metric;
    let mut rederived = from_cluster(
        result.processed.clone(),
        &result.filtered_matches,
        &clustering.candidates[index],
        metric,
    );
    rederived.clustering = clustering;
    rederived.runtime_sec = result.runtime_sec;
    rederived.cancelled = result.cancelled;
    Ok(rederived)
}

fn from_cluster(
    processed: ProcessedSpectrum,
    filtered_matches: &[Match],
    cluster: &Cluster,
    metric: MetricKind,
) -> AnalysisResult {
    // Ranked matches that belong to the winning cluster.
    let best_matches: Vec<Match> = filtered_matches
        .iter()
        .filter(|m| {
            cluster
                .matches
                .iter()
                .any(|cm| cm.template_name == m.template_name)
        })
        .cloned()
        .collect();

    // The cluster's own top member supplies the headline rlap and template.
    let mut members = cluster.matches.clone();
    sort_matches_by_metric(&mut members, metric);
    let top = &members[0];

    let best_subtype = cluster
        .subtype_info
        .as_ref()
        .map(|s| s.best_subtype.clone())
        .unwrap_or_else(|| top.template_subtype.clone());

    let (type_fractions, subtype_fractions) = fractions(&cluster.matches);
    let weighted_age = weighted_age(&cluster.matches, metric);

    AnalysisResult {
        success: true,
        cancelled: false,
        consensus_type: cluster.sn_type.clone(),
        best_subtype,
        redshift: cluster.weighted_mean_redshift,
        redshift_error: cluster.weighted_redshift_uncertainty,
        rlap: top.rlap,
        template_name: top.template_name.clone(),
        best_matches,
        filtered_matches: filtered_matches.to_vec(),
        clustering: ClusteringResult::not_run(metric),
        type_fractions,
        subtype_fractions,
        weighted_age,
        runtime_sec: 0.0,
        processed,
    }
}

fn from_top_match(
    processed: ProcessedSpectrum,
    filtered_matches: &[Match],
    metric: MetricKind,
) -> AnalysisResult {
    let top = &filtered_matches[0];
    let (type_fractions, subtype_fractions) = fractions(filtered_matches);
    let weighted_age = weighted_age(filtered_matches, metric);

    AnalysisResult {
        success: true,
        cancelled: false,
        consensus_type: top.template_type.clone(),
        best_subtype: top.template_subtype.clone(),
        redshift: top.redshift,
        redshift_error: top.redshift_error,
        rlap: top.rlap,
        template_name: top.template_name.clone(),
        best_matches: filtered_matches.to_vec(),
        filtered_matches: filtered_matches.to_vec(),
        clustering: ClusteringResult::not_run(metric),
        type_fractions,
        subtype_fractions,
        weighted_age,
        runtime_sec: 0.0,
        processed,
    }
}

/// Member counts normalized to 1, descending by share then name.
fn fractions(matches: &[Match]) -> (Vec<(String, f64)>, Vec<(String, f64)>) {
    let count = |key: fn(&Match) -> &str| -> Vec<(String, f64)> {
        let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
        for m in matches {
            *counts.entry(key(m)).or_insert(0) += 1;
        }
        let total = matches.len().max(1) as f64;
        let mut out: Vec<(String, f64)> = counts
            .into_iter()
            .map(|(k, v)| (k.to_string(), v as f64 / total))
            .collect();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        out
    };
    (
        count(|m| &m.template_type),
        count(|m| &m.template_subtype),
    )
}

/// Metric-weighted mean template age over members with positive ages, with
/// the weighted scatter over √n as its uncertainty.
fn weighted_age(matches: &[Match], metric: MetricKind) -> Option<(f64, f64)> {
    let aged: Vec<(f64, f64)> = matches
        .iter()
        .filter(|m| m.age_days > 0.0)
        .map(|m| (m.age_days, m.metric(metric).max(0.0)))
        .collect();
    if aged.is_empty() {
        return None;
    }
    let wsum: f64 = aged.iter().map(|(_, w)| w).sum();
    if wsum <= 0.0 {
        return None;
    }
    let mean = aged.iter().map(|(a, w)| a * w).sum::<f64>() / wsum;
    let scatter =
        (aged.iter().map(|(a, w)| w * (a - mean).powi(2)).sum::<f64>() / wsum).sqrt();
    let err = scatter / (aged.len() as f64).sqrt();
    Some((mean, err))
}
