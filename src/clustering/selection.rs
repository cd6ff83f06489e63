//! Winning-cluster selection, confidence and quality assessment, and the
//! subtype weighted vote.

use super::{
    Cluster, ConfidenceAssessment, ConfidenceLevel, QualityAssessment, QualityCategory,
    Significance, SubtypeInfo,
};
use crate::types::{Match, MetricKind};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::BTreeMap;

/// Top-5 scoring: mean of the up-to-five best values, with a 5% penalty per
/// missing member below five. Returns (top values desc, mean, penalty, score).
pub fn penalized_top5(values: &[f64]) -> (Vec<f64>, f64, f64, f64) {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    sorted.truncate(5);
    if sorted.is_empty() {
        return (sorted, 0.0, 1.0, 0.0);
    }
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    let penalty = if values.len() < 5 {
        0.95f64.powi((5 - values.len()) as i32)
    } else {
        1.0
    };
    (sorted, mean, penalty, mean * penalty)
}

/// Fill the top-5 fields of every candidate cluster.
pub fn score_candidates(candidates: &mut [Cluster], metric: MetricKind) {
    for c in candidates.iter_mut() {
        let values: Vec<f64> = c.matches.iter().map(|m| m.metric(metric)).collect();
        let (top, mean, penalty, score) = penalized_top5(&values);
        c.top_5_values = top;
        c.top_5_mean = mean;
        c.penalty_factor = penalty;
        c.penalized_score = score;
    }
}

/// Index of the winning cluster: maximum penalized score, ties broken by
/// larger size, then lexically smaller type name, then lower cluster id.
pub fn pick_best(candidates: &[Cluster]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, c) in candidates.iter().enumerate() {
        let better = match best {
            None => true,
            Some(b) => {
                let cur = &candidates[b];
                c.penalized_score > cur.penalized_score
                    || (c.penalized_score == cur.penalized_score
                        && (c.size() > cur.size()
                            || (c.size() == cur.size()
                                && (c.sn_type < cur.sn_type
                                    || (c.sn_type == cur.sn_type
                                        && c.cluster_id < cur.cluster_id)))))
            }
        };
        if better {
            best = Some(i);
        }
    }
    best
}

/// Confidence of the winner versus the runner-up by penalized score.
pub fn assess_confidence(candidates: &[Cluster], best_index: usize) -> ConfidenceAssessment {
    let best = &candidates[best_index];

    // Runner-up: best score among the others.
    let second = candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != best_index)
        .max_by(|(_, a), (_, b)| {
            a.penalized_score
                .partial_cmp(&b.penalized_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(_, c)| c);

    let Some(second) = second else {
        return ConfidenceAssessment {
            level: ConfidenceLevel::High,
            description: "Only one cluster available".to_string(),
            margin_vs_second: f64::INFINITY,
            relative_margin: f64::INFINITY,
            significance: Significance::NotApplicable,
            second_best_type: None,
        };
    };

    let margin = best.penalized_score - second.penalized_score;
    let relative_margin = if second.penalized_score > 0.0 {
        margin / second.penalized_score
    } else {
        f64::INFINITY
    };

    let level = if relative_margin >= 0.30 {
        ConfidenceLevel::High
    } else if relative_margin >= 0.15 {
        ConfidenceLevel::Medium
    } else if relative_margin >= 0.05 {
        ConfidenceLevel::Low
    } else {
        ConfidenceLevel::VeryLow
    };

    let significance = if best.top_5_values.len() >= 2 && second.top_5_values.len() >= 2 {
        match welch_p_value(&best.top_5_values, &second.top_5_values) {
            Some(p) => Significance::from_p_value(p),
            None => Significance::InsufficientData,
        }
    } else {
        Significance::InsufficientData
    };

    ConfidenceAssessment {
        level,
        description: format!(
            "Winning cluster is {:.1}% better than second best",
            relative_margin * 100.0
        ),
        margin_vs_second: margin,
        relative_margin,
        significance,
        second_best_type: Some(second.sn_type.clone()),
    }
}

/// Absolute quality of the winning cluster from its penalized top-5 score.
pub fn assess_quality(best: &Cluster, metric: MetricKind) -> QualityAssessment {
    let score = best.penalized_score;
    let (category, adjective) = if score >= 10.0 {
        (QualityCategory::High, "Excellent")
    } else if score >= 5.0 {
        (QualityCategory::Medium, "Good")
    } else {
        (QualityCategory::Low, "Poor")
    };

    let mut description = format!(
        "{} match quality (penalized top-5 {}: {:.1})",
        adjective,
        metric.label(),
        score
    );
    if best.penalty_factor < 1.0 {
        description.push_str(&format!(
            " [penalty {:.2} for {} matches < 5]",
            best.penalty_factor,
            best.size()
        ));
    }

    QualityAssessment {
        category,
        description,
        mean_top_5: best.top_5_mean,
        penalized_score: score,
        penalty_factor: best.penalty_factor,
        cluster_size: best.size(),
    }
}

/// Welch two-sample t-test p-value (two-tailed). `None` when either sample is
/// too small or both are degenerate.
pub fn welch_p_value(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() < 2 || b.len() < 2 {
        return None;
    }
    let (ma, va, na) = sample_stats(a);
    let (mb, vb, nb) = sample_stats(b);

    let se2 = va / na + vb / nb;
    if se2 <= 0.0 {
        // No variance at all: distinct means are trivially separated.
        return Some(if (ma - mb).abs() < 1e-300 { 1.0 } else { 0.0 });
    }
    let t = (ma - mb) / se2.sqrt();

    // Welch–Satterthwaite degrees of freedom.
    let df = se2 * se2
        / ((va / na).powi(2) / (na - 1.0) + (vb / nb).powi(2) / (nb - 1.0)).max(f64::MIN_POSITIVE);
    if !df.is_finite() || df <= 0.0 {
        return None;
    }

    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some(2.0 * (1.0 - dist.cdf(t.abs())))
}

fn sample_stats(x: &[f64]) -> (f64, f64, f64) {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    // Unbiased sample variance.
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var, n)
}

/// Inverse-variance weighted mean redshift, with a cluster-scatter term
/// widening the uncertainty when members disagree beyond their per-match
/// errors.
pub fn weighted_redshift(redshifts: &[f64], errors: &[f64]) -> (f64, f64) {
    if redshifts.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let weights: Vec<f64> = errors
        .iter()
        .map(|&e| 1.0 / e.max(1e-6).powi(2))
        .collect();
    let wsum: f64 = weights.iter().sum();
    let z_mean = redshifts
        .iter()
        .zip(&weights)
        .map(|(&z, &w)| z * w)
        .sum::<f64>()
        / wsum;
    let err_mean = (1.0 / wsum).sqrt();

    let scatter2 = redshifts
        .iter()
        .zip(&weights)
        .map(|(&z, &w)| w * (z - z_mean).powi(2))
        .sum::<f64>()
        / wsum;
    let n = redshifts.len() as f64;
    let err = (err_mean * err_mean + scatter2 / n).sqrt();
    (z_mean, err)
}

/// Weighted subtype vote inside the winning component.
///
/// Members are the type's matches with responsibility γ[i][k*] at or above
/// `resp_cut`; each subtype is scored with the same penalized top-5 rule used
/// for clusters.
pub fn choose_subtype_weighted_voting(
    type_matches: &[&Match],
    gamma: &[Vec<f64>],
    k_star: usize,
    metric: MetricKind,
    resp_cut: f64,
) -> Option<SubtypeInfo> {
    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (i, m) in type_matches.iter().enumerate() {
        let resp = gamma.get(i).and_then(|row| row.get(k_star)).copied()?;
        if resp < resp_cut {
            continue;
        }
        let subtype = if m.template_subtype.trim().is_empty() {
            "Unknown".to_string()
        } else {
            m.template_subtype.clone()
        };
        groups.entry(subtype).or_default().push(m.metric(metric));
    }
    if groups.is_empty() {
        return None;
    }

    let scores: Vec<(String, f64)> = groups
        .into_iter()
        .map(|(subtype, values)| {
            let (_, _, _, score) = penalized_top5(&values);
            (subtype, score)
        })
        .collect();

    // Highest score wins; the BTreeMap ordering makes ties deterministic.
    let mut ranked = scores.clone();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let (best_subtype, best_score) = ranked[0].clone();
    let total: f64 = ranked.iter().map(|(_, s)| s).sum();
    let confidence = if total > 0.0 { best_score / total } else { 0.0 };

    let (second_best_subtype, relative_margin_pct) = match ranked.get(1) {
        Some((name, second_score)) if *second_score > 0.0 => (
            Some(name.clone()),
            100.0 * (best_score - second_score) / second_score,
        ),
        Some((name, _)) => (Some(name.clone()), 0.0),
        None => (None, 0.0),
    };

    Some(SubtypeInfo {
        best_subtype,
        confidence,
        relative_margin_pct,
        second_best_subtype,
    })
}
