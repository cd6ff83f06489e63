//! Result artifact writers.
//!
//! Every file is written atomically: content goes to a temporary path in the
//! target directory first and is renamed into place, so a failed run never
//! leaves partial artifacts.

use super::IoError;
use crate::results::AnalysisResult;
use crate::templates::TemplateStore;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Output verbosity selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Main result file only.
    Minimal,
    /// Main result file only (default mode).
    Standard,
    /// All artifacts: spectra, correlation curves, per-template data, JSON.
    Complete,
}

/// How many ranked matches get per-template data files.
const TEMPLATE_FILES: usize = 5;

/// Write the result artifacts for one analysis into `dir`.
///
/// Returns the paths written. The directory is created if missing.
pub fn write_outputs(
    result: &AnalysisResult,
    name: &str,
    dir: &Path,
    mode: OutputMode,
    store: Option<&TemplateStore>,
) -> Result<Vec<PathBuf>, IoError> {
    std::fs::create_dir_all(dir).map_err(|e| IoError::WriteFailure {
        path: dir.display().to_string(),
        source: e,
    })?;
    let mut written = Vec::new();

    let output_path = dir.join(format!("{name}.output"));
    write_atomic(&output_path, render_summary(result, name).as_bytes())?;
    written.push(output_path);

    if mode != OutputMode::Complete {
        return Ok(written);
    }

    // Fluxed and flattened spectra over the data region.
    let p = &result.processed;
    let fluxed = two_column(
        &p.log_wave[p.left_edge..=p.right_edge],
        &p.log_flux[p.left_edge..=p.right_edge],
    );
    let path = dir.join(format!("{name}.fluxed"));
    write_atomic(&path, fluxed.as_bytes())?;
    written.push(path);

    let flattened = two_column(
        &p.log_wave[p.left_edge..=p.right_edge],
        &p.flat_flux[p.left_edge..=p.right_edge],
    );
    let path = dir.join(format!("{name}.flattened"));
    write_atomic(&path, flattened.as_bytes())?;
    written.push(path);

    // Correlation curve of the best match.
    let ranked = if result.best_matches.is_empty() {
        &result.filtered_matches
    } else {
        &result.best_matches
    };
    if let Some(trace) = ranked.first().and_then(|m| m.correlation.as_ref()) {
        let path = dir.join(format!("{name}.correlation.dat"));
        write_atomic(&path, two_column(&trace.z_axis, &trace.correlation).as_bytes())?;
        written.push(path);
    }

    // Per-template data for the top matches.
    for (rank, m) in ranked.iter().take(TEMPLATE_FILES).enumerate() {
        let rank = rank + 1;
        if let Some(template) =
            store.and_then(|s| s.all().iter().find(|t| t.name == m.template_name))
        {
            let mut content = String::from("# log_wave  flat_flux  flux\n");
            let fluxed = template.unflattened();
            for i in 0..template.flat_flux.len() {
                let _ = writeln!(
                    content,
                    "{:12.4} {:14.6e} {:14.6e}",
                    p.log_wave[i], template.flat_flux[i], fluxed[i]
                );
            }
            let path = dir.join(format!("{name}_template_{rank}_{}.dat", m.template_name));
            write_atomic(&path, content.as_bytes())?;
            written.push(path);
        }
        if let Some(trace) = m.correlation.as_ref() {
            let path = dir.join(format!(
                "{name}_template_{rank}_{}_corr.dat",
                m.template_name
            ));
            write_atomic(&path, two_column(&trace.z_axis, &trace.correlation).as_bytes())?;
            written.push(path);
        }
    }

    // Machine-readable export of the full result.
    let json = serde_json::to_string_pretty(result).map_err(|e| {
        IoError::InvalidInput(format!("result serialization failed: {e}"))
    })?;
    let path = dir.join(format!("{name}.result.json"));
    write_atomic(&path, json.as_bytes())?;
    written.push(path);

    debug!(files = written.len(), dir = %dir.display(), "artifacts written");
    Ok(written)
}

/// Human-readable `.output` summary. Deliberately timestamp-free so repeated
/// runs on identical inputs produce identical bytes.
pub fn render_summary(result: &AnalysisResult, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# SNID SAGE classification: {name}");
    let _ = writeln!(out, "#");

    let _ = writeln!(out, "Consensus type   : {}", result.consensus_type);
    let _ = writeln!(out, "Best subtype     : {}", result.best_subtype);
    let _ = writeln!(
        out,
        "Redshift         : {:.6} +/- {:.6}",
        result.redshift, result.redshift_error
    );
    let _ = writeln!(out, "Best template    : {}", result.template_name);
    let _ = writeln!(out, "RLAP             : {:.2}", result.rlap);
    if let Some((age, err)) = result.weighted_age {
        let _ = writeln!(out, "Weighted age     : {age:.1} +/- {err:.1} days");
    }
    if result.cancelled {
        let _ = writeln!(out, "NOTE             : run cancelled, partial statistics");
    }

    if let Some(cluster) = result.clustering.selected_cluster() {
        let _ = writeln!(out, "\nWinning cluster:");
        let _ = writeln!(
            out,
            "  Type / size    : {} cluster {} with {} members",
            cluster.sn_type,
            cluster.cluster_id,
            cluster.size()
        );
        let _ = writeln!(
            out,
            "  Redshift       : {:.6} +/- {:.6} (span {:.4}, {})",
            cluster.weighted_mean_redshift,
            cluster.weighted_redshift_uncertainty,
            cluster.redshift_span,
            cluster.redshift_quality.label()
        );
        let _ = writeln!(
            out,
            "  Score          : top-5 mean {:.2}, penalty {:.2}, penalized {:.2}",
            cluster.top_5_mean, cluster.penalty_factor, cluster.penalized_score
        );
        if let Some(q) = &result.clustering.quality {
            let _ = writeln!(out, "  Quality        : {} ({})", q.category.label(), q.description);
        }
        if let Some(c) = &result.clustering.confidence {
            let _ = writeln!(
                out,
                "  Confidence     : {} (significance {})",
                c.level.label(),
                c.significance.label()
            );
            let _ = writeln!(out, "                   {}", c.description);
        }
        if let Some(s) = &cluster.subtype_info {
            let _ = writeln!(
                out,
                "  Subtype vote   : {} (confidence {:.2}, margin {:.1}% over {})",
                s.best_subtype,
                s.confidence,
                s.relative_margin_pct,
                s.second_best_subtype.as_deref().unwrap_or("none")
            );
        }
    } else {
        let _ = writeln!(out, "\nClustering       : not available (top match used)");
    }

    let fraction_line = |pairs: &[(String, f64)]| {
        pairs
            .iter()
            .map(|(k, v)| format!("{k} {v:.2}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let _ = writeln!(out, "\nType fractions   : {}", fraction_line(&result.type_fractions));
    let _ = writeln!(
        out,
        "Subtype fractions: {}",
        fraction_line(&result.subtype_fractions)
    );

    let _ = writeln!(out, "\nRanked matches:");
    let _ = writeln!(
        out,
        "{:>4} {:<18} {:<6} {:<10} {:>7} {:>9} {:>9} {:>7} {:>6} {:>9}",
        "rank", "template", "type", "subtype", "age", "z", "zerr", "rlap", "lap", "rlap_cos"
    );
    for (i, m) in result.filtered_matches.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>4} {:<18} {:<6} {:<10} {:>7.1} {:>9.5} {:>9.5} {:>7.2} {:>6.2} {:>9}",
            i + 1,
            m.template_name,
            m.template_type,
            m.template_subtype,
            m.age_days,
            m.redshift,
            m.redshift_error,
            m.rlap,
            m.lap,
            m.rlap_cos
                .map(|v| format!("{v:.2}"))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    out
}

fn two_column(x: &[f64], y: &[f64]) -> String {
    let mut out = String::with_capacity(x.len() * 28);
    for (a, b) in x.iter().zip(y) {
        let _ = writeln!(out, "{a:14.6} {b:16.8e}");
    }
    out
}

/// Write through a temporary file in the same directory, then rename.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), IoError> {
    let failure = |source: std::io::Error| IoError::WriteFailure {
        path: path.display().to_string(),
        source,
    };
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    if let Err(e) = std::fs::write(&tmp, content) {
        let _ = std::fs::remove_file(&tmp);
        return Err(failure(e));
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(failure(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::ClusteringResult;
    use crate::grid::GridParams;
    use crate::results::assemble;
    use crate::types::{CorrelationTrace, Match, MetricKind, ProcessedSpectrum};

    fn make_result() -> AnalysisResult {
        let grid = GridParams::default();
        let processed = ProcessedSpectrum {
            log_wave: grid.log_wave(),
            log_flux: vec![1.0; grid.nw],
            flat_flux: vec![0.1; grid.nw],
            tapered_flux: vec![0.1; grid.nw],
            continuum: vec![1.0; grid.nw],
            left_edge: 10,
            right_edge: grid.nw - 11,
            grid,
        };
        let matches = vec![Match {
            template_name: "sn1994d".to_string(),
            template_type: "Ia".to_string(),
            template_subtype: "norm".to_string(),
            age_days: 3.0,
            redshift: 0.0213,
            redshift_error: 0.0004,
            r: 14.0,
            lap: 0.8,
            rlap: 11.2,
            rlap_cos: Some(10.9),
            rejected: false,
            correlation: Some(CorrelationTrace {
                z_axis: vec![0.0, 0.01, 0.02, 0.03],
                correlation: vec![0.1, 0.4, 1.0, 0.3],
            }),
        }];
        assemble(
            processed,
            &matches,
            ClusteringResult::not_run(MetricKind::RlapCos),
            MetricKind::RlapCos,
            10,
            0.5,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_minimal_writes_only_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = make_result();
        let written =
            write_outputs(&result, "spec", dir.path(), OutputMode::Minimal, None).unwrap();
        assert_eq!(written.len(), 1);
        assert!(dir.path().join("spec.output").exists());
        assert!(!dir.path().join("spec.fluxed").exists());
    }

    #[test]
    fn test_complete_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let result = make_result();
        let written =
            write_outputs(&result, "spec", dir.path(), OutputMode::Complete, None).unwrap();
        assert!(dir.path().join("spec.output").exists());
        assert!(dir.path().join("spec.fluxed").exists());
        assert!(dir.path().join("spec.flattened").exists());
        assert!(dir.path().join("spec.correlation.dat").exists());
        assert!(dir.path().join("spec.result.json").exists());
        assert!(written.len() >= 5);
    }

    #[test]
    fn test_no_temp_files_left() {
        let dir = tempfile::tempdir().unwrap();
        let result = make_result();
        write_outputs(&result, "spec", dir.path(), OutputMode::Complete, None).unwrap();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                !name.to_string_lossy().ends_with(".tmp"),
                "temp file left: {name:?}"
            );
        }
    }

    #[test]
    fn test_summary_contains_key_fields() {
        let result = make_result();
        let text = render_summary(&result, "spec");
        assert!(text.contains("Consensus type   : Ia"));
        assert!(text.contains("Best subtype     : norm"));
        assert!(text.contains("sn1994d"));
        assert!(text.contains("Ranked matches:"));
        assert!(text.contains("0.021300"));
    }

    #[test]
    fn test_summary_deterministic() {
        let result = make_result();
        let a = render_summary(&result, "spec");
        let b = render_summary(&result, "spec");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fluxed_covers_data_region_only() {
        let dir = tempfile::tempdir().unwrap();
        let result = make_result();
        write_outputs(&result, "spec", dir.path(), OutputMode::Complete, None).unwrap();
        let content = std::fs::read_to_string(dir.path().join("spec.fluxed")).unwrap();
        let rows = content.lines().count();
        assert_eq!(rows, result.processed.data_span());
    }
}
