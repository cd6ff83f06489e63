//! Analysis orchestration: correlation fan-out, clustering, assembly.
//!
//! The pipeline is a sequence of synchronous phases. Template correlation
//! fans out over the rayon pool in fixed batches; workers push matches into
//! the batch result and bump a shared counter, and the coordinating thread
//! reports progress and checks cancellation between batches.

use crate::clustering::{cluster_matches, ClusteringConfig, ClusteringResult};
use crate::correlation::{correlate_template, CorrelationConfig, CorrelationError};
use crate::error::SnidError;
use crate::results::{assemble, AnalysisResult};
use crate::templates::{TemplateFilter, TemplateStore};
use crate::types::{Match, MetricKind, ProcessedSpectrum, TraceStep};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Target progress-callback invocations per correlation phase. Batches are
/// sized so the callback rate stays low even on fast template sets.
const PROGRESS_STEPS: usize = 20;

/// Full configuration of one analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub correlation: CorrelationConfig,
    pub clustering: ClusteringConfig,
    pub filter: TemplateFilter,
    /// Ranking metric; rlap_cos unless disabled.
    pub metric: MetricKind,
    pub max_output_templates: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// Cooperative cancellation flag shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress callback: message plus completion in [0, 100]. Invoked from the
/// coordinating thread only.
pub type ProgressFn<'a> = dyn Fn(&str, f64) + Send + Sync + 'a;

/// Runtime hooks for one analysis run.
#[derive(Default)]
pub struct RunOptions<'a> {
    pub progress: Option<&'a ProgressFn<'a>>,
    pub cancel: CancelToken,
    pub timeout: Option<Duration>,
}

/// Correlate the spectrum against every admissible template, cluster the
/// admitted matches, and assemble the final result.
///
/// Per-template numeric failures are swallowed: the template is recorded as
/// rejected in the returned trace and the run continues. A cancellation or
/// timeout after at least one admitted match yields a result flagged
/// `cancelled`; before that it is [`SnidError::Cancelled`].
pub fn run_analysis(
    processed: &ProcessedSpectrum,
    store: &TemplateStore,
    config: &AnalysisConfig,
    options: &RunOptions<'_>,
) -> Result<(AnalysisResult, Vec<TraceStep>), SnidError> {
    let start = Instant::now();
    let deadline = options.timeout.map(|t| start + t);
    let mut trace = Vec::new();

    let templates = store.filter(&config.filter);
    info!(
        total = store.len(),
        admissible = templates.len(),
        "correlation phase starting"
    );
    trace.push(TraceStep::new(
        "template_filter",
        format!("{} of {} templates admissible", templates.len(), store.len()),
    ));
    report(options, "Correlating templates", 0.0);

    let counter = AtomicUsize::new(0);
    let batch_size = (templates.len() / PROGRESS_STEPS).max(1);
    let mut matches: Vec<Match> = Vec::with_capacity(templates.len());
    let mut stopped_early = false;

    for batch in templates.chunks(batch_size) {
        if interrupted(options, deadline) {
            stopped_early = true;
            break;
        }

        let results: Vec<Result<Match, CorrelationError>> = batch
            .par_iter()
            .map(|template| {
                let r = correlate_template(processed, template, &config.correlation);
                counter.fetch_add(1, Ordering::Relaxed);
                r
            })
            .collect();

        for result in results {
            match result {
                Ok(m) => matches.push(m),
                Err(e) => {
                    // Swallowed: recorded as a rejected template.
                    warn!(error = %e, "template correlation failed");
                    trace.push(TraceStep::new("template_rejected", e.to_string()));
                }
            }
        }

        let done = counter.load(Ordering::Relaxed);
        let percent = 90.0 * done as f64 / templates.len().max(1) as f64;
        report(
            options,
            &format!("Processing template {done}/{}", templates.len()),
            percent,
        );
    }

    let admitted = matches.iter().filter(|m| !m.rejected).count();
    trace.push(TraceStep::new(
        "correlation",
        format!(
            "{} matches admitted, {} rejected{}",
            admitted,
            matches.len() - admitted,
            if stopped_early { ", stopped early" } else { "" }
        ),
    ));
    if stopped_early && admitted == 0 {
        return Err(SnidError::Cancelled);
    }

    // Clustering phase. A wholesale numeric failure degrades to "no
    // clustering" rather than aborting the run.
    if !stopped_early && interrupted(options, deadline) {
        stopped_early = true;
    }
    let clustering = if stopped_early {
        ClusteringResult::not_run(config.metric)
    } else {
        report(options, "Clustering matches", 92.0);
        match cluster_matches(&matches, config.metric, &config.clustering) {
            Ok(c) => {
                trace.push(TraceStep::new(
                    "clustering",
                    format!("{} candidate clusters", c.candidates.len()),
                ));
                for conv in &c.convergence {
                    trace.push(TraceStep::new(
                        "gmm_convergence",
                        format!(
                            "type {}: k={} converged={} iterations={}{}",
                            conv.sn_type,
                            conv.n_components,
                            conv.converged,
                            conv.iterations,
                            conv.error
                                .as_deref()
                                .map(|e| format!(" error={e}"))
                                .unwrap_or_default()
                        ),
                    ));
                }
                c
            }
            Err(e) => {
                warn!(error = %e, "clustering failed, continuing without it");
                trace.push(TraceStep::new("clustering_failed", e.to_string()));
                ClusteringResult::not_run(config.metric)
            }
        }
    };

    report(options, "Assembling result", 97.0);
    let runtime_sec = start.elapsed().as_secs_f64();
    let result = assemble(
        processed.clone(),
        &matches,
        clustering,
        config.metric,
        config.max_output_templates,
        runtime_sec,
        stopped_early,
    )?;

    debug!(
        consensus = %result.consensus_type,
        redshift = result.redshift,
        rlap = result.rlap,
        runtime_sec,
        "analysis complete"
    );
    report(options, "Analysis complete", 100.0);
    Ok((result, trace))
}

fn interrupted(options: &RunOptions<'_>, deadline: Option<Instant>) -> bool {
    if options.cancel.is_cancelled() {
        return true;
    }
    matches!(deadline, Some(d) if Instant::now() >= d)
}

fn report(options: &RunOptions<'_>, message: &str, percent: f64) {
    if let Some(cb) = options.progress {
        cb(message, percent);
    }
}

impl AnalysisConfig {
    /// Defaults matching the CLI surface.
    pub fn standard() -> Self {
        Self {
            correlation: CorrelationConfig::default(),
            clustering: ClusteringConfig::default(),
            filter: TemplateFilter::default(),
            metric: MetricKind::RlapCos,
            max_output_templates: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridParams;
    use crate::templates::Template;

    fn hash_noise(i: usize, seed: f64) -> f64 {
        let x = ((i as f64 + seed) * 12.9898).sin() * 43758.5453;
        x - x.floor() - 0.5
    }

    fn make_template(name: &str, sn_type: &str, subtype: &str, seed: f64, grid: &GridParams) -> Template {
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
            age_days: 5.0,
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

    fn shifted_spectrum(template: &Template, lag: i64, grid: &GridParams) -> ProcessedSpectrum {
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
        ProcessedSpectrum {
            log_wave: grid.log_wave(),
            log_flux: flat.iter().map(|&f| f + 1.0).collect(),
            flat_flux: flat.clone(),
            tapered_flux: flat,
            continuum: vec![1.0; nw],
            left_edge: left,
            right_edge: right,
            grid: *grid,
        }
    }

    fn make_store(grid: &GridParams) -> TemplateStore {
        let mut templates = Vec::new();
        for i in 0..6 {
            templates.push(make_template(
                &format!("ia{i}"),
                "Ia",
                "norm",
                1.0,
                grid,
            ));
        }
        for i in 0..4 {
            templates.push(make_template(
                &format!("ii{i}"),
                "II",
                "IIP",
                99.0,
                grid,
            ));
        }
        TemplateStore::from_templates(templates, grid).unwrap()
    }

    #[test]
    fn test_end_to_end_identifies_matching_type() {
        let grid = GridParams::default();
        let store = make_store(&grid);
        let spectrum = shifted_spectrum(&store.all()[5], 15, &grid);

        let config = AnalysisConfig::standard();
        let (result, trace) =
            run_analysis(&spectrum, &store, &config, &RunOptions::default()).unwrap();

        assert!(result.success);
        assert_eq!(result.consensus_type, "Ia");
        assert!(!trace.is_empty());
        let expected_z = (15.0 * grid.dwlog).exp() - 1.0;
        assert!((result.redshift - expected_z).abs() < 0.005);
    }

    #[test]
    fn test_matches_sorted_deterministically() {
        let grid = GridParams::default();
        let store = make_store(&grid);
        let spectrum = shifted_spectrum(&store.all()[5], 15, &grid);
        let config = AnalysisConfig::standard();

        let (a, _) = run_analysis(&spectrum, &store, &config, &RunOptions::default()).unwrap();
        let (b, _) = run_analysis(&spectrum, &store, &config, &RunOptions::default()).unwrap();
        let names_a: Vec<&str> = a
            .filtered_matches
            .iter()
            .map(|m| m.template_name.as_str())
            .collect();
        let names_b: Vec<&str> = b
            .filtered_matches
            .iter()
            .map(|m| m.template_name.as_str())
            .collect();
        assert_eq!(names_a, names_b);
        assert_eq!(a.redshift, b.redshift);
        assert_eq!(a.rlap, b.rlap);
    }

    #[test]
    fn test_thresholds_yield_no_matches() {
        let grid = GridParams::default();
        let store = make_store(&grid);
        let spectrum = shifted_spectrum(&store.all()[5], 15, &grid);

        let mut config = AnalysisConfig::standard();
        config.correlation.rlapmin = 999.0;
        let err = run_analysis(&spectrum, &store, &config, &RunOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            SnidError::Assemble(crate::results::AssembleError::NoMatches)
        ));
    }

    #[test]
    fn test_pre_cancelled_run() {
        let grid = GridParams::default();
        let store = make_store(&grid);
        let spectrum = shifted_spectrum(&store.all()[5], 15, &grid);

        let cancel = CancelToken::new();
        cancel.cancel();
        let options = RunOptions {
            cancel,
            ..Default::default()
        };
        let err =
            run_analysis(&spectrum, &store, &AnalysisConfig::standard(), &options).unwrap_err();
        assert!(matches!(err, SnidError::Cancelled));
    }

    #[test]
    fn test_progress_reported_in_order() {
        let grid = GridParams::default();
        let store = make_store(&grid);
        let spectrum = shifted_spectrum(&store.all()[5], 15, &grid);

        let percents = std::sync::Mutex::new(Vec::new());
        let cb = |_msg: &str, pct: f64| {
            percents.lock().map(|mut v| v.push(pct)).ok();
        };
        let options = RunOptions {
            progress: Some(&cb),
            ..Default::default()
        };
        run_analysis(&spectrum, &store, &AnalysisConfig::standard(), &options).unwrap();

        let percents = percents.into_inner().unwrap();
        assert!(percents.len() >= 3);
        assert_eq!(*percents.last().unwrap(), 100.0);
        for pair in percents.windows(2) {
            assert!(pair[0] <= pair[1], "progress went backwards: {percents:?}");
        }
    }

    #[test]
    fn test_forced_redshift_propagates() {
        let grid = GridParams::default();
        let store = make_store(&grid);
        let spectrum = shifted_spectrum(&store.all()[5], 15, &grid);

        let mut config = AnalysisConfig::standard();
        config.correlation.forced_redshift = Some(0.012);
        config.correlation.rlapmin = 0.0;
        config.correlation.lapmin = 0.0;
        let (result, _) =
            run_analysis(&spectrum, &store, &config, &RunOptions::default()).unwrap();
        for m in &result.filtered_matches {
            assert_eq!(m.redshift, 0.012);
        }
    }
}
