//! SNID SAGE command-line interface.
//!
//! Identifies a supernova spectrum against a reference template library:
//!
//! ```bash
//! # Basic identification
//! snid identify spectrum.txt templates/ -o results/
//!
//! # Complete outputs with smoothing and a type whitelist
//! snid identify spectrum.txt templates/ -o results/ --complete \
//!     --savgol-window 11 --type-filter Ia Ib
//!
//! # Forced redshift (skips the redshift search)
//! snid identify spectrum.txt templates/ -o results/ --forced-redshift 0.05
//! ```
//!
//! Exit code 0 on success, 1 on any failure (errors go to stderr prefixed
//! `[ERROR]`). `RUST_LOG` controls log verbosity beyond `--verbose`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use snid_sage::clustering::ClusteringConfig;
use snid_sage::correlation::CorrelationConfig;
use snid_sage::io::{read_spectrum, write_outputs, OutputMode};
use snid_sage::pipeline::{run_analysis, AnalysisConfig, RunOptions};
use snid_sage::preprocessing::{preprocess, PreprocessOptions};
use snid_sage::templates::{TemplateFilter, TemplateStore};
use snid_sage::types::MetricKind;
use snid_sage::{global_grid, AnalysisResult};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "snid")]
#[command(about = "SNID SAGE - supernova spectrum identification")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Identify a spectrum against the template library
    Identify(IdentifyArgs),
}

#[derive(Args, Debug)]
struct IdentifyArgs {
    /// Path to the input spectrum (ASCII, lnw, or FITS)
    spectrum_path: PathBuf,

    /// Template library directory (default: ./templates)
    templates_dir: Option<PathBuf>,

    /// Directory for output files
    #[arg(short = 'o', long, required = true)]
    output_dir: PathBuf,

    /// Minimal mode: main result file only
    #[arg(long, conflicts_with = "complete")]
    minimal: bool,

    /// Complete mode: all artifacts including per-template data files
    #[arg(long)]
    complete: bool,

    /// Minimum redshift to consider
    #[arg(long, default_value_t = -0.01, allow_hyphen_values = true)]
    zmin: f64,

    /// Maximum redshift to consider
    #[arg(long, default_value_t = 1.0)]
    zmax: f64,

    /// Minimum rlap value required
    #[arg(long, default_value_t = 5.0)]
    rlapmin: f64,

    /// Minimum overlap fraction required
    #[arg(long, default_value_t = 0.3)]
    lapmin: f64,

    /// Force analysis to this redshift (disables the redshift search)
    #[arg(long, allow_hyphen_values = true)]
    forced_redshift: Option<f64>,

    /// Savitzky-Golay window in pixels (0 disables)
    #[arg(long, default_value_t = 0)]
    savgol_window: usize,

    /// Savitzky-Golay smoothing as a wavelength FWHM in Angstroms (0 disables)
    #[arg(long, default_value_t = 0.0)]
    savgol_fwhm: f64,

    /// Savitzky-Golay polynomial order
    #[arg(long, default_value_t = 3)]
    savgol_order: usize,

    /// Remove the telluric A-band
    #[arg(long)]
    aband_remove: bool,

    /// Clip night-sky emission lines
    #[arg(long)]
    skyclip: bool,

    /// Redshift at which to clip host emission lines (-1 disables)
    #[arg(long, default_value_t = -1.0, allow_hyphen_values = true)]
    emclip_z: f64,

    /// Width in Angstroms for emission/sky clipping
    #[arg(long, default_value_t = 40.0)]
    emwidth: f64,

    /// Percentage of the data region to apodize at each end
    #[arg(long, default_value_t = 10.0)]
    apodize_percent: f64,

    /// Wavelength ranges to mask out (format: 6550:6600)
    #[arg(long, value_name = "WMIN:WMAX", num_args = 1..)]
    wavelength_masks: Vec<String>,

    /// Minimum template age in days
    #[arg(long, allow_hyphen_values = true)]
    age_min: Option<f64>,

    /// Maximum template age in days
    #[arg(long, allow_hyphen_values = true)]
    age_max: Option<f64>,

    /// Only use templates of these types
    #[arg(long, num_args = 1..)]
    type_filter: Vec<String>,

    /// Only use these templates (by name)
    #[arg(long, num_args = 1..)]
    template_filter: Vec<String>,

    /// Exclude these templates (by name)
    #[arg(long, num_args = 1..)]
    exclude_templates: Vec<String>,

    /// Peak detection window size in bins
    #[arg(long, default_value_t = 10)]
    peak_window_size: usize,

    /// Maximum number of ranked matches to output
    #[arg(long, default_value_t = 10)]
    max_output_templates: usize,

    /// Accepted for compatibility; plotting is handled externally
    #[arg(long)]
    save_plots: bool,

    /// Print detailed processing information
    #[arg(short, long)]
    verbose: bool,
}

// ============================================================================
// Entry point
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let Command::Identify(args) = cli.command;

    init_logging(args.verbose);

    if let Err(e) = run_identify(&args) {
        eprintln!("[ERROR] {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_identify(args: &IdentifyArgs) -> Result<()> {
    let spectrum_name = args
        .spectrum_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "spectrum".to_string());

    let grid = global_grid();

    // Ingest and preprocess.
    let raw = read_spectrum(&args.spectrum_path)
        .with_context(|| format!("reading {}", args.spectrum_path.display()))?;
    info!(samples = raw.len(), "spectrum loaded");

    let options = preprocess_options(args)?;
    let (processed, preprocess_trace) = preprocess(&raw, &options, &grid)?;

    // Template library.
    let templates_dir = args
        .templates_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("templates"));
    let store = TemplateStore::open(&templates_dir, &grid)?;

    // Analysis.
    let config = analysis_config(args);
    if args.save_plots {
        info!("plot generation is handled outside the analysis pipeline");
    }
    let progress = progress_printer(args.verbose);
    let run_options = RunOptions {
        progress: progress.as_deref(),
        ..Default::default()
    };
    let (result, analysis_trace) = run_analysis(&processed, &store, &config, &run_options)?;
    if progress.is_some() {
        eprintln!();
    }

    // Artifacts.
    let mode = if args.minimal {
        OutputMode::Minimal
    } else if args.complete {
        OutputMode::Complete
    } else {
        OutputMode::Standard
    };
    let written = write_outputs(&result, &spectrum_name, &args.output_dir, mode, Some(&store))?;

    print_summary(&result, &spectrum_name, written.len(), &args.output_dir);

    if args.verbose {
        println!("\nPreprocessing trace:");
        for step in &preprocess_trace {
            println!("  {:<18} {}", step.step, step.detail);
        }
        println!("Analysis trace:");
        for step in &analysis_trace {
            println!("  {:<18} {}", step.step, step.detail);
        }
    }

    Ok(())
}

// ============================================================================
// Configuration mapping
// ============================================================================

fn preprocess_options(args: &IdentifyArgs) -> Result<PreprocessOptions> {
    Ok(PreprocessOptions {
        savgol_window: args.savgol_window,
        savgol_fwhm: args.savgol_fwhm,
        savgol_order: args.savgol_order,
        aband_remove: args.aband_remove,
        skyclip: args.skyclip,
        emclip_z: args.emclip_z,
        emwidth: args.emwidth,
        wavelength_masks: parse_masks(&args.wavelength_masks)?,
        apodize_percent: args.apodize_percent,
        ..Default::default()
    })
}

fn analysis_config(args: &IdentifyArgs) -> AnalysisConfig {
    let age_range = match (args.age_min, args.age_max) {
        (None, None) => None,
        (lo, hi) => Some((lo.unwrap_or(f64::NEG_INFINITY), hi.unwrap_or(f64::INFINITY))),
    };
    AnalysisConfig {
        correlation: CorrelationConfig {
            zmin: args.zmin,
            zmax: args.zmax,
            peak_window_size: args.peak_window_size,
            lapmin: args.lapmin,
            rlapmin: args.rlapmin,
            forced_redshift: args.forced_redshift,
        },
        clustering: ClusteringConfig::default(),
        filter: TemplateFilter {
            type_whitelist: args.type_filter.clone(),
            name_whitelist: args.template_filter.clone(),
            name_blacklist: args.exclude_templates.clone(),
            subtype_whitelist: Vec::new(),
            age_range,
        },
        metric: MetricKind::RlapCos,
        max_output_templates: args.max_output_templates,
    }
}

/// Parse `WMIN:WMAX` mask arguments.
fn parse_masks(raw: &[String]) -> Result<Vec<(f64, f64)>> {
    let mut masks = Vec::with_capacity(raw.len());
    for spec in raw {
        let (a, b) = spec
            .split_once(':')
            .with_context(|| format!("mask '{spec}' is not WMIN:WMAX"))?;
        let a: f64 = a
            .trim()
            .parse()
            .with_context(|| format!("mask '{spec}' has a non-numeric bound"))?;
        let b: f64 = b
            .trim()
            .parse()
            .with_context(|| format!("mask '{spec}' has a non-numeric bound"))?;
        masks.push((a, b));
    }
    Ok(masks)
}

// ============================================================================
// Console output
// ============================================================================

/// Stderr progress line for non-verbose runs (verbose runs rely on logging).
fn progress_printer(verbose: bool) -> Option<Box<dyn Fn(&str, f64) + Send + Sync>> {
    if verbose {
        return None;
    }
    Some(Box::new(|message: &str, percent: f64| {
        eprint!("\r[{percent:5.1}%] {message:<42}");
    }))
}

fn print_summary(result: &AnalysisResult, name: &str, files: usize, output_dir: &Path) {
    println!(
        "{name}: {} {}  z={:.4} +/- {:.4}  rlap={:.1}  ({:.2}s)",
        result.consensus_type,
        result.best_subtype,
        result.redshift,
        result.redshift_error,
        result.rlap,
        result.runtime_sec
    );
    if let Some(cluster) = result.clustering.selected_cluster() {
        let confidence = result
            .clustering
            .confidence
            .as_ref()
            .map(|c| c.level.label())
            .unwrap_or("n/a");
        let quality = result
            .clustering
            .quality
            .as_ref()
            .map(|q| q.category.label())
            .unwrap_or("n/a");
        println!(
            "cluster: {} with {} members, quality {quality}, confidence {confidence}",
            cluster.sn_type,
            cluster.size()
        );
    }
    println!("{files} file(s) written to {}", output_dir.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_masks() {
        let masks = parse_masks(&["6500:6620".to_string(), "7600:7700".to_string()]).unwrap();
        assert_eq!(masks, vec![(6500.0, 6620.0), (7600.0, 7700.0)]);
    }

    #[test]
    fn test_parse_masks_rejects_garbage() {
        assert!(parse_masks(&["6500-6620".to_string()]).is_err());
        assert!(parse_masks(&["a:b".to_string()]).is_err());
    }

    #[test]
    fn test_identify_args_defaults() {
        let cli = Cli::parse_from(["snid", "identify", "spec.txt", "-o", "out"]);
        let Command::Identify(args) = cli.command;
        assert_eq!(args.zmin, -0.01);
        assert_eq!(args.zmax, 1.0);
        assert_eq!(args.rlapmin, 5.0);
        assert_eq!(args.lapmin, 0.3);
        assert_eq!(args.peak_window_size, 10);
        assert_eq!(args.max_output_templates, 10);
        assert!(!args.minimal);
    }

    #[test]
    fn test_minimal_and_complete_conflict() {
        let result = Cli::try_parse_from([
            "snid", "identify", "spec.txt", "-o", "out", "--minimal", "--complete",
        ]);
        assert!(result.is_err());
    }
}
