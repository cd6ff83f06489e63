//! SNID SAGE: supernova spectrum identification.
//!
//! Classifies an observed one-dimensional spectrum by FFT cross-correlation
//! against a library of reference templates, then groups the matches by
//! supernova type with Gaussian-mixture clustering in redshift space.
//!
//! ## Architecture
//!
//! - **Grid**: the fixed log-λ wavelength grid all spectra share
//! - **Preprocessing**: clipping, smoothing, log rebinning, continuum
//!   removal, apodization
//! - **Templates**: read-only reference library with deterministic filtering
//! - **Correlation**: per-template redshift peak search and match metrics
//! - **Clustering**: per-type GMM over redshifts, winning-cluster selection,
//!   subtype voting, confidence assessment
//! - **Results**: ranked matches, consensus classification, cluster override
//! - **Pipeline**: phase orchestration, parallel fan-out, cancellation
//! - **IO**: spectrum readers (ASCII / lnw / FITS) and result writers

pub mod clustering;
pub mod correlation;
pub mod error;
pub mod grid;
pub mod io;
pub mod pipeline;
pub mod preprocessing;
pub mod results;
pub mod templates;
pub mod types;

// Re-export the analysis surface
pub use error::SnidError;
pub use grid::{global_grid, init_grid, GridParams};
pub use pipeline::{run_analysis, AnalysisConfig, CancelToken, RunOptions};
pub use preprocessing::{preprocess, ContinuumMethod, PreprocessOptions};
pub use results::{choose_cluster, AnalysisResult};
pub use templates::{Template, TemplateFilter, TemplateStore};
pub use types::{Match, MetricKind, ProcessedSpectrum, RawSpectrum};
