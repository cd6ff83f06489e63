//! Top-level error type for the analysis pipeline.

use thiserror::Error;

/// Umbrella error surfaced by [`crate::pipeline::run_analysis`] and the IO
/// layer. Per-template numeric failures never reach this level; they are
/// recorded in the analysis trace instead.
#[derive(Debug, Error)]
pub enum SnidError {
    #[error(transparent)]
    Grid(#[from] crate::grid::GridError),

    #[error("Preprocessing failed: {0}")]
    Preprocess(#[from] crate::preprocessing::PreprocessError),

    #[error(transparent)]
    Template(#[from] crate::templates::TemplateError),

    #[error(transparent)]
    Correlation(#[from] crate::correlation::CorrelationError),

    #[error(transparent)]
    Cluster(#[from] crate::clustering::ClusterError),

    #[error(transparent)]
    Assemble(#[from] crate::results::AssembleError),

    #[error(transparent)]
    Input(#[from] crate::io::IoError),

    #[error("Analysis cancelled before any match was admitted")]
    Cancelled,

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}
