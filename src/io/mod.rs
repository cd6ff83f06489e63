//! Spectrum readers and result writers.
//!
//! Input formats: two-column ASCII (whitespace or comma separated), SNID
//! `lnw`-style text, and simple 1-D FITS. All readers drop non-finite rows
//! and hand back a cleaned [`RawSpectrum`].

mod fits;
mod output;

pub use fits::read_fits_spectrum;
pub use output::{render_summary, write_outputs, OutputMode};

use crate::types::RawSpectrum;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// IO errors
#[derive(Debug, Error)]
pub enum IoError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unreadable file {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("Write failure for {path}: {source}")]
    WriteFailure {
        path: String,
        source: std::io::Error,
    },
}

/// Minimum rows a spectrum file must yield.
const MIN_ROWS: usize = 10;

/// Read an input spectrum, dispatching on the file extension:
/// `.fits`/`.fit` to the FITS reader, everything else (including `.lnw`) to
/// the text reader.
pub fn read_spectrum(path: &Path) -> Result<RawSpectrum, IoError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let spectrum = match ext.as_deref() {
        Some("fits") | Some("fit") => read_fits_spectrum(path)?,
        _ => read_text_spectrum(path)?,
    };
    debug!(path = %path.display(), rows = spectrum.len(), "spectrum read");

    if spectrum.len() < MIN_ROWS {
        return Err(IoError::InvalidInput(format!(
            "{}: fewer than {MIN_ROWS} usable rows",
            path.display()
        )));
    }
    Ok(spectrum)
}

/// Read a whitespace- or comma-separated text spectrum.
///
/// Comment lines (`#`, `;`, `%`) and non-numeric lines are skipped. `lnw`
/// files carry header and knot rows before the data block, so the reader
/// keeps the longest contiguous run of rows with strictly increasing,
/// plausible wavelengths.
pub fn read_text_spectrum(path: &Path) -> Result<RawSpectrum, IoError> {
    let content = std::fs::read_to_string(path).map_err(|e| IoError::Unreadable {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut rows: Vec<(f64, f64)> = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(&['#', ';', '%'][..]) {
            continue;
        }
        let mut fields = trimmed
            .split(&[' ', '\t', ','][..])
            .filter(|f| !f.is_empty());
        let (Some(a), Some(b)) = (fields.next(), fields.next()) else {
            continue;
        };
        let (Ok(w), Ok(f)) = (a.parse::<f64>(), b.parse::<f64>()) else {
            continue;
        };
        if !w.is_finite() || !f.is_finite() {
            continue;
        }
        // Plausible optical/IR wavelength in Å.
        if !(100.0..=100_000.0).contains(&w) {
            continue;
        }
        rows.push((w, f));
    }

    let run = longest_increasing_run(&rows);
    if run.is_empty() {
        return Err(IoError::InvalidInput(format!(
            "{}: no wavelength/flux rows found",
            path.display()
        )));
    }
    Ok(RawSpectrum {
        wave: run.iter().map(|r| r.0).collect(),
        flux: run.iter().map(|r| r.1).collect(),
    })
}

/// Longest contiguous slice of rows with strictly increasing wavelengths.
fn longest_increasing_run(rows: &[(f64, f64)]) -> &[(f64, f64)] {
    if rows.is_empty() {
        return rows;
    }
    let mut best = (0usize, 1usize);
    let mut start = 0usize;
    for i in 1..rows.len() {
        if rows[i].0 <= rows[i - 1].0 {
            if i - start > best.1 - best.0 {
                best = (start, i);
            }
            start = i;
        }
    }
    if rows.len() - start > best.1 - best.0 {
        best = (start, rows.len());
    }
    &rows[best.0..best.1]
}
