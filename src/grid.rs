//! Fixed logarithmic wavelength grid shared by all spectra.
//!
//! Every spectrum and template in an analysis lives on the same log-λ grid:
//! `NW` bins spanning `[W0, W1]` Å, uniform in ln(λ). Bin `i` is centered at
//! `W0 · exp((i + 0.5) · DWLOG)` with `DWLOG = ln(W1/W0) / NW`.
//!
//! The grid is initialised once per process and read-only afterwards.
//! Components take `&GridParams` so unit tests can build grids directly.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

/// Default number of log-λ bins.
pub const DEFAULT_NW: usize = 1024;
/// Default minimum wavelength (Å).
pub const DEFAULT_W0: f64 = 2500.0;
/// Default maximum wavelength (Å).
pub const DEFAULT_W1: f64 = 10000.0;

/// Smallest grid the correlation engine supports.
const MIN_NW: usize = 64;

/// Grid configuration errors
#[derive(Debug, Error)]
pub enum GridError {
    #[error("Invalid grid: NW={nw}, W0={w0}, W1={w1} (require W1 > W0 and NW >= 64)")]
    InvalidGrid { nw: usize, w0: f64, w1: f64 },

    #[error("Grid mismatch: process grid is NW={current}, requested NW={requested}")]
    GridMismatch { current: usize, requested: usize },
}

/// Parameters of the fixed log-λ grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    /// Number of bins.
    pub nw: usize,
    /// Minimum wavelength (Å).
    pub w0: f64,
    /// Maximum wavelength (Å).
    pub w1: f64,
    /// Logarithmic bin width: ln(w1/w0) / nw.
    pub dwlog: f64,
}

impl GridParams {
    /// Build a grid, validating its parameters.
    pub fn new(nw: usize, w0: f64, w1: f64) -> Result<Self, GridError> {
        if nw < MIN_NW || w1 <= w0 || w0 <= 0.0 {
            return Err(GridError::InvalidGrid { nw, w0, w1 });
        }
        let dwlog = (w1 / w0).ln() / nw as f64;
        Ok(Self { nw, w0, w1, dwlog })
    }

    /// Center wavelength (Å) of bin `i`.
    pub fn bin_center(&self, i: usize) -> f64 {
        self.w0 * ((i as f64 + 0.5) * self.dwlog).exp()
    }

    /// Lower and upper edge wavelengths (Å) of bin `i`.
    pub fn bin_edges(&self, i: usize) -> (f64, f64) {
        let lo = self.w0 * (i as f64 * self.dwlog).exp();
        let hi = self.w0 * ((i as f64 + 1.0) * self.dwlog).exp();
        (lo, hi)
    }

    /// Fractional bin index of a wavelength. 0.0 maps to the lower edge of
    /// bin 0; values outside [0, nw] indicate wavelengths off the grid.
    pub fn wavelength_to_bin(&self, wavelength: f64) -> f64 {
        (wavelength / self.w0).ln() / self.dwlog
    }

    /// Wavelength (Å) of a fractional bin coordinate (inverse of
    /// [`wavelength_to_bin`](Self::wavelength_to_bin)).
    pub fn bin_to_wavelength(&self, bin: f64) -> f64 {
        self.w0 * (bin * self.dwlog).exp()
    }

    /// All bin centers, length `nw`.
    pub fn log_wave(&self) -> Vec<f64> {
        (0..self.nw).map(|i| self.bin_center(i)).collect()
    }

    /// Width (Å) of bin `i`.
    pub fn bin_width(&self, i: usize) -> f64 {
        let (lo, hi) = self.bin_edges(i);
        hi - lo
    }
}

impl Default for GridParams {
    fn default() -> Self {
        let dwlog = (DEFAULT_W1 / DEFAULT_W0).ln() / DEFAULT_NW as f64;
        Self {
            nw: DEFAULT_NW,
            w0: DEFAULT_W0,
            w1: DEFAULT_W1,
            dwlog,
        }
    }
}

/// Process-wide grid, set once and read-only thereafter.
static GLOBAL_GRID: OnceLock<GridParams> = OnceLock::new();

/// Install the process-wide grid. Idempotent for identical parameters;
/// re-initialisation with different parameters is a
/// [`GridError::GridMismatch`] because loaded templates are bound to the grid
/// they were sampled on.
pub fn init_grid(params: GridParams) -> Result<(), GridError> {
    let current = GLOBAL_GRID.get_or_init(|| params);
    if *current != params {
        return Err(GridError::GridMismatch {
            current: current.nw,
            requested: params.nw,
        });
    }
    Ok(())
}

/// The process-wide grid, initialising the defaults on first use.
pub fn global_grid() -> GridParams {
    *GLOBAL_GRID.get_or_init(GridParams::default)
}

/// Whether the process-wide grid has been initialised.
pub fn grid_initialized() -> bool {
    GLOBAL_GRID.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grid_parameters() {
        let g = GridParams::default();
        assert_eq!(g.nw, 1024);
        assert!((g.dwlog - (10000.0f64 / 2500.0).ln() / 1024.0).abs() < 1e-15);
    }

    #[test]
    fn test_invalid_grid_rejected() {
        assert!(GridParams::new(1024, 10000.0, 2500.0).is_err());
        assert!(GridParams::new(32, 2500.0, 10000.0).is_err());
        assert!(GridParams::new(1024, 0.0, 10000.0).is_err());
    }

    #[test]
    fn test_bin_center_roundtrip() {
        let g = GridParams::default();
        for i in [0usize, 1, 511, 1023] {
            let w = g.bin_center(i);
            let frac = g.wavelength_to_bin(w);
            assert!((frac - (i as f64 + 0.5)).abs() < 1e-9, "bin {i}: frac={frac}");
        }
    }

    #[test]
    fn test_bin_edges_cover_range() {
        let g = GridParams::default();
        let (lo, _) = g.bin_edges(0);
        let (_, hi) = g.bin_edges(g.nw - 1);
        assert!((lo - g.w0).abs() < 1e-9);
        assert!((hi - g.w1).abs() < 1e-6);
    }

    #[test]
    fn test_edges_are_contiguous() {
        let g = GridParams::default();
        for i in 0..g.nw - 1 {
            let (_, hi) = g.bin_edges(i);
            let (lo, _) = g.bin_edges(i + 1);
            assert!((hi - lo).abs() < 1e-9);
        }
    }

    #[test]
    fn test_bin_to_wavelength_inverse() {
        let g = GridParams::default();
        let w = g.bin_to_wavelength(g.wavelength_to_bin(5000.0));
        assert!((w - 5000.0).abs() < 1e-9);
    }
}
