//! Reference template library.
//!
//! A library is a directory of JSON files, each holding a group of templates
//! already sampled on the canonical log-λ grid (flat and fluxed forms plus
//! metadata). The on-disk layout stays behind this module: any backend that
//! yields [`Template`]s on the process grid is a conforming store.
//!
//! The store is read-only; template authoring is external. Padded FFTs of the
//! flat flux are precomputed at load so the correlation hot path never plans.

use crate::correlation::fft::forward_fft;
use crate::grid::GridParams;
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Template library errors
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Templates not found at {path}: {reason}")]
    TemplatesNotFound { path: PathBuf, reason: String },

    #[error("Corrupt template library {path}: {reason}")]
    CorruptTemplateLibrary { path: PathBuf, reason: String },
}

/// One reference template on the canonical log grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(rename = "type", default = "unknown")]
    pub sn_type: String,
    #[serde(default = "unknown")]
    pub subtype: String,
    #[serde(default)]
    pub age_days: f64,
    #[serde(default)]
    pub phase: String,
    /// Reference redshift the template was archived at.
    #[serde(default)]
    pub redshift: f64,
    /// Continuum-removed flux, length NW.
    pub flat_flux: Vec<f64>,
    /// Fluxed form, length NW.
    pub flux: Vec<f64>,
    /// Continuum used to flatten, length NW.
    #[serde(default)]
    pub continuum: Vec<f64>,

    /// Precomputed padded FFT of `flat_flux` (runtime only).
    #[serde(skip)]
    pub fft: Option<Vec<Complex<f64>>>,
    /// First bin of the data region (runtime only).
    #[serde(skip)]
    pub left_edge: usize,
    /// Last bin of the data region, inclusive (runtime only).
    #[serde(skip)]
    pub right_edge: usize,
}

fn unknown() -> String {
    "Unknown".to_string()
}

impl Template {
    /// Reconstruct the fluxed spectrum from the flat form:
    /// `(flat + 1) · continuum`.
    pub fn unflattened(&self) -> Vec<f64> {
        if self.continuum.len() == self.flat_flux.len() {
            self.flat_flux
                .iter()
                .zip(&self.continuum)
                .map(|(&f, &c)| (f + 1.0) * c)
                .collect()
        } else {
            self.flux.clone()
        }
    }

    fn finalize(&mut self, grid: &GridParams, pad_len: usize) {
        let (l, r) = data_region(&self.flux)
            .or_else(|| data_region_flat(&self.flat_flux))
            .unwrap_or((0, grid.nw - 1));
        self.left_edge = l;
        self.right_edge = r;

        let mut padded = vec![Complex::new(0.0, 0.0); pad_len];
        for (i, &f) in self.flat_flux.iter().enumerate() {
            padded[i] = Complex::new(f, 0.0);
        }
        forward_fft(&mut padded);
        self.fft = Some(padded);
    }
}

fn data_region(flux: &[f64]) -> Option<(usize, usize)> {
    let l = flux.iter().position(|&f| f > 0.0)?;
    let r = flux.iter().rposition(|&f| f > 0.0)?;
    Some((l, r))
}

fn data_region_flat(flat: &[f64]) -> Option<(usize, usize)> {
    let l = flat.iter().position(|&f| f != 0.0)?;
    let r = flat.iter().rposition(|&f| f != 0.0)?;
    Some((l, r))
}

/// Admissibility filter over the store.
#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    /// Only these types (empty = all).
    pub type_whitelist: Vec<String>,
    /// Only these template names (empty = all).
    pub name_whitelist: Vec<String>,
    /// Never these template names.
    pub name_blacklist: Vec<String>,
    /// Only these subtypes (empty = all).
    pub subtype_whitelist: Vec<String>,
    /// Inclusive age range (days).
    pub age_range: Option<(f64, f64)>,
}

impl TemplateFilter {
    pub fn admits(&self, t: &Template) -> bool {
        if !self.type_whitelist.is_empty() && !self.type_whitelist.contains(&t.sn_type) {
            return false;
        }
        if !self.name_whitelist.is_empty() && !self.name_whitelist.contains(&t.name) {
            return false;
        }
        if self.name_blacklist.contains(&t.name) {
            return false;
        }
        if !self.subtype_whitelist.is_empty() && !self.subtype_whitelist.contains(&t.subtype) {
            return false;
        }
        if let Some((lo, hi)) = self.age_range {
            if t.age_days < lo || t.age_days > hi {
                return false;
            }
        }
        true
    }
}

/// On-disk library file: a group of templates.
#[derive(Debug, Serialize, Deserialize)]
pub struct TemplateLibraryFile {
    pub templates: Vec<Template>,
}

/// Indexed, read-only collection of reference templates.
#[derive(Debug)]
pub struct TemplateStore {
    templates: Vec<Template>,
    grid: GridParams,
}

impl TemplateStore {
    /// Load every `*.json` library file under `dir`.
    ///
    /// Ordering is deterministic: files are read in sorted path order and
    /// templates are then sorted by type → subtype → age → name.
    pub fn open(dir: &Path, grid: &GridParams) -> Result<Self, TemplateError> {
        if !dir.is_dir() {
            return Err(TemplateError::TemplatesNotFound {
                path: dir.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| TemplateError::TemplatesNotFound {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        files.sort();

        let pad_len = (2 * grid.nw).next_power_of_two();
        let mut templates = Vec::new();
        for file in &files {
            let data =
                std::fs::read(file).map_err(|e| TemplateError::CorruptTemplateLibrary {
                    path: file.clone(),
                    reason: e.to_string(),
                })?;
            let library: TemplateLibraryFile =
                serde_json::from_slice(&data).map_err(|e| {
                    TemplateError::CorruptTemplateLibrary {
                        path: file.clone(),
                        reason: e.to_string(),
                    }
                })?;
            for mut t in library.templates {
                if t.flat_flux.len() != grid.nw || t.flux.len() != grid.nw {
                    return Err(TemplateError::CorruptTemplateLibrary {
                        path: file.clone(),
                        reason: format!(
                            "template '{}' has {} bins, grid expects {}",
                            t.name,
                            t.flat_flux.len(),
                            grid.nw
                        ),
                    });
                }
                if !t.flat_flux.iter().all(|f| f.is_finite()) {
                    warn!(template = %t.name, "skipping template with non-finite flux");
                    continue;
                }
                t.finalize(grid, pad_len);
                templates.push(t);
            }
            debug!(file = %file.display(), "loaded template library file");
        }

        if templates.is_empty() {
            return Err(TemplateError::TemplatesNotFound {
                path: dir.to_path_buf(),
                reason: "no templates in library".to_string(),
            });
        }

        templates.sort_by(|a, b| {
            a.sn_type
                .cmp(&b.sn_type)
                .then_with(|| a.subtype.cmp(&b.subtype))
                .then_with(|| {
                    a.age_days
                        .partial_cmp(&b.age_days)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.name.cmp(&b.name))
        });

        info!(count = templates.len(), dir = %dir.display(), "template store opened");
        Ok(Self {
            templates,
            grid: *grid,
        })
    }

    /// Build a store from in-memory templates (tests and embedding callers).
    pub fn from_templates(
        mut templates: Vec<Template>,
        grid: &GridParams,
    ) -> Result<Self, TemplateError> {
        let pad_len = (2 * grid.nw).next_power_of_two();
        for t in &mut templates {
            t.finalize(grid, pad_len);
        }
        templates.sort_by(|a, b| {
            a.sn_type
                .cmp(&b.sn_type)
                .then_with(|| a.subtype.cmp(&b.subtype))
                .then_with(|| {
                    a.age_days
                        .partial_cmp(&b.age_days)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(Self {
            templates,
            grid: *grid,
        })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn grid(&self) -> &GridParams {
        &self.grid
    }

    /// Admissible templates in deterministic store order.
    pub fn filter(&self, filter: &TemplateFilter) -> Vec<&Template> {
        self.templates.iter().filter(|t| filter.admits(t)).collect()
    }

    /// All templates in store order.
    pub fn all(&self) -> &[Template] {
        &self.templates
    }
}
