//! Measurement persistence and post-run analysis.
//!
//! A scan produces one [`MeasurementRecord`] per requested energy. Records are
//! written as a pretty JSON array to `measurement_results_<name>.json`, and the
//! raw wavelength series as newline-separated 5-decimal floats to `<name>.txt`,
//! both under the configured output directory. There is no schema versioning.
//!
//! ## Analysis
//!
//! - [`ErrorSummary::from_records`]: average, max and min absolute energy error
//! - [`ErrorSummary::reduced`]: the same, ignoring errors of 5 cm⁻¹ or more
//! - [`wavelength_histogram`]: tally of wavelengths rounded to 3 decimals

use crate::conversion::Band;
use crate::error::{AppResult, OpoError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Errors at or above this (cm⁻¹) are treated as outliers by [`ErrorSummary::reduced`].
pub const OUTLIER_ERROR_CM: f64 = 5.0;

const TEXT_DECIMALS: usize = 5;
const HISTOGRAM_DECIMALS: i32 = 3;

/// Raw and reduced wavelength samples of the final measurement of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WavelengthSeries {
    /// Every accepted wavemeter sample (nm)
    pub initial_values: Vec<f64>,
    /// Samples retained by the reduction (nm)
    pub final_values: Vec<f64>,
}

/// Outcome of one energy request, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Requested photon energy (cm⁻¹)
    pub desired_energy: f64,
    /// Achieved photon energy in the requested band (cm⁻¹)
    pub energy: f64,
    /// Target motor wavelength (nm)
    pub desired_wl: f64,
    /// Measured motor wavelength (nm)
    pub wavelength: f64,
    /// Band of the request
    pub band: Band,
    /// Whether a correction pass ran
    pub corrected: bool,
    /// Samples behind `wavelength`
    pub wl_measurements: WavelengthSeries,
    /// When the request completed
    pub timestamp: DateTime<Utc>,
}

impl MeasurementRecord {
    /// Absolute energy error (cm⁻¹).
    pub fn energy_error(&self) -> f64 {
        (self.desired_energy - self.energy).abs()
    }
}

/// Output files for one named run.
#[derive(Debug, Clone)]
pub struct MeasurementLog {
    dir: PathBuf,
    name: String,
}

impl MeasurementLog {
    /// Log named `name` under `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> AppResult<Self> {
        let name = name.into();
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(OpoError::Validation(format!(
                "invalid measurement log name '{}'",
                name
            )));
        }
        Ok(Self {
            dir: dir.into(),
            name,
        })
    }

    /// Path of the JSON record file.
    pub fn json_path(&self) -> PathBuf {
        self.dir
            .join(format!("measurement_results_{}.json", self.name))
    }

    /// Path of the flat numeric log.
    pub fn text_path(&self) -> PathBuf {
        self.dir.join(format!("{}.txt", self.name))
    }

    /// Write `records` as a pretty JSON array, replacing any previous file.
    pub fn write_records(&self, records: &[MeasurementRecord]) -> AppResult<PathBuf> {
        let json = serde_json::to_string_pretty(records)?;
        let path = self.json_path();
        self.write(&path, json)?;
        info!(path = %path.display(), records = records.len(), "measurement records saved");
        Ok(path)
    }

    /// Write `values` one per line with 5 decimals.
    pub fn write_values(&self, values: &[f64]) -> AppResult<PathBuf> {
        let mut text = String::with_capacity(values.len() * 12);
        for v in values {
            text.push_str(&format!("{:.*}\n", TEXT_DECIMALS, v));
        }
        let path = self.text_path();
        self.write(&path, text)?;
        info!(path = %path.display(), values = values.len(), "wavelength log saved");
        Ok(path)
    }

    /// Load records back from the JSON file.
    pub fn read_records(&self) -> AppResult<Vec<MeasurementRecord>> {
        load_records(&self.json_path())
    }

    fn write(&self, path: &Path, contents: String) -> AppResult<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

/// Load a JSON record file written by [`MeasurementLog::write_records`].
pub fn load_records(path: &Path) -> AppResult<Vec<MeasurementRecord>> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Absolute energy error statistics over a run (cm⁻¹).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Mean absolute error
    pub average: f64,
    /// Largest absolute error
    pub max: f64,
    /// Smallest absolute error
    pub min: f64,
    /// Records included
    pub count: usize,
}

impl ErrorSummary {
    /// Summarize every record. `EmptySet` if there are none.
    pub fn from_records(records: &[MeasurementRecord]) -> AppResult<Self> {
        Self::from_errors(records.iter().map(MeasurementRecord::energy_error))
    }

    /// Summarize only records with an error below [`OUTLIER_ERROR_CM`].
    pub fn reduced(records: &[MeasurementRecord]) -> AppResult<Self> {
        Self::from_errors(
            records
                .iter()
                .map(MeasurementRecord::energy_error)
                .filter(|e| *e < OUTLIER_ERROR_CM),
        )
    }

    /// Whether the run contains errors worth excluding.
    pub fn has_outliers(&self) -> bool {
        self.max > OUTLIER_ERROR_CM
    }

    fn from_errors(errors: impl Iterator<Item = f64>) -> AppResult<Self> {
        let errors: Vec<f64> = errors.collect();
        if errors.is_empty() {
            return Err(OpoError::EmptySet);
        }
        Ok(Self {
            average: errors.iter().sum::<f64>() / errors.len() as f64,
            max: errors.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            min: errors.iter().copied().fold(f64::INFINITY, f64::min),
            count: errors.len(),
        })
    }
}

/// Tally wavelengths rounded to 3 decimals, sorted by wavelength.
pub fn wavelength_histogram(values: &[f64]) -> Vec<(f64, usize)> {
    let scale = 10f64.powi(HISTOGRAM_DECIMALS);
    let mut tally: Vec<(f64, usize)> = Vec::new();
    for v in values {
        let rounded = (v * scale).round() / scale;
        match tally.iter_mut().find(|(w, _)| *w == rounded) {
            Some((_, count)) => *count += 1,
            None => tally.push((rounded, 1)),
        }
    }
    tally.sort_by(|a, b| a.0.total_cmp(&b.0));
    tally
}
