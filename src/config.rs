//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/opo_daq.toml` (or a path given on the command line)
//! 3. Environment variables prefixed with `OPO_DAQ_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use opo_daq::config::OpoConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OpoConfig::load()?;
//! config.validate()?;
//! println!("OPO at {}:{}", config.opo.host, config.opo.port);
//! # Ok(())
//! # }
//! ```
//!
//! `OPO_DAQ_OPO__PORT=1316` overrides `[opo] port`.

use crate::error::{AppResult, OpoError};
use crate::opo::protocol::SPEED_RANGE_NM_PER_SEC;
use crate::opo::LinkOptions;
use crate::sampler::SamplerOptions;
use crate::stats::ReductionOptions;
use crate::targeting::TargetingOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/opo_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "OPO_DAQ_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpoConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// OPO controller link
    pub opo: OpoLinkConfig,
    /// Wavemeter sampling and reduction
    pub wavemeter: WavemeterConfig,
    /// Energy targeting policy
    pub targeting: TargetingConfig,
    /// Measurement output
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "OPO DAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// OPO controller connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpoLinkConfig {
    /// Controller host
    pub host: String,
    /// Controller TCP port
    pub port: u16,
    /// Socket connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Query reply timeout in milliseconds
    pub response_timeout_ms: u64,
    /// TELLSTAT poll interval while a move settles, in milliseconds
    pub motor_poll_interval_ms: u64,
    /// Give up waiting for the motor after this many milliseconds
    pub motor_stop_timeout_ms: u64,
    /// Motor speed (nm/s) sent after connecting, if set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_nm_per_sec: Option<f64>,
}

impl Default for OpoLinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: crate::opo::protocol::DEFAULT_PORT,
            connect_timeout_ms: 5000,
            response_timeout_ms: 2000,
            motor_poll_interval_ms: 500,
            motor_stop_timeout_ms: 120_000,
            speed_nm_per_sec: None,
        }
    }
}

/// Wavemeter sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WavemeterConfig {
    /// Delay between wavemeter polls in milliseconds
    pub poll_interval_ms: u64,
    /// Good samples per measurement
    pub sample_count: usize,
    /// Abort a measurement once failed polls exceed this fraction of `sample_count`
    pub max_failure_fraction: f64,
    /// Bound on one measurement burst in milliseconds
    pub burst_timeout_ms: u64,
    /// Reduction convergence threshold (nm)
    pub stdev_threshold_nm: f64,
    /// Minimum samples kept by the reduction
    pub min_retained: usize,
    /// Maximum trimming passes
    pub max_iterations: usize,
    /// Discard samples farther than this from the target wavelength (nm).
    /// Must exceed `targeting.max_wavelength_correction_nm`, or a wild
    /// measurement empties the sample set before the fallback shift can apply.
    pub max_deviation_nm: f64,
}

impl Default for WavemeterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            sample_count: 50,
            max_failure_fraction: 0.5,
            burst_timeout_ms: 60_000,
            stdev_threshold_nm: 0.0005,
            min_retained: 5,
            max_iterations: 10,
            max_deviation_nm: 5.0,
        }
    }
}

/// Energy targeting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetingConfig {
    /// Acceptable energy error (cm⁻¹)
    pub energy_tolerance_cm: f64,
    /// Largest measured wavelength error used directly as a correction (nm)
    pub max_wavelength_correction_nm: f64,
    /// Shift applied when the measured error is implausible (nm)
    pub fallback_shift_nm: f64,
    /// Correction passes after the first move
    pub max_attempts: usize,
}

impl Default for TargetingConfig {
    fn default() -> Self {
        Self {
            energy_tolerance_cm: 0.3,
            max_wavelength_correction_nm: 1.5,
            fallback_shift_nm: 0.1,
            max_attempts: 1,
        }
    }
}

/// Measurement output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for measurement files
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("wavelength_measurements"),
        }
    }
}

impl OpoConfig {
    /// Load configuration from `config/opo_daq.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file leaves the
    /// defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref(), ENV_PREFIX).extract()?)
    }

    /// Layered provider stack with a custom environment prefix.
    pub fn figment(path: &Path, env_prefix: &str) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(env_prefix).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(OpoError::Configuration(msg));

        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        if self.opo.host.trim().is_empty() {
            return invalid("opo.host must not be empty".to_string());
        }
        if self.opo.motor_poll_interval_ms == 0 || self.wavemeter.poll_interval_ms == 0 {
            return invalid("poll intervals must be greater than zero".to_string());
        }
        if let Some(speed) = self.opo.speed_nm_per_sec {
            if !SPEED_RANGE_NM_PER_SEC.contains(&speed) {
                return invalid(format!(
                    "Invalid speed_nm_per_sec {}. Must be in {}-{} nm/s",
                    speed,
                    SPEED_RANGE_NM_PER_SEC.start(),
                    SPEED_RANGE_NM_PER_SEC.end()
                ));
            }
        }

        let wm = &self.wavemeter;
        if !(wm.max_failure_fraction > 0.0 && wm.max_failure_fraction <= 1.0) {
            return invalid(format!(
                "Invalid max_failure_fraction {}. Must be in (0, 1]",
                wm.max_failure_fraction
            ));
        }
        if wm.min_retained == 0 {
            return invalid("min_retained must be at least 1".to_string());
        }
        if wm.sample_count < wm.min_retained {
            return invalid(format!(
                "sample_count {} is smaller than min_retained {}",
                wm.sample_count, wm.min_retained
            ));
        }
        if wm.stdev_threshold_nm < 0.0 || wm.max_deviation_nm <= 0.0 {
            return invalid("wavemeter thresholds must not be negative".to_string());
        }

        let t = &self.targeting;
        if t.energy_tolerance_cm < 0.0
            || t.max_wavelength_correction_nm < 0.0
            || t.fallback_shift_nm < 0.0
        {
            return invalid("targeting tolerances must not be negative".to_string());
        }
        if wm.max_deviation_nm <= t.max_wavelength_correction_nm {
            return invalid(format!(
                "wavemeter.max_deviation_nm {} must exceed targeting.max_wavelength_correction_nm {}",
                wm.max_deviation_nm, t.max_wavelength_correction_nm
            ));
        }

        Ok(())
    }

    /// Effective configuration as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| OpoError::Configuration(e.to_string()))
    }

    /// Runtime options for the OPO link.
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            host: self.opo.host.clone(),
            port: self.opo.port,
            connect_timeout: Duration::from_millis(self.opo.connect_timeout_ms),
            response_timeout: Duration::from_millis(self.opo.response_timeout_ms),
            motor_poll_interval: Duration::from_millis(self.opo.motor_poll_interval_ms),
            motor_stop_timeout: Duration::from_millis(self.opo.motor_stop_timeout_ms),
            ..LinkOptions::default()
        }
    }

    /// Runtime options for the wavelength sampler.
    pub fn sampler_options(&self) -> SamplerOptions {
        let wm = &self.wavemeter;
        SamplerOptions {
            target_count: wm.sample_count,
            poll_interval: Duration::from_millis(wm.poll_interval_ms),
            max_failure_fraction: wm.max_failure_fraction,
            burst_timeout: Duration::from_millis(wm.burst_timeout_ms),
            max_deviation: wm.max_deviation_nm,
            reduction: ReductionOptions {
                stdev_threshold: wm.stdev_threshold_nm,
                min_retained: wm.min_retained,
                max_iterations: wm.max_iterations,
                expected: None,
            },
        }
    }

    /// Runtime options for the targeting controller.
    pub fn targeting_options(&self) -> TargetingOptions {
        TargetingOptions {
            energy_tolerance: self.targeting.energy_tolerance_cm,
            max_wavelength_correction: self.targeting.max_wavelength_correction_nm,
            fallback_shift: self.targeting.fallback_shift_nm,
            max_attempts: self.targeting.max_attempts,
        }
    }
}
