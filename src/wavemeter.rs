//! Wavemeter collaborator interface and simulated implementations.
//!
//! The real instrument is reached through a vendor SDK and is outside this
//! crate. Anything that can produce single-shot wavelength readings implements
//! [`Wavemeter`]; a reading `<= 0` means "no signal".
//!
//! # Available Implementations
//!
//! - `SimulatedWavemeter` - follows a watched centre wavelength with noise,
//!   dropouts, occasional wild readings, and a slower refresh rate than the
//!   poll rate (so stale duplicates appear, as on the real device)
//! - `ScriptedWavemeter` - replays a fixed sequence of readings

use crate::error::{AppResult, OpoError};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Capability: single-shot wavelength readings.
#[async_trait]
pub trait Wavemeter: Send + Sync {
    /// Begin a measurement burst.
    async fn start_measurement(&self) -> AppResult<()> {
        Ok(())
    }

    /// End a measurement burst.
    async fn stop_measurement(&self) -> AppResult<()> {
        Ok(())
    }

    /// Read one wavelength (nm). `<= 0` signals no valid reading.
    async fn read_wavelength(&self) -> AppResult<f64>;
}

// =============================================================================
// SimulatedWavemeter
// =============================================================================

/// Noise model for [`SimulatedWavemeter`].
#[derive(Debug, Clone, Copy)]
pub struct SimulationProfile {
    /// Gaussian noise standard deviation (nm)
    pub noise_nm: f64,
    /// Probability of a "no signal" reading
    pub dropout_probability: f64,
    /// Probability of a wild reading far from the centre
    pub outlier_probability: f64,
    /// Offset applied to wild readings (nm)
    pub outlier_offset_nm: f64,
    /// Minimum time between fresh readings
    pub refresh_interval: Duration,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            noise_nm: 0.0003,
            dropout_probability: 0.02,
            outlier_probability: 0.02,
            outlier_offset_nm: 0.5,
            refresh_interval: Duration::from_millis(150),
        }
    }
}

struct LastReading {
    value: f64,
    at: Instant,
}

/// Simulated wavemeter tracking a centre wavelength.
pub struct SimulatedWavemeter {
    centre: watch::Receiver<Option<f64>>,
    profile: SimulationProfile,
    last: Mutex<Option<LastReading>>,
}

impl SimulatedWavemeter {
    /// Follow the wavelengths published on `centre` (typically the OPO link's
    /// last-known wavelength).
    pub fn new(centre: watch::Receiver<Option<f64>>, profile: SimulationProfile) -> Self {
        Self {
            centre,
            profile,
            last: Mutex::new(None),
        }
    }

    fn fresh_reading(&self, centre: f64) -> f64 {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.profile.dropout_probability.clamp(0.0, 1.0)) {
            return 0.0;
        }
        // Box-Muller
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        let gauss = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        let mut value = centre + gauss * self.profile.noise_nm;
        if rng.gen_bool(self.profile.outlier_probability.clamp(0.0, 1.0)) {
            value += self.profile.outlier_offset_nm;
        }
        value
    }
}

#[async_trait]
impl Wavemeter for SimulatedWavemeter {
    async fn read_wavelength(&self) -> AppResult<f64> {
        let Some(centre) = *self.centre.borrow() else {
            return Ok(0.0);
        };

        let mut last = self
            .last
            .lock()
            .map_err(|_| OpoError::Wavemeter("simulated wavemeter state poisoned".to_string()))?;

        if let Some(prev) = last.as_ref() {
            if prev.at.elapsed() < self.profile.refresh_interval {
                return Ok(prev.value);
            }
        }

        let value = self.fresh_reading(centre);
        *last = Some(LastReading {
            value,
            at: Instant::now(),
        });
        Ok(value)
    }
}

// =============================================================================
// ScriptedWavemeter
// =============================================================================

/// Replays a fixed sequence of readings, then repeats `fallback`.
pub struct ScriptedWavemeter {
    readings: Mutex<VecDeque<f64>>,
    fallback: f64,
    brackets: Mutex<(usize, usize)>,
}

impl ScriptedWavemeter {
    /// Create from a sequence; after it is exhausted every read returns `fallback`.
    pub fn new(readings: impl IntoIterator<Item = f64>, fallback: f64) -> Self {
        Self {
            readings: Mutex::new(readings.into_iter().collect()),
            fallback,
            brackets: Mutex::new((0, 0)),
        }
    }

    /// Always returns `value`.
    pub fn constant(value: f64) -> Self {
        Self::new([], value)
    }

    /// Append readings to the end of the script.
    pub fn extend(&self, readings: impl IntoIterator<Item = f64>) {
        if let Ok(mut queue) = self.readings.lock() {
            queue.extend(readings);
        }
    }

    /// Number of `start_measurement` / `stop_measurement` calls seen.
    pub fn bracket_counts(&self) -> (usize, usize) {
        self.brackets.lock().map(|b| *b).unwrap_or((0, 0))
    }
}

#[async_trait]
impl Wavemeter for ScriptedWavemeter {
    async fn start_measurement(&self) -> AppResult<()> {
        if let Ok(mut b) = self.brackets.lock() {
            b.0 += 1;
        }
        Ok(())
    }

    async fn stop_measurement(&self) -> AppResult<()> {
        if let Ok(mut b) = self.brackets.lock() {
            b.1 += 1;
        }
        Ok(())
    }

    async fn read_wavelength(&self) -> AppResult<f64> {
        let mut queue = self
            .readings
            .lock()
            .map_err(|_| OpoError::Wavemeter("scripted wavemeter state poisoned".to_string()))?;
        Ok(queue.pop_front().unwrap_or(self.fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_replays_then_falls_back() {
        let meter = ScriptedWavemeter::new([750.0, -1.0], 751.0);
        assert_eq!(meter.read_wavelength().await.unwrap(), 750.0);
        assert_eq!(meter.read_wavelength().await.unwrap(), -1.0);
        assert_eq!(meter.read_wavelength().await.unwrap(), 751.0);
        assert_eq!(meter.read_wavelength().await.unwrap(), 751.0);
    }

    #[tokio::test]
    async fn simulated_without_centre_reports_no_signal() {
        let (_tx, rx) = watch::channel(None);
        let meter = SimulatedWavemeter::new(rx, SimulationProfile::default());
        assert_eq!(meter.read_wavelength().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn simulated_tracks_centre_with_stale_repeats() {
        let (_tx, rx) = watch::channel(Some(750.0));
        let profile = SimulationProfile {
            dropout_probability: 0.0,
            outlier_probability: 0.0,
            refresh_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let meter = SimulatedWavemeter::new(rx, profile);

        let first = meter.read_wavelength().await.unwrap();
        let second = meter.read_wavelength().await.unwrap();
        assert!((first - 750.0).abs() < 0.01);
        assert_eq!(first, second);
    }
}
