//! Wavelength sampling: poll the wavemeter, filter bad readings, reduce.
//!
//! A poll result `<= 0` is a "no signal" failure and is counted, never stored.
//! A result equal to the previously stored sample is a stale duplicate (the
//! wavemeter refreshes slower than it is polled) and is dropped silently. Once
//! `target_count` good samples are collected they are handed to
//! [`reduce_to_converged`]. If failures exceed `max_failure_fraction` of the
//! target, the burst aborts with `TooManyFailures` and no partial average.

use crate::error::{AppResult, OpoError};
use crate::stats::{reduce_to_converged, ExpectedValue, ReductionOptions, ReductionResult};
use crate::wavemeter::Wavemeter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One accepted wavemeter sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WavelengthReading {
    /// Wavelength (nm)
    pub value: f64,
    /// When it was read
    pub timestamp: DateTime<Utc>,
}

/// Sampling burst parameters.
#[derive(Debug, Clone)]
pub struct SamplerOptions {
    /// Good samples to collect before reducing
    pub target_count: usize,
    /// Fixed delay between polls
    pub poll_interval: Duration,
    /// Abort once failures exceed this fraction of `target_count`
    pub max_failure_fraction: f64,
    /// Bound on a whole burst, covering a wavemeter stuck on one value
    pub burst_timeout: Duration,
    /// Pre-filter radius used by [`WavelengthSampler::sample_near`] (nm)
    pub max_deviation: f64,
    /// Reduction criteria; `expected` is supplied per burst
    pub reduction: ReductionOptions,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            target_count: 50,
            poll_interval: Duration::from_millis(100),
            max_failure_fraction: 0.5,
            burst_timeout: Duration::from_secs(60),
            max_deviation: 5.0,
            reduction: ReductionOptions::default(),
        }
    }
}

/// Result of one sampling burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavelengthMeasurement {
    /// Accepted samples in arrival order
    pub readings: Vec<WavelengthReading>,
    /// "No signal" polls
    pub failures: usize,
    /// Stale duplicates dropped
    pub duplicates: usize,
    /// Reduced estimate
    pub reduction: ReductionResult,
}

impl WavelengthMeasurement {
    /// Raw accepted values.
    pub fn raw_values(&self) -> Vec<f64> {
        self.readings.iter().map(|r| r.value).collect()
    }

    /// Reduced average wavelength (nm).
    pub fn average(&self) -> f64 {
        self.reduction.average
    }
}

struct Burst {
    readings: Vec<WavelengthReading>,
    failures: usize,
    duplicates: usize,
}

/// Drives a [`Wavemeter`] through sampling bursts.
pub struct WavelengthSampler {
    wavemeter: Arc<dyn Wavemeter>,
    options: SamplerOptions,
}

impl WavelengthSampler {
    /// Create a sampler over `wavemeter`.
    pub fn new(wavemeter: Arc<dyn Wavemeter>, options: SamplerOptions) -> Self {
        Self { wavemeter, options }
    }

    /// Sampler options.
    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    /// Collect `target_count` good samples and reduce them.
    ///
    /// `expected` enables the one-shot pre-filter around a known target.
    ///
    /// # Errors
    /// - `TooManyFailures` when failed polls exceed the allowed fraction
    /// - `Cancelled` if `cancel` fires mid-burst
    /// - `Timeout` if the burst exceeds `burst_timeout`
    /// - `EmptySet` if the pre-filter discards every sample
    #[instrument(skip(self, cancel), fields(target = self.options.target_count), err)]
    pub async fn sample_until(
        &self,
        expected: Option<ExpectedValue>,
        cancel: &CancellationToken,
    ) -> AppResult<WavelengthMeasurement> {
        self.wavemeter.start_measurement().await?;
        let burst = self.collect(cancel).await;
        if let Err(e) = self.wavemeter.stop_measurement().await {
            warn!(error = %e, "wavemeter stop_measurement failed");
        }
        let burst = burst?;

        let values: Vec<f64> = burst.readings.iter().map(|r| r.value).collect();
        let reduction = reduce_to_converged(
            &values,
            &ReductionOptions {
                expected,
                ..self.options.reduction
            },
        )?;

        info!(
            average_nm = reduction.average,
            stdev_nm = reduction.stdev,
            retained = reduction.retained_samples.len(),
            iterations = reduction.iteration_count,
            converged = reduction.converged,
            failures = burst.failures,
            "wavelength measured"
        );

        Ok(WavelengthMeasurement {
            readings: burst.readings,
            failures: burst.failures,
            duplicates: burst.duplicates,
            reduction,
        })
    }

    /// [`Self::sample_until`] with samples farther than `max_deviation` from
    /// `expected_nm` discarded before reduction.
    pub async fn sample_near(
        &self,
        expected_nm: f64,
        cancel: &CancellationToken,
    ) -> AppResult<WavelengthMeasurement> {
        let expected = ExpectedValue {
            value: expected_nm,
            max_deviation: self.options.max_deviation,
        };
        self.sample_until(Some(expected), cancel).await
    }

    async fn collect(&self, cancel: &CancellationToken) -> AppResult<Burst> {
        let target = self.options.target_count;
        let allowed = self.options.max_failure_fraction * target as f64;
        let deadline = Instant::now() + self.options.burst_timeout;

        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut burst = Burst {
            readings: Vec::with_capacity(target),
            failures: 0,
            duplicates: 0,
        };

        while burst.readings.len() < target {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(collected = burst.readings.len(), "wavelength sampling cancelled");
                    return Err(OpoError::Cancelled("wavelength sampling"));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(OpoError::Timeout(self.options.burst_timeout, "wavelength samples"));
                }
                _ = ticker.tick() => {}
            }

            let value = match self.wavemeter.read_wavelength().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "wavemeter read failed");
                    0.0
                }
            };

            if !(value > 0.0 && value.is_finite()) {
                burst.failures += 1;
                if burst.failures as f64 > allowed {
                    let err = OpoError::TooManyFailures {
                        failures: burst.failures,
                        limit: allowed.floor() as usize,
                    };
                    warn!(kind = err.kind(), "{}", err);
                    return Err(err);
                }
                continue;
            }

            if burst.readings.last().map(|r| r.value) == Some(value) {
                burst.duplicates += 1;
                continue;
            }

            debug!(wavelength_nm = value, "wavemeter sample");
            burst.readings.push(WavelengthReading {
                value,
                timestamp: Utc::now(),
            });
        }

        Ok(burst)
    }
}
