//! Robust averaging of noisy wavemeter samples.
//!
//! [`reduce_to_converged`] is a trimmed-mean estimator: it repeatedly discards
//! samples farther than one standard deviation from the mean until the spread
//! drops below a threshold. It is not guaranteed to converge, so it always
//! terminates through the iteration cap or the minimum-retained floor and
//! reports the best-effort result either way. Callers judge trustworthiness
//! from [`ReductionResult::stdev`] and [`ReductionResult::converged`].

use crate::conversion::wavenumber_uncertainty;
use crate::error::{AppResult, OpoError};
use serde::{Deserialize, Serialize};

/// Expected-value pre-filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedValue {
    /// Value the samples should cluster around
    pub value: f64,
    /// Samples farther than this from `value` are discarded once, up front
    pub max_deviation: f64,
}

/// Convergence criteria for [`reduce_to_converged`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReductionOptions {
    /// Stop as soon as the population stdev is at or below this
    pub stdev_threshold: f64,
    /// Never trim below this many samples
    pub min_retained: usize,
    /// Upper bound on trimming passes
    pub max_iterations: usize,
    /// Optional one-shot pre-filter
    pub expected: Option<ExpectedValue>,
}

impl Default for ReductionOptions {
    fn default() -> Self {
        Self {
            stdev_threshold: 0.0005,
            min_retained: 5,
            max_iterations: 10,
            expected: None,
        }
    }
}

/// Outcome of one reduction. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionResult {
    /// Mean of the retained samples
    pub average: f64,
    /// Population standard deviation of the retained samples
    pub stdev: f64,
    /// Number of samples supplied, before any filtering
    pub sample_count: usize,
    /// Trimming passes performed
    pub iteration_count: usize,
    /// Samples surviving the reduction, in input order
    pub retained_samples: Vec<f64>,
    /// Whether the stdev threshold was reached
    pub converged: bool,
}

impl ReductionResult {
    /// Near-IR wavenumber uncertainty (cm⁻¹) implied by the retained spread.
    pub fn wavenumber_uncertainty(&self) -> f64 {
        wavenumber_uncertainty(self.average, self.stdev)
    }
}

/// Mean and population standard deviation (divides by N).
pub fn mean_and_stdev(samples: &[f64]) -> AppResult<(f64, f64)> {
    if samples.is_empty() {
        return Err(OpoError::EmptySet);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    Ok((mean, variance.sqrt()))
}

/// Iteratively trim outliers until the spread converges or a stop condition hits.
///
/// # Errors
/// `EmptySet` if `samples` is empty or the expected-value pre-filter removes
/// every sample.
pub fn reduce_to_converged(
    samples: &[f64],
    options: &ReductionOptions,
) -> AppResult<ReductionResult> {
    let mut current: Vec<f64> = match options.expected {
        Some(expected) => samples
            .iter()
            .copied()
            .filter(|x| (x - expected.value).abs() <= expected.max_deviation)
            .collect(),
        None => samples.to_vec(),
    };

    let mut iteration_count = 0;
    loop {
        let (mean, stdev) = mean_and_stdev(&current)?;

        if stdev <= options.stdev_threshold {
            return Ok(finish(samples.len(), iteration_count, current, mean, stdev, true));
        }
        if iteration_count >= options.max_iterations {
            tracing::debug!(iteration_count, stdev, "reduction hit iteration cap");
            return Ok(finish(samples.len(), iteration_count, current, mean, stdev, false));
        }

        let (low, high) = (mean - stdev, mean + stdev);
        let trimmed: Vec<f64> = current
            .iter()
            .copied()
            .filter(|x| (low..=high).contains(x))
            .collect();

        // Trimming to nothing new or below the floor keeps the current set
        if trimmed.len() < options.min_retained || trimmed.len() == current.len() {
            tracing::debug!(
                iteration_count,
                retained = current.len(),
                stdev,
                "reduction stopped without converging"
            );
            return Ok(finish(samples.len(), iteration_count, current, mean, stdev, false));
        }

        current = trimmed;
        iteration_count += 1;
    }
}

fn finish(
    sample_count: usize,
    iteration_count: usize,
    retained_samples: Vec<f64>,
    average: f64,
    stdev: f64,
    converged: bool,
) -> ReductionResult {
    ReductionResult {
        average,
        stdev,
        sample_count,
        iteration_count,
        retained_samples,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_stdev_constant() {
        let (mean, stdev) = mean_and_stdev(&[5.0, 5.0, 5.0, 5.0]).unwrap();
        assert_eq!(mean, 5.0);
        assert_eq!(stdev, 0.0);
    }

    #[test]
    fn test_population_stdev() {
        // Population stdev of [2, 4, 4, 4, 5, 5, 7, 9] is exactly 2
        let (mean, stdev) = mean_and_stdev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(mean, 5.0);
        assert!((stdev - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_set() {
        assert!(matches!(mean_and_stdev(&[]), Err(OpoError::EmptySet)));
        assert!(matches!(
            reduce_to_converged(&[], &ReductionOptions::default()),
            Err(OpoError::EmptySet)
        ));
    }

    #[test]
    fn test_zero_threshold_terminates() {
        let options = ReductionOptions {
            stdev_threshold: 0.0,
            min_retained: 1,
            max_iterations: 5,
            expected: None,
        };
        let result = reduce_to_converged(&[5.0, 5.0, 5.0, 5.0], &options).unwrap();
        assert!(result.converged);
        assert_eq!(result.average, 5.0);
        assert_eq!(result.iteration_count, 0);

        let result = reduce_to_converged(&[1.0, 2.0, 3.0, 4.0, 100.0], &options).unwrap();
        assert!(result.iteration_count <= options.max_iterations);
    }

    #[test]
    fn test_outlier_is_trimmed() {
        let samples = [750.0, 750.001, 749.999, 750.0005, 749.9995, 760.0];
        let options = ReductionOptions {
            stdev_threshold: 0.001,
            min_retained: 3,
            max_iterations: 10,
            expected: None,
        };
        let result = reduce_to_converged(&samples, &options).unwrap();

        assert!(result.converged);
        assert!(result.iteration_count > 0);
        assert!(result.retained_samples.len() < samples.len());
        assert!(!result.retained_samples.contains(&760.0));
        assert!((result.average - 750.0).abs() < 1e-6);
        assert_eq!(result.sample_count, 6);
    }

    #[test]
    fn test_non_converging_stops_at_iteration_cap() {
        // Evenly spread values keep losing their extremes
        let samples: Vec<f64> = (0..200).map(|i| i as f64).collect();
        let options = ReductionOptions {
            stdev_threshold: 1e-9,
            min_retained: 1,
            max_iterations: 3,
            expected: None,
        };
        let result = reduce_to_converged(&samples, &options).unwrap();

        assert!(!result.converged);
        assert_eq!(result.iteration_count, 3);
        assert!(result.stdev > options.stdev_threshold);
    }

    #[test]
    fn test_min_retained_floor() {
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let options = ReductionOptions {
            stdev_threshold: 1e-9,
            min_retained: 6,
            max_iterations: 10,
            expected: None,
        };
        let result = reduce_to_converged(&samples, &options).unwrap();

        assert!(!result.converged);
        assert_eq!(result.iteration_count, 0);
        assert_eq!(result.retained_samples.len(), 6);
    }

    #[test]
    fn test_expected_value_prefilter() {
        let samples = [750.0, 750.0, 751.9, 748.0, 750.0];
        let options = ReductionOptions {
            stdev_threshold: 0.0,
            min_retained: 1,
            max_iterations: 10,
            expected: Some(ExpectedValue {
                value: 750.0,
                max_deviation: 1.5,
            }),
        };
        let result = reduce_to_converged(&samples, &options).unwrap();

        assert!(result.converged);
        assert_eq!(result.retained_samples, vec![750.0, 750.0, 750.0]);
        assert_eq!(result.sample_count, 5);
    }

    #[test]
    fn test_prefilter_removing_everything_is_empty_set() {
        let options = ReductionOptions {
            expected: Some(ExpectedValue {
                value: 800.0,
                max_deviation: 0.5,
            }),
            ..Default::default()
        };
        assert!(matches!(
            reduce_to_converged(&[750.0, 751.0], &options),
            Err(OpoError::EmptySet)
        ));
    }
}
