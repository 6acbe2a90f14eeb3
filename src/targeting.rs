//! Closed-loop energy targeting: move, measure, correct.
//!
//! A request for a photon energy (cm⁻¹) runs through these phases:
//!
//! ```text
//! Idle -> MovingCoarse -> AwaitingMotorStop -> Measuring
//!      -> Converged -> Done
//!      -> Correcting -> MovingFine -> AwaitingMotorStop -> Measuring -> ... -> Done
//! ```
//!
//! The first move goes to the motor wavelength computed from the band
//! relations. If the achieved energy misses by more than the tolerance, a
//! correction pass moves by the measured wavelength error, or by a small fixed
//! shift when that error is implausibly large. One correction pass runs by
//! default.
//!
//! The OPO session guard is held for the whole request, so two requests on the
//! same connection never interleave.

use crate::conversion::{
    classify_and_convert, full_conversion, is_safe_near_ir, round_wavelength, EnergyTarget,
};
use crate::error::{AppResult, OpoError};
use crate::opo::TunableOpo;
use crate::sampler::{WavelengthMeasurement, WavelengthSampler};
use crate::storage::{MeasurementRecord, WavelengthSeries};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Correction policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetingOptions {
    /// Acceptable |requested - achieved| energy (cm⁻¹)
    pub energy_tolerance: f64,
    /// Largest wavelength error trusted as a correction (nm)
    pub max_wavelength_correction: f64,
    /// Shift applied instead of an untrusted correction (nm)
    pub fallback_shift: f64,
    /// Correction passes after the first move
    pub max_attempts: usize,
}

impl Default for TargetingOptions {
    fn default() -> Self {
        Self {
            energy_tolerance: 0.3,
            max_wavelength_correction: 1.5,
            fallback_shift: 0.1,
            max_attempts: 1,
        }
    }
}

/// Phase of the current targeting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetingPhase {
    /// No request in progress
    Idle,
    /// First move to the computed wavelength
    MovingCoarse,
    /// Waiting for the motor to report idle
    AwaitingMotorStop,
    /// Sampling the wavemeter
    Measuring,
    /// Achieved energy within tolerance
    Converged,
    /// Computing the next corrective target
    Correcting,
    /// Corrective move
    MovingFine,
    /// Request finished
    Done,
}

impl fmt::Display for TargetingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetingPhase::Idle => "idle",
            TargetingPhase::MovingCoarse => "moving_coarse",
            TargetingPhase::AwaitingMotorStop => "awaiting_motor_stop",
            TargetingPhase::Measuring => "measuring",
            TargetingPhase::Converged => "converged",
            TargetingPhase::Correcting => "correcting",
            TargetingPhase::MovingFine => "moving_fine",
            TargetingPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// One move-and-measure pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetingAttempt {
    /// Wavelength sent to the motor (nm)
    pub commanded_wavelength: f64,
    /// Wavemeter burst taken after the move settled
    pub measurement: WavelengthMeasurement,
    /// Energy achieved in the requested band (cm⁻¹)
    pub achieved_energy: f64,
    /// requested - achieved (cm⁻¹)
    pub energy_error: f64,
    /// target - measured (nm)
    pub wavelength_error: f64,
}

impl TargetingAttempt {
    /// Reduced measured wavelength (nm).
    pub fn measured_wavelength(&self) -> f64 {
        self.measurement.average()
    }
}

/// Result of [`EnergyTargetingController::move_to_energy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementResult {
    /// Resolved request
    pub target: EnergyTarget,
    /// The coarse move
    pub first: TargetingAttempt,
    /// Correction passes, in order
    pub corrections: Vec<TargetingAttempt>,
    /// Tolerance the request was judged against (cm⁻¹)
    pub tolerance: f64,
}

impl MovementResult {
    /// The attempt whose measurement stands.
    pub fn final_attempt(&self) -> &TargetingAttempt {
        self.corrections.last().unwrap_or(&self.first)
    }

    /// Whether any correction pass ran.
    pub fn corrected(&self) -> bool {
        !self.corrections.is_empty()
    }

    /// Final energy error (cm⁻¹).
    pub fn energy_error(&self) -> f64 {
        self.final_attempt().energy_error
    }

    /// Whether the final attempt is within tolerance.
    pub fn within_tolerance(&self) -> bool {
        self.energy_error().abs() <= self.tolerance
    }

    /// Persisted form.
    pub fn to_record(&self) -> MeasurementRecord {
        let last = self.final_attempt();
        MeasurementRecord {
            desired_energy: self.target.requested_wavenumber,
            energy: last.achieved_energy,
            desired_wl: self.target.near_ir_wavelength,
            wavelength: last.measured_wavelength(),
            band: self.target.band,
            corrected: self.corrected(),
            wl_measurements: WavelengthSeries {
                initial_values: last.measurement.raw_values(),
                final_values: last.measurement.reduction.retained_samples.clone(),
            },
            timestamp: Utc::now(),
        }
    }
}

/// A scan step that produced no record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedStep {
    /// Requested wavenumber (cm⁻¹)
    pub wavenumber: f64,
    /// Error kind label
    pub kind: String,
    /// Error message
    pub reason: String,
}

/// Result of [`EnergyTargetingController::scan`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// One record per successful step
    pub records: Vec<MeasurementRecord>,
    /// Steps that failed without ending the scan
    pub skipped: Vec<SkippedStep>,
    /// Step at which connection loss or cancellation ended the scan early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<SkippedStep>,
}

impl ScanOutcome {
    /// Whether every step was attempted.
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

/// Drives an OPO and a wavemeter to requested photon energies.
pub struct EnergyTargetingController {
    opo: Arc<dyn TunableOpo>,
    sampler: WavelengthSampler,
    options: TargetingOptions,
    phase: watch::Sender<TargetingPhase>,
}

impl EnergyTargetingController {
    /// Create a controller.
    pub fn new(
        opo: Arc<dyn TunableOpo>,
        sampler: WavelengthSampler,
        options: TargetingOptions,
    ) -> Self {
        Self {
            opo,
            sampler,
            options,
            phase: watch::channel(TargetingPhase::Idle).0,
        }
    }

    /// Correction policy.
    pub fn options(&self) -> &TargetingOptions {
        &self.options
    }

    /// Current phase.
    pub fn phase(&self) -> TargetingPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions.
    pub fn phase_watch(&self) -> watch::Receiver<TargetingPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: TargetingPhase) {
        debug!(%phase, "targeting phase");
        self.phase.send_replace(phase);
    }

    /// Drive the OPO to `wavenumber` (cm⁻¹) and report what was achieved.
    ///
    /// # Errors
    /// - `OutOfRange` / `Validation` before any hardware interaction
    /// - any move, settle, or sampling error of the attempt in progress
    #[instrument(skip(self, cancel), err)]
    pub async fn move_to_energy(
        &self,
        wavenumber: f64,
        cancel: &CancellationToken,
    ) -> AppResult<MovementResult> {
        let target = classify_and_convert(wavenumber)?;
        info!(
            band = %target.band,
            target_nm = target.near_ir_wavelength,
            "energy target resolved"
        );

        let _session = self.opo.lock_session().await;
        let result = self.run(target, cancel).await;
        self.set_phase(if result.is_ok() {
            TargetingPhase::Done
        } else {
            TargetingPhase::Idle
        });
        result
    }

    async fn run(
        &self,
        target: EnergyTarget,
        cancel: &CancellationToken,
    ) -> AppResult<MovementResult> {
        self.set_phase(TargetingPhase::MovingCoarse);
        let first = self
            .attempt(&target, target.near_ir_wavelength, cancel)
            .await?;

        let mut result = MovementResult {
            target,
            first,
            corrections: Vec::new(),
            tolerance: self.options.energy_tolerance,
        };

        while !result.within_tolerance() && result.corrections.len() < self.options.max_attempts {
            self.set_phase(TargetingPhase::Correcting);
            let last = result.final_attempt();
            let next = self.correction_target(last);
            if !is_safe_near_ir(next) {
                warn!(
                    kind = "validation",
                    wavelength_nm = next,
                    "correction would leave the safe motor range; keeping current position"
                );
                break;
            }

            self.set_phase(TargetingPhase::MovingFine);
            let attempt = self.attempt(&result.target, next, cancel).await?;
            result.corrections.push(attempt);
        }

        if result.within_tolerance() {
            self.set_phase(TargetingPhase::Converged);
            info!(
                energy_error = result.energy_error(),
                corrected = result.corrected(),
                "energy target reached"
            );
        } else {
            warn!(
                energy_error = result.energy_error(),
                tolerance = self.options.energy_tolerance,
                "energy target missed"
            );
        }
        Ok(result)
    }

    fn correction_target(&self, last: &TargetingAttempt) -> f64 {
        let error = last.wavelength_error;
        let next = if error.abs() < self.options.max_wavelength_correction {
            last.commanded_wavelength + error
        } else {
            warn!(
                wavelength_error_nm = error,
                shift_nm = self.options.fallback_shift,
                "wavelength error implausible; applying fallback shift"
            );
            last.commanded_wavelength + error.signum() * self.options.fallback_shift
        };
        round_wavelength(next)
    }

    async fn attempt(
        &self,
        target: &EnergyTarget,
        commanded: f64,
        cancel: &CancellationToken,
    ) -> AppResult<TargetingAttempt> {
        debug!(commanded_nm = commanded, "moving OPO");
        self.set_phase(TargetingPhase::AwaitingMotorStop);
        self.opo.move_and_settle(commanded, cancel).await?;

        self.set_phase(TargetingPhase::Measuring);
        let measurement = self
            .sampler
            .sample_near(target.near_ir_wavelength, cancel)
            .await?;

        let measured = measurement.average();
        let achieved_energy = full_conversion(measured).get(target.band).wavenumber;
        let attempt = TargetingAttempt {
            commanded_wavelength: commanded,
            achieved_energy,
            energy_error: target.requested_wavenumber - achieved_energy,
            wavelength_error: target.near_ir_wavelength - measured,
            measurement,
        };
        info!(
            commanded_nm = commanded,
            measured_nm = measured,
            achieved_energy,
            energy_error = attempt.energy_error,
            "targeting attempt measured"
        );
        Ok(attempt)
    }

    /// Visit every wavenumber from `start` to `stop` inclusive in `step` increments.
    ///
    /// A step that fails is recorded in [`ScanOutcome::skipped`] and the scan
    /// moves on. Connection loss or cancellation ends the scan with
    /// [`ScanOutcome::aborted`] set; records already taken are kept.
    #[instrument(skip(self, cancel), err)]
    pub async fn scan(
        &self,
        start: f64,
        stop: f64,
        step: f64,
        cancel: &CancellationToken,
    ) -> AppResult<ScanOutcome> {
        let points = scan_points(start, stop, step)?;
        info!(steps = points.len(), "energy scan started");

        let mut outcome = ScanOutcome::default();
        for wavenumber in points {
            match self.move_to_energy(wavenumber, cancel).await {
                Ok(result) => outcome.records.push(result.to_record()),
                Err(e) if e.is_connection_loss() || matches!(e, OpoError::Cancelled(_)) => {
                    warn!(
                        kind = e.kind(),
                        wavenumber,
                        recorded = outcome.records.len(),
                        "energy scan aborted: {}",
                        e
                    );
                    outcome.aborted = Some(SkippedStep {
                        wavenumber,
                        kind: e.kind().to_string(),
                        reason: e.to_string(),
                    });
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(kind = e.kind(), wavenumber, "scan step skipped: {}", e);
                    outcome.skipped.push(SkippedStep {
                        wavenumber,
                        kind: e.kind().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            recorded = outcome.records.len(),
            skipped = outcome.skipped.len(),
            "energy scan finished"
        );
        Ok(outcome)
    }
}

/// Wavenumbers visited by a scan, inclusive of both ends.
pub fn scan_points(start: f64, stop: f64, step: f64) -> AppResult<Vec<f64>> {
    if !(start.is_finite() && stop.is_finite()) {
        return Err(OpoError::Validation("scan bounds must be finite".to_string()));
    }
    if !(step.is_finite() && step > 0.0) {
        return Err(OpoError::Validation(format!(
            "scan step {} must be positive",
            step
        )));
    }

    let direction = if stop >= start { 1.0 } else { -1.0 };
    let count = ((stop - start).abs() / step + 1e-9).floor() as usize + 1;
    Ok((0..count)
        .map(|i| {
            let v = start + direction * step * i as f64;
            (v * 1e6).round() / 1e6
        })
        .collect())
}
