//! Wavelength / wavenumber conversion across the four OPO output bands.
//!
//! The OPO motor tunes a near-IR (nIR) wavelength directly. The three longer
//! bands are produced by difference-frequency mixing with the Nd:YAG fundamental:
//!
//! | Band | Valid wavenumber (cm⁻¹) | nIR wavenumber |
//! |------|-------------------------|----------------|
//! | nIR  | 11355 < ν < 14080       | ν              |
//! | iIR  | 4500 < ν < 7400         | 2·ν_YAG − ν    |
//! | mIR  | 2000 < ν ≤ 4500         | ν_YAG + ν      |
//! | fIR  | 625 < ν ≤ 2000          | (3·ν_YAG − ν)/2|
//!
//! All wavelength outputs are rounded to [`WAVELENGTH_DECIMALS`] places so that
//! floating-point drift never feeds back into hardware commands.

use crate::error::{AppResult, OpoError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nd:YAG fundamental used as the mixing reference (nm)
pub const YAG_WAVELENGTH_NM: f64 = 1064.5;

/// Hardware-safe near-IR motor range (nm)
pub const NIR_MIN_NM: f64 = 710.0;
/// Hardware-safe near-IR motor range (nm)
pub const NIR_MAX_NM: f64 = 880.0;

/// Decimal places kept on every derived wavelength
pub const WAVELENGTH_DECIMALS: i32 = 4;

const NM_CM_FACTOR: f64 = 1.0e7;

/// OPO output band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    /// Near-IR, the motor wavelength itself
    Nir,
    /// Intermediate IR
    Iir,
    /// Mid IR
    Mir,
    /// Far IR
    Fir,
}

impl Band {
    /// All bands in display order.
    pub const ALL: [Band; 4] = [Band::Nir, Band::Iir, Band::Mir, Band::Fir];

    /// Whether `wavenumber` falls in this band's valid range.
    ///
    /// Endpoints are exclusive except for the shared mIR/iIR (4500) and
    /// fIR/mIR (2000) boundaries, which belong to the lower band.
    pub fn contains(self, wavenumber: f64) -> bool {
        match self {
            Band::Nir => wavenumber > 11355.0 && wavenumber < 14080.0,
            Band::Iir => wavenumber > 4500.0 && wavenumber < 7400.0,
            Band::Mir => wavenumber > 2000.0 && wavenumber <= 4500.0,
            Band::Fir => wavenumber > 625.0 && wavenumber <= 2000.0,
        }
    }

    /// Classify a wavenumber into its band, if any.
    pub fn classify(wavenumber: f64) -> Option<Band> {
        Band::ALL.into_iter().find(|band| band.contains(wavenumber))
    }

    /// Factor relating a near-IR wavenumber error to an error in this band.
    pub fn error_scale(self) -> f64 {
        match self {
            Band::Fir => 2.0,
            _ => 1.0,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Band::Nir => "nIR",
            Band::Iir => "iIR",
            Band::Mir => "mIR",
            Band::Fir => "fIR",
        };
        write!(f, "{}", label)
    }
}

/// A photon-energy request resolved to a motor wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyTarget {
    /// Requested photon energy (cm⁻¹)
    pub requested_wavenumber: f64,
    /// Band the request falls in
    pub band: Band,
    /// Motor wavelength producing the requested energy (nm)
    pub near_ir_wavelength: f64,
}

/// Wavelength and wavenumber of one band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandValue {
    /// Wavelength (nm), rounded
    pub wavelength: f64,
    /// Wavenumber (cm⁻¹)
    pub wavenumber: f64,
}

/// All four band representations of one motor wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandConversions {
    /// Near-IR
    pub nir: BandValue,
    /// Intermediate IR
    pub iir: BandValue,
    /// Mid IR
    pub mir: BandValue,
    /// Far IR
    pub fir: BandValue,
}

impl BandConversions {
    /// Representation in `band`.
    pub fn get(&self, band: Band) -> BandValue {
        match band {
            Band::Nir => self.nir,
            Band::Iir => self.iir,
            Band::Mir => self.mir,
            Band::Fir => self.fir,
        }
    }
}

/// Round a wavelength to the fixed command precision.
pub fn round_wavelength(nm: f64) -> f64 {
    let scale = 10f64.powi(WAVELENGTH_DECIMALS);
    (nm * scale).round() / scale
}

/// Convert wavelength (nm) to wavenumber (cm⁻¹).
///
/// Returns 0 for a zero, negative, or non-finite wavelength: the energy is
/// undefined rather than erroneous.
pub fn wavelength_to_wavenumber(nm: f64) -> f64 {
    if nm <= 0.0 || !nm.is_finite() {
        return 0.0;
    }
    NM_CM_FACTOR / nm
}

/// Same formula as [`wavelength_to_wavenumber`]; the conversion is its own inverse.
pub fn wavenumber_to_wavelength(wavenumber: f64) -> f64 {
    wavelength_to_wavenumber(wavenumber)
}

/// Nd:YAG reference wavenumber (cm⁻¹).
pub fn yag_wavenumber() -> f64 {
    wavelength_to_wavenumber(YAG_WAVELENGTH_NM)
}

/// Whether a motor wavelength is inside the hardware-safe range.
pub fn is_safe_near_ir(nm: f64) -> bool {
    (NIR_MIN_NM..=NIR_MAX_NM).contains(&nm)
}

/// Reject motor wavelengths outside the hardware-safe range.
pub fn validate_near_ir(nm: f64) -> AppResult<()> {
    if !is_safe_near_ir(nm) {
        return Err(OpoError::Validation(format!(
            "near-IR wavelength {} nm outside {}-{} nm",
            nm, NIR_MIN_NM, NIR_MAX_NM
        )));
    }
    Ok(())
}

/// Resolve a requested photon energy to its band and motor wavelength.
///
/// # Errors
/// - `OutOfRange` if the wavenumber lies in no band
/// - `Validation` if the derived motor wavelength is outside 710-880 nm
pub fn classify_and_convert(wavenumber: f64) -> AppResult<EnergyTarget> {
    let band = Band::classify(wavenumber).ok_or(OpoError::OutOfRange(wavenumber))?;
    let yag = yag_wavenumber();

    let nir_wavenumber = match band {
        Band::Nir => wavenumber,
        Band::Iir => 2.0 * yag - wavenumber,
        Band::Mir => yag + wavenumber,
        Band::Fir => (3.0 * yag - wavenumber) / 2.0,
    };
    let near_ir_wavelength = round_wavelength(wavenumber_to_wavelength(nir_wavenumber));
    validate_near_ir(near_ir_wavelength)?;

    Ok(EnergyTarget {
        requested_wavenumber: wavenumber,
        band,
        near_ir_wavelength,
    })
}

/// Derive all four band representations of a motor wavelength.
pub fn full_conversion(near_ir_wavelength: f64) -> BandConversions {
    let yag = yag_wavenumber();
    let nir_wn = wavelength_to_wavenumber(near_ir_wavelength);

    let band = |wavenumber: f64| BandValue {
        wavelength: round_wavelength(wavenumber_to_wavelength(wavenumber)),
        wavenumber,
    };

    BandConversions {
        nir: BandValue {
            wavelength: round_wavelength(near_ir_wavelength),
            wavenumber: nir_wn,
        },
        iir: band(2.0 * yag - nir_wn),
        mir: band(nir_wn - yag),
        fir: band(3.0 * yag - 2.0 * nir_wn),
    }
}

/// Wavenumber uncertainty (cm⁻¹) of a near-IR measurement with spread `stdev_nm`.
///
/// Negative by convention: a wavelength spread of +σ lowers the wavenumber.
pub fn wavenumber_uncertainty(wavelength_nm: f64, stdev_nm: f64) -> f64 {
    let denom = wavelength_nm * wavelength_nm + wavelength_nm * stdev_nm;
    if denom <= 0.0 {
        return 0.0;
    }
    -(NM_CM_FACTOR * stdev_nm) / denom
}
