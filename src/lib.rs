//! # OPO DAQ Core Library
//!
//! Control of an optical parametric oscillator (OPO) laser through its line-based
//! TCP controller, robust reduction of noisy wavemeter samples, and closed-loop
//! targeting of a requested photon energy.
//!
//! ## Crate Structure
//!
//! - **`conversion`**: wavelength/wavenumber conversions and the four IR bands
//!   (nIR, iIR, mIR, fIR) derived from the motor wavelength.
//! - **`stats`**: mean, population standard deviation, and the iterative
//!   trimmed-mean reduction.
//! - **`opo`**: the controller wire protocol and the async [`opo::OpoLink`] client,
//!   with its motor-status tracking and event stream.
//! - **`wavemeter`**: the wavemeter capability trait and simulated devices.
//! - **`sampler`**: wavemeter polling bursts with failure accounting.
//! - **`targeting`**: move, measure, correct; energy scans.
//! - **`storage`**: measurement records, flat logs, and error summaries.
//! - **`config`** / **`logging`**: figment configuration and tracing setup.
//! - **`error`**: the crate-wide [`error::OpoError`].

pub mod config;
pub mod conversion;
pub mod error;
pub mod logging;
pub mod opo;
pub mod sampler;
pub mod stats;
pub mod storage;
pub mod targeting;
pub mod wavemeter;

pub use error::{AppResult, OpoError};
