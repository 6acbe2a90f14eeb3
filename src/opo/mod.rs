//! OPO controller communication.
//!
//! - [`protocol`]: pure command formatting and response decoding
//! - [`link`]: async TCP client, state tracking, and event stream
//!
//! [`TunableOpo`] is the capability the targeting controller needs from an OPO.
//! [`link::OpoLink`] implements it over the real wire protocol; tests can
//! substitute a scripted double.

pub mod link;
pub mod protocol;

pub use link::{LinkOptions, OpoEvent, OpoLink};
pub use protocol::{ConnectionState, ErrorCode, MotorStatus, OpoCommand};

use crate::error::AppResult;
use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

/// Capability: tune the OPO motor and wait for it to settle.
///
/// # Contract
/// - `move_and_settle` rejects unsafe wavelengths before touching hardware
/// - `move_and_settle` returns only once the motor reports idle, the bounded
///   wait expires, or `cancel` fires
/// - `lock_session` serializes multi-command requests on one connection
#[async_trait]
pub trait TunableOpo: Send + Sync {
    /// Acquire exclusive use of the connection for one request.
    async fn lock_session(&self) -> OwnedMutexGuard<()>;

    /// Move to `wavelength_nm` (nm) and wait for the motor to stop.
    async fn move_and_settle(
        &self,
        wavelength_nm: f64,
        cancel: &CancellationToken,
    ) -> AppResult<()>;
}
