//! # Protocol Steps
//!
//! Every vendor call the session makes is a declared [`Step`] with a
//! [`StepPolicy`]. Whether a failure is swallowed or surfaced is a property
//! of the step, not of whichever call site happened to grow a `match`.
//!
//! | Step | Policy |
//! |------|--------|
//! | [`OPEN_HANDLE`] | Fatal |
//! | [`DEFENSIVE_DISCONNECT`] | Best effort |
//! | [`CLEAR_LISTENERS`] | Best effort |
//! | [`REGISTER_CORE_LISTENERS`] | Fatal |
//! | [`APPLY_PRESET`] | Best effort |
//! | [`ENABLE_TRANSMISSION`] | Best effort |
//! | [`RUN_ASYNCHRONOUSLY`] | Fatal |
//! | [`SUBSCRIBE_CHANNEL`] | Best effort |
//! | [`UNSUBSCRIBE_CHANNEL`] | Best effort |
//! | [`DISABLE_TRANSMISSION`] | Best effort |
//! | [`VENDOR_DISCONNECT`] | Best effort |
//!
//! ```
//! use muse_session::steps::{APPLY_PRESET, RUN_ASYNCHRONOUSLY, StepPolicy};
//! use muse_session::vendor::VendorError;
//!
//! let skipped = APPLY_PRESET.run("Muse-4A2C", || Err::<(), _>(VendorError::new(1, "busy")));
//! assert!(matches!(skipped, Ok(None)));
//!
//! let failed = RUN_ASYNCHRONOUSLY.run("Muse-4A2C", || Err::<(), _>(VendorError::new(1, "busy")));
//! assert!(failed.is_err());
//! assert_eq!(RUN_ASYNCHRONOUSLY.policy, StepPolicy::Fatal);
//! ```

use crate::error::{SessionError, SessionResult};
use crate::vendor::VendorResult;

/// What a failure of a step means for the surrounding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    /// Log and carry on; partial configuration is still usable.
    BestEffort,

    /// Abort the surrounding operation.
    Fatal,
}

/// A named vendor call with a declared failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub name: &'static str,
    pub policy: StepPolicy,
}

pub const OPEN_HANDLE: Step = Step::fatal("open device handle");
pub const DEFENSIVE_DISCONNECT: Step = Step::best_effort("defensive disconnect");
pub const CLEAR_LISTENERS: Step = Step::best_effort("clear listeners");
pub const REGISTER_CORE_LISTENERS: Step = Step::fatal("register connection/error listeners");
pub const APPLY_PRESET: Step = Step::best_effort("apply preset");
pub const ENABLE_TRANSMISSION: Step = Step::best_effort("enable data transmission");
pub const RUN_ASYNCHRONOUSLY: Step = Step::fatal("run asynchronously");
pub const SUBSCRIBE_CHANNEL: Step = Step::best_effort("subscribe channel");
pub const UNSUBSCRIBE_CHANNEL: Step = Step::best_effort("unsubscribe channel");
pub const DISABLE_TRANSMISSION: Step = Step::best_effort("disable data transmission");
pub const VENDOR_DISCONNECT: Step = Step::best_effort("vendor disconnect");

impl Step {
    #[must_use]
    pub const fn best_effort(name: &'static str) -> Self {
        Self {
            name,
            policy: StepPolicy::BestEffort,
        }
    }

    #[must_use]
    pub const fn fatal(name: &'static str) -> Self {
        Self {
            name,
            policy: StepPolicy::Fatal,
        }
    }

    /// Run the vendor call under this step's policy.
    ///
    /// Returns `Ok(Some(value))` on success, `Ok(None)` when a best-effort
    /// step failed (already logged), and
    /// [`SessionError::ConnectionFailed`] when a fatal step failed.
    ///
    /// # Errors
    /// Only fatal steps produce errors.
    pub fn run<T>(
        &self,
        device: &str,
        call: impl FnOnce() -> VendorResult<T>,
    ) -> SessionResult<Option<T>> {
        match call() {
            Ok(value) => {
                tracing::trace!(device, step = self.name, "Step succeeded");
                Ok(Some(value))
            }
            Err(e) => match self.policy {
                StepPolicy::BestEffort => {
                    tracing::warn!(device, step = self.name, error = %e, "Best-effort step failed, continuing");
                    Ok(None)
                }
                StepPolicy::Fatal => {
                    tracing::error!(device, step = self.name, error = %e, "Step failed");
                    Err(SessionError::ConnectionFailed {
                        device: device.to_string(),
                        reason: format!("{} failed: {e}", self.name),
                    })
                }
            },
        }
    }
}
