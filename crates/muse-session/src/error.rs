//! # Error Types
//!
//! Semantic error types for the headband session core. Every variant carries
//! enough context to diagnose the problem without digging through logs.
//!
//! ## Error Taxonomy
//!
//! Consumers of [`SessionEvent::Error`](crate::events::SessionEvent::Error)
//! only see the coarse [`ErrorKind`]. [`SessionError::kind`] folds every
//! variant onto that four-way taxonomy, and [`ErrorKind::from_vendor_code`]
//! does the same for raw vendor error packets.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenient Result alias for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Coarse error category surfaced to event consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The connect sequence failed or timed out.
    ConnectionFailed,

    /// The link was lost without the caller asking for it.
    DeviceDisconnected,

    /// The vendor reports an unimplemented feature, or the headband
    /// needs a firmware update or license before it can be used.
    DeviceNotSupported,

    /// Anything the vendor reports that doesn't map to the above.
    Unknown,
}

impl ErrorKind {
    /// Map a vendor error code onto the session taxonomy.
    ///
    /// Codes carried by vendor error packets:
    /// - `1`: connection failure
    /// - `2`: device disconnected
    /// - `3`: feature not implemented on this headband
    /// - `4`: firmware or license blocks the request
    #[must_use]
    pub fn from_vendor_code(code: i32) -> Self {
        match code {
            1 => ErrorKind::ConnectionFailed,
            2 => ErrorKind::DeviceDisconnected,
            3 | 4 => ErrorKind::DeviceNotSupported,
            _ => ErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::DeviceDisconnected => "device disconnected",
            ErrorKind::DeviceNotSupported => "device not supported",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// All errors that can occur while driving a headband session.
#[derive(Error, Debug)]
pub enum SessionError {
    // ─── Connection ─────────────────────────────────────────────────
    /// The connect sequence could not be started or completed.
    #[error("Failed to connect to {device}: {reason}. Is the headband powered on and in range?")]
    ConnectionFailed { device: String, reason: String },

    /// A bounded wait for the link to settle ran out.
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u64 },

    /// The link dropped without the caller asking for it.
    #[error("Headband disconnected: {reason}")]
    DeviceDisconnected { reason: String },

    /// The headband needs a firmware update or a license, or the vendor
    /// does not implement the requested feature.
    #[error("Headband not supported: {reason}")]
    DeviceNotSupported { reason: String },

    // ─── Recovery ───────────────────────────────────────────────────
    /// Automatic recovery gave up. A manual connect re-arms it.
    #[error("Maximum reconnection attempts reached ({attempts})")]
    ReconnectLimitReached { attempts: u32 },

    /// The session was disposed and can no longer be used.
    #[error("Session has been disposed")]
    SessionDisposed,

    // ─── Vendor ─────────────────────────────────────────────────────
    /// Raw vendor SDK failure that doesn't map to a more specific variant.
    #[error("Vendor SDK error {code}: {message}")]
    Vendor { code: i32, message: String },

    // ─── Config ─────────────────────────────────────────────────────
    /// Configuration file error (missing, malformed, or invalid values).
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    // ─── I/O ────────────────────────────────────────────────────────
    /// Filesystem or I/O error (config file reading, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// The coarse category reported alongside this error in session events.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::ConnectionFailed { .. }
            | SessionError::Timeout { .. }
            | SessionError::ReconnectLimitReached { .. } => ErrorKind::ConnectionFailed,
            SessionError::DeviceDisconnected { .. } => ErrorKind::DeviceDisconnected,
            SessionError::DeviceNotSupported { .. } => ErrorKind::DeviceNotSupported,
            SessionError::Vendor { code, .. } => ErrorKind::from_vendor_code(*code),
            SessionError::SessionDisposed
            | SessionError::ConfigError { .. }
            | SessionError::Io(_) => ErrorKind::Unknown,
        }
    }

    /// Returns `true` if waiting longer or retrying may succeed.
    ///
    /// Firmware/license problems and disposal are never transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionFailed { .. }
                | SessionError::Timeout { .. }
                | SessionError::DeviceDisconnected { .. }
        )
    }
}

#[cfg(feature = "config-toml")]
impl From<toml::de::Error> for SessionError {
    fn from(err: toml::de::Error) -> Self {
        SessionError::ConfigError {
            reason: err.to_string(),
        }
    }
}
