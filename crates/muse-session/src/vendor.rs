//! # Vendor SDK Contract
//!
//! The native headband SDK is an external collaborator. This module is the
//! narrow contract the session core drives it through:
//!
//! - [`DeviceProvider`]: the vendor's device manager (discovery, handle
//!   construction).
//! - [`BciDevice`]: one headband handle: connect/disconnect primitives,
//!   configuration mutators, listener registration.
//! - [`VendorPacket`]: everything the vendor reports back. Vendor threads
//!   push packets into a [`PacketSink`]; nothing on a vendor thread ever
//!   calls back into session state.
//!
//! Every fallible call returns [`VendorError`]; the session decides per
//! call whether a failure is fatal or merely logged.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channels::ChannelKind;
use crate::error::SessionError;

/// Connection state as reported by the vendor SDK.
///
/// Raw codes follow the native enum: `0` unknown, `1` connected,
/// `2` connecting, `3` disconnected, `4` needs update, `5` needs license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VendorConnectionState {
    Connected,
    Connecting,
    Disconnected,
    NeedsUpdate,
    NeedsLicense,
    /// Any code the SDK adds that we don't know about.
    Other(i32),
}

impl VendorConnectionState {
    /// Decode a raw native state code.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Connected,
            2 => Self::Connecting,
            3 => Self::Disconnected,
            4 => Self::NeedsUpdate,
            5 => Self::NeedsLicense,
            other => Self::Other(other),
        }
    }

    /// States no amount of waiting will get out of.
    #[must_use]
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::NeedsUpdate | Self::NeedsLicense)
    }
}

/// Fixed device configuration preset applied on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Preset {
    #[serde(rename = "preset_20")]
    Preset20,
    #[default]
    #[serde(rename = "preset_21")]
    Preset21,
    #[serde(rename = "preset_22")]
    Preset22,
    #[serde(rename = "preset_23")]
    Preset23,
    #[serde(rename = "preset_ab")]
    PresetAb,
    #[serde(rename = "preset_ad")]
    PresetAd,
}

impl Preset {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Preset20 => "preset_20",
            Preset::Preset21 => "preset_21",
            Preset::Preset22 => "preset_22",
            Preset::Preset23 => "preset_23",
            Preset::PresetAb => "preset_ab",
            Preset::PresetAd => "preset_ad",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preset_20" => Ok(Preset::Preset20),
            "preset_21" => Ok(Preset::Preset21),
            "preset_22" => Ok(Preset::Preset22),
            "preset_23" => Ok(Preset::Preset23),
            "preset_ab" => Ok(Preset::PresetAb),
            "preset_ad" => Ok(Preset::PresetAd),
            other => Err(SessionError::ConfigError {
                reason: format!("unknown preset '{other}'"),
            }),
        }
    }
}

/// Immutable identity of one headband, as advertised by the vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Advertised name (e.g. `Muse-4A2C`).
    pub name: String,

    /// Stable identifier, typically the Bluetooth MAC address.
    pub id: String,

    /// Received signal strength hint at discovery time, in dBm.
    pub rssi: Option<f64>,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            rssi: None,
        }
    }

    #[must_use]
    pub fn with_rssi(mut self, rssi: f64) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Snapshot of the vendor's configuration object for a connected headband.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    /// Remaining charge, 0–100.
    pub battery_percent: f64,

    /// Headband fit indicator, 0.0 (off the head) to 1.0 (good contact).
    pub headband_fit: Option<f64>,
}

/// Packets the vendor delivers to registered listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum VendorPacket {
    /// Link transition.
    Connection {
        previous: VendorConnectionState,
        current: VendorConnectionState,
    },

    /// Channel data with the vendor's untrusted raw timestamp.
    Data {
        channel: ChannelKind,
        values: Vec<f64>,
        raw_timestamp: i64,
    },

    /// Blink / jaw-clench / seating flags.
    Artifact {
        blink: bool,
        jaw_clench: bool,
        headband_on: bool,
        raw_timestamp: i64,
    },

    /// Vendor-side error report.
    Error { message: String, code: i32 },

    /// The set of advertising headbands changed.
    DeviceListChanged,
}

/// Thread-safe handle vendor callbacks push packets into.
///
/// Cloning is cheap; every listener the session registers gets a clone.
#[derive(Debug, Clone)]
pub struct PacketSink {
    tx: mpsc::UnboundedSender<VendorPacket>,
}

impl PacketSink {
    /// Create a sink and the receiver the session consumes.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<VendorPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push a packet. Returns `false` once the session has gone away.
    ///
    /// Never blocks, so it is safe to call from vendor-owned threads.
    pub fn push(&self, packet: VendorPacket) -> bool {
        self.tx.send(packet).is_ok()
    }

    /// Returns `true` if nothing is consuming packets anymore.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A failed vendor SDK call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (vendor code {code})")]
pub struct VendorError {
    pub code: i32,
    pub message: String,
}

impl VendorError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<VendorError> for SessionError {
    fn from(err: VendorError) -> Self {
        SessionError::Vendor {
            code: err.code,
            message: err.message,
        }
    }
}

/// Result alias for vendor SDK calls.
pub type VendorResult<T> = Result<T, VendorError>;

/// One headband handle exposed by the vendor SDK.
///
/// Implementations wrap native calls; they may be invoked from any thread
/// and may fail or report stale state at any time.
pub trait BciDevice: Send + Sync {
    /// Synchronous poll of the vendor's own view of the link.
    fn connection_state(&self) -> VendorConnectionState;

    /// Start link establishment. Returns once the attempt is underway;
    /// the outcome arrives through the connection listener.
    fn run_asynchronously(&self) -> VendorResult<()>;

    fn disconnect(&self) -> VendorResult<()>;

    fn set_preset(&self, preset: Preset) -> VendorResult<()>;

    fn enable_data_transmission(&self, enabled: bool) -> VendorResult<()>;

    fn register_connection_listener(&self, sink: PacketSink) -> VendorResult<()>;

    fn register_error_listener(&self, sink: PacketSink) -> VendorResult<()>;

    fn register_data_listener(&self, sink: PacketSink, channel: ChannelKind) -> VendorResult<()>;

    fn unregister_data_listener(&self, channel: ChannelKind) -> VendorResult<()>;

    fn unregister_all_listeners(&self) -> VendorResult<()>;

    /// The vendor configuration object, if the SDK can produce one right now.
    fn configuration(&self) -> Option<DeviceConfiguration> {
        None
    }
}

/// The vendor's device manager.
pub trait DeviceProvider: Send + Sync {
    /// Build a handle for a known headband.
    fn open(&self, identity: &DeviceIdentity) -> VendorResult<Arc<dyn BciDevice>>;

    /// Begin listening for advertising headbands.
    fn start_listening(&self) -> VendorResult<()>;

    fn stop_listening(&self) -> VendorResult<()>;

    /// Headbands seen since listening started.
    fn devices(&self) -> Vec<DeviceIdentity>;

    /// Receive [`VendorPacket::DeviceListChanged`] notifications.
    fn register_list_listener(&self, _sink: PacketSink) -> VendorResult<()> {
        Ok(())
    }
}
