//! # Connection State
//!
//! [`ConnectionState`] is the single authoritative view of the link that
//! callers see. It lives in a [`StateCell`], a thin wrapper over a
//! `tokio::sync::watch` channel: writes from caller tasks and from the
//! vendor-packet pump are totally ordered, every reader observes them with
//! happens-before guarantees, and waiters can sleep until the value changes
//! instead of spinning.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::vendor::VendorConnectionState;

/// High-level connection state exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    NeedsFirmwareUpdate,
    NeedsLicense,
    Unknown,
}

impl ConnectionState {
    /// Total mapping from the vendor's state enum.
    #[must_use]
    pub fn from_vendor(state: VendorConnectionState) -> Self {
        match state {
            VendorConnectionState::Connected => ConnectionState::Connected,
            VendorConnectionState::Connecting => ConnectionState::Connecting,
            VendorConnectionState::Disconnected => ConnectionState::Disconnected,
            VendorConnectionState::NeedsUpdate => ConnectionState::NeedsFirmwareUpdate,
            VendorConnectionState::NeedsLicense => ConnectionState::NeedsLicense,
            VendorConnectionState::Other(_) => ConnectionState::Unknown,
        }
    }

    #[must_use]
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared, observable holder of the cached [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Store `next`, returning the previous value if it actually changed.
    pub fn set(&self, next: ConnectionState) -> Option<ConnectionState> {
        let mut previous = None;
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                previous = Some(*current);
                *current = next;
                true
            }
        });
        previous
    }

    /// Store `next` only if the current value is `expected`.
    pub fn compare_and_set(&self, expected: ConnectionState, next: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == expected && expected != next {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// A receiver that wakes on every change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
