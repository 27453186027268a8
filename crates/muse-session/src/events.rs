//! # Session Events
//!
//! Everything a session reports to its consumers goes through the
//! [`EventBus`]:
//!
//! - [`SessionEvent`]s are broadcast to every [`subscribe`](EventBus::subscribe)r
//!   (connection changes, telemetry, errors).
//! - [`TelemetryEvent`]s are additionally fanned out to per-consumer bounded
//!   queues backing [`TelemetryStream`](crate::stream::TelemetryStream)s.
//!
//! Vendor error packets reach broadcast subscribers as
//! [`SessionEvent::Error`] and telemetry streams as [`TelemetryEvent::Error`],
//! so neither consumer sees the same report twice.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::channels::{ChannelKind, ChannelSet};
use crate::error::ErrorKind;
use crate::state::ConnectionState;

/// Capacity of the broadcast channel. Slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Normalized telemetry. Timestamps are always validated points in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    WaveSample {
        channel: ChannelKind,
        values: Vec<f64>,
        timestamp: DateTime<Utc>,
    },
    Artifact {
        blink: bool,
        jaw_clench: bool,
        headband_loose: bool,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        kind: ErrorKind,
    },
}

impl TelemetryEvent {
    /// The channel this event belongs to; errors belong to none.
    #[must_use]
    pub fn channel(&self) -> Option<ChannelKind> {
        match self {
            TelemetryEvent::WaveSample { channel, .. } => Some(*channel),
            TelemetryEvent::Artifact { .. } => Some(ChannelKind::Artifacts),
            TelemetryEvent::Error { .. } => None,
        }
    }
}

/// Consumer-visible session events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    Telemetry(TelemetryEvent),
    Error {
        message: String,
        kind: ErrorKind,
    },
}

struct StreamSubscriber {
    filter: ChannelSet,
    tx: mpsc::Sender<TelemetryEvent>,
}

impl StreamSubscriber {
    fn wants(&self, event: &TelemetryEvent) -> bool {
        event.channel().is_none_or(|c| self.filter.contains(c))
    }
}

/// Fan-out point for session events.
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    streams: Mutex<Vec<StreamSubscriber>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Register a bounded telemetry queue for `filter`'s channels.
    pub fn add_stream(&self, filter: ChannelSet, buffer: usize) -> mpsc::Receiver<TelemetryEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        if let Ok(mut streams) = self.streams.lock() {
            streams.push(StreamSubscriber { filter, tx });
        }
        rx
    }

    pub fn connection_changed(&self, old: ConnectionState, new: ConnectionState) {
        tracing::info!(%old, %new, "Connection state changed");
        // No subscribers is fine.
        let _ = self.tx.send(SessionEvent::ConnectionChanged { old, new });
    }

    pub fn error(&self, message: impl Into<String>, kind: ErrorKind) {
        let message = message.into();
        tracing::warn!(%kind, %message, "Session error");
        let _ = self.tx.send(SessionEvent::Error { message, kind });
    }

    /// Publish telemetry to broadcast subscribers and matching streams.
    pub fn telemetry(&self, event: TelemetryEvent) {
        if let TelemetryEvent::Error { message, kind } = &event {
            let _ = self.tx.send(SessionEvent::Error {
                message: message.clone(),
                kind: *kind,
            });
        } else {
            let _ = self.tx.send(SessionEvent::Telemetry(event.clone()));
        }
        self.fan_out(&event);
    }

    fn fan_out(&self, event: &TelemetryEvent) {
        let Ok(mut streams) = self.streams.lock() else {
            return;
        };
        streams.retain(|sub| {
            if !sub.wants(event) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("Telemetry stream full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live telemetry streams.
    pub fn stream_count(&self) -> usize {
        self.streams
            .lock()
            .map(|mut s| {
                s.retain(|sub| !sub.tx.is_closed());
                s.len()
            })
            .unwrap_or(0)
    }
}
