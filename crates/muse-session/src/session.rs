//! # Device Session
//!
//! [`DeviceSession`] is the public face of one headband. It composes the
//! connection state machine, the channel registry, the reconnection policy
//! and the timestamp normalizer, and turns vendor callbacks into
//! [`SessionEvent`]s.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use muse_session::{ChannelKind, ChannelSet, DeviceSession, SessionConfig};
//! use muse_session::vendor::{DeviceIdentity, DeviceProvider};
//!
//! # async fn demo(provider: Arc<dyn DeviceProvider>) -> muse_session::SessionResult<()> {
//! let identity = DeviceIdentity::new("Muse-4A2C", "00:55:DA:B0:4A:2C");
//! let session = DeviceSession::new(provider, identity, SessionConfig::default());
//!
//! // Deferred until connected, replayed on every reconnect.
//! session.register_channels([ChannelKind::Alpha, ChannelKind::Beta].into_iter().collect::<ChannelSet>());
//!
//! let mut events = session.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! });
//!
//! session.connect().await?;
//! println!("battery: {:.0}%", session.battery_level().await);
//! session.disconnect().await?;
//! session.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Vendor callbacks
//!
//! Every listener the session registers with the vendor gets a clone of one
//! [`PacketSink`]. A single pump task drains it:
//!
//! - connection packets are reconciled against the cached state (an
//!   unexpected drop while connected starts recovery);
//! - data and artifact packets get their timestamps normalized and become
//!   [`TelemetryEvent`]s;
//! - vendor error packets become error events with an [`ErrorKind`].
//!
//! The same pump receives link-loss reports from the health monitor.
//!
//! ## Recovery
//!
//! On link loss the session announces `Disconnected`, raises a
//! `DeviceDisconnected` error and starts one recovery task. The task calls
//! the ordinary [`connect`](DeviceSession::connect) path up to
//! `reconnect.max_attempts` times; any successful connect resets the count.
//! When attempts run out a single "maximum reconnection attempts reached"
//! error is raised and no further automatic attempts are made until a
//! manual `connect()` succeeds.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelKind, ChannelSet};
use crate::config::{SessionConfig, TelemetryConfig};
use crate::error::{ErrorKind, SessionError, SessionResult};
use crate::events::{EventBus, SessionEvent, TelemetryEvent};
use crate::health::HealthStatus;
use crate::machine::ConnectionMachine;
use crate::state::ConnectionState;
use crate::stream::TelemetryStream;
use crate::timestamp::TimestampNormalizer;
use crate::vendor::{
    DeviceIdentity, DeviceProvider, PacketSink, VendorConnectionState, VendorPacket,
};

/// Signal quality reported when the vendor has no fit indicator.
const CONNECTED_SIGNAL_QUALITY: f64 = 0.8;

/// Shared between the facade, the pump and recovery tasks.
struct SessionInner {
    machine: ConnectionMachine,
    events: Arc<EventBus>,
    normalizer: TimestampNormalizer,
    telemetry: TelemetryConfig,
    last_battery: Mutex<Option<f64>>,
    cancel: CancellationToken,
}

/// One headband session.
///
/// See [module docs](self) for usage and the recovery model.
pub struct DeviceSession {
    inner: Arc<SessionInner>,
    pump: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Create a session for `identity`. Nothing touches the vendor until
    /// [`connect`](Self::connect).
    ///
    /// # Panics
    /// Must be called from within a tokio runtime; the vendor-packet pump
    /// is spawned here.
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        identity: DeviceIdentity,
        config: SessionConfig,
    ) -> Self {
        let (sink, packets) = PacketSink::channel();
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventBus::new());
        let normalizer = TimestampNormalizer::new(
            config.telemetry.plausible_window(),
            config.telemetry.timestamp_log_limit,
        );
        let telemetry = config.telemetry.clone();

        let inner = Arc::new(SessionInner {
            machine: ConnectionMachine::new(
                identity,
                provider,
                config,
                Arc::clone(&events),
                sink,
                health_tx,
            ),
            events,
            normalizer,
            telemetry,
            last_battery: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let pump = tokio::spawn(run_pump(Arc::clone(&inner), packets, health_rx));

        Self {
            inner,
            pump: Some(pump),
        }
    }

    // ─── Connection ──────────────────────────────────────────────────────

    /// Connect to the headband, replaying the desired channel set on
    /// success. Returns immediately if already connected.
    ///
    /// A failed connect leaves the session `Disconnected` and also raises
    /// an error event.
    ///
    /// # Errors
    /// Returns [`SessionError::Timeout`] if the link doesn't come up within
    /// `timeouts.connect_timeout_ms`, [`SessionError::DeviceNotSupported`] if
    /// the headband needs a firmware update or a license,
    /// [`SessionError::ConnectionFailed`] if a mandatory vendor call fails,
    /// and [`SessionError::SessionDisposed`] after [`dispose`](Self::dispose).
    pub async fn connect(&self) -> SessionResult<()> {
        self.inner.machine.connect().await
    }

    /// Disconnect from the headband. Always leaves the session
    /// `Disconnected`; vendor failures are logged, not returned.
    ///
    /// Also stops automatic recovery until the next `connect()`.
    ///
    /// # Errors
    /// Currently never fails.
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.inner.machine.disconnect().await
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.machine.state()
    }

    /// Watch the connection state. Every write is visible to every receiver.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.machine.state_receiver()
    }

    /// The last state the vendor pushed through its connection listener.
    #[must_use]
    pub fn last_reported_state(&self) -> VendorConnectionState {
        self.inner.machine.reported_state()
    }

    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        self.inner.machine.identity()
    }

    /// Automatic reconnect attempts since the last successful connect.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.machine.reconnect().attempts()
    }

    // ─── Channels ────────────────────────────────────────────────────────

    /// Ask for `channels`. Subscribed immediately when connected, otherwise
    /// on the next successful connect.
    ///
    /// Vendor subscribe failures are logged, never returned.
    pub fn register_channels(&self, channels: ChannelSet) {
        self.inner.machine.register_channels(channels);
    }

    /// Stop asking for `channels`. Passing [`ChannelSet::all()`] behaves as
    /// [`unregister_all_channels`](Self::unregister_all_channels).
    ///
    /// # Errors
    /// [`SessionError::ConnectionFailed`] if a full wipe can't re-register
    /// the connection and error listeners.
    pub fn unregister_channels(&self, channels: ChannelSet) -> SessionResult<()> {
        self.inner.machine.unregister_channels(channels)
    }

    /// Forget every desired channel and wipe the vendor's data listeners.
    ///
    /// # Errors
    /// [`SessionError::ConnectionFailed`] if the connection and error
    /// listeners can't be re-registered.
    pub fn unregister_all_channels(&self) -> SessionResult<()> {
        self.inner.machine.unregister_all_channels()
    }

    /// Channels that will be subscribed on every connect.
    #[must_use]
    pub fn desired_channels(&self) -> ChannelSet {
        self.inner.machine.registry().desired()
    }

    // ─── Readouts ────────────────────────────────────────────────────────

    /// Battery charge in percent. Never fails.
    ///
    /// Prefers the vendor configuration object, then the last battery
    /// packet seen, then `telemetry.fallback_battery_percent`.
    pub async fn battery_level(&self) -> f64 {
        let from_vendor = self
            .inner
            .machine
            .device()
            .and_then(|device| device.configuration())
            .map(|config| config.battery_percent);
        let from_packets = *self
            .inner
            .last_battery
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        from_vendor
            .or(from_packets)
            .unwrap_or(self.inner.telemetry.fallback_battery_percent)
            .clamp(0.0, 100.0)
    }

    /// Signal quality from 0.0 to 1.0. Never fails.
    ///
    /// Uses the vendor's headband-fit indicator when it has one; otherwise
    /// 0.8 while connected and 0.0 otherwise.
    pub async fn signal_quality(&self) -> f64 {
        let fit = self
            .inner
            .machine
            .device()
            .and_then(|device| device.configuration())
            .and_then(|config| config.headband_fit);

        match fit {
            Some(fit) => fit.clamp(0.0, 1.0),
            None if self.state().is_connected() => CONNECTED_SIGNAL_QUALITY,
            None => 0.0,
        }
    }

    // ─── Events ──────────────────────────────────────────────────────────

    /// Subscribe to every session event.
    ///
    /// Slow receivers see [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Open a telemetry stream for `channels`.
    ///
    /// This only filters; it does not subscribe the channels with the
    /// vendor (see [`register_channels`](Self::register_channels)).
    #[must_use]
    pub fn telemetry_stream(&self, channels: ChannelSet) -> TelemetryStream {
        let rx = self
            .inner
            .events
            .add_stream(channels, self.inner.telemetry.stream_buffer);
        TelemetryStream::new(rx, channels)
    }

    // ─── Lifetime ────────────────────────────────────────────────────────

    /// Tear the session down for good: stop monitoring and recovery, issue
    /// a best-effort vendor disconnect and drop every vendor listener.
    /// Later `connect()` calls fail with [`SessionError::SessionDisposed`].
    pub async fn dispose(&self) {
        self.inner.machine.dispose().await;
        self.inner.cancel.cancel();
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.inner.machine.dispose_now();
        self.inner.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

// ─── Pump ───────────────────────────────────────────────────────────────

async fn run_pump(
    inner: Arc<SessionInner>,
    mut packets: mpsc::UnboundedReceiver<VendorPacket>,
    mut health: mpsc::UnboundedReceiver<HealthStatus>,
) {
    let cancel = inner.cancel.clone();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(packet) = packets.recv() => inner.handle_packet(packet),
            Some(status) = health.recv() => inner.handle_health(status),
            else => break,
        }
    }
    tracing::debug!(device = %inner.machine.identity(), "Vendor packet pump stopped");
}

impl SessionInner {
    fn handle_packet(self: &Arc<Self>, packet: VendorPacket) {
        match packet {
            VendorPacket::Connection { previous, current } => {
                if self.machine.observe_vendor_transition(previous, current) {
                    self.spawn_recovery();
                }
            }
            VendorPacket::Data {
                channel,
                values,
                raw_timestamp,
            } => {
                if channel == ChannelKind::Battery {
                    if let Some(&percent) = values.first() {
                        *self
                            .last_battery
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(percent);
                    }
                }
                let timestamp = self.normalizer.normalize(raw_timestamp);
                self.events.telemetry(TelemetryEvent::WaveSample {
                    channel,
                    values,
                    timestamp,
                });
            }
            VendorPacket::Artifact {
                blink,
                jaw_clench,
                headband_on,
                raw_timestamp,
            } => {
                let timestamp = self.normalizer.normalize(raw_timestamp);
                self.events.telemetry(TelemetryEvent::Artifact {
                    blink,
                    jaw_clench,
                    headband_loose: !headband_on,
                    timestamp,
                });
            }
            VendorPacket::Error { message, code } => {
                self.events.telemetry(TelemetryEvent::Error {
                    message,
                    kind: ErrorKind::from_vendor_code(code),
                });
            }
            VendorPacket::DeviceListChanged => {
                tracing::trace!("Ignoring device list change on a session sink");
            }
        }
    }

    fn handle_health(self: &Arc<Self>, status: HealthStatus) {
        match status {
            HealthStatus::LinkLost { vendor_state } => {
                let reason = format!("health check found vendor {vendor_state:?}");
                if self.machine.mark_link_lost(&reason) {
                    self.spawn_recovery();
                }
            }
        }
    }

    fn spawn_recovery(self: &Arc<Self>) {
        if !self.machine.reconnect().enabled() {
            tracing::info!(device = %self.machine.identity(), "Automatic reconnection disabled");
            return;
        }
        tokio::spawn(recover(Arc::clone(self)));
    }

    /// Still wanted, still down, and not disposed.
    fn link_wanted_but_down(&self) -> bool {
        !self.machine.is_disposed()
            && self.machine.wants_connected()
            && !self.machine.state().is_connected()
    }

    async fn run_recovery(&self) {
        let reconnect = self.machine.reconnect();
        let device = &self.machine.identity().name;

        while self.link_wanted_but_down() {
            let Some(attempt) = reconnect.begin_attempt() else {
                if reconnect.take_exhausted_report() {
                    let err = SessionError::ReconnectLimitReached {
                        attempts: reconnect.ceiling(),
                    };
                    tracing::error!(device, attempts = reconnect.ceiling(), "Giving up on automatic reconnection");
                    self.events.error(err.to_string(), err.kind());
                }
                return;
            };

            tracing::info!(device, attempt, max = reconnect.ceiling(), "Attempting automatic reconnection");
            match self.machine.connect_for_recovery().await {
                Ok(()) if self.machine.state().is_connected() => {
                    tracing::info!(device, attempt, "Automatic reconnection succeeded");
                }
                Ok(()) => tracing::debug!(device, attempt, "Automatic reconnection skipped"),
                Err(e) => tracing::warn!(device, attempt, error = %e, "Automatic reconnection failed"),
            }
        }
    }
}

/// Runs recovery in the single recovery slot. Re-checks after releasing the
/// slot so a drop that raced the release is not lost.
async fn recover(inner: Arc<SessionInner>) {
    loop {
        {
            let Some(_slot) = inner.machine.reconnect().try_start_recovery() else {
                return;
            };
            inner.run_recovery().await;
        }
        if !inner.link_wanted_but_down() || inner.machine.reconnect().is_exhausted() {
            return;
        }
    }
}
