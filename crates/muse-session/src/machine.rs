//! # Connection State Machine
//!
//! [`ConnectionMachine`] is the only writer of the authoritative
//! [`ConnectionState`] and the only code that drives the vendor's
//! connect/disconnect primitives.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──vendor CONNECTED (push or poll)──▶ Connected
//!                              │                                               │
//!                              └─timeout / NEEDS_UPDATE / NEEDS_LICENSE─▶ Disconnected ◀─disconnect() / link lost
//! ```
//!
//! `connect()` and `disconnect()` are serialized through one gate. Every
//! wait is bounded by [`TimeoutConfig`](crate::config::TimeoutConfig), and
//! `disconnect()` always ends in `Disconnected`, even if the vendor call
//! fails or the future is dropped midway.
//!
//! Waiting for the link reconciles two sources: the last state the vendor
//! *pushed* through its connection listener, and a direct *poll* of the
//! vendor every `poll_interval`. Either reaching the target ends the wait;
//! either reporting a firmware/license block aborts it immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::channels::{ChannelKind, ChannelRegistry, ChannelSet};
use crate::config::{SessionConfig, deadline_after};
use crate::error::{SessionError, SessionResult};
use crate::events::EventBus;
use crate::health::{HealthMonitor, HealthStatus};
use crate::reconnect::ReconnectPolicy;
use crate::state::{ConnectionState, StateCell};
use crate::steps;
use crate::vendor::{
    BciDevice, DeviceIdentity, DeviceProvider, PacketSink, VendorConnectionState,
};

/// Owner of the authoritative connection state.
pub(crate) struct ConnectionMachine {
    identity: DeviceIdentity,
    provider: Arc<dyn DeviceProvider>,
    config: SessionConfig,
    state: StateCell,
    reported: watch::Sender<VendorConnectionState>,
    gate: tokio::sync::Mutex<()>,
    device: Mutex<Option<Arc<dyn BciDevice>>>,
    sink: PacketSink,
    registry: ChannelRegistry,
    reconnect: ReconnectPolicy,
    events: Arc<EventBus>,
    monitor: Mutex<Option<HealthMonitor>>,
    health_tx: mpsc::UnboundedSender<HealthStatus>,
    wants_connected: AtomicBool,
    disconnecting: AtomicBool,
    disposed: AtomicBool,
}

impl ConnectionMachine {
    pub(crate) fn new(
        identity: DeviceIdentity,
        provider: Arc<dyn DeviceProvider>,
        config: SessionConfig,
        events: Arc<EventBus>,
        sink: PacketSink,
        health_tx: mpsc::UnboundedSender<HealthStatus>,
    ) -> Self {
        let (reported, _) = watch::channel(VendorConnectionState::Disconnected);
        let reconnect = ReconnectPolicy::new(&config.reconnect);
        Self {
            identity,
            provider,
            config,
            state: StateCell::new(),
            reported,
            gate: tokio::sync::Mutex::new(()),
            device: Mutex::new(None),
            sink,
            registry: ChannelRegistry::new(),
            reconnect,
            events,
            monitor: Mutex::new(None),
            health_tx,
            wants_connected: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub(crate) fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Last state the vendor pushed through its connection listener.
    pub(crate) fn reported_state(&self) -> VendorConnectionState {
        *self.reported.borrow()
    }

    pub(crate) fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub(crate) fn reconnect(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    pub(crate) fn wants_connected(&self) -> bool {
        self.wants_connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn device(&self) -> Option<Arc<dyn BciDevice>> {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn name(&self) -> &str {
        &self.identity.name
    }

    fn announce(&self, next: ConnectionState) {
        if let Some(old) = self.state.set(next) {
            self.events.connection_changed(old, next);
        }
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Bring the link up. A no-op when already connected.
    ///
    /// # Errors
    /// [`SessionError::Timeout`] if the link doesn't come up in time,
    /// [`SessionError::DeviceNotSupported`] on a firmware/license block,
    /// [`SessionError::ConnectionFailed`] if a fatal step fails, and
    /// [`SessionError::SessionDisposed`] after disposal.
    pub(crate) async fn connect(&self) -> SessionResult<()> {
        self.connect_as(Trigger::Caller).await
    }

    /// One automatic recovery attempt. Unlike [`connect`](Self::connect) it
    /// never asserts the wish to be connected: if a disconnect got the gate
    /// first, the attempt is dropped.
    ///
    /// # Errors
    /// Same as [`connect`](Self::connect).
    pub(crate) async fn connect_for_recovery(&self) -> SessionResult<()> {
        self.connect_as(Trigger::Recovery).await
    }

    async fn connect_as(&self, trigger: Trigger) -> SessionResult<()> {
        if self.is_disposed() {
            return Err(SessionError::SessionDisposed);
        }
        let _gate = self.gate.lock().await;
        if self.is_disposed() {
            return Err(SessionError::SessionDisposed);
        }
        if self.state.get().is_connected() {
            tracing::debug!(device = self.name(), "Already connected");
            return Ok(());
        }

        match trigger {
            Trigger::Caller => self.wants_connected.store(true, Ordering::SeqCst),
            Trigger::Recovery if !self.wants_connected() => {
                tracing::debug!(device = self.name(), "Disconnect requested, dropping recovery attempt");
                return Ok(());
            }
            Trigger::Recovery => {}
        }
        tracing::info!(device = self.name(), ?trigger, "Connecting");

        match self.connect_locked().await {
            Ok(()) => {
                tracing::info!(device = self.name(), "Connected");
                Ok(())
            }
            Err(e) => {
                self.announce(ConnectionState::Disconnected);
                self.events.error(e.to_string(), e.kind());
                Err(e)
            }
        }
    }

    async fn connect_locked(&self) -> SessionResult<()> {
        let timeouts = &self.config.timeouts;
        self.announce(ConnectionState::Connecting);

        let device = self.ensure_device()?;
        let name = self.name();

        let vendor_state = device.connection_state();
        if vendor_state != VendorConnectionState::Disconnected {
            tracing::debug!(device = name, ?vendor_state, "Vendor not idle, tearing down first");
            steps::DEFENSIVE_DISCONNECT.run(name, || device.disconnect())?;
            tokio::time::sleep(timeouts.teardown_settle()).await;
        }

        steps::CLEAR_LISTENERS.run(name, || device.unregister_all_listeners())?;
        steps::REGISTER_CORE_LISTENERS.run(name, || {
            device.register_connection_listener(self.sink.clone())?;
            device.register_error_listener(self.sink.clone())
        })?;
        steps::APPLY_PRESET.run(name, || device.set_preset(self.config.preset))?;
        if steps::ENABLE_TRANSMISSION
            .run(name, || device.enable_data_transmission(true))?
            .is_some()
        {
            tokio::time::sleep(timeouts.transmission_settle()).await;
        }

        // Pushes from before this attempt must not satisfy the wait.
        self.reported.send_replace(VendorConnectionState::Disconnected);
        steps::RUN_ASYNCHRONOUSLY.run(name, || device.run_asynchronously())?;

        if let Err(e) = self
            .wait_for_vendor(
                device.as_ref(),
                VendorConnectionState::Connected,
                timeouts.connect(),
                "connect",
                true,
            )
            .await
        {
            self.abandon_attempt(device.as_ref());
            return Err(e);
        }

        // Disposal doesn't wait forever for the gate.
        if self.is_disposed() {
            return Err(SessionError::SessionDisposed);
        }

        self.reconnect.reset();
        self.replay_subscriptions(device.as_ref());
        self.start_health_monitor(&device);
        self.announce(ConnectionState::Connected);
        Ok(())
    }

    /// Stop a started attempt that never reached `Connected`, so a late
    /// link can't stay up behind a `Disconnected` session.
    fn abandon_attempt(&self, device: &dyn BciDevice) {
        let name = self.name();
        tracing::debug!(device = name, "Abandoning connect attempt");
        let _ = steps::DISABLE_TRANSMISSION.run(name, || device.enable_data_transmission(false));
        let _ = steps::DEFENSIVE_DISCONNECT.run(name, || device.disconnect());
    }

    fn ensure_device(&self) -> SessionResult<Arc<dyn BciDevice>> {
        let mut slot = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(device) = slot.as_ref() {
            return Ok(Arc::clone(device));
        }
        let device = steps::OPEN_HANDLE
            .run(self.name(), || self.provider.open(&self.identity))?
            .ok_or_else(|| SessionError::ConnectionFailed {
                device: self.name().to_string(),
                reason: "vendor returned no device handle".into(),
            })?;
        *slot = Some(Arc::clone(&device));
        Ok(device)
    }

    /// Wait until the vendor reaches `target`, by push or by poll.
    async fn wait_for_vendor(
        &self,
        device: &dyn BciDevice,
        target: VendorConnectionState,
        timeout: Duration,
        operation: &'static str,
        abort_on_blocking: bool,
    ) -> SessionResult<()> {
        let mut pushed = self.reported.subscribe();
        let mut poll = tokio::time::interval(self.config.timeouts.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = deadline_after(timeout);
        let mut push_open = true;

        loop {
            let pushed_state = *pushed.borrow_and_update();
            let polled_state = device.connection_state();

            if pushed_state == target || polled_state == target {
                tracing::debug!(
                    device = self.name(),
                    ?pushed_state,
                    ?polled_state,
                    "Vendor reached {target:?}"
                );
                return Ok(());
            }

            if abort_on_blocking {
                for blocking in [polled_state, pushed_state] {
                    if blocking.is_blocking() {
                        return Err(SessionError::DeviceNotSupported {
                            reason: blocking_reason(blocking).into(),
                        });
                    }
                }
            }

            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(device = self.name(), operation, ?polled_state, "Timed out waiting for vendor");
                    return Err(SessionError::Timeout {
                        operation,
                        millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                _ = poll.tick() => {}
                changed = pushed.changed(), if push_open => {
                    push_open = changed.is_ok();
                }
            }
        }
    }

    fn replay_subscriptions(&self, device: &dyn BciDevice) {
        let plan = self.registry.replay_plan();
        tracing::debug!(device = self.name(), channels = ?plan, "Replaying channel subscriptions");
        self.subscribe_each(device, plan);
    }

    fn subscribe_each(&self, device: &dyn BciDevice, channels: ChannelSet) {
        for channel in channels.iter() {
            // Best effort, never errors.
            let _ = steps::SUBSCRIBE_CHANNEL.run(self.name(), || {
                device.register_data_listener(self.sink.clone(), channel)
            });
        }
    }

    fn start_health_monitor(&self, device: &Arc<dyn BciDevice>) {
        if !self.config.health.enabled {
            return;
        }
        let monitor = HealthMonitor::start(
            Arc::clone(device),
            self.state.subscribe(),
            &self.config.health,
            self.health_tx.clone(),
        );
        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(monitor);
        // Dropping cancels it.
        drop(previous);
    }

    fn take_health_monitor(&self) -> Option<HealthMonitor> {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // ─── Disconnect ──────────────────────────────────────────────────────

    /// Take the link down. Always ends in [`ConnectionState::Disconnected`];
    /// vendor failures are logged, never returned.
    ///
    /// # Errors
    /// Currently infallible; the `Result` keeps the signature symmetric
    /// with [`connect`](Self::connect).
    pub(crate) async fn disconnect(&self) -> SessionResult<()> {
        self.wants_connected.store(false, Ordering::SeqCst);
        let _gate = self.gate.lock().await;
        self.disconnecting.store(true, Ordering::SeqCst);
        let _finally = ForceDisconnected(self);

        if let Some(mut monitor) = self.take_health_monitor() {
            monitor.stop().await;
        }

        let Some(device) = self.device() else {
            return Ok(());
        };
        let name = self.name();
        tracing::info!(device = name, "Disconnecting");

        self.unsubscribe_each(device.as_ref(), self.registry.replay_plan());
        self.reported.send_replace(device.connection_state());
        if steps::VENDOR_DISCONNECT
            .run(name, || device.disconnect())?
            .is_some()
        {
            if let Err(e) = self
                .wait_for_vendor(
                    device.as_ref(),
                    VendorConnectionState::Disconnected,
                    self.config.timeouts.disconnect(),
                    "disconnect",
                    false,
                )
                .await
            {
                tracing::warn!(device = name, error = %e, "Vendor never confirmed disconnect");
            }
        }
        Ok(())
    }

    fn unsubscribe_each(&self, device: &dyn BciDevice, channels: ChannelSet) {
        for channel in channels.iter() {
            let _ = steps::UNSUBSCRIBE_CHANNEL
                .run(self.name(), || device.unregister_data_listener(channel));
        }
    }

    // ─── Channels ────────────────────────────────────────────────────────

    /// Add `channels` to the desired set, subscribing now if connected.
    pub(crate) fn register_channels(&self, channels: ChannelSet) {
        self.registry.merge(channels);
        let Some(device) = self.connected_device() else {
            tracing::debug!(device = self.name(), ?channels, "Not connected, subscription deferred");
            return;
        };
        self.subscribe_each(device.as_ref(), channels.with(ChannelKind::Artifacts));
        let _ = steps::ENABLE_TRANSMISSION.run(self.name(), || device.enable_data_transmission(true));
    }

    /// Remove `channels` from the desired set, unsubscribing now if connected.
    ///
    /// [`ChannelSet::all()`] means "everything" and takes the
    /// [`unregister_all_channels`](Self::unregister_all_channels) path.
    ///
    /// # Errors
    /// Only the "everything" path can fail.
    pub(crate) fn unregister_channels(&self, channels: ChannelSet) -> SessionResult<()> {
        if channels == ChannelSet::all() {
            return self.unregister_all_channels();
        }
        let remaining = self.registry.remove(channels);
        let Some(device) = self.connected_device() else {
            return Ok(());
        };
        // Artifacts stay on while connected.
        self.unsubscribe_each(device.as_ref(), channels.without(ChannelKind::Artifacts));
        if remaining.is_empty() {
            steps::DISABLE_TRANSMISSION
                .run(self.name(), || device.enable_data_transmission(false))?;
        }
        Ok(())
    }

    /// Forget every desired channel and wipe vendor data listeners,
    /// keeping only the connection and error listeners.
    ///
    /// # Errors
    /// [`SessionError::ConnectionFailed`] if the mandatory listeners can't
    /// be re-registered.
    pub(crate) fn unregister_all_channels(&self) -> SessionResult<()> {
        self.registry.clear();
        let Some(device) = self.connected_device() else {
            return Ok(());
        };
        let name = self.name();
        steps::CLEAR_LISTENERS.run(name, || device.unregister_all_listeners())?;
        steps::REGISTER_CORE_LISTENERS.run(name, || {
            device.register_connection_listener(self.sink.clone())?;
            device.register_error_listener(self.sink.clone())
        })?;
        steps::DISABLE_TRANSMISSION.run(name, || device.enable_data_transmission(false))?;
        Ok(())
    }

    fn connected_device(&self) -> Option<Arc<dyn BciDevice>> {
        if self.state.get().is_connected() {
            self.device()
        } else {
            None
        }
    }

    // ─── Vendor reconciliation ───────────────────────────────────────────

    /// Record a state the vendor pushed through its connection listener.
    ///
    /// Returns `true` if this revealed an unexpected link loss.
    pub(crate) fn observe_vendor_transition(
        &self,
        previous: VendorConnectionState,
        current: VendorConnectionState,
    ) -> bool {
        tracing::debug!(device = self.name(), ?previous, ?current, "Vendor connection packet");
        self.reported.send_replace(current);

        match self.state.get() {
            ConnectionState::Connected if current != VendorConnectionState::Connected => {
                self.mark_link_lost(&format!("vendor reported {current:?}"))
            }
            ConnectionState::Disconnected if current == VendorConnectionState::Connected => {
                // Late success for an attempt that already gave up.
                tracing::debug!(device = self.name(), "Ignoring vendor CONNECTED while disconnected");
                false
            }
            _ => false,
        }
    }

    /// Force the cached state to `Disconnected` after the vendor dropped the
    /// link behind our back.
    ///
    /// Returns `true` if the state was `Connected` and this was not part of
    /// a deliberate disconnect, i.e. recovery may be warranted.
    pub(crate) fn mark_link_lost(&self, reason: &str) -> bool {
        if self.is_disposed() || self.disconnecting.load(Ordering::SeqCst) {
            return false;
        }
        if !self
            .state
            .compare_and_set(ConnectionState::Connected, ConnectionState::Disconnected)
        {
            return false;
        }
        drop(self.take_health_monitor());
        self.events
            .connection_changed(ConnectionState::Connected, ConnectionState::Disconnected);

        let err = SessionError::DeviceDisconnected {
            reason: reason.to_string(),
        };
        self.events.error(err.to_string(), err.kind());
        self.wants_connected()
    }

    // ─── Dispose ─────────────────────────────────────────────────────────

    /// Tear everything down for good, waiting (bounded) for any in-flight
    /// connect or disconnect to finish first.
    pub(crate) async fn dispose(&self) {
        self.wants_connected.store(false, Ordering::SeqCst);
        let gate = tokio::time::timeout(self.config.timeouts.disconnect(), self.gate.lock()).await;
        if gate.is_err() {
            tracing::warn!(device = self.name(), "Disposing while an operation is still running");
        }
        self.dispose_now();
    }

    /// Synchronous best-effort teardown. Idempotent.
    pub(crate) fn dispose_now(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wants_connected.store(false, Ordering::SeqCst);
        self.disconnecting.store(true, Ordering::SeqCst);
        drop(self.take_health_monitor());

        let device = self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(device) = device {
            let name = self.name();
            tracing::info!(device = name, "Disposing session");
            let _ = steps::VENDOR_DISCONNECT.run(name, || device.disconnect());
            let _ = steps::CLEAR_LISTENERS.run(name, || device.unregister_all_listeners());
        }
        self.announce(ConnectionState::Disconnected);
    }
}

/// Who asked for a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Caller,
    Recovery,
}

/// Forces `Disconnected` when dropped, whichever way `disconnect()` exits.
struct ForceDisconnected<'a>(&'a ConnectionMachine);

impl Drop for ForceDisconnected<'_> {
    fn drop(&mut self) {
        self.0.announce(ConnectionState::Disconnected);
        self.0.disconnecting.store(false, Ordering::SeqCst);
    }
}

fn blocking_reason(state: VendorConnectionState) -> &'static str {
    match state {
        VendorConnectionState::NeedsUpdate => "headband needs a firmware update",
        VendorConnectionState::NeedsLicense => "headband needs a license",
        _ => "headband is blocked",
    }
}
