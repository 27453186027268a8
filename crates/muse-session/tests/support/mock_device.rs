#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use muse_session::channels::ChannelKind;
use muse_session::vendor::{
    BciDevice, DeviceConfiguration, DeviceIdentity, DeviceProvider, PacketSink, Preset,
    VendorConnectionState, VendorError, VendorPacket, VendorResult,
};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Every vendor call the mock sees, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    RunAsynchronously,
    Disconnect,
    SetPreset(Preset),
    EnableTransmission(bool),
    RegisterConnection,
    RegisterError,
    RegisterData(ChannelKind),
    UnregisterData(ChannelKind),
    UnregisterAll,
}

/// What the next `run_asynchronously()` does.
#[derive(Debug, Clone, Copy)]
pub enum ConnectOutcome {
    /// Link comes up after `delay`, visible to polls and pushed to the listener.
    Connect { delay: Duration },
    /// Only the connection callback reports the link; polls stay CONNECTING.
    ConnectPushOnly { delay: Duration },
    /// No callback is delivered; only polls see the link come up.
    ConnectPollOnly { delay: Duration },
    /// The headband reports NEEDS_UPDATE after `delay`.
    NeedsUpdate { delay: Duration },
    /// Accepted, then nothing happens.
    Hang,
    /// `run_asynchronously()` itself fails.
    Refuse,
}

struct Shared {
    polled: Mutex<VendorConnectionState>,
    epoch: AtomicU64,
    calls: Mutex<Vec<Call>>,
    connection_sink: Mutex<Option<PacketSink>>,
    error_sink: Mutex<Option<PacketSink>>,
    data_sinks: Mutex<HashMap<ChannelKind, PacketSink>>,
}

impl Shared {
    fn transition(&self, current: VendorConnectionState, poll: bool, push: bool) {
        let previous = {
            let mut polled = self.polled.lock().unwrap();
            let previous = *polled;
            if poll {
                *polled = current;
            }
            previous
        };
        if push {
            if let Some(sink) = self.connection_sink.lock().unwrap().as_ref() {
                sink.push(VendorPacket::Connection { previous, current });
            }
        }
    }

    /// Run `f` on a "vendor thread" after `delay`, unless the link epoch moved on.
    fn later(self: &Arc<Self>, delay: Duration, f: impl FnOnce(&Shared) + Send + 'static) {
        let shared = Arc::clone(self);
        let epoch = shared.epoch.load(Ordering::SeqCst);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if shared.epoch.load(Ordering::SeqCst) == epoch {
                f(&shared);
            }
        });
    }
}

/// Scripted in-memory headband.
pub struct MockDevice {
    shared: Arc<Shared>,
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    default_outcome: Mutex<ConnectOutcome>,
    fail_disconnect: AtomicBool,
    ignore_disconnect: AtomicBool,
    fail_core_listeners: AtomicBool,
    configuration: Mutex<Option<DeviceConfiguration>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                polled: Mutex::new(VendorConnectionState::Disconnected),
                epoch: AtomicU64::new(0),
                calls: Mutex::new(Vec::new()),
                connection_sink: Mutex::new(None),
                error_sink: Mutex::new(None),
                data_sinks: Mutex::new(HashMap::new()),
            }),
            outcomes: Mutex::new(VecDeque::new()),
            default_outcome: Mutex::new(ConnectOutcome::Connect {
                delay: Duration::from_millis(20),
            }),
            fail_disconnect: AtomicBool::new(false),
            ignore_disconnect: AtomicBool::new(false),
            fail_core_listeners: AtomicBool::new(false),
            configuration: Mutex::new(None),
        })
    }

    // ─── Scripting ──────────────────────────────────────────────────────

    /// Outcome used once the queued outcomes run out.
    pub fn set_default_outcome(&self, outcome: ConnectOutcome) {
        *self.default_outcome.lock().unwrap() = outcome;
    }

    /// Queue outcomes for the next connect attempts, in order.
    pub fn queue_outcomes(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.outcomes.lock().unwrap().extend(outcomes);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Accept `disconnect()` but never actually drop the link.
    pub fn ignore_disconnect(&self, ignore: bool) {
        self.ignore_disconnect.store(ignore, Ordering::SeqCst);
    }

    pub fn fail_core_listeners(&self, fail: bool) {
        self.fail_core_listeners.store(fail, Ordering::SeqCst);
    }

    pub fn set_configuration(&self, configuration: Option<DeviceConfiguration>) {
        *self.configuration.lock().unwrap() = configuration;
    }

    /// The radio link drops without any callback.
    pub fn drop_link_silently(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared
            .transition(VendorConnectionState::Disconnected, true, false);
    }

    /// The radio link drops and the connection listener hears about it.
    pub fn drop_link_with_callback(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared
            .transition(VendorConnectionState::Disconnected, true, true);
    }

    /// Deliver a data packet to the listener registered for `channel`.
    pub fn emit_data(&self, channel: ChannelKind, values: Vec<f64>, raw_timestamp: i64) -> bool {
        let sinks = self.shared.data_sinks.lock().unwrap();
        sinks.get(&channel).is_some_and(|sink| {
            sink.push(VendorPacket::Data {
                channel,
                values,
                raw_timestamp,
            })
        })
    }

    pub fn emit_artifact(&self, blink: bool, jaw_clench: bool, headband_on: bool) -> bool {
        let sinks = self.shared.data_sinks.lock().unwrap();
        sinks.get(&ChannelKind::Artifacts).is_some_and(|sink| {
            sink.push(VendorPacket::Artifact {
                blink,
                jaw_clench,
                headband_on,
                raw_timestamp: 1_760_000_000_000,
            })
        })
    }

    pub fn emit_error(&self, code: i32, message: &str) -> bool {
        self.shared
            .error_sink
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|sink| {
                sink.push(VendorPacket::Error {
                    message: message.to_string(),
                    code,
                })
            })
    }

    // ─── Inspection ─────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn clear_calls(&self) {
        self.shared.calls.lock().unwrap().clear();
    }

    pub fn subscribed_channels(&self) -> Vec<ChannelKind> {
        let mut channels: Vec<_> = self.shared.data_sinks.lock().unwrap().keys().copied().collect();
        channels.sort_by_key(|c| ChannelKind::ALL.iter().position(|k| k == c));
        channels
    }

    fn record(&self, call: Call) {
        self.shared.calls.lock().unwrap().push(call);
    }

    fn next_outcome(&self) -> ConnectOutcome {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| *self.default_outcome.lock().unwrap())
    }
}

impl BciDevice for MockDevice {
    fn connection_state(&self) -> VendorConnectionState {
        *self.shared.polled.lock().unwrap()
    }

    fn run_asynchronously(&self) -> VendorResult<()> {
        self.record(Call::RunAsynchronously);
        let outcome = self.next_outcome();
        if matches!(outcome, ConnectOutcome::Refuse) {
            return Err(VendorError::new(1, "radio busy"));
        }

        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared
            .transition(VendorConnectionState::Connecting, true, true);

        match outcome {
            ConnectOutcome::Connect { delay } => self.shared.later(delay, |s| {
                s.transition(VendorConnectionState::Connected, true, true);
            }),
            ConnectOutcome::ConnectPushOnly { delay } => self.shared.later(delay, |s| {
                s.transition(VendorConnectionState::Connected, false, true);
            }),
            ConnectOutcome::ConnectPollOnly { delay } => self.shared.later(delay, |s| {
                s.transition(VendorConnectionState::Connected, true, false);
            }),
            ConnectOutcome::NeedsUpdate { delay } => self.shared.later(delay, |s| {
                s.transition(VendorConnectionState::NeedsUpdate, true, true);
            }),
            ConnectOutcome::Hang | ConnectOutcome::Refuse => {}
        }
        Ok(())
    }

    fn disconnect(&self) -> VendorResult<()> {
        self.record(Call::Disconnect);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(VendorError::new(2, "native disconnect threw"));
        }
        if self.ignore_disconnect.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared
            .transition(VendorConnectionState::Disconnected, true, true);
        Ok(())
    }

    fn set_preset(&self, preset: Preset) -> VendorResult<()> {
        self.record(Call::SetPreset(preset));
        Ok(())
    }

    fn enable_data_transmission(&self, enabled: bool) -> VendorResult<()> {
        self.record(Call::EnableTransmission(enabled));
        Ok(())
    }

    fn register_connection_listener(&self, sink: PacketSink) -> VendorResult<()> {
        self.record(Call::RegisterConnection);
        if self.fail_core_listeners.load(Ordering::SeqCst) {
            return Err(VendorError::new(0, "listener registration failed"));
        }
        *self.shared.connection_sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn register_error_listener(&self, sink: PacketSink) -> VendorResult<()> {
        self.record(Call::RegisterError);
        *self.shared.error_sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn register_data_listener(&self, sink: PacketSink, channel: ChannelKind) -> VendorResult<()> {
        self.record(Call::RegisterData(channel));
        self.shared.data_sinks.lock().unwrap().insert(channel, sink);
        Ok(())
    }

    fn unregister_data_listener(&self, channel: ChannelKind) -> VendorResult<()> {
        self.record(Call::UnregisterData(channel));
        self.shared.data_sinks.lock().unwrap().remove(&channel);
        Ok(())
    }

    fn unregister_all_listeners(&self) -> VendorResult<()> {
        self.record(Call::UnregisterAll);
        *self.shared.connection_sink.lock().unwrap() = None;
        *self.shared.error_sink.lock().unwrap() = None;
        self.shared.data_sinks.lock().unwrap().clear();
        Ok(())
    }

    fn configuration(&self) -> Option<DeviceConfiguration> {
        *self.configuration.lock().unwrap()
    }
}

/// Device manager that always hands out the same [`MockDevice`].
pub struct MockProvider {
    pub device: Arc<MockDevice>,
    opens: AtomicUsize,
}

impl MockProvider {
    pub fn new(device: Arc<MockDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            opens: AtomicUsize::new(0),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceProvider for MockProvider {
    fn open(&self, _identity: &DeviceIdentity) -> VendorResult<Arc<dyn BciDevice>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let device: Arc<dyn BciDevice> = self.device.clone();
        Ok(device)
    }

    fn start_listening(&self) -> VendorResult<()> {
        Ok(())
    }

    fn stop_listening(&self) -> VendorResult<()> {
        Ok(())
    }

    fn devices(&self) -> Vec<DeviceIdentity> {
        vec![identity()]
    }
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity::new("Muse-4A2C", "00:55:DA:B0:4A:2C").with_rssi(-58.0)
}
