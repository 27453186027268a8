#![allow(dead_code)]

pub mod mock_device;

use std::sync::Arc;
use std::time::Duration;

use muse_session::{ConnectionState, DeviceSession, SessionConfig, SessionEvent};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

use mock_device::{MockDevice, MockProvider, STEP_TIMEOUT};

/// Short waits everywhere so failures surface quickly.
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.timeouts.connect_timeout_ms = 500;
    config.timeouts.disconnect_timeout_ms = 200;
    config.timeouts.poll_interval_ms = 10;
    config.timeouts.teardown_settle_ms = 0;
    config.timeouts.transmission_settle_ms = 0;
    config.health.interval_ms = 20;
    config.reconnect.max_attempts = 3;
    config
}

/// Routes session logs to the test harness; `RUST_LOG=muse_session=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn session_with(config: SessionConfig) -> (DeviceSession, Arc<MockDevice>, Arc<MockProvider>) {
    init_tracing();
    let device = MockDevice::new();
    let provider = MockProvider::new(device.clone());
    let session = DeviceSession::new(provider.clone(), mock_device::identity(), config);
    (session, device, provider)
}

/// Next event matching `pred`, skipping everything else.
pub async fn next_matching(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(STEP_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_for_state(session: &DeviceSession, target: ConnectionState) {
    let mut rx = session.state_receiver();
    timeout(STEP_TIMEOUT, async {
        while *rx.borrow_and_update() != target {
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {target}"));
}

pub fn is_error_containing(event: &SessionEvent, needle: &str) -> bool {
    matches!(event, SessionEvent::Error { message, .. } if message.contains(needle))
}

/// Drain whatever is buffered right now.
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return out,
        }
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
