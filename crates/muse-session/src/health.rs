//! # Link Health Monitor
//!
//! Background task that polls the vendor's raw connection state while the
//! session believes it is connected. Vendor SDKs sometimes drop the radio
//! link without (or long before) delivering a connection callback; this is
//! how the session notices.
//!
//! The monitor reports [`HealthStatus::LinkLost`] once and exits. Recovery
//! is the session's job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::state::ConnectionState;
use crate::vendor::{BciDevice, VendorConnectionState};

/// Signals emitted by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The vendor dropped the link while we still believed it was up.
    LinkLost { vendor_state: VendorConnectionState },
}

/// Periodic direct check of the vendor link.
pub struct HealthMonitor {
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    stop_timeout: Duration,
}

impl HealthMonitor {
    /// Start monitoring `device`.
    ///
    /// `believed` is the session's cached state; a check only counts as a
    /// failure while it says [`ConnectionState::Connected`]. The monitor runs
    /// until it reports a loss, [`stop()`](Self::stop) is called, or it is
    /// dropped.
    pub fn start(
        device: Arc<dyn BciDevice>,
        believed: watch::Receiver<ConnectionState>,
        config: &HealthConfig,
        report: mpsc::UnboundedSender<HealthStatus>,
    ) -> Self {
        let interval = config.interval();
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_checks(device.as_ref(), &believed, interval, &cancel, &report).await;
                tracing::debug!("Health monitor stopped");
            })
        };

        Self {
            handle: Some(handle),
            cancel,
            stop_timeout: config.stop_timeout(),
        }
    }

    /// Stop the monitor and wait up to `health.stop_timeout_ms` for the
    /// task to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.stop_timeout, handle).await.is_err() {
                tracing::debug!("Health monitor slow to stop, aborting");
                abort.abort();
            }
        }
    }

    /// Returns whether the monitor is still running.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

async fn run_checks(
    device: &dyn BciDevice,
    believed: &watch::Receiver<ConnectionState>,
    interval: Duration,
    cancel: &CancellationToken,
    report: &mpsc::UnboundedSender<HealthStatus>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        if cancel.is_cancelled() {
            return;
        }

        let vendor_state = device.connection_state();
        let believed_state = *believed.borrow();

        if believed_state.is_connected() && vendor_state != VendorConnectionState::Connected {
            tracing::warn!(?vendor_state, "Health check found link down");
            let _ = report.send(HealthStatus::LinkLost { vendor_state });
            return;
        }
        tracing::trace!(?vendor_state, %believed_state, "Health check passed");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
