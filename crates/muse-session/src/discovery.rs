//! # Device Discovery
//!
//! [`DeviceScanner`] drives the vendor device manager to find advertising
//! headbands before a [`DeviceSession`](crate::DeviceSession) is created.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use muse_session::discovery::DeviceScanner;
//! # async fn demo(provider: Arc<dyn muse_session::vendor::DeviceProvider>) -> muse_session::SessionResult<()> {
//! let scanner = DeviceScanner::new(provider);
//! for device in scanner.scan(Duration::from_secs(5)).await? {
//!     println!("{device}");
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::config::{TimeoutConfig, deadline_after};
use crate::error::SessionResult;
use crate::vendor::{DeviceIdentity, DeviceProvider, PacketSink, VendorPacket};

/// Finds headbands through the vendor device manager.
pub struct DeviceScanner {
    provider: Arc<dyn DeviceProvider>,
    /// Re-read interval for vendors that send no list-changed notifications.
    poll_interval: Duration,
}

impl DeviceScanner {
    /// Scanner with the default [`TimeoutConfig`].
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self::with_timeouts(provider, &TimeoutConfig::default())
    }

    /// Scanner polling the device list every `timeouts.list_poll_interval_ms`.
    pub fn with_timeouts(provider: Arc<dyn DeviceProvider>, timeouts: &TimeoutConfig) -> Self {
        Self {
            provider,
            poll_interval: timeouts.list_poll_interval(),
        }
    }

    /// Listen until at least one headband is advertised or `timeout` elapses.
    ///
    /// An empty list after the timeout is not an error.
    ///
    /// # Errors
    /// Returns [`SessionError::Vendor`](crate::SessionError::Vendor) if the
    /// vendor refuses to start listening.
    pub async fn scan(&self, timeout: Duration) -> SessionResult<Vec<DeviceIdentity>> {
        let devices = self
            .listen_until(timeout, |devices| !devices.is_empty())
            .await?;
        tracing::info!(count = devices.len(), "Scan finished");
        Ok(devices)
    }

    /// Listen until a headband advertising `name` shows up or `timeout`
    /// elapses.
    ///
    /// # Errors
    /// Returns [`SessionError::Vendor`](crate::SessionError::Vendor) if the
    /// vendor refuses to start listening.
    pub async fn find_by_name(
        &self,
        name: &str,
        timeout: Duration,
    ) -> SessionResult<Option<DeviceIdentity>> {
        let devices = self
            .listen_until(timeout, |devices| devices.iter().any(|d| d.name == name))
            .await?;
        Ok(devices.into_iter().find(|d| d.name == name))
    }

    async fn listen_until(
        &self,
        timeout: Duration,
        done: impl Fn(&[DeviceIdentity]) -> bool,
    ) -> SessionResult<Vec<DeviceIdentity>> {
        let (sink, mut changes) = PacketSink::channel();
        if let Err(e) = self.provider.register_list_listener(sink) {
            tracing::debug!(error = %e, "No list-changed notifications, polling only");
        }

        self.provider.start_listening()?;
        tracing::debug!(?timeout, "Listening for headbands");

        let deadline = deadline_after(timeout);
        let mut devices = self.provider.devices();
        while !done(&devices) {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => break,
                () = tokio::time::sleep(self.poll_interval) => {}
                Some(VendorPacket::DeviceListChanged) = changes.recv() => {
                    tracing::trace!("Device list changed");
                }
            }
            devices = self.provider.devices();
        }

        if let Err(e) = self.provider.stop_listening() {
            tracing::warn!(error = %e, "Failed to stop listening");
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::{BciDevice, VendorError, VendorResult};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct ListProvider {
        devices: Mutex<Vec<DeviceIdentity>>,
        listening: AtomicBool,
        refuse: bool,
    }

    impl DeviceProvider for ListProvider {
        fn open(&self, _: &DeviceIdentity) -> VendorResult<Arc<dyn BciDevice>> {
            Err(VendorError::new(3, "not used"))
        }
        fn start_listening(&self) -> VendorResult<()> {
            if self.refuse {
                return Err(VendorError::new(1, "bluetooth off"));
            }
            self.listening.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop_listening(&self) -> VendorResult<()> {
            self.listening.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn devices(&self) -> Vec<DeviceIdentity> {
            self.devices.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_scan_returns_once_a_device_appears() {
        let provider = Arc::new(ListProvider::default());
        let scanner = DeviceScanner::new(provider.clone());

        let adder = {
            let provider = provider.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                provider
                    .devices
                    .lock()
                    .unwrap()
                    .push(DeviceIdentity::new("Muse-4A2C", "00:55:DA:B0:4A:2C"));
            })
        };

        let started = std::time::Instant::now();
        let found = scanner.scan(Duration::from_secs(5)).await.unwrap();
        adder.await.unwrap();

        assert_eq!(found.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!provider.listening.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_scan_times_out_empty() {
        let provider = Arc::new(ListProvider::default());
        let found = DeviceScanner::new(provider)
            .scan(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_find_by_name_skips_other_devices() {
        let provider = Arc::new(ListProvider::default());
        provider
            .devices
            .lock()
            .unwrap()
            .push(DeviceIdentity::new("Muse-0001", "a"));
        let scanner = DeviceScanner::new(provider);

        assert!(
            scanner
                .find_by_name("Muse-4A2C", Duration::from_millis(50))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            scanner
                .find_by_name("Muse-0001", Duration::from_millis(50))
                .await
                .unwrap()
                .map(|d| d.id),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn test_unbounded_timeout_with_configured_poll_interval() {
        let provider = Arc::new(ListProvider::default());
        let timeouts = TimeoutConfig {
            list_poll_interval_ms: 5,
            ..TimeoutConfig::default()
        };
        let scanner = DeviceScanner::with_timeouts(provider.clone(), &timeouts);
        let adder = {
            let provider = provider.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                provider
                    .devices
                    .lock()
                    .unwrap()
                    .push(DeviceIdentity::new("Muse-4A2C", "00:55:DA:B0:4A:2C"));
            })
        };

        let found = tokio::time::timeout(Duration::from_secs(2), scanner.scan(Duration::MAX))
            .await
            .unwrap()
            .unwrap();
        adder.await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_refused_listening_is_an_error() {
        let provider = Arc::new(ListProvider {
            refuse: true,
            ..ListProvider::default()
        });
        let err = DeviceScanner::new(provider)
            .scan(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::SessionError::Vendor { code: 1, .. }));
    }
}
