//! # muse-session
//!
//! Device-connection core for a BCI headband: bring a flaky, callback-driven
//! vendor link up, keep it up, and turn what it reports into a typed event
//! stream.
//!
//! The vendor SDK is consumed through two narrow traits,
//! [`vendor::DeviceProvider`] and [`vendor::BciDevice`]. Everything above
//! them lives here:
//!
//! - a connection state machine that reconciles pushed callbacks with
//!   direct polls, with bounded waits and a disconnect that always lands in
//!   `Disconnected`;
//! - a channel registry whose desired set survives reconnects and is
//!   replayed on every successful connect;
//! - bounded automatic recovery driven by a link health monitor;
//! - timestamp normalization for vendor clocks of unknown unit.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use muse_session::{ChannelKind, DeviceSession, SessionConfig, SessionEvent};
//! use muse_session::discovery::DeviceScanner;
//!
//! # async fn demo(provider: Arc<dyn muse_session::vendor::DeviceProvider>) -> muse_session::SessionResult<()> {
//! let config = SessionConfig::discover(None)?;
//!
//! let Some(identity) = DeviceScanner::new(Arc::clone(&provider))
//!     .find_by_name("Muse-4A2C", Duration::from_secs(10))
//!     .await?
//! else {
//!     return Ok(());
//! };
//!
//! let session = DeviceSession::new(provider, identity, config);
//! session.register_channels(ChannelKind::Alpha.into());
//!
//! let mut events = session.subscribe();
//! session.connect().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::Telemetry(sample) = event {
//!         println!("{sample:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See [`SessionConfig`]. Defaults match the vendor's behavior (30 s
//! connect timeout, 100 ms state polls, three automatic reconnect
//! attempts); override them in `muse-session.toml`:
//!
//! ```toml
//! preset = "preset_21"
//!
//! [reconnect]
//! max_attempts = 5
//! ```
//!
//! or through `MUSE_SESSION_*` environment variables.

pub mod channels;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod health;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod steps;
pub mod stream;
pub mod timestamp;
pub mod vendor;

mod machine;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use channels::{ChannelKind, ChannelSet};
pub use config::SessionConfig;
pub use error::{ErrorKind, SessionError, SessionResult};
pub use events::{SessionEvent, TelemetryEvent};
pub use session::DeviceSession;
pub use state::ConnectionState;
pub use stream::TelemetryStream;
