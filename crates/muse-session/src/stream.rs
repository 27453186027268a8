//! # Telemetry Streams
//!
//! [`TelemetryStream`] adapts a session's per-consumer telemetry queue into
//! a [`futures_core::Stream`], optionally narrowed to a [`ChannelSet`].
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use muse_session::channels::ChannelKind;
//! # async fn demo(session: &muse_session::DeviceSession) {
//! let mut alpha = session.telemetry_stream(ChannelKind::Alpha.into());
//! while let Some(event) = alpha.next().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```
//!
//! Streams never end while the session is alive; they end once the session
//! is disposed or dropped.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;

use crate::channels::ChannelSet;
use crate::events::TelemetryEvent;

/// A stream of normalized telemetry for a set of channels.
///
/// Vendor error reports are delivered to every stream regardless of filter.
pub struct TelemetryStream {
    rx: mpsc::Receiver<TelemetryEvent>,
    channels: ChannelSet,
}

impl TelemetryStream {
    pub(crate) fn new(rx: mpsc::Receiver<TelemetryEvent>, channels: ChannelSet) -> Self {
        Self { rx, channels }
    }

    /// The channels this stream was opened for.
    #[must_use]
    pub fn channels(&self) -> ChannelSet {
        self.channels
    }
}

impl Stream for TelemetryStream {
    type Item = TelemetryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
