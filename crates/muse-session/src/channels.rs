//! # Channels & Channel Registry
//!
//! [`ChannelKind`] names the logical data streams a headband can deliver,
//! [`ChannelSet`] is a compact bitset of them, and [`ChannelRegistry`]
//! remembers which channels the caller *wants*, independent of whatever the
//! vendor is currently subscribed to.
//!
//! The registry's desired set is the source of truth; the vendor
//! subscription is only ever a projection of it, re-applied in full after
//! every successful connect. Callers never have to re-register after a
//! reconnect.
//!
//! ```
//! use muse_session::channels::{ChannelKind, ChannelSet};
//!
//! let set: ChannelSet = [ChannelKind::Alpha, ChannelKind::Beta].into_iter().collect();
//! assert!(set.contains(ChannelKind::Alpha));
//! assert_eq!(set.with(ChannelKind::Artifacts).len(), 3);
//! ```

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A logical data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Alpha,
    Beta,
    Delta,
    Theta,
    Gamma,
    /// Raw EEG samples.
    Raw,
    Accelerometer,
    Battery,
    /// Synthetic blink/jaw-clench/seating stream, always on while connected.
    Artifacts,
}

impl ChannelKind {
    /// Every channel, in declaration order.
    pub const ALL: [ChannelKind; 9] = [
        ChannelKind::Alpha,
        ChannelKind::Beta,
        ChannelKind::Delta,
        ChannelKind::Theta,
        ChannelKind::Gamma,
        ChannelKind::Raw,
        ChannelKind::Accelerometer,
        ChannelKind::Battery,
        ChannelKind::Artifacts,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Frequency-band channels carry relative band power per electrode.
    #[must_use]
    pub fn is_band_power(self) -> bool {
        matches!(
            self,
            ChannelKind::Alpha
                | ChannelKind::Beta
                | ChannelKind::Delta
                | ChannelKind::Theta
                | ChannelKind::Gamma
        )
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A set of [`ChannelKind`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<ChannelKind>", into = "Vec<ChannelKind>")]
pub struct ChannelSet(u16);

impl ChannelSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every channel, including Artifacts.
    #[must_use]
    pub fn all() -> Self {
        ChannelKind::ALL.into_iter().collect()
    }

    #[must_use]
    pub fn contains(self, kind: ChannelKind) -> bool {
        self.0 & kind.bit() != 0
    }

    #[must_use]
    pub fn with(self, kind: ChannelKind) -> Self {
        Self(self.0 | kind.bit())
    }

    #[must_use]
    pub fn without(self, kind: ChannelKind) -> Self {
        Self(self.0 & !kind.bit())
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = ChannelKind> {
        ChannelKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<ChannelKind> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = ChannelKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl From<ChannelKind> for ChannelSet {
    fn from(kind: ChannelKind) -> Self {
        Self::empty().with(kind)
    }
}

impl From<Vec<ChannelKind>> for ChannelSet {
    fn from(kinds: Vec<ChannelKind>) -> Self {
        kinds.into_iter().collect()
    }
}

impl From<ChannelSet> for Vec<ChannelKind> {
    fn from(set: ChannelSet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The caller's desired channel set.
///
/// Only mutated from caller threads (register/unregister), never from
/// vendor callbacks. The mutex only serializes concurrent callers.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    desired: Mutex<ChannelSet>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current desired set.
    pub fn desired(&self) -> ChannelSet {
        *self.lock()
    }

    /// Merge `channels` into the desired set, returning the channels that
    /// were not already desired.
    pub fn merge(&self, channels: ChannelSet) -> ChannelSet {
        let mut desired = self.lock();
        let added = channels.difference(*desired);
        *desired = desired.union(channels);
        added
    }

    /// Remove `channels` from the desired set, returning what is left.
    pub fn remove(&self, channels: ChannelSet) -> ChannelSet {
        let mut desired = self.lock();
        *desired = desired.difference(channels);
        *desired
    }

    /// Forget every desired channel.
    pub fn clear(&self) {
        *self.lock() = ChannelSet::empty();
    }

    /// What to subscribe after a successful connect: the desired set plus
    /// the always-on artifact channel.
    pub fn replay_plan(&self) -> ChannelSet {
        self.desired().with(ChannelKind::Artifacts)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelSet> {
        self.desired
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
