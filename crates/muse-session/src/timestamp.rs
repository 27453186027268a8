//! # Timestamp Normalizer
//!
//! Vendor packets carry an `i64` timestamp whose unit is not trustworthy:
//! milliseconds, microseconds and nanoseconds since the epoch all show up,
//! as do values that fit none of them. [`TimestampNormalizer::normalize`]
//! always produces a usable `DateTime<Utc>`, degrading to "now" when no
//! interpretation is plausible.
//!
//! Diagnostics for bad values go through an instance-owned
//! [`DiagnosticLimiter`], so a misbehaving headband logs a handful of lines
//! per session instead of one per packet.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};

/// Smallest 13-digit millisecond timestamp (2001-09-09).
const MIN_PLAUSIBLE_MILLIS: i64 = 1_000_000_000_000;

/// One past the largest 13-digit millisecond timestamp (2286-11-20).
const MAX_PLAUSIBLE_MILLIS: i64 = 10_000_000_000_000;

/// Divisors tried, in order, to bring a raw value down to milliseconds.
const UNIT_DIVISORS: [(i64, &str); 2] = [(1_000, "microseconds"), (1_000_000, "nanoseconds")];

/// Lets the first `limit` diagnostics through and counts the rest.
#[derive(Debug)]
pub struct DiagnosticLimiter {
    limit: u64,
    seen: AtomicU64,
}

impl DiagnosticLimiter {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            limit: u64::from(limit),
            seen: AtomicU64::new(0),
        }
    }

    /// Record one occurrence. Returns the 1-based occurrence number if it
    /// should be logged.
    pub fn admit(&self) -> Option<u64> {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        (n <= self.limit).then_some(n)
    }

    /// Total occurrences recorded, logged or not.
    pub fn occurrences(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    /// Occurrences that were not logged.
    pub fn suppressed(&self) -> u64 {
        self.occurrences().saturating_sub(self.limit)
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// How a raw vendor timestamp was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpretation {
    Milliseconds,
    Microseconds,
    Nanoseconds,
    /// Nothing was plausible; the wall clock was used instead.
    WallClock,
}

/// Converts raw vendor timestamps into validated points in time.
#[derive(Debug)]
pub struct TimestampNormalizer {
    window: Duration,
    diagnostics: DiagnosticLimiter,
}

impl TimestampNormalizer {
    /// `window` bounds how far from "now" an inferred µs/ns value may land.
    #[must_use]
    pub fn new(window: Duration, log_limit: u32) -> Self {
        Self {
            window,
            diagnostics: DiagnosticLimiter::new(log_limit),
        }
    }

    /// Normalize against the current wall clock. Never fails.
    pub fn normalize(&self, raw: i64) -> DateTime<Utc> {
        self.normalize_at(raw, Utc::now()).0
    }

    /// Normalize against an explicit "now".
    pub fn normalize_at(&self, raw: i64, now: DateTime<Utc>) -> (DateTime<Utc>, Interpretation) {
        if (MIN_PLAUSIBLE_MILLIS..MAX_PLAUSIBLE_MILLIS).contains(&raw) {
            if let Some(ts) = DateTime::from_timestamp_millis(raw) {
                return (ts, Interpretation::Milliseconds);
            }
        }

        for (divisor, unit) in UNIT_DIVISORS {
            let Some(ts) = DateTime::from_timestamp_millis(raw / divisor) else {
                continue;
            };
            if (ts - now).abs() <= self.window {
                tracing::trace!(raw, unit, "Rescaled vendor timestamp");
                let interpretation = if divisor == 1_000 {
                    Interpretation::Microseconds
                } else {
                    Interpretation::Nanoseconds
                };
                return (ts, interpretation);
            }
        }

        self.report_fallback(raw);
        (now, Interpretation::WallClock)
    }

    /// Diagnostics recorded so far (logged plus suppressed).
    pub fn fallback_count(&self) -> u64 {
        self.diagnostics.occurrences()
    }

    fn report_fallback(&self, raw: i64) {
        if let Some(n) = self.diagnostics.admit() {
            tracing::warn!(raw, occurrence = n, "Implausible vendor timestamp, using wall clock");
            if n == self.diagnostics.limit() {
                tracing::warn!("Further timestamp diagnostics suppressed for this session");
            }
        }
    }
}
