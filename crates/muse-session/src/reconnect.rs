//! # Reconnection Policy
//!
//! Bookkeeping for automatic recovery: a bounded attempt counter, a flag
//! that keeps at most one recovery task alive, and a latch so the terminal
//! "maximum reconnection attempts reached" condition is reported once.
//!
//! The policy never sleeps or connects by itself. The session drives it:
//!
//! 1. Link loss detected (health monitor or vendor callback).
//! 2. [`try_start_recovery`](ReconnectPolicy::try_start_recovery): only one
//!    recovery task runs at a time.
//! 3. Loop on [`begin_attempt`](ReconnectPolicy::begin_attempt), calling the
//!    ordinary `connect()` path each time.
//! 4. A successful connect (manual or automatic) calls
//!    [`reset`](ReconnectPolicy::reset).
//! 5. When attempts run out, [`take_exhausted_report`](ReconnectPolicy::take_exhausted_report)
//!    returns `true` exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::ReconnectConfig;

/// Bounded automatic-recovery bookkeeping.
#[derive(Debug)]
pub struct ReconnectPolicy {
    enabled: bool,
    ceiling: u32,
    attempts: AtomicU32,
    recovering: AtomicBool,
    exhausted_reported: AtomicBool,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            enabled: config.enabled,
            ceiling: config.max_attempts,
            attempts: AtomicU32::new(0),
            recovering: AtomicBool::new(false),
            exhausted_reported: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Automatic attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Claim the next attempt. Returns the 1-based attempt number, or
    /// `None` once the ceiling is reached.
    pub fn begin_attempt(&self) -> Option<u32> {
        self.attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.ceiling).then_some(n + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts() >= self.ceiling
    }

    /// Called on every successful connect, manual or automatic.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.exhausted_reported.store(false, Ordering::SeqCst);
    }

    /// `true` the first time it is called after the ceiling is reached.
    pub fn take_exhausted_report(&self) -> bool {
        self.is_exhausted() && !self.exhausted_reported.swap(true, Ordering::SeqCst)
    }

    /// Claim the single recovery slot. The returned guard releases it.
    pub fn try_start_recovery(&self) -> Option<RecoveryGuard<'_>> {
        self.recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RecoveryGuard(&self.recovering))
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }
}

/// Releases the recovery slot when dropped.
pub struct RecoveryGuard<'a>(&'a AtomicBool);

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(&ReconnectConfig {
            enabled: true,
            max_attempts,
        })
    }

    #[test]
    fn test_attempts_are_bounded() {
        let p = policy(3);
        assert_eq!(p.begin_attempt(), Some(1));
        assert_eq!(p.begin_attempt(), Some(2));
        assert_eq!(p.begin_attempt(), Some(3));
        assert_eq!(p.begin_attempt(), None);
        assert_eq!(p.begin_attempt(), None);
        assert_eq!(p.attempts(), 3);
        assert!(p.is_exhausted());
    }

    #[test]
    fn test_reset_rearms_attempts_and_report() {
        let p = policy(2);
        p.begin_attempt();
        p.begin_attempt();
        assert!(p.take_exhausted_report());
        assert!(!p.take_exhausted_report());

        p.reset();
        assert_eq!(p.attempts(), 0);
        assert!(!p.take_exhausted_report());
        assert_eq!(p.begin_attempt(), Some(1));
    }

    #[test]
    fn test_exhausted_report_requires_exhaustion() {
        let p = policy(3);
        p.begin_attempt();
        assert!(!p.take_exhausted_report());
    }

    #[test]
    fn test_zero_ceiling_never_attempts() {
        let p = policy(0);
        assert_eq!(p.begin_attempt(), None);
        assert!(p.is_exhausted());
    }

    #[test]
    fn test_single_recovery_slot() {
        let p = policy(3);
        let guard = p.try_start_recovery().expect("first claim succeeds");
        assert!(p.is_recovering());
        assert!(p.try_start_recovery().is_none());
        drop(guard);
        assert!(!p.is_recovering());
        assert!(p.try_start_recovery().is_some());
    }
}
