//! How long a policy's secret stays usable.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// The lifetime rule a policy is configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifetime {
    #[default]
    Always,
    /// Usable for this many successful signatures.
    Counter(u32),
    /// Usable for this many seconds after it was armed.
    Timer(u32),
}

/// A [`Lifetime`] together with its running state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LifetimeState {
    #[default]
    Always,
    Counter { remaining: u32 },
    Timer { started_at: Instant, valid_seconds: u32 },
}

impl LifetimeState {
    /// Arms `lifetime` starting now.
    pub fn arm(lifetime: Lifetime) -> Self {
        Self::arm_at(lifetime, Instant::now())
    }

    pub fn arm_at(lifetime: Lifetime, now: Instant) -> Self {
        match lifetime {
            Lifetime::Always => LifetimeState::Always,
            Lifetime::Counter(n) => LifetimeState::Counter { remaining: n },
            Lifetime::Timer(secs) => LifetimeState::Timer {
                started_at: now,
                valid_seconds: secs,
            },
        }
    }

    pub fn lifetime(&self) -> Lifetime {
        match *self {
            LifetimeState::Always => Lifetime::Always,
            LifetimeState::Counter { remaining } => Lifetime::Counter(remaining),
            LifetimeState::Timer { valid_seconds, .. } => Lifetime::Timer(valid_seconds),
        }
    }

    /// Restarts a timer window. Counters and `Always` are untouched.
    pub fn restart_timer_at(&mut self, now: Instant) {
        if let LifetimeState::Timer { started_at, .. } = self {
            *started_at = now;
        }
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Instant::now())
    }

    pub fn has_expired_at(&self, now: Instant) -> bool {
        match *self {
            LifetimeState::Always => false,
            LifetimeState::Counter { remaining } => remaining == 0,
            LifetimeState::Timer { .. } => self.seconds_remaining_at(now) == Some(0),
        }
    }

    /// Seconds left in a timer window, clamped at zero. `None` for other rules.
    pub fn seconds_remaining_at(&self, now: Instant) -> Option<u32> {
        match *self {
            LifetimeState::Timer {
                started_at,
                valid_seconds,
            } => {
                let elapsed = now.saturating_duration_since(started_at).as_secs();
                let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
                Some(valid_seconds.saturating_sub(elapsed))
            }
            _ => None,
        }
    }

    pub fn seconds_until_expired(&self) -> Result<u32> {
        self.seconds_remaining_at(Instant::now())
            .ok_or_else(|| Error::bad_parameter("policy lifetime is not a timer"))
    }

    pub fn uses_remaining(&self) -> Result<u32> {
        match *self {
            LifetimeState::Counter { remaining } => Ok(remaining),
            _ => Err(Error::bad_parameter("policy lifetime is not a counter")),
        }
    }

    /// Records one successful use. Counters stop at zero.
    pub fn decrement_on_use(&mut self) {
        if let LifetimeState::Counter { remaining } = self {
            *remaining = remaining.saturating_sub(1);
            debug!(remaining = *remaining, "policy use counter decremented");
        }
    }

    /// Undoes one [`decrement_on_use`](Self::decrement_on_use).
    pub fn refund_use(&mut self) {
        if let LifetimeState::Counter { remaining } = self {
            *remaining = remaining.saturating_add(1);
            debug!(remaining = *remaining, "policy use handed back");
        }
    }
}
