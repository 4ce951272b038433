//! Address rotation bookkeeping
//!
//! The disconnect/reconnect cycle itself lives on the proxy instance; this module
//! holds the pieces around it: the phase an instance is in, the debounce that
//! filters non-forced requests, and the pool-wide request queue.

mod queue;

pub use queue::{RotationQueue, RotationRequest};

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Where an instance is in its rotation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    /// Not bound to any interface
    #[default]
    Unbound,
    /// Accepting and relaying
    Active,
    /// Disconnect requested, accepts paused
    Rotating,
    /// Connect requested, waiting for an address
    Reconnecting,
    /// Address acquired, resuming
    Verifying,
}

impl RotationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Reconnecting => "reconnecting",
            Self::Verifying => "verifying",
        }
    }
}

impl std::fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drops non-forced requests that arrive too soon after the last accepted one
#[derive(Debug, Clone)]
pub struct Debounce {
    window: Duration,
    last_accepted: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: None,
        }
    }

    /// Whether a request at `now` would be accepted
    pub fn admits(&self, forced: bool, now: Instant) -> bool {
        if forced {
            return true;
        }
        match self.last_accepted {
            Some(last) => now.saturating_duration_since(last) >= self.window,
            None => true,
        }
    }

    /// Record an accepted request
    pub fn record(&mut self, now: Instant) {
        self.last_accepted = Some(now);
    }

    pub fn last_accepted(&self) -> Option<Instant> {
        self.last_accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_always_admitted() {
        let debounce = Debounce::new(Duration::from_secs(30));
        assert!(debounce.admits(false, Instant::now()));
        assert!(debounce.last_accepted().is_none());
    }

    #[test]
    fn test_non_forced_requests_debounced() {
        let mut debounce = Debounce::new(Duration::from_secs(30));
        let start = Instant::now();
        debounce.record(start);

        assert!(!debounce.admits(false, start + Duration::from_secs(10)));
        assert!(!debounce.admits(false, start + Duration::from_secs(29)));
        assert!(debounce.admits(false, start + Duration::from_secs(30)));
    }

    #[test]
    fn test_forced_requests_bypass_debounce() {
        let mut debounce = Debounce::new(Duration::from_secs(30));
        let start = Instant::now();
        debounce.record(start);

        assert!(debounce.admits(true, start));
        assert!(debounce.admits(true, start + Duration::from_secs(1)));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(RotationPhase::default(), RotationPhase::Unbound);
        assert_eq!(RotationPhase::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_string(&RotationPhase::Verifying).unwrap(),
            "\"verifying\""
        );
    }
}
