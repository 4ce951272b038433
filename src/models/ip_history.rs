use std::collections::VecDeque;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Result of one health probe, as recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    /// Address not among the recent ones
    New,
    /// Address seen within the recent window
    Duplicate,
    /// Probe did not produce an address
    Failed,
}

impl ProbeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeOutcome::New => "new",
            ProbeOutcome::Duplicate => "duplicate",
            ProbeOutcome::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bounded window of the most recent distinct external addresses
#[derive(Debug, Clone)]
pub struct IpHistory {
    capacity: usize,
    recent: VecDeque<Ipv4Addr>,
}

impl IpHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity),
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.recent.contains(&ip)
    }

    /// Classify a successful probe and remember new addresses
    ///
    /// The oldest address falls out once the window is full.
    pub fn observe(&mut self, ip: Ipv4Addr) -> ProbeOutcome {
        if self.contains(ip) {
            return ProbeOutcome::Duplicate;
        }
        if self.capacity == 0 {
            return ProbeOutcome::New;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(ip);
        ProbeOutcome::New
    }

    /// Most recent first
    pub fn recent(&self) -> Vec<Ipv4Addr> {
        self.recent.iter().rev().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}
