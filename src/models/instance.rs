use std::net::Ipv4Addr;

use serde::Serialize;

use crate::modem::InterfaceHandle;
use crate::proxy::rotation::RotationPhase;

/// Point-in-time view of one proxy instance, served by `/status`
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: u32,
    pub interface: Option<InterfaceHandle>,
    pub address: Option<Ipv4Addr>,
    pub phase: RotationPhase,
    pub paused: bool,
    pub sessions: usize,
    pub recent_ips: Vec<Ipv4Addr>,
    pub secs_since_rotation: Option<u64>,
}

impl InstanceSnapshot {
    pub fn is_bound(&self) -> bool {
        self.interface.is_some()
    }
}
