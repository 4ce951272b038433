//! In-process modem table
//!
//! Serves interfaces from a fixed table instead of real hardware. A disconnect takes
//! the link down, a connect brings it back and moves to the next scripted address if
//! one is queued.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{InterfaceHandle, ModemProvider, UNKNOWN_NUMBER};
use crate::config::StaticInterfaceSpec;
use crate::error::{Result, RotaError};

#[derive(Debug, Default)]
struct StaticInterface {
    current: Option<Ipv4Addr>,
    scripted: VecDeque<Ipv4Addr>,
    linked: bool,
    number: Option<String>,
}

/// Modem provider backed by an in-memory table
#[derive(Default)]
pub struct StaticModemProvider {
    interfaces: RwLock<BTreeMap<InterfaceHandle, StaticInterface>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    failing: AtomicBool,
}

impl StaticModemProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &[StaticInterfaceSpec]) -> Self {
        let provider = Self::new();
        for spec in specs {
            provider.insert(spec.name.as_str(), spec.address, spec.number.clone());
        }
        provider
    }

    /// Add or replace an interface; it starts with its link up
    pub fn insert(
        &self,
        handle: impl Into<InterfaceHandle>,
        address: Option<Ipv4Addr>,
        number: Option<String>,
    ) {
        self.interfaces.write().insert(
            handle.into(),
            StaticInterface {
                current: address,
                scripted: VecDeque::new(),
                linked: true,
                number,
            },
        );
    }

    /// Remove an interface, as if the modem was unplugged
    pub fn remove(&self, handle: impl Into<InterfaceHandle>) -> bool {
        self.interfaces.write().remove(&handle.into()).is_some()
    }

    /// Queue addresses handed out by successive connects
    pub fn script_addresses(&self, handle: impl Into<InterfaceHandle>, addresses: &[Ipv4Addr]) {
        if let Some(entry) = self.interfaces.write().get_mut(&handle.into()) {
            entry.scripted.extend(addresses.iter().copied());
        }
    }

    /// Overwrite the current address
    pub fn set_address(&self, handle: impl Into<InterfaceHandle>, address: Option<Ipv4Addr>) {
        if let Some(entry) = self.interfaces.write().get_mut(&handle.into()) {
            entry.current = address;
        }
    }

    /// Make connect/disconnect fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::Relaxed)
    }

    fn with_interface<T>(
        &self,
        handle: &InterfaceHandle,
        f: impl FnOnce(&mut StaticInterface) -> T,
    ) -> Result<T> {
        let mut interfaces = self.interfaces.write();
        let entry = interfaces
            .get_mut(handle)
            .ok_or_else(|| RotaError::hardware(handle.as_str(), "interface not present"))?;
        Ok(f(entry))
    }

    fn check_failing(&self, handle: &InterfaceHandle, action: &str) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(RotaError::hardware(
                handle.as_str(),
                format!("{} rejected by modem", action),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ModemProvider for StaticModemProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn list_interfaces(&self) -> Result<BTreeSet<InterfaceHandle>> {
        Ok(self.interfaces.read().keys().cloned().collect())
    }

    async fn connect(&self, handle: &InterfaceHandle) -> Result<()> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.check_failing(handle, "connect")?;
        self.with_interface(handle, |entry| {
            entry.linked = true;
            if let Some(next) = entry.scripted.pop_front() {
                entry.current = Some(next);
            }
        })
    }

    async fn disconnect(&self, handle: &InterfaceHandle) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.check_failing(handle, "disconnect")?;
        self.with_interface(handle, |entry| entry.linked = false)
    }

    async fn subscriber_number(&self, handle: &InterfaceHandle) -> String {
        self.interfaces
            .read()
            .get(handle)
            .and_then(|entry| entry.number.clone())
            .unwrap_or_else(|| UNKNOWN_NUMBER.to_string())
    }

    async fn local_ipv4(&self, handle: &InterfaceHandle) -> Result<Option<Ipv4Addr>> {
        self.with_interface(handle, |entry| if entry.linked { entry.current } else { None })
    }
}
