//! Modem interface providers
//!
//! The pool never talks to modem hardware directly. Everything it needs, from
//! enumerating interfaces to forcing a reconnect, goes through [`ModemProvider`].

mod nmcli;
mod static_table;

pub use nmcli::NmcliModemProvider;
pub use static_table::StaticModemProvider;

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{ModemBackend, ModemConfig};
use crate::error::Result;

/// Reported when a subscriber number cannot be read
pub const UNKNOWN_NUMBER: &str = "Unknown";

/// Opaque identifier of one physical modem interface
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct InterfaceHandle(String);

impl InterfaceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InterfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InterfaceHandle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Access to the OS-level modem interfaces
///
/// Every call may block for seconds or fail; callers treat failures as transient.
#[async_trait]
pub trait ModemProvider: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &'static str;

    /// Interfaces currently present
    async fn list_interfaces(&self) -> Result<BTreeSet<InterfaceHandle>>;

    /// Ask the modem to bring its data connection up
    async fn connect(&self, handle: &InterfaceHandle) -> Result<()>;

    /// Ask the modem to drop its data connection
    async fn disconnect(&self, handle: &InterfaceHandle) -> Result<()>;

    /// Subscriber phone number, or [`UNKNOWN_NUMBER`]
    async fn subscriber_number(&self, handle: &InterfaceHandle) -> String;

    /// First local IPv4 address of the interface, if it has one
    async fn local_ipv4(&self, handle: &InterfaceHandle) -> Result<Option<Ipv4Addr>>;
}

/// Create a modem provider for the configured backend
pub fn create_provider(config: &ModemConfig) -> Arc<dyn ModemProvider> {
    match config.backend {
        ModemBackend::Nmcli => Arc::new(NmcliModemProvider::new()),
        ModemBackend::Static => Arc::new(StaticModemProvider::from_specs(&config.static_interfaces)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticInterfaceSpec;

    #[test]
    fn test_create_provider_backend_name() {
        let config = ModemConfig {
            backend: ModemBackend::Nmcli,
            static_interfaces: vec![],
        };
        assert_eq!(create_provider(&config).name(), "nmcli");

        let config = ModemConfig {
            backend: ModemBackend::Static,
            static_interfaces: vec![StaticInterfaceSpec {
                name: "wwan0".to_string(),
                address: None,
                number: None,
            }],
        };
        assert_eq!(create_provider(&config).name(), "static");
    }

    #[test]
    fn test_interface_handle_ordering_and_display() {
        let a = InterfaceHandle::from("cdc-wdm0");
        let b = InterfaceHandle::from("cdc-wdm1");
        assert!(a < b);
        assert_eq!(a.to_string(), "cdc-wdm0");
        assert_eq!(serde_json::to_string(&b).unwrap(), "\"cdc-wdm1\"");
    }
}
