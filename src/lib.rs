//! Rota Modem - mobile proxy farm
//!
//! Turns every cellular modem on a host into its own HTTP proxy and rotates the
//! modem's public address on demand.
//!
//! ## Features
//!
//! - One proxy listener per modem interface, with upstream sockets bound to the
//!   modem's address
//! - CONNECT tunnels and plain HTTP forwarding with optional ClientHello rewriting
//! - Debounced address rotation driven by a pool-wide queue
//! - External address probing with duplicate detection and an audit log
//! - Legacy query-string control API

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod modem;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use error::{Result, RotaError};
