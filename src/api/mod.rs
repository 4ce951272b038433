//! Control-plane HTTP API
//!
//! A small query-string surface used by the device's companion tooling to list
//! proxies, trigger rotations and read subscriber numbers.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
