//! Proxy data path
//!
//! This module provides:
//! - The per-interface proxy instances and their rotation state machine
//! - The pool that binds instances to modem interfaces
//! - Relay sessions with forward-proxy request handling
//! - The ClientHello fingerprint rewrite
//! - External address probes for health checks

pub mod client_hello;
pub mod instance;
pub mod pool;
pub mod probe;
pub mod request;
pub mod rotation;
pub mod session;
pub mod upstream;

pub use client_hello::TlsFingerprint;
pub use instance::{InstanceContext, ProxyInstance};
pub use pool::{ProxyPool, RefreshSummary};
pub use probe::{ExternalIpProbe, HttpProbe};
pub use rotation::{RotationPhase, RotationQueue, RotationRequest};
