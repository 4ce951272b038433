//! Upstream connections bound to a modem address

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, instrument};

use crate::error::{Result, RotaError};

/// Resolve `host:port` to its first IPv4 address
pub async fn resolve_ipv4(host: &str, port: u16, timeout: Duration) -> Result<SocketAddrV4> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, port));
    }

    let addrs = tokio::time::timeout(timeout, lookup_host((host, port)))
        .await
        .map_err(|_| RotaError::CannotResolveUpstream(format!("{}: lookup timed out", host)))?
        .map_err(|e| RotaError::CannotResolveUpstream(format!("{}: {}", host, e)))?;

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| RotaError::CannotResolveUpstream(format!("{}: no IPv4 address", host)))
}

/// Open a TCP connection to `host:port`, sourced from `local` when given
#[instrument(skip(timeout), level = "debug")]
pub async fn connect_bound(
    host: &str,
    port: u16,
    local: Option<Ipv4Addr>,
    timeout: Duration,
) -> Result<TcpStream> {
    let remote = resolve_ipv4(host, port, timeout).await?;

    let socket = TcpSocket::new_v4()
        .map_err(|e| RotaError::CannotConnect(format!("socket: {}", e)))?;
    if let Some(local) = local {
        socket
            .bind(SocketAddr::V4(SocketAddrV4::new(local, 0)))
            .map_err(|e| RotaError::CannotConnect(format!("bind {}: {}", local, e)))?;
    }

    let stream = tokio::time::timeout(timeout, socket.connect(SocketAddr::V4(remote)))
        .await
        .map_err(|_| RotaError::CannotConnect(format!("{}: connect timed out", remote)))?
        .map_err(|e| RotaError::CannotConnect(format!("{}: {}", remote, e)))?;

    let _ = stream.set_nodelay(true);
    debug!(%remote, "Upstream connected");
    Ok(stream)
}
