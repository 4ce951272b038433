//! Relay sessions
//!
//! A session owns one client connection and, once the request head has been
//! handled, one upstream connection. Bytes are pumped in both directions until
//! either side closes or the owning instance force-closes the session.

use std::borrow::Cow;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::config::ProxyConfig;
use crate::error::{Result, RotaError};
use crate::proxy::client_hello::{self, TlsFingerprint};
use crate::proxy::request::{self, ClientRequest};
use crate::proxy::upstream;

/// Per-direction read buffer size
pub const RELAY_BUFFER_SIZE: usize = 128 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

pub type SessionId = u64;

/// Live sessions of one proxy instance
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: DashMap<SessionId, watch::Sender<bool>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session; it is released when the guard drops
    pub fn register(self: &Arc<Self>) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (close_tx, close_rx) = watch::channel(false);
        self.sessions.insert(id, close_tx);
        SessionGuard {
            id,
            registry: Arc::clone(self),
            close_rx,
        }
    }

    /// Signal every live session to close, returning how many were signalled
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.sessions.iter() {
            entry.value().send_replace(true);
            closed += 1;
        }
        closed
    }

    /// Destroy callback; repeated calls for the same session are no-ops
    pub fn release(&self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Registration of one session, released on drop
pub struct SessionGuard {
    id: SessionId,
    registry: Arc<SessionRegistry>,
    close_rx: watch::Receiver<bool>,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Receiver that flips to `true` when the session is force-closed
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// Result of the request phase
pub enum Opened<C> {
    /// Control command answered; nothing left to relay
    Control,
    Relay {
        client: C,
        upstream: TcpStream,
        first_segment: Vec<u8>,
    },
}

/// Read the client's request and connect upstream
///
/// The control command is detected before any upstream resolution; `on_control`
/// fires and no upstream socket is ever opened for it.
pub async fn open<C, F>(
    mut client: C,
    local: Option<Ipv4Addr>,
    config: &ProxyConfig,
    on_control: F,
) -> Result<Opened<C>>
where
    C: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(),
{
    let marker = config.control_marker();
    let request = match request::read_request(&mut client, config.request_head_limit, &marker).await {
        Ok(request) => request,
        Err(e) => {
            if matches!(e, RotaError::MalformedRequest(_)) {
                let _ = client.write_all(BAD_REQUEST).await;
                let _ = client.shutdown().await;
            }
            return Err(e);
        }
    };

    let (host, port, first_segment, tunnel) = match request {
        ClientRequest::Control { version } => {
            on_control();
            client.write_all(&request::control_reply(version)).await?;
            let _ = client.shutdown().await;
            return Ok(Opened::Control);
        }
        ClientRequest::Connect {
            host,
            port,
            leftover,
        } => (host, port, leftover, true),
        ClientRequest::Forward { host, port, head } => (host, port, head, false),
    };

    let upstream = match upstream::connect_bound(&host, port, local, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = client.write_all(BAD_GATEWAY).await;
            let _ = client.shutdown().await;
            return Err(e);
        }
    };

    if tunnel {
        client.write_all(CONNECT_ESTABLISHED).await?;
    }

    Ok(Opened::Relay {
        client,
        upstream,
        first_segment,
    })
}

/// Drive one client connection from request head to teardown
#[instrument(skip_all, fields(session_id = guard.id()))]
pub async fn run<C, F>(
    client: C,
    guard: SessionGuard,
    local: Option<Ipv4Addr>,
    config: &ProxyConfig,
    on_control: F,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    F: FnOnce(),
{
    let mut closed = guard.close_signal();

    let opened = tokio::select! {
        opened = open(client, local, config, on_control) => opened?,
        _ = wait_closed(&mut closed) => {
            debug!("Session closed before upstream was established");
            return Ok(());
        }
    };

    if let Opened::Relay {
        client,
        upstream,
        first_segment,
    } = opened
    {
        let fingerprint = config.tls_rewrite.then_some(&config.fingerprint);
        let (sent, received) = relay(client, upstream, first_segment, fingerprint, closed).await;
        debug!(bytes_sent = sent, bytes_received = received, "Session closed");
    }

    Ok(())
}

/// Pump bytes both ways until either side ends or `closed` fires
///
/// `first_segment` goes upstream before anything read from the client. The
/// fingerprint rewrite, when enabled, applies to the first upstream segment only.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    first_segment: Vec<u8>,
    fingerprint: Option<&TlsFingerprint>,
    mut closed: watch::Receiver<bool>,
) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let client_to_upstream = async {
        let mut codec = fingerprint;
        if !first_segment.is_empty() {
            let n = forward(&first_segment, &mut codec, &mut upstream_write).await?;
            sent.fetch_add(n, Ordering::Relaxed);
        }

        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(());
            }
            let n = forward(&buf[..n], &mut codec, &mut upstream_write).await?;
            sent.fetch_add(n, Ordering::Relaxed);
        }
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(());
            }
            client_write.write_all(&buf[..n]).await?;
            received.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                debug!("Client to upstream ended: {}", e);
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                debug!("Upstream to client ended: {}", e);
            }
        }
        _ = wait_closed(&mut closed) => {
            debug!("Session force-closed");
        }
    }

    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;

    (sent.into_inner(), received.into_inner())
}

/// Write one client segment upstream, rewriting it if the codec is still armed
async fn forward<W>(
    data: &[u8],
    codec: &mut Option<&TlsFingerprint>,
    writer: &mut W,
) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let segment = match codec.take() {
        Some(fingerprint) => client_hello::rewrite(data, fingerprint),
        None => Cow::Borrowed(data),
    };
    writer.write_all(&segment).await?;
    Ok(segment.len() as u64)
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}
