//! Client request head parsing
//!
//! Reads the head of the first request on a client connection and works out where
//! the session should go: a CONNECT tunnel, a plain forwarded request, or the
//! in-band control command.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;
use url::Url;

use crate::error::{Result, RotaError};

const MAX_HEADERS: usize = 96;
const READ_CHUNK: usize = 4096;

/// Headers meant for this proxy, never forwarded upstream
const HOP_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// Where a client connection wants to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// `CONNECT host:port`; `leftover` holds bytes read past the head
    Connect {
        host: String,
        port: u16,
        leftover: Vec<u8>,
    },
    /// Plain HTTP request; `head` is the rewritten head followed by any body bytes read
    Forward {
        host: String,
        port: u16,
        head: Vec<u8>,
    },
    /// In-band rotation command
    Control { version: u8 },
}

impl ClientRequest {
    /// Upstream `host:port`, if the request has one
    pub fn target(&self) -> Option<(&str, u16)> {
        match self {
            ClientRequest::Connect { host, port, .. } | ClientRequest::Forward { host, port, .. } => {
                Some((host.as_str(), *port))
            }
            ClientRequest::Control { .. } => None,
        }
    }
}

/// Reply written for the in-band control command
pub fn control_reply(version: u8) -> Vec<u8> {
    format!("HTTP/1.{} 200 IP Changed\r\n\r\n", version).into_bytes()
}

/// Read the request head from `reader`
///
/// Fails with `MalformedRequest` if the head is unparseable, exceeds `limit` bytes,
/// or the client closes before sending a full head.
pub async fn read_request<R>(reader: &mut R, limit: usize, control_marker: &str) -> Result<ClientRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(RotaError::MalformedRequest(
                "connection closed before request head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(request) = parse_head(&buf, control_marker)? {
            return Ok(request);
        }
        if buf.len() >= limit {
            return Err(RotaError::MalformedRequest(format!(
                "request head exceeds {} bytes",
                limit
            )));
        }
    }
}

/// Parse a buffered head; `Ok(None)` means more bytes are needed
pub fn parse_head(buf: &[u8], control_marker: &str) -> Result<Option<ClientRequest>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RotaError::MalformedRequest(e.to_string())),
    };

    let method = req.method.unwrap_or_default();
    let target = req.path.unwrap_or_default();
    let version = req.version.unwrap_or(1);
    let leftover = &buf[head_len..];

    if !control_marker.is_empty()
        && target
            .to_ascii_lowercase()
            .contains(&control_marker.to_ascii_lowercase())
    {
        debug!(target, "Control command received");
        return Ok(Some(ClientRequest::Control { version }));
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = parse_authority(target, 443)?;
        return Ok(Some(ClientRequest::Connect {
            host,
            port,
            leftover: leftover.to_vec(),
        }));
    }

    let (host, port, origin) = if target.starts_with('/') {
        // Origin-form: the destination comes from the Host header.
        let host_header = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .map(|h| String::from_utf8_lossy(h.value).into_owned())
            .ok_or_else(|| RotaError::MalformedRequest("missing Host header".to_string()))?;
        let (host, port) = parse_authority(host_header.trim(), 80)?;
        (host, port, target.to_string())
    } else {
        parse_absolute(target)?
    };

    let mut head = Vec::with_capacity(buf.len());
    head.extend_from_slice(format!("{} {} HTTP/1.{}\r\n", method, origin, version).as_bytes());
    for header in req.headers.iter() {
        if HOP_HEADERS
            .iter()
            .any(|hop| header.name.eq_ignore_ascii_case(hop))
        {
            continue;
        }
        head.extend_from_slice(header.name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(header.value);
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head.extend_from_slice(leftover);

    Ok(Some(ClientRequest::Forward { host, port, head }))
}

/// Split an absolute-form target into host, port and origin-form path
fn parse_absolute(target: &str) -> Result<(String, u16, String)> {
    let url = Url::parse(target)
        .map_err(|e| RotaError::MalformedRequest(format!("invalid target '{}': {}", target, e)))?;

    if url.scheme() != "http" {
        return Err(RotaError::MalformedRequest(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| RotaError::MalformedRequest(format!("missing host in '{}'", target)))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = url.port_or_known_default().unwrap_or(80);

    let mut origin = url.path().to_string();
    if let Some(query) = url.query() {
        origin.push('?');
        origin.push_str(query);
    }

    Ok((host.to_string(), port, origin))
}

/// Parse `host[:port]`, falling back to `default_port`
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let (host, port) = match authority.rsplit_once(':') {
        // A bare IPv6 literal has colons but no port.
        Some((host, port_str)) if !host.contains(':') || host.ends_with(']') => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| RotaError::MalformedRequest(format!("invalid port in '{}'", authority)))?;
            (host, port)
        }
        _ => (authority, default_port),
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() {
        return Err(RotaError::MalformedRequest(format!(
            "missing host in '{}'",
            authority
        )));
    }

    Ok((host.to_string(), port))
}
