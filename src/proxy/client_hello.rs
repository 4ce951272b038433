//! TLS ClientHello fingerprint rewriting
//!
//! Inspects the first client-to-upstream segment of a session and, when it holds a
//! complete TLS handshake record carrying a ClientHello, replaces the cipher-suite,
//! compression-method and extension sections with a canonical set. Everything up to
//! and including the session ID is copied through, length fields are recomputed.
//!
//! Input that is not a ClientHello, or that cannot be parsed completely, is returned
//! untouched. Parse failures never leave this module.

use std::borrow::Cow;

use bytes::BufMut;
use tracing::trace;

/// Record content type for handshake messages
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ClientHello
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
/// Offset of the client version, first byte counted by the handshake length
const BODY_OFFSET: usize = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN;
const RANDOM_LEN: usize = 32;
const MAX_U24: usize = 0x00FF_FFFF;

const CANONICAL_CIPHER_SUITES: &[u8] = &[
    0x00, 0x04, 0x00, 0x05, 0x00, 0x2f, 0x00, 0x35, 0xc0, 0x02, 0xc0, 0x04, 0xc0, 0x05, 0xc0,
    0x0c, 0xc0, 0x0e, 0xc0, 0x0f, 0xc0, 0x07, 0xc0, 0x09, 0xc0, 0x0a, 0xc0, 0x11, 0xc0, 0x13,
    0xc0, 0x14, 0x00, 0x33, 0x00, 0x39, 0x00, 0x32, 0x00, 0x38, 0x00, 0x0a, 0xc0, 0x03, 0xc0,
    0x0d, 0xc0, 0x08, 0xc0, 0x12, 0x00, 0x16, 0x00, 0x13, 0x00, 0x09, 0x00, 0x15, 0x00, 0x12,
    0x00, 0x03, 0x00, 0x08, 0x00, 0x14, 0x00, 0x11, 0x00, 0xff,
];

const CANONICAL_COMPRESSION_METHODS: &[u8] = &[0x00];

const CANONICAL_EXTENSIONS: &[u8] = &[
    0x00, 0x0b, 0x00, 0x04, 0x03, 0x00, 0x01, 0x02, 0x00, 0x0a, 0x00, 0x34, 0x00, 0x32, 0x00,
    0x0e, 0x00, 0x0d, 0x00, 0x19, 0x00, 0x0b, 0x00, 0x0c, 0x00, 0x18, 0x00, 0x09, 0x00, 0x0a,
    0x00, 0x16, 0x00, 0x17, 0x00, 0x08, 0x00, 0x06, 0x00, 0x07, 0x00, 0x14, 0x00, 0x15, 0x00,
    0x04, 0x00, 0x05, 0x00, 0x12, 0x00, 0x13, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x0f,
    0x00, 0x10, 0x00, 0x11,
];

/// The three ClientHello sections substituted by [`rewrite`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFingerprint {
    pub cipher_suites: Vec<u8>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<u8>,
}

impl Default for TlsFingerprint {
    fn default() -> Self {
        Self {
            cipher_suites: CANONICAL_CIPHER_SUITES.to_vec(),
            compression_methods: CANONICAL_COMPRESSION_METHODS.to_vec(),
            extensions: CANONICAL_EXTENSIONS.to_vec(),
        }
    }
}

impl TlsFingerprint {
    /// Whether every section fits its length prefix
    pub fn is_encodable(&self) -> bool {
        self.cipher_suites.len() <= u16::MAX as usize
            && self.compression_methods.len() <= u8::MAX as usize
            && self.extensions.len() <= u16::MAX as usize
    }

    fn encoded_len(&self) -> usize {
        2 + self.cipher_suites.len() + 1 + self.compression_methods.len() + 2 + self.extensions.len()
    }
}

/// Why a buffer was passed through unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Passthrough {
    NotClientHello,
    Truncated(&'static str),
    Fragmented,
    Oversized,
}

/// Borrowed view over the parts of a ClientHello record that survive the rewrite
#[derive(Debug)]
struct ClientHello<'a> {
    /// Record header plus handshake header, lengths rewritten later
    header: &'a [u8],
    /// Client version, random, session ID length and session ID
    preserved: &'a [u8],
    /// Bytes following the record in the same segment
    trailing: &'a [u8],
}

/// Checked big-endian reader over a byte slice
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], Passthrough> {
        let end = self.pos.checked_add(n).ok_or(Passthrough::Truncated(field))?;
        let slice = self.buf.get(self.pos..end).ok_or(Passthrough::Truncated(field))?;
        self.pos = end;
        Ok(slice)
    }

    fn read_len(&mut self, width: usize, field: &'static str) -> Result<usize, Passthrough> {
        Ok(self
            .take(width, field)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Whether the buffer starts like a handshake record carrying a ClientHello
pub fn is_client_hello(buf: &[u8]) -> bool {
    buf.len() > RECORD_HEADER_LEN
        && buf[0] == CONTENT_TYPE_HANDSHAKE
        && buf[RECORD_HEADER_LEN] == HANDSHAKE_CLIENT_HELLO
}

/// Rewrite a ClientHello record to the canonical fingerprint
///
/// Returns the input borrowed and byte-identical unless it is a complete, well-formed
/// ClientHello record.
pub fn rewrite<'a>(buf: &'a [u8], fingerprint: &TlsFingerprint) -> Cow<'a, [u8]> {
    match parse(buf).and_then(|hello| encode(&hello, fingerprint)) {
        Ok(rewritten) => Cow::Owned(rewritten),
        Err(reason) => {
            if reason != Passthrough::NotClientHello {
                trace!(?reason, len = buf.len(), "ClientHello left unchanged");
            }
            Cow::Borrowed(buf)
        }
    }
}

fn parse(buf: &[u8]) -> Result<ClientHello<'_>, Passthrough> {
    if !is_client_hello(buf) {
        return Err(Passthrough::NotClientHello);
    }

    let mut header = Reader::new(buf, 3);
    let record_len = header.read_len(2, "record length")?;
    header.take(1, "handshake type")?;
    let message_len = header.read_len(3, "handshake length")?;

    let record_end = RECORD_HEADER_LEN + record_len;
    let message_end = BODY_OFFSET + message_len;
    if record_end > buf.len() {
        return Err(Passthrough::Truncated("record"));
    }
    if message_end != record_end {
        // Message split across records, or several messages sharing one record.
        return Err(Passthrough::Fragmented);
    }

    let body = &buf[..message_end];
    let mut reader = Reader::new(body, BODY_OFFSET);
    reader.take(2, "client version")?;
    reader.take(RANDOM_LEN, "random")?;
    let session_id_len = reader.read_len(1, "session id length")?;
    reader.take(session_id_len, "session id")?;
    let preserved_end = reader.pos;

    // The replaced sections must still be well-formed before they are dropped.
    let cipher_len = reader.read_len(2, "cipher suites length")?;
    reader.take(cipher_len, "cipher suites")?;
    let compression_len = reader.read_len(1, "compression methods length")?;
    reader.take(compression_len, "compression methods")?;
    if !reader.is_empty() {
        let extensions_len = reader.read_len(2, "extensions length")?;
        reader.take(extensions_len, "extensions")?;
    }

    Ok(ClientHello {
        header: &buf[..BODY_OFFSET],
        preserved: &buf[BODY_OFFSET..preserved_end],
        trailing: &buf[record_end..],
    })
}

fn encode(hello: &ClientHello<'_>, fingerprint: &TlsFingerprint) -> Result<Vec<u8>, Passthrough> {
    if !fingerprint.is_encodable() {
        return Err(Passthrough::Oversized);
    }

    let message_len = hello.preserved.len() + fingerprint.encoded_len();
    let record_len = message_len + HANDSHAKE_HEADER_LEN;
    if message_len > MAX_U24 || record_len > u16::MAX as usize {
        return Err(Passthrough::Oversized);
    }

    let mut out = Vec::with_capacity(BODY_OFFSET + message_len + hello.trailing.len());
    out.put_slice(&hello.header[..3]);
    out.put_u16(record_len as u16);
    out.put_u8(hello.header[RECORD_HEADER_LEN]);
    out.put_slice(&(message_len as u32).to_be_bytes()[1..]);
    out.put_slice(hello.preserved);

    out.put_u16(fingerprint.cipher_suites.len() as u16);
    out.put_slice(&fingerprint.cipher_suites);
    out.put_u8(fingerprint.compression_methods.len() as u8);
    out.put_slice(&fingerprint.compression_methods);
    out.put_u16(fingerprint.extensions.len() as u16);
    out.put_slice(&fingerprint.extensions);

    out.put_slice(hello.trailing);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANDOM: [u8; 32] = [0xAB; 32];

    /// Build a ClientHello record with the given session ID and sections
    fn client_hello(
        session_id: &[u8],
        ciphers: &[u8],
        compression: &[u8],
        extensions: Option<&[u8]>,
    ) -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&RANDOM);
        body.push(session_id.len() as u8);
        body.extend_from_slice(session_id);
        body.extend_from_slice(&(ciphers.len() as u16).to_be_bytes());
        body.extend_from_slice(ciphers);
        body.push(compression.len() as u8);
        body.extend_from_slice(compression);
        if let Some(ext) = extensions {
            body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            body.extend_from_slice(ext);
        }

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        record.push(HANDSHAKE_CLIENT_HELLO);
        record.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        record.extend_from_slice(&body);
        record
    }

    fn sample() -> Vec<u8> {
        client_hello(
            &[1, 2, 3, 4, 5, 6, 7, 8],
            &[0x13, 0x01, 0x13, 0x02],
            &[0x00],
            Some(&[0x00, 0x00, 0x00, 0x05, 0x00, 0x03, 0x01, 0x02, 0x03]),
        )
    }

    fn record_len(buf: &[u8]) -> usize {
        u16::from_be_bytes([buf[3], buf[4]]) as usize
    }

    fn message_len(buf: &[u8]) -> usize {
        ((buf[6] as usize) << 16) | ((buf[7] as usize) << 8) | buf[8] as usize
    }

    #[test]
    fn test_rewrite_recomputes_lengths() {
        let input = sample();
        let fingerprint = TlsFingerprint::default();
        let out = rewrite(&input, &fingerprint);

        assert!(matches!(out, Cow::Owned(_)));
        assert_eq!(record_len(&out), message_len(&out) + 4);
        assert_eq!(message_len(&out), out.len() - BODY_OFFSET);
        assert_eq!(record_len(&out), out.len() - RECORD_HEADER_LEN);
    }

    #[test]
    fn test_rewrite_preserves_random_and_session_id() {
        let session_id = [9u8; 32];
        let input = client_hello(&session_id, &[0x00, 0x2f], &[0x00], Some(&[]));
        let out = rewrite(&input, &TlsFingerprint::default());

        let preserved_end = BODY_OFFSET + 2 + RANDOM_LEN + 1 + session_id.len();
        assert_eq!(&out[..3], &input[..3]);
        assert_eq!(out[5], HANDSHAKE_CLIENT_HELLO);
        assert_eq!(&out[BODY_OFFSET..preserved_end], &input[BODY_OFFSET..preserved_end]);
        assert_eq!(&out[BODY_OFFSET + 2..BODY_OFFSET + 2 + RANDOM_LEN], &RANDOM);
    }

    #[test]
    fn test_rewrite_substitutes_canonical_sections() {
        let input = sample();
        let out = rewrite(&input, &TlsFingerprint::default());

        let expected = client_hello(
            &[1, 2, 3, 4, 5, 6, 7, 8],
            CANONICAL_CIPHER_SUITES,
            CANONICAL_COMPRESSION_METHODS,
            Some(CANONICAL_EXTENSIONS),
        );
        assert_eq!(out.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_rewrite_is_stable_on_canonical_input() {
        let fingerprint = TlsFingerprint::default();
        let once = rewrite(&sample(), &fingerprint).into_owned();
        let twice = rewrite(&once, &fingerprint).into_owned();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_non_client_hello_is_untouched() {
        let fingerprint = TlsFingerprint::default();

        let http = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(matches!(rewrite(http, &fingerprint), Cow::Borrowed(b) if b == http));

        let mut server_hello = sample();
        server_hello[5] = 0x02;
        assert_eq!(rewrite(&server_hello, &fingerprint).as_ref(), server_hello.as_slice());

        let mut app_data = sample();
        app_data[0] = 0x17;
        assert_eq!(rewrite(&app_data, &fingerprint).as_ref(), app_data.as_slice());
    }

    #[test]
    fn test_short_buffers_are_untouched() {
        let fingerprint = TlsFingerprint::default();
        let full = sample();
        for len in 0..=5 {
            let input = &full[..len];
            assert_eq!(rewrite(input, &fingerprint).as_ref(), input);
        }
    }

    #[test]
    fn test_truncated_records_are_untouched() {
        let fingerprint = TlsFingerprint::default();
        let full = sample();
        for len in 6..full.len() {
            let input = &full[..len];
            assert!(
                matches!(rewrite(input, &fingerprint), Cow::Borrowed(_)),
                "prefix of length {} was rewritten",
                len
            );
        }
    }

    #[test]
    fn test_inconsistent_inner_lengths_are_untouched() {
        let mut input = sample();
        // Claim a session ID longer than the message.
        input[BODY_OFFSET + 2 + RANDOM_LEN] = 0xFF;
        let out = rewrite(&input, &TlsFingerprint::default());
        assert_eq!(out.as_ref(), input.as_slice());
    }

    #[test]
    fn test_fragmented_handshake_is_untouched() {
        let mut input = sample();
        let claimed = message_len(&input) + 100;
        input[6..9].copy_from_slice(&(claimed as u32).to_be_bytes()[1..]);
        assert_eq!(
            rewrite(&input, &TlsFingerprint::default()).as_ref(),
            input.as_slice()
        );
    }

    #[test]
    fn test_missing_extensions_still_rewritten() {
        let input = client_hello(&[], &[0x00, 0x2f], &[0x00], None);
        let out = rewrite(&input, &TlsFingerprint::default());
        assert!(matches!(out, Cow::Owned(_)));
        assert_eq!(message_len(&out), out.len() - BODY_OFFSET);
    }

    #[test]
    fn test_trailing_bytes_are_preserved() {
        let mut input = sample();
        let trailer = [0x17, 0x03, 0x03, 0x00, 0x01, 0xEE];
        input.extend_from_slice(&trailer);

        let out = rewrite(&input, &TlsFingerprint::default());
        assert!(out.ends_with(&trailer));
        assert_eq!(record_len(&out), out.len() - RECORD_HEADER_LEN - trailer.len());
    }

    #[test]
    fn test_oversized_fingerprint_is_passthrough() {
        let fingerprint = TlsFingerprint {
            compression_methods: vec![0; 300],
            ..TlsFingerprint::default()
        };
        assert!(!fingerprint.is_encodable());

        let input = sample();
        assert_eq!(rewrite(&input, &fingerprint).as_ref(), input.as_slice());
    }
}
