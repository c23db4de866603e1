//! Opportunistic TLS detection on new flows.
//!
//! The first bytes of a flow's client-to-server half-stream are inspected:
//! a TLS record header marks the flow as TLS, a plausible HTTP request-line
//! start marks it as plaintext, and anything else leaves it pending until
//! enough bytes arrive or the classification idle threshold elapses.
//! TLS payloads are never decrypted; only the handshake metadata (SNI) is
//! extracted for the connection log.

use crate::sniff::config::TLS_PEEK_BYTES;

/// Classification of a flow's early client bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsClass {
    /// Not enough bytes yet to decide.
    Pending,
    /// TLS record stream; payload is opaque.
    Tls,
    /// Plaintext; feed to the HTTP parser.
    Plain,
}

/// HTTP methods whose presence at the start of a stream marks it plaintext.
const HTTP_METHODS: [&str; 9] = [
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE ",
];

/// Classifies the accumulated first bytes of a client half-stream.
///
/// Returns [`TlsClass::Pending`] while the prefix is still compatible with
/// both answers; the caller keeps accumulating or applies the idle fallback.
pub fn classify(peek: &[u8]) -> TlsClass {
    // TLS record header: content type 0x16 (handshake), version major 0x03.
    // The handshake type byte (offset 5) of a client-initiated flow is a
    // ClientHello.
    if peek.len() >= 2 && peek[0] == 0x16 && peek[1] == 0x03 {
        if peek.len() < 6 {
            return TlsClass::Pending;
        }
        if peek[5] == 0x01 {
            return TlsClass::Tls;
        }
        // A handshake record that does not open with a ClientHello is not a
        // client-initiated TLS flow.
        return TlsClass::Plain;
    }

    for method in HTTP_METHODS {
        let m = method.as_bytes();
        if peek.len() >= m.len() {
            if peek.starts_with(m) {
                return TlsClass::Plain;
            }
        } else if m.starts_with(peek) {
            // Still a prefix of a method token.
            return TlsClass::Pending;
        }
    }

    if peek.len() >= TLS_PEEK_BYTES {
        // Neither a TLS record nor a known request line. Treat it as
        // plaintext and let the HTTP parser resynchronize or fail counted.
        return TlsClass::Plain;
    }

    TlsClass::Pending
}

// ── SNI extraction ───────────────────────────────────────────────────────────

fn read_u16(buf: &[u8], at: usize) -> Option<usize> {
    Some(((*buf.get(at)? as usize) << 8) | *buf.get(at + 1)? as usize)
}

/// Extracts the Server Name Indication hostname from a TLS ClientHello.
///
/// Walks the record, handshake, and ClientHello length fields to the
/// extensions block and returns the first `host_name` entry of the SNI
/// extension (type 0x0000). Returns `None` for anything that is not a
/// well-formed ClientHello carrying an SNI.
pub fn parse_sni(payload: &[u8]) -> Option<String> {
    // Record header: type, version (2), length (2).
    if payload.len() < 5 || payload[0] != 0x16 {
        return None;
    }
    // Handshake header: type (1 = ClientHello), length (3).
    if *payload.get(5)? != 0x01 {
        return None;
    }
    // client_version (2) + random (32).
    let mut i = 9 + 34;

    // session_id
    let session_len = *payload.get(i)? as usize;
    i += 1 + session_len;

    // cipher_suites
    let ciphers_len = read_u16(payload, i)?;
    i += 2 + ciphers_len;

    // compression_methods
    let compression_len = *payload.get(i)? as usize;
    i += 1 + compression_len;

    // extensions
    let extensions_len = read_u16(payload, i)?;
    i += 2;
    let extensions_end = i.checked_add(extensions_len)?;

    while i + 4 <= extensions_end {
        let ext_type = read_u16(payload, i)?;
        let ext_len = read_u16(payload, i + 2)?;
        i += 4;

        if ext_type == 0x0000 {
            // server_name list: list length (2), then entries of
            // name type (1) + name length (2) + name.
            let name_type = *payload.get(i + 2)?;
            if name_type != 0x00 {
                return None;
            }
            let name_len = read_u16(payload, i + 3)?;
            let start = i + 5;
            let name = payload.get(start..start + name_len)?;
            return std::str::from_utf8(name).ok().map(str::to_string);
        }

        i += ext_len;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal ClientHello record carrying the given SNI.
    pub(crate) fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let name = name.as_bytes();
            let mut ext = Vec::new();
            ext.extend_from_slice(&0x0000u16.to_be_bytes()); // extension type
            let list_len = (name.len() + 3) as u16;
            ext.extend_from_slice(&(list_len + 2).to_be_bytes()); // extension length
            ext.extend_from_slice(&list_len.to_be_bytes()); // server_name list length
            ext.push(0x00); // name type: host_name
            ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
            ext.extend_from_slice(name);
            extensions = ext;
        }

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id length
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites length
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression_methods length
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01); // ClientHello
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn classifies_client_hello_as_tls() {
        let hello = build_client_hello(Some("example.com"));
        assert_eq!(classify(&hello), TlsClass::Tls);
    }

    #[test]
    fn classifies_http_request_as_plain() {
        assert_eq!(classify(b"GET / HTTP/1.1\r\n"), TlsClass::Plain);
        assert_eq!(classify(b"POST /api HTTP/1.1\r\n"), TlsClass::Plain);
    }

    #[test]
    fn short_prefixes_stay_pending() {
        assert_eq!(classify(b"GE"), TlsClass::Pending);
        assert_eq!(classify(b"\x16\x03"), TlsClass::Pending);
        assert_eq!(classify(b""), TlsClass::Pending);
    }

    #[test]
    fn unrecognized_bytes_become_plain_after_enough_input() {
        assert_eq!(classify(b"\x00\x01\x02"), TlsClass::Pending);
        assert_eq!(classify(b"\x00\x01\x02\x03\x04\x05\x06\x07\x08"), TlsClass::Plain);
    }

    #[test]
    fn extracts_sni_from_client_hello() {
        let hello = build_client_hello(Some("api.example.com"));
        assert_eq!(parse_sni(&hello).as_deref(), Some("api.example.com"));
    }

    #[test]
    fn missing_sni_yields_none() {
        let hello = build_client_hello(None);
        assert_eq!(parse_sni(&hello), None);
    }

    #[test]
    fn sni_parser_rejects_truncated_records() {
        let mut hello = build_client_hello(Some("example.com"));
        hello.truncate(20);
        assert_eq!(parse_sni(&hello), None);
    }
}
