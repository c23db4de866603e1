//! Core data structures shared across the sniffing sub-modules.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

// ── Flow identity ────────────────────────────────────────────────────────────

/// One side of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Direction-agnostic identifier for a bidirectional TCP flow.
///
/// Traffic between A and B maps to the same key regardless of which side
/// sent the packet: the two endpoints are ordered so that `a <= b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl FlowKey {
    /// Builds the canonical key for a packet. The returned flag is true when
    /// the packet's source endpoint landed in position `a`.
    pub fn canonical(src: Endpoint, dst: Endpoint) -> (Self, bool) {
        if (src.ip, src.port) <= (dst.ip, dst.port) {
            (Self { a: src, b: dst }, true)
        } else {
            (Self { a: dst, b: src }, false)
        }
    }
}

/// A flow with its client/server orientation resolved.
///
/// Exchanges carry this by value; the reassembler's flow state may be gone
/// by the time an exchange reaches a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowPair {
    pub client: Endpoint,
    pub server: Endpoint,
}

/// Payload direction relative to the resolved orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

// ── Stream events ────────────────────────────────────────────────────────────

/// Lifecycle and payload events emitted by the reassembler, in order, for
/// the protocol layers above it.
#[derive(Debug)]
pub enum StreamEvent {
    /// A new flow was created.
    Open,
    /// In-sequence payload bytes for one direction.
    Data {
        dir: Direction,
        bytes: Vec<u8>,
        ts: DateTime<Utc>,
    },
    /// A sequence gap was skipped; bytes were lost in this direction.
    Gap { dir: Direction },
    /// The flow closed (FIN pair, RST, idle timeout, or drain).
    Close { ts: DateTime<Utc> },
}

// ── HTTP messages ────────────────────────────────────────────────────────────

pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Host header value, when present.
    pub host: Option<String>,
    /// Minor version of HTTP/1.x.
    pub version: u8,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Set when the body exceeded the cap and was cut off.
    pub truncated: bool,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub version: u8,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub truncated: bool,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A paired request and response from one flow.
///
/// Requests and responses pair FIFO within a flow: the k-th response belongs
/// to the k-th request. Exchanges are emitted exactly once and owned by the
/// collector chain afterwards.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub flow: FlowPair,
    pub request: HttpRequest,
    pub response: HttpResponse,
}

impl Exchange {
    /// Host the request was addressed to: the Host header when present,
    /// otherwise the server address.
    pub fn host(&self) -> String {
        match &self.request.host {
            Some(h) => h.clone(),
            None => self.flow.server.ip.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(last: u8, port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    #[test]
    fn canonical_key_is_direction_agnostic() {
        let (k1, src_is_a) = FlowKey::canonical(ep(1, 40000), ep(2, 80));
        let (k2, rev_is_a) = FlowKey::canonical(ep(2, 80), ep(1, 40000));
        assert_eq!(k1, k2);
        assert_ne!(src_is_a, rev_is_a);
    }

    #[test]
    fn canonical_orders_by_port_on_same_ip() {
        let (k, _) = FlowKey::canonical(ep(1, 9000), ep(1, 80));
        assert_eq!(k.a.port, 80);
        assert_eq!(k.b.port, 9000);
    }
}
