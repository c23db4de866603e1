//! Packet and message counters.
//!
//! A [`PacketCountSummary`] aggregates per-interface, per-port counts. The
//! packet source records TCP packets and unparsed segments; the HTTP parser
//! records requests and responses. Port attribution always uses the flow's
//! server-side port, so per-port counts sum to the interface total.

use std::sync::Arc;

use dashmap::DashMap;

use crate::collect::Collector;
use crate::error::Error;
use crate::sniff::types::Exchange;

/// Counters for one (interface, port) bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketCounts {
    pub tcp_packets: u64,
    pub http_requests: u64,
    pub http_responses: u64,
    pub unparsed: u64,
}

impl PacketCounts {
    fn add(&mut self, other: &PacketCounts) {
        self.tcp_packets += other.tcp_packets;
        self.http_requests += other.http_requests;
        self.http_responses += other.http_responses;
        self.unparsed += other.unparsed;
    }
}

/// Thread-safe counter table shared by the pipelines of one filter state.
#[derive(Debug, Default)]
pub struct PacketCountSummary {
    buckets: DashMap<(String, u16), PacketCounts>,
}

impl PacketCountSummary {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn bump(&self, interface: &str, port: u16, f: impl FnOnce(&mut PacketCounts)) {
        let mut entry = self
            .buckets
            .entry((interface.to_string(), port))
            .or_default();
        f(entry.value_mut());
    }

    pub fn record_tcp_packet(&self, interface: &str, port: u16) {
        self.bump(interface, port, |c| c.tcp_packets += 1);
    }

    pub fn record_request(&self, interface: &str, port: u16) {
        self.bump(interface, port, |c| c.http_requests += 1);
    }

    pub fn record_response(&self, interface: &str, port: u16) {
        self.bump(interface, port, |c| c.http_responses += 1);
    }

    pub fn record_unparsed(&self, interface: &str, port: u16) {
        self.bump(interface, port, |c| c.unparsed += 1);
    }

    /// Sum over every bucket.
    pub fn total(&self) -> PacketCounts {
        let mut total = PacketCounts::default();
        for entry in self.buckets.iter() {
            total.add(entry.value());
        }
        total
    }

    /// Sum over one interface's buckets.
    pub fn total_on_interface(&self, name: &str) -> PacketCounts {
        let mut total = PacketCounts::default();
        for entry in self.buckets.iter() {
            if entry.key().0 == name {
                total.add(entry.value());
            }
        }
        total
    }

    /// Per-port totals merged across interfaces, sorted by port.
    pub fn all_ports(&self) -> Vec<(u16, PacketCounts)> {
        let merged: DashMap<u16, PacketCounts> = DashMap::new();
        for entry in self.buckets.iter() {
            merged.entry(entry.key().1).or_default().add(entry.value());
        }
        let mut ports: Vec<(u16, PacketCounts)> =
            merged.into_iter().collect();
        ports.sort_by_key(|(port, _)| *port);
        ports
    }
}

/// Chain stage that counts the exchanges passing through it.
///
/// Used twice: before the filter stages (diagnostics) and after sampling
/// (admitted exchanges).
pub struct PacketCountCollector {
    summary: Arc<PacketCountSummary>,
    interface: String,
    next: Box<dyn Collector>,
}

impl PacketCountCollector {
    pub fn new(
        summary: Arc<PacketCountSummary>,
        interface: &str,
        next: Box<dyn Collector>,
    ) -> Self {
        Self {
            summary,
            interface: interface.to_string(),
            next,
        }
    }
}

impl Collector for PacketCountCollector {
    fn process(&mut self, exchange: Exchange) {
        let port = exchange.flow.server.port;
        self.summary.record_request(&self.interface, port);
        self.summary.record_response(&self.interface, port);
        self.next.process(exchange);
    }

    fn close(&mut self) -> Result<(), Error> {
        self.next.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_port_counts_sum_to_interface_total() {
        let summary = PacketCountSummary::new();
        for _ in 0..3 {
            summary.record_tcp_packet("eth0", 80);
        }
        for _ in 0..2 {
            summary.record_tcp_packet("eth0", 8080);
        }
        summary.record_tcp_packet("eth1", 80);

        let eth0 = summary.total_on_interface("eth0");
        assert_eq!(eth0.tcp_packets, 5);
        let per_port: u64 = summary
            .all_ports()
            .iter()
            .map(|(_, c)| c.tcp_packets)
            .sum();
        assert_eq!(per_port, summary.total().tcp_packets);
        assert_eq!(summary.total().tcp_packets, 6);
    }

    #[test]
    fn all_ports_is_sorted_and_merged() {
        let summary = PacketCountSummary::new();
        summary.record_request("eth0", 8080);
        summary.record_request("eth1", 8080);
        summary.record_request("eth0", 80);

        let ports = summary.all_ports();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].0, 80);
        assert_eq!(ports[1].0, 8080);
        assert_eq!(ports[1].1.http_requests, 2);
    }

    #[test]
    fn totals_cover_all_fields() {
        let summary = PacketCountSummary::new();
        summary.record_tcp_packet("eth0", 80);
        summary.record_request("eth0", 80);
        summary.record_response("eth0", 80);
        summary.record_unparsed("eth0", 80);

        let total = summary.total();
        assert_eq!(
            total,
            PacketCounts {
                tcp_packets: 1,
                http_requests: 1,
                http_responses: 1,
                unparsed: 1,
            }
        );
    }
}
