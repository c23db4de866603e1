//! Per-flow TCP stream reassembly.
//!
//! The flow table owns all per-connection transport state for one pipeline.
//! Each half-stream delivers payload bytes strictly in sequence order,
//! buffering out-of-order segments in a window bounded by the pipeline's
//! reassembly budget. A missing segment stalls its half-stream until the
//! gap timeout elapses (or budget pressure forces the issue), at which point
//! the gap is skipped, a [`StreamEvent::Gap`] is emitted, and delivery
//! resumes at the next buffered byte.
//!
//! Flows close on a FIN from both sides, on RST, or after the idle timeout.
//! All timeouts run on the packet clock, so replayed captures behave exactly
//! like live ones.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use etherparse::TcpHeaderSlice;

use crate::sniff::config::{FLOW_IDLE_TIMEOUT, GAP_TIMEOUT, HTTP_SERVER_PORTS};
use crate::sniff::types::{Direction, Endpoint, FlowKey, FlowPair, StreamEvent};

/// Events produced for a single flow, in delivery order.
#[derive(Debug)]
pub struct FlowEvents {
    pub key: FlowKey,
    pub flow: FlowPair,
    pub events: Vec<StreamEvent>,
}

// ── Half-stream ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct HalfStream {
    /// Next expected sequence number; unset until the first SYN or payload.
    next_seq: Option<u32>,
    /// Out-of-order segments keyed by sequence number.
    pending: BTreeMap<u32, Vec<u8>>,
    pending_bytes: usize,
    /// When the current gap started blocking delivery.
    pending_since: Option<DateTime<Utc>>,
    fin: bool,
}

impl HalfStream {
    /// Accepts one segment. Returns the payload chunks now deliverable in
    /// order, plus the change in buffered byte count.
    fn accept(
        &mut self,
        seq: u32,
        payload: &[u8],
        syn: bool,
        now: DateTime<Utc>,
    ) -> (Vec<Vec<u8>>, isize) {
        let before = self.pending_bytes as isize;
        let mut out = Vec::new();

        if syn && self.next_seq.is_none() {
            // SYN consumes one sequence number; data starts right after.
            self.next_seq = Some(seq.wrapping_add(1));
        }

        if !payload.is_empty() {
            let data_seq = if syn { seq.wrapping_add(1) } else { seq };
            let next = *self.next_seq.get_or_insert(data_seq);
            let delta = data_seq.wrapping_sub(next) as i32;

            if delta == 0 {
                self.deliver(payload.to_vec(), &mut out);
            } else if delta > 0 {
                // Future segment: hold it until the hole fills or times out.
                self.pending
                    .entry(data_seq)
                    .and_modify(|held| {
                        if payload.len() > held.len() {
                            *held = payload.to_vec();
                        }
                    })
                    .or_insert_with(|| payload.to_vec());
                self.pending_since.get_or_insert(now);
            } else {
                // Overlaps already-delivered bytes; keep only the new tail.
                let skip = (-delta) as usize;
                if skip < payload.len() {
                    self.deliver(payload[skip..].to_vec(), &mut out);
                }
            }
        }

        self.drain_pending(&mut out);
        self.recount(now);
        let after = self.pending_bytes as isize;
        (out, after - before)
    }

    fn deliver(&mut self, chunk: Vec<u8>, out: &mut Vec<Vec<u8>>) {
        let next = self.next_seq.unwrap_or(0);
        self.next_seq = Some(next.wrapping_add(chunk.len() as u32));
        out.push(chunk);
    }

    /// Moves any now-contiguous pending segments into the output.
    fn drain_pending(&mut self, out: &mut Vec<Vec<u8>>) {
        while let Some(next) = self.next_seq {
            let Some((&seq, _)) = self.pending.iter().next() else {
                break;
            };
            let delta = seq.wrapping_sub(next) as i32;
            if delta > 0 {
                break;
            }
            let held = self.pending.remove(&seq).unwrap_or_default();
            let skip = (-delta) as usize;
            if skip < held.len() {
                self.deliver(held[skip..].to_vec(), out);
            }
        }
    }

    /// Skips the current gap: delivery resumes at the lowest buffered byte.
    /// Returns the chunks released by the skip.
    fn skip_gap(&mut self, now: DateTime<Utc>) -> (Vec<Vec<u8>>, isize) {
        let before = self.pending_bytes as isize;
        let mut out = Vec::new();
        if let Some((&seq, _)) = self.pending.iter().next() {
            self.next_seq = Some(seq);
            self.drain_pending(&mut out);
        }
        self.recount(now);
        let after = self.pending_bytes as isize;
        (out, after - before)
    }

    fn recount(&mut self, now: DateTime<Utc>) {
        self.pending_bytes = self.pending.values().map(Vec::len).sum();
        if self.pending.is_empty() {
            self.pending_since = None;
        } else if self.pending_since.is_none() {
            self.pending_since = Some(now);
        }
    }

    fn gap_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.pending_since {
            Some(since) => {
                (now - since).to_std().unwrap_or_default() >= GAP_TIMEOUT
            }
            None => false,
        }
    }
}

// ── Flow ─────────────────────────────────────────────────────────────────────

struct Flow {
    pair: FlowPair,
    /// True when canonical endpoint `a` is the client.
    a_is_client: bool,
    /// Half-streams indexed by canonical direction: 0 is a-to-b, 1 is b-to-a.
    halves: [HalfStream; 2],
    last_seen: DateTime<Utc>,
}

impl Flow {
    fn direction(&self, half: usize) -> Direction {
        let a_to_b = half == 0;
        if a_to_b == self.a_is_client {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }
}

/// Decides which endpoint is the client for a freshly observed packet.
///
/// A SYN without ACK marks the sender as client, a SYN+ACK marks the sender
/// as server. When the handshake was missed, the side holding a well-known
/// HTTP port, or the lower port, is taken to be the server.
fn src_is_client(src: Endpoint, dst: Endpoint, tcp: &TcpHeaderSlice) -> bool {
    if tcp.syn() && !tcp.ack() {
        return true;
    }
    if tcp.syn() && tcp.ack() {
        return false;
    }
    if HTTP_SERVER_PORTS.contains(&dst.port) {
        return true;
    }
    if HTTP_SERVER_PORTS.contains(&src.port) {
        return false;
    }
    dst.port <= src.port
}

// ── Flow table ───────────────────────────────────────────────────────────────

/// All reassembly state owned by one pipeline. Not shared across threads.
pub struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    /// This pipeline's share of the total reassembly budget, in bytes.
    budget: usize,
    pending_total: usize,
}

impl FlowTable {
    pub fn new(budget: usize) -> Self {
        Self {
            flows: HashMap::new(),
            budget,
            pending_total: 0,
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Feeds one TCP segment through reassembly.
    ///
    /// The first returned element always describes the segment's own flow;
    /// further elements appear when budget pressure forces gaps closed on
    /// other flows.
    pub fn process(
        &mut self,
        src: Endpoint,
        dst: Endpoint,
        tcp: &TcpHeaderSlice,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Vec<FlowEvents> {
        let (key, src_is_a) = FlowKey::canonical(src, dst);

        let mut events = Vec::new();
        let flow = self.flows.entry(key).or_insert_with(|| {
            events.push(StreamEvent::Open);
            let client_side = src_is_client(src, dst, tcp);
            let (client, server) = if client_side { (src, dst) } else { (dst, src) };
            Flow {
                pair: FlowPair { client, server },
                a_is_client: client_side == src_is_a,
                halves: [HalfStream::default(), HalfStream::default()],
                last_seen: now,
            }
        });
        flow.last_seen = now;
        let pair = flow.pair;

        let half = if src_is_a { 0 } else { 1 };
        let dir = flow.direction(half);
        let (chunks, delta) = flow.halves[half].accept(tcp.sequence_number(), payload, tcp.syn(), now);
        self.pending_total = (self.pending_total as isize + delta).max(0) as usize;

        for bytes in chunks {
            events.push(StreamEvent::Data { dir, bytes, ts: now });
        }

        if tcp.fin() {
            flow.halves[half].fin = true;
        }

        let closed = tcp.rst() || (flow.halves[0].fin && flow.halves[1].fin);
        if closed {
            events.push(StreamEvent::Close { ts: now });
            self.remove(&key);
        }

        let mut out = vec![FlowEvents {
            key,
            flow: pair,
            events,
        }];
        self.enforce_budget(now, &mut out);
        out
    }

    /// Periodic pass over the table: closes idle flows and skips gaps that
    /// have waited longer than the gap timeout.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<FlowEvents> {
        let mut out = Vec::new();

        let idle: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, f)| (now - f.last_seen).to_std().unwrap_or_default() >= FLOW_IDLE_TIMEOUT)
            .map(|(k, _)| *k)
            .collect();
        for key in idle {
            if let Some(flow) = self.flows.get(&key) {
                out.push(FlowEvents {
                    key,
                    flow: flow.pair,
                    events: vec![StreamEvent::Close { ts: now }],
                });
            }
            self.remove(&key);
        }

        let stalled: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, f)| f.halves.iter().any(|h| h.gap_elapsed(now)))
            .map(|(k, _)| *k)
            .collect();
        for key in stalled {
            self.force_gap(&key, now, &mut out);
        }

        out
    }

    /// Flushes everything: any pending gaps are skipped so buffered bytes
    /// reach the parsers, then every flow is closed. Used on stop.
    pub fn drain(&mut self, now: DateTime<Utc>) -> Vec<FlowEvents> {
        let mut out = Vec::new();
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        for key in keys {
            self.force_gap(&key, now, &mut out);
            if let Some(flow) = self.flows.get(&key) {
                out.push(FlowEvents {
                    key,
                    flow: flow.pair,
                    events: vec![StreamEvent::Close { ts: now }],
                });
            }
            self.remove(&key);
        }
        out
    }

    /// Skips the gap on every stalled half of one flow.
    fn force_gap(&mut self, key: &FlowKey, now: DateTime<Utc>, out: &mut Vec<FlowEvents>) {
        let Some(flow) = self.flows.get_mut(key) else {
            return;
        };
        let mut events = Vec::new();
        for half in 0..2 {
            if flow.halves[half].pending.is_empty() {
                continue;
            }
            let dir = flow.direction(half);
            let (chunks, delta) = flow.halves[half].skip_gap(now);
            self.pending_total = (self.pending_total as isize + delta).max(0) as usize;
            events.push(StreamEvent::Gap { dir });
            for bytes in chunks {
                events.push(StreamEvent::Data { dir, bytes, ts: now });
            }
        }
        if !events.is_empty() {
            out.push(FlowEvents {
                key: *key,
                flow: flow.pair,
                events,
            });
        }
    }

    /// Keeps total buffered bytes under the pipeline's share by forcing the
    /// longest-stalled gap closed until the budget holds.
    fn enforce_budget(&mut self, now: DateTime<Utc>, out: &mut Vec<FlowEvents>) {
        while self.pending_total > self.budget {
            let oldest = self
                .flows
                .iter()
                .filter_map(|(k, f)| {
                    f.halves
                        .iter()
                        .filter_map(|h| h.pending_since)
                        .min()
                        .map(|since| (*k, since))
                })
                .min_by_key(|(_, since)| *since)
                .map(|(k, _)| k);
            match oldest {
                Some(key) => self.force_gap(&key, now, out),
                None => break,
            }
        }
    }

    fn remove(&mut self, key: &FlowKey) {
        if let Some(flow) = self.flows.remove(key) {
            let held: usize = flow.halves.iter().map(|h| h.pending_bytes).sum();
            self.pending_total = self.pending_total.saturating_sub(held);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use etherparse::TcpHeader;
    use std::net::{IpAddr, Ipv4Addr};

    fn ep(last: u8, port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, last)), port)
    }

    fn ts(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap()
    }

    /// Builds a TCP header byte buffer and returns a slice view over it.
    fn tcp_bytes(src: u16, dst: u16, seq: u32, syn: bool, ack: bool, fin: bool, rst: bool) -> Vec<u8> {
        let mut h = TcpHeader::new(src, dst, seq, 65_535);
        h.syn = syn;
        h.ack = ack;
        h.fin = fin;
        h.rst = rst;
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        buf
    }

    fn feed(
        table: &mut FlowTable,
        src: Endpoint,
        dst: Endpoint,
        seq: u32,
        flags: (bool, bool, bool, bool),
        payload: &[u8],
        at: DateTime<Utc>,
    ) -> Vec<FlowEvents> {
        let (syn, ack, fin, rst) = flags;
        let bytes = tcp_bytes(src.port, dst.port, seq, syn, ack, fin, rst);
        let tcp = TcpHeaderSlice::from_slice(&bytes).unwrap();
        table.process(src, dst, &tcp, payload, at)
    }

    fn data_of(events: &[FlowEvents]) -> Vec<(Direction, Vec<u8>)> {
        events
            .iter()
            .flat_map(|fe| fe.events.iter())
            .filter_map(|e| match e {
                StreamEvent::Data { dir, bytes, .. } => Some((*dir, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn delivers_in_order_payload() {
        let mut table = FlowTable::new(1 << 20);
        let client = ep(1, 40_000);
        let server = ep(2, 80);

        feed(&mut table, client, server, 1000, (true, false, false, false), b"", ts(0));
        let events = feed(
            &mut table,
            client,
            server,
            1001,
            (false, true, false, false),
            b"hello",
            ts(1),
        );
        let data = data_of(&events);
        assert_eq!(data, vec![(Direction::ToServer, b"hello".to_vec())]);
    }

    #[test]
    fn reorders_out_of_order_segments() {
        let mut table = FlowTable::new(1 << 20);
        let client = ep(1, 40_000);
        let server = ep(2, 80);

        feed(&mut table, client, server, 1000, (true, false, false, false), b"", ts(0));
        // Second chunk arrives first.
        let early = feed(
            &mut table,
            client,
            server,
            1006,
            (false, true, false, false),
            b"world",
            ts(1),
        );
        assert!(data_of(&early).is_empty());

        let now_complete = feed(
            &mut table,
            client,
            server,
            1001,
            (false, true, false, false),
            b"hello",
            ts(2),
        );
        let data = data_of(&now_complete);
        assert_eq!(
            data,
            vec![
                (Direction::ToServer, b"hello".to_vec()),
                (Direction::ToServer, b"world".to_vec()),
            ]
        );
    }

    #[test]
    fn drops_retransmitted_bytes() {
        let mut table = FlowTable::new(1 << 20);
        let client = ep(1, 40_000);
        let server = ep(2, 80);

        feed(&mut table, client, server, 500, (false, true, false, false), b"abcd", ts(0));
        let retrans = feed(
            &mut table,
            client,
            server,
            500,
            (false, true, false, false),
            b"abcd",
            ts(1),
        );
        assert!(data_of(&retrans).is_empty());

        // Partial overlap: only the unseen tail is delivered.
        let overlap = feed(
            &mut table,
            client,
            server,
            502,
            (false, true, false, false),
            b"cdEF",
            ts(2),
        );
        assert_eq!(data_of(&overlap), vec![(Direction::ToServer, b"EF".to_vec())]);
    }

    #[test]
    fn orients_by_syn_direction() {
        let mut table = FlowTable::new(1 << 20);
        // High-port server; only the SYN tells us who the client is.
        let client = ep(1, 2000);
        let server = ep(2, 9999);

        let open = feed(&mut table, client, server, 1, (true, false, false, false), b"", ts(0));
        assert_eq!(open[0].flow.client, client);
        assert_eq!(open[0].flow.server, server);
    }

    #[test]
    fn orients_by_port_when_handshake_missed() {
        let mut table = FlowTable::new(1 << 20);
        let client = ep(1, 51_000);
        let server = ep(2, 8080);

        // Mid-stream packet from the server side.
        let open = feed(&mut table, server, client, 99, (false, true, false, false), b"x", ts(0));
        assert_eq!(open[0].flow.server, server);
        assert_eq!(data_of(&open), vec![(Direction::ToClient, b"x".to_vec())]);
    }

    #[test]
    fn closes_on_fin_pair() {
        let mut table = FlowTable::new(1 << 20);
        let client = ep(1, 40_000);
        let server = ep(2, 80);

        feed(&mut table, client, server, 1, (false, true, true, false), b"", ts(0));
        assert_eq!(table.flow_count(), 1);
        let events = feed(&mut table, server, client, 9, (false, true, true, false), b"", ts(1));
        assert!(events[0]
            .events
            .iter()
            .any(|e| matches!(e, StreamEvent::Close { .. })));
        assert_eq!(table.flow_count(), 0);
    }

    #[test]
    fn closes_on_rst() {
        let mut table = FlowTable::new(1 << 20);
        let client = ep(1, 40_000);
        let server = ep(2, 80);

        feed(&mut table, client, server, 1, (false, true, false, false), b"x", ts(0));
        let events = feed(&mut table, server, client, 5, (false, false, false, true), b"", ts(1));
        assert!(events[0]
            .events
            .iter()
            .any(|e| matches!(e, StreamEvent::Close { .. })));
        assert_eq!(table.flow_count(), 0);
    }

    #[test]
    fn sweep_closes_idle_flows() {
        let mut table = FlowTable::new(1 << 20);
        feed(&mut table, ep(1, 40_000), ep(2, 80), 1, (false, true, false, false), b"x", ts(0));

        assert!(table.sweep(ts(30)).is_empty());
        let closed = table.sweep(ts(61));
        assert_eq!(closed.len(), 1);
        assert!(matches!(closed[0].events[0], StreamEvent::Close { .. }));
        assert_eq!(table.flow_count(), 0);
    }

    #[test]
    fn sweep_skips_gap_after_timeout() {
        let mut table = FlowTable::new(1 << 20);
        let client = ep(1, 40_000);
        let server = ep(2, 80);

        feed(&mut table, client, server, 1000, (true, false, false, false), b"", ts(0));
        // Bytes at 1001..1006 never arrive; this lands beyond the hole.
        feed(&mut table, client, server, 1006, (false, true, false, false), b"late", ts(1));

        assert!(table.sweep(ts(5)).is_empty());
        let events = table.sweep(ts(12));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].events[0], StreamEvent::Gap { .. }));
        assert_eq!(data_of(&events), vec![(Direction::ToServer, b"late".to_vec())]);
    }

    #[test]
    fn budget_pressure_forces_oldest_gap() {
        let mut table = FlowTable::new(8);
        let client = ep(1, 40_000);
        let server = ep(2, 80);

        feed(&mut table, client, server, 1000, (true, false, false, false), b"", ts(0));
        // 6 buffered bytes, within budget.
        feed(&mut table, client, server, 1010, (false, true, false, false), b"abcdef", ts(1));
        // 6 more push the table over its 8-byte share; the gap is forced.
        let events = feed(&mut table, client, server, 1016, (false, true, false, false), b"ghijkl", ts(2));
        let all: Vec<_> = events.iter().flat_map(|fe| fe.events.iter()).collect();
        assert!(all.iter().any(|e| matches!(e, StreamEvent::Gap { .. })));
        let delivered: usize = data_of(&events).iter().map(|(_, b)| b.len()).sum();
        assert_eq!(delivered, 12);
    }

    #[test]
    fn drain_flushes_buffered_data_and_closes() {
        let mut table = FlowTable::new(1 << 20);
        let client = ep(1, 40_000);
        let server = ep(2, 80);

        feed(&mut table, client, server, 1000, (true, false, false, false), b"", ts(0));
        feed(&mut table, client, server, 1005, (false, true, false, false), b"tail", ts(1));

        let events = table.drain(ts(2));
        assert_eq!(data_of(&events), vec![(Direction::ToServer, b"tail".to_vec())]);
        assert!(events
            .iter()
            .flat_map(|fe| fe.events.iter())
            .any(|e| matches!(e, StreamEvent::Close { .. })));
        assert_eq!(table.flow_count(), 0);
    }
}
