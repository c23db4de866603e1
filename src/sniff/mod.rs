//! The per-pipeline sniffing engine.
//!
//! One [`Pipeline`] runs per (interface, filter-state) pair on its own
//! thread and owns all of its protocol state exclusively: the TCP flow
//! table, the TLS classification buffers, the HTTP parsers, and the
//! collector chain. Shared state is limited to the counter summaries and
//! the rate limiter inside the chain.
//!
//! Frames enter through [`Pipeline::process_packet`], whether they come
//! from a live capture, a replayed file, or a test feeding synthetic
//! frames.

pub mod config;
pub mod http;
pub mod reassembly;
pub mod tls;
pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};

use crate::capture::{Next, PacketContext, PacketSource};
use crate::collect::counts::PacketCountSummary;
use crate::collect::Collector;
use crate::error::Error;
use crate::logger::{Event, SharedLogger};

use self::config::{CLASSIFY_IDLE_TIMEOUT, SWEEP_INTERVAL};
use self::http::HttpConn;
use self::reassembly::{FlowEvents, FlowTable};
use self::tls::{classify, parse_sni, TlsClass};
use self::types::{Direction, Endpoint, Exchange, FlowKey, FlowPair, StreamEvent};

/// Cap on buffered classification bytes per direction.
const PEEK_CAP: usize = 4096;

// ── Per-flow protocol state ──────────────────────────────────────────────────

struct ConnState {
    flow: FlowPair,
    class: TlsClass,
    /// Client bytes accumulated until the flow is classified.
    peek: Vec<u8>,
    /// Server bytes held back until the flow is classified.
    held_to_client: Vec<u8>,
    first_data_at: Option<DateTime<Utc>>,
    http: Option<HttpConn>,
}

impl ConnState {
    fn new(flow: FlowPair) -> Self {
        Self {
            flow,
            class: TlsClass::Pending,
            peek: Vec::new(),
            held_to_client: Vec::new(),
            first_data_at: None,
            http: None,
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// The capture-to-exchange engine for one interface and filter state.
pub struct Pipeline {
    interface: String,
    summary: Arc<PacketCountSummary>,
    collector: Box<dyn Collector>,
    flows: FlowTable,
    conns: HashMap<FlowKey, ConnState>,
    logger: SharedLogger,
    last_sweep: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn new(
        interface: &str,
        summary: Arc<PacketCountSummary>,
        collector: Box<dyn Collector>,
        reassembly_budget: usize,
        logger: SharedLogger,
    ) -> Self {
        Self {
            interface: interface.to_string(),
            summary,
            collector,
            flows: FlowTable::new(reassembly_budget),
            conns: HashMap::new(),
            logger,
            last_sweep: None,
        }
    }

    /// Feeds one link-layer frame through the whole stack.
    pub fn process_packet(&mut self, data: &[u8], ctx: PacketContext) {
        // Malformed frames and non-TCP traffic are dropped silently; the
        // BPF filter has already done the coarse selection.
        let Ok(sliced) = SlicedPacket::from_ethernet(data) else {
            return;
        };

        let (src_ip, dst_ip) = match &sliced.ip {
            Some(InternetSlice::Ipv4(v4, _)) => (
                std::net::IpAddr::V4(v4.source_addr()),
                std::net::IpAddr::V4(v4.destination_addr()),
            ),
            Some(InternetSlice::Ipv6(v6, _)) => (
                std::net::IpAddr::V6(v6.source_addr()),
                std::net::IpAddr::V6(v6.destination_addr()),
            ),
            None => return,
        };

        let Some(TransportSlice::Tcp(tcp)) = &sliced.transport else {
            return;
        };

        let src = Endpoint::new(src_ip, tcp.source_port());
        let dst = Endpoint::new(dst_ip, tcp.destination_port());

        let batches = self.flows.process(src, dst, tcp, sliced.payload, ctx.ts);
        // The first batch is the packet's own flow; count the packet there.
        if let Some(first) = batches.first() {
            self.summary
                .record_tcp_packet(&self.interface, first.flow.server.port);
        }
        for batch in batches {
            self.handle_flow_events(batch);
        }

        self.maybe_sweep(ctx.ts);
    }

    /// Runs the capture loop until shutdown, read failure, or end of file.
    pub fn run(&mut self, source: &mut PacketSource, shutdown: &AtomicBool) -> Result<(), Error> {
        let mut result = Ok(());
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match source.next_packet() {
                Next::Packet { data, ctx } => {
                    self.process_packet(data, ctx);
                }
                Next::Skipped => continue,
                Next::TimedOut => {
                    // Idle interface: advance timeouts on the wall clock so
                    // stalled flows still close.
                    self.maybe_sweep(Utc::now());
                }
                Next::Finished => break,
                Next::Failed(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if let Some(dropped) = source.dropped() {
            self.report_drops(dropped);
        }
        result
    }

    /// Flushes all in-flight state and closes the collector chain.
    ///
    /// Buffered segments are pushed through the parsers so every complete
    /// exchange still reaches the sink before it closes.
    pub fn drain(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        for batch in self.flows.drain(now) {
            self.handle_flow_events(batch);
        }
        self.conns.clear();
        self.collector.close()
    }

    fn report_drops(&self, dropped: u64) {
        if dropped > 0 {
            self.logger.log(&Event::CaptureDrops {
                interface: &self.interface,
                dropped,
            });
        }
    }

    fn maybe_sweep(&mut self, now: DateTime<Utc>) {
        let due = match self.last_sweep {
            Some(last) => (now - last).to_std().unwrap_or_default() >= SWEEP_INTERVAL,
            None => true,
        };
        if !due {
            return;
        }
        self.last_sweep = Some(now);

        for batch in self.flows.sweep(now) {
            self.handle_flow_events(batch);
        }

        // Flows that never produced enough bytes to classify fall back to
        // plaintext after the classification idle threshold.
        let stale: Vec<FlowKey> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                conn.class == TlsClass::Pending
                    && conn.first_data_at.is_some_and(|at| {
                        (now - at).to_std().unwrap_or_default() >= CLASSIFY_IDLE_TIMEOUT
                    })
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(mut conn) = self.conns.remove(&key) {
                self.settle_plaintext(&mut conn, now);
                self.conns.insert(key, conn);
            }
        }
    }

    fn handle_flow_events(&mut self, batch: FlowEvents) {
        let FlowEvents { key, flow, events } = batch;
        for event in events {
            match event {
                StreamEvent::Open => {
                    self.conns.insert(key, ConnState::new(flow));
                }
                StreamEvent::Data { dir, bytes, ts } => {
                    // Take the connection out while we touch `self`, then
                    // put it back unless the flow is gone.
                    let Some(mut conn) = self.conns.remove(&key) else {
                        continue;
                    };
                    self.on_data(&mut conn, dir, &bytes, ts);
                    self.conns.insert(key, conn);
                }
                StreamEvent::Gap { dir } => {
                    let Some(mut conn) = self.conns.remove(&key) else {
                        continue;
                    };
                    self.on_gap(&mut conn, dir);
                    self.conns.insert(key, conn);
                }
                StreamEvent::Close { ts } => {
                    if let Some(mut conn) = self.conns.remove(&key) {
                        if let Some(http) = conn.http.as_mut() {
                            for exchange in http.on_close(ts) {
                                self.emit(exchange);
                            }
                        }
                    }
                }
            }
        }
    }

    fn on_data(&mut self, conn: &mut ConnState, dir: Direction, bytes: &[u8], ts: DateTime<Utc>) {
        match conn.class {
            TlsClass::Tls => {
                // Opaque payload; visible only in the counters.
                self.summary
                    .record_unparsed(&self.interface, conn.flow.server.port);
            }
            TlsClass::Plain => {
                if let Some(http) = conn.http.as_mut() {
                    for exchange in http.on_data(dir, bytes, ts) {
                        self.emit(exchange);
                    }
                }
            }
            TlsClass::Pending => {
                conn.first_data_at.get_or_insert(ts);
                match dir {
                    Direction::ToServer => {
                        let room = PEEK_CAP.saturating_sub(conn.peek.len());
                        conn.peek.extend_from_slice(&bytes[..bytes.len().min(room)]);
                        match classify(&conn.peek) {
                            TlsClass::Tls => self.settle_tls(conn, ts),
                            TlsClass::Plain => self.settle_plaintext(conn, ts),
                            TlsClass::Pending => {
                                if conn.peek.len() >= PEEK_CAP {
                                    self.settle_plaintext(conn, ts);
                                }
                            }
                        }
                    }
                    Direction::ToClient => {
                        let room = PEEK_CAP.saturating_sub(conn.held_to_client.len());
                        conn.held_to_client
                            .extend_from_slice(&bytes[..bytes.len().min(room)]);
                        if conn.held_to_client.len() >= PEEK_CAP {
                            self.settle_plaintext(conn, ts);
                        }
                    }
                }
            }
        }
    }

    fn on_gap(&mut self, conn: &mut ConnState, dir: Direction) {
        match conn.class {
            TlsClass::Tls => {
                self.summary
                    .record_unparsed(&self.interface, conn.flow.server.port);
            }
            TlsClass::Plain => {
                if let Some(http) = conn.http.as_mut() {
                    http.on_gap(dir);
                }
            }
            TlsClass::Pending => {
                // A hole in the classification bytes: give up on a clean
                // classification and let the HTTP parser resynchronize.
                let ts = conn.first_data_at.unwrap_or_else(Utc::now);
                self.settle_plaintext(conn, ts);
                if let Some(http) = conn.http.as_mut() {
                    http.on_gap(dir);
                }
            }
        }
    }

    /// Marks the flow TLS: log the handshake metadata, drop the buffers.
    fn settle_tls(&mut self, conn: &mut ConnState, _ts: DateTime<Utc>) {
        conn.class = TlsClass::Tls;
        let sni = parse_sni(&conn.peek);
        let client = conn.flow.client.to_string();
        let server = conn.flow.server.to_string();
        self.logger.log(&Event::TlsConnection {
            client: &client,
            server: &server,
            sni: sni.as_deref(),
        });
        // Handshake bytes count as unparsed TCP payload.
        self.summary
            .record_unparsed(&self.interface, conn.flow.server.port);
        conn.peek = Vec::new();
        conn.held_to_client = Vec::new();
    }

    /// Marks the flow plaintext and replays the buffered bytes into a
    /// fresh HTTP connection.
    fn settle_plaintext(&mut self, conn: &mut ConnState, ts: DateTime<Utc>) {
        conn.class = TlsClass::Plain;
        let mut http = HttpConn::new(conn.flow, Arc::clone(&self.summary), &self.interface);

        let peek = std::mem::take(&mut conn.peek);
        if !peek.is_empty() {
            for exchange in http.on_data(Direction::ToServer, &peek, ts) {
                self.emit(exchange);
            }
        }
        let held = std::mem::take(&mut conn.held_to_client);
        if !held.is_empty() {
            for exchange in http.on_data(Direction::ToClient, &held, ts) {
                self.emit(exchange);
            }
        }
        conn.http = Some(http);
    }

    fn emit(&mut self, exchange: Exchange) {
        self.collector.process(exchange);
    }
}
