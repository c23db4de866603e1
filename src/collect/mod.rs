//! The collector chain.
//!
//! Every reconstructed exchange traverses an ordered stack of stages; each
//! stage owns the next one and forwards after doing its own work. The chain
//! is synchronous and runs on the pipeline's own thread; the only shared
//! state is the rate limiter's token reservoir and the counter tables.

pub mod backend;
pub mod counts;
pub mod filters;
pub mod har;
pub mod sample;

use std::sync::{Arc, Mutex};

use crate::config::CompiledFilters;
use crate::error::Error;
use crate::sniff::types::Exchange;

use self::counts::{PacketCountCollector, PacketCountSummary};
use self::filters::{
    HostAllowCollector, HostExcludeCollector, PathAllowCollector, PathExcludeCollector,
    SelfTrafficCollector,
};
use self::sample::{RateLimit, RateLimitCollector, SamplingCollector};

/// A stage in the collector chain.
///
/// `process` takes the exchange by value; a stage that drops it simply does
/// not forward. Failures inside `process` are the stage's own business
/// (logged, counted); `close` flushes and surfaces the first persistent
/// error to the supervisor.
pub trait Collector: Send {
    fn process(&mut self, exchange: Exchange);
    fn close(&mut self) -> Result<(), Error>;
}

// ── Terminal sinks ───────────────────────────────────────────────────────────

/// Swallows everything. Terminal sink of the negation pipelines.
pub struct DiscardCollector;

impl Collector for DiscardCollector {
    fn process(&mut self, _exchange: Exchange) {}

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Collects exchanges into shared memory. Used by tests and embedders.
pub struct VecCollector {
    exchanges: Arc<Mutex<Vec<Exchange>>>,
}

impl VecCollector {
    pub fn new(exchanges: Arc<Mutex<Vec<Exchange>>>) -> Self {
        Self { exchanges }
    }
}

impl Collector for VecCollector {
    fn process(&mut self, exchange: Exchange) {
        if let Ok(mut guard) = self.exchanges.lock() {
            guard.push(exchange);
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Fans each exchange out to two sinks. A failure in one does not stop the
/// other; close errors are reported with the first taking precedence.
pub struct TeeCollector {
    pub first: Box<dyn Collector>,
    pub second: Box<dyn Collector>,
}

impl Collector for TeeCollector {
    fn process(&mut self, exchange: Exchange) {
        self.first.process(exchange.clone());
        self.second.process(exchange);
    }

    fn close(&mut self) -> Result<(), Error> {
        let first = self.first.close();
        let second = self.second.close();
        first.and(second)
    }
}

// ── Chain construction ───────────────────────────────────────────────────────

/// Everything needed to assemble one pipeline's chain.
pub struct ChainConfig<'a> {
    pub interface: &'a str,
    pub filters: &'a CompiledFilters,
    pub sample_rate: f64,
    pub rate_limit: Option<Arc<RateLimit>>,
    /// Present on matched pipelines when any user filter is configured.
    pub prefilter: Option<Arc<PacketCountSummary>>,
    /// Counts exchanges that survived every stage.
    pub admitted: Arc<PacketCountSummary>,
    /// Ingest endpoint identity; `None` disables self-traffic suppression.
    pub self_traffic: Option<filters::SelfTrafficMatcher>,
    pub sink: Box<dyn Collector>,
}

/// Builds the chain inside-out so that data flows:
/// pre-filter count, self-traffic suppression, path allow, host allow,
/// path exclusion, host exclusion, rate limit, sampling, post-filter
/// count, sink.
pub fn build_chain(config: ChainConfig) -> Box<dyn Collector> {
    let ChainConfig {
        interface,
        filters,
        sample_rate,
        rate_limit,
        prefilter,
        admitted,
        self_traffic,
        sink,
    } = config;

    let mut chain: Box<dyn Collector> =
        Box::new(PacketCountCollector::new(admitted, interface, sink));

    chain = Box::new(SamplingCollector::new(sample_rate, chain));

    if let Some(limit) = rate_limit {
        chain = Box::new(RateLimitCollector::new(limit, chain));
    }

    if !filters.host_exclusions.is_empty() {
        chain = Box::new(HostExcludeCollector::new(&filters.host_exclusions, chain));
    }
    if !filters.path_exclusions.is_empty() {
        chain = Box::new(PathExcludeCollector::new(&filters.path_exclusions, chain));
    }
    if !filters.host_allowlist.is_empty() {
        chain = Box::new(HostAllowCollector::new(&filters.host_allowlist, chain));
    }
    if !filters.path_allowlist.is_empty() {
        chain = Box::new(PathAllowCollector::new(&filters.path_allowlist, chain));
    }

    if let Some(matcher) = self_traffic {
        chain = Box::new(SelfTrafficCollector::new(matcher, chain));
    }

    if let Some(summary) = prefilter {
        chain = Box::new(PacketCountCollector::new(summary, interface, chain));
    }

    chain
}

/// Canonical exchange for unit tests across the collect stages.
#[cfg(test)]
pub(crate) fn sample_exchange(path: &str, host: &str) -> Exchange {
    use crate::sniff::types::{Endpoint, FlowPair, HttpRequest, HttpResponse};
    use chrono::TimeZone;
    use std::net::{IpAddr, Ipv4Addr};

    let ts = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let flow = FlowPair {
        client: Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 40_000),
        server: Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80),
    };
    Exchange {
        flow,
        request: HttpRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            host: Some(host.to_string()),
            version: 1,
            headers: vec![("Host".to_string(), host.to_string())],
            body: Vec::new(),
            truncated: false,
            start: ts,
            end: ts,
        },
        response: HttpResponse {
            status: 200,
            reason: "OK".to_string(),
            version: 1,
            headers: Vec::new(),
            body: b"ok".to_vec(),
            truncated: false,
            start: ts,
            end: ts,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureConfig, CompiledFilters};

    fn compiled(mut f: impl FnMut(&mut CaptureConfig)) -> CompiledFilters {
        let mut cfg = CaptureConfig::default();
        f(&mut cfg);
        CompiledFilters::compile(&cfg).unwrap()
    }

    #[test]
    fn tee_forwards_to_both_sinks() {
        let left = Arc::new(Mutex::new(Vec::new()));
        let right = Arc::new(Mutex::new(Vec::new()));
        let mut tee = TeeCollector {
            first: Box::new(VecCollector::new(Arc::clone(&left))),
            second: Box::new(VecCollector::new(Arc::clone(&right))),
        };
        tee.process(sample_exchange("/a", "example.com"));
        assert!(tee.close().is_ok());
        assert_eq!(left.lock().unwrap().len(), 1);
        assert_eq!(right.lock().unwrap().len(), 1);
    }

    #[test]
    fn chain_applies_exclusions_and_counts() {
        let filters = compiled(|cfg| {
            cfg.path_exclusions = vec!["^/health$".to_string()];
        });
        let out = Arc::new(Mutex::new(Vec::new()));
        let prefilter = PacketCountSummary::new();
        let admitted = PacketCountSummary::new();
        let mut chain = build_chain(ChainConfig {
            interface: "eth0",
            filters: &filters,
            sample_rate: 1.0,
            rate_limit: None,
            prefilter: Some(Arc::clone(&prefilter)),
            admitted: Arc::clone(&admitted),
            self_traffic: None,
            sink: Box::new(VecCollector::new(Arc::clone(&out))),
        });

        chain.process(sample_exchange("/a", "example.com"));
        chain.process(sample_exchange("/health", "example.com"));
        chain.process(sample_exchange("/b", "example.com"));
        chain.close().unwrap();

        assert_eq!(out.lock().unwrap().len(), 2);
        assert_eq!(prefilter.total().http_requests, 3);
        assert_eq!(admitted.total().http_requests, 2);
    }

    #[test]
    fn allowlists_must_match() {
        let filters = compiled(|cfg| {
            cfg.host_allowlist = vec![r"api\.example\.com$".to_string()];
        });
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut chain = build_chain(ChainConfig {
            interface: "eth0",
            filters: &filters,
            sample_rate: 1.0,
            rate_limit: None,
            prefilter: None,
            admitted: PacketCountSummary::new(),
            self_traffic: None,
            sink: Box::new(VecCollector::new(Arc::clone(&out))),
        });

        chain.process(sample_exchange("/x", "api.example.com"));
        chain.process(sample_exchange("/x", "web.example.com"));
        chain.close().unwrap();

        let kept = out.lock().unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].host(), "api.example.com");
    }
}
