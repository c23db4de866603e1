//! Exchange filtering stages.
//!
//! Exclusions drop an exchange when any regex matches; allowlists require
//! at least one match. Hosts are matched against the Host header when
//! present, the server address otherwise. The self-traffic stage keeps the
//! capture from witnessing its own uploads.

use std::net::IpAddr;

use regex::Regex;

use crate::collect::Collector;
use crate::error::Error;
use crate::sniff::types::Exchange;

// ── Path and host filters ────────────────────────────────────────────────────

macro_rules! regex_stage {
    ($name:ident, $field:ident, $keep:expr) => {
        pub struct $name {
            regexes: Vec<Regex>,
            next: Box<dyn Collector>,
        }

        impl $name {
            pub fn new(regexes: &[Regex], next: Box<dyn Collector>) -> Self {
                Self {
                    regexes: regexes.to_vec(),
                    next,
                }
            }
        }

        impl Collector for $name {
            fn process(&mut self, exchange: Exchange) {
                let subject = $field(&exchange);
                let matched = self.regexes.iter().any(|r| r.is_match(&subject));
                let keep: fn(bool) -> bool = $keep;
                if keep(matched) {
                    self.next.process(exchange);
                }
            }

            fn close(&mut self) -> Result<(), Error> {
                self.next.close()
            }
        }
    };
}

fn path_of(exchange: &Exchange) -> String {
    exchange.request.path.clone()
}

fn host_of(exchange: &Exchange) -> String {
    exchange.host()
}

regex_stage!(PathExcludeCollector, path_of, |matched| !matched);
regex_stage!(HostExcludeCollector, host_of, |matched| !matched);
regex_stage!(PathAllowCollector, path_of, |matched| matched);
regex_stage!(HostAllowCollector, host_of, |matched| matched);

// ── Self-traffic suppression ─────────────────────────────────────────────────

/// Identifies this process's own traffic to the ingest endpoint.
#[derive(Debug, Clone)]
pub struct SelfTrafficMatcher {
    pub ingest_host: String,
    pub ingest_addrs: Vec<IpAddr>,
}

impl SelfTrafficMatcher {
    fn matches(&self, exchange: &Exchange) -> bool {
        if !self.ingest_host.is_empty() {
            if let Some(host) = &exchange.request.host {
                // Host headers may carry a port suffix.
                let bare = host.split(':').next().unwrap_or(host);
                if bare.eq_ignore_ascii_case(&self.ingest_host) {
                    return true;
                }
            }
        }
        self.ingest_addrs.contains(&exchange.flow.server.ip)
    }
}

/// Drops exchanges destined for the ingest endpoint. Skipped entirely in
/// dogfood mode.
pub struct SelfTrafficCollector {
    matcher: SelfTrafficMatcher,
    next: Box<dyn Collector>,
}

impl SelfTrafficCollector {
    pub fn new(matcher: SelfTrafficMatcher, next: Box<dyn Collector>) -> Self {
        Self { matcher, next }
    }
}

impl Collector for SelfTrafficCollector {
    fn process(&mut self, exchange: Exchange) {
        if !self.matcher.matches(&exchange) {
            self.next.process(exchange);
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.next.close()
    }
}
