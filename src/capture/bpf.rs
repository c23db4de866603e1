//! BPF filter construction.
//!
//! Builds the per-interface tcpdump-syntax filter strings: the user's
//! filter, narrowed to exclude this process's own uploads to the ingest
//! endpoint, and optionally the filter's negation for diagnostic counting.
//! Every produced string is validated by compiling it against a dead pcap
//! handle before any capture opens.

use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};

use pcap::{Capture, Linktype};

use crate::capture::interfaces::InterfaceInfo;
use crate::error::Error;

/// Port this process's outbound ingest traffic uses.
const INGEST_PORT: u16 = 443;

/// Per-interface filter strings for both filter states.
#[derive(Debug, Default)]
pub struct BpfFilters {
    /// Traffic matching the user's filter; feeds the real pipelines.
    pub user: BTreeMap<String, String>,
    /// Traffic caught by the filter's complement; diagnostic counting only.
    pub negation: BTreeMap<String, String>,
}

impl BpfFilters {
    pub fn pipeline_count(&self) -> usize {
        self.user.len() + self.negation.len()
    }
}

/// Resolves the ingest domain to addresses for self-traffic exclusion.
///
/// Resolution failure is not fatal: capture still works, the exclusion
/// clause is simply absent.
pub fn resolve_ingest_addrs(domain: &str) -> Vec<IpAddr> {
    if domain.is_empty() {
        return Vec::new();
    }
    match (domain, INGEST_PORT).to_socket_addrs() {
        Ok(addrs) => {
            let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            ips.sort();
            ips.dedup();
            ips
        }
        Err(_) => Vec::new(),
    }
}

/// Builds and validates the user and negation filters for each interface.
///
/// The self-exclusion clause is dropped when `dogfood` is set, so the tool
/// can observe its own uploads. Negation filters exist only when a
/// non-empty user filter is present and negation capture was requested.
pub fn build_filters(
    interfaces: &BTreeMap<String, InterfaceInfo>,
    user_filter: &str,
    capture_negation: bool,
    dogfood: bool,
    ingest_addrs: &[IpAddr],
) -> Result<BpfFilters, Error> {
    let user_filter = user_filter.trim();
    let self_clause = if dogfood {
        None
    } else {
        self_exclusion_clause(ingest_addrs)
    };

    let mut filters = BpfFilters::default();
    for name in interfaces.keys() {
        let user = join_clauses(user_filter, self_clause.as_deref());
        validate(name, &user)?;
        filters.user.insert(name.clone(), user);

        if capture_negation && !user_filter.is_empty() {
            let negation = join_clauses(&format!("not ({})", user_filter), self_clause.as_deref());
            validate(name, &negation)?;
            filters.negation.insert(name.clone(), negation);
        }
    }
    Ok(filters)
}

/// `not (tcp port 443 and (host a or host b))` over the resolved addresses.
fn self_exclusion_clause(addrs: &[IpAddr]) -> Option<String> {
    if addrs.is_empty() {
        return None;
    }
    let hosts = addrs
        .iter()
        .map(|ip| format!("host {}", ip))
        .collect::<Vec<_>>()
        .join(" or ");
    Some(format!(
        "not (tcp port {} and ({}))",
        INGEST_PORT, hosts
    ))
}

fn join_clauses(primary: &str, exclusion: Option<&str>) -> String {
    match (primary.is_empty(), exclusion) {
        (true, None) => String::new(),
        (true, Some(excl)) => excl.to_string(),
        (false, None) => primary.to_string(),
        (false, Some(excl)) => format!("({}) and {}", primary, excl),
    }
}

/// Compiles `filter` against a dead handle to catch syntax errors before
/// any capture opens.
fn validate(interface: &str, filter: &str) -> Result<(), Error> {
    if filter.is_empty() {
        return Ok(());
    }
    #[allow(unused_mut)]
    let mut dead = Capture::dead(Linktype::ETHERNET).map_err(|e| Error::InvalidFilter {
        interface: interface.to_string(),
        reason: e.to_string(),
    })?;
    dead.compile(filter, true)
        .map(|_| ())
        .map_err(|e| Error::InvalidFilter {
            interface: interface.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn one_interface() -> BTreeMap<String, InterfaceInfo> {
        let mut map = BTreeMap::new();
        map.insert(
            "eth0".to_string(),
            InterfaceInfo {
                name: "eth0".to_string(),
                addrs: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))],
            },
        );
        map
    }

    fn ingest() -> Vec<IpAddr> {
        vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))]
    }

    #[test]
    fn combines_user_filter_with_self_exclusion() {
        let filters = build_filters(&one_interface(), "tcp port 80", false, false, &ingest()).unwrap();
        assert_eq!(
            filters.user["eth0"],
            "(tcp port 80) and not (tcp port 443 and (host 203.0.113.7))"
        );
        assert!(filters.negation.is_empty());
    }

    #[test]
    fn empty_user_filter_keeps_only_the_exclusion() {
        let filters = build_filters(&one_interface(), "", false, false, &ingest()).unwrap();
        assert_eq!(
            filters.user["eth0"],
            "not (tcp port 443 and (host 203.0.113.7))"
        );
    }

    #[test]
    fn dogfood_drops_the_self_exclusion() {
        let filters = build_filters(&one_interface(), "tcp port 80", false, true, &ingest()).unwrap();
        assert_eq!(filters.user["eth0"], "tcp port 80");
    }

    #[test]
    fn negation_requires_a_user_filter() {
        let without = build_filters(&one_interface(), "", true, true, &[]).unwrap();
        assert!(without.negation.is_empty());

        let with = build_filters(&one_interface(), "tcp port 80", true, true, &[]).unwrap();
        assert_eq!(with.negation["eth0"], "not (tcp port 80)");
    }

    #[test]
    fn negation_still_excludes_self_traffic() {
        let filters = build_filters(&one_interface(), "tcp port 80", true, false, &ingest()).unwrap();
        assert_eq!(
            filters.negation["eth0"],
            "(not (tcp port 80)) and not (tcp port 443 and (host 203.0.113.7))"
        );
    }

    #[test]
    fn invalid_filter_names_the_interface() {
        let err = build_filters(&one_interface(), "this is not bpf", false, true, &[]);
        match err {
            Err(Error::InvalidFilter { interface, .. }) => assert_eq!(interface, "eth0"),
            other => panic!("expected InvalidFilter, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn pipeline_count_covers_both_states() {
        let filters = build_filters(&one_interface(), "tcp", true, true, &[]).unwrap();
        assert_eq!(filters.pipeline_count(), 2);
    }
}
