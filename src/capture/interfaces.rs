//! Network interface enumeration.
//!
//! Expands the user's interface list (possibly empty, meaning "all") into
//! concrete capture targets. Only interfaces that are up, not loopback, and
//! carry a link-layer address are eligible for automatic selection;
//! explicitly requested interfaces are taken as given so loopback captures
//! stay possible when asked for by name.

use std::collections::BTreeMap;
use std::net::IpAddr;

use pnet::datalink;

use crate::error::Error;

/// A capture target and its local addresses.
///
/// Created at start-up and immutable afterwards. The addresses feed the
/// BPF compiler's self-traffic exclusion.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub addrs: Vec<IpAddr>,
}

/// Resolves the requested interface names into capture targets.
///
/// An empty request list selects every eligible interface. The result is
/// ordered by name so pipelines start deterministically.
pub fn eligible_interfaces(requested: &[String]) -> Result<BTreeMap<String, InterfaceInfo>, Error> {
    let all = datalink::interfaces();
    let mut selected = BTreeMap::new();

    if requested.is_empty() {
        for iface in &all {
            if iface.is_up() && !iface.is_loopback() && iface.mac.is_some() {
                selected.insert(iface.name.clone(), info_of(iface));
            }
        }
    } else {
        for name in requested {
            let iface = all
                .iter()
                .find(|i| &i.name == name)
                .ok_or_else(|| Error::UnknownInterface(name.clone()))?;
            selected.insert(iface.name.clone(), info_of(iface));
        }
    }

    if selected.is_empty() {
        return Err(Error::NoInterfaces);
    }
    Ok(selected)
}

fn info_of(iface: &datalink::NetworkInterface) -> InterfaceInfo {
    InterfaceInfo {
        name: iface.name.clone(),
        addrs: iface.ips.iter().map(|net| net.ip()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_rejected() {
        let err = eligible_interfaces(&["definitely-not-a-real-interface-0".to_string()]);
        assert!(matches!(err, Err(Error::UnknownInterface(_))));
    }
}
