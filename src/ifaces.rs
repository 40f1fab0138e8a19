// Host network interface discovery for capture matching and the init endpoint

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A host interface with the addresses we care about.
///
/// Only the last IPv4 and IPv6 address reported for the interface are kept,
/// which is enough to decide whether a captured packet is local.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
}

/// Which address families to include when listing interfaces.
#[derive(Debug, Clone, Copy)]
pub struct AddressFilter {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl Default for AddressFilter {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
        }
    }
}

/// Enumerate host interfaces, excluding point-to-point links.
///
/// An interface that ends up with neither address after filtering is dropped
/// from the result.
pub fn list_interfaces(filter: &AddressFilter) -> Vec<NetworkInterface> {
    pnet_datalink::interfaces()
        .into_iter()
        .filter_map(|iface| from_datalink(&iface, filter))
        .collect()
}

fn from_datalink(
    iface: &pnet_datalink::NetworkInterface,
    filter: &AddressFilter,
) -> Option<NetworkInterface> {
    if iface.is_point_to_point() {
        return None;
    }

    let mut target = NetworkInterface {
        name: iface.name.clone(),
        ipv4: None,
        ipv6: None,
    };
    for network in &iface.ips {
        match network.ip() {
            IpAddr::V4(addr) if filter.ipv4 => target.ipv4 = Some(addr),
            IpAddr::V6(addr) if filter.ipv6 => target.ipv6 = Some(addr),
            _ => {}
        }
    }

    if target.ipv4.is_none() && target.ipv6.is_none() {
        return None;
    }
    Some(target)
}
