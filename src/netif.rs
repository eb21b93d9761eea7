//! Interface lookup helpers shared by the load generator and the API.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use pnet::datalink::{self, NetworkInterface};
use pnet::ipnetwork::IpNetwork;
use serde::Serialize;

/// Look up an OS interface by name.
pub fn find_interface(name: &str) -> Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .with_context(|| format!("interface {} not found", name))
}

/// First non-loopback IPv4 address of an interface; this is the source
/// address workers bind when the interface is named explicitly.
pub fn first_ipv4(iface: &NetworkInterface) -> Result<Ipv4Addr> {
    iface
        .ips
        .iter()
        .find_map(|net| match net {
            IpNetwork::V4(v4) if !v4.ip().is_loopback() => Some(v4.ip()),
            _ => None,
        })
        .with_context(|| format!("no usable IPv4 address on interface {}", iface.name))
}

/// Interface description served to UI interface pickers.
#[derive(Debug, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub mac: Option<String>,
    pub ipv4: Vec<String>,
    pub is_up: bool,
    pub is_loopback: bool,
}

/// Enumerate the host's interfaces.
pub fn list_interfaces() -> Vec<InterfaceInfo> {
    datalink::interfaces()
        .into_iter()
        .map(|iface| InterfaceInfo {
            mac: iface.mac.map(|m| m.to_string()),
            ipv4: iface
                .ips
                .iter()
                .filter_map(|net| match net {
                    IpNetwork::V4(v4) => Some(v4.ip().to_string()),
                    _ => None,
                })
                .collect(),
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
            name: iface.name,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_errors() {
        let err = find_interface("wattbench-does-not-exist").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_list_includes_loopback() {
        // Every test host has at least a loopback device.
        let interfaces = list_interfaces();
        assert!(!interfaces.is_empty());
        assert!(interfaces.iter().any(|i| i.is_loopback));
    }
}
