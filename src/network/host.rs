//! Host network backend
//!
//! Drives `ifconfig(8)`, `jexec(8)`, `route(8)` and `dhclient(8)`; host
//! addresses come from `getifaddrs(3)`.

use super::{NetworkBackend, bridge, epair, ifconfig, jexec};
use crate::error::{Error, Result};
use ipnet::IpNet;
use nix::ifaddrs::getifaddrs;
use std::net::IpAddr;

/// Network backend for the running host
#[derive(Debug, Default, Clone)]
pub struct HostNetwork;

impl HostNetwork {
    pub fn new() -> Self {
        Self
    }
}

fn sockaddr_ip(addr: &nix::sys::socket::SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(v4.ip()));
    }
    addr.as_sockaddr_in6().map(|v6| IpAddr::V6(v6.ip()))
}

fn family(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "inet",
        IpNet::V6(_) => "inet6",
    }
}

impl NetworkBackend for HostNetwork {
    fn host_addresses(&self) -> Result<Vec<IpNet>> {
        let addrs = getifaddrs().map_err(|e| Error::Network(format!("getifaddrs: {}", e)))?;
        Ok(addrs
            .filter_map(|ifa| {
                let ip = ifa.address.as_ref().and_then(sockaddr_ip)?;
                // BSD may hand back a netmask without an address family
                match ifa.netmask.as_ref().and_then(sockaddr_ip) {
                    Some(mask) => IpNet::with_netmask(ip, mask).ok(),
                    None => Some(IpNet::from(ip)),
                }
            })
            .collect())
    }

    fn create_epair(&self, jail: &str, nic: &str) -> Result<(String, String)> {
        epair::create_for_jail(jail, nic)
    }

    fn set_mac(&self, iface: &str, mac: &str) -> Result<()> {
        epair::set_mac(iface, mac)
    }

    fn ensure_bridge(&self, bridge: &str, create: bool) -> Result<()> {
        bridge::ensure(bridge, create)
    }

    fn bridge_add(&self, bridge: &str, member: &str) -> Result<()> {
        bridge::add_member(bridge, member)
    }

    fn bridge_remove(&self, bridge: &str, member: &str) -> Result<()> {
        bridge::remove_member(bridge, member)
    }

    fn up(&self, iface: &str) -> Result<()> {
        ifconfig(&[iface, "up"]).map(|_| ())
    }

    fn move_to_jail(&self, iface: &str, jid: i32) -> Result<()> {
        epair::move_to_jail(iface, jid)
    }

    fn add_alias(&self, iface: &str, addr: IpAddr) -> Result<()> {
        let net = IpNet::from(addr);
        ifconfig(&[iface, family(&net), &net.to_string(), "alias"]).map(|_| ())
    }

    fn remove_alias(&self, iface: &str, addr: IpAddr) -> Result<()> {
        let net = IpNet::from(addr);
        match ifconfig(&[iface, family(&net), &addr.to_string(), "-alias"]) {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { message, .. }) if message.contains("Can't assign requested address") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn configure_address(&self, jid: i32, iface: &str, net: &IpNet) -> Result<()> {
        jexec(jid, &["ifconfig", iface, family(net), &net.to_string(), "alias"])?;
        jexec(jid, &["ifconfig", iface, "up"]).map(|_| ())
    }

    fn start_dhcp(&self, jid: i32, iface: &str) -> Result<()> {
        jexec(jid, &["ifconfig", iface, "up"])?;
        jexec(jid, &["dhclient", "-b", iface]).map(|_| ())
    }

    fn default_route(&self, jid: i32, gateway: IpAddr) -> Result<()> {
        let gw = gateway.to_string();
        let args: Vec<&str> = match gateway {
            IpAddr::V4(_) => vec!["route", "-q", "add", "default", &gw],
            IpAddr::V6(_) => vec!["route", "-q", "add", "-inet6", "default", &gw],
        };
        match jexec(jid, &args) {
            Ok(_) => Ok(()),
            // Route already present
            Err(Error::CommandFailed { message, .. }) if message.contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn destroy(&self, iface: &str) -> Result<()> {
        epair::destroy(iface)
    }
}
