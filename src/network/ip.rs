//! Address declarations and the address book
//!
//! Addresses are declared per interface as `nic|addr/prefix` or `nic|dhcp`.
//! The address book records which jail holds which address so two jails can
//! never be bound to the same one.

use crate::error::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

/// How an interface gets its address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "address")]
pub enum Assignment {
    Static(IpNet),
    Dhcp,
}

/// One address declared on a jail interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpec {
    pub interface: String,
    pub assignment: Assignment,
}

impl AddressSpec {
    pub fn fixed(interface: impl Into<String>, net: IpNet) -> Self {
        Self {
            interface: interface.into(),
            assignment: Assignment::Static(net),
        }
    }

    pub fn dhcp(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            assignment: Assignment::Dhcp,
        }
    }

    /// Parse `nic|10.0.0.5/24`, `nic|dhcp` or a bare address on `default_nic`
    ///
    /// A bare host address without a prefix gets a host route prefix.
    pub fn parse(input: &str, default_nic: &str) -> Result<Self> {
        let (nic, addr) = match input.split_once('|') {
            Some((nic, addr)) => (nic.trim(), addr.trim()),
            None => (default_nic, input.trim()),
        };
        if nic.is_empty() {
            return Err(Error::Network(format!("missing interface in '{}'", input)));
        }

        if addr.eq_ignore_ascii_case("dhcp") {
            return Ok(Self::dhcp(nic));
        }

        let net = match addr.parse::<IpNet>() {
            Ok(net) => net,
            Err(_) => addr
                .parse::<IpAddr>()
                .map(IpNet::from)
                .map_err(|_| Error::Network(format!("invalid address '{}'", input)))?,
        };
        Ok(Self::fixed(nic, net))
    }

    /// Statically assigned address, if any
    pub fn address(&self) -> Option<IpAddr> {
        match self.assignment {
            Assignment::Static(net) => Some(net.addr()),
            Assignment::Dhcp => None,
        }
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.assignment {
            Assignment::Static(net) => write!(f, "{}|{}", self.interface, net),
            Assignment::Dhcp => write!(f, "{}|dhcp", self.interface),
        }
    }
}

/// Process-wide registry of bound addresses
#[derive(Debug, Default)]
pub struct AddressBook {
    bound: Mutex<HashMap<IpAddr, String>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every address to `jail`, or none of them
    pub fn reserve(&self, jail: &str, addrs: &[IpAddr]) -> Result<()> {
        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);

        for addr in addrs {
            if let Some(holder) = bound.get(addr) {
                if holder != jail {
                    return Err(Error::AddressConflict {
                        address: addr.to_string(),
                        holder: holder.clone(),
                    });
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        for addr in addrs {
            if !seen.insert(addr) {
                return Err(Error::AddressConflict {
                    address: addr.to_string(),
                    holder: jail.to_string(),
                });
            }
        }

        for addr in addrs {
            bound.insert(*addr, jail.to_string());
        }
        Ok(())
    }

    /// Release everything bound to `jail`
    pub fn release(&self, jail: &str) {
        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        bound.retain(|_, holder| holder != jail);
    }

    pub fn holder(&self, addr: &IpAddr) -> Option<String> {
        let bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        bound.get(addr).cloned()
    }
}
