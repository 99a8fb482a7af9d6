//! Network configuration for jails
//!
//! Three modes:
//! - `none`: no network access
//! - `shared`: the jail uses the host stack; each address is aliased onto the
//!   named host interface and handed to jail(2) as `ip4.addr`/`ip6.addr`
//! - `isolated`: the jail gets its own VNET stack, fed by epair interfaces
//!   whose host side joins a bridge
//!
//! Attaching records every created interface in the returned
//! [`NetworkBinding`] as soon as it exists. Detaching is best effort and never
//! fails; failures are logged and counted.

pub mod bridge;
pub mod epair;
pub mod host;
pub mod ip;

use crate::error::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use host::HostNetwork;
pub use ip::{AddressBook, AddressSpec, Assignment};

/// How a jail reaches the network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    None,
    Shared,
    Isolated,
}

impl FromStr for NetworkMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "off" => Ok(NetworkMode::None),
            "shared" => Ok(NetworkMode::Shared),
            "isolated" | "vnet" | "on" => Ok(NetworkMode::Isolated),
            other => Err(Error::InvalidProperty {
                key: "vnet".into(),
                reason: format!("unknown network mode '{}'", other),
            }),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkMode::None => "none",
            NetworkMode::Shared => "shared",
            NetworkMode::Isolated => "isolated",
        };
        f.write_str(s)
    }
}

/// A VNET interface declared on a jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Name inside the jail, e.g. `vnet0`
    pub name: String,
    /// Host bridge the outer end joins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

impl InterfaceSpec {
    /// Parse `vnet0:bridge0` or `vnet0`
    pub fn parse(input: &str) -> Result<Self> {
        let (name, bridge) = match input.split_once(':') {
            Some((name, bridge)) => (name.trim(), Some(bridge.trim())),
            None => (input.trim(), None),
        };
        if name.is_empty() || name.len() > 15 {
            return Err(Error::Network(format!("invalid interface '{}'", input)));
        }
        Ok(Self {
            name: name.to_string(),
            bridge: bridge.filter(|b| !b.is_empty() && *b != "none").map(str::to_string),
        })
    }
}

impl fmt::Display for InterfaceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bridge {
            Some(bridge) => write!(f, "{}:{}", self.name, bridge),
            None => f.write_str(&self.name),
        }
    }
}

/// Network declaration of a jail
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
    #[serde(default)]
    pub addresses: Vec<AddressSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_router: Option<IpAddr>,
}

impl NetworkSpec {
    /// Isolated stack with one interface on `bridge`
    pub fn isolated(bridge: &str) -> Self {
        Self {
            mode: NetworkMode::Isolated,
            interfaces: vec![InterfaceSpec {
                name: "vnet0".into(),
                bridge: Some(bridge.to_string()),
            }],
            ..Default::default()
        }
    }

    /// Static addresses in declaration order
    pub fn static_addresses(&self) -> Vec<IpAddr> {
        self.addresses.iter().filter_map(AddressSpec::address).collect()
    }

    /// Check the declaration is coherent for its mode
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            NetworkMode::None => {
                if !self.addresses.is_empty() {
                    return Err(Error::Network("addresses declared without a network mode".into()));
                }
            }
            NetworkMode::Shared => {
                if self.addresses.iter().any(|a| a.assignment == Assignment::Dhcp) {
                    return Err(Error::Network("dhcp requires an isolated stack".into()));
                }
            }
            NetworkMode::Isolated => {
                if self.interfaces.is_empty() {
                    return Err(Error::Network("isolated stack without interfaces".into()));
                }
                for addr in &self.addresses {
                    if !self.interfaces.iter().any(|i| i.name == addr.interface) {
                        return Err(Error::Network(format!(
                            "address {} names undeclared interface '{}'",
                            addr, addr.interface
                        )));
                    }
                }
            }
        }

        let statics = self.static_addresses();
        for (i, addr) in statics.iter().enumerate() {
            if statics[..i].contains(addr) {
                return Err(Error::AddressConflict {
                    address: addr.to_string(),
                    holder: "same jail".into(),
                });
            }
        }
        Ok(())
    }
}

/// An epair created for a jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundInterface {
    pub nic: String,
    pub host_side: String,
    pub jail_side: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

/// A host interface alias added for a shared-stack jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAlias {
    pub interface: String,
    pub address: IpAddr,
}

/// Network resources held by a running jail
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub jail: String,
    pub mode: NetworkMode,
    pub interfaces: Vec<BoundInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<HostAlias>,
    pub addresses: Vec<IpAddr>,
}

/// Host network operations the configurator relies on
pub trait NetworkBackend: Send + Sync {
    /// Addresses configured on host interfaces, with their prefixes
    fn host_addresses(&self) -> Result<Vec<IpNet>>;
    /// Create an epair for `jail`, returning `(host_side, jail_side)`
    fn create_epair(&self, jail: &str, nic: &str) -> Result<(String, String)>;
    fn set_mac(&self, iface: &str, mac: &str) -> Result<()>;
    fn ensure_bridge(&self, bridge: &str, create: bool) -> Result<()>;
    fn bridge_add(&self, bridge: &str, member: &str) -> Result<()>;
    fn bridge_remove(&self, bridge: &str, member: &str) -> Result<()>;
    fn up(&self, iface: &str) -> Result<()>;
    fn move_to_jail(&self, iface: &str, jid: i32) -> Result<()>;
    /// Add a host-route alias for `addr` on a host interface
    fn add_alias(&self, iface: &str, addr: IpAddr) -> Result<()>;
    fn remove_alias(&self, iface: &str, addr: IpAddr) -> Result<()>;
    fn configure_address(&self, jid: i32, iface: &str, net: &IpNet) -> Result<()>;
    fn start_dhcp(&self, jid: i32, iface: &str) -> Result<()>;
    fn default_route(&self, jid: i32, gateway: IpAddr) -> Result<()>;
    fn destroy(&self, iface: &str) -> Result<()>;
}

/// Run ifconfig on the host
pub(crate) fn ifconfig(args: &[&str]) -> Result<String> {
    run("ifconfig", args)
}

/// Run a command inside a jail
pub(crate) fn jexec(jid: i32, args: &[&str]) -> Result<String> {
    let jid = jid.to_string();
    let mut full: Vec<&str> = vec![&jid];
    full.extend_from_slice(args);
    run("jexec", &full)
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Network(format!("Failed to run {}: {}", program, e)))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(Error::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Deterministic MAC pair for a jail interface
///
/// The host side is the 3-byte prefix followed by 3 bytes of a SHA-256 over
/// jail and nic; the jail side is the host side plus one.
pub fn mac_pair(prefix: &str, jail: &str, nic: &str) -> Result<(String, String)> {
    if prefix.len() != 6 || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::ConfigValidation(format!("invalid MAC prefix '{}'", prefix)));
    }
    let digest = Sha256::digest(format!("{}{}", jail, nic).as_bytes());
    let hash = hex::encode(digest);

    let host = format!("{}{}", prefix.to_ascii_lowercase(), &hash[..6]);
    let value = u64::from_str_radix(&host, 16)
        .map_err(|e| Error::Network(format!("MAC derivation failed: {}", e)))?;
    let peer = format!("{:012x}", peer_mac(value));

    Ok((colonize(&host), colonize(&peer)))
}

/// The jail side's MAC: the host side's plus one, wrapping inside the device bytes
fn peer_mac(value: u64) -> u64 {
    (value & !0xff_ffff) | ((value + 1) & 0xff_ffff)
}

fn colonize(hex: &str) -> String {
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Applies network declarations to jails
pub struct NetworkConfigurator {
    backend: Arc<dyn NetworkBackend>,
    book: AddressBook,
    mac_prefix: String,
    create_bridges: bool,
}

impl NetworkConfigurator {
    pub fn new(backend: Arc<dyn NetworkBackend>, mac_prefix: impl Into<String>, create_bridges: bool) -> Self {
        Self {
            backend,
            book: AddressBook::new(),
            mac_prefix: mac_prefix.into(),
            create_bridges,
        }
    }

    /// Check a declaration against the host and other jails without binding
    pub fn check(&self, jail: &str, spec: &NetworkSpec) -> Result<()> {
        spec.validate()?;
        if spec.mode == NetworkMode::None {
            return Ok(());
        }

        let host = self.backend.host_addresses()?;
        for addr in spec.static_addresses() {
            if let Some(holder) = self.book.holder(&addr) {
                if holder != jail {
                    return Err(Error::AddressConflict {
                        address: addr.to_string(),
                        holder,
                    });
                }
            }
            if host.iter().any(|net| net.addr() == addr) {
                return Err(Error::AddressConflict {
                    address: addr.to_string(),
                    holder: "host".into(),
                });
            }
            if spec.mode == NetworkMode::Shared && !host.iter().any(|net| net.contains(&addr)) {
                return Err(Error::AddressUnreachable(addr.to_string()));
            }
        }
        Ok(())
    }

    /// Bring up the declared network for a created kernel jail
    pub fn attach(&self, jail: &str, jid: i32, spec: &NetworkSpec) -> Result<NetworkBinding> {
        self.check(jail, spec)?;
        let addresses = spec.static_addresses();
        self.book.reserve(jail, &addresses)?;

        let mut binding = NetworkBinding {
            jail: jail.to_string(),
            mode: spec.mode,
            interfaces: Vec::new(),
            aliases: Vec::new(),
            addresses,
        };

        let wired = match spec.mode {
            NetworkMode::Isolated => self.plumb(jid, spec, &mut binding),
            NetworkMode::Shared => self.alias(spec, &mut binding),
            NetworkMode::None => Ok(()),
        };
        if let Err(e) = wired {
            warn!(jail = %jail, error = %e, "network attach failed, undoing");
            self.detach(&binding);
            return Err(e);
        }

        info!(
            jail = %jail,
            mode = %spec.mode,
            interfaces = binding.interfaces.len(),
            "network attached"
        );
        Ok(binding)
    }

    fn plumb(&self, jid: i32, spec: &NetworkSpec, binding: &mut NetworkBinding) -> Result<()> {
        for iface in &spec.interfaces {
            let (host_side, jail_side) = self.backend.create_epair(&binding.jail, &iface.name)?;
            binding.interfaces.push(BoundInterface {
                nic: iface.name.clone(),
                host_side: host_side.clone(),
                jail_side: jail_side.clone(),
                bridge: None,
            });

            let (mac_host, mac_jail) = mac_pair(&self.mac_prefix, &binding.jail, &iface.name)?;
            self.backend.set_mac(&host_side, &mac_host)?;
            self.backend.set_mac(&jail_side, &mac_jail)?;

            if let Some(bridge) = &iface.bridge {
                self.backend.ensure_bridge(bridge, self.create_bridges)?;
                self.backend.bridge_add(bridge, &host_side)?;
                if let Some(last) = binding.interfaces.last_mut() {
                    last.bridge = Some(bridge.clone());
                }
            }
            self.backend.up(&host_side)?;
            self.backend.move_to_jail(&jail_side, jid)?;
            debug!(jail = %binding.jail, host = %host_side, peer = %jail_side, "epair plumbed");

            for addr in spec.addresses.iter().filter(|a| a.interface == iface.name) {
                match addr.assignment {
                    Assignment::Static(net) => self.backend.configure_address(jid, &jail_side, &net)?,
                    Assignment::Dhcp => self.backend.start_dhcp(jid, &jail_side)?,
                }
            }
        }

        if let Some(gateway) = spec.default_router {
            self.backend.default_route(jid, gateway)?;
        }
        Ok(())
    }

    /// Alias every shared-stack address onto its host interface
    fn alias(&self, spec: &NetworkSpec, binding: &mut NetworkBinding) -> Result<()> {
        for addr in &spec.addresses {
            let Some(address) = addr.address() else {
                continue;
            };
            self.backend.add_alias(&addr.interface, address)?;
            binding.aliases.push(HostAlias {
                interface: addr.interface.clone(),
                address,
            });
            debug!(jail = %binding.jail, iface = %addr.interface, %address, "host alias added");
        }
        Ok(())
    }

    /// Tear down a binding; returns the number of steps that failed
    pub fn detach(&self, binding: &NetworkBinding) -> usize {
        let mut failures = 0;
        for alias in binding.aliases.iter().rev() {
            if let Err(e) = self.backend.remove_alias(&alias.interface, alias.address) {
                warn!(jail = %binding.jail, iface = %alias.interface, address = %alias.address, error = %e, "alias removal failed");
                failures += 1;
            }
        }
        for iface in binding.interfaces.iter().rev() {
            if let Some(bridge) = &iface.bridge {
                if let Err(e) = self.backend.bridge_remove(bridge, &iface.host_side) {
                    warn!(jail = %binding.jail, bridge = %bridge, iface = %iface.host_side, error = %e, "bridge removal failed");
                    failures += 1;
                }
            }
            if let Err(e) = self.backend.destroy(&iface.host_side) {
                warn!(jail = %binding.jail, iface = %iface.host_side, error = %e, "interface destroy failed");
                failures += 1;
            }
        }
        self.book.release(&binding.jail);
        debug!(jail = %binding.jail, failures, "network detached");
        failures
    }

    /// Re-register addresses of a binding adopted after a restart
    pub fn adopt(&self, binding: &NetworkBinding) -> Result<()> {
        self.book.reserve(&binding.jail, &binding.addresses)
    }
}
