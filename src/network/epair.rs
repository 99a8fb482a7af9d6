//! Epair interface management for VNET jails
//!
//! Epairs are virtual Ethernet pairs. One end stays on the host (and joins a
//! bridge), the other is moved into the jail's VNET.

use super::ifconfig;
use crate::error::{Error, Result};

/// Create an epair and rename both ends after the jail and nic
///
/// Returns `(host_side, jail_side)`, e.g. `("e0a_web1", "e0b_web1")`.
pub fn create_for_jail(jail: &str, nic: &str) -> Result<(String, String)> {
    let created = ifconfig(&["epair", "create"])
        .map_err(|e| Error::InterfaceExhausted(format!("epair create: {}", e)))?;
    let host_side = created.trim().to_string();
    let (jail_side, new_host, new_jail) = match renamed(&host_side, jail, nic) {
        Ok(names) => names,
        Err(e) => {
            let _ = destroy(&host_side);
            return Err(e);
        }
    };

    if let Err(e) = ifconfig(&[&host_side, "name", &new_host]) {
        let _ = destroy(&host_side);
        return Err(e);
    }
    if let Err(e) = ifconfig(&[&jail_side, "name", &new_jail]) {
        let _ = destroy(&new_host);
        return Err(e);
    }

    Ok((new_host, new_jail))
}

/// Set the MAC address of one end
pub fn set_mac(iface: &str, mac: &str) -> Result<()> {
    ifconfig(&[iface, "ether", mac]).map(|_| ())
}

/// Move an interface into a VNET jail
pub fn move_to_jail(iface: &str, jid: i32) -> Result<()> {
    ifconfig(&[iface, "vnet", &jid.to_string()]).map(|_| ())
}

/// Destroy an epair; destroying either end destroys both
///
/// An interface that is already gone is not an error.
pub fn destroy(iface: &str) -> Result<()> {
    match ifconfig(&[iface, "destroy"]) {
        Ok(_) => Ok(()),
        Err(Error::CommandFailed { message, .. }) if message.contains("does not exist") => Ok(()),
        Err(e) => Err(e),
    }
}

/// Kernel jail-side name and the two new names for a fresh epair
///
/// The new names reuse the kernel's unit number, which stays allocated until
/// the pair is destroyed, so concurrent processes never pick the same name.
fn renamed(host_side: &str, jail: &str, nic: &str) -> Result<(String, String, String)> {
    let unit = host_side
        .strip_prefix("epair")
        .and_then(|s| s.strip_suffix('a'))
        .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| Error::Network(format!("Unexpected epair name format: {}", host_side)))?;
    let tag = sanitize_name(jail, nic);
    Ok((
        format!("epair{}b", unit),
        format!("e{}a_{}", unit, tag),
        format!("e{}b_{}", unit, tag),
    ))
}

/// Build the interface name suffix from jail and nic
///
/// Interface names have a max length of 15 characters on FreeBSD.
fn sanitize_name(jail: &str, nic: &str) -> String {
    let index: String = nic.chars().filter(|c| c.is_ascii_digit()).collect();
    let sanitized: String = jail
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(8)
        .collect();

    let base = if sanitized.is_empty() {
        "jail".to_string()
    } else {
        sanitized
    };
    format!("{}{}", base, index)
}
