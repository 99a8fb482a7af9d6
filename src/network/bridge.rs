//! if_bridge membership
//!
//! Bridges are addressed by name. A missing bridge is created on demand when
//! the configuration allows it.

use super::ifconfig;
use crate::error::{Error, Result};

/// Check whether an interface exists on the host
pub fn exists(bridge: &str) -> bool {
    ifconfig(&[bridge]).is_ok()
}

/// Create a bridge with a fixed name and bring it up
pub fn create(bridge: &str) -> Result<()> {
    let created = ifconfig(&["bridge", "create"])?;
    let created = created.trim();
    if created != bridge {
        if let Err(e) = ifconfig(&[created, "name", bridge]) {
            let _ = ifconfig(&[created, "destroy"]);
            return Err(e);
        }
    }
    ifconfig(&[bridge, "up"]).map(|_| ())
}

/// Ensure the bridge exists, creating it if allowed
pub fn ensure(bridge: &str, create_missing: bool) -> Result<()> {
    if exists(bridge) {
        return Ok(());
    }
    if !create_missing {
        return Err(Error::Network(format!("Bridge '{}' does not exist", bridge)));
    }
    create(bridge)
}

/// Add a member interface
pub fn add_member(bridge: &str, member: &str) -> Result<()> {
    ifconfig(&[bridge, "addm", member]).map(|_| ())
}

/// Remove a member interface
pub fn remove_member(bridge: &str, member: &str) -> Result<()> {
    ifconfig(&[bridge, "deletem", member]).map(|_| ())
}
