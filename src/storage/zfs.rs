//! ZFS command backend
//!
//! Drives `zfs(8)` for every storage operation. Error output is classified
//! into the storage error kinds so callers can tell a collision from a busy
//! dataset without parsing strings themselves.

use super::{Entry, StorageBackend};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use tracing::trace;

/// Storage backend for a live ZFS pool
#[derive(Debug, Default, Clone)]
pub struct Zfs;

impl Zfs {
    pub fn new() -> Self {
        Self
    }

    /// Run `zfs` and return stdout, classifying failures against `target`
    fn run(&self, args: &[&str], target: &str) -> Result<String> {
        trace!(args = ?args, "zfs");
        let output = Command::new("zfs")
            .args(args)
            .output()
            .map_err(|e| Error::Zfs(format!("Failed to run zfs {}: {}", args[0], e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify(target, args[0], stderr.trim()))
        }
    }

    fn with_properties(args: &mut Vec<String>, properties: &[(String, String)]) {
        for (key, value) in properties {
            args.push("-o".into());
            args.push(format!("{}={}", key, value));
        }
    }
}

/// Map zfs error output onto an error kind
fn classify(target: &str, verb: &str, stderr: &str) -> Error {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("already exists") {
        Error::AlreadyExists(target.to_string())
    } else if lower.contains("does not exist") || lower.contains("no such") {
        Error::NotFound(target.to_string())
    } else if lower.contains("out of space") || lower.contains("exceeds") {
        Error::CapacityExceeded {
            dataset: target.to_string(),
            requested: 0,
            available: 0,
        }
    } else if lower.contains("busy") {
        Error::Busy(target.to_string())
    } else if lower.contains("dependent clones") || lower.contains("has children") {
        Error::HasDependents {
            target: target.to_string(),
            dependents: Vec::new(),
        }
    } else if lower.contains("not a cloned filesystem") {
        Error::NoOriginPresent(target.to_string())
    } else {
        Error::Zfs(format!("zfs {} '{}': {}", verb, target, stderr))
    }
}

impl StorageBackend for Zfs {
    fn list(&self, root: &str) -> Result<Vec<Entry>> {
        let stdout = self.run(
            &[
                "list", "-H", "-p", "-r", "-t", "filesystem,snapshot", "-s", "createtxg", "-o",
                "name,origin,createtxg", root,
            ],
            root,
        )?;

        Ok(stdout
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split('\t').collect();
                if parts.len() < 3 {
                    return None;
                }
                Some(Entry {
                    name: parts[0].to_string(),
                    origin: match parts[1] {
                        "-" | "" => None,
                        o => Some(o.to_string()),
                    },
                    createtxg: parts[2].parse().unwrap_or(0),
                })
            })
            .collect())
    }

    fn create(&self, dataset: &str, properties: &[(String, String)]) -> Result<()> {
        let mut args: Vec<String> = vec!["create".into(), "-p".into()];
        Self::with_properties(&mut args, properties);
        args.push(dataset.into());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args, dataset).map(|_| ())
    }

    fn snapshot(&self, snapshot: &str) -> Result<()> {
        self.run(&["snapshot", snapshot], snapshot).map(|_| ())
    }

    fn clone_snapshot(&self, snapshot: &str, target: &str, properties: &[(String, String)]) -> Result<()> {
        let mut args: Vec<String> = vec!["clone".into()];
        Self::with_properties(&mut args, properties);
        args.push(snapshot.into());
        args.push(target.into());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args, target).map(|_| ())
    }

    fn promote(&self, dataset: &str) -> Result<()> {
        self.run(&["promote", dataset], dataset).map(|_| ())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.run(&["rename", from, to], from).map(|_| ())
    }

    fn destroy(&self, target: &str, recursive: bool) -> Result<()> {
        if recursive {
            self.run(&["destroy", "-r", target], target).map(|_| ())
        } else {
            self.run(&["destroy", target], target).map(|_| ())
        }
    }

    fn rollback(&self, snapshot: &str) -> Result<()> {
        self.run(&["rollback", "-r", snapshot], snapshot).map(|_| ())
    }

    fn get(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        let stdout = self.run(&["get", "-H", "-p", "-o", "value", property, dataset], dataset)?;
        let value = stdout.trim();
        if value.is_empty() || value == "-" {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    fn set(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        self.run(&["set", &format!("{}={}", property, value), dataset], dataset)
            .map(|_| ())
    }

    fn inherit(&self, dataset: &str, property: &str) -> Result<()> {
        self.run(&["inherit", property, dataset], dataset).map(|_| ())
    }

    fn user_properties(&self, dataset: &str, prefix: &str) -> Result<BTreeMap<String, String>> {
        let stdout = self.run(
            &["get", "-H", "-p", "-s", "local", "-o", "property,value", "all", dataset],
            dataset,
        )?;

        Ok(stdout
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect())
    }

    fn mount(&self, dataset: &str) -> Result<()> {
        self.run(&["mount", dataset], dataset).map(|_| ())
    }

    fn unmount(&self, dataset: &str, force: bool) -> Result<()> {
        if force {
            self.run(&["unmount", "-f", dataset], dataset).map(|_| ())
        } else {
            self.run(&["unmount", dataset], dataset).map(|_| ())
        }
    }

    fn is_mounted(&self, dataset: &str) -> Result<bool> {
        Ok(self.get(dataset, "mounted")?.as_deref() == Some("yes"))
    }

    fn mountpoint(&self, dataset: &str) -> Result<PathBuf> {
        match self.get(dataset, "mountpoint")? {
            Some(path) if path.starts_with('/') => Ok(PathBuf::from(path)),
            _ => Ok(PathBuf::from(format!("/{}", dataset))),
        }
    }

    fn available(&self, dataset: &str) -> Result<u64> {
        let value = self.get(dataset, "available")?.unwrap_or_default();
        value
            .parse()
            .map_err(|_| Error::Zfs(format!("Unexpected available value '{}' for '{}'", value, dataset)))
    }
}
