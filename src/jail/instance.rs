//! Runtime instance of a running jail
//!
//! An instance exists only while a jail is Running or Stopping. It records
//! every resource acquired during start, in acquisition order, and is written
//! to `<state_dir>/<id>.json` after every change so a restarted engine can
//! find and release what a crashed one left behind.
//!
//! `<state_dir>/<id>.lock` carries an advisory lock held by whichever process
//! is driving that jail, so a second process never releases a record whose
//! transition is still in flight.

use crate::bulkhead::AppliedRuleSet;
use crate::error::{Error, Result};
use crate::network::NetworkBinding;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A resource held by a running jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "lowercase")]
pub enum Resource {
    /// Dataset mounted for the jail root
    Mount { dataset: String },
    /// devfs mounted below the jail root
    Devfs { root: PathBuf },
    /// Kernel jail
    Kernel { jid: i32, name: String },
    Network(NetworkBinding),
    Limits(AppliedRuleSet),
}

/// Runtime counterpart of a jail spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailInstance {
    pub id: String,
    /// Kernel jail name, `brig-<id>`
    pub kernel_name: String,
    pub dataset: String,
    #[serde(default)]
    pub jid: Option<i32>,
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
    /// Acquired resources, oldest first
    #[serde(default)]
    pub acquired: Vec<Resource>,
}

impl JailInstance {
    pub fn new(id: &str, dataset: &str) -> Self {
        Self {
            id: id.to_string(),
            kernel_name: kernel_name(id),
            dataset: dataset.to_string(),
            jid: None,
            mountpoint: None,
            acquired: Vec::new(),
        }
    }

    /// Record an acquired resource
    pub fn push(&mut self, resource: Resource) {
        if let Resource::Kernel { jid, .. } = &resource {
            self.jid = Some(*jid);
        }
        self.acquired.push(resource);
    }

    /// Take the most recently acquired resource
    pub fn pop(&mut self) -> Option<Resource> {
        let resource = self.acquired.pop();
        if let Some(Resource::Kernel { .. }) = &resource {
            self.jid = None;
        }
        resource
    }

    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty()
    }

    fn record_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{}.json", id))
    }

    /// Write the runtime record
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = Self::record_path(dir, &self.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Remove the runtime record; a missing record is not an error
    pub fn discard(dir: &Path, id: &str) -> Result<()> {
        match fs::remove_file(Self::record_path(dir, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Load one jail's runtime record, if any
    pub fn load(dir: &Path, id: &str) -> Result<Option<JailInstance>> {
        match fs::read(Self::record_path(dir, id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Load every runtime record in `dir`
    ///
    /// Unreadable records are logged and skipped.
    pub fn load_all(dir: &Path) -> Result<Vec<JailInstance>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice::<JailInstance>(&bytes).map_err(Error::from))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable runtime record"),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// Exclusive advisory lock over one jail's runtime record
///
/// Released when dropped. The lock file itself is left in place.
#[derive(Debug)]
pub struct RecordLock {
    _file: Flock<File>,
}

impl RecordLock {
    fn open(dir: &Path, id: &str) -> Result<File> {
        fs::create_dir_all(dir)?;
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(format!("{}.lock", id)))?)
    }

    /// Block until the lock is ours
    pub fn acquire(dir: &Path, id: &str) -> Result<Self> {
        let file = Self::open(dir, id)?;
        let locked = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::Io(std::io::Error::from(errno)))?;
        debug!(jail = %id, "record lock taken");
        Ok(Self { _file: locked })
    }

    /// Take the lock unless another holder has it
    pub fn try_acquire(dir: &Path, id: &str) -> Result<Option<Self>> {
        let file = Self::open(dir, id)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => Ok(Some(Self { _file: locked })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(Error::Io(std::io::Error::from(errno))),
        }
    }
}

/// Kernel jail name for a jail id
pub fn kernel_name(id: &str) -> String {
    format!("brig-{}", id)
}
