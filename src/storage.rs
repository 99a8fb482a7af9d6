//! Storage layer for jail datasets
//!
//! Owns the dataset tree under the configured root:
//! - `<root>/jails/<id>` for jails
//! - `<root>/templates/<id>` for templates
//! - `<root>/releases/<name>` for release datasets supplied by the fetcher
//!
//! Every ancestry-changing operation goes through the lineage graph first and
//! holds the lock of the lineage chain it touches, so clone/promote/destroy on
//! one chain never interleave while unrelated chains proceed in parallel.

pub mod lineage;
pub mod zfs;

use crate::error::{Error, Result};
use crate::units::parse_amount;
use lineage::{Lineage, split_snapshot};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub use lineage::{Entry, SnapshotInfo};
pub use zfs::Zfs;

/// Raw operations against a pool
///
/// Implementations do not enforce lineage invariants; [`StorageLayer`] does.
pub trait StorageBackend: Send + Sync {
    /// List every filesystem and snapshot below `root`, including `root`
    fn list(&self, root: &str) -> Result<Vec<Entry>>;
    fn create(&self, dataset: &str, properties: &[(String, String)]) -> Result<()>;
    fn snapshot(&self, snapshot: &str) -> Result<()>;
    fn clone_snapshot(&self, snapshot: &str, target: &str, properties: &[(String, String)]) -> Result<()>;
    fn promote(&self, dataset: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    /// Destroy a dataset (with its snapshots when `recursive`) or a single snapshot
    fn destroy(&self, target: &str, recursive: bool) -> Result<()>;
    /// Roll back to a snapshot, discarding newer snapshots
    fn rollback(&self, snapshot: &str) -> Result<()>;
    fn get(&self, dataset: &str, property: &str) -> Result<Option<String>>;
    fn set(&self, dataset: &str, property: &str, value: &str) -> Result<()>;
    fn inherit(&self, dataset: &str, property: &str) -> Result<()>;
    /// Locally set user properties whose name starts with `prefix`
    fn user_properties(&self, dataset: &str, prefix: &str) -> Result<BTreeMap<String, String>>;
    fn mount(&self, dataset: &str) -> Result<()>;
    fn unmount(&self, dataset: &str, force: bool) -> Result<()>;
    fn is_mounted(&self, dataset: &str) -> Result<bool>;
    fn mountpoint(&self, dataset: &str) -> Result<PathBuf>;
    /// Bytes available to new data below `dataset`
    fn available(&self, dataset: &str) -> Result<u64>;
}

/// A filesystem dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub mountpoint: PathBuf,
    /// Origin snapshot when the dataset is a clone
    pub origin: Option<String>,
}

/// Options for [`StorageLayer::destroy`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Destroy the dataset's own snapshots too
    pub recursive_snapshots: bool,
}

/// Advisory locks keyed by lineage chain root
#[derive(Default)]
struct ChainLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Held while operating on one lineage chain
struct ChainGuard<'a> {
    locks: &'a ChainLocks,
    root: String,
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.root);
        self.locks.released.notify_all();
    }
}

/// Storage layer: pool backend plus lineage bookkeeping
pub struct StorageLayer {
    backend: Arc<dyn StorageBackend>,
    root: String,
    lineage: Mutex<Lineage>,
    chains: ChainLocks,
}

impl StorageLayer {
    /// Open the dataset tree below `root`, creating the skeleton if needed
    pub fn open(backend: Arc<dyn StorageBackend>, root: impl Into<String>) -> Result<Self> {
        let root = root.into();
        let layer = Self {
            backend,
            root,
            lineage: Mutex::new(Lineage::new()),
            chains: ChainLocks::default(),
        };
        layer.init()?;
        layer.refresh()?;
        Ok(layer)
    }

    /// Create `<root>`, `jails`, `templates` and `releases` if missing
    fn init(&self) -> Result<()> {
        let existing: HashSet<String> = self
            .backend
            .list(&self.root)
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.name)
            .collect();

        for dataset in [
            self.root.clone(),
            self.jails_dataset(),
            self.templates_dataset(),
            self.releases_dataset(),
        ] {
            if !existing.contains(&dataset) {
                info!(dataset = %dataset, "creating dataset");
                self.backend.create(&dataset, &[])?;
            }
        }
        Ok(())
    }

    /// Rebuild the lineage graph from the pool
    pub fn refresh(&self) -> Result<()> {
        let entries = self.backend.list(&self.root)?;
        let rebuilt = Lineage::from_entries(&entries)?;
        *self.graph() = rebuilt;
        Ok(())
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn jails_dataset(&self) -> String {
        format!("{}/jails", self.root)
    }

    pub fn templates_dataset(&self) -> String {
        format!("{}/templates", self.root)
    }

    pub fn releases_dataset(&self) -> String {
        format!("{}/releases", self.root)
    }

    /// Dataset for a jail id, in the jail or template area
    pub fn jail_dataset(&self, id: &str, template: bool) -> String {
        if template {
            format!("{}/{}", self.templates_dataset(), id)
        } else {
            format!("{}/{}", self.jails_dataset(), id)
        }
    }

    pub fn release_dataset(&self, release: &str) -> String {
        format!("{}/{}", self.releases_dataset(), release)
    }

    /// Direct children of `parent` known to the lineage graph
    pub fn children(&self, parent: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", parent);
        let mut names: Vec<String> = self
            .backend
            .list(parent)?
            .into_iter()
            .map(|e| e.name)
            .filter(|n| {
                n.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains('/') && !rest.contains('@'))
            })
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, dataset: &str) -> bool {
        self.graph().has_dataset(dataset)
    }

    /// Ask the pool directly, bypassing the lineage graph
    pub fn present_on_pool(&self, dataset: &str) -> bool {
        self.backend
            .list(dataset)
            .map(|entries| entries.iter().any(|e| e.name == dataset))
            .unwrap_or(false)
    }

    /// Look up a dataset with its mountpoint and origin
    pub fn dataset(&self, name: &str) -> Result<Dataset> {
        let origin = {
            let graph = self.graph();
            if !graph.has_dataset(name) {
                return Err(Error::NotFound(name.to_string()));
            }
            graph.origin(name)
        };
        Ok(Dataset {
            name: name.to_string(),
            mountpoint: self.backend.mountpoint(name)?,
            origin,
        })
    }

    /// Create an empty dataset
    pub fn create(&self, name: &str, properties: &[(String, String)]) -> Result<Dataset> {
        if self.exists(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        self.check_capacity(name, properties)?;

        self.backend.create(name, properties)?;
        self.graph().add_dataset(name, None)?;
        debug!(dataset = %name, "dataset created");
        self.dataset(name)
    }

    /// Clone a snapshot into a new dataset
    pub fn clone_from(&self, snapshot: &str, target: &str, properties: &[(String, String)]) -> Result<Dataset> {
        let _chain = self.lock_chain(snapshot_owner(snapshot)?);
        {
            let graph = self.graph();
            if !graph.has_snapshot(snapshot) {
                return Err(Error::NotFound(snapshot.to_string()));
            }
            if graph.has_dataset(target) {
                return Err(Error::AlreadyExists(target.to_string()));
            }
        }
        self.check_capacity(target, properties)?;

        self.backend.clone_snapshot(snapshot, target, properties)?;
        self.graph().add_dataset(target, Some(snapshot))?;
        debug!(snapshot = %snapshot, dataset = %target, "clone created");
        self.dataset(target)
    }

    /// Take a named snapshot; duplicate names are rejected
    pub fn snapshot(&self, dataset: &str, name: &str) -> Result<SnapshotInfo> {
        if name.is_empty() || name.contains(['@', '/']) {
            return Err(Error::InvalidProperty {
                key: "snapshot".into(),
                reason: format!("invalid snapshot name '{}'", name),
            });
        }
        let _chain = self.lock_chain(dataset);
        let full = format!("{}@{}", dataset, name);
        {
            let graph = self.graph();
            if !graph.has_dataset(dataset) {
                return Err(Error::NotFound(dataset.to_string()));
            }
            if graph.has_snapshot(&full) {
                return Err(Error::AlreadyExists(full));
            }
        }

        self.backend.snapshot(&full)?;
        let info = self.graph().add_snapshot(dataset, name)?;
        debug!(snapshot = %full, "snapshot created");
        Ok(info)
    }

    /// Snapshots of a dataset, oldest first
    pub fn snapshots(&self, dataset: &str) -> Vec<SnapshotInfo> {
        self.graph().snapshots(dataset)
    }

    pub fn origin(&self, dataset: &str) -> Option<String> {
        self.graph().origin(dataset)
    }

    pub fn dependents(&self, dataset: &str) -> Vec<String> {
        self.graph().dependents(dataset)
    }

    pub fn clones_of(&self, snapshot: &str) -> Vec<String> {
        self.graph().clones_of(snapshot)
    }

    /// Make a clone independent of its origin
    pub fn promote(&self, dataset: &str) -> Result<()> {
        let _chain = self.lock_chain(dataset);
        {
            let graph = self.graph();
            if !graph.has_dataset(dataset) {
                return Err(Error::NotFound(dataset.to_string()));
            }
            if graph.origin(dataset).is_none() {
                return Err(Error::NoOriginPresent(dataset.to_string()));
            }
        }

        self.backend.promote(dataset)?;
        self.graph().promote(dataset)?;
        info!(dataset = %dataset, "dataset promoted");
        Ok(())
    }

    /// Rename a dataset; mounted datasets are refused
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _chain = self.lock_chain(from);
        {
            let graph = self.graph();
            if !graph.has_dataset(from) {
                return Err(Error::NotFound(from.to_string()));
            }
            if graph.has_dataset(to) {
                return Err(Error::AlreadyExists(to.to_string()));
            }
        }
        if self.backend.is_mounted(from)? {
            return Err(Error::Busy(from.to_string()));
        }

        self.backend.rename(from, to)?;
        self.graph().rename_dataset(from, to)?;
        info!(from = %from, to = %to, "dataset renamed");
        Ok(())
    }

    /// Destroy a dataset, returning the origin snapshot it referenced
    ///
    /// Fails with `HasDependents` while any clone references one of its
    /// snapshots; that is never resolved automatically.
    pub fn destroy(&self, dataset: &str, opts: DestroyOptions) -> Result<Option<String>> {
        let _chain = self.lock_chain(dataset);
        self.graph().check_destroy(dataset, opts.recursive_snapshots)?;

        if self.backend.is_mounted(dataset)? {
            self.backend.unmount(dataset, false)?;
        }
        self.backend.destroy(dataset, opts.recursive_snapshots)?;
        let origin = self.graph().remove_dataset(dataset)?;
        info!(dataset = %dataset, "dataset destroyed");
        Ok(origin)
    }

    /// Destroy a snapshot with no clones
    pub fn destroy_snapshot(&self, snapshot: &str) -> Result<()> {
        let _chain = self.lock_chain(snapshot_owner(snapshot)?);
        self.graph().check_destroy_snapshot(snapshot)?;
        self.backend.destroy(snapshot, false)?;
        self.graph().remove_snapshot(snapshot)?;
        debug!(snapshot = %snapshot, "snapshot destroyed");
        Ok(())
    }

    /// Roll a dataset back to `snapshot`, returning the discarded snapshots
    pub fn rollback(&self, snapshot: &str) -> Result<Vec<String>> {
        let _chain = self.lock_chain(snapshot_owner(snapshot)?);
        self.graph().check_rollback(snapshot)?;
        self.backend.rollback(snapshot)?;
        let discarded = self.graph().apply_rollback(snapshot)?;
        info!(snapshot = %snapshot, discarded = discarded.len(), "rolled back");
        Ok(discarded)
    }

    pub fn get_property(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        self.backend.get(dataset, property)
    }

    pub fn set_property(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        self.backend.set(dataset, property, value)
    }

    pub fn clear_property(&self, dataset: &str, property: &str) -> Result<()> {
        self.backend.inherit(dataset, property)
    }

    pub fn user_properties(&self, dataset: &str, prefix: &str) -> Result<BTreeMap<String, String>> {
        self.backend.user_properties(dataset, prefix)
    }

    /// Mount a dataset and return its mountpoint
    pub fn mount(&self, dataset: &str) -> Result<PathBuf> {
        if !self.backend.is_mounted(dataset)? {
            self.backend.mount(dataset)?;
        }
        self.backend.mountpoint(dataset)
    }

    pub fn unmount(&self, dataset: &str, force: bool) -> Result<()> {
        if self.backend.is_mounted(dataset)? {
            self.backend.unmount(dataset, force)?;
        }
        Ok(())
    }

    pub fn is_mounted(&self, dataset: &str) -> Result<bool> {
        self.backend.is_mounted(dataset)
    }

    fn check_capacity(&self, dataset: &str, properties: &[(String, String)]) -> Result<()> {
        let requested = properties
            .iter()
            .filter(|(k, _)| k == "reservation" || k == "refreservation")
            .filter_map(|(_, v)| parse_amount(v))
            .max();
        let Some(requested) = requested else {
            return Ok(());
        };

        let parent = dataset.rsplit_once('/').map(|(p, _)| p).unwrap_or(self.root.as_str());
        let available = self.backend.available(parent)?;
        if requested > available {
            return Err(Error::CapacityExceeded {
                dataset: dataset.to_string(),
                requested,
                available,
            });
        }
        Ok(())
    }

    fn graph(&self) -> MutexGuard<'_, Lineage> {
        self.lineage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the lineage chain `dataset` belongs to
    ///
    /// The root is re-checked after acquisition since a concurrent promote can
    /// move it while we wait.
    fn lock_chain(&self, dataset: &str) -> ChainGuard<'_> {
        loop {
            let root = self.graph().root_of(dataset);
            let mut held = self.chains.held.lock().unwrap_or_else(PoisonError::into_inner);
            while held.contains(&root) {
                held = self
                    .chains
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            held.insert(root.clone());
            drop(held);

            let guard = ChainGuard {
                locks: &self.chains,
                root,
            };
            if self.graph().root_of(dataset) == guard.root {
                return guard;
            }
        }
    }
}

fn snapshot_owner(snapshot: &str) -> Result<&str> {
    split_snapshot(snapshot)
        .map(|(dataset, _)| dataset)
        .ok_or_else(|| Error::NotFound(snapshot.to_string()))
}
