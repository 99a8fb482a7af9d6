//! Dataset lineage graph
//!
//! Datasets own snapshots, snapshots are the origin of clones. The graph is the
//! in-memory view of that ancestry and is what destroy/promote/rollback consult
//! before touching the pool. Every snapshot carries an explicit count of the
//! clones that reference it.

use crate::error::{Error, Result};
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

/// Node in the lineage graph
#[derive(Debug, Clone)]
enum Node {
    Dataset {
        name: String,
    },
    Snapshot {
        dataset: String,
        name: String,
        ordinal: u64,
        clones: usize,
    },
}

/// Edge in the lineage graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// dataset -> snapshot
    Owns,
    /// snapshot -> clone dataset
    OriginOf,
}

/// Row fed into the graph when it is rebuilt from the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Full name, `pool/a/b` or `pool/a/b@snap`
    pub name: String,
    /// Origin snapshot for clones
    pub origin: Option<String>,
    /// Creation order within the pool
    pub createtxg: u64,
}

/// Snapshot as seen through the lineage graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub dataset: String,
    pub name: String,
    pub ordinal: u64,
    pub clones: usize,
}

impl SnapshotInfo {
    /// `dataset@name`
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }
}

/// Split `dataset@snap` into its parts
pub fn split_snapshot(full: &str) -> Option<(&str, &str)> {
    let (dataset, name) = full.split_once('@')?;
    if dataset.is_empty() || name.is_empty() {
        return None;
    }
    Some((dataset, name))
}

/// The lineage DAG
#[derive(Debug, Default)]
pub struct Lineage {
    graph: StableDiGraph<Node, Link>,
    index: HashMap<String, NodeIndex>,
    next_ordinal: u64,
}

impl Lineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the graph from a pool listing
    ///
    /// Entries may arrive in any order; snapshots are ordered by `createtxg`.
    pub fn from_entries(entries: &[Entry]) -> Result<Self> {
        let mut lineage = Self::new();

        for entry in entries.iter().filter(|e| !e.name.contains('@')) {
            lineage.insert_dataset(&entry.name);
        }

        let mut snapshots: Vec<&Entry> = entries.iter().filter(|e| e.name.contains('@')).collect();
        snapshots.sort_by_key(|e| e.createtxg);
        for entry in snapshots {
            let Some((dataset, name)) = split_snapshot(&entry.name) else {
                continue;
            };
            if !lineage.index.contains_key(dataset) {
                // Snapshot of a dataset outside the listed tree
                lineage.insert_dataset(dataset);
            }
            lineage.insert_snapshot(dataset, name, entry.createtxg);
        }

        for entry in entries.iter().filter(|e| !e.name.contains('@')) {
            if let Some(origin) = &entry.origin {
                // Origins outside the managed tree are not tracked
                if lineage.index.contains_key(origin) {
                    lineage.link_origin(origin, &entry.name);
                }
            }
        }

        Ok(lineage)
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.dataset_index(name).is_some()
    }

    pub fn has_snapshot(&self, full: &str) -> bool {
        self.snapshot_index(full).is_some()
    }

    /// Register a new dataset, optionally cloned from `origin`
    pub fn add_dataset(&mut self, name: &str, origin: Option<&str>) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if let Some(origin) = origin {
            if !self.has_snapshot(origin) {
                return Err(Error::NotFound(origin.to_string()));
            }
        }

        self.insert_dataset(name);
        if let Some(origin) = origin {
            self.link_origin(origin, name);
        }
        Ok(())
    }

    /// Register a new snapshot of `dataset`
    pub fn add_snapshot(&mut self, dataset: &str, name: &str) -> Result<SnapshotInfo> {
        if !self.has_dataset(dataset) {
            return Err(Error::NotFound(dataset.to_string()));
        }
        let full = format!("{}@{}", dataset, name);
        if self.index.contains_key(&full) {
            return Err(Error::AlreadyExists(full));
        }

        let ordinal = self.next_ordinal;
        let idx = self.insert_snapshot(dataset, name, ordinal);
        Ok(self.snapshot_info(idx))
    }

    /// Origin snapshot of a clone
    pub fn origin(&self, dataset: &str) -> Option<String> {
        let idx = self.dataset_index(dataset)?;
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .find(|e| *e.weight() == Link::OriginOf)
            .map(|e| self.full_name(e.source()))
    }

    /// Snapshots of a dataset, oldest first
    pub fn snapshots(&self, dataset: &str) -> Vec<SnapshotInfo> {
        let Some(idx) = self.dataset_index(dataset) else {
            return Vec::new();
        };
        let mut snaps: Vec<SnapshotInfo> = self
            .owned_snapshots(idx)
            .into_iter()
            .map(|s| self.snapshot_info(s))
            .collect();
        snaps.sort_by_key(|s| s.ordinal);
        snaps
    }

    pub fn snapshot(&self, full: &str) -> Option<SnapshotInfo> {
        self.snapshot_index(full).map(|idx| self.snapshot_info(idx))
    }

    /// Clones whose origin is `snapshot`
    pub fn clones_of(&self, snapshot: &str) -> Vec<String> {
        let Some(idx) = self.snapshot_index(snapshot) else {
            return Vec::new();
        };
        self.clone_targets(idx)
    }

    /// Every clone of any snapshot of `dataset`
    pub fn dependents(&self, dataset: &str) -> Vec<String> {
        let Some(idx) = self.dataset_index(dataset) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .owned_snapshots(idx)
            .into_iter()
            .flat_map(|s| self.clone_targets(s))
            .collect();
        out.sort();
        out
    }

    /// Root of the origin chain `dataset` belongs to
    pub fn root_of(&self, dataset: &str) -> String {
        let mut current = dataset.to_string();
        // Bounded by node count; the graph is acyclic by construction
        for _ in 0..=self.graph.node_count() {
            match self.origin(&current).and_then(|o| split_snapshot(&o).map(|(d, _)| d.to_string())) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Verify `dataset` may be destroyed
    pub fn check_destroy(&self, dataset: &str, recursive: bool) -> Result<()> {
        let idx = self
            .dataset_index(dataset)
            .ok_or_else(|| Error::NotFound(dataset.to_string()))?;

        let dependents = self.dependents(dataset);
        if !dependents.is_empty() {
            return Err(Error::HasDependents {
                target: dataset.to_string(),
                dependents,
            });
        }

        let snapshots = self.owned_snapshots(idx);
        if !recursive && !snapshots.is_empty() {
            let mut names: Vec<String> = snapshots.into_iter().map(|s| self.full_name(s)).collect();
            names.sort();
            return Err(Error::HasDependents {
                target: dataset.to_string(),
                dependents: names,
            });
        }
        Ok(())
    }

    /// Drop a dataset and its snapshots, returning its former origin
    pub fn remove_dataset(&mut self, dataset: &str) -> Result<Option<String>> {
        self.check_destroy(dataset, true)?;
        let origin = self.origin(dataset);

        if let Some(origin) = &origin {
            if let Some(sidx) = self.snapshot_index(origin) {
                self.adjust_clones(sidx, -1);
            }
        }

        if let Some(idx) = self.dataset_index(dataset) {
            for snap in self.owned_snapshots(idx) {
                let full = self.full_name(snap);
                self.index.remove(&full);
                self.graph.remove_node(snap);
            }
            self.index.remove(dataset);
            self.graph.remove_node(idx);
        }
        Ok(origin)
    }

    /// Verify a snapshot may be destroyed
    pub fn check_destroy_snapshot(&self, full: &str) -> Result<()> {
        let idx = self
            .snapshot_index(full)
            .ok_or_else(|| Error::NotFound(full.to_string()))?;
        let clones = self.clone_targets(idx);
        if !clones.is_empty() {
            return Err(Error::HasDependents {
                target: full.to_string(),
                dependents: clones,
            });
        }
        Ok(())
    }

    pub fn remove_snapshot(&mut self, full: &str) -> Result<()> {
        self.check_destroy_snapshot(full)?;
        if let Some(idx) = self.index.remove(full) {
            self.graph.remove_node(idx);
        }
        Ok(())
    }

    /// Snapshots newer than `full` that a rollback would discard
    pub fn check_rollback(&self, full: &str) -> Result<Vec<String>> {
        let target = self
            .snapshot(full)
            .ok_or_else(|| Error::NotFound(full.to_string()))?;

        let newer: Vec<SnapshotInfo> = self
            .snapshots(&target.dataset)
            .into_iter()
            .filter(|s| s.ordinal > target.ordinal)
            .collect();

        let dependents: Vec<String> = newer
            .iter()
            .flat_map(|s| self.clones_of(&s.full_name()))
            .collect();
        if !dependents.is_empty() {
            return Err(Error::HasDependents {
                target: full.to_string(),
                dependents,
            });
        }
        Ok(newer.iter().map(|s| s.full_name()).collect())
    }

    /// Forget the snapshots discarded by a rollback to `full`
    pub fn apply_rollback(&mut self, full: &str) -> Result<Vec<String>> {
        let discarded = self.check_rollback(full)?;
        for name in &discarded {
            self.remove_snapshot(name)?;
        }
        Ok(discarded)
    }

    /// Reverse the clone relationship between `dataset` and its origin's owner
    ///
    /// The origin snapshot, and every older snapshot of the same owner, move to
    /// `dataset`; the former owner becomes a clone of the moved origin.
    pub fn promote(&mut self, dataset: &str) -> Result<()> {
        let clone_idx = self
            .dataset_index(dataset)
            .ok_or_else(|| Error::NotFound(dataset.to_string()))?;
        let origin = self
            .origin(dataset)
            .ok_or_else(|| Error::NoOriginPresent(dataset.to_string()))?;
        let origin_idx = self
            .snapshot_index(&origin)
            .ok_or_else(|| Error::NotFound(origin.clone()))?;
        let (owner, _) = split_snapshot(&origin).ok_or_else(|| Error::NotFound(origin.clone()))?;
        let owner = owner.to_string();
        let owner_idx = self
            .dataset_index(&owner)
            .ok_or_else(|| Error::NotFound(owner.clone()))?;

        let cutoff = self.snapshot_info(origin_idx).ordinal;
        let moving: Vec<NodeIndex> = self
            .owned_snapshots(owner_idx)
            .into_iter()
            .filter(|s| self.snapshot_info(*s).ordinal <= cutoff)
            .collect();

        for snap in &moving {
            let info = self.snapshot_info(*snap);
            let target = format!("{}@{}", dataset, info.name);
            if self.index.contains_key(&target) {
                return Err(Error::AlreadyExists(target));
            }
        }

        // The clone takes over the owner's place in any upstream chain
        let upstream = self
            .graph
            .edges_directed(owner_idx, Direction::Incoming)
            .find(|e| *e.weight() == Link::OriginOf)
            .map(|e| (e.id(), e.source()));
        if let Some((edge, parent_snap)) = upstream {
            self.graph.remove_edge(edge);
            self.graph.add_edge(parent_snap, clone_idx, Link::OriginOf);
        }

        // origin -> clone becomes origin -> former owner
        if let Some(edge) = self.graph.find_edge(origin_idx, clone_idx) {
            self.graph.remove_edge(edge);
        }
        self.graph.add_edge(origin_idx, owner_idx, Link::OriginOf);

        for snap in moving {
            let old_full = self.full_name(snap);
            if let Some(edge) = self.graph.find_edge(owner_idx, snap) {
                self.graph.remove_edge(edge);
            }
            self.graph.add_edge(clone_idx, snap, Link::Owns);
            if let Some(Node::Snapshot { dataset: owner_name, .. }) = self.graph.node_weight_mut(snap) {
                *owner_name = dataset.to_string();
            }
            self.index.remove(&old_full);
            let new_full = self.full_name(snap);
            self.index.insert(new_full, snap);
        }

        Ok(())
    }

    /// Rename a dataset along with its snapshots and child datasets
    pub fn rename_dataset(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.has_dataset(from) {
            return Err(Error::NotFound(from.to_string()));
        }
        if self.index.contains_key(to) {
            return Err(Error::AlreadyExists(to.to_string()));
        }

        let child_prefix = format!("{}/", from);
        let renamed: Vec<(String, NodeIndex)> = self
            .index
            .iter()
            .filter(|(name, _)| {
                let base = name.split('@').next().unwrap_or(name.as_str());
                base == from || base.starts_with(&child_prefix)
            })
            .map(|(name, idx)| (name.clone(), *idx))
            .collect();

        for (old, idx) in renamed {
            self.index.remove(&old);
            match self.graph.node_weight_mut(idx) {
                Some(Node::Dataset { name }) => {
                    *name = format!("{}{}", to, &name[from.len()..]);
                }
                Some(Node::Snapshot { dataset, .. }) => {
                    *dataset = format!("{}{}", to, &dataset[from.len()..]);
                }
                None => continue,
            }
            let new = self.full_name(idx);
            self.index.insert(new, idx);
        }
        Ok(())
    }

    fn insert_dataset(&mut self, name: &str) -> NodeIndex {
        let idx = self.graph.add_node(Node::Dataset {
            name: name.to_string(),
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn insert_snapshot(&mut self, dataset: &str, name: &str, ordinal: u64) -> NodeIndex {
        let idx = self.graph.add_node(Node::Snapshot {
            dataset: dataset.to_string(),
            name: name.to_string(),
            ordinal,
            clones: 0,
        });
        if let Some(owner) = self.dataset_index(dataset) {
            self.graph.add_edge(owner, idx, Link::Owns);
        }
        self.index.insert(format!("{}@{}", dataset, name), idx);
        self.next_ordinal = self.next_ordinal.max(ordinal + 1);
        idx
    }

    fn link_origin(&mut self, origin: &str, clone: &str) {
        let (Some(sidx), Some(cidx)) = (self.snapshot_index(origin), self.dataset_index(clone)) else {
            return;
        };
        self.graph.add_edge(sidx, cidx, Link::OriginOf);
        self.adjust_clones(sidx, 1);
    }

    fn adjust_clones(&mut self, idx: NodeIndex, delta: isize) {
        if let Some(Node::Snapshot { clones, .. }) = self.graph.node_weight_mut(idx) {
            *clones = clones.saturating_add_signed(delta);
        }
    }

    fn dataset_index(&self, name: &str) -> Option<NodeIndex> {
        self.index
            .get(name)
            .copied()
            .filter(|idx| matches!(self.graph.node_weight(*idx), Some(Node::Dataset { .. })))
    }

    fn snapshot_index(&self, full: &str) -> Option<NodeIndex> {
        self.index
            .get(full)
            .copied()
            .filter(|idx| matches!(self.graph.node_weight(*idx), Some(Node::Snapshot { .. })))
    }

    fn owned_snapshots(&self, dataset: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(dataset, Direction::Outgoing)
            .filter(|e| *e.weight() == Link::Owns)
            .map(|e| e.target())
            .collect()
    }

    fn clone_targets(&self, snapshot: NodeIndex) -> Vec<String> {
        let mut out: Vec<String> = self
            .graph
            .edges_directed(snapshot, Direction::Outgoing)
            .filter(|e| *e.weight() == Link::OriginOf)
            .map(|e| self.full_name(e.target()))
            .collect();
        out.sort();
        out
    }

    fn full_name(&self, idx: NodeIndex) -> String {
        match self.graph.node_weight(idx) {
            Some(Node::Dataset { name }) => name.clone(),
            Some(Node::Snapshot { dataset, name, .. }) => format!("{}@{}", dataset, name),
            None => String::new(),
        }
    }

    fn snapshot_info(&self, idx: NodeIndex) -> SnapshotInfo {
        match self.graph.node_weight(idx) {
            Some(Node::Snapshot {
                dataset,
                name,
                ordinal,
                clones,
            }) => SnapshotInfo {
                dataset: dataset.clone(),
                name: name.clone(),
                ordinal: *ordinal,
                clones: *clones,
            },
            _ => SnapshotInfo {
                dataset: String::new(),
                name: String::new(),
                ordinal: 0,
                clones: 0,
            },
        }
    }
}
