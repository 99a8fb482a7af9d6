//! In-memory backends for tests
//!
//! Each fake keeps just enough host state to let the engine run end to end:
//! a pool with lineage and properties, a kernel with jails and processes, a
//! host network with epairs and bridges, and an rctl rule table.

use crate::bulkhead::{Bulkhead, RctlBackend};
use crate::error::{Error, Result};
use crate::helm::{Helm, HelmSettings};
use crate::jail::{JailKernel, JailParams};
use crate::network::{NetworkBackend, NetworkConfigurator};
use crate::properties::PropertyStore;
use crate::storage::{Entry, StorageBackend, StorageLayer};
use ipnet::IpNet;
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Pool
// ============================================================================

#[derive(Debug, Clone, Default)]
struct FakeDataset {
    origin: Option<String>,
    createtxg: u64,
    mounted: bool,
    props: BTreeMap<String, String>,
}

#[derive(Debug)]
struct PoolState {
    datasets: BTreeMap<String, FakeDataset>,
    /// `dataset@name` -> createtxg
    snapshots: BTreeMap<String, u64>,
    txg: u64,
    available: u64,
}

/// A ZFS pool held in memory
pub struct MemoryPool {
    state: Mutex<PoolState>,
}

fn under(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('@'))
}

fn owner(snapshot: &str) -> &str {
    snapshot.split_once('@').map(|(d, _)| d).unwrap_or(snapshot)
}

impl MemoryPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                datasets: BTreeMap::new(),
                snapshots: BTreeMap::new(),
                txg: 0,
                available: 1 << 40,
            }),
        }
    }

    pub fn set_available(&self, bytes: u64) {
        self.state.lock().unwrap().available = bytes;
    }

    /// Drop a dataset behind the storage layer's back
    pub fn remove_raw(&self, dataset: &str) {
        let mut state = self.state.lock().unwrap();
        state.datasets.retain(|name, _| !under(name, dataset));
        state.snapshots.retain(|name, _| !under(name, dataset));
    }

    pub fn is_mounted_raw(&self, dataset: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.datasets.get(dataset).is_some_and(|d| d.mounted)
    }

    pub fn property(&self, dataset: &str, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.datasets.get(dataset).and_then(|d| d.props.get(key).cloned())
    }

    fn missing(name: &str) -> Error {
        Error::Zfs(format!("cannot open '{}': dataset does not exist", name))
    }
}

impl PoolState {
    fn next_txg(&mut self) -> u64 {
        self.txg += 1;
        self.txg
    }

    fn dataset_mut(&mut self, name: &str) -> Result<&mut FakeDataset> {
        self.datasets.get_mut(name).ok_or_else(|| MemoryPool::missing(name))
    }

    fn is_cloned(&self, snapshot: &str) -> bool {
        self.datasets
            .values()
            .any(|d| d.origin.as_deref() == Some(snapshot))
    }
}

impl StorageBackend for MemoryPool {
    fn list(&self, root: &str) -> Result<Vec<Entry>> {
        let state = self.state.lock().unwrap();
        if !state.datasets.contains_key(root) {
            return Err(MemoryPool::missing(root));
        }
        let mut entries: Vec<Entry> = state
            .datasets
            .iter()
            .filter(|(name, _)| under(name, root))
            .map(|(name, d)| Entry {
                name: name.clone(),
                origin: d.origin.clone(),
                createtxg: d.createtxg,
            })
            .collect();
        entries.extend(
            state
                .snapshots
                .iter()
                .filter(|(name, _)| under(name, root))
                .map(|(name, txg)| Entry {
                    name: name.clone(),
                    origin: None,
                    createtxg: *txg,
                }),
        );
        Ok(entries)
    }

    fn create(&self, dataset: &str, properties: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.datasets.contains_key(dataset) {
            return Err(Error::Zfs(format!("'{}' already exists", dataset)));
        }
        let createtxg = state.next_txg();
        state.datasets.insert(
            dataset.to_string(),
            FakeDataset {
                createtxg,
                props: properties.iter().cloned().collect(),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn snapshot(&self, snapshot: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.datasets.contains_key(owner(snapshot)) {
            return Err(MemoryPool::missing(owner(snapshot)));
        }
        let txg = state.next_txg();
        state.snapshots.insert(snapshot.to_string(), txg);
        Ok(())
    }

    fn clone_snapshot(&self, snapshot: &str, target: &str, properties: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.snapshots.contains_key(snapshot) {
            return Err(MemoryPool::missing(snapshot));
        }
        let createtxg = state.next_txg();
        state.datasets.insert(
            target.to_string(),
            FakeDataset {
                origin: Some(snapshot.to_string()),
                createtxg,
                mounted: false,
                props: properties.iter().cloned().collect(),
            },
        );
        Ok(())
    }

    fn promote(&self, dataset: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let origin = state
            .dataset_mut(dataset)?
            .origin
            .clone()
            .ok_or_else(|| Error::Zfs(format!("'{}' is not a cloned filesystem", dataset)))?;
        let former = owner(&origin).to_string();
        let cutoff = state.snapshots.get(&origin).copied().unwrap_or(0);

        let moving: Vec<(String, u64)> = state
            .snapshots
            .iter()
            .filter(|(name, txg)| owner(name) == former && **txg <= cutoff)
            .map(|(name, txg)| (name.clone(), *txg))
            .collect();

        let upstream = state.dataset_mut(&former)?.origin.take();
        for (old, txg) in moving {
            state.snapshots.remove(&old);
            let renamed = old.replacen(&former, dataset, 1);
            state.snapshots.insert(renamed.clone(), txg);
            for d in state.datasets.values_mut() {
                if d.origin.as_deref() == Some(old.as_str()) {
                    d.origin = Some(renamed.clone());
                }
            }
        }
        let moved_origin = origin.replacen(&former, dataset, 1);
        state.dataset_mut(&former)?.origin = Some(moved_origin);
        state.dataset_mut(dataset)?.origin = upstream;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.datasets.contains_key(from) {
            return Err(MemoryPool::missing(from));
        }
        let datasets: Vec<String> = state.datasets.keys().filter(|n| under(n, from)).cloned().collect();
        for name in datasets {
            if let Some(d) = state.datasets.remove(&name) {
                state.datasets.insert(name.replacen(from, to, 1), d);
            }
        }
        let snapshots: Vec<String> = state.snapshots.keys().filter(|n| under(n, from)).cloned().collect();
        for old in snapshots {
            if let Some(txg) = state.snapshots.remove(&old) {
                let renamed = old.replacen(from, to, 1);
                for d in state.datasets.values_mut() {
                    if d.origin.as_deref() == Some(old.as_str()) {
                        d.origin = Some(renamed.clone());
                    }
                }
                state.snapshots.insert(renamed, txg);
            }
        }
        Ok(())
    }

    fn destroy(&self, target: &str, recursive: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if target.contains('@') {
            if state.is_cloned(target) {
                return Err(Error::Zfs(format!("snapshot '{}' has dependent clones", target)));
            }
            state
                .snapshots
                .remove(target)
                .ok_or_else(|| MemoryPool::missing(target))?;
            return Ok(());
        }

        if !state.datasets.contains_key(target) {
            return Err(MemoryPool::missing(target));
        }
        let own: Vec<String> = state
            .snapshots
            .keys()
            .filter(|n| owner(n) == target)
            .cloned()
            .collect();
        if !own.is_empty() && !recursive {
            return Err(Error::Zfs(format!("'{}' has children", target)));
        }
        if own.iter().any(|s| state.is_cloned(s)) {
            return Err(Error::Zfs(format!("'{}' has dependent clones", target)));
        }
        for snap in own {
            state.snapshots.remove(&snap);
        }
        state.datasets.remove(target);
        Ok(())
    }

    fn rollback(&self, snapshot: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let txg = *state
            .snapshots
            .get(snapshot)
            .ok_or_else(|| MemoryPool::missing(snapshot))?;
        let dataset = owner(snapshot).to_string();
        state
            .snapshots
            .retain(|name, t| owner(name) != dataset || *t <= txg);
        Ok(())
    }

    fn get(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        let d = state.datasets.get(dataset).ok_or_else(|| MemoryPool::missing(dataset))?;
        Ok(d.props.get(property).cloned())
    }

    fn set(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .dataset_mut(dataset)?
            .props
            .insert(property.to_string(), value.to_string());
        Ok(())
    }

    fn inherit(&self, dataset: &str, property: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dataset_mut(dataset)?.props.remove(property);
        Ok(())
    }

    fn user_properties(&self, dataset: &str, prefix: &str) -> Result<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap();
        let d = state.datasets.get(dataset).ok_or_else(|| MemoryPool::missing(dataset))?;
        Ok(d.props
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn mount(&self, dataset: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dataset_mut(dataset)?.mounted = true;
        Ok(())
    }

    fn unmount(&self, dataset: &str, _force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dataset_mut(dataset)?.mounted = false;
        Ok(())
    }

    fn is_mounted(&self, dataset: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        let d = state.datasets.get(dataset).ok_or_else(|| MemoryPool::missing(dataset))?;
        Ok(d.mounted)
    }

    fn mountpoint(&self, dataset: &str) -> Result<PathBuf> {
        Ok(PathBuf::from(format!("/{}", dataset)))
    }

    fn available(&self, _dataset: &str) -> Result<u64> {
        Ok(self.state.lock().unwrap().available)
    }
}

// ============================================================================
// Kernel
// ============================================================================

#[derive(Debug)]
struct FakeJail {
    name: String,
    processes: bool,
}

#[derive(Debug, Default)]
struct KernelState {
    next_jid: i32,
    alive: BTreeMap<i32, FakeJail>,
    params: HashMap<String, JailParams>,
    signals: HashMap<i32, Vec<Signal>>,
    execs: HashMap<i32, Vec<String>>,
    devfs: BTreeSet<PathBuf>,
    created: usize,
    ignore_term: bool,
    refuse_remove: bool,
    fail_create: bool,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Kernel jails, processes and devfs mounts held in memory
#[derive(Default)]
pub struct FakeKernel {
    state: Mutex<KernelState>,
    on_create: Mutex<Option<Hook>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make SIGTERM leave processes running
    pub fn ignore_term(&self, ignore: bool) {
        self.state.lock().unwrap().ignore_term = ignore;
    }

    /// Make jail removal fail while set
    pub fn refuse_remove(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_remove = refuse;
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Run `hook` after every successful create
    pub fn on_create(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_create.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Start a jail outside the engine, with processes
    pub fn spawn(&self, name: &str) -> i32 {
        let mut state = self.state.lock().unwrap();
        state.next_jid += 1;
        let jid = state.next_jid;
        state.alive.insert(
            jid,
            FakeJail {
                name: name.to_string(),
                processes: true,
            },
        );
        jid
    }

    /// Make a jail vanish, as after a host reboot
    pub fn kill(&self, jid: i32) {
        self.state.lock().unwrap().alive.remove(&jid);
    }

    pub fn signals(&self, jid: i32) -> Vec<Signal> {
        self.state.lock().unwrap().signals.get(&jid).cloned().unwrap_or_default()
    }

    pub fn execs(&self, jid: i32) -> Vec<String> {
        self.state.lock().unwrap().execs.get(&jid).cloned().unwrap_or_default()
    }

    /// Parameters of the last jail created under `name`
    pub fn params(&self, name: &str) -> Option<JailParams> {
        self.state.lock().unwrap().params.get(name).cloned()
    }

    pub fn created_total(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn alive(&self) -> usize {
        self.state.lock().unwrap().alive.len()
    }

    pub fn devfs_mounts(&self) -> usize {
        self.state.lock().unwrap().devfs.len()
    }
}

impl JailKernel for FakeKernel {
    fn create(&self, name: &str, _path: &Path, params: &JailParams) -> Result<i32> {
        let jid = {
            let mut state = self.state.lock().unwrap();
            if state.fail_create {
                return Err(Error::JailSet("injected failure".into()));
            }
            if state.alive.values().any(|j| j.name == name) {
                return Err(Error::JailSet(format!("jail '{}' already exists", name)));
            }
            state.next_jid += 1;
            let jid = state.next_jid;
            state.alive.insert(
                jid,
                FakeJail {
                    name: name.to_string(),
                    processes: false,
                },
            );
            state.params.insert(name.to_string(), params.clone());
            state.created += 1;
            jid
        };

        let hook = self.on_create.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
        Ok(jid)
    }

    fn find(&self, name: &str) -> Result<Option<i32>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .alive
            .iter()
            .find(|(_, j)| j.name == name)
            .map(|(jid, _)| *jid))
    }

    fn running(&self) -> Result<Vec<(i32, String)>> {
        let state = self.state.lock().unwrap();
        Ok(state.alive.iter().map(|(jid, j)| (*jid, j.name.clone())).collect())
    }

    fn exec(&self, jid: i32, command: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let jail = state.alive.get_mut(&jid).ok_or_else(|| Error::CommandFailed {
            command: format!("jexec {} {}", jid, command),
            message: "jail not found".into(),
        })?;
        jail.processes = true;
        state.execs.entry(jid).or_default().push(command.to_string());
        Ok(())
    }

    fn signal_all(&self, jid: i32, signal: Signal) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.signals.entry(jid).or_default().push(signal);
        let ignore_term = state.ignore_term;
        if let Some(jail) = state.alive.get_mut(&jid) {
            if signal == Signal::SIGKILL || !ignore_term {
                jail.processes = false;
            }
        }
        Ok(())
    }

    fn has_processes(&self, jid: i32) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.alive.get(&jid).is_some_and(|j| j.processes))
    }

    fn remove(&self, jid: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_remove {
            return Err(Error::JailRemoveFailed);
        }
        state.alive.remove(&jid);
        Ok(())
    }

    fn mount_devfs(&self, root: &Path, _ruleset: &str) -> Result<()> {
        self.state.lock().unwrap().devfs.insert(root.join("dev"));
        Ok(())
    }

    fn unmount_devfs(&self, root: &Path) -> Result<()> {
        self.state.lock().unwrap().devfs.remove(&root.join("dev"));
        Ok(())
    }
}

// ============================================================================
// Network
// ============================================================================

#[derive(Debug, Default)]
struct NetState {
    host: Vec<IpNet>,
    /// Host sides of live epairs
    epairs: BTreeSet<String>,
    next: u32,
    bridges: BTreeMap<String, BTreeSet<String>>,
    configured: HashMap<i32, Vec<String>>,
    routes: HashMap<i32, IpAddr>,
    aliases: BTreeMap<String, Vec<IpAddr>>,
    fail_on: Option<String>,
    epair_limit: Option<usize>,
}

impl NetState {
    fn check(&self, op: &str) -> Result<()> {
        match &self.fail_on {
            Some(pattern) if op.contains(pattern.as_str()) => {
                Err(Error::Network(format!("injected {} failure", op)))
            }
            _ => Ok(()),
        }
    }
}

/// Host interfaces held in memory
#[derive(Default)]
pub struct FakeNetwork {
    state: Mutex<NetState>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host_address(&self, net: &str) {
        if let Ok(net) = net.parse() {
            self.state.lock().unwrap().host.push(net);
        }
    }

    /// Fail every operation whose name contains `op`
    pub fn fail_on(&self, op: &str) {
        self.state.lock().unwrap().fail_on = Some(op.to_string());
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().fail_on = None;
    }

    pub fn set_epair_limit(&self, limit: usize) {
        self.state.lock().unwrap().epair_limit = Some(limit);
    }

    /// Live epairs
    pub fn interface_count(&self) -> usize {
        self.state.lock().unwrap().epairs.len()
    }

    /// Addresses configured inside a jail
    pub fn configured(&self, jid: i32) -> Vec<String> {
        self.state.lock().unwrap().configured.get(&jid).cloned().unwrap_or_default()
    }

    /// Aliases added to a host interface
    pub fn aliases(&self, iface: &str) -> Vec<IpAddr> {
        self.state.lock().unwrap().aliases.get(iface).cloned().unwrap_or_default()
    }

    pub fn bridge_members(&self, bridge: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .bridges
            .get(bridge)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl NetworkBackend for FakeNetwork {
    fn host_addresses(&self) -> Result<Vec<IpNet>> {
        Ok(self.state.lock().unwrap().host.clone())
    }

    fn create_epair(&self, jail: &str, nic: &str) -> Result<(String, String)> {
        let mut state = self.state.lock().unwrap();
        state.check("epair")?;
        if state.epair_limit.is_some_and(|limit| state.epairs.len() >= limit) {
            return Err(Error::InterfaceExhausted("epair create: limit reached".into()));
        }
        let n = state.next;
        state.next += 1;
        let index: String = nic.chars().filter(|c| c.is_ascii_digit()).collect();
        let host_side = format!("e{}a_{}{}", n, jail, index);
        let jail_side = format!("e{}b_{}{}", n, jail, index);
        state.epairs.insert(host_side.clone());
        Ok((host_side, jail_side))
    }

    fn set_mac(&self, _iface: &str, _mac: &str) -> Result<()> {
        self.state.lock().unwrap().check("mac")
    }

    fn ensure_bridge(&self, bridge: &str, create: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("bridge")?;
        if !state.bridges.contains_key(bridge) {
            if !create {
                return Err(Error::Network(format!("bridge {} does not exist", bridge)));
            }
            state.bridges.insert(bridge.to_string(), BTreeSet::new());
        }
        Ok(())
    }

    fn bridge_add(&self, bridge: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("bridge_add")?;
        state
            .bridges
            .entry(bridge.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    fn bridge_remove(&self, bridge: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(members) = state.bridges.get_mut(bridge) {
            members.remove(member);
        }
        Ok(())
    }

    fn up(&self, _iface: &str) -> Result<()> {
        self.state.lock().unwrap().check("up")
    }

    fn move_to_jail(&self, _iface: &str, _jid: i32) -> Result<()> {
        self.state.lock().unwrap().check("move")
    }

    fn add_alias(&self, iface: &str, addr: IpAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check(&format!("alias_add:{}", iface))?;
        state.host.push(IpNet::from(addr));
        state.aliases.entry(iface.to_string()).or_default().push(addr);
        Ok(())
    }

    fn remove_alias(&self, iface: &str, addr: IpAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check(&format!("alias_remove:{}", iface))?;
        if let Some(pos) = state.host.iter().position(|net| *net == IpNet::from(addr)) {
            state.host.remove(pos);
        }
        if let Some(list) = state.aliases.get_mut(iface) {
            list.retain(|a| *a != addr);
            if list.is_empty() {
                state.aliases.remove(iface);
            }
        }
        Ok(())
    }

    fn configure_address(&self, jid: i32, _iface: &str, net: &IpNet) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("address")?;
        state.configured.entry(jid).or_default().push(net.to_string());
        Ok(())
    }

    fn start_dhcp(&self, _jid: i32, _iface: &str) -> Result<()> {
        self.state.lock().unwrap().check("dhcp")
    }

    fn default_route(&self, jid: i32, gateway: IpAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("route")?;
        state.routes.insert(jid, gateway);
        Ok(())
    }

    fn destroy(&self, iface: &str) -> Result<()> {
        self.state.lock().unwrap().epairs.remove(iface);
        Ok(())
    }
}

// ============================================================================
// RCTL
// ============================================================================

#[derive(Debug, Default)]
struct RctlState {
    rules: Vec<String>,
    added: usize,
    fail_on: Option<String>,
}

/// The rctl rule table held in memory
#[derive(Default)]
pub struct FakeRctl {
    state: Mutex<RctlState>,
}

impl FakeRctl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject rules containing `pattern`
    pub fn fail_on(&self, pattern: &str) {
        self.state.lock().unwrap().fail_on = Some(pattern.to_string());
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().fail_on = None;
    }

    /// Rules currently attached
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().rules.len()
    }

    /// Rules ever attached successfully
    pub fn added_total(&self) -> usize {
        self.state.lock().unwrap().added
    }

    pub fn has_rule(&self, rule: &str) -> bool {
        self.state.lock().unwrap().rules.iter().any(|r| r == rule)
    }
}

impl RctlBackend for FakeRctl {
    fn add_rule(&self, rule: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_on.as_deref().is_some_and(|p| rule.contains(p)) {
            return Err(Error::Rctl(format!("injected failure for {}", rule)));
        }
        state.rules.push(rule.to_string());
        state.added += 1;
        Ok(())
    }

    fn remove_rule(&self, rule: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let scope = format!("{}:", rule);
        state.rules.retain(|r| r != rule && !r.starts_with(&scope));
        Ok(())
    }

    fn rules(&self, filter: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.rules.iter().filter(|r| r.starts_with(filter)).cloned().collect())
    }
}

// ============================================================================
// Engine harness
// ============================================================================

static HARNESS_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Runtime record directory removed when the last harness sharing it drops
pub struct StateDir(pub PathBuf);

impl StateDir {
    fn fresh() -> Self {
        let seq = HARNESS_SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("brig-test-{}-{}", std::process::id(), seq));
        let _ = std::fs::remove_dir_all(&dir);
        StateDir(dir)
    }
}

impl Drop for StateDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

pub const TEST_ROOT: &str = "zroot/brig";
pub const TEST_RELEASE: &str = "14.1-RELEASE";

/// An engine wired to fakes
pub struct Harness {
    pub pool: Arc<MemoryPool>,
    pub kernel: Arc<FakeKernel>,
    pub net: Arc<FakeNetwork>,
    pub rctl: Arc<FakeRctl>,
    pub state_dir: Arc<StateDir>,
    pub helm: Arc<Helm>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_pool(Arc::new(MemoryPool::new()))
    }

    pub fn with_pool(pool: Arc<MemoryPool>) -> Self {
        Self::assemble(
            pool,
            Arc::new(FakeKernel::new()),
            Arc::new(FakeNetwork::new()),
            Arc::new(FakeRctl::new()),
            Arc::new(StateDir::fresh()),
        )
    }

    /// A new engine over the same host state, as after an engine restart
    pub fn reopen(&self) -> Self {
        Self::assemble(
            self.pool.clone(),
            self.kernel.clone(),
            self.net.clone(),
            self.rctl.clone(),
            self.state_dir.clone(),
        )
    }

    fn assemble(
        pool: Arc<MemoryPool>,
        kernel: Arc<FakeKernel>,
        net: Arc<FakeNetwork>,
        rctl: Arc<FakeRctl>,
        state_dir: Arc<StateDir>,
    ) -> Self {
        let storage = StorageLayer::open(pool.clone(), TEST_ROOT).unwrap();
        let release = storage.release_dataset(TEST_RELEASE);
        if !storage.exists(&release) {
            storage.create(&release, &[]).unwrap();
        }

        let mut settings = HelmSettings::new(&state_dir.0);
        settings.stop_poll = Duration::from_millis(5);
        let helm = Helm::new(
            storage,
            PropertyStore::new(&BTreeMap::new()).unwrap(),
            kernel.clone(),
            NetworkConfigurator::new(net.clone(), "02ff60", true),
            Bulkhead::new(rctl.clone()),
            settings,
        )
        .unwrap();

        Self {
            pool,
            kernel,
            net,
            rctl,
            state_dir,
            helm: Arc::new(helm),
        }
    }
}
