//! The Helm - jail lifecycle engine
//!
//! Owns the storage layer, the spec store and the kernel, network and limit
//! binders, and drives every jail through its state machine:
//!
//! ```text
//! Defined -> Starting -> Running -> Stopping -> Defined
//!               |                      |
//!               +------> Failed <------+
//! ```
//!
//! Each jail has a slot in the arena whose mutex is held for a whole
//! transition, so transitions on one jail serialize while different jails
//! proceed in parallel. Start acquires resources in order (mount, devfs,
//! kernel jail, network, limits) and records each in the jail's runtime
//! instance; any failure releases them in reverse.
//!
//! Across processes, start, stop, clear and destroy also hold the jail's
//! [`RecordLock`] and re-read its runtime record first, so an engine never
//! acts on a jail another process is driving.

use crate::bulkhead::{Bulkhead, LimitSpec};
use crate::error::{Component, Error, Result};
use crate::jail::{
    JailInstance, JailKernel, JailState, Lifecycle, RecordLock, Resource, StopPolicy, build_params,
    terminate,
};
use crate::network::{NetworkConfigurator, NetworkMode, NetworkSpec};
use crate::properties::{
    self, JailSpec, PropertySource, PropertyStore, STORAGE_KEYS, SpecUpdate, materialize_clone,
    validate_name,
};
use crate::storage::{DestroyOptions, SnapshotInfo, StorageLayer, lineage::split_snapshot};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Engine settings that do not live in jail properties
#[derive(Debug, Clone)]
pub struct HelmSettings {
    /// Directory for runtime records
    pub state_dir: PathBuf,
    /// Interval between process checks while stopping
    pub stop_poll: Duration,
}

impl HelmSettings {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            stop_poll: Duration::from_millis(250),
        }
    }
}

/// Where a new jail's dataset comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A fresh empty dataset
    Empty,
    /// Clone of `<root>/releases/<name>`
    Release(String),
    /// Clone of a jail marked `template=yes`
    Template(String),
    /// Clone of any jail, optionally from one of its existing snapshots
    Clone { jail: String, snapshot: Option<String> },
}

/// Parameters of [`Helm::create`]
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    /// Stable id; defaults to the name
    pub id: Option<String>,
    pub source: Source,
    pub update: SpecUpdate,
}

impl CreateRequest {
    pub fn new(name: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            id: None,
            source,
            update: SpecUpdate::default(),
        }
    }

    pub fn with_update(mut self, update: SpecUpdate) -> Self {
        self.update = update;
        self
    }
}

/// One row of [`Helm::list`]
#[derive(Debug, Clone, Serialize)]
pub struct JailSummary {
    pub id: String,
    pub name: String,
    pub state: String,
    pub jid: Option<i32>,
    pub template: bool,
    pub dataset: String,
    pub origin: Option<String>,
    pub mountpoint: Option<PathBuf>,
}

/// An effective property and where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedProperty {
    pub value: String,
    pub source: String,
}

/// Full view of one jail
#[derive(Debug, Clone, Serialize)]
pub struct JailView {
    #[serde(flatten)]
    pub summary: JailSummary,
    pub created_from: Option<String>,
    pub limits: Vec<LimitSpec>,
    pub network: NetworkSpec,
    pub properties: BTreeMap<String, ResolvedProperty>,
}

/// Mutable state of one jail, guarded by the slot mutex
struct SlotState {
    lifecycle: Lifecycle,
    instance: Option<JailInstance>,
}

/// Arena entry for one jail
struct Slot {
    transition: Mutex<SlotState>,
    /// Last published state, readable while a transition holds the lock
    view: Mutex<(JailState, Option<i32>)>,
    in_flight: AtomicBool,
    cancel: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            transition: Mutex::new(SlotState {
                lifecycle: Lifecycle::new(),
                instance: None,
            }),
            view: Mutex::new((JailState::Defined, None)),
            in_flight: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &SlotState) {
        let jid = state.instance.as_ref().and_then(|i| i.jid);
        *self.view.lock().unwrap_or_else(PoisonError::into_inner) = (state.lifecycle.state(), jid);
    }

    fn view(&self) -> (JailState, Option<i32>) {
        *self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What [`Helm::settle`] did with a jail's runtime record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// The kernel jail is still running and was taken over
    Adopted,
    /// The record was stale and released; carries the failed cleanup steps
    Released(usize),
    /// Another process holds the record lock
    Busy,
    /// Nothing to do
    Clean,
}

/// Marks a slot busy for the duration of a transition
struct Flight<'a>(&'a Slot);

impl<'a> Flight<'a> {
    fn begin(slot: &'a Slot) -> Self {
        slot.cancel.store(false, Ordering::SeqCst);
        slot.in_flight.store(true, Ordering::SeqCst);
        Flight(slot)
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
        self.0.cancel.store(false, Ordering::SeqCst);
    }
}

/// Result of releasing an instance
#[derive(Debug, Default)]
struct Teardown {
    /// Best-effort steps that failed
    failures: usize,
    /// Set when the kernel jail could not be removed
    stuck: Option<Error>,
}

/// The lifecycle engine
pub struct Helm {
    storage: StorageLayer,
    props: PropertyStore,
    kernel: Arc<dyn JailKernel>,
    network: NetworkConfigurator,
    bulkhead: Bulkhead,
    arena: Mutex<HashMap<String, Arc<Slot>>>,
    create_lock: Mutex<()>,
    /// Held from a name availability check until the name is stored
    names: Mutex<()>,
    settings: HelmSettings,
}

impl Helm {
    /// Build the engine and load every persisted spec
    pub fn new(
        storage: StorageLayer,
        props: PropertyStore,
        kernel: Arc<dyn JailKernel>,
        network: NetworkConfigurator,
        bulkhead: Bulkhead,
        settings: HelmSettings,
    ) -> Result<Self> {
        let loaded = props.load_all(&storage)?;
        info!(jails = loaded, root = %storage.root(), "specs loaded");
        Ok(Self {
            storage,
            props,
            kernel,
            network,
            bulkhead,
            arena: Mutex::new(HashMap::new()),
            create_lock: Mutex::new(()),
            names: Mutex::new(()),
            settings,
        })
    }

    pub fn settings(&self) -> &HelmSettings {
        &self.settings
    }

    pub fn kernel(&self) -> &dyn JailKernel {
        self.kernel.as_ref()
    }

    pub fn storage(&self) -> &StorageLayer {
        &self.storage
    }

    /// Every spec, ordered by id
    pub fn specs(&self) -> Vec<Arc<JailSpec>> {
        self.props.all()
    }

    /// Effective value of a property
    pub fn resolve(&self, spec: &JailSpec, key: &str) -> Option<String> {
        self.props.resolve(spec, key)
    }

    /// Current state of a jail by id
    pub fn state(&self, id: &str) -> JailState {
        self.existing_slot(id)
            .map(|slot| slot.view().0)
            .unwrap_or(JailState::Defined)
    }

    fn slot(&self, id: &str) -> Arc<Slot> {
        let mut arena = self.arena.lock().unwrap_or_else(PoisonError::into_inner);
        arena
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    fn existing_slot(&self, id: &str) -> Option<Arc<Slot>> {
        let arena = self.arena.lock().unwrap_or_else(PoisonError::into_inner);
        arena.get(id).cloned()
    }

    /// Re-read a spec after taking its slot; it may have been destroyed meanwhile
    fn spec(&self, id: &str) -> Result<Arc<JailSpec>> {
        self.props.get(id).ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn fire(
        &self,
        id: &str,
        slot: &Slot,
        state: &mut SlotState,
        operation: &str,
        event: fn(&mut Lifecycle) -> std::result::Result<(), state_machines::DynamicError>,
    ) -> Result<()> {
        let before = state.lifecycle.state();
        event(&mut state.lifecycle).map_err(|_| Error::InvalidState {
            jail: id.to_string(),
            state: before.to_string(),
            operation: operation.to_string(),
        })?;
        slot.publish(state);
        debug!(jail = %id, from = %before, to = %state.lifecycle.state(), "transition");
        Ok(())
    }

    fn checkpoint(&self, id: &str, slot: &Slot) -> Result<()> {
        if slot.cancel.swap(false, Ordering::SeqCst) {
            info!(jail = %id, "transition cancelled");
            return Err(Error::Cancelled(id.to_string()));
        }
        Ok(())
    }

    fn record(&self, instance: &JailInstance) {
        if let Err(e) = instance.save(&self.settings.state_dir) {
            warn!(jail = %instance.id, error = %e, "failed to write runtime record");
        }
    }

    fn discard_record(&self, id: &str) {
        if let Err(e) = JailInstance::discard(&self.settings.state_dir, id) {
            warn!(jail = %id, error = %e, "failed to remove runtime record");
        }
    }

    /// Take the jail's cross-process record lock, waiting for the holder
    fn lease(&self, id: &str) -> Result<RecordLock> {
        RecordLock::acquire(&self.settings.state_dir, id)
    }

    /// Pick up whatever another process left in the jail's record
    fn refresh(&self, id: &str, slot: &Slot, state: &mut SlotState) {
        match self.settle_locked(id, slot, state) {
            Ok(Settled::Clean) => {}
            Ok(outcome) => debug!(jail = %id, ?outcome, "runtime record settled"),
            Err(e) => warn!(jail = %id, error = %e, "failed to settle runtime record"),
        }
    }

    fn stop_policy(&self, spec: &JailSpec) -> StopPolicy {
        let timeout = self
            .props
            .resolve(spec, "stop_timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        StopPolicy {
            exec_stop: self.props.resolve(spec, "exec_stop"),
            timeout: Duration::from_secs(timeout),
            poll: self.settings.stop_poll,
        }
    }

    // ----------------------------------------------------------------------
    // Creation
    // ----------------------------------------------------------------------

    /// Create a jail from an empty dataset, a release, a template or another jail
    pub fn create(&self, req: CreateRequest) -> Result<Arc<JailSpec>> {
        let _serial = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        let id = req.id.clone().unwrap_or_else(|| req.name.clone());
        validate_name(&id)?;
        validate_name(&req.name)?;

        if self.props.get(&id).is_some() {
            return Err(Error::AlreadyExists(id));
        }
        if self.props.name_taken(&req.name, None) || self.props.name_taken(&id, None) {
            return Err(Error::NameConflict(req.name.clone()));
        }

        let as_template = req.update.template_flag().unwrap_or(false);
        let dataset = self.storage.jail_dataset(&id, as_template);
        if self.storage.exists(&dataset) {
            return Err(Error::AlreadyExists(dataset));
        }

        // Origin snapshot, whether we take it ourselves, and the spec to copy from
        let (origin, base) = match &req.source {
            Source::Empty => (None, None),
            Source::Release(release) => {
                let source = self.storage.release_dataset(release);
                if !self.storage.exists(&source) {
                    return Err(Error::NotFound(source));
                }
                (Some((format!("{}@{}", source, id), true)), None)
            }
            Source::Template(template) => {
                let template = self
                    .props
                    .find(template)
                    .ok()
                    .filter(|t| t.is_template())
                    .ok_or_else(|| Error::TemplateNotFound(template.clone()))?;
                (Some((format!("{}@{}", template.dataset, id), true)), Some(template))
            }
            Source::Clone { jail, snapshot } => {
                let source = self.props.find(jail)?;
                let origin = match snapshot {
                    Some(snap) => (format!("{}@{}", source.dataset, snap), false),
                    None => (format!("{}@{}", source.dataset, id), true),
                };
                (Some(origin), Some(source))
            }
        };

        let spec = match &base {
            Some(base) => materialize_clone(base, &id, &req.name, &dataset, &req.update)?,
            None => req.update.apply(&JailSpec::new(&id, &req.name, &dataset))?,
        };
        if spec.name != req.name && self.props.name_taken(&spec.name, None) {
            return Err(Error::NameConflict(spec.name.clone()));
        }
        spec.network.validate()?;
        Bulkhead::validate(&spec.limits)?;

        let storage_props: Vec<(String, String)> = spec
            .properties
            .iter()
            .filter(|(k, _)| STORAGE_KEYS.contains(&k.as_str()))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();

        let taken = match &origin {
            None => {
                self.storage
                    .create(&dataset, &storage_props)
                    .map_err(|e| e.in_jail(&id, Component::Storage))?;
                None
            }
            Some((snapshot, ours)) => {
                if *ours {
                    let (owner, name) = split_snapshot(snapshot)
                        .ok_or_else(|| Error::NotFound(snapshot.clone()))?;
                    self.storage
                        .snapshot(owner, name)
                        .map_err(|e| e.in_jail(&id, Component::Storage))?;
                }
                let taken = ours.then(|| snapshot.clone());
                if let Err(e) = self.storage.clone_from(snapshot, &dataset, &storage_props) {
                    self.drop_snapshot(taken.as_deref());
                    return Err(e.in_jail(&id, Component::Storage));
                }
                taken
            }
        };

        if let Err(e) = properties::persist(&self.storage, &spec) {
            warn!(jail = %id, error = %e, "persisting spec failed, removing dataset");
            if let Err(cleanup) = self.storage.destroy(&dataset, DestroyOptions { recursive_snapshots: true }) {
                warn!(jail = %id, error = %cleanup, "cleanup of new dataset failed");
            }
            self.drop_snapshot(taken.as_deref());
            return Err(e.in_jail(&id, Component::Properties));
        }

        info!(
            jail = %id,
            name = %spec.name,
            dataset = %dataset,
            origin = origin.as_ref().map(|(s, _)| s.as_str()).unwrap_or("-"),
            "jail created"
        );
        Ok(self.props.insert(spec))
    }

    fn drop_snapshot(&self, snapshot: Option<&str>) {
        if let Some(snapshot) = snapshot {
            if let Err(e) = self.storage.destroy_snapshot(snapshot) {
                warn!(snapshot = %snapshot, error = %e, "failed to remove snapshot");
            }
        }
    }

    // ----------------------------------------------------------------------
    // Start / stop
    // ----------------------------------------------------------------------

    /// Start a jail; starting a running jail is a no-op
    pub fn start(&self, query: &str) -> Result<()> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let mut state = slot.lock();
        let _flight = Flight::begin(&slot);
        let _lease = self.lease(&id)?;
        self.refresh(&id, &slot, &mut state);
        let spec = self.spec(&id)?;
        self.start_locked(&spec, &slot, &mut state)
    }

    fn start_locked(&self, spec: &JailSpec, slot: &Slot, state: &mut SlotState) -> Result<()> {
        let id = spec.id.as_str();
        match state.lifecycle.state() {
            JailState::Running => {
                debug!(jail = %id, "already running");
                return Ok(());
            }
            JailState::Defined => {}
            other => {
                return Err(Error::InvalidState {
                    jail: id.to_string(),
                    state: other.to_string(),
                    operation: "start".into(),
                });
            }
        }
        if spec.is_template() {
            return Err(Error::InvalidState {
                jail: id.to_string(),
                state: "template".into(),
                operation: "start".into(),
            });
        }

        self.fire(id, slot, state, "start", Lifecycle::start)?;

        if !self.storage.present_on_pool(&spec.dataset) {
            self.fire(id, slot, state, "start", Lifecycle::fail)?;
            let err = Error::StorageInconsistent {
                jail: id.to_string(),
                reason: format!("dataset '{}' is missing", spec.dataset),
            };
            warn!(jail = %id, error = %err, "start failed");
            return Err(err.in_jail(id, Component::Storage));
        }

        let mut instance = JailInstance::new(id, &spec.dataset);
        match self.bring_up(spec, slot, &mut instance) {
            Ok(()) => {
                self.record(&instance);
                state.instance = Some(instance);
                self.fire(id, slot, state, "start", Lifecycle::started)?;
                info!(jail = %id, jid = ?state.instance.as_ref().and_then(|i| i.jid), "jail started");
                Ok(())
            }
            Err(e) => {
                warn!(jail = %id, error = %e, "start failed, rolling back");
                let policy = StopPolicy {
                    exec_stop: None,
                    timeout: Duration::ZERO,
                    poll: self.settings.stop_poll,
                };
                let teardown = self.teardown(id, &mut instance, &policy);
                if let Some(stuck) = teardown.stuck {
                    warn!(jail = %id, error = %stuck, "rollback left the kernel jail behind");
                    self.record(&instance);
                    state.instance = Some(instance);
                    self.fire(id, slot, state, "start", Lifecycle::fail)?;
                    return Err(e);
                }
                if teardown.failures > 0 {
                    warn!(jail = %id, failures = teardown.failures, "rollback incomplete");
                }
                self.discard_record(id);
                self.fire(id, slot, state, "start", Lifecycle::rollback)?;
                Err(e)
            }
        }
    }

    /// Acquire every start resource, recording each in `instance`
    fn bring_up(&self, spec: &JailSpec, slot: &Slot, instance: &mut JailInstance) -> Result<()> {
        let id = spec.id.as_str();
        let resolved = self.props.resolved(spec);

        self.checkpoint(id, slot)?;
        let root = self
            .storage
            .mount(&spec.dataset)
            .map_err(|e| e.in_jail(id, Component::Storage))?;
        instance.mountpoint = Some(root.clone());
        instance.push(Resource::Mount {
            dataset: spec.dataset.clone(),
        });
        self.record(instance);

        if resolved.get("mount.devfs").is_some_and(|v| is_truthy(v)) {
            let ruleset = resolved.get("devfs_ruleset").map(String::as_str).unwrap_or("4");
            self.kernel
                .mount_devfs(&root, ruleset)
                .map_err(|e| e.in_jail(id, Component::Kernel))?;
            instance.push(Resource::Devfs { root: root.clone() });
        }

        self.checkpoint(id, slot)?;
        let name = instance.kernel_name.clone();
        let params = build_params(&name, &spec.network, &resolved);
        let jid = self
            .kernel
            .create(&name, &root, &params)
            .map_err(|e| e.in_jail(id, Component::Kernel))?;
        instance.push(Resource::Kernel { jid, name: name.clone() });
        self.record(instance);
        debug!(jail = %id, jid, "kernel jail created");

        self.checkpoint(id, slot)?;
        let binding = self
            .network
            .attach(id, jid, &spec.network)
            .map_err(|e| e.in_jail(id, Component::Network))?;
        if binding.mode != NetworkMode::None {
            instance.push(Resource::Network(binding));
            self.record(instance);
        }

        self.checkpoint(id, slot)?;
        let applied = self
            .bulkhead
            .apply(&name, &spec.limits)
            .map_err(|e| e.in_jail(id, Component::Limits))?;
        if !applied.is_empty() {
            instance.push(Resource::Limits(applied));
            self.record(instance);
        }

        self.checkpoint(id, slot)?;
        if let Some(cmd) = resolved.get("exec_start").filter(|c| !c.is_empty()) {
            self.kernel
                .exec(jid, cmd)
                .map_err(|e| e.in_jail(id, Component::Launch))?;
        }
        Ok(())
    }

    /// Release an instance's resources, newest first
    ///
    /// Stops at a kernel jail that cannot be removed, leaving it and everything
    /// acquired before it in the instance.
    fn teardown(&self, id: &str, instance: &mut JailInstance, policy: &StopPolicy) -> Teardown {
        let mut out = Teardown::default();
        while let Some(resource) = instance.pop() {
            match resource {
                Resource::Limits(applied) => out.failures += self.bulkhead.release(&applied),
                Resource::Network(binding) => out.failures += self.network.detach(&binding),
                Resource::Kernel { jid, name } => {
                    if let Err(e) = self.remove_kernel(id, jid, &name, policy) {
                        instance.push(Resource::Kernel { jid, name });
                        out.stuck = Some(e.in_jail(id, Component::Kernel));
                        break;
                    }
                }
                Resource::Devfs { root } => {
                    if let Err(e) = self.kernel.unmount_devfs(&root) {
                        warn!(jail = %id, root = %root.display(), error = %e, "devfs unmount failed");
                        out.failures += 1;
                    }
                }
                Resource::Mount { dataset } => {
                    let unmounted = self
                        .storage
                        .unmount(&dataset, false)
                        .or_else(|_| self.storage.unmount(&dataset, true));
                    if let Err(e) = unmounted {
                        warn!(jail = %id, dataset = %dataset, error = %e, "unmount failed");
                        out.failures += 1;
                    }
                }
            }
        }
        out
    }

    fn remove_kernel(&self, id: &str, jid: i32, name: &str, policy: &StopPolicy) -> Result<()> {
        match self.kernel.find(name) {
            Ok(Some(live)) if live == jid => {}
            Ok(_) => {
                debug!(jail = %id, jid, "kernel jail already gone");
                return Ok(());
            }
            Err(e) => warn!(jail = %id, error = %e, "kernel jail lookup failed"),
        }

        if terminate(self.kernel.as_ref(), jid, id, policy) {
            info!(jail = %id, "processes killed after stop timeout");
        }
        self.kernel.remove(jid)?;
        if self.kernel.find(name)?.is_some() {
            return Err(Error::JailRemoveFailed);
        }
        debug!(jail = %id, jid, "kernel jail removed");
        Ok(())
    }

    /// Stop a jail; stopping a defined jail is a no-op
    pub fn stop(&self, query: &str) -> Result<()> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let mut state = slot.lock();
        let _flight = Flight::begin(&slot);
        let _lease = self.lease(&id)?;
        self.refresh(&id, &slot, &mut state);
        let spec = self.spec(&id)?;
        self.stop_locked(&spec, &slot, &mut state)
    }

    fn stop_locked(&self, spec: &JailSpec, slot: &Slot, state: &mut SlotState) -> Result<()> {
        let id = spec.id.as_str();
        match state.lifecycle.state() {
            JailState::Defined => {
                debug!(jail = %id, "not running");
                return Ok(());
            }
            JailState::Running => {}
            other => {
                return Err(Error::InvalidState {
                    jail: id.to_string(),
                    state: other.to_string(),
                    operation: "stop".into(),
                });
            }
        }

        self.fire(id, slot, state, "stop", Lifecycle::stop)?;
        let mut instance = state
            .instance
            .take()
            .unwrap_or_else(|| JailInstance::new(id, &spec.dataset));
        let teardown = self.teardown(id, &mut instance, &self.stop_policy(spec));

        if let Some(stuck) = teardown.stuck {
            warn!(jail = %id, error = %stuck, "kernel jail survived stop");
            self.record(&instance);
            state.instance = Some(instance);
            self.fire(id, slot, state, "stop", Lifecycle::fail)?;
            return Err(stuck);
        }

        self.discard_record(id);
        self.fire(id, slot, state, "stop", Lifecycle::stopped)?;
        if teardown.failures > 0 {
            warn!(jail = %id, failures = teardown.failures, "jail stopped with cleanup failures");
        } else {
            info!(jail = %id, "jail stopped");
        }
        Ok(())
    }

    /// Stop then start; not atomic
    pub fn restart(&self, query: &str) -> Result<()> {
        self.stop(query)?;
        self.start(query)
    }

    /// Return a failed jail to Defined, releasing whatever it still holds
    pub fn clear(&self, query: &str) -> Result<()> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let mut state = slot.lock();
        let _flight = Flight::begin(&slot);
        let _lease = self.lease(&id)?;
        let spec = self.spec(&id)?;

        match state.lifecycle.state() {
            JailState::Defined => return Ok(()),
            JailState::Failed => {}
            other => {
                return Err(Error::InvalidState {
                    jail: id,
                    state: other.to_string(),
                    operation: "clear".into(),
                });
            }
        }

        if let Some(mut instance) = state.instance.take() {
            let policy = StopPolicy {
                exec_stop: None,
                timeout: Duration::ZERO,
                poll: self.settings.stop_poll,
            };
            let teardown = self.teardown(&id, &mut instance, &policy);
            if let Some(stuck) = teardown.stuck {
                self.record(&instance);
                state.instance = Some(instance);
                return Err(stuck);
            }
        }
        self.discard_record(&id);
        self.fire(&spec.id, &slot, &mut state, "clear", Lifecycle::clear)?;
        info!(jail = %id, "failure cleared");
        Ok(())
    }

    /// Cancel the transition in flight for a jail
    ///
    /// Observed between sub-steps; the transition rolls back. Returns whether
    /// a transition was in flight.
    pub fn cancel(&self, query: &str) -> Result<bool> {
        let id = self.props.find(query)?.id.clone();
        match self.existing_slot(&id) {
            Some(slot) if slot.in_flight.load(Ordering::SeqCst) => {
                slot.cancel.store(true, Ordering::SeqCst);
                info!(jail = %id, "cancellation requested");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ----------------------------------------------------------------------
    // Destruction
    // ----------------------------------------------------------------------

    /// Destroy a jail, its dataset and snapshots
    ///
    /// With `force`, a running jail is stopped first.
    pub fn destroy(&self, query: &str, force: bool) -> Result<()> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let mut state = slot.lock();
        let _flight = Flight::begin(&slot);
        let _lease = self.lease(&id)?;
        self.refresh(&id, &slot, &mut state);
        let spec = self.spec(&id)?;

        match state.lifecycle.state() {
            JailState::Defined => {}
            JailState::Running if force => self.stop_locked(&spec, &slot, &mut state)?,
            JailState::Starting | JailState::Running | JailState::Stopping => {
                return Err(Error::Busy(id));
            }
            other => {
                return Err(Error::InvalidState {
                    jail: id,
                    state: other.to_string(),
                    operation: "destroy".into(),
                });
            }
        }

        let dependents = self.storage.dependents(&spec.dataset);
        if !dependents.is_empty() {
            let dependents = dependents.iter().map(|d| self.describe_dataset(d)).collect();
            return Err(Error::HasDependents {
                target: id,
                dependents,
            });
        }

        self.fire(&id, &slot, &mut state, "destroy", Lifecycle::destroy)?;
        let origin = match self
            .storage
            .destroy(&spec.dataset, DestroyOptions { recursive_snapshots: true })
        {
            Ok(origin) => origin,
            Err(e) => {
                self.fire(&id, &slot, &mut state, "destroy", Lifecycle::restore)?;
                return Err(e.in_jail(&id, Component::Storage));
            }
        };

        // The snapshot taken for this clone goes with it once unreferenced
        if let Some(origin) = origin {
            let ours = split_snapshot(&origin).is_some_and(|(_, name)| name == id);
            if ours && self.storage.clones_of(&origin).is_empty() {
                self.drop_snapshot(Some(&origin));
            }
        }

        self.props.remove(&id);
        self.discard_record(&id);
        drop(state);
        self.arena
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        info!(jail = %id, dataset = %spec.dataset, "jail destroyed");
        Ok(())
    }

    /// Jail name for a dataset when it belongs to one
    fn describe_dataset(&self, dataset: &str) -> String {
        self.props
            .all()
            .into_iter()
            .find(|s| s.dataset == dataset)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| dataset.to_string())
    }

    // ----------------------------------------------------------------------
    // Spec edits
    // ----------------------------------------------------------------------

    /// Apply `key=value` edits to a jail
    ///
    /// Changes take effect on the next start of a running jail.
    pub fn set(&self, query: &str, update: &SpecUpdate) -> Result<Arc<JailSpec>> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let state = slot.lock();
        let _flight = Flight::begin(&slot);
        let spec = self.spec(&id)?;
        let _names = update
            .name
            .as_ref()
            .map(|_| self.names.lock().unwrap_or_else(PoisonError::into_inner));

        if let Some(name) = &update.name {
            if name != &spec.name && self.props.name_taken(name, Some(&id)) {
                return Err(Error::NameConflict(name.clone()));
            }
        }

        let mut next = update.apply(&spec)?;
        Bulkhead::validate(&next.limits)?;
        if next.is_template() && next.network.mode == NetworkMode::Isolated {
            debug!(jail = %id, "template keeps its network declaration for clones");
        }

        let move_to = match update.template_flag() {
            Some(flag) if flag != spec.is_template() => {
                let current = state.lifecycle.state();
                if current != JailState::Defined {
                    return Err(Error::InvalidState {
                        jail: id,
                        state: current.to_string(),
                        operation: "change template flag".into(),
                    });
                }
                Some(self.storage.jail_dataset(&id, flag))
            }
            _ => None,
        };

        if update.touches_storage() {
            let name = format!("auto-{}", unix_now());
            match self.storage.snapshot(&spec.dataset, &name) {
                Ok(_) => info!(jail = %id, snapshot = %name, "snapshot taken before storage change"),
                Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e.in_jail(&id, Component::Storage)),
            }
        }

        if let Some(target) = &move_to {
            self.storage
                .rename(&spec.dataset, target)
                .map_err(|e| e.in_jail(&id, Component::Storage))?;
            next.dataset = target.clone();
        }

        if let Err(e) = properties::persist(&self.storage, &next) {
            if move_to.is_some() {
                if let Err(back) = self.storage.rename(&next.dataset, &spec.dataset) {
                    warn!(jail = %id, error = %back, "failed to move dataset back");
                }
            }
            return Err(e.in_jail(&id, Component::Properties));
        }

        if state.lifecycle.state() == JailState::Running {
            info!(jail = %id, "spec updated; takes effect on next start");
        } else {
            info!(jail = %id, "spec updated");
        }
        Ok(self.props.insert(next))
    }

    /// Refresh inherited values from the jail's template
    pub fn reapply_template(&self, query: &str) -> Result<Arc<JailSpec>> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let _state = slot.lock();
        let _flight = Flight::begin(&slot);
        let spec = self.spec(&id)?;

        let template_id = spec.template.clone().ok_or_else(|| Error::InvalidState {
            jail: id.clone(),
            state: "not created from a template".into(),
            operation: "reapply".into(),
        })?;
        let template = self
            .props
            .get(&template_id)
            .ok_or_else(|| Error::TemplateNotFound(template_id.clone()))?;

        let next = properties::reapply_template(&spec, &template);
        properties::persist(&self.storage, &next).map_err(|e| e.in_jail(&id, Component::Properties))?;
        info!(jail = %id, template = %template_id, "template values reapplied");
        Ok(self.props.insert(next))
    }

    // ----------------------------------------------------------------------
    // Snapshots
    // ----------------------------------------------------------------------

    /// Snapshot a jail's dataset
    pub fn snapshot(&self, query: &str, name: Option<&str>) -> Result<SnapshotInfo> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let _state = slot.lock();
        let _flight = Flight::begin(&slot);
        let spec = self.spec(&id)?;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("snap-{}", unix_now()));
        let info = self
            .storage
            .snapshot(&spec.dataset, &name)
            .map_err(|e| e.in_jail(&spec.id, Component::Storage))?;
        info!(jail = %spec.id, snapshot = %name, "snapshot taken");
        Ok(info)
    }

    pub fn snapshots(&self, query: &str) -> Result<Vec<SnapshotInfo>> {
        let spec = self.props.find(query)?;
        Ok(self.storage.snapshots(&spec.dataset))
    }

    /// Destroy one of a jail's snapshots
    ///
    /// Refused while any dataset is cloned from it.
    pub fn remove_snapshot(&self, query: &str, snapshot: &str) -> Result<()> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let _state = slot.lock();
        let _flight = Flight::begin(&slot);
        let spec = self.spec(&id)?;

        let full = format!("{}@{}", spec.dataset, snapshot);
        if !self.storage.snapshots(&spec.dataset).iter().any(|s| s.name == snapshot) {
            return Err(Error::NotFound(full));
        }
        let clones = self.storage.clones_of(&full);
        if !clones.is_empty() {
            return Err(Error::HasDependents {
                target: full,
                dependents: clones.iter().map(|d| self.describe_dataset(d)).collect(),
            });
        }
        self.storage
            .destroy_snapshot(&full)
            .map_err(|e| e.in_jail(&id, Component::Storage))?;
        info!(jail = %id, snapshot = %snapshot, "snapshot removed");
        Ok(())
    }

    /// Roll a stopped jail back to one of its snapshots
    pub fn rollback(&self, query: &str, snapshot: &str) -> Result<Vec<String>> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let state = slot.lock();
        let _flight = Flight::begin(&slot);
        let spec = self.spec(&id)?;

        let current = state.lifecycle.state();
        if current != JailState::Defined {
            return Err(Error::InvalidState {
                jail: id,
                state: current.to_string(),
                operation: "rollback".into(),
            });
        }

        let full = format!("{}@{}", spec.dataset, snapshot);
        let discarded = self
            .storage
            .rollback(&full)
            .map_err(|e| e.in_jail(&id, Component::Storage))?;

        // Dataset properties rolled back with the data
        match properties::load(&self.storage, &spec.dataset) {
            Ok(Some(restored)) => {
                self.props.insert(restored);
            }
            Ok(None) => warn!(jail = %id, "snapshot carries no spec, keeping current one"),
            Err(e) => warn!(jail = %id, error = %e, "failed to reload spec after rollback"),
        }
        info!(jail = %id, snapshot = %snapshot, discarded = discarded.len(), "rolled back");
        Ok(discarded)
    }

    /// Make a cloned jail independent of its origin
    pub fn promote(&self, query: &str) -> Result<()> {
        let id = self.props.find(query)?.id.clone();
        let slot = self.slot(&id);
        let _state = slot.lock();
        let _flight = Flight::begin(&slot);
        let spec = self.spec(&id)?;
        self.storage
            .promote(&spec.dataset)
            .map_err(|e| e.in_jail(&id, Component::Storage))
    }

    // ----------------------------------------------------------------------
    // Views
    // ----------------------------------------------------------------------

    fn summary(&self, spec: &JailSpec) -> JailSummary {
        let (state, jid) = self
            .existing_slot(&spec.id)
            .map(|slot| slot.view())
            .unwrap_or((JailState::Defined, None));
        let mountpoint = self.storage.dataset(&spec.dataset).ok().map(|d| d.mountpoint);
        JailSummary {
            id: spec.id.clone(),
            name: spec.name.clone(),
            state: state.to_string(),
            jid,
            template: spec.is_template(),
            dataset: spec.dataset.clone(),
            origin: self.storage.origin(&spec.dataset),
            mountpoint,
        }
    }

    /// Every jail with its state
    pub fn list(&self) -> Vec<JailSummary> {
        self.props.all().iter().map(|s| self.summary(s)).collect()
    }

    /// Look up by id, name or unique id prefix
    pub fn get(&self, query: &str) -> Result<JailView> {
        let spec = self.props.find(query)?;
        let defaults = self.props.defaults();
        let properties = self
            .props
            .resolved(&spec)
            .into_iter()
            .map(|(key, value)| {
                let source = match spec.properties.get(&key).map(|e| &e.source) {
                    Some(PropertySource::Explicit) => "explicit".to_string(),
                    Some(PropertySource::Inherited { template }) => format!("inherited:{}", template),
                    None if defaults.contains_key(&key) => "default".to_string(),
                    None => "derived".to_string(),
                };
                (key, ResolvedProperty { value, source })
            })
            .collect();

        Ok(JailView {
            summary: self.summary(&spec),
            created_from: spec.template.clone(),
            limits: spec.limits.clone(),
            network: spec.network.clone(),
            properties,
        })
    }

    // ----------------------------------------------------------------------
    // Reconciliation hooks
    // ----------------------------------------------------------------------

    /// Adopt or release a jail's runtime record unless another process holds it
    pub fn settle(&self, id: &str) -> Result<Settled> {
        let slot = self.slot(id);
        let mut state = slot.lock();
        let Some(_lease) = RecordLock::try_acquire(&self.settings.state_dir, id)? else {
            debug!(jail = %id, "record held by another process, leaving it alone");
            return Ok(Settled::Busy);
        };
        self.settle_locked(id, &slot, &mut state)
    }

    /// Caller holds the slot and the record lock
    fn settle_locked(&self, id: &str, slot: &Slot, state: &mut SlotState) -> Result<Settled> {
        if state.lifecycle.state() != JailState::Defined {
            return Ok(Settled::Clean);
        }
        let Some(record) = JailInstance::load(&self.settings.state_dir, id)? else {
            return Ok(Settled::Clean);
        };

        let live = self.kernel.find(&record.kernel_name)?;
        let known = self.props.get(id).is_some();
        if live.is_some() && live == record.jid && known {
            self.adopt_locked(record, slot, state)?;
            return Ok(Settled::Adopted);
        }
        if live.is_some() {
            warn!(jail = %id, "record does not match the running kernel jail, releasing");
        } else {
            debug!(jail = %id, "kernel jail gone, releasing record");
        }
        Ok(Settled::Released(self.release_locked(record, live.is_none())))
    }

    /// Take over a jail found running from a runtime record
    fn adopt_locked(&self, record: JailInstance, slot: &Slot, state: &mut SlotState) -> Result<()> {
        let id = record.id.clone();
        for resource in &record.acquired {
            if let Resource::Network(binding) = resource {
                self.network
                    .adopt(binding)
                    .map_err(|e| e.in_jail(&id, Component::Network))?;
            }
        }
        state
            .lifecycle
            .adopt()
            .map_err(|_| Error::InvalidState {
                jail: id.clone(),
                state: state.lifecycle.state().to_string(),
                operation: "adopt".into(),
            })?;
        state.instance = Some(record);
        slot.publish(state);
        info!(jail = %id, jid = ?state.instance.as_ref().and_then(|i| i.jid), "running jail adopted");
        Ok(())
    }

    /// Release what a record left behind after its kernel jail disappeared
    ///
    /// With `purge`, every rctl rule scoped to the kernel jail name goes too.
    /// Returns the number of steps that failed.
    fn release_locked(&self, mut record: JailInstance, purge: bool) -> usize {
        let policy = StopPolicy {
            exec_stop: None,
            timeout: Duration::ZERO,
            poll: self.settings.stop_poll,
        };
        let id = record.id.clone();
        let teardown = self.teardown(&id, &mut record, &policy);
        let mut failures = teardown.failures;
        if let Some(stuck) = teardown.stuck {
            warn!(jail = %id, error = %stuck, "stale record still has a kernel jail");
            failures += 1;
            self.record(&record);
        } else {
            // Rules applied after the record was last written
            if purge {
                if let Err(e) = self.bulkhead.purge(&record.kernel_name) {
                    warn!(jail = %id, error = %e, "failed to purge leftover limits");
                    failures += 1;
                }
            }
            self.discard_record(&id);
        }
        info!(jail = %id, failures, "stale runtime record released");
        failures
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "on" | "yes" | "true")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{Harness, MemoryPool};
    use std::sync::Barrier;
    use std::thread;

    fn web1_update() -> SpecUpdate {
        SpecUpdate::parse(&[
            "vnet=on",
            "interfaces=vnet0:bridge0",
            "ip4_addr=vnet0|10.0.0.5/24",
            "memoryuse=512M:1G:deny",
        ])
        .unwrap()
    }

    fn base_template(h: &Harness) {
        h.helm
            .create(
                CreateRequest::new("base", Source::Release("14.1-RELEASE".into()))
                    .with_update(SpecUpdate::parse(&["template=yes", "allow.raw_sockets=1"]).unwrap()),
            )
            .unwrap();
    }

    #[test]
    fn test_create_empty_and_start_stop() {
        let h = Harness::new();
        let spec = h
            .helm
            .create(CreateRequest::new("a", Source::Empty))
            .unwrap();
        assert_eq!(spec.dataset, "zroot/brig/jails/a");
        assert_eq!(h.helm.state("a"), JailState::Defined);

        h.helm.start("a").unwrap();
        assert_eq!(h.helm.state("a"), JailState::Running);
        assert_eq!(h.kernel.alive(), 1);
        assert!(h.pool.is_mounted_raw("zroot/brig/jails/a"));

        h.helm.stop("a").unwrap();
        assert_eq!(h.helm.state("a"), JailState::Defined);
        assert_eq!(h.kernel.alive(), 0);
        assert!(!h.pool.is_mounted_raw("zroot/brig/jails/a"));
    }

    #[test]
    fn test_start_stop_start_is_idempotent() {
        let h = Harness::new();
        base_template(&h);
        h.helm
            .create(CreateRequest::new("web1", Source::Template("base".into())).with_update(web1_update()))
            .unwrap();

        h.helm.start("web1").unwrap();
        let first = h.kernel.params("brig-web1").unwrap();
        h.helm.start("web1").unwrap();
        assert_eq!(h.kernel.created_total(), 1);

        h.helm.stop("web1").unwrap();
        h.helm.stop("web1").unwrap();
        assert_eq!(h.net.interface_count(), 0);
        assert_eq!(h.rctl.count(), 0);

        h.helm.start("web1").unwrap();
        assert_eq!(h.kernel.params("brig-web1").unwrap(), first);
        assert_eq!(h.helm.state("web1"), JailState::Running);
    }

    #[test]
    fn test_web1_from_base() {
        let h = Harness::new();
        base_template(&h);
        h.helm
            .create(CreateRequest::new("web1", Source::Template("base".into())).with_update(web1_update()))
            .unwrap();

        h.helm.start("web1").unwrap();
        let view = h.helm.get("web1").unwrap();
        assert_eq!(view.summary.state, "running");
        assert_eq!(view.summary.origin.as_deref(), Some("zroot/brig/templates/base@web1"));
        assert_eq!(view.created_from.as_deref(), Some("base"));
        assert_eq!(view.properties["allow.raw_sockets"].source, "inherited:base");
        assert_eq!(view.properties["securelevel"].source, "default");

        let jid = view.summary.jid.unwrap();
        assert_eq!(h.net.configured(jid), vec!["10.0.0.5/24".to_string()]);
        assert_eq!(h.rctl.count(), 2);
        assert!(h.rctl.has_rule("jail:brig-web1:memoryuse:deny=536870912"));

        let err = h.helm.destroy("base", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HasDependents);
        assert!(err.to_string().contains("web1"));

        let err = h.helm.destroy("web1", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        h.helm.destroy("web1", true).unwrap();
        assert!(h.helm.get("web1").is_err());
        assert_eq!(h.net.interface_count(), 0);
        assert_eq!(h.rctl.count(), 0);
        // The per-clone snapshot went with the clone
        assert!(h.helm.snapshots("base").unwrap().is_empty());
        h.helm.destroy("base", false).unwrap();
    }

    #[test]
    fn test_template_cannot_start() {
        let h = Harness::new();
        base_template(&h);
        let err = h.helm.start("base").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(h.kernel.created_total(), 0);
    }

    #[test]
    fn test_create_errors() {
        let h = Harness::new();
        base_template(&h);
        h.helm.create(CreateRequest::new("web1", Source::Empty)).unwrap();

        let err = h
            .helm
            .create(CreateRequest::new("web2", Source::Template("nope".into())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateNotFound);

        // A regular jail is not a template
        let err = h
            .helm
            .create(CreateRequest::new("web2", Source::Template("web1".into())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateNotFound);

        let err = h.helm.create(CreateRequest::new("web1", Source::Empty)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let mut req = CreateRequest::new("web1", Source::Empty);
        req.id = Some("other".into());
        let err = h.helm.create(req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameConflict);

        let err = h
            .helm
            .create(CreateRequest::new("x", Source::Release("13.0-RELEASE".into())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_create_capacity_cleans_up() {
        let h = Harness::new();
        base_template(&h);
        h.pool.set_available(1024);
        let err = h
            .helm
            .create(
                CreateRequest::new("big", Source::Template("base".into()))
                    .with_update(SpecUpdate::parse(&["reservation=10G"]).unwrap()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        assert!(h.helm.snapshots("base").unwrap().is_empty());
        assert!(h.helm.get("big").is_err());
    }

    #[test]
    fn test_template_edit_isolated_from_clone() {
        let h = Harness::new();
        base_template(&h);
        h.helm
            .create(CreateRequest::new("web1", Source::Template("base".into())))
            .unwrap();
        let before = h.helm.get("web1").unwrap().properties;

        h.helm
            .set("base", &SpecUpdate::parse(&["allow.raw_sockets=0", "securelevel=3"]).unwrap())
            .unwrap();
        assert_eq!(h.helm.get("web1").unwrap().properties, before);

        h.helm.reapply_template("web1").unwrap();
        let after = h.helm.get("web1").unwrap().properties;
        assert_eq!(after["allow.raw_sockets"].value, "0");
        assert_eq!(after["securelevel"].value, "3");
    }

    #[test]
    fn test_network_failure_rolls_back() {
        let h = Harness::new();
        h.helm
            .create(CreateRequest::new("web1", Source::Empty).with_update(web1_update()))
            .unwrap();
        h.net.fail_on("move");

        let err = h.helm.start("web1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Failed);
        assert!(matches!(err, Error::Jail { component: Component::Network, .. }));
        assert_eq!(h.helm.state("web1"), JailState::Defined);
        assert_eq!(h.net.interface_count(), 0);
        assert_eq!(h.rctl.count(), 0);
        assert_eq!(h.kernel.alive(), 0);
        assert!(!h.pool.is_mounted_raw("zroot/brig/jails/web1"));
    }

    #[test]
    fn test_limit_failure_rolls_back() {
        let h = Harness::new();
        let update = SpecUpdate::parse(&[
            "vnet=on",
            "ip4_addr=vnet0|10.0.0.5/24",
            "memoryuse=512M:1G:deny",
            "maxproc=100:deny",
        ])
        .unwrap();
        h.helm
            .create(CreateRequest::new("web1", Source::Empty).with_update(update))
            .unwrap();
        h.rctl.fail_on("maxproc");

        let err = h.helm.start("web1").unwrap_err();
        assert!(matches!(err, Error::Jail { component: Component::Limits, .. }));
        assert_eq!(h.net.interface_count(), 0);
        assert_eq!(h.rctl.count(), 0);
        assert_eq!(h.kernel.alive(), 0);
        assert_eq!(h.helm.state("web1"), JailState::Defined);

        // The address was released with the rollback
        h.rctl.heal();
        h.helm.start("web1").unwrap();
    }

    #[test]
    fn test_address_conflict_between_jails() {
        let h = Harness::new();
        for name in ["web1", "web2"] {
            h.helm
                .create(CreateRequest::new(name, Source::Empty).with_update(web1_update()))
                .unwrap();
        }
        h.helm.start("web1").unwrap();
        let err = h.helm.start("web2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressConflict);
        assert_eq!(h.kernel.alive(), 1);
        assert_eq!(h.net.interface_count(), 1);
    }

    #[test]
    fn test_concurrent_starts_create_one_kernel_jail() {
        let h = Harness::new();
        h.helm
            .create(CreateRequest::new("web1", Source::Empty).with_update(web1_update()))
            .unwrap();
        let helm = h.helm.clone();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let helm = helm.clone();
                thread::spawn(move || helm.start("web1"))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(h.kernel.created_total(), 1);
        assert_eq!(h.net.interface_count(), 1);
        assert_eq!(h.helm.state("web1"), JailState::Running);
    }

    #[test]
    fn test_missing_dataset_is_inconsistent() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("a", Source::Empty)).unwrap();
        h.pool.remove_raw("zroot/brig/jails/a");

        let err = h.helm.start("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageInconsistent);
        assert_eq!(h.helm.state("a"), JailState::Failed);

        let err = h.helm.destroy("a", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        h.helm.clear("a").unwrap();
        assert_eq!(h.helm.state("a"), JailState::Defined);
    }

    #[test]
    fn test_stop_escalates_to_kill() {
        let h = Harness::new();
        h.helm
            .create(
                CreateRequest::new("a", Source::Empty)
                    .with_update(SpecUpdate::parse(&["stop_timeout=0"]).unwrap()),
            )
            .unwrap();
        h.kernel.ignore_term(true);
        h.helm.start("a").unwrap();
        let jid = h.helm.get("a").unwrap().summary.jid.unwrap();

        h.helm.stop("a").unwrap();
        assert_eq!(
            h.kernel.signals(jid),
            vec![nix::sys::signal::Signal::SIGTERM, nix::sys::signal::Signal::SIGKILL]
        );
        assert!(h.kernel.execs(jid).contains(&"/bin/sh /etc/rc.shutdown".to_string()));
        assert_eq!(h.helm.state("a"), JailState::Defined);
    }

    #[test]
    fn test_surviving_kernel_jail_fails_stop() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("a", Source::Empty)).unwrap();
        h.helm.start("a").unwrap();
        h.kernel.refuse_remove(true);

        let err = h.helm.stop("a").unwrap_err();
        assert!(matches!(err, Error::Jail { component: Component::Kernel, .. }));
        assert_eq!(h.helm.state("a"), JailState::Failed);
        assert!(h.helm.clear("a").is_err());

        h.kernel.refuse_remove(false);
        h.helm.clear("a").unwrap();
        assert_eq!(h.kernel.alive(), 0);
        assert!(!h.pool.is_mounted_raw("zroot/brig/jails/a"));
    }

    #[test]
    fn test_cancel_rolls_back_start() {
        let h = Harness::new();
        h.helm
            .create(CreateRequest::new("web1", Source::Empty).with_update(web1_update()))
            .unwrap();
        let helm = h.helm.clone();
        h.kernel.on_create(move || {
            assert!(helm.cancel("web1").unwrap());
        });

        let err = h.helm.start("web1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(h.helm.state("web1"), JailState::Defined);
        assert_eq!(h.kernel.alive(), 0);
        assert_eq!(h.net.interface_count(), 0);
        assert!(!h.helm.cancel("web1").unwrap());
    }

    #[test]
    fn test_set_template_flag_moves_dataset() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("a", Source::Empty)).unwrap();
        let spec = h.helm.set("a", &SpecUpdate::parse(&["template=yes"]).unwrap()).unwrap();
        assert_eq!(spec.dataset, "zroot/brig/templates/a");
        assert!(spec.is_template());

        let spec = h.helm.set("a", &SpecUpdate::parse(&["template=no"]).unwrap()).unwrap();
        assert_eq!(spec.dataset, "zroot/brig/jails/a");
        h.helm.start("a").unwrap();

        let err = h
            .helm
            .set("a", &SpecUpdate::parse(&["template=yes"]).unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_set_rename_and_storage_snapshot() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("a", Source::Empty)).unwrap();
        h.helm.create(CreateRequest::new("b", Source::Empty)).unwrap();

        let err = h.helm.set("a", &SpecUpdate::parse(&["name=b"]).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameConflict);

        let spec = h.helm.set("a", &SpecUpdate::parse(&["name=alpha", "quota=5G"]).unwrap()).unwrap();
        assert_eq!(spec.id, "a");
        assert_eq!(h.helm.get("alpha").unwrap().summary.id, "a");
        let snaps = h.helm.snapshots("a").unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].name.starts_with("auto-"));
        assert_eq!(
            h.pool.property("zroot/brig/jails/a", "quota").as_deref(),
            Some("5G")
        );
    }

    #[test]
    fn test_destroy_promote_destroy() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("d", Source::Empty)).unwrap();
        h.helm
            .create(CreateRequest::new(
                "c",
                Source::Clone {
                    jail: "d".into(),
                    snapshot: None,
                },
            ))
            .unwrap();

        let err = h.helm.destroy("d", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HasDependents);

        h.helm.promote("c").unwrap();
        let err = h.helm.promote("c").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoOriginPresent);

        h.helm.destroy("d", false).unwrap();
        assert_eq!(h.helm.get("c").unwrap().summary.origin, None);
        h.helm.start("c").unwrap();
    }

    #[test]
    fn test_snapshot_and_rollback() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("a", Source::Empty)).unwrap();
        h.helm.snapshot("a", Some("clean")).unwrap();
        h.helm.snapshot("a", Some("later")).unwrap();
        let err = h.helm.snapshot("a", Some("clean")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        h.helm.start("a").unwrap();
        let err = h.helm.rollback("a", "clean").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        h.helm.stop("a").unwrap();

        let discarded = h.helm.rollback("a", "clean").unwrap();
        assert_eq!(discarded, vec!["zroot/brig/jails/a@later".to_string()]);
        assert_eq!(h.helm.snapshots("a").unwrap().len(), 1);
    }

    #[test]
    fn test_list_reports_state() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("a", Source::Empty)).unwrap();
        h.helm.create(CreateRequest::new("b", Source::Empty)).unwrap();
        h.helm.start("b").unwrap();

        let list = h.helm.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].state, "defined");
        assert_eq!(list[1].state, "running");
        assert!(list[1].jid.is_some());
        assert_eq!(list[1].mountpoint, Some(PathBuf::from("/zroot/brig/jails/b")));
    }

    #[test]
    fn test_specs_reload_from_pool() {
        let pool = Arc::new(MemoryPool::new());
        let h = Harness::with_pool(pool.clone());
        base_template(&h);
        h.helm
            .create(CreateRequest::new("web1", Source::Template("base".into())).with_update(web1_update()))
            .unwrap();
        let before = h.helm.get("web1").unwrap();

        let reopened = Harness::with_pool(pool);
        let after = reopened.helm.get("web1").unwrap();
        assert_eq!(after.properties, before.properties);
        assert_eq!(after.network, before.network);
        assert_eq!(after.limits, before.limits);
    }
    #[test]
    fn test_second_engine_stop_picks_up_record() {
        let h = Harness::new();
        h.helm
            .create(CreateRequest::new("web1", Source::Empty).with_update(web1_update()))
            .unwrap();
        h.helm.start("web1").unwrap();

        // Another process stops the jail this one started
        let other = h.reopen();
        other.helm.stop("web1").unwrap();
        assert_eq!(other.helm.state("web1"), JailState::Defined);
        assert_eq!(h.kernel.alive(), 0);
        assert_eq!(h.net.interface_count(), 0);
        assert_eq!(h.rctl.count(), 0);
        assert!(!h.pool.is_mounted_raw("zroot/brig/jails/web1"));
        assert!(JailInstance::load(&h.state_dir.0, "web1").unwrap().is_none());
    }

    #[test]
    fn test_settle_leaves_locked_record_alone() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("a", Source::Empty)).unwrap();
        let other = h.reopen();
        let seen = Arc::new(Mutex::new(None));
        let out = seen.clone();
        h.kernel.on_create(move || {
            *out.lock().unwrap() = Some(other.helm.settle("a").unwrap());
        });

        h.helm.start("a").unwrap();
        h.kernel.on_create(|| {});
        assert_eq!(*seen.lock().unwrap(), Some(Settled::Busy));
        assert_eq!(h.helm.state("a"), JailState::Running);
        assert!(h.pool.is_mounted_raw("zroot/brig/jails/a"));

        let later = h.reopen();
        assert_eq!(later.helm.settle("a").unwrap(), Settled::Adopted);
    }

    #[test]
    fn test_settle_purges_leftover_limits() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("a", Source::Empty)).unwrap();
        h.helm.start("a").unwrap();
        let jid = h.helm.get("a").unwrap().summary.jid.unwrap();
        // A rule the record never saw, then the jail dies
        crate::bulkhead::RctlBackend::add_rule(h.rctl.as_ref(), "jail:brig-a:maxproc:deny=10").unwrap();
        h.kernel.kill(jid);

        let other = h.reopen();
        assert_eq!(other.helm.settle("a").unwrap(), Settled::Released(0));
        assert_eq!(h.rctl.count(), 0);
        assert!(!h.pool.is_mounted_raw("zroot/brig/jails/a"));
    }

    #[test]
    fn test_concurrent_renames_to_one_name() {
        let h = Harness::new();
        for id in ["a", "b"] {
            h.helm.create(CreateRequest::new(id, Source::Empty)).unwrap();
        }

        for round in 0..50 {
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|id| {
                    let helm = h.helm.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        helm.set(id, &SpecUpdate::parse(&["name=web"]).unwrap())
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "round {}", round);
            for err in results.iter().filter_map(|r| r.as_ref().err()) {
                assert_eq!(err.kind(), ErrorKind::NameConflict);
            }
            assert_eq!(h.helm.list().iter().filter(|j| j.name == "web").count(), 1);

            for id in ["a", "b"] {
                h.helm
                    .set(id, &SpecUpdate::parse(&[format!("name={}", id)]).unwrap())
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_remove_snapshot() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("d", Source::Empty)).unwrap();
        h.helm.snapshot("d", Some("gold")).unwrap();
        h.helm.snapshot("d", Some("old")).unwrap();
        h.helm
            .create(CreateRequest::new(
                "c",
                Source::Clone {
                    jail: "d".into(),
                    snapshot: Some("gold".into()),
                },
            ))
            .unwrap();

        let err = h.helm.remove_snapshot("d", "gold").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HasDependents);
        assert!(err.to_string().contains("c"));

        h.helm.remove_snapshot("d", "old").unwrap();
        let names: Vec<_> = h.helm.snapshots("d").unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["gold".to_string()]);
        let err = h.helm.remove_snapshot("d", "old").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        h.helm.destroy("c", false).unwrap();
        h.helm.remove_snapshot("d", "gold").unwrap();
        assert!(h.helm.snapshots("d").unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_waits_for_transition() {
        let h = Harness::new();
        h.helm.create(CreateRequest::new("a", Source::Empty)).unwrap();
        let helm = h.helm.clone();
        let pending = Arc::new(Mutex::new(None));
        let out = pending.clone();
        h.kernel.on_create(move || {
            let helm = helm.clone();
            let snap = thread::spawn(move || helm.snapshot("a", Some("mid")).map(|_| ()));
            thread::sleep(Duration::from_millis(50));
            assert!(!snap.is_finished());
            *out.lock().unwrap() = Some(snap);
        });

        h.helm.start("a").unwrap();
        h.kernel.on_create(|| {});
        let snap = pending.lock().unwrap().take().unwrap();
        snap.join().unwrap().unwrap();
        assert_eq!(h.helm.snapshots("a").unwrap().len(), 1);
        assert_eq!(h.helm.state("a"), JailState::Running);
    }

    #[test]
    fn test_shared_start_aliases_and_stop_removes() {
        let h = Harness::new();
        h.net.add_host_address("192.168.1.1/24");
        h.helm
            .create(
                CreateRequest::new("a", Source::Empty)
                    .with_update(SpecUpdate::parse(&["vnet=shared", "ip4_addr=em0|192.168.1.20/24"]).unwrap()),
            )
            .unwrap();
        h.helm
            .create(
                CreateRequest::new("b", Source::Empty)
                    .with_update(SpecUpdate::parse(&["vnet=shared", "ip4_addr=em0|192.168.1.1/24"]).unwrap()),
            )
            .unwrap();

        h.helm.start("a").unwrap();
        assert_eq!(h.net.aliases("em0").len(), 1);
        let err = h.helm.start("b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressConflict);
        assert_eq!(h.helm.state("b"), JailState::Defined);

        h.helm.stop("a").unwrap();
        assert!(h.net.aliases("em0").is_empty());
    }
}
