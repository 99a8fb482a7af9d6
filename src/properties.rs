//! Jail specs and property resolution
//!
//! A property resolves from, in order:
//! 1. an explicit per-jail value
//! 2. the template value copied onto the jail when it was created
//! 3. the global default (builtin table overlaid by `[defaults]`)
//!
//! Template values are materialized at creation; a clone never reads its
//! template live. Specs are stored as `Arc<JailSpec>` and replaced whole on
//! every write, so a reader sees either the old spec or the new one.
//!
//! Specs are persisted as dataset user properties under `org.brig:`.

use crate::bulkhead::{LimitSpec, ResourceClass};
use crate::error::{Error, Result};
use crate::network::{AddressSpec, Assignment, InterfaceSpec, NetworkMode, NetworkSpec};
use crate::storage::StorageLayer;
use crate::units::parse_amount;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Dataset user property namespace
pub const NAMESPACE: &str = "org.brig:";
/// Layout version written to `org.brig:version`
pub const FORMAT_VERSION: &str = "1";

/// Properties stored as native dataset properties instead of user properties
pub const STORAGE_KEYS: &[&str] = &["quota", "reservation", "compression"];

/// Accepted values for a known property
#[derive(Debug, Clone, Copy)]
enum Kind {
    /// 0/1, on/off, yes/no, true/false
    Flag,
    OnOff,
    YesNo,
    Int { min: i64, max: i64 },
    /// new, inherit, disable
    JailSys,
    Size,
    Choice(&'static [&'static str]),
    Text,
}

const KNOWN: &[(&str, Kind)] = &[
    ("securelevel", Kind::Int { min: -1, max: 3 }),
    ("devfs_ruleset", Kind::Int { min: 0, max: 65535 }),
    ("enforce_statfs", Kind::Int { min: 0, max: 2 }),
    ("children.max", Kind::Int { min: 0, max: 65535 }),
    ("allow.set_hostname", Kind::Flag),
    ("allow.sysvipc", Kind::Flag),
    ("allow.raw_sockets", Kind::Flag),
    ("allow.chflags", Kind::Flag),
    ("allow.mlock", Kind::Flag),
    ("allow.mount", Kind::Flag),
    ("allow.mount.devfs", Kind::Flag),
    ("allow.mount.nullfs", Kind::Flag),
    ("allow.mount.procfs", Kind::Flag),
    ("allow.mount.tmpfs", Kind::Flag),
    ("allow.mount.zfs", Kind::Flag),
    ("allow.quotas", Kind::Flag),
    ("allow.socket_af", Kind::Flag),
    ("allow.reserved_ports", Kind::Flag),
    ("allow.vmm", Kind::Flag),
    ("sysvmsg", Kind::JailSys),
    ("sysvsem", Kind::JailSys),
    ("sysvshm", Kind::JailSys),
    ("host.hostname", Kind::Text),
    ("host.domainname", Kind::Text),
    ("mount.devfs", Kind::Flag),
    ("exec_start", Kind::Text),
    ("exec_stop", Kind::Text),
    ("stop_timeout", Kind::Int { min: 0, max: 86400 }),
    ("boot", Kind::OnOff),
    ("priority", Kind::Int { min: 0, max: 99 }),
    ("template", Kind::YesNo),
    ("quota", Kind::Size),
    ("reservation", Kind::Size),
    (
        "compression",
        Kind::Choice(&["on", "off", "lz4", "lzjb", "gzip", "zle", "zstd", "zstd-fast"]),
    ),
    ("notes", Kind::Text),
];

/// Builtin global defaults
const BUILTIN_DEFAULTS: &[(&str, &str)] = &[
    ("securelevel", "2"),
    ("devfs_ruleset", "4"),
    ("enforce_statfs", "2"),
    ("children.max", "0"),
    ("allow.set_hostname", "1"),
    ("allow.sysvipc", "0"),
    ("allow.raw_sockets", "0"),
    ("mount.devfs", "1"),
    ("exec_start", "/bin/sh /etc/rc"),
    ("exec_stop", "/bin/sh /etc/rc.shutdown"),
    ("stop_timeout", "30"),
    ("boot", "off"),
    ("priority", "99"),
    ("template", "no"),
];

/// Properties never copied from a template onto a new jail
const NOT_INHERITED: &[&str] = &["template", "host.hostname", "boot"];

/// Check a property assignment
pub fn validate_property(key: &str, value: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidProperty {
        key: key.to_string(),
        reason,
    };

    if let Some(rest) = key.strip_prefix("user.") {
        if rest.is_empty() {
            return Err(invalid("empty user property name".into()));
        }
        return Ok(());
    }

    let kind = KNOWN
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| invalid("unknown property".into()))?;

    let ok = match kind {
        Kind::Flag => matches!(
            value,
            "0" | "1" | "on" | "off" | "yes" | "no" | "true" | "false"
        ),
        Kind::OnOff => matches!(value, "on" | "off"),
        Kind::YesNo => matches!(value, "yes" | "no"),
        Kind::Int { min, max } => value.parse::<i64>().is_ok_and(|n| (min..=max).contains(&n)),
        Kind::JailSys => matches!(value, "new" | "inherit" | "disable"),
        Kind::Size => value == "none" || parse_amount(value).is_some(),
        Kind::Choice(choices) => choices.contains(&value),
        Kind::Text => !value.contains('\n'),
    };
    if ok {
        Ok(())
    } else {
        Err(invalid(format!("invalid value '{}'", value)))
    }
}

/// Check a jail id or name
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with(['-', '.']);
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidProperty {
            key: "name".into(),
            reason: format!("invalid name '{}'", name),
        })
    }
}

/// Where a property value came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum PropertySource {
    /// Set on the jail itself
    Explicit,
    /// Copied from a template at creation or reapply
    Inherited { template: String },
}

/// A materialized property value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyEntry {
    pub value: String,
    pub source: PropertySource,
}

impl PropertyEntry {
    pub fn explicit(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            source: PropertySource::Explicit,
        }
    }

    pub fn inherited(value: impl Into<String>, template: &str) -> Self {
        Self {
            value: value.into(),
            source: PropertySource::Inherited {
                template: template.to_string(),
            },
        }
    }

    pub fn is_inherited(&self) -> bool {
        matches!(self.source, PropertySource::Inherited { .. })
    }
}

/// Declarative description of a jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailSpec {
    /// Stable id, the dataset leaf name at creation
    pub id: String,
    /// Human readable name, unique across jails
    pub name: String,
    pub dataset: String,
    /// Jail this one was materialized from
    pub template: Option<String>,
    pub limits: Vec<LimitSpec>,
    pub limits_source: PropertySource,
    pub network: NetworkSpec,
    pub network_source: PropertySource,
    pub properties: BTreeMap<String, PropertyEntry>,
}

impl JailSpec {
    pub fn new(id: &str, name: &str, dataset: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            dataset: dataset.to_string(),
            template: None,
            limits: Vec::new(),
            limits_source: PropertySource::Explicit,
            network: NetworkSpec::default(),
            network_source: PropertySource::Explicit,
            properties: BTreeMap::new(),
        }
    }

    /// Whether the jail is marked `template=yes`
    pub fn is_template(&self) -> bool {
        self.properties
            .get("template")
            .is_some_and(|e| e.value == "yes")
    }

    pub fn set_explicit(&mut self, key: &str, value: &str) {
        self.properties
            .insert(key.to_string(), PropertyEntry::explicit(value));
    }

    /// Values set explicitly on this jail
    pub fn explicit(&self) -> BTreeMap<String, String> {
        self.properties
            .iter()
            .filter(|(_, e)| !e.is_inherited())
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Copy a template's values onto this spec as inherited entries
    ///
    /// Explicit entries are left untouched; stale inherited ones are dropped.
    /// Limits and network are replaced only while they are still inherited.
    fn inherit_from(&mut self, template: &JailSpec) {
        self.properties.retain(|_, e| !e.is_inherited());
        for (key, entry) in &template.properties {
            if NOT_INHERITED.contains(&key.as_str()) || self.properties.contains_key(key) {
                continue;
            }
            self.properties
                .insert(key.clone(), PropertyEntry::inherited(entry.value.clone(), &template.id));
        }

        let inherited = PropertySource::Inherited {
            template: template.id.clone(),
        };
        if self.limits_source != PropertySource::Explicit {
            self.limits = template.limits.clone();
            self.limits_source = inherited.clone();
        }
        if self.network_source != PropertySource::Explicit {
            // Static addresses belong to one jail only
            let mut network = template.network.clone();
            network
                .addresses
                .retain(|a| a.assignment == Assignment::Dhcp);
            self.network = network;
            self.network_source = inherited;
        }
    }
}

/// Network edits carried by a [`SpecUpdate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEdit {
    Mode(NetworkMode),
    Interfaces(Vec<InterfaceSpec>),
    /// Replace addresses of one family
    Addresses { ipv6: bool, addresses: Vec<AddressSpec> },
    DefaultRouter(Option<IpAddr>),
}

/// A parsed batch of `key=value` assignments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecUpdate {
    pub name: Option<String>,
    /// Property edits; `None` clears the explicit value
    pub properties: Vec<(String, Option<String>)>,
    /// Limit edits; `None` removes the limit
    pub limits: Vec<(String, Option<LimitSpec>)>,
    pub network: Vec<NetworkEdit>,
}

impl SpecUpdate {
    /// Parse `key=value` assignments
    ///
    /// - `name=web2` renames
    /// - RCTL resources become limits (`memoryuse=512M:1G:deny`, `maxproc=off`)
    /// - `vnet`, `interfaces`, `ip4_addr`, `ip6_addr`, `defaultrouter` edit the network
    /// - anything else is a property; an empty value clears it
    pub fn parse<S: AsRef<str>>(assignments: &[S]) -> Result<Self> {
        let mut update = SpecUpdate::default();
        for raw in assignments {
            let raw = raw.as_ref();
            let (key, value) = raw.split_once('=').ok_or_else(|| Error::InvalidProperty {
                key: raw.to_string(),
                reason: "expected key=value".into(),
            })?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "name" => {
                    validate_name(value)?;
                    update.name = Some(value.to_string());
                }
                "vnet" => update.network.push(NetworkEdit::Mode(value.parse()?)),
                "interfaces" => {
                    let interfaces = list(value)
                        .map(InterfaceSpec::parse)
                        .collect::<Result<Vec<_>>>()?;
                    update.network.push(NetworkEdit::Interfaces(interfaces));
                }
                "ip4_addr" | "ip6_addr" => {
                    let addresses = list(value)
                        .map(|a| AddressSpec::parse(a, "vnet0"))
                        .collect::<Result<Vec<_>>>()?;
                    update.network.push(NetworkEdit::Addresses {
                        ipv6: key == "ip6_addr",
                        addresses,
                    });
                }
                "defaultrouter" => {
                    let router = match value {
                        "" | "none" => None,
                        v => Some(v.parse::<IpAddr>().map_err(|_| Error::InvalidProperty {
                            key: key.to_string(),
                            reason: format!("invalid address '{}'", v),
                        })?),
                    };
                    update.network.push(NetworkEdit::DefaultRouter(router));
                }
                k if ResourceClass::is_resource(k) => {
                    let limit = match value {
                        "off" | "none" | "" => None,
                        v => Some(LimitSpec::parse(k, v)?),
                    };
                    update.limits.push((k.to_string(), limit));
                }
                k => {
                    if value.is_empty() {
                        validate_key(k)?;
                        update.properties.push((k.to_string(), None));
                    } else {
                        validate_property(k, value)?;
                        update.properties.push((k.to_string(), Some(value.to_string())));
                    }
                }
            }
        }
        Ok(update)
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.properties.is_empty()
            && self.limits.is_empty()
            && self.network.is_empty()
    }

    /// Value of a `template=` edit, if any
    pub fn template_flag(&self) -> Option<bool> {
        self.properties
            .iter()
            .rev()
            .find(|(k, _)| k == "template")
            .map(|(_, v)| v.as_deref() == Some("yes"))
    }

    /// Whether any edit touches a native dataset property
    pub fn touches_storage(&self) -> bool {
        self.properties
            .iter()
            .any(|(k, _)| STORAGE_KEYS.contains(&k.as_str()))
    }

    /// Apply the update to a copy of `spec`
    pub fn apply(&self, spec: &JailSpec) -> Result<JailSpec> {
        let mut next = spec.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }

        for (key, value) in &self.properties {
            match value {
                Some(value) => next.set_explicit(key, value),
                None => {
                    next.properties.remove(key);
                }
            }
        }

        if !self.limits.is_empty() {
            for (resource, limit) in &self.limits {
                let existing = next.limits.iter().position(|l| &l.resource == resource);
                match (existing, limit) {
                    (Some(i), Some(limit)) => next.limits[i] = limit.clone(),
                    (None, Some(limit)) => next.limits.push(limit.clone()),
                    (Some(i), None) => {
                        next.limits.remove(i);
                    }
                    (None, None) => {}
                }
            }
            next.limits_source = PropertySource::Explicit;
        }

        if !self.network.is_empty() {
            for edit in &self.network {
                match edit {
                    NetworkEdit::Mode(mode) => {
                        next.network.mode = *mode;
                        if *mode == NetworkMode::Isolated && next.network.interfaces.is_empty() {
                            next.network.interfaces.push(InterfaceSpec {
                                name: "vnet0".into(),
                                bridge: Some("bridge0".into()),
                            });
                        }
                    }
                    NetworkEdit::Interfaces(interfaces) => next.network.interfaces = interfaces.clone(),
                    NetworkEdit::Addresses { ipv6, addresses } => {
                        next.network.addresses.retain(|a| is_ipv6(a) != *ipv6);
                        next.network.addresses.extend(addresses.iter().cloned());
                    }
                    NetworkEdit::DefaultRouter(router) => next.network.default_router = *router,
                }
            }
            next.network.validate()?;
            next.network_source = PropertySource::Explicit;
        }
        Ok(next)
    }
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "none")
}

fn is_ipv6(addr: &AddressSpec) -> bool {
    matches!(addr.assignment, Assignment::Static(net) if net.addr().is_ipv6())
}

fn validate_key(key: &str) -> Result<()> {
    if key.starts_with("user.") || KNOWN.iter().any(|(k, _)| *k == key) {
        Ok(())
    } else {
        Err(Error::InvalidProperty {
            key: key.to_string(),
            reason: "unknown property".into(),
        })
    }
}

/// Build a new jail's spec from a template or source jail
///
/// Every property, limit and network setting of `template` is copied as an
/// inherited value, then `update` is applied as explicit overrides.
pub fn materialize_clone(
    template: &JailSpec,
    id: &str,
    name: &str,
    dataset: &str,
    update: &SpecUpdate,
) -> Result<JailSpec> {
    let inherited = PropertySource::Inherited {
        template: template.id.clone(),
    };
    let mut spec = JailSpec::new(id, name, dataset);
    spec.template = Some(template.id.clone());
    spec.limits_source = inherited.clone();
    spec.network_source = inherited;
    spec.inherit_from(template);
    update.apply(&spec)
}

/// Refresh every inherited value from the template's current spec
///
/// Explicit overrides are untouched.
pub fn reapply_template(clone: &JailSpec, template: &JailSpec) -> JailSpec {
    let mut next = clone.clone();
    next.template = Some(template.id.clone());
    next.inherit_from(template);
    next
}

/// In-memory spec store
pub struct PropertyStore {
    specs: RwLock<HashMap<String, Arc<JailSpec>>>,
    defaults: BTreeMap<String, String>,
}

impl PropertyStore {
    /// Create a store with builtin defaults overlaid by `overrides`
    pub fn new(overrides: &BTreeMap<String, String>) -> Result<Self> {
        let mut defaults: BTreeMap<String, String> = BUILTIN_DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (key, value) in overrides {
            validate_property(key, value)?;
            defaults.insert(key.clone(), value.clone());
        }
        Ok(Self {
            specs: RwLock::new(HashMap::new()),
            defaults,
        })
    }

    pub fn defaults(&self) -> &BTreeMap<String, String> {
        &self.defaults
    }

    pub fn get(&self, id: &str) -> Option<Arc<JailSpec>> {
        let specs = self.specs.read().unwrap_or_else(PoisonError::into_inner);
        specs.get(id).cloned()
    }

    /// Every spec, ordered by id
    pub fn all(&self) -> Vec<Arc<JailSpec>> {
        let specs = self.specs.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = specs.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Insert or replace a spec
    pub fn insert(&self, spec: JailSpec) -> Arc<JailSpec> {
        let spec = Arc::new(spec);
        let mut specs = self.specs.write().unwrap_or_else(PoisonError::into_inner);
        specs.insert(spec.id.clone(), spec.clone());
        spec
    }

    pub fn remove(&self, id: &str) -> Option<Arc<JailSpec>> {
        let mut specs = self.specs.write().unwrap_or_else(PoisonError::into_inner);
        specs.remove(id)
    }

    /// Whether `name` is used as a name or id by a jail other than `except`
    pub fn name_taken(&self, name: &str, except: Option<&str>) -> bool {
        let specs = self.specs.read().unwrap_or_else(PoisonError::into_inner);
        specs
            .values()
            .filter(|s| Some(s.id.as_str()) != except)
            .any(|s| s.name == name || s.id == name)
    }

    /// Look up by id, then exact name, then unique id prefix
    pub fn find(&self, query: &str) -> Result<Arc<JailSpec>> {
        let specs = self.specs.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(spec) = specs.get(query) {
            return Ok(spec.clone());
        }
        if let Some(spec) = specs.values().find(|s| s.name == query) {
            return Ok(spec.clone());
        }
        let mut matches = specs.values().filter(|s| s.id.starts_with(query));
        match (matches.next(), matches.next()) {
            (Some(spec), None) if !query.is_empty() => Ok(spec.clone()),
            (Some(_), Some(_)) => Err(Error::InvalidProperty {
                key: "jail".into(),
                reason: format!("'{}' matches more than one jail", query),
            }),
            _ => Err(Error::NotFound(query.to_string())),
        }
    }

    /// Effective value of one property
    pub fn resolve(&self, spec: &JailSpec, key: &str) -> Option<String> {
        if let Some(entry) = spec.properties.get(key) {
            return Some(entry.value.clone());
        }
        if key == "host.hostname" {
            return Some(spec.name.clone());
        }
        self.defaults.get(key).cloned()
    }

    /// Every effective property of a jail
    pub fn resolved(&self, spec: &JailSpec) -> BTreeMap<String, String> {
        let mut all = self.defaults.clone();
        all.insert("host.hostname".into(), spec.name.clone());
        for (key, entry) in &spec.properties {
            all.insert(key.clone(), entry.value.clone());
        }
        all
    }

    /// Load every spec found below the jails and templates datasets
    pub fn load_all(&self, storage: &StorageLayer) -> Result<usize> {
        let mut loaded = HashMap::new();
        for parent in [storage.jails_dataset(), storage.templates_dataset()] {
            for dataset in storage.children(&parent)? {
                match load(storage, &dataset) {
                    Ok(Some(spec)) => {
                        loaded.insert(spec.id.clone(), Arc::new(spec));
                    }
                    Ok(None) => debug!(dataset = %dataset, "dataset carries no jail spec"),
                    Err(e) => warn!(dataset = %dataset, error = %e, "unreadable jail spec"),
                }
            }
        }
        let count = loaded.len();
        *self.specs.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(count)
    }
}

fn user_key(suffix: &str) -> String {
    format!("{}{}", NAMESPACE, suffix)
}

/// Write a spec onto its dataset
pub fn persist(storage: &StorageLayer, spec: &JailSpec) -> Result<()> {
    let dataset = spec.dataset.as_str();
    let existing = storage.user_properties(dataset, NAMESPACE)?;

    let mut wanted: BTreeMap<String, String> = BTreeMap::new();
    wanted.insert(user_key("version"), FORMAT_VERSION.into());
    wanted.insert(user_key("id"), spec.id.clone());
    wanted.insert(user_key("name"), spec.name.clone());
    if let Some(template) = &spec.template {
        wanted.insert(user_key("template"), template.clone());
    }
    wanted.insert(user_key("limits"), serde_json::to_string(&spec.limits)?);
    wanted.insert(user_key("network"), serde_json::to_string(&spec.network)?);

    let mut inherited: BTreeSet<&str> = spec
        .properties
        .iter()
        .filter(|(_, e)| e.is_inherited())
        .map(|(k, _)| k.as_str())
        .collect();
    if spec.limits_source != PropertySource::Explicit {
        inherited.insert("limits");
    }
    if spec.network_source != PropertySource::Explicit {
        inherited.insert("network");
    }
    wanted.insert(user_key("inherited"), serde_json::to_string(&inherited)?);

    for (key, entry) in &spec.properties {
        if STORAGE_KEYS.contains(&key.as_str()) {
            let current = storage.get_property(dataset, key)?;
            if current.as_deref() != Some(entry.value.as_str()) {
                storage.set_property(dataset, key, &entry.value)?;
            }
        } else {
            wanted.insert(user_key(&format!("prop.{}", key)), entry.value.clone());
        }
    }

    for (key, value) in &wanted {
        if existing.get(key) != Some(value) {
            storage.set_property(dataset, key, value)?;
        }
    }
    for key in existing.keys().filter(|k| !wanted.contains_key(*k)) {
        storage.clear_property(dataset, key)?;
    }

    let local = storage.user_properties(dataset, "")?;
    for key in STORAGE_KEYS {
        if local.contains_key(*key) && !spec.properties.contains_key(*key) {
            storage.clear_property(dataset, key)?;
        }
    }

    debug!(jail = %spec.id, dataset = %dataset, "spec persisted");
    Ok(())
}

/// Read the spec stored on a dataset, if it carries one
pub fn load(storage: &StorageLayer, dataset: &str) -> Result<Option<JailSpec>> {
    let local = storage.user_properties(dataset, "")?;
    let Some(id) = local.get(&user_key("id")) else {
        return Ok(None);
    };
    let name = local.get(&user_key("name")).unwrap_or(id);
    let mut spec = JailSpec::new(id, name, dataset);
    spec.template = local.get(&user_key("template")).cloned();

    let inherited: BTreeSet<String> = match local.get(&user_key("inherited")) {
        Some(raw) => serde_json::from_str(raw)?,
        None => BTreeSet::new(),
    };
    let source = |key: &str| match (&spec.template, inherited.contains(key)) {
        (Some(template), true) => PropertySource::Inherited {
            template: template.clone(),
        },
        _ => PropertySource::Explicit,
    };

    if let Some(raw) = local.get(&user_key("limits")) {
        spec.limits = serde_json::from_str(raw)?;
    }
    if let Some(raw) = local.get(&user_key("network")) {
        spec.network = serde_json::from_str(raw)?;
    }
    spec.limits_source = source("limits");
    spec.network_source = source("network");

    let prefix = user_key("prop.");
    let mut properties = BTreeMap::new();
    for (key, value) in &local {
        let key = match key.strip_prefix(&prefix) {
            Some(key) => key,
            None if STORAGE_KEYS.contains(&key.as_str()) => key.as_str(),
            None => continue,
        };
        properties.insert(
            key.to_string(),
            PropertyEntry {
                value: value.clone(),
                source: source(key),
            },
        );
    }
    spec.properties = properties;
    Ok(Some(spec))
}
