//! Bulkhead - resource limits for jails via RCTL
//!
//! Declared limits are translated into `rctl(8)` rules scoped to the kernel
//! jail name. A soft threshold fires the declared action, an optional hard
//! threshold always denies. Applying a rule set is all-or-nothing: when one
//! rule cannot be attached, every rule attached by the same call is removed
//! again before the error is returned.

use crate::error::{Error, Result};
use crate::units::parse_amount;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resources RCTL can account for per jail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    CpuTime,
    DataSize,
    StackSize,
    CoreDumpSize,
    MemoryUse,
    MemoryLocked,
    MaxProc,
    OpenFiles,
    VMemoryUse,
    PseudoTerminals,
    SwapUse,
    Nthr,
    MsgqQueued,
    MsgqSize,
    Nmsgq,
    Nsem,
    Nsemop,
    Nshm,
    ShmSize,
    WallClock,
    Pcpu,
    ReadBps,
    WriteBps,
    ReadIops,
    WriteIops,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 25] = [
        ResourceClass::CpuTime,
        ResourceClass::DataSize,
        ResourceClass::StackSize,
        ResourceClass::CoreDumpSize,
        ResourceClass::MemoryUse,
        ResourceClass::MemoryLocked,
        ResourceClass::MaxProc,
        ResourceClass::OpenFiles,
        ResourceClass::VMemoryUse,
        ResourceClass::PseudoTerminals,
        ResourceClass::SwapUse,
        ResourceClass::Nthr,
        ResourceClass::MsgqQueued,
        ResourceClass::MsgqSize,
        ResourceClass::Nmsgq,
        ResourceClass::Nsem,
        ResourceClass::Nsemop,
        ResourceClass::Nshm,
        ResourceClass::ShmSize,
        ResourceClass::WallClock,
        ResourceClass::Pcpu,
        ResourceClass::ReadBps,
        ResourceClass::WriteBps,
        ResourceClass::ReadIops,
        ResourceClass::WriteIops,
    ];

    /// Name as understood by rctl
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::CpuTime => "cputime",
            ResourceClass::DataSize => "datasize",
            ResourceClass::StackSize => "stacksize",
            ResourceClass::CoreDumpSize => "coredumpsize",
            ResourceClass::MemoryUse => "memoryuse",
            ResourceClass::MemoryLocked => "memorylocked",
            ResourceClass::MaxProc => "maxproc",
            ResourceClass::OpenFiles => "openfiles",
            ResourceClass::VMemoryUse => "vmemoryuse",
            ResourceClass::PseudoTerminals => "pseudoterminals",
            ResourceClass::SwapUse => "swapuse",
            ResourceClass::Nthr => "nthr",
            ResourceClass::MsgqQueued => "msgqqueued",
            ResourceClass::MsgqSize => "msgqsize",
            ResourceClass::Nmsgq => "nmsgq",
            ResourceClass::Nsem => "nsem",
            ResourceClass::Nsemop => "nsemop",
            ResourceClass::Nshm => "nshm",
            ResourceClass::ShmSize => "shmsize",
            ResourceClass::WallClock => "wallclock",
            ResourceClass::Pcpu => "pcpu",
            ResourceClass::ReadBps => "readbps",
            ResourceClass::WriteBps => "writebps",
            ResourceClass::ReadIops => "readiops",
            ResourceClass::WriteIops => "writeiops",
        }
    }

    /// Whether `name` is a resource key rather than an ordinary property
    pub fn is_resource(name: &str) -> bool {
        name.parse::<ResourceClass>().is_ok()
    }
}

impl FromStr for ResourceClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ResourceClass::ALL
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| Error::UnsupportedResource(s.to_string()))
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What RCTL does once a threshold is crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitAction {
    Deny,
    Log,
    Devctl,
    Throttle,
    Signal(Signal),
}

impl FromStr for LimitAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deny" => Ok(LimitAction::Deny),
            "log" => Ok(LimitAction::Log),
            "devctl" => Ok(LimitAction::Devctl),
            "throttle" => Ok(LimitAction::Throttle),
            other => other
                .strip_prefix("sig")
                .and_then(|name| Signal::from_str(&format!("SIG{}", name.to_ascii_uppercase())).ok())
                .map(LimitAction::Signal)
                .ok_or_else(|| Error::InvalidLimit(format!("unknown action '{}'", s))),
        }
    }
}

impl fmt::Display for LimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitAction::Deny => f.write_str("deny"),
            LimitAction::Log => f.write_str("log"),
            LimitAction::Devctl => f.write_str("devctl"),
            LimitAction::Throttle => f.write_str("throttle"),
            LimitAction::Signal(sig) => {
                let name = sig.as_str().trim_start_matches("SIG").to_ascii_lowercase();
                write!(f, "sig{}", name)
            }
        }
    }
}

/// A limit as declared on a jail, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub resource: String,
    pub soft: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard: Option<String>,
    pub action: String,
}

impl LimitSpec {
    /// Parse a property style value: `soft`, `soft:action` or `soft:hard:action`
    ///
    /// `memoryuse=512M:1G:deny`, `maxproc=200:log`, `pcpu=50`
    pub fn parse(resource: &str, value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split(':').collect();
        let (soft, hard, action) = match parts.as_slice() {
            [soft] => (*soft, None, "deny"),
            [soft, action] => (*soft, None, *action),
            [soft, hard, action] => (*soft, Some(*hard), *action),
            _ => return Err(Error::InvalidLimit(format!("{}={}", resource, value))),
        };

        let spec = Self {
            resource: resource.to_string(),
            soft: soft.to_string(),
            hard: hard.filter(|h| !h.is_empty()).map(str::to_string),
            action: action.to_string(),
        };
        spec.rule()?;
        Ok(spec)
    }

    /// Validate and type the declaration
    pub fn rule(&self) -> Result<LimitRule> {
        LimitRule::from_spec(self)
    }
}

impl fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hard {
            Some(hard) => write!(f, "{}:{}:{}", self.soft, hard, self.action),
            None => write!(f, "{}:{}", self.soft, self.action),
        }
    }
}

/// A validated limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitRule {
    pub resource: ResourceClass,
    pub soft: u64,
    pub hard: Option<u64>,
    pub action: LimitAction,
}

impl LimitRule {
    pub fn from_spec(spec: &LimitSpec) -> Result<Self> {
        let resource: ResourceClass = spec.resource.parse()?;
        let amount = |value: &str| {
            parse_amount(value)
                .ok_or_else(|| Error::InvalidLimit(format!("{}: bad amount '{}'", spec.resource, value)))
        };
        let soft = amount(&spec.soft)?;
        let hard = spec.hard.as_deref().map(amount).transpose()?;
        let action: LimitAction = spec.action.parse()?;

        if let Some(hard) = hard {
            if soft > hard {
                return Err(Error::InvalidThreshold {
                    resource: spec.resource.clone(),
                    soft,
                    hard,
                });
            }
        }

        Ok(Self {
            resource,
            soft,
            hard,
            action,
        })
    }

    /// rctl rule strings for a kernel jail name, soft first
    pub fn rctl_rules(&self, jail: &str) -> Vec<String> {
        let mut rules = vec![format!(
            "jail:{}:{}:{}={}",
            jail, self.resource, self.action, self.soft
        )];
        if let Some(hard) = self.hard {
            rules.push(format!("jail:{}:{}:deny={}", jail, self.resource, hard));
        }
        rules
    }
}

/// Rules attached for one jail, in attachment order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRuleSet {
    pub jail: String,
    pub rules: Vec<String>,
}

impl AppliedRuleSet {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Host RCTL interface
pub trait RctlBackend: Send + Sync {
    fn add_rule(&self, rule: &str) -> Result<()>;
    /// Remove a rule, or every rule matching a filter such as `jail:name`
    fn remove_rule(&self, rule: &str) -> Result<()>;
    fn rules(&self, filter: &str) -> Result<Vec<String>>;
}

/// `rctl(8)` command backend
#[derive(Debug, Default, Clone)]
pub struct Rctl;

impl Rctl {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("rctl")
            .args(args)
            .output()
            .map_err(|e| Error::Rctl(format!("Failed to run rctl: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Rctl(format!("rctl {}: {}", args.join(" "), stderr.trim())))
        }
    }
}

impl RctlBackend for Rctl {
    fn add_rule(&self, rule: &str) -> Result<()> {
        self.run(&["-a", rule]).map(|_| ())
    }

    fn remove_rule(&self, rule: &str) -> Result<()> {
        self.run(&["-r", rule]).map(|_| ())
    }

    fn rules(&self, filter: &str) -> Result<Vec<String>> {
        let stdout = self.run(&[filter])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Binds declared limits to kernel jails
pub struct Bulkhead {
    backend: Arc<dyn RctlBackend>,
}

impl Bulkhead {
    pub fn new(backend: Arc<dyn RctlBackend>) -> Self {
        Self { backend }
    }

    /// Validate a list of declarations without attaching anything
    pub fn validate(limits: &[LimitSpec]) -> Result<Vec<LimitRule>> {
        limits.iter().map(LimitRule::from_spec).collect()
    }

    /// Attach every rule for `jail`, or none
    pub fn apply(&self, jail: &str, limits: &[LimitSpec]) -> Result<AppliedRuleSet> {
        let rules = Self::validate(limits)?;
        let mut applied = AppliedRuleSet {
            jail: jail.to_string(),
            rules: Vec::new(),
        };

        for rule in rules.iter().flat_map(|r| r.rctl_rules(jail)) {
            if let Err(e) = self.backend.add_rule(&rule) {
                warn!(jail = %jail, rule = %rule, error = %e, "rctl rule rejected, rolling back");
                let failures = self.release(&applied);
                if failures > 0 {
                    warn!(jail = %jail, failures, "rollback left rules behind");
                }
                return Err(e);
            }
            debug!(jail = %jail, rule = %rule, "rctl rule added");
            applied.rules.push(rule);
        }

        Ok(applied)
    }

    /// Remove rules in reverse order; returns the number of removals that failed
    pub fn release(&self, applied: &AppliedRuleSet) -> usize {
        let mut failures = 0;
        for rule in applied.rules.iter().rev() {
            if let Err(e) = self.backend.remove_rule(rule) {
                warn!(jail = %applied.jail, rule = %rule, error = %e, "failed to remove rctl rule");
                failures += 1;
            }
        }
        failures
    }

    /// Drop every rule scoped to a jail, whoever attached it
    pub fn purge(&self, jail: &str) -> Result<()> {
        let filter = format!("jail:{}", jail);
        if self.backend.rules(&filter)?.is_empty() {
            return Ok(());
        }
        self.backend.remove_rule(&filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::FakeRctl;

    fn spec(resource: &str, value: &str) -> LimitSpec {
        LimitSpec::parse(resource, value).unwrap()
    }

    #[test]
    fn test_parse_forms() {
        let s = spec("memoryuse", "512M:1G:deny");
        assert_eq!(s.hard.as_deref(), Some("1G"));
        assert_eq!(s.action, "deny");

        let s = spec("maxproc", "200:log");
        assert_eq!(s.hard, None);
        assert_eq!(s.action, "log");

        let s = spec("pcpu", "50");
        assert_eq!(s.action, "deny");
    }

    #[test]
    fn test_unknown_resource() {
        let err = LimitSpec::parse("gpus", "1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedResource);
    }

    #[test]
    fn test_soft_above_hard() {
        let err = LimitSpec::parse("memoryuse", "2G:1G:deny").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidThreshold);
    }

    #[test]
    fn test_signal_action_round_trip() {
        let action: LimitAction = "sigterm".parse().unwrap();
        assert_eq!(action, LimitAction::Signal(Signal::SIGTERM));
        assert_eq!(action.to_string(), "sigterm");
        assert!("sigbogus".parse::<LimitAction>().is_err());
    }

    #[test]
    fn test_rctl_rules() {
        let rule = spec("memoryuse", "512M:1G:log").rule().unwrap();
        assert_eq!(
            rule.rctl_rules("brig-web1"),
            vec![
                "jail:brig-web1:memoryuse:log=536870912".to_string(),
                "jail:brig-web1:memoryuse:deny=1073741824".to_string(),
            ]
        );
    }

    #[test]
    fn test_apply_in_order() {
        let rctl = Arc::new(FakeRctl::new());
        let bulkhead = Bulkhead::new(rctl.clone());
        let applied = bulkhead
            .apply(
                "brig-a",
                &[spec("memoryuse", "512M:1G:deny"), spec("maxproc", "100:deny")],
            )
            .unwrap();

        assert_eq!(applied.rules.len(), 3);
        assert_eq!(rctl.count(), 3);

        assert_eq!(bulkhead.release(&applied), 0);
        assert_eq!(rctl.count(), 0);
    }

    #[test]
    fn test_apply_rolls_back_on_failure() {
        let rctl = Arc::new(FakeRctl::new());
        rctl.fail_on("maxproc");
        let bulkhead = Bulkhead::new(rctl.clone());

        let err = bulkhead
            .apply(
                "brig-a",
                &[
                    spec("memoryuse", "512M:1G:deny"),
                    spec("maxproc", "100:deny"),
                    spec("openfiles", "1024"),
                ],
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Failed);
        assert_eq!(rctl.count(), 0);
    }

    #[test]
    fn test_validation_precedes_attachment() {
        let rctl = Arc::new(FakeRctl::new());
        let bulkhead = Bulkhead::new(rctl.clone());
        let bad = LimitSpec {
            resource: "gpus".into(),
            soft: "1".into(),
            hard: None,
            action: "deny".into(),
        };

        let err = bulkhead
            .apply("brig-a", &[spec("memoryuse", "1G"), bad])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedResource);
        assert_eq!(rctl.added_total(), 0);
    }

    #[test]
    fn test_purge() {
        let rctl = Arc::new(FakeRctl::new());
        let bulkhead = Bulkhead::new(rctl.clone());
        bulkhead.apply("brig-a", &[spec("maxproc", "10")]).unwrap();
        bulkhead.apply("brig-b", &[spec("maxproc", "10")]).unwrap();

        bulkhead.purge("brig-a").unwrap();
        assert_eq!(rctl.count(), 1);
    }
}
