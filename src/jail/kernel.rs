//! Kernel jail operations
//!
//! [`JailKernel`] is the seam between the lifecycle engine and jail(2).
//! [`HostKernel`] calls the syscalls directly on FreeBSD and shells out to
//! `jls`, `jexec`, `pkill`, `pgrep`, `mount` and `devfs` for the rest.

use super::types::{JAIL_SYS_DISABLE, JAIL_SYS_NEW, ParamValue};
use crate::error::{Error, Result};
use crate::network::{NetworkMode, NetworkSpec};
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Parameters handed to jail(2), keyed by parameter name
pub type JailParams = BTreeMap<String, ParamValue>;

/// Properties passed through to jail(2) verbatim
const KERNEL_PARAMS: &[&str] = &[
    "securelevel",
    "devfs_ruleset",
    "enforce_statfs",
    "children.max",
    "sysvmsg",
    "sysvsem",
    "sysvshm",
    "host.hostname",
    "host.domainname",
    "osrelease",
    "osreldate",
];

/// Whether a property key maps onto a jail(2) parameter
pub fn is_kernel_param(key: &str) -> bool {
    KERNEL_PARAMS.contains(&key) || key.starts_with("allow.")
}

/// Build jail(2) parameters from a jail's network and resolved properties
pub fn build_params(
    kernel_name: &str,
    network: &NetworkSpec,
    properties: &BTreeMap<String, String>,
) -> JailParams {
    let mut params = JailParams::new();
    params.insert("name".into(), ParamValue::from(kernel_name));

    for (key, value) in properties.iter().filter(|(k, _)| is_kernel_param(k)) {
        let param = if key.starts_with("host.") {
            ParamValue::from(value.as_str())
        } else {
            ParamValue::from_property(value)
        };
        params.insert(key.clone(), param);
    }

    match network.mode {
        NetworkMode::Isolated => {
            params.insert("vnet".into(), ParamValue::Int(JAIL_SYS_NEW));
        }
        NetworkMode::Shared => {
            let addresses = network.static_addresses();
            let v4: Vec<_> = addresses
                .iter()
                .filter_map(|a| match a {
                    IpAddr::V4(a) => Some(*a),
                    IpAddr::V6(_) => None,
                })
                .collect();
            let v6: Vec<_> = addresses
                .iter()
                .filter_map(|a| match a {
                    IpAddr::V6(a) => Some(*a),
                    IpAddr::V4(_) => None,
                })
                .collect();

            if v4.is_empty() {
                params.insert("ip4".into(), ParamValue::Int(JAIL_SYS_DISABLE));
            } else {
                params.insert("ip4.addr".into(), ParamValue::Ipv4(v4));
            }
            if v6.is_empty() {
                params.insert("ip6".into(), ParamValue::Int(JAIL_SYS_DISABLE));
            } else {
                params.insert("ip6.addr".into(), ParamValue::Ipv6(v6));
            }
        }
        NetworkMode::None => {
            params.insert("ip4".into(), ParamValue::Int(JAIL_SYS_DISABLE));
            params.insert("ip6".into(), ParamValue::Int(JAIL_SYS_DISABLE));
        }
    }
    params
}

/// Kernel side of jail management
pub trait JailKernel: Send + Sync {
    /// Create a persistent jail, returning its jid
    fn create(&self, name: &str, path: &Path, params: &JailParams) -> Result<i32>;
    /// jid of a live jail with this name
    fn find(&self, name: &str) -> Result<Option<i32>>;
    /// Every live jail as `(jid, name)`
    fn running(&self) -> Result<Vec<(i32, String)>>;
    /// Run a shell command inside the jail and wait for it
    fn exec(&self, jid: i32, command: &str) -> Result<()>;
    /// Send a signal to every process in the jail
    fn signal_all(&self, jid: i32, signal: Signal) -> Result<()>;
    fn has_processes(&self, jid: i32) -> Result<bool>;
    fn remove(&self, jid: i32) -> Result<()>;
    fn mount_devfs(&self, root: &Path, ruleset: &str) -> Result<()>;
    fn unmount_devfs(&self, root: &Path) -> Result<()>;
}

fn run(program: &str, args: &[&str]) -> Result<(bool, String)> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::CommandFailed {
            command: program.to_string(),
            message: e.to_string(),
        })?;
    if output.status.success() {
        Ok((true, String::from_utf8_lossy(&output.stdout).into_owned()))
    } else {
        Ok((false, String::from_utf8_lossy(&output.stderr).trim().to_string()))
    }
}

fn run_checked(program: &str, args: &[&str]) -> Result<String> {
    match run(program, args)? {
        (true, stdout) => Ok(stdout),
        (false, stderr) => Err(Error::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            message: stderr,
        }),
    }
}

/// jail(2) on the running host
#[derive(Debug, Default, Clone)]
pub struct HostKernel;

impl HostKernel {
    pub fn new() -> Self {
        Self
    }
}

impl JailKernel for HostKernel {
    #[cfg(target_os = "freebsd")]
    fn create(&self, _name: &str, path: &Path, params: &JailParams) -> Result<i32> {
        super::ffi::jail_create(path, params)
    }

    #[cfg(not(target_os = "freebsd"))]
    fn create(&self, _name: &str, _path: &Path, _params: &JailParams) -> Result<i32> {
        Err(Error::UnsupportedPlatform("jail(2)".into()))
    }

    #[cfg(target_os = "freebsd")]
    fn find(&self, name: &str) -> Result<Option<i32>> {
        match super::ffi::jail_getid(name) {
            Ok(jid) => Ok(Some(jid)),
            Err(Error::JailGet(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[cfg(not(target_os = "freebsd"))]
    fn find(&self, name: &str) -> Result<Option<i32>> {
        Ok(self
            .running()?
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(jid, _)| jid))
    }

    fn running(&self) -> Result<Vec<(i32, String)>> {
        let stdout = run_checked("jls", &["-q", "jid", "name"])?;
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let (jid, name) = line.trim().split_once(' ')?;
                Some((jid.parse().ok()?, name.trim().to_string()))
            })
            .collect())
    }

    fn exec(&self, jid: i32, command: &str) -> Result<()> {
        run_checked("jexec", &[&jid.to_string(), "/bin/sh", "-c", command]).map(|_| ())
    }

    fn signal_all(&self, jid: i32, signal: Signal) -> Result<()> {
        let sig = format!("-{}", signal.as_str().trim_start_matches("SIG"));
        // pkill exits 1 when nothing matched
        match run("pkill", &[&sig, "-j", &jid.to_string(), "."])? {
            (true, _) => Ok(()),
            (false, stderr) if stderr.is_empty() => Ok(()),
            (false, stderr) => Err(Error::CommandFailed {
                command: format!("pkill {} -j {}", sig, jid),
                message: stderr,
            }),
        }
    }

    fn has_processes(&self, jid: i32) -> Result<bool> {
        match run("pgrep", &["-j", &jid.to_string(), "."])? {
            (true, _) => Ok(true),
            (false, stderr) if stderr.is_empty() => Ok(false),
            (false, stderr) => Err(Error::CommandFailed {
                command: format!("pgrep -j {}", jid),
                message: stderr,
            }),
        }
    }

    #[cfg(target_os = "freebsd")]
    fn remove(&self, jid: i32) -> Result<()> {
        super::ffi::jail_remove(jid)
    }

    #[cfg(not(target_os = "freebsd"))]
    fn remove(&self, _jid: i32) -> Result<()> {
        Err(Error::UnsupportedPlatform("jail_remove(2)".into()))
    }

    fn mount_devfs(&self, root: &Path, ruleset: &str) -> Result<()> {
        let dev = root.join("dev");
        let dev = dev.to_string_lossy();
        run_checked("mount", &["-t", "devfs", "devfs", &dev])?;
        if let Err(e) = run_checked("devfs", &["-m", &dev, "ruleset", ruleset])
            .and_then(|_| run_checked("devfs", &["-m", &dev, "rule", "applyset"]))
        {
            unwind_devfs(root, || self.unmount_devfs(root));
            return Err(e);
        }
        Ok(())
    }

    fn unmount_devfs(&self, root: &Path) -> Result<()> {
        let dev = root.join("dev");
        run_checked("umount", &["-f", &dev.to_string_lossy()]).map(|_| ())
    }
}

/// Undo a devfs mount whose ruleset could not be applied
///
/// Returns whether the unmount succeeded. Failures are only logged.
fn unwind_devfs(root: &Path, unmount: impl FnOnce() -> Result<()>) -> bool {
    match unmount() {
        Ok(()) => true,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "devfs left mounted after ruleset failure");
            false
        }
    }
}

/// How a running jail is brought down
#[derive(Debug, Clone)]
pub struct StopPolicy {
    /// Command run inside the jail before signalling
    pub exec_stop: Option<String>,
    /// Grace period between SIGTERM and SIGKILL
    pub timeout: Duration,
    /// Interval between process checks
    pub poll: Duration,
}

impl StopPolicy {
    pub fn new(exec_stop: Option<String>, timeout: Duration) -> Self {
        Self {
            exec_stop,
            timeout,
            poll: Duration::from_millis(250),
        }
    }
}

/// Terminate every process in a jail
///
/// Runs `exec_stop`, sends SIGTERM, waits up to the policy timeout and then
/// sends SIGKILL. Returns `true` when the deadline elapsed and processes had to
/// be killed. Never fails; problems are logged.
pub fn terminate(kernel: &dyn JailKernel, jid: i32, jail: &str, policy: &StopPolicy) -> bool {
    if let Some(cmd) = policy.exec_stop.as_deref().filter(|c| !c.is_empty()) {
        if let Err(e) = kernel.exec(jid, cmd) {
            warn!(jail = %jail, command = %cmd, error = %e, "exec_stop failed");
        }
    }
    if let Err(e) = kernel.signal_all(jid, Signal::SIGTERM) {
        warn!(jail = %jail, error = %e, "SIGTERM failed");
    }

    let deadline = Instant::now() + policy.timeout;
    loop {
        match kernel.has_processes(jid) {
            Ok(false) => {
                debug!(jail = %jail, "all processes exited");
                return false;
            }
            Ok(true) => {}
            Err(e) => {
                warn!(jail = %jail, error = %e, "process check failed");
                break;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(policy.poll.min(deadline - now));
    }

    let timeout = Error::Timeout {
        jail: jail.to_string(),
        seconds: policy.timeout.as_secs(),
    };
    warn!(jail = %jail, error = %timeout, "escalating to SIGKILL");
    if let Err(e) = kernel.signal_all(jid, Signal::SIGKILL) {
        warn!(jail = %jail, error = %e, "SIGKILL failed");
    }
    true
}
