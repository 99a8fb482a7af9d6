//! The Warden - reconciliation, boot and shutdown
//!
//! On engine start the warden matches runtime records against the kernel:
//! jails still running are adopted, records whose kernel jail is gone are
//! released, and records locked by a transition in another process are left
//! alone. Boot stops templates found running, then starts every
//! `boot=on` jail in ascending priority groups, each group in parallel on the
//! crew, rate limited by a token bucket and retrying transient failures with
//! exponential backoff. Shutdown stops running jails in descending priority.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use breaker_machines::{CircuitBreaker, CircuitBuilder};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use throttle_machines::token_bucket;
use tracing::{debug, info, warn};

use crate::crew::{Crew, Transition};
use crate::error::{Error, ErrorKind, Result};
use crate::helm::{Helm, Settled};
use crate::jail::{JailInstance, JailState};
use crate::manifest::{RateLimitConfig, RetryConfig};

/// Kernel jail names owned by the engine start with this
const KERNEL_PREFIX: &str = "brig-";

/// Outcome of [`Warden::reconcile`]
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Jails found running and taken over
    pub adopted: Vec<String>,
    /// Records whose kernel jail was gone and were released
    pub released: Vec<String>,
    /// Records locked by another process mid-transition
    pub busy: Vec<String>,
    /// `brig-*` kernel jails with no record
    pub foreign: Vec<String>,
    /// Cleanup steps that failed while releasing
    pub failures: usize,
}

/// Outcome of a boot or shutdown pass
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Retry tracking for a single jail
struct RetryState {
    attempts: u8,
    backoff: ExponentialBackoff,
    breaker: CircuitBreaker,
}

impl RetryState {
    fn new(name: &str, cfg: &RetryConfig) -> Self {
        Self {
            attempts: 0,
            backoff: ExponentialBackoff::new()
                .base_delay_ms(cfg.base_delay_ms)
                .max_delay_ms(cfg.max_delay_ms)
                .multiplier(cfg.multiplier)
                .max_attempts(cfg.max_attempts)
                .jitter_factor(cfg.jitter_factor),
            breaker: CircuitBuilder::new(format!("boot_{}", name))
                .failure_threshold(5)
                .success_threshold(2)
                .half_open_timeout_secs(300.0)
                .build(),
        }
    }

    fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.breaker.record_failure(0.0);
    }

    fn next_delay(&self) -> Option<Duration> {
        let mut rng = rng();
        self.backoff
            .delay(self.attempts, &mut rng)
            .map(Duration::from_millis)
    }

    fn should_retry(&self) -> bool {
        self.breaker.is_closed() && self.backoff.should_retry(self.attempts)
    }
}

/// Failures worth another attempt
fn is_transient(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::Busy | ErrorKind::InterfaceExhausted)
}

/// Token bucket limiting how fast jails are started
struct Throttle {
    state: Mutex<(f64, Instant)>,
    epoch: Instant,
    capacity: f64,
    refill_rate: f64,
}

impl Throttle {
    fn new(cfg: &RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new((cfg.boot_capacity, now)),
            epoch: now,
            capacity: cfg.boot_capacity,
            refill_rate: cfg.boot_refill_rate,
        }
    }

    /// Block until a start token is available
    fn acquire(&self) {
        loop {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let (tokens, last_refill) = *state;
            let now = Instant::now();
            let now_secs = now.duration_since(self.epoch).as_secs_f64();
            let last_refill_secs = last_refill.duration_since(self.epoch).as_secs_f64();

            let result = token_bucket::check(tokens, last_refill_secs, now_secs, self.capacity, self.refill_rate);
            if result.allowed {
                *state = (result.new_tokens, now);
                return;
            }
            let retry_after = result.retry_after;
            drop(state);
            debug!(wait_secs = retry_after, "start rate limited");
            thread::sleep(Duration::from_secs_f64(retry_after));
        }
    }
}

/// Supervisor for engine-wide passes
pub struct Warden {
    helm: Arc<Helm>,
    crew: Crew,
    throttle: Throttle,
    retry: RetryConfig,
}

impl Warden {
    pub fn new(helm: Arc<Helm>, workers: usize, rate: &RateLimitConfig, retry: RetryConfig) -> Self {
        let crew = Crew::new(helm.clone(), workers);
        debug!(workers = crew.size(), "crew ready");
        Self {
            crew,
            helm,
            throttle: Throttle::new(rate),
            retry,
        }
    }

    /// Bring engine state in line with the kernel after a restart
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let records = JailInstance::load_all(&self.helm.settings().state_dir)?;

        let mut claimed = HashSet::new();
        for record in records {
            let id = record.id;
            match self.helm.settle(&id) {
                Ok(Settled::Adopted) => {
                    claimed.insert(id.clone());
                    report.adopted.push(id);
                }
                Ok(Settled::Released(failures)) => {
                    report.failures += failures;
                    report.released.push(id);
                }
                Ok(Settled::Busy) => {
                    claimed.insert(id.clone());
                    report.busy.push(id);
                }
                Ok(Settled::Clean) => {}
                Err(e) => {
                    warn!(jail = %id, error = %e, "failed to settle runtime record");
                    claimed.insert(id);
                    report.failures += 1;
                }
            }
        }
        for spec in self.helm.specs() {
            if self.helm.state(&spec.id) != JailState::Defined {
                claimed.insert(spec.id.clone());
            }
        }

        let mut foreign: Vec<String> = self
            .helm
            .kernel()
            .running()?
            .into_iter()
            .map(|(_, name)| name)
            .filter(|name| {
                name.strip_prefix(KERNEL_PREFIX)
                    .is_some_and(|id| !claimed.contains(id))
            })
            .collect();
        foreign.sort();
        for name in &foreign {
            warn!(kernel_jail = %name, "running jail has no runtime record, leaving it alone");
        }
        report.foreign = foreign;

        info!(
            adopted = report.adopted.len(),
            released = report.released.len(),
            busy = report.busy.len(),
            foreign = report.foreign.len(),
            "reconciled"
        );
        Ok(report)
    }

    /// Jails with `boot=on`, grouped by ascending priority
    pub fn boot_plan(&self) -> Vec<(u32, Vec<String>)> {
        let mut groups: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for spec in self.helm.specs() {
            if spec.is_template() {
                continue;
            }
            let boot = self.helm.resolve(&spec, "boot");
            if !matches!(boot.as_deref(), Some("on" | "1" | "yes")) {
                continue;
            }
            groups.entry(self.priority(&spec.id)).or_default().push(spec.id.clone());
        }
        groups.into_iter().collect()
    }

    fn priority(&self, id: &str) -> u32 {
        self.helm
            .specs()
            .iter()
            .find(|s| s.id == id)
            .and_then(|s| self.helm.resolve(s, "priority"))
            .and_then(|p| p.parse().ok())
            .unwrap_or(99)
    }

    /// Start every boot jail, group by group
    pub fn boot(&self) -> BatchReport {
        let mut report = BatchReport::default();
        self.stop_templates(&mut report);
        for (priority, group) in self.boot_plan() {
            let pending: Vec<String> = group
                .into_iter()
                .filter(|id| self.helm.state(id) == JailState::Defined)
                .collect();
            info!(priority, jails = pending.len(), "starting boot group");
            self.start_group(pending, &mut report);
        }
        info!(
            started = report.succeeded.len(),
            failed = report.failed.len(),
            "boot finished"
        );
        report
    }

    /// Templates never run; stop any that were adopted running
    fn stop_templates(&self, report: &mut BatchReport) {
        let running: Vec<String> = self
            .helm
            .specs()
            .iter()
            .filter(|s| s.is_template() && self.helm.state(&s.id) == JailState::Running)
            .map(|s| s.id.clone())
            .collect();
        for (id, result) in self.crew.run_all(&running, Transition::Stop) {
            match result {
                Ok(()) => warn!(jail = %id, "template was running, stopped"),
                Err(e) => {
                    warn!(jail = %id, error = %e, "failed to stop running template");
                    report.failed.push((id, e));
                }
            }
        }
    }

    fn start_group(&self, mut pending: Vec<String>, report: &mut BatchReport) {
        let mut retries: HashMap<String, RetryState> = HashMap::new();

        while !pending.is_empty() {
            let tickets: Vec<_> = pending
                .iter()
                .map(|id| {
                    self.throttle.acquire();
                    (id.clone(), self.crew.submit(id, Transition::Start))
                })
                .collect();

            let mut again = Vec::new();
            let mut wait = Duration::ZERO;
            for (id, ticket) in tickets {
                match ticket.and_then(|t| t.wait()) {
                    Ok(()) => report.succeeded.push(id),
                    Err(e) if is_transient(&e) => {
                        let state = retries
                            .entry(id.clone())
                            .or_insert_with(|| RetryState::new(&id, &self.retry));
                        let delay = state.next_delay().filter(|_| state.should_retry());
                        match delay {
                            Some(delay) => {
                                state.record_failure();
                                warn!(jail = %id, error = %e, attempt = state.attempts, ?delay, "start failed, retrying");
                                wait = wait.max(delay);
                                again.push(id);
                            }
                            None => {
                                warn!(jail = %id, error = %e, "start failed, giving up");
                                report.failed.push((id, e));
                            }
                        }
                    }
                    Err(e) => {
                        warn!(jail = %id, error = %e, "start failed");
                        report.failed.push((id, e));
                    }
                }
            }

            if !again.is_empty() {
                thread::sleep(wait);
            }
            pending = again;
        }
    }

    /// Stop every running jail, highest priority number first
    pub fn shutdown(&self) -> BatchReport {
        let mut groups: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for spec in self.helm.specs() {
            if self.helm.state(&spec.id) == JailState::Running {
                groups.entry(self.priority(&spec.id)).or_default().push(spec.id.clone());
            }
        }

        let mut report = BatchReport::default();
        for (priority, group) in groups.into_iter().rev() {
            info!(priority, jails = group.len(), "stopping group");
            for (id, result) in self.crew.run_all(&group, Transition::Stop) {
                match result {
                    Ok(()) => report.succeeded.push(id),
                    Err(e) => {
                        warn!(jail = %id, error = %e, "stop failed");
                        report.failed.push((id, e));
                    }
                }
            }
        }
        info!(
            stopped = report.succeeded.len(),
            failed = report.failed.len(),
            "shutdown finished"
        );
        report
    }
}
