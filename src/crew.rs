//! The Crew - worker pool for batched transitions
//!
//! Transitions are queued on a bounded channel and executed by a fixed set of
//! worker threads. Each submission returns a [`Ticket`] that yields the
//! transition's result. Per-jail ordering is enforced by the engine's slot
//! locks, not by the queue.

use crate::error::{Error, Result};
use crate::helm::Helm;
use crossbeam::channel::{Receiver, Sender, bounded};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// A lifecycle transition the crew can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Stop,
    Restart,
    Destroy { force: bool },
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Start => f.write_str("start"),
            Transition::Stop => f.write_str("stop"),
            Transition::Restart => f.write_str("restart"),
            Transition::Destroy { force: true } => f.write_str("destroy --force"),
            Transition::Destroy { force: false } => f.write_str("destroy"),
        }
    }
}

struct Work {
    jail: String,
    transition: Transition,
    reply: Sender<Result<()>>,
}

/// Pending result of a submitted transition
pub struct Ticket {
    jail: String,
    rx: Receiver<Result<()>>,
}

impl Ticket {
    /// Block until the transition finishes
    pub fn wait(self) -> Result<()> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Failed(format!("worker for '{}' exited", self.jail))))
    }
}

/// Fixed-size pool of transition workers
pub struct Crew {
    tx: Option<Sender<Work>>,
    workers: Vec<JoinHandle<()>>,
}

impl Crew {
    pub fn new(helm: Arc<Helm>, size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = bounded::<Work>(size * 4);

        let workers = (0..size)
            .map(|n| {
                let rx = rx.clone();
                let helm = helm.clone();
                thread::Builder::new()
                    .name(format!("brig-crew-{}", n))
                    .spawn(move || work_loop(&helm, &rx))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "failed to spawn crew worker");
                    None
                }
            })
            .collect();

        Self { tx: Some(tx), workers }
    }

    /// Queue a transition; blocks while the queue is full
    pub fn submit(&self, jail: &str, transition: Transition) -> Result<Ticket> {
        let (reply, rx) = bounded(1);
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Failed("crew is shut down".into()))?;
        if self.workers.is_empty() {
            return Err(Error::Failed("crew has no workers".into()));
        }
        tx.send(Work {
            jail: jail.to_string(),
            transition,
            reply,
        })
        .map_err(|_| Error::Failed("crew queue closed".into()))?;
        Ok(Ticket {
            jail: jail.to_string(),
            rx,
        })
    }

    /// Run one transition on every jail and wait for all of them
    ///
    /// Results come back in input order.
    pub fn run_all(&self, jails: &[String], transition: Transition) -> Vec<(String, Result<()>)> {
        let tickets: Vec<(String, Result<Ticket>)> = jails
            .iter()
            .map(|jail| (jail.clone(), self.submit(jail, transition)))
            .collect();

        tickets
            .into_iter()
            .map(|(jail, ticket)| (jail, ticket.and_then(Ticket::wait)))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for Crew {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop
        self.tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("crew worker panicked");
            }
        }
    }
}

fn work_loop(helm: &Helm, rx: &Receiver<Work>) {
    while let Ok(work) = rx.recv() {
        debug!(jail = %work.jail, transition = %work.transition, "transition picked up");
        let result = match work.transition {
            Transition::Start => helm.start(&work.jail),
            Transition::Stop => helm.stop(&work.jail),
            Transition::Restart => helm.restart(&work.jail),
            Transition::Destroy { force } => helm.destroy(&work.jail, force),
        };
        // The submitter may have dropped its ticket
        let _ = work.reply.send(result);
    }
}
