//! Brig - FreeBSD jail lifecycle manager
//!
//! Jails live as ZFS datasets carrying their configuration as user
//! properties. Templates and releases are cloned, lifecycle transitions are
//! state machine-controlled, and running jails are re-adopted after restart.

mod bulkhead;
mod cli;
mod crew;
mod error;
mod helm;
mod jail;
mod manifest;
mod network;
mod properties;
mod storage;
mod units;
mod warden;

#[cfg(test)]
mod testing;

use bulkhead::{Bulkhead, Rctl};
use cli::{Cli, Commands};
use error::{Error, Result};
use helm::{CreateRequest, Helm, HelmSettings, Source};
use jail::HostKernel;
use network::{HostNetwork, NetworkConfigurator};
use properties::{PropertyStore, SpecUpdate};
use storage::{StorageLayer, Zfs};
use warden::{BatchReport, Warden};

use std::fs;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse_args();

    let filter = if cli.verbose { "brig=debug" } else { "brig=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(e.kind().exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        // Commands that don't require config
        Commands::Completion { shell } => {
            Cli::generate_completion(*shell);
            return Ok(());
        }
        Commands::Init { pool, force } => {
            if cli.config.exists() && !*force {
                return Err(Error::AlreadyExists(cli.config.display().to_string()));
            }
            let content = manifest::template(pool);
            let config = manifest::parse(&content)?;
            if let Some(parent) = cli.config.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&cli.config, content)?;
            StorageLayer::open(Arc::new(Zfs::new()), config.root_dataset())?;
            println!("Wrote {}", cli.config.display());
            println!("Dataset tree ready at {}", config.root_dataset());
            return Ok(());
        }
        _ => {}
    }

    let config = manifest::load(&cli.config)?;
    let global = &config.config;

    let storage = StorageLayer::open(Arc::new(Zfs::new()), config.root_dataset())?;
    let props = PropertyStore::new(&config.property_defaults())?;
    let network = NetworkConfigurator::new(
        Arc::new(HostNetwork::new()),
        global.mac_prefix.clone(),
        global.auto_create_bridges,
    );
    let bulkhead = Bulkhead::new(Arc::new(Rctl::new()));
    let helm = Arc::new(Helm::new(
        storage,
        props,
        Arc::new(HostKernel::new()),
        network,
        bulkhead,
        HelmSettings::new(&global.state_dir),
    )?);
    let warden = Warden::new(
        helm.clone(),
        global.workers,
        &global.rate_limit,
        global.retry.clone(),
    );

    // Every invocation is a fresh process; pick up jails started by earlier ones
    let report = warden.reconcile()?;
    debug!(
        adopted = report.adopted.len(),
        released = report.released.len(),
        busy = report.busy.len(),
        "reconciled"
    );
    for name in &report.foreign {
        warn!(jail = %name, "kernel jail has no runtime record");
    }

    match cli.command {
        Commands::Completion { .. } | Commands::Init { .. } => {}

        Commands::Create {
            name,
            id,
            release,
            template,
            props,
        } => {
            let source = match (release, template) {
                (Some(release), _) => Source::Release(release),
                (None, Some(template)) => Source::Template(template),
                (None, None) => Source::Empty,
            };
            let mut req = CreateRequest::new(name, source).with_update(SpecUpdate::parse(&props)?);
            req.id = id;
            let spec = helm.create(req)?;
            println!("Created {} ({})", spec.name, spec.id);
        }

        Commands::Clone {
            source,
            name,
            snapshot,
            props,
        } => {
            let req = CreateRequest::new(
                name,
                Source::Clone {
                    jail: source,
                    snapshot,
                },
            )
            .with_update(SpecUpdate::parse(&props)?);
            let spec = helm.create(req)?;
            println!("Created {} ({})", spec.name, spec.id);
        }

        Commands::Start { jail } => {
            helm.start(&jail)?;
            println!("Started {}", jail);
        }

        Commands::Stop { jail } => {
            helm.stop(&jail)?;
            println!("Stopped {}", jail);
        }

        Commands::Restart { jail } => {
            helm.restart(&jail)?;
            println!("Restarted {}", jail);
        }

        Commands::Cancel { jail } => {
            if helm.cancel(&jail)? {
                println!("Cancellation requested for {}", jail);
            } else {
                println!("{} has no transition in flight", jail);
            }
        }

        Commands::Clear { jail } => {
            helm.clear(&jail)?;
            println!("Cleared {}", jail);
        }

        Commands::Destroy { jail, force } => {
            helm.destroy(&jail, force)?;
            println!("Destroyed {}", jail);
        }

        Commands::List { json } => {
            let jails = helm.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&jails)?);
            } else {
                println!(
                    "{:<20} {:<12} {:<10} {:<6} {:<8}",
                    "NAME", "STATE", "ID", "JID", "TEMPLATE"
                );
                println!("{}", "-".repeat(60));
                for j in jails {
                    println!(
                        "{:<20} {:<12} {:<10} {:<6} {:<8}",
                        j.name,
                        j.state,
                        j.id,
                        j.jid.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                        if j.template { "yes" } else { "no" }
                    );
                }
            }
        }

        Commands::Get { jail, json } => {
            let view = helm.get(&jail)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                let s = &view.summary;
                println!("Name:     {}", s.name);
                println!("Id:       {}", s.id);
                println!("State:    {}", s.state);
                if let Some(jid) = s.jid {
                    println!("JID:      {}", jid);
                }
                println!("Dataset:  {}", s.dataset);
                if let Some(origin) = &s.origin {
                    println!("Origin:   {}", origin);
                }
                if let Some(from) = &view.created_from {
                    println!("Source:   {}", from);
                }
                for limit in &view.limits {
                    println!("Limit:    {}", limit);
                }
                println!();
                println!("{:<24} {:<32} {}", "PROPERTY", "VALUE", "SOURCE");
                for (key, prop) in &view.properties {
                    println!("{:<24} {:<32} {}", key, prop.value, prop.source);
                }
            }
        }

        Commands::Set { jail, props } => {
            let spec = helm.set(&jail, &SpecUpdate::parse(&props)?)?;
            println!("Updated {}", spec.name);
        }

        Commands::Rename { jail, new_name } => {
            let update = SpecUpdate::parse(&[format!("name={}", new_name)])?;
            helm.set(&jail, &update)?;
            println!("Renamed {} to {}", jail, new_name);
        }

        Commands::Reapply { jail } => {
            let spec = helm.reapply_template(&jail)?;
            println!("Reapplied template properties to {}", spec.name);
        }

        Commands::Snapshot { jail, name } => {
            let snap = helm.snapshot(&jail, name.as_deref())?;
            println!("Created {}", snap.full_name());
        }

        Commands::Snapshots { jail, json } => {
            let snaps = helm.snapshots(&jail)?;
            if json {
                let data: Vec<serde_json::Value> = snaps
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "name": s.name,
                            "dataset": s.dataset,
                            "clones": s.clones,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                println!("{:<32} {:<6}", "SNAPSHOT", "CLONES");
                println!("{}", "-".repeat(40));
                for s in snaps {
                    println!("{:<32} {:<6}", s.name, s.clones);
                }
            }
        }

        Commands::Snapremove { jail, snapshot } => {
            helm.remove_snapshot(&jail, &snapshot)?;
            println!("Removed {}@{}", jail, snapshot);
        }

        Commands::Rollback { jail, snapshot } => {
            let discarded = helm.rollback(&jail, &snapshot)?;
            println!("Rolled {} back to {}", jail, snapshot);
            for snap in discarded {
                println!("  discarded {}", snap);
            }
        }

        Commands::Promote { jail } => {
            helm.promote(&jail)?;
            println!("Promoted {}", jail);
        }

        Commands::Reconcile => {
            println!(
                "Adopted {}, released {}, busy {}, foreign {}",
                report.adopted.len(),
                report.released.len(),
                report.busy.len(),
                report.foreign.len()
            );
            for name in &report.busy {
                println!("  {} is mid-transition in another process", name);
            }
            if report.failures > 0 {
                println!("{} cleanup steps failed while releasing", report.failures);
            }
        }

        Commands::Boot => finish_batch("started", warden.boot())?,

        Commands::Shutdown => finish_batch("stopped", warden.shutdown())?,
    }

    Ok(())
}

/// Print a batch outcome; the first failure becomes the exit error
fn finish_batch(verb: &str, report: BatchReport) -> Result<()> {
    for name in &report.succeeded {
        println!("{} {}", verb, name);
    }
    if report.is_clean() {
        return Ok(());
    }
    for (name, e) in &report.failed {
        eprintln!("{}: {}", name, e);
    }
    let (_, first) = report.failed.into_iter().next().ok_or_else(|| Error::Failed("empty batch".into()))?;
    Err(first)
}
