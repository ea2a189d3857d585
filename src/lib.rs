// src/lib.rs

pub mod cli;
pub mod commands;
pub mod config;
pub mod connector;
pub mod dependency;
pub mod errors;
pub mod exec;
pub mod lock;
pub mod logging;
pub mod resource;
pub mod scheduler;
pub mod store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::commands::{Command, Commands};
use crate::config::loader::load_and_validate;
use crate::config::{ConfigFile, ManifestEntry};
use crate::connector::{Connector, ConnectorId, Connectors, LocalConnector};
use crate::errors::SchedulerError;
use crate::exec::LocalJobRunner;

pub use crate::dependency::{Dependency, DependencyKey, DependencyKind};
pub use crate::resource::{
    JobDetails, Message, Resource, ResourceId, ResourceKind, ResourceState,
};
pub use crate::scheduler::{Launch, Requirement, Scheduler, SchedulerOptions};
pub use crate::store::Store;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - manifest loading
/// - the local connector rooted at `[scheduler].workdir`
/// - the store (in memory, or a JSON snapshot)
/// - the scheduler and its local job runner
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    std::fs::create_dir_all(&cfg.scheduler.workdir)
        .with_context(|| format!("creating workdir {:?}", cfg.scheduler.workdir))?;
    // Run scripts `cd` into the job folder, so marker paths must be absolute.
    let workdir = std::fs::canonicalize(&cfg.scheduler.workdir)
        .with_context(|| format!("resolving workdir {:?}", cfg.scheduler.workdir))?;
    let local: Arc<dyn Connector> = Arc::new(LocalConnector::new(ConnectorId::local(), &workdir));
    let connectors = Connectors::new().with(local);
    let runner = Arc::new(LocalJobRunner::default());
    let options = cfg.scheduler.options();

    let scheduler = match cfg.scheduler.store_path() {
        Some(path) => Scheduler::open(path, connectors, runner, options)?,
        None => Scheduler::new(Arc::new(Store::in_memory()), connectors, runner, options)?,
    };

    let ids = submit_manifest(&scheduler, &cfg, &ConnectorId::local())?;
    info!(resources = ids.len(), workdir = %workdir.display(), "manifest submitted");

    scheduler.start()?;
    if args.once {
        wait_until_idle(&scheduler).await?;
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        info!("Ctrl+C received");
    }
    scheduler.shutdown().await;

    report(&scheduler, &ids);
    Ok(())
}

/// Submit every manifest entry, in dependency order.
///
/// Entries already present in the store are reused: tokens get their new
/// limit, finished or running jobs are left alone, other jobs are replaced.
pub fn submit_manifest(
    scheduler: &Scheduler,
    cfg: &ConfigFile,
    connector: &ConnectorId,
) -> errors::Result<BTreeMap<String, ResourceId>> {
    let mut ids: BTreeMap<String, ResourceId> = BTreeMap::new();
    let lookup = |ids: &BTreeMap<String, ResourceId>, name: &str| {
        ids.get(name)
            .copied()
            .ok_or_else(|| SchedulerError::ConfigError(format!("'{}' was not submitted", name)))
    };

    for entry in cfg.submission_order() {
        let id = match entry {
            ManifestEntry::Token(name, token) => {
                let path = token_path(name);
                match scheduler.find(connector, &path) {
                    Some(id) => {
                        scheduler.set_token_limit(id, token.limit)?;
                        id
                    }
                    None => scheduler.submit(
                        Resource::token(connector.clone(), path, token.limit),
                        Vec::new(),
                    )?,
                }
            }
            ManifestEntry::Data(_, data) => match scheduler.find(connector, &data.path) {
                Some(id) => id,
                None => {
                    let mut resource = Resource::data(connector.clone(), &data.path);
                    if !data.done {
                        resource = resource.with_state(ResourceState::Waiting);
                    }
                    scheduler.submit(resource, Vec::new())?
                }
            },
            ManifestEntry::Job(name, job) => {
                let existing = scheduler.find(connector, &job.path);
                let settled = existing
                    .and_then(|id| scheduler.state(id))
                    .is_some_and(|state| !state.is_updatable());
                match existing {
                    Some(id) if settled => {
                        debug!(job = %name, resource = %id, "job already settled; not resubmitted");
                        id
                    }
                    _ => {
                        let mut requirements = Vec::new();
                        for dep in &job.after {
                            requirements.push(Requirement::read(lookup(&ids, dep)?));
                        }
                        for dep in &job.exclusive {
                            requirements.push(Requirement::exclusive(lookup(&ids, dep)?));
                        }
                        for (token, count) in &job.tokens {
                            requirements.push(Requirement::tokens(lookup(&ids, token)?, *count));
                        }
                        let commands = Commands::single(Command::from_args(job.command.iter().cloned()));
                        let details = JobDetails::new(commands).with_priority(job.priority);
                        scheduler.submit(
                            Resource::job(connector.clone(), &job.path, details),
                            requirements,
                        )?
                    }
                }
            }
        };
        ids.insert(entry.name().to_string(), id);
    }
    Ok(ids)
}

fn token_path(name: &str) -> PathBuf {
    Path::new("tokens").join(name)
}

/// Wait until nothing is ready or running, or Ctrl-C.
async fn wait_until_idle(scheduler: &Scheduler) -> Result<()> {
    let mut events = scheduler.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = events.recv() => {}
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for Ctrl+C")?;
                info!("Ctrl+C received");
                return Ok(());
            }
        }
        if scheduler.is_idle() {
            info!("no job ready or running; exiting");
            return Ok(());
        }
    }
}

fn report(scheduler: &Scheduler, ids: &BTreeMap<String, ResourceId>) {
    for (name, id) in ids {
        if let Some(resource) = scheduler.resource(*id) {
            info!(name = %name, resource = %id, state = %resource.state(), "final state");
        }
    }
}

/// Print the validated manifest in submission order.
fn print_dry_run(cfg: &ConfigFile) {
    println!("labflow dry-run");
    println!("  scheduler.workdir = {}", cfg.scheduler.workdir.display());
    if let Some(store) = cfg.scheduler.store_path() {
        println!("  scheduler.store = {}", store.display());
    }
    println!("  scheduler.poll_interval = {:?}", cfg.scheduler.poll_interval);
    println!(
        "  scheduler.backoff = {:?}..{:?}",
        cfg.scheduler.backoff.base, cfg.scheduler.backoff.max
    );
    println!();

    for entry in cfg.submission_order() {
        match entry {
            ManifestEntry::Token(name, token) => {
                println!("token {name} (limit {})", token.limit);
            }
            ManifestEntry::Data(name, data) => {
                let state = if data.done { "done" } else { "waiting" };
                println!("data {name}: {} [{state}]", data.path.display());
            }
            ManifestEntry::Job(name, job) => {
                println!("job {name}: {}", job.path.display());
                println!("      command: {:?}", job.command);
                if job.priority != 0 {
                    println!("      priority: {}", job.priority);
                }
                if !job.after.is_empty() {
                    println!("      after: {:?}", job.after);
                }
                if !job.exclusive.is_empty() {
                    println!("      exclusive: {:?}", job.exclusive);
                }
                if !job.tokens.is_empty() {
                    println!("      tokens: {:?}", job.tokens);
                }
            }
        }
    }

    debug!("dry-run complete (nothing submitted)");
}
