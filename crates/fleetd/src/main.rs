//! fleetd: the fleetgrid daemon.
//!
//! Runs the rollout scheduler against a redb state store and offers a few
//! operator commands on the same store.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml --data-dir /var/lib/fleetgrid
//! fleetd register dev-001 --attr region=eu
//! fleetd create nightly --filter 'attribute.region==eu' --distribution os-2.1 --groups 5
//! fleetd start nightly
//! fleetd status --name 'night%'
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use fleet_core::FleetConfig;
use fleetgrid_rollout::{
    Clock, CreateRollout, EngineSettings, RolloutEngine, RolloutScheduler, SystemClock,
};
use fleetgrid_state::{
    ActionType, GroupConditions, PageRequest, Rollout, StateStore, Target, UpdateType,
};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid rollout daemon")]
struct Cli {
    /// Configuration file. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state.
    #[arg(long, global = true, default_value = "/var/lib/fleetgrid")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rollout scheduler until Ctrl-C.
    Run,

    /// Print rollouts with their group and target counts as JSON.
    Status {
        /// Name pattern, `%` matches any run of characters.
        #[arg(long)]
        name: Option<String>,
    },

    /// Register a target, or update the name and attributes of a known one.
    Register {
        id: String,

        #[arg(long)]
        name: Option<String>,

        /// Attribute as `key=value`; may be repeated.
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },

    /// Create a rollout over the targets matching a filter.
    Create {
        name: String,

        /// Target filter, e.g. `attribute.region==eu;updateStatus!=error`.
        #[arg(long)]
        filter: String,

        #[arg(long)]
        distribution: String,

        #[arg(long, default_value = "1")]
        groups: u32,

        /// Finished percentage that completes a group.
        #[arg(long)]
        success_threshold: Option<u8>,

        /// Error percentage that stops the rollout.
        #[arg(long)]
        error_threshold: Option<u8>,

        #[arg(long, value_enum, default_value = "forced")]
        action_type: ActionKind,

        /// Download and installation confirmed separately.
        #[arg(long)]
        separated: bool,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// Start a READY rollout.
    Start { name: String },

    /// Pause a RUNNING rollout.
    Pause { name: String },

    /// Resume a PAUSED rollout.
    Resume { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionKind {
    Soft,
    Forced,
}

fn parse_attribute(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FleetConfig::default(),
    };

    // Logs go to stderr so command output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.log.filter))?,
        )
        .with_writer(std::io::stderr)
        .init();

    let engine = open_engine(&cli.data_dir, &config)?;

    match cli.command {
        Command::Run => run(engine, &config).await,
        Command::Status { name } => status(&engine, name.as_deref()),
        Command::Register {
            id,
            name,
            attributes,
        } => register(&engine, &id, name, attributes),
        Command::Create {
            name,
            filter,
            distribution,
            groups,
            success_threshold,
            error_threshold,
            action_type,
            separated,
            description,
        } => {
            let conditions = GroupConditions::thresholds(
                success_threshold.unwrap_or(config.defaults.success_threshold),
                error_threshold.unwrap_or(config.defaults.error_threshold),
            );
            let request = CreateRollout::new(&name, &filter, &distribution)
                .with_description(&description)
                .with_action_type(match action_type {
                    ActionKind::Soft => ActionType::Soft,
                    ActionKind::Forced => ActionType::Forced,
                })
                .with_update_type(if separated {
                    UpdateType::Separated
                } else {
                    UpdateType::Combined
                });
            let rollout = engine.create(request, groups, conditions)?;
            print_json(&rollout)
        }
        Command::Start { name } => {
            let rollout = find(&engine, &name)?;
            print_json(&engine.start(rollout.id)?)
        }
        Command::Pause { name } => {
            let rollout = find(&engine, &name)?;
            print_json(&engine.pause(rollout.id)?)
        }
        Command::Resume { name } => {
            let rollout = find(&engine, &name)?;
            print_json(&engine.resume(rollout.id)?)
        }
    }
}

fn open_engine(data_dir: &Path, config: &FleetConfig) -> anyhow::Result<RolloutEngine> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = config.store_path(data_dir);
    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening state store {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");
    Ok(RolloutEngine::new(store).with_settings(EngineSettings::from_config(config)))
}

async fn run(engine: RolloutEngine, config: &FleetConfig) -> anyhow::Result<()> {
    info!("fleetgrid daemon starting");
    let scheduler = RolloutScheduler::from_config(engine, config);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    scheduler_handle.await?;

    info!("fleetgrid daemon stopped");
    Ok(())
}

fn status(engine: &RolloutEngine, name: Option<&str>) -> anyhow::Result<()> {
    let page = engine.list_rollout_details(name, PageRequest::first(usize::MAX))?;
    let mut rollouts = Vec::with_capacity(page.items.len());
    for details in page.items {
        let groups = engine
            .groups(details.rollout.id)?
            .iter()
            .map(|group| engine.group_details(group.id))
            .collect::<Result<Vec<_>, _>>()?;
        rollouts.push(serde_json::json!({
            "rollout": details.rollout,
            "status": details.status,
            "groups": groups,
        }));
    }
    print_json(&serde_json::json!({
        "total": page.total,
        "rollouts": rollouts,
    }))
}

fn register(
    engine: &RolloutEngine,
    id: &str,
    name: Option<String>,
    attributes: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let store = engine.store();
    let mut target = match store.get_target(id)? {
        Some(target) => target,
        None => Target::new(id, SystemClock.now_millis()),
    };
    if let Some(name) = name {
        target.name = name;
    }
    target.attributes.extend(attributes);
    store.put_target(&target)?;
    info!(target_id = %target.id, "target registered");
    print_json(&target)
}

fn find(engine: &RolloutEngine, name: &str) -> anyhow::Result<Rollout> {
    engine
        .find_rollout_by_name(name)?
        .with_context(|| format!("no rollout named `{name}`"))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
