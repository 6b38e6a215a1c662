//! Embodiment engine binary
//!
//! One-shot commands (compare, erase, schema, config) run synchronously;
//! `run` starts the analysis workers and maintenance timers on a tokio
//! runtime and stays up until Ctrl+C.

use std::path::Path;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use embodiment_engine::cli::{Cli, Commands, ConfigSubcommand, SchemaSubcommand, SubjectArgs};
use embodiment_engine::config::{self, EngineConfig};
use embodiment_engine::error::{Error, Result};
use embodiment_engine::logging::{self, LogGuards};
use embodiment_engine::queue::BreakerStatus;
use embodiment_engine::schema::{load_schema, RefreshOutcome, SchemaLoad};
use embodiment_engine::version;
use embodiment_engine::{EmbodimentEngine, Pseudonym};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

fn main() {
    // Parse CLI arguments first so logging knows the verbosity
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Schema { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_schema_command(subcommand)
        }
        Commands::Compare {
            description,
            artifact,
            subject,
            config,
        } => {
            let config = EngineConfig::load(config.as_deref())?;
            let _log_guards = init_logging(&config, cli.verbose, cli.quiet)?;
            run_compare(&config, &description, &artifact, &subject)
        }
        Commands::Erase { subject, config } => {
            let config = EngineConfig::load(config.as_deref())?;
            let _log_guards = init_logging(&config, cli.verbose, cli.quiet)?;
            run_erase(&config, &subject)
        }
        Commands::Run { config } => {
            let config = EngineConfig::load(config.as_deref())?;
            let _log_guards = init_logging(&config, cli.verbose, cli.quiet)?;
            info!(version = %version::banner(), "Starting embodiment engine");
            run_engine(config)
        }
    }
}

fn init_logging(config: &EngineConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    logging::init_logging(&config.logging, verbose, quiet)
}

// ─────────────────────────────────────────────────────────────────
// One-shot commands
// ─────────────────────────────────────────────────────────────────

fn resolve_pseudonym(subject: &SubjectArgs, config: &EngineConfig) -> Result<Option<Pseudonym>> {
    match (&subject.session, &subject.user) {
        (Some(session), _) => Pseudonym::new(session.as_str()).map(Some),
        (None, Some(user)) => Ok(Some(Pseudonym::derive(user, &config.storage.pseudonym_salt))),
        (None, None) => Ok(None),
    }
}

fn read_json(path: &str) -> Result<Value> {
    let path = Path::new(path);
    let content = std::fs::read_to_string(path).map_err(|e| Error::IoRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_str(&content)?)
}

fn run_compare(
    config: &EngineConfig,
    description: &str,
    artifact: &str,
    subject: &SubjectArgs,
) -> Result<()> {
    let description = read_json(description)?;
    let artifact = read_json(artifact)?;

    let pseudonym = match resolve_pseudonym(subject, config)? {
        Some(p) => p,
        None => Pseudonym::new(format!("cli-{}", uuid::Uuid::new_v4().simple()))?,
    };

    let engine = EmbodimentEngine::from_config(config)?;
    let report = engine.process_round(&pseudonym, &description, &artifact)?;
    debug!(
        session = %pseudonym,
        round = report.diff.round,
        "Comparison complete"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_erase(config: &EngineConfig, subject: &SubjectArgs) -> Result<()> {
    let pseudonym = resolve_pseudonym(subject, config)?.ok_or_else(|| {
        Error::config_field_invalid("session", "erase needs --session or --user")
    })?;
    if !config.storage.journal {
        warn!("Journal disabled, nothing persisted to erase");
    }

    let engine = EmbodimentEngine::from_config(config)?;
    let report = engine.erase(&pseudonym)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn handle_schema_command(subcommand: SchemaSubcommand) -> Result<()> {
    match subcommand {
        SchemaSubcommand::Show { config } => {
            let mut cfg = EngineConfig::load(config.as_deref())?;
            // Inspection never touches the journal
            cfg.storage.journal = false;
            let engine = EmbodimentEngine::from_config(&cfg)?;
            let (version, schema) = engine.active_schema();
            if engine.registry().is_fallback() {
                eprintln!("warning: schema source unusable, showing embedded fallback {}", version);
            }
            print!("{}", toml::to_string_pretty(&schema.to_document())?);
        }
        SchemaSubcommand::Validate { path } => {
            let file = Path::new(&path);
            let content = std::fs::read_to_string(file).map_err(|e| Error::IoRead {
                path: file.to_path_buf(),
                source: e,
            })?;
            match load_schema(&content) {
                SchemaLoad::Valid { schema, .. } => {
                    println!(
                        "Schema {} is valid ({} fields).",
                        schema.version(),
                        schema.fields().len()
                    );
                }
                SchemaLoad::Invalid { problems, .. } => {
                    return Err(Error::SchemaValidation { problems });
                }
            }
        }
    }
    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = EngineConfig::load(config.as_deref())?;
            println!("{}", cfg.to_toml()?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            EngineConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Long-running engine
// ─────────────────────────────────────────────────────────────────

fn run_engine(config: EngineConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("embodiment-engine")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_engine_main(config))
}

async fn async_engine_main(config: EngineConfig) -> Result<()> {
    let engine = EmbodimentEngine::from_config(&config)?;
    let (version, _) = engine.active_schema();
    info!(
        schema_version = %version,
        fallback = engine.registry().is_fallback(),
        journal = config.storage.journal,
        data_dir = %config.data_dir().display(),
        analyzer = %config.analysis.kind,
        "Engine ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.spawn_workers(shutdown_rx);

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let mut refresh_timer = tokio::time::interval(
        config.schema_refresh_interval().max(Duration::from_secs(1)),
    );
    refresh_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut reaper_timer = tokio::time::interval(config.queue.lease().max(Duration::from_secs(1)));
    reaper_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut stats_timer = tokio::time::interval(STATS_INTERVAL);
    stats_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(workers = handles.len(), "Engine event loop started");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }

            _ = refresh_timer.tick() => {
                match engine.refresh_schema() {
                    RefreshOutcome::Adopted(version) => {
                        info!(version = %version, "Schema version adopted")
                    }
                    RefreshOutcome::Kept(version) => {
                        warn!(version = %version, "Schema source unusable, keeping active version")
                    }
                    RefreshOutcome::Unchanged => debug!("Schema unchanged"),
                }
            }

            _ = reaper_timer.tick() => {
                match engine.reap_expired_leases() {
                    Ok(0) => {}
                    Ok(reclaimed) => info!(reclaimed, "Expired leases returned to pending"),
                    Err(e) => warn!(error = %e, "Lease reaper failed"),
                }
            }

            _ = stats_timer.tick() => {
                let stats = engine.job_stats();
                info!(
                    pending = stats.pending,
                    running = stats.running,
                    completed = stats.completed,
                    failed = stats.failed,
                    cancelled = stats.cancelled,
                    dead_letter = stats.dead_letter,
                    "Job queue stats"
                );
                for (analysis, status) in engine.breakers().statuses() {
                    if status != BreakerStatus::Closed {
                        warn!(analysis = %analysis, status = ?status, "Circuit not closed");
                    }
                }
            }
        }
    }

    if shutdown_tx.send(true).is_err() {
        debug!("All workers already stopped");
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task failed");
        }
    }

    info!("Engine stopped");
    Ok(())
}
