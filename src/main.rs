//! dep-assigner - Apple DEP device sync and profile assignment
//!
//! Main entry point for the dep-assigner CLI.

mod commands;

use anyhow::{bail, Context};
use clap::Parser;
use commands::{Cli, Command, SetAssistantArgs, SetupAssistantCommand, TeamCommand};
use dep_assigner::config::{validate_config_result, AssignerConfig};
use dep_assigner::daemon::{AssignerDaemon, DaemonConfig, DaemonEvent};
use dep_assigner::datastore::{AppConfigStore, CursorStorage, Datastore, SqliteStore};
use dep_assigner::dep::{DepService, RunSummary, DEP_NAME};
use dep_assigner::integrations::AppleDepClient;
use dep_assigner::model::TeamScope;
use dep_assigner::{logging, metrics};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    if let Err(e) = logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli { config, command } = cli;
    let config_path = config.unwrap_or_else(AssignerConfig::default_path);

    // Init writes the config, so it runs before anything loads it
    if let Command::Init { server_url, force } = &command {
        return handle_init(&config_path, server_url, *force);
    }

    let config = AssignerConfig::load(&config_path)?;
    validate_config_result(&config)?;

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(async move {
        let store = open_store(&config).await?;

        match command {
            // Handled before the config is loaded
            Command::Init { .. } => Ok(()),
            Command::Run => handle_run(&config, store).await,
            Command::Daemon {
                interval,
                metrics_file,
            } => handle_daemon(&config, store, interval, metrics_file).await,
            Command::Status => handle_status(&store).await,
            Command::SetupAssistant(cmd) => handle_setup_assistant(&store, cmd).await,
            Command::Team(cmd) => handle_team(&store, cmd),
            Command::Metrics => handle_metrics(&config, store).await,
        }
    })
}

fn handle_init(path: &Path, server_url: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    let config = AssignerConfig::new(server_url);
    validate_config_result(&config)?;
    config.save(path)?;

    println!("Wrote {}", path.display());
    println!("Database: {}", config.database.display());
    println!(
        "Set ${} to the DEP session token before running `dep-assigner run`",
        config.dep.session_token_env
    );
    Ok(())
}

/// Open the database and copy the deployment settings into the app config
async fn open_store(config: &AssignerConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.database)
        .with_context(|| format!("opening database {}", config.database.display()))?;

    if config.seed_store(&store).await? {
        tracing::info!("App config updated from config file");
    }

    Ok(Arc::new(store))
}

fn build_service(config: &AssignerConfig, store: Arc<SqliteStore>) -> anyhow::Result<DepService> {
    let client = AppleDepClient::from_settings(&config.dep)?;
    tracing::debug!(base_url = %client.base_url(), "DEP client ready");

    Ok(DepService::new(
        store.clone(),
        store,
        Arc::new(client),
        config.sync_options(),
    ))
}

async fn handle_run(config: &AssignerConfig, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let service = build_service(config, store)?;
    let summary = service.run_assigner().await?;
    print_summary(&summary);
    Ok(())
}

async fn handle_daemon(
    config: &AssignerConfig,
    store: Arc<SqliteStore>,
    interval: Option<u64>,
    metrics_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.interval());
    if interval.is_zero() {
        bail!("Interval must be greater than zero");
    }

    let service = Arc::new(build_service(config, store)?);
    let mut daemon = AssignerDaemon::new(service, DaemonConfig::default().with_interval(interval));

    let mut events = daemon.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DaemonEvent::PassCompleted(summary) => print_summary(&summary),
                DaemonEvent::PassFailed(_) => {}
                _ => continue,
            }
            if let Some(path) = &metrics_file {
                if let Err(e) = metrics::write_metrics_file(path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics file");
                }
            }
        }
    });

    println!("Running every {}s (Ctrl-C to stop)", interval.as_secs());
    daemon.run().await?;
    Ok(())
}

async fn handle_status(store: &SqliteStore) -> anyhow::Result<()> {
    let app_config = store.app_config().await?;
    let cursor = store.retrieve_cursor(DEP_NAME).await?;

    println!("Server URL:     {}", app_config.server_settings.server_url);
    println!(
        "Terms expired:  {}",
        if app_config.mdm.apple_bm_terms_expired { "yes" } else { "no" }
    );

    if cursor.is_empty() {
        println!("Sync cursor:    (none, next pass fetches all devices)");
    } else {
        let stored = cursor
            .modified_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        println!("Sync cursor:    {} (stored {})", cursor.token, stored);
    }

    let default_team = match app_config.mdm.apple_bm_default_team.as_str() {
        "" => None,
        name => match store.team_by_name(name).await {
            Ok(team) => Some(team),
            Err(e) if e.is_not_found() => {
                println!("Default team:   {} (missing)", name);
                None
            }
            Err(e) => return Err(e.into()),
        },
    };
    if let Some(team) = &default_team {
        println!("Default team:   {} (id {})", team.name, team.id);
    }

    let scope = TeamScope::of(default_team.as_ref());
    println!();
    println!("Profiles for {}:", scope);

    match store.default_setup_assistant(scope).await {
        Ok((uuid, at)) => println!("  default:  {} ({})", uuid, at.to_rfc3339()),
        Err(e) if e.is_not_found() => println!("  default:  (not registered)"),
        Err(e) => return Err(e.into()),
    }
    match store.setup_assistant(scope).await {
        Ok(sa) if sa.is_registered() => println!("  custom:   {} ({})", sa.profile_uuid, sa.name),
        Ok(sa) => println!("  custom:   (pending registration, {})", sa.name),
        Err(e) if e.is_not_found() => println!("  custom:   (none)"),
        Err(e) => return Err(e.into()),
    }

    println!();
    println!("Hosts:          {}", store.host_serials()?.len());
    println!("DEP assigned:   {}", store.dep_assigned_serials()?.len());
    Ok(())
}

async fn handle_setup_assistant(
    store: &SqliteStore,
    cmd: SetupAssistantCommand,
) -> anyhow::Result<()> {
    match cmd {
        SetupAssistantCommand::Set(SetAssistantArgs { file, team, name }) => {
            let scope = resolve_scope(store, team.as_deref()).await?;
            let profile = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let name = name.unwrap_or_else(|| display_name(&file));

            let sa = store
                .set_setup_assistant(scope, &name, &profile)
                .with_context(|| format!("invalid DEP profile in {}", file.display()))?;

            if sa.is_registered() {
                println!("Setup assistant '{}' for {} unchanged", sa.name, scope);
            } else {
                println!(
                    "Setup assistant '{}' for {} saved, it will be registered on the next pass",
                    sa.name, scope
                );
            }
        }

        SetupAssistantCommand::Delete { team } => {
            let scope = resolve_scope(store, team.as_deref()).await?;
            store.delete_setup_assistant(scope)?;
            println!("Removed custom setup assistant for {}", scope);
        }
    }

    Ok(())
}

fn handle_team(store: &SqliteStore, cmd: TeamCommand) -> anyhow::Result<()> {
    match cmd {
        TeamCommand::Create {
            name,
            end_user_auth,
        } => {
            let team = store.create_team(&name, end_user_auth)?;
            println!("Created team '{}' (id {})", team.name, team.id);
        }
    }
    Ok(())
}

async fn handle_metrics(config: &AssignerConfig, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let service = build_service(config, store)?;
    if let Err(e) = service.run_assigner().await {
        // Metrics still describe the failed pass
        tracing::error!(error = %e, "Assigner pass failed");
    }
    print!("{}", metrics::encode_metrics()?);
    Ok(())
}

async fn resolve_scope(store: &SqliteStore, team: Option<&str>) -> anyhow::Result<TeamScope> {
    match team {
        None => Ok(TeamScope::NoTeam),
        Some(name) => {
            let team = store
                .team_by_name(name)
                .await
                .with_context(|| format!("team '{}'", name))?;
            Ok(team.scope())
        }
    }
}

fn display_name(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| PathBuf::from(file).display().to_string())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Pass complete in {:.1}s: {} page(s), {} device(s){}",
        summary.duration.as_secs_f64(),
        summary.pages,
        summary.devices_seen,
        if summary.cursor_reset { ", cursor reset" } else { "" }
    );
    for error in &summary.errors {
        println!("  error: {}", error);
    }
}
