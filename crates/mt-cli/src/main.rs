use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mt_cli::commands::{apply, expand, init, log, purge, report, status};
use mt_cli::{ApplyEvent, Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(mt_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = mt_db::Database::open(&config.database_path).context("failed to open database")?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    match &cli.command {
        Some(Commands::Init) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            init::run(&mut db)?;
        }
        Some(Commands::Apply { event }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            match event {
                ApplyEvent::ObservationState {
                    machine,
                    state,
                    from,
                    to,
                    shift,
                    synchronous,
                } => apply::observation_state(
                    &mut db,
                    &config,
                    machine,
                    state,
                    from,
                    to.as_deref(),
                    shift.as_deref(),
                    *synchronous,
                )?,
                ApplyEvent::Activity {
                    machine,
                    mode,
                    from,
                    to,
                    synchronous,
                } => apply::activity(
                    &mut db,
                    &config,
                    machine,
                    mode,
                    from,
                    to.as_deref(),
                    *synchronous,
                )?,
                ApplyEvent::Reason {
                    machine,
                    reason,
                    score,
                    from,
                    to,
                    synchronous,
                } => apply::reason(
                    &mut db,
                    &config,
                    machine,
                    reason.as_deref(),
                    *score,
                    from,
                    to.as_deref(),
                    *synchronous,
                )?,
                ApplyEvent::Template {
                    machine,
                    template,
                    from,
                    shift,
                } => apply::template(&mut db, &config, machine, template, from, *shift)?,
            }
        }
        Some(Commands::Expand { machine, until }) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            expand::run(&mut db, machine, until.as_deref())?;
        }
        Some(Commands::Report { machine, json }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            report::run(&mut io::stdout(), &db, machine, *json)?;
        }
        Some(Commands::Status) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            status::run(&mut io::stdout(), &db)?;
        }
        Some(Commands::Log { severity }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            log::run(&mut io::stdout(), &db, severity.as_deref())?;
        }
        Some(Commands::Purge { before }) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            purge::run(&mut db, before)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
