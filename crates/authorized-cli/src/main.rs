mod cli;
mod config;
mod status;
mod storage;
mod sync;

use std::path::Path;

use authorized_core::provider::StaticProvider;
use authorized_storage::{HandleState, OpenMode};
use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::ConfigCommand;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config_path = cli.config.as_deref();
    let config = config::load(config_path)?;
    match cli.command.unwrap_or(cli::Command::Status { json: false }) {
        cli::Command::Version => print_version(),
        cli::Command::Config(ConfigCommand::Init) => init_config(config_path)?,
        cli::Command::Status { json } => status::run(&config, json).await?,
        cli::Command::Migrate { user } => run_migrate(&config, &user).await?,
        cli::Command::Sync => run_sync(&config).await?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info; logs go to stderr so
    // `status --json` stays parseable.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("authorized {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::default_path()?,
    };
    let path = config::write_default_if_missing(&path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

async fn run_migrate(config: &config::Config, name: &str) -> Result<()> {
    let entry = config
        .find_user(name)
        .cloned()
        .ok_or_else(|| color_eyre::eyre::eyre!("user {name} is not in the config"))?;
    let manager = storage::manager_from_config(config);

    let state = tokio::task::spawn_blocking(move || {
        let handle = manager.open(&entry.user, &entry.identity(), OpenMode::CreateIfMissing)?;
        let state = handle.state();
        handle.close()?;
        Ok::<_, authorized_storage::KeysDirError>(state)
    })
    .await??;

    match state {
        HandleState::Migrated => println!("{name}: migrated to authorized_keys.d"),
        HandleState::Resolved => println!("{name}: authorized_keys.d already present"),
    }
    Ok(())
}

async fn run_sync(config: &config::Config) -> Result<()> {
    let provider = StaticProvider::new(config.provider_users());
    let summary = sync::run(config, &provider).await?;
    println!(
        "Migrated {}, updated {}, skipped {}, failed {}.",
        summary.migrated, summary.updated, summary.skipped, summary.failed
    );
    if summary.failed > 0 {
        color_eyre::eyre::bail!("{} user(s) failed to sync", summary.failed);
    }
    Ok(())
}
