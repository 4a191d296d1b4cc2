mod clients;
mod commands;
mod config;
mod dispatch;
mod error;
mod gateway;
mod models;
mod response;
mod store;
mod sweeper;

use crate::commands::{Context, Invocation, Registry};
use crate::config::Config;

use clap::{CommandFactory, Parser};
use tracing::{info, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Simple sms service: queues outbound messages and dispatches them through the gateway.
#[derive(Debug, Parser)]
#[command(name = "sms-outbox")]
struct Cli {
    /// Command name followed by its arguments
    command: Vec<String>,

    /// Number of messages to process or list
    #[arg(long, default_value_t = 10)]
    count: i64,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn init_sentry(dsn: &str) -> sentry::ClientInitGuard {
    sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    let registry = Registry::new();

    let Some((name, command)) = cli
        .command
        .first()
        .and_then(|name| registry.get(name).map(|command| (name, command)))
    else {
        Cli::command().after_help(registry.help()).print_help()?;
        return Ok(());
    };

    // --- Configuration ---
    info!("Loading configuration...");
    let config = Config::load()?;
    let _sentry = config.sentry_dsn.as_deref().map(init_sentry);
    info!("Configuration loaded.");

    let ctx = Context::connect(config).await?;
    let invocation = Invocation {
        args: cli.command[1..].to_vec(),
        count: cli.count,
    };

    info!(command = %name, "Running command.");
    command.run(&ctx, &invocation).await?;

    Ok(())
}
