use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use tracelens::config::Config;
use tracelens::events::EventStream;
use tracelens::registry::SessionRegistry;
use tracelens::{gateway, hooks, sessions, subscribers};

#[derive(Parser)]
#[command(name = "tracelens", version, about = "Live trace inspector for agent frameworks")]
struct Cli {
    /// Path to a TOML config file (defaults apply when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the inspector gateway
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// List recorded sessions, newest first
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("tracelens.toml"));
    let mut config = Config::load(&config_path)?;

    let level = if config.debug.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }

            let events = Arc::new(EventStream::new(
                config.performance.sse_buffer_size,
                config.performance.max_sse_clients,
            ));
            let registry = Arc::new(SessionRegistry::new());
            let _subscribers = subscribers::register_all(
                hooks::bus(),
                Arc::clone(&registry),
                Arc::clone(&events),
                Duration::from_secs(config.heartbeat.interval_secs),
            );

            gateway::run_gateway(&config, events, registry).await
        }
        Command::Sessions => {
            let sessions = sessions::list_sessions(&config.traces_dir()).await;
            if sessions.is_empty() {
                println!("no sessions recorded in {}", config.traces_dir().display());
                return Ok(());
            }
            for session in sessions {
                let ended = session.ended_at.as_deref().unwrap_or("-");
                println!(
                    "{:<12} {:<24} {:<28} {:<28} {}",
                    session.status.as_str(),
                    session.id,
                    session.started_at,
                    ended,
                    session.title
                );
            }
            Ok(())
        }
    }
}
