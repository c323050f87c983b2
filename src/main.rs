use clap::{Parser, Subcommand};
use config::TetherConfig;
use std::path::PathBuf;
use std::sync::Arc;
use stress_test::{stress_test_scaling, stress_test_sessions};
use tether_compaction::{CompactionEngine, DigestSummarizer};
use tether_log::{JsonlBackend, LogStore};
use tether_sync::SyncServer;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod config;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Session log store with compaction and resumable sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket sync server on a JSONL store
    Serve {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Shared secret clients must present
        #[arg(long)]
        auth_token: Option<String>,
    },
    /// Drive an in-process server with writers, compactions and a flaky client
    Stress {
        #[arg(long, default_value_t = 4)]
        sessions: usize,
        #[arg(long, default_value_t = 200)]
        entries: usize,
        #[arg(long, default_value_t = 10)]
        compactions: usize,
        /// Also run the scaling analysis up to this many sessions
        #[arg(long)]
        scaling: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve {
            config,
            listen,
            data_dir,
            auth_token,
        } => {
            let mut config = TetherConfig::load(config.as_deref())?;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if auth_token.is_some() {
                config.server.auth_token = auth_token;
            }
            config.validate()?;
            serve(config).await
        }
        Command::Stress {
            sessions,
            entries,
            compactions,
            scaling,
        } => {
            let stats = stress_test_sessions(sessions, entries, compactions).await?;
            stats.print();
            if let Some(max_sessions) = scaling {
                stress_test_scaling(max_sessions, (max_sessions / 4).max(1)).await?;
            }
            println!("\n✓ Stress run completed");
            Ok(())
        }
    }
}

async fn serve(config: TetherConfig) -> anyhow::Result<()> {
    let backend = JsonlBackend::open(&config.data_dir)?.with_fsync(config.store.fsync);
    let store = Arc::new(LogStore::open(Arc::new(backend), config.store.store_config())?);
    info!(
        data_dir = %config.data_dir.display(),
        sessions = store.session_ids().len(),
        "store opened"
    );

    let engine = Arc::new(CompactionEngine::with_config(
        store.clone(),
        Arc::new(DigestSummarizer::new()),
        config.compaction.clone(),
    ));
    let server = Arc::new(SyncServer::new(store.clone(), engine, config.server.clone()));
    let listener = TcpListener::bind(&config.listen).await?;

    tokio::select! {
        result = tether_sync::ws::serve(listener, server) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    store.sync()?;
    Ok(())
}
