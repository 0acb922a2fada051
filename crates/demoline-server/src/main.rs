//! Demoline Daemon (`demolined`)
//!
//! Runs the ingest server against a SQLite ledger and a demo directory,
//! and provisions API keys into the same ledger.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use demoline::DemolineServerBuilder;
use demoline_ingest::{FsBlobSink, IngestConfig, ReaperConfig};
use demoline_ledger::SqliteLedger;
use demoline_protocol::UserId;
use demoline_session::{SessionConfig, SqliteCredentials};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "demolined", version, about = "Demoline ingest daemon")]
struct Args {
    /// SQLite ledger holding sessions and API keys
    #[arg(long, env = "DEMOLINE_DATABASE", default_value = "demoline.db", global = true)]
    database: PathBuf,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept streams (the default)
    Serve,
    /// Register or replace an API key
    AddKey {
        /// Steam id of the key's owner
        user_id: String,
        api_key: String,
        /// Allow the key to list and download demos
        #[arg(long)]
        analyst: bool,
    },
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to accept WebSocket connections on
    #[arg(long, env = "DEMOLINE_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Directory finished demos are written to
    #[arg(long, env = "DEMOLINE_DEMO_DIR", default_value = "demos")]
    demo_dir: PathBuf,

    /// Seconds an unattached session holds its key
    #[arg(long, env = "DEMOLINE_OPEN_TIMEOUT_SECS", default_value_t = 600)]
    open_timeout_secs: u64,

    /// Seconds of stream silence before the client counts as gone
    #[arg(long, env = "DEMOLINE_IDLE_TIMEOUT_SECS", default_value_t = 30)]
    idle_timeout_secs: u64,

    /// Seconds without a heartbeat before the reaper abandons a stream;
    /// must exceed the idle timeout
    #[arg(long, env = "DEMOLINE_STALE_STREAM_SECS", default_value_t = 120)]
    stale_stream_secs: u64,

    /// Seconds between reaper sweeps
    #[arg(long, env = "DEMOLINE_REAP_INTERVAL_SECS", default_value_t = 30)]
    reap_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let ledger = SqliteLedger::open(&args.database).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(ledger, args.serve).await,
        Command::AddKey {
            user_id,
            api_key,
            analyst,
        } => {
            let credentials = SqliteCredentials::new(ledger.pool().clone());
            credentials
                .provision(&UserId::new(user_id), &api_key, analyst)
                .await?;
            Ok(())
        }
    }
}

async fn serve(ledger: SqliteLedger, args: ServeArgs) -> anyhow::Result<()> {
    tracing::info!("demolined v{} starting...", env!("CARGO_PKG_VERSION"));

    let credentials = SqliteCredentials::new(ledger.pool().clone());
    let blobs = FsBlobSink::new(&args.demo_dir).await?;

    let server = DemolineServerBuilder::new()
        .bind(&args.bind)
        .session_config(SessionConfig {
            open_timeout: Duration::from_secs(args.open_timeout_secs),
        })
        .ingest_config(IngestConfig {
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            ..IngestConfig::default()
        })
        .reaper_config(ReaperConfig {
            interval: Duration::from_secs(args.reap_interval_secs),
            stale_stream_after: Duration::from_secs(args.stale_stream_secs),
        })
        .build(credentials, ledger, blobs)
        .await?;

    tracing::info!(addr = %server.local_addr()?, demo_dir = %args.demo_dir.display(), "listening");

    server.run_until(shutdown_signal()).await?;

    tracing::info!("Daemon stopped");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        if let Ok(directive) = level.parse() {
            filter = filter.add_directive(directive);
        }
    }

    for noisy in ["sqlx=warn", "tungstenite=warn"] {
        if let Ok(directive) = noisy.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                tracing::warn!("could not install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutdown signal received...");
}
