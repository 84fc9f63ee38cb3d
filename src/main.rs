//! sessiongen - Chat account pairing service
//!
//! Links a new device to a chat account by pairing code or QR and hands the
//! resulting session credentials back to the account owner.

use anyhow::Result;
use clap::Parser;
use sessiongen_core::{Config, LoopbackConnector, RetentionPolicy, RetryPolicy};
use sessiongen_server::{create_router, AppState};
use sessiongen_session::{PairingManager, SessionStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// sessiongen - Pair a device and receive its session credentials
#[derive(Parser, Debug)]
#[command(name = "sessiongen")]
#[command(version, about, long_about = None)]
struct Args {
    /// Server port
    #[arg(short, long, env = "PORT", default_value = "8000")]
    port: u16,

    /// Directory holding session credentials (default: platform data dir)
    #[arg(short, long, env = "SESSIONGEN_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Maximum number of pairing sessions in flight
    #[arg(short, long, default_value = "100")]
    max_sessions: usize,

    /// Delay before requesting a pairing code, in milliseconds
    #[arg(long, default_value = "3000")]
    code_delay_ms: u64,

    /// How long a request waits for its pairing code or QR, in seconds
    #[arg(long, default_value = "60")]
    challenge_timeout_secs: u64,

    /// Upper bound on a pairing session's life, in seconds
    #[arg(long, default_value = "300")]
    session_lifetime_secs: u64,

    /// Reconnects allowed per session
    #[arg(long, default_value = "5")]
    max_retries: u32,

    /// Stored bundle retention: one-shot, until-fetched, time-boxed
    #[arg(short, long, default_value = "time-boxed")]
    retention: String,

    /// Lifetime of time-boxed bundles, in seconds
    #[arg(long, default_value = "86400")]
    retention_ttl_secs: u64,

    /// Do not send the session to the paired account
    #[arg(long)]
    no_deliver: bool,

    /// Seconds after which loopback connections pair themselves
    #[arg(long, default_value = "20")]
    autopilot_secs: u64,

    /// How often stale sessions are removed from disk, in seconds
    #[arg(long, default_value = "60")]
    reap_interval_secs: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(log_level.into())
                .add_directive("hyper=warn".parse()?),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("sessiongen v{}", env!("CARGO_PKG_VERSION"));

    let retention = RetentionPolicy::parse(
        &args.retention,
        Duration::from_secs(args.retention_ttl_secs),
    )
    .map_err(|e| anyhow::anyhow!(e))?;

    let mut config = Config::new()
        .with_port(args.port)
        .with_max_sessions(args.max_sessions)
        .with_pairing_code_delay(Duration::from_millis(args.code_delay_ms))
        .with_challenge_timeout(Duration::from_secs(args.challenge_timeout_secs))
        .with_session_lifetime(Duration::from_secs(args.session_lifetime_secs))
        .with_retry(RetryPolicy {
            max_attempts: args.max_retries,
            ..RetryPolicy::default()
        })
        .with_retention(retention)
        .with_delivery(!args.no_deliver);
    if let Some(dir) = args.storage_dir {
        config = config.with_storage_dir(dir);
    }

    let store = match &config.storage_dir {
        Some(dir) => SessionStore::with_root(dir).await?,
        None => SessionStore::new().await?,
    };
    let store = Arc::new(store);

    let connector = LoopbackConnector::new().with_autopilot(Duration::from_secs(args.autopilot_secs));
    info!(
        "Protocol backend: loopback (devices pair after {}s)",
        args.autopilot_secs
    );

    let pairing_manager = Arc::new(PairingManager::new(
        Arc::new(connector),
        store.clone(),
        config.clone(),
    ));

    // Clear out whatever earlier runs left behind, then keep doing so
    let reaper = {
        let manager = pairing_manager.clone();
        let period = Duration::from_secs(args.reap_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                manager.reap().await;
            }
        })
    };

    let state = Arc::new(AppState::new(pairing_manager));
    let router = create_router(state);

    info!("Starting server on port {}...", config.port);
    info!("  Sessions stored in {:?}", store.root());
    info!("  Retention: {}", config.retention);
    info!("  Pair by code: GET /pair?number=<international number>");
    info!("  Pair by QR:   GET /qr");

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    reaper.abort();

    info!("Goodbye!");
    Ok(())
}
