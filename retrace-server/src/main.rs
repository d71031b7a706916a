use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use retrace_config::Config;
use retrace_core::{HistoryService, Notifier, Store};
use retrace_server::{AppState, EventBroadcaster};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "retrace-server")]
#[command(about = "Local text-file history service")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, env = "RETRACE_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "retrace=info,retrace_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).context("loading configuration")?;

    if let Some(db_dir) = config.db_path.parent() {
        std::fs::create_dir_all(db_dir)
            .with_context(|| format!("creating database directory {}", db_dir.display()))?;
    }

    let store = Arc::new(
        Store::open(&config.db_path)
            .await
            .context("opening database")?,
    );

    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let notifier: Arc<dyn Notifier> = Arc::new(EventBroadcaster::new(events.clone()));

    let service = HistoryService::start(config.watch_groups.clone(), Arc::clone(&store), notifier)
        .await
        .context("starting capture pipeline")?;

    let state = AppState {
        store: Arc::clone(&store),
        events,
        watch_dirs: config.all_dirs(),
        basic_auth: config.basic_auth.clone(),
    };
    let app = retrace_server::router(state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("server starting on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    info!("shutting down");
    service.shutdown().await;
    store.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
