//! fast-ingest: analytics event ingestion and metrics aggregation service.
//!
//! Wires the store, the admission queue, the batch writer and the HTTP
//! server together, and owns shutdown ordering.

use clap::Parser;
use fast_ingest_api::{ApiServer, AppState};
use fast_ingest_core::config::AppConfig;
use fast_ingest_pipeline::{AdmissionQueue, BatchWriter, WriterConfig};
use fast_ingest_storage::{EventStore, MemoryEventStore, PgEventStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fast-ingest")]
#[command(about = "Analytics event ingestion and metrics aggregation service")]
#[command(version)]
struct Cli {
    /// HTTP port (overrides config)
    #[arg(long, env = "FAST_INGEST__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// PostgreSQL connection string (overrides config)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Admission queue capacity (overrides config)
    #[arg(long, env = "FAST_INGEST__PIPELINE__QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Events per flush (overrides config)
    #[arg(long, env = "FAST_INGEST__PIPELINE__BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Flush timer period in milliseconds (overrides config)
    #[arg(long, env = "FAST_INGEST__PIPELINE__FLUSH_INTERVAL_MS")]
    flush_interval_ms: Option<u64>,

    /// Keep events in memory instead of PostgreSQL
    #[arg(long, default_value_t = false)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fast_ingest=info,tower_http=info".into()),
        )
        .json()
        .init();

    if let Ok(path) = dotenvy::from_filename(".env.dev") {
        info!(path = %path.display(), "Loaded environment file");
    }

    let cli = Cli::parse();

    info!("fast-ingest starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if let Some(capacity) = cli.queue_capacity {
        config.pipeline.queue_capacity = capacity;
    }
    if let Some(size) = cli.batch_size {
        config.pipeline.batch_size = size;
    }
    if let Some(ms) = cli.flush_interval_ms {
        config.pipeline.flush_interval_ms = ms;
    }
    config.validate()?;

    info!(
        http_port = config.api.http_port,
        queue_capacity = config.pipeline.queue_capacity,
        batch_size = config.pipeline.batch_size,
        flush_interval_ms = config.pipeline.flush_interval_ms,
        memory_store = cli.memory_store,
        "Configuration loaded"
    );

    let store: Arc<dyn EventStore> = if cli.memory_store {
        warn!("Using in-memory store, events will not survive a restart");
        Arc::new(MemoryEventStore::new())
    } else {
        let pg = PgEventStore::connect(&config.database).await?;
        pg.ensure_schema().await?;
        Arc::new(pg)
    };

    let (queue, drain) = AdmissionQueue::bounded(config.pipeline.queue_capacity);
    let state = AppState::new(&config, queue, store.clone());
    let api_server = ApiServer::new(config.clone(), state);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let shutdown = CancellationToken::new();
    let writer = BatchWriter::new(store.clone(), WriterConfig::from(&config.pipeline))
        .spawn(drain, shutdown.clone());

    tokio::spawn(cancel_on_signal(shutdown.clone()));

    info!(backend = store.backend_name(), "fast-ingest is ready to serve traffic");

    // Blocks until the shutdown token fires and in-flight requests finish.
    let served = api_server.start_http(shutdown.clone()).await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server failed");
    }
    shutdown.cancel();

    // The writer bounds its own final flush by the grace period; the extra
    // store timeout covers the failure policy for anything left over.
    let grace = config.pipeline.shutdown_grace() + config.pipeline.store_timeout();
    match tokio::time::timeout(grace, writer).await {
        Ok(Ok(())) => info!("Batch writer finished"),
        Ok(Err(e)) => error!(error = %e, "Batch writer task failed"),
        Err(_) => warn!(
            grace_secs = grace.as_secs(),
            "Batch writer did not finish within the grace period"
        ),
    }

    store.close().await;
    info!("fast-ingest stopped");

    served
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    token.cancel();
}
