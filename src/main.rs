//! Purchase Webhook Server
//!
//! Serves the ingestion endpoint, status probes and, when an admin token is
//! configured, the audit reporting routes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use purchase_webhook::handlers::{status_router, PipelineMetrics, StatusState};
use purchase_webhook::report::report_router;
use purchase_webhook::store::{read_catalog_file, InMemoryStore, Store};
use purchase_webhook::webhook::{webhook_router, WebhookConfig, WebhookState};

/// Purchase Webhook Server
#[derive(Parser, Debug)]
#[command(name = "purchase-webhook")]
#[command(version)]
#[command(about = "Verifies, audits and fulfills purchase webhooks")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON file of catalog products to seed at startup
    #[arg(long, env = "WEBHOOK_CATALOG")]
    catalog: Option<PathBuf>,

    /// PostgreSQL connection string; in-memory storage when absent
    #[cfg(feature = "postgres")]
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over the verbosity flag
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if args.verbose {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = WebhookConfig::from_env().context("loading webhook configuration")?;
    let store = open_store(&args).await?;

    let metrics = Arc::new(PipelineMetrics::new());
    let mut app = Router::new()
        .merge(webhook_router(WebhookState::new(
            store.clone(),
            &config,
            metrics.clone(),
        )))
        .merge(status_router(StatusState {
            metrics,
            store: store.clone(),
        }));

    match report_router(store, &config) {
        Some(reports) => app = app.merge(reports),
        None => warn!("WEBHOOK_ADMIN_TOKEN not set, reporting routes disabled"),
    }

    let app = app.layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(
        "Purchase webhook server v{} listening on {}",
        purchase_webhook::VERSION,
        addr
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving HTTP")?;

    info!("Server stopped");
    Ok(())
}

async fn open_store(args: &Args) -> anyhow::Result<Arc<dyn Store>> {
    let catalog = match &args.catalog {
        Some(path) => read_catalog_file(path)
            .with_context(|| format!("reading catalog {}", path.display()))?,
        None => Vec::new(),
    };
    if catalog.is_empty() {
        warn!("No catalog products seeded; every product will be reported unknown");
    }

    #[cfg(feature = "postgres")]
    {
        if let Some(url) = &args.database_url {
            let store = purchase_webhook::store::PostgresStore::connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            let seeded = store.seed_catalog(catalog).await?;
            info!(seeded, "Using PostgreSQL store");
            return Ok(Arc::new(store));
        }
    }

    let store = InMemoryStore::new();
    let seeded = store.seed_catalog(catalog);
    info!(seeded, "Using in-memory store");
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
