//! tickstore: continuous futures market-data ingestion service.
//!
//! Boot order: environment + tracing, store, registry, control plane,
//! retention worker, then the HTTP server. When SYMBOLS is configured the
//! pipeline starts immediately; otherwise it waits for a Start call.
//!
//! Exit codes: 0 clean stop, 2 configuration error, 1 fatal store error or
//! a drain that missed its hard deadline.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickstore_backend::config::{AppConfig, StartRequest};
use tickstore_backend::control::{
    server, AppContext, ControlPlane, LogLevelControl, StartOutcome,
};
use tickstore_backend::error::IngestError;
use tickstore_backend::ingest::client::RestSnapshotFetcher;
use tickstore_backend::ingest::session::SessionConfig;
use tickstore_backend::registry::SymbolRegistry;
use tickstore_backend::store::aggregate::AggregatorConfig;
use tickstore_backend::store::retention::{RetentionConfig, RetentionManager};
use tickstore_backend::store::writer::WriterConfig;
use tickstore_backend::store::MarketStore;
use tickstore_backend::telemetry::TelemetryBus;
use tickstore_backend::validate::SloConfig;

#[derive(Debug, Parser)]
#[command(name = "tickstore", about = "Futures market-data ingestion engine")]
struct Cli {
    /// Store location; overrides DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
    /// Control plane port; overrides MONITORING_PORT.
    #[arg(long)]
    port: Option<u16>,
    /// Comma-separated symbol universe; overrides SYMBOLS.
    #[arg(long)]
    symbols: Option<String>,
    /// Do not start ingestion on boot even when symbols are configured.
    #[arg(long, default_value_t = false)]
    no_autostart: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match AppConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(port) = cli.port {
        config.monitoring_port = port;
    }
    if let Some(symbols) = cli.symbols {
        config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let log_control = init_tracing(&config.log_level);

    match run(config, cli.no_autostart, log_control).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal");
            if e.downcast_ref::<IngestError>()
                .map(|ie| matches!(ie, IngestError::Config(_)))
                .unwrap_or(false)
            {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

async fn run(
    config: AppConfig,
    no_autostart: bool,
    log_control: LogLevelControl,
) -> anyhow::Result<ExitCode> {
    info!(
        db = config.database_path(),
        port = config.monitoring_port,
        symbols = config.symbols.len(),
        "tickstore_starting"
    );

    let store = MarketStore::open(config.database_path()).context("opening market store")?;
    let registry =
        SymbolRegistry::new(store.clone()).context("warming symbol registry cache")?;
    let telemetry = TelemetryBus::new();

    let session = SessionConfig::from_env();
    let snapshots = Arc::new(
        RestSnapshotFetcher::new(config.venue_rest_base.clone(), &session)
            .context("building snapshot client")?,
    );

    let control = ControlPlane::new(AppContext {
        config: config.clone(),
        store: store.clone(),
        registry,
        telemetry: telemetry.clone(),
        snapshots,
        session,
        writer: WriterConfig::from_env(),
        aggregator: AggregatorConfig::from_env(),
        slo: SloConfig::default(),
        log_control,
    });

    // Retention runs for the process lifetime, independent of Start/Stop.
    let (retention_shutdown_tx, retention_shutdown_rx) = tokio::sync::watch::channel(false);
    let retention = RetentionManager::spawn(
        store,
        RetentionConfig::from_env(),
        telemetry,
        retention_shutdown_rx,
    );

    if !config.symbols.is_empty() && !no_autostart {
        match control.start(&StartRequest::default()).await {
            StartOutcome::Accepted => info!("ingestion_autostarted"),
            StartOutcome::AlreadyRunning => {}
            StartOutcome::Invalid { reason } => {
                return Err(IngestError::config(format!("autostart rejected: {reason}")).into());
            }
        }
    } else if config.symbols.is_empty() {
        warn!("no symbols configured; waiting for a start request");
    }

    let server_control = control.clone();
    let port = config.monitoring_port;
    let server_task = tokio::spawn(async move { server::serve(server_control, port).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
        }
        joined = server_task => {
            match joined {
                Ok(Ok(())) => warn!("control_plane_server_exited"),
                Ok(Err(e)) => return Err(e).context("control plane server"),
                Err(e) => return Err(e).context("control plane server task"),
            }
        }
    }

    control.stop().await;
    let _ = retention_shutdown_tx.send(true);
    let _ = retention.await;

    if control.had_dirty_shutdown() {
        warn!("shutdown_drain_incomplete");
        return Ok(ExitCode::from(1));
    }
    info!("tickstore_stopped");
    Ok(ExitCode::SUCCESS)
}

/// Initialize tracing with a reloadable filter so the Start config's
/// log_level applies to the live subscriber.
fn init_tracing(level: &str) -> LogLevelControl {
    use tracing_subscriber::{reload, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tickstore_backend={level}")));
    let (filter_layer, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Arc::new(move |directive: &str| {
        match EnvFilter::try_new(format!("tickstore_backend={directive}")) {
            Ok(filter) => handle.reload(filter).is_ok(),
            Err(_) => false,
        }
    })
}
