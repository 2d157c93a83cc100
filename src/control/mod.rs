//! Control plane: start/stop/restart/status/stats/validate.
//!
//! All operations serialize on a single async mutex, so control flow
//! observes a linearizable view of pipeline state. Start validates its
//! configuration synchronously and leaves prior state intact on rejection;
//! Start and Stop are idempotent. Stop drains in order: clients stop
//! accepting frames, writers flush under a bounded deadline, the aggregator
//! closes pending seconds, tasks are joined. A drain overrunning its hard
//! deadline is reported on the bus and recorded for a non-zero process
//! exit.

pub mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{AppConfig, IngestConfig, StartRequest};
use crate::error::IngestError;
use crate::ingest::client::SnapshotFetcher;
use crate::ingest::normalize::Normalizer;
use crate::ingest::session::SessionConfig;
use crate::ingest::supervisor::{ClientDeps, ShardPlan, ShardSupervisor};
use crate::models::{now_us, ChannelRates, StatusSnapshot};
use crate::registry::SymbolRegistry;
use crate::store::aggregate::{Aggregator, AggregatorConfig};
use crate::store::writer::{BatchWriter, WriterConfig};
use crate::store::{MarketStore, SymbolWindowStats};
use crate::telemetry::{IngestCounters, RateEstimator, TelemetryBus, TelemetryEvent};
use crate::validate::{SloConfig, ValidationReport, Validator};

// =============================================================================
// CONTEXT
// =============================================================================

/// Applies a log-level directive to the live subscriber; returns false when
/// the directive is invalid.
pub type LogLevelControl = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Long-lived process dependencies shared by control operations.
#[derive(Clone)]
pub struct AppContext {
    pub config: AppConfig,
    pub store: MarketStore,
    pub registry: SymbolRegistry,
    pub telemetry: TelemetryBus,
    pub snapshots: Arc<dyn SnapshotFetcher>,
    pub session: SessionConfig,
    pub writer: WriterConfig,
    pub aggregator: AggregatorConfig,
    pub slo: SloConfig,
    pub log_control: LogLevelControl,
}

// =============================================================================
// OUTCOMES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Accepted,
    AlreadyRunning,
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub last_minute: Vec<SymbolWindowStats>,
    pub last_hour: Vec<SymbolWindowStats>,
}

// =============================================================================
// PIPELINE
// =============================================================================

/// One running ingestion pipeline: supervisor + writers + aggregator +
/// rate sampler.
struct Pipeline {
    config: IngestConfig,
    started_at: DateTime<Utc>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    supervisor: Arc<ShardSupervisor>,
    monitor: JoinHandle<()>,
    writer_tasks: Vec<JoinHandle<()>>,
    agg_tasks: Vec<JoinHandle<()>>,
    rates_task: JoinHandle<()>,
    degraded: Arc<AtomicBool>,
    latest_rates: Arc<parking_lot::Mutex<ChannelRates>>,
}

struct ControlState {
    pipeline: Option<Pipeline>,
    last_config: Option<IngestConfig>,
    last_error: Option<String>,
}

// =============================================================================
// CONTROL PLANE
// =============================================================================

pub struct ControlPlane {
    ctx: AppContext,
    state: Mutex<ControlState>,
    /// Set when a drain misses its hard deadline; main exits non-zero.
    dirty_shutdown: AtomicBool,
}

impl ControlPlane {
    pub fn new(ctx: AppContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(ControlState {
                pipeline: None,
                last_config: None,
                last_error: None,
            }),
            dirty_shutdown: AtomicBool::new(false),
        })
    }

    pub fn had_dirty_shutdown(&self) -> bool {
        self.dirty_shutdown.load(Ordering::Acquire)
    }

    /// Start the pipeline. Rejections leave prior state untouched.
    pub async fn start(&self, req: &StartRequest) -> StartOutcome {
        let mut state = self.state.lock().await;
        if state.pipeline.is_some() {
            return StartOutcome::AlreadyRunning;
        }

        let cfg = match self.ctx.config.resolve_start(req) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "start_rejected");
                return StartOutcome::Invalid {
                    reason: e.to_string(),
                };
            }
        };

        if let Some(level) = &req.log_level {
            if !(self.ctx.log_control)(level) {
                return StartOutcome::Invalid {
                    reason: format!("invalid log_level: {level}"),
                };
            }
        }

        match self.launch(cfg.clone()) {
            Ok(pipeline) => {
                info!(
                    symbols = cfg.symbols.len(),
                    shards = pipeline.supervisor.shard_count(),
                    "pipeline_started"
                );
                state.last_config = Some(cfg);
                state.last_error = None;
                state.pipeline = Some(pipeline);
                StartOutcome::Accepted
            }
            Err(e) => {
                error!(error = %e, "pipeline_launch_failed");
                state.last_error = Some(e.to_string());
                StartOutcome::Invalid {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn launch(&self, cfg: IngestConfig) -> Result<Pipeline, IngestError> {
        // Ids for the configured universe exist before the first frame.
        self.ctx.registry.register_universe(&cfg.symbols)?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let counters = Arc::new(IngestCounters::default());

        let aggregator = Aggregator::spawn(
            self.ctx.store.clone(),
            self.ctx.aggregator.clone(),
            self.ctx.telemetry.clone(),
            shutdown_rx.clone(),
        );
        let writer = BatchWriter::spawn(
            self.ctx.store.clone(),
            self.ctx.writer.clone(),
            self.ctx.telemetry.clone(),
            Some(aggregator.notice_tx.clone()),
            shutdown_rx,
        );

        // Sample per-channel rates for status and publish them on the bus.
        let latest_rates = Arc::new(parking_lot::Mutex::new(ChannelRates::default()));
        let rates_task = {
            let estimator = RateEstimator::new(counters.clone());
            let latest = latest_rates.clone();
            let telemetry = self.ctx.telemetry.clone();
            let mut shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(5));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let rates = estimator.sample();
                            *latest.lock() = rates.clone();
                            telemetry.publish(TelemetryEvent::IngestRates { rates });
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let normalizer = Arc::new(Normalizer::new(
            self.ctx.registry.clone(),
            counters,
        ));
        let supervisor = ShardSupervisor::new(ClientDeps {
            session: self.ctx.session.clone(),
            ws_base: self.ctx.config.venue_ws_base.clone(),
            normalizer,
            writer: writer.handles.clone(),
            telemetry: self.ctx.telemetry.clone(),
            snapshots: self.ctx.snapshots.clone(),
        });
        let monitor = supervisor.start(ShardPlan::build(&cfg));

        Ok(Pipeline {
            config: cfg,
            started_at: Utc::now(),
            shutdown_tx,
            supervisor,
            monitor,
            writer_tasks: writer.tasks,
            agg_tasks: aggregator.tasks,
            rates_task,
            degraded: writer.degraded,
            latest_rates,
        })
    }

    /// Stop the pipeline, draining in order. Always accepted.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(pipeline) = state.pipeline.take() else {
            return true;
        };
        drop(state);

        // 1. Clients stop accepting frames and close their connections.
        pipeline.supervisor.stop().await;
        pipeline.monitor.abort();

        // 2. Writers flush and aggregator closes pending seconds, bounded.
        let _ = pipeline.shutdown_tx.send(true);
        let drain = async {
            for task in pipeline.writer_tasks {
                let _ = task.await;
            }
            for task in pipeline.agg_tasks {
                let _ = task.await;
            }
            let _ = pipeline.rates_task.await;
        };
        let deadline = self.ctx.writer.drain_deadline + Duration::from_secs(5);
        if tokio::time::timeout(deadline, drain).await.is_err() {
            self.dirty_shutdown.store(true, Ordering::Release);
            self.ctx.telemetry.publish(TelemetryEvent::TaskAborted {
                component: "pipeline_drain".into(),
                error: "hard drain deadline exceeded".into(),
            });
            error!("pipeline_drain_timeout");
        }

        info!("pipeline_stopped");
        true
    }

    /// Stop, then Start with the previous configuration.
    pub async fn restart(&self) -> StartOutcome {
        let previous = {
            let state = self.state.lock().await;
            match (&state.pipeline, &state.last_config) {
                (_, Some(cfg)) => Some(cfg.clone()),
                (Some(p), None) => Some(p.config.clone()),
                (None, None) => None,
            }
        };
        let Some(cfg) = previous else {
            return StartOutcome::Invalid {
                reason: "no previous configuration".into(),
            };
        };

        self.stop().await;

        let mut state = self.state.lock().await;
        if state.pipeline.is_some() {
            return StartOutcome::AlreadyRunning;
        }
        match self.launch(cfg.clone()) {
            Ok(pipeline) => {
                state.last_config = Some(cfg);
                state.pipeline = Some(pipeline);
                info!("pipeline_restarted");
                StartOutcome::Accepted
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                StartOutcome::Invalid {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Compact status snapshot. Always answers, running or not.
    pub async fn status(&self) -> StatusSnapshot {
        let state = self.state.lock().await;
        match &state.pipeline {
            Some(p) => StatusSnapshot {
                running: true,
                started_at: Some(p.started_at.to_rfc3339()),
                shards: p.supervisor.status(),
                rates: p.latest_rates.lock().clone(),
                degraded: p.degraded.load(Ordering::Relaxed),
                last_error: state.last_error.clone(),
            },
            None => StatusSnapshot {
                last_error: state.last_error.clone(),
                ..StatusSnapshot::stopped()
            },
        }
    }

    /// Per-symbol counts and last-seen timestamps over the last minute and
    /// hour.
    pub fn db_stats(&self) -> Result<DbStats, IngestError> {
        let now = now_us();
        Ok(DbStats {
            last_minute: self.ctx.store.window_stats(now, 60)?,
            last_hour: self.ctx.store.window_stats(now, 3600)?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<ValidationReport> {
        Validator::new(self.ctx.store.clone(), self.ctx.slo.clone()).run(&self.ctx.telemetry)
    }

    pub fn telemetry(&self) -> &TelemetryBus {
        &self.ctx.telemetry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelSet;
    use crate::ingest::wire::DepthSnapshot;
    use async_trait::async_trait;

    struct NoSnapshots;

    #[async_trait]
    impl SnapshotFetcher for NoSnapshots {
        async fn fetch(&self, _symbol: &str) -> Result<DepthSnapshot, IngestError> {
            Err(IngestError::transport("no snapshot source in test"))
        }
    }

    fn test_ctx() -> AppContext {
        let store = MarketStore::open_memory().unwrap();
        let registry = SymbolRegistry::new(store.clone()).unwrap();
        AppContext {
            config: AppConfig {
                database_url: ":memory:".into(),
                // Unroutable endpoint: clients stay in reconnect backoff.
                venue_ws_base: "wss://127.0.0.1:1".into(),
                venue_rest_base: "http://127.0.0.1:1".into(),
                monitoring_port: 0,
                log_level: "info".into(),
                symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
                channels: ChannelSet::default(),
                max_streams_per_connection: 50,
                tier0_size: 20,
                shard_count: None,
            },
            store,
            registry,
            telemetry: TelemetryBus::new(),
            snapshots: Arc::new(NoSnapshots),
            session: SessionConfig::default(),
            writer: WriterConfig::default(),
            aggregator: AggregatorConfig::default(),
            slo: SloConfig::default(),
            log_control: Arc::new(|level| {
                matches!(level, "trace" | "debug" | "info" | "warn" | "error")
            }),
        }
    }

    #[tokio::test]
    async fn test_start_start_stop_stop_idempotent() {
        let control = ControlPlane::new(test_ctx());

        assert_eq!(
            control.start(&StartRequest::default()).await,
            StartOutcome::Accepted
        );
        assert_eq!(
            control.start(&StartRequest::default()).await,
            StartOutcome::AlreadyRunning
        );

        let status = control.status().await;
        assert!(status.running);
        assert!(!status.shards.is_empty());

        assert!(control.stop().await);
        assert!(control.stop().await);
        let status = control.status().await;
        assert!(!status.running);
        assert!(status.shards.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_start_preserves_state() {
        let control = ControlPlane::new(test_ctx());

        let bad = StartRequest {
            channels: Some(vec!["klines".into()]),
            ..Default::default()
        };
        assert!(matches!(
            control.start(&bad).await,
            StartOutcome::Invalid { .. }
        ));
        assert!(!control.status().await.running);

        // A valid start still works, and a later invalid start while
        // running does not disturb the pipeline.
        assert_eq!(
            control.start(&StartRequest::default()).await,
            StartOutcome::Accepted
        );
        assert_eq!(control.start(&bad).await, StartOutcome::AlreadyRunning);
        assert!(control.status().await.running);
        control.stop().await;
    }

    #[tokio::test]
    async fn test_restart_uses_previous_config() {
        let control = ControlPlane::new(test_ctx());

        // Nothing ever started: restart has nothing to restore.
        assert!(matches!(
            control.restart().await,
            StartOutcome::Invalid { .. }
        ));

        let req = StartRequest {
            symbols: Some(vec!["SOLUSDT".into()]),
            ..Default::default()
        };
        assert_eq!(control.start(&req).await, StartOutcome::Accepted);
        let shards_before = control.status().await.shards.len();

        assert_eq!(control.restart().await, StartOutcome::Accepted);
        let status = control.status().await;
        assert!(status.running);
        assert_eq!(status.shards.len(), shards_before);
        control.stop().await;
    }

    #[tokio::test]
    async fn test_db_stats_and_validate_answer_while_stopped() {
        let control = ControlPlane::new(test_ctx());
        let stats = control.db_stats().unwrap();
        assert!(stats.last_minute.is_empty());

        let report = control.validate().unwrap();
        assert_eq!(report.checked, 0);
        assert!(report.passed);
    }
}
