//! Shard supervisor: partitions the symbol universe across stream clients
//! and owns their lifecycle.
//!
//! The plan is declarative: shards are computed from channel class and
//! liquidity tier (the configured universe is ordered most-liquid first).
//! Depth is its own class (heaviest stream); bookTicker/aggTrade share a
//! class; the optional channels share a third. Tier-0 symbols get smaller
//! shards so a reconnect storm on one connection touches less of the book.
//!
//! The supervisor restarts clients whose task ended outside shutdown,
//! owns the per-shard circuit breaker, and applies configuration changes as
//! a minimal diff (drain removed shards, create added ones, keep the rest).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::ingest::client::{SnapshotFetcher, StreamClient};
use crate::ingest::normalize::Normalizer;
use crate::ingest::session::{CircuitBreaker, ConnState, SessionConfig};
use crate::ingest::wire::stream_name;
use crate::models::{Channel, ShardStatus};
use crate::store::writer::WriterHandles;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

// =============================================================================
// PLAN
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub id: usize,
    pub name: String,
    pub channels: Vec<Channel>,
    pub symbols: Vec<String>,
}

impl ShardSpec {
    /// Stream names this shard subscribes to.
    pub fn stream_names(&self) -> Vec<String> {
        let mut streams = Vec::with_capacity(self.symbols.len() * self.channels.len());
        for symbol in &self.symbols {
            for channel in &self.channels {
                streams.push(stream_name(symbol, *channel));
            }
        }
        streams
    }

    /// Content signature for plan diffing (id and name excluded).
    fn signature(&self) -> (Vec<Channel>, Vec<String>) {
        (self.channels.clone(), self.symbols.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardPlan {
    pub shards: Vec<ShardSpec>,
}

impl ShardPlan {
    /// Partition the universe by channel class and liquidity tier, bounded
    /// by the per-connection stream cap.
    pub fn build(cfg: &IngestConfig) -> Self {
        let classes: [(&str, Vec<Channel>); 3] = [
            (
                "depth",
                [Channel::Depth]
                    .into_iter()
                    .filter(|c| cfg.channels.contains(*c))
                    .collect(),
            ),
            (
                "ticker",
                [Channel::BookTicker, Channel::AggTrade]
                    .into_iter()
                    .filter(|c| cfg.channels.contains(*c))
                    .collect(),
            ),
            (
                "aux",
                [Channel::MarkPrice, Channel::ForceOrder]
                    .into_iter()
                    .filter(|c| cfg.channels.contains(*c))
                    .collect(),
            ),
        ];

        // An explicit shard count partitions each class into uniform chunks
        // instead of tier-based sizing.
        let override_cap = cfg.shard_count.map(|n| {
            let n = n.max(1);
            (cfg.symbols.len() + n - 1) / n
        });

        let tier0_len = if override_cap.is_some() {
            0
        } else {
            cfg.tier0_size.min(cfg.symbols.len())
        };
        let (tier0, rest) = cfg.symbols.split_at(tier0_len);

        let mut shards = Vec::new();
        for (class, channels) in classes {
            if channels.is_empty() {
                continue;
            }
            // Streams per symbol = channel count; cap symbols accordingly.
            let class_cap = (cfg.max_streams_per_connection / channels.len()).max(1);
            let cap = override_cap.unwrap_or(class_cap).min(class_cap).max(1);
            let tier0_cap = (cap / 2).max(1);

            for (tier, symbols, cap) in [(0, tier0, tier0_cap), (1, rest, cap)] {
                for chunk in symbols.chunks(cap) {
                    let id = shards.len();
                    shards.push(ShardSpec {
                        id,
                        name: format!("{class}-t{tier}-{id}"),
                        channels: channels.clone(),
                        symbols: chunk.to_vec(),
                    });
                }
            }
        }
        Self { shards }
    }

    /// Minimal diff against another plan, matching shards by content.
    pub fn diff(&self, new: &ShardPlan) -> PlanDiff {
        let old_sigs: HashSet<_> = self.shards.iter().map(|s| s.signature()).collect();
        let new_sigs: HashSet<_> = new.shards.iter().map(|s| s.signature()).collect();

        PlanDiff {
            keep: self
                .shards
                .iter()
                .filter(|s| new_sigs.contains(&s.signature()))
                .cloned()
                .collect(),
            drop: self
                .shards
                .iter()
                .filter(|s| !new_sigs.contains(&s.signature()))
                .cloned()
                .collect(),
            create: new
                .shards
                .iter()
                .filter(|s| !old_sigs.contains(&s.signature()))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanDiff {
    pub keep: Vec<ShardSpec>,
    pub drop: Vec<ShardSpec>,
    pub create: Vec<ShardSpec>,
}

// =============================================================================
// SHARD STATE
// =============================================================================

/// Shared mutable state of one shard, written by its client, read by the
/// supervisor for status snapshots.
#[derive(Debug)]
pub struct ShardState {
    state: Mutex<ConnState>,
    pub reconnects: AtomicU64,
    pub parse_errors: AtomicU64,
    pub breaker_open: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl ShardState {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnState::Disconnected),
            reconnects: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            breaker_open: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Swap in a new state, returning the previous one.
    pub fn set_state(&self, to: ConnState) -> ConnState {
        std::mem::replace(&mut *self.state.lock(), to)
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn set_error(&self, err: String) {
        *self.last_error.lock() = Some(err);
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Default for ShardState {
    fn default() -> Self {
        Self::new()
    }
}

struct ShardRuntime {
    spec: ShardSpec,
    state: Arc<ShardState>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

// =============================================================================
// SUPERVISOR
// =============================================================================

/// Everything a client needs besides its shard spec.
#[derive(Clone)]
pub struct ClientDeps {
    pub session: SessionConfig,
    pub ws_base: String,
    pub normalizer: Arc<Normalizer>,
    pub writer: WriterHandles,
    pub telemetry: TelemetryBus,
    pub snapshots: Arc<dyn SnapshotFetcher>,
}

pub struct ShardSupervisor {
    deps: ClientDeps,
    shards: Mutex<Vec<ShardRuntime>>,
    stopping: AtomicBool,
}

impl ShardSupervisor {
    pub fn new(deps: ClientDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            shards: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        })
    }

    /// Spawn clients for every shard in the plan plus the liveness monitor.
    pub fn start(self: &Arc<Self>, plan: ShardPlan) -> JoinHandle<()> {
        {
            let mut shards = self.shards.lock();
            for spec in plan.shards {
                shards.push(self.spawn_shard(spec));
            }
            info!(shards = shards.len(), "supervisor_started");
        }
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.monitor_loop().await })
    }

    fn spawn_shard(&self, spec: ShardSpec) -> ShardRuntime {
        let state = Arc::new(ShardState::new());
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(
            &self.deps.session,
            spec.name.clone(),
        )));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = StreamClient::new(
            spec.clone(),
            self.deps.session.clone(),
            self.deps.ws_base.clone(),
            self.deps.normalizer.clone(),
            self.deps.writer.clone(),
            self.deps.telemetry.clone(),
            self.deps.snapshots.clone(),
            state.clone(),
            breaker.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(client.run());

        ShardRuntime {
            spec,
            state,
            breaker,
            shutdown_tx,
            handle,
        }
    }

    /// Liveness: a client task that ended while we are not stopping aborted
    /// on an internal error; restart it and let the breaker absorb repeats.
    async fn monitor_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let mut shards = self.shards.lock();
            for runtime in shards.iter_mut() {
                if !runtime.handle.is_finished() {
                    continue;
                }
                warn!(shard = %runtime.spec.name, "client_task_ended_unexpectedly");
                self.deps.telemetry.publish(TelemetryEvent::TaskAborted {
                    component: runtime.spec.name.clone(),
                    error: "stream client task ended".into(),
                });
                runtime.breaker.lock().record_failure();
                *runtime = self.spawn_shard_with(
                    runtime.spec.clone(),
                    runtime.state.clone(),
                    runtime.breaker.clone(),
                );
            }
        }
    }

    fn spawn_shard_with(
        &self,
        spec: ShardSpec,
        state: Arc<ShardState>,
        breaker: Arc<Mutex<CircuitBreaker>>,
    ) -> ShardRuntime {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = StreamClient::new(
            spec.clone(),
            self.deps.session.clone(),
            self.deps.ws_base.clone(),
            self.deps.normalizer.clone(),
            self.deps.writer.clone(),
            self.deps.telemetry.clone(),
            self.deps.snapshots.clone(),
            state.clone(),
            breaker.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(client.run());
        ShardRuntime {
            spec,
            state,
            breaker,
            shutdown_tx,
            handle,
        }
    }

    /// Apply a new plan as a minimal diff. Returns (dropped, created).
    pub fn rebalance(&self, new_plan: ShardPlan) -> (usize, usize) {
        let current = ShardPlan {
            shards: self.shards.lock().iter().map(|r| r.spec.clone()).collect(),
        };
        let diff = current.diff(&new_plan);

        let mut shards = self.shards.lock();
        shards.retain(|runtime| {
            let keep = diff.keep.iter().any(|s| s == &runtime.spec);
            if !keep {
                info!(shard = %runtime.spec.name, "shard_drained");
                let _ = runtime.shutdown_tx.send(true);
            }
            keep
        });
        let created = diff.create.len();
        for spec in diff.create {
            shards.push(self.spawn_shard(spec));
        }
        info!(dropped = diff.drop.len(), created, "plan_rebalanced");
        (diff.drop.len(), created)
    }

    /// Signal every client to drain and wait for their tasks to finish.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let drained: Vec<ShardRuntime> = {
            let mut shards = self.shards.lock();
            for runtime in shards.iter() {
                let _ = runtime.shutdown_tx.send(true);
            }
            shards.drain(..).collect()
        };
        for runtime in drained {
            let _ = runtime.handle.await;
        }
        info!("supervisor_stopped");
    }

    pub fn status(&self) -> Vec<ShardStatus> {
        self.shards
            .lock()
            .iter()
            .map(|runtime| ShardStatus {
                shard_id: runtime.spec.id,
                name: runtime.spec.name.clone(),
                channels: runtime.spec.channels.clone(),
                symbol_count: runtime.spec.symbols.len(),
                state: runtime.state.state().to_string(),
                reconnects: runtime.state.reconnects.load(Ordering::Relaxed),
                breaker_open: runtime.state.breaker_open.load(Ordering::Relaxed),
                last_error: runtime.state.last_error(),
            })
            .collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelSet;

    fn cfg(symbols: usize, max_streams: usize, tier0: usize) -> IngestConfig {
        IngestConfig {
            symbols: (0..symbols).map(|i| format!("SYM{i}USDT")).collect(),
            channels: ChannelSet::default(),
            max_streams_per_connection: max_streams,
            tier0_size: tier0,
            shard_count: None,
        }
    }

    #[test]
    fn test_plan_covers_universe_per_class() {
        let plan = ShardPlan::build(&cfg(100, 50, 20));

        // Depth class: every symbol exactly once.
        let depth_symbols: Vec<&String> = plan
            .shards
            .iter()
            .filter(|s| s.channels == vec![Channel::Depth])
            .flat_map(|s| s.symbols.iter())
            .collect();
        assert_eq!(depth_symbols.len(), 100);

        // Ticker class carries both channels.
        let ticker_shards: Vec<&ShardSpec> = plan
            .shards
            .iter()
            .filter(|s| s.channels == vec![Channel::BookTicker, Channel::AggTrade])
            .collect();
        assert!(!ticker_shards.is_empty());
        let ticker_symbols: usize = ticker_shards.iter().map(|s| s.symbols.len()).sum();
        assert_eq!(ticker_symbols, 100);

        // No optional channels enabled, so no aux shards.
        assert!(plan
            .shards
            .iter()
            .all(|s| !s.channels.contains(&Channel::MarkPrice)));
    }

    #[test]
    fn test_plan_respects_stream_cap() {
        let plan = ShardPlan::build(&cfg(200, 40, 20));
        for shard in &plan.shards {
            assert!(
                shard.stream_names().len() <= 40,
                "shard {} exceeds cap with {} streams",
                shard.name,
                shard.stream_names().len()
            );
        }
    }

    #[test]
    fn test_tier0_shards_are_smaller() {
        let plan = ShardPlan::build(&cfg(100, 40, 20));
        let t0_max = plan
            .shards
            .iter()
            .filter(|s| s.name.contains("-t0-"))
            .map(|s| s.symbols.len())
            .max()
            .unwrap();
        let t1_max = plan
            .shards
            .iter()
            .filter(|s| s.name.contains("-t1-"))
            .map(|s| s.symbols.len())
            .max()
            .unwrap();
        assert!(t0_max < t1_max);
    }

    #[test]
    fn test_shard_count_override_partitions_uniformly() {
        let mut config = cfg(100, 50, 20);
        config.shard_count = Some(4);
        let plan = ShardPlan::build(&config);

        // Four depth shards of 25 symbols each, no tier split.
        let depth: Vec<&ShardSpec> = plan
            .shards
            .iter()
            .filter(|s| s.channels == vec![Channel::Depth])
            .collect();
        assert_eq!(depth.len(), 4);
        assert!(depth.iter().all(|s| s.symbols.len() == 25));
        assert!(plan.shards.iter().all(|s| !s.name.contains("-t0-")));

        // The per-connection stream cap still binds.
        for shard in &plan.shards {
            assert!(shard.stream_names().len() <= 50);
        }
    }

    #[test]
    fn test_optional_channels_build_aux_shards() {
        let mut config = cfg(10, 50, 5);
        config.channels.mark_price = true;
        config.channels.force_order = true;
        let plan = ShardPlan::build(&config);
        let aux: Vec<&ShardSpec> = plan
            .shards
            .iter()
            .filter(|s| s.channels.contains(&Channel::MarkPrice))
            .collect();
        assert!(!aux.is_empty());
        assert!(aux.iter().all(|s| s.channels.contains(&Channel::ForceOrder)));
    }

    #[test]
    fn test_diff_is_minimal() {
        let old = ShardPlan::build(&cfg(100, 50, 20));
        // Same universe: nothing changes.
        let same = ShardPlan::build(&cfg(100, 50, 20));
        let diff = old.diff(&same);
        assert!(diff.drop.is_empty());
        assert!(diff.create.is_empty());
        assert_eq!(diff.keep.len(), old.shards.len());

        // Growing the universe only creates/extends tail shards.
        let grown = ShardPlan::build(&cfg(110, 50, 20));
        let diff = old.diff(&grown);
        assert!(diff.create.len() < grown.shards.len());
        assert!(!diff.keep.is_empty());
    }

    #[tokio::test]
    async fn test_rebalance_applies_minimal_diff() {
        use crate::error::IngestError;
        use crate::ingest::wire::DepthSnapshot;
        use crate::registry::SymbolRegistry;
        use crate::store::writer::{BatchWriter, WriterConfig};
        use crate::store::MarketStore;
        use crate::telemetry::IngestCounters;

        struct StubSnapshots;

        #[async_trait::async_trait]
        impl crate::ingest::client::SnapshotFetcher for StubSnapshots {
            async fn fetch(&self, _symbol: &str) -> Result<DepthSnapshot, IngestError> {
                Err(IngestError::transport("unused"))
            }
        }

        let store = MarketStore::open_memory().unwrap();
        let registry = SymbolRegistry::new(store.clone()).unwrap();
        let telemetry = TelemetryBus::new();
        let (_writer_shutdown_tx, writer_shutdown_rx) = watch::channel(false);
        let writer = BatchWriter::spawn(
            store,
            WriterConfig::default(),
            telemetry.clone(),
            None,
            writer_shutdown_rx,
        );

        let supervisor = ShardSupervisor::new(ClientDeps {
            session: SessionConfig::default(),
            // Unroutable endpoint: clients cycle in reconnect backoff.
            ws_base: "wss://127.0.0.1:1".into(),
            normalizer: std::sync::Arc::new(Normalizer::new(
                registry,
                std::sync::Arc::new(IngestCounters::default()),
            )),
            writer: writer.handles.clone(),
            telemetry,
            snapshots: std::sync::Arc::new(StubSnapshots),
        });

        let old_plan = ShardPlan::build(&cfg(10, 50, 5));
        let expected_old = old_plan.shards.len();
        let monitor = supervisor.start(old_plan);
        assert_eq!(supervisor.shard_count(), expected_old);

        let new_plan = ShardPlan::build(&cfg(12, 50, 5));
        let expected_new = new_plan.shards.len();
        let (dropped, created) = supervisor.rebalance(new_plan);
        assert!(created >= 1);
        assert!(dropped >= 1);
        assert_eq!(supervisor.shard_count(), expected_new);

        supervisor.stop().await;
        monitor.abort();
        assert_eq!(supervisor.shard_count(), 0);
    }

    #[test]
    fn test_stream_names_shape() {
        let spec = ShardSpec {
            id: 0,
            name: "ticker-t0-0".into(),
            channels: vec![Channel::BookTicker, Channel::AggTrade],
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
        };
        let names = spec.stream_names();
        assert_eq!(names.len(), 4);
        assert!(names.contains(&"btcusdt@bookTicker".to_string()));
        assert!(names.contains(&"ethusdt@aggTrade".to_string()));
    }
}
