//! Stream client: one persistent duplex connection to the venue.
//!
//! Each client owns exactly one combined-stream connection subscribed to its
//! shard's channel+symbol pairs and drives the per-connection state machine:
//! Disconnected → Connecting → Connected → (Draining | Reconnecting |
//! Failed). The combined-stream URL subscribes implicitly; the first inbound
//! frame is the subscription acknowledgment, bounded by a timeout.
//!
//! Inbound frames are normalized inline and handed to the batch writer over
//! bounded channels; a full channel blocks this task (never drop-newest),
//! which is how backpressure reaches the venue connection.
//!
//! Depth resync: when the update-id chain breaks for a symbol, a REST
//! snapshot is fetched with a deadline, deltas at or below the snapshot id
//! are discarded, and the chain re-bases on top.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::ingest::normalize::Normalizer;
use crate::ingest::session::{
    BackoffCalculator, CircuitBreaker, ConnState, HeartbeatAction, HeartbeatMonitor,
    SessionConfig, TransitionReason,
};
use crate::ingest::supervisor::{ShardSpec, ShardState};
use crate::ingest::wire::{
    combined_stream_url, depth_snapshot_url, parse_frame, DepthSnapshot, WireDepthUpdate,
    WireEvent, WireFrame,
};
use crate::store::writer::WriterHandles;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

// =============================================================================
// SNAPSHOT FETCHER
// =============================================================================

/// Source of depth snapshots for the resync flow. Abstracted so tests can
/// inject a scripted snapshot.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, symbol: &str) -> Result<DepthSnapshot, IngestError>;
}

/// REST snapshot endpoint client.
pub struct RestSnapshotFetcher {
    client: reqwest::Client,
    rest_base: String,
    limit: usize,
}

impl RestSnapshotFetcher {
    pub fn new(rest_base: String, cfg: &SessionConfig) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.snapshot_timeout_ms))
            .build()
            .map_err(|e| IngestError::internal(format!("building snapshot client: {e}")))?;
        Ok(Self {
            client,
            rest_base,
            limit: cfg.depth_snapshot_limit,
        })
    }
}

#[async_trait]
impl SnapshotFetcher for RestSnapshotFetcher {
    async fn fetch(&self, symbol: &str) -> Result<DepthSnapshot, IngestError> {
        let url = depth_snapshot_url(&self.rest_base, symbol, self.limit);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| IngestError::transport(format!("snapshot request: {e}")))?;
        if !resp.status().is_success() {
            return Err(IngestError::transport(format!(
                "snapshot status {} for {symbol}",
                resp.status()
            )));
        }
        resp.json::<DepthSnapshot>()
            .await
            .map_err(|e| IngestError::protocol(format!("snapshot decode: {e}")))
    }
}

// =============================================================================
// DEPTH CHAIN
// =============================================================================

#[derive(Debug, Default)]
struct DepthChain {
    /// Final update id of the last accepted delta.
    last_final: Option<i64>,
    /// Resync in progress: discard deltas at or below the snapshot id.
    resync: Option<ResyncState>,
}

#[derive(Debug)]
struct ResyncState {
    snapshot_update_id: i64,
    discarded: u64,
}

// =============================================================================
// STREAM CLIENT
// =============================================================================

/// Why a connection attempt or session ended.
enum SessionEnd {
    Shutdown,
    ProactiveRefresh,
}

pub struct StreamClient {
    shard: ShardSpec,
    cfg: SessionConfig,
    ws_base: String,
    normalizer: Arc<Normalizer>,
    writer: WriterHandles,
    telemetry: TelemetryBus,
    snapshots: Arc<dyn SnapshotFetcher>,
    state: Arc<ShardState>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    shutdown: watch::Receiver<bool>,
    chains: HashMap<String, DepthChain>,
    /// Monotone per-connection frame sequence.
    frame_seq: u64,
}

impl StreamClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: ShardSpec,
        cfg: SessionConfig,
        ws_base: String,
        normalizer: Arc<Normalizer>,
        writer: WriterHandles,
        telemetry: TelemetryBus,
        snapshots: Arc<dyn SnapshotFetcher>,
        state: Arc<ShardState>,
        breaker: Arc<Mutex<CircuitBreaker>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shard,
            cfg,
            ws_base,
            normalizer,
            writer,
            telemetry,
            snapshots,
            state,
            breaker,
            shutdown,
            chains: HashMap::new(),
            frame_seq: 0,
        }
    }

    fn transition(&self, to: ConnState, reason: TransitionReason) {
        let from = self.state.set_state(to);
        if from == to {
            return;
        }
        info!(
            shard = %self.shard.name,
            from = %from,
            to = %to,
            reason = %reason,
            "session_transition"
        );
        self.telemetry.publish(TelemetryEvent::ConnectionTransition {
            shard: self.shard.name.clone(),
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        });
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Connection lifecycle loop. Returns when shutdown is signalled.
    pub async fn run(mut self) {
        let mut backoff =
            BackoffCalculator::new(self.cfg.backoff_base_ms, self.cfg.backoff_max_ms);

        while !self.shutting_down() {
            // Circuit breaker gate: while open, connecting is suppressed.
            let wait = {
                let mut breaker = self.breaker.lock();
                if breaker.allow_attempt() {
                    self.state.breaker_open.store(false, Ordering::Relaxed);
                    None
                } else {
                    self.state.breaker_open.store(true, Ordering::Relaxed);
                    Some(
                        breaker
                            .remaining_cooldown()
                            .unwrap_or(Duration::from_secs(1)),
                    )
                }
            };
            if let Some(cooldown) = wait {
                self.transition(ConnState::Failed, TransitionReason::BreakerOpen);
                self.sleep_or_shutdown(cooldown.min(Duration::from_secs(1))).await;
                continue;
            }

            self.transition(ConnState::Connecting, TransitionReason::Started);
            match self.run_connection(&mut backoff).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ProactiveRefresh) => {
                    self.transition(ConnState::Reconnecting, TransitionReason::ProactiveRefresh);
                }
                Err(reason) => {
                    self.breaker.lock().record_failure();
                    self.state.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.state.set_error(reason.to_string());
                    self.transition(ConnState::Reconnecting, reason);
                    let delay = backoff.next_backoff();
                    debug!(
                        shard = %self.shard.name,
                        backoff_ms = delay.as_millis() as u64,
                        attempt = backoff.attempt(),
                        "reconnect_backoff"
                    );
                    self.sleep_or_shutdown(delay).await;
                }
            }
        }

        self.transition(ConnState::Disconnected, TransitionReason::ShutdownRequested);
    }

    async fn sleep_or_shutdown(&mut self, d: Duration) {
        let sleep = tokio::time::sleep(d);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                _ = self.shutdown.changed() => {
                    if self.shutting_down() {
                        return;
                    }
                }
            }
        }
    }

    /// One connection: connect, ack, stream until an error, a refresh, or
    /// shutdown.
    async fn run_connection(
        &mut self,
        backoff: &mut BackoffCalculator,
    ) -> Result<SessionEnd, TransitionReason> {
        let streams = self.shard.stream_names();
        let url = combined_stream_url(&self.ws_base, &streams);

        let connect = tokio::time::timeout(
            Duration::from_millis(self.cfg.connect_timeout_ms),
            connect_async(&url),
        )
        .await;
        let ws = match connect {
            Ok(Ok((ws, _resp))) => ws,
            Ok(Err(e)) => {
                debug!(shard = %self.shard.name, error = %e, "connect_failed");
                return Err(TransitionReason::TransportError);
            }
            Err(_) => return Err(TransitionReason::ConnectTimeout),
        };

        let (mut write, mut read) = ws.split();

        // Implicit subscription: the first data frame is the ack.
        let first = tokio::time::timeout(
            Duration::from_millis(self.cfg.subscribe_timeout_ms),
            read.next(),
        )
        .await;
        let first_msg = match first {
            Ok(Some(Ok(msg))) => msg,
            Ok(_) => return Err(TransitionReason::TransportError),
            Err(_) => return Err(TransitionReason::SubscribeTimeout),
        };

        self.transition(ConnState::Connected, TransitionReason::SubscribeOk);
        backoff.reset();
        self.breaker.lock().record_success();
        self.state.clear_error();

        let mut heartbeat = HeartbeatMonitor::new(&self.cfg);
        let connected_at = Instant::now();
        let proactive_refresh = Duration::from_secs(self.cfg.proactive_refresh_secs);

        if let Err(reason) = self.handle_message(first_msg, &mut write, &mut heartbeat).await {
            return Err(reason);
        }

        let mut heartbeat_tick = tokio::time::interval(Duration::from_millis(500));
        heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if connected_at.elapsed() >= proactive_refresh {
                info!(shard = %self.shard.name, "proactive_refresh");
                return Ok(SessionEnd::ProactiveRefresh);
            }

            tokio::select! {
                maybe = read.next() => match maybe {
                    Some(Ok(msg)) => {
                        self.handle_message(msg, &mut write, &mut heartbeat).await?;
                    }
                    Some(Err(e)) => {
                        debug!(shard = %self.shard.name, error = %e, "ws_error");
                        return Err(TransitionReason::TransportError);
                    }
                    None => return Err(TransitionReason::ServerClose),
                },
                _ = heartbeat_tick.tick() => {
                    match heartbeat.check() {
                        HeartbeatAction::Ok => {}
                        HeartbeatAction::SendPing => {
                            if write.send(Message::Ping(Vec::new())).await.is_ok() {
                                heartbeat.record_ping_sent();
                            }
                        }
                        HeartbeatAction::PongTimeout => return Err(TransitionReason::PongTimeout),
                        HeartbeatAction::Stall => return Err(TransitionReason::Stall),
                    }
                }
                _ = self.shutdown.changed() => {
                    if self.shutting_down() {
                        // Draining: in-flight events were already submitted
                        // downstream; stop reading and close.
                        self.transition(ConnState::Draining, TransitionReason::ShutdownRequested);
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }
        }
    }

    async fn handle_message<W>(
        &mut self,
        msg: Message,
        write: &mut W,
        heartbeat: &mut HeartbeatMonitor,
    ) -> Result<(), TransitionReason>
    where
        W: futures_util::Sink<Message> + Unpin,
    {
        match msg {
            Message::Text(text) => {
                heartbeat.record_data();
                self.frame_seq += 1;
                match parse_frame(&text) {
                    Ok(WireFrame::Event(event)) => self.handle_event(event).await?,
                    Ok(WireFrame::Control) => {}
                    Err(e) => {
                        debug!(shard = %self.shard.name, error = %e, "frame_decode_failed");
                        self.state.parse_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Message::Ping(payload) => {
                let _ = write.send(Message::Pong(payload)).await;
            }
            Message::Pong(_) => heartbeat.record_pong(),
            Message::Close(frame) => {
                debug!(shard = %self.shard.name, ?frame, "server_close");
                return Err(TransitionReason::ServerClose);
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: WireEvent) -> Result<(), TransitionReason> {
        match event {
            WireEvent::DepthUpdate(d) => self.handle_depth(d).await,
            other => {
                if let Some(rec) = self.normalizer.normalize(&other) {
                    self.writer
                        .submit(rec)
                        .await
                        .map_err(|_| TransitionReason::ShutdownRequested)?;
                }
                Ok(())
            }
        }
    }

    /// Depth deltas carry an update-id chain: each event's previous-final id
    /// must equal the last accepted final id, otherwise we resync from a
    /// snapshot and re-base.
    async fn handle_depth(&mut self, d: WireDepthUpdate) -> Result<(), TransitionReason> {
        let symbol = d.symbol.clone();
        let chain = self.chains.entry(symbol.clone()).or_default();

        // During resync, discard deltas the snapshot already covers.
        if let Some(resync) = chain.resync.as_mut() {
            if d.final_update_id <= resync.snapshot_update_id {
                resync.discarded += 1;
                return Ok(());
            }
            let state = chain.resync.take();
            if let Some(state) = state {
                self.telemetry.publish(TelemetryEvent::ResyncCompleted {
                    symbol: symbol.clone(),
                    snapshot_update_id: state.snapshot_update_id,
                    discarded: state.discarded,
                });
            }
        } else {
            let broken = match chain.last_final {
                Some(last) => match d.prev_final_update_id {
                    Some(pu) => pu != last,
                    None => d.first_update_id != last + 1,
                },
                None => false,
            };
            if broken {
                warn!(
                    shard = %self.shard.name,
                    symbol = %symbol,
                    expected = chain.last_final.unwrap_or_default(),
                    got = d.prev_final_update_id.unwrap_or(d.first_update_id - 1),
                    "depth_chain_broken"
                );
                self.telemetry.publish(TelemetryEvent::ResyncStarted {
                    symbol: symbol.clone(),
                });
                let snapshot = self
                    .snapshots
                    .fetch(&symbol)
                    .await
                    .map_err(|_| TransitionReason::ProtocolError)?;

                let chain = self.chains.entry(symbol.clone()).or_default();
                chain.last_final = None;
                if d.final_update_id <= snapshot.last_update_id {
                    chain.resync = Some(ResyncState {
                        snapshot_update_id: snapshot.last_update_id,
                        discarded: 1,
                    });
                    return Ok(());
                }
                // The triggering delta already extends past the snapshot.
                self.telemetry.publish(TelemetryEvent::ResyncCompleted {
                    symbol: symbol.clone(),
                    snapshot_update_id: snapshot.last_update_id,
                    discarded: 0,
                });
            }
        }

        let chain = self.chains.entry(symbol).or_default();
        chain.last_final = Some(d.final_update_id);

        if let Some(rec) = self.normalizer.normalize(&WireEvent::DepthUpdate(d)) {
            self.writer
                .submit(rec)
                .await
                .map_err(|_| TransitionReason::ShutdownRequested)?;
        }
        Ok(())
    }
}
