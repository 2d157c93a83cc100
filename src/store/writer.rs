//! Batch writer: per-table bounded buffers flushed on size or age.
//!
//! One task per table. Records arrive over a bounded channel; a full channel
//! blocks the producing stream client (drop-newest is forbidden), which is
//! the backpressure edge of the pipeline. Flushes are single bulk upserts
//! with on-conflict-do-nothing, so at-least-once delivery upstream yields
//! exactly-once rows.
//!
//! Store failures are retried with exponential backoff; while retrying the
//! task stops draining its channel, so total buffering is bounded by
//! buffer + queue depth (the hard cap) and a degraded flag is published.
//! Persistent constraint violations are bisected down to the smallest
//! failing unit, which is quarantined with a telemetry event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{is_constraint_violation, IngestError};
use crate::models::{
    now_us, BookTickerRecord, DepthDeltaRecord, ForceOrderRecord, MarkPriceRecord,
    NormalizedEvent, TradeRecord,
};
use crate::store::aggregate::{AggSource, FlushNotice};
use crate::store::MarketStore;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush when a buffer reaches this many rows.
    pub batch_size: usize,
    /// Flush a non-empty buffer at least this often.
    pub max_age: Duration,
    /// Bounded channel depth per table; the backpressure high-water mark.
    pub queue_depth: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Consecutive failed flushes before the degraded flag is raised.
    pub degraded_after: u32,
    /// Budget for flushing remaining rows on Stop.
    pub drain_deadline: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_age: Duration::from_millis(250),
            queue_depth: 8192,
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(10),
            degraded_after: 3,
            drain_deadline: Duration::from_secs(5),
        }
    }
}

impl WriterConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("BATCH_MAX_AGE_MS") {
            if let Ok(ms) = v.parse() {
                cfg.max_age = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("WRITER_QUEUE_DEPTH") {
            if let Ok(n) = v.parse() {
                cfg.queue_depth = n;
            }
        }
        cfg
    }
}

// =============================================================================
// TABLE SINKS
// =============================================================================

/// How one table's records are committed and reported.
trait TableSink: Send + 'static {
    type Rec: Send + serde::Serialize + 'static;
    const TABLE: &'static str;

    fn commit(store: &MarketStore, rows: &[Self::Rec]) -> rusqlite::Result<usize>;

    /// Aggregation notice for the flushed rows, if this table feeds rollups.
    fn notice(_rows: &[Self::Rec]) -> Option<FlushNotice> {
        None
    }
}

struct BookTickerSink;
impl TableSink for BookTickerSink {
    type Rec = BookTickerRecord;
    const TABLE: &'static str = "book_ticker";

    fn commit(store: &MarketStore, rows: &[Self::Rec]) -> rusqlite::Result<usize> {
        store.insert_book_tickers(rows)
    }

    fn notice(rows: &[Self::Rec]) -> Option<FlushNotice> {
        Some(FlushNotice::new(
            AggSource::Book,
            rows.iter().map(|r| (r.symbol_id, r.ts_exchange_us)),
        ))
    }
}

struct TradeSink;
impl TableSink for TradeSink {
    type Rec = TradeRecord;
    const TABLE: &'static str = "trades";

    fn commit(store: &MarketStore, rows: &[Self::Rec]) -> rusqlite::Result<usize> {
        store.insert_trades(rows)
    }

    fn notice(rows: &[Self::Rec]) -> Option<FlushNotice> {
        Some(FlushNotice::new(
            AggSource::Trade,
            rows.iter().map(|r| (r.symbol_id, r.ts_exchange_us)),
        ))
    }
}

struct DepthSink;
impl TableSink for DepthSink {
    type Rec = DepthDeltaRecord;
    const TABLE: &'static str = "depth_deltas";

    fn commit(store: &MarketStore, rows: &[Self::Rec]) -> rusqlite::Result<usize> {
        store.insert_depth_deltas(rows)
    }
}

struct MarkPriceSink;
impl TableSink for MarkPriceSink {
    type Rec = MarkPriceRecord;
    const TABLE: &'static str = "mark_price";

    fn commit(store: &MarketStore, rows: &[Self::Rec]) -> rusqlite::Result<usize> {
        store.insert_mark_prices(rows)
    }
}

struct ForceOrderSink;
impl TableSink for ForceOrderSink {
    type Rec = ForceOrderRecord;
    const TABLE: &'static str = "force_orders";

    fn commit(store: &MarketStore, rows: &[Self::Rec]) -> rusqlite::Result<usize> {
        store.insert_force_orders(rows)
    }
}

// =============================================================================
// HANDLES
// =============================================================================

struct TableTx<R> {
    tx: mpsc::Sender<R>,
    table: &'static str,
    blocked: Arc<AtomicBool>,
}

impl<R: Send> TableTx<R> {
    fn new(tx: mpsc::Sender<R>, table: &'static str) -> Self {
        Self {
            tx,
            table,
            blocked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send with backpressure accounting: a full queue blocks the caller and
    /// flips the backpressure flag exactly once per episode.
    async fn send(&self, rec: R, telemetry: &TelemetryBus) -> Result<(), IngestError> {
        match self.tx.try_send(rec) {
            Ok(()) => {
                if self.blocked.swap(false, Ordering::Relaxed) {
                    telemetry.publish(TelemetryEvent::Backpressure {
                        table: self.table,
                        engaged: false,
                    });
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(rec)) => {
                if !self.blocked.swap(true, Ordering::Relaxed) {
                    telemetry.publish(TelemetryEvent::Backpressure {
                        table: self.table,
                        engaged: true,
                    });
                }
                self.tx
                    .send(rec)
                    .await
                    .map_err(|_| IngestError::internal(format!("{} writer gone", self.table)))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(IngestError::internal(format!("{} writer gone", self.table)))
            }
        }
    }
}

/// Producer-side handle to all table writers.
#[derive(Clone)]
pub struct WriterHandles {
    inner: Arc<WriterHandlesInner>,
    telemetry: TelemetryBus,
}

struct WriterHandlesInner {
    book_ticker: TableTx<BookTickerRecord>,
    trades: TableTx<TradeRecord>,
    depth: TableTx<DepthDeltaRecord>,
    mark_price: TableTx<MarkPriceRecord>,
    force_orders: TableTx<ForceOrderRecord>,
}

impl WriterHandles {
    /// Route one normalized event to its table. Blocks when the table queue
    /// is at its high-water mark.
    pub async fn submit(&self, event: NormalizedEvent) -> Result<(), IngestError> {
        let t = &self.telemetry;
        match event {
            NormalizedEvent::BookTicker(r) => self.inner.book_ticker.send(r, t).await,
            NormalizedEvent::Trade(r) => self.inner.trades.send(r, t).await,
            NormalizedEvent::DepthDelta(r) => self.inner.depth.send(r, t).await,
            NormalizedEvent::MarkPrice(r) => self.inner.mark_price.send(r, t).await,
            NormalizedEvent::ForceOrder(r) => self.inner.force_orders.send(r, t).await,
        }
    }
}

// =============================================================================
// WRITER
// =============================================================================

pub struct BatchWriter {
    pub handles: WriterHandles,
    pub tasks: Vec<JoinHandle<()>>,
    pub degraded: Arc<AtomicBool>,
}

impl BatchWriter {
    /// Spawn one writer task per table.
    pub fn spawn(
        store: MarketStore,
        cfg: WriterConfig,
        telemetry: TelemetryBus,
        agg_tx: Option<mpsc::UnboundedSender<FlushNotice>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let degraded = Arc::new(AtomicBool::new(false));

        let (bt_tx, bt_rx) = mpsc::channel(cfg.queue_depth);
        let (tr_tx, tr_rx) = mpsc::channel(cfg.queue_depth);
        let (dp_tx, dp_rx) = mpsc::channel(cfg.queue_depth);
        let (mp_tx, mp_rx) = mpsc::channel(cfg.queue_depth);
        let (fo_tx, fo_rx) = mpsc::channel(cfg.queue_depth);

        let mut tasks = Vec::with_capacity(5);
        tasks.push(spawn_table::<BookTickerSink>(
            store.clone(), cfg.clone(), telemetry.clone(), agg_tx.clone(),
            shutdown.clone(), degraded.clone(), bt_rx,
        ));
        tasks.push(spawn_table::<TradeSink>(
            store.clone(), cfg.clone(), telemetry.clone(), agg_tx.clone(),
            shutdown.clone(), degraded.clone(), tr_rx,
        ));
        tasks.push(spawn_table::<DepthSink>(
            store.clone(), cfg.clone(), telemetry.clone(), None,
            shutdown.clone(), degraded.clone(), dp_rx,
        ));
        tasks.push(spawn_table::<MarkPriceSink>(
            store.clone(), cfg.clone(), telemetry.clone(), None,
            shutdown.clone(), degraded.clone(), mp_rx,
        ));
        tasks.push(spawn_table::<ForceOrderSink>(
            store, cfg, telemetry.clone(), None, shutdown, degraded.clone(), fo_rx,
        ));

        let handles = WriterHandles {
            inner: Arc::new(WriterHandlesInner {
                book_ticker: TableTx::new(bt_tx, BookTickerSink::TABLE),
                trades: TableTx::new(tr_tx, TradeSink::TABLE),
                depth: TableTx::new(dp_tx, DepthSink::TABLE),
                mark_price: TableTx::new(mp_tx, MarkPriceSink::TABLE),
                force_orders: TableTx::new(fo_tx, ForceOrderSink::TABLE),
            }),
            telemetry,
        };

        Self {
            handles,
            tasks,
            degraded,
        }
    }
}

fn spawn_table<S: TableSink>(
    store: MarketStore,
    cfg: WriterConfig,
    telemetry: TelemetryBus,
    agg_tx: Option<mpsc::UnboundedSender<FlushNotice>>,
    mut shutdown: watch::Receiver<bool>,
    degraded: Arc<AtomicBool>,
    mut rx: mpsc::Receiver<S::Rec>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<S::Rec> = Vec::with_capacity(cfg.batch_size);
        let mut flush_tick = tokio::time::interval(cfg.max_age);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(rec) => {
                        buffer.push(rec);
                        if buffer.len() >= cfg.batch_size {
                            flush_with_retry::<S>(&store, &cfg, &telemetry, &agg_tx, &degraded, &mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = flush_tick.tick() => {
                    if !buffer.is_empty() {
                        flush_with_retry::<S>(&store, &cfg, &telemetry, &agg_tx, &degraded, &mut buffer).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain: accept what is already queued, then flush under a deadline.
        rx.close();
        while let Ok(Some(rec)) =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            buffer.push(rec);
        }
        if !buffer.is_empty() {
            let deadline = Instant::now() + cfg.drain_deadline;
            while !buffer.is_empty() && Instant::now() < deadline {
                if flush_once::<S>(&store, &telemetry, &agg_tx, &mut buffer).await {
                    break;
                }
                tokio::time::sleep(cfg.retry_base).await;
            }
            if !buffer.is_empty() {
                telemetry.publish(TelemetryEvent::DrainTimeout {
                    pending: buffer.len(),
                });
                error!(table = S::TABLE, pending = buffer.len(), "drain_dropped_rows");
            }
        }
        debug!(table = S::TABLE, "writer_stopped");
    })
}

/// One flush attempt; returns true when the buffer was committed (or
/// quarantined) and cleared.
async fn flush_once<S: TableSink>(
    store: &MarketStore,
    telemetry: &TelemetryBus,
    agg_tx: &Option<mpsc::UnboundedSender<FlushNotice>>,
    buffer: &mut Vec<S::Rec>,
) -> bool {
    let started = Instant::now();
    match S::commit(store, buffer) {
        Ok(inserted) => {
            telemetry.publish(TelemetryEvent::BatchFlush {
                table: S::TABLE,
                rows: inserted,
                duration_ms: started.elapsed().as_millis() as u64,
                retried: false,
            });
            if let (Some(tx), Some(notice)) = (agg_tx, S::notice(buffer)) {
                let _ = tx.send(notice);
            }
            buffer.clear();
            true
        }
        Err(e) if is_constraint_violation(&e) => {
            bisect_commit::<S>(store, telemetry, agg_tx, buffer);
            buffer.clear();
            true
        }
        Err(e) => {
            warn!(table = S::TABLE, error = %e, "flush_failed");
            false
        }
    }
}

/// Flush with unbounded backoff retry. While this loops, the channel fills
/// and producers block; that is the designed degraded mode.
async fn flush_with_retry<S: TableSink>(
    store: &MarketStore,
    cfg: &WriterConfig,
    telemetry: &TelemetryBus,
    agg_tx: &Option<mpsc::UnboundedSender<FlushNotice>>,
    degraded: &Arc<AtomicBool>,
    buffer: &mut Vec<S::Rec>,
) {
    let mut backoff = cfg.retry_base;
    let mut attempts: u32 = 0;

    loop {
        if flush_once::<S>(store, telemetry, agg_tx, buffer).await {
            if attempts > 0 && degraded.swap(false, Ordering::Relaxed) {
                info!(table = S::TABLE, "store_recovered");
                telemetry.publish(TelemetryEvent::Degraded {
                    engaged: false,
                    reason: "store recovered".into(),
                });
            }
            return;
        }

        attempts += 1;
        if attempts == cfg.degraded_after && !degraded.swap(true, Ordering::Relaxed) {
            telemetry.publish(TelemetryEvent::Degraded {
                engaged: true,
                reason: format!("{} flush retries exhausted budget", S::TABLE),
            });
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(cfg.retry_max);
    }
}

/// Split a constraint-violating batch down to the smallest failing unit and
/// quarantine it. Committed halves are safe to re-commit (idempotent keys).
fn bisect_commit<S: TableSink>(
    store: &MarketStore,
    telemetry: &TelemetryBus,
    agg_tx: &Option<mpsc::UnboundedSender<FlushNotice>>,
    rows: &[S::Rec],
) {
    let mut stack: Vec<&[S::Rec]> = vec![rows];
    let mut quarantined = 0usize;

    while let Some(chunk) = stack.pop() {
        if chunk.is_empty() {
            continue;
        }
        match S::commit(store, chunk) {
            Ok(_) => {
                if let (Some(tx), Some(notice)) = (agg_tx, S::notice(chunk)) {
                    let _ = tx.send(notice);
                }
            }
            Err(e) if is_constraint_violation(&e) && chunk.len() == 1 => {
                let payload = serde_json::to_string(&chunk[0]).unwrap_or_default();
                let reason = e.to_string();
                if let Err(qe) = store.quarantine_row(S::TABLE, &payload, &reason, now_us()) {
                    error!(table = S::TABLE, error = %qe, "quarantine_failed");
                }
                quarantined += 1;
                telemetry.publish(TelemetryEvent::Quarantine {
                    table: S::TABLE,
                    rows: 1,
                    reason,
                });
            }
            Err(e) if is_constraint_violation(&e) => {
                let mid = chunk.len() / 2;
                stack.push(&chunk[..mid]);
                stack.push(&chunk[mid..]);
            }
            Err(e) => {
                // Transient mid-bisect; everything left is re-committed by
                // the caller's retry, which is idempotent.
                warn!(table = S::TABLE, error = %e, "bisect_interrupted");
                return;
            }
        }
    }

    if quarantined > 0 {
        warn!(table = S::TABLE, quarantined, "poison_rows_quarantined");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ts_second as sec_of;
    use crate::registry::{SymbolRegistry, VENUE};

    fn bt(symbol_id: i64, ts_us: i64, update_id: i64, bid: f64, ask: f64) -> BookTickerRecord {
        BookTickerRecord {
            symbol_id,
            ts_exchange_us: ts_us,
            ts_ingest_us: ts_us,
            update_id,
            best_bid: bid,
            best_ask: ask,
            bid_qty: 1.0,
            ask_qty: 1.0,
            spread: ask - bid,
            mid: (ask + bid) / 2.0,
        }
    }

    fn setup() -> (MarketStore, i64) {
        let store = MarketStore::open_memory().unwrap();
        let registry = SymbolRegistry::new(store.clone()).unwrap();
        let id = registry.resolve(VENUE, "BTCUSDT").unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_flush_on_size() {
        let (store, id) = setup();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cfg = WriterConfig {
            batch_size: 10,
            max_age: Duration::from_secs(3600),
            ..Default::default()
        };
        let writer = BatchWriter::spawn(
            store.clone(),
            cfg,
            TelemetryBus::new(),
            None,
            shutdown_rx,
        );

        for i in 0..10 {
            writer
                .handles
                .submit(NormalizedEvent::BookTicker(bt(
                    id,
                    1_000_000 + i * 1000,
                    i,
                    100.0,
                    101.0,
                )))
                .await
                .unwrap();
        }

        // Size threshold reached; rows land without waiting for the age tick.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.count_rows("book_ticker").unwrap(), 10);

        shutdown_tx.send(true).unwrap();
        for t in writer.tasks {
            t.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_flush_on_age_and_drain() {
        let (store, id) = setup();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cfg = WriterConfig {
            batch_size: 1_000_000,
            max_age: Duration::from_millis(50),
            ..Default::default()
        };
        let writer = BatchWriter::spawn(
            store.clone(),
            cfg,
            TelemetryBus::new(),
            None,
            shutdown_rx,
        );

        writer
            .handles
            .submit(NormalizedEvent::BookTicker(bt(id, 1_000_000, 1, 100.0, 101.0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.count_rows("book_ticker").unwrap(), 1);

        // A row still buffered at Stop lands during drain.
        writer
            .handles
            .submit(NormalizedEvent::BookTicker(bt(id, 2_000_000, 2, 100.0, 101.0)))
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();
        for t in writer.tasks {
            t.await.unwrap();
        }
        assert_eq!(store.count_rows("book_ticker").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let (store, id) = setup();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer = BatchWriter::spawn(
            store.clone(),
            WriterConfig {
                max_age: Duration::from_millis(20),
                ..Default::default()
            },
            TelemetryBus::new(),
            None,
            shutdown_rx,
        );

        let rec = TradeRecord {
            symbol_id: id,
            agg_trade_id: 7,
            ts_exchange_us: 1_000_000,
            ts_ingest_us: 1_000_100,
            price: 100.0,
            qty: 1.0,
            buyer_is_maker: false,
        };
        for _ in 0..2 {
            writer
                .handles
                .submit(NormalizedEvent::Trade(rec.clone()))
                .await
                .unwrap();
        }
        shutdown_tx.send(true).unwrap();
        for t in writer.tasks {
            t.await.unwrap();
        }
        assert_eq!(store.count_rows("trades").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_poison_batch_bisected_and_quarantined() {
        let (store, id) = setup();
        let telemetry = TelemetryBus::new();
        let mut rx = telemetry.subscribe();

        // One poison row (inverted book violates the CHECK constraint) mixed
        // into a good batch. The writer's normal path can't produce this;
        // commit directly through the bisect entry point.
        let rows = vec![
            bt(id, 1_000_000, 1, 100.0, 101.0),
            bt(id, 2_000_000, 2, 101.0, 100.0), // poison
            bt(id, 3_000_000, 3, 100.5, 101.5),
        ];
        bisect_commit::<BookTickerSink>(&store, &telemetry, &None, &rows);

        assert_eq!(store.count_rows("book_ticker").unwrap(), 2);
        assert_eq!(store.count_rows("quarantine").unwrap(), 1);

        let mut saw_quarantine = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, TelemetryEvent::Quarantine { table: "book_ticker", rows: 1, .. }) {
                saw_quarantine = true;
            }
        }
        assert!(saw_quarantine);
    }

    #[tokio::test]
    async fn test_flush_notice_covers_touched_seconds() {
        let (store, id) = setup();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (agg_tx, mut agg_rx) = mpsc::unbounded_channel();
        let writer = BatchWriter::spawn(
            store,
            WriterConfig {
                max_age: Duration::from_millis(20),
                ..Default::default()
            },
            TelemetryBus::new(),
            Some(agg_tx),
            shutdown_rx,
        );

        let base = 1_700_000_000_000_000i64;
        for i in 0..3 {
            writer
                .handles
                .submit(NormalizedEvent::BookTicker(bt(
                    id,
                    base + i * 600_000,
                    i,
                    100.0,
                    101.0,
                )))
                .await
                .unwrap();
        }
        // +0.0s/+0.6s share a second, +1.2s opens the next; notices arrive
        // per flush, so accumulate until both seconds are covered.
        let mut secs = std::collections::BTreeSet::new();
        while secs.len() < 2 {
            let notice = tokio::time::timeout(Duration::from_secs(1), agg_rx.recv())
                .await
                .expect("notice should arrive")
                .unwrap();
            assert_eq!(notice.source, AggSource::Book);
            secs.extend(notice.touched.iter().map(|&(_, s)| s));
        }
        assert!(secs.contains(&sec_of(base)));
        assert!(secs.contains(&sec_of(base + 1_200_000)));

        shutdown_tx.send(true).unwrap();
        for t in writer.tasks {
            t.await.unwrap();
        }
    }
}
