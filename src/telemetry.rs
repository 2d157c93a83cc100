//! In-process telemetry bus.
//!
//! A typed broadcast channel carrying connection, ingest, store and
//! validation events. Publishing never blocks: the channel has a bounded
//! ring and slow subscribers observe `Lagged` and are disconnected by their
//! reader (counted here). This and the symbol registry cache are the only
//! long-lived process-wide state.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

use crate::models::{Channel, ChannelRates};

/// Bounded ring size for the broadcast channel.
const BUS_CAPACITY: usize = 1024;

// =============================================================================
// EVENTS
// =============================================================================

/// Typed events published on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    ConnectionTransition {
        shard: String,
        from: String,
        to: String,
        reason: String,
    },
    IngestRates {
        rates: ChannelRates,
    },
    BatchFlush {
        table: &'static str,
        rows: usize,
        duration_ms: u64,
        retried: bool,
    },
    Backpressure {
        table: &'static str,
        engaged: bool,
    },
    Degraded {
        engaged: bool,
        reason: String,
    },
    ResyncStarted {
        symbol: String,
    },
    ResyncCompleted {
        symbol: String,
        snapshot_update_id: i64,
        discarded: u64,
    },
    Quarantine {
        table: &'static str,
        rows: usize,
        reason: String,
    },
    Retention {
        table: String,
        policy: &'static str,
        rows: u64,
        duration_ms: u64,
    },
    ValidationResult {
        passed: bool,
        failing_symbols: usize,
    },
    TaskAborted {
        component: String,
        error: String,
    },
    DrainTimeout {
        pending: usize,
    },
}

// =============================================================================
// BUS
// =============================================================================

/// Broadcast bus statistics.
#[derive(Debug, Default)]
pub struct BusStats {
    pub published: AtomicU64,
    /// Events dropped on at least one subscriber because it lagged.
    pub lagged_subscribers: AtomicU64,
}

/// The process-wide telemetry bus.
#[derive(Debug, Clone)]
pub struct TelemetryBus {
    tx: broadcast::Sender<TelemetryEvent>,
    stats: Arc<BusStats>,
}

impl TelemetryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            stats: Arc::new(BusStats::default()),
        }
    }

    /// Publish an event. Never blocks; with no subscribers the event is
    /// dropped silently (counters still advance).
    pub fn publish(&self, event: TelemetryEvent) {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    /// Record that a subscriber fell behind and was disconnected.
    pub fn record_lagged(&self) {
        self.stats.lagged_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// INGEST COUNTERS / RATES
// =============================================================================

/// Monotone per-channel event counters shared by the ingestion paths.
#[derive(Debug, Default)]
pub struct IngestCounters {
    pub book_ticker: AtomicU64,
    pub agg_trade: AtomicU64,
    pub depth: AtomicU64,
    pub mark_price: AtomicU64,
    pub force_order: AtomicU64,
    pub rejected: AtomicU64,
}

impl IngestCounters {
    #[inline]
    pub fn record(&self, channel: Channel) {
        self.counter(channel).fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn counter(&self, channel: Channel) -> &AtomicU64 {
        match channel {
            Channel::BookTicker => &self.book_ticker,
            Channel::AggTrade => &self.agg_trade,
            Channel::Depth => &self.depth,
            Channel::MarkPrice => &self.mark_price,
            Channel::ForceOrder => &self.force_order,
        }
    }

    fn totals(&self) -> [u64; 5] {
        [
            self.book_ticker.load(Ordering::Relaxed),
            self.agg_trade.load(Ordering::Relaxed),
            self.depth.load(Ordering::Relaxed),
            self.mark_price.load(Ordering::Relaxed),
            self.force_order.load(Ordering::Relaxed),
        ]
    }
}

/// Computes events-per-second from counter deltas between samples.
#[derive(Debug)]
pub struct RateEstimator {
    counters: Arc<IngestCounters>,
    last: parking_lot::Mutex<([u64; 5], Instant)>,
}

impl RateEstimator {
    pub fn new(counters: Arc<IngestCounters>) -> Self {
        let totals = counters.totals();
        Self {
            counters,
            last: parking_lot::Mutex::new((totals, Instant::now())),
        }
    }

    pub fn sample(&self) -> ChannelRates {
        let now = Instant::now();
        let totals = self.counters.totals();
        let mut last = self.last.lock();
        let (prev, prev_at) = *last;
        let dt = now.duration_since(prev_at).as_secs_f64();
        *last = (totals, now);
        if dt <= f64::EPSILON {
            return ChannelRates::default();
        }
        let rate = |cur: u64, old: u64| cur.saturating_sub(old) as f64 / dt;
        ChannelRates {
            book_ticker: rate(totals[0], prev[0]),
            agg_trade: rate(totals[1], prev[1]),
            depth: rate(totals[2], prev[2]),
            mark_price: rate(totals[3], prev[3]),
            force_order: rate(totals[4], prev[4]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = TelemetryBus::new();
        let mut rx = bus.subscribe();

        bus.publish(TelemetryEvent::Degraded {
            engaged: true,
            reason: "store unavailable".into(),
        });

        match rx.recv().await.unwrap() {
            TelemetryEvent::Degraded { engaged, .. } => assert!(engaged),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(bus.stats().published.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = TelemetryBus::new();
        let mut rx = bus.subscribe();

        for _ in 0..(BUS_CAPACITY + 16) {
            bus.publish(TelemetryEvent::Backpressure {
                table: "trades",
                engaged: false,
            });
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_estimator_counts_deltas() {
        let counters = Arc::new(IngestCounters::default());
        let est = RateEstimator::new(counters.clone());

        for _ in 0..100 {
            counters.record(Channel::BookTicker);
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        let rates = est.sample();
        assert!(rates.book_ticker > 0.0);
        assert_eq!(rates.depth, 0.0);
    }
}
