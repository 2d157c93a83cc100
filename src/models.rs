//! Core data model: channels, normalized event records, status snapshots.
//!
//! All timestamps are UTC microseconds since the Unix epoch. `ts_exchange_us`
//! is the authoritative event time from the venue (millisecond fields are
//! converted on ingest); `ts_ingest_us` is stamped by the normalizer.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Microseconds per second, used throughout for bucket math.
pub const US_PER_SEC: i64 = 1_000_000;

/// Wall clock as UTC microseconds since epoch.
#[inline]
pub fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

/// Epoch second containing a microsecond timestamp.
#[inline]
pub fn ts_second(ts_us: i64) -> i64 {
    ts_us.div_euclid(US_PER_SEC)
}

// =============================================================================
// CHANNELS
// =============================================================================

/// Venue stream channels we know how to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    BookTicker,
    AggTrade,
    Depth,
    MarkPrice,
    ForceOrder,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::BookTicker,
        Channel::AggTrade,
        Channel::Depth,
        Channel::MarkPrice,
        Channel::ForceOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::BookTicker => "bookTicker",
            Channel::AggTrade => "aggTrade",
            Channel::Depth => "depth",
            Channel::MarkPrice => "markPrice",
            Channel::ForceOrder => "forceOrder",
        }
    }

    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "bookTicker" => Some(Channel::BookTicker),
            "aggTrade" => Some(Channel::AggTrade),
            "depth" => Some(Channel::Depth),
            "markPrice" => Some(Channel::MarkPrice),
            "forceOrder" => Some(Channel::ForceOrder),
            _ => None,
        }
    }

    /// Stream suffix for the combined-stream subscription URL.
    pub fn stream_suffix(&self) -> &'static str {
        match self {
            Channel::BookTicker => "bookTicker",
            Channel::AggTrade => "aggTrade",
            Channel::Depth => "depth@100ms",
            Channel::MarkPrice => "markPrice@1s",
            Channel::ForceOrder => "forceOrder",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade/liquidation side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "BUY" | "buy" => Some(Side::Buy),
            "SELL" | "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

// =============================================================================
// NORMALIZED RECORDS
// =============================================================================

/// Top-of-book update. Unique per (symbol_id, ts_exchange_us, update_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTickerRecord {
    pub symbol_id: i64,
    pub ts_exchange_us: i64,
    pub ts_ingest_us: i64,
    /// Venue order-book update id, 0 when the venue omits it.
    pub update_id: i64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
    pub spread: f64,
    pub mid: f64,
}

/// Venue-aggregated trade. Unique per (symbol_id, agg_trade_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol_id: i64,
    pub agg_trade_id: i64,
    pub ts_exchange_us: i64,
    pub ts_ingest_us: i64,
    pub price: f64,
    pub qty: f64,
    pub buyer_is_maker: bool,
}

/// Incremental order-book change. Bid/ask levels are preserved verbatim as
/// `[price, qty]` pairs; qty 0 removes the level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthDeltaRecord {
    pub symbol_id: i64,
    pub ts_exchange_us: i64,
    pub ts_ingest_us: i64,
    pub first_update_id: i64,
    pub final_update_id: i64,
    pub prev_final_update_id: Option<i64>,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
}

/// Mark/index price sample. Unique per (symbol_id, ts_exchange_us).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPriceRecord {
    pub symbol_id: i64,
    pub ts_exchange_us: i64,
    pub ts_ingest_us: i64,
    pub mark_price: f64,
    pub index_price: f64,
    pub funding_rate: Option<f64>,
    pub next_funding_time_us: Option<i64>,
}

/// Liquidation order. Unique per (symbol_id, ts_exchange_us, side, price, qty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceOrderRecord {
    pub symbol_id: i64,
    pub ts_exchange_us: i64,
    pub ts_ingest_us: i64,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    /// Original wire payload, kept for faithful reconstruction.
    pub raw: String,
}

/// One normalized event on its way to the batch writer.
#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    BookTicker(BookTickerRecord),
    Trade(TradeRecord),
    DepthDelta(DepthDeltaRecord),
    MarkPrice(MarkPriceRecord),
    ForceOrder(ForceOrderRecord),
}

impl NormalizedEvent {
    pub fn channel(&self) -> Channel {
        match self {
            NormalizedEvent::BookTicker(_) => Channel::BookTicker,
            NormalizedEvent::Trade(_) => Channel::AggTrade,
            NormalizedEvent::DepthDelta(_) => Channel::Depth,
            NormalizedEvent::MarkPrice(_) => Channel::MarkPrice,
            NormalizedEvent::ForceOrder(_) => Channel::ForceOrder,
        }
    }

    pub fn symbol_id(&self) -> i64 {
        match self {
            NormalizedEvent::BookTicker(r) => r.symbol_id,
            NormalizedEvent::Trade(r) => r.symbol_id,
            NormalizedEvent::DepthDelta(r) => r.symbol_id,
            NormalizedEvent::MarkPrice(r) => r.symbol_id,
            NormalizedEvent::ForceOrder(r) => r.symbol_id,
        }
    }

    pub fn ts_exchange_us(&self) -> i64 {
        match self {
            NormalizedEvent::BookTicker(r) => r.ts_exchange_us,
            NormalizedEvent::Trade(r) => r.ts_exchange_us,
            NormalizedEvent::DepthDelta(r) => r.ts_exchange_us,
            NormalizedEvent::MarkPrice(r) => r.ts_exchange_us,
            NormalizedEvent::ForceOrder(r) => r.ts_exchange_us,
        }
    }
}

// =============================================================================
// SYMBOLS
// =============================================================================

/// A registered instrument. Identity is (venue, code); `id` is stable across
/// restarts and is the only thing event rows carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub id: i64,
    pub venue: String,
    pub code: String,
    pub instrument_class: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub active: bool,
    pub tick_size: Option<f64>,
    pub lot_size: Option<f64>,
}

// =============================================================================
// STATUS SNAPSHOTS
// =============================================================================

/// Per-shard state as reported by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard_id: usize,
    pub name: String,
    pub channels: Vec<Channel>,
    pub symbol_count: usize,
    pub state: String,
    pub reconnects: u64,
    pub breaker_open: bool,
    pub last_error: Option<String>,
}

/// Per-channel ingest rate sample (events per second).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelRates {
    pub book_ticker: f64,
    pub agg_trade: f64,
    pub depth: f64,
    pub mark_price: f64,
    pub force_order: f64,
}

/// Compact status snapshot served by the control plane and pushed over the
/// telemetry stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub started_at: Option<String>,
    pub shards: Vec<ShardStatus>,
    pub rates: ChannelRates,
    pub degraded: bool,
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    pub fn stopped() -> Self {
        Self {
            running: false,
            started_at: None,
            shards: Vec::new(),
            rates: ChannelRates::default(),
            degraded: false,
            last_error: None,
        }
    }
}
