//! Wire shapes for the venue's combined-stream frames and the depth
//! snapshot endpoint.
//!
//! Prices and quantities arrive as decimal strings and stay strings here;
//! the normalizer owns numeric conversion and invariant checks. Frame format:
//! `{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker",...}}`, with
//! subscription acks shaped as `{"result":null,"id":1}`.

use serde::Deserialize;

use crate::models::Channel;

// =============================================================================
// FRAMES
// =============================================================================

/// One inbound frame, decoded.
#[derive(Debug)]
pub enum WireFrame {
    /// Subscription ack or other control payload; carries no market data.
    Control,
    Event(WireEvent),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<WireEvent>,
}

/// Typed stream events, tagged by the venue's `e` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "e")]
pub enum WireEvent {
    #[serde(rename = "bookTicker")]
    BookTicker(WireBookTicker),
    #[serde(rename = "aggTrade")]
    AggTrade(WireAggTrade),
    #[serde(rename = "depthUpdate")]
    DepthUpdate(WireDepthUpdate),
    #[serde(rename = "markPriceUpdate")]
    MarkPrice(WireMarkPrice),
    #[serde(rename = "forceOrder")]
    ForceOrder(WireForceOrder),
}

impl WireEvent {
    pub fn channel(&self) -> Channel {
        match self {
            WireEvent::BookTicker(_) => Channel::BookTicker,
            WireEvent::AggTrade(_) => Channel::AggTrade,
            WireEvent::DepthUpdate(_) => Channel::Depth,
            WireEvent::MarkPrice(_) => Channel::MarkPrice,
            WireEvent::ForceOrder(_) => Channel::ForceOrder,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            WireEvent::BookTicker(e) => &e.symbol,
            WireEvent::AggTrade(e) => &e.symbol,
            WireEvent::DepthUpdate(e) => &e.symbol,
            WireEvent::MarkPrice(e) => &e.symbol,
            WireEvent::ForceOrder(e) => e
                .order
                .get("s")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        }
    }
}

/// Decode one frame. Frames without a `data` payload are control messages.
pub fn parse_frame(raw: &str) -> Result<WireFrame, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    Ok(match envelope.data {
        Some(event) => WireFrame::Event(event),
        None => WireFrame::Control,
    })
}

// =============================================================================
// EVENT PAYLOADS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WireBookTicker {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "u")]
    pub update_id: i64,
    #[serde(rename = "b")]
    pub bid_price: String,
    #[serde(rename = "B")]
    pub bid_qty: String,
    #[serde(rename = "a")]
    pub ask_price: String,
    #[serde(rename = "A")]
    pub ask_qty: String,
    /// Transaction time, the authoritative event time when present.
    #[serde(rename = "T", default)]
    pub transact_time_ms: Option<i64>,
    #[serde(rename = "E", default)]
    pub event_time_ms: Option<i64>,
}

impl WireBookTicker {
    pub fn ts_exchange_ms(&self) -> Option<i64> {
        self.transact_time_ms.or(self.event_time_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireAggTrade {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "a")]
    pub agg_trade_id: i64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub qty: String,
    #[serde(rename = "T")]
    pub trade_time_ms: i64,
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDepthUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "E")]
    pub event_time_ms: i64,
    #[serde(rename = "T", default)]
    pub transact_time_ms: Option<i64>,
    #[serde(rename = "U")]
    pub first_update_id: i64,
    #[serde(rename = "u")]
    pub final_update_id: i64,
    /// Final update id of the previous event on this stream; absent on the
    /// first event after (re)subscription.
    #[serde(rename = "pu", default)]
    pub prev_final_update_id: Option<i64>,
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

impl WireDepthUpdate {
    pub fn ts_exchange_ms(&self) -> i64 {
        self.transact_time_ms.unwrap_or(self.event_time_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMarkPrice {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "E")]
    pub event_time_ms: i64,
    #[serde(rename = "p")]
    pub mark_price: String,
    #[serde(rename = "i")]
    pub index_price: String,
    #[serde(rename = "r", default)]
    pub funding_rate: Option<String>,
    #[serde(rename = "T", default)]
    pub next_funding_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireForceOrder {
    #[serde(rename = "E")]
    pub event_time_ms: i64,
    /// Order payload, kept free-form so the raw shape survives into storage.
    #[serde(rename = "o")]
    pub order: serde_json::Value,
}

// =============================================================================
// DEPTH SNAPSHOT (REST)
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,
    #[serde(rename = "E", default)]
    pub event_time_ms: Option<i64>,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

// =============================================================================
// STREAM NAMES
// =============================================================================

/// Stream name for one (symbol, channel) pair, e.g. `btcusdt@depth@100ms`.
pub fn stream_name(symbol: &str, channel: Channel) -> String {
    format!("{}@{}", symbol.to_lowercase(), channel.stream_suffix())
}

/// Combined-stream URL for a set of stream names.
pub fn combined_stream_url(ws_base: &str, streams: &[String]) -> String {
    format!("{}/stream?streams={}", ws_base.trim_end_matches('/'), streams.join("/"))
}

/// Depth snapshot URL for one symbol.
pub fn depth_snapshot_url(rest_base: &str, symbol: &str, limit: usize) -> String {
    format!(
        "{}/fapi/v1/depth?symbol={}&limit={}",
        rest_base.trim_end_matches('/'),
        symbol.to_uppercase(),
        limit
    )
}
