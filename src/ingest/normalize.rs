//! Event normalizer: wire shapes → internal records.
//!
//! Stateless transformation. Resolves symbol ids through the registry cache,
//! stamps `ts_ingest` at entry, derives spread/mid, and rejects events that
//! fail invariants (non-positive price, inverted book, missing fields).
//! Rejections never reach the store; they are counted and logged through a
//! rate limiter so a misbehaving stream cannot flood the log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::ingest::wire::{
    WireAggTrade, WireBookTicker, WireDepthUpdate, WireEvent, WireForceOrder, WireMarkPrice,
};
use crate::models::{
    now_us, BookTickerRecord, DepthDeltaRecord, ForceOrderRecord, MarkPriceRecord, NormalizedEvent,
    Side, TradeRecord,
};
use crate::registry::{SymbolRegistry, VENUE};
use crate::telemetry::IngestCounters;

/// Minimum spacing between identical warnings.
const WARN_INTERVAL: Duration = Duration::from_secs(5);

const MS_TO_US: i64 = 1_000;

pub struct Normalizer {
    registry: SymbolRegistry,
    counters: Arc<IngestCounters>,
    last_warn: Mutex<HashMap<(&'static str, String), Instant>>,
}

impl Normalizer {
    pub fn new(registry: SymbolRegistry, counters: Arc<IngestCounters>) -> Self {
        Self {
            registry,
            counters,
            last_warn: Mutex::new(HashMap::new()),
        }
    }

    /// Convert one wire event. Returns `None` for events that fail
    /// invariants (counted) or whose symbol cannot be resolved.
    pub fn normalize(&self, event: &WireEvent) -> Option<NormalizedEvent> {
        let ts_ingest_us = now_us();
        let result = match event {
            WireEvent::BookTicker(bt) => self.book_ticker(bt, ts_ingest_us),
            WireEvent::AggTrade(t) => self.trade(t, ts_ingest_us),
            WireEvent::DepthUpdate(d) => self.depth(d, ts_ingest_us),
            WireEvent::MarkPrice(m) => self.mark_price(m, ts_ingest_us),
            WireEvent::ForceOrder(f) => self.force_order(f, ts_ingest_us),
        };

        match result {
            Ok(rec) => {
                self.counters.record(rec.channel());
                Some(rec)
            }
            Err(reason) => {
                self.counters.record_rejected();
                self.warn_rate_limited(reason, event.symbol());
                None
            }
        }
    }

    fn resolve(&self, code: &str) -> Result<i64, &'static str> {
        if code.is_empty() {
            return Err("missing_symbol");
        }
        self.registry.resolve(VENUE, code).map_err(|_| "registry_unavailable")
    }

    fn book_ticker(
        &self,
        bt: &WireBookTicker,
        ts_ingest_us: i64,
    ) -> Result<NormalizedEvent, &'static str> {
        let symbol_id = self.resolve(&bt.symbol)?;
        let ts_ms = bt.ts_exchange_ms().ok_or("missing_event_time")?;
        let best_bid = parse_positive(&bt.bid_price).ok_or("non_positive_price")?;
        let best_ask = parse_positive(&bt.ask_price).ok_or("non_positive_price")?;
        let bid_qty = parse_non_negative(&bt.bid_qty).ok_or("negative_qty")?;
        let ask_qty = parse_non_negative(&bt.ask_qty).ok_or("negative_qty")?;
        if best_ask < best_bid {
            return Err("inverted_book");
        }
        Ok(NormalizedEvent::BookTicker(BookTickerRecord {
            symbol_id,
            ts_exchange_us: ts_ms * MS_TO_US,
            ts_ingest_us,
            update_id: bt.update_id,
            best_bid,
            best_ask,
            bid_qty,
            ask_qty,
            spread: best_ask - best_bid,
            mid: (best_ask + best_bid) / 2.0,
        }))
    }

    fn trade(&self, t: &WireAggTrade, ts_ingest_us: i64) -> Result<NormalizedEvent, &'static str> {
        let symbol_id = self.resolve(&t.symbol)?;
        let price = parse_positive(&t.price).ok_or("non_positive_price")?;
        let qty = parse_positive(&t.qty).ok_or("non_positive_qty")?;
        Ok(NormalizedEvent::Trade(TradeRecord {
            symbol_id,
            agg_trade_id: t.agg_trade_id,
            ts_exchange_us: t.trade_time_ms * MS_TO_US,
            ts_ingest_us,
            price,
            qty,
            buyer_is_maker: t.buyer_is_maker,
        }))
    }

    fn depth(
        &self,
        d: &WireDepthUpdate,
        ts_ingest_us: i64,
    ) -> Result<NormalizedEvent, &'static str> {
        let symbol_id = self.resolve(&d.symbol)?;
        if d.final_update_id < d.first_update_id {
            return Err("update_id_range");
        }
        let bids = parse_levels(&d.bids).ok_or("bad_level")?;
        let asks = parse_levels(&d.asks).ok_or("bad_level")?;
        Ok(NormalizedEvent::DepthDelta(DepthDeltaRecord {
            symbol_id,
            ts_exchange_us: d.ts_exchange_ms() * MS_TO_US,
            ts_ingest_us,
            first_update_id: d.first_update_id,
            final_update_id: d.final_update_id,
            prev_final_update_id: d.prev_final_update_id,
            bids,
            asks,
        }))
    }

    fn mark_price(
        &self,
        m: &WireMarkPrice,
        ts_ingest_us: i64,
    ) -> Result<NormalizedEvent, &'static str> {
        let symbol_id = self.resolve(&m.symbol)?;
        let mark_price = parse_positive(&m.mark_price).ok_or("non_positive_price")?;
        let index_price = parse_positive(&m.index_price).ok_or("non_positive_price")?;
        let funding_rate = match m.funding_rate.as_deref() {
            None | Some("") => None,
            Some(s) => Some(s.parse::<f64>().map_err(|_| "bad_funding_rate")?),
        };
        Ok(NormalizedEvent::MarkPrice(MarkPriceRecord {
            symbol_id,
            ts_exchange_us: m.event_time_ms * MS_TO_US,
            ts_ingest_us,
            mark_price,
            index_price,
            funding_rate,
            next_funding_time_us: m.next_funding_time_ms.map(|ms| ms * MS_TO_US),
        }))
    }

    fn force_order(
        &self,
        f: &WireForceOrder,
        ts_ingest_us: i64,
    ) -> Result<NormalizedEvent, &'static str> {
        let order = &f.order;
        let code = order
            .get("s")
            .and_then(|v| v.as_str())
            .ok_or("missing_symbol")?;
        let symbol_id = self.resolve(code)?;
        let side = order
            .get("S")
            .and_then(|v| v.as_str())
            .and_then(Side::parse)
            .ok_or("missing_side")?;
        let price = order
            .get("p")
            .and_then(|v| v.as_str())
            .and_then(parse_positive_str)
            .ok_or("non_positive_price")?;
        let qty = order
            .get("q")
            .and_then(|v| v.as_str())
            .and_then(parse_positive_str)
            .ok_or("non_positive_qty")?;
        let ts_ms = order
            .get("T")
            .and_then(|v| v.as_i64())
            .unwrap_or(f.event_time_ms);
        Ok(NormalizedEvent::ForceOrder(ForceOrderRecord {
            symbol_id,
            ts_exchange_us: ts_ms * MS_TO_US,
            ts_ingest_us,
            side,
            price,
            qty,
            raw: order.to_string(),
        }))
    }

    fn warn_rate_limited(&self, reason: &'static str, symbol: &str) {
        let key = (reason, symbol.to_string());
        let mut last = self.last_warn.lock();
        let now = Instant::now();
        let due = last
            .get(&key)
            .map(|at| now.duration_since(*at) >= WARN_INTERVAL)
            .unwrap_or(true);
        if due {
            last.insert(key, now);
            warn!(reason, symbol, "event_rejected");
        }
    }
}

fn parse_positive(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| *v > 0.0 && v.is_finite())
}

fn parse_positive_str(s: &str) -> Option<f64> {
    parse_positive(s)
}

fn parse_non_negative(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| *v >= 0.0 && v.is_finite())
}

fn parse_levels(levels: &[[String; 2]]) -> Option<Vec<[f64; 2]>> {
    levels
        .iter()
        .map(|[p, q]| {
            let price = p.parse::<f64>().ok().filter(|v| v.is_finite())?;
            let qty = q.parse::<f64>().ok().filter(|v| *v >= 0.0 && v.is_finite())?;
            Some([price, qty])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::wire::{parse_frame, WireFrame};
    use crate::store::MarketStore;
    use std::sync::atomic::Ordering;

    fn normalizer() -> Normalizer {
        let store = MarketStore::open_memory().unwrap();
        let registry = SymbolRegistry::new(store).unwrap();
        Normalizer::new(registry, Arc::new(IngestCounters::default()))
    }

    fn event(raw: &str) -> WireEvent {
        match parse_frame(raw).unwrap() {
            WireFrame::Event(e) => e,
            WireFrame::Control => panic!("control frame"),
        }
    }

    #[test]
    fn test_book_ticker_derives_spread_and_mid() {
        let n = normalizer();
        let e = event(
            r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","u":7,"s":"BTCUSDT","b":"100.0","B":"1.0","a":"101.0","A":"2.0","T":1700000000000}}"#,
        );
        match n.normalize(&e).unwrap() {
            NormalizedEvent::BookTicker(r) => {
                assert_eq!(r.ts_exchange_us, 1_700_000_000_000_000);
                assert!((r.spread - 1.0).abs() < 1e-9);
                assert!((r.mid - 100.5).abs() < 1e-9);
                assert!(r.ts_ingest_us > 0);
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn test_inverted_book_rejected() {
        let n = normalizer();
        let e = event(
            r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","u":7,"s":"BTCUSDT","b":"101.0","B":"1.0","a":"100.0","A":"2.0","T":1700000000000}}"#,
        );
        assert!(n.normalize(&e).is_none());
        assert_eq!(n.counters.rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_non_positive_trade_rejected() {
        let n = normalizer();
        let e = event(
            r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1,"s":"BTCUSDT","a":1,"p":"0","q":"1","f":1,"l":1,"T":1700000000000,"m":false}}"#,
        );
        assert!(n.normalize(&e).is_none());
    }

    #[test]
    fn test_same_symbol_same_id() {
        let n = normalizer();
        let bt = event(
            r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","u":7,"s":"BTCUSDT","b":"100.0","B":"1.0","a":"101.0","A":"2.0","T":1700000000000}}"#,
        );
        let tr = event(
            r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1,"s":"BTCUSDT","a":1,"p":"100.5","q":"1","f":1,"l":1,"T":1700000000000,"m":false}}"#,
        );
        let a = n.normalize(&bt).unwrap().symbol_id();
        let b = n.normalize(&tr).unwrap().symbol_id();
        assert_eq!(a, b);
    }

    #[test]
    fn test_force_order_preserves_raw() {
        let n = normalizer();
        let e = event(
            r#"{"stream":"btcusdt@forceOrder","data":{"e":"forceOrder","E":1700000000000,"o":{"s":"BTCUSDT","S":"SELL","q":"0.014","p":"9910","X":"FILLED","T":1700000000001}}}"#,
        );
        match n.normalize(&e).unwrap() {
            NormalizedEvent::ForceOrder(r) => {
                assert_eq!(r.side, Side::Sell);
                assert_eq!(r.ts_exchange_us, 1_700_000_000_001_000);
                assert!(r.raw.contains("\"X\":\"FILLED\""));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn test_mark_price_empty_funding() {
        let n = normalizer();
        let e = event(
            r#"{"stream":"btcusdt@markPrice@1s","data":{"e":"markPriceUpdate","E":1700000000000,"s":"BTCUSDT","p":"100.0","i":"99.9","r":"","T":1700003600000}}"#,
        );
        match n.normalize(&e).unwrap() {
            NormalizedEvent::MarkPrice(r) => {
                assert!(r.funding_rate.is_none());
                assert_eq!(r.next_funding_time_us, Some(1_700_003_600_000_000));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }
}
