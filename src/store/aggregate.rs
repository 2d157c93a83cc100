//! Aggregator: per-second rollups and the gap-filled 1-second grid.
//!
//! Rollups (bt_1s, trade_1s) are always recomputed from the raw tables for a
//! whole second and written with `INSERT OR REPLACE`, so live computation,
//! late-arrival updates and offline recomputation produce identical rows.
//!
//! A second closes when the per-(symbol, channel) watermark passes the end
//! of the second plus a grace period, or when the maximum lateness elapses.
//! Arrivals for an already-closed second follow `late_policy`: `update`
//! (default) re-opens and recomputes the row, `reject` counts and drops.
//!
//! The flat grid (core_1s_24h) is refreshed at least once per minute,
//! incrementally: each symbol's grid is extended from its last materialized
//! second with LOCF state carried via the previous grid row, and rows older
//! than the window are trimmed. Refreshing an unchanged window is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use rusqlite::{params, OptionalExtension};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{now_us, ts_second, US_PER_SEC};
use crate::store::MarketStore;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatePolicy {
    Update,
    Reject,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Watermark slack past the end of a second before it closes.
    pub grace: Duration,
    /// A pending second closes unconditionally after this long.
    pub max_lateness: Duration,
    pub late_policy: LatePolicy,
    /// Scan cadence for pending seconds.
    pub tick: Duration,
    /// Grid refresh cadence; must stay at or under 60 s.
    pub grid_refresh: Duration,
    /// Grid window length in seconds (24 h).
    pub grid_window_secs: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            max_lateness: Duration::from_secs(30),
            late_policy: LatePolicy::Update,
            tick: Duration::from_millis(250),
            grid_refresh: Duration::from_secs(60),
            grid_window_secs: 24 * 3600,
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("AGG_GRACE_MS") {
            if let Ok(ms) = v.parse() {
                cfg.grace = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("AGG_MAX_LATENESS_MS") {
            if let Ok(ms) = v.parse() {
                cfg.max_lateness = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("AGG_LATE_POLICY") {
            cfg.late_policy = match v.as_str() {
                "reject" => LatePolicy::Reject,
                _ => LatePolicy::Update,
            };
        }
        if let Ok(v) = std::env::var("GRID_REFRESH_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.grid_refresh = Duration::from_secs(s.clamp(1, 60));
            }
        }
        cfg
    }
}

// =============================================================================
// FLUSH NOTICES
// =============================================================================

/// Which raw table a flushed batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggSource {
    Book,
    Trade,
}

/// Post-flush summary from the batch writer: which (symbol, second) cells
/// were touched and the max observed event time per symbol.
#[derive(Debug, Clone)]
pub struct FlushNotice {
    pub source: AggSource,
    pub touched: Vec<(i64, i64)>,
    pub watermarks: Vec<(i64, i64)>,
}

impl FlushNotice {
    pub fn new(source: AggSource, rows: impl Iterator<Item = (i64, i64)>) -> Self {
        let mut touched: BTreeMap<(i64, i64), ()> = BTreeMap::new();
        let mut watermarks: HashMap<i64, i64> = HashMap::new();
        for (symbol_id, ts_us) in rows {
            touched.insert((symbol_id, ts_second(ts_us)), ());
            let wm = watermarks.entry(symbol_id).or_insert(ts_us);
            *wm = (*wm).max(ts_us);
        }
        Self {
            source,
            touched: touched.into_keys().collect(),
            watermarks: watermarks.into_iter().collect(),
        }
    }
}

// =============================================================================
// ROLLUP ROWS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Bt1sRow {
    pub symbol_id: i64,
    pub ts_second: i64,
    pub open_mid: f64,
    pub high_mid: f64,
    pub low_mid: f64,
    pub close_mid: f64,
    pub mean_spread: f64,
    pub min_spread: f64,
    pub max_spread: f64,
    pub update_count: i64,
    pub vw_mid: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trade1sRow {
    pub symbol_id: i64,
    pub ts_second: i64,
    pub trade_count: i64,
    pub volume_sum: f64,
    pub value_sum: f64,
    pub vwap: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub imbalance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    pub symbol_id: i64,
    pub ts_second: i64,
    pub mid_ffill: Option<f64>,
    pub spread_ffill: Option<f64>,
    pub trade_count: i64,
    pub volume_sum: f64,
    pub vwap: Option<f64>,
    pub update_count: i64,
}

// =============================================================================
// ROLLUP RECOMPUTATION
// =============================================================================

/// Recompute the book-ticker rollup for one (symbol, second) from raw rows.
/// Returns false when the second holds no raw events (any stale rollup row
/// is removed so exactly one row exists per populated second).
pub fn recompute_bt_1s(
    store: &MarketStore,
    symbol_id: i64,
    sec: i64,
) -> rusqlite::Result<bool> {
    let from_us = sec * US_PER_SEC;
    let to_us = from_us + US_PER_SEC;

    store.with_tx(|conn| {
        let stats = conn
            .query_row(
                r#"
                SELECT COUNT(*), MAX(mid), MIN(mid),
                       AVG(spread), MIN(spread), MAX(spread),
                       SUM(mid * (bid_qty + ask_qty)), SUM(bid_qty + ask_qty), AVG(mid)
                FROM book_ticker
                WHERE symbol_id = ?1 AND ts_exchange_us >= ?2 AND ts_exchange_us < ?3
                "#,
                params![symbol_id, from_us, to_us],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                        row.get::<_, Option<f64>>(6)?,
                        row.get::<_, Option<f64>>(7)?,
                        row.get::<_, Option<f64>>(8)?,
                    ))
                },
            )?;

        let (count, high, low, mean_spread, min_spread, max_spread, vw_num, vw_den, mean_mid) =
            stats;
        if count == 0 {
            conn.execute(
                "DELETE FROM bt_1s WHERE symbol_id = ?1 AND ts_second = ?2",
                params![symbol_id, sec],
            )?;
            return Ok(false);
        }

        // Open: earliest event; close: latest. Ties on ts_exchange go to the
        // larger update id, then insertion order.
        let open: f64 = conn.query_row(
            r#"
            SELECT mid FROM book_ticker
            WHERE symbol_id = ?1 AND ts_exchange_us >= ?2 AND ts_exchange_us < ?3
            ORDER BY ts_exchange_us ASC, update_id DESC, rowid ASC LIMIT 1
            "#,
            params![symbol_id, from_us, to_us],
            |row| row.get(0),
        )?;
        let close: f64 = conn.query_row(
            r#"
            SELECT mid FROM book_ticker
            WHERE symbol_id = ?1 AND ts_exchange_us >= ?2 AND ts_exchange_us < ?3
            ORDER BY ts_exchange_us DESC, update_id DESC, rowid DESC LIMIT 1
            "#,
            params![symbol_id, from_us, to_us],
            |row| row.get(0),
        )?;

        let vw_mid = match (vw_num, vw_den) {
            (Some(num), Some(den)) if den > 0.0 => num / den,
            _ => mean_mid.unwrap_or(close),
        };

        conn.execute(
            r#"
            INSERT OR REPLACE INTO bt_1s (
                symbol_id, ts_second, open_mid, high_mid, low_mid, close_mid,
                mean_spread, min_spread, max_spread, update_count, vw_mid
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                symbol_id,
                sec,
                open,
                high.unwrap_or(open),
                low.unwrap_or(open),
                close,
                mean_spread.unwrap_or(0.0),
                min_spread.unwrap_or(0.0),
                max_spread.unwrap_or(0.0),
                count,
                vw_mid,
            ],
        )?;
        Ok(true)
    })
}

/// Recompute the trade rollup for one (symbol, second) from raw rows.
pub fn recompute_trade_1s(
    store: &MarketStore,
    symbol_id: i64,
    sec: i64,
) -> rusqlite::Result<bool> {
    let from_us = sec * US_PER_SEC;
    let to_us = from_us + US_PER_SEC;

    store.with_tx(|conn| {
        let stats = conn.query_row(
            r#"
            SELECT COUNT(*), SUM(qty), SUM(price * qty),
                   SUM(CASE WHEN buyer_is_maker = 0 THEN qty ELSE 0 END),
                   SUM(CASE WHEN buyer_is_maker = 1 THEN qty ELSE 0 END),
                   MIN(price), MAX(price)
            FROM trades
            WHERE symbol_id = ?1 AND ts_exchange_us >= ?2 AND ts_exchange_us < ?3
            "#,
            params![symbol_id, from_us, to_us],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                ))
            },
        )?;

        let (count, volume, value, buy_vol, sell_vol, min_price, max_price) = stats;
        if count == 0 {
            conn.execute(
                "DELETE FROM trade_1s WHERE symbol_id = ?1 AND ts_second = ?2",
                params![symbol_id, sec],
            )?;
            return Ok(false);
        }

        let volume = volume.unwrap_or(0.0);
        let value = value.unwrap_or(0.0);
        let buy_vol = buy_vol.unwrap_or(0.0);
        let sell_vol = sell_vol.unwrap_or(0.0);
        let vwap = if volume > 0.0 { value / volume } else { 0.0 };
        let imbalance = if buy_vol + sell_vol > 0.0 {
            Some((buy_vol - sell_vol) / (buy_vol + sell_vol))
        } else {
            None
        };

        conn.execute(
            r#"
            INSERT OR REPLACE INTO trade_1s (
                symbol_id, ts_second, trade_count, volume_sum, value_sum, vwap,
                buy_volume, sell_volume, min_price, max_price, imbalance
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                symbol_id,
                sec,
                count,
                volume,
                value,
                vwap,
                buy_vol,
                sell_vol,
                min_price.unwrap_or(0.0),
                max_price.unwrap_or(0.0),
                imbalance,
            ],
        )?;
        Ok(true)
    })
}

pub fn fetch_bt_1s(
    store: &MarketStore,
    symbol_id: i64,
    sec: i64,
) -> rusqlite::Result<Option<Bt1sRow>> {
    store.with_conn(|conn| {
        conn.query_row(
            r#"
            SELECT symbol_id, ts_second, open_mid, high_mid, low_mid, close_mid,
                   mean_spread, min_spread, max_spread, update_count, vw_mid
            FROM bt_1s WHERE symbol_id = ?1 AND ts_second = ?2
            "#,
            params![symbol_id, sec],
            |row| {
                Ok(Bt1sRow {
                    symbol_id: row.get(0)?,
                    ts_second: row.get(1)?,
                    open_mid: row.get(2)?,
                    high_mid: row.get(3)?,
                    low_mid: row.get(4)?,
                    close_mid: row.get(5)?,
                    mean_spread: row.get(6)?,
                    min_spread: row.get(7)?,
                    max_spread: row.get(8)?,
                    update_count: row.get(9)?,
                    vw_mid: row.get(10)?,
                })
            },
        )
        .optional()
    })
}

pub fn fetch_trade_1s(
    store: &MarketStore,
    symbol_id: i64,
    sec: i64,
) -> rusqlite::Result<Option<Trade1sRow>> {
    store.with_conn(|conn| {
        conn.query_row(
            r#"
            SELECT symbol_id, ts_second, trade_count, volume_sum, value_sum, vwap,
                   buy_volume, sell_volume, min_price, max_price, imbalance
            FROM trade_1s WHERE symbol_id = ?1 AND ts_second = ?2
            "#,
            params![symbol_id, sec],
            |row| {
                Ok(Trade1sRow {
                    symbol_id: row.get(0)?,
                    ts_second: row.get(1)?,
                    trade_count: row.get(2)?,
                    volume_sum: row.get(3)?,
                    value_sum: row.get(4)?,
                    vwap: row.get(5)?,
                    buy_volume: row.get(6)?,
                    sell_volume: row.get(7)?,
                    min_price: row.get(8)?,
                    max_price: row.get(9)?,
                    imbalance: row.get(10)?,
                })
            },
        )
        .optional()
    })
}

// =============================================================================
// FLAT GRID
// =============================================================================

/// Extend the grid for one symbol up to (excluding) `now_sec` and report the
/// rows written. LOCF state is carried via the previous grid row, so repeated
/// refreshes of an unchanged window write nothing.
pub fn refresh_grid_symbol(
    store: &MarketStore,
    symbol_id: i64,
    now_sec: i64,
    window_secs: i64,
) -> rusqlite::Result<usize> {
    let window_start = now_sec - window_secs;

    let (mut carry_mid, mut carry_spread, start) = store.with_conn(|conn| {
        let last: Option<(i64, Option<f64>, Option<f64>)> = conn
            .query_row(
                r#"
                SELECT ts_second, mid_ffill, spread_ffill FROM core_1s_24h
                WHERE symbol_id = ?1 ORDER BY ts_second DESC LIMIT 1
                "#,
                params![symbol_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(match last {
            Some((sec, mid, spread)) if sec + 1 >= window_start => (mid, spread, sec + 1),
            _ => (None, None, window_start),
        })
    })?;

    if start >= now_sec {
        return Ok(0);
    }

    // Pull both rollup tables for the span once.
    let bt: HashMap<i64, (f64, f64, i64)> = store.with_conn(|conn| {
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT ts_second, close_mid, mean_spread, update_count FROM bt_1s
            WHERE symbol_id = ?1 AND ts_second >= ?2 AND ts_second < ?3
            "#,
        )?;
        let rows = stmt.query_map(params![symbol_id, start, now_sec], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                (row.get(1)?, row.get(2)?, row.get(3)?),
            ))
        })?;
        rows.collect()
    })?;

    let trades: HashMap<i64, (i64, f64, f64)> = store.with_conn(|conn| {
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT ts_second, trade_count, volume_sum, vwap FROM trade_1s
            WHERE symbol_id = ?1 AND ts_second >= ?2 AND ts_second < ?3
            "#,
        )?;
        let rows = stmt.query_map(params![symbol_id, start, now_sec], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                (row.get(1)?, row.get(2)?, row.get(3)?),
            ))
        })?;
        rows.collect()
    })?;

    let mut rows: Vec<GridRow> = Vec::with_capacity((now_sec - start) as usize);
    for sec in start..now_sec {
        let update_count = match bt.get(&sec) {
            Some(&(close_mid, mean_spread, update_count)) => {
                carry_mid = Some(close_mid);
                carry_spread = Some(mean_spread);
                update_count
            }
            None => 0,
        };
        let (trade_count, volume_sum, vwap) = match trades.get(&sec) {
            Some(&(count, volume, vwap)) => (count, volume, Some(vwap)),
            None => (0, 0.0, None),
        };
        rows.push(GridRow {
            symbol_id,
            ts_second: sec,
            mid_ffill: carry_mid,
            spread_ffill: carry_spread,
            trade_count,
            volume_sum,
            vwap: if trade_count > 0 { vwap } else { None },
            update_count,
        });
    }

    let written = rows.len();
    store.with_tx(|conn| {
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT OR REPLACE INTO core_1s_24h (
                symbol_id, ts_second, mid_ffill, spread_ffill,
                trade_count, volume_sum, vwap, update_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )?;
        for r in &rows {
            stmt.execute(params![
                r.symbol_id,
                r.ts_second,
                r.mid_ffill,
                r.spread_ffill,
                r.trade_count,
                r.volume_sum,
                r.vwap,
                r.update_count,
            ])?;
        }
        Ok(())
    })?;
    Ok(written)
}

/// Drop grid rows older than the window. Returns rows removed.
pub fn trim_grid(store: &MarketStore, window_start: i64) -> rusqlite::Result<usize> {
    store.with_tx(|conn| {
        conn.execute(
            "DELETE FROM core_1s_24h WHERE ts_second < ?1",
            params![window_start],
        )
    })
}

/// Fraction of seconds in [from_sec, to_sec) with a grid row for the symbol.
pub fn grid_coverage(
    store: &MarketStore,
    symbol_id: i64,
    from_sec: i64,
    to_sec: i64,
) -> rusqlite::Result<f64> {
    let count: i64 = store.with_conn(|conn| {
        conn.query_row(
            r#"
            SELECT COUNT(*) FROM core_1s_24h
            WHERE symbol_id = ?1 AND ts_second >= ?2 AND ts_second < ?3
            "#,
            params![symbol_id, from_sec, to_sec],
            |row| row.get(0),
        )
    })?;
    let span = (to_sec - from_sec).max(1);
    Ok(count as f64 / span as f64)
}

pub fn fetch_grid_row(
    store: &MarketStore,
    symbol_id: i64,
    sec: i64,
) -> rusqlite::Result<Option<GridRow>> {
    store.with_conn(|conn| {
        conn.query_row(
            r#"
            SELECT symbol_id, ts_second, mid_ffill, spread_ffill,
                   trade_count, volume_sum, vwap, update_count
            FROM core_1s_24h WHERE symbol_id = ?1 AND ts_second = ?2
            "#,
            params![symbol_id, sec],
            |row| {
                Ok(GridRow {
                    symbol_id: row.get(0)?,
                    ts_second: row.get(1)?,
                    mid_ffill: row.get(2)?,
                    spread_ffill: row.get(3)?,
                    trade_count: row.get(4)?,
                    volume_sum: row.get(5)?,
                    vwap: row.get(6)?,
                    update_count: row.get(7)?,
                })
            },
        )
        .optional()
    })
}

// =============================================================================
// AGGREGATOR TASKS
// =============================================================================

pub struct Aggregator {
    pub notice_tx: mpsc::UnboundedSender<FlushNotice>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Aggregator {
    /// Spawn the rollup loop and the grid refresh loop.
    pub fn spawn(
        store: MarketStore,
        cfg: AggregatorConfig,
        telemetry: TelemetryBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let rollup = tokio::spawn(rollup_loop(
            store.clone(),
            cfg.clone(),
            notice_rx,
            shutdown.clone(),
        ));
        let grid = tokio::spawn(grid_loop(store, cfg, telemetry, shutdown));

        Self {
            notice_tx,
            tasks: vec![rollup, grid],
        }
    }
}

async fn rollup_loop(
    store: MarketStore,
    cfg: AggregatorConfig,
    mut notice_rx: mpsc::UnboundedReceiver<FlushNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Pending cells by (second, source, symbol); BTreeMap so closure scans
    // run oldest-first.
    let mut pending: BTreeMap<(i64, AggSource, i64), Instant> = BTreeMap::new();
    let mut watermarks: HashMap<(AggSource, i64), i64> = HashMap::new();
    let mut closed_through: HashMap<(AggSource, i64), i64> = HashMap::new();
    let mut late_rejected: u64 = 0;

    let mut tick = tokio::time::interval(cfg.tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let grace_us = cfg.grace.as_micros() as i64;

    loop {
        tokio::select! {
            maybe = notice_rx.recv() => match maybe {
                Some(notice) => {
                    for (symbol_id, wm_us) in &notice.watermarks {
                        let slot = watermarks.entry((notice.source, *symbol_id)).or_insert(*wm_us);
                        *slot = (*slot).max(*wm_us);
                    }
                    for (symbol_id, sec) in &notice.touched {
                        let already_closed = closed_through
                            .get(&(notice.source, *symbol_id))
                            .map(|t| sec <= t)
                            .unwrap_or(false);
                        if already_closed {
                            match cfg.late_policy {
                                LatePolicy::Update => {
                                    if let Err(e) = recompute_cell(&store, notice.source, *symbol_id, *sec) {
                                        error!(error = %e, "late_recompute_failed");
                                    }
                                }
                                LatePolicy::Reject => {
                                    late_rejected += 1;
                                    if late_rejected.is_power_of_two() {
                                        debug!(total = late_rejected, "late_events_rejected");
                                    }
                                }
                            }
                        } else {
                            pending.entry((*sec, notice.source, *symbol_id)).or_insert_with(Instant::now);
                        }
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                let now = Instant::now();
                let due: Vec<(i64, AggSource, i64)> = pending
                    .iter()
                    .filter(|(&(sec, source, symbol_id), first_seen)| {
                        let wm = watermarks.get(&(source, symbol_id)).copied().unwrap_or(i64::MIN);
                        wm >= (sec + 1) * US_PER_SEC + grace_us
                            || now.duration_since(**first_seen) >= cfg.max_lateness
                    })
                    .map(|(&key, _)| key)
                    .collect();

                for key in due {
                    let (sec, source, symbol_id) = key;
                    pending.remove(&key);
                    if let Err(e) = recompute_cell(&store, source, symbol_id, sec) {
                        error!(error = %e, symbol_id, sec, "rollup_failed");
                        continue;
                    }
                    let t = closed_through.entry((source, symbol_id)).or_insert(sec);
                    *t = (*t).max(sec);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Writers are draining; keep consuming notices until
                    // they drop their senders so final flushes still reach
                    // the rollups.
                    while let Some(notice) = notice_rx.recv().await {
                        for (symbol_id, sec) in &notice.touched {
                            if let Err(e) = recompute_cell(&store, notice.source, *symbol_id, *sec) {
                                error!(error = %e, "drain_rollup_failed");
                            }
                        }
                    }
                    break;
                }
            }
        }
    }

    // Close out whatever is still pending so Stop leaves complete rollups.
    for (sec, source, symbol_id) in pending.keys().copied().collect::<Vec<_>>() {
        if let Err(e) = recompute_cell(&store, source, symbol_id, sec) {
            error!(error = %e, "final_rollup_failed");
        }
    }
    debug!("aggregator_stopped");
}

fn recompute_cell(
    store: &MarketStore,
    source: AggSource,
    symbol_id: i64,
    sec: i64,
) -> rusqlite::Result<bool> {
    match source {
        AggSource::Book => recompute_bt_1s(store, symbol_id, sec),
        AggSource::Trade => recompute_trade_1s(store, symbol_id, sec),
    }
}

async fn grid_loop(
    store: MarketStore,
    cfg: AggregatorConfig,
    telemetry: TelemetryBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(cfg.grid_refresh);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let started = Instant::now();
                let now_sec = ts_second(now_us());
                let window_start = now_sec - cfg.grid_window_secs;

                let symbols = match store.load_symbols() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "grid_symbol_load_failed");
                        continue;
                    }
                };

                let mut written = 0usize;
                for sym in symbols.iter().filter(|s| s.active) {
                    match refresh_grid_symbol(&store, sym.id, now_sec, cfg.grid_window_secs) {
                        Ok(n) => written += n,
                        Err(e) => warn!(error = %e, symbol = %sym.code, "grid_refresh_failed"),
                    }
                }
                let trimmed = trim_grid(&store, window_start).unwrap_or(0);

                telemetry.publish(TelemetryEvent::Retention {
                    table: "core_1s_24h".into(),
                    policy: "grid_refresh",
                    rows: written as u64,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                if written > 0 || trimmed > 0 {
                    info!(written, trimmed, "grid_refreshed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
