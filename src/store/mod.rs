//! Time-series market store on embedded SQLite.
//!
//! Layout and invariants:
//! - Raw event tables (book_ticker, trades, depth_deltas, mark_price,
//!   force_orders) keyed by their natural uniqueness; bulk writes are
//!   `INSERT ... ON CONFLICT DO NOTHING` inside one short `BEGIN IMMEDIATE`
//!   transaction, so redelivery is idempotent.
//! - CHECK constraints enforce row invariants (positive prices, non-inverted
//!   books); a violating row fails the statement instead of being committed.
//! - Derived tables (bt_1s, trade_1s, core_1s_24h) are owned by the
//!   aggregator and written with `INSERT OR REPLACE`.
//! - The engine has no native time partitioning; the retention manager runs
//!   equivalent range maintenance (bounded deletes, payload compression).
//!
//! All timestamps are UTC microseconds (`*_us`); aggregate keys are epoch
//! seconds.

pub mod aggregate;
pub mod retention;
pub mod writer;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::models::{
    BookTickerRecord, DepthDeltaRecord, ForceOrderRecord, MarkPriceRecord, Symbol, TradeRecord,
};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA auto_vacuum = INCREMENTAL;

CREATE TABLE IF NOT EXISTS symbols (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    venue            TEXT NOT NULL,
    code             TEXT NOT NULL,
    instrument_class TEXT NOT NULL,
    base_asset       TEXT NOT NULL,
    quote_asset      TEXT NOT NULL,
    active           INTEGER NOT NULL DEFAULT 1,
    tick_size        REAL,
    lot_size         REAL,
    first_seen_us    INTEGER NOT NULL,
    last_seen_us     INTEGER NOT NULL,
    UNIQUE (venue, code)
);

CREATE TABLE IF NOT EXISTS book_ticker (
    symbol_id      INTEGER NOT NULL,
    ts_exchange_us INTEGER NOT NULL,
    ts_ingest_us   INTEGER NOT NULL,
    update_id      INTEGER NOT NULL DEFAULT 0,
    best_bid       REAL NOT NULL,
    best_ask       REAL NOT NULL,
    bid_qty        REAL NOT NULL,
    ask_qty        REAL NOT NULL,
    spread         REAL NOT NULL,
    mid            REAL NOT NULL,
    UNIQUE (symbol_id, ts_exchange_us, update_id),
    CHECK (best_bid > 0 AND best_ask >= best_bid AND bid_qty >= 0 AND ask_qty >= 0)
);
CREATE INDEX IF NOT EXISTS idx_book_ticker_symbol_ts
    ON book_ticker (symbol_id, ts_exchange_us);

CREATE TABLE IF NOT EXISTS trades (
    symbol_id      INTEGER NOT NULL,
    agg_trade_id   INTEGER NOT NULL,
    ts_exchange_us INTEGER NOT NULL,
    ts_ingest_us   INTEGER NOT NULL,
    price          REAL NOT NULL,
    qty            REAL NOT NULL,
    buyer_is_maker INTEGER NOT NULL,
    UNIQUE (symbol_id, agg_trade_id),
    CHECK (price > 0 AND qty > 0)
);
CREATE INDEX IF NOT EXISTS idx_trades_symbol_ts
    ON trades (symbol_id, ts_exchange_us);

CREATE TABLE IF NOT EXISTS depth_deltas (
    symbol_id           INTEGER NOT NULL,
    ts_exchange_us      INTEGER NOT NULL,
    ts_ingest_us        INTEGER NOT NULL,
    first_update_id     INTEGER NOT NULL,
    final_update_id     INTEGER NOT NULL,
    prev_final_update_id INTEGER,
    bids                TEXT,
    asks                TEXT,
    payload_z           BLOB,
    UNIQUE (symbol_id, ts_exchange_us, final_update_id)
);
CREATE INDEX IF NOT EXISTS idx_depth_symbol_ts
    ON depth_deltas (symbol_id, ts_exchange_us);
CREATE INDEX IF NOT EXISTS idx_depth_ts
    ON depth_deltas (ts_exchange_us);

CREATE TABLE IF NOT EXISTS mark_price (
    symbol_id            INTEGER NOT NULL,
    ts_exchange_us       INTEGER NOT NULL,
    ts_ingest_us         INTEGER NOT NULL,
    mark_price           REAL NOT NULL,
    index_price          REAL NOT NULL,
    funding_rate         REAL,
    next_funding_time_us INTEGER,
    UNIQUE (symbol_id, ts_exchange_us),
    CHECK (mark_price > 0 AND index_price > 0)
);
CREATE INDEX IF NOT EXISTS idx_mark_price_symbol_ts
    ON mark_price (symbol_id, ts_exchange_us);

CREATE TABLE IF NOT EXISTS force_orders (
    symbol_id      INTEGER NOT NULL,
    ts_exchange_us INTEGER NOT NULL,
    ts_ingest_us   INTEGER NOT NULL,
    side           TEXT NOT NULL,
    price          REAL NOT NULL,
    qty            REAL NOT NULL,
    raw            TEXT NOT NULL,
    UNIQUE (symbol_id, ts_exchange_us, side, price, qty),
    CHECK (price > 0 AND qty > 0)
);
CREATE INDEX IF NOT EXISTS idx_force_orders_symbol_ts
    ON force_orders (symbol_id, ts_exchange_us);

CREATE TABLE IF NOT EXISTS bt_1s (
    symbol_id    INTEGER NOT NULL,
    ts_second    INTEGER NOT NULL,
    open_mid     REAL NOT NULL,
    high_mid     REAL NOT NULL,
    low_mid      REAL NOT NULL,
    close_mid    REAL NOT NULL,
    mean_spread  REAL NOT NULL,
    min_spread   REAL NOT NULL,
    max_spread   REAL NOT NULL,
    update_count INTEGER NOT NULL,
    vw_mid       REAL NOT NULL,
    PRIMARY KEY (symbol_id, ts_second)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS trade_1s (
    symbol_id   INTEGER NOT NULL,
    ts_second   INTEGER NOT NULL,
    trade_count INTEGER NOT NULL,
    volume_sum  REAL NOT NULL,
    value_sum   REAL NOT NULL,
    vwap        REAL NOT NULL,
    buy_volume  REAL NOT NULL,
    sell_volume REAL NOT NULL,
    min_price   REAL NOT NULL,
    max_price   REAL NOT NULL,
    imbalance   REAL,
    PRIMARY KEY (symbol_id, ts_second)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS core_1s_24h (
    symbol_id    INTEGER NOT NULL,
    ts_second    INTEGER NOT NULL,
    mid_ffill    REAL,
    spread_ffill REAL,
    trade_count  INTEGER NOT NULL DEFAULT 0,
    volume_sum   REAL NOT NULL DEFAULT 0,
    vwap         REAL,
    update_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (symbol_id, ts_second)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS quarantine (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name    TEXT NOT NULL,
    payload_json  TEXT NOT NULL,
    reason        TEXT NOT NULL,
    quarantined_us INTEGER NOT NULL
);
"#;

// =============================================================================
// STORE
// =============================================================================

/// Handle to the SQLite store. Cloneable; all access funnels through one
/// connection behind a mutex, transactions are short-lived and per-batch.
#[derive(Clone)]
pub struct MarketStore {
    conn: Arc<Mutex<Connection>>,
}

/// Per-symbol row counts and last-seen timestamps over a window.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolWindowStats {
    pub symbol_id: i64,
    pub code: String,
    pub book_ticker: TableWindowStats,
    pub trades: TableWindowStats,
    pub depth: TableWindowStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TableWindowStats {
    pub count: u64,
    pub last_ts_us: Option<i64>,
}

impl MarketStore {
    /// Open or create the store at `path`.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating store directory for {path}"))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("opening store at {path}"))?;
        conn.execute_batch(SCHEMA).context("initializing schema")?;

        info!(path, "market_store_opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(v) => {
                conn.execute_batch("COMMIT")?;
                Ok(v)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Run a read-only closure on the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Reclaim space after large deletes.
    pub fn vacuum_incremental(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA incremental_vacuum;")
    }

    // =========================================================================
    // SYMBOLS
    // =========================================================================

    /// Insert-or-fetch a symbol row; returns the stable id.
    pub fn upsert_symbol(&self, sym: &Symbol, now_us: i64) -> rusqlite::Result<i64> {
        self.with_tx(|conn| {
            conn.execute(
                r#"
                INSERT INTO symbols (
                    venue, code, instrument_class, base_asset, quote_asset,
                    active, tick_size, lot_size, first_seen_us, last_seen_us
                ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?8)
                ON CONFLICT (venue, code) DO UPDATE SET last_seen_us = ?8
                "#,
                params![
                    sym.venue,
                    sym.code,
                    sym.instrument_class,
                    sym.base_asset,
                    sym.quote_asset,
                    sym.tick_size,
                    sym.lot_size,
                    now_us,
                ],
            )?;
            conn.query_row(
                "SELECT id FROM symbols WHERE venue = ?1 AND code = ?2",
                params![sym.venue, sym.code],
                |row| row.get(0),
            )
        })
    }

    pub fn load_symbols(&self) -> rusqlite::Result<Vec<Symbol>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, venue, code, instrument_class, base_asset, quote_asset,
                       active, tick_size, lot_size
                FROM symbols ORDER BY id
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Symbol {
                    id: row.get(0)?,
                    venue: row.get(1)?,
                    code: row.get(2)?,
                    instrument_class: row.get(3)?,
                    base_asset: row.get(4)?,
                    quote_asset: row.get(5)?,
                    active: row.get::<_, i64>(6)? != 0,
                    tick_size: row.get(7)?,
                    lot_size: row.get(8)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Symbols are never deleted, only deactivated.
    pub fn deactivate_symbol(&self, id: i64) -> rusqlite::Result<bool> {
        self.with_tx(|conn| {
            let n = conn.execute("UPDATE symbols SET active = 0 WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    // =========================================================================
    // RAW EVENT BULK WRITES
    // =========================================================================

    /// Bulk write book-ticker rows; duplicates (same uniqueness key) are
    /// ignored. Returns the number of rows actually inserted.
    pub fn insert_book_tickers(&self, rows: &[BookTickerRecord]) -> rusqlite::Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_tx(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT INTO book_ticker (
                    symbol_id, ts_exchange_us, ts_ingest_us, update_id,
                    best_bid, best_ask, bid_qty, ask_qty, spread, mid
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT (symbol_id, ts_exchange_us, update_id) DO NOTHING
                "#,
            )?;
            let mut inserted = 0;
            for r in rows {
                inserted += stmt.execute(params![
                    r.symbol_id,
                    r.ts_exchange_us,
                    r.ts_ingest_us,
                    r.update_id,
                    r.best_bid,
                    r.best_ask,
                    r.bid_qty,
                    r.ask_qty,
                    r.spread,
                    r.mid,
                ])?;
            }
            Ok(inserted)
        })
    }

    pub fn insert_trades(&self, rows: &[TradeRecord]) -> rusqlite::Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_tx(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT INTO trades (
                    symbol_id, agg_trade_id, ts_exchange_us, ts_ingest_us,
                    price, qty, buyer_is_maker
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (symbol_id, agg_trade_id) DO NOTHING
                "#,
            )?;
            let mut inserted = 0;
            for r in rows {
                inserted += stmt.execute(params![
                    r.symbol_id,
                    r.agg_trade_id,
                    r.ts_exchange_us,
                    r.ts_ingest_us,
                    r.price,
                    r.qty,
                    r.buyer_is_maker as i64,
                ])?;
            }
            Ok(inserted)
        })
    }

    pub fn insert_depth_deltas(&self, rows: &[DepthDeltaRecord]) -> rusqlite::Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_tx(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT INTO depth_deltas (
                    symbol_id, ts_exchange_us, ts_ingest_us,
                    first_update_id, final_update_id, prev_final_update_id,
                    bids, asks
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (symbol_id, ts_exchange_us, final_update_id) DO NOTHING
                "#,
            )?;
            let mut inserted = 0;
            for r in rows {
                let bids = levels_to_json(&r.bids);
                let asks = levels_to_json(&r.asks);
                inserted += stmt.execute(params![
                    r.symbol_id,
                    r.ts_exchange_us,
                    r.ts_ingest_us,
                    r.first_update_id,
                    r.final_update_id,
                    r.prev_final_update_id,
                    bids,
                    asks,
                ])?;
            }
            Ok(inserted)
        })
    }

    pub fn insert_mark_prices(&self, rows: &[MarkPriceRecord]) -> rusqlite::Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_tx(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT INTO mark_price (
                    symbol_id, ts_exchange_us, ts_ingest_us,
                    mark_price, index_price, funding_rate, next_funding_time_us
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (symbol_id, ts_exchange_us) DO NOTHING
                "#,
            )?;
            let mut inserted = 0;
            for r in rows {
                inserted += stmt.execute(params![
                    r.symbol_id,
                    r.ts_exchange_us,
                    r.ts_ingest_us,
                    r.mark_price,
                    r.index_price,
                    r.funding_rate,
                    r.next_funding_time_us,
                ])?;
            }
            Ok(inserted)
        })
    }

    pub fn insert_force_orders(&self, rows: &[ForceOrderRecord]) -> rusqlite::Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_tx(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT INTO force_orders (
                    symbol_id, ts_exchange_us, ts_ingest_us, side, price, qty, raw
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (symbol_id, ts_exchange_us, side, price, qty) DO NOTHING
                "#,
            )?;
            let mut inserted = 0;
            for r in rows {
                inserted += stmt.execute(params![
                    r.symbol_id,
                    r.ts_exchange_us,
                    r.ts_ingest_us,
                    r.side.as_str(),
                    r.price,
                    r.qty,
                    r.raw,
                ])?;
            }
            Ok(inserted)
        })
    }

    /// Park a poison row the writer could not commit.
    pub fn quarantine_row(
        &self,
        table: &str,
        payload_json: &str,
        reason: &str,
        now_us: i64,
    ) -> rusqlite::Result<()> {
        self.with_tx(|conn| {
            conn.execute(
                r#"
                INSERT INTO quarantine (table_name, payload_json, reason, quarantined_us)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![table, payload_json, reason, now_us],
            )?;
            Ok(())
        })
    }

    // =========================================================================
    // RANGE READS
    // =========================================================================

    pub fn fetch_book_tickers(
        &self,
        symbol_id: i64,
        from_us: i64,
        to_us: i64,
    ) -> rusqlite::Result<Vec<BookTickerRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"
                SELECT symbol_id, ts_exchange_us, ts_ingest_us, update_id,
                       best_bid, best_ask, bid_qty, ask_qty, spread, mid
                FROM book_ticker
                WHERE symbol_id = ?1 AND ts_exchange_us >= ?2 AND ts_exchange_us < ?3
                ORDER BY ts_exchange_us, update_id
                "#,
            )?;
            let rows = stmt.query_map(params![symbol_id, from_us, to_us], |row| {
                Ok(BookTickerRecord {
                    symbol_id: row.get(0)?,
                    ts_exchange_us: row.get(1)?,
                    ts_ingest_us: row.get(2)?,
                    update_id: row.get(3)?,
                    best_bid: row.get(4)?,
                    best_ask: row.get(5)?,
                    bid_qty: row.get(6)?,
                    ask_qty: row.get(7)?,
                    spread: row.get(8)?,
                    mid: row.get(9)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn fetch_trades(
        &self,
        symbol_id: i64,
        from_us: i64,
        to_us: i64,
    ) -> rusqlite::Result<Vec<TradeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"
                SELECT symbol_id, agg_trade_id, ts_exchange_us, ts_ingest_us,
                       price, qty, buyer_is_maker
                FROM trades
                WHERE symbol_id = ?1 AND ts_exchange_us >= ?2 AND ts_exchange_us < ?3
                ORDER BY ts_exchange_us, agg_trade_id
                "#,
            )?;
            let rows = stmt.query_map(params![symbol_id, from_us, to_us], |row| {
                Ok(TradeRecord {
                    symbol_id: row.get(0)?,
                    agg_trade_id: row.get(1)?,
                    ts_exchange_us: row.get(2)?,
                    ts_ingest_us: row.get(3)?,
                    price: row.get(4)?,
                    qty: row.get(5)?,
                    buyer_is_maker: row.get::<_, i64>(6)? != 0,
                })
            })?;
            rows.collect()
        })
    }

    /// Range read of depth deltas, inflating compressed payloads.
    pub fn fetch_depth_deltas(
        &self,
        symbol_id: i64,
        from_us: i64,
        to_us: i64,
    ) -> Result<Vec<DepthDeltaRecord>> {
        let raw: Vec<(DepthDeltaRecord, Option<String>, Option<String>, Option<Vec<u8>>)> =
            self.with_conn(|conn| {
                let mut stmt = conn.prepare_cached(
                    r#"
                    SELECT symbol_id, ts_exchange_us, ts_ingest_us,
                           first_update_id, final_update_id, prev_final_update_id,
                           bids, asks, payload_z
                    FROM depth_deltas
                    WHERE symbol_id = ?1 AND ts_exchange_us >= ?2 AND ts_exchange_us < ?3
                    ORDER BY ts_exchange_us, final_update_id
                    "#,
                )?;
                let rows = stmt.query_map(params![symbol_id, from_us, to_us], |row| {
                    Ok((
                        DepthDeltaRecord {
                            symbol_id: row.get(0)?,
                            ts_exchange_us: row.get(1)?,
                            ts_ingest_us: row.get(2)?,
                            first_update_id: row.get(3)?,
                            final_update_id: row.get(4)?,
                            prev_final_update_id: row.get(5)?,
                            bids: Vec::new(),
                            asks: Vec::new(),
                        },
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<Vec<u8>>>(8)?,
                    ))
                })?;
                rows.collect()
            })?;

        let mut out = Vec::with_capacity(raw.len());
        for (mut rec, bids, asks, payload_z) in raw {
            match (bids, asks, payload_z) {
                (Some(b), Some(a), _) => {
                    rec.bids = levels_from_json(&b)?;
                    rec.asks = levels_from_json(&a)?;
                }
                (_, _, Some(z)) => {
                    let (b, a) = retention::inflate_depth_payload(&z)?;
                    rec.bids = b;
                    rec.asks = a;
                }
                _ => {
                    return Err(anyhow::anyhow!(
                        "depth row without payload (symbol {}, final {})",
                        rec.symbol_id,
                        rec.final_update_id
                    ))
                }
            }
            out.push(rec);
        }
        Ok(out)
    }

    // =========================================================================
    // STATS
    // =========================================================================

    /// Per-symbol counts and last-seen timestamps for events with
    /// `ts_exchange` in the last `window_secs` seconds.
    pub fn window_stats(
        &self,
        now_us: i64,
        window_secs: i64,
    ) -> rusqlite::Result<Vec<SymbolWindowStats>> {
        let cutoff = now_us - window_secs * crate::models::US_PER_SEC;
        self.with_conn(|conn| {
            let mut by_symbol: HashMap<i64, SymbolWindowStats> = HashMap::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT id, code FROM symbols WHERE active = 1 ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (id, code) = row?;
                    by_symbol.insert(
                        id,
                        SymbolWindowStats {
                            symbol_id: id,
                            code,
                            book_ticker: TableWindowStats::default(),
                            trades: TableWindowStats::default(),
                            depth: TableWindowStats::default(),
                        },
                    );
                }
            }

            for (table, pick) in [
                ("book_ticker", 0usize),
                ("trades", 1),
                ("depth_deltas", 2),
            ] {
                let sql = format!(
                    "SELECT symbol_id, COUNT(*), MAX(ts_exchange_us)
                     FROM {table} WHERE ts_exchange_us >= ?1 GROUP BY symbol_id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![cutoff], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                })?;
                for row in rows {
                    let (id, count, last) = row?;
                    if let Some(stats) = by_symbol.get_mut(&id) {
                        let slot = match pick {
                            0 => &mut stats.book_ticker,
                            1 => &mut stats.trades,
                            _ => &mut stats.depth,
                        };
                        slot.count = count;
                        slot.last_ts_us = last;
                    }
                }
            }

            let mut out: Vec<_> = by_symbol.into_values().collect();
            out.sort_by_key(|s| s.symbol_id);
            Ok(out)
        })
    }

    /// Row count of a table, for maintenance and tests.
    pub fn count_rows(&self, table: &str) -> rusqlite::Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
        })
    }
}

pub(crate) fn levels_to_json(levels: &[[f64; 2]]) -> String {
    serde_json::to_string(levels).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn levels_from_json(s: &str) -> Result<Vec<[f64; 2]>> {
    serde_json::from_str(s).context("decoding depth levels")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_us;

    fn test_symbol(code: &str) -> Symbol {
        Symbol {
            id: 0,
            venue: "binance-futures".into(),
            code: code.into(),
            instrument_class: "perpetual".into(),
            base_asset: code.trim_end_matches("USDT").into(),
            quote_asset: "USDT".into(),
            active: true,
            tick_size: None,
            lot_size: None,
        }
    }

    fn bt(symbol_id: i64, ts_us: i64, update_id: i64, bid: f64, ask: f64) -> BookTickerRecord {
        BookTickerRecord {
            symbol_id,
            ts_exchange_us: ts_us,
            ts_ingest_us: ts_us + 500,
            update_id,
            best_bid: bid,
            best_ask: ask,
            bid_qty: 1.0,
            ask_qty: 2.0,
            spread: ask - bid,
            mid: (ask + bid) / 2.0,
        }
    }

    #[test]
    fn test_symbol_id_stable() {
        let store = MarketStore::open_memory().unwrap();
        let id1 = store.upsert_symbol(&test_symbol("BTCUSDT"), now_us()).unwrap();
        let id2 = store.upsert_symbol(&test_symbol("ETHUSDT"), now_us()).unwrap();
        let id1_again = store.upsert_symbol(&test_symbol("BTCUSDT"), now_us()).unwrap();
        assert_eq!(id1, id1_again);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_deactivate_keeps_row() {
        let store = MarketStore::open_memory().unwrap();
        let id = store.upsert_symbol(&test_symbol("BTCUSDT"), now_us()).unwrap();
        assert!(store.deactivate_symbol(id).unwrap());
        let symbols = store.load_symbols().unwrap();
        assert_eq!(symbols.len(), 1);
        assert!(!symbols[0].active);
    }

    #[test]
    fn test_duplicate_book_tickers_ignored() {
        let store = MarketStore::open_memory().unwrap();
        let id = store.upsert_symbol(&test_symbol("BTCUSDT"), now_us()).unwrap();

        let rows = vec![bt(id, 1_000_000, 1, 100.0, 101.0), bt(id, 2_000_000, 2, 100.5, 101.5)];
        assert_eq!(store.insert_book_tickers(&rows).unwrap(), 2);
        // Redelivery of the same rows inserts nothing.
        assert_eq!(store.insert_book_tickers(&rows).unwrap(), 0);
        assert_eq!(store.count_rows("book_ticker").unwrap(), 2);
    }

    #[test]
    fn test_inverted_book_rejected_by_check() {
        let store = MarketStore::open_memory().unwrap();
        let id = store.upsert_symbol(&test_symbol("BTCUSDT"), now_us()).unwrap();

        let bad = vec![bt(id, 1_000_000, 1, 101.0, 100.0)];
        let err = store.insert_book_tickers(&bad).unwrap_err();
        assert!(crate::error::is_constraint_violation(&err));
        assert_eq!(store.count_rows("book_ticker").unwrap(), 0);
    }

    #[test]
    fn test_trade_duplicates_by_agg_id() {
        let store = MarketStore::open_memory().unwrap();
        let id = store.upsert_symbol(&test_symbol("BTCUSDT"), now_us()).unwrap();

        let t = TradeRecord {
            symbol_id: id,
            agg_trade_id: 42,
            ts_exchange_us: 1_000_000,
            ts_ingest_us: 1_000_500,
            price: 100.0,
            qty: 0.5,
            buyer_is_maker: false,
        };
        assert_eq!(store.insert_trades(&[t.clone()]).unwrap(), 1);
        assert_eq!(store.insert_trades(&[t]).unwrap(), 0);
    }

    #[test]
    fn test_depth_roundtrip() {
        let store = MarketStore::open_memory().unwrap();
        let id = store.upsert_symbol(&test_symbol("BTCUSDT"), now_us()).unwrap();

        let rec = DepthDeltaRecord {
            symbol_id: id,
            ts_exchange_us: 5_000_000,
            ts_ingest_us: 5_000_400,
            first_update_id: 10,
            final_update_id: 12,
            prev_final_update_id: Some(9),
            bids: vec![[100.0, 1.5], [99.5, 0.0]],
            asks: vec![[100.5, 2.0]],
        };
        assert_eq!(store.insert_depth_deltas(&[rec.clone()]).unwrap(), 1);

        let back = store.fetch_depth_deltas(id, 0, 10_000_000).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].bids, rec.bids);
        assert_eq!(back[0].asks, rec.asks);
        assert_eq!(back[0].prev_final_update_id, Some(9));
    }

    #[test]
    fn test_window_stats() {
        let store = MarketStore::open_memory().unwrap();
        let id = store.upsert_symbol(&test_symbol("BTCUSDT"), now_us()).unwrap();

        let now = now_us();
        store
            .insert_book_tickers(&[bt(id, now - 10 * 1_000_000, 1, 100.0, 101.0)])
            .unwrap();

        let stats = store.window_stats(now, 60).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].book_ticker.count, 1);
        assert_eq!(stats[0].trades.count, 0);

        // Outside a 5-second window nothing shows up.
        let stats = store.window_stats(now, 5).unwrap();
        assert_eq!(stats[0].book_ticker.count, 0);
    }
}
