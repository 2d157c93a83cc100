//! Validator: freshness, structure, quality and frequency checks against
//! the configured SLO.
//!
//! Read-only over committed rows; validation failures are surfaced here and
//! on the telemetry bus but never block ingestion. Structure and quality
//! lean on the store's CHECK constraints: a violating row can't be
//! committed, so these scans confirm the invariants hold rather than hunt
//! for expected breakage.

use rusqlite::params;
use serde::Serialize;
use std::time::Duration;

use crate::models::{now_us, US_PER_SEC};
use crate::store::MarketStore;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

// =============================================================================
// SLO
// =============================================================================

#[derive(Debug, Clone)]
pub struct SloConfig {
    /// Max age of the newest event per symbol.
    pub freshness: Duration,
    /// Window scanned for quality violations.
    pub quality_window: Duration,
    /// Frequency check: at least one event per minute over this window.
    pub frequency_window: Duration,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(5 * 60),
            quality_window: Duration::from_secs(3600),
            frequency_window: Duration::from_secs(10 * 60),
        }
    }
}

// =============================================================================
// VERDICTS
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SymbolVerdict {
    pub symbol_id: i64,
    pub code: String,
    pub freshness_ok: bool,
    pub structure_ok: bool,
    pub quality_ok: bool,
    pub frequency_ok: bool,
    /// Age of the newest event in seconds; None when nothing was ever seen.
    pub last_event_age_secs: Option<i64>,
    pub active_minutes: i64,
    pub quality_violations: u64,
}

impl SymbolVerdict {
    pub fn passed(&self) -> bool {
        self.freshness_ok && self.structure_ok && self.quality_ok && self.frequency_ok
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub checked: usize,
    pub failing: usize,
    pub symbols: Vec<SymbolVerdict>,
}

// =============================================================================
// VALIDATOR
// =============================================================================

pub struct Validator {
    store: MarketStore,
    slo: SloConfig,
}

impl Validator {
    pub fn new(store: MarketStore, slo: SloConfig) -> Self {
        Self { store, slo }
    }

    /// Validate every active symbol and publish the aggregate outcome.
    pub fn run(&self, telemetry: &TelemetryBus) -> anyhow::Result<ValidationReport> {
        let report = self.run_at(now_us())?;
        telemetry.publish(TelemetryEvent::ValidationResult {
            passed: report.passed,
            failing_symbols: report.failing,
        });
        Ok(report)
    }

    /// Validation at an explicit instant (deterministic for tests).
    pub fn run_at(&self, now_us: i64) -> anyhow::Result<ValidationReport> {
        let symbols = self.store.load_symbols()?;
        let mut verdicts = Vec::new();

        for sym in symbols.into_iter().filter(|s| s.active) {
            verdicts.push(self.check_symbol(sym.id, sym.code, now_us)?);
        }

        let failing = verdicts.iter().filter(|v| !v.passed()).count();
        Ok(ValidationReport {
            passed: failing == 0,
            checked: verdicts.len(),
            failing,
            symbols: verdicts,
        })
    }

    fn check_symbol(
        &self,
        symbol_id: i64,
        code: String,
        now_us: i64,
    ) -> anyhow::Result<SymbolVerdict> {
        let freshness_cutoff = now_us - self.slo.freshness.as_micros() as i64;
        let quality_cutoff = now_us - self.slo.quality_window.as_micros() as i64;
        let frequency_cutoff = now_us - self.slo.frequency_window.as_micros() as i64;
        let frequency_minutes = (self.slo.frequency_window.as_secs() / 60) as i64;

        let (last_event_us, active_minutes, quality_violations, structure_violations) =
            self.store.with_conn(|conn| {
                // Newest event across the core raw tables.
                let last_event_us: Option<i64> = conn.query_row(
                    r#"
                    SELECT MAX(ts) FROM (
                        SELECT MAX(ts_exchange_us) AS ts FROM book_ticker WHERE symbol_id = ?1
                        UNION ALL
                        SELECT MAX(ts_exchange_us) FROM trades WHERE symbol_id = ?1
                        UNION ALL
                        SELECT MAX(ts_exchange_us) FROM depth_deltas WHERE symbol_id = ?1
                    )
                    "#,
                    params![symbol_id],
                    |row| row.get(0),
                )?;

                // Distinct minutes with at least one event in the window.
                let active_minutes: i64 = conn.query_row(
                    r#"
                    SELECT COUNT(DISTINCT minute) FROM (
                        SELECT ts_exchange_us / 60000000 AS minute FROM book_ticker
                        WHERE symbol_id = ?1 AND ts_exchange_us >= ?2
                        UNION
                        SELECT ts_exchange_us / 60000000 FROM trades
                        WHERE symbol_id = ?1 AND ts_exchange_us >= ?2
                        UNION
                        SELECT ts_exchange_us / 60000000 FROM depth_deltas
                        WHERE symbol_id = ?1 AND ts_exchange_us >= ?2
                    )
                    "#,
                    params![symbol_id, frequency_cutoff],
                    |row| row.get(0),
                )?;

                // Inverted books or non-positive prices/quantities in the
                // last hour. CHECK constraints make this 0 by construction.
                let quality_violations: u64 = conn.query_row(
                    r#"
                    SELECT
                        (SELECT COUNT(*) FROM book_ticker
                         WHERE symbol_id = ?1 AND ts_exchange_us >= ?2
                           AND (best_ask < best_bid OR best_bid <= 0)) +
                        (SELECT COUNT(*) FROM trades
                         WHERE symbol_id = ?1 AND ts_exchange_us >= ?2
                           AND (price <= 0 OR qty <= 0))
                    "#,
                    params![symbol_id, quality_cutoff],
                    |row| row.get(0),
                )?;

                // Mandatory columns present (NOT NULL enforces this; scan
                // for rows that lost required derived fields).
                let structure_violations: u64 = conn.query_row(
                    r#"
                    SELECT COUNT(*) FROM book_ticker
                    WHERE symbol_id = ?1 AND ts_exchange_us >= ?2
                      AND (mid IS NULL OR spread IS NULL)
                    "#,
                    params![symbol_id, quality_cutoff],
                    |row| row.get(0),
                )?;

                Ok((last_event_us, active_minutes, quality_violations, structure_violations))
            })?;

        let freshness_ok = last_event_us.map(|ts| ts >= freshness_cutoff).unwrap_or(false);
        Ok(SymbolVerdict {
            symbol_id,
            code,
            freshness_ok,
            structure_ok: structure_violations == 0,
            quality_ok: quality_violations == 0,
            frequency_ok: active_minutes >= frequency_minutes,
            last_event_age_secs: last_event_us.map(|ts| (now_us - ts) / US_PER_SEC),
            active_minutes,
            quality_violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookTickerRecord;
    use crate::registry::{SymbolRegistry, VENUE};

    fn bt(symbol_id: i64, ts_us: i64, update_id: i64) -> BookTickerRecord {
        BookTickerRecord {
            symbol_id,
            ts_exchange_us: ts_us,
            ts_ingest_us: ts_us,
            update_id,
            best_bid: 100.0,
            best_ask: 101.0,
            bid_qty: 1.0,
            ask_qty: 1.0,
            spread: 1.0,
            mid: 100.5,
        }
    }

    /// One event per minute for the whole frequency window.
    fn feed_minutes(store: &MarketStore, id: i64, now: i64, minutes: i64) {
        let rows: Vec<BookTickerRecord> = (0..minutes)
            .map(|m| bt(id, now - m * 60 * US_PER_SEC, m))
            .collect();
        store.insert_book_tickers(&rows).unwrap();
    }

    #[test]
    fn test_fresh_symbol_passes() {
        let store = MarketStore::open_memory().unwrap();
        let registry = SymbolRegistry::new(store.clone()).unwrap();
        let id = registry.resolve(VENUE, "BTCUSDT").unwrap();
        let now = now_us();
        feed_minutes(&store, id, now, 10);

        let validator = Validator::new(store, SloConfig::default());
        let report = validator.run_at(now).unwrap();
        assert!(report.passed);
        assert_eq!(report.checked, 1);
        let v = &report.symbols[0];
        assert!(v.freshness_ok && v.frequency_ok && v.quality_ok && v.structure_ok);
    }

    #[test]
    fn test_idle_symbol_fails_freshness_only_for_itself() {
        let store = MarketStore::open_memory().unwrap();
        let registry = SymbolRegistry::new(store.clone()).unwrap();
        let btc = registry.resolve(VENUE, "BTCUSDT").unwrap();
        let eth = registry.resolve(VENUE, "ETHUSDT").unwrap();
        let now = now_us();

        feed_minutes(&store, btc, now, 10);
        // ETH idle for six minutes: events exist but the newest is stale.
        feed_minutes(&store, eth, now - 6 * 60 * US_PER_SEC, 10);

        let validator = Validator::new(store, SloConfig::default());
        let report = validator.run_at(now).unwrap();
        assert!(!report.passed);
        assert_eq!(report.failing, 1);

        let eth_verdict = report.symbols.iter().find(|v| v.code == "ETHUSDT").unwrap();
        assert!(!eth_verdict.freshness_ok);
        assert!(eth_verdict.last_event_age_secs.unwrap() >= 360);
        let btc_verdict = report.symbols.iter().find(|v| v.code == "BTCUSDT").unwrap();
        assert!(btc_verdict.passed());
    }

    #[test]
    fn test_sparse_symbol_fails_frequency() {
        let store = MarketStore::open_memory().unwrap();
        let registry = SymbolRegistry::new(store.clone()).unwrap();
        let id = registry.resolve(VENUE, "BTCUSDT").unwrap();
        let now = now_us();

        // Fresh but only three active minutes out of ten.
        feed_minutes(&store, id, now, 3);

        let validator = Validator::new(store, SloConfig::default());
        let report = validator.run_at(now).unwrap();
        let v = &report.symbols[0];
        assert!(v.freshness_ok);
        assert!(!v.frequency_ok);
        assert!(!report.passed);
    }

    #[test]
    fn test_never_seen_symbol_fails_freshness() {
        let store = MarketStore::open_memory().unwrap();
        let registry = SymbolRegistry::new(store.clone()).unwrap();
        registry.resolve(VENUE, "BTCUSDT").unwrap();

        let validator = Validator::new(store, SloConfig::default());
        let report = validator.run_at(now_us()).unwrap();
        let v = &report.symbols[0];
        assert!(!v.freshness_ok);
        assert!(v.last_event_age_secs.is_none());
    }
}
