//! Retention and compression: age-based range maintenance per table.
//!
//! The engine has no native time-partitioned chunks, so the equivalent jobs
//! run here: `drop_after` deletes rows past the age limit in bounded batches
//! (short transactions), `compress_after` re-encodes aged depth payloads
//! into a deflate blob and nulls the verbatim JSON columns. Readers inflate
//! transparently. Policies for one table never run concurrently: a single
//! worker executes them in sequence. Every policy run reports its outcome
//! to telemetry.
//!
//! Defaults: raw book/trade 30 days, depth 7 days, aggregates 180 days,
//! depth compression after 1 day. Aggregate rows are plain scalars with no
//! compressible payload on this engine, so their compress-after age is not
//! applicable and only the drop policy applies.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rusqlite::params;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::{now_us, US_PER_SEC};
use crate::store::MarketStore;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

const DAY: Duration = Duration::from_secs(24 * 3600);

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct TablePolicy {
    pub table: &'static str,
    /// Time column: microseconds for raw tables, epoch seconds for
    /// aggregates.
    pub ts_column: &'static str,
    pub ts_is_seconds: bool,
    pub drop_after: Option<Duration>,
    pub compress_after: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub policies: Vec<TablePolicy>,
    /// How often the worker wakes up.
    pub interval: Duration,
    /// Max rows removed or compressed per transaction.
    pub batch_rows: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        let policy = |table, drop_days: u32| TablePolicy {
            table,
            ts_column: "ts_exchange_us",
            ts_is_seconds: false,
            drop_after: Some(DAY * drop_days),
            compress_after: None,
        };
        let agg_policy = |table| TablePolicy {
            table,
            ts_column: "ts_second",
            ts_is_seconds: true,
            drop_after: Some(DAY * 180),
            compress_after: None,
        };
        Self {
            policies: vec![
                policy("book_ticker", 30),
                policy("trades", 30),
                TablePolicy {
                    table: "depth_deltas",
                    ts_column: "ts_exchange_us",
                    ts_is_seconds: false,
                    drop_after: Some(DAY * 7),
                    compress_after: Some(DAY),
                },
                policy("mark_price", 30),
                policy("force_orders", 30),
                agg_policy("bt_1s"),
                agg_policy("trade_1s"),
            ],
            interval: Duration::from_secs(3600),
            batch_rows: 20_000,
        }
    }
}

impl RetentionConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("RETENTION_INTERVAL_SECS") {
            if let Ok(s) = v.parse() {
                cfg.interval = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("DEPTH_COMPRESS_AFTER_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                let compress = if s == 0 { None } else { Some(Duration::from_secs(s)) };
                for p in cfg.policies.iter_mut().filter(|p| p.table == "depth_deltas") {
                    p.compress_after = compress;
                }
            }
        }
        cfg
    }
}

// =============================================================================
// PAYLOAD COMPRESSION
// =============================================================================

/// Deflate-encode a depth payload: `{"b":[...],"a":[...]}`.
pub fn deflate_depth_payload(bids: &str, asks: &str) -> anyhow::Result<Vec<u8>> {
    let combined = format!(r#"{{"b":{bids},"a":{asks}}}"#);
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(combined.as_bytes())?;
    Ok(encoder.finish()?)
}

/// Inverse of [`deflate_depth_payload`].
pub fn inflate_depth_payload(data: &[u8]) -> anyhow::Result<(Vec<[f64; 2]>, Vec<[f64; 2]>)> {
    let mut decoder = DeflateDecoder::new(data);
    let mut raw = String::new();
    decoder.read_to_string(&mut raw)?;

    #[derive(serde::Deserialize)]
    struct Payload {
        b: Vec<[f64; 2]>,
        a: Vec<[f64; 2]>,
    }
    let payload: Payload = serde_json::from_str(&raw)?;
    Ok((payload.b, payload.a))
}

// =============================================================================
// POLICY EXECUTION
// =============================================================================

/// Delete rows older than `cutoff` in bounded batches. Returns rows removed.
pub fn drop_older_than(
    store: &MarketStore,
    policy: &TablePolicy,
    cutoff: i64,
    batch_rows: usize,
) -> rusqlite::Result<u64> {
    let mut total = 0u64;
    loop {
        let removed = store.with_tx(|conn| {
            if policy.ts_is_seconds {
                // Aggregates are WITHOUT ROWID; delete by key range directly.
                conn.execute(
                    &format!(
                        "DELETE FROM {} WHERE {} < ?1",
                        policy.table, policy.ts_column
                    ),
                    params![cutoff],
                )
            } else {
                conn.execute(
                    &format!(
                        "DELETE FROM {table} WHERE rowid IN (
                             SELECT rowid FROM {table} WHERE {col} < ?1 LIMIT ?2
                         )",
                        table = policy.table,
                        col = policy.ts_column,
                    ),
                    params![cutoff, batch_rows as i64],
                )
            }
        })?;
        total += removed as u64;
        if policy.ts_is_seconds || removed < batch_rows {
            break;
        }
    }
    Ok(total)
}

/// Compress one batch of aged depth rows that still carry verbatim JSON.
/// Returns rows compressed; call repeatedly until it returns 0.
pub fn compress_depth_batch(
    store: &MarketStore,
    cutoff_us: i64,
    batch_rows: usize,
) -> anyhow::Result<u64> {
    let candidates: Vec<(i64, String, String)> = store.with_conn(|conn| {
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT rowid, bids, asks FROM depth_deltas
            WHERE ts_exchange_us < ?1 AND payload_z IS NULL AND bids IS NOT NULL
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![cutoff_us, batch_rows as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect()
    })?;

    if candidates.is_empty() {
        return Ok(0);
    }

    let mut encoded = Vec::with_capacity(candidates.len());
    for (rowid, bids, asks) in &candidates {
        encoded.push((*rowid, deflate_depth_payload(bids, asks)?));
    }

    store.with_tx(|conn| {
        let mut stmt = conn.prepare_cached(
            "UPDATE depth_deltas SET payload_z = ?2, bids = NULL, asks = NULL WHERE rowid = ?1",
        )?;
        for (rowid, blob) in &encoded {
            stmt.execute(params![rowid, blob])?;
        }
        Ok(())
    })?;
    Ok(encoded.len() as u64)
}

/// One full pass over all policies. Public so tests can drive it directly.
pub fn run_policies(
    store: &MarketStore,
    cfg: &RetentionConfig,
    telemetry: &TelemetryBus,
    now_us: i64,
) -> anyhow::Result<()> {
    let mut dropped_total = 0u64;

    for policy in &cfg.policies {
        if let Some(age) = policy.compress_after {
            if policy.table == "depth_deltas" {
                let cutoff = now_us - age.as_micros() as i64;
                let started = Instant::now();
                let mut compressed = 0u64;
                loop {
                    let n = compress_depth_batch(store, cutoff, cfg.batch_rows)?;
                    compressed += n;
                    if n == 0 {
                        break;
                    }
                }
                telemetry.publish(TelemetryEvent::Retention {
                    table: policy.table.into(),
                    policy: "compress",
                    rows: compressed,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                if compressed > 0 {
                    info!(table = policy.table, compressed, "depth_payloads_compressed");
                }
            }
        }

        if let Some(age) = policy.drop_after {
            let cutoff = if policy.ts_is_seconds {
                (now_us - age.as_micros() as i64) / US_PER_SEC
            } else {
                now_us - age.as_micros() as i64
            };
            let started = Instant::now();
            let dropped = drop_older_than(store, policy, cutoff, cfg.batch_rows)?;
            dropped_total += dropped;
            telemetry.publish(TelemetryEvent::Retention {
                table: policy.table.into(),
                policy: "drop",
                rows: dropped,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            if dropped > 0 {
                info!(table = policy.table, dropped, "aged_rows_dropped");
            }
        }
    }

    if dropped_total > 0 {
        store.vacuum_incremental()?;
    }
    Ok(())
}

// =============================================================================
// WORKER
// =============================================================================

pub struct RetentionManager;

impl RetentionManager {
    pub fn spawn(
        store: MarketStore,
        cfg: RetentionConfig,
        telemetry: TelemetryBus,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cfg.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup isn't
            // dominated by maintenance.
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = run_policies(&store, &cfg, &telemetry, now_us()) {
                            warn!(error = %e, "retention_pass_failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DepthDeltaRecord;
    use crate::registry::{SymbolRegistry, VENUE};

    fn setup() -> (MarketStore, i64) {
        let store = MarketStore::open_memory().unwrap();
        let registry = SymbolRegistry::new(store.clone()).unwrap();
        let id = registry.resolve(VENUE, "BTCUSDT").unwrap();
        (store, id)
    }

    fn depth(symbol_id: i64, ts_us: i64, final_id: i64) -> DepthDeltaRecord {
        DepthDeltaRecord {
            symbol_id,
            ts_exchange_us: ts_us,
            ts_ingest_us: ts_us,
            first_update_id: final_id - 1,
            final_update_id: final_id,
            prev_final_update_id: Some(final_id - 2),
            bids: vec![[100.0, 1.0], [99.5, 2.5]],
            asks: vec![[100.5, 3.0]],
        }
    }

    #[test]
    fn test_payload_roundtrip() {
        let blob = deflate_depth_payload("[[100.0,1.0]]", "[[100.5,2.0]]").unwrap();
        let (bids, asks) = inflate_depth_payload(&blob).unwrap();
        assert_eq!(bids, vec![[100.0, 1.0]]);
        assert_eq!(asks, vec![[100.5, 2.0]]);
    }

    #[test]
    fn test_compress_then_read_back() {
        let (store, id) = setup();
        let now = now_us();
        let old_ts = now - 2 * DAY.as_micros() as i64;
        let fresh_ts = now - 1000;

        store
            .insert_depth_deltas(&[depth(id, old_ts, 10), depth(id, fresh_ts, 20)])
            .unwrap();

        let cutoff = now - DAY.as_micros() as i64;
        assert_eq!(compress_depth_batch(&store, cutoff, 100).unwrap(), 1);
        // Second pass finds nothing left to compress.
        assert_eq!(compress_depth_batch(&store, cutoff, 100).unwrap(), 0);

        // Reads inflate transparently and levels survive byte-for-byte.
        let rows = store.fetch_depth_deltas(id, 0, now + 1).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bids, vec![[100.0, 1.0], [99.5, 2.5]]);
        assert_eq!(rows[1].bids, vec![[100.0, 1.0], [99.5, 2.5]]);
    }

    #[test]
    fn test_drop_after_removes_only_aged_rows() {
        let (store, id) = setup();
        let now = now_us();
        let policy = TablePolicy {
            table: "depth_deltas",
            ts_column: "ts_exchange_us",
            ts_is_seconds: false,
            drop_after: Some(DAY * 7),
            compress_after: None,
        };

        store
            .insert_depth_deltas(&[
                depth(id, now - 8 * DAY.as_micros() as i64, 10),
                depth(id, now - 6 * DAY.as_micros() as i64, 20),
            ])
            .unwrap();

        let cutoff = now - 7 * DAY.as_micros() as i64;
        // Tiny batch size exercises the bounded-delete loop.
        assert_eq!(drop_older_than(&store, &policy, cutoff, 1).unwrap(), 1);
        assert_eq!(store.count_rows("depth_deltas").unwrap(), 1);
    }

    #[test]
    fn test_full_pass_reports_outcomes() {
        let (store, id) = setup();
        let telemetry = TelemetryBus::new();
        let mut rx = telemetry.subscribe();
        let now = now_us();

        store
            .insert_depth_deltas(&[depth(id, now - 8 * DAY.as_micros() as i64, 10)])
            .unwrap();

        run_policies(&store, &RetentionConfig::default(), &telemetry, now).unwrap();
        assert_eq!(store.count_rows("depth_deltas").unwrap(), 0);

        let mut drop_events = 0;
        let mut compress_events = 0;
        while let Ok(ev) = rx.try_recv() {
            if let TelemetryEvent::Retention { policy, .. } = ev {
                match policy {
                    "drop" => drop_events += 1,
                    "compress" => compress_events += 1,
                    _ => {}
                }
            }
        }
        // One drop outcome per table policy, one compress outcome for depth.
        assert_eq!(drop_events, 7);
        assert_eq!(compress_events, 1);
    }
}
