//! Symbol registry: canonical (venue, code) → stable numeric id.
//!
//! Ids are assigned by the store and never reused; rows are created lazily
//! when a symbol is first configured or observed, and are deactivated rather
//! than deleted. Resolution is O(1) after warm-up through an in-memory cache
//! (many readers, single writer). On store unavailability resolution fails
//! fast and the caller's buffering absorbs the pause.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::IngestError;
use crate::models::{now_us, Symbol};
use crate::store::MarketStore;

/// Default venue tag for this deployment.
pub const VENUE: &str = "binance-futures";

/// Quote assets recognized when splitting a code into base/quote.
const QUOTE_ASSETS: &[&str] = &["USDT", "USDC", "BUSD", "BTC", "ETH"];

#[derive(Clone)]
pub struct SymbolRegistry {
    store: MarketStore,
    cache: Arc<RwLock<HashMap<(String, String), i64>>>,
}

impl SymbolRegistry {
    /// Build the registry and warm the cache from the store.
    pub fn new(store: MarketStore) -> Result<Self, IngestError> {
        let registry = Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
        };
        registry.warm_up()?;
        Ok(registry)
    }

    fn warm_up(&self) -> Result<(), IngestError> {
        let symbols = self.store.load_symbols()?;
        let mut cache = self.cache.write();
        for s in &symbols {
            cache.insert((s.venue.clone(), s.code.clone()), s.id);
        }
        debug!(count = symbols.len(), "symbol_cache_warmed");
        Ok(())
    }

    /// Resolve a (venue, code) pair to its id, creating the row if missing.
    pub fn resolve(&self, venue: &str, code: &str) -> Result<i64, IngestError> {
        let key = (venue.to_string(), code.to_uppercase());
        if let Some(&id) = self.cache.read().get(&key) {
            return Ok(id);
        }

        let (base, quote) = split_code(&key.1);
        let sym = Symbol {
            id: 0,
            venue: key.0.clone(),
            code: key.1.clone(),
            instrument_class: "perpetual".into(),
            base_asset: base,
            quote_asset: quote,
            active: true,
            tick_size: None,
            lot_size: None,
        };
        let id = self.store.upsert_symbol(&sym, now_us())?;
        self.cache.write().insert(key, id);
        Ok(id)
    }

    /// All active symbols, in id order.
    pub fn list_active(&self) -> Result<Vec<Symbol>, IngestError> {
        let symbols = self.store.load_symbols()?;
        Ok(symbols.into_iter().filter(|s| s.active).collect())
    }

    /// Deactivate a symbol; its id and history remain.
    pub fn deactivate(&self, id: i64) -> Result<bool, IngestError> {
        Ok(self.store.deactivate_symbol(id)?)
    }

    /// Register the configured universe up front so ids exist before the
    /// first frame arrives.
    pub fn register_universe(&self, codes: &[String]) -> Result<Vec<i64>, IngestError> {
        codes.iter().map(|c| self.resolve(VENUE, c)).collect()
    }
}

/// Split a venue code like BTCUSDT into (BTC, USDT). Falls back to the whole
/// code as base when no known quote suffix matches.
fn split_code(code: &str) -> (String, String) {
    for quote in QUOTE_ASSETS {
        if let Some(base) = code.strip_suffix(quote) {
            if !base.is_empty() {
                return (base.to_string(), quote.to_string());
            }
        }
    }
    (code.to_string(), String::new())
}
