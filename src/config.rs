//! Process configuration and Start-time ingest configuration.
//!
//! Everything is an explicit struct: process options come from the
//! environment (`.env` honored) with typed defaults, ingest options come
//! from the Start request and are validated synchronously before any state
//! changes. There is no ambient mutation of configuration at runtime.

use serde::{Deserialize, Serialize};
use std::env;

use crate::error::IngestError;
use crate::models::Channel;

/// Default venue endpoints (USDⓈ-M futures).
pub const DEFAULT_WS_BASE: &str = "wss://fstream.binance.com";
pub const DEFAULT_REST_BASE: &str = "https://fapi.binance.com";

// =============================================================================
// CHANNEL SET
// =============================================================================

/// Which channels a pipeline run subscribes to. bookTicker, aggTrade and
/// depth are the required core; markPrice and forceOrder are optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSet {
    pub book_ticker: bool,
    pub agg_trade: bool,
    pub depth: bool,
    pub mark_price: bool,
    pub force_order: bool,
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self {
            book_ticker: true,
            agg_trade: true,
            depth: true,
            mark_price: false,
            force_order: false,
        }
    }
}

impl ChannelSet {
    pub fn contains(&self, ch: Channel) -> bool {
        match ch {
            Channel::BookTicker => self.book_ticker,
            Channel::AggTrade => self.agg_trade,
            Channel::Depth => self.depth,
            Channel::MarkPrice => self.mark_price,
            Channel::ForceOrder => self.force_order,
        }
    }

    pub fn enable(&mut self, ch: Channel) {
        match ch {
            Channel::BookTicker => self.book_ticker = true,
            Channel::AggTrade => self.agg_trade = true,
            Channel::Depth => self.depth = true,
            Channel::MarkPrice => self.mark_price = true,
            Channel::ForceOrder => self.force_order = true,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        Channel::ALL.iter().copied().filter(|ch| self.contains(*ch))
    }

    /// Parse an explicit channel list (Start request). Unknown names are a
    /// configuration error, not a warning.
    pub fn from_names(names: &[String]) -> Result<Self, IngestError> {
        let mut set = Self {
            book_ticker: false,
            agg_trade: false,
            depth: false,
            mark_price: false,
            force_order: false,
        };
        for name in names {
            let ch = Channel::parse(name)
                .ok_or_else(|| IngestError::config(format!("unknown channel: {name}")))?;
            set.enable(ch);
        }
        Ok(set)
    }

    /// Parse the CHANNELS env flag list, which toggles the optional channels
    /// on top of the required core.
    pub fn from_env_flags(value: &str) -> Result<Self, IngestError> {
        let mut set = Self::default();
        for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let ch = Channel::parse(name)
                .ok_or_else(|| IngestError::config(format!("unknown channel: {name}")))?;
            set.enable(ch);
        }
        Ok(set)
    }
}

// =============================================================================
// INGEST CONFIG (per Start)
// =============================================================================

/// Shard-plan knobs a Start request may override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardPlanOverride {
    /// Hard cap on streams multiplexed over one connection.
    pub max_streams_per_connection: Option<usize>,
    /// Number of symbols treated as the top liquidity tier.
    pub tier0_size: Option<usize>,
    /// Target shard count per channel class (uniform chunks, no tiering).
    pub shard_count: Option<usize>,
}

/// Configuration of one pipeline run. Produced by validating a Start request
/// against the process defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Symbol universe in liquidity order (most liquid first).
    pub symbols: Vec<String>,
    pub channels: ChannelSet,
    pub max_streams_per_connection: usize,
    pub tier0_size: usize,
    /// When set, partitions each channel class into this many shards
    /// instead of tier-based sizing.
    pub shard_count: Option<usize>,
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.symbols.is_empty() {
            return Err(IngestError::config("symbol universe is empty"));
        }
        if self.channels.iter().next().is_none() {
            return Err(IngestError::config("no channels enabled"));
        }
        if self.max_streams_per_connection == 0 {
            return Err(IngestError::config("max_streams_per_connection must be > 0"));
        }
        if self.shard_count == Some(0) {
            return Err(IngestError::config("shard count must be > 0"));
        }
        let mut seen = std::collections::HashSet::new();
        for s in &self.symbols {
            if s.trim().is_empty() {
                return Err(IngestError::config("empty symbol code"));
            }
            if !seen.insert(s.to_uppercase()) {
                return Err(IngestError::config(format!("duplicate symbol: {s}")));
            }
        }
        Ok(())
    }
}

/// Body of the Start control operation. Omitted fields fall back to the
/// process configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    pub symbols: Option<Vec<String>>,
    pub channels: Option<Vec<String>>,
    pub log_level: Option<String>,
    pub shard_plan: Option<ShardPlanOverride>,
}

// =============================================================================
// APP CONFIG (process)
// =============================================================================

/// Process-level configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite path; a `sqlite://` prefix is tolerated.
    pub database_url: String,
    pub venue_ws_base: String,
    pub venue_rest_base: String,
    pub monitoring_port: u16,
    pub log_level: String,
    /// Initial symbol universe. When non-empty, ingestion starts on boot.
    pub symbols: Vec<String>,
    pub channels: ChannelSet,
    pub max_streams_per_connection: usize,
    pub tier0_size: usize,
    /// SHARDS: shard count per channel class, overriding tier-based sizing.
    pub shard_count: Option<usize>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, IngestError> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "./tickstore.db".to_string());

        let venue_ws_base =
            env::var("VENUE_WS_BASE").unwrap_or_else(|_| DEFAULT_WS_BASE.to_string());
        let venue_rest_base =
            env::var("VENUE_REST_BASE").unwrap_or_else(|_| DEFAULT_REST_BASE.to_string());

        let monitoring_port = match env::var("MONITORING_PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|_| IngestError::config(format!("invalid MONITORING_PORT: {v}")))?,
            Err(_) => 8080,
        };

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let channels = match env::var("CHANNELS") {
            Ok(v) => ChannelSet::from_env_flags(&v)?,
            Err(_) => ChannelSet::default(),
        };

        let max_streams_per_connection = parse_env("MAX_STREAMS_PER_CONNECTION", 50)?;
        let tier0_size = parse_env("TIER0_SIZE", 20)?;

        let shard_count = match env::var("SHARDS") {
            Ok(v) => Some(
                v.parse::<usize>()
                    .map_err(|_| IngestError::config(format!("invalid SHARDS: {v}")))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            venue_ws_base,
            venue_rest_base,
            monitoring_port,
            log_level,
            symbols,
            channels,
            max_streams_per_connection,
            tier0_size,
            shard_count,
        })
    }

    /// Filesystem path of the store, with any URL scheme stripped.
    pub fn database_path(&self) -> &str {
        self.database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_url)
    }

    /// Resolve a Start request into a validated run configuration.
    pub fn resolve_start(&self, req: &StartRequest) -> Result<IngestConfig, IngestError> {
        let symbols = match &req.symbols {
            Some(list) => list
                .iter()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => self.symbols.clone(),
        };

        let channels = match &req.channels {
            Some(names) => ChannelSet::from_names(names)?,
            None => self.channels,
        };

        let plan = req.shard_plan.clone().unwrap_or_default();
        let cfg = IngestConfig {
            symbols,
            channels,
            max_streams_per_connection: plan
                .max_streams_per_connection
                .unwrap_or(self.max_streams_per_connection),
            tier0_size: plan.tier0_size.unwrap_or(self.tier0_size),
            shard_count: plan.shard_count.or(self.shard_count),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, IngestError> {
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| IngestError::config(format!("invalid {key}: {v}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: ":memory:".into(),
            venue_ws_base: DEFAULT_WS_BASE.into(),
            venue_rest_base: DEFAULT_REST_BASE.into(),
            monitoring_port: 8080,
            log_level: "info".into(),
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            channels: ChannelSet::default(),
            max_streams_per_connection: 50,
            tier0_size: 20,
            shard_count: None,
        }
    }

    #[test]
    fn test_channel_set_env_flags() {
        let set = ChannelSet::from_env_flags("markPrice, forceOrder").unwrap();
        assert!(set.book_ticker && set.agg_trade && set.depth);
        assert!(set.mark_price && set.force_order);

        assert!(ChannelSet::from_env_flags("klines").is_err());
    }

    #[test]
    fn test_start_request_overrides() {
        let cfg = base_config();
        let req = StartRequest {
            symbols: Some(vec!["solusdt".into()]),
            channels: Some(vec!["bookTicker".into(), "depth".into()]),
            log_level: None,
            shard_plan: Some(ShardPlanOverride {
                max_streams_per_connection: Some(10),
                tier0_size: None,
                shard_count: None,
            }),
        };
        let resolved = cfg.resolve_start(&req).unwrap();
        assert_eq!(resolved.symbols, vec!["SOLUSDT".to_string()]);
        assert!(resolved.channels.book_ticker);
        assert!(!resolved.channels.agg_trade);
        assert_eq!(resolved.max_streams_per_connection, 10);
    }

    #[test]
    fn test_start_request_rejections() {
        let cfg = base_config();

        let bad_channel = StartRequest {
            channels: Some(vec!["klines".into()]),
            ..Default::default()
        };
        assert!(cfg.resolve_start(&bad_channel).is_err());

        let empty_universe = StartRequest {
            symbols: Some(vec!["  ".into()]),
            ..Default::default()
        };
        assert!(cfg.resolve_start(&empty_universe).is_err());

        let duplicate = StartRequest {
            symbols: Some(vec!["BTCUSDT".into(), "btcusdt".into()]),
            ..Default::default()
        };
        assert!(cfg.resolve_start(&duplicate).is_err());
    }

    #[test]
    fn test_database_path_strips_scheme() {
        let mut cfg = base_config();
        cfg.database_url = "sqlite:///var/lib/tickstore.db".into();
        assert_eq!(cfg.database_path(), "/var/lib/tickstore.db");
        cfg.database_url = "./tickstore.db".into();
        assert_eq!(cfg.database_path(), "./tickstore.db");
    }
}
