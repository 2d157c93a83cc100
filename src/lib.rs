//! tickstore-backend library.
//!
//! Continuous market-data ingestion for a futures venue: sharded stream
//! clients feed normalized events through batch writers into a
//! time-partitioned SQLite store, with per-second aggregates, a gap-filled
//! 1-second grid, retention maintenance, and an HTTP control plane.

pub mod config;
pub mod control;
pub mod error;
pub mod ingest;
pub mod models;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod validate;
