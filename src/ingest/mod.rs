//! Venue ingestion: wire decoding, connection sessions, stream clients,
//! normalization, and shard supervision.

pub mod client;
pub mod normalize;
pub mod session;
pub mod supervisor;
pub mod wire;
