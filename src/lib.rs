//! # timegrain
//!
//! A distributed time-series database for structured records. Every
//! record ("bit") carries a timestamp, a typed numeric value and typed
//! dimensions and tags; records are persisted in append-only indexed
//! shards and served back through SQL-like queries with projection,
//! filtering, grouping and aggregation.
//!
//! ## Architecture
//!
//! - **Schema registry**: per-metric field typing, evolved additively
//!   under a compatibility rule
//! - **Shard index**: one structured record store per time bin, with
//!   term/point postings and snapshot-isolated reads
//! - **Metadata registry**: deterministic partitioning of each metric's
//!   timeline into node-owned shards
//! - **Coordinators**: actor per (db, namespace) for writes (validate,
//!   route, append, log) and reads (plan, fan out, merge)
//! - **Guardian & endpoint**: per-node lifecycle and the HTTP/JSON
//!   surface used by thin clients

pub mod api;
pub mod cluster;
pub mod commitlog;
pub mod config;
pub mod coordinator;
pub mod guardian;
pub mod index;
pub mod metadata;
pub mod model;
pub mod schema;
pub mod statement;

mod error;

pub use error::{Error, Result, SchemaViolation};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::NodeConfig;
    pub use crate::coordinator::{ReadCoordinator, WriteCoordinator};
    pub use crate::guardian::NodeGuardian;
    pub use crate::model::{Record, Scalar};
    pub use crate::schema::Schema;
    pub use crate::statement::SelectStatement;
    pub use crate::{Error, Result};
}
