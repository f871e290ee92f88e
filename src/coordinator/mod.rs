//! Write and read coordinators
//!
//! Both coordinators are actors: one tokio task per (db, namespace)
//! draining an mpsc mailbox, replying over oneshot channels. Nothing is
//! thrown across the boundary; every failure comes back as a negative
//! reply. Handles enforce a bounded ask timeout from configuration.

mod plan;
mod read;
mod write;

pub use plan::{reduce_condition, QueryPlan, PlanKind};
pub use read::{QueryResult, ReadCoordinator};
pub use write::{InputMapped, WriteCoordinator};
