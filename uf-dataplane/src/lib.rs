//! Per-worker data-plane engine of the upflow user-plane core.
//!
//! Everything here runs on pinned worker threads in a share-nothing
//! arrangement: the flow table, timer wheel and counters belong to one
//! worker each. Control-plane state (sessions, rule sets, detection
//! databases) is read through `Arc` snapshots published by the control
//! process; a snapshot taken at the start of a packet stays valid until the
//! worker's quiescent point at the end of its batch.

pub mod adf;
pub mod classify;
pub mod flowtable;
pub mod sdf;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use adf::AdfDb;
pub use classify::{Classifier, ClassifyCounters, ClassifyTrace};
pub use flowtable::{
    FlowBudget, FlowEntry, FlowStats, FlowTable, TimeoutMsg, TIMER_DEFAULT_LIFETIME,
};
pub use sdf::SdfContext;
pub use worker::Worker;
