//! Traffic statistics aggregation.
//!
//! Per-connection traffic deltas from proxy backends are merged in memory by
//! [`buffer::BatchBuffer`], committed to a SQLite primary store and mirrored
//! to ClickHouse through a bounded [`analytics::AsyncWriteQueue`]. A
//! [`verify::ConsistencyVerifier`] reports drift between the two sinks and a
//! [`retention::RetentionScheduler`] prunes aged rows.

pub mod analytics;
pub mod buffer;
pub mod config;
pub mod event;
pub mod health;
pub mod pipeline;
pub mod retention;
pub mod store;
pub mod verify;
