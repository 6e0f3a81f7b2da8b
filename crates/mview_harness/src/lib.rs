//! Convergence harness for materialized views.
//!
//! The harness drives concurrent CRUD traffic against a primary table and
//! measures how long a derived view takes to catch up:
//! - [`orchestrator::Harness`] runs batches of tasks through a bounded
//!   [`limiter::ConcurrencyLimiter`],
//! - [`task::run_crud_task`] performs insert, read, update, delete and
//!   reinsert against one record,
//! - [`verify::ConsistencyVerifier`] compares primary and view counts under a
//!   [`retry::RetryPolicy`].
//!
//! Every store interaction goes through the [`store::StoreClient`] trait, so
//! the same workload runs against a PostgreSQL-wire server or the in-process
//! [`store::MemoryStore`].

pub mod config;
pub mod keys;
pub mod limiter;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod schema;
pub mod store;
pub mod task;
pub mod verify;

pub use config::HarnessConfig;
pub use orchestrator::Harness;
pub use report::{BatchReport, LoadReport, RunReport, SelectReport};
pub use retry::{Backoff, RetryPolicy};
pub use store::{connect, Backend, SessionConfig, StoreClient};
pub use verify::{ConsistencyVerifier, Verification};
