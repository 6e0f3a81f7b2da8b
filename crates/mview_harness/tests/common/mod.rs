//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mview_harness::model::Record;
use mview_harness::retry::{Backoff, RetryPolicy};
use mview_harness::store::{MemoryStore, MemoryStoreOptions, Statement, StoreClient, Value};

/// View lag small enough to keep tests fast but large enough to be observed.
pub const TEST_VIEW_LAG: Duration = Duration::from_millis(10);

/// Memory store with a lagging view and no injected faults.
pub fn lagging_store() -> Arc<MemoryStore> {
    memory_store(MemoryStoreOptions {
        view_lag: TEST_VIEW_LAG,
        call_latency: Duration::from_micros(200),
        seed: 42,
        ..MemoryStoreOptions::default()
    })
}

pub fn memory_store(options: MemoryStoreOptions) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(options))
}

/// Verification budget that comfortably outlasts [`TEST_VIEW_LAG`].
pub fn patient_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 100,
        backoff: Backoff::Fixed {
            delay: Duration::from_millis(5),
        },
    }
}

pub async fn count(store: &dyn StoreClient, statement: Statement, group: &str) -> i64 {
    store
        .query_scalar(statement, &[Value::from(group)])
        .await
        .expect("count query")
}

pub async fn read_record(store: &dyn StoreClient, group: &str, code: &str) -> Option<Record> {
    let rows = store
        .query_rows(Statement::SelectRecord, &[Value::from(group), Value::from(code)])
        .await
        .expect("select record");
    rows.first()
        .map(|row| Record::from_row(Statement::SelectRecord, row).expect("decode record"))
}

/// Poll until `cond` holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond().await
}
