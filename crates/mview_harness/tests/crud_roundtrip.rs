mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mview_harness::keys::KeyGenerator;
use mview_harness::model::Record;
use mview_harness::store::{Statement, StoreClient, Value};
use mview_harness::task::{run_crud_task, FaultKind, TaskContext};

use common::{count, lagging_store, patient_policy, read_record, wait_until, TEST_VIEW_LAG};

#[tokio::test]
async fn update_is_visible_on_read_by_key() {
    let store = lagging_store();
    let record = Record::new(uuid::Uuid::now_v7(), "code-a", "user1");
    store
        .execute(Statement::InsertRecord, &record.insert_args())
        .await
        .expect("insert");
    store
        .execute(
            Statement::UpdateFlag,
            &[Value::Bool(false), Value::from("user1"), Value::from("code-a")],
        )
        .await
        .expect("update");

    let read = read_record(store.as_ref(), "user1", "code-a").await.expect("row");
    assert!(!read.flag);
    assert_eq!(read.id, record.id);
    assert_eq!(read.created_at, record.created_at);
}

#[tokio::test]
async fn reinsert_keeps_code_and_text_with_fresh_identity() {
    let store = lagging_store();
    let keys = Arc::new(KeyGenerator::new(17));
    let seed_ctx = Arc::new(TaskContext {
        store: store.clone(),
        keys: keys.clone(),
        insert_only: true,
        view_check: None,
    });
    let code = keys.next_code();
    run_crud_task(seed_ctx, "user2".into(), Some(code.clone())).await;
    let original = read_record(store.as_ref(), "user2", &code).await.expect("row");

    let ctx = Arc::new(TaskContext {
        store: store.clone(),
        keys,
        insert_only: false,
        view_check: Some(patient_policy()),
    });
    let report = run_crud_task(ctx, "user2".into(), Some(code.clone())).await;
    assert!(report.is_clean(), "{:?}", report.faults);

    let after = read_record(store.as_ref(), "user2", &code).await.expect("reinserted");
    assert_eq!(after.code, original.code);
    assert_eq!(after.text, original.text);
    assert_ne!(after.id, original.id);
    assert!(after.flag);
    assert_eq!(count(store.as_ref(), Statement::CountPrimary, "user2").await, 1);

    // The view drops the old row and picks up the reinserted one.
    let converged = wait_until(TEST_VIEW_LAG * 20, || {
        let store = store.clone();
        let after = after.clone();
        async move {
            let rows = store
                .query_rows(
                    Statement::SelectViewRow,
                    &[
                        Value::from("user2"),
                        Value::Timestamp(after.created_at),
                        Value::from(after.code.as_str()),
                    ],
                )
                .await
                .unwrap_or_default();
            let view_count = store
                .query_scalar(Statement::CountView, &[Value::from("user2")])
                .await
                .unwrap_or_default();
            view_count == 1
                && rows
                    .first()
                    .and_then(|row| Record::from_row(Statement::SelectViewRow, row).ok())
                    .map_or(false, |view| view.diff(&after).is_empty())
        }
    })
    .await;
    assert!(converged, "view never reflected the reinserted row");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_code_generation_has_no_duplicates() {
    let keys = Arc::new(KeyGenerator::new(0));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            (0..1000).map(|_| keys.next_code()).collect::<Vec<_>>()
        }));
    }
    let mut seen = HashSet::new();
    for handle in handles {
        for code in handle.await.expect("join") {
            assert!(seen.insert(code), "duplicate code");
        }
    }
    assert_eq!(seen.len(), 10_000);
}

#[tokio::test]
async fn timed_out_calls_become_transient_faults() {
    let store = common::memory_store(mview_harness::store::MemoryStoreOptions {
        call_latency: Duration::from_millis(50),
        op_timeout: Duration::from_millis(5),
        ..Default::default()
    });
    let ctx = Arc::new(TaskContext {
        store,
        keys: Arc::new(KeyGenerator::new(1)),
        insert_only: false,
        view_check: None,
    });
    let report = run_crud_task(ctx, "user9".into(), None).await;
    assert_eq!(report.count(FaultKind::TransientIo), 6);
    assert!(report
        .faults
        .iter()
        .all(|fault| fault.detail.contains("timed out")));
}
