//! In-process store with an asynchronously maintained view.
//!
//! Writes land in the primary map immediately. Each write also enqueues a view
//! change stamped with `now + view_lag`; a background task applies changes in
//! enqueue order once they become visible, so view reads lag primary reads the
//! way a replicated materialized view does.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Args, Dialect, Row, Statement, StoreClient, StoreError, Value};
use crate::model::Record;

type PrimaryKey = (String, String);
type ViewKey = (String, DateTime<Utc>, String);
type ViewMap = BTreeMap<ViewKey, Record>;

/// Tuning for [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreOptions {
    /// Delay between a primary write and its visibility in the view.
    pub view_lag: Duration,
    /// Artificial latency added to every call.
    pub call_latency: Duration,
    /// Percentage of calls that fail with an injected I/O error.
    pub fault_pct: u8,
    /// Per-call timeout.
    pub op_timeout: Duration,
    /// Seed for fault injection (0 picks a random seed).
    pub seed: u64,
}

impl Default for MemoryStoreOptions {
    fn default() -> Self {
        Self {
            view_lag: Duration::from_millis(5),
            call_latency: Duration::ZERO,
            fault_pct: 0,
            op_timeout: Duration::from_secs(60),
            seed: 0,
        }
    }
}

/// Counters exposed for tests and reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStoreStats {
    pub calls: u64,
    pub injected_faults: u64,
    pub peak_in_flight: usize,
    pub pending_view_changes: usize,
}

enum ViewChange {
    Upsert(Record),
    Remove(ViewKey),
}

struct PendingChange {
    visible_at: Instant,
    change: ViewChange,
}

pub struct MemoryStore {
    options: MemoryStoreOptions,
    primary: Mutex<BTreeMap<PrimaryKey, Record>>,
    view: Arc<Mutex<ViewMap>>,
    view_tx: mpsc::UnboundedSender<PendingChange>,
    pending: Arc<AtomicUsize>,
    faults: Mutex<StdRng>,
    calls: AtomicU64,
    injected_faults: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    applier: tokio::task::JoinHandle<()>,
}

impl MemoryStore {
    /// Create the store and spawn its view applier.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(options: MemoryStoreOptions) -> Self {
        let view = Arc::new(Mutex::new(ViewMap::new()));
        let pending = Arc::new(AtomicUsize::new(0));
        let (view_tx, view_rx) = mpsc::unbounded_channel();
        let applier = tokio::spawn(apply_view_changes(view.clone(), pending.clone(), view_rx));
        let faults = if options.seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(options.seed)
        };
        Self {
            options,
            primary: Mutex::new(BTreeMap::new()),
            view,
            view_tx,
            pending,
            faults: Mutex::new(faults),
            calls: AtomicU64::new(0),
            injected_faults: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            applier,
        }
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            calls: self.calls.load(Ordering::Relaxed),
            injected_faults: self.injected_faults.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            pending_view_changes: self.pending.load(Ordering::Relaxed),
        }
    }

    /// Run one call under the in-flight gauge, latency, fault injection and timeout.
    async fn call<T>(
        &self,
        statement: Statement,
        op: impl FnOnce(&Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let _gauge = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let work = async {
            if !self.options.call_latency.is_zero() {
                tokio::time::sleep(self.options.call_latency).await;
            }
            if self.should_inject_fault() {
                self.injected_faults.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::Io {
                    statement,
                    message: "injected fault".to_string(),
                });
            }
            op(self)
        };
        match tokio::time::timeout(self.options.op_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                statement,
                timeout: self.options.op_timeout,
            }),
        }
    }

    fn should_inject_fault(&self) -> bool {
        if self.options.fault_pct == 0 {
            return false;
        }
        lock(&self.faults).gen_range(0..100) < u32::from(self.options.fault_pct)
    }

    /// Queue a view change; callers hold the primary lock so view order
    /// follows primary order.
    fn enqueue(&self, change: ViewChange) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let pending = PendingChange {
            visible_at: Instant::now() + self.options.view_lag,
            change,
        };
        if self.view_tx.send(pending).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn write(&self, statement: Statement, values: &[Value]) -> Result<(), StoreError> {
        let args = Args::new(statement, values)?;
        match statement {
            Statement::InsertRecord => {
                let record = Record {
                    id: args.uuid(0)?,
                    code: args.text(1)?.to_string(),
                    group_key: args.text(2)?.to_string(),
                    text: args.text(3)?.to_string(),
                    flag: args.boolean(4)?,
                    created_at: args.timestamp(5)?,
                };
                let mut primary = lock(&self.primary);
                // Inserts are upserts; a moved created_at retires the old view row.
                if let Some(previous) = primary.insert(record.primary_key(), record.clone()) {
                    if previous.created_at != record.created_at {
                        self.enqueue(ViewChange::Remove(previous.view_key()));
                    }
                }
                self.enqueue(ViewChange::Upsert(record));
                Ok(())
            }
            Statement::UpdateFlag => {
                let flag = args.boolean(0)?;
                let key = (args.text(1)?.to_string(), args.text(2)?.to_string());
                let mut primary = lock(&self.primary);
                if let Some(record) = primary.get_mut(&key) {
                    record.flag = flag;
                    self.enqueue(ViewChange::Upsert(record.clone()));
                }
                Ok(())
            }
            Statement::DeleteRecord => {
                let key = (args.text(0)?.to_string(), args.text(1)?.to_string());
                let mut primary = lock(&self.primary);
                if let Some(previous) = primary.remove(&key) {
                    self.enqueue(ViewChange::Remove(previous.view_key()));
                }
                Ok(())
            }
            other => Err(not_shaped(other, "execute")),
        }
    }

    fn scalar(&self, statement: Statement, values: &[Value]) -> Result<i64, StoreError> {
        let args = Args::new(statement, values)?;
        let count = match statement {
            Statement::CountPrimary => {
                let group = args.text(0)?;
                lock(&self.primary)
                    .range((group.to_string(), String::new())..)
                    .take_while(|((g, _), _)| g == group)
                    .count()
            }
            Statement::CountView => {
                let group = args.text(0)?;
                lock(&self.view)
                    .range(view_group_start(group)..)
                    .take_while(|((g, _, _), _)| g == group)
                    .count()
            }
            Statement::CountAll => lock(&self.primary).len(),
            other => return Err(not_shaped(other, "query_scalar")),
        };
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    fn rows(&self, statement: Statement, values: &[Value]) -> Result<Vec<Row>, StoreError> {
        let args = Args::new(statement, values)?;
        match statement {
            Statement::SelectRecord => {
                let key = (args.text(0)?.to_string(), args.text(1)?.to_string());
                Ok(lock(&self.primary)
                    .get(&key)
                    .map(Record::to_row)
                    .into_iter()
                    .collect())
            }
            Statement::SelectViewRow => {
                let key = (
                    args.text(0)?.to_string(),
                    args.timestamp(1)?,
                    args.text(2)?.to_string(),
                );
                Ok(lock(&self.view)
                    .get(&key)
                    .map(Record::to_row)
                    .into_iter()
                    .collect())
            }
            Statement::SelectViewRange => {
                let group = args.text(0)?;
                let limit = usize::try_from(args.bigint(1)?.max(0)).unwrap_or(usize::MAX);
                Ok(lock(&self.view)
                    .range(view_group_start(group)..)
                    .take_while(|((g, _, _), _)| g == group)
                    .take(limit)
                    .map(|(_, record)| record.to_row())
                    .collect())
            }
            other => Err(not_shaped(other, "query_rows")),
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.applier.abort();
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    fn dialect(&self) -> Dialect {
        Dialect::Cql
    }

    async fn execute(&self, statement: Statement, args: &[Value]) -> Result<(), StoreError> {
        self.call(statement, |store| store.write(statement, args))
            .await
    }

    async fn query_scalar(&self, statement: Statement, args: &[Value]) -> Result<i64, StoreError> {
        self.call(statement, |store| store.scalar(statement, args))
            .await
    }

    async fn query_rows(
        &self,
        statement: Statement,
        args: &[Value],
    ) -> Result<Vec<Row>, StoreError> {
        self.call(statement, |store| store.rows(statement, args))
            .await
    }
}

/// Background task that makes queued changes visible in the view.
async fn apply_view_changes(
    view: Arc<Mutex<ViewMap>>,
    pending: Arc<AtomicUsize>,
    mut rx: mpsc::UnboundedReceiver<PendingChange>,
) {
    while let Some(next) = rx.recv().await {
        tokio::time::sleep_until(next.visible_at).await;
        {
            let mut view = lock(&view);
            match next.change {
                ViewChange::Upsert(record) => {
                    view.insert(record.view_key(), record);
                }
                ViewChange::Remove(key) => {
                    view.remove(&key);
                }
            }
        }
        pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Increments an in-flight gauge for its lifetime and tracks the peak.
struct InFlight<'a> {
    gauge: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { gauge }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

fn view_group_start(group: &str) -> ViewKey {
    (group.to_string(), DateTime::<Utc>::MIN_UTC, String::new())
}

fn not_shaped(statement: Statement, method: &str) -> StoreError {
    StoreError::Shape {
        statement,
        reason: format!("{:?} statement cannot be used with {method}", statement.shape()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
