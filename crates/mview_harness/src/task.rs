//! CRUD task: the unit of work performed against one entity.
//!
//! Every store call stands alone. A failed call is recorded as a transient
//! fault and the next step still runs; the task never returns early on error
//! and never fails its caller.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::keys::KeyGenerator;
use crate::model::Record;
use crate::retry::RetryPolicy;
use crate::store::{Statement, StoreClient, StoreError, Value};

/// Shared, read-only inputs for every task of a run.
pub struct TaskContext {
    pub store: Arc<dyn StoreClient>,
    pub keys: Arc<KeyGenerator>,
    /// Stop after the first insert.
    pub insert_only: bool,
    /// When set, compare the view row after the update using this retry budget.
    pub view_check: Option<RetryPolicy>,
}

/// Steps of a CRUD task, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Insert,
    ReadBack,
    Update,
    VerifyUpdate,
    ViewCheck,
    Delete,
    Reinsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A single store call failed or timed out.
    TransientIo,
    /// The store returned data that contradicts an earlier write.
    Consistency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub step: Step,
    pub kind: FaultKind,
    pub detail: String,
}

/// Structured outcome of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub group_key: String,
    pub code: String,
    pub store_calls: u32,
    pub faults: Vec<Fault>,
}

impl TaskReport {
    pub fn count(&self, kind: FaultKind) -> usize {
        self.faults.iter().filter(|f| f.kind == kind).count()
    }

    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Run one CRUD sequence for `group_key`. A fresh code is generated unless
/// `code` is supplied.
pub async fn run_crud_task(
    ctx: Arc<TaskContext>,
    group_key: String,
    code: Option<String>,
) -> TaskReport {
    let code = code.unwrap_or_else(|| ctx.keys.next_code());
    let task = CrudTask {
        ctx: &ctx,
        report: TaskReport {
            group_key,
            code,
            store_calls: 0,
            faults: Vec::new(),
        },
    };
    task.run().await
}

struct CrudTask<'a> {
    ctx: &'a TaskContext,
    report: TaskReport,
}

impl CrudTask<'_> {
    async fn run(mut self) -> TaskReport {
        let inserted = self.insert(Step::Insert).await;
        if self.ctx.insert_only {
            return self.report;
        }

        match self.fetch(Statement::SelectRecord, self.key_args()).await {
            Ok(Some(record)) => debug!(?record, "read back"),
            Ok(None) if inserted => {
                self.consistency(Step::ReadBack, "inserted record not found".to_string())
            }
            Ok(None) => {}
            Err(err) => self.transient(Step::ReadBack, err),
        }

        self.update(inserted).await;

        let args = self.key_args();
        if let Err(err) = self.call_execute(Statement::DeleteRecord, &args).await {
            self.transient(Step::Delete, err);
        }

        self.insert(Step::Reinsert).await;
        self.report
    }

    /// Insert a fresh record under the task's code; true on success.
    async fn insert(&mut self, step: Step) -> bool {
        let record = Record::new(
            self.ctx.keys.next_record_id(),
            self.report.code.as_str(),
            self.report.group_key.as_str(),
        );
        match self
            .call_execute(Statement::InsertRecord, &record.insert_args())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                self.transient(step, err);
                false
            }
        }
    }

    async fn update(&mut self, inserted: bool) {
        let args = [
            Value::Bool(false),
            Value::Text(self.report.group_key.clone()),
            Value::Text(self.report.code.clone()),
        ];
        let updated = match self.call_execute(Statement::UpdateFlag, &args).await {
            Ok(()) => true,
            Err(err) => {
                self.transient(Step::Update, err);
                false
            }
        };

        let record = match self.fetch(Statement::SelectRecord, self.key_args()).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                if inserted {
                    self.consistency(
                        Step::VerifyUpdate,
                        "record missing when re-read after update".to_string(),
                    );
                }
                return;
            }
            Err(err) => {
                self.transient(Step::VerifyUpdate, err);
                return;
            }
        };
        if updated && record.flag {
            self.consistency(
                Step::VerifyUpdate,
                "is_test still true after update".to_string(),
            );
        }
        if let Some(policy) = self.ctx.view_check {
            self.check_view(&record, policy).await;
        }
    }

    /// Poll the view row for `record` until it matches or the budget runs out.
    async fn check_view(&mut self, record: &Record, policy: RetryPolicy) {
        let args = vec![
            Value::Text(record.group_key.clone()),
            Value::Timestamp(record.created_at),
            Value::Text(record.code.clone()),
        ];
        let mut schedule = policy.schedule();
        let last = loop {
            let observed = self.fetch(Statement::SelectViewRow, args.clone()).await;
            if let Ok(Some(view)) = &observed {
                if view.diff(record).is_empty() {
                    return;
                }
            }
            if schedule.next_attempt().await.is_none() {
                break observed;
            }
        };
        match last {
            Ok(Some(view)) => self.consistency(
                Step::ViewCheck,
                format!(
                    "view row differs from primary in {:?} after {} retries",
                    view.diff(record),
                    schedule.used()
                ),
            ),
            Ok(None) => self.consistency(
                Step::ViewCheck,
                format!("view row missing after {} retries", schedule.used()),
            ),
            Err(err) => self.transient(Step::ViewCheck, err),
        }
    }

    fn key_args(&self) -> Vec<Value> {
        vec![
            Value::Text(self.report.group_key.clone()),
            Value::Text(self.report.code.clone()),
        ]
    }

    async fn call_execute(
        &mut self,
        statement: Statement,
        args: &[Value],
    ) -> Result<(), StoreError> {
        self.report.store_calls += 1;
        self.ctx.store.execute(statement, args).await
    }

    /// Read at most one record.
    async fn fetch(
        &mut self,
        statement: Statement,
        args: Vec<Value>,
    ) -> Result<Option<Record>, StoreError> {
        self.report.store_calls += 1;
        let rows = self.ctx.store.query_rows(statement, &args).await?;
        rows.first()
            .map(|row| Record::from_row(statement, row))
            .transpose()
    }

    fn transient(&mut self, step: Step, err: StoreError) {
        warn!(
            group_key = %self.report.group_key,
            code = %self.report.code,
            ?step,
            statement = %err.statement(),
            error = %err,
            "store call failed"
        );
        self.report.faults.push(Fault {
            step,
            kind: FaultKind::TransientIo,
            detail: err.to_string(),
        });
    }

    fn consistency(&mut self, step: Step, detail: String) {
        warn!(
            group_key = %self.report.group_key,
            code = %self.report.code,
            ?step,
            %detail,
            "consistency fault"
        );
        self.report.faults.push(Fault {
            step,
            kind: FaultKind::Consistency,
            detail,
        });
    }
}
