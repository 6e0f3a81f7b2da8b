//! Convergence check between the primary table and its view.
//!
//! The primary count is read once and trusted. Only the view is re-polled,
//! under a [`RetryPolicy`], until the counts agree or the budget is spent. A
//! divergence is returned as data; it never fails the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::retry::RetryPolicy;
use crate::store::{Statement, StoreClient, StoreError, Value};

/// Outcome of one verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub group_key: String,
    /// Rows the batch intended to leave behind.
    pub expected: u64,
    /// `None` when the primary count could not be read.
    pub primary_count: Option<u64>,
    /// Last observed view count; `None` when every view read failed.
    pub view_count: Option<u64>,
    /// View re-queries issued after the first comparison.
    pub retries: u32,
    pub matched: bool,
    /// Time spent from the first primary read to the final comparison.
    pub elapsed: Duration,
}

impl Verification {
    /// Primary rows missing from (positive) or extra in (negative) the view.
    pub fn residual(&self) -> Option<i64> {
        let primary = i64::try_from(self.primary_count?).ok()?;
        let view = i64::try_from(self.view_count?).ok()?;
        Some(primary - view)
    }

    pub fn primary_matches_expected(&self) -> bool {
        self.primary_count == Some(self.expected)
    }
}

pub struct ConsistencyVerifier {
    store: Arc<dyn StoreClient>,
    policy: RetryPolicy,
}

impl ConsistencyVerifier {
    pub fn new(store: Arc<dyn StoreClient>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn verify(&self, group_key: &str, expected: u64) -> Verification {
        let started = Instant::now();
        let mut verification = Verification {
            group_key: group_key.to_string(),
            expected,
            primary_count: None,
            view_count: None,
            retries: 0,
            matched: false,
            elapsed: Duration::ZERO,
        };

        let primary = match self.count(Statement::CountPrimary, group_key).await {
            Ok(count) => count,
            Err(err) => {
                warn!(group_key, error = %err, "primary count failed; view not verified");
                verification.elapsed = started.elapsed();
                return verification;
            }
        };
        verification.primary_count = Some(primary);

        let mut view = self.view_count(group_key).await;
        let mut schedule = self.policy.schedule();
        while view != Some(primary) {
            let Some(retry) = schedule.next_attempt().await else {
                break;
            };
            warn!(
                group_key,
                table_count = primary,
                view_count = ?view,
                retry,
                "view not converged; re-selecting view count"
            );
            if let Some(count) = self.view_count(group_key).await {
                view = Some(count);
            }
        }

        verification.view_count = view;
        verification.retries = schedule.used();
        verification.matched = view == Some(primary);
        verification.elapsed = started.elapsed();
        if !verification.matched {
            warn!(
                group_key,
                table_count = primary,
                view_count = ?view,
                retries = verification.retries,
                "view diverged after retry budget"
            );
        }
        verification
    }

    async fn view_count(&self, group_key: &str) -> Option<u64> {
        match self.count(Statement::CountView, group_key).await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(group_key, error = %err, "view count failed");
                None
            }
        }
    }

    async fn count(&self, statement: Statement, group_key: &str) -> Result<u64, StoreError> {
        let count = self
            .store
            .query_scalar(statement, &[Value::from(group_key)])
            .await?;
        u64::try_from(count).map_err(|_| StoreError::Shape {
            statement,
            reason: format!("negative count {count}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::store::{Dialect, Row};

    /// Store that answers count queries from scripted sequences.
    struct ScriptedCounts {
        primary: Mutex<VecDeque<Result<i64, ()>>>,
        view: Mutex<VecDeque<Result<i64, ()>>>,
        view_calls: Mutex<u32>,
    }

    impl ScriptedCounts {
        fn new(primary: Vec<Result<i64, ()>>, view: Vec<Result<i64, ()>>) -> Arc<Self> {
            Arc::new(Self {
                primary: Mutex::new(primary.into()),
                view: Mutex::new(view.into()),
                view_calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl StoreClient for ScriptedCounts {
        fn dialect(&self) -> Dialect {
            Dialect::Cql
        }

        async fn execute(&self, statement: Statement, _args: &[Value]) -> Result<(), StoreError> {
            Err(StoreError::Shape {
                statement,
                reason: "scripted store is read-only".into(),
            })
        }

        async fn query_scalar(
            &self,
            statement: Statement,
            _args: &[Value],
        ) -> Result<i64, StoreError> {
            let next = match statement {
                Statement::CountPrimary => self.primary.lock().unwrap().pop_front(),
                Statement::CountView => {
                    *self.view_calls.lock().unwrap() += 1;
                    let mut view = self.view.lock().unwrap();
                    // The last scripted value repeats forever.
                    if view.len() > 1 {
                        view.pop_front()
                    } else {
                        view.front().cloned()
                    }
                }
                _ => None,
            };
            match next {
                Some(Ok(count)) => Ok(count),
                _ => Err(StoreError::Io {
                    statement,
                    message: "scripted failure".into(),
                }),
            }
        }

        async fn query_rows(
            &self,
            statement: Statement,
            _args: &[Value],
        ) -> Result<Vec<Row>, StoreError> {
            Err(StoreError::Shape {
                statement,
                reason: "scripted store has no rows".into(),
            })
        }
    }

    #[tokio::test]
    async fn equal_counts_match_without_retry() {
        let store = ScriptedCounts::new(vec![Ok(10)], vec![Ok(10)]);
        let verifier = ConsistencyVerifier::new(store.clone(), RetryPolicy::busy(100));
        let v = verifier.verify("user1", 10).await;
        assert!(v.matched);
        assert_eq!(v.retries, 0);
        assert_eq!(v.residual(), Some(0));
        assert!(v.primary_matches_expected());
        assert_eq!(*store.view_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn converges_after_some_retries() {
        let store = ScriptedCounts::new(vec![Ok(10)], vec![Ok(4), Ok(7), Ok(9), Ok(10)]);
        let verifier = ConsistencyVerifier::new(store.clone(), RetryPolicy::busy(100));
        let v = verifier.verify("user1", 10).await;
        assert!(v.matched);
        assert_eq!(v.retries, 3);
        assert_eq!(v.view_count, Some(10));
        assert_eq!(*store.view_calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_exact_residual() {
        let store = ScriptedCounts::new(vec![Ok(10)], vec![Ok(8)]);
        let verifier = ConsistencyVerifier::new(store.clone(), RetryPolicy::busy(100));
        let v = verifier.verify("user1", 10).await;
        assert!(!v.matched);
        assert_eq!(v.retries, 100);
        assert_eq!(v.view_count, Some(8));
        assert_eq!(v.residual(), Some(2));
        assert_eq!(*store.view_calls.lock().unwrap(), 101);
    }

    #[tokio::test]
    async fn primary_is_read_once() {
        // A second primary read would hit the empty script and fail.
        let store = ScriptedCounts::new(vec![Ok(3)], vec![Ok(1), Ok(2), Ok(3)]);
        let verifier = ConsistencyVerifier::new(store, RetryPolicy::busy(5));
        let v = verifier.verify("user1", 3).await;
        assert!(v.matched);
        assert_eq!(v.primary_count, Some(3));
    }

    #[tokio::test]
    async fn failed_view_reads_consume_retries() {
        let store = ScriptedCounts::new(vec![Ok(2)], vec![Err(()), Err(()), Ok(2)]);
        let verifier = ConsistencyVerifier::new(store, RetryPolicy::busy(5));
        let v = verifier.verify("user1", 2).await;
        assert!(v.matched);
        assert_eq!(v.retries, 2);
    }

    #[tokio::test]
    async fn failed_primary_read_is_unverified() {
        let store = ScriptedCounts::new(vec![Err(())], vec![Ok(2)]);
        let verifier = ConsistencyVerifier::new(store.clone(), RetryPolicy::busy(5));
        let v = verifier.verify("user1", 2).await;
        assert!(!v.matched);
        assert_eq!(v.primary_count, None);
        assert_eq!(v.view_count, None);
        assert_eq!(v.residual(), None);
        assert_eq!(*store.view_calls.lock().unwrap(), 0);
    }
}
