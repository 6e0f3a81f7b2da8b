//! Batch driver.
//!
//! A convergence run is a sequence of batches. Each batch pushes its tasks
//! through a fresh [`ConcurrencyLimiter`], drains them, and only then asks the
//! [`ConsistencyVerifier`] whether the view caught up with the primary table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::keys::{group_key, KeyGenerator};
use crate::limiter::ConcurrencyLimiter;
use crate::report::{
    BatchReport, FaultTally, LatencySummary, LoadReport, RunMeta, RunReport, SelectReport,
};
use crate::store::{Statement, StoreClient, Value};
use crate::task::{run_crud_task, TaskContext, TaskReport};
use crate::verify::ConsistencyVerifier;

/// Tasks sharing one group key in load mode.
const LOAD_TASKS_PER_GROUP: u64 = 10_000;

pub struct Harness {
    store: Arc<dyn StoreClient>,
    config: HarnessConfig,
    keys: Arc<KeyGenerator>,
    verifier: ConsistencyVerifier,
}

impl Harness {
    pub fn new(store: Arc<dyn StoreClient>, config: HarnessConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let keys = Arc::new(KeyGenerator::new(config.seed));
        let verifier = ConsistencyVerifier::new(store.clone(), config.verify);
        Ok(Self {
            store,
            config,
            keys,
            verifier,
        })
    }

    /// Effective seed of the shared key generator.
    pub fn seed(&self) -> u64 {
        self.keys.seed()
    }

    fn task_context(&self) -> Arc<TaskContext> {
        Arc::new(TaskContext {
            store: self.store.clone(),
            keys: self.keys.clone(),
            insert_only: self.config.insert_only,
            view_check: self.config.view_check,
        })
    }

    fn meta(&self, mode: &'static str) -> RunMeta {
        RunMeta {
            mode,
            seed: self.seed(),
            config: self.config.clone(),
        }
    }

    /// Run `size` CRUD tasks for `group_key`, drain them, then verify the view.
    pub async fn run_batch(&self, group_key: &str, size: u64) -> anyhow::Result<BatchReport> {
        let ctx = self.task_context();
        let mut limiter = ConcurrencyLimiter::<TaskReport>::new(self.config.parallelism);
        let started = Instant::now();
        for _ in 0..size {
            limiter
                .submit(run_crud_task(ctx.clone(), group_key.to_string(), None))
                .await?;
        }
        let drained = limiter.drain().await;
        let elapsed = started.elapsed();

        let mut faults = FaultTally::default();
        for report in &drained.completed {
            faults.record(report);
        }
        faults.panicked = drained.panicked as u64;
        info!(
            group_key,
            tasks = size,
            elapsed_ms = elapsed.as_millis() as u64,
            peak_running = drained.peak_running,
            faults = faults.total_faults(),
            "batch drained"
        );

        let verification = self.verifier.verify(group_key, size).await;
        let report = BatchReport {
            group_key: group_key.to_string(),
            tasks: size,
            elapsed,
            peak_running: drained.peak_running,
            faults,
            verification,
        };
        info!(
            group_key,
            throughput = report.throughput(),
            table_count = ?report.verification.primary_count,
            view_count = ?report.verification.view_count,
            retries = report.verification.retries,
            matched = report.verification.matched,
            "batch verified"
        );
        Ok(report)
    }

    /// Full batches of `insert_count` followed by the remainder, each under a
    /// fresh random group key.
    pub async fn run_convergence(&self) -> anyhow::Result<RunReport> {
        let started = Instant::now();
        let mut batches = Vec::new();
        for size in self.config.batch_sizes() {
            let group = self.keys.next_group_key(self.config.group_key_space);
            batches.push(self.run_batch(&group, size).await?);
        }
        let final_count = self.final_count().await;
        let report = RunReport::from_batches(
            self.meta("run"),
            batches,
            started.elapsed(),
            final_count,
        );
        info!(
            requests = report.requests,
            batches = report.batches.len(),
            converged = report.converged_batches,
            diverged = report.diverged_batches,
            retries = report.total_retries,
            transient_faults = report.faults.transient_io,
            consistency_faults = report.faults.consistency,
            final_count = ?report.final_count,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run complete"
        );
        Ok(report)
    }

    /// One long batch over sequential group keys, without view verification.
    pub async fn run_load(&self) -> anyhow::Result<LoadReport> {
        let ctx = self.task_context();
        let mut limiter = ConcurrencyLimiter::<TaskReport>::new(self.config.parallelism);
        let started = Instant::now();
        for idx in 0..self.config.requests {
            let n = u32::try_from(idx / LOAD_TASKS_PER_GROUP).unwrap_or(u32::MAX);
            limiter
                .submit(run_crud_task(ctx.clone(), group_key(n), None))
                .await?;
            let submitted = idx + 1;
            if submitted % self.config.progress_every == 0 {
                info!(
                    submitted,
                    in_flight = limiter.in_flight(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "load progress"
                );
            }
        }
        let drained = limiter.drain().await;
        let elapsed = started.elapsed();

        let mut faults = FaultTally::default();
        for report in &drained.completed {
            faults.record(report);
        }
        faults.panicked = drained.panicked as u64;
        let report = LoadReport {
            meta: self.meta("load"),
            requests: self.config.requests,
            elapsed,
            peak_running: drained.peak_running,
            faults,
            final_count: self.final_count().await,
        };
        info!(
            requests = report.requests,
            elapsed_ms = elapsed.as_millis() as u64,
            throughput = report.throughput(),
            transient_faults = report.faults.transient_io,
            consistency_faults = report.faults.consistency,
            final_count = ?report.final_count,
            "load complete"
        );
        Ok(report)
    }

    /// Random range reads of the view under random group keys.
    pub async fn run_select(&self) -> anyhow::Result<SelectReport> {
        let started = Instant::now();
        let mut samples: Vec<Duration> = Vec::new();
        let mut failures = 0u64;
        let mut rows_returned = 0u64;
        for _ in 0..self.config.select_iterations {
            let group = self.keys.next_group_key(self.config.group_key_space);
            let args = [
                Value::Text(group.clone()),
                Value::BigInt(self.config.select_limit),
            ];
            let issued = Instant::now();
            match self.store.query_rows(Statement::SelectViewRange, &args).await {
                Ok(rows) => {
                    let latency = issued.elapsed();
                    debug!(
                        group_key = %group,
                        rows = rows.len(),
                        latency_us = latency.as_micros() as u64,
                        "view range read"
                    );
                    rows_returned += rows.len() as u64;
                    samples.push(latency);
                }
                Err(err) => {
                    failures += 1;
                    warn!(group_key = %group, error = %err, "view range read failed");
                }
            }
        }
        let report = SelectReport {
            meta: self.meta("select"),
            iterations: self.config.select_iterations,
            failures,
            rows_returned,
            elapsed: started.elapsed(),
            latency: LatencySummary::from_samples(samples),
        };
        info!(
            iterations = report.iterations,
            failures,
            rows_returned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            p50_us = report.latency.p50.as_micros() as u64,
            p99_us = report.latency.p99.as_micros() as u64,
            "select complete"
        );
        Ok(report)
    }

    async fn final_count(&self) -> Option<u64> {
        if !self.config.final_count {
            return None;
        }
        match self.store.query_scalar(Statement::CountAll, &[]).await {
            Ok(count) => {
                info!(total = count, "final table count");
                u64::try_from(count).ok()
            }
            Err(err) => {
                warn!(error = %err, "final table count failed");
                None
            }
        }
    }
}
