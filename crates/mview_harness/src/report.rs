//! Structured run results.
//!
//! Tasks return [`TaskReport`]s; the orchestrator folds them into per-batch
//! and per-run summaries that can be logged or written out as JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::config::HarnessConfig;
use crate::task::{FaultKind, Step, TaskReport};
use crate::verify::Verification;

/// Fault counters aggregated over many tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FaultTally {
    pub tasks: u64,
    /// Tasks that did not run to completion.
    pub panicked: u64,
    pub store_calls: u64,
    pub transient_io: u64,
    pub consistency: u64,
    /// Faults per step, keyed by step name.
    pub by_step: BTreeMap<String, u64>,
}

impl FaultTally {
    pub fn record(&mut self, report: &TaskReport) {
        self.tasks += 1;
        self.store_calls += u64::from(report.store_calls);
        for fault in &report.faults {
            match fault.kind {
                FaultKind::TransientIo => self.transient_io += 1,
                FaultKind::Consistency => self.consistency += 1,
            }
            *self.by_step.entry(step_name(fault.step)).or_default() += 1;
        }
    }

    pub fn merge(&mut self, other: &FaultTally) {
        self.tasks += other.tasks;
        self.panicked += other.panicked;
        self.store_calls += other.store_calls;
        self.transient_io += other.transient_io;
        self.consistency += other.consistency;
        for (step, count) in &other.by_step {
            *self.by_step.entry(step.clone()).or_default() += count;
        }
    }

    pub fn total_faults(&self) -> u64 {
        self.transient_io + self.consistency
    }
}

fn step_name(step: Step) -> String {
    serde_json::to_value(step)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{step:?}"))
}

/// One drained batch plus its convergence check.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub group_key: String,
    pub tasks: u64,
    /// Wall-clock time from first submission to drain.
    pub elapsed: Duration,
    pub peak_running: usize,
    pub faults: FaultTally,
    pub verification: Verification,
}

impl BatchReport {
    /// Tasks per second over the batch's wall-clock time.
    pub fn throughput(&self) -> f64 {
        rate(self.tasks, self.elapsed)
    }
}

/// Summary of a convergence run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub meta: RunMeta,
    pub batches: Vec<BatchReport>,
    pub requests: u64,
    pub elapsed: Duration,
    pub faults: FaultTally,
    /// Batches whose view matched the primary table.
    pub converged_batches: usize,
    /// Batches still divergent after the retry budget.
    pub diverged_batches: usize,
    pub total_retries: u64,
    /// Whole-table count when the final-count toggle is on.
    pub final_count: Option<u64>,
}

impl RunReport {
    pub fn from_batches(
        meta: RunMeta,
        batches: Vec<BatchReport>,
        elapsed: Duration,
        final_count: Option<u64>,
    ) -> Self {
        let mut faults = FaultTally::default();
        for batch in &batches {
            faults.merge(&batch.faults);
        }
        let converged_batches = batches.iter().filter(|b| b.verification.matched).count();
        Self {
            requests: batches.iter().map(|b| b.tasks).sum(),
            diverged_batches: batches.len() - converged_batches,
            converged_batches,
            total_retries: batches
                .iter()
                .map(|b| u64::from(b.verification.retries))
                .sum(),
            meta,
            batches,
            elapsed,
            faults,
            final_count,
        }
    }

    pub fn all_converged(&self) -> bool {
        self.diverged_batches == 0
    }
}

/// Flat CRUD load run.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub meta: RunMeta,
    pub requests: u64,
    pub elapsed: Duration,
    pub peak_running: usize,
    pub faults: FaultTally,
    pub final_count: Option<u64>,
}

impl LoadReport {
    pub fn throughput(&self) -> f64 {
        rate(self.requests, self.elapsed)
    }
}

/// Random range reads against the view.
#[derive(Debug, Clone, Serialize)]
pub struct SelectReport {
    pub meta: RunMeta,
    pub iterations: u64,
    pub failures: u64,
    pub rows_returned: u64,
    pub elapsed: Duration,
    pub latency: LatencySummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl LatencySummary {
    pub fn from_samples(mut samples: Vec<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let pick = |q: f64| {
            let idx = ((samples.len() - 1) as f64 * q).round() as usize;
            samples[idx.min(samples.len() - 1)]
        };
        Self {
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
            max: samples[samples.len() - 1],
        }
    }
}

/// Run parameters embedded in every report for reproducibility.
#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub mode: &'static str,
    pub seed: u64,
    pub config: HarnessConfig,
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    count as f64 / secs
}

/// Serialize a report as pretty JSON, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, report: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Fault;

    fn task(faults: Vec<(Step, FaultKind)>) -> TaskReport {
        TaskReport {
            group_key: "user1".into(),
            code: "c".into(),
            store_calls: 6,
            faults: faults
                .into_iter()
                .map(|(step, kind)| Fault {
                    step,
                    kind,
                    detail: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn tally_counts_kinds_and_steps() {
        let mut tally = FaultTally::default();
        tally.record(&task(vec![]));
        tally.record(&task(vec![
            (Step::Insert, FaultKind::TransientIo),
            (Step::ViewCheck, FaultKind::Consistency),
        ]));
        assert_eq!(tally.tasks, 2);
        assert_eq!(tally.store_calls, 12);
        assert_eq!(tally.transient_io, 1);
        assert_eq!(tally.consistency, 1);
        assert_eq!(tally.by_step.get("view_check"), Some(&1));
        assert_eq!(tally.total_faults(), 2);

        let mut merged = FaultTally::default();
        merged.merge(&tally);
        merged.merge(&tally);
        assert_eq!(merged.by_step.get("insert"), Some(&2));
    }

    #[test]
    fn batch_throughput_is_tasks_per_second() {
        let batch = BatchReport {
            group_key: "user1".into(),
            tasks: 500,
            elapsed: Duration::from_millis(250),
            peak_running: 20,
            faults: FaultTally::default(),
            verification: Verification {
                group_key: "user1".into(),
                expected: 500,
                primary_count: Some(500),
                view_count: Some(500),
                retries: 0,
                matched: true,
                elapsed: Duration::ZERO,
            },
        };
        assert!((batch.throughput() - 2000.0).abs() < 1e-9);

        let instant = BatchReport {
            elapsed: Duration::ZERO,
            ..batch
        };
        assert_eq!(instant.throughput(), 0.0);
    }

    #[test]
    fn latency_percentiles_pick_sorted_samples() {
        let samples = (1..=100).rev().map(Duration::from_millis).collect();
        let summary = LatencySummary::from_samples(samples);
        assert_eq!(summary.p50, Duration::from_millis(51));
        assert_eq!(summary.p99, Duration::from_millis(99));
        assert_eq!(summary.max, Duration::from_millis(100));
        assert_eq!(LatencySummary::from_samples(Vec::new()), LatencySummary::default());
    }

    #[test]
    fn json_report_lands_in_nested_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports/run.json");
        let summary = LatencySummary::from_samples(vec![Duration::from_millis(3)]);
        write_json(&path, &summary).expect("write");
        let body = std::fs::read_to_string(&path).expect("read");
        let parsed: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert!(parsed.get("p95").is_some());
    }
}
