//! Run records and their aggregation into a run summary.
//!
//! Every finalized attempt of every case becomes one [`RunRecord`]. The
//! [`Aggregator`] keeps them in the order they were finalized, earlier
//! attempts included, and derives each case's final status from its last
//! attempt.
//!
//! ```text
//! record(case-a #1 Failed) ──┐
//! record(case-b #1 Passed) ──┼──► [records...] ──► summary()
//! record(case-a #2 Passed) ──┘                      case-a: Passed (flaky)
//!                                                   case-b: Passed
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::suite::Outcome;

/// Finalized outcome of one attempt of one case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub case_id: String,

    /// 1-based attempt number.
    pub attempt: u32,

    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Name of the environment the attempt ran on.
    pub environment: Option<String>,

    /// Exit code of the main command, when it ran to completion.
    pub exit_code: Option<i32>,

    /// Combined output of setup, command and cleanup.
    pub log_path: Option<PathBuf>,

    /// Collected artifact files and directories.
    pub artifacts: Vec<PathBuf>,

    /// Human-readable reason for anything but a plain pass.
    pub message: Option<String>,
}

impl RunRecord {
    pub fn new(case_id: impl Into<String>, attempt: u32, outcome: Outcome) -> Self {
        let now = Utc::now();
        Self {
            case_id: case_id.into(),
            attempt,
            outcome,
            started_at: now,
            finished_at: now,
            environment: None,
            exit_code: None,
            log_path: None,
            artifacts: Vec::new(),
            message: None,
        }
    }

    /// Record for a case that never ran (skipped, blocked, cancelled while
    /// pending).
    pub fn not_run(
        case_id: impl Into<String>,
        attempt: u32,
        outcome: Outcome,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(case_id, attempt, outcome)
        }
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Raised when a record would break attempt ordering.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("Out-of-order record for '{case}': expected attempt {expected}, got {got}")]
    OutOfOrder { case: String, expected: u32, got: u32 },
}

/// Final status of one case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseSummary {
    pub id: String,
    pub outcome: Outcome,
    pub attempts: u32,
    /// Passed after at least one failed attempt.
    pub flaky: bool,
}

/// Derived view over all records of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    /// Number of cases per final status; every status is present.
    pub counts: BTreeMap<&'static str, usize>,

    /// One entry per case, in order of first record.
    pub cases: Vec<CaseSummary>,

    pub total: usize,
    pub flaky: usize,

    /// Run-level error that stopped execution early.
    pub fatal: Option<String>,
}

impl Summary {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(outcome.as_str()).copied().unwrap_or(0)
    }

    /// True when every case passed or was skipped and nothing was fatal.
    pub fn success(&self) -> bool {
        self.fatal.is_none() && self.cases.iter().all(|c| c.outcome.is_success())
    }

    /// Process exit code: 0 on success, 2 when the only problem is blocked
    /// cases, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            return 0;
        }
        let only_blocked = self.fatal.is_none()
            && self
                .cases
                .iter()
                .all(|c| c.outcome.is_success() || c.outcome == Outcome::Blocked);
        if only_blocked { 2 } else { 1 }
    }
}

/// Append-only store of run records.
#[derive(Debug, Default)]
pub struct Aggregator {
    records: Vec<RunRecord>,
    last_attempt: HashMap<String, u32>,
    order: Vec<String>,
    fatal: Option<String>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a finalized record.
    ///
    /// # Errors
    ///
    /// [`AggregateError::OutOfOrder`] unless the record's attempt number is
    /// exactly one more than the last one recorded for its case.
    pub fn record(&mut self, record: RunRecord) -> Result<(), AggregateError> {
        let expected = self.last_attempt.get(&record.case_id).copied().unwrap_or(0) + 1;
        if record.attempt != expected {
            return Err(AggregateError::OutOfOrder {
                case: record.case_id,
                expected,
                got: record.attempt,
            });
        }
        if expected == 1 {
            self.order.push(record.case_id.clone());
        }
        self.last_attempt.insert(record.case_id.clone(), record.attempt);
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    /// Attempts recorded so far for `case_id`.
    pub fn attempts(&self, case_id: &str) -> u32 {
        self.last_attempt.get(case_id).copied().unwrap_or(0)
    }

    /// Status of the last recorded attempt of `case_id`.
    pub fn final_status(&self, case_id: &str) -> Option<Outcome> {
        self.records
            .iter()
            .rev()
            .find(|r| r.case_id == case_id)
            .map(|r| r.outcome)
    }

    pub fn set_fatal(&mut self, message: impl Into<String>) {
        self.fatal = Some(message.into());
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn summary(&self) -> Summary {
        let mut counts: BTreeMap<&'static str, usize> =
            Outcome::ALL.iter().map(|o| (o.as_str(), 0)).collect();
        let mut cases = Vec::with_capacity(self.order.len());

        for id in &self.order {
            let attempts: Vec<&RunRecord> =
                self.records.iter().filter(|r| &r.case_id == id).collect();
            let Some(last) = attempts.last() else {
                continue;
            };
            let flaky = last.outcome == Outcome::Passed
                && attempts.iter().any(|r| !r.outcome.is_success());

            *counts.entry(last.outcome.as_str()).or_insert(0) += 1;
            cases.push(CaseSummary {
                id: id.clone(),
                outcome: last.outcome,
                attempts: last.attempt,
                flaky,
            });
        }

        Summary {
            counts,
            total: cases.len(),
            flaky: cases.iter().filter(|c| c.flaky).count(),
            cases,
            fatal: self.fatal.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_must_be_consecutive() {
        let mut agg = Aggregator::new();
        assert!(matches!(
            agg.record(RunRecord::new("a", 2, Outcome::Passed)),
            Err(AggregateError::OutOfOrder { expected: 1, got: 2, .. })
        ));

        agg.record(RunRecord::new("a", 1, Outcome::Failed)).unwrap();
        assert!(agg.record(RunRecord::new("a", 1, Outcome::Passed)).is_err());
        agg.record(RunRecord::new("a", 2, Outcome::Passed)).unwrap();
        assert_eq!(agg.attempts("a"), 2);
        assert_eq!(agg.records().len(), 2);
    }

    #[test]
    fn test_final_status_is_last_attempt() {
        let mut agg = Aggregator::new();
        agg.record(RunRecord::new("a", 1, Outcome::TimedOut)).unwrap();
        agg.record(RunRecord::new("b", 1, Outcome::Passed)).unwrap();
        agg.record(RunRecord::new("a", 2, Outcome::Passed)).unwrap();

        assert_eq!(agg.final_status("a"), Some(Outcome::Passed));
        assert_eq!(agg.final_status("missing"), None);

        let summary = agg.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.count(Outcome::Passed), 2);
        assert_eq!(summary.count(Outcome::TimedOut), 0);
        assert_eq!(summary.flaky, 1);
        assert_eq!(summary.cases[0].id, "a");
        assert_eq!(summary.cases[0].attempts, 2);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_exit_codes() {
        let mut agg = Aggregator::new();
        agg.record(RunRecord::new("ok", 1, Outcome::Passed)).unwrap();
        agg.record(RunRecord::new("skip", 1, Outcome::Skipped)).unwrap();
        agg.record(RunRecord::not_run("win", 1, Outcome::Blocked, "no windows"))
            .unwrap();
        assert_eq!(agg.summary().exit_code(), 2);

        agg.record(RunRecord::new("bad", 1, Outcome::Failed)).unwrap();
        assert_eq!(agg.summary().exit_code(), 1);

        let mut fatal = Aggregator::new();
        fatal.set_fatal("no environments");
        assert!(!fatal.summary().success());
        assert_eq!(fatal.summary().exit_code(), 1);
    }

    #[test]
    fn test_counts_cover_every_outcome() {
        let summary = Aggregator::new().summary();
        assert_eq!(summary.counts.len(), Outcome::ALL.len());
        assert!(summary.success());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["counts"]["blocked"], 0);
    }
}
