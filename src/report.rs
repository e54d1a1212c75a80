//! Run reporting: records, summaries and the reporters that present them.
//!
//! The scheduler feeds every finalized attempt to a [`Reporter`] as it
//! happens; at the end the orchestrator hands over the complete
//! [`RunReport`].
//!
//! | Reporter | Output |
//! |----------|--------|
//! | [`ConsoleReporter`] | Progress bar and summary on the terminal |
//! | [`JUnitReporter`] | JUnit XML for CI systems |
//! | [`JsonReporter`] | Full run report as JSON |
//! | [`MultiReporter`] | Fans out to several reporters |

pub mod aggregator;
pub mod json;
pub mod junit;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::suite::{Outcome, TestCase};

pub use aggregator::{AggregateError, Aggregator, CaseSummary, RunRecord, Summary};
pub use json::JsonReporter;
pub use junit::JUnitReporter;

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub suite: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub summary: Summary,
    /// Every attempt in the order it finalized.
    pub records: Vec<RunRecord>,
}

impl RunReport {
    pub fn new(suite: impl Into<String>, started_at: DateTime<Utc>, aggregator: &Aggregator) -> Self {
        let duration = (Utc::now() - started_at).to_std().unwrap_or_default();
        Self {
            suite: suite.into(),
            started_at,
            duration_secs: duration.as_secs_f64(),
            summary: aggregator.summary(),
            records: aggregator.records().to_vec(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }

    pub fn success(&self) -> bool {
        self.summary.success()
    }

    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code()
    }

    /// Records of `case_id`, earliest attempt first.
    pub fn attempts<'a>(&'a self, case_id: &'a str) -> impl Iterator<Item = &'a RunRecord> + 'a {
        self.records.iter().filter(move |r| r.case_id == case_id)
    }
}

/// Receives run events.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the suite is loaded, before anything runs.
    async fn on_run_start(&self, suite: &str, cases: &[TestCase]);

    /// Called when an attempt has its environment and starts running.
    async fn on_attempt_start(&self, case: &TestCase, attempt: u32, environment: &str);

    /// Called for every finalized attempt. `is_final` is set on the
    /// attempt that decides the case's status.
    async fn on_record(&self, record: &RunRecord, is_final: bool);

    /// Called when all cases have a final status.
    async fn on_run_complete(&self, report: &RunReport);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _suite: &str, _cases: &[TestCase]) {}
    async fn on_attempt_start(&self, _case: &TestCase, _attempt: u32, _environment: &str) {}
    async fn on_record(&self, _record: &RunRecord, _is_final: bool) {}
    async fn on_run_complete(&self, _report: &RunReport) {}
}

/// A reporter that combines multiple reporters.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, suite: &str, cases: &[TestCase]) {
        for reporter in &self.reporters {
            reporter.on_run_start(suite, cases).await;
        }
    }

    async fn on_attempt_start(&self, case: &TestCase, attempt: u32, environment: &str) {
        for reporter in &self.reporters {
            reporter.on_attempt_start(case, attempt, environment).await;
        }
    }

    async fn on_record(&self, record: &RunRecord, is_final: bool) {
        for reporter in &self.reporters {
            reporter.on_record(record, is_final).await;
        }
    }

    async fn on_run_complete(&self, report: &RunReport) {
        for reporter in &self.reporters {
            reporter.on_run_complete(report).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().and_then(|guard| guard.clone()) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

fn styled(outcome: Outcome) -> console::StyledObject<&'static str> {
    match outcome {
        Outcome::Passed => console::style("PASS").green(),
        Outcome::Failed => console::style("FAIL").red(),
        Outcome::Skipped => console::style("SKIP").yellow(),
        Outcome::TimedOut => console::style("TIME").red(),
        Outcome::Errored => console::style("ERR ").red().bold(),
        Outcome::Cancelled => console::style("CNCL").dim(),
        Outcome::Blocked => console::style("BLCK").magenta(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, suite: &str, cases: &[TestCase]) {
        println!("Running {} case(s) from '{}'", cases.len(), suite);

        let pb = indicatif::ProgressBar::new(cases.len() as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        if let Ok(mut guard) = self.progress.lock() {
            *guard = Some(pb);
        }
    }

    async fn on_attempt_start(&self, case: &TestCase, attempt: u32, environment: &str) {
        if self.verbose {
            self.println(format!("Running: {} (attempt {}) on {}", case.id, attempt, environment));
        }
    }

    async fn on_record(&self, record: &RunRecord, is_final: bool) {
        if is_final
            && let Ok(guard) = self.progress.lock()
            && let Some(pb) = guard.as_ref()
        {
            pb.inc(1);
        }

        if self.verbose || record.outcome != Outcome::Passed {
            let mut line = format!("{} {}", styled(record.outcome), record.case_id);
            if record.attempt > 1 || !is_final {
                line.push_str(&format!(" (attempt {})", record.attempt));
            }
            if let Some(message) = &record.message {
                line.push_str(&format!(" {}", console::style(message).dim()));
            }
            self.println(line);
        }
    }

    async fn on_run_complete(&self, report: &RunReport) {
        if let Ok(mut guard) = self.progress.lock()
            && let Some(pb) = guard.take()
        {
            pb.finish_and_clear();
        }
        print_summary(report);
    }
}

/// Prints a summary of the run to the console.
pub fn print_summary(report: &RunReport) {
    let summary = &report.summary;
    println!();
    println!("Test Results:");
    println!("  Total:     {}", summary.total);
    println!("  Passed:    {}", console::style(summary.count(Outcome::Passed)).green());
    println!("  Failed:    {}", console::style(summary.count(Outcome::Failed)).red());
    println!("  Skipped:   {}", console::style(summary.count(Outcome::Skipped)).yellow());

    for outcome in [Outcome::TimedOut, Outcome::Errored, Outcome::Cancelled, Outcome::Blocked] {
        let count = summary.count(outcome);
        if count > 0 {
            println!("  {:<10} {}", format!("{}:", capitalized(outcome)), console::style(count).red().bold());
        }
    }

    if summary.flaky > 0 {
        println!("  Flaky:     {}", console::style(summary.flaky).yellow());
    }

    println!("  Duration:  {:?}", report.duration());

    println!();
    if let Some(fatal) = &summary.fatal {
        println!("{}", console::style(format!("Run aborted: {}", fatal)).red().bold());
    } else if report.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else if report.exit_code() == 2 {
        println!("{}", console::style("Some cases had no matching environment.").magenta().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }

    let unsuccessful: Vec<&CaseSummary> = summary.cases.iter().filter(|c| !c.outcome.is_success()).collect();
    if !unsuccessful.is_empty() {
        println!();
        for case in unsuccessful {
            println!("  - {} [{}]", case.id, case.outcome);
            if let Some(record) = report.attempts(&case.id).last() {
                if let Some(message) = &record.message {
                    println!("    {}", console::style(message).dim());
                }
                if let Some(log) = &record.log_path {
                    println!("    {}", console::style(format!("log: {}", log.display())).dim());
                }
            }
        }
    }
}

fn capitalized(outcome: Outcome) -> String {
    let name = outcome.as_str();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
