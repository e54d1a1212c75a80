//! Test execution engine and orchestration.
//!
//! This module ties the environment pool, the scheduler and the execution
//! driver together into a run.
//!
//! # Architecture
//!
//! ```text
//!    Suite                    Scheduler                    EnvironmentPool
//!      │                          │                              │
//!      │ cases ─────────────────► │ discover() ─────────────────►│ provider.discover()
//!      │                          │                              │ prepare + probe
//!      │                          │ reserve(requirement) ───────►│ Matcher.score()
//!      │                          │ ◄──────────── Reservation ───┤
//!      │                          ▼                              │
//!      │                   ExecutionDriver                       │
//!      │                   setup / command / cleanup             │
//!      │                   via Node (local | ssh)                │
//!      │                          │                              │
//!      │                          │ release(taint) ─────────────►│ Ready | teardown
//!      │                          ▼                              │   + re-provision
//!      │                      Aggregator ──► Reporter            │
//! ```
//!
//! # Key Components
//!
//! - [`Orchestrator`]: builds the pieces from a [`Config`] and runs a suite
//! - [`Scheduler`]: priority queue, dispatch, retries, cancellation
//! - [`ExecutionDriver`]: one attempt on one environment
//! - [`EnvironmentPool`]: environment lifecycle and reservations
//!
//! # Example
//!
//! ```no_run
//! use lisa::config::load_config;
//! use lisa::orchestrator::Orchestrator;
//! use lisa::report::ConsoleReporter;
//! use lisa::suite::Suite;
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("lisa.toml"))?;
//!     let suite = Suite::load(Path::new("suite.toml"))?;
//!
//!     let orchestrator = Orchestrator::new(config, Path::new("."));
//!     let reporter = ConsoleReporter::new(false);
//!     let report = orchestrator.run(&suite, &reporter, &CancellationToken::new()).await;
//!
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod driver;
pub mod pool;
pub mod retry;
pub mod scheduler;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capability::{CapabilityProbe, ShellProbe};
use crate::config::Config;
use crate::node::{OutputCallback, OutputLine};
use crate::provider::{self, EnvironmentProvider};
use crate::report::{Reporter, RunReport};
use crate::suite::Suite;

pub use driver::{DriverOptions, ExecutionDriver};
pub use pool::{Assessment, EnvironmentPool, EnvironmentSummary, PoolError, PoolOptions, Reservation};
pub use retry::{NextStep, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerOptions};

/// Where a case would run, as decided by [`Orchestrator::plan`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "target", rename_all = "lowercase")]
pub enum Placement {
    /// An existing environment, with its match score.
    Environment { name: String, score: f64 },
    /// A new environment from this template.
    Provision { template: String },
    Skipped,
    Blocked,
}

/// One line of a run plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEntry {
    pub case_id: String,
    #[serde(flatten)]
    pub placement: Placement,
}

/// Runs suites against the environments a configuration describes.
pub struct Orchestrator {
    config: Config,
    pool: Arc<EnvironmentPool>,
}

impl Orchestrator {
    /// Builds providers from the configuration and probes nodes with
    /// [`ShellProbe`]. `cache_dir` holds `.lisa/`.
    pub fn new(config: Config, cache_dir: &Path) -> Self {
        let provider: Arc<dyn EnvironmentProvider> = Arc::from(provider::from_config(&config, cache_dir));
        Self::with_parts(config, provider, Arc::new(ShellProbe::new()))
    }

    pub fn with_parts(
        config: Config,
        provider: Arc<dyn EnvironmentProvider>,
        probe: Arc<dyn CapabilityProbe>,
    ) -> Self {
        let pool = Arc::new(EnvironmentPool::new(
            provider,
            probe,
            PoolOptions {
                scoring: config.lisa.scoring,
                keep_environments: config.lisa.keep_environments,
                ..Default::default()
            },
        ));
        Self { config, pool }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<EnvironmentPool> {
        &self.pool
    }

    fn driver(&self) -> ExecutionDriver {
        let lisa = &self.config.lisa;
        let driver = ExecutionDriver::new(DriverOptions {
            default_timeout: Duration::from_secs(lisa.case_timeout_secs),
            skip_exit_code: lisa.skip_exit_code,
            cancel_grace: Duration::from_secs(lisa.cancel_grace_secs),
            output_dir: self.config.report.output_dir.clone(),
        });

        if lisa.stream_output {
            let callback: OutputCallback = Arc::new(|case_id, line| match line {
                OutputLine::Stdout(s) => println!("[{}] {}", case_id, s),
                OutputLine::Stderr(s) => eprintln!("[{}] {}", case_id, s),
            });
            driver.with_output_callback(callback)
        } else {
            driver
        }
    }

    fn scheduler_options(&self) -> SchedulerOptions {
        let lisa = &self.config.lisa;
        SchedulerOptions {
            max_concurrent: lisa.max_concurrent.max(1),
            retry: lisa.retry.policy(),
            wait_mode: lisa.reservation.wait_mode(),
            requeue_delay: Duration::from_millis(lisa.reservation.requeue_delay_ms),
            cancel_grace: Duration::from_secs(lisa.cancel_grace_secs),
        }
    }

    /// Runs every case of `suite` to a final status, then shuts the pool
    /// down. Always returns a report; failures are inside it.
    pub async fn run(&self, suite: &Suite, reporter: &dyn Reporter, cancel: &CancellationToken) -> RunReport {
        let started_at = Utc::now();
        info!("Running suite '{}' ({} cases)", suite.name(), suite.cases.len());
        reporter.on_run_start(suite.name(), &suite.cases).await;

        let scheduler = Scheduler::new(
            self.pool.clone(),
            Arc::new(self.driver()),
            reporter,
            self.scheduler_options(),
        );
        let aggregator = scheduler.run(&suite.cases, cancel).await;

        self.pool.close();
        self.pool.shutdown().await;

        let report = RunReport::new(suite.name(), started_at, &aggregator);
        reporter.on_run_complete(&report).await;
        report
    }

    /// Decides where each case would land if every environment were idle,
    /// without running anything. The pool is shut down afterwards.
    pub async fn plan(&self, suite: &Suite) -> Vec<PlanEntry> {
        if let Err(e) = self.pool.discover().await {
            warn!("Environment discovery failed: {}", e);
        }

        let entries = suite
            .cases
            .iter()
            .map(|case| {
                let placement = if case.skip {
                    Placement::Skipped
                } else if let Some((_, name, score)) = self.pool.best_match(&case.requirement) {
                    Placement::Environment { name, score }
                } else {
                    match self.pool.assess(&case.requirement) {
                        Assessment::Provisionable(template) => Placement::Provision {
                            template: template.name,
                        },
                        Assessment::Busy | Assessment::Unsatisfiable => Placement::Blocked,
                    }
                };
                PlanEntry {
                    case_id: case.id.clone(),
                    placement,
                }
            })
            .collect();

        self.pool.shutdown().await;
        entries
    }

    /// Discovers and prepares environments, reports them, then shuts the
    /// pool down.
    pub async fn environments(&self) -> Result<Vec<EnvironmentSummary>, PoolError> {
        let result = self.pool.discover().await;
        let snapshot = self.pool.snapshot();
        self.pool.shutdown().await;
        result.map(|_| snapshot)
    }
}
