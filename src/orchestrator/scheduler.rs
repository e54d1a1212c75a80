//! Test run scheduler: dispatches cases onto reserved environments.
//!
//! The scheduler owns the queue of pending attempts, ordered by priority
//! (lower first) then declaration order. One loop dispatches and collects:
//!
//! ```text
//!        ┌──────────── queue (priority, index) ◄──────────── retry after backoff
//!        │                                                    requeue after delay
//!        ▼                                                            ▲
//!  pool.reserve() ── Ok ──► driver.run() ──► pool.release() ──► record ┘
//!        │
//!        └─ NoMatch ─► pool.assess()
//!                        Busy           ─► requeue (or bounded wait)
//!                        Provisionable  ─► provision in background, requeue
//!                        Unsatisfiable  ─► Blocked
//! ```
//!
//! At most `max_concurrent` attempts hold or wait for an environment at a
//! time. Provisioning runs alongside and does not count against that limit.
//!
//! On cancellation pending cases are recorded Cancelled without running;
//! in-flight attempts see the same token, clean up and record Cancelled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::driver::ExecutionDriver;
use super::pool::{Assessment, EnvironmentPool, PoolError, Reservation};
use super::retry::{NextStep, RetryPolicy};
use crate::config::WaitMode;
use crate::environment::{EnvironmentId, Template};
use crate::report::{Aggregator, Reporter, RunRecord};
use crate::suite::{Outcome, TestCase};

/// Provisioning failures after which a template is no longer tried.
const MAX_PROVISION_FAILURES: usize = 3;

/// Scheduling settings.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_concurrent: usize,
    /// Default retry policy; cases may override parts of it.
    pub retry: RetryPolicy,
    pub wait_mode: WaitMode,
    /// Delay before a case that found every match busy is tried again.
    pub requeue_delay: Duration,
    /// How long in-flight attempts get to wind down after cancellation.
    pub cancel_grace: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            retry: RetryPolicy::default(),
            wait_mode: WaitMode::NoWait,
            requeue_delay: Duration::from_millis(500),
            cancel_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    index: usize,
    priority: u8,
    attempt: u32,
    not_before: Instant,
}

enum Event {
    Finished {
        index: usize,
        record: RunRecord,
    },
    /// A bounded wait ended without a reservation.
    Unreserved {
        index: usize,
        attempt: u32,
        error: PoolError,
    },
    Provisioned {
        template: String,
        result: Result<EnvironmentId, PoolError>,
    },
}

/// Mutable state of one run, owned by the dispatch loop.
struct RunState {
    queue: Vec<Pending>,
    /// Attempts holding or waiting for an environment, by case index.
    active: BTreeMap<usize, u32>,
    provisioning: HashSet<String>,
    provision_failures: HashMap<String, usize>,
    aggregator: Aggregator,
}

impl RunState {
    fn enqueue(&mut self, pending: Pending) {
        let key = (pending.priority, pending.index);
        let at = self
            .queue
            .partition_point(|p| (p.priority, p.index) <= key);
        self.queue.insert(at, pending);
    }
}

/// Dispatches test cases onto environments from an [`EnvironmentPool`].
pub struct Scheduler<'a> {
    pool: Arc<EnvironmentPool>,
    driver: Arc<ExecutionDriver>,
    reporter: &'a dyn Reporter,
    options: SchedulerOptions,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        pool: Arc<EnvironmentPool>,
        driver: Arc<ExecutionDriver>,
        reporter: &'a dyn Reporter,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            pool,
            driver,
            reporter,
            options,
        }
    }

    /// Runs every case to a final status and returns the records.
    ///
    /// Discovers environments first. If none exist and discovery failed,
    /// the run is fatal: every case is recorded Errored.
    pub async fn run(&self, cases: &'a [TestCase], cancel: &CancellationToken) -> Aggregator {
        let mut state = RunState {
            queue: Vec::new(),
            active: BTreeMap::new(),
            provisioning: HashSet::new(),
            provision_failures: HashMap::new(),
            aggregator: Aggregator::new(),
        };

        if let Err(e) = self.pool.discover().await {
            warn!("Environment discovery failed: {}", e);
            if self.pool.live_count() == 0 {
                let message = format!("no environments available: {}", e);
                error!("{}", message);
                for case in cases {
                    self.finish(&mut state, RunRecord::not_run(&case.id, 1, Outcome::Errored, &message))
                        .await;
                }
                state.aggregator.set_fatal(message);
                return state.aggregator;
            }
        }

        let now = Instant::now();
        for (index, case) in cases.iter().enumerate() {
            if case.skip {
                let reason = case.skip_reason.clone().unwrap_or_else(|| "skipped by suite".to_string());
                self.finish(&mut state, RunRecord::not_run(&case.id, 1, Outcome::Skipped, reason))
                    .await;
                continue;
            }
            state.enqueue(Pending {
                index,
                priority: case.priority,
                attempt: 1,
                not_before: now,
            });
        }

        let mut in_flight: FuturesUnordered<BoxFuture<'a, Event>> = FuturesUnordered::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.dispatch(&mut state, cases, &mut in_flight, cancel).await;

            if state.queue.is_empty() && in_flight.is_empty() {
                break;
            }

            let has_capacity = state.active.len() < self.options.max_concurrent;
            let next_due = state.queue.iter().map(|p| p.not_before).min();
            let wake = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = in_flight.next(), if !in_flight.is_empty() => {
                    self.handle(&mut state, cases, event, cancel).await;
                }
                _ = tokio::time::sleep_until(wake), if next_due.is_some() && has_capacity => {}
            }
        }

        if cancel.is_cancelled() {
            self.wind_down(&mut state, cases, in_flight, cancel).await;
        }
        state.aggregator
    }

    async fn wind_down(
        &self,
        state: &mut RunState,
        cases: &'a [TestCase],
        mut in_flight: FuturesUnordered<BoxFuture<'a, Event>>,
        cancel: &CancellationToken,
    ) {
        info!("Run cancelled; waiting for {} in-flight attempt(s)", state.active.len());
        self.pool.close();

        for pending in std::mem::take(&mut state.queue) {
            let record = RunRecord::not_run(
                &cases[pending.index].id,
                pending.attempt,
                Outcome::Cancelled,
                "cancelled before it ran",
            );
            self.finish(state, record).await;
        }

        let deadline = Instant::now() + self.options.cancel_grace * 2;
        loop {
            match tokio::time::timeout_at(deadline, in_flight.next()).await {
                Ok(Some(event)) => self.handle(state, cases, event, cancel).await,
                Ok(None) => break,
                Err(_) => {
                    warn!("In-flight attempts did not finish within the grace period");
                    break;
                }
            }
        }
        drop(in_flight);

        for (index, attempt) in std::mem::take(&mut state.active) {
            let record = RunRecord::not_run(&cases[index].id, attempt, Outcome::Cancelled, "abandoned after cancellation");
            self.finish(state, record).await;
        }
    }

    /// Starts every due case that can start now.
    async fn dispatch(
        &self,
        state: &mut RunState,
        cases: &'a [TestCase],
        in_flight: &mut FuturesUnordered<BoxFuture<'a, Event>>,
        cancel: &CancellationToken,
    ) {
        let now = Instant::now();
        let mut i = 0;
        while i < state.queue.len() && state.active.len() < self.options.max_concurrent {
            if state.queue[i].not_before > now {
                i += 1;
                continue;
            }
            let pending = state.queue[i];
            let case = &cases[pending.index];

            match self.pool.reserve(&case.requirement) {
                Ok(reservation) => {
                    state.queue.remove(i);
                    state.active.insert(pending.index, pending.attempt);
                    in_flight.push(self.attempt(pending, case, Some(reservation), cancel));
                    continue;
                }
                Err(PoolError::NoMatch) => {}
                Err(e) => warn!("[{}] reservation failed: {}", case.id, e),
            }

            match self.pool.assess(&case.requirement) {
                Assessment::Provisionable(template) => {
                    let failures = state.provision_failures.get(&template.name).copied().unwrap_or(0);
                    if failures >= MAX_PROVISION_FAILURES {
                        state.queue.remove(i);
                        let record = RunRecord::not_run(
                            &case.id,
                            pending.attempt,
                            Outcome::Errored,
                            format!("provisioning from '{}' keeps failing", template.name),
                        );
                        self.finish(state, record).await;
                        continue;
                    }
                    if state.provisioning.insert(template.name.clone()) {
                        debug!("[{}] provisioning from '{}'", case.id, template.name);
                        in_flight.push(self.provision(template));
                    }
                    state.queue[i].not_before = now + self.options.requeue_delay;
                    i += 1;
                }
                Assessment::Busy => match self.options.wait_mode {
                    WaitMode::BoundedWait(_) => {
                        state.queue.remove(i);
                        state.active.insert(pending.index, pending.attempt);
                        in_flight.push(self.attempt(pending, case, None, cancel));
                    }
                    WaitMode::NoWait => {
                        state.queue[i].not_before = now + self.options.requeue_delay;
                        i += 1;
                    }
                },
                Assessment::Unsatisfiable => {
                    state.queue.remove(i);
                    let record = RunRecord::not_run(
                        &case.id,
                        pending.attempt,
                        Outcome::Blocked,
                        "no current or provisionable environment satisfies the requirement",
                    );
                    self.finish(state, record).await;
                }
            }
        }
    }

    /// One attempt: reserve (or wait), run, release.
    fn attempt(
        &self,
        pending: Pending,
        case: &'a TestCase,
        reservation: Option<Reservation>,
        cancel: &CancellationToken,
    ) -> BoxFuture<'a, Event> {
        let pool = self.pool.clone();
        let driver = self.driver.clone();
        let reporter = self.reporter;
        let wait_mode = self.options.wait_mode;
        let cancel = cancel.clone();

        async move {
            let mut reservation = match reservation {
                Some(reservation) => reservation,
                None => {
                    let waited = tokio::select! {
                        result = pool.reserve_with(&case.requirement, wait_mode) => result,
                        _ = cancel.cancelled() => Err(PoolError::NoMatch),
                    };
                    match waited {
                        Ok(reservation) => reservation,
                        Err(error) => {
                            return Event::Unreserved {
                                index: pending.index,
                                attempt: pending.attempt,
                                error,
                            };
                        }
                    }
                }
            };

            reservation.bind(case.id.as_str());
            reservation.collect_diagnostics_into(driver.artifacts_dir(&case.id, pending.attempt));
            pool.mark_in_use(&reservation);
            reporter
                .on_attempt_start(case, pending.attempt, reservation.environment().name())
                .await;

            let record = driver
                .run(case, pending.attempt, reservation.environment(), &cancel)
                .await;
            pool.release(reservation, record.outcome.taints_environment()).await;

            Event::Finished {
                index: pending.index,
                record,
            }
        }
        .boxed()
    }

    fn provision(&self, template: Template) -> BoxFuture<'a, Event> {
        let pool = self.pool.clone();
        async move {
            let result = pool.provision(&template).await;
            Event::Provisioned {
                template: template.name,
                result,
            }
        }
        .boxed()
    }

    async fn handle(&self, state: &mut RunState, cases: &'a [TestCase], event: Event, cancel: &CancellationToken) {
        match event {
            Event::Finished { index, record } => {
                state.active.remove(&index);
                let case = &cases[index];
                let attempt = record.attempt;
                let outcome = record.outcome;

                let policy = case.retry_policy(&self.options.retry);
                let next = if cancel.is_cancelled() {
                    NextStep::Finalize
                } else {
                    policy.next(attempt, outcome)
                };
                self.record(state, record, matches!(next, NextStep::Finalize)).await;

                if let NextStep::Retry { attempt, delay } = next {
                    info!("[{}] {} on attempt {}, retrying in {:?}", case.id, outcome, attempt - 1, delay);
                    state.enqueue(Pending {
                        index,
                        priority: case.priority,
                        attempt,
                        not_before: Instant::now() + delay,
                    });
                }
            }
            Event::Unreserved { index, attempt, error } => {
                state.active.remove(&index);
                let case = &cases[index];
                if cancel.is_cancelled() {
                    let record = RunRecord::not_run(&case.id, attempt, Outcome::Cancelled, "cancelled before it ran");
                    self.finish(state, record).await;
                } else {
                    debug!("[{}] {}; requeueing", case.id, error);
                    state.enqueue(Pending {
                        index,
                        priority: case.priority,
                        attempt,
                        not_before: Instant::now() + self.options.requeue_delay,
                    });
                }
            }
            Event::Provisioned { template, result } => {
                state.provisioning.remove(&template);
                match result {
                    Ok(id) => debug!("{} provisioned from '{}'", id, template),
                    Err(PoolError::TemplateExhausted(_)) => {}
                    Err(e) => {
                        warn!("Provisioning from '{}' failed: {}", template, e);
                        *state.provision_failures.entry(template).or_insert(0) += 1;
                        if !cancel.is_cancelled() {
                            self.check_fatal(state, cases, &e).await;
                        }
                    }
                }
            }
        }
    }

    /// A failed provisioning is fatal only when nothing is left in the pool
    /// and rediscovery brings nothing back.
    async fn check_fatal(&self, state: &mut RunState, cases: &'a [TestCase], cause: &PoolError) {
        if self.pool.live_count() > 0 || !state.provisioning.is_empty() {
            return;
        }
        if let Err(e) = self.pool.discover().await {
            warn!("Rediscovery failed: {}", e);
        }
        if self.pool.live_count() > 0 {
            return;
        }

        let message = format!("no environments left and none could be provisioned: {}", cause);
        error!("{}", message);
        for pending in std::mem::take(&mut state.queue) {
            let record = RunRecord::not_run(&cases[pending.index].id, pending.attempt, Outcome::Errored, &message);
            self.finish(state, record).await;
        }
        state.aggregator.set_fatal(message);
    }

    async fn finish(&self, state: &mut RunState, record: RunRecord) {
        self.record(state, record, true).await;
    }

    async fn record(&self, state: &mut RunState, record: RunRecord, is_final: bool) {
        self.reporter.on_record(&record, is_final).await;
        if let Err(e) = state.aggregator.record(record) {
            error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityValue, StaticProbe};
    use crate::config::{EnvironmentConfig, LocalNodeConfig, NodeConfig, ProvisionerConfig, TemplateConfig};
    use crate::orchestrator::driver::DriverOptions;
    use crate::orchestrator::pool::PoolOptions;
    use crate::provider::command::CommandProvider;
    use crate::provider::static_hosts::StaticProvider;
    use crate::provider::{CompositeProvider, EnvironmentProvider};
    use crate::report::NullReporter;
    use crate::requirement::{Predicate, Requirement};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn linux_env(name: &str, cores: i64) -> EnvironmentConfig {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("os".to_string(), CapabilityValue::from("linux"));
        capabilities.insert("cores".to_string(), CapabilityValue::Integer(cores));
        EnvironmentConfig {
            name: name.to_string(),
            nodes: vec![NodeConfig::Local(LocalNodeConfig::default())],
            capabilities,
        }
    }

    struct Harness {
        pool: Arc<EnvironmentPool>,
        driver: Arc<ExecutionDriver>,
        _out: TempDir,
    }

    fn harness(envs: Vec<EnvironmentConfig>) -> Harness {
        let out = TempDir::new().unwrap();
        let pool = Arc::new(EnvironmentPool::new(
            Arc::new(StaticProvider::new(envs)),
            Arc::new(StaticProbe),
            PoolOptions::default(),
        ));
        let driver = Arc::new(ExecutionDriver::new(DriverOptions {
            output_dir: out.path().to_path_buf(),
            ..Default::default()
        }));
        Harness { pool, driver, _out: out }
    }

    fn harness_with(provider: Arc<dyn EnvironmentProvider>, out: TempDir) -> Harness {
        let pool = Arc::new(EnvironmentPool::new(
            provider,
            Arc::new(StaticProbe),
            PoolOptions::default(),
        ));
        let driver = Arc::new(ExecutionDriver::new(DriverOptions {
            output_dir: out.path().join("results"),
            ..Default::default()
        }));
        Harness { pool, driver, _out: out }
    }

    /// Shell provisioner with one template declaring `os = "linux"`.
    fn provisioner(dir: &std::path::Path, create: &str, nodes: usize) -> CommandProvider {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("os".to_string(), CapabilityValue::from("linux"));
        let config = ProvisionerConfig {
            create_command: create.to_string(),
            destroy_command: "true".to_string(),
            diagnostics_command: None,
            working_dir: Some(dir.to_path_buf()),
            timeout_secs: 10,
            templates: vec![TemplateConfig {
                name: "vm".to_string(),
                max_instances: 1,
                nodes,
                capabilities,
                ssh: None,
            }],
        };
        CommandProvider::new(config, dir)
    }

    fn options() -> SchedulerOptions {
        SchedulerOptions {
            requeue_delay: Duration::from_millis(20),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn case(id: &str, command: &str) -> TestCase {
        let mut case = TestCase::new(id, command);
        case.requirement = Requirement::any().with(Predicate::eq("os", "linux"));
        case
    }

    #[tokio::test]
    async fn test_runs_all_cases_on_one_environment() {
        let h = harness(vec![linux_env("box", 4)]);
        let cases = vec![case("a", "true"), case("b", "exit 1"), case("c", "true")];
        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());

        let agg = scheduler.run(&cases, &CancellationToken::new()).await;
        let summary = agg.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.count(Outcome::Passed), 2);
        assert_eq!(summary.count(Outcome::Failed), 1);
        assert_eq!(h.pool.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_unsatisfiable_case_is_blocked() {
        let h = harness(vec![linux_env("box", 4)]);
        let mut windows = TestCase::new("win", "true");
        windows.requirement = Requirement::any().with(Predicate::eq("os", "windows"));
        let cases = vec![windows, case("linux", "true")];
        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());

        let agg = scheduler.run(&cases, &CancellationToken::new()).await;
        assert_eq!(agg.final_status("win"), Some(Outcome::Blocked));
        assert_eq!(agg.final_status("linux"), Some(Outcome::Passed));
        assert_eq!(agg.summary().exit_code(), 2);
    }

    #[tokio::test]
    async fn test_skip_flag_records_skipped() {
        let h = harness(vec![linux_env("box", 4)]);
        let mut skipped = case("later", "exit 1");
        skipped.skip = true;
        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());

        let agg = scheduler.run(std::slice::from_ref(&skipped), &CancellationToken::new()).await;
        assert_eq!(agg.final_status("later"), Some(Outcome::Skipped));
        assert_eq!(agg.records()[0].message.as_deref(), Some("skipped by suite"));
    }

    #[tokio::test]
    async fn test_timeout_retries_on_fresh_environment() {
        let h = harness(vec![linux_env("box", 4)]);
        let marker = TempDir::new().unwrap();
        let flag = marker.path().join("seen");
        // First attempt hangs past its timeout, second finishes at once.
        let command = format!(
            "if [ -e {0} ]; then exit 0; else touch {0}; sleep 5; fi",
            flag.display()
        );
        let mut flaky = case("flaky", &command);
        flaky.timeout_secs = Some(1);
        flaky.retry.max_attempts = Some(2);
        let cases = vec![flaky];

        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());
        let agg = scheduler.run(&cases, &CancellationToken::new()).await;

        let records = agg.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, Outcome::TimedOut);
        assert_eq!(records[1].outcome, Outcome::Passed);
        assert_eq!(agg.summary().flaky, 1);

        // The tainted environment was replaced under a new id.
        let snapshot = h.pool.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_ne!(snapshot[0].id, EnvironmentId(1));
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let h = harness(vec![linux_env("box", 4)]);
        let mut failing = case("always", "exit 2");
        failing.retry.max_attempts = Some(3);
        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());

        let agg = scheduler.run(std::slice::from_ref(&failing), &CancellationToken::new()).await;
        assert_eq!(agg.records().len(), 3);
        assert!(agg.records().iter().enumerate().all(|(i, r)| r.attempt == i as u32 + 1));
        assert_eq!(agg.final_status("always"), Some(Outcome::Failed));
    }

    #[tokio::test]
    async fn test_priority_orders_dispatch() {
        let h = harness(vec![linux_env("box", 4)]);
        let mut low = case("low", "true");
        low.priority = 5;
        let mut high = case("high", "true");
        high.priority = 0;
        let cases = vec![low, case("mid", "true"), high];

        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());
        let agg = scheduler.run(&cases, &CancellationToken::new()).await;
        let order: Vec<&str> = agg.records().iter().map(|r| r.case_id.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_parallel_environments() {
        let h = harness(vec![linux_env("one", 4), linux_env("two", 4)]);
        let cases = vec![case("a", "sleep 1"), case("b", "sleep 1")];
        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());

        let started = std::time::Instant::now();
        let agg = scheduler.run(&cases, &CancellationToken::new()).await;
        assert!(started.elapsed() < Duration::from_millis(1900));
        let envs: HashSet<_> = agg.records().iter().filter_map(|r| r.environment.clone()).collect();
        assert_eq!(envs.len(), 2);
    }

    #[tokio::test]
    async fn test_bounded_wait_mode() {
        let h = harness(vec![linux_env("box", 4)]);
        let cases = vec![case("a", "sleep 0.2"), case("b", "true")];
        let reporter = NullReporter;
        let scheduler = Scheduler::new(
            h.pool.clone(),
            h.driver.clone(),
            &reporter,
            SchedulerOptions {
                wait_mode: WaitMode::BoundedWait(Duration::from_secs(10)),
                ..options()
            },
        );
        let agg = scheduler.run(&cases, &CancellationToken::new()).await;
        assert_eq!(agg.summary().count(Outcome::Passed), 2);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_reservations() {
        let h = harness(vec![linux_env("one", 4), linux_env("two", 4)]);
        let cases = vec![
            case("a", "sleep 30"),
            case("b", "sleep 30"),
            case("c", "sleep 30"),
        ];
        let reporter = NullReporter;
        let scheduler = Scheduler::new(
            h.pool.clone(),
            h.driver.clone(),
            &reporter,
            SchedulerOptions {
                cancel_grace: Duration::from_secs(5),
                ..options()
            },
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let agg = scheduler.run(&cases, &cancel).await;
        assert!(started.elapsed() < Duration::from_secs(10));

        let summary = agg.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.count(Outcome::Cancelled), 3);
        assert_eq!(h.pool.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_no_environments_configured_blocks_case() {
        let h = harness(vec![]);
        let cases = vec![case("a", "true")];
        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());
        let agg = scheduler.run(&cases, &CancellationToken::new()).await;
        // Nothing configured is not an error; the case is just blocked.
        assert_eq!(agg.final_status("a"), Some(Outcome::Blocked));
        assert!(agg.fatal().is_none());
    }

    #[tokio::test]
    async fn test_multi_node_template_is_provisioned() {
        let out = TempDir::new().unwrap();
        let create = r#"echo '{"id":"vm-{name}","nodes":[{"type":"local"},{"type":"local"}]}'"#;
        let provider = provisioner(out.path(), create, 2);
        let h = harness_with(Arc::new(provider), out);

        let mut pair = case("pair", "test \"$LISA_NODE_COUNT\" = 2");
        pair.requirement = pair.requirement.nodes(2);
        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());

        let agg = scheduler.run(std::slice::from_ref(&pair), &CancellationToken::new()).await;
        assert_eq!(agg.final_status("pair"), Some(Outcome::Passed));
        assert_eq!(h.pool.live_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_provisioning_with_empty_pool_is_fatal() {
        let out = TempDir::new().unwrap();
        let provider = provisioner(out.path(), "echo quota exceeded >&2; exit 1", 1);
        let h = harness_with(Arc::new(provider), out);

        let cases = vec![case("a", "true"), case("b", "true")];
        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());

        let agg = scheduler.run(&cases, &CancellationToken::new()).await;
        assert!(agg.fatal().is_some_and(|m| m.contains("none could be provisioned")));
        assert_eq!(agg.final_status("a"), Some(Outcome::Errored));
        assert_eq!(agg.final_status("b"), Some(Outcome::Errored));
        let summary = agg.summary();
        assert_eq!(summary.count(Outcome::Errored), 2);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_template_given_up_after_repeated_failures() {
        let out = TempDir::new().unwrap();
        let failing = provisioner(out.path(), "exit 1", 2);
        let provider = CompositeProvider::new(vec![
            Box::new(StaticProvider::new(vec![linux_env("box", 4)])),
            Box::new(failing),
        ]);
        let h = harness_with(Arc::new(provider), out);

        // Only the failing two-node template could host this one.
        let mut needs_vm = case("needs_vm", "true");
        needs_vm.requirement = needs_vm.requirement.nodes(2);
        let cases = vec![needs_vm, case("fits_box", "true")];
        let reporter = NullReporter;
        let scheduler = Scheduler::new(h.pool.clone(), h.driver.clone(), &reporter, options());

        let agg = scheduler.run(&cases, &CancellationToken::new()).await;
        assert!(agg.fatal().is_none());
        assert_eq!(agg.final_status("fits_box"), Some(Outcome::Passed));
        assert_eq!(agg.final_status("needs_vm"), Some(Outcome::Errored));
        let record = agg.records().iter().find(|r| r.case_id == "needs_vm").unwrap();
        assert!(record.message.as_deref().is_some_and(|m| m.contains("keeps failing")));
        assert_eq!(agg.summary().exit_code(), 1);
    }
}
