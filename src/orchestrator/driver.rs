//! Execution driver: runs one attempt of one case on one environment.
//!
//! ```text
//! Pending ──► Running ──► setup (every node)
//!                          uploads (primary)
//!                          command (primary, case timeout)
//!                          artifacts (primary)
//!                          cleanup (every node, always)
//!                     ──► Passed | Failed | Skipped | TimedOut | Errored | Cancelled
//! ```
//!
//! Transport errors never escape the driver; they become outcomes:
//!
//! | Event | Outcome |
//! |-------|---------|
//! | exit code 0 | Passed |
//! | skip exit code (77) | Skipped |
//! | other exit code | Failed |
//! | case timeout | TimedOut |
//! | connection, transfer or setup failure | Errored |
//! | run cancelled | Cancelled |
//!
//! Cleanup failures are logged and never change the outcome. The scheduler
//! decides about retries; the driver only reports what happened.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::environment::Environment;
use crate::node::{Command, Direction, ExecResult, LineSink, Node, NodeError, OutputCallback, OutputLine};
use crate::report::RunRecord;
use crate::suite::{Outcome, TestCase};

/// Settings shared by every attempt.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Timeout for cases that do not declare one.
    pub default_timeout: Duration,

    /// Exit code meaning "skipped".
    pub skip_exit_code: i32,

    /// Bound on cleanup after a cancellation or a tainting outcome.
    pub cancel_grace: Duration,

    /// Root for `logs/` and `artifacts/`.
    pub output_dir: PathBuf,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            skip_exit_code: 77,
            cancel_grace: Duration::from_secs(30),
            output_dir: PathBuf::from("lisa-results"),
        }
    }
}

struct Verdict {
    outcome: Outcome,
    exit_code: Option<i32>,
    message: Option<String>,
}

impl Verdict {
    fn new(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            exit_code: None,
            message: Some(message.into()),
        }
    }

    fn cancelled() -> Self {
        Self::new(Outcome::Cancelled, "run cancelled")
    }

    fn from_error(error: NodeError, step: &str) -> Self {
        let outcome = match error {
            NodeError::ExecutionTimeout(_) => Outcome::TimedOut,
            _ => Outcome::Errored,
        };
        Self::new(outcome, format!("{}: {}", step, error))
    }
}

/// Turns a case id into a single safe path component.
pub fn path_segment(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Runs case attempts against reserved environments.
pub struct ExecutionDriver {
    options: DriverOptions,
    output_callback: Option<OutputCallback>,
}

impl ExecutionDriver {
    pub fn new(options: DriverOptions) -> Self {
        Self {
            options,
            output_callback: None,
        }
    }

    /// Streams every output line of the main command, tagged with the
    /// case id.
    pub fn with_output_callback(mut self, callback: OutputCallback) -> Self {
        self.output_callback = Some(callback);
        self
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// `<output_dir>/artifacts/<case>/attempt-<n>`.
    pub fn artifacts_dir(&self, case_id: &str, attempt: u32) -> PathBuf {
        self.options
            .output_dir
            .join("artifacts")
            .join(path_segment(case_id))
            .join(format!("attempt-{}", attempt))
    }

    /// `<output_dir>/logs/<case>/attempt-<n>.log`.
    pub fn log_path(&self, case_id: &str, attempt: u32) -> PathBuf {
        self.options
            .output_dir
            .join("logs")
            .join(path_segment(case_id))
            .join(format!("attempt-{}.log", attempt))
    }

    fn command(&self, case: &TestCase, env: &Environment, script: &str) -> Command {
        let mut cmd = Command::script(script)
            .env("LISA_CASE", case.id.as_str())
            .env("LISA_ENVIRONMENT", env.name())
            .env("LISA_NODE_COUNT", env.node_count().to_string());
        for (i, node) in env.nodes().iter().enumerate() {
            cmd = cmd.env(format!("LISA_NODE_{}", i), node.address());
        }
        for (key, value) in &case.env {
            cmd = cmd.env(key.as_str(), value.as_str());
        }
        cmd
    }

    /// Runs one attempt and returns its finalized record.
    pub async fn run(
        &self,
        case: &TestCase,
        attempt: u32,
        env: &Environment,
        cancel: &CancellationToken,
    ) -> RunRecord {
        let started_at = Utc::now();
        let timeout = case.timeout(self.options.default_timeout);
        let mut log = String::new();

        info!("[{}] attempt {} on {}", case.id, attempt, env.name());
        let verdict = self.execute(case, env, timeout, cancel, &mut log).await;

        let artifacts = if verdict.outcome == Outcome::Cancelled {
            Vec::new()
        } else {
            self.collect_artifacts(case, attempt, env).await
        };

        let bounded = verdict.outcome.taints_environment();
        self.cleanup(case, env, timeout, bounded, &mut log).await;

        let log_path = self.log_path(&case.id, attempt);
        let log_path = match write_log(&log_path, &log).await {
            Ok(()) => Some(log_path),
            Err(e) => {
                warn!("[{}] could not write {}: {}", case.id, log_path.display(), e);
                None
            }
        };

        info!("[{}] attempt {}: {}", case.id, attempt, verdict.outcome);
        RunRecord {
            case_id: case.id.clone(),
            attempt,
            outcome: verdict.outcome,
            started_at,
            finished_at: Utc::now(),
            environment: Some(env.name().to_string()),
            exit_code: verdict.exit_code,
            log_path,
            artifacts,
            message: verdict.message,
        }
    }

    async fn execute(
        &self,
        case: &TestCase,
        env: &Environment,
        timeout: Duration,
        cancel: &CancellationToken,
        log: &mut String,
    ) -> Verdict {
        let Some(primary) = env.primary() else {
            return Verdict::new(Outcome::Errored, "environment has no nodes");
        };

        for node in env.nodes() {
            for step in &case.setup {
                let cmd = self.command(case, env, step);
                match guarded(cancel, node.execute(&cmd, Some(timeout))).await {
                    None => return Verdict::cancelled(),
                    Some(Ok(result)) => {
                        append(log, node, step, &result);
                        if !result.success() {
                            return Verdict::new(
                                Outcome::Errored,
                                format!("setup `{}` on {} exited with {}", step, node.id(), result.exit_code),
                            );
                        }
                    }
                    Some(Err(e)) => return Verdict::from_error(e, "setup"),
                }
            }
        }

        for upload in &case.upload {
            let transfer = primary.transfer(&upload.from, &upload.to, Direction::Upload);
            match guarded(cancel, transfer).await {
                None => return Verdict::cancelled(),
                Some(Ok(())) => {}
                Some(Err(e)) => return Verdict::from_error(e, "upload"),
            }
        }

        let case_id = case.id.as_str();
        let callback = self.output_callback.clone();
        let forward = move |line: &OutputLine| {
            if let Some(cb) = &callback {
                cb(case_id, line);
            }
        };
        let on_line: Option<LineSink<'_>> = match self.output_callback {
            Some(_) => Some(&forward),
            None => None,
        };

        let cmd = self.command(case, env, &case.command);
        match guarded(cancel, primary.execute_with(&cmd, Some(timeout), on_line)).await {
            None => Verdict::cancelled(),
            Some(Ok(result)) => {
                append(log, primary, &case.command, &result);
                let (outcome, message) = match result.exit_code {
                    0 => (Outcome::Passed, None),
                    code if code == self.options.skip_exit_code => {
                        (Outcome::Skipped, Some("skipped by the case".to_string()))
                    }
                    code => (Outcome::Failed, Some(format!("exited with {}", code))),
                };
                Verdict {
                    outcome,
                    exit_code: Some(result.exit_code),
                    message,
                }
            }
            Some(Err(e)) => {
                log.push_str(&format!("$ {}\n!! {}\n", case.command, e));
                Verdict::from_error(e, "command")
            }
        }
    }

    async fn collect_artifacts(&self, case: &TestCase, attempt: u32, env: &Environment) -> Vec<PathBuf> {
        let Some(primary) = env.primary() else {
            return Vec::new();
        };
        if case.artifacts.is_empty() {
            return Vec::new();
        }

        let dir = self.artifacts_dir(&case.id, attempt);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!("[{}] cannot create {}: {}", case.id, dir.display(), e);
            return Vec::new();
        }

        let mut collected = Vec::new();
        for artifact in &case.artifacts {
            let remote = Path::new(artifact);
            let name = remote
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path_segment(artifact));
            let local = dir.join(name);
            match primary.transfer(&local, remote, Direction::Download).await {
                Ok(()) => collected.push(local),
                Err(e) => warn!("[{}] artifact {} not collected: {}", case.id, artifact, e),
            }
        }
        collected
    }

    /// Runs cleanup on every node. After a tainting outcome the whole pass
    /// is bounded by the cancel grace period.
    async fn cleanup(&self, case: &TestCase, env: &Environment, timeout: Duration, bounded: bool, log: &mut String) {
        if case.cleanup.is_empty() {
            return;
        }

        let per_command = if bounded {
            timeout.min(self.options.cancel_grace)
        } else {
            timeout
        };
        let pass = async {
            for node in env.nodes() {
                for step in &case.cleanup {
                    let cmd = self.command(case, env, step);
                    match node.execute(&cmd, Some(per_command)).await {
                        Ok(result) => {
                            append(log, node, step, &result);
                            if !result.success() {
                                warn!("[{}] cleanup `{}` on {} exited with {}", case.id, step, node.id(), result.exit_code);
                            }
                        }
                        Err(e) => warn!("[{}] cleanup `{}` on {} failed: {}", case.id, step, node.id(), e),
                    }
                }
            }
        };

        if bounded {
            if tokio::time::timeout(self.options.cancel_grace, pass).await.is_err() {
                warn!("[{}] cleanup abandoned after {:?}", case.id, self.options.cancel_grace);
            }
        } else {
            pass.await;
        }
    }
}

/// Races `fut` against cancellation; `None` if cancelled first. The
/// dropped future kills whatever it was running.
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

fn append(log: &mut String, node: &Node, script: &str, result: &ExecResult) {
    log.push_str(&format!("[{}] $ {}\n", node.id(), script));
    log.push_str(&result.stdout);
    if !result.stderr.is_empty() {
        log.push_str(&result.stderr);
    }
    log.push_str(&format!("[{}] exit {} ({:?})\n", node.id(), result.exit_code, result.duration));
}

async fn write_log(path: &Path, log: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    debug!("Writing {}", path.display());
    tokio::fs::write(path, log).await
}
