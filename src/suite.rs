//! Test suites: test case definitions and their outcomes.
//!
//! Suites are TOML files with one `[[case]]` table per test case. The case
//! body is a shell command run on the primary node of whatever environment
//! the scheduler picks for it.
//!
//! ```toml
//! [suite]
//! name = "core"
//!
//! [[case]]
//! id = "core.lsvmbus.verify_vmbus_devices"
//! description = "every expected VMBus device is present"
//! priority = 1
//! timeout_secs = 120
//! setup = ["command -v lsvmbus || sudo apt-get install -y hyperv-tools"]
//! command = "./verify-vmbus.sh"
//! cleanup = ["rm -rf /tmp/vmbus"]
//! artifacts = ["/var/log/syslog"]
//!
//! [[case.upload]]
//! from = "scripts/verify-vmbus.sh"
//! to = "verify-vmbus.sh"
//!
//! [case.requirement]
//! [[case.requirement.predicate]]
//! op = "eq"
//! name = "platform"
//! value = "azure"
//!
//! [case.retry]
//! max_attempts = 2
//! ```
//!
//! # Priorities
//!
//! Lower numbers run first; cases with equal priority keep their
//! declaration order. The default priority is 2.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::node::is_env_name;
use crate::orchestrator::retry::RetryPolicy;
use crate::requirement::Requirement;

/// Errors raised while loading a suite.
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("Failed to read suite {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse suite: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate test case id: {0}")]
    DuplicateId(String),

    #[error("Test case '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("Test case '{case}' sets invalid environment variable name {name:?}")]
    InvalidEnvName { case: String, name: String },
}

/// Terminal status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    /// Skipped by the suite or by the case itself (skip exit code).
    Skipped,
    TimedOut,
    /// Infrastructure trouble: connection, transfer, setup or provisioning.
    Errored,
    Cancelled,
    /// No current or provisionable environment can ever satisfy the case.
    Blocked,
}

impl Outcome {
    /// Every variant, in report order.
    pub const ALL: [Outcome; 7] = [
        Outcome::Passed,
        Outcome::Failed,
        Outcome::Skipped,
        Outcome::TimedOut,
        Outcome::Errored,
        Outcome::Cancelled,
        Outcome::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::TimedOut => "timedout",
            Outcome::Errored => "errored",
            Outcome::Cancelled => "cancelled",
            Outcome::Blocked => "blocked",
        }
    }

    /// Whether the outcome counts as a success for the run.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Passed | Outcome::Skipped)
    }

    /// Whether the environment the attempt ran on can no longer be trusted.
    pub fn taints_environment(&self) -> bool {
        matches!(self, Outcome::TimedOut | Outcome::Errored | Outcome::Cancelled)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file copied to the environment's primary node before the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    /// Local path, relative to the suite file.
    pub from: PathBuf,
    /// Path on the node, relative to its working directory.
    pub to: PathBuf,
}

/// Per-case override of the configured retry policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseRetry {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
}

/// A single test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique id, conventionally `suite.area.name`.
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Shell command whose exit code decides the outcome.
    pub command: String,

    /// Commands run on every node before the main command.
    #[serde(default)]
    pub setup: Vec<String>,

    /// Commands run on every node afterwards, whatever happened.
    #[serde(default)]
    pub cleanup: Vec<String>,

    #[serde(default)]
    pub upload: Vec<Upload>,

    /// Paths on the primary node collected after the command.
    #[serde(default)]
    pub artifacts: Vec<String>,

    /// Extra environment variables for setup, command and cleanup.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub requirement: Requirement,

    /// Lower runs first.
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Overrides `lisa.case_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: CaseRetry,

    /// Record the case as skipped without running it.
    #[serde(default)]
    pub skip: bool,

    #[serde(default)]
    pub skip_reason: Option<String>,
}

fn default_priority() -> u8 {
    2
}

impl TestCase {
    /// Creates a case with defaults for everything but id and command.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            command: command.into(),
            setup: Vec::new(),
            cleanup: Vec::new(),
            upload: Vec::new(),
            artifacts: Vec::new(),
            env: BTreeMap::new(),
            requirement: Requirement::default(),
            priority: default_priority(),
            timeout_secs: None,
            retry: CaseRetry::default(),
            skip: false,
            skip_reason: None,
        }
    }

    /// Effective timeout given the configured default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }

    /// Effective retry policy given the configured default.
    pub fn retry_policy(&self, default: &RetryPolicy) -> RetryPolicy {
        let mut policy = default.clone();
        if let Some(max) = self.retry.max_attempts {
            policy.max_attempts = max.max(1);
        }
        if let Some(ms) = self.retry.initial_backoff_ms {
            policy.initial_backoff = Duration::from_millis(ms);
        }
        policy
    }
}

/// A loaded suite.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Suite {
    #[serde(default)]
    pub suite: SuiteMeta,

    #[serde(default, rename = "case")]
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteMeta {
    #[serde(default = "default_suite_name")]
    pub name: String,
}

impl Default for SuiteMeta {
    fn default() -> Self {
        Self {
            name: default_suite_name(),
        }
    }
}

fn default_suite_name() -> String {
    "lisa".to_string()
}

impl Suite {
    pub fn name(&self) -> &str {
        &self.suite.name
    }

    /// Parses and checks a suite document. Upload sources are left as
    /// written.
    pub fn parse(content: &str) -> Result<Self, SuiteError> {
        let suite: Suite = toml::from_str(content)?;
        suite.check()?;
        Ok(suite)
    }

    /// Loads a suite file. Relative upload sources are resolved against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self, SuiteError> {
        let content = std::fs::read_to_string(path).map_err(|source| SuiteError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut suite = Self::parse(&content)?;

        let base = path.parent().unwrap_or(Path::new("."));
        for case in &mut suite.cases {
            for upload in &mut case.upload {
                if upload.from.is_relative() {
                    upload.from = base.join(&upload.from);
                }
            }
        }
        Ok(suite)
    }

    fn check(&self) -> Result<(), SuiteError> {
        let mut seen = HashSet::new();
        for case in &self.cases {
            if !seen.insert(case.id.as_str()) {
                return Err(SuiteError::DuplicateId(case.id.clone()));
            }
            if case.command.trim().is_empty() {
                return Err(SuiteError::EmptyCommand(case.id.clone()));
            }
            if let Some(name) = case.env.keys().find(|k| !is_env_name(k)) {
                return Err(SuiteError::InvalidEnvName {
                    case: case.id.clone(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Keeps only cases whose id matches `pattern`.
    pub fn retain_matching(&mut self, pattern: &Regex) {
        self.cases.retain(|case| pattern.is_match(&case.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirement::Predicate;

    const SUITE: &str = r#"
        [suite]
        name = "core"

        [[case]]
        id = "core.lsvmbus.verify_vmbus_devices"
        priority = 1
        command = "lsvmbus -vv"
        timeout_secs = 120

        [case.requirement]
        [[case.requirement.predicate]]
        op = "eq"
        name = "platform"
        value = "azure"

        [case.retry]
        max_attempts = 3

        [[case]]
        id = "core.lsvmbus.verify_channels"
        priority = 4
        command = "./channels.sh"
        skip = true
        skip_reason = "needs 8 cores"

        [[case.upload]]
        from = "scripts/channels.sh"
        to = "channels.sh"
    "#;

    #[test]
    fn test_parse_suite() {
        let suite = Suite::parse(SUITE).unwrap();
        assert_eq!(suite.name(), "core");
        assert_eq!(suite.cases.len(), 2);

        let first = &suite.cases[0];
        assert_eq!(first.priority, 1);
        assert_eq!(first.timeout(Duration::from_secs(300)), Duration::from_secs(120));
        assert_eq!(
            first.requirement.predicates,
            vec![Predicate::eq("platform", "azure")]
        );

        let second = &suite.cases[1];
        assert!(second.skip);
        assert_eq!(second.timeout(Duration::from_secs(300)), Duration::from_secs(300));
    }

    #[test]
    fn test_case_retry_override() {
        let suite = Suite::parse(SUITE).unwrap();
        let default = RetryPolicy::default();
        assert_eq!(suite.cases[0].retry_policy(&default).max_attempts, 3);
        assert_eq!(
            suite.cases[1].retry_policy(&default).max_attempts,
            default.max_attempts
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = Suite::parse(
            r#"
            [[case]]
            id = "a"
            command = "true"
            [[case]]
            id = "a"
            command = "true"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SuiteError::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = Suite::parse("[[case]]\nid = \"a\"\ncommand = \"  \"\n").unwrap_err();
        assert!(matches!(err, SuiteError::EmptyCommand(_)));
    }

    #[test]
    fn test_invalid_env_name_rejected() {
        let err = Suite::parse(
            r#"
            [[case]]
            id = "a"
            command = "true"
            [case.env]
            "X; reboot" = "1"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SuiteError::InvalidEnvName { .. }));
    }

    #[test]
    fn test_load_resolves_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.toml");
        std::fs::write(&path, SUITE).unwrap();
        let suite = Suite::load(&path).unwrap();
        assert_eq!(
            suite.cases[1].upload[0].from,
            dir.path().join("scripts/channels.sh")
        );
    }

    #[test]
    fn test_retain_matching() {
        let mut suite = Suite::parse(SUITE).unwrap();
        suite.retain_matching(&Regex::new("channels$").unwrap());
        assert_eq!(suite.cases.len(), 1);
        assert_eq!(suite.cases[0].id, "core.lsvmbus.verify_channels");
    }

    #[test]
    fn test_outcome_names() {
        let parsed: Vec<Outcome> = serde_json::from_str(r#"["timedout", "errored"]"#).unwrap();
        assert_eq!(parsed, vec![Outcome::TimedOut, Outcome::Errored]);
        assert_eq!(Outcome::Cancelled.to_string(), "cancelled");
        assert!(Outcome::Skipped.is_success());
        assert!(Outcome::Cancelled.taints_environment());
        assert!(!Outcome::Failed.taints_environment());
    }
}
