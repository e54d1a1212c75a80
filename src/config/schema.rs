//! Configuration schema definitions for lisa.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and
//! tagged enums for node transport and reservation mode selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── LisaConfig              - Core settings (concurrency, timeouts)
//! │   ├── RetryConfig         - Default retry policy for cases
//! │   ├── ReservationConfig   - no-wait / bounded-wait reservation mode
//! │   └── ScoringConfig       - Matcher penalties for over-provisioned fits
//! ├── [[environment]]         - Statically known environments
//! │   └── [[environment.node]]- Tagged enum selecting the transport
//! │       ├── Local           - Child processes on this machine
//! │       └── Ssh             - Remote machine over ssh/scp
//! ├── ProvisionerConfig       - Optional shell-command provisioner
//! │   └── [[template]]        - Provisionable environment recipes
//! └── ReportConfig            - Output and reporting settings
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityValue;
use crate::orchestrator::retry::RetryPolicy;
use crate::suite::Outcome;

/// Root configuration structure for lisa.
///
/// # TOML Structure
///
/// ```toml
/// [lisa]
/// max_concurrent = 4
/// case_timeout_secs = 300
///
/// [[environment]]
/// name = "local"
///
/// [[environment.node]]
/// type = "local"
///
/// [report]
/// output_dir = "lisa-results"
/// ```
///
/// # Example
///
/// ```
/// use lisa::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [lisa]
///     max_concurrent = 2
///
///     [[environment]]
///     name = "local"
///
///     [[environment.node]]
///     type = "local"
/// "#).unwrap();
/// assert_eq!(config.environments.len(), 1);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core settings (concurrency, timeouts, retries, reservation mode).
    #[serde(default)]
    pub lisa: LisaConfig,

    /// Statically configured environments.
    #[serde(default, rename = "environment")]
    pub environments: Vec<EnvironmentConfig>,

    /// Optional shell-command provisioner for on-demand environments.
    #[serde(default)]
    pub provisioner: Option<ProvisionerConfig>,

    /// Report configuration for output generation (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_concurrent` | 4 |
/// | `case_timeout_secs` | 300 (5 minutes) |
/// | `cancel_grace_secs` | 30 |
/// | `stream_output` | false |
/// | `keep_environments` | false |
/// | `skip_exit_code` | 77 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LisaConfig {
    /// Maximum number of environments in use at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Timeout applied to a case that does not declare its own.
    ///
    /// Expiry marks the environment dirty.
    #[serde(default = "default_case_timeout")]
    pub case_timeout_secs: u64,

    /// How long in-flight cases get to clean up after a cancellation.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,

    /// Print command output as it is produced, prefixed by the case id.
    #[serde(default)]
    pub stream_output: bool,

    /// Leave healthy environments running when the run ends.
    ///
    /// Provisioned environments are remembered in `.lisa/environments.json`
    /// and picked up again by the next run.
    #[serde(default)]
    pub keep_environments: bool,

    /// Exit code a case command uses to report that it skipped itself.
    #[serde(default = "default_skip_exit_code")]
    pub skip_exit_code: i32,

    /// Default retry policy for cases.
    #[serde(default)]
    pub retry: RetryConfig,

    /// How reservations behave when no environment is free.
    #[serde(default)]
    pub reservation: ReservationConfig,

    /// Weights used to rank several qualifying environments.
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl Default for LisaConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            case_timeout_secs: default_case_timeout(),
            cancel_grace_secs: default_cancel_grace(),
            stream_output: false,
            keep_environments: false,
            skip_exit_code: default_skip_exit_code(),
            retry: RetryConfig::default(),
            reservation: ReservationConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

fn default_case_timeout() -> u64 {
    300 // 5 minutes
}

fn default_cancel_grace() -> u64 {
    30
}

fn default_skip_exit_code() -> i32 {
    77
}

/// Default retry policy.
///
/// ```toml
/// [lisa.retry]
/// max_attempts = 3
/// initial_backoff_ms = 500
/// backoff_multiplier = 2.0
/// max_backoff_ms = 10000
/// retry_on = ["timedout", "errored"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts allowed per case, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Factor applied to the delay after every retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Randomize each delay between half and the full computed value.
    #[serde(default)]
    pub jitter: bool,

    /// Outcomes that trigger another attempt.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<Outcome>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff(),
            jitter: false,
            retry_on: default_retry_on(),
        }
    }
}

impl RetryConfig {
    /// Builds the policy used for cases that do not override it.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter: self.jitter,
            retry_on: self.retry_on.clone(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_retry_on() -> Vec<Outcome> {
    vec![Outcome::Failed, Outcome::TimedOut, Outcome::Errored]
}

/// Reservation behavior when no matching environment is free.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReservationConfig {
    /// `no-wait` fails a reservation immediately; `bounded-wait` blocks up
    /// to `timeout_secs` for a matching environment to become ready.
    #[serde(default)]
    pub mode: ReservationMode,

    /// Deadline for `bounded-wait` reservations.
    #[serde(default = "default_reservation_timeout")]
    pub timeout_secs: u64,

    /// Delay before a case that found every matching environment busy is
    /// offered to the pool again.
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay_ms: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            mode: ReservationMode::default(),
            timeout_secs: default_reservation_timeout(),
            requeue_delay_ms: default_requeue_delay(),
        }
    }
}

impl ReservationConfig {
    /// Resolves the configured mode into the scheduler's wait mode.
    pub fn wait_mode(&self) -> WaitMode {
        match self.mode {
            ReservationMode::NoWait => WaitMode::NoWait,
            ReservationMode::BoundedWait => {
                WaitMode::BoundedWait(Duration::from_secs(self.timeout_secs))
            }
        }
    }
}

fn default_reservation_timeout() -> u64 {
    60
}

fn default_requeue_delay() -> u64 {
    500
}

/// Reservation mode selector as written in TOML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReservationMode {
    #[default]
    NoWait,
    BoundedWait,
}

/// Resolved reservation wait mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Fail immediately when nothing matching is ready.
    NoWait,
    /// Block until a matching environment is ready or the duration elapses.
    BoundedWait(Duration),
}

/// Matcher penalties for over-provisioned environments.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ScoringConfig {
    /// Penalty per node beyond what the requirement asks for.
    #[serde(default = "default_node_penalty")]
    pub excess_node_penalty: f64,

    /// Penalty per unit of a numeric capability beyond a `uses`/`min` bound.
    #[serde(default = "default_resource_penalty")]
    pub excess_resource_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            excess_node_penalty: default_node_penalty(),
            excess_resource_penalty: default_resource_penalty(),
        }
    }
}

fn default_node_penalty() -> f64 {
    10.0
}

fn default_resource_penalty() -> f64 {
    1.0
}

/// A statically known environment: one or more nodes plus declared
/// capabilities.
///
/// ```toml
/// [[environment]]
/// name = "pair"
///
/// [[environment.node]]
/// type = "ssh"
/// host = "10.0.0.4"
/// user = "lisa"
///
/// [[environment.node]]
/// type = "ssh"
/// host = "10.0.0.5"
/// user = "lisa"
///
/// [environment.capabilities]
/// platform = "azure"
/// sriov = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    /// Unique environment name; also used as its provisioning template.
    pub name: String,

    /// Nodes making up the environment, primary first.
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,

    /// Capabilities declared for this environment. They win over probed
    /// values with the same name.
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityValue>,
}

/// Node transport configuration.
///
/// | Type | Description |
/// |------|-------------|
/// | `local` | Child processes of lisa on this machine |
/// | `ssh` | Remote machine reached with the system `ssh`/`scp` |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeConfig {
    Local(LocalNodeConfig),
    Ssh(SshNodeConfig),
}

/// Configuration for a local node.
///
/// ```toml
/// [[environment.node]]
/// type = "local"
/// working_dir = "/tmp/lisa"
/// shell = "/bin/bash"
///
/// [environment.node.env]
/// LANG = "C"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LocalNodeConfig {
    /// Working directory for spawned processes. Defaults to the current
    /// directory.
    pub working_dir: Option<PathBuf>,

    /// Environment variables set for every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Shell used as `{shell} -c "{command}"`.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for LocalNodeConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            env: BTreeMap::new(),
            shell: default_shell(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Configuration for a node reached over SSH.
///
/// Key-based authentication only; lisa runs `ssh` with `BatchMode=yes` so a
/// password prompt is reported as a connection failure.
///
/// ```toml
/// [[environment.node]]
/// type = "ssh"
/// host = "worker1.example.com"
/// user = "ubuntu"
/// key_path = "~/.ssh/id_rsa"
/// port = 22
/// working_dir = "/home/ubuntu"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SshNodeConfig {
    /// Host name or address.
    pub host: String,

    /// Remote user.
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Private key; `~` is expanded.
    pub key_path: Option<PathBuf>,

    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Remote directory commands run from.
    pub working_dir: Option<String>,

    /// Environment variables exported before every command.
    ///
    /// Remote commands do not run in a login shell, so `PATH` defaults to
    /// the usual system directories unless set here.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Skip host key verification. Only for throwaway machines.
    #[serde(default)]
    pub disable_host_key_check: bool,

    /// Seconds `ssh` waits for the TCP connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

/// Shell-command provisioner, for cloud or lab systems lisa has no native
/// support for.
///
/// # Command Protocol
///
/// - **create_command**: Prints either a JSON target
///   (`{"id": "...", "nodes": [{"type": "ssh", "host": "..."}]}`) on its
///   last line, or one host address per line. Uses `{template}` and
///   `{name}` placeholders.
/// - **destroy_command**: Uses `{id}` and `{template}` placeholders.
/// - **diagnostics_command** (optional): Prints diagnostics (for example a
///   serial console log) for a target whose state is no longer trusted.
///
/// ```toml
/// [provisioner]
/// create_command = "./scripts/create-vm.sh {template} {name}"
/// destroy_command = "./scripts/delete-vm.sh {id}"
/// diagnostics_command = "./scripts/boot-log.sh {id}"
///
/// [[provisioner.template]]
/// name = "small"
/// max_instances = 2
/// nodes = 1
///
/// [provisioner.template.capabilities]
/// os = "linux"
/// cores = 2
///
/// [provisioner.template.ssh]
/// host = "unused"
/// user = "azureuser"
/// key_path = "~/.ssh/id_rsa"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisionerConfig {
    /// Command that creates a target and prints its descriptor.
    pub create_command: String,

    /// Command that destroys a target.
    pub destroy_command: String,

    /// Command that prints diagnostics for a target.
    pub diagnostics_command: Option<String>,

    /// Local working directory for the lifecycle commands.
    pub working_dir: Option<PathBuf>,

    /// Timeout for each lifecycle command in seconds.
    ///
    /// Default: 1800 (30 minutes)
    #[serde(default = "default_provision_timeout")]
    pub timeout_secs: u64,

    /// Provisionable environment recipes.
    #[serde(default, rename = "template")]
    pub templates: Vec<TemplateConfig>,
}

fn default_provision_timeout() -> u64 {
    1800 // 30 minutes
}

/// A provisionable environment recipe.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplateConfig {
    /// Template name, substituted as `{template}`.
    pub name: String,

    /// Maximum number of live environments from this template.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Nodes in each environment the create command brings up.
    #[serde(default = "default_template_nodes")]
    pub nodes: usize,

    /// Capabilities environments from this template are expected to have.
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityValue>,

    /// SSH settings applied to plain host addresses printed by the create
    /// command. The `host` field is replaced by each printed address.
    pub ssh: Option<SshNodeConfig>,
}

fn default_max_instances() -> usize {
    1
}

fn default_template_nodes() -> usize {
    1
}

/// Configuration for run reports.
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"lisa-results"` |
/// | `junit` | `true` |
/// | `junit_file` | `"junit.xml"` |
/// | `json` | `true` |
/// | `json_file` | `"report.json"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for reports, logs and collected artifacts.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename for the JUnit XML report, inside `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Whether to write the JSON run report.
    #[serde(default = "default_true")]
    pub json: bool,

    /// Filename for the JSON run report, inside `output_dir`.
    #[serde(default = "default_json_file")]
    pub json_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
            json: true,
            json_file: default_json_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("lisa-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_json_file() -> String {
    "report.json".to_string()
}
