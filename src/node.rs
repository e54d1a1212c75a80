//! Node abstraction: a uniform handle to a local or remote machine.
//!
//! A [`Node`] is one addressable machine that can run commands and transfer
//! files. The actual mechanics live behind the [`Transport`] trait so the
//! rest of lisa never branches on whether a target is local or remote.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Node                               │
//! │  (connection state, one operation at a time)                │
//! │                                                              │
//! │  connect()      execute(cmd, timeout)     transfer()        │
//! │      │                 │                       │             │
//! └──────┼─────────────────┼───────────────────────┼────────────┘
//!        ▼                 ▼                       ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  dyn Transport                               │
//! │   LocalTransport (child processes)                          │
//! │   SshTransport   (ssh / scp)                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Transports
//!
//! | Transport | Module | Description |
//! |-----------|--------|-------------|
//! | Local | [`local`] | Commands as child processes of lisa |
//! | SSH | [`ssh`] | Commands over the system `ssh`, files over `scp` |
//!
//! Transports never retry. Retry policy belongs to the execution driver.

pub mod local;
pub mod ssh;

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::config::NodeConfig;

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors raised by node operations.
///
/// A command that runs and exits non-zero is NOT an error; it is an
/// [`ExecResult`] with a non-zero exit code.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The target is unreachable or refused authentication.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The command did not finish within its timeout.
    #[error("Command timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// The command could not be started or its output could not be read.
    #[error("Failed to execute command: {0}")]
    Execution(String),

    /// Copying files to or from the node failed.
    #[error("Transfer failed: {0}")]
    Transfer(String),
}

/// A command to execute on a node.
///
/// # Example
///
/// ```
/// use lisa::node::Command;
///
/// let cmd = Command::new("lsvmbus")
///     .arg("-vv")
///     .working_dir("/tmp")
///     .env("LANG", "C");
///
/// assert_eq!(cmd.program, "lsvmbus");
/// assert_eq!(cmd.to_shell_string(), "lsvmbus -vv");
///
/// let script = Command::script("uname -s | tr A-Z a-z");
/// assert_eq!(script.to_shell_string(), "uname -s | tr A-Z a-z");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// The program to run, or the whole shell script for [`Command::script`].
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory; the node's default when `None`.
    pub working_dir: Option<String>,

    /// Extra environment variables for this command.
    pub env: Vec<(String, String)>,

    /// Whether `program` is a shell script passed through unescaped.
    pub script: bool,
}

impl Command {
    /// Creates a command running `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            script: false,
        }
    }

    /// Creates a command from a shell snippet, pipes and all.
    pub fn script(text: impl Into<String>) -> Self {
        Self {
            script: true,
            ..Self::new(text)
        }
    }

    /// Adds a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Converts the command to a shell-executable string.
    ///
    /// Program and arguments are escaped; scripts are passed through.
    pub fn to_shell_string(&self) -> String {
        if self.script {
            return self.program.clone();
        }
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Escape a string for use in a shell command.
pub(crate) fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Whether `key` can be exported by a POSIX shell: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Result of executing a command on a node.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code; `-1` when the process was killed by a signal.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A single line of command output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Receives output lines as a command produces them.
pub type LineSink<'a> = &'a (dyn Fn(&OutputLine) + Send + Sync);

/// Callback for streamed output, tagged with the producer's id.
pub type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// Direction of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local path to node path.
    Upload,
    /// Node path to local path.
    Download,
}

/// Connection state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

/// The mechanics of reaching one machine.
///
/// Implementations must be safe to call from several tasks; [`Node`]
/// serializes command and transfer calls on top of that.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name for logs (`local`, `ssh`).
    fn kind(&self) -> &'static str;

    /// Human-readable address of the target.
    fn address(&self) -> String;

    /// Establishes (or verifies) reachability and authentication.
    async fn connect(&self) -> NodeResult<()>;

    /// Runs a command to completion, feeding output lines to `on_line`.
    ///
    /// Dropping the returned future must stop the command.
    async fn execute(&self, cmd: &Command, on_line: Option<LineSink<'_>>)
    -> NodeResult<ExecResult>;

    /// Copies a file or directory tree.
    async fn transfer(&self, local: &Path, remote: &Path, direction: Direction)
    -> NodeResult<()>;

    /// Cheap liveness check.
    async fn probe(&self) -> bool;

    /// Releases any held connection.
    async fn disconnect(&self) {}
}

/// Creates the transport matching a node configuration.
pub fn transport_for(config: &NodeConfig) -> Box<dyn Transport> {
    match config {
        NodeConfig::Local(cfg) => Box::new(local::LocalTransport::new(cfg.clone())),
        NodeConfig::Ssh(cfg) => Box::new(ssh::SshTransport::new(cfg.clone())),
    }
}

/// One machine of an environment.
///
/// Command execution and transfers are serialized: a node runs at most one
/// operation at a time. Liveness probes bypass that queue.
pub struct Node {
    id: String,
    transport: Box<dyn Transport>,
    state: Mutex<ConnectionState>,
    op_lock: tokio::sync::Mutex<()>,
}

impl Node {
    /// Wraps a transport.
    pub fn new(id: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Builds a node from its configuration.
    pub fn from_config(id: impl Into<String>, config: &NodeConfig) -> Self {
        Self::new(id, transport_for(config))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &'static str {
        self.transport.kind()
    }

    pub fn address(&self) -> String {
        self.transport.address()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Lost)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    /// Connects to the node.
    ///
    /// # Errors
    ///
    /// [`NodeError::Connection`] when the target is unreachable or refuses
    /// authentication.
    pub async fn connect(&self) -> NodeResult<()> {
        let _guard = self.op_lock.lock().await;
        self.set_state(ConnectionState::Connecting);
        debug!("Connecting to {} ({})", self.id, self.transport.address());
        match self.transport.connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Runs a command, failing with [`NodeError::ExecutionTimeout`] if it
    /// outlives `timeout`.
    pub async fn execute(&self, cmd: &Command, timeout: Option<Duration>) -> NodeResult<ExecResult> {
        self.execute_with(cmd, timeout, None).await
    }

    /// Like [`execute`](Self::execute), also streaming output lines.
    pub async fn execute_with(
        &self,
        cmd: &Command,
        timeout: Option<Duration>,
        on_line: Option<LineSink<'_>>,
    ) -> NodeResult<ExecResult> {
        let _guard = self.op_lock.lock().await;
        debug!("[{}] $ {}", self.id, cmd.to_shell_string());

        let run = self.transport.execute(cmd, on_line);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::ExecutionTimeout(limit)),
            },
            None => run.await,
        };

        if let Err(NodeError::Connection(msg)) = &result {
            warn!("Lost connection to {}: {}", self.id, msg);
            self.set_state(ConnectionState::Lost);
        }
        result
    }

    /// Copies a file or directory to or from the node.
    pub async fn transfer(&self, local: &Path, remote: &Path, direction: Direction) -> NodeResult<()> {
        let _guard = self.op_lock.lock().await;
        debug!(
            "[{}] transfer {:?} local={} remote={}",
            self.id,
            direction,
            local.display(),
            remote.display()
        );
        self.transport.transfer(local, remote, direction).await
    }

    /// Liveness check; never fails. A connected node that stops answering
    /// becomes [`ConnectionState::Lost`].
    pub async fn probe(&self) -> bool {
        let alive = self.transport.probe().await;
        if !alive && self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Lost);
        }
        alive
    }

    /// Reads a text file on the node without a temporary local copy.
    pub async fn read_file(&self, path: &str) -> NodeResult<String> {
        let result = self.execute(&Command::new("cat").arg(path), None).await?;
        if !result.success() {
            return Err(NodeError::Execution(format!(
                "cat {} exited with {}: {}",
                path,
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(result.stdout.trim().to_string())
    }

    /// Drops the connection.
    pub async fn disconnect(&self) {
        let _guard = self.op_lock.lock().await;
        self.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.transport.kind())
            .field("address", &self.transport.address())
            .field("state", &self.state())
            .finish()
    }
}

/// Spawns a prepared process and collects its output line by line.
///
/// The child is killed if the returned future is dropped, which is how
/// timeouts and cancellation stop a running command.
pub(crate) async fn run_process(
    mut process: tokio::process::Command,
    on_line: Option<LineSink<'_>>,
) -> NodeResult<ExecResult> {
    let start = Instant::now();

    process
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = process
        .spawn()
        .map_err(|e| NodeError::Execution(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| NodeError::Execution("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| NodeError::Execution("stderr not captured".to_string()))?;

    let stdout_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
        .filter_map(|line| future::ready(line.ok().map(OutputLine::Stdout)));
    let stderr_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
        .filter_map(|line| future::ready(line.ok().map(OutputLine::Stderr)));

    // Merge stdout and stderr streams
    let mut combined = stream::select(stdout_stream, stderr_stream);

    let mut out = String::new();
    let mut err = String::new();
    while let Some(line) = combined.next().await {
        if let Some(sink) = on_line {
            sink(&line);
        }
        match &line {
            OutputLine::Stdout(s) => {
                out.push_str(s);
                out.push('\n');
            }
            OutputLine::Stderr(s) => {
                err.push_str(s);
                err.push('\n');
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| NodeError::Execution(e.to_string()))?;

    Ok(ExecResult {
        exit_code: status.code().unwrap_or(-1),
        stdout: out,
        stderr: err,
        duration: start.elapsed(),
    })
}
