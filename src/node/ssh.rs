//! SSH transport: a remote machine reached with the system `ssh` and `scp`.
//!
//! No agent is installed on the target. Every command spawns a fresh `ssh`
//! process, so there is no long-lived connection to lose; `connect` only
//! verifies that the host is reachable and accepts the key.
//!
//! # Prerequisites
//!
//! - Key-based authentication (password auth is not supported)
//! - `ssh` and `scp` available locally
//!
//! # Command Wrapping
//!
//! Commands are sent as:
//!
//! ```sh
//! ssh [options] user@host "export PATH='...'; export KEY='value'; cd '/path'; command"
//! ```
//!
//! Remote commands do not run in a login shell, so `PATH` is set to the
//! usual system directories unless the node's `env` overrides it.
//!
//! # Security Considerations
//!
//! - Keep `disable_host_key_check = false` for long-lived machines
//! - `ssh` exit status 255 means the connection itself failed

use std::path::Path;

use async_trait::async_trait;
use tracing::warn;

use super::{
    Command, Direction, ExecResult, LineSink, NodeError, NodeResult, Transport, is_env_name,
    run_process, shell_escape,
};
use crate::config::SshNodeConfig;

/// `PATH` used for non-login remote shells.
pub const DEFAULT_REMOTE_PATH: &str = "/sbin:/usr/sbin:/usr/local/sbin:/bin:/usr/bin:/usr/local/bin";

/// Exit status `ssh` reserves for its own failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Transport executing commands on a remote host.
pub struct SshTransport {
    config: SshNodeConfig,
    ssh_opts: Vec<String>,
}

impl SshTransport {
    /// Creates an SSH transport from node configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use lisa::node::ssh::SshTransport;
    /// use lisa::node::Transport;
    /// use lisa::config::SshNodeConfig;
    ///
    /// let transport = SshTransport::new(SshNodeConfig {
    ///     host: "10.0.0.4".into(),
    ///     user: "lisa".into(),
    ///     key_path: None,
    ///     port: 2222,
    ///     working_dir: None,
    ///     env: Default::default(),
    ///     disable_host_key_check: true,
    ///     connect_timeout_secs: 10,
    /// });
    /// assert_eq!(transport.address(), "lisa@10.0.0.4:2222");
    /// ```
    pub fn new(config: SshNodeConfig) -> Self {
        let mut ssh_opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", config.connect_timeout_secs),
        ];

        if config.disable_host_key_check {
            ssh_opts.push("-o".to_string());
            ssh_opts.push("StrictHostKeyChecking=no".to_string());
            ssh_opts.push("-o".to_string());
            ssh_opts.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Some(key_path) = &config.key_path {
            let key = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
            ssh_opts.push("-i".to_string());
            ssh_opts.push(key);
        }

        Self { config, ssh_opts }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }

    fn ssh_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(&self.ssh_opts);
        cmd.arg("-p").arg(self.config.port.to_string());
        cmd.arg(self.destination());
        cmd
    }

    /// `scp` takes the port as `-P`; every other option is shared with `ssh`.
    fn scp_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("scp");
        cmd.arg("-r");
        cmd.args(&self.ssh_opts);
        cmd.arg("-P").arg(self.config.port.to_string());
        cmd
    }

    /// Builds the remote script: exports, working directory, command.
    pub(crate) fn remote_script(&self, cmd: &Command) -> String {
        let mut script = String::new();

        if !self.config.env.contains_key("PATH") {
            script.push_str(&format!("export PATH={}; ", shell_escape(DEFAULT_REMOTE_PATH)));
        }
        for (key, value) in self.config.env.iter().chain(cmd.env.iter().map(|(k, v)| (k, v))) {
            if !is_env_name(key) {
                warn!("Not exporting invalid environment variable name {:?}", key);
                continue;
            }
            script.push_str(&format!("export {}={}; ", key, shell_escape(value)));
        }

        if let Some(dir) = cmd.working_dir.as_ref().or(self.config.working_dir.as_ref()) {
            script.push_str(&format!("cd {} && ", shell_escape(dir)));
        }

        script.push_str(&cmd.to_shell_string());
        script
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    fn address(&self) -> String {
        format!("{}:{}", self.destination(), self.config.port)
    }

    async fn connect(&self) -> NodeResult<()> {
        let output = self
            .ssh_command()
            .arg("true")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NodeError::Connection(format!("failed to spawn ssh: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(NodeError::Connection(format!(
                "{}: {}",
                self.address(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn execute(
        &self,
        cmd: &Command,
        on_line: Option<LineSink<'_>>,
    ) -> NodeResult<ExecResult> {
        let mut process = self.ssh_command();
        process.arg(self.remote_script(cmd));

        let result = run_process(process, on_line).await?;
        if result.exit_code == SSH_CONNECTION_FAILURE {
            return Err(NodeError::Connection(format!(
                "{}: {}",
                self.address(),
                result.stderr.trim()
            )));
        }
        Ok(result)
    }

    async fn transfer(&self, local: &Path, remote: &Path, direction: Direction) -> NodeResult<()> {
        let remote_path = format!("{}:{}", self.destination(), remote.display());

        let mut scp = self.scp_command();
        match direction {
            Direction::Upload => {
                scp.arg(local).arg(&remote_path);
            }
            Direction::Download => {
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| NodeError::Transfer(e.to_string()))?;
                }
                scp.arg(&remote_path).arg(local);
            }
        }

        let output = scp
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NodeError::Transfer(e.to_string()))?;

        if !output.status.success() {
            return Err(NodeError::Transfer(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(())
    }

    async fn probe(&self) -> bool {
        self.connect().await.is_ok()
    }
}
