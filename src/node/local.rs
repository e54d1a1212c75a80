//! Local transport: the machine running lisa is the target.
//!
//! Commands run as child processes through a configurable shell and file
//! transfers are plain copies, resolved against the node's working
//! directory.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared filesystem and network) |
//! | File transfer | Local copy operations |
//! | Streaming output | Supported |
//! | Liveness | Always alive while the working directory exists |
//!
//! # Example Configuration
//!
//! ```toml
//! [[environment.node]]
//! type = "local"
//! working_dir = "/tmp/lisa"
//! shell = "/bin/bash"
//!
//! [environment.node.env]
//! LANG = "C"
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Command, Direction, ExecResult, LineSink, NodeError, NodeResult, Transport, run_process};
use crate::config::LocalNodeConfig;

/// Transport running commands as local child processes.
pub struct LocalTransport {
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    shell: String,
}

impl LocalTransport {
    /// Creates a local transport.
    ///
    /// # Example
    ///
    /// ```
    /// use lisa::node::local::LocalTransport;
    /// use lisa::config::LocalNodeConfig;
    ///
    /// let transport = LocalTransport::new(LocalNodeConfig {
    ///     shell: "/bin/bash".to_string(),
    ///     ..Default::default()
    /// });
    /// ```
    pub fn new(config: LocalNodeConfig) -> Self {
        let working_dir = config
            .working_dir
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        Self {
            working_dir,
            env: config.env.into_iter().collect(),
            shell: config.shell,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.working_dir.join(path)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn address(&self) -> String {
        format!("localhost:{}", self.working_dir.display())
    }

    async fn connect(&self) -> NodeResult<()> {
        match tokio::fs::metadata(&self.working_dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(NodeError::Connection(format!(
                "{} is not a directory",
                self.working_dir.display()
            ))),
            Err(e) => Err(NodeError::Connection(format!(
                "{}: {}",
                self.working_dir.display(),
                e
            ))),
        }
    }

    async fn execute(
        &self,
        cmd: &Command,
        on_line: Option<LineSink<'_>>,
    ) -> NodeResult<ExecResult> {
        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(cmd.to_shell_string());
        process.current_dir(&self.working_dir);

        for (key, value) in &self.env {
            process.env(key, value);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        if let Some(dir) = &cmd.working_dir {
            process.current_dir(self.resolve(Path::new(dir)));
        }

        run_process(process, on_line).await
    }

    async fn transfer(&self, local: &Path, remote: &Path, direction: Direction) -> NodeResult<()> {
        let (src, dst) = match direction {
            Direction::Upload => (local.to_path_buf(), self.resolve(remote)),
            Direction::Download => (self.resolve(remote), local.to_path_buf()),
        };
        copy_path(&src, &dst)
            .await
            .map_err(|e| NodeError::Transfer(format!("{} -> {}: {}", src.display(), dst.display(), e)))
    }

    async fn probe(&self) -> bool {
        tokio::fs::metadata(&self.working_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

/// Copies a file or a directory tree, creating parent directories.
async fn copy_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(src).await?.is_dir() {
        copy_dir_all(src, dst).await
    } else {
        tokio::fs::copy(src, dst).await.map(|_| ())
    }
}

/// Recursively copy a directory.
async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let ty = entry.file_type().await?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            Box::pin(copy_dir_all(&src_path, &dst_path)).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn transport(dir: &Path) -> LocalTransport {
        let mut env = BTreeMap::new();
        env.insert("LISA_TEST_VAR".to_string(), "from-config".to_string());
        LocalTransport::new(LocalNodeConfig {
            working_dir: Some(dir.to_path_buf()),
            env,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_connect_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let t = transport(&dir.path().join("nope"));
        assert!(matches!(t.connect().await, Err(NodeError::Connection(_))));
        assert!(!t.probe().await);
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let t = transport(dir.path());

        let result = t
            .execute(
                &Command::script("echo $LISA_TEST_VAR $EXTRA; basename $(pwd)")
                    .env("EXTRA", "from-command")
                    .working_dir("sub"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.stdout, "from-config from-command\nsub\n");
    }

    #[tokio::test]
    async fn test_upload_and_download_directory() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("node");
        std::fs::create_dir(&node_dir).unwrap();
        let src = dir.path().join("payload");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("nested/a.txt"), "a").unwrap();

        let t = transport(&node_dir);
        t.transfer(&src, Path::new("remote/payload"), Direction::Upload)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(node_dir.join("remote/payload/nested/a.txt")).unwrap(),
            "a"
        );

        let back = dir.path().join("back/a.txt");
        t.transfer(&back, Path::new("remote/payload/nested/a.txt"), Direction::Download)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(back).unwrap(), "a");
    }

    #[tokio::test]
    async fn test_transfer_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let t = transport(dir.path());
        let err = t
            .transfer(&dir.path().join("out"), Path::new("absent"), Direction::Download)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Transfer(_)));
    }
}
