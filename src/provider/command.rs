//! Provider driven by user-defined shell commands.
//!
//! This provider integrates lisa with any cloud or lab system by delegating
//! target lifecycle to shell commands, so no platform SDK is linked in.
//!
//! # Command Protocol
//!
//! | Command | Placeholders | Output |
//! |---------|--------------|--------|
//! | `create_command` | `{template}`, `{name}` | target descriptor (below) |
//! | `destroy_command` | `{id}`, `{template}` | ignored |
//! | `diagnostics_command` | `{id}`, `{template}` | diagnostics text |
//!
//! Placeholders are substituted shell-quoted. The create command prints
//! either a JSON descriptor on its last JSON-looking line:
//!
//! ```json
//! {"id": "vm-42", "nodes": [{"type": "ssh", "host": "10.0.0.4", "user": "lisa"}]}
//! ```
//!
//! or plain host addresses, one per line, which are turned into SSH nodes
//! using the template's `[provisioner.template.ssh]` settings.
//!
//! # Kept Environments
//!
//! Targets retained at the end of a run are written to the environment
//! cache and returned by the next run's `discover`, as long as their
//! template recipe has not changed since.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{EnvironmentProvider, ProvisionError, ProvisionResult};
use crate::cache::{EnvironmentCache, EnvironmentCacheEntry, template_hash};
use crate::config::{NodeConfig, ProvisionerConfig, TemplateConfig};
use crate::environment::{TargetDescriptor, Template};
use crate::node::{ExecResult, NodeError, run_process};

/// Provider running lifecycle shell commands.
pub struct CommandProvider {
    config: ProvisionerConfig,
    cache_dir: PathBuf,
    cache: Mutex<EnvironmentCache>,
}

impl CommandProvider {
    /// Creates the provider. The environment cache lives under `cache_dir`.
    pub fn new(config: ProvisionerConfig, cache_dir: &Path) -> Self {
        Self {
            config,
            cache_dir: cache_dir.to_path_buf(),
            cache: Mutex::new(EnvironmentCache::load(cache_dir)),
        }
    }

    fn template_config(&self, name: &str) -> ProvisionResult<&TemplateConfig> {
        self.config
            .templates
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ProvisionError::UnknownTemplate(name.to_string()))
    }

    /// Runs a lifecycle command with the configured timeout.
    async fn run(&self, command: &str) -> ProvisionResult<ExecResult> {
        debug!("Running provisioner command: {}", command);

        let mut process = tokio::process::Command::new("/bin/sh");
        process.arg("-c").arg(command);
        if let Some(dir) = &self.config.working_dir {
            process.current_dir(dir);
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = tokio::time::timeout(timeout, run_process(process, None))
            .await
            .map_err(|_| ProvisionError::Timeout(timeout))?
            .map_err(|e: NodeError| ProvisionError::CommandFailed(e.to_string()))?;

        if !result.success() {
            return Err(ProvisionError::CommandFailed(format!(
                "'{}' exited with {}: {}",
                command,
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(result)
    }

    /// Interprets the create command's stdout.
    fn parse_descriptor(
        &self,
        template: &TemplateConfig,
        name: &str,
        stdout: &str,
    ) -> ProvisionResult<TargetDescriptor> {
        let json_line = stdout
            .lines()
            .rev()
            .find(|line| line.trim().starts_with('{'));

        let mut descriptor = match json_line {
            Some(line) => serde_json::from_str::<TargetDescriptor>(line.trim())
                .map_err(|e| ProvisionError::InvalidDescriptor(format!("{}: {}", e, line)))?,
            None => {
                let ssh = template.ssh.as_ref().ok_or_else(|| {
                    ProvisionError::InvalidDescriptor(format!(
                        "template '{}' printed host addresses but has no ssh settings",
                        template.name
                    ))
                })?;
                let nodes: Vec<NodeConfig> = stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(|host| {
                        let mut cfg = ssh.clone();
                        cfg.host = host.to_string();
                        NodeConfig::Ssh(cfg)
                    })
                    .collect();
                TargetDescriptor {
                    id: name.to_string(),
                    template: String::new(),
                    nodes,
                    capabilities: Default::default(),
                }
            }
        };

        if descriptor.nodes.is_empty() {
            return Err(ProvisionError::InvalidDescriptor(format!(
                "create command for '{}' produced no nodes",
                template.name
            )));
        }
        if descriptor.id.is_empty() {
            descriptor.id = name.to_string();
        }
        descriptor.template = template.name.clone();
        for (key, value) in &template.capabilities {
            descriptor
                .capabilities
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        Ok(descriptor)
    }

    fn with_cache<T>(&self, f: impl FnOnce(&mut EnvironmentCache) -> T) -> T {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let out = f(&mut cache);
        if let Err(e) = cache.save(&self.cache_dir) {
            warn!("Failed to save environment cache: {:#}", e);
        }
        out
    }
}

/// Replaces `{key}` placeholders with shell-quoted values.
fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(
            &format!("{{{}}}", key),
            &shell_words::quote(value),
        );
    }
    out
}

#[async_trait]
impl EnvironmentProvider for CommandProvider {
    fn name(&self) -> &str {
        "command"
    }

    /// Returns cached targets whose template recipe is unchanged. Stale
    /// entries are destroyed.
    async fn discover(&self) -> ProvisionResult<Vec<TargetDescriptor>> {
        let entries: Vec<EnvironmentCacheEntry> =
            self.with_cache(|cache| cache.entries().cloned().collect());

        let mut live = Vec::new();
        for entry in entries {
            let current = self
                .template_config(&entry.descriptor.template)
                .ok()
                .map(|t| template_hash(t, &self.config.create_command));

            if current.as_deref() == Some(entry.template_hash.as_str()) {
                info!("Reusing kept environment '{}'", entry.descriptor.id);
                live.push(entry.descriptor);
            } else {
                info!(
                    "Kept environment '{}' is stale, destroying it",
                    entry.descriptor.id
                );
                if let Err(e) = self.teardown(&entry.descriptor).await {
                    warn!("Failed to destroy '{}': {}", entry.descriptor.id, e);
                }
            }
        }
        Ok(live)
    }

    fn templates(&self) -> Vec<Template> {
        self.config
            .templates
            .iter()
            .map(|t| Template {
                name: t.name.clone(),
                capabilities: t.capabilities.clone(),
                node_count: t.nodes.max(1),
                max_instances: t.max_instances,
            })
            .collect()
    }

    async fn provision(&self, template: &Template) -> ProvisionResult<TargetDescriptor> {
        let config = self.template_config(&template.name)?;
        let short = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("lisa-{}-{}", template.name, &short[..8]);

        let command = substitute(
            &self.config.create_command,
            &[("template", template.name.as_str()), ("name", name.as_str())],
        );
        info!("Provisioning '{}' from template '{}'", name, template.name);
        let result = self.run(&command).await?;

        self.parse_descriptor(config, &name, &result.stdout)
    }

    async fn teardown(&self, target: &TargetDescriptor) -> ProvisionResult<()> {
        let command = substitute(
            &self.config.destroy_command,
            &[("id", target.id.as_str()), ("template", target.template.as_str())],
        );
        info!("Destroying '{}'", target.id);
        let result = self.run(&command).await;
        self.with_cache(|cache| cache.remove(&target.id));
        result.map(|_| ())
    }

    async fn diagnostics(&self, target: &TargetDescriptor) -> ProvisionResult<Option<String>> {
        let Some(template) = &self.config.diagnostics_command else {
            return Ok(None);
        };
        let command = substitute(
            template,
            &[("id", target.id.as_str()), ("template", target.template.as_str())],
        );
        let result = self.run(&command).await?;
        Ok(Some(result.stdout))
    }

    async fn retain(&self, target: &TargetDescriptor) -> ProvisionResult<()> {
        let config = self.template_config(&target.template)?;
        let entry = EnvironmentCacheEntry {
            descriptor: target.clone(),
            template_hash: template_hash(config, &self.config.create_command),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        info!("Keeping environment '{}' for the next run", target.id);
        self.with_cache(|cache| cache.insert(entry));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityValue;
    use crate::config::SshNodeConfig;
    use std::collections::BTreeMap;

    fn provisioner(dir: &Path, create: &str) -> ProvisionerConfig {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("cores".to_string(), CapabilityValue::Integer(2));
        ProvisionerConfig {
            create_command: create.to_string(),
            destroy_command: format!("echo {{id}} >> {}/destroyed", dir.display()),
            diagnostics_command: Some("echo console log for {id}".to_string()),
            working_dir: Some(dir.to_path_buf()),
            timeout_secs: 10,
            templates: vec![TemplateConfig {
                name: "small".to_string(),
                max_instances: 2,
                nodes: 1,
                capabilities,
                ssh: Some(SshNodeConfig {
                    host: "unused".to_string(),
                    user: "azureuser".to_string(),
                    key_path: None,
                    port: 22,
                    working_dir: None,
                    env: BTreeMap::new(),
                    disable_host_key_check: true,
                    connect_timeout_secs: 5,
                }),
            }],
        }
    }

    fn small(provider: &CommandProvider) -> Template {
        provider.templates().remove(0)
    }

    #[test]
    fn test_substitute_quotes_values() {
        assert_eq!(
            substitute("create {template} {name}", &[("template", "a b"), ("name", "n1")]),
            "create 'a b' n1"
        );
    }

    #[tokio::test]
    async fn test_provision_from_host_lines() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CommandProvider::new(
            provisioner(dir.path(), "echo 10.0.0.4; echo 10.0.0.5"),
            dir.path(),
        );
        let target = provider.provision(&small(&provider)).await.unwrap();
        assert!(target.id.starts_with("lisa-small-"));
        assert_eq!(target.template, "small");
        assert_eq!(target.nodes.len(), 2);
        match &target.nodes[1] {
            NodeConfig::Ssh(ssh) => {
                assert_eq!(ssh.host, "10.0.0.5");
                assert_eq!(ssh.user, "azureuser");
            }
            other => panic!("expected ssh node, got {:?}", other),
        }
        assert_eq!(target.capabilities["cores"], CapabilityValue::Integer(2));
    }

    #[tokio::test]
    async fn test_provision_from_json_keeps_reported_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let create = r#"echo creating; echo '{"id": "vm-1", "nodes": [{"type": "local"}], "capabilities": {"cores": 8}}'"#;
        let provider = CommandProvider::new(provisioner(dir.path(), create), dir.path());
        let target = provider.provision(&small(&provider)).await.unwrap();
        assert_eq!(target.id, "vm-1");
        assert_eq!(target.capabilities["cores"], CapabilityValue::Integer(8));
    }

    #[tokio::test]
    async fn test_failing_create_command() {
        let dir = tempfile::tempdir().unwrap();
        let provider =
            CommandProvider::new(provisioner(dir.path(), "echo quota >&2; exit 3"), dir.path());
        let err = provider.provision(&small(&provider)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::CommandFailed(msg) if msg.contains("quota")));
    }

    #[tokio::test]
    async fn test_create_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = provisioner(dir.path(), "sleep 5");
        config.timeout_secs = 0;
        let provider = CommandProvider::new(config, dir.path());
        let err = provider.provision(&small(&provider)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_retain_then_discover_then_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let provider =
            CommandProvider::new(provisioner(dir.path(), "echo 10.0.0.4"), dir.path());
        let target = provider.provision(&small(&provider)).await.unwrap();
        provider.retain(&target).await.unwrap();

        // A new run sees the kept environment.
        let next_run = CommandProvider::new(provisioner(dir.path(), "echo 10.0.0.4"), dir.path());
        assert_eq!(next_run.discover().await.unwrap(), vec![target.clone()]);

        next_run.teardown(&target).await.unwrap();
        let destroyed = std::fs::read_to_string(dir.path().join("destroyed")).unwrap();
        assert_eq!(destroyed.trim(), target.id);
        assert!(EnvironmentCache::load(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_stale_kept_environment_is_destroyed() {
        let dir = tempfile::tempdir().unwrap();
        let provider =
            CommandProvider::new(provisioner(dir.path(), "echo 10.0.0.4"), dir.path());
        let target = provider.provision(&small(&provider)).await.unwrap();
        provider.retain(&target).await.unwrap();

        let changed = CommandProvider::new(provisioner(dir.path(), "echo 10.9.9.9"), dir.path());
        assert!(changed.discover().await.unwrap().is_empty());
        assert!(dir.path().join("destroyed").exists());
    }

    #[tokio::test]
    async fn test_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CommandProvider::new(provisioner(dir.path(), "echo h"), dir.path());
        let target = provider.provision(&small(&provider)).await.unwrap();
        let text = provider.diagnostics(&target).await.unwrap().unwrap();
        assert_eq!(text.trim(), format!("console log for {}", target.id));
    }
}
