//! Environment providers: where environments come from.
//!
//! A provider hands the pool raw [`TargetDescriptor`]s, either targets that
//! already exist ([`discover`](EnvironmentProvider::discover)) or new ones
//! built from a [`Template`] ([`provision`](EnvironmentProvider::provision)).
//! The pool turns descriptors into environments; the provider never sees
//! nodes or reservations.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   EnvironmentProvider                        │
//! │                                                              │
//! │  discover()          ──► existing targets                   │
//! │  templates()         ──► recipes the pool may provision     │
//! │  provision(template) ──► new target                         │
//! │  teardown(target)                                           │
//! │  diagnostics(target) ──► e.g. serial console log            │
//! │  retain(target)      ──► keep alive for the next run        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Providers
//!
//! | Provider | Module | Description |
//! |----------|--------|-------------|
//! | Static | [`static_hosts`] | Environments listed in the configuration |
//! | Command | [`command`] | Shell lifecycle commands for any cloud or lab |
//! | Composite | this module | Several providers behind one |

pub mod command;
pub mod static_hosts;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::Config;
use crate::environment::{TargetDescriptor, Template};

/// Result type for provider operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors raised by providers.
///
/// None of these abort a run on their own; the pool decides whether the
/// run can continue.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Provisioning command failed: {0}")]
    CommandFailed(String),

    #[error("Provisioning command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid target descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),
}

/// Source of environments.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Targets that exist right now.
    async fn discover(&self) -> ProvisionResult<Vec<TargetDescriptor>>;

    /// Recipes this provider can realize on demand.
    fn templates(&self) -> Vec<Template>;

    /// Creates a new target from `template`.
    async fn provision(&self, template: &Template) -> ProvisionResult<TargetDescriptor>;

    /// Destroys a target. Targets this provider does not own are ignored.
    async fn teardown(&self, target: &TargetDescriptor) -> ProvisionResult<()>;

    /// Diagnostics for a target whose state is no longer trusted.
    async fn diagnostics(&self, _target: &TargetDescriptor) -> ProvisionResult<Option<String>> {
        Ok(None)
    }

    /// Keeps a healthy target alive past the end of the run.
    async fn retain(&self, _target: &TargetDescriptor) -> ProvisionResult<()> {
        Ok(())
    }
}

/// Several providers behind one interface.
///
/// Requests are routed by template name, so template names must be unique
/// across the wrapped providers.
pub struct CompositeProvider {
    providers: Vec<Box<dyn EnvironmentProvider>>,
    routes: HashMap<String, usize>,
}

impl CompositeProvider {
    pub fn new(providers: Vec<Box<dyn EnvironmentProvider>>) -> Self {
        let mut routes = HashMap::new();
        for (index, provider) in providers.iter().enumerate() {
            for template in provider.templates() {
                routes.entry(template.name).or_insert(index);
            }
        }
        Self { providers, routes }
    }

    fn route(&self, template: &str) -> ProvisionResult<&dyn EnvironmentProvider> {
        self.routes
            .get(template)
            .and_then(|i| self.providers.get(*i))
            .map(|p| p.as_ref())
            .ok_or_else(|| ProvisionError::UnknownTemplate(template.to_string()))
    }
}

#[async_trait]
impl EnvironmentProvider for CompositeProvider {
    fn name(&self) -> &str {
        "composite"
    }

    /// Concatenates every provider's targets. Fails only if every provider
    /// fails.
    async fn discover(&self) -> ProvisionResult<Vec<TargetDescriptor>> {
        let results =
            futures::future::join_all(self.providers.iter().map(|p| p.discover())).await;

        let mut targets = Vec::new();
        let mut errors = Vec::new();
        for (provider, result) in self.providers.iter().zip(results) {
            match result {
                Ok(found) => targets.extend(found),
                Err(e) => {
                    warn!("Provider '{}' failed to discover: {}", provider.name(), e);
                    errors.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        if !self.providers.is_empty() && errors.len() == self.providers.len() {
            return Err(ProvisionError::Discovery(errors.join("; ")));
        }
        Ok(targets)
    }

    fn templates(&self) -> Vec<Template> {
        self.providers.iter().flat_map(|p| p.templates()).collect()
    }

    async fn provision(&self, template: &Template) -> ProvisionResult<TargetDescriptor> {
        self.route(&template.name)?.provision(template).await
    }

    async fn teardown(&self, target: &TargetDescriptor) -> ProvisionResult<()> {
        self.route(&target.template)?.teardown(target).await
    }

    async fn diagnostics(&self, target: &TargetDescriptor) -> ProvisionResult<Option<String>> {
        self.route(&target.template)?.diagnostics(target).await
    }

    async fn retain(&self, target: &TargetDescriptor) -> ProvisionResult<()> {
        self.route(&target.template)?.retain(target).await
    }
}

/// Builds the provider described by the configuration: configured
/// environments plus the shell provisioner when present.
///
/// `cache_dir` holds `.lisa/environments.json`.
pub fn from_config(config: &Config, cache_dir: &Path) -> Box<dyn EnvironmentProvider> {
    let mut providers: Vec<Box<dyn EnvironmentProvider>> = Vec::new();
    if !config.environments.is_empty() {
        providers.push(Box::new(static_hosts::StaticProvider::new(
            config.environments.clone(),
        )));
    }
    if let Some(provisioner) = &config.provisioner {
        providers.push(Box::new(command::CommandProvider::new(
            provisioner.clone(),
            cache_dir,
        )));
    }

    if providers.len() == 1 {
        providers.remove(0)
    } else {
        Box::new(CompositeProvider::new(providers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    #[tokio::test]
    async fn test_composite_routes_by_template() {
        let config = load_config_str(
            r#"
            [[environment]]
            name = "local"
            [[environment.node]]
            type = "local"

            [provisioner]
            create_command = "echo '{\"id\": \"vm-{name}\", \"nodes\": [{\"type\": \"local\"}]}'"
            destroy_command = "true"

            [[provisioner.template]]
            name = "small"
            "#,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let provider = from_config(&config, dir.path());
        assert_eq!(provider.name(), "composite");

        let names: Vec<String> = provider.templates().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["local".to_string(), "small".to_string()]);

        let discovered = provider.discover().await.unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].template, "local");

        let small = provider
            .templates()
            .into_iter()
            .find(|t| t.name == "small")
            .unwrap();
        let target = provider.provision(&small).await.unwrap();
        assert_eq!(target.template, "small");
        assert!(target.id.starts_with("vm-lisa-small-"));
        provider.teardown(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let composite = CompositeProvider::new(vec![]);
        let template = Template {
            name: "ghost".to_string(),
            capabilities: Default::default(),
            node_count: 1,
            max_instances: 1,
        };
        assert!(matches!(
            composite.provision(&template).await,
            Err(ProvisionError::UnknownTemplate(_))
        ));
        assert!(composite.discover().await.unwrap().is_empty());
    }
}
