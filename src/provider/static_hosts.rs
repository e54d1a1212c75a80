//! Provider for environments listed in the configuration.
//!
//! Every `[[environment]]` table is both a discovered target and a
//! template with a single instance. "Provisioning" a static environment
//! hands out the same machines again, which is how a tainted local or SSH
//! environment comes back as a fresh environment after teardown: the pool
//! reconnects and re-probes it under a new id.
//!
//! Teardown never touches the machines themselves.

use async_trait::async_trait;

use super::{EnvironmentProvider, ProvisionError, ProvisionResult};
use crate::config::EnvironmentConfig;
use crate::environment::{TargetDescriptor, Template};

/// Provider over statically configured environments.
pub struct StaticProvider {
    environments: Vec<EnvironmentConfig>,
}

impl StaticProvider {
    pub fn new(environments: Vec<EnvironmentConfig>) -> Self {
        Self { environments }
    }

    fn descriptor(env: &EnvironmentConfig) -> TargetDescriptor {
        TargetDescriptor {
            id: env.name.clone(),
            template: env.name.clone(),
            nodes: env.nodes.clone(),
            capabilities: env.capabilities.clone(),
        }
    }
}

#[async_trait]
impl EnvironmentProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(&self) -> ProvisionResult<Vec<TargetDescriptor>> {
        Ok(self.environments.iter().map(Self::descriptor).collect())
    }

    fn templates(&self) -> Vec<Template> {
        self.environments
            .iter()
            .map(|env| Template {
                name: env.name.clone(),
                capabilities: env.capabilities.clone(),
                node_count: env.nodes.len(),
                max_instances: 1,
            })
            .collect()
    }

    async fn provision(&self, template: &Template) -> ProvisionResult<TargetDescriptor> {
        self.environments
            .iter()
            .find(|env| env.name == template.name)
            .map(Self::descriptor)
            .ok_or_else(|| ProvisionError::UnknownTemplate(template.name.clone()))
    }

    async fn teardown(&self, _target: &TargetDescriptor) -> ProvisionResult<()> {
        Ok(())
    }
}
