//! Environments: ordered groups of nodes with a frozen capability inventory.
//!
//! An [`Environment`] is built from a [`TargetDescriptor`] handed out by a
//! provider. Its lifecycle state is owned by the pool's reservation table;
//! the environment itself only carries what never changes once it is
//! ready: identity, nodes and capabilities.
//!
//! ```text
//! Discovered ──► Preparing ──► Ready ◄──────────── Released
//!                    │           │                    ▲
//!                    ▼           ▼                    │
//!                  Failed     Reserved ──► InUse ─────┤
//!                                                     │
//!                                                     ▼
//!                                             Dirty ──► torn down
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capability::{Capabilities, CapabilityProbe, CapabilityValue};
use crate::config::NodeConfig;
use crate::node::{Node, NodeError};

/// Pool-assigned environment identifier. Lower ids were added earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(pub u64);

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env-{}", self.0)
    }
}

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentState {
    Discovered,
    Preparing,
    Ready,
    Reserved,
    InUse,
    Dirty,
    Released,
    Failed,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Discovered => "discovered",
            EnvironmentState::Preparing => "preparing",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Reserved => "reserved",
            EnvironmentState::InUse => "in-use",
            EnvironmentState::Dirty => "dirty",
            EnvironmentState::Released => "released",
            EnvironmentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A raw target as produced by a provider.
///
/// Also the JSON a provisioning command prints:
///
/// ```json
/// {"id": "vm-42", "nodes": [{"type": "ssh", "host": "10.0.0.4", "user": "lisa"}]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Provider-side identifier (VM name, host name, configured name).
    pub id: String,

    /// Template this target was created from.
    #[serde(default)]
    pub template: String,

    /// Nodes, primary first.
    pub nodes: Vec<NodeConfig>,

    /// Capabilities the provider vouches for.
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityValue>,
}

/// A provisionable environment recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,

    /// Capabilities environments from this template are expected to have.
    pub capabilities: BTreeMap<String, CapabilityValue>,

    /// Number of nodes each environment gets.
    pub node_count: usize,

    /// Upper bound on live environments from this template.
    pub max_instances: usize,
}

/// One environment: identity, nodes and (once ready) capabilities.
pub struct Environment {
    id: EnvironmentId,
    descriptor: TargetDescriptor,
    nodes: Vec<Arc<Node>>,
    capabilities: OnceLock<Capabilities>,
}

impl Environment {
    /// Builds an environment and its nodes from a descriptor.
    pub fn new(id: EnvironmentId, descriptor: TargetDescriptor) -> Self {
        let nodes = descriptor
            .nodes
            .iter()
            .enumerate()
            .map(|(i, cfg)| Arc::new(Node::from_config(format!("{}/{}", descriptor.id, i), cfg)))
            .collect();
        Self::with_nodes(id, descriptor, nodes)
    }

    /// Builds an environment around already constructed nodes.
    pub fn with_nodes(id: EnvironmentId, descriptor: TargetDescriptor, nodes: Vec<Arc<Node>>) -> Self {
        Self {
            id,
            descriptor,
            nodes,
            capabilities: OnceLock::new(),
        }
    }

    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    /// Provider-side name of the target.
    pub fn name(&self) -> &str {
        &self.descriptor.id
    }

    pub fn template(&self) -> &str {
        &self.descriptor.template
    }

    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The node the main test command runs on.
    pub fn primary(&self) -> Option<&Arc<Node>> {
        self.nodes.first()
    }

    /// The frozen inventory; `None` until the environment has been
    /// prepared.
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.get()
    }

    /// Connects every node and freezes the capability inventory.
    ///
    /// Probed facts come from the primary node; capabilities declared in
    /// the descriptor win. Calling this again after success is a no-op, so
    /// the inventory can never change once set.
    pub async fn prepare(&self, probe: &dyn CapabilityProbe) -> Result<(), NodeError> {
        if self.capabilities.get().is_some() {
            return Ok(());
        }

        let primary = self
            .primary()
            .ok_or_else(|| NodeError::Connection(format!("{} has no nodes", self.name())))?;

        futures::future::try_join_all(self.nodes.iter().map(|n| n.connect())).await?;
        debug!("{}: {} node(s) connected", self.id, self.nodes.len());

        let caps = probe.probe(primary).await.merge(&self.descriptor.capabilities);
        info!(
            "{} ({}) ready: {}",
            self.id,
            self.name(),
            caps.iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" ")
        );
        let _ = self.capabilities.set(caps);
        Ok(())
    }

    /// Disconnects every node.
    pub async fn disconnect(&self) {
        futures::future::join_all(self.nodes.iter().map(|n| n.disconnect())).await;
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("name", &self.descriptor.id)
            .field("template", &self.descriptor.template)
            .field("nodes", &self.nodes)
            .field("capabilities", &self.capabilities.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ShellProbe, StaticProbe};
    use crate::config::LocalNodeConfig;

    fn local_descriptor(dir: &std::path::Path, nodes: usize) -> TargetDescriptor {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("os".to_string(), CapabilityValue::from("plan9"));
        TargetDescriptor {
            id: "local".to_string(),
            template: "local".to_string(),
            nodes: (0..nodes)
                .map(|_| {
                    NodeConfig::Local(LocalNodeConfig {
                        working_dir: Some(dir.to_path_buf()),
                        ..Default::default()
                    })
                })
                .collect(),
            capabilities,
        }
    }

    #[test]
    fn test_descriptor_json() {
        let desc: TargetDescriptor = serde_json::from_str(
            r#"{"id": "vm-42", "nodes": [{"type": "ssh", "host": "10.0.0.4"}], "capabilities": {"cores": 8}}"#,
        )
        .unwrap();
        assert_eq!(desc.id, "vm-42");
        assert_eq!(desc.template, "");
        assert_eq!(desc.nodes.len(), 1);
        assert_eq!(desc.capabilities["cores"], CapabilityValue::Integer(8));
    }

    #[tokio::test]
    async fn test_prepare_freezes_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(EnvironmentId(1), local_descriptor(dir.path(), 2));
        assert!(env.capabilities().is_none());
        assert_eq!(env.node_count(), 2);
        assert_eq!(env.nodes()[1].id(), "local/1");

        env.prepare(&ShellProbe::new()).await.unwrap();
        // Declared value wins over the probed `os`.
        assert_eq!(
            env.capabilities().unwrap().query("os"),
            Some(&CapabilityValue::from("plan9"))
        );
        assert!(env.capabilities().unwrap().query("cores").is_some());

        // A second prepare never replaces the inventory.
        env.prepare(&StaticProbe).await.unwrap();
        assert!(env.capabilities().unwrap().query("cores").is_some());
    }

    #[tokio::test]
    async fn test_prepare_fails_when_a_node_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = local_descriptor(dir.path(), 1);
        desc.nodes.push(NodeConfig::Local(LocalNodeConfig {
            working_dir: Some(dir.path().join("missing")),
            ..Default::default()
        }));
        let env = Environment::new(EnvironmentId(2), desc);
        assert!(env.prepare(&StaticProbe).await.is_err());
        assert!(env.capabilities().is_none());
    }

    #[test]
    fn test_id_display_and_order() {
        assert_eq!(EnvironmentId(7).to_string(), "env-7");
        assert!(EnvironmentId(1) < EnvironmentId(2));
    }
}
