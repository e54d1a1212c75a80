//! Capability inventory: what an environment offers.
//!
//! An inventory maps capability names (`os`, `cores`, `sriov`, ...) to
//! values. It is filled once while an environment is prepared, from two
//! sources:
//!
//! 1. Facts probed from the primary node by a [`CapabilityProbe`]
//! 2. Capabilities declared in configuration, which win over probed ones
//!
//! After that the inventory is frozen; the matcher only ever reads it.
//!
//! # Probed Capabilities
//!
//! | Name | Source | Value |
//! |------|--------|-------|
//! | `os` | `uname -s` | text, lowercased (`linux`) |
//! | `arch` | `uname -m` | text (`x86_64`) |
//! | `kernel` | `uname -r` | text |
//! | `cores` | `nproc` | integer |
//! | `memory_mb` | `/proc/meminfo` | integer |
//!
//! A probe command that fails leaves its capability unknown.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::node::{Command, Node};

/// A single capability value.
///
/// Deserializes from plain TOML/JSON values: `true`, `8`, `2.5`,
/// `"linux"`, `["nvme", "sriov"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl CapabilityValue {
    /// Numeric view of integer and float values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CapabilityValue::Integer(i) => Some(*i as f64),
            CapabilityValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CapabilityValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            CapabilityValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityValue::Bool(b) => write!(f, "{}", b),
            CapabilityValue::Integer(i) => write!(f, "{}", i),
            CapabilityValue::Float(x) => write!(f, "{}", x),
            CapabilityValue::Text(s) => write!(f, "{}", s),
            CapabilityValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<bool> for CapabilityValue {
    fn from(b: bool) -> Self {
        CapabilityValue::Bool(b)
    }
}

impl From<i64> for CapabilityValue {
    fn from(i: i64) -> Self {
        CapabilityValue::Integer(i)
    }
}

impl From<&str> for CapabilityValue {
    fn from(s: &str) -> Self {
        CapabilityValue::Text(s.to_string())
    }
}

/// Mapping from capability name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeMap<String, CapabilityValue>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a capability. `None` means unknown.
    pub fn query(&self, name: &str) -> Option<&CapabilityValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<CapabilityValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Overlays `declared` on top of these capabilities.
    pub fn merge(mut self, declared: &BTreeMap<String, CapabilityValue>) -> Self {
        for (name, value) in declared {
            self.0.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CapabilityValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, CapabilityValue>> for Capabilities {
    fn from(map: BTreeMap<String, CapabilityValue>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, CapabilityValue)> for Capabilities {
    fn from_iter<I: IntoIterator<Item = (String, CapabilityValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Discovers capabilities of a prepared node.
///
/// Probes never fail; whatever cannot be determined is left out.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn probe(&self, primary: &Node) -> Capabilities;
}

/// Probe that reports nothing; environments carry declared capabilities
/// only.
pub struct StaticProbe;

#[async_trait]
impl CapabilityProbe for StaticProbe {
    async fn probe(&self, _primary: &Node) -> Capabilities {
        Capabilities::new()
    }
}

/// Probe running a handful of POSIX commands on the primary node.
pub struct ShellProbe {
    timeout: Duration,
}

impl ShellProbe {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }

    async fn run(&self, node: &Node, script: &str) -> Option<String> {
        match node.execute(&Command::script(script), Some(self.timeout)).await {
            Ok(result) if result.success() => {
                let out = result.stdout.trim();
                (!out.is_empty()).then(|| out.to_string())
            }
            Ok(result) => {
                debug!(
                    "[{}] probe '{}' exited with {}",
                    node.id(),
                    script,
                    result.exit_code
                );
                None
            }
            Err(e) => {
                debug!("[{}] probe '{}' failed: {}", node.id(), script, e);
                None
            }
        }
    }
}

impl Default for ShellProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityProbe for ShellProbe {
    async fn probe(&self, primary: &Node) -> Capabilities {
        let mut caps = Capabilities::new();

        if let Some(os) = self.run(primary, "uname -s").await {
            caps.insert("os", os.to_lowercase().as_str());
        }
        if let Some(arch) = self.run(primary, "uname -m").await {
            caps.insert("arch", arch.as_str());
        }
        if let Some(kernel) = self.run(primary, "uname -r").await {
            caps.insert("kernel", kernel.as_str());
        }
        if let Some(cores) = self.run(primary, "nproc").await
            && let Ok(n) = cores.parse::<i64>()
        {
            caps.insert("cores", n);
        }
        if let Some(meminfo) = self.run(primary, "cat /proc/meminfo").await
            && let Some(kb) = parse_mem_total_kb(&meminfo)
        {
            caps.insert("memory_mb", kb / 1024);
        }

        caps
    }
}

/// Extracts `MemTotal` (in kB) from `/proc/meminfo` content.
fn parse_mem_total_kb(meminfo: &str) -> Option<i64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalNodeConfig, NodeConfig};

    #[test]
    fn test_untagged_values() {
        let caps: Capabilities = toml::from_str(
            r#"
            sriov = true
            cores = 4
            ratio = 1.5
            os = "linux"
            disks = ["nvme", "ssd"]
            "#,
        )
        .unwrap();
        assert_eq!(caps.query("sriov"), Some(&CapabilityValue::Bool(true)));
        assert_eq!(caps.query("cores"), Some(&CapabilityValue::Integer(4)));
        assert_eq!(caps.query("ratio"), Some(&CapabilityValue::Float(1.5)));
        assert_eq!(caps.query("os"), Some(&CapabilityValue::from("linux")));
        assert_eq!(
            caps.query("disks").and_then(|v| v.as_list()),
            Some(&["nvme".to_string(), "ssd".to_string()][..])
        );
        assert_eq!(caps.query("gpu"), None);
    }

    #[test]
    fn test_declared_wins_over_probed() {
        let mut probed = Capabilities::new();
        probed.insert("os", "linux");
        probed.insert("cores", 2i64);

        let mut declared = BTreeMap::new();
        declared.insert("cores".to_string(), CapabilityValue::Integer(16));
        declared.insert("platform".to_string(), CapabilityValue::from("azure"));

        let merged = probed.merge(&declared);
        assert_eq!(merged.query("cores"), Some(&CapabilityValue::Integer(16)));
        assert_eq!(merged.query("os"), Some(&CapabilityValue::from("linux")));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_parse_mem_total() {
        let meminfo = "MemTotal:       16318480 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total_kb(meminfo), Some(16318480));
        assert_eq!(parse_mem_total_kb("garbage"), None);
    }

    #[tokio::test]
    async fn test_shell_probe_on_local_node() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::from_config(
            "local-0",
            &NodeConfig::Local(LocalNodeConfig {
                working_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            }),
        );
        let caps = ShellProbe::new().probe(&node).await;
        assert!(caps.query("os").is_some());
        let cores = caps.query("cores").and_then(|v| v.as_f64()).unwrap();
        assert!(cores >= 1.0);
    }

    #[tokio::test]
    async fn test_static_probe_is_empty() {
        let node = Node::from_config("n", &NodeConfig::Local(LocalNodeConfig::default()));
        assert!(StaticProbe.probe(&node).await.is_empty());
    }
}
