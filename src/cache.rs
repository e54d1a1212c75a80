//! Persistent record of provisioned environments.
//!
//! With `keep_environments = true`, environments created by the provisioner
//! survive the run that created them. Their descriptors are stored in
//! `{cache_dir}/.lisa/environments.json` so the next run discovers and
//! reuses them instead of provisioning new machines.
//!
//! # Cache Structure
//!
//! The cache maps the provider-side target id (`vm-42`) to the target
//! descriptor plus a hash of the template recipe it was created from. An
//! entry whose recipe hash no longer matches the configured template is
//! stale: the machine was built from an older recipe.
//!
//! # Example
//!
//! ```no_run
//! use lisa::cache::{EnvironmentCache, EnvironmentCacheEntry};
//! use lisa::environment::TargetDescriptor;
//! use std::path::Path;
//!
//! let cache_dir = Path::new("/path/to/project");
//! let mut cache = EnvironmentCache::load(cache_dir);
//!
//! cache.insert(EnvironmentCacheEntry {
//!     descriptor: TargetDescriptor {
//!         id: "vm-42".to_string(),
//!         template: "small".to_string(),
//!         nodes: vec![],
//!         capabilities: Default::default(),
//!     },
//!     template_hash: "9f2c...".to_string(),
//!     created_at: chrono::Utc::now().to_rfc3339(),
//! });
//!
//! cache.save(cache_dir).unwrap();
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::TemplateConfig;
use crate::environment::TargetDescriptor;

/// A provisioned environment remembered between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentCacheEntry {
    pub descriptor: TargetDescriptor,

    /// SHA256 of the template recipe and create command.
    pub template_hash: String,

    /// RFC 3339 timestamp of provisioning.
    pub created_at: String,
}

/// Cache of provisioned environments, keyed by target id.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentCache {
    entries: BTreeMap<String, EnvironmentCacheEntry>,
}

impl EnvironmentCache {
    /// Loads the cache from disk.
    ///
    /// Reads `{cache_dir}/.lisa/environments.json`. A missing or unreadable
    /// file yields an empty cache.
    pub fn load(cache_dir: &Path) -> Self {
        let cache_path = cache_file(cache_dir);

        tracing::debug!("Loading environment cache from: {}", cache_path.display());

        if !cache_path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&cache_path) {
            Ok(contents) => {
                match serde_json::from_str::<BTreeMap<String, EnvironmentCacheEntry>>(&contents) {
                    Ok(entries) => {
                        tracing::debug!("Loaded {} cached environments", entries.len());
                        Self { entries }
                    }
                    Err(e) => {
                        tracing::warn!("Ignoring unparsable environment cache: {}", e);
                        Self::default()
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read environment cache: {}", e);
                Self::default()
            }
        }
    }

    /// Saves the cache to disk, creating `.lisa/` when needed.
    ///
    /// An empty cache removes the file instead.
    pub fn save(&self, cache_dir: &Path) -> Result<()> {
        let cache_path = cache_file(cache_dir);

        if self.entries.is_empty() {
            if cache_path.exists() {
                fs::remove_file(&cache_path).context("Failed to remove environment cache")?;
            }
            return Ok(());
        }

        let lisa_dir = cache_dir.join(".lisa");
        fs::create_dir_all(&lisa_dir).context("Failed to create .lisa directory")?;

        let contents = serde_json::to_string_pretty(&self.entries)
            .context("Failed to serialize environment cache")?;
        fs::write(&cache_path, contents).context("Failed to write environment cache")?;

        tracing::debug!("Saved {} cached environments", self.entries.len());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&EnvironmentCacheEntry> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, entry: EnvironmentCacheEntry) {
        tracing::debug!("Caching environment '{}'", entry.descriptor.id);
        self.entries.insert(entry.descriptor.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<EnvironmentCacheEntry> {
        self.entries.remove(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &EnvironmentCacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cache_file(cache_dir: &Path) -> std::path::PathBuf {
    cache_dir.join(".lisa").join("environments.json")
}

/// Hashes a template recipe together with the command that realizes it.
///
/// Returns a lowercase hexadecimal SHA256.
pub fn template_hash(template: &TemplateConfig, create_command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(create_command.as_bytes());
    hasher.update([0u8]);
    // TemplateConfig serializes deterministically: BTreeMaps and ordered fields.
    hasher.update(serde_json::to_vec(template).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityValue;
    use tempfile::TempDir;

    fn entry(id: &str) -> EnvironmentCacheEntry {
        EnvironmentCacheEntry {
            descriptor: TargetDescriptor {
                id: id.to_string(),
                template: "small".to_string(),
                nodes: vec![],
                capabilities: BTreeMap::new(),
            },
            template_hash: "abc".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn template(cores: i64) -> TemplateConfig {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("cores".to_string(), CapabilityValue::Integer(cores));
        TemplateConfig {
            name: "small".to_string(),
            max_instances: 1,
            nodes: 1,
            capabilities,
            ssh: None,
        }
    }

    #[test]
    fn test_empty_cache_load() {
        let temp_dir = TempDir::new().unwrap();
        assert!(EnvironmentCache::load(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_cache_save_and_load() {
        let temp_dir = TempDir::new().unwrap();

        let mut cache = EnvironmentCache::default();
        cache.insert(entry("vm-1"));
        cache.insert(entry("vm-2"));
        cache.save(temp_dir.path()).unwrap();

        let loaded = EnvironmentCache::load(temp_dir.path());
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("vm-1"), Some(&entry("vm-1")));
    }

    #[test]
    fn test_saving_empty_cache_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = EnvironmentCache::default();
        cache.insert(entry("vm-1"));
        cache.save(temp_dir.path()).unwrap();

        cache.remove("vm-1");
        cache.save(temp_dir.path()).unwrap();
        assert!(!temp_dir.path().join(".lisa/environments.json").exists());
    }

    #[test]
    fn test_corrupt_cache_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join(".lisa")).unwrap();
        fs::write(temp_dir.path().join(".lisa/environments.json"), "{not json").unwrap();
        assert!(EnvironmentCache::load(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_template_hash_tracks_recipe() {
        let a = template_hash(&template(2), "create {template}");
        assert_eq!(a.len(), 64);
        assert_eq!(a, template_hash(&template(2), "create {template}"));
        assert_ne!(a, template_hash(&template(4), "create {template}"));
        assert_ne!(a, template_hash(&template(2), "create-v2 {template}"));
    }
}
