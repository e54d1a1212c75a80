//! Configuration loading and schema definitions.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

use crate::node::is_env_name;

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate(&config)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate(&config)?;
    Ok(config)
}

/// Checks constraints serde cannot express.
fn validate(config: &Config) -> Result<()> {
    let mut names = std::collections::HashSet::new();
    for env in &config.environments {
        if env.nodes.is_empty() {
            anyhow::bail!("environment '{}' has no nodes", env.name);
        }
        if !names.insert(env.name.as_str()) {
            anyhow::bail!("environment name '{}' is used twice", env.name);
        }
        for node in &env.nodes {
            let vars = match node {
                NodeConfig::Local(local) => &local.env,
                NodeConfig::Ssh(ssh) => &ssh.env,
            };
            check_env_names(&env.name, vars.keys())?;
        }
    }
    if let Some(provisioner) = &config.provisioner {
        for template in &provisioner.templates {
            if !names.insert(template.name.as_str()) {
                anyhow::bail!(
                    "template name '{}' clashes with another environment or template",
                    template.name
                );
            }
            if template.nodes == 0 {
                anyhow::bail!("template '{}' must have at least one node", template.name);
            }
            if let Some(ssh) = &template.ssh {
                check_env_names(&template.name, ssh.env.keys())?;
            }
        }
    }
    if config.lisa.max_concurrent == 0 {
        anyhow::bail!("lisa.max_concurrent must be at least 1");
    }
    Ok(())
}

fn check_env_names<'a>(owner: &str, keys: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for key in keys {
        if !is_env_name(key) {
            anyhow::bail!("'{}' sets invalid environment variable name {:?}", owner, key);
        }
    }
    Ok(())
}
