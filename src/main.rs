//! lisa CLI - agentless test orchestration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lisa::config::{self, Config};
use lisa::orchestrator::{Orchestrator, Placement};
use lisa::report::{ConsoleReporter, JUnitReporter, JsonReporter, MultiReporter};
use lisa::suite::Suite;

#[derive(Parser)]
#[command(name = "lisa")]
#[command(about = "Agentless test orchestration", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "lisa.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a suite
    Run {
        /// Suite file
        #[arg(short, long, default_value = "suite.toml")]
        suite: PathBuf,

        /// Override maximum concurrent environments
        #[arg(short, long)]
        parallel: Option<usize>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Leave healthy environments running afterwards
        #[arg(long)]
        keep_environments: bool,

        /// Only run cases whose id matches this regex
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Show where each case would run, without running anything
    Plan {
        /// Suite file
        #[arg(short, long, default_value = "suite.toml")]
        suite: PathBuf,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Connect to the configured environments and show their capabilities
    Environments,

    /// Validate the configuration file, and optionally a suite
    Validate {
        /// Suite file to check as well
        #[arg(short, long)]
        suite: Option<PathBuf>,
    },

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            suite,
            parallel,
            junit,
            keep_environments,
            filter,
        } => {
            run_suite(
                &cli.config,
                &suite,
                RunOverrides {
                    parallel,
                    junit,
                    keep_environments,
                    filter,
                },
                cli.verbose,
            )
            .await
        }
        Commands::Plan { suite, format } => plan_suite(&cli.config, &suite, &format).await,
        Commands::Environments => list_environments(&cli.config).await,
        Commands::Validate { suite } => validate(&cli.config, suite.as_deref()),
        Commands::Init => init_config(),
    }
}

struct RunOverrides {
    parallel: Option<usize>,
    junit: Option<PathBuf>,
    keep_environments: bool,
    filter: Option<String>,
}

fn load(config_path: &Path) -> Result<Config> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

/// `.lisa/` lives next to the configuration file.
fn cache_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

async fn run_suite(config_path: &Path, suite_path: &Path, overrides: RunOverrides, verbose: bool) -> Result<()> {
    let mut config = load(config_path)?;

    // Apply overrides
    if let Some(parallel) = overrides.parallel {
        config.lisa.max_concurrent = parallel.max(1);
    }
    if overrides.keep_environments {
        config.lisa.keep_environments = true;
    }

    let mut suite = Suite::load(suite_path)?;
    if let Some(pattern) = &overrides.filter {
        let regex = Regex::new(pattern).with_context(|| format!("Invalid filter: {}", pattern))?;
        suite.retain_matching(&regex);
        info!("Filter '{}' selected {} case(s)", pattern, suite.cases.len());
    }

    let reporter = create_reporter(&config, overrides.junit, verbose);
    let orchestrator = Orchestrator::new(config, &cache_dir(config_path));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let report = orchestrator.run(&suite, &reporter, &cancel).await;
    std::process::exit(report.exit_code());
}

async fn plan_suite(config_path: &Path, suite_path: &Path, format: &str) -> Result<()> {
    let config = load(config_path)?;
    let suite = Suite::load(suite_path)?;
    let orchestrator = Orchestrator::new(config, &cache_dir(config_path));
    let plan = orchestrator.plan(&suite).await;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&plan)?;
            println!("{}", json);
        }
        _ => {
            println!("Plan for {} case(s):", plan.len());
            for entry in &plan {
                let target = match &entry.placement {
                    Placement::Environment { name, score } => format!("{} (score {})", name, score),
                    Placement::Provision { template } => format!("new environment from '{}'", template),
                    Placement::Skipped => "skipped".to_string(),
                    Placement::Blocked => "blocked: no matching environment".to_string(),
                };
                println!("  {} -> {}", entry.case_id, target);
            }
        }
    }

    Ok(())
}

async fn list_environments(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    let orchestrator = Orchestrator::new(config, &cache_dir(config_path));
    let environments = orchestrator.environments().await?;

    if environments.is_empty() {
        println!("No environments available.");
        return Ok(());
    }

    for env in &environments {
        println!("{} [{}] {}", env.name, env.id, env.state);
        for node in &env.nodes {
            println!("  node: {}", node);
        }
        if let Some(capabilities) = &env.capabilities {
            for (name, value) in capabilities.iter() {
                println!("  {} = {}", name, value);
            }
        }
    }
    for template in orchestrator.pool().templates() {
        println!("template {} (max {})", template.name, template.max_instances);
    }

    Ok(())
}

fn validate(config_path: &Path, suite_path: Option<&Path>) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Max concurrent: {}", config.lisa.max_concurrent);
            println!("  Case timeout: {}s", config.lisa.case_timeout_secs);
            println!("  Max attempts: {}", config.lisa.retry.max_attempts);
            println!("  Environments: {}", config.environments.len());
            let templates = config.provisioner.as_ref().map_or(0, |p| p.templates.len());
            println!("  Templates: {}", templates);
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }

    if let Some(path) = suite_path {
        match Suite::load(path) {
            Ok(suite) => {
                println!();
                println!("Suite '{}' is valid: {} case(s)", suite.name(), suite.cases.len());
            }
            Err(e) => {
                eprintln!("Suite error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

const STARTER_CONFIG: &str = r#"# lisa configuration file

[lisa]
max_concurrent = 4
case_timeout_secs = 300

[lisa.retry]
max_attempts = 1

[lisa.reservation]
mode = "no-wait"

[[environment]]
name = "local"

[[environment.node]]
type = "local"

# A remote machine reached over SSH:
#
# [[environment]]
# name = "remote"
#
# [[environment.node]]
# type = "ssh"
# host = "10.0.0.4"
# user = "lisa"
# key_path = "~/.ssh/id_rsa"
#
# [environment.capabilities]
# platform = "azure"

[report]
output_dir = "lisa-results"
junit = true
json = true
"#;

fn init_config() -> Result<()> {
    let path = PathBuf::from("lisa.toml");
    if path.exists() {
        eprintln!("lisa.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, STARTER_CONFIG)?;
    println!("Created lisa.toml");
    println!();
    println!("Write a suite.toml with your cases, then run:");
    println!("  lisa run --suite suite.toml");

    Ok(())
}

fn create_reporter(config: &Config, junit_override: Option<PathBuf>, verbose: bool) -> MultiReporter {
    let mut multi = MultiReporter::new();

    // Add console reporter
    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    // Add JUnit reporter if enabled
    if config.report.junit || junit_override.is_some() {
        let junit_path =
            junit_override.unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    if config.report.json {
        multi = multi.with_reporter(JsonReporter::new(config.report.output_dir.join(&config.report.json_file)));
    }

    multi
}
