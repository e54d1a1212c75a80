//! lisa: agentless test orchestration.
//!
//! lisa runs validation suites against target machines, either the machine
//! running lisa or remote machines reached over SSH, without installing
//! anything on the targets. It matches each test case's requirements
//! against the capabilities of the available environments, reserves one,
//! runs the case there and collects the outcome.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - **Node** ([`node`]): run commands and move files on one machine
//! - **Capabilities** ([`capability`]): what an environment offers
//! - **Requirements** ([`requirement`], [`matcher`]): what a case needs,
//!   and how well an environment fits it
//! - **Pool** ([`orchestrator::pool`]): environment lifecycle and
//!   reservations
//! - **Scheduler** ([`orchestrator::scheduler`]): priority queue, dispatch
//!   and retries
//! - **Driver** ([`orchestrator::driver`]): one attempt of one case
//! - **Report** ([`report`]): run records, summary and reporters
//!
//! Environments come from [`provider`]s: statically configured hosts or a
//! shell provisioner for anything that can be scripted.
//!
//! # Example
//!
//! ```no_run
//! use lisa::config::load_config;
//! use lisa::orchestrator::Orchestrator;
//! use lisa::report::ConsoleReporter;
//! use lisa::suite::Suite;
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("lisa.toml"))?;
//!     let suite = Suite::load(Path::new("suite.toml"))?;
//!     let orchestrator = Orchestrator::new(config, Path::new("."));
//!     let report = orchestrator
//!         .run(&suite, &ConsoleReporter::new(false), &CancellationToken::new())
//!         .await;
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod cache;
pub mod capability;
pub mod config;
pub mod environment;
pub mod matcher;
pub mod node;
pub mod orchestrator;
pub mod provider;
pub mod report;
pub mod requirement;
pub mod suite;

// Re-export commonly used types
pub use capability::{Capabilities, CapabilityValue};
pub use config::{Config, load_config};
pub use environment::{Environment, EnvironmentId, EnvironmentState};
pub use node::{Node, NodeError};
pub use orchestrator::{EnvironmentPool, Orchestrator};
pub use report::{Reporter, RunRecord, RunReport};
pub use requirement::{Predicate, Requirement};
pub use suite::{Outcome, Suite, TestCase};
