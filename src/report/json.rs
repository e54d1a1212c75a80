//! JSON run report.
//!
//! Writes the complete [`RunReport`] (summary plus every attempt record)
//! as pretty-printed JSON when the run completes.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{Reporter, RunRecord, RunReport};
use crate::suite::TestCase;

/// Reporter that writes the run report as JSON.
pub struct JsonReporter {
    output_path: PathBuf,
}

impl JsonReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn write(&self, report: &RunReport) -> anyhow::Result<()> {
        if let Some(parent) = self.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&self.output_path, json)?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_run_start(&self, _suite: &str, _cases: &[TestCase]) {}
    async fn on_attempt_start(&self, _case: &TestCase, _attempt: u32, _environment: &str) {}
    async fn on_record(&self, _record: &RunRecord, _is_final: bool) {}

    async fn on_run_complete(&self, report: &RunReport) {
        match self.write(report) {
            Ok(()) => tracing::info!("JSON report written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JSON report: {}", e),
        }
    }
}
