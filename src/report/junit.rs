//! JUnit XML report generation.
//!
//! Generates JUnit XML, the de facto standard for CI systems. One
//! `<testcase>` is written per case, reflecting its final attempt; earlier
//! attempts are listed in `<system-out>`.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="1" skipped="0" time="12.034">
//!   <testsuite name="smoke" tests="3" failures="1" errors="1" skipped="0" time="12.034">
//!     <testcase classname="smoke.network" name="ping" time="1.100"/>
//!     <testcase classname="smoke.network" name="iperf" time="5.020">
//!       <failure message="exited with 1" type="failed"/>
//!     </testcase>
//!     <testcase classname="smoke.storage" name="nvme" time="0.000">
//!       <error message="no current or provisionable environment ..." type="blocked"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Outcome mapping: Failed and TimedOut are `<failure>`; Errored, Blocked
//! and Cancelled are `<error>`; Skipped is `<skipped>`.
//!
//! # Example
//!
//! ```
//! use lisa::report::JUnitReporter;
//!
//! let reporter = JUnitReporter::new("lisa-results/junit.xml".into());
//! ```

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{Reporter, RunRecord, RunReport};
use crate::suite::{Outcome, TestCase};

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created as needed.
pub struct JUnitReporter {
    output_path: PathBuf,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Generates the XML document for `report`.
    pub fn generate_xml(report: &RunReport) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let finals: Vec<&RunRecord> = report
            .summary
            .cases
            .iter()
            .filter_map(|case| report.attempts(&case.id).last())
            .collect();

        let tests = finals.len().to_string();
        let failures = finals
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed | Outcome::TimedOut))
            .count()
            .to_string();
        let errors = finals
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Errored | Outcome::Blocked | Outcome::Cancelled))
            .count()
            .to_string();
        let skipped = finals
            .iter()
            .filter(|r| r.outcome == Outcome::Skipped)
            .count()
            .to_string();
        let time = format!("{:.3}", report.duration_secs);

        let counts = [
            ("tests", tests.as_str()),
            ("failures", failures.as_str()),
            ("errors", errors.as_str()),
            ("skipped", skipped.as_str()),
            ("time", time.as_str()),
        ];

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.extend_attributes(counts);
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", report.suite.as_str()));
        testsuite.extend_attributes(counts);
        testsuite.push_attribute(("timestamp", report.started_at.to_rfc3339().as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for record in finals {
            write_testcase(&mut writer, &report.suite, record, report)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn write_testcase<W: Write>(
    writer: &mut Writer<W>,
    suite: &str,
    record: &RunRecord,
    report: &RunReport,
) -> anyhow::Result<()> {
    let (classname, name) = split_case_id(suite, &record.case_id);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname.as_str()));
    testcase.push_attribute(("name", name.as_str()));
    testcase.push_attribute(("time", format!("{:.3}", record.duration().as_secs_f64()).as_str()));

    let earlier: Vec<String> = report
        .attempts(&record.case_id)
        .filter(|r| r.attempt < record.attempt)
        .map(|r| {
            format!(
                "attempt {}: {}{}",
                r.attempt,
                r.outcome,
                r.message.as_ref().map(|m| format!(" ({})", m)).unwrap_or_default()
            )
        })
        .collect();

    let element = match record.outcome {
        Outcome::Passed => None,
        Outcome::Skipped => Some("skipped"),
        Outcome::Failed | Outcome::TimedOut => Some("failure"),
        Outcome::Errored | Outcome::Blocked | Outcome::Cancelled => Some("error"),
    };

    if element.is_none() && earlier.is_empty() {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;
    if let Some(tag) = element {
        let mut child = BytesStart::new(tag);
        if let Some(message) = &record.message {
            child.push_attribute(("message", clean_xml(message).as_str()));
        }
        if tag != "skipped" {
            child.push_attribute(("type", record.outcome.as_str()));
        }
        writer.write_event(Event::Empty(child))?;
    }
    if !earlier.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&clean_xml(&earlier.join("\n")))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_start(&self, _suite: &str, _cases: &[TestCase]) {}
    async fn on_attempt_start(&self, _case: &TestCase, _attempt: u32, _environment: &str) {}
    async fn on_record(&self, _record: &RunRecord, _is_final: bool) {}

    async fn on_run_complete(&self, report: &RunReport) {
        match Self::generate_xml(report) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.exists()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}

/// Splits `area.sub.name` into classname `suite.area.sub` and `name`.
fn split_case_id(suite: &str, id: &str) -> (String, String) {
    match id.rsplit_once(['.', '/']) {
        Some((area, name)) => (format!("{}.{}", suite, area.replace('/', ".")), name.to_string()),
        None => (suite.to_string(), id.to_string()),
    }
}

/// Drops characters XML 1.0 cannot carry. quick-xml escapes the rest.
fn clean_xml(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}
