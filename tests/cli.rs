use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
[lisa]
max_concurrent = 2

[[environment]]
name = "local"

[[environment.node]]
type = "local"

[environment.capabilities]
os = "linux"
cores = 4
"#;

const SUITE: &str = r#"
[suite]
name = "smoke"

[[case]]
id = "smoke.echo"
command = "echo hello"

[[case.requirement.predicate]]
op = "eq"
name = "os"
value = "linux"
"#;

const WINDOWS_CASE: &str = r#"
[[case]]
id = "smoke.windows_only"
command = "true"

[[case.requirement.predicate]]
op = "eq"
name = "os"
value = "windows"
"#;

fn workspace(suite: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lisa.toml"), CONFIG).unwrap();
    std::fs::write(dir.path().join("suite.toml"), suite).unwrap();
    dir
}

fn lisa(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("lisa").unwrap();
    cmd.current_dir(dir).env("RUST_LOG", "warn");
    cmd
}

#[test]
fn validate_accepts_config_and_suite() {
    let dir = workspace(SUITE);
    lisa(dir.path())
        .args(["validate", "--suite", "suite.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Suite 'smoke' is valid: 1 case(s)"));
}

#[test]
fn validate_rejects_environment_without_nodes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lisa.toml"), "[[environment]]\nname = \"empty\"\n").unwrap();
    lisa(dir.path())
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("has no nodes"));
}

#[test]
fn init_writes_starter_config_once() {
    let dir = tempfile::tempdir().unwrap();
    lisa(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created lisa.toml"));
    assert!(dir.path().join("lisa.toml").exists());

    lisa(dir.path())
        .arg("init")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn run_passes_on_local_environment() {
    let dir = workspace(SUITE);
    lisa(dir.path())
        .args(["run", "--suite", "suite.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All tests passed!"));

    let results = dir.path().join("lisa-results");
    assert!(results.join("junit.xml").exists());
    let report = std::fs::read_to_string(results.join("report.json")).unwrap();
    assert!(report.contains("\"smoke.echo\""));
}

#[test]
fn run_reports_unmatched_case_as_blocked() {
    let dir = workspace(&format!("{}{}", SUITE, WINDOWS_CASE));
    lisa(dir.path())
        .args(["run", "--suite", "suite.toml"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("smoke.windows_only"));
}

#[test]
fn run_filter_selects_cases() {
    let dir = workspace(&format!("{}{}", SUITE, WINDOWS_CASE));
    lisa(dir.path())
        .args(["run", "--suite", "suite.toml", "--filter", "echo$"])
        .assert()
        .success();
}

#[test]
fn run_fails_on_failing_command() {
    let dir = workspace("[[case]]\nid = \"broken\"\ncommand = \"exit 3\"\n");
    lisa(dir.path())
        .args(["run", "--suite", "suite.toml"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Some tests failed."));
}

#[test]
fn plan_shows_placements() {
    let dir = workspace(&format!("{}{}", SUITE, WINDOWS_CASE));
    lisa(dir.path())
        .args(["plan", "--suite", "suite.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("smoke.echo -> local"))
        .stdout(predicate::str::contains("smoke.windows_only -> blocked"));
}

#[test]
fn plan_json_output() {
    let dir = workspace(SUITE);
    let output = lisa(dir.path())
        .args(["plan", "--suite", "suite.toml", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan[0]["case_id"], "smoke.echo");
    assert_eq!(plan[0]["target"], "environment");
    assert_eq!(plan[0]["name"], "local");
}
