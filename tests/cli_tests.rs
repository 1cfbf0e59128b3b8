use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::tempdir;

fn cli_command() -> Command {
    Command::new(env!("CARGO_BIN_EXE_stepflow"))
}

fn run_in(store: &Path, args: &[&str]) -> Output {
    cli_command()
        .arg("--store-dir")
        .arg(store)
        .args(args)
        .output()
        .unwrap()
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({}): {}",
            e,
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

#[test]
fn test_cli_help() {
    let output = cli_command().arg("--help").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Drive durable step workflows"));
    for command in ["definitions", "validate", "start", "status", "resume", "retry", "cancel", "recover"] {
        assert!(stdout.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_cli_version() {
    let output = cli_command().arg("--version").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("stepflow"));
}

#[test]
fn test_cli_start_help() {
    let output = cli_command().args(["start", "--help"]).output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Start a run"));
    assert!(stdout.contains("--project"));
    assert!(stdout.contains("--input"));
    assert!(stdout.contains("--webhook"));
}

#[test]
fn test_cli_lists_builtin_definitions() {
    let output = cli_command().arg("definitions").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ad_production (7 steps)"));
    assert!(stdout.contains("revision (3 steps)"));
    assert!(stdout.contains("Human Review [human_review / human_review] <- generation"));
}

#[test]
fn test_cli_definitions_include_custom_directory() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("quick.yaml"),
        "workflowType: quick_cut\nsteps:\n  - name: Cut\n    stepType: generation\n    handler: generation\n",
    )
    .unwrap();

    let output = cli_command()
        .arg("--definitions")
        .arg(dir.path())
        .arg("definitions")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("quick_cut (1 steps)"));
    assert!(stdout.contains("revision (3 steps)"));
}

#[test]
fn test_cli_validate() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("good.yaml"),
        "workflowType: good\nsteps:\n  - name: Render\n    stepType: generation\n    handler: custom_render\n",
    )
    .unwrap();

    let output = cli_command().arg("validate").arg(dir.path()).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✓ good (1 steps)"));
    assert!(stdout.contains("handler 'custom_render' is not built in"));

    fs::write(
        dir.path().join("bad.yaml"),
        "workflowType: bad\nsteps:\n  - name: Deliver\n    stepType: delivery\n    handler: delivery\n    dependsOn: [review]\n",
    )
    .unwrap();

    let output = cli_command().arg("validate").arg(dir.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).contains("✗ bad"));
}

#[test]
fn test_cli_unknown_workflow_type() {
    let store = tempdir().unwrap();
    let output = run_in(store.path(), &["start", "batch_generation", "--project", "p1"]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unknown workflow type: batch_generation"));
}

#[test]
fn test_cli_rejects_non_object_input() {
    let store = tempdir().unwrap();
    let output = run_in(
        store.path(),
        &["start", "revision", "--project", "p1", "--input", "[1, 2]"],
    );

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("must be a JSON object"));
}

#[test]
fn test_cli_revision_pauses_then_resumes() {
    let store = tempdir().unwrap();

    let output = run_in(
        store.path(),
        &[
            "start",
            "revision",
            "--project",
            "p1",
            "--input",
            r#"{"revisionType": "color_grade"}"#,
        ],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let run = stdout_json(&output);
    assert_eq!(run["status"], "waiting_human");
    assert_eq!(run["steps"][0]["output"]["revisionType"], "color_grade");
    assert_eq!(run["steps"][2]["status"], "waiting_human");
    let run_id = run["id"].as_str().unwrap().to_string();

    let output = run_in(store.path(), &["status", &run_id]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["status"], "waiting_human");

    let output = run_in(store.path(), &["list", "--project", "p1"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(&run_id));

    let output = run_in(
        store.path(),
        &["resume", &run_id, "--output", r#"{"approved": true}"#],
    );
    assert!(output.status.success());
    let run = stdout_json(&output);
    assert_eq!(run["status"], "completed");
    assert_eq!(run["steps"][2]["output"]["approved"], true);

    let output = run_in(store.path(), &["logs", &run_id]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Workflow started"));
    assert!(stdout.contains("Workflow resumed"));
    assert!(stdout.contains("Workflow completed"));
}

#[test]
fn test_cli_cancel_paused_run() {
    let store = tempdir().unwrap();

    let output = run_in(store.path(), &["start", "revision", "--project", "p1"]);
    let run_id = stdout_json(&output)["id"].as_str().unwrap().to_string();

    let output = run_in(store.path(), &["cancel", &run_id]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["status"], "cancelled");

    // terminal runs cannot be cancelled twice
    let output = run_in(store.path(), &["cancel", &run_id]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_cli_status_of_missing_run() {
    let store = tempdir().unwrap();
    let output = run_in(store.path(), &["status", "does-not-exist"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Run not found"));
}
