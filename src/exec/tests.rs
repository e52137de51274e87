//! Unit tests for the process command runner.

use super::*;
use rstest::rstest;

#[tokio::test]
async fn process_runner_captures_both_streams() {
    let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
    let output = ProcessCommandRunner
        .run(&spec)
        .await
        .expect("sh should run");
    assert_eq!(output.code, Some(3));
    assert_eq!(output.stdout, "out\n");
    assert_eq!(output.stderr, "err\n");
    assert!(!output.is_success());
}

#[tokio::test]
async fn process_runner_feeds_stdin() {
    let spec = CommandSpec::new("cat").stdin(b"canary".to_vec());
    let output = ProcessCommandRunner
        .run(&spec)
        .await
        .expect("cat should run");
    assert!(output.is_success());
    assert_eq!(output.stdout, "canary");
}

#[tokio::test]
async fn process_runner_passes_environment() {
    let spec = CommandSpec::new("sh")
        .args(["-c", "printf %s \"$HART_TEST_VALUE\""])
        .env("HART_TEST_VALUE", "value");
    let output = ProcessCommandRunner
        .run(&spec)
        .await
        .expect("sh should run");
    assert_eq!(output.stdout, "value");
}

#[tokio::test]
async fn process_runner_kills_on_timeout() {
    let spec = CommandSpec::new("sleep")
        .arg("5")
        .timeout(Some(Duration::from_millis(50)));
    let err = ProcessCommandRunner
        .run(&spec)
        .await
        .expect_err("sleep should time out");
    assert!(matches!(err, ExecError::Timeout { .. }));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn process_runner_detaches_children_from_terminal_group() {
    let spec = CommandSpec::new("sh").args([
        "-c",
        "read -r pid _ _ _ pgrp _ < /proc/$$/stat; printf '%s %s' \"$pid\" \"$pgrp\"",
    ]);
    let output = ProcessCommandRunner
        .run(&spec)
        .await
        .expect("sh should run");
    let (pid, pgrp) = output
        .stdout
        .split_once(' ')
        .expect("pid and process group");
    assert_eq!(pid, pgrp, "child should lead its own process group");
    assert_ne!(pgrp, std::process::id().to_string());
}

#[tokio::test]
async fn process_runner_reports_spawn_failure() {
    let spec = CommandSpec::new("/nonexistent/hart-binary");
    let err = ProcessCommandRunner
        .run(&spec)
        .await
        .expect_err("missing binary should fail");
    assert!(matches!(err, ExecError::Spawn { .. }));
}

#[rstest]
#[case(Some(0), "0")]
#[case(Some(255), "255")]
#[case(None, "unknown")]
fn status_text_renders_exit_code(#[case] code: Option<i32>, #[case] expected: &str) {
    let output = CommandOutput {
        code,
        ..CommandOutput::default()
    };
    assert_eq!(output.status_text(), expected);
}

#[rstest]
fn command_string_joins_program_and_args() {
    let spec = CommandSpec::new("ssh").args(["-p", "22", "root@192.0.2.1"]);
    assert_eq!(spec.command_string(), "ssh -p 22 root@192.0.2.1");
}
