//! Unit tests for the Salt master trust store.

use super::*;
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};
use std::fs;
use tempfile::TempDir;

const MINION_KEY: &str = "-----BEGIN PUBLIC KEY-----\nMIIB\n-----END PUBLIC KEY-----";

struct Fixture {
    dir: TempDir,
    runner: ScriptedRunner,
    master: SaltMaster<ScriptedRunner>,
}

impl Fixture {
    fn path(&self, relative: &str) -> std::path::PathBuf {
        self.dir.path().join(relative)
    }
}

#[fixture]
fn master() -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let pki_dir = dir.path().to_str().expect("utf-8 tempdir").to_owned();
    let runner = ScriptedRunner::new();
    let config = SaltConfig {
        pki_dir,
        ..SaltConfig::builtin()
    };
    let master = SaltMaster::new(config, runner.clone());
    Fixture {
        dir,
        runner,
        master,
    }
}

#[rstest]
#[tokio::test]
async fn reads_master_public_key(master: Fixture) {
    fs::write(master.path("master.pub"), "MASTER KEY\n").expect("write key");
    let key = master.master.master_pubkey().await.expect("key");
    assert_eq!(key, "MASTER KEY\n");
}

#[rstest]
#[tokio::test]
async fn missing_master_key_is_io_error(master: Fixture) {
    let err = master.master.master_pubkey().await.expect_err("no key");
    assert!(matches!(err, TrustError::Io { .. }), "{err:?}");
}

#[rstest]
#[tokio::test]
async fn register_writes_accepted_key(master: Fixture) {
    master
        .master
        .register("web.example.com", MINION_KEY)
        .await
        .expect("register");

    let stored = fs::read_to_string(master.path("minions/web.example.com")).expect("stored");
    assert_eq!(stored, format!("{MINION_KEY}\n"));
    assert!(master.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn register_clears_matching_pending_key(master: Fixture) {
    fs::create_dir_all(master.path("minions_pre")).expect("pending dir");
    fs::write(master.path("minions_pre/web"), format!("{MINION_KEY}\n")).expect("pending");

    master.master.register("web", MINION_KEY).await.expect("register");

    assert!(!master.path("minions_pre/web").exists());
}

#[rstest]
#[tokio::test]
async fn register_keeps_mismatched_pending_key(master: Fixture) {
    fs::create_dir_all(master.path("minions_pre")).expect("pending dir");
    fs::write(master.path("minions_pre/web"), "someone else").expect("pending");

    master.master.register("web", MINION_KEY).await.expect("register");

    assert!(master.path("minions_pre/web").exists());
}

#[rstest]
#[case("../etc/passwd")]
#[case("")]
#[case("-rf")]
#[tokio::test]
async fn unsafe_ids_are_rejected(master: Fixture, #[case] minion_id: &str) {
    let err = master
        .master
        .register(minion_id, MINION_KEY)
        .await
        .expect_err("invalid id");
    assert!(matches!(err, TrustError::InvalidId(_)), "{err:?}");
}

#[rstest]
#[tokio::test]
async fn deregister_deletes_key_without_prompting(master: Fixture) {
    master.master.deregister("web").await.expect("deregister");
    assert_eq!(
        master.runner.commands_matching("salt-key --yes --delete web").len(),
        1
    );
}

#[rstest]
#[tokio::test]
async fn failed_deregister_reports_stderr(master: Fixture) {
    master
        .runner
        .respond("salt-key", CommandOutput::failure(2, "permission denied"));
    let err = master.master.deregister("web").await.expect_err("fails");
    assert!(err.to_string().contains("permission denied"), "{err}");
}

#[rstest]
#[tokio::test]
async fn ping_succeeds_when_minion_answers(master: Fixture) {
    master
        .runner
        .respond("test.ping", CommandOutput::success(r#"{"web": true}"#));
    master.master.ping("web").await.expect("ping");
    let calls = master.runner.commands_matching("salt --out=json --timeout=15 web test.ping");
    assert_eq!(calls.len(), 1);
}

#[rstest]
#[case(CommandOutput {
    code: Some(1),
    stdout: String::from(r#"{"web": "Minion did not return. [Not connected]"}"#),
    stderr: String::new(),
})]
#[case(CommandOutput::failure(1, "No minions matched the target. Minion did not return."))]
#[case(CommandOutput::success(""))]
#[tokio::test]
async fn unreachable_minion_is_transient(master: Fixture, #[case] output: CommandOutput) {
    master.runner.respond("test.ping", output);
    let err = master.master.ping("web").await.expect_err("not connected");
    assert!(err.is_transient(), "{err:?}");
}

#[rstest]
#[tokio::test]
async fn salt_failure_is_not_transient(master: Fixture) {
    master
        .runner
        .respond("test.ping", CommandOutput::failure(2, "Salt request timed out"));
    let err = master.master.ping("web").await.expect_err("fails");
    assert!(!err.is_transient());
    assert!(err.to_string().contains("Salt request timed out"), "{err}");
}
