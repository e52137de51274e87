//! Scenarios for minion and master provisioning and minion destruction.

use hart::exec::CommandOutput;
use hart::lifecycle::{Interrupt, LifecycleError, MasterOptions, Stage, StepError};
use hart::ssh::SshError;
use hart::trust::TrustError;
use rstest::rstest;

use super::test_doubles::{ADDRESS, EXTRA, FailAt, MASTER_PUBKEY, RESOURCE_ID, not_connected};
use super::test_helpers::{
    CANARY_READ, LifecycleContext, MINION_ID, MINION_KEY, bare_context, context, spec,
};

fn rolled_back(err: &LifecycleError) -> (Stage, &str, &StepError) {
    match err {
        LifecycleError::RolledBack {
            stage,
            message,
            source,
        } => (*stage, message.as_str(), source),
        other => panic!("expected a rolled back failure, got {other:?}"),
    }
}

#[rstest]
#[tokio::test]
async fn successful_minion_registers_once_and_keeps_resource(context: LifecycleContext) {
    let node = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect("minion provisioned");

    assert_eq!(node.minion_id, MINION_ID);
    assert_eq!(node.handle.id, RESOURCE_ID);
    assert_eq!(node.extra.get(), Some(EXTRA));
    assert_eq!(node.public_address, Some(ADDRESS));
    assert_eq!(
        context.trust.registered(),
        vec![(String::from(MINION_ID), String::from(MINION_KEY))]
    );
    assert!(context.provider.destroyed().is_empty());
    assert_eq!(context.journal.count("register_key"), 1);
    assert_eq!(context.journal.count("release_key"), 1);
    assert_eq!(
        context.journal.entries(),
        [
            "register_key",
            "create",
            "resolve",
            "wait_for_bootstrap",
            "register",
            "ping",
            "post_connect",
            "release_key",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn payload_carries_canary_and_master_key(context: LifecycleContext) {
    context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect("minion provisioned");

    let payload = context.provider.user_data().expect("payload sent");
    assert!(payload.contains(LifecycleContext::expected_canary().as_str()));
    assert!(payload.contains(MASTER_PUBKEY));
}

#[rstest]
#[tokio::test]
async fn session_runs_bootstrap_protocol_and_closes(context: LifecycleContext) {
    context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect("minion provisioned");

    assert_eq!(context.remote_commands(CANARY_READ), 1);
    assert_eq!(context.remote_commands("dd of=/dev/random"), 1);
    assert_eq!(
        context.remote_commands("salt-call test.ping && service salt-minion restart"),
        1
    );
    assert_eq!(context.remote_commands("grep -vF AAAAC3NzaTEMPORARY"), 1);
    assert_eq!(context.runner.commands_matching("-O exit").len(), 1);
}

#[rstest]
#[tokio::test]
async fn canary_mismatch_destroys_once_and_never_registers(bare_context: LifecycleContext) {
    bare_context
        .runner
        .respond(CANARY_READ, CommandOutput::success("someone-elses-canary\n"));

    let err = bare_context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("canary mismatch");

    let (stage, _, source) = rolled_back(&err);
    assert_eq!(stage, Stage::OpenSession);
    assert!(matches!(
        source,
        StepError::Ssh(SshError::CanaryMismatch { .. })
    ));
    assert!(bare_context.trust.registered().is_empty());
    let destroyed = bare_context.provider.destroyed();
    assert_eq!(destroyed.len(), 1);
    assert_eq!(destroyed.first().map(|(_, extra)| extra.get()), Some(Some(EXTRA)));
    assert_eq!(bare_context.journal.count("release_key"), 1);
    assert_eq!(bare_context.runner.commands_matching("-O exit").len(), 1);
}

#[rstest]
#[case::create(FailAt::Create, Stage::CreateResource, 0)]
#[case::resolve(FailAt::Resolve, Stage::ResolveAddress, 1)]
#[case::bootstrap(FailAt::Bootstrap, Stage::AwaitBootstrap, 1)]
#[tokio::test]
async fn early_failures_destroy_what_was_created(
    context: LifecycleContext,
    #[case] failure: FailAt,
    #[case] expected_stage: Stage,
    #[case] expected_destroys: usize,
) {
    context.provider.fail_at(failure);

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("step fails");

    let (stage, _, _) = rolled_back(&err);
    assert_eq!(stage, expected_stage);
    assert_eq!(context.provider.destroyed().len(), expected_destroys);
    assert_eq!(context.journal.count("release_key"), 1);
    assert_eq!(context.journal.count("register"), 0);
}

#[rstest]
#[tokio::test]
async fn missing_canary_times_out_and_destroys(bare_context: LifecycleContext) {
    bare_context
        .runner
        .respond(CANARY_READ, CommandOutput::failure(1, "No such file or directory"));

    let err = bare_context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("canary never appears");

    let (_, _, source) = rolled_back(&err);
    assert!(matches!(source, StepError::Ssh(SshError::CanaryTimeout { .. })));
    assert_eq!(bare_context.provider.destroyed().len(), 1);
}

#[rstest]
#[tokio::test]
async fn bootstrap_failure_keeps_remote_detail(context: LifecycleContext) {
    context.provider.fail_at(FailAt::Bootstrap);

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("bootstrap fails");

    assert!(
        err.to_string().contains("Unable to locate package salt-minion"),
        "{err}"
    );
}

#[rstest]
#[tokio::test]
async fn address_timeout_destroys_once(context: LifecycleContext) {
    context.provider.fail_at(FailAt::ResolveTimeout);

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("no address");

    let (stage, message, source) = rolled_back(&err);
    assert_eq!(stage, Stage::ResolveAddress);
    assert!(message.contains("timed out"), "{message}");
    assert!(matches!(
        source,
        StepError::Provider(hart::provider::ProviderError::Timeout { .. })
    ));
    assert_eq!(context.provider.destroyed().len(), 1);
}

#[rstest]
#[tokio::test]
async fn teardown_failure_is_appended(context: LifecycleContext) {
    context.provider.fail_at(FailAt::Resolve);
    context.provider.fail_at(FailAt::Destroy);

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("resolve fails");

    let (_, message, _) = rolled_back(&err);
    assert!(message.contains("(teardown also failed: destroy failed"), "{message}");
    assert_eq!(context.provider.destroyed().len(), 1);
}

#[rstest]
#[tokio::test]
async fn failure_after_registration_keeps_node(context: LifecycleContext) {
    context.provider.fail_at(FailAt::PostConnect);

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("post-connect fails");

    assert!(
        matches!(
            &err,
            LifecycleError::NeedsFollowUp { stage: Stage::PostConnect, minion_id, .. }
                if minion_id == MINION_ID
        ),
        "{err:?}"
    );
    assert!(err.to_string().contains("hart destroy-minion web.example.com"));
    assert!(context.provider.destroyed().is_empty());
    assert_eq!(context.trust.registered().len(), 1);
    assert_eq!(context.journal.count("release_key"), 1);
}

#[rstest]
#[tokio::test]
async fn registration_failure_keeps_node(context: LifecycleContext) {
    context.trust.fail_register();

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("register fails");

    assert!(
        matches!(
            &err,
            LifecycleError::NeedsFollowUp { stage: Stage::RegisterIdentity, minion_id, .. }
                if minion_id == MINION_ID
        ),
        "{err:?}"
    );
    assert!(err.to_string().contains("permission denied"), "{err}");
    assert!(context.provider.destroyed().is_empty());
    assert_eq!(context.journal.count("destroy"), 0);
    assert_eq!(context.journal.count("ping"), 0);
    assert_eq!(context.journal.count("release_key"), 1);
}

#[rstest]
#[tokio::test]
async fn liveness_retries_while_not_connected(context: LifecycleContext) {
    context
        .trust
        .script_pings([Err(not_connected()), Err(not_connected()), Err(not_connected())]);

    context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect("minion answers on the fourth ping");

    assert_eq!(context.journal.count("ping"), 4);
}

#[rstest]
#[tokio::test]
async fn liveness_gives_up_after_five_attempts(context: LifecycleContext) {
    context
        .trust
        .script_pings(std::iter::repeat_with(|| Err(not_connected())).take(6));

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("minion never connects");

    assert!(matches!(
        err,
        LifecycleError::NeedsFollowUp {
            stage: Stage::VerifyLiveness,
            ..
        }
    ));
    assert_eq!(context.journal.count("ping"), 5);
    assert!(context.provider.destroyed().is_empty());
}

#[rstest]
#[tokio::test]
async fn other_ping_failures_are_not_retried(context: LifecycleContext) {
    context.trust.script_pings([Err(TrustError::Command {
        command: String::from("salt"),
        status: String::from("2"),
        stderr: String::from("Salt request timed out"),
    })]);

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("ping fails");

    assert_eq!(err.stage(), Some(Stage::VerifyLiveness));
    assert_eq!(context.journal.count("ping"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn liveness_delay_doubles(context: LifecycleContext) {
    context
        .trust
        .script_pings([Err(not_connected()), Err(not_connected()), Err(not_connected())]);
    let lifecycle = context.lifecycle().with_liveness(hart::lifecycle::LivenessPolicy {
        attempts: 5,
        initial_delay: std::time::Duration::from_secs(1),
    });
    let started = tokio::time::Instant::now();

    lifecycle.create_minion(&spec()).await.expect("minion answers");

    assert!(started.elapsed() >= std::time::Duration::from_secs(7));
}

#[rstest]
#[tokio::test]
async fn invalid_request_touches_nothing(context: LifecycleContext) {
    let spec = hart::provider::NodeSpec::builder(MINION_ID)
        .build()
        .expect("spec without region");

    let err = context
        .lifecycle()
        .create_minion(&spec)
        .await
        .expect_err("region missing");

    assert!(matches!(err, LifecycleError::Config(_)));
    assert!(context.journal.entries().is_empty());
    assert!(context.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn each_run_uses_a_fresh_canary(context: LifecycleContext) {
    context.provider.fail_at(FailAt::Create);
    let lifecycle = context.lifecycle();

    lifecycle.create_minion(&spec()).await.expect_err("first");
    let first = context.provider.user_data().expect("first payload");
    lifecycle.create_minion(&spec()).await.expect_err("second");
    let second = context.provider.user_data().expect("second payload");

    assert_ne!(first, second);
}

#[rstest]
#[tokio::test]
async fn interrupt_after_creation_destroys_resource(mut context: LifecycleContext) {
    let (trigger, interrupt) = Interrupt::pair();
    context.interrupt = interrupt;
    context.provider.interrupt_after_create(trigger);

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("interrupted");

    assert!(err.is_interrupted());
    assert_eq!(err.stage(), Some(Stage::CreateResource));
    assert_eq!(context.provider.destroyed().len(), 1);
    assert_eq!(context.journal.count("release_key"), 1);
    assert_eq!(context.journal.count("resolve"), 0);
}

#[rstest]
#[tokio::test]
async fn interrupt_while_awaiting_bootstrap_destroys_once(mut context: LifecycleContext) {
    let (trigger, interrupt) = Interrupt::pair();
    context.interrupt = interrupt;
    context.provider.interrupt_during_bootstrap(trigger);

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("interrupted");

    assert!(err.is_interrupted());
    assert_eq!(err.stage(), Some(Stage::AwaitBootstrap));
    assert_eq!(context.provider.destroyed().len(), 1);
    assert_eq!(context.journal.count("destroy"), 1);
    assert_eq!(context.journal.count("register"), 0);
    assert_eq!(context.journal.count("release_key"), 1);
}

#[rstest]
#[tokio::test]
async fn interrupt_before_start_creates_nothing(mut context: LifecycleContext) {
    let (trigger, interrupt) = Interrupt::pair();
    context.interrupt = interrupt;
    trigger.trigger();

    let err = context
        .lifecycle()
        .create_minion(&spec())
        .await
        .expect_err("interrupted");

    assert!(err.is_interrupted());
    assert_eq!(context.journal.count("create"), 0);
}

#[rstest]
#[tokio::test]
async fn master_runs_extras_and_reports_fingerprints(context: LifecycleContext) {
    context.runner.respond(
        "ssh-keygen -lf",
        CommandOutput::success("256 SHA256:abc root@master (ED25519)\n3072 SHA256:def root@master (RSA)\n"),
    );
    let options = MasterOptions {
        authorized_keys: vec![String::from("ssh-ed25519 AAAAOPERATOR ops@example.com")],
        script: Some(String::from("#!/bin/sh\necho configured\n")),
    };

    let report = context
        .lifecycle()
        .create_master(&spec(), &options)
        .await
        .expect("master provisioned");

    assert_eq!(report.host_fingerprints.len(), 2);
    assert!(report.host_fingerprints.iter().any(|line| line.contains("SHA256:abc")));
    assert_eq!(context.remote_commands("cat >> /root/.ssh/authorized_keys"), 1);
    assert_eq!(context.remote_commands("set -C && cat > /root/hart-master-init"), 1);
    assert_eq!(context.remote_commands("salt-call --local test.ping"), 1);
    assert_eq!(context.journal.count("register"), 0);
    assert!(context.provider.destroyed().is_empty());
    assert_eq!(context.journal.count("release_key"), 1);
}

#[rstest]
#[tokio::test]
async fn master_script_failure_destroys_once(context: LifecycleContext) {
    context
        .runner
        .respond("hart-master-init", CommandOutput::success(""));
    context
        .runner
        .respond("hart-master-init", CommandOutput::failure(2, "init: apt-get failed"));
    let options = MasterOptions {
        authorized_keys: Vec::new(),
        script: Some(String::from("#!/bin/sh\napt-get install -y nginx\n")),
    };

    let err = context
        .lifecycle()
        .create_master(&spec(), &options)
        .await
        .expect_err("init script fails");

    let (stage, message, _) = rolled_back(&err);
    assert_eq!(stage, Stage::RunScript);
    assert!(message.contains("init: apt-get failed"), "{message}");
    assert_eq!(context.provider.destroyed().len(), 1);
    assert_eq!(context.journal.count("destroy"), 1);
    assert_eq!(context.remote_commands("salt-call --local test.ping"), 0);
    assert_eq!(context.journal.count("release_key"), 1);
}

#[rstest]
#[tokio::test]
async fn master_failure_always_destroys(context: LifecycleContext) {
    context
        .runner
        .respond("salt-call --local", CommandOutput::failure(1, "salt-call: not found"));

    let err = context
        .lifecycle()
        .create_master(&spec(), &MasterOptions::default())
        .await
        .expect_err("local ping fails");

    let (stage, message, _) = rolled_back(&err);
    assert_eq!(stage, Stage::LocalLiveness);
    assert!(message.contains("salt-call: not found"), "{message}");
    assert_eq!(context.provider.destroyed().len(), 1);
}

#[rstest]
#[tokio::test]
async fn destroy_deregisters_then_finds_then_destroys(context: LifecycleContext) {
    context
        .lifecycle()
        .destroy_minion(MINION_ID)
        .await
        .expect("destroyed");

    assert_eq!(context.journal.entries(), ["deregister", "find", "destroy"]);
    let destroyed = context.provider.destroyed();
    assert_eq!(destroyed.first().map(|(_, extra)| extra.get()), Some(Some(EXTRA)));
}

#[rstest]
#[tokio::test]
async fn deregistration_failure_still_destroys(context: LifecycleContext) {
    context.trust.fail_deregister();

    let err = context
        .lifecycle()
        .destroy_minion(MINION_ID)
        .await
        .expect_err("deregistration fails");

    assert!(matches!(err, hart::lifecycle::DestroyError::Deregistration { .. }));
    assert_eq!(context.provider.destroyed().len(), 1);
}

#[rstest]
#[tokio::test]
async fn unknown_minion_is_a_lookup_error(context: LifecycleContext) {
    context.provider.fail_at(FailAt::Find);

    let err = context
        .lifecycle()
        .destroy_minion(MINION_ID)
        .await
        .expect_err("not found");

    assert!(matches!(err, hart::lifecycle::DestroyError::Lookup { .. }));
    assert!(context.provider.destroyed().is_empty());
    assert_eq!(context.journal.count("deregister"), 1);
}
