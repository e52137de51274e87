//! Shared fixtures for lifecycle scenarios.

use std::time::Duration;

use hart::config::SshConfig;
use hart::exec::CommandOutput;
use hart::lifecycle::{Interrupt, LivenessPolicy, NodeLifecycle};
use hart::provider::NodeSpec;
use hart::ssh::SessionTimings;
use hart::test_support::ScriptedRunner;
use hart::token::Canary;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rstest::fixture;

use super::test_doubles::{FakeProvider, FakeTrustStore, Journal};

pub const MINION_ID: &str = "web.example.com";
pub const MINION_KEY: &str = "MINION-PUBLIC-KEY";
pub const TEMP_PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3NzaTEMPORARY hart-temp";
pub const CANARY_READ: &str = "cat /tmp/ssh-canary";
const SEED: u64 = 7;

pub type Lifecycle = NodeLifecycle<FakeProvider, ScriptedRunner, FakeTrustStore>;

pub struct LifecycleContext {
    pub journal: Journal,
    pub provider: FakeProvider,
    pub trust: FakeTrustStore,
    pub runner: ScriptedRunner,
    pub interrupt: Interrupt,
}

impl LifecycleContext {
    /// Canary the first run of [`Self::lifecycle`] will generate.
    pub fn expected_canary() -> Canary {
        Canary::generate(&mut StdRng::seed_from_u64(SEED))
    }

    pub fn lifecycle(&self) -> Lifecycle {
        NodeLifecycle::new(
            self.provider.clone(),
            self.runner.clone(),
            self.trust.clone(),
            SshConfig::builtin(),
        )
        .with_rng(StdRng::seed_from_u64(SEED))
        .with_session_timings(fast_timings())
        .with_liveness(LivenessPolicy {
            attempts: 5,
            initial_delay: Duration::from_millis(1),
        })
        .with_interrupt(self.interrupt.clone())
    }

    /// Number of remote commands containing `needle`.
    pub fn remote_commands(&self, needle: &str) -> usize {
        self.runner
            .invocations()
            .iter()
            .filter(|call| call.program == "ssh" && call.last_arg().contains(needle))
            .count()
    }
}

pub fn fast_timings() -> SessionTimings {
    SessionTimings {
        connect_retry: Duration::from_millis(5),
        connect_timeout: Duration::from_millis(200),
        attempt_timeout: Duration::from_secs(1),
        canary_poll: Duration::from_millis(5),
        canary_timeout: Duration::from_millis(50),
    }
}

pub fn spec() -> NodeSpec {
    NodeSpec::builder(MINION_ID)
        .region(Some(String::from("test-1")))
        .build()
        .unwrap_or_else(|err| panic!("spec fixture should be valid: {err}"))
}

/// A context whose node has a minion key but has not been told how to
/// answer the canary read.
#[fixture]
pub fn bare_context() -> LifecycleContext {
    let journal = Journal::default();
    let runner = ScriptedRunner::new();
    runner.respond("-y -f", CommandOutput::success(TEMP_PUBLIC_KEY));
    runner.respond(
        "cat /etc/salt/pki/minion/minion.pub",
        CommandOutput::success(format!("{MINION_KEY}\n")),
    );
    LifecycleContext {
        provider: FakeProvider::new(&journal),
        trust: FakeTrustStore::new(&journal),
        journal,
        runner,
        interrupt: Interrupt::never(),
    }
}

/// A context whose node boots and answers with the right canary.
#[fixture]
pub fn context(bare_context: LifecycleContext) -> LifecycleContext {
    bare_context.runner.respond(
        CANARY_READ,
        CommandOutput::success(format!("{}\n", LifecycleContext::expected_canary().as_str())),
    );
    bare_context
}
