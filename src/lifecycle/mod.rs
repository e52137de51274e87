//! Orchestrates provisioning of minions and masters.
//!
//! A run creates a resource through a [`Provider`], waits for its address,
//! opens a canary-verified [`SshSession`], waits for the bootstrap payload
//! and, for minions, registers the minion key with the [`TrustStore`] and
//! checks both directions of connectivity. Every step that creates
//! something records an undo action on a [`CompensationStack`]; a failure
//! before the node is registered unwinds the stack so no partially
//! provisioned resource survives. Failures after registration keep the node
//! and are reported for follow-up.

mod destroy;
mod error;
mod interrupt;
mod stage;

use std::future::Future;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use shell_escape::unix::escape;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bootstrap::{PayloadInputs, master_payload, minion_payload};
use crate::config::SshConfig;
use crate::exec::CommandRunner;
use crate::provider::{
    CreateRequest, NodeSpec, Provider, ProvisionedNode, TemporaryCredential, validate_minion_id,
};
use crate::ssh::{RemoteCommand, SessionTimings, SshSession, SshTarget, temporary_key_name};
use crate::token::{Canary, random_bytes};
use crate::trust::TrustStore;

pub use destroy::destroy_minion;
pub use error::{DestroyError, LifecycleError, StepError};
pub use interrupt::{Interrupt, InterruptTrigger};
pub use stage::{Compensation, CompensationStack, Stage, append_teardown_note};

/// Where the bootstrap payload leaves the minion's public key.
pub const MINION_PUBKEY_PATH: &str = "/etc/salt/pki/minion/minion.pub";

/// Where an operator's init script is stored on a new master.
pub const MASTER_SCRIPT_PATH: &str = "/root/hart-master-init";

const SEED_BYTES: usize = 32;
const MINION_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const LOCAL_PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry budget for the master-to-minion ping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LivenessPolicy {
    /// Total ping attempts.
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each retry.
    pub initial_delay: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_secs(2),
        }
    }
}

/// Extras for [`NodeLifecycle::create_master`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MasterOptions {
    /// Public key lines appended to root's `authorized_keys`.
    pub authorized_keys: Vec<String>,
    /// Init script contents uploaded to [`MASTER_SCRIPT_PATH`] and run.
    pub script: Option<String>,
}

/// Result of [`NodeLifecycle::create_master`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MasterReport {
    /// The new master.
    pub node: ProvisionedNode,
    /// `ssh-keygen -l` lines for the master's host keys.
    pub host_fingerprints: Vec<String>,
}

/// Per-run secrets and payload.
struct Prepared {
    canary: Canary,
    seed: Vec<u8>,
    payload: String,
}

/// Which flow a run follows once the session is verified.
#[derive(Clone, Copy, Debug)]
enum Flavor<'a> {
    Minion,
    Master(&'a MasterOptions),
}

/// A failed step, before compensation is applied.
struct Failure {
    stage: Stage,
    source: StepError,
}

fn at<E: Into<StepError>>(stage: Stage) -> impl FnOnce(E) -> Failure {
    move |err| Failure {
        stage,
        source: err.into(),
    }
}

/// Drives node creation for one provider and trust store.
#[derive(Debug)]
pub struct NodeLifecycle<P, R, T> {
    provider: P,
    runner: R,
    trust: T,
    ssh: SshConfig,
    session_timings: SessionTimings,
    liveness: LivenessPolicy,
    interrupt: Interrupt,
    rng: Mutex<StdRng>,
}

impl<P, R, T> NodeLifecycle<P, R, T>
where
    P: Provider,
    R: CommandRunner + Clone,
    T: TrustStore,
{
    /// Creates an orchestrator using OS entropy and no interrupt source.
    #[must_use]
    pub fn new(provider: P, runner: R, trust: T, ssh: SshConfig) -> Self {
        Self {
            provider,
            runner,
            trust,
            session_timings: SessionTimings::from_config(&ssh),
            ssh,
            liveness: LivenessPolicy::default(),
            interrupt: Interrupt::never(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Aborts in-flight steps when `interrupt` is raised.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Replaces the entropy source used for canaries and seeds.
    #[must_use]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Overrides the SSH polling budgets.
    #[must_use]
    pub const fn with_session_timings(mut self, timings: SessionTimings) -> Self {
        self.session_timings = timings;
        self
    }

    /// Overrides the liveness retry budget.
    #[must_use]
    pub const fn with_liveness(mut self, liveness: LivenessPolicy) -> Self {
        self.liveness = liveness;
        self
    }

    /// Provider this orchestrator drives.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Trust store this orchestrator registers minions with.
    #[must_use]
    pub const fn trust(&self) -> &T {
        &self.trust
    }

    /// Creates a minion, registers it with the master and verifies it
    /// answers.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::RolledBack`] when a step before
    /// registration fails (the resource has been destroyed) and
    /// [`LifecycleError::NeedsFollowUp`] when a later step fails.
    pub async fn create_minion(&self, spec: &NodeSpec) -> Result<ProvisionedNode, LifecycleError> {
        let minion_id = spec.minion_id.as_str();
        let master_pubkey = self
            .guard(self.trust.master_pubkey())
            .await
            .map_err(LifecycleError::Config)?;
        let prepared = self
            .prepare(spec, |inputs| minion_payload(inputs, &master_pubkey))
            .map_err(LifecycleError::Config)?;
        let credential = self.acquire_credential(minion_id).await?;

        let mut stack = CompensationStack::new();
        let outcome = self
            .provision(spec, &prepared, &credential, &mut stack, Flavor::Minion)
            .await;
        let result = match outcome {
            Ok((node, _)) => {
                info!(minion_id, address = ?node.public_address, "minion ready");
                Ok(node)
            }
            Err(failure) => Err(self.compensate(stack, minion_id, failure).await),
        };
        credential.release(&self.provider).await;
        result
    }

    /// Creates a Salt master. Any failure destroys the resource.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::RolledBack`] when any step fails.
    pub async fn create_master(
        &self,
        spec: &NodeSpec,
        options: &MasterOptions,
    ) -> Result<MasterReport, LifecycleError> {
        let minion_id = spec.minion_id.as_str();
        let prepared = self
            .prepare(spec, master_payload)
            .map_err(LifecycleError::Config)?;
        let credential = self.acquire_credential(minion_id).await?;

        let mut stack = CompensationStack::new();
        let outcome = self
            .provision(spec, &prepared, &credential, &mut stack, Flavor::Master(options))
            .await;
        let result = match outcome {
            Ok((node, host_fingerprints)) => {
                info!(minion_id, address = ?node.public_address, "master ready");
                Ok(MasterReport {
                    node,
                    host_fingerprints,
                })
            }
            Err(failure) => Err(self.compensate(stack, minion_id, failure).await),
        };
        credential.release(&self.provider).await;
        result
    }

    /// Deregisters, finds and destroys `minion_id`.
    ///
    /// # Errors
    ///
    /// See [`destroy_minion`].
    pub async fn destroy_minion(&self, minion_id: &str) -> Result<(), DestroyError> {
        destroy_minion(&self.provider, &self.trust, minion_id).await
    }

    fn prepare<F, E>(&self, spec: &NodeSpec, render: F) -> Result<Prepared, StepError>
    where
        F: FnOnce(&PayloadInputs<'_>) -> Result<String, E>,
        E: Into<StepError>,
    {
        validate_minion_id(&spec.minion_id)?;
        self.provider.validate(spec)?;
        let (canary, seed) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            let canary = Canary::generate(&mut *rng);
            (canary, random_bytes(&mut *rng, SEED_BYTES))
        };
        let mut minion_config = spec.minion_config.clone();
        minion_config.insert(String::from("id"), Value::from(spec.minion_id.as_str()));
        let inputs = PayloadInputs {
            canary: &canary,
            minion_config: &minion_config,
            salt_branch: &spec.salt_branch,
            release: spec.release,
        };
        let payload = render(&inputs).map_err(Into::into)?;
        debug!(minion_id = %spec.minion_id, "payload rendered");
        Ok(Prepared {
            canary,
            seed,
            payload,
        })
    }

    /// Registration may finish even if an interrupt lands mid-call, so the
    /// interrupt is checked afterwards and the key released.
    async fn acquire_credential(
        &self,
        minion_id: &str,
    ) -> Result<TemporaryCredential, LifecycleError> {
        let name = temporary_key_name(minion_id, Utc::now());
        let credential =
            TemporaryCredential::acquire(&self.provider, &self.runner, &self.ssh.ssh_keygen_bin, &name)
                .await
                .map_err(|err| LifecycleError::Credential(err.into()))?;
        if self.interrupt.is_triggered() {
            credential.release(&self.provider).await;
            return Err(LifecycleError::Credential(StepError::Interrupted));
        }
        Ok(credential)
    }

    /// Creates the resource and drives the remaining steps over a session
    /// that is closed again whatever the outcome. Returns the node and, for
    /// masters, its host key fingerprints.
    async fn provision(
        &self,
        spec: &NodeSpec,
        prepared: &Prepared,
        credential: &TemporaryCredential,
        stack: &mut CompensationStack,
        flavor: Flavor<'_>,
    ) -> Result<(ProvisionedNode, Vec<String>), Failure> {
        let minion_id = spec.minion_id.as_str();
        let request = CreateRequest {
            spec,
            key: credential.remote(),
            user_data: &prepared.payload,
        };
        // Not raced against the interrupt: a dropped creation call could
        // leave a resource nothing knows about.
        let (handle, extra) = self
            .provider
            .create_resource(&request)
            .await
            .map_err(at(Stage::CreateResource))?;
        stack.record(Stage::CreateResource, Some((&handle, &extra)));
        info!(minion_id, resource = %handle.id, "resource created");
        if self.interrupt.is_triggered() {
            return Err(at(Stage::CreateResource)(StepError::Interrupted));
        }

        let address = self
            .guard(self.provider.resolve_public_address(&handle))
            .await
            .map_err(at(Stage::ResolveAddress))?;
        info!(minion_id, %address, "address resolved");
        let node = ProvisionedNode {
            minion_id: minion_id.to_owned(),
            handle,
            public_address: Some(address),
            extra,
            private_networking: spec.private_networking,
        };

        let mut session = self
            .session(address, credential)
            .map_err(at(Stage::OpenSession))?;
        let outcome = self
            .run_session(&mut session, &node, prepared, credential, stack, flavor)
            .await;
        if let Err(err) = session.close().await {
            warn!(minion_id, error = %err, "failed to close ssh session");
        }
        outcome.map(|fingerprints| (node, fingerprints))
    }

    async fn run_session(
        &self,
        session: &mut SshSession<R>,
        node: &ProvisionedNode,
        prepared: &Prepared,
        credential: &TemporaryCredential,
        stack: &mut CompensationStack,
        flavor: Flavor<'_>,
    ) -> Result<Vec<String>, Failure> {
        self.guard(Self::establish(session, prepared))
            .await
            .map_err(at(Stage::OpenSession))?;
        self.guard(self.provider.wait_for_bootstrap(session, &node.extra))
            .await
            .map_err(at(Stage::AwaitBootstrap))?;
        info!(minion_id = %node.minion_id, "bootstrap complete");

        let fingerprints = match flavor {
            Flavor::Minion => {
                self.register_minion(session, node, stack).await?;
                Vec::new()
            }
            Flavor::Master(options) => self.configure_master(session, options).await?,
        };
        self.guard(remove_bootstrap_key(session, credential.local().public_key()))
            .await
            .map_err(at(Stage::RemoveBootstrapKey))?;
        self.guard(self.provider.on_post_connect(node, session))
            .await
            .map_err(at(Stage::PostConnect))?;
        Ok(fingerprints)
    }

    async fn register_minion(
        &self,
        session: &mut SshSession<R>,
        node: &ProvisionedNode,
        stack: &mut CompensationStack,
    ) -> Result<(), Failure> {
        let minion_id = node.minion_id.as_str();
        let fetch = RemoteCommand::new(format!("cat {MINION_PUBKEY_PATH}")).privileged();
        let minion_key = self
            .guard(session.run(&fetch))
            .await
            .map_err(at(Stage::FetchMinionKey))?;
        // A failed register may still have left the key trusted.
        stack.record(Stage::RegisterIdentity, None);
        self.guard(self.trust.register(minion_id, minion_key.trim()))
            .await
            .map_err(at(Stage::RegisterIdentity))?;
        info!(minion_id, "minion key registered");

        self.guard(self.verify_liveness(session, minion_id))
            .await
            .map_err(at(Stage::VerifyLiveness))
    }

    async fn configure_master(
        &self,
        session: &mut SshSession<R>,
        options: &MasterOptions,
    ) -> Result<Vec<String>, Failure> {
        if !options.authorized_keys.is_empty() {
            self.guard(authorize_keys(session, &options.authorized_keys))
                .await
                .map_err(at(Stage::AuthorizeKey))?;
        }
        if let Some(script) = &options.script {
            self.guard(run_master_script(session, script))
                .await
                .map_err(at(Stage::RunScript))?;
        }
        let local_ping = RemoteCommand::new("salt-call --local test.ping")
            .privileged()
            .timeout(Some(LOCAL_PING_TIMEOUT));
        self.guard(session.run(&local_ping))
            .await
            .map_err(at(Stage::LocalLiveness))?;
        let listing = self
            .guard(session.run(&RemoteCommand::new(
                "for key in /etc/ssh/ssh_host_*_key.pub; do ssh-keygen -lf \"$key\"; done",
            )))
            .await
            .map_err(at(Stage::Fingerprints))?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    async fn establish(session: &mut SshSession<R>, prepared: &Prepared) -> Result<(), StepError> {
        session.connect().await?;
        session.verify_canary(&prepared.canary).await?;
        session.seed_random_pool(&prepared.seed).await?;
        Ok(())
    }

    /// Checks the minion reaches the master, then that the master reaches
    /// the minion. Only "not connected" answers are retried.
    async fn verify_liveness(
        &self,
        session: &mut SshSession<R>,
        minion_id: &str,
    ) -> Result<(), StepError> {
        let check = RemoteCommand::new("salt-call test.ping && service salt-minion restart")
            .privileged()
            .timeout(Some(MINION_CHECK_TIMEOUT));
        session.run(&check).await?;

        let mut delay = self.liveness.initial_delay;
        let mut attempt = 1;
        loop {
            match self.trust.ping(minion_id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.liveness.attempts => {
                    debug!(minion_id, attempt, ?delay, "minion not connected yet");
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn session(
        &self,
        address: IpAddr,
        credential: &TemporaryCredential,
    ) -> Result<SshSession<R>, StepError> {
        let target = SshTarget {
            host: address,
            port: self.ssh.port,
            user: self.provider.login_user().to_owned(),
        };
        let session = SshSession::new(
            self.runner.clone(),
            &self.ssh,
            target,
            credential.local().private_key_path(),
        )?;
        Ok(session.with_timings(self.session_timings))
    }

    async fn guard<V, E, F>(&self, step: F) -> Result<V, StepError>
    where
        F: Future<Output = Result<V, E>>,
        E: Into<StepError>,
    {
        tokio::select! {
            biased;
            () = self.interrupt.triggered() => Err(StepError::Interrupted),
            result = step => result.map_err(Into::into),
        }
    }

    async fn compensate(
        &self,
        stack: CompensationStack,
        minion_id: &str,
        failure: Failure,
    ) -> LifecycleError {
        let Failure { stage, source } = failure;
        warn!(minion_id, %stage, error = %source, "provisioning step failed");
        if stack.is_committed() {
            return LifecycleError::NeedsFollowUp {
                stage,
                minion_id: minion_id.to_owned(),
                message: source.to_string(),
                source,
            };
        }
        let failures = stack.unwind(&self.provider).await;
        LifecycleError::RolledBack {
            stage,
            message: append_teardown_note(source.to_string(), &failures),
            source,
        }
    }
}

/// Drops the temporary key from the login user's `authorized_keys`.
async fn remove_bootstrap_key<R: CommandRunner>(
    session: &mut SshSession<R>,
    public_key: &str,
) -> Result<(), StepError> {
    let body = public_key.split_whitespace().nth(1).unwrap_or(public_key);
    let command = format!(
        concat!(
            "{{ grep -vF {key} ~/.ssh/authorized_keys || true; }} > ~/.ssh/authorized_keys.hart",
            " && cat ~/.ssh/authorized_keys.hart > ~/.ssh/authorized_keys",
            " && rm -f ~/.ssh/authorized_keys.hart"
        ),
        key = escape(body.into())
    );
    session.run(&RemoteCommand::new(command)).await?;
    Ok(())
}

async fn authorize_keys<R: CommandRunner>(
    session: &mut SshSession<R>,
    keys: &[String],
) -> Result<(), StepError> {
    let mut lines = keys.iter().map(|key| key.trim()).collect::<Vec<_>>().join("\n");
    lines.push('\n');
    let command = RemoteCommand::new(concat!(
        "install -d -m 700 /root/.ssh",
        " && cat >> /root/.ssh/authorized_keys",
        " && chmod 600 /root/.ssh/authorized_keys"
    ))
    .privileged()
    .stdin(lines);
    session.run(&command).await?;
    Ok(())
}

/// Uploads `script` without overwriting an existing file, then runs it
/// with no time limit.
async fn run_master_script<R: CommandRunner>(
    session: &mut SshSession<R>,
    script: &str,
) -> Result<(), StepError> {
    let upload = RemoteCommand::new(format!(
        "set -C && cat > {MASTER_SCRIPT_PATH} && chmod 700 {MASTER_SCRIPT_PATH}"
    ))
    .privileged()
    .stdin(script.as_bytes().to_vec());
    session.run(&upload).await?;
    let execute = RemoteCommand::new(MASTER_SCRIPT_PATH)
        .privileged()
        .echo()
        .timeout(None);
    session.run(&execute).await?;
    Ok(())
}
