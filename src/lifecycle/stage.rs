//! Provisioning stages and the compensation stack that undoes them.

use std::fmt;

use tracing::{info, warn};

use crate::provider::{Provider, ProviderError, ProviderExtra, ResourceHandle};

/// One step of a provisioning flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Validate the request, generate the canary and render the payload.
    Prepare,
    /// Generate and register the temporary key.
    AcquireCredential,
    /// Issue the creation call.
    CreateResource,
    /// Wait for a public address.
    ResolveAddress,
    /// Connect, verify the canary and seed the random pool.
    OpenSession,
    /// Wait for the payload to report completion.
    AwaitBootstrap,
    /// Read the minion's public key from the node.
    FetchMinionKey,
    /// Accept the minion key on the master.
    RegisterIdentity,
    /// Check the minion and master can reach each other.
    VerifyLiveness,
    /// Remove the temporary key from the node.
    RemoveBootstrapKey,
    /// Provider-specific finishing work.
    PostConnect,
    /// Append operator keys to `authorized_keys` on a master.
    AuthorizeKey,
    /// Upload and run the operator's init script on a master.
    RunScript,
    /// Check the master answers its own `test.ping`.
    LocalLiveness,
    /// Collect host key fingerprints from a master.
    Fingerprints,
}

/// What a stage leaves behind for rollback when it succeeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compensation {
    /// Nothing new to undo.
    Keep,
    /// The resource now exists and must be destroyed on failure.
    DestroyResource,
    /// The node's identity is being handed to the trust store; from the
    /// start of that stage failures are reported, not undone. Recorded
    /// before the stage runs.
    Commit,
}

impl Stage {
    /// Short name used in logs and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::AcquireCredential => "acquire credential",
            Self::CreateResource => "create resource",
            Self::ResolveAddress => "resolve address",
            Self::OpenSession => "open session",
            Self::AwaitBootstrap => "await bootstrap",
            Self::FetchMinionKey => "fetch minion key",
            Self::RegisterIdentity => "register identity",
            Self::VerifyLiveness => "verify liveness",
            Self::RemoveBootstrapKey => "remove bootstrap key",
            Self::PostConnect => "post-connect",
            Self::AuthorizeKey => "authorize key",
            Self::RunScript => "run script",
            Self::LocalLiveness => "local liveness",
            Self::Fingerprints => "fingerprints",
        }
    }

    /// Effect of this stage's success on the compensation stack.
    #[must_use]
    pub const fn on_success(self) -> Compensation {
        match self {
            Self::CreateResource => Compensation::DestroyResource,
            Self::RegisterIdentity => Compensation::Commit,
            _ => Compensation::Keep,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Undo {
    DestroyResource {
        handle: ResourceHandle,
        extra: ProviderExtra,
    },
}

/// Pending undo actions for one provisioning run.
#[derive(Debug, Default)]
pub struct CompensationStack {
    actions: Vec<Undo>,
    committed: bool,
}

impl CompensationStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the effect of `stage`. `created` is the resource a
    /// [`Compensation::DestroyResource`] stage produced; commit stages are
    /// recorded on entry.
    pub fn record(&mut self, stage: Stage, created: Option<(&ResourceHandle, &ProviderExtra)>) {
        match (stage.on_success(), created) {
            (Compensation::DestroyResource, Some((handle, extra))) => {
                self.actions.push(Undo::DestroyResource {
                    handle: handle.clone(),
                    extra: extra.clone(),
                });
            }
            (Compensation::Commit, _) => {
                self.actions.clear();
                self.committed = true;
            }
            (Compensation::Keep | Compensation::DestroyResource, _) => {}
        }
    }

    /// Whether a commit point has been passed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.committed
    }

    /// Number of pending undo actions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing needs undoing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every pending action, newest first, and returns the failures.
    pub async fn unwind<P: Provider + ?Sized>(self, provider: &P) -> Vec<ProviderError> {
        let mut failures = Vec::new();
        for action in self.actions.into_iter().rev() {
            match action {
                Undo::DestroyResource { handle, extra } => {
                    info!(resource = %handle.id, "destroying partially provisioned resource");
                    if let Err(err) = provider.destroy_resource(&handle, &extra).await {
                        warn!(resource = %handle.id, error = %err, "teardown failed");
                        failures.push(err);
                    }
                }
            }
        }
        failures
    }
}

/// Appends teardown failures to `message`.
#[must_use]
pub fn append_teardown_note(message: String, failures: &[ProviderError]) -> String {
    if failures.is_empty() {
        return message;
    }
    let notes = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!("{message} (teardown also failed: {notes})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn handle() -> ResourceHandle {
        ResourceHandle {
            id: String::from("42"),
            name: String::from("web"),
            region: None,
        }
    }

    #[rstest]
    #[case(Stage::CreateResource, Compensation::DestroyResource)]
    #[case(Stage::RegisterIdentity, Compensation::Commit)]
    #[case(Stage::OpenSession, Compensation::Keep)]
    #[case(Stage::RunScript, Compensation::Keep)]
    fn stages_declare_their_compensation(#[case] stage: Stage, #[case] expected: Compensation) {
        assert_eq!(stage.on_success(), expected);
    }

    #[rstest]
    fn creation_pushes_destroy() {
        let mut stack = CompensationStack::new();
        stack.record(Stage::CreateResource, Some((&handle(), &ProviderExtra::new("sg-1"))));
        assert_eq!(stack.len(), 1);
        assert!(!stack.is_committed());
    }

    #[rstest]
    fn commit_clears_pending_actions() {
        let mut stack = CompensationStack::new();
        stack.record(Stage::CreateResource, Some((&handle(), &ProviderExtra::none())));
        stack.record(Stage::RegisterIdentity, None);
        assert!(stack.is_empty());
        assert!(stack.is_committed());
    }

    #[rstest]
    fn keep_stages_leave_stack_alone() {
        let mut stack = CompensationStack::new();
        stack.record(Stage::ResolveAddress, Some((&handle(), &ProviderExtra::none())));
        assert!(stack.is_empty());
    }

    #[rstest]
    fn teardown_note_is_appended() {
        let failures = vec![ProviderError::Config(String::from("boom"))];
        let message = append_teardown_note(String::from("canary mismatch"), &failures);
        assert_eq!(
            message,
            "canary mismatch (teardown also failed: invalid provider configuration: boom)"
        );
        assert_eq!(append_teardown_note(String::from("plain"), &[]), "plain");
    }
}
