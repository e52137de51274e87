//! Errors surfaced by provisioning and destroy flows.

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::config::ConfigError;
use crate::provider::ProviderError;
use crate::ssh::SshError;
use crate::trust::TrustError;

use super::stage::Stage;

/// Failure of a single step.
#[derive(Debug, Error)]
pub enum StepError {
    /// Raised by the provider.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Raised by the SSH session.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Raised by the trust store.
    #[error(transparent)]
    Trust(#[from] TrustError),
    /// Raised while rendering the bootstrap payload.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// Raised when the request itself is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when the operator interrupted the run.
    #[error("interrupted")]
    Interrupted,
}

/// Errors returned by [`super::NodeLifecycle`].
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Raised when the request is rejected before anything is created.
    #[error("invalid request: {0}")]
    Config(#[source] StepError),
    /// Raised when the temporary key cannot be generated or registered.
    #[error("failed to prepare a temporary ssh key: {0}")]
    Credential(#[source] StepError),
    /// Raised when a step failed and everything it created was torn down.
    #[error("{stage} failed: {message}")]
    RolledBack {
        /// Step that failed.
        stage: Stage,
        /// Failure description, with any teardown failures appended.
        message: String,
        /// Underlying step failure.
        #[source]
        source: StepError,
    },
    /// Raised when a step failed after the node was registered; the node is
    /// kept and needs attention.
    #[error("{stage} failed for {minion_id}: {message}; the node was kept, remove it with `hart destroy-minion {minion_id}` if unwanted")]
    NeedsFollowUp {
        /// Step that failed.
        stage: Stage,
        /// Minion id of the kept node.
        minion_id: String,
        /// Failure description.
        message: String,
        /// Underlying step failure.
        #[source]
        source: StepError,
    },
}

impl LifecycleError {
    /// Whether the run ended because of an interrupt.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(
            self,
            Self::Config(StepError::Interrupted)
                | Self::Credential(StepError::Interrupted)
                | Self::RolledBack {
                    source: StepError::Interrupted,
                    ..
                }
                | Self::NeedsFollowUp {
                    source: StepError::Interrupted,
                    ..
                }
        )
    }

    /// Step that failed, when one is recorded.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::RolledBack { stage, .. } | Self::NeedsFollowUp { stage, .. } => Some(*stage),
            Self::Config(_) => Some(Stage::Prepare),
            Self::Credential(_) => Some(Stage::AcquireCredential),
        }
    }
}

/// Errors returned by [`super::destroy_minion`].
#[derive(Debug, Error)]
pub enum DestroyError {
    /// Raised when no resource carries the minion id.
    #[error("failed to find {minion_id}: {source}")]
    Lookup {
        /// Minion id looked up.
        minion_id: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when the provider fails to destroy the resource.
    #[error("failed to destroy {minion_id}: {source}")]
    Destroy {
        /// Minion id being destroyed.
        minion_id: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised after destruction when the key could not be removed from the
    /// master.
    #[error("{minion_id} was destroyed but its key could not be removed from the master: {source}")]
    Deregistration {
        /// Minion id whose key remains.
        minion_id: String,
        /// Trust store failure.
        #[source]
        source: TrustError,
    },
}
