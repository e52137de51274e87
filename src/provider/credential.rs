//! Scoped temporary SSH credential.

use tracing::{debug, warn};

use crate::exec::CommandRunner;
use crate::ssh::LocalKeyPair;

use super::{Provider, ProviderError, RemoteKey};

/// A locally generated key pair plus its provider-side registration.
///
/// Acquire with [`TemporaryCredential::acquire`] and hand back with
/// [`TemporaryCredential::release`]; the local key files disappear when the
/// value is dropped.
#[derive(Debug)]
pub struct TemporaryCredential {
    local: LocalKeyPair,
    remote: RemoteKey,
}

impl TemporaryCredential {
    /// Generates a key of the provider's preferred algorithm and registers
    /// it under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Ssh`] when key generation fails and the
    /// provider's error when registration fails. Nothing is left registered
    /// on error.
    pub async fn acquire<P, R>(
        provider: &P,
        runner: &R,
        keygen_bin: &str,
        name: &str,
    ) -> Result<Self, ProviderError>
    where
        P: Provider + ?Sized,
        R: CommandRunner,
    {
        let local =
            LocalKeyPair::generate(runner, keygen_bin, provider.key_algorithm(), name).await?;
        let remote = provider.register_key(name, &local).await?;
        debug!(key = name, "registered temporary key");
        Ok(Self { local, remote })
    }

    /// Local half of the credential.
    #[must_use]
    pub const fn local(&self) -> &LocalKeyPair {
        &self.local
    }

    /// Provider half of the credential.
    #[must_use]
    pub const fn remote(&self) -> &RemoteKey {
        &self.remote
    }

    /// Deregisters the key. Failures are logged, not returned, so release
    /// never masks the outcome of the work the credential was used for.
    pub async fn release<P: Provider + ?Sized>(self, provider: &P) {
        let Self { local, remote } = self;
        if let Err(err) = provider.release_key(remote).await {
            warn!(error = %err, "failed to release temporary key");
        }
        drop(local);
    }
}
