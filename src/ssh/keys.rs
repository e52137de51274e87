//! Per-run SSH key pairs generated with `ssh-keygen`.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::exec::{CommandRunner, CommandSpec};

use super::SshError;

/// Key type requested from `ssh-keygen`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyAlgorithm {
    /// Ed25519, accepted by every provider except EC2 key import on older
    /// images.
    Ed25519,
    /// 2048-bit RSA.
    Rsa2048,
}

impl KeyAlgorithm {
    fn keygen_args(self) -> &'static [&'static str] {
        match self {
            Self::Ed25519 => &["-t", "ed25519"],
            Self::Rsa2048 => &["-t", "rsa", "-b", "2048"],
        }
    }
}

/// Private key on local disk plus its OpenSSH public key line.
///
/// The key lives in a private temporary directory that is removed when the
/// pair is dropped.
#[derive(Debug)]
pub struct LocalKeyPair {
    _dir: TempDir,
    private_key: Utf8PathBuf,
    public_key: String,
    algorithm: KeyAlgorithm,
}

impl LocalKeyPair {
    /// Generates a passphrase-less key pair in a fresh temporary directory.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::KeyGeneration`] when the directory cannot be
    /// created or `ssh-keygen` fails, and [`SshError::Exec`] when it cannot
    /// be started.
    pub async fn generate<R: CommandRunner>(
        runner: &R,
        keygen_bin: &str,
        algorithm: KeyAlgorithm,
        comment: &str,
    ) -> Result<Self, SshError> {
        let dir = tempfile::Builder::new()
            .prefix("hart-key-")
            .tempdir()
            .map_err(|err| SshError::KeyGeneration(err.to_string()))?;
        let private_key = Utf8PathBuf::from_path_buf(dir.path().join("id"))
            .map_err(|path| SshError::KeyGeneration(format!("non UTF-8 path {}", path.display())))?;

        let create = CommandSpec::new(keygen_bin)
            .arg("-q")
            .args(algorithm.keygen_args().iter().copied())
            .args(["-N", "", "-C", comment, "-f", private_key.as_str()]);
        let created = runner.run(&create).await?;
        if !created.is_success() {
            return Err(SshError::KeyGeneration(format!(
                "{keygen_bin} exited with status {}: {}",
                created.status_text(),
                created.stderr.trim()
            )));
        }

        let derive = CommandSpec::new(keygen_bin).args(["-y", "-f", private_key.as_str()]);
        let derived = runner.run(&derive).await?;
        let public_key = derived.stdout.trim().to_owned();
        if !derived.is_success() || public_key.is_empty() {
            return Err(SshError::KeyGeneration(format!(
                "could not read public key: {}",
                derived.stderr.trim()
            )));
        }

        Ok(Self {
            _dir: dir,
            private_key,
            public_key,
            algorithm,
        })
    }

    /// Path to the private key, valid while `self` is alive.
    #[must_use]
    pub fn private_key_path(&self) -> &Utf8Path {
        &self.private_key
    }

    /// Path to the `.pub` file written by `ssh-keygen`.
    #[must_use]
    pub fn public_key_path(&self) -> Utf8PathBuf {
        self.private_key.with_extension("pub")
    }

    /// OpenSSH public key line (`<type> <base64>`).
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Algorithm the key was generated with.
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
}

/// Name under which a temporary key is registered with a provider.
#[must_use]
pub fn temporary_key_name(minion_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "hart-temp-for-{minion_id}-at-{}",
        now.format("%Y-%m-%dT%H-%M-%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::test_support::ScriptedRunner;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    fn key_name_embeds_minion_and_timestamp() {
        let now = Utc
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .single()
            .expect("valid time");
        assert_eq!(
            temporary_key_name("db.example.com", now),
            "hart-temp-for-db.example.com-at-2024-03-09T07-05-01"
        );
    }

    #[tokio::test]
    async fn generate_runs_keygen_then_reads_public_key() {
        let runner = ScriptedRunner::new();
        runner.respond("-y -f", CommandOutput::success("ssh-ed25519 AAAAC3Nza\n"));

        let pair = LocalKeyPair::generate(&runner, "ssh-keygen", KeyAlgorithm::Ed25519, "hart")
            .await
            .expect("key pair");

        assert_eq!(pair.public_key(), "ssh-ed25519 AAAAC3Nza");
        let calls = runner.invocations();
        assert_eq!(calls.len(), 2);
        let create = calls.first().expect("create call").command_string();
        assert!(create.starts_with("ssh-keygen -q -t ed25519 -N  -C hart -f "), "{create}");
        assert!(pair.public_key_path().as_str().ends_with("id.pub"));
    }

    #[tokio::test]
    async fn rsa_keys_request_2048_bits() {
        let runner = ScriptedRunner::new();
        runner.respond("-y -f", CommandOutput::success("ssh-rsa AAAAB3Nza"));

        LocalKeyPair::generate(&runner, "ssh-keygen", KeyAlgorithm::Rsa2048, "hart")
            .await
            .expect("key pair");

        let create = runner
            .invocations()
            .first()
            .expect("create call")
            .command_string();
        assert!(create.contains("-t rsa -b 2048"), "{create}");
    }

    #[tokio::test]
    async fn keygen_failure_is_reported() {
        let runner = ScriptedRunner::new();
        runner.respond("-q", CommandOutput::failure(1, "permission denied"));

        let err = LocalKeyPair::generate(&runner, "ssh-keygen", KeyAlgorithm::Ed25519, "hart")
            .await
            .expect_err("keygen fails");

        assert!(err.to_string().contains("permission denied"), "{err}");
    }
}
