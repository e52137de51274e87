//! The management plane's trust store: the Salt master's PKI directory and
//! its `salt`/`salt-key` tools.
//!
//! Registering a minion writes its public key into `minions/`, which is what
//! `salt-key --accept` would do, without waiting for the minion to ask.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{SaltConfig, read_utf8_file};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use crate::provider::validate_minion_id;

const ACCEPTED_DIR: &str = "minions";
const PENDING_DIR: &str = "minions_pre";
const MASTER_KEY: &str = "master.pub";
const NOT_CONNECTED_MARKERS: [&str; 2] = ["Not connected", "did not return"];

/// Errors raised by trust store operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TrustError {
    /// Raised when the minion has not (yet) connected to the master.
    #[error("minion {minion_id} is not connected to the master")]
    NotConnected {
        /// Minion that did not answer.
        minion_id: String,
    },
    /// Raised when a Salt tool fails.
    #[error("{command} exited with status {status}: {stderr}")]
    Command {
        /// Command line that failed.
        command: String,
        /// Exit status text.
        status: String,
        /// Captured stderr or unexpected output.
        stderr: String,
    },
    /// Raised when the PKI directory cannot be read or written.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// OS error message.
        message: String,
    },
    /// Raised when a minion id is unsafe to use as a key file name.
    #[error("invalid minion id: {0}")]
    InvalidId(String),
    /// Raised when a Salt tool cannot be run.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl TrustError {
    /// Whether the failure may clear up on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }
}

/// Future returned by trust store operations.
pub type TrustFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TrustError>> + Send + 'a>>;

/// Operations the orchestrator needs from the management plane.
pub trait TrustStore: Send + Sync {
    /// Public key minions must trust.
    fn master_pubkey(&self) -> TrustFuture<'_, String>;

    /// Accepts `public_key` as the identity of `minion_id`.
    fn register<'a>(&'a self, minion_id: &'a str, public_key: &'a str) -> TrustFuture<'a, ()>;

    /// Removes `minion_id` from the accepted set.
    fn deregister<'a>(&'a self, minion_id: &'a str) -> TrustFuture<'a, ()>;

    /// Asks the master to reach `minion_id`.
    fn ping<'a>(&'a self, minion_id: &'a str) -> TrustFuture<'a, ()>;
}

/// Trust store backed by a local Salt master.
#[derive(Clone, Debug)]
pub struct SaltMaster<R> {
    config: SaltConfig,
    runner: R,
}

impl<R: CommandRunner> SaltMaster<R> {
    /// Creates a trust store for the master described by `config`.
    #[must_use]
    pub const fn new(config: SaltConfig, runner: R) -> Self {
        Self { config, runner }
    }

    fn pki_dir(&self) -> &Utf8Path {
        Utf8Path::new(&self.config.pki_dir)
    }

    fn write_accepted_key(&self, minion_id: &str, public_key: &str) -> Result<(), TrustError> {
        let pki = self.pki_dir();
        let io_error = |path: Utf8PathBuf| {
            move |err: std::io::Error| TrustError::Io {
                path,
                message: err.to_string(),
            }
        };
        let root = Dir::open_ambient_dir(pki, ambient_authority())
            .map_err(io_error(pki.to_path_buf()))?;
        root.create_dir_all(ACCEPTED_DIR)
            .map_err(io_error(pki.join(ACCEPTED_DIR)))?;
        let accepted = Utf8Path::new(ACCEPTED_DIR).join(minion_id);
        let contents = format!("{}\n", public_key.trim_end());
        root.write(&accepted, contents)
            .map_err(io_error(pki.join(&accepted)))?;

        let pending = Utf8Path::new(PENDING_DIR).join(minion_id);
        if let Ok(existing) = root.read_to_string(&pending)
            && existing.trim() == public_key.trim()
        {
            root.remove_file(&pending)
                .map_err(io_error(pki.join(&pending)))?;
            debug!(minion_id, "removed matching pending key");
        }
        Ok(())
    }

    async fn run_checked(&self, spec: CommandSpec) -> Result<CommandOutput, TrustError> {
        let output = self.runner.run(&spec).await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(TrustError::Command {
            command: spec.command_string(),
            status: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

fn check_id(minion_id: &str) -> Result<(), TrustError> {
    validate_minion_id(minion_id).map_err(|err| TrustError::InvalidId(err.to_string()))
}

/// Interprets `salt --out=json <id> test.ping` output.
fn classify_ping(minion_id: &str, output: &CommandOutput, command: &str) -> Result<(), TrustError> {
    let not_connected = || TrustError::NotConnected {
        minion_id: minion_id.to_owned(),
    };
    let reply = serde_json::from_str::<Value>(&output.stdout)
        .ok()
        .and_then(|parsed| parsed.get(minion_id).cloned());
    match reply {
        Some(Value::Bool(true)) => Ok(()),
        Some(Value::String(message))
            if NOT_CONNECTED_MARKERS.iter().any(|marker| message.contains(marker)) =>
        {
            Err(not_connected())
        }
        None if NOT_CONNECTED_MARKERS
            .iter()
            .any(|marker| output.stdout.contains(marker) || output.stderr.contains(marker)) =>
        {
            Err(not_connected())
        }
        None if output.stdout.trim().is_empty() && output.is_success() => Err(not_connected()),
        other => Err(TrustError::Command {
            command: command.to_owned(),
            status: output.status_text(),
            stderr: other.map_or_else(
                || output.stderr.trim().to_owned(),
                |value| value.to_string(),
            ),
        }),
    }
}

impl<R: CommandRunner> TrustStore for SaltMaster<R> {
    fn master_pubkey(&self) -> TrustFuture<'_, String> {
        Box::pin(async move {
            let path = self.pki_dir().join(MASTER_KEY);
            read_utf8_file(&path).map_err(|err| TrustError::Io {
                path,
                message: err.to_string(),
            })
        })
    }

    fn register<'a>(&'a self, minion_id: &'a str, public_key: &'a str) -> TrustFuture<'a, ()> {
        Box::pin(async move {
            check_id(minion_id)?;
            self.write_accepted_key(minion_id, public_key)?;
            info!(minion_id, "accepted minion key");
            Ok(())
        })
    }

    fn deregister<'a>(&'a self, minion_id: &'a str) -> TrustFuture<'a, ()> {
        Box::pin(async move {
            check_id(minion_id)?;
            let spec = CommandSpec::new(self.config.salt_key_bin.as_str())
                .args(["--yes", "--delete", minion_id]);
            self.run_checked(spec).await?;
            info!(minion_id, "deleted minion key");
            Ok(())
        })
    }

    fn ping<'a>(&'a self, minion_id: &'a str) -> TrustFuture<'a, ()> {
        Box::pin(async move {
            check_id(minion_id)?;
            let timeout = self.config.ping_timeout_secs;
            let spec = CommandSpec::new(self.config.salt_bin.as_str())
                .arg("--out=json")
                .arg(format!("--timeout={timeout}"))
                .args([minion_id, "test.ping"])
                .timeout(Some(Duration::from_secs(timeout.saturating_add(15))));
            let output = self.runner.run(&spec).await?;
            classify_ping(minion_id, &output, &spec.command_string())
        })
    }
}

#[cfg(test)]
mod tests;
