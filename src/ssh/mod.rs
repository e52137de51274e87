//! SSH session management over the system OpenSSH client.
//!
//! A session owns one multiplexed transport (an OpenSSH control master) to a
//! freshly created node. It moves through
//! `Disconnected → Connecting → Connected → CanaryVerified → InUse → Closed`
//! and refuses to run commands until the node has proven its identity by
//! returning the canary embedded in its bootstrap payload.

mod keys;

use std::ffi::OsString;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use tempfile::TempDir;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::SshConfig;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use crate::token::{CANARY_PATH, Canary};

pub use keys::{KeyAlgorithm, LocalKeyPair, temporary_key_name};

/// Time limit applied to remote commands unless the caller chooses another.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const CANARY_READ_TIMEOUT: Duration = Duration::from_secs(10);
const CANARY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const ATTEMPT_SLACK: Duration = Duration::from_secs(10);

/// Lifecycle position of an [`SshSession`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// No transport exists.
    Disconnected,
    /// Connection attempts are in progress.
    Connecting,
    /// Transport is up but the node has not proven its identity.
    Connected,
    /// The canary matched; commands may run.
    CanaryVerified,
    /// At least one command has run over the verified transport.
    InUse,
    /// The transport has been torn down.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::CanaryVerified => "canary-verified",
            Self::InUse => "in-use",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Errors raised by the session manager.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when no connection succeeded within the budget.
    #[error("could not connect to {destination} within {}s: {last_error}", .after.as_secs())]
    ConnectTimeout {
        /// `user@host` that was dialled.
        destination: String,
        /// Budget that elapsed.
        after: Duration,
        /// Description of the final failed attempt.
        last_error: String,
    },
    /// Raised when the canary file never appeared.
    #[error("canary file did not appear within {}s", .after.as_secs())]
    CanaryTimeout {
        /// Budget that elapsed.
        after: Duration,
    },
    /// Raised when the node returned a canary other than ours.
    #[error("canary mismatch: the host at {destination} is not the node that was created")]
    CanaryMismatch {
        /// `user@host` that answered.
        destination: String,
    },
    /// Raised when a remote command exceeded its time limit.
    #[error("remote command `{command}` timed out after {}s", .after.as_secs())]
    CommandTimeout {
        /// Command that was running.
        command: String,
        /// Limit that elapsed.
        after: Duration,
    },
    /// Raised when a remote command exited non-zero.
    #[error("remote command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        /// Command that failed.
        command: String,
        /// Exit status text.
        status: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised when a command is attempted before the canary is verified.
    #[error("session is {state}; commands require a canary-verified session")]
    Unverified {
        /// State the session was in.
        state: SessionState,
    },
    /// Raised when generating the temporary key fails.
    #[error("failed to generate ssh key: {0}")]
    KeyGeneration(String),
    /// Raised when local session resources cannot be created.
    #[error("failed to prepare ssh session: {0}")]
    Io(String),
    /// Raised when the `ssh` binary cannot be run.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Where a session connects to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Node address.
    pub host: IpAddr,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
}

impl SshTarget {
    /// Returns `user@host`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn is_root(&self) -> bool {
        self.user == "root"
    }
}

/// Polling budgets used while connecting and verifying.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionTimings {
    /// Delay between connection attempts.
    pub connect_retry: Duration,
    /// Overall connection budget.
    pub connect_timeout: Duration,
    /// Per-attempt TCP connect timeout passed to `ssh`.
    pub attempt_timeout: Duration,
    /// Delay between canary reads.
    pub canary_poll: Duration,
    /// Budget for the canary to appear.
    pub canary_timeout: Duration,
}

impl SessionTimings {
    /// Derives timings from the loaded SSH settings.
    #[must_use]
    pub const fn from_config(config: &SshConfig) -> Self {
        Self {
            connect_retry: config.connect_retry(),
            connect_timeout: config.connect_timeout(),
            attempt_timeout: Duration::from_secs(config.connect_attempt_secs),
            canary_poll: CANARY_POLL_INTERVAL,
            canary_timeout: config.canary_timeout(),
        }
    }
}

/// Command to run on the node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    /// Shell command line.
    pub command: String,
    /// Time limit; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Log output lines at info level as they are returned.
    pub echo: bool,
    /// Bytes piped to the command's stdin.
    pub stdin: Option<Vec<u8>>,
    /// Run as root, using `sudo` when the login user is not root.
    pub privileged: bool,
}

impl RemoteCommand {
    /// A quiet, unprivileged command with the default time limit.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            echo: false,
            stdin: None,
            privileged: false,
        }
    }

    /// Overrides the time limit.
    #[must_use]
    pub const fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    /// Logs output as it is returned.
    #[must_use]
    pub const fn echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Runs the command as root.
    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Pipes `bytes` to the command's stdin.
    #[must_use]
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }
}

/// Multiplexed, canary-verified SSH session to one node.
#[derive(Debug)]
pub struct SshSession<R> {
    runner: R,
    ssh_bin: String,
    target: SshTarget,
    identity: Utf8PathBuf,
    control_dir: TempDir,
    persist: Duration,
    timings: SessionTimings,
    state: SessionState,
}

impl<R: CommandRunner> SshSession<R> {
    /// Prepares a disconnected session authenticating with `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Io`] when the control socket directory cannot be
    /// created.
    pub fn new(
        runner: R,
        config: &SshConfig,
        target: SshTarget,
        identity: &Utf8Path,
    ) -> Result<Self, SshError> {
        let control_dir = tempfile::Builder::new()
            .prefix("hart-ssh-")
            .tempdir()
            .map_err(|err| SshError::Io(err.to_string()))?;
        Ok(Self {
            runner,
            ssh_bin: config.ssh_bin.clone(),
            target,
            identity: identity.to_path_buf(),
            control_dir,
            persist: Duration::from_secs(config.control_persist_secs),
            timings: SessionTimings::from_config(config),
            state: SessionState::Disconnected,
        })
    }

    /// Overrides the polling budgets.
    #[must_use]
    pub const fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Connection target.
    #[must_use]
    pub const fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Establishes the control master, retrying transport failures until the
    /// connection budget is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ConnectTimeout`] when no attempt succeeds in time
    /// and [`SshError::Exec`] when `ssh` cannot be started at all.
    pub async fn connect(&mut self) -> Result<(), SshError> {
        self.state = SessionState::Connecting;
        let deadline = Instant::now() + self.timings.connect_timeout;
        let mut last_error = String::from("no attempt made");

        while Instant::now() <= deadline {
            let spec = self.connect_spec();
            match self.runner.run(&spec).await {
                Ok(output) if output.is_success() => {
                    self.state = SessionState::Connected;
                    debug!(destination = %self.target.destination(), "ssh transport established");
                    return Ok(());
                }
                Ok(output) => {
                    last_error = format!("ssh exited with status {}", output.status_text());
                }
                Err(err @ ExecError::Spawn { .. }) => {
                    self.state = SessionState::Disconnected;
                    return Err(err.into());
                }
                Err(err) => last_error = err.to_string(),
            }
            debug!(destination = %self.target.destination(), %last_error, "ssh not ready yet");
            sleep(self.timings.connect_retry).await;
        }

        self.state = SessionState::Disconnected;
        Err(SshError::ConnectTimeout {
            destination: self.target.destination(),
            after: self.timings.connect_timeout,
            last_error,
        })
    }

    /// Reads the canary file and compares it with `expected`.
    ///
    /// A missing file is retried until the canary budget runs out; any
    /// other value fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::CanaryMismatch`] on a wrong value,
    /// [`SshError::CanaryTimeout`] when the file never appears and
    /// [`SshError::Unverified`] when called before [`Self::connect`].
    pub async fn verify_canary(&mut self, expected: &Canary) -> Result<(), SshError> {
        if self.state != SessionState::Connected {
            return Err(SshError::Unverified { state: self.state });
        }

        let remove = self.as_root(&format!("rm -f {CANARY_PATH}"));
        let command = format!("cat {CANARY_PATH} && {remove}");
        let deadline = Instant::now() + self.timings.canary_timeout;

        while Instant::now() <= deadline {
            match self.exec(&command, Some(CANARY_READ_TIMEOUT), None).await {
                Ok(output) if output.is_success() => {
                    if expected.matches(&output.stdout) {
                        self.state = SessionState::CanaryVerified;
                        info!(destination = %self.target.destination(), "canary verified");
                        return Ok(());
                    }
                    return Err(SshError::CanaryMismatch {
                        destination: self.target.destination(),
                    });
                }
                Ok(_) | Err(ExecError::Timeout { .. } | ExecError::Io { .. }) => {}
                Err(err @ ExecError::Spawn { .. }) => return Err(err.into()),
            }
            sleep(self.timings.canary_poll).await;
        }

        Err(SshError::CanaryTimeout {
            after: self.timings.canary_timeout,
        })
    }

    /// Mixes `seed` into the node's kernel random pool.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::run`] failures.
    pub async fn seed_random_pool(&mut self, seed: &[u8]) -> Result<(), SshError> {
        let command = RemoteCommand::new("dd of=/dev/random bs=32 count=1 2>/dev/null")
            .stdin(seed.to_vec());
        self.run(&command).await.map(drop)
    }

    /// Runs `command`, returning stdout when it exits zero.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::CommandFailed`] carrying stderr on a nonzero
    /// exit, [`SshError::CommandTimeout`] when the limit elapses and
    /// [`SshError::Unverified`] before canary verification.
    pub async fn run(&mut self, command: &RemoteCommand) -> Result<String, SshError> {
        let output = self.run_output(command).await?;
        if output.is_success() {
            return Ok(output.stdout);
        }
        Err(SshError::CommandFailed {
            command: command.command.clone(),
            status: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    /// Runs `command` and returns its raw output whatever the exit status.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::CommandTimeout`] when the limit elapses and
    /// [`SshError::Unverified`] before canary verification.
    pub async fn run_output(&mut self, command: &RemoteCommand) -> Result<CommandOutput, SshError> {
        if !matches!(
            self.state,
            SessionState::CanaryVerified | SessionState::InUse
        ) {
            return Err(SshError::Unverified { state: self.state });
        }
        self.state = SessionState::InUse;

        let line = if command.privileged {
            self.as_root(&command.command)
        } else {
            command.command.clone()
        };
        let output = self
            .exec(&line, command.timeout, command.stdin.clone())
            .await
            .map_err(|err| match err {
                ExecError::Timeout { after, .. } => SshError::CommandTimeout {
                    command: command.command.clone(),
                    after,
                },
                other => SshError::Exec(other),
            })?;

        if command.echo {
            for text in output.stdout.lines().chain(output.stderr.lines()) {
                info!(target: "hart::remote", "{text}");
            }
        }
        Ok(output)
    }

    /// Tears the control master down. Consumes the session so it cannot be
    /// used afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Exec`] when `ssh -O exit` cannot be run.
    pub async fn close(mut self) -> Result<(), SshError> {
        let had_transport = matches!(
            self.state,
            SessionState::Connecting
                | SessionState::Connected
                | SessionState::CanaryVerified
                | SessionState::InUse
        );
        self.state = SessionState::Closed;
        if !had_transport {
            return Ok(());
        }

        let spec = CommandSpec::new(&self.ssh_bin)
            .args(["-O", "exit", "-o"])
            .arg(self.control_path_option())
            .arg(self.target.destination())
            .timeout(Some(CLOSE_TIMEOUT));
        self.runner.run(&spec).await?;
        debug!(destination = %self.target.destination(), "ssh session closed");
        Ok(())
    }

    async fn exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
        stdin: Option<Vec<u8>>,
    ) -> Result<CommandOutput, ExecError> {
        let mut spec = CommandSpec::new(&self.ssh_bin)
            .args(self.common_args())
            .arg(self.target.destination())
            .arg(command)
            .timeout(timeout);
        spec.stdin = stdin;
        self.runner.run(&spec).await
    }

    fn connect_spec(&self) -> CommandSpec {
        let mut log_path = OsString::from(self.control_dir.path().as_os_str());
        log_path.push("/connect.log");
        CommandSpec::new(&self.ssh_bin)
            .args(self.common_args())
            .args(["-M", "-N", "-f", "-o"])
            .arg(format!("ControlPersist={}", self.persist.as_secs()))
            .arg("-E")
            .arg(log_path)
            .arg(self.target.destination())
            .timeout(Some(self.timings.attempt_timeout + ATTEMPT_SLACK))
            .discard_output()
    }

    fn common_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "IdentitiesOnly=yes",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.timings.attempt_timeout.as_secs().max(1)
        )));
        args.push(OsString::from("-o"));
        args.push(self.control_path_option());
        args.push(OsString::from("-i"));
        args.push(OsString::from(self.identity.as_str()));
        args.push(OsString::from("-p"));
        args.push(OsString::from(self.target.port.to_string()));
        args
    }

    fn control_path_option(&self) -> OsString {
        let mut option = OsString::from("ControlPath=");
        option.push(self.control_dir.path().as_os_str());
        option.push("/control");
        option
    }

    fn as_root(&self, command: &str) -> String {
        if self.target.is_root() {
            command.to_owned()
        } else {
            format!("sudo sh -c {}", escape(command.into()))
        }
    }
}
