//! Async command execution for the external binaries hart drives.
//!
//! Every remote action goes through the system `ssh` client, and the EC2 and
//! GCE adapters drive their vendor CLIs, so process execution sits behind the
//! [`CommandRunner`] trait. Tests substitute a scripted runner; production
//! uses [`ProcessCommandRunner`], which drains stdout and stderr concurrently
//! with the wait so a chatty child never blocks on a full pipe.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Builds a successful output carrying `stdout`.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Builds a failed output with the given exit code and stderr.
    #[must_use]
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Human readable exit status used in error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Fully described invocation of an external program.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Bytes written to the child's stdin, which is closed afterwards.
    pub stdin: Option<Vec<u8>>,
    /// Upper bound on the run time; the child is killed when it elapses.
    pub timeout: Option<Duration>,
    /// Discard stdout and stderr instead of capturing them. Needed for
    /// programs that daemonise and keep the pipes open.
    pub discard_output: bool,
}

impl CommandSpec {
    /// Starts a spec for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends a single argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Supplies stdin content.
    #[must_use]
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Sets the run time limit.
    #[must_use]
    pub const fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    /// Discards output streams.
    #[must_use]
    pub const fn discard_output(mut self) -> Self {
        self.discard_output = true;
        self
    }

    /// Returns a shell-like command string for logs and assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Errors raised while running an external program.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when the program cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Error message from the OS.
        message: String,
    },
    /// Raised when waiting on or reading from the child fails.
    #[error("failed while running {program}: {message}")]
    Io {
        /// Program being run.
        program: String,
        /// Error message from the OS.
        message: String,
    },
    /// Raised when the program outlives its time limit and is killed.
    #[error("{program} timed out after {}s", .after.as_secs())]
    Timeout {
        /// Program that was killed.
        program: String,
        /// Limit that elapsed.
        after: Duration,
    },
}

/// Future returned by [`CommandRunner::run`].
pub type CommandFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, ExecError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the described command and returns its captured output.
    ///
    /// A nonzero exit status is not an error at this level; callers inspect
    /// [`CommandOutput::code`].
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> CommandFuture<'a>;
}

/// Real command runner backed by `tokio::process`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> CommandFuture<'a> {
        Box::pin(run_process(spec))
    }
}

async fn run_process(spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args).kill_on_drop(true);
    // Keep terminal Ctrl-C away from children so teardown can still use them.
    #[cfg(unix)]
    command.process_group(0);
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    if spec.discard_output {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    let mut child = command.spawn().map_err(|err| ExecError::Spawn {
        program: spec.program.clone(),
        message: err.to_string(),
    })?;

    let stdin_task = match (child.stdin.take(), spec.stdin.clone()) {
        (Some(mut pipe), Some(bytes)) => Some(tokio::spawn(async move {
            pipe.write_all(&bytes).await.ok();
            pipe.shutdown().await.ok();
        })),
        _ => None,
    };

    let collected = match spec.timeout {
        Some(limit) => tokio::time::timeout(limit, collect(&mut child)).await.ok(),
        None => Some(collect(&mut child).await),
    };

    if let Some(task) = stdin_task {
        task.abort();
    }

    match collected {
        Some(result) => result.map_err(|err| ExecError::Io {
            program: spec.program.clone(),
            message: err.to_string(),
        }),
        None => {
            child.kill().await.ok();
            Err(ExecError::Timeout {
                program: spec.program.clone(),
                after: spec.timeout.unwrap_or_default(),
            })
        }
    }
}

async fn collect(child: &mut Child) -> std::io::Result<CommandOutput> {
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let (status, stdout, stderr) =
        tokio::join!(child.wait(), drain(stdout_pipe), drain(stderr_pipe));
    Ok(CommandOutput {
        code: status?.code(),
        stdout,
        stderr,
    })
}

async fn drain<P: AsyncRead + Unpin>(pipe: Option<P>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut handle) = pipe {
        handle.read_to_end(&mut buffer).await.ok();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests;
