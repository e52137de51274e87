//! Probes that decide whether a node's bootstrap payload finished.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::time::sleep;
use tracing::debug;

use crate::exec::CommandRunner;
use crate::provider::ProviderError;
use crate::ssh::{RemoteCommand, SshSession};

use super::{COMPLETE_SENTINEL, FAILED_SENTINEL};

const CLOUD_INIT_RESULT: &str = "/run/cloud-init/result.json";
const CLOUD_INIT_OUTPUT: &str = "/var/log/cloud-init-output.log";

/// Polling budget for bootstrap completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BootstrapWait {
    /// Delay between probes.
    pub interval: Duration,
    /// Overall budget.
    pub timeout: Duration,
}

impl Default for BootstrapWait {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1200),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CloudInitResult {
    v1: CloudInitStatus,
}

#[derive(Debug, Deserialize)]
struct CloudInitStatus {
    #[serde(default)]
    errors: Vec<String>,
}

/// Outcome of one probe.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Progress {
    Pending,
    Succeeded,
    Failed(String),
}

/// Waits for cloud-init to publish its result file.
///
/// # Errors
///
/// Returns [`ProviderError::BootstrapFailed`] carrying cloud-init's errors
/// and the tail of its output log, [`ProviderError::Timeout`] when the
/// result never appears and [`ProviderError::Ssh`] on session failures.
pub async fn wait_for_cloud_init<R: CommandRunner>(
    session: &mut SshSession<R>,
    wait: BootstrapWait,
) -> Result<(), ProviderError> {
    let probe = RemoteCommand::new(format!("cat {CLOUD_INIT_RESULT} 2>/dev/null || true"));
    let progress = poll_for(session, &probe, wait, "cloud-init result", parse_cloud_init).await?;
    match progress {
        Progress::Failed(errors) => {
            let tail = session
                .run(&RemoteCommand::new(format!("tail -n 20 {CLOUD_INIT_OUTPUT}")).privileged())
                .await
                .unwrap_or_default();
            Err(ProviderError::BootstrapFailed {
                detail: format!("cloud-init failed: {errors}\n{}", tail.trim_end()),
            })
        }
        Progress::Succeeded | Progress::Pending => Ok(()),
    }
}

/// Waits for the payload's sentinel line in `log_path`.
///
/// # Errors
///
/// Returns [`ProviderError::BootstrapFailed`] when the payload reported a
/// failure, [`ProviderError::Timeout`] when no sentinel appears and
/// [`ProviderError::Ssh`] on session failures.
pub async fn wait_for_sentinel<R: CommandRunner>(
    session: &mut SshSession<R>,
    log_path: &str,
    wait: BootstrapWait,
) -> Result<(), ProviderError> {
    let probe = RemoteCommand::new(format!("cat {log_path} 2>/dev/null || true")).privileged();
    match poll_for(session, &probe, wait, "bootstrap sentinel", parse_sentinel).await? {
        Progress::Failed(detail) => Err(ProviderError::BootstrapFailed { detail }),
        Progress::Succeeded | Progress::Pending => Ok(()),
    }
}

async fn poll_for<R: CommandRunner>(
    session: &mut SshSession<R>,
    probe: &RemoteCommand,
    wait: BootstrapWait,
    what: &str,
    classify: fn(&str) -> Progress,
) -> Result<Progress, ProviderError> {
    let deadline = Instant::now() + wait.timeout;
    while Instant::now() <= deadline {
        let stdout = session.run(probe).await?;
        let progress = classify(&stdout);
        debug!(?progress, "bootstrap probe");
        if progress != Progress::Pending {
            return Ok(progress);
        }
        sleep(wait.interval).await;
    }
    Err(ProviderError::Timeout {
        what: what.to_owned(),
        after: wait.timeout,
    })
}

fn parse_cloud_init(stdout: &str) -> Progress {
    if stdout.trim().is_empty() {
        return Progress::Pending;
    }
    match serde_json::from_str::<CloudInitResult>(stdout) {
        Ok(result) if result.v1.errors.is_empty() => Progress::Succeeded,
        Ok(result) => Progress::Failed(result.v1.errors.join(", ")),
        Err(_) => Progress::Pending,
    }
}

fn parse_sentinel(stdout: &str) -> Progress {
    for line in stdout.lines() {
        if let Some(detail) = line.strip_prefix(FAILED_SENTINEL) {
            return Progress::Failed(detail.trim().to_owned());
        }
        if line.starts_with(COMPLETE_SENTINEL) {
            return Progress::Succeeded;
        }
    }
    Progress::Pending
}
