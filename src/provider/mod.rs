//! Provider abstraction for creating, reaching and destroying nodes.
//!
//! Each supported cloud implements [`Provider`]; the closed set of variants
//! is [`AnyProvider`]. The orchestrator is generic over the trait so tests
//! can substitute a scripted provider.

mod credential;
mod digitalocean;
mod ec2;
mod gce;
mod http;
mod poll;
mod types;
mod vultr;

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::bootstrap::{BootstrapWait, wait_for_cloud_init};
use crate::config::{ConfigError, HartConfig};
use crate::exec::{CommandRunner, ExecError};
use crate::ssh::{KeyAlgorithm, LocalKeyPair, SshError, SshSession};

pub use credential::TemporaryCredential;
pub use digitalocean::{DigitalOceanConfig, DigitalOceanProvider};
pub use ec2::{Ec2Config, Ec2Provider};
pub use gce::{GceConfig, GceProvider, instance_name};
pub use poll::{ADDRESS_POLL_INTERVAL, ADDRESS_WAIT_TIMEOUT, poll_until, usable_address};
pub use types::{
    CreateRequest, DEFAULT_SALT_BRANCH, NodeSize, NodeSpec, NodeSpecBuilder, ProviderExtra,
    ProvisionedNode, Region, RemoteKey, ResourceHandle, validate_minion_id,
};
pub use vultr::{VultrConfig, VultrProvider};

/// Provider aliases accepted on the command line and in configuration.
pub const PROVIDER_ALIASES: [&str; 4] = ["do", "ec2", "gce", "vultr"];

/// Errors raised by providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Raised when the request or provider configuration is unusable.
    #[error("invalid provider configuration: {0}")]
    Config(String),
    /// Raised when the provider API rejects or fails a call.
    #[error("{operation} failed: {message}")]
    Api {
        /// What was being attempted, including region/size context.
        operation: String,
        /// Provider message.
        message: String,
    },
    /// Raised when a bounded wait expires.
    #[error("timed out after {}s waiting for {what}", .after.as_secs())]
    Timeout {
        /// What was being waited for.
        what: String,
        /// Budget that elapsed.
        after: Duration,
    },
    /// Raised when a lookup finds nothing.
    #[error("no {kind} found matching {name}")]
    NotFound {
        /// Kind of resource.
        kind: String,
        /// Name or path looked up.
        name: String,
    },
    /// Raised when provider output cannot be parsed.
    #[error("failed to parse {resource}: {message}")]
    Parse {
        /// What was being parsed.
        resource: String,
        /// Parser message.
        message: String,
    },
    /// Raised when the bootstrap payload reported failure.
    #[error("bootstrap failed on the node: {detail}")]
    BootstrapFailed {
        /// Remote diagnostic output.
        detail: String,
    },
    /// Raised when a vendor CLI exits non-zero.
    #[error("{program} exited with status {status}: {stderr}")]
    CommandFailure {
        /// CLI that failed.
        program: String,
        /// Exit status text.
        status: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised on SSH failures during provider-driven remote steps.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Raised when a vendor CLI cannot be run.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Capabilities every cloud backend offers.
pub trait Provider: Send + Sync {
    /// Alias used in configuration and on the command line.
    fn alias(&self) -> &'static str;

    /// User hart logs in as on new nodes.
    fn login_user(&self) -> &'static str {
        "root"
    }

    /// Key type the provider accepts for temporary credentials.
    fn key_algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::Ed25519
    }

    /// Checks a request before any cloud call is made.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when a required setting is missing.
    fn validate(&self, spec: &NodeSpec) -> Result<(), ProviderError>;

    /// Makes `key` known to the provider under `name`.
    fn register_key<'a>(
        &'a self,
        name: &'a str,
        key: &'a LocalKeyPair,
    ) -> ProviderFuture<'a, RemoteKey>;

    /// Removes a key created by [`Self::register_key`].
    fn release_key(&self, key: RemoteKey) -> ProviderFuture<'_, ()>;

    /// Issues exactly one creation call. Auxiliary resources made on the way
    /// are released again if creation fails.
    fn create_resource<'a>(
        &'a self,
        request: &'a CreateRequest<'a>,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)>;

    /// Polls until the resource has a usable public address.
    fn resolve_public_address<'a>(
        &'a self,
        handle: &'a ResourceHandle,
    ) -> ProviderFuture<'a, IpAddr>;

    /// Destroys the resource and everything recorded in `extra`. Safe to call
    /// on a resource that never finished initializing.
    fn destroy_resource<'a>(
        &'a self,
        handle: &'a ResourceHandle,
        extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()>;

    /// Finds the resource carrying `minion_id`.
    fn find_resource<'a>(
        &'a self,
        minion_id: &'a str,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)>;

    /// Waits until the bootstrap payload has finished. The default reads
    /// cloud-init's result file.
    fn wait_for_bootstrap<'a, R: CommandRunner + 'a>(
        &'a self,
        session: &'a mut SshSession<R>,
        extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()> {
        let _ = extra;
        Box::pin(wait_for_cloud_init(session, BootstrapWait::default()))
    }

    /// Provider-specific work once the node has joined, such as removing
    /// temporary firewall rules.
    fn on_post_connect<'a, R: CommandRunner + 'a>(
        &'a self,
        node: &'a ProvisionedNode,
        session: &'a mut SshSession<R>,
    ) -> ProviderFuture<'a, ()> {
        let _ = (node, session);
        Box::pin(async { Ok(()) })
    }

    /// Lists available sizes.
    fn list_sizes(&self) -> ProviderFuture<'_, Vec<NodeSize>>;

    /// Lists available regions, with their zones when `include_zones`.
    fn list_regions(&self, include_zones: bool) -> ProviderFuture<'_, Vec<Region>>;
}

/// The supported providers.
#[derive(Debug)]
pub enum AnyProvider<R> {
    /// DigitalOcean droplets.
    DigitalOcean(DigitalOceanProvider),
    /// AWS EC2 instances via the `aws` CLI.
    Ec2(Ec2Provider<R>),
    /// Google Compute Engine instances via the `gcloud` CLI.
    Gce(GceProvider<R>),
    /// Vultr instances.
    Vultr(VultrProvider),
}

impl<R: CommandRunner + Clone> AnyProvider<R> {
    /// Builds the provider named by `alias` from its `[providers.<alias>]`
    /// section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProvider`] for an unsupported alias and
    /// other [`ConfigError`]s when the section is missing or invalid.
    pub fn from_config(alias: &str, config: &HartConfig, runner: R) -> Result<Self, ConfigError> {
        match alias {
            "do" => Ok(Self::DigitalOcean(DigitalOceanProvider::new(
                config.provider_section(alias)?,
            )?)),
            "ec2" => Ok(Self::Ec2(Ec2Provider::new(
                config.provider_section(alias)?,
                runner,
            )?)),
            "gce" => Ok(Self::Gce(GceProvider::new(
                config.provider_section(alias)?,
                runner,
            )?)),
            "vultr" => Ok(Self::Vultr(VultrProvider::new(
                config.provider_section(alias)?,
            )?)),
            other => Err(ConfigError::UnknownProvider {
                alias: other.to_owned(),
                known: PROVIDER_ALIASES.join(", "),
            }),
        }
    }

    /// Applies a command-line region to the CLI-driven providers, which
    /// scope lookups and listings by region (EC2) or zone (GCE).
    #[must_use]
    pub fn with_region(self, region: Option<String>) -> Self {
        match self {
            Self::Ec2(provider) => Self::Ec2(provider.with_region(region)),
            Self::Gce(provider) => Self::Gce(provider.with_zone(region)),
            rest @ (Self::DigitalOcean(_) | Self::Vultr(_)) => rest,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $call:expr) => {
        match $self {
            Self::DigitalOcean($inner) => $call,
            Self::Ec2($inner) => $call,
            Self::Gce($inner) => $call,
            Self::Vultr($inner) => $call,
        }
    };
}

impl<R: CommandRunner + Clone> Provider for AnyProvider<R> {
    fn alias(&self) -> &'static str {
        dispatch!(self, inner => inner.alias())
    }

    fn login_user(&self) -> &'static str {
        dispatch!(self, inner => inner.login_user())
    }

    fn key_algorithm(&self) -> KeyAlgorithm {
        dispatch!(self, inner => inner.key_algorithm())
    }

    fn validate(&self, spec: &NodeSpec) -> Result<(), ProviderError> {
        dispatch!(self, inner => inner.validate(spec))
    }

    fn register_key<'a>(
        &'a self,
        name: &'a str,
        key: &'a LocalKeyPair,
    ) -> ProviderFuture<'a, RemoteKey> {
        dispatch!(self, inner => inner.register_key(name, key))
    }

    fn release_key(&self, key: RemoteKey) -> ProviderFuture<'_, ()> {
        dispatch!(self, inner => inner.release_key(key))
    }

    fn create_resource<'a>(
        &'a self,
        request: &'a CreateRequest<'a>,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)> {
        dispatch!(self, inner => inner.create_resource(request))
    }

    fn resolve_public_address<'a>(
        &'a self,
        handle: &'a ResourceHandle,
    ) -> ProviderFuture<'a, IpAddr> {
        dispatch!(self, inner => inner.resolve_public_address(handle))
    }

    fn destroy_resource<'a>(
        &'a self,
        handle: &'a ResourceHandle,
        extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()> {
        dispatch!(self, inner => inner.destroy_resource(handle, extra))
    }

    fn find_resource<'a>(
        &'a self,
        minion_id: &'a str,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)> {
        dispatch!(self, inner => inner.find_resource(minion_id))
    }

    fn wait_for_bootstrap<'a, S: CommandRunner + 'a>(
        &'a self,
        session: &'a mut SshSession<S>,
        extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()> {
        dispatch!(self, inner => inner.wait_for_bootstrap(session, extra))
    }

    fn on_post_connect<'a, S: CommandRunner + 'a>(
        &'a self,
        node: &'a ProvisionedNode,
        session: &'a mut SshSession<S>,
    ) -> ProviderFuture<'a, ()> {
        dispatch!(self, inner => inner.on_post_connect(node, session))
    }

    fn list_sizes(&self) -> ProviderFuture<'_, Vec<NodeSize>> {
        dispatch!(self, inner => inner.list_sizes())
    }

    fn list_regions(&self, include_zones: bool) -> ProviderFuture<'_, Vec<Region>> {
        dispatch!(self, inner => inner.list_regions(include_zones))
    }
}

/// Converts a failed vendor CLI run into [`ProviderError::CommandFailure`].
pub(crate) fn check_cli_output(
    program: &str,
    operation: &str,
    output: crate::exec::CommandOutput,
) -> Result<String, ProviderError> {
    if output.is_success() {
        return Ok(output.stdout);
    }
    Err(ProviderError::CommandFailure {
        program: program.to_owned(),
        status: output.status_text(),
        stderr: format!("{operation}: {}", output.stderr.trim()),
    })
}

/// Parses vendor CLI JSON output.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    stdout: &str,
    resource: &str,
) -> Result<T, ProviderError> {
    serde_json::from_str(stdout).map_err(|err| ProviderError::Parse {
        resource: resource.to_owned(),
        message: err.to_string(),
    })
}
