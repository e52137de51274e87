//! Value types exchanged between the orchestrator and providers.

use std::fmt;
use std::net::IpAddr;

use serde_json::{Map, Value};

use crate::bootstrap::DebianRelease;
use crate::config::ConfigError;

/// Default Salt bootstrap branch.
pub const DEFAULT_SALT_BRANCH: &str = "latest";

/// Provider-assigned identity of a compute resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceHandle {
    /// Provider identifier (droplet id, instance id, ...).
    pub id: String,
    /// Name the resource carries at the provider.
    pub name: String,
    /// Region or zone the resource lives in.
    pub region: Option<String>,
}

/// Opaque provider bookkeeping for a resource, such as an auxiliary
/// security group or startup script that must be cleaned up with it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProviderExtra(Option<String>);

impl ProviderExtra {
    /// No bookkeeping.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }

    /// Wraps a provider-defined token.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Some(value.into()))
    }

    /// The raw token; only the provider that produced it interprets it.
    #[must_use]
    pub fn get(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Provider-side form of the temporary public key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteKey {
    /// Key registered as a named provider resource.
    Registered {
        /// Identifier used to reference and delete the key.
        id: String,
        /// Registered key name.
        name: String,
    },
    /// Key injected directly into instance metadata; nothing to delete.
    Inline {
        /// OpenSSH public key line.
        public_key: String,
    },
}

/// Everything a provider needs to create one node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSpec {
    /// Salt minion id and logical node name.
    pub minion_id: String,
    /// Region (or zone for zonal providers).
    pub region: Option<String>,
    /// Size slug; the provider default applies when absent.
    pub size: Option<String>,
    /// Debian release to boot.
    pub release: DebianRelease,
    /// Salt bootstrap branch or version.
    pub salt_branch: String,
    /// Tags applied to the resource.
    pub tags: Vec<String>,
    /// Attach a private network interface.
    pub private_networking: bool,
    /// Availability zone, for providers that need one.
    pub zone: Option<String>,
    /// Subnet name or id, for providers that need one.
    pub subnet: Option<String>,
    /// Extra Salt minion configuration merged over the defaults.
    pub minion_config: Map<String, Value>,
}

impl NodeSpec {
    /// Starts a builder for `minion_id`.
    #[must_use]
    pub fn builder(minion_id: impl Into<String>) -> NodeSpecBuilder {
        NodeSpecBuilder::new(minion_id)
    }
}

/// Builder for [`NodeSpec`] that trims and validates on construction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeSpecBuilder {
    minion_id: String,
    region: Option<String>,
    size: Option<String>,
    release: DebianRelease,
    salt_branch: Option<String>,
    tags: Vec<String>,
    private_networking: bool,
    zone: Option<String>,
    subnet: Option<String>,
    minion_config: Map<String, Value>,
}

impl NodeSpecBuilder {
    /// Creates a builder with default release and branch.
    #[must_use]
    pub fn new(minion_id: impl Into<String>) -> Self {
        Self {
            minion_id: minion_id.into(),
            ..Self::default()
        }
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: Option<String>) -> Self {
        self.region = value;
        self
    }

    /// Sets the size slug.
    #[must_use]
    pub fn size(mut self, value: Option<String>) -> Self {
        self.size = value;
        self
    }

    /// Sets the Debian release.
    #[must_use]
    pub const fn release(mut self, value: DebianRelease) -> Self {
        self.release = value;
        self
    }

    /// Sets the Salt branch.
    #[must_use]
    pub fn salt_branch(mut self, value: Option<String>) -> Self {
        self.salt_branch = value;
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn tags(mut self, value: Vec<String>) -> Self {
        self.tags = value;
        self
    }

    /// Enables private networking.
    #[must_use]
    pub const fn private_networking(mut self, value: bool) -> Self {
        self.private_networking = value;
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: Option<String>) -> Self {
        self.zone = value;
        self
    }

    /// Sets the subnet.
    #[must_use]
    pub fn subnet(mut self, value: Option<String>) -> Self {
        self.subnet = value;
        self
    }

    /// Sets extra minion configuration.
    #[must_use]
    pub fn minion_config(mut self, value: Map<String, Value>) -> Self {
        self.minion_config = value;
        self
    }

    /// Builds and validates the [`NodeSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the minion id is not a
    /// safe Salt id or an optional string is blank.
    pub fn build(self) -> Result<NodeSpec, ConfigError> {
        let minion_id = self.minion_id.trim().to_owned();
        validate_minion_id(&minion_id)?;
        let trim = |value: Option<String>, field: &str| -> Result<Option<String>, ConfigError> {
            match value.map(|raw| raw.trim().to_owned()) {
                Some(blank) if blank.is_empty() => Err(ConfigError::InvalidValue {
                    field: field.to_owned(),
                    message: String::from("must not be blank"),
                }),
                other => Ok(other),
            }
        };
        Ok(NodeSpec {
            minion_id,
            region: trim(self.region, "region")?,
            size: trim(self.size, "size")?,
            release: self.release,
            salt_branch: trim(self.salt_branch, "salt_branch")?
                .unwrap_or_else(|| DEFAULT_SALT_BRANCH.to_owned()),
            tags: self
                .tags
                .into_iter()
                .map(|tag| tag.trim().to_owned())
                .filter(|tag| !tag.is_empty())
                .collect(),
            private_networking: self.private_networking,
            zone: trim(self.zone, "zone")?,
            subnet: trim(self.subnet, "subnet")?,
            minion_config: self.minion_config,
        })
    }
}

/// Checks that `minion_id` is usable both as a Salt id and as a file name
/// in the master's PKI directory.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] describing the problem.
pub fn validate_minion_id(minion_id: &str) -> Result<(), ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        field: String::from("minion_id"),
        message: format!("{message}: '{minion_id}'"),
    };
    if minion_id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if minion_id.starts_with('.') || minion_id.starts_with('-') {
        return Err(invalid("must not start with '.' or '-'"));
    }
    if !minion_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
    {
        return Err(invalid("may only contain letters, digits, '.', '-' and '_'"));
    }
    Ok(())
}

/// Inputs for [`crate::provider::Provider::create_resource`].
#[derive(Clone, Copy, Debug)]
pub struct CreateRequest<'a> {
    /// Node description.
    pub spec: &'a NodeSpec,
    /// Temporary key the node must trust.
    pub key: &'a RemoteKey,
    /// Rendered bootstrap payload.
    pub user_data: &'a str,
}

/// A node that completed provisioning.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionedNode {
    /// Salt minion id.
    pub minion_id: String,
    /// Provider identity of the resource.
    pub handle: ResourceHandle,
    /// Reachable address, once resolved.
    pub public_address: Option<IpAddr>,
    /// Provider bookkeeping passed to every cleanup call.
    pub extra: ProviderExtra,
    /// Whether a private interface was requested.
    pub private_networking: bool,
}

/// Size catalog entry.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSize {
    /// Slug passed to `--size`.
    pub id: String,
    /// Number of virtual CPUs.
    pub cpus: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Disk description.
    pub disk: String,
    /// Monthly price in USD, when the provider publishes one.
    pub monthly_cost: Option<f64>,
    /// Free-form notes such as "estimated".
    pub extras: Vec<String>,
}

impl fmt::Display for NodeSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vCPUs, {} RAM, {} ({}",
            self.cpus,
            format_memory(self.memory_mb),
            self.disk,
            self.id
        )?;
        if let Some(cost) = self.monthly_cost {
            write!(f, ", ${cost:.2}/month")?;
        }
        f.write_str(")")?;
        if !self.extras.is_empty() {
            write!(f, " {}", self.extras.join(" "))?;
        }
        Ok(())
    }
}

fn format_memory(memory_mb: u64) -> String {
    match (memory_mb.checked_rem(1024), memory_mb.checked_div(1024)) {
        (Some(0), Some(gib)) if gib > 0 => format!("{gib} GB"),
        _ => format!("{memory_mb} MB"),
    }
}

/// Region catalog entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    /// Slug passed to `--region`.
    pub id: String,
    /// Human readable name.
    pub name: String,
    /// Zones inside the region, when listed.
    pub zones: Vec<String>,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)?;
        if !self.zones.is_empty() {
            write!(f, " zones: {}", self.zones.join(", "))?;
        }
        Ok(())
    }
}
