//! Google Compute Engine instances driven through the `gcloud` CLI.
//!
//! GCE has no key resource: the temporary key is injected as `ssh-keys`
//! instance metadata and the payload as the `startup-script`. Instance
//! names must be DNS labels, so they are derived from the minion id with
//! [`instance_name`].

use std::io::Write as _;
use std::net::IpAddr;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::bootstrap::{BootstrapWait, COMPLETION_LOG, wait_for_sentinel};
use crate::config::ConfigError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::ssh::{LocalKeyPair, SshSession};

use super::{
    ADDRESS_POLL_INTERVAL, ADDRESS_WAIT_TIMEOUT, CreateRequest, NodeSize, NodeSpec, Provider,
    ProviderError, ProviderExtra, ProviderFuture, Region, RemoteKey, ResourceHandle,
    check_cli_output, parse_json, poll_until, usable_address,
};

const LOGIN_USER: &str = "hart";
const DEFAULT_MACHINE_TYPE: &str = "e2-small";
const DEFAULT_LISTING_ZONE: &str = "us-east1-b";
const MAX_NAME_LEN: usize = 63;
const NAME_HASH_LEN: usize = 6;
/// List prices (USD per month) used for size estimates.
const CPU_MONTHLY_COST: f64 = 16.153_221;
const MEMORY_GB_MONTHLY_COST: f64 = 2.165_107;

const REGION_NAMES: &[(&str, &str)] = &[
    ("asia-east1", "Changhua County, Taiwan"),
    ("asia-east2", "Hong Kong"),
    ("asia-northeast1", "Tokyo, Japan"),
    ("asia-northeast2", "Osaka, Japan"),
    ("asia-northeast3", "Seoul, South Korea"),
    ("asia-south1", "Mumbai, India"),
    ("asia-southeast1", "Jurong West, Singapore"),
    ("australia-southeast1", "Sydney, Australia"),
    ("europe-north1", "Hamina, Finland"),
    ("europe-west1", "St. Ghislain, Belgium"),
    ("europe-west2", "London, England, UK"),
    ("europe-west3", "Frankfurt, Germany"),
    ("europe-west4", "Eemshaven, Netherlands"),
    ("europe-west6", "Zürich, Switzerland"),
    ("northamerica-northeast1", "Montréal, Québec, Canada"),
    ("southamerica-east1", "Osasco (São Paulo), Brazil"),
    ("us-central1", "Council Bluffs, Iowa, USA"),
    ("us-east1", "Moncks Corner, South Carolina, USA"),
    ("us-east4", "Ashburn, Northern Virginia, USA"),
    ("us-west1", "The Dalles, Oregon, USA"),
    ("us-west2", "Los Angeles, California, USA"),
];

/// `[providers.gce]` section.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct GceConfig {
    /// Project new instances are created in.
    pub project: String,
    /// Default zone when none is given on the command line.
    #[serde(default)]
    pub zone: Option<String>,
    /// Path to the `gcloud` CLI.
    #[serde(default = "default_gcloud_bin")]
    pub gcloud_bin: String,
    /// Service account key file; the CLI's active account applies when
    /// absent.
    #[serde(default)]
    pub credentials_file: Option<String>,
}

fn default_gcloud_bin() -> String {
    String::from("gcloud")
}

/// GCE provider.
#[derive(Clone, Debug)]
pub struct GceProvider<R> {
    config: GceConfig,
    runner: R,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    name: String,
    #[serde(default)]
    zone: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachineType {
    name: String,
    guest_cpus: u32,
    memory_mb: u64,
}

#[derive(Debug, Deserialize)]
struct ApiRegion {
    name: String,
    #[serde(default)]
    zones: Vec<String>,
}

/// Derives a GCE-safe instance name from a minion id: the id's labels in
/// reverse order, joined by dashes, plus a short digest of the full id so
/// distinct ids never collide after sanitizing.
#[must_use]
pub fn instance_name(minion_id: &str) -> String {
    let digest = Sha256::digest(minion_id.as_bytes());
    let hash: String = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
        .chars()
        .take(NAME_HASH_LEN)
        .collect();
    let reversed = minion_id
        .split('.')
        .rev()
        .map(sanitize_label)
        .filter(|label| !label.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let budget = MAX_NAME_LEN - "hart-".len() - 1 - NAME_HASH_LEN;
    let truncated: String = reversed.chars().take(budget).collect();
    let body = truncated.trim_end_matches('-');
    if body.is_empty() {
        format!("hart-{hash}")
    } else {
        format!("hart-{body}-{hash}")
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|ch| match ch.to_ascii_lowercase() {
            lower @ ('a'..='z' | '0'..='9' | '-') => lower,
            _ => '-',
        })
        .collect::<String>()
        .trim_matches('-')
        .to_owned()
}

fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

fn external_address(instance: &Instance) -> Option<IpAddr> {
    instance
        .network_interfaces
        .iter()
        .flat_map(|interface| &interface.access_configs)
        .find_map(|config| config.nat_ip.as_deref().and_then(usable_address))
}

#[expect(clippy::float_arithmetic, reason = "GCE size prices are estimates")]
fn to_size(machine: MachineType) -> NodeSize {
    let memory_gb = f64::from(u32::try_from(machine.memory_mb).unwrap_or(u32::MAX)) / 1024.0;
    let cost = memory_gb.mul_add(
        MEMORY_GB_MONTHLY_COST,
        f64::from(machine.guest_cpus) * CPU_MONTHLY_COST,
    );
    NodeSize {
        id: machine.name,
        cpus: machine.guest_cpus,
        memory_mb: machine.memory_mb,
        disk: String::from("No disk"),
        monthly_cost: Some(cost),
        extras: vec![String::from("(estimated)")],
    }
}

fn pretty_region_name(id: &str) -> String {
    REGION_NAMES
        .iter()
        .find_map(|(known, name)| (*known == id).then(|| (*name).to_owned()))
        .unwrap_or_else(|| id.to_owned())
}

fn staged_file(contents: &str) -> Result<NamedTempFile, ProviderError> {
    let stage_error = |err: std::io::Error| {
        ProviderError::Config(format!("failed to stage instance metadata: {err}"))
    };
    let mut file = tempfile::Builder::new()
        .prefix("hart-metadata-")
        .tempfile()
        .map_err(stage_error)?;
    file.write_all(contents.as_bytes()).map_err(stage_error)?;
    Ok(file)
}

impl<R: CommandRunner> GceProvider<R> {
    /// Builds the provider from its configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the project is blank.
    pub fn new(config: GceConfig, runner: R) -> Result<Self, ConfigError> {
        if config.project.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from(
                "providers.gce.project",
            )));
        }
        Ok(Self { config, runner })
    }

    /// Overrides the configured default zone.
    #[must_use]
    pub fn with_zone(mut self, zone: Option<String>) -> Self {
        if zone.is_some() {
            self.config.zone = zone;
        }
        self
    }

    fn zone_for<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str, ProviderError> {
        requested
            .or(self.config.zone.as_deref())
            .ok_or_else(|| ProviderError::Config(String::from("a GCE zone is required")))
    }

    fn command(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(self.config.gcloud_bin.as_str())
            .arg("compute")
            .arg(format!("--project={}", self.config.project))
            .arg("--format=json")
            .arg("--quiet");
        if let Some(path) = &self.config.credentials_file {
            spec = spec.env("CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE", path.as_str());
        }
        spec
    }

    async fn gcloud(&self, args: &[&str], operation: &str) -> Result<String, ProviderError> {
        let spec = self.command().args(args.iter().copied());
        let output = self.runner.run(&spec).await?;
        check_cli_output(&self.config.gcloud_bin, operation, output)
    }

    async fn describe(&self, name: &str, zone: &str) -> Result<Instance, ProviderError> {
        let zone_arg = format!("--zone={zone}");
        let stdout = self
            .gcloud(&["instances", "describe", name, &zone_arg], "describe instance")
            .await?;
        parse_json(&stdout, "instance")
    }
}

impl<R: CommandRunner> Provider for GceProvider<R> {
    fn alias(&self) -> &'static str {
        "gce"
    }

    fn login_user(&self) -> &'static str {
        LOGIN_USER
    }

    fn validate(&self, spec: &NodeSpec) -> Result<(), ProviderError> {
        self.zone_for(spec.region.as_deref()).map(drop)
    }

    fn register_key<'a>(
        &'a self,
        _name: &'a str,
        key: &'a LocalKeyPair,
    ) -> ProviderFuture<'a, RemoteKey> {
        Box::pin(async move {
            Ok(RemoteKey::Inline {
                public_key: key.public_key().to_owned(),
            })
        })
    }

    fn release_key(&self, _key: RemoteKey) -> ProviderFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn create_resource<'a>(
        &'a self,
        request: &'a CreateRequest<'a>,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)> {
        Box::pin(async move {
            let spec = request.spec;
            let zone = self.zone_for(spec.region.as_deref())?;
            let RemoteKey::Inline { public_key } = request.key else {
                return Err(ProviderError::Config(String::from(
                    "GCE takes the SSH key as instance metadata",
                )));
            };
            let name = instance_name(&spec.minion_id);
            let machine_type = spec.size.as_deref().unwrap_or(DEFAULT_MACHINE_TYPE);

            let startup = staged_file(request.user_data)?;
            let keys = staged_file(&format!("{LOGIN_USER}:{public_key}\n"))?;
            let metadata_files = format!(
                "startup-script={},ssh-keys={}",
                startup.path().display(),
                keys.path().display()
            );
            let zone_arg = format!("--zone={zone}");
            let machine_arg = format!("--machine-type={machine_type}");
            let image_arg = format!("--image-family=debian-{}", spec.release.version());
            let metadata_arg = format!("--metadata=hart-minion-id={}", spec.minion_id);
            let mut args = vec![
                "instances",
                "create",
                name.as_str(),
                zone_arg.as_str(),
                machine_arg.as_str(),
                image_arg.as_str(),
                "--image-project=debian-cloud",
                metadata_arg.as_str(),
                "--metadata-from-file",
                metadata_files.as_str(),
            ];
            let tags_arg = format!(
                "--tags={}",
                spec.tags
                    .iter()
                    .map(String::as_str)
                    .map(sanitize_label)
                    .collect::<Vec<_>>()
                    .join(",")
            );
            if !spec.tags.is_empty() {
                args.push(tags_arg.as_str());
            }
            let subnet_arg = spec.subnet.as_ref().map(|subnet| format!("--subnet={subnet}"));
            if let Some(subnet) = &subnet_arg {
                args.push(subnet.as_str());
            }

            let operation = format!(
                "create instance {name} for {} in {zone} (type {machine_type})",
                spec.minion_id
            );
            let stdout = self.gcloud(&args, &operation).await?;
            let created: Vec<Instance> = parse_json(&stdout, "created instance")?;
            let instance = created.into_iter().next().ok_or_else(|| ProviderError::Parse {
                resource: String::from("created instance"),
                message: String::from("no instance returned"),
            })?;
            info!(name = %instance.name, zone, "created instance");
            Ok((
                ResourceHandle {
                    id: instance.name.clone(),
                    name: instance.name,
                    region: Some(zone.to_owned()),
                },
                ProviderExtra::none(),
            ))
        })
    }

    fn resolve_public_address<'a>(
        &'a self,
        handle: &'a ResourceHandle,
    ) -> ProviderFuture<'a, IpAddr> {
        Box::pin(async move {
            let zone = self.zone_for(handle.region.as_deref())?;
            poll_until(
                "instance external address",
                ADDRESS_POLL_INTERVAL,
                ADDRESS_WAIT_TIMEOUT,
                move || async move {
                    Ok(external_address(&self.describe(&handle.id, zone).await?))
                },
            )
            .await
        })
    }

    fn destroy_resource<'a>(
        &'a self,
        handle: &'a ResourceHandle,
        _extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let zone = self.zone_for(handle.region.as_deref())?;
            let zone_arg = format!("--zone={zone}");
            match self
                .gcloud(
                    &["instances", "delete", &handle.id, &zone_arg, "--delete-disks=all"],
                    "delete instance",
                )
                .await
            {
                Ok(_) => {
                    info!(name = %handle.id, "deleted instance");
                    Ok(())
                }
                Err(ProviderError::CommandFailure { stderr, .. }) if stderr.contains("was not found") => {
                    warn!(name = %handle.id, "instance already gone");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })
    }

    fn find_resource<'a>(
        &'a self,
        minion_id: &'a str,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)> {
        Box::pin(async move {
            let name = instance_name(minion_id);
            let filter = format!("--filter=name={name}");
            let stdout = self
                .gcloud(&["instances", "list", &filter], "list instances")
                .await?;
            let instances: Vec<Instance> = parse_json(&stdout, "instances")?;
            instances
                .into_iter()
                .find(|instance| instance.name == name)
                .map(|instance| {
                    let zone = last_segment(&instance.zone).to_owned();
                    (
                        ResourceHandle {
                            id: instance.name.clone(),
                            name: instance.name,
                            region: (!zone.is_empty()).then_some(zone),
                        },
                        ProviderExtra::none(),
                    )
                })
                .ok_or_else(|| ProviderError::NotFound {
                    kind: String::from("instance"),
                    name: minion_id.to_owned(),
                })
        })
    }

    fn wait_for_bootstrap<'a, S: CommandRunner + 'a>(
        &'a self,
        session: &'a mut SshSession<S>,
        _extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(wait_for_sentinel(session, COMPLETION_LOG, BootstrapWait::default()))
    }

    fn list_sizes(&self) -> ProviderFuture<'_, Vec<NodeSize>> {
        Box::pin(async move {
            let zone = self.config.zone.as_deref().unwrap_or(DEFAULT_LISTING_ZONE);
            let zones_arg = format!("--zones={zone}");
            let stdout = self
                .gcloud(&["machine-types", "list", &zones_arg], "list machine types")
                .await?;
            let machines: Vec<MachineType> = parse_json(&stdout, "machine types")?;
            let mut sizes: Vec<NodeSize> = machines.into_iter().map(to_size).collect();
            sizes.sort_by(|a, b| {
                a.monthly_cost
                    .unwrap_or_default()
                    .total_cmp(&b.monthly_cost.unwrap_or_default())
            });
            Ok(sizes)
        })
    }

    fn list_regions(&self, include_zones: bool) -> ProviderFuture<'_, Vec<Region>> {
        Box::pin(async move {
            let stdout = self.gcloud(&["regions", "list"], "list regions").await?;
            let listed: Vec<ApiRegion> = parse_json(&stdout, "regions")?;
            let mut regions: Vec<Region> = listed
                .into_iter()
                .map(|region| Region {
                    name: pretty_region_name(&region.name),
                    zones: if include_zones {
                        let mut zones: Vec<String> = region
                            .zones
                            .iter()
                            .map(|url| last_segment(url).to_owned())
                            .collect();
                        zones.sort();
                        zones
                    } else {
                        Vec::new()
                    },
                    id: region.name,
                })
                .collect();
            regions.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(regions)
        })
    }
}
