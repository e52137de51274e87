//! AWS EC2 instances driven through the `aws` CLI.
//!
//! New instances start in a temporary security group that admits SSH from
//! the operator only. Once the node has joined, the instance moves to the
//! VPC's default group and the temporary group is deleted. The group id is
//! the node's [`ProviderExtra`].

use std::io::Write as _;
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::ssh::{KeyAlgorithm, LocalKeyPair, SshSession};

use super::http::fetch_text;
use super::{
    ADDRESS_POLL_INTERVAL, ADDRESS_WAIT_TIMEOUT, CreateRequest, NodeSize, NodeSpec, Provider,
    ProviderError, ProviderExtra, ProviderFuture, ProvisionedNode, Region, RemoteKey,
    ResourceHandle, check_cli_output, parse_json, poll_until, usable_address,
};

/// Account publishing the official Debian AMIs.
const DEBIAN_IMAGE_OWNER: &str = "136693071363";
const DEFAULT_INSTANCE_TYPE: &str = "t3.micro";
const DEFAULT_CHECKIP_URL: &str = "https://checkip.amazonaws.com";
const TERMINATE_WAIT: Duration = Duration::from_secs(300);
const LIVE_STATES: &str = "pending,running,stopping,stopped";

/// `[providers.ec2]` section.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Ec2Config {
    /// Default region when none is given on the command line.
    #[serde(default)]
    pub region: Option<String>,
    /// Path to the `aws` CLI.
    #[serde(default = "default_aws_bin")]
    pub aws_bin: String,
    /// Named CLI profile.
    #[serde(default)]
    pub profile: Option<String>,
    /// Access key id; the CLI's own credential chain applies when absent.
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    /// Secret access key.
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    /// CIDRs allowed to reach port 22 of new instances. Defaults to the
    /// operator's public address.
    #[serde(default)]
    pub ssh_ingress_cidrs: Vec<String>,
    /// Service echoing the caller's public address.
    #[serde(default = "default_checkip_url")]
    pub checkip_url: String,
}

impl std::fmt::Debug for Ec2Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ec2Config")
            .field("region", &self.region)
            .field("aws_bin", &self.aws_bin)
            .field("profile", &self.profile)
            .field("ssh_ingress_cidrs", &self.ssh_ingress_cidrs)
            .finish_non_exhaustive()
    }
}

fn default_aws_bin() -> String {
    String::from("aws")
}

fn default_checkip_url() -> String {
    DEFAULT_CHECKIP_URL.to_owned()
}

/// EC2 provider.
#[derive(Clone, Debug)]
pub struct Ec2Provider<R> {
    config: Ec2Config,
    runner: R,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImportedKey {
    key_name: String,
    key_pair_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageList {
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Image {
    image_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubnetList {
    subnets: Vec<Subnet>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
struct Subnet {
    subnet_id: String,
    vpc_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedGroup {
    group_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupList {
    security_groups: Vec<CreatedGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReservationList {
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    #[serde(default)]
    public_ip_address: Option<String>,
    #[serde(default)]
    vpc_id: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    security_groups: Vec<AttachedGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedGroup {
    group_id: String,
    group_name: String,
}

impl Instance {
    /// The temporary ssh group still attached for `minion_id`, if any.
    fn temp_group(&self, minion_id: &str) -> Option<&str> {
        let prefix = temp_group_prefix(minion_id);
        self.security_groups
            .iter()
            .find(|group| group.group_name.starts_with(&prefix))
            .map(|group| group.group_id.as_str())
    }
}

fn temp_group_prefix(minion_id: &str) -> String {
    format!("hart-temp-for-{minion_id}-")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceTypeList {
    instance_types: Vec<InstanceType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceType {
    instance_type: String,
    v_cpu_info: VCpuInfo,
    memory_info: MemoryInfo,
    #[serde(default)]
    instance_storage_info: Option<StorageInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VCpuInfo {
    default_v_cpus: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MemoryInfo {
    size_in_mi_b: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StorageInfo {
    total_size_in_gb: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegionList {
    regions: Vec<ApiRegion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiRegion {
    region_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ZoneList {
    availability_zones: Vec<Zone>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Zone {
    zone_name: String,
}

impl<R: CommandRunner> Ec2Provider<R> {
    /// Builds the provider from its configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when only one half of the access
    /// key pair is configured or the CLI path is blank.
    pub fn new(config: Ec2Config, runner: R) -> Result<Self, ConfigError> {
        if config.aws_bin.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from(
                "providers.ec2.aws_bin",
            )));
        }
        if config.aws_access_key_id.is_some() != config.aws_secret_access_key.is_some() {
            return Err(ConfigError::InvalidValue {
                field: String::from("providers.ec2"),
                message: String::from(
                    "aws_access_key_id and aws_secret_access_key must be set together",
                ),
            });
        }
        Ok(Self { config, runner })
    }

    /// Overrides the configured default region.
    #[must_use]
    pub fn with_region(mut self, region: Option<String>) -> Self {
        if region.is_some() {
            self.config.region = region;
        }
        self
    }

    fn region_for<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str, ProviderError> {
        requested
            .or(self.config.region.as_deref())
            .ok_or_else(|| ProviderError::Config(String::from("an EC2 region is required")))
    }

    fn command(&self, region: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(self.config.aws_bin.as_str())
            .args(["--region", region, "--output", "json", "ec2"]);
        if let Some(profile) = &self.config.profile {
            spec = spec.env("AWS_PROFILE", profile.as_str());
        }
        if let (Some(id), Some(secret)) = (
            &self.config.aws_access_key_id,
            &self.config.aws_secret_access_key,
        ) {
            spec = spec
                .env("AWS_ACCESS_KEY_ID", id.as_str())
                .env("AWS_SECRET_ACCESS_KEY", secret.as_str());
        }
        spec
    }

    async fn aws(&self, region: &str, args: &[&str], operation: &str) -> Result<String, ProviderError> {
        let spec = self.command(region).args(args.iter().copied());
        let output = self.runner.run(&spec).await?;
        check_cli_output(&self.config.aws_bin, operation, output)
    }

    async fn latest_debian_image(&self, region: &str, version: u8) -> Result<String, ProviderError> {
        let pattern = format!("Name=name,Values=debian-{version}-amd64-*");
        let stdout = self
            .aws(
                region,
                &[
                    "describe-images",
                    "--owners",
                    DEBIAN_IMAGE_OWNER,
                    "--filters",
                    &pattern,
                    "Name=architecture,Values=x86_64",
                ],
                "describe images",
            )
            .await?;
        let list: ImageList = parse_json(&stdout, "images")?;
        newest_image(list.images).ok_or_else(|| ProviderError::NotFound {
            kind: String::from("Debian image"),
            name: format!("debian-{version}-amd64 in {region}"),
        })
    }

    async fn subnet_in(
        &self,
        region: &str,
        zone: &str,
        requested: Option<&str>,
    ) -> Result<Subnet, ProviderError> {
        let zone_filter = format!("Name=availability-zone,Values={zone}");
        let mut args = vec!["describe-subnets", "--filters", zone_filter.as_str()];
        if let Some(subnet) = requested {
            args.extend(["--subnet-ids", subnet]);
        }
        let stdout = self.aws(region, &args, "describe subnets").await?;
        let list: SubnetList = parse_json(&stdout, "subnets")?;
        select_subnet(list.subnets, zone, requested)
    }

    async fn ingress_cidrs(&self) -> Result<Vec<String>, ProviderError> {
        if !self.config.ssh_ingress_cidrs.is_empty() {
            return Ok(self.config.ssh_ingress_cidrs.clone());
        }
        let body = fetch_text(&self.config.checkip_url, "look up operator address").await?;
        let address = usable_address(&body).ok_or_else(|| ProviderError::Parse {
            resource: String::from("operator address"),
            message: format!("unexpected response '{}'", body.trim()),
        })?;
        let prefix = if address.is_ipv4() { 32 } else { 128 };
        Ok(vec![format!("{address}/{prefix}")])
    }

    async fn create_temp_group(
        &self,
        region: &str,
        minion_id: &str,
        vpc_id: &str,
    ) -> Result<String, ProviderError> {
        let cidrs = self.ingress_cidrs().await?;
        let name = format!(
            "{}{}",
            temp_group_prefix(minion_id),
            Utc::now().format("%Y-%m-%dT%H-%M-%S")
        );
        let stdout = self
            .aws(
                region,
                &[
                    "create-security-group",
                    "--group-name",
                    &name,
                    "--description",
                    "Temporary group for initial hart ssh access",
                    "--vpc-id",
                    vpc_id,
                ],
                "create security group",
            )
            .await?;
        let group: CreatedGroup = parse_json(&stdout, "security group")?;
        let permissions = ingress_permissions(&cidrs).to_string();
        if let Err(err) = self
            .aws(
                region,
                &[
                    "authorize-security-group-ingress",
                    "--group-id",
                    &group.group_id,
                    "--ip-permissions",
                    &permissions,
                ],
                "authorize ssh ingress",
            )
            .await
        {
            self.delete_group(region, &group.group_id).await;
            return Err(err);
        }
        debug!(group = %group.group_id, "created temporary security group");
        Ok(group.group_id)
    }

    async fn delete_group(&self, region: &str, group_id: &str) {
        if let Err(err) = self
            .aws(
                region,
                &["delete-security-group", "--group-id", group_id],
                "delete security group",
            )
            .await
        {
            warn!(group = group_id, error = %err, "failed to delete temporary security group");
        }
    }

    async fn describe_instances(
        &self,
        region: &str,
        filters: &[&str],
    ) -> Result<Vec<Instance>, ProviderError> {
        let mut args = vec!["describe-instances"];
        args.extend_from_slice(filters);
        let stdout = self.aws(region, &args, "describe instances").await?;
        let list: ReservationList = parse_json(&stdout, "instances")?;
        Ok(list
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .collect())
    }

    async fn instance(&self, region: &str, id: &str) -> Result<Instance, ProviderError> {
        self.describe_instances(region, &["--instance-ids", id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound {
                kind: String::from("instance"),
                name: id.to_owned(),
            })
    }

    async fn run_instance(
        &self,
        region: &str,
        request: &CreateRequest<'_>,
        image_id: &str,
        subnet: &Subnet,
        group_id: &str,
        key_name: &str,
    ) -> Result<Instance, ProviderError> {
        let spec = request.spec;
        let instance_type = spec.size.as_deref().unwrap_or(DEFAULT_INSTANCE_TYPE);
        let mut user_data = tempfile::Builder::new()
            .prefix("hart-user-data-")
            .tempfile()
            .map_err(|err| ProviderError::Config(format!("failed to stage user data: {err}")))?;
        user_data
            .write_all(request.user_data.as_bytes())
            .map_err(|err| ProviderError::Config(format!("failed to stage user data: {err}")))?;
        let user_data_arg = format!("file://{}", user_data.path().display());
        let tags = instance_tags(&spec.minion_id, &spec.tags).to_string();

        let operation = format!(
            "run instance {} in {region}/{} (type {instance_type})",
            spec.minion_id,
            spec.zone.as_deref().unwrap_or("?")
        );
        let stdout = self
            .aws(
                region,
                &[
                    "run-instances",
                    "--image-id",
                    image_id,
                    "--instance-type",
                    instance_type,
                    "--key-name",
                    key_name,
                    "--subnet-id",
                    &subnet.subnet_id,
                    "--security-group-ids",
                    group_id,
                    "--user-data",
                    &user_data_arg,
                    "--tag-specifications",
                    &tags,
                    "--count",
                    "1",
                ],
                &operation,
            )
            .await?;
        let reservation: Reservation = parse_json(&stdout, "run-instances output")?;
        reservation
            .instances
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse {
                resource: String::from("run-instances output"),
                message: String::from("no instance returned"),
            })
    }

    async fn default_group(&self, region: &str, vpc_id: &str) -> Result<String, ProviderError> {
        let vpc_filter = format!("Name=vpc-id,Values={vpc_id}");
        let stdout = self
            .aws(
                region,
                &[
                    "describe-security-groups",
                    "--filters",
                    &vpc_filter,
                    "Name=group-name,Values=default",
                ],
                "describe default security group",
            )
            .await?;
        let list: GroupList = parse_json(&stdout, "security groups")?;
        list.security_groups
            .into_iter()
            .next()
            .map(|group| group.group_id)
            .ok_or_else(|| ProviderError::NotFound {
                kind: String::from("default security group"),
                name: vpc_id.to_owned(),
            })
    }
}

fn newest_image(images: Vec<Image>) -> Option<String> {
    images
        .into_iter()
        .max_by(|a, b| a.name.cmp(&b.name))
        .map(|image| image.image_id)
}

fn select_subnet(
    subnets: Vec<Subnet>,
    zone: &str,
    requested: Option<&str>,
) -> Result<Subnet, ProviderError> {
    match (subnets.as_slice(), requested) {
        ([], Some(subnet)) => Err(ProviderError::NotFound {
            kind: String::from("subnet"),
            name: format!("{subnet} in {zone}"),
        }),
        ([], None) => Err(ProviderError::NotFound {
            kind: String::from("subnet"),
            name: format!("any subnet in {zone}"),
        }),
        ([only], _) => Ok(only.clone()),
        (many, _) => Err(ProviderError::Config(format!(
            "more than one subnet in {zone}, choose one with --subnet: {}",
            many.iter()
                .map(|subnet| subnet.subnet_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

fn ingress_permissions(cidrs: &[String]) -> serde_json::Value {
    let (v6, v4): (Vec<&String>, Vec<&String>) = cidrs.iter().partition(|cidr| cidr.contains(':'));
    json!([{
        "IpProtocol": "tcp",
        "FromPort": 22,
        "ToPort": 22,
        "IpRanges": v4.iter().map(|cidr| json!({ "CidrIp": cidr })).collect::<Vec<_>>(),
        "Ipv6Ranges": v6.iter().map(|cidr| json!({ "CidrIpv6": cidr })).collect::<Vec<_>>(),
    }])
}

fn instance_tags(minion_id: &str, extra: &[String]) -> serde_json::Value {
    let mut tags = vec![json!({ "Key": "Name", "Value": minion_id })];
    tags.extend(extra.iter().map(|tag| json!({ "Key": tag, "Value": "" })));
    json!([{ "ResourceType": "instance", "Tags": tags }])
}

fn handle_for(instance: &Instance, region: &str) -> ResourceHandle {
    let name = instance
        .tags
        .iter()
        .find(|tag| tag.key == "Name")
        .map_or_else(|| instance.instance_id.clone(), |tag| tag.value.clone());
    ResourceHandle {
        id: instance.instance_id.clone(),
        name,
        region: Some(region.to_owned()),
    }
}

fn to_size(instance_type: InstanceType) -> NodeSize {
    let disk = instance_type
        .instance_storage_info
        .map_or_else(|| String::from("EBS only"), |storage| {
            format!("{} GB instance storage", storage.total_size_in_gb)
        });
    NodeSize {
        id: instance_type.instance_type,
        cpus: instance_type.v_cpu_info.default_v_cpus,
        memory_mb: instance_type.memory_info.size_in_mi_b,
        disk,
        monthly_cost: None,
        extras: Vec::new(),
    }
}

impl<R: CommandRunner> Provider for Ec2Provider<R> {
    fn alias(&self) -> &'static str {
        "ec2"
    }

    fn login_user(&self) -> &'static str {
        "admin"
    }

    fn key_algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::Rsa2048
    }

    fn validate(&self, spec: &NodeSpec) -> Result<(), ProviderError> {
        self.region_for(spec.region.as_deref())?;
        if spec.zone.is_none() {
            return Err(ProviderError::Config(String::from(
                "you must specify the EC2 availability zone with --zone",
            )));
        }
        Ok(())
    }

    fn register_key<'a>(
        &'a self,
        name: &'a str,
        key: &'a LocalKeyPair,
    ) -> ProviderFuture<'a, RemoteKey> {
        Box::pin(async move {
            let region = self.region_for(None)?;
            let material = format!("fileb://{}", key.public_key_path());
            let stdout = self
                .aws(
                    region,
                    &[
                        "import-key-pair",
                        "--key-name",
                        name,
                        "--public-key-material",
                        &material,
                    ],
                    "import key pair",
                )
                .await?;
            let imported: ImportedKey = parse_json(&stdout, "key pair")?;
            Ok(RemoteKey::Registered {
                id: imported.key_pair_id,
                name: imported.key_name,
            })
        })
    }

    fn release_key(&self, key: RemoteKey) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if let RemoteKey::Registered { id, name } = key {
                let region = self.region_for(None)?;
                self.aws(region, &["delete-key-pair", "--key-pair-id", &id], "delete key pair")
                    .await?;
                debug!(key = %name, "deleted key pair");
            }
            Ok(())
        })
    }

    fn create_resource<'a>(
        &'a self,
        request: &'a CreateRequest<'a>,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)> {
        Box::pin(async move {
            let spec = request.spec;
            let region = self.region_for(spec.region.as_deref())?;
            let zone = spec.zone.as_deref().ok_or_else(|| {
                ProviderError::Config(String::from("an EC2 availability zone is required"))
            })?;
            let RemoteKey::Registered { name: key_name, .. } = request.key else {
                return Err(ProviderError::Config(String::from(
                    "EC2 requires an imported key pair",
                )));
            };

            let image_id = self.latest_debian_image(region, spec.release.version()).await?;
            let subnet = self.subnet_in(region, zone, spec.subnet.as_deref()).await?;
            let group_id = self
                .create_temp_group(region, &spec.minion_id, &subnet.vpc_id)
                .await?;

            match self
                .run_instance(region, request, &image_id, &subnet, &group_id, key_name)
                .await
            {
                Ok(instance) => {
                    let handle = handle_for(&instance, region);
                    info!(id = %handle.id, zone, "created instance");
                    Ok((handle, ProviderExtra::new(group_id)))
                }
                Err(err) => {
                    self.delete_group(region, &group_id).await;
                    Err(err)
                }
            }
        })
    }

    fn resolve_public_address<'a>(
        &'a self,
        handle: &'a ResourceHandle,
    ) -> ProviderFuture<'a, IpAddr> {
        Box::pin(async move {
            let region = self.region_for(handle.region.as_deref())?;
            poll_until(
                "instance public address",
                ADDRESS_POLL_INTERVAL,
                ADDRESS_WAIT_TIMEOUT,
                move || async move {
                    let instance = self.instance(region, &handle.id).await?;
                    Ok(instance
                        .public_ip_address
                        .as_deref()
                        .and_then(usable_address))
                },
            )
            .await
        })
    }

    fn destroy_resource<'a>(
        &'a self,
        handle: &'a ResourceHandle,
        extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let region = self.region_for(handle.region.as_deref())?;
            self.aws(
                region,
                &["terminate-instances", "--instance-ids", &handle.id],
                "terminate instance",
            )
            .await?;
            info!(id = %handle.id, "terminated instance");
            if let Some(group_id) = extra.get() {
                // The group stays in use until the instance is gone.
                let wait = self
                    .command(region)
                    .args(["wait", "instance-terminated", "--instance-ids", handle.id.as_str()])
                    .timeout(Some(TERMINATE_WAIT));
                let output = self.runner.run(&wait).await?;
                check_cli_output(&self.config.aws_bin, "wait for termination", output)?;
                self.aws(
                    region,
                    &["delete-security-group", "--group-id", group_id],
                    "delete security group",
                )
                .await?;
            }
            Ok(())
        })
    }

    fn find_resource<'a>(
        &'a self,
        minion_id: &'a str,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)> {
        Box::pin(async move {
            let region = self.region_for(None)?;
            let name_filter = format!("Name=tag:Name,Values={minion_id}");
            let state_filter = format!("Name=instance-state-name,Values={LIVE_STATES}");
            let instances = self
                .describe_instances(region, &["--filters", &name_filter, &state_filter])
                .await?;
            instances
                .first()
                .map(|instance| {
                    let extra = instance
                        .temp_group(minion_id)
                        .map_or_else(ProviderExtra::none, ProviderExtra::new);
                    (handle_for(instance, region), extra)
                })
                .ok_or_else(|| ProviderError::NotFound {
                    kind: String::from("instance"),
                    name: minion_id.to_owned(),
                })
        })
    }

    fn on_post_connect<'a, S: CommandRunner + 'a>(
        &'a self,
        node: &'a ProvisionedNode,
        _session: &'a mut SshSession<S>,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let Some(group_id) = node.extra.get() else {
                return Ok(());
            };
            let region = self.region_for(node.handle.region.as_deref())?;
            let instance = self.instance(region, &node.handle.id).await?;
            let vpc_id = instance.vpc_id.ok_or_else(|| ProviderError::NotFound {
                kind: String::from("VPC"),
                name: node.handle.id.clone(),
            })?;
            let default_group = self.default_group(region, &vpc_id).await?;
            self.aws(
                region,
                &[
                    "modify-instance-attribute",
                    "--instance-id",
                    &node.handle.id,
                    "--groups",
                    &default_group,
                ],
                "attach default security group",
            )
            .await?;
            self.aws(
                region,
                &["delete-security-group", "--group-id", group_id],
                "delete security group",
            )
            .await?;
            info!(group = group_id, "removed temporary security group");
            Ok(())
        })
    }

    fn list_sizes(&self) -> ProviderFuture<'_, Vec<NodeSize>> {
        Box::pin(async move {
            let region = self.region_for(None)?;
            let stdout = self
                .aws(region, &["describe-instance-types"], "describe instance types")
                .await?;
            let list: InstanceTypeList = parse_json(&stdout, "instance types")?;
            let mut sizes: Vec<NodeSize> = list.instance_types.into_iter().map(to_size).collect();
            sizes.sort_by(|a, b| (a.cpus, a.memory_mb, &a.id).cmp(&(b.cpus, b.memory_mb, &b.id)));
            Ok(sizes)
        })
    }

    fn list_regions(&self, include_zones: bool) -> ProviderFuture<'_, Vec<Region>> {
        Box::pin(async move {
            let home = self.region_for(None).unwrap_or("us-east-1");
            let stdout = self
                .aws(home, &["describe-regions"], "describe regions")
                .await?;
            let list: RegionList = parse_json(&stdout, "regions")?;
            let mut regions = Vec::with_capacity(list.regions.len());
            for region in list.regions {
                let zones = if include_zones {
                    let stdout = self
                        .aws(
                            &region.region_name,
                            &["describe-availability-zones"],
                            "describe availability zones",
                        )
                        .await?;
                    let zones: ZoneList = parse_json(&stdout, "availability zones")?;
                    zones
                        .availability_zones
                        .into_iter()
                        .map(|zone| zone.zone_name)
                        .collect()
                } else {
                    Vec::new()
                };
                regions.push(Region {
                    id: region.region_name.clone(),
                    name: region.region_name,
                    zones,
                });
            }
            regions.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(regions)
        })
    }
}
