//! Vultr instances over the v2 REST API.
//!
//! Vultr ignores cloud-init user data for Debian images, so the payload is
//! uploaded as a boot startup script. The script id travels as the node's
//! [`ProviderExtra`] and is deleted once the instance has read it.

use std::net::IpAddr;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapWait, COMPLETION_LOG, wait_for_sentinel};
use crate::config::ConfigError;
use crate::exec::CommandRunner;
use crate::ssh::{LocalKeyPair, RemoteCommand, SshSession};

use super::http::ApiClient;
use super::{
    ADDRESS_POLL_INTERVAL, ADDRESS_WAIT_TIMEOUT, CreateRequest, NodeSize, NodeSpec, Provider,
    ProviderError, ProviderExtra, ProviderFuture, ProvisionedNode, Region, RemoteKey,
    ResourceHandle, poll_until, usable_address,
};

const DEFAULT_API_URL: &str = "https://api.vultr.com/v2";
const DEFAULT_PLAN: &str = "vc2-1c-1gb";
const PENDING: &str = "pending";
const DESTROY_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DESTROY_WAIT_TIMEOUT: Duration = Duration::from_secs(180);
const PRIVATE_INTERFACE_FILE: &str = "/etc/network/interfaces.d/20-hart-private-ip";

/// `[providers.vultr]` section.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct VultrConfig {
    /// API key.
    pub token: String,
    /// API endpoint, overridable for testing.
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl std::fmt::Debug for VultrConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VultrConfig")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_owned()
}

/// Vultr provider.
#[derive(Clone, Debug)]
pub struct VultrProvider {
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct KeyEnvelope {
    ssh_key: ApiKey,
}

#[derive(Debug, Deserialize)]
struct ApiKey {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ScriptEnvelope {
    startup_script: Script,
}

#[derive(Debug, Deserialize)]
struct Script {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OsList {
    os: Vec<OperatingSystem>,
}

#[derive(Debug, Deserialize)]
struct OperatingSystem {
    id: u64,
    name: String,
    arch: String,
    family: String,
}

#[derive(Debug, Deserialize)]
struct InstanceEnvelope {
    instance: Instance,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct Instance {
    id: String,
    label: String,
    #[serde(default)]
    main_ip: String,
    #[serde(default)]
    status: String,
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VpcAttachments {
    vpcs: Vec<VpcAttachment>,
}

#[derive(Debug, Deserialize)]
struct VpcAttachment {
    id: String,
    mac_address: String,
    ip_address: String,
}

#[derive(Debug, Deserialize)]
struct VpcEnvelope {
    vpc: Vpc,
}

#[derive(Debug, Deserialize)]
struct Vpc {
    v4_subnet_mask: u8,
}

#[derive(Debug, Deserialize)]
struct PlanList {
    plans: Vec<Plan>,
}

#[derive(Debug, Deserialize)]
struct Plan {
    id: String,
    vcpu_count: u32,
    ram: u64,
    disk: u64,
    #[serde(default = "one")]
    disk_count: u32,
    monthly_cost: f64,
}

const fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct RegionList {
    regions: Vec<ApiRegion>,
}

#[derive(Debug, Deserialize)]
struct ApiRegion {
    id: String,
    city: String,
    country: String,
}

impl VultrProvider {
    /// Builds the provider from its configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the token is blank.
    pub fn new(config: VultrConfig) -> Result<Self, ConfigError> {
        if config.token.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from(
                "providers.vultr.token",
            )));
        }
        Ok(Self {
            api: ApiClient::new(config.api_url.trim_end_matches('/'), config.token.trim()),
        })
    }

    async fn instance(&self, id: &str) -> Result<Instance, ProviderError> {
        let envelope: InstanceEnvelope = self
            .api
            .get(&format!("/instances/{id}"), "get instance")
            .await?;
        Ok(envelope.instance)
    }

    async fn debian_os_id(&self, spec: &NodeSpec) -> Result<u64, ProviderError> {
        let list: OsList = self.api.get("/os?per_page=500", "list images").await?;
        find_debian_image(&list.os, spec.release.version(), spec.release.codename()).ok_or_else(
            || ProviderError::NotFound {
                kind: String::from("Debian image"),
                name: spec.release.codename().to_owned(),
            },
        )
    }

    async fn create_startup_script(
        &self,
        minion_id: &str,
        payload: &str,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "name": format!(
                "hart-temp-script-for-{minion_id}-{}",
                Utc::now().format("%Y-%m-%dT%H-%M-%S")
            ),
            "type": "boot",
            "script": STANDARD.encode(payload),
        });
        let envelope: ScriptEnvelope = self
            .api
            .post("/startup-scripts", &body, "create startup script")
            .await?;
        debug!(script = %envelope.startup_script.id, "created startup script");
        Ok(envelope.startup_script.id)
    }

    /// Deletes the startup script, if any. Failures are logged; a leftover
    /// script is harmless.
    async fn delete_startup_script(&self, extra: &ProviderExtra) {
        let Some(script_id) = extra.get() else {
            return;
        };
        match self
            .api
            .delete(&format!("/startup-scripts/{script_id}"), "delete startup script")
            .await
        {
            Ok(()) | Err(ProviderError::NotFound { .. }) => {
                debug!(script = script_id, "deleted startup script");
            }
            Err(err) => warn!(script = script_id, error = %err, "failed to delete startup script"),
        }
    }

    async fn configure_private_interface<R: CommandRunner>(
        &self,
        node: &ProvisionedNode,
        session: &mut SshSession<R>,
    ) -> Result<(), ProviderError> {
        let attachments: VpcAttachments = self
            .api
            .get(&format!("/instances/{}/vpcs", node.handle.id), "list instance VPCs")
            .await?;
        let attachment = attachments
            .vpcs
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound {
                kind: String::from("VPC attachment"),
                name: node.handle.id.clone(),
            })?;
        let vpc: VpcEnvelope = self
            .api
            .get(&format!("/vpcs/{}", attachment.id), "get VPC")
            .await?;

        let links = session.run(&RemoteCommand::new("ip -o link")).await?;
        let device = device_for_mac(&links, &attachment.mac_address).ok_or_else(|| {
            ProviderError::NotFound {
                kind: String::from("network interface"),
                name: attachment.mac_address.clone(),
            }
        })?;
        let stanza = interface_stanza(&device, &attachment.ip_address, vpc.vpc.v4_subnet_mask);
        session
            .run(
                &RemoteCommand::new(format!("cat > {PRIVATE_INTERFACE_FILE}"))
                    .stdin(stanza)
                    .privileged(),
            )
            .await?;
        session
            .run(&RemoteCommand::new(format!("ifup {device}")).privileged())
            .await?;
        info!(device = %device, address = %attachment.ip_address, "configured private interface");
        Ok(())
    }
}

fn find_debian_image(images: &[OperatingSystem], version: u8, codename: &str) -> Option<u64> {
    let numbered = format!("Debian {version} ");
    images
        .iter()
        .filter(|os| os.family == "debian" && os.arch == "x64")
        .find(|os| os.name.starts_with(&numbered) || os.name.contains(codename))
        .map(|os| os.id)
}

/// Finds the interface carrying `mac` in `ip -o link` output.
fn device_for_mac(links: &str, mac: &str) -> Option<String> {
    let needle = mac.to_ascii_lowercase();
    links
        .lines()
        .find(|line| line.to_ascii_lowercase().contains(&needle))
        .and_then(|line| line.split(':').nth(1))
        .map(|name| name.trim().trim_end_matches("@NONE").to_owned())
        .filter(|name| !name.is_empty())
}

fn interface_stanza(device: &str, address: &str, prefix: u8) -> String {
    format!("auto {device}\niface {device} inet static\n    address {address}/{prefix}\n    mtu 1450\n")
}

fn ready_address(instance: &Instance) -> Option<IpAddr> {
    if instance.status == PENDING {
        return None;
    }
    usable_address(&instance.main_ip)
}

fn handle_for(instance: &Instance) -> ResourceHandle {
    ResourceHandle {
        id: instance.id.clone(),
        name: instance.label.clone(),
        region: instance.region.clone(),
    }
}

fn to_size(plan: Plan) -> NodeSize {
    let disk = if plan.disk_count > 1 {
        format!("{}x{} GB SSD", plan.disk_count, plan.disk)
    } else {
        format!("{} GB SSD", plan.disk)
    };
    NodeSize {
        id: plan.id,
        cpus: plan.vcpu_count,
        memory_mb: plan.ram,
        disk,
        monthly_cost: Some(plan.monthly_cost),
        extras: Vec::new(),
    }
}

impl Provider for VultrProvider {
    fn alias(&self) -> &'static str {
        "vultr"
    }

    fn validate(&self, spec: &NodeSpec) -> Result<(), ProviderError> {
        if spec.region.is_none() {
            return Err(ProviderError::Config(String::from(
                "a region is required for Vultr",
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
            let body = json!({ "name": name, "ssh_key": key.public_key() });
            let envelope: KeyEnvelope = self
                .api
                .post("/ssh-keys", &body, "register SSH key")
                .await?;
            Ok(RemoteKey::Registered {
                id: envelope.ssh_key.id,
                name: envelope.ssh_key.name,
            })
        })
    }

    fn release_key(&self, key: RemoteKey) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if let RemoteKey::Registered { id, name } = key {
                self.api
                    .delete(&format!("/ssh-keys/{id}"), "delete SSH key")
                    .await?;
                debug!(key = %name, "deleted SSH key");
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
            let RemoteKey::Registered { id: key_id, .. } = request.key else {
                return Err(ProviderError::Config(String::from(
                    "Vultr requires a registered SSH key",
                )));
            };
            let os_id = self.debian_os_id(spec).await?;
            let plan = spec.size.as_deref().unwrap_or(DEFAULT_PLAN);
            let script_id = self
                .create_startup_script(&spec.minion_id, request.user_data)
                .await?;
            let extra = ProviderExtra::new(script_id.clone());

            let body = json!({
                "region": spec.region,
                "plan": plan,
                "os_id": os_id,
                "sshkey_id": [key_id],
                "script_id": script_id,
                "label": spec.minion_id,
                "hostname": spec.minion_id,
                "tags": spec.tags,
                "enable_vpc": spec.private_networking,
                "activation_email": false,
            });
            let operation = format!(
                "create instance {} in {} (plan {plan})",
                spec.minion_id,
                spec.region.as_deref().unwrap_or("?")
            );
            match self
                .api
                .post::<_, InstanceEnvelope>("/instances", &body, &operation)
                .await
            {
                Ok(envelope) => {
                    let handle = handle_for(&envelope.instance);
                    info!(id = %handle.id, name = %handle.name, "created instance");
                    Ok((handle, extra))
                }
                Err(err) => {
                    self.delete_startup_script(&extra).await;
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
            poll_until(
                "instance public address",
                ADDRESS_POLL_INTERVAL,
                ADDRESS_WAIT_TIMEOUT,
                move || async move { Ok(ready_address(&self.instance(&handle.id).await?)) },
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
            self.delete_startup_script(extra).await;
            // Instances still initializing reject deletion.
            let settled = poll_until(
                "instance to finish initializing",
                DESTROY_POLL_INTERVAL,
                DESTROY_WAIT_TIMEOUT,
                move || async move {
                    match self.instance(&handle.id).await {
                        Ok(instance) => Ok((instance.status != PENDING).then_some(true)),
                        Err(ProviderError::NotFound { .. }) => Ok(Some(false)),
                        Err(err) => Err(err),
                    }
                },
            )
            .await?;
            if !settled {
                warn!(id = %handle.id, "instance already gone");
                return Ok(());
            }
            self.api
                .delete(&format!("/instances/{}", handle.id), "delete instance")
                .await?;
            info!(id = %handle.id, "deleted instance");
            Ok(())
        })
    }

    fn find_resource<'a>(
        &'a self,
        minion_id: &'a str,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)> {
        Box::pin(async move {
            let list: InstanceList = self
                .api
                .get(&format!("/instances?label={minion_id}"), "list instances")
                .await?;
            list.instances
                .iter()
                .find(|instance| instance.label == minion_id)
                .map(|instance| (handle_for(instance), ProviderExtra::none()))
                .ok_or_else(|| ProviderError::NotFound {
                    kind: String::from("instance"),
                    name: minion_id.to_owned(),
                })
        })
    }

    fn wait_for_bootstrap<'a, R: CommandRunner + 'a>(
        &'a self,
        session: &'a mut SshSession<R>,
        extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            // The node has booted by now, so the script has been read.
            self.delete_startup_script(extra).await;
            wait_for_sentinel(session, COMPLETION_LOG, BootstrapWait::default()).await
        })
    }

    fn on_post_connect<'a, R: CommandRunner + 'a>(
        &'a self,
        node: &'a ProvisionedNode,
        session: &'a mut SshSession<R>,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            if node.private_networking {
                self.configure_private_interface(node, session).await?;
            }
            Ok(())
        })
    }

    fn list_sizes(&self) -> ProviderFuture<'_, Vec<NodeSize>> {
        Box::pin(async move {
            let list: PlanList = self.api.get("/plans?per_page=500", "list plans").await?;
            Ok(list.plans.into_iter().map(to_size).collect())
        })
    }

    fn list_regions(&self, _include_zones: bool) -> ProviderFuture<'_, Vec<Region>> {
        Box::pin(async move {
            let list: RegionList = self.api.get("/regions?per_page=500", "list regions").await?;
            let mut regions: Vec<Region> = list
                .regions
                .into_iter()
                .map(|region| Region {
                    id: region.id,
                    name: format!("{}, {}", region.city, region.country),
                    zones: Vec::new(),
                })
                .collect();
            regions.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(regions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn instance(status: &str, main_ip: &str) -> Instance {
        Instance {
            id: String::from("abc"),
            label: String::from("web"),
            main_ip: main_ip.to_owned(),
            status: status.to_owned(),
            region: Some(String::from("ewr")),
        }
    }

    #[rstest]
    #[case("pending", "203.0.113.4", None)]
    #[case("active", "0.0.0.0", None)]
    #[case("active", "203.0.113.4", "203.0.113.4".parse().ok())]
    fn address_requires_settled_instance(
        #[case] status: &str,
        #[case] main_ip: &str,
        #[case] expected: Option<IpAddr>,
    ) {
        assert_eq!(ready_address(&instance(status, main_ip)), expected);
    }

    #[rstest]
    fn finds_debian_image_by_version() {
        let images: Vec<OperatingSystem> = serde_json::from_str(
            r#"[
                {"id": 1, "name": "Debian 11 x64 (bullseye)", "arch": "x64", "family": "debian"},
                {"id": 2, "name": "Debian 12 i386 (bookworm)", "arch": "i386", "family": "debian"},
                {"id": 3, "name": "Debian 12 x64 (bookworm)", "arch": "x64", "family": "debian"}
            ]"#,
        )
        .expect("images");
        assert_eq!(find_debian_image(&images, 12, "bookworm"), Some(3));
        assert_eq!(find_debian_image(&images, 9, "stretch"), None);
    }

    #[rstest]
    fn locates_device_by_mac() {
        let links = "1: lo: <LOOPBACK,UP> mtu 65536 link/loopback 00:00:00:00:00:00\n\
                     2: enp1s0: <BROADCAST,UP> mtu 1500 link/ether 56:00:04:aa:bb:01\n\
                     3: enp6s0: <BROADCAST> mtu 1500 link/ether 5A:01:04:AA:BB:02\n";
        assert_eq!(
            device_for_mac(links, "5a:01:04:aa:bb:02").as_deref(),
            Some("enp6s0")
        );
        assert_eq!(device_for_mac(links, "ff:ff:ff:ff:ff:ff"), None);
    }

    #[rstest]
    fn private_interface_stanza_is_static() {
        assert_eq!(
            interface_stanza("enp6s0", "10.1.96.3", 20),
            "auto enp6s0\niface enp6s0 inet static\n    address 10.1.96.3/20\n    mtu 1450\n"
        );
    }

    #[rstest]
    fn multi_disk_plans_show_disk_count() {
        let size = to_size(Plan {
            id: String::from("vbm-4c-32gb"),
            vcpu_count: 4,
            ram: 32768,
            disk: 240,
            disk_count: 2,
            monthly_cost: 120.0,
        });
        assert_eq!(size.disk, "2x240 GB SSD");
    }
}
