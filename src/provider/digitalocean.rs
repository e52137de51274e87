//! DigitalOcean droplets over the v2 REST API.

use std::net::IpAddr;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::ssh::LocalKeyPair;

use super::http::ApiClient;
use super::{
    ADDRESS_POLL_INTERVAL, ADDRESS_WAIT_TIMEOUT, CreateRequest, NodeSize, NodeSpec, Provider,
    ProviderError, ProviderExtra, ProviderFuture, Region, RemoteKey, ResourceHandle, poll_until,
    usable_address,
};

const DEFAULT_API_URL: &str = "https://api.digitalocean.com/v2";
const DEFAULT_SIZE: &str = "s-1vcpu-1gb";
const PAGE_SIZE: u32 = 200;

/// `[providers.do]` section.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct DigitalOceanConfig {
    /// Personal access token.
    pub token: String,
    /// API endpoint, overridable for testing.
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl std::fmt::Debug for DigitalOceanConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOceanConfig")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_owned()
}

/// DigitalOcean provider.
#[derive(Clone, Debug)]
pub struct DigitalOceanProvider {
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct KeyEnvelope {
    ssh_key: ApiKey,
}

#[derive(Debug, Deserialize)]
struct ApiKey {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct DropletList {
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    #[serde(default)]
    networks: Networks,
    region: Option<DropletRegion>,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<Network>,
}

#[derive(Debug, Deserialize)]
struct Network {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct DropletRegion {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct SizeList {
    sizes: Vec<ApiSize>,
}

#[derive(Debug, Deserialize)]
struct ApiSize {
    slug: String,
    memory: u64,
    vcpus: u32,
    disk: u64,
    price_monthly: f64,
    #[serde(default = "available")]
    available: bool,
}

#[derive(Debug, Deserialize)]
struct RegionList {
    regions: Vec<ApiRegion>,
}

#[derive(Debug, Deserialize)]
struct ApiRegion {
    slug: String,
    name: String,
    #[serde(default = "available")]
    available: bool,
}

const fn available() -> bool {
    true
}

impl DigitalOceanProvider {
    /// Builds the provider from its configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the token is blank.
    pub fn new(config: DigitalOceanConfig) -> Result<Self, ConfigError> {
        if config.token.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from(
                "providers.do.token",
            )));
        }
        Ok(Self {
            api: ApiClient::new(config.api_url.trim_end_matches('/'), config.token.trim()),
        })
    }

    async fn droplet(&self, id: &str) -> Result<Droplet, ProviderError> {
        let envelope: DropletEnvelope = self
            .api
            .get(&format!("/droplets/{id}"), "get droplet")
            .await?;
        Ok(envelope.droplet)
    }
}

fn public_address(droplet: &Droplet) -> Option<IpAddr> {
    droplet
        .networks
        .v4
        .iter()
        .filter(|network| network.kind == "public")
        .find_map(|network| usable_address(&network.ip_address))
}

fn handle_for(droplet: &Droplet) -> ResourceHandle {
    ResourceHandle {
        id: droplet.id.to_string(),
        name: droplet.name.clone(),
        region: droplet.region.as_ref().map(|region| region.slug.clone()),
    }
}

fn to_size(size: ApiSize) -> NodeSize {
    NodeSize {
        id: size.slug,
        cpus: size.vcpus,
        memory_mb: size.memory,
        disk: format!("{} GB SSD", size.disk),
        monthly_cost: Some(size.price_monthly),
        extras: Vec::new(),
    }
}

fn create_body(request: &CreateRequest<'_>) -> Result<serde_json::Value, ProviderError> {
    let spec = request.spec;
    let key_id = match request.key {
        RemoteKey::Registered { id, .. } => id
            .parse::<u64>()
            .map_or_else(|_| serde_json::Value::from(id.as_str()), serde_json::Value::from),
        RemoteKey::Inline { .. } => {
            return Err(ProviderError::Config(String::from(
                "DigitalOcean requires a registered SSH key",
            )));
        }
    };
    Ok(json!({
        "name": spec.minion_id,
        "region": spec.region,
        "size": spec.size.as_deref().unwrap_or(DEFAULT_SIZE),
        "image": format!("debian-{}-x64", spec.release.version()),
        "ssh_keys": [key_id],
        "user_data": request.user_data,
        "private_networking": spec.private_networking,
        "tags": spec.tags,
    }))
}

impl Provider for DigitalOceanProvider {
    fn alias(&self) -> &'static str {
        "do"
    }

    fn validate(&self, spec: &NodeSpec) -> Result<(), ProviderError> {
        if spec.region.is_none() {
            return Err(ProviderError::Config(String::from(
                "a region is required for DigitalOcean",
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
            let body = json!({ "name": name, "public_key": key.public_key() });
            let envelope: KeyEnvelope = self
                .api
                .post("/account/keys", &body, "register SSH key")
                .await?;
            Ok(RemoteKey::Registered {
                id: envelope.ssh_key.id.to_string(),
                name: envelope.ssh_key.name,
            })
        })
    }

    fn release_key(&self, key: RemoteKey) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if let RemoteKey::Registered { id, name } = key {
                self.api
                    .delete(&format!("/account/keys/{id}"), "delete SSH key")
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
            let body = create_body(request)?;
            let operation = format!(
                "create droplet {} in {} (size {})",
                request.spec.minion_id,
                request.spec.region.as_deref().unwrap_or("?"),
                request.spec.size.as_deref().unwrap_or(DEFAULT_SIZE)
            );
            let envelope: DropletEnvelope = self.api.post("/droplets", &body, &operation).await?;
            let handle = handle_for(&envelope.droplet);
            info!(id = %handle.id, name = %handle.name, "created droplet");
            Ok((handle, ProviderExtra::none()))
        })
    }

    fn resolve_public_address<'a>(
        &'a self,
        handle: &'a ResourceHandle,
    ) -> ProviderFuture<'a, IpAddr> {
        Box::pin(async move {
            poll_until(
                "droplet public address",
                ADDRESS_POLL_INTERVAL,
                ADDRESS_WAIT_TIMEOUT,
                move || async move { Ok(public_address(&self.droplet(&handle.id).await?)) },
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
            match self
                .api
                .delete(&format!("/droplets/{}", handle.id), "delete droplet")
                .await
            {
                Ok(()) => {
                    info!(id = %handle.id, "deleted droplet");
                    Ok(())
                }
                Err(ProviderError::NotFound { .. }) => {
                    warn!(id = %handle.id, "droplet already gone");
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
            let list: DropletList = self
                .api
                .get(&format!("/droplets?per_page={PAGE_SIZE}"), "list droplets")
                .await?;
            list.droplets
                .iter()
                .find(|droplet| droplet.name == minion_id)
                .map(|droplet| (handle_for(droplet), ProviderExtra::none()))
                .ok_or_else(|| ProviderError::NotFound {
                    kind: String::from("droplet"),
                    name: minion_id.to_owned(),
                })
        })
    }

    fn list_sizes(&self) -> ProviderFuture<'_, Vec<NodeSize>> {
        Box::pin(async move {
            let list: SizeList = self
                .api
                .get(&format!("/sizes?per_page={PAGE_SIZE}"), "list sizes")
                .await?;
            Ok(list
                .sizes
                .into_iter()
                .filter(|size| size.available)
                .map(to_size)
                .collect())
        })
    }

    fn list_regions(&self, _include_zones: bool) -> ProviderFuture<'_, Vec<Region>> {
        Box::pin(async move {
            let list: RegionList = self
                .api
                .get(&format!("/regions?per_page={PAGE_SIZE}"), "list regions")
                .await?;
            let mut regions: Vec<Region> = list
                .regions
                .into_iter()
                .filter(|region| region.available)
                .map(|region| Region {
                    id: region.slug,
                    name: region.name,
                    zones: Vec::new(),
                })
                .collect();
            regions.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(regions)
        })
    }
}
