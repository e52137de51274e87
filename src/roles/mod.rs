//! Role profiles: turning a `[roles.<name>]` entry into a [`NodeSpec`].
//!
//! Settings are layered, later layers winning:
//!
//! 1. `[hart]`
//! 2. `[roles.<role>]`
//! 3. `[roles.<role>.<provider>]`
//! 4. `[roles.<role>.<provider>.<region>]`
//! 5. command-line overrides
//!
//! Nested tables such as `minion_config` are merged key by key rather than
//! replaced.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ortho_config::toml;
use rand::RngCore;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::bootstrap::DebianRelease;
use crate::config::{ConfigError, HartConfig};
use crate::provider::{NodeSpec, PROVIDER_ALIASES};
use crate::token::unique_id;

/// Minion id template used when no `role_naming_scheme` is configured.
pub const DEFAULT_NAMING_SCHEME: &str = "{unique_id}.{region}.{provider}.{role}";

const TABLE_SETTINGS: [&str; 1] = ["minion_config"];
const KNOWN_SETTINGS: [&str; 12] = [
    "provider",
    "region",
    "size",
    "salt_branch",
    "tags",
    "private_networking",
    "debian_codename",
    "zone",
    "subnet",
    "saltmaster",
    "minion_config",
    "role_naming_scheme",
];

/// Command-line values that override every configured layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoleOverrides {
    /// Size slug.
    pub size: Option<String>,
    /// Salt bootstrap branch.
    pub salt_branch: Option<String>,
    /// Resource tags.
    pub tags: Option<Vec<String>>,
    /// Attach a private network interface.
    pub private_networking: Option<bool>,
    /// Debian codename.
    pub debian_codename: Option<String>,
    /// Availability zone.
    pub zone: Option<String>,
    /// Subnet name or id.
    pub subnet: Option<String>,
    /// Minion configuration merged over everything else.
    pub minion_config: Option<Map<String, Value>>,
}

impl RoleOverrides {
    fn into_layer(self) -> (toml::value::Table, Option<Map<String, Value>>) {
        let mut layer = toml::value::Table::new();
        let strings = [
            ("size", self.size),
            ("salt_branch", self.salt_branch),
            ("debian_codename", self.debian_codename),
            ("zone", self.zone),
            ("subnet", self.subnet),
        ];
        for (key, value) in strings {
            if let Some(text) = value {
                layer.insert(key.to_owned(), toml::Value::String(text));
            }
        }
        if let Some(tags) = self.tags {
            layer.insert(
                String::from("tags"),
                toml::Value::Array(tags.into_iter().map(toml::Value::String).collect()),
            );
        }
        if let Some(flag) = self.private_networking {
            layer.insert(String::from("private_networking"), toml::Value::Boolean(flag));
        }
        (layer, self.minion_config)
    }
}

/// Outcome of resolving a role.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRole {
    /// Provider alias the node should be created with.
    pub provider: String,
    /// Fully resolved node request.
    pub spec: NodeSpec,
}

/// Resolves `role` into a provider alias and node specification.
///
/// `provider_alias` and `cli_region` come from the command line and take
/// precedence over configured values. `rng` supplies the `{unique_id}`
/// placeholder and `now` the date placeholders.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownRole`] when the role is not defined,
/// [`ConfigError::MissingField`] when no provider can be determined,
/// [`ConfigError::InvalidTemplate`] when the naming scheme uses an unknown
/// placeholder and [`ConfigError::InvalidValue`] when a setting has the
/// wrong type.
pub fn resolve_role(
    config: &HartConfig,
    role: &str,
    provider_alias: Option<&str>,
    cli_region: Option<&str>,
    overrides: RoleOverrides,
    rng: &mut impl RngCore,
    now: DateTime<Utc>,
) -> Result<ResolvedRole, ConfigError> {
    let roles = config.roles()?;
    let Some(toml::Value::Table(role_table)) = roles.get(role) else {
        return Err(unknown_role(role, &roles));
    };

    let mut merged = config.hart_section()?;
    let provider = provider_alias
        .map(str::to_owned)
        .or_else(|| string_at(&merged, "provider"))
        .or_else(|| string_at(role_table, "provider"))
        .ok_or_else(|| ConfigError::MissingField(String::from("provider")))?;

    merge_layer(&mut merged, role_table, &|key, value| {
        value.is_table() && PROVIDER_ALIASES.contains(&key)
    });
    let provider_table = optional_table(role_table, &provider, role)?;
    if let Some(table) = &provider_table {
        merge_layer(&mut merged, table, &is_nested_section);
    }

    let region = cli_region
        .map(str::to_owned)
        .or_else(|| string_at(&merged, "region"));
    if let (Some(table), Some(name)) = (&provider_table, &region)
        && let Some(region_table) = optional_table(table, name, role)?
    {
        merge_layer(&mut merged, &region_table, &|_, _| false);
    }

    let (cli_layer, cli_minion_config) = overrides.into_layer();
    merge_layer(&mut merged, &cli_layer, &|_, _| false);
    merged.remove("provider");
    merged.remove("region");

    for key in merged.keys() {
        if !KNOWN_SETTINGS.contains(&key.as_str()) {
            debug!(role, setting = %key, "ignoring unrecognised role setting");
        }
    }

    let settings = Settings::extract(&merged)?;
    let minion_config = minion_config(
        role,
        &provider,
        region.as_deref(),
        &settings,
        &merged,
        cli_minion_config,
    )?;

    let mut variables = template_variables(&merged);
    variables.insert("role", role.to_owned());
    variables.insert("provider", provider.clone());
    if let Some(name) = &region {
        variables.insert("region", name.clone());
    }
    variables.insert("unique_id", unique_id(rng));
    variables.insert("year", now.format("%Y").to_string());
    variables.insert("month", now.format("%m").to_string());
    variables.insert("day", now.format("%d").to_string());
    let scheme = settings
        .naming_scheme
        .as_deref()
        .unwrap_or(DEFAULT_NAMING_SCHEME);
    let minion_id = render_minion_id(scheme, &variables)?;
    debug!(role, provider = %provider, minion_id = %minion_id, "resolved role");

    let spec = NodeSpec::builder(minion_id)
        .region(region)
        .size(settings.size)
        .release(settings.release)
        .salt_branch(settings.salt_branch)
        .tags(settings.tags)
        .private_networking(settings.private_networking)
        .zone(settings.zone)
        .subnet(settings.subnet)
        .minion_config(minion_config)
        .build()?;
    Ok(ResolvedRole { provider, spec })
}

fn unknown_role(role: &str, roles: &toml::value::Table) -> ConfigError {
    let detail = if roles.is_empty() {
        String::from("no roles defined in config")
    } else {
        let known: Vec<String> = roles.keys().map(|name| format!("'{name}'")).collect();
        format!("must be one of {}", known.join(", "))
    };
    ConfigError::UnknownRole {
        role: role.to_owned(),
        detail,
    }
}

/// Provider-level tables hold region sections as sub-tables; only the
/// well-known table settings belong to the layer itself.
fn is_nested_section(key: &str, value: &toml::Value) -> bool {
    value.is_table() && !TABLE_SETTINGS.contains(&key)
}

fn merge_layer(
    target: &mut toml::value::Table,
    layer: &toml::value::Table,
    skip: &dyn Fn(&str, &toml::Value) -> bool,
) {
    for (key, value) in layer {
        if skip(key, value) {
            continue;
        }
        if let toml::Value::Table(incoming) = value
            && let Some(toml::Value::Table(existing)) = target.get_mut(key)
        {
            merge_layer(existing, incoming, &|_, _| false);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

fn optional_table(
    parent: &toml::value::Table,
    key: &str,
    role: &str,
) -> Result<Option<toml::value::Table>, ConfigError> {
    match parent.get(key) {
        None => Ok(None),
        Some(toml::Value::Table(table)) => Ok(Some(table.clone())),
        Some(_) => Err(ConfigError::InvalidStructure(format!(
            "[roles.{role}] entry '{key}' must be a table"
        ))),
    }
}

fn string_at(table: &toml::value::Table, key: &str) -> Option<String> {
    table.get(key).and_then(toml::Value::as_str).map(str::to_owned)
}

/// Typed view of the merged settings.
#[derive(Debug, Default)]
struct Settings {
    size: Option<String>,
    salt_branch: Option<String>,
    tags: Vec<String>,
    private_networking: bool,
    release: DebianRelease,
    zone: Option<String>,
    subnet: Option<String>,
    saltmaster: Option<String>,
    naming_scheme: Option<String>,
}

impl Settings {
    fn extract(merged: &toml::value::Table) -> Result<Self, ConfigError> {
        let release = text(merged, "debian_codename")?
            .map(|codename| {
                codename
                    .parse::<DebianRelease>()
                    .map_err(|message| ConfigError::InvalidValue {
                        field: String::from("debian_codename"),
                        message,
                    })
            })
            .transpose()?
            .unwrap_or_default();
        let private_networking = match merged.get("private_networking") {
            None => false,
            Some(toml::Value::Boolean(flag)) => *flag,
            Some(_) => return Err(wrong_type("private_networking", "a boolean")),
        };
        Ok(Self {
            size: text(merged, "size")?,
            salt_branch: text(merged, "salt_branch")?,
            tags: tags(merged)?,
            private_networking,
            release,
            zone: text(merged, "zone")?,
            subnet: text(merged, "subnet")?,
            saltmaster: text(merged, "saltmaster")?,
            naming_scheme: text(merged, "role_naming_scheme")?,
        })
    }
}

fn wrong_type(field: &str, expected: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        message: format!("must be {expected}"),
    }
}

fn text(merged: &toml::value::Table, key: &str) -> Result<Option<String>, ConfigError> {
    match merged.get(key) {
        None => Ok(None),
        Some(toml::Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(wrong_type(key, "a string")),
    }
}

/// Tags may be a TOML array or a comma separated string.
fn tags(merged: &toml::value::Table) -> Result<Vec<String>, ConfigError> {
    match merged.get("tags") {
        None => Ok(Vec::new()),
        Some(toml::Value::String(list)) => Ok(list.split(',').map(str::to_owned).collect()),
        Some(toml::Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| wrong_type("tags", "a list of strings"))
            })
            .collect(),
        Some(_) => Err(wrong_type("tags", "a list of strings")),
    }
}

fn minion_config(
    role: &str,
    provider: &str,
    region: Option<&str>,
    settings: &Settings,
    merged: &toml::value::Table,
    cli: Option<Map<String, Value>>,
) -> Result<Map<String, Value>, ConfigError> {
    let mut grains = Map::new();
    grains.insert(String::from("roles"), json!([role]));
    grains.insert(String::from("hart.provider"), json!(provider));
    if let Some(name) = region {
        grains.insert(String::from("hart.region"), json!(name));
    }
    if let Some(size) = &settings.size {
        grains.insert(String::from("hart.size"), json!(size));
    }

    let mut config = Map::new();
    config.insert(String::from("master_tries"), json!(-1));
    config.insert(String::from("grains"), Value::Object(grains));
    if let Some(master) = &settings.saltmaster {
        config.insert(String::from("master"), json!(master));
    }

    match merged.get("minion_config") {
        None => {}
        Some(value @ toml::Value::Table(_)) => {
            let converted =
                serde_json::to_value(value).map_err(|err| ConfigError::InvalidValue {
                    field: String::from("minion_config"),
                    message: err.to_string(),
                })?;
            if let Value::Object(configured) = converted {
                merge_json(&mut config, configured);
            }
        }
        Some(_) => return Err(wrong_type("minion_config", "a table")),
    }
    if let Some(extra) = cli {
        merge_json(&mut config, extra);
    }
    Ok(config)
}

/// Merges `incoming` into `target`, replacing leaves and recursing into
/// objects present on both sides.
pub fn merge_json(target: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        match value {
            Value::Object(nested) => match target.get_mut(&key) {
                Some(Value::Object(existing)) => merge_json(existing, nested),
                _ => {
                    target.insert(key, Value::Object(nested));
                }
            },
            leaf => {
                target.insert(key, leaf);
            }
        }
    }
}

/// Every string-valued merged setting may be used in the naming scheme.
fn template_variables(merged: &toml::value::Table) -> BTreeMap<&str, String> {
    merged
        .iter()
        .filter(|(key, _)| key.as_str() != "role_naming_scheme")
        .filter_map(|(key, value)| value.as_str().map(|text| (key.as_str(), text.to_owned())))
        .collect()
}

/// Expands `{name}` placeholders in `scheme`; `{{` and `}}` produce
/// literal braces.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidTemplate`] naming the first placeholder
/// missing from `variables`, and [`ConfigError::InvalidValue`] for an
/// unbalanced brace.
pub fn render_minion_id(
    scheme: &str,
    variables: &BTreeMap<&str, String>,
) -> Result<String, ConfigError> {
    let unbalanced = || ConfigError::InvalidValue {
        field: String::from("role_naming_scheme"),
        message: format!("unbalanced braces in '{scheme}'"),
    };
    let mut rendered = String::with_capacity(scheme.len());
    let mut chars = scheme.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                rendered.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                rendered.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(part) => name.push(part),
                        None => return Err(unbalanced()),
                    }
                }
                let value = variables.get(name.as_str()).ok_or_else(|| {
                    let valid: Vec<String> =
                        variables.keys().map(|key| format!("{{{key}}}")).collect();
                    ConfigError::InvalidTemplate {
                        variable: name.clone(),
                        valid: valid.join(", "),
                    }
                })?;
                rendered.push_str(value);
            }
            '}' => return Err(unbalanced()),
            other => rendered.push(other),
        }
    }
    Ok(rendered)
}
