//! Bootstrap payloads handed to new nodes, and the probes that tell when
//! they have finished.
//!
//! Payloads are shell scripts rendered from embedded templates. Every
//! payload writes the session canary before anything else, installs Salt
//! with the supplied minion configuration and finishes by appending a
//! sentinel line to [`COMPLETION_LOG`].

mod completion;

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::token::{CANARY_PATH, Canary};

pub use completion::{BootstrapWait, wait_for_cloud_init, wait_for_sentinel};

/// Log file the payload appends its completion sentinel to.
pub const COMPLETION_LOG: &str = "/var/log/hart-bootstrap.log";

/// Line written when the payload succeeds.
pub const COMPLETE_SENTINEL: &str = "hart bootstrap complete";

/// Prefix of the line written when the payload fails.
pub const FAILED_SENTINEL: &str = "hart bootstrap failed:";

const MINION_TEMPLATE: &str = include_str!("templates/minion.sh");
const MASTER_TEMPLATE: &str = include_str!("templates/master.sh");

/// Errors raised while rendering a payload.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BootstrapError {
    /// Raised when a template references a variable nobody supplied.
    #[error("bootstrap template references unknown variable {{{{{name}}}}}")]
    UnknownVariable {
        /// Placeholder name.
        name: String,
    },
    /// Raised when a template has an unterminated placeholder.
    #[error("bootstrap template has an unterminated placeholder")]
    Unterminated,
    /// Raised when the minion configuration cannot be serialized.
    #[error("failed to serialize minion configuration: {0}")]
    Serialize(String),
}

/// Debian releases hart can boot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DebianRelease {
    /// Debian 9.
    Stretch,
    /// Debian 10.
    Buster,
    /// Debian 11.
    Bullseye,
    /// Debian 12.
    #[default]
    Bookworm,
    /// Debian 13.
    Trixie,
}

impl DebianRelease {
    /// Every supported release, oldest first.
    pub const ALL: [Self; 5] = [
        Self::Stretch,
        Self::Buster,
        Self::Bullseye,
        Self::Bookworm,
        Self::Trixie,
    ];

    /// Release codename.
    #[must_use]
    pub const fn codename(self) -> &'static str {
        match self {
            Self::Stretch => "stretch",
            Self::Buster => "buster",
            Self::Bullseye => "bullseye",
            Self::Bookworm => "bookworm",
            Self::Trixie => "trixie",
        }
    }

    /// Major version number.
    #[must_use]
    pub const fn version(self) -> u8 {
        match self {
            Self::Stretch => 9,
            Self::Buster => 10,
            Self::Bullseye => 11,
            Self::Bookworm => 12,
            Self::Trixie => 13,
        }
    }
}

impl fmt::Display for DebianRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.codename())
    }
}

impl FromStr for DebianRelease {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|release| release.codename() == value.trim())
            .ok_or_else(|| {
                let known = Self::ALL.map(Self::codename).join(", ");
                format!("unknown Debian codename '{value}', must be one of {known}")
            })
    }
}

/// Inputs shared by minion and master payloads.
#[derive(Clone, Copy, Debug)]
pub struct PayloadInputs<'a> {
    /// Canary the session will look for.
    pub canary: &'a Canary,
    /// Salt minion configuration written to `minion.d`.
    pub minion_config: &'a Map<String, Value>,
    /// Salt bootstrap branch or version.
    pub salt_branch: &'a str,
    /// Debian release being booted.
    pub release: DebianRelease,
}

/// Renders the minion payload, trusting `master_pubkey` up front.
///
/// # Errors
///
/// Returns [`BootstrapError`] when the configuration cannot be serialized
/// or the template is malformed.
pub fn minion_payload(inputs: &PayloadInputs<'_>, master_pubkey: &str) -> Result<String, BootstrapError> {
    let config = serialize_config(inputs.minion_config)?;
    let args = salt_bootstrap_args(inputs.salt_branch);
    render(
        MINION_TEMPLATE,
        &[
            ("canary", inputs.canary.as_str()),
            ("canary_path", CANARY_PATH),
            ("completion_log", COMPLETION_LOG),
            ("minion_config", &config),
            ("master_pubkey", master_pubkey.trim()),
            ("salt_bootstrap_args", &args),
            ("debian_codename", inputs.release.codename()),
        ],
    )
}

/// Renders the master payload.
///
/// # Errors
///
/// Returns [`BootstrapError`] when the configuration cannot be serialized
/// or the template is malformed.
pub fn master_payload(inputs: &PayloadInputs<'_>) -> Result<String, BootstrapError> {
    let config = serialize_config(inputs.minion_config)?;
    let args = salt_bootstrap_args(inputs.salt_branch);
    render(
        MASTER_TEMPLATE,
        &[
            ("canary", inputs.canary.as_str()),
            ("canary_path", CANARY_PATH),
            ("completion_log", COMPLETION_LOG),
            ("minion_config", &config),
            ("salt_bootstrap_args", &args),
            ("debian_codename", inputs.release.codename()),
        ],
    )
}

/// Minion configuration for the master's own local minion.
///
/// `extra` replaces top-level defaults; `grains` are added to any grains
/// `extra` already carries.
#[must_use]
pub fn master_minion_config(
    minion_id: &str,
    extra: Option<Map<String, Value>>,
    grains: Option<Map<String, Value>>,
) -> Map<String, Value> {
    let mut config = Map::new();
    config.insert(String::from("id"), Value::from(minion_id));
    config.insert(String::from("user"), Value::from("saltmaster"));
    config.insert(String::from("file_client"), Value::from("local"));
    config.insert(String::from("state_verbose"), Value::Bool(false));
    config.extend(extra.unwrap_or_default());
    if let Some(added) = grains {
        let mut merged = match config.remove("grains") {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        merged.extend(added);
        config.insert(String::from("grains"), Value::Object(merged));
    }
    config
}

/// JSON is a subset of YAML, so Salt reads it as-is.
fn serialize_config(config: &Map<String, Value>) -> Result<String, BootstrapError> {
    serde_json::to_string_pretty(config).map_err(|err| BootstrapError::Serialize(err.to_string()))
}

fn salt_bootstrap_args(branch: &str) -> String {
    match branch.trim() {
        "" | "latest" | "stable" => String::from("stable"),
        version => format!("stable {version}"),
    }
}

/// Replaces `{{name}}` placeholders in `template` with values from `vars`.
///
/// # Errors
///
/// Returns [`BootstrapError::UnknownVariable`] for a placeholder missing
/// from `vars` and [`BootstrapError::Unterminated`] for a `{{` without a
/// closing `}}`.
pub fn render(template: &str, vars: &[(&str, &str)]) -> Result<String, BootstrapError> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some((before, after_open)) = rest.split_once("{{") {
        output.push_str(before);
        let (name, after_close) = after_open
            .split_once("}}")
            .ok_or(BootstrapError::Unterminated)?;
        let key = name.trim();
        let value = vars
            .iter()
            .find_map(|(candidate, value)| (*candidate == key).then_some(*value))
            .ok_or_else(|| BootstrapError::UnknownVariable {
                name: key.to_owned(),
            })?;
        output.push_str(value);
        rest = after_close;
    }
    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests;
