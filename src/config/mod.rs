//! Configuration: the TOML file describing providers and roles, plus the
//! environment-layered tool settings.
//!
//! The file layout is:
//!
//! ```toml
//! [hart]
//! provider = "do"
//! saltmaster = "salt.example.com"
//!
//! [providers.do]
//! token = "..."
//!
//! [roles.web]
//! region = "nyc3"
//! size = "s-1vcpu-2gb"
//! ```

mod settings;

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use settings::{DEFAULT_PKI_DIR, SaltConfig, SshConfig};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hart.toml";

const HART_SECTION: &str = "hart";
const PROVIDERS_SECTION: &str = "providers";
const ROLES_SECTION: &str = "roles";

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when the configuration file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// File that could not be read.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the file contents are not valid TOML.
    #[error("failed to parse {path}: {message}")]
    Syntax {
        /// File that could not be parsed.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// Raised when a section has the wrong shape.
    #[error("invalid configuration: {0}")]
    InvalidStructure(String),
    /// Raised when no credentials block exists for a provider alias.
    #[error("no [providers.{alias}] section in configuration")]
    MissingProvider {
        /// Provider alias that was looked up.
        alias: String,
    },
    /// Raised when a provider alias is not one hart supports.
    #[error("unknown provider '{alias}', must be one of {known}")]
    UnknownProvider {
        /// Alias supplied by the operator.
        alias: String,
        /// Comma separated list of supported aliases.
        known: String,
    },
    /// Raised when the requested role is not defined.
    #[error("Unknown role '{role}', {detail}")]
    UnknownRole {
        /// Role supplied by the operator.
        role: String,
        /// Either the list of known roles or a note that none exist.
        detail: String,
    },
    /// Raised when the minion id template uses an unsupported placeholder.
    #[error("Invalid minion id template variable {{{variable}}}, must be one of {valid}")]
    InvalidTemplate {
        /// Offending placeholder name.
        variable: String,
        /// Comma separated list of supported placeholders.
        valid: String,
    },
    /// Raised when a value fails semantic validation.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Name of the field or flag.
        field: String,
        /// What was wrong with it.
        message: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Parsed hart configuration file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HartConfig {
    root: toml::value::Table,
}

impl HartConfig {
    /// Loads the file at `path`, expanding a leading `~/`.
    ///
    /// A missing file at the default location yields an empty configuration
    /// so credential-less commands still work; a missing file anywhere else
    /// is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Syntax`] when the file
    /// cannot be read or parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let expanded = expand_home(path);
        match read_utf8_file(&expanded) {
            Ok(contents) => Self::from_toml_str(&expanded, &contents),
            Err(ConfigError::Io { .. }) if path.as_str() == DEFAULT_CONFIG_PATH => {
                tracing::debug!(path = %expanded, "no configuration file, using empty config");
                Ok(Self::default())
            }
            Err(err) => Err(err),
        }
    }

    /// Parses TOML content attributed to `path` in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Syntax`] when the content is not valid TOML.
    pub fn from_toml_str(path: &Utf8Path, contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let root = toml::from_str::<toml::value::Table>(contents).map_err(|err| {
            ConfigError::Syntax {
                path: path.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        Ok(Self { root })
    }

    /// The `[hart]` section, empty when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidStructure`] when `hart` is not a table.
    pub fn hart_section(&self) -> Result<toml::value::Table, ConfigError> {
        optional_table(&self.root, HART_SECTION).map(Option::unwrap_or_default)
    }

    /// Provider alias named by `[hart].provider`, if any.
    #[must_use]
    pub fn default_provider(&self) -> Option<String> {
        self.root
            .get(HART_SECTION)
            .and_then(|section| section.get("provider"))
            .and_then(toml::Value::as_str)
            .map(str::to_owned)
    }

    /// Deserializes the `[providers.<alias>]` credentials block.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingProvider`] when the block is absent and
    /// [`ConfigError::InvalidStructure`] when it does not match `T`.
    pub fn provider_section<T: DeserializeOwned>(&self, alias: &str) -> Result<T, ConfigError> {
        let providers = optional_table(&self.root, PROVIDERS_SECTION)?.unwrap_or_default();
        let section = optional_table(&providers, alias)?.ok_or_else(|| {
            ConfigError::MissingProvider {
                alias: alias.to_owned(),
            }
        })?;
        toml::Value::Table(section).try_into().map_err(|err| {
            ConfigError::InvalidStructure(format!("[providers.{alias}]: {err}"))
        })
    }

    /// All roles keyed by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidStructure`] when `roles` or any role is
    /// not a table.
    pub fn roles(&self) -> Result<toml::value::Table, ConfigError> {
        let roles = optional_table(&self.root, ROLES_SECTION)?.unwrap_or_default();
        for (name, value) in &roles {
            if !value.is_table() {
                return Err(ConfigError::InvalidStructure(format!(
                    "[roles.{name}] must be a table"
                )));
            }
        }
        Ok(roles)
    }
}

fn optional_table(
    parent: &toml::value::Table,
    key: &str,
) -> Result<Option<toml::value::Table>, ConfigError> {
    match parent.get(key) {
        None => Ok(None),
        Some(toml::Value::Table(table)) => Ok(Some(table.clone())),
        Some(_) => Err(ConfigError::InvalidStructure(format!(
            "{key} must be a table"
        ))),
    }
}

/// Expands a leading `~/` using `$HOME`.
#[must_use]
pub fn expand_home(path: &Utf8Path) -> Utf8PathBuf {
    match (path.strip_prefix("~"), std::env::var("HOME")) {
        (Ok(rest), Ok(home)) => Utf8PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Reads a UTF-8 file through a capability handle on its parent directory.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when the directory or file cannot be read.
pub fn read_utf8_file(path: &Utf8Path) -> Result<String, ConfigError> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_str().is_empty() => dir,
        _ => Utf8Path::new("."),
    };
    let file_name = path.file_name().ok_or_else(|| ConfigError::Io {
        path: path.to_path_buf(),
        message: String::from("path is missing a filename"),
    })?;
    let io_error = |err: io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(io_error)?;
    dir.read_to_string(file_name).map_err(io_error)
}

#[cfg(test)]
mod tests;
