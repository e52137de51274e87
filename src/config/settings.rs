//! Environment-layered settings for the local tools hart drives.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::ConfigError;

/// Default location of the Salt master's PKI directory.
pub const DEFAULT_PKI_DIR: &str = "/etc/salt/pki/master";

/// SSH client settings loaded via `ortho-config` (`HART_SSH_*`).
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "HART_SSH")]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// TCP port for SSH on new nodes.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Overall budget for establishing the first connection, in seconds.
    #[ortho_config(default = 120)]
    pub connect_timeout_secs: u64,
    /// Delay between connection attempts, in seconds.
    #[ortho_config(default = 2)]
    pub connect_retry_secs: u64,
    /// TCP connect timeout for a single attempt, in seconds.
    #[ortho_config(default = 3)]
    pub connect_attempt_secs: u64,
    /// Budget for the canary file to appear, in seconds.
    #[ortho_config(default = 15)]
    pub canary_timeout_secs: u64,
    /// How long an orphaned control master may linger, in seconds.
    #[ortho_config(default = 600)]
    pub control_persist_secs: u64,
}

impl SshConfig {
    /// Settings equal to the documented defaults, without consulting the
    /// environment.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            ssh_keygen_bin: String::from("ssh-keygen"),
            port: 22,
            connect_timeout_secs: 120,
            connect_retry_secs: 2,
            connect_attempt_secs: 3,
            canary_timeout_secs: 15,
            control_persist_secs: 600,
        }
    }

    /// Loads settings from defaults and `HART_SSH_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails or
    /// [`ConfigError::MissingField`] when validation rejects a value.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from("hart")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects blank binaries and zero-length budgets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_value(&self.ssh_bin, "HART_SSH_SSH_BIN")?;
        require_value(&self.ssh_keygen_bin, "HART_SSH_SSH_KEYGEN_BIN")?;
        require_positive(self.connect_timeout_secs, "HART_SSH_CONNECT_TIMEOUT_SECS")?;
        require_positive(self.connect_attempt_secs, "HART_SSH_CONNECT_ATTEMPT_SECS")?;
        require_positive(self.canary_timeout_secs, "HART_SSH_CANARY_TIMEOUT_SECS")?;
        Ok(())
    }

    /// Overall connection budget.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Delay between connection attempts.
    #[must_use]
    pub const fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs)
    }

    /// Budget for the canary file.
    #[must_use]
    pub const fn canary_timeout(&self) -> Duration {
        Duration::from_secs(self.canary_timeout_secs)
    }
}

/// Salt master settings loaded via `ortho-config` (`HART_SALT_*`).
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "HART_SALT")]
pub struct SaltConfig {
    /// Path to the `salt` executable.
    #[ortho_config(default = "salt".to_owned())]
    pub salt_bin: String,
    /// Path to the `salt-key` executable.
    #[ortho_config(default = "salt-key".to_owned())]
    pub salt_key_bin: String,
    /// Master PKI directory holding `master.pub` and accepted minion keys.
    #[ortho_config(default = DEFAULT_PKI_DIR.to_owned())]
    pub pki_dir: String,
    /// Time limit for a single master-side `test.ping`, in seconds.
    #[ortho_config(default = 15)]
    pub ping_timeout_secs: u64,
}

impl SaltConfig {
    /// Settings equal to the documented defaults.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            salt_bin: String::from("salt"),
            salt_key_bin: String::from("salt-key"),
            pki_dir: DEFAULT_PKI_DIR.to_owned(),
            ping_timeout_secs: 15,
        }
    }

    /// Loads settings from defaults and `HART_SALT_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails or
    /// [`ConfigError::MissingField`] when validation rejects a value.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from("hart")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        require_value(&config.salt_bin, "HART_SALT_SALT_BIN")?;
        require_value(&config.salt_key_bin, "HART_SALT_SALT_KEY_BIN")?;
        require_value(&config.pki_dir, "HART_SALT_PKI_DIR")?;
        Ok(config)
    }
}

fn require_value(value: &str, env_var: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "{env_var} must not be empty"
        )));
    }
    Ok(())
}

fn require_positive(value: u64, env_var: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::MissingField(format!(
            "{env_var} must be greater than zero"
        )));
    }
    Ok(())
}
