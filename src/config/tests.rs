//! Unit tests for configuration loading.

use super::*;
use rstest::{fixture, rstest};
use serde::Deserialize;

const SAMPLE: &str = r#"
[hart]
provider = "do"
saltmaster = "salt.example.com"

[providers.do]
token = "secret"

[roles.web]
region = "nyc3"
"#;

#[fixture]
fn sample() -> HartConfig {
    HartConfig::from_toml_str(Utf8Path::new("hart.toml"), SAMPLE).expect("sample parses")
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct TokenOnly {
    token: String,
}

#[rstest]
fn default_provider_comes_from_hart_section(sample: HartConfig) {
    assert_eq!(sample.default_provider().as_deref(), Some("do"));
}

#[rstest]
fn provider_section_deserializes_credentials(sample: HartConfig) {
    let creds: TokenOnly = sample.provider_section("do").expect("do section");
    assert_eq!(creds.token, "secret");
}

#[rstest]
fn missing_provider_section_is_reported(sample: HartConfig) {
    let err = sample
        .provider_section::<TokenOnly>("vultr")
        .expect_err("vultr is absent");
    assert_eq!(
        err,
        ConfigError::MissingProvider {
            alias: String::from("vultr")
        }
    );
}

#[rstest]
fn roles_are_listed(sample: HartConfig) {
    let roles = sample.roles().expect("roles");
    assert!(roles.contains_key("web"));
}

#[rstest]
fn empty_file_is_empty_config() {
    let config = HartConfig::from_toml_str(Utf8Path::new("x.toml"), "  \n").expect("empty");
    assert_eq!(config, HartConfig::default());
    assert!(config.hart_section().expect("hart").is_empty());
}

#[rstest]
fn non_table_section_is_rejected() {
    let config =
        HartConfig::from_toml_str(Utf8Path::new("x.toml"), "hart = 3\n").expect("parses");
    let err = config.hart_section().expect_err("hart must be a table");
    assert!(matches!(err, ConfigError::InvalidStructure(_)));
}

#[rstest]
fn syntax_errors_name_the_file() {
    let err = HartConfig::from_toml_str(Utf8Path::new("broken.toml"), "[hart")
        .expect_err("invalid toml");
    assert!(err.to_string().contains("broken.toml"), "{err}");
}

#[rstest]
fn load_reads_file_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("hart.toml")).expect("utf8 path");
    std::fs::write(&path, SAMPLE).expect("write config");
    let config = HartConfig::load(&path).expect("load");
    assert_eq!(config.default_provider().as_deref(), Some("do"));
}

#[rstest]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("absent.toml")).expect("utf8 path");
    let err = HartConfig::load(&path).expect_err("missing file");
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[rstest]
fn ssh_builtin_settings_validate() {
    SshConfig::builtin().validate().expect("defaults are valid");
}

#[rstest]
fn ssh_settings_reject_zero_budget() {
    let config = SshConfig {
        canary_timeout_secs: 0,
        ..SshConfig::builtin()
    };
    let err = config.validate().expect_err("zero budget");
    assert!(err.to_string().contains("HART_SSH_CANARY_TIMEOUT_SECS"));
}
