//! Binary entry point for the hart CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use chrono::Utc;
use clap::Parser;
use owo_colors::{OwoColorize, Stream};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hart::bootstrap::{DebianRelease, master_minion_config};
use hart::config::{ConfigError, HartConfig, SaltConfig, SshConfig, read_utf8_file};
use hart::exec::ProcessCommandRunner;
use hart::lifecycle::{DestroyError, Interrupt, LifecycleError, MasterOptions, NodeLifecycle};
use hart::provider::{AnyProvider, NodeSpec, Provider, ProviderError};
use hart::roles::{RoleOverrides, resolve_role};
use hart::trust::SaltMaster;

use crate::cli::{Cli, Command, CreateMasterCommand, NodeArgs};

/// Exit status after a run stopped by Ctrl-C.
const INTERRUPTED_EXIT: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Destroy(#[from] DestroyError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("--{flag} must be a JSON object: {message}")]
    Json { flag: &'static str, message: String },
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Lifecycle(err) if err.is_interrupted() => INTERRUPTED_EXIT,
            _ => 1,
        }
    }
}

type Lifecycle = NodeLifecycle<
    AnyProvider<ProcessCommandRunner>,
    ProcessCommandRunner,
    SaltMaster<ProcessCommandRunner>,
>;

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = HartConfig::load(Utf8Path::new(&cli.config))?;
    let region = cli.region;
    match cli.command {
        Command::CreateMinion(args) => {
            let alias = provider_alias(cli.provider, &config)?;
            let spec = node_spec(&args.minion_id, region, &args.node)?;
            create_minion(&alias, &config, &spec).await
        }
        Command::CreateMinionFromRole(args) => {
            let overrides = role_overrides(args.node)?;
            let resolved = resolve_role(
                &config,
                &args.role,
                cli.provider.as_deref(),
                region.as_deref(),
                overrides,
                &mut rand::thread_rng(),
                Utc::now(),
            )?;
            create_minion(&resolved.provider, &config, &resolved.spec).await
        }
        Command::CreateMaster(args) => {
            let alias = provider_alias(cli.provider, &config)?;
            create_master(&alias, &config, region, args).await
        }
        Command::DestroyMinion(args) => {
            let alias = provider_alias(cli.provider, &config)?;
            let lifecycle = lifecycle(&alias, &config, region)?;
            lifecycle.destroy_minion(&args.minion_id).await?;
            writeln!(io::stdout(), "Destroyed {}", args.minion_id)?;
            Ok(())
        }
        Command::ListRegions(args) => {
            let alias = provider_alias(cli.provider, &config)?;
            let provider = provider(&alias, &config, region)?;
            let mut stdout = io::stdout().lock();
            for found in provider.list_regions(args.include_zones).await? {
                writeln!(stdout, "{found}")?;
            }
            Ok(())
        }
        Command::ListSizes => {
            let alias = provider_alias(cli.provider, &config)?;
            let provider = provider(&alias, &config, region)?;
            let mut stdout = io::stdout().lock();
            for size in provider.list_sizes().await? {
                writeln!(stdout, "{size}")?;
            }
            Ok(())
        }
    }
}

async fn create_minion(alias: &str, config: &HartConfig, spec: &NodeSpec) -> Result<(), CliError> {
    let lifecycle = lifecycle(alias, config, spec.region.clone())?;
    let node = lifecycle.create_minion(spec).await?;
    let address = node
        .public_address
        .map_or_else(|| String::from("unknown"), |ip| ip.to_string());
    writeln!(io::stdout(), "Minion {} running at {address}", node.minion_id)?;
    Ok(())
}

async fn create_master(
    alias: &str,
    config: &HartConfig,
    region: Option<String>,
    args: CreateMasterCommand,
) -> Result<(), CliError> {
    let grains = args
        .grains
        .as_deref()
        .map(|raw| json_object("grains", raw))
        .transpose()?;
    let script = args
        .script
        .as_deref()
        .map(|path| read_utf8_file(Utf8Path::new(path)))
        .transpose()?;
    let extra = args
        .node
        .minion_config
        .as_deref()
        .map(|raw| json_object("minion-config", raw))
        .transpose()?;
    let minion_config = master_minion_config(&args.minion_id, extra, grains);
    let spec = node_builder(&args.minion_id, region, &args.node)?
        .minion_config(minion_config)
        .build()?;
    let options = MasterOptions {
        authorized_keys: args.authorize_keys,
        script,
    };

    let lifecycle = lifecycle(alias, config, spec.region.clone())?;
    let report = lifecycle.create_master(&spec, &options).await?;
    let address = report
        .node
        .public_address
        .map_or_else(|| String::from("unknown"), |ip| ip.to_string());
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "Master {} running at {address}", report.node.minion_id)?;
    writeln!(stdout, "Host key fingerprints:")?;
    for fingerprint in &report.host_fingerprints {
        writeln!(stdout, "  {fingerprint}")?;
    }
    Ok(())
}

fn provider_alias(flag: Option<String>, config: &HartConfig) -> Result<String, ConfigError> {
    flag.or_else(|| config.default_provider())
        .ok_or_else(|| ConfigError::MissingField(String::from("provider (pass -P or set it in [hart])")))
}

fn provider(
    alias: &str,
    config: &HartConfig,
    region: Option<String>,
) -> Result<AnyProvider<ProcessCommandRunner>, ConfigError> {
    Ok(AnyProvider::from_config(alias, config, ProcessCommandRunner)?.with_region(region))
}

fn lifecycle(alias: &str, config: &HartConfig, region: Option<String>) -> Result<Lifecycle, ConfigError> {
    let provider = provider(alias, config, region)?;
    let ssh = SshConfig::load_without_cli_args()?;
    ssh.validate()?;
    let salt = SaltConfig::load_without_cli_args()?;
    info!(provider = provider.alias(), "provider ready");
    Ok(NodeLifecycle::new(
        provider,
        ProcessCommandRunner,
        SaltMaster::new(salt, ProcessCommandRunner),
        ssh,
    )
    .with_interrupt(Interrupt::on_ctrl_c()))
}

fn json_object(flag: &'static str, raw: &str) -> Result<Map<String, Value>, CliError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(CliError::Json {
            flag,
            message: format!("got {other}"),
        }),
        Err(err) => Err(CliError::Json {
            flag,
            message: err.to_string(),
        }),
    }
}

fn release(node: &NodeArgs) -> Result<DebianRelease, ConfigError> {
    node.debian_codename
        .as_deref()
        .map_or(Ok(DebianRelease::default()), |codename| {
            codename
                .parse()
                .map_err(|message| ConfigError::InvalidValue {
                    field: String::from("debian_codename"),
                    message,
                })
        })
}

fn node_builder(
    minion_id: &str,
    region: Option<String>,
    node: &NodeArgs,
) -> Result<hart::provider::NodeSpecBuilder, ConfigError> {
    Ok(NodeSpec::builder(minion_id)
        .region(region)
        .size(node.size.clone())
        .release(release(node)?)
        .salt_branch(node.salt_branch.clone())
        .tags(node.tags.clone().unwrap_or_default())
        .private_networking(node.private_networking)
        .zone(node.zone.clone())
        .subnet(node.subnet.clone()))
}

fn node_spec(minion_id: &str, region: Option<String>, node: &NodeArgs) -> Result<NodeSpec, CliError> {
    let minion_config = node
        .minion_config
        .as_deref()
        .map(|raw| json_object("minion-config", raw))
        .transpose()?
        .unwrap_or_default();
    Ok(node_builder(minion_id, region, node)?
        .minion_config(minion_config)
        .build()?)
}

/// Only flags the operator actually passed override the role.
fn role_overrides(node: NodeArgs) -> Result<RoleOverrides, CliError> {
    let minion_config = node
        .minion_config
        .as_deref()
        .map(|raw| json_object("minion-config", raw))
        .transpose()?;
    Ok(RoleOverrides {
        size: node.size,
        salt_branch: node.salt_branch,
        tags: node.tags,
        private_networking: node.private_networking.then_some(true),
        debian_codename: node.debian_codename,
        zone: node.zone,
        subnet: node.subnet,
        minion_config,
    })
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    let message = format!("error: {err}");
    writeln!(
        target,
        "{}",
        message.if_supports_color(Stream::Stderr, |text| text.red())
    )
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn node_args() -> NodeArgs {
        NodeArgs {
            size: None,
            tags: None,
            private_networking: false,
            debian_codename: None,
            salt_branch: None,
            minion_config: None,
            zone: None,
            subnet: None,
        }
    }

    #[rstest]
    #[case("[1, 2]")]
    #[case("{not json")]
    fn json_flags_must_be_objects(#[case] raw: &str) {
        let err = json_object("grains", raw).expect_err("not an object");
        assert!(err.to_string().starts_with("--grains must be a JSON object"));
    }

    #[rstest]
    fn unset_flags_do_not_override_roles() {
        let overrides = role_overrides(node_args()).expect("overrides");
        assert_eq!(overrides, RoleOverrides::default());
    }

    #[rstest]
    fn private_networking_flag_overrides_roles() {
        let overrides = role_overrides(NodeArgs {
            private_networking: true,
            ..node_args()
        })
        .expect("overrides");
        assert_eq!(overrides.private_networking, Some(true));
    }

    #[rstest]
    fn direct_spec_uses_flags() {
        let spec = node_spec(
            "web.example.com",
            Some(String::from("nyc3")),
            &NodeArgs {
                tags: Some(vec![String::from("a"), String::from("b")]),
                debian_codename: Some(String::from("trixie")),
                minion_config: Some(String::from(r#"{"master": "salt"}"#)),
                ..node_args()
            },
        )
        .expect("spec builds");

        assert_eq!(spec.region.as_deref(), Some("nyc3"));
        assert_eq!(spec.release, DebianRelease::Trixie);
        assert_eq!(spec.tags, vec!["a", "b"]);
        assert_eq!(spec.minion_config["master"], "salt");
    }

    #[rstest]
    fn interrupted_runs_exit_with_130() {
        let err = CliError::Lifecycle(LifecycleError::Credential(
            hart::lifecycle::StepError::Interrupted,
        ));
        assert_eq!(err.exit_code(), INTERRUPTED_EXIT);
        assert_eq!(CliError::from(ConfigError::MissingField(String::from("x"))).exit_code(), 1);
    }

    #[rstest]
    fn write_error_prefixes_message() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::from(ConfigError::MissingField(String::from("x"))));
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(rendered.contains("error: missing configuration field: x"), "rendered: {rendered}");
    }
}
