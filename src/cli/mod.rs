//! Command-line interface definitions for the `hart` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `hart` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hart",
    version,
    about = "Provision salt minions and masters across cloud providers",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Which VPS provider to use (do, ec2, gce, vultr).
    #[arg(short = 'P', long, global = true, value_name = "ALIAS")]
    pub(crate) provider: Option<String>,
    /// Which region to create the node in.
    #[arg(short = 'R', long, global = true, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// Path to the config file with credentials and roles.
    #[arg(
        short = 'c',
        long,
        global = true,
        value_name = "PATH",
        default_value = "/etc/hart.toml"
    )]
    pub(crate) config: String,
    /// What to do.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `hart`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create a new minion.
    #[command(name = "create-minion")]
    CreateMinion(CreateMinionCommand),
    /// Create a new minion with a given role.
    #[command(name = "create-minion-from-role")]
    CreateMinionFromRole(CreateFromRoleCommand),
    /// Create a new saltmaster.
    #[command(name = "create-master")]
    CreateMaster(CreateMasterCommand),
    /// Destroy a minion and remove its key from the master.
    #[command(name = "destroy-minion")]
    DestroyMinion(DestroyMinionCommand),
    /// List available regions for a provider.
    #[command(name = "list-regions")]
    ListRegions(ListRegionsCommand),
    /// List available sizes for a provider.
    #[command(name = "list-sizes")]
    ListSizes,
}

/// Node options shared by every create subcommand.
#[derive(Debug, Args)]
pub(crate) struct NodeArgs {
    /// The size of the node to create. Default varies with provider.
    #[arg(short = 's', long, value_name = "SIZE")]
    pub(crate) size: Option<String>,
    /// Tags to add to the new node, comma-separated.
    #[arg(short = 't', long, value_name = "TAGS", value_delimiter = ',')]
    pub(crate) tags: Option<Vec<String>>,
    /// Enable private networking on the node.
    #[arg(short = 'p', long)]
    pub(crate) private_networking: bool,
    /// Which Debian version to create. Default: bookworm.
    #[arg(
        short = 'd',
        long,
        value_name = "CODENAME",
        value_parser = ["stretch", "buster", "bullseye", "bookworm", "trixie"]
    )]
    pub(crate) debian_codename: Option<String>,
    /// The salt branch to use. Default: latest.
    #[arg(long, value_name = "BRANCH")]
    pub(crate) salt_branch: Option<String>,
    /// Minion config as a JSON object.
    #[arg(long, value_name = "JSON")]
    pub(crate) minion_config: Option<String>,
    /// Availability zone, for providers that need one.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Subnet name or id, for providers that need one.
    #[arg(long, value_name = "SUBNET")]
    pub(crate) subnet: Option<String>,
}

/// Arguments for `hart create-minion`.
#[derive(Debug, Args)]
pub(crate) struct CreateMinionCommand {
    /// Salt minion id of the new node.
    pub(crate) minion_id: String,
    #[command(flatten)]
    pub(crate) node: NodeArgs,
}

/// Arguments for `hart create-minion-from-role`.
#[derive(Debug, Args)]
pub(crate) struct CreateFromRoleCommand {
    /// Name of the role in the config file.
    pub(crate) role: String,
    #[command(flatten)]
    pub(crate) node: NodeArgs,
}

/// Arguments for `hart create-master`.
#[derive(Debug, Args)]
pub(crate) struct CreateMasterCommand {
    /// Salt minion id of the master's own minion.
    pub(crate) minion_id: String,
    #[command(flatten)]
    pub(crate) node: NodeArgs,
    /// An ssh public key to add to root's authorized_keys. Repeatable.
    #[arg(short = 'a', long = "authorize-key", value_name = "KEY")]
    pub(crate) authorize_keys: Vec<String>,
    /// Grains as a JSON object.
    #[arg(short = 'g', long, value_name = "JSON")]
    pub(crate) grains: Option<String>,
    /// Path to a script to run on the master once salt is installed.
    #[arg(short = 'S', long, value_name = "PATH")]
    pub(crate) script: Option<String>,
}

/// Arguments for `hart destroy-minion`.
#[derive(Debug, Args)]
pub(crate) struct DestroyMinionCommand {
    /// Salt minion id of the node to destroy.
    pub(crate) minion_id: String,
}

/// Arguments for `hart list-regions`.
#[derive(Debug, Args)]
pub(crate) struct ListRegionsCommand {
    /// Include the zones of each region.
    #[arg(long)]
    pub(crate) include_zones: bool,
}
