//! kestrel CLI library

pub mod commands;

pub use kestrel_common::{Error, Result};

use clap::{Parser, Subcommand};

/// kestrel - Kubernetes cluster lifecycle on Azure
#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose debug logs and full error chains
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate deployment artifacts from an API model
    Generate(commands::generate::GenerateArgs),
    /// Deploy a cluster from an API model
    Deploy(commands::deploy::DeployArgs),
    /// Scale a node pool of a running cluster
    Scale(commands::scale::ScaleArgs),
    /// Add a node pool to a running cluster
    AddPool(commands::add_pool::AddPoolArgs),
    /// Upgrade a running cluster to a new Kubernetes version
    Upgrade(commands::upgrade::UpgradeArgs),
    /// Rotate certificates on a running cluster
    RotateCerts(commands::rotate_certs::RotateCertsArgs),
    /// List supported Kubernetes versions and their upgrades
    GetVersions(commands::info::GetVersionsArgs),
    /// List the regions of the subscription
    GetLocations(commands::info::CloudInfoArgs),
    /// List the VM sizes offered to the subscription
    GetSkus(commands::info::CloudInfoArgs),
}

impl Commands {
    /// Command-line name of the verb
    pub fn verb(&self) -> &'static str {
        match self {
            Commands::Generate(_) => "generate",
            Commands::Deploy(_) => "deploy",
            Commands::Scale(_) => "scale",
            Commands::AddPool(_) => "add-pool",
            Commands::Upgrade(_) => "upgrade",
            Commands::RotateCerts(_) => "rotate-certs",
            Commands::GetVersions(_) => "get-versions",
            Commands::GetLocations(_) => "get-locations",
            Commands::GetSkus(_) => "get-skus",
        }
    }
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Generate(args) => commands::generate::run(args).await,
            Commands::Deploy(args) => commands::deploy::run(args).await,
            Commands::Scale(args) => commands::scale::run(args).await,
            Commands::AddPool(args) => commands::add_pool::run(args).await,
            Commands::Upgrade(args) => commands::upgrade::run(args).await,
            Commands::RotateCerts(args) => commands::rotate_certs::run(args).await,
            Commands::GetVersions(args) => commands::info::versions(args),
            Commands::GetLocations(args) => commands::info::locations(args).await,
            Commands::GetSkus(args) => commands::info::skus(args).await,
        }
    }
}

/// The stderr line for a failed verb; `debug` adds every context layer
pub fn error_line(verb: &str, err: &Error, debug: bool) -> String {
    if debug {
        format!("{}: [{}] {}", verb, err.kind(), err.chain().join(": "))
    } else {
        format!("{}: {}", verb, err)
    }
}
