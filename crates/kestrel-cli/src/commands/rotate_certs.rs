//! `kestrel rotate-certs`

use std::path::PathBuf;

use clap::Args;

use kestrel_engine::RotateCertsOptions;

use super::TargetArgs;
use crate::Result;

/// Rotate cluster certificates
#[derive(Args, Debug)]
pub struct RotateCertsArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Private SSH key accepted by the cluster's nodes
    #[arg(long = "ssh", default_value = "")]
    pub ssh: PathBuf,

    /// FQDN of the master load balancer
    #[arg(long = "master-FQDN")]
    pub master_fqdn: Option<String>,
}

/// Run the rotate-certs command
pub async fn run(args: RotateCertsArgs) -> Result<()> {
    let ctx = args.target.identity.context();
    let opts = RotateCertsOptions {
        target: args.target.target(),
        ssh_private_key: args.ssh,
        master_fqdn: args.master_fqdn,
    };
    let outcome = kestrel_engine::rotate_certs(&ctx, &opts).await?;
    println!(
        "Rotated certificates on {} masters and {} agents",
        outcome.masters.len(),
        outcome.agents.len()
    );
    Ok(())
}
