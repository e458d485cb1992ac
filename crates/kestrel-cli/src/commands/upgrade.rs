//! `kestrel upgrade`

use std::time::Duration;

use clap::Args;

use kestrel_engine::UpgradeOptions;

use super::{parse_duration, TargetArgs};
use crate::Result;

/// Upgrade a cluster
#[derive(Args, Debug)]
pub struct UpgradeArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Kubernetes version to upgrade to
    #[arg(short = 'k', long, default_value = "")]
    pub upgrade_version: String,

    /// Skip the upgrade path check and replace nodes already at the target version
    #[arg(long)]
    pub force: bool,

    /// Upgrade only the control plane
    #[arg(long)]
    pub control_plane_only: bool,

    /// Bound on each node replacement (e.g. 20m)
    #[arg(long = "vm-timeout", value_parser = parse_duration)]
    pub step_timeout: Option<Duration>,

    /// Bound on each node drain (e.g. 20m)
    #[arg(long, value_parser = parse_duration)]
    pub cordon_drain_timeout: Option<Duration>,
}

/// Run the upgrade command
pub async fn run(args: UpgradeArgs) -> Result<()> {
    let ctx = args.target.identity.context();
    let opts = UpgradeOptions {
        target: args.target.target(),
        upgrade_version: args.upgrade_version,
        force: args.force,
        control_plane_only: args.control_plane_only,
        step_timeout: args.step_timeout,
        cordon_drain_timeout: args.cordon_drain_timeout,
    };
    let outcome = kestrel_engine::upgrade(&ctx, &opts).await?;
    println!(
        "Upgraded cluster from {} to {}: {} masters and {} agents replaced",
        outcome.from, outcome.to, outcome.masters, outcome.agents
    );
    Ok(())
}
