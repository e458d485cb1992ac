//! `kestrel scale`

use std::time::Duration;

use clap::Args;

use kestrel_engine::{ScaleOptions, ScaleOutcome};

use super::{parse_duration, TargetArgs};
use crate::Result;

/// Scale a node pool
#[derive(Args, Debug)]
pub struct ScaleArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Desired number of nodes in the pool
    #[arg(short = 'c', long, default_value_t = 0)]
    pub new_node_count: i32,

    /// Pool to scale; optional when the cluster has one pool
    #[arg(long)]
    pub node_pool: Option<String>,

    /// FQDN of the API server, used to drain nodes on scale-down
    #[arg(long = "master-FQDN")]
    pub master_fqdn: Option<String>,

    /// Per-node drain bound on scale-down (e.g. 30m)
    #[arg(long, value_parser = parse_duration)]
    pub drain_timeout: Option<Duration>,
}

/// Run the scale command
pub async fn run(args: ScaleArgs) -> Result<()> {
    let ctx = args.target.identity.context();
    let opts = ScaleOptions {
        target: args.target.target(),
        new_node_count: args.new_node_count,
        node_pool: args.node_pool,
        master_fqdn: args.master_fqdn,
        drain_timeout: args.drain_timeout,
    };
    match kestrel_engine::scale(&ctx, &opts).await? {
        ScaleOutcome::Unchanged { count } => println!("Node pool already has {} nodes", count),
        ScaleOutcome::ScaledUp { from, to } | ScaleOutcome::ScaledDown { from, to } => {
            println!("Scaled node pool from {} to {} nodes", from, to)
        }
    }
    Ok(())
}
