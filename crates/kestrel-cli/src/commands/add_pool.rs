//! `kestrel add-pool`

use std::path::PathBuf;

use clap::Args;

use kestrel_engine::AddPoolOptions;

use super::TargetArgs;
use crate::Result;

/// Add a node pool
#[derive(Args, Debug)]
pub struct AddPoolArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// JSON file describing the new pool
    #[arg(long = "node-pool", default_value = "")]
    pub node_pool: PathBuf,
}

/// Run the add-pool command
pub async fn run(args: AddPoolArgs) -> Result<()> {
    let ctx = args.target.identity.context();
    let opts = AddPoolOptions {
        target: args.target.target(),
        node_pool_path: args.node_pool,
    };
    let outcome = kestrel_engine::add_pool(&ctx, &opts).await?;
    println!(
        "Added node pool {} with {} nodes ({})",
        outcome.pool, outcome.count, outcome.deployment_name
    );
    Ok(())
}
