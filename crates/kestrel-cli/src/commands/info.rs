//! `kestrel get-versions`, `get-locations` and `get-skus`

use clap::Args;
use serde::Serialize;

use kestrel_common::versions::VersionPolicy;
use kestrel_common::Error;

use super::{IdentityArgs, OutputFormat};
use crate::Result;

/// Arguments of `get-versions`
#[derive(Args, Debug)]
pub struct GetVersionsArgs {
    /// Show only this Kubernetes version
    #[arg(long)]
    pub version: Option<String>,

    /// Versions for clusters with Windows nodes
    #[arg(long)]
    pub windows: bool,

    /// Versions for Azure Stack clusters
    #[arg(long)]
    pub azure_stack: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Human)]
    pub output: OutputFormat,
}

/// Arguments of the cloud listing verbs
#[derive(Args, Debug)]
pub struct CloudInfoArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Human)]
    pub output: OutputFormat,
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::internal(format!("failed to render JSON: {}", e)))?;
    println!("{}", json);
    Ok(())
}

/// Run get-versions
pub fn versions(args: GetVersionsArgs) -> Result<()> {
    let profiles = kestrel_engine::get_versions(
        &VersionPolicy::builtin(),
        args.version.as_deref(),
        args.windows,
        args.azure_stack,
    )?;
    match args.output {
        OutputFormat::Json => print_json(&profiles),
        OutputFormat::Human => {
            print!("{}", kestrel_engine::render_versions(&profiles));
            Ok(())
        }
    }
}

/// Run get-locations
pub async fn locations(args: CloudInfoArgs) -> Result<()> {
    let ctx = args.identity.context();
    let locations = kestrel_engine::get_locations(&ctx).await?;
    match args.output {
        OutputFormat::Json => print_json(&locations),
        OutputFormat::Human => {
            let width = locations.iter().map(|l| l.name.len()).max().unwrap_or(0).max(8);
            println!("{:<width$}  Name", "Location", width = width);
            for l in &locations {
                println!("{:<width$}  {}", l.name, l.display_name, width = width);
            }
            Ok(())
        }
    }
}

/// Run get-skus
pub async fn skus(args: CloudInfoArgs) -> Result<()> {
    let ctx = args.identity.context();
    let skus = kestrel_engine::get_skus(&ctx).await?;
    match args.output {
        OutputFormat::Json => print_json(&skus),
        OutputFormat::Human => {
            println!("Name");
            for name in &skus {
                println!("{}", name);
            }
            Ok(())
        }
    }
}
