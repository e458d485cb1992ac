//! `kestrel deploy`

use std::path::PathBuf;

use clap::Args;

use kestrel_engine::DeployOptions;

use super::IdentityArgs;
use crate::Result;

/// Deploy a cluster
#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Path to the API model
    #[arg(long = "api-model")]
    pub api_model: PathBuf,

    /// Location to deploy to
    #[arg(short, long, default_value = "")]
    pub location: String,

    /// Resource group to deploy to (default: the DNS prefix)
    #[arg(short = 'g', long)]
    pub resource_group: Option<String>,

    /// Output directory (default: _output/<dnsPrefix>)
    #[arg(short, long = "output-directory")]
    pub output_directory: Option<PathBuf>,

    /// Overwrite an existing output directory
    #[arg(short, long)]
    pub force_overwrite: bool,

    /// DNS prefix, when the API model has none
    #[arg(short = 'p', long)]
    pub dns_prefix: Option<String>,

    /// Append a unique suffix to the DNS prefix
    #[arg(long)]
    pub auto_suffix: bool,

    /// Override API model values, e.g. `masterProfile.count=3`
    #[arg(long = "set", value_delimiter = ',')]
    pub set: Vec<String>,

    /// CA certificate to sign the cluster certificates with
    #[arg(long = "ca-certificate-path")]
    pub ca_certificate_path: Option<PathBuf>,

    /// Private key of the CA certificate
    #[arg(long = "ca-private-key-path")]
    pub ca_private_key_path: Option<PathBuf>,

    #[command(flatten)]
    pub identity: IdentityArgs,
}

/// Run the deploy command
pub async fn run(args: DeployArgs) -> Result<()> {
    let ctx = args.identity.context();
    let opts = DeployOptions {
        api_model: args.api_model,
        location: args.location,
        resource_group: args.resource_group,
        output_dir: args.output_directory,
        force_overwrite: args.force_overwrite,
        dns_prefix: args.dns_prefix,
        auto_suffix: args.auto_suffix,
        set_flags: args.set,
        ca_certificate_path: args.ca_certificate_path,
        ca_private_key_path: args.ca_private_key_path,
    };
    let outcome = kestrel_engine::deploy(&ctx, &opts).await?;
    println!(
        "Deployed {} to resource group {} ({})",
        outcome.dns_prefix, outcome.resource_group, outcome.deployment_name
    );
    println!("Artifacts written to {}", outcome.output_dir.display());
    Ok(())
}
