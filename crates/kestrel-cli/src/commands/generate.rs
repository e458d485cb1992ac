//! `kestrel generate`

use std::path::PathBuf;

use clap::Args;

use kestrel_engine::{CloudIdentity, Context, GenerateOptions};

use crate::Result;

/// Generate deployment artifacts
#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Path to the API model
    #[arg(long = "api-model")]
    pub api_model: PathBuf,

    /// Output directory (default: _output/<dnsPrefix>)
    #[arg(short, long = "output-directory")]
    pub output_directory: Option<PathBuf>,

    /// Override API model values, e.g. `masterProfile.count=3`
    #[arg(long = "set", value_delimiter = ',')]
    pub set: Vec<String>,

    /// CA certificate to sign the cluster certificates with
    #[arg(long = "ca-certificate-path")]
    pub ca_certificate_path: Option<PathBuf>,

    /// Private key of the CA certificate
    #[arg(long = "ca-private-key-path")]
    pub ca_private_key_path: Option<PathBuf>,

    /// Only write azuredeploy.parameters.json
    #[arg(long)]
    pub parameters_only: bool,
}

impl From<GenerateArgs> for GenerateOptions {
    fn from(args: GenerateArgs) -> Self {
        GenerateOptions {
            api_model: args.api_model,
            output_dir: args.output_directory,
            set_flags: args.set,
            ca_certificate_path: args.ca_certificate_path,
            ca_private_key_path: args.ca_private_key_path,
            parameters_only: args.parameters_only,
        }
    }
}

/// Run the generate command
pub async fn run(args: GenerateArgs) -> Result<()> {
    // generate never calls the cloud
    let ctx = Context::new(CloudIdentity::default());
    let dir = kestrel_engine::generate(&ctx, &args.into()).await?;
    println!("Generated artifacts in {}", dir.display());
    Ok(())
}
