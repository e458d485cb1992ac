//! CLI commands

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use kestrel_engine::{ClusterTarget, CloudIdentity, Context, ModelSource};

pub mod add_pool;
pub mod deploy;
pub mod generate;
pub mod info;
pub mod rotate_certs;
pub mod scale;
pub mod upgrade;

/// Azure identity, from flags or the environment
#[derive(Args, Debug, Clone, Default)]
pub struct IdentityArgs {
    /// Azure subscription id
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID", default_value = "")]
    pub subscription_id: String,

    /// Azure Active Directory tenant id
    #[arg(long, env = "AZURE_TENANT_ID", default_value = "")]
    pub tenant_id: String,

    /// Bearer token for the resource manager
    #[arg(long, env = "AZURE_ACCESS_TOKEN", default_value = "", hide_env_values = true)]
    pub access_token: String,

    /// Bearer token for the Graph API, needed to create applications
    #[arg(long, env = "AZURE_GRAPH_TOKEN", hide_env_values = true)]
    pub graph_token: Option<String>,
}

impl IdentityArgs {
    pub fn context(&self) -> Context {
        Context::new(CloudIdentity {
            subscription_id: self.subscription_id.clone(),
            tenant_id: self.tenant_id.clone(),
            access_token: self.access_token.clone(),
            graph_token: self.graph_token.clone(),
        })
    }
}

/// Flags locating a deployed cluster
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Path to the cluster's API model
    #[arg(long = "api-model")]
    pub api_model: Option<PathBuf>,

    /// Directory of a previous deploy holding apimodel.json
    #[arg(long = "deployment-dir")]
    pub deployment_dir: Option<PathBuf>,

    /// Location the cluster is deployed in
    #[arg(short, long, default_value = "")]
    pub location: String,

    /// Resource group the cluster is deployed in
    #[arg(short = 'g', long, default_value = "")]
    pub resource_group: String,

    #[command(flatten)]
    pub identity: IdentityArgs,
}

impl TargetArgs {
    pub fn target(&self) -> ClusterTarget {
        ClusterTarget {
            model: ModelSource {
                api_model: self.api_model.clone(),
                deployment_dir: self.deployment_dir.clone(),
            },
            location: self.location.clone(),
            resource_group: self.resource_group.clone(),
        }
    }
}

/// Output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Columnar table (default)
    #[default]
    Human,
    /// JSON
    Json,
}

/// Parse a human-friendly duration.
///
/// Supports `Nh` (hours), `Nm` (minutes), and `Ns` (seconds).
/// Examples: "1h", "30m", "3600s"; a bare number is seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid duration '{}', expected e.g. 1h, 30m, 3600s", s);
    let (digits, unit) = if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        (s, 1)
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(n * unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_units_and_bare_seconds() {
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("30m"), Ok(Duration::from_secs(1800)));
        assert_eq!(parse_duration("45s"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration(" 90 "), Ok(Duration::from_secs(90)));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-1m").is_err());
    }

    #[test]
    fn target_args_keep_both_model_sources_for_validation() {
        let args = TargetArgs {
            api_model: Some(PathBuf::from("a.json")),
            deployment_dir: Some(PathBuf::from("_output/x")),
            ..Default::default()
        };
        let target = args.target();
        assert!(target.model_path().is_err());
    }
}
