//! Verb inputs
//!
//! Plain data filled by the CLI. Each `validate` reports the first missing
//! or conflicting flag using the flag's command-line name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kestrel_common::{normalize_region, Error, Result};

/// File name of the model inside a deployment directory
pub const API_MODEL_FILENAME: &str = "apimodel.json";

fn require(value: &str, flag: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_args(format!("{} must be specified", flag)));
    }
    Ok(())
}

fn require_location(location: &mut String) -> Result<()> {
    require(location, "--location")?;
    *location = normalize_region(location);
    Ok(())
}

/// Where the API model comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSource {
    pub api_model: Option<PathBuf>,
    /// Directory of a previous deploy, holding `apimodel.json`
    pub deployment_dir: Option<PathBuf>,
}

impl ModelSource {
    pub fn api_model(path: impl Into<PathBuf>) -> Self {
        Self {
            api_model: Some(path.into()),
            deployment_dir: None,
        }
    }

    /// The model path, rejecting missing or ambiguous sources
    pub fn resolve(&self) -> Result<PathBuf> {
        match (&self.api_model, &self.deployment_dir) {
            (Some(_), Some(_)) => Err(Error::invalid_args(
                "ambiguous, please specify only one of --api-model and --deployment-dir",
            )),
            (Some(path), None) => Ok(path.clone()),
            (None, Some(dir)) => Ok(dir.join(API_MODEL_FILENAME)),
            (None, None) => Err(Error::invalid_args("--api-model must be specified")),
        }
    }
}

/// Inputs of `generate`
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub api_model: PathBuf,
    /// Defaults to `_output/{dnsPrefix}`
    pub output_dir: Option<PathBuf>,
    pub set_flags: Vec<String>,
    pub ca_certificate_path: Option<PathBuf>,
    pub ca_private_key_path: Option<PathBuf>,
    /// Write only `azuredeploy.parameters.json`
    pub parameters_only: bool,
}

impl GenerateOptions {
    pub fn validate(&self) -> Result<()> {
        if self.api_model.as_os_str().is_empty() {
            return Err(Error::invalid_args("--api-model must be specified"));
        }
        validate_ca_paths(&self.ca_certificate_path, &self.ca_private_key_path)
    }
}

fn validate_ca_paths(cert: &Option<PathBuf>, key: &Option<PathBuf>) -> Result<()> {
    if cert.is_some() != key.is_some() {
        return Err(Error::invalid_args(
            "--ca-certificate-path and --ca-private-key-path must be specified together",
        ));
    }
    Ok(())
}

/// Inputs of `deploy`
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub api_model: PathBuf,
    pub location: String,
    /// Defaults to the DNS prefix
    pub resource_group: Option<String>,
    /// Defaults to `_output/{dnsPrefix}`
    pub output_dir: Option<PathBuf>,
    pub force_overwrite: bool,
    /// Used when the model has no DNS prefix
    pub dns_prefix: Option<String>,
    /// Append a unique suffix to the DNS prefix
    pub auto_suffix: bool,
    pub set_flags: Vec<String>,
    pub ca_certificate_path: Option<PathBuf>,
    pub ca_private_key_path: Option<PathBuf>,
}

impl DeployOptions {
    pub fn validate(&mut self) -> Result<()> {
        if self.api_model.as_os_str().is_empty() {
            return Err(Error::invalid_args("--api-model must be specified"));
        }
        require_location(&mut self.location)?;
        validate_ca_paths(&self.ca_certificate_path, &self.ca_private_key_path)
    }
}

/// Inputs shared by verbs that mutate an existing cluster
#[derive(Debug, Clone, Default)]
pub struct ClusterTarget {
    pub model: ModelSource,
    pub location: String,
    pub resource_group: String,
}

impl ClusterTarget {
    fn validate_location_and_group(&mut self) -> Result<()> {
        require_location(&mut self.location)?;
        require(&self.resource_group, "--resource-group")
    }

    pub fn model_path(&self) -> Result<PathBuf> {
        self.model.resolve()
    }
}

/// Inputs of `scale`
#[derive(Debug, Clone, Default)]
pub struct ScaleOptions {
    pub target: ClusterTarget,
    pub new_node_count: i32,
    /// May be omitted when the model has exactly one pool
    pub node_pool: Option<String>,
    /// API server used to drain on scale-down; defaults to the model's FQDN
    pub master_fqdn: Option<String>,
    pub drain_timeout: Option<Duration>,
}

impl ScaleOptions {
    pub fn validate(&mut self) -> Result<()> {
        self.target.validate_location_and_group()?;
        if self.new_node_count <= 0 {
            return Err(Error::invalid_args("--new-node-count must be specified"));
        }
        self.target.model.resolve().map(|_| ())
    }
}

/// Inputs of `add-pool`
#[derive(Debug, Clone, Default)]
pub struct AddPoolOptions {
    pub target: ClusterTarget,
    /// JSON file describing the new pool
    pub node_pool_path: PathBuf,
}

impl AddPoolOptions {
    pub fn validate(&mut self) -> Result<()> {
        self.target.validate_location_and_group()?;
        if self.node_pool_path.as_os_str().is_empty() {
            return Err(Error::invalid_args("--node-pool must be specified"));
        }
        self.target.model.resolve().map(|_| ())
    }
}

/// Inputs of `upgrade`
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    pub target: ClusterTarget,
    pub upgrade_version: String,
    /// Skip the upgrade path check and replace nodes already at the target
    pub force: bool,
    pub control_plane_only: bool,
    /// Bound on each node replacement; unbounded when absent
    pub step_timeout: Option<Duration>,
    /// Bound on each node drain; unbounded when absent
    pub cordon_drain_timeout: Option<Duration>,
}

impl UpgradeOptions {
    pub fn validate(&mut self) -> Result<()> {
        self.target.validate_location_and_group()?;
        require(&self.upgrade_version, "--upgrade-version")?;
        self.upgrade_version = self.upgrade_version.trim_start_matches('v').to_string();
        self.target.model.resolve().map(|_| ())
    }
}

/// Inputs of `rotate-certs`
#[derive(Debug, Clone, Default)]
pub struct RotateCertsOptions {
    pub target: ClusterTarget,
    /// Private key accepted by every node
    pub ssh_private_key: PathBuf,
    /// Jump host and API server; defaults to the model's FQDN
    pub master_fqdn: Option<String>,
}

impl RotateCertsOptions {
    pub fn validate(&mut self) -> Result<()> {
        self.target.validate_location_and_group()?;
        if self.ssh_private_key.as_os_str().is_empty() {
            return Err(Error::invalid_args("--ssh must be specified"));
        }
        self.target.model.resolve().map(|_| ())
    }
}

/// Default artifact directory for a DNS prefix
pub fn default_output_dir(dns_prefix: &str) -> PathBuf {
    Path::new("_output").join(dns_prefix)
}
