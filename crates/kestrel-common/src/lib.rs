//! Shared types for the kestrel cluster engine
//!
//! This crate holds everything the engine, the template pipeline and the CLI
//! agree on: the API model and its loader, defaulting and validation rules,
//! the Kubernetes version policy, cluster naming, the closed error-kind
//! enumeration, and small async helpers for polling and retrying.

pub mod api;
pub mod cloud_env;
pub mod error;
pub mod naming;
pub mod poll;
pub mod retry;
pub mod store;
pub mod versions;

pub use error::{Error, ErrorKind, Result, ResultExt};

/// Default Kubernetes cluster DNS domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Default admin username for Linux nodes
pub const DEFAULT_ADMIN_USERNAME: &str = "azureuser";

/// Orchestrator name used as the prefix of every VM, NIC and scale set
pub const ORCHESTRATOR_NAME: &str = "k8s";

/// Normalize an Azure region: lowercase with all spaces removed
///
/// `"West US 2"` and `"westus2"` name the same region.
pub fn normalize_region(name: &str) -> String {
    name.replace(' ', "").to_lowercase()
}
