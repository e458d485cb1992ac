//! Cluster mutation engine for kestrel
//!
//! Each verb takes a [`Context`] holding its collaborators and an options
//! struct, and drives the cluster from its stored API model to the next
//! state. The verbs share a prelude ([`session::ClusterSession`]) that loads,
//! defaults and validates the model and connects to the cloud.
//!
//! Related crates:
//! - `kestrel-common`: API model, version policy, naming and errors
//! - `kestrel-template`: template generation and post-deploy transforms
//! - `kestrel-cloud`: the cloud client trait and its ARM implementation
//! - `kestrel-pki`: certificate and SSH key generation

pub mod add_pool;
pub mod artifacts;
pub mod certs;
pub mod context;
pub mod deploy;
pub mod deployment;
pub mod drain;
pub mod generate;
pub mod info;
pub mod inventory;
pub mod kube_client;
pub mod kubeconfig;
pub mod options;
pub mod rotate;
pub mod scale;
pub mod session;
pub mod shell;
pub mod upgrade;
pub mod vm_delete;

#[cfg(test)]
mod testing;

pub use add_pool::{add_pool, AddPoolOutcome};
pub use context::{ArmConnector, CloudConnector, CloudIdentity, Context, ContextBuilder};
pub use deploy::{deploy, DeployOutcome};
pub use drain::{drain_node, drain_nodes, DrainOptions, DEFAULT_DRAIN_TIMEOUT};
pub use generate::generate;
pub use info::{get_locations, get_skus, get_versions, render_versions, VersionProfile};
pub use kube_client::{KubeClient, KubeClientImpl, KubeConnector, KubeConnectorImpl};
pub use options::{
    AddPoolOptions, ClusterTarget, DeployOptions, GenerateOptions, ModelSource,
    RotateCertsOptions, ScaleOptions, UpgradeOptions,
};
pub use rotate::{rotate_certs, RotateOutcome};
pub use scale::{scale, ScaleOutcome};
pub use shell::{NodeShell, ShellConnector, SshConnector, SshTarget};
pub use upgrade::{upgrade, UpgradeOutcome};

// Re-export common error types
pub use kestrel_common::{Error, ErrorKind, Result};
