//! Collaborators shared by every verb
//!
//! A [`Context`] carries trait objects for each boundary the engine crosses:
//! model loading, the filesystem, template generation, PKI, the cloud, the
//! Kubernetes API and node shells. Production code builds one with
//! [`Context::builder`]; tests swap individual collaborators for mocks.

use std::sync::Arc;
use std::time::Duration;

use kestrel_cloud::{ArmClient, CloudClient, CloudConfig, CloudEndpoints, DEFAULT_ARM_OPERATION_TIMEOUT};
use kestrel_common::api::{ApiModelLoader, JsonApiModelLoader};
use kestrel_common::store::{FileStore, LocalFileStore};
use kestrel_common::versions::VersionPolicy;
use kestrel_common::Result;
use kestrel_pki::{KeySize, PkiFactory, RsaPkiFactory};
use kestrel_template::{ArmGenerator, TemplateGenerator};

use crate::kube_client::{KubeConnector, KubeConnectorImpl};
use crate::shell::{ShellConnector, SshConnector};

/// Opens a cloud client for the endpoints a model targets
///
/// The endpoint set is only known once the model is loaded and defaulted, so
/// verbs connect lazily rather than receiving a client up front.
pub trait CloudConnector: Send + Sync {
    fn connect(&self, endpoints: CloudEndpoints) -> Result<Arc<dyn CloudClient>>;
}

/// Cloud identity supplied on the command line or environment
#[derive(Clone, Default)]
pub struct CloudIdentity {
    pub subscription_id: String,
    pub tenant_id: String,
    pub access_token: String,
    pub graph_token: Option<String>,
}

impl std::fmt::Debug for CloudIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudIdentity")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

/// [`CloudConnector`] producing [`ArmClient`]s
#[derive(Debug, Clone)]
pub struct ArmConnector {
    identity: CloudIdentity,
    operation_timeout: Duration,
}

impl ArmConnector {
    pub fn new(identity: CloudIdentity) -> Self {
        Self {
            identity,
            operation_timeout: DEFAULT_ARM_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

impl CloudConnector for ArmConnector {
    fn connect(&self, endpoints: CloudEndpoints) -> Result<Arc<dyn CloudClient>> {
        let mut config = CloudConfig::new(
            endpoints,
            self.identity.subscription_id.clone(),
            self.identity.access_token.clone(),
        );
        config.tenant_id = self.identity.tenant_id.clone();
        config.graph_token = self.identity.graph_token.clone();
        config.operation_timeout = self.operation_timeout;
        Ok(Arc::new(ArmClient::new(config)?))
    }
}

/// Shared collaborators for a verb
pub struct Context {
    /// API model reader and writer
    pub loader: Arc<dyn ApiModelLoader>,
    /// Filesystem boundary for artifacts and the persisted model
    pub store: Arc<dyn FileStore>,
    pub generator: Arc<dyn TemplateGenerator>,
    pub pki: Arc<dyn PkiFactory>,
    /// Key size for certificates derived from a CA
    pub key_size: KeySize,
    pub cloud: Arc<dyn CloudConnector>,
    pub kube: Arc<dyn KubeConnector>,
    pub shell: Arc<dyn ShellConnector>,
    pub policy: VersionPolicy,
}

impl Context {
    /// Create a builder around a cloud connector
    pub fn builder(cloud: Arc<dyn CloudConnector>) -> ContextBuilder {
        ContextBuilder::new(cloud)
    }

    /// Context with production collaborators for `identity`
    pub fn new(identity: CloudIdentity) -> Self {
        Self::builder(Arc::new(ArmConnector::new(identity))).build()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    cloud: Arc<dyn CloudConnector>,
    loader: Option<Arc<dyn ApiModelLoader>>,
    store: Option<Arc<dyn FileStore>>,
    generator: Option<Arc<dyn TemplateGenerator>>,
    pki: Option<Arc<dyn PkiFactory>>,
    key_size: KeySize,
    kube: Option<Arc<dyn KubeConnector>>,
    shell: Option<Arc<dyn ShellConnector>>,
    policy: Option<VersionPolicy>,
}

impl ContextBuilder {
    fn new(cloud: Arc<dyn CloudConnector>) -> Self {
        Self {
            cloud,
            loader: None,
            store: None,
            generator: None,
            pki: None,
            key_size: KeySize::default(),
            kube: None,
            shell: None,
            policy: None,
        }
    }

    /// Override the model loader (primarily for testing)
    pub fn loader(mut self, loader: Arc<dyn ApiModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn TemplateGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn pki(mut self, pki: Arc<dyn PkiFactory>) -> Self {
        self.pki = Some(pki);
        self
    }

    /// Key size for the default PKI factory and derived certificates
    pub fn key_size(mut self, key_size: KeySize) -> Self {
        self.key_size = key_size;
        self
    }

    pub fn kube(mut self, kube: Arc<dyn KubeConnector>) -> Self {
        self.kube = Some(kube);
        self
    }

    pub fn shell(mut self, shell: Arc<dyn ShellConnector>) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Override the version policy (primarily for testing)
    pub fn policy(mut self, policy: VersionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let policy = self.policy.unwrap_or_else(VersionPolicy::builtin);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(LocalFileStore::new()));
        let key_size = self.key_size;
        Context {
            loader: self.loader.unwrap_or_else(|| {
                Arc::new(JsonApiModelLoader::new(store.clone(), policy.clone()))
            }),
            store,
            generator: self.generator.unwrap_or_else(|| Arc::new(ArmGenerator::new())),
            pki: self
                .pki
                .unwrap_or_else(|| Arc::new(RsaPkiFactory::new(key_size))),
            key_size,
            cloud: self.cloud,
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeConnectorImpl::default())),
            shell: self.shell.unwrap_or_else(|| Arc::new(SshConnector)),
            policy,
        }
    }
}
