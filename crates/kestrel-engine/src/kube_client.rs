//! Kubernetes API access for drain, readiness and node listing
//!
//! The engine only ever talks to a cluster it built, using the admin
//! kubeconfig generated from the model's certificate profile. Everything goes
//! through [`KubeClient`] so verbs can be tested without an API server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use kestrel_common::{Error, ErrorKind, Result};

/// Connect timeout for the API server
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout for API requests
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

const CONFLICT: &str = "Conflict";

/// Outcome of one eviction request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eviction {
    /// Accepted; the pod will terminate
    Evicted,
    /// Refused for now, typically by a disruption budget (HTTP 429)
    Blocked(String),
    /// The pod no longer exists
    Gone,
}

/// Node and pod operations the engine performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a node by name, `None` when it is not registered
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Mark a node unschedulable
    ///
    /// A concurrent update surfaces as a `Conflict` cloud error; see [`is_conflict`].
    async fn cordon(&self, name: &str) -> Result<()>;

    /// Pods scheduled on `node` in every namespace
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<Eviction>;

    /// Deregister a node; an absent node is not an error
    async fn delete_node(&self, name: &str) -> Result<()>;
}

/// Builds a [`KubeClient`] from kubeconfig contents
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeConnector: Send + Sync {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn KubeClient>>;
}

/// Whether an error is an optimistic-lock conflict worth retrying
pub fn is_conflict(err: &Error) -> bool {
    matches!(err.root(), Error::CloudApi { code, .. } if code == CONFLICT)
}

/// Whether a node reports `Ready=True`
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Kubelet version a node reports, e.g. `v1.24.9`
pub fn node_version(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|info| info.kubelet_version.as_str())
}

fn api_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) => Error::cloud_api(resp.reason, resp.message),
        other => Error::cloud_api("KubernetesRequestFailed", other.to_string()),
    }
}

/// [`KubeClient`] over a kube-rs [`Client`]
#[derive(Clone)]
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client for a kubeconfig document with explicit timeouts
    pub async fn from_kubeconfig(
        kubeconfig: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| Error::internal(format!("invalid kubeconfig: {}", e)))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::internal(format!("failed to load kubeconfig: {}", e)))?;
        config.connect_timeout = Some(connect_timeout);
        config.read_timeout = Some(read_timeout);
        let client = Client::try_from(config)
            .map_err(|e| Error::internal(format!("failed to create client: {}", e)))?;
        Ok(Self::new(client))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.nodes().get_opt(name).await.map_err(api_error)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .map_err(api_error)?;
        Ok(list.items)
    }

    async fn cordon(&self, name: &str) -> Result<()> {
        let api = self.nodes();
        let mut node = api.get(name).await.map_err(api_error)?;
        let spec = node.spec.get_or_insert_with(Default::default);
        if spec.unschedulable == Some(true) {
            return Ok(());
        }
        spec.unschedulable = Some(true);
        // replace carries the resourceVersion, so a racing writer yields 409
        api.replace(name, &PostParams::default(), &node)
            .await
            .map_err(api_error)?;
        debug!(node = %name, "Cordoned node");
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
        let list = Api::<Pod>::all(self.client.clone())
            .list(&params)
            .await
            .map_err(api_error)?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.pods(namespace).get_opt(name).await.map_err(api_error)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<Eviction> {
        match self.pods(namespace).evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(Eviction::Evicted),
            Err(kube::Error::Api(resp)) if resp.code == 429 => Ok(Eviction::Blocked(resp.message)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(Eviction::Gone),
            Err(e) => Err(api_error(e)),
        }
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        match self.nodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(api_error(e)),
        }
    }
}

/// Connects with kube-rs using fixed timeouts
#[derive(Debug, Clone)]
pub struct KubeConnectorImpl {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for KubeConnectorImpl {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[async_trait]
impl KubeConnector for KubeConnectorImpl {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn KubeClient>> {
        let client =
            KubeClientImpl::from_kubeconfig(kubeconfig, self.connect_timeout, self.read_timeout)
                .await?;
        Ok(Arc::new(client))
    }
}

/// Whether an error came from an unreachable or failing API server
pub fn is_transient(err: &Error) -> bool {
    err.kind() == ErrorKind::CloudApiError && !is_conflict(err)
}
