//! Cordon and drain
//!
//! Every node is drained concurrently. A node is drained when each of its
//! evictable pods has been evicted and is gone. Failures never stop the other
//! nodes; they are collected into one error once every drain has finished.

use std::time::Duration;

use futures::future::{join_all, try_join_all};
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use kestrel_common::poll::wait_with_timeout;
use kestrel_common::retry::{retry_if, RetryConfig};
use kestrel_common::{Error, ErrorKind, Result};

use crate::kube_client::{is_conflict, Eviction, KubeClient};

/// Annotation marking a static pod's API mirror
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Cordon attempts before an optimistic-lock conflict is fatal
pub const CORDON_ATTEMPTS: u32 = 5;

/// Drain timeout applied when a scale-down does not set one
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Tuning for a drain
#[derive(Debug, Clone)]
pub struct DrainOptions {
    /// Per-node bound; `None` waits forever
    pub timeout: Option<Duration>,
    /// Interval between pod-deletion checks
    pub poll_interval: Duration,
    /// Delay before retrying a conflicting cordon or a blocked eviction
    pub retry_delay: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_DRAIN_TIMEOUT),
            poll_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl DrainOptions {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Drain `nodes` concurrently and aggregate the failures
pub async fn drain_nodes(
    kube: &dyn KubeClient,
    nodes: &[String],
    options: &DrainOptions,
) -> Result<()> {
    let results = join_all(nodes.iter().map(|node| drain_node(kube, node, options))).await;
    let failures: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
    match Error::from_drain_failures(failures) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Cordon `node`, evict its pods and wait for them to terminate
pub async fn drain_node(kube: &dyn KubeClient, node: &str, options: &DrainOptions) -> Result<()> {
    info!(node = %node, "Cordoning node");
    retry_if(
        &RetryConfig::fixed(CORDON_ATTEMPTS, options.retry_delay),
        "cordon",
        is_conflict,
        || kube.cordon(node),
    )
    .await
    .map_err(|e| Error::drain_failed(node, format!("cordon failed: {}", e)))?;

    info!(node = %node, "Draining node");
    let evicted = match options.timeout {
        Some(timeout) => tokio::time::timeout(timeout, evict_all(kube, node, options))
            .await
            .map_err(|_| {
                Error::drain_failed(node, format!("Drain did not complete within {:?}", timeout))
            })?,
        None => evict_all(kube, node, options).await,
    };

    match evicted {
        Ok(count) => {
            info!(node = %node, pods = count, "Node drained");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::DrainFailed => Err(e),
        Err(e) => Err(Error::drain_failed(node, e.to_string())),
    }
}

/// Pods a drain must evict: not mirrors of static pods, not DaemonSet-owned
pub fn is_evictable(pod: &Pod) -> bool {
    let is_mirror = pod
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(MIRROR_POD_ANNOTATION))
        .unwrap_or(false);
    let is_daemon = pod
        .metadata
        .owner_references
        .as_ref()
        .map(|owners| owners.iter().any(|o| o.kind == "DaemonSet"))
        .unwrap_or(false);
    !is_mirror && !is_daemon
}

async fn evict_all(kube: &dyn KubeClient, node: &str, options: &DrainOptions) -> Result<usize> {
    let pods: Vec<Pod> = kube
        .list_pods_on_node(node)
        .await?
        .into_iter()
        .filter(is_evictable)
        .collect();
    debug!(node = %node, pods = pods.len(), "Evicting pods");

    try_join_all(pods.iter().map(|pod| evict_and_wait(kube, pod, options))).await?;
    Ok(pods.len())
}

async fn evict_and_wait(kube: &dyn KubeClient, pod: &Pod, options: &DrainOptions) -> Result<()> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let uid = pod.metadata.uid.as_deref();

    loop {
        match kube.evict_pod(namespace, name).await? {
            Eviction::Evicted => break,
            Eviction::Gone => return Ok(()),
            Eviction::Blocked(reason) => {
                warn!(pod = %name, namespace = %namespace, reason = %reason, "Eviction blocked, retrying");
                tokio::time::sleep(options.retry_delay).await;
            }
        }
    }

    // deletion is done once the pod is gone or replaced by a new incarnation
    let description = format!("pod {}/{} to be deleted", namespace, name);
    wait_with_timeout(None, options.poll_interval, &description, move || async move {
        Ok(match kube.get_pod(namespace, name).await? {
            None => Some(()),
            Some(current) if current.metadata.uid.as_deref() != uid => Some(()),
            Some(_) => None,
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast(timeout: Option<Duration>) -> DrainOptions {
        DrainOptions {
            timeout,
            poll_interval: Duration::from_millis(1),
            retry_delay: Duration::from_millis(1),
        }
    }

    fn pod(name: &str, uid: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn daemon_pod(name: &str) -> Pod {
        let mut p = pod(name, "d");
        p.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".to_string(),
            name: "kube-proxy".to_string(),
            ..Default::default()
        }]);
        p
    }

    fn mirror_pod(name: &str) -> Pod {
        let mut p = pod(name, "m");
        p.metadata.annotations = Some(BTreeMap::from([(
            MIRROR_POD_ANNOTATION.to_string(),
            "hash".to_string(),
        )]));
        p
    }

    #[test]
    fn mirror_and_daemonset_pods_are_left_alone() {
        assert!(is_evictable(&pod("web", "1")));
        assert!(!is_evictable(&daemon_pod("kube-proxy-abcde")));
        assert!(!is_evictable(&mirror_pod("kube-apiserver-master")));
    }

    #[tokio::test]
    async fn story_drain_retries_conflicts_and_budgets() {
        let mut kube = MockKubeClient::new();

        // Chapter 1: the first cordon races another writer
        let cordons = Arc::new(AtomicUsize::new(0));
        let c = cordons.clone();
        kube.expect_cordon().returning(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::cloud_api("Conflict", "the object has been modified"))
            } else {
                Ok(())
            }
        });

        // Chapter 2: only the web pod is evictable, and its budget refuses once
        kube.expect_list_pods_on_node().returning(|_| {
            Ok(vec![
                pod("web", "uid-1"),
                daemon_pod("kube-proxy-abcde"),
                mirror_pod("kube-apiserver"),
            ])
        });
        let evictions = Arc::new(AtomicUsize::new(0));
        let e = evictions.clone();
        kube.expect_evict_pod().returning(move |_, name| {
            assert_eq!(name, "web");
            if e.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Eviction::Blocked("Cannot evict pod as it would violate the pod's disruption budget.".to_string()))
            } else {
                Ok(Eviction::Evicted)
            }
        });

        // Chapter 3: the pod comes back under a new uid, which counts as gone
        kube.expect_get_pod()
            .returning(|_, name| Ok(Some(pod(name, "uid-2"))));

        drain_node(&kube, "k8s-agentpool1-12345678-0", &fast(Some(Duration::from_secs(5))))
            .await
            .expect("drain should succeed");
        assert_eq!(cordons.load(Ordering::SeqCst), 2);
        assert_eq!(evictions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn evicted_pods_that_vanish_are_done() {
        let mut kube = MockKubeClient::new();
        kube.expect_cordon().returning(|_| Ok(()));
        kube.expect_list_pods_on_node()
            .returning(|_| Ok(vec![pod("a", "1"), pod("b", "2")]));
        kube.expect_evict_pod().returning(|_, name| {
            Ok(if name == "a" {
                Eviction::Gone
            } else {
                Eviction::Evicted
            })
        });
        kube.expect_get_pod().times(1).returning(|_, _| Ok(None));

        drain_node(&kube, "node", &fast(None)).await.expect("drain");
    }

    #[tokio::test]
    async fn a_stuck_pod_times_out_as_a_drain_failure() {
        let mut kube = MockKubeClient::new();
        kube.expect_cordon().returning(|_| Ok(()));
        kube.expect_list_pods_on_node()
            .returning(|_| Ok(vec![pod("stuck", "1")]));
        kube.expect_evict_pod().returning(|_, _| Ok(Eviction::Evicted));
        kube.expect_get_pod()
            .returning(|_, name| Ok(Some(pod(name, "1"))));

        let err = drain_node(&kube, "node-0", &fast(Some(Duration::from_millis(50))))
            .await
            .expect_err("drain must time out");
        assert_eq!(err.kind(), ErrorKind::DrainFailed);
        assert!(err.to_string().contains("Drain did not complete within"));
        assert!(err.to_string().contains("node-0"));
    }

    #[tokio::test]
    async fn failures_from_several_nodes_are_aggregated() {
        let mut kube = MockKubeClient::new();
        kube.expect_cordon().returning(|name| {
            if name == "good" {
                Ok(())
            } else {
                Err(Error::cloud_api("Forbidden", "nodes is forbidden"))
            }
        });
        kube.expect_list_pods_on_node().returning(|_| Ok(vec![]));

        let nodes = vec!["bad-1".to_string(), "good".to_string(), "bad-2".to_string()];
        let err = drain_nodes(&kube, &nodes, &fast(None))
            .await
            .expect_err("two nodes fail");
        match err {
            Error::MultiDrainFailed { failures } => {
                assert_eq!(failures.len(), 2);
                assert!(failures
                    .iter()
                    .all(|f| f.kind() == ErrorKind::DrainFailed));
            }
            other => panic!("expected an aggregate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_single_failure_is_not_wrapped() {
        let mut kube = MockKubeClient::new();
        kube.expect_cordon()
            .returning(|_| Err(Error::cloud_api("Forbidden", "nodes is forbidden")));

        let err = drain_nodes(&kube, &["only".to_string()], &fast(None))
            .await
            .expect_err("fails");
        assert!(matches!(err, Error::DrainFailed { ref node, .. } if node == "only"));
    }
}
