//! `rotate-certs`: replace every certificate of a running cluster
//!
//! A new CA is generated along with everything derived from it, then pushed
//! to the nodes over SSH through the master FQDN. The stored model is only
//! updated once every node has its new files, so a failed rotation can be
//! retried from the same model.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tracing::info;

use kestrel_common::api::{CertificateAction, CertificateProfile, DefaultsMode};
use kestrel_common::naming::vm_name_index;
use kestrel_common::{Error, Result, ResultExt, DEFAULT_ADMIN_USERNAME};

use crate::certs::ensure_certificates;
use crate::context::Context;
use crate::kubeconfig::{admin_client, generate_kubeconfig, kubeconfig_path};
use crate::options::RotateCertsOptions;
use crate::session::ClusterSession;
use crate::shell::{NodeShell, SshTarget, DEFAULT_SSH_PORT};

/// Where certificates live on every node
pub const CERTS_DIR: &str = "/etc/kubernetes/certs";

const RESTART_ETCD: &str = "sudo systemctl restart etcd";
const RESTART_KUBELET: &str = "sudo systemctl restart kubelet";

/// Nodes whose certificates were replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateOutcome {
    pub masters: Vec<String>,
    pub agents: Vec<String>,
}

fn cert_path(file: &str) -> String {
    format!("{}/{}", CERTS_DIR, file)
}

async fn write_files(shell: &dyn NodeShell, host: &str, files: &[(String, &str)]) -> Result<()> {
    for (file, contents) in files {
        shell
            .write_file(host, &cert_path(file), contents)
            .await
            .with_context(|| format!("replacing {} on {}", file, host))?;
    }
    Ok(())
}

async fn restart(shell: &dyn NodeShell, host: &str, command: &str) -> Result<()> {
    shell
        .run(host, command)
        .await
        .with_context(|| format!("running `{}` on {}", command, host))
        .map(|_| ())
}

/// Etcd material for the master at `index`
async fn rotate_etcd(
    shell: &dyn NodeShell,
    certs: &CertificateProfile,
    host: &str,
    index: usize,
) -> Result<()> {
    let (Some(peer_cert), Some(peer_key)) = (
        certs.etcd_peer_certificates.get(index),
        certs.etcd_peer_private_keys.get(index),
    ) else {
        return Err(Error::internal(format!(
            "no etcd peer certificate for master {} (index {})",
            host, index
        )));
    };
    let files = [
        ("ca.key".to_string(), certs.ca_private_key.as_str()),
        ("ca.crt".to_string(), certs.ca_certificate.as_str()),
        ("etcdserver.key".to_string(), certs.etcd_server_private_key.as_str()),
        ("etcdserver.crt".to_string(), certs.etcd_server_certificate.as_str()),
        ("etcdclient.key".to_string(), certs.etcd_client_private_key.as_str()),
        ("etcdclient.crt".to_string(), certs.etcd_client_certificate.as_str()),
        (format!("etcdpeer{}.key", index), peer_key.as_str()),
        (format!("etcdpeer{}.crt", index), peer_cert.as_str()),
    ];
    write_files(shell, host, &files).await?;
    restart(shell, host, RESTART_ETCD).await
}

async fn rotate_apiserver(shell: &dyn NodeShell, certs: &CertificateProfile, host: &str) -> Result<()> {
    let files = [
        ("apiserver.key".to_string(), certs.apiserver_private_key.as_str()),
        ("apiserver.crt".to_string(), certs.apiserver_certificate.as_str()),
    ];
    write_files(shell, host, &files).await
}

/// CA and kubelet client credentials, which every node carries
async fn rotate_kubelet(shell: &dyn NodeShell, certs: &CertificateProfile, host: &str) -> Result<()> {
    let files = [
        ("ca.crt".to_string(), certs.ca_certificate.as_str()),
        ("client.crt".to_string(), certs.client_certificate.as_str()),
        ("client.key".to_string(), certs.client_private_key.as_str()),
    ];
    write_files(shell, host, &files).await?;
    restart(shell, host, RESTART_KUBELET).await
}

/// Node names split into masters and agents by the master VM name prefix
fn split_roles(nodes: Vec<Node>, master_prefix: &str) -> (Vec<String>, Vec<String>) {
    nodes
        .into_iter()
        .filter_map(|n| n.metadata.name)
        .partition(|name| name.starts_with(master_prefix))
}

/// Run `rotate-certs`
pub async fn rotate_certs(ctx: &Context, opts: &RotateCertsOptions) -> Result<RotateOutcome> {
    let mut opts = opts.clone();
    opts.validate()?;
    let session = ClusterSession::open(ctx, &opts.target, DefaultsMode::Upgrade).await?;
    let mut model = session.model.clone();

    // Node names come from the API server while the old certificates still work
    let kube = admin_client(ctx, &model, opts.master_fqdn.as_deref()).await?;
    let nodes = kube.list_nodes().await.context("listing cluster nodes")?;
    let (masters, agents) = split_roles(nodes, &model.properties.master_vm_prefix());
    info!(masters = masters.len(), agents = agents.len(), "Found cluster nodes");

    model.properties.certificate_profile = Some(CertificateProfile::default());
    if !ensure_certificates(ctx, &mut model.properties, CertificateAction::GenerateAll).await? {
        return Err(Error::internal("no certificates were generated"));
    }
    let certs = model
        .properties
        .certificate_profile
        .clone()
        .ok_or_else(|| Error::internal("certificate profile missing after generation"))?;

    let jump_host = opts
        .master_fqdn
        .clone()
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| model.properties.master_fqdn().to_string());
    let user = model
        .properties
        .linux_profile
        .as_ref()
        .map(|l| l.admin_username.clone())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_ADMIN_USERNAME.to_string());
    let shell: Arc<dyn NodeShell> = ctx.shell.connect(&SshTarget {
        user,
        private_key: opts.ssh_private_key.clone(),
        jump_host: Some(jump_host),
        port: DEFAULT_SSH_PORT,
    })?;

    info!("Rotating etcd certificates");
    for host in &masters {
        let index = vm_name_index(false, host)
            .with_context(|| format!("reading the master index of {}", host))?;
        rotate_etcd(shell.as_ref(), &certs, host, index).await?;
    }

    info!("Rotating API server certificates");
    for host in &masters {
        rotate_apiserver(shell.as_ref(), &certs, host).await?;
    }

    info!("Rotating kubelet certificates");
    for host in masters.iter().chain(agents.iter()) {
        rotate_kubelet(shell.as_ref(), &certs, host).await?;
    }

    let kubeconfig = kubeconfig_path(&session.model_dir(), &session.location);
    ctx.store
        .write_private(&kubeconfig, generate_kubeconfig(&model)?.as_bytes())
        .await?;
    info!(path = %kubeconfig.display(), "Wrote kubeconfig");

    let mut stored = session.reload_stored(ctx).await?;
    stored.properties.certificate_profile = Some(certs);
    session.persist(ctx, &stored).await?;

    info!("Certificates rotated");
    Ok(RotateOutcome { masters, agents })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::{KubeClient, MockKubeClient, MockKubeConnector};
    use crate::options::{ClusterTarget, ModelSource};
    use crate::shell::{MockNodeShell, MockShellConnector};
    use crate::testing::{context, fixture, write_model, MockCloud};
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kestrel_common::versions::VersionPolicy;
    use serde_json::{json, Value};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    fn cluster(dir: &Path) -> PathBuf {
        let mut doc: Value =
            serde_json::from_slice(&std::fs::read(fixture("kubernetes.json")).expect("read"))
                .expect("json");
        doc["properties"]["certificateProfile"] = json!({
            "caCertificate": "old-ca",
            "caPrivateKey": "old-ca-key",
            "kubeConfigCertificate": "old-kc",
            "kubeConfigPrivateKey": "old-kc-key",
        });
        write_model(dir, &doc)
    }

    fn options(path: PathBuf) -> RotateCertsOptions {
        RotateCertsOptions {
            target: ClusterTarget {
                model: ModelSource::api_model(path),
                location: "westus2".to_string(),
                resource_group: "kestrel-rg".to_string(),
            },
            ssh_private_key: PathBuf::from("/home/op/.ssh/id_rsa"),
            master_fqdn: None,
        }
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn kube_with(nodes: Vec<Node>) -> Arc<MockKubeConnector> {
        let mut kube = MockKubeClient::new();
        kube.expect_list_nodes().returning(move || Ok(nodes.clone()));
        let kube: Arc<dyn KubeClient> = Arc::new(kube);
        let mut connector = MockKubeConnector::new();
        connector.expect_connect().returning(move |_| Ok(kube.clone()));
        Arc::new(connector)
    }

    fn stored_ca(path: &Path) -> Value {
        let doc: Value = serde_json::from_slice(&std::fs::read(path).expect("read")).expect("json");
        doc["properties"]["certificateProfile"]["caCertificate"].clone()
    }

    #[tokio::test]
    async fn story_every_node_gets_the_new_pki() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = cluster(dir.path());
        let id = kestrel_common::naming::cluster_id("kestrel-test");
        let master = format!("k8s-master-{}-0", id);
        let agent = format!("k8s-agentpool1-{}-0", id);

        // Chapter 1: the API server reports one master and one agent
        let mut cloud = MockCloud::new();
        cloud.expect_ensure_resource_group().returning(|_, _| Ok(()));
        let mut ctx = context(cloud, VersionPolicy::builtin());
        ctx.kube = kube_with(vec![node(&master), node(&agent)]);

        // Chapter 2: files are written and services restarted through the master FQDN
        let writes = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(Mutex::new(Vec::new()));
        let mut shell = MockNodeShell::new();
        let recorded = writes.clone();
        shell.expect_write_file().returning(move |host, path, contents| {
            recorded
                .lock()
                .expect("lock")
                .push((host.to_string(), path.to_string(), contents.to_string()));
            Ok(())
        });
        let ran = runs.clone();
        shell.expect_run().returning(move |host, command| {
            ran.lock().expect("lock").push((host.to_string(), command.to_string()));
            Ok(String::new())
        });
        let shell: Arc<dyn NodeShell> = Arc::new(shell);
        let mut connector = MockShellConnector::new();
        connector
            .expect_connect()
            .withf(|target| {
                target.user == "azureuser"
                    && target.jump_host.as_deref() == Some("kestrel-test.westus2.cloudapp.azure.com")
            })
            .times(1)
            .returning(move |_| Ok(shell.clone()));
        ctx.shell = Arc::new(connector);

        let outcome = rotate_certs(&ctx, &options(path.clone())).await.expect("rotate");
        assert_eq!(outcome.masters, vec![master.clone()]);
        assert_eq!(outcome.agents, vec![agent.clone()]);

        let writes = writes.lock().expect("lock").clone();
        let on = |host: &str, file: &str| {
            writes
                .iter()
                .find(|(h, p, _)| h == host && p == &format!("{}/{}", CERTS_DIR, file))
                .map(|(_, _, c)| c.clone())
        };
        assert!(on(&master, "etcdpeer0.crt").is_some());
        assert!(on(&master, "apiserver.key").is_some());
        assert!(on(&agent, "apiserver.key").is_none());
        assert!(on(&agent, "client.key").is_some());
        let new_ca = on(&agent, "ca.crt").expect("agent CA");
        assert_ne!(new_ca, "old-ca");

        let runs = runs.lock().expect("lock").clone();
        assert!(runs.contains(&(master.clone(), RESTART_ETCD.to_string())));
        assert!(runs.contains(&(agent.clone(), RESTART_KUBELET.to_string())));
        assert!(!runs.contains(&(agent.clone(), RESTART_ETCD.to_string())));

        // Chapter 3: the model and kubeconfig carry the new CA
        assert_eq!(stored_ca(&path), json!(new_ca));
        let kubeconfig = kubeconfig_path(dir.path(), "westus2");
        assert!(kubeconfig.exists());
    }

    #[tokio::test]
    async fn a_failed_node_leaves_the_model_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = cluster(dir.path());
        let id = kestrel_common::naming::cluster_id("kestrel-test");

        let mut cloud = MockCloud::new();
        cloud.expect_ensure_resource_group().returning(|_, _| Ok(()));
        let mut ctx = context(cloud, VersionPolicy::builtin());
        ctx.kube = kube_with(vec![node(&format!("k8s-master-{}-0", id))]);

        let mut shell = MockNodeShell::new();
        shell
            .expect_write_file()
            .returning(|host, _, _| Err(Error::internal(format!("ssh: connect to {} refused", host))));
        shell.expect_run().never();
        let shell: Arc<dyn NodeShell> = Arc::new(shell);
        let mut connector = MockShellConnector::new();
        connector.expect_connect().returning(move |_| Ok(shell.clone()));
        ctx.shell = Arc::new(connector);

        let err = rotate_certs(&ctx, &options(path.clone())).await.unwrap_err();
        assert!(err.root().to_string().contains("refused"));
        assert_eq!(stored_ca(&path), json!("old-ca"));
        assert!(!kubeconfig_path(dir.path(), "westus2").exists());
    }

    #[test]
    fn pools_named_like_masters_are_agents() {
        let id = kestrel_common::naming::cluster_id("kestrel-test");
        let prefix = format!("k8s-master-{}-", id);
        let (masters, agents) = split_roles(
            vec![
                node(&format!("k8s-master-{}-0", id)),
                node(&format!("k8s-mastersvc-{}-0", id)),
                node("k8s-master-12345678-0"),
            ],
            &prefix,
        );
        assert_eq!(masters, vec![format!("k8s-master-{}-0", id)]);
        assert_eq!(agents.len(), 2);
    }

    #[test]
    fn etcd_peer_index_must_exist() {
        let certs = CertificateProfile::default();
        let shell = MockNodeShell::new();
        let err = futures::executor::block_on(rotate_etcd(&shell, &certs, "k8s-master-1-0", 0))
            .unwrap_err();
        assert!(err.to_string().contains("etcd peer"));
    }
}
