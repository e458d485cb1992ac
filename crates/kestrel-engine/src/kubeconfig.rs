//! Admin kubeconfig generation
//!
//! The kubeconfig embeds the cluster CA and the kubeconfig client
//! certificate from the model's certificate profile. Private clusters are
//! reached on the first master's IP, or on the internal load balancer when
//! there are several masters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use kestrel_common::api::ContainerService;
use kestrel_common::{Error, Result, ResultExt};

use crate::certs::internal_lb_ip;
use crate::context::Context;
use crate::kube_client::KubeClient;

/// Directory of per-region kubeconfigs inside an output directory
pub const KUBECONFIG_DIR: &str = "kubeconfig";

#[derive(Debug, Serialize)]
struct KubeConfigDoc {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<Named<ClusterEntry>>,
    users: Vec<Named<UserEntry>>,
    contexts: Vec<Named<ContextEntry>>,
    #[serde(rename = "current-context")]
    current_context: String,
}

#[derive(Debug, Serialize)]
struct Named<T> {
    name: String,
    #[serde(flatten)]
    item: T,
}

#[derive(Debug, Serialize)]
struct ClusterEntry {
    cluster: ClusterData,
}

#[derive(Debug, Serialize)]
struct ClusterData {
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
    server: String,
}

#[derive(Debug, Serialize)]
struct UserEntry {
    user: UserData,
}

#[derive(Debug, Serialize)]
struct UserData {
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: String,
    #[serde(rename = "client-key-data")]
    client_key_data: String,
}

#[derive(Debug, Serialize)]
struct ContextEntry {
    context: ContextData,
}

#[derive(Debug, Serialize)]
struct ContextData {
    cluster: String,
    user: String,
}

/// API server URL for a defaulted model
pub fn server_url(cs: &ContainerService) -> Result<String> {
    let props = &cs.properties;
    let is_private = props
        .kubernetes_config()
        .and_then(|k| k.private_cluster.as_ref())
        .and_then(|p| p.enabled)
        .unwrap_or(false);

    let host = match (&props.master_profile, is_private) {
        (Some(master), true) if master.count > 1 => internal_lb_ip(master).to_string(),
        (Some(master), true) => master.first_master_ip().to_string(),
        _ => props.master_fqdn().to_string(),
    };
    if host.is_empty() {
        return Err(Error::model_invalid(
            "properties.masterProfile.fqdn",
            "the API server address is unknown",
        ));
    }
    Ok(format!("https://{}", host))
}

/// Admin kubeconfig YAML for the cluster
pub fn generate_kubeconfig(cs: &ContainerService) -> Result<String> {
    let props = &cs.properties;
    let certs = props
        .certificate_profile
        .as_ref()
        .filter(|c| c.has_ca() && !c.kube_config_certificate.is_empty())
        .ok_or_else(|| {
            Error::model_invalid(
                "properties.certificateProfile",
                "a CA and kubeconfig certificate are required to build a kubeconfig",
            )
        })?;

    let name = props.dns_prefix().to_string();
    let user = format!("{}-admin", name);
    let doc = KubeConfigDoc {
        api_version: "v1",
        kind: "Config",
        clusters: vec![Named {
            name: name.clone(),
            item: ClusterEntry {
                cluster: ClusterData {
                    certificate_authority_data: STANDARD.encode(&certs.ca_certificate),
                    server: server_url(cs)?,
                },
            },
        }],
        users: vec![Named {
            name: user.clone(),
            item: UserEntry {
                user: UserData {
                    client_certificate_data: STANDARD.encode(&certs.kube_config_certificate),
                    client_key_data: STANDARD.encode(&certs.kube_config_private_key),
                },
            },
        }],
        contexts: vec![Named {
            name: name.clone(),
            item: ContextEntry {
                context: ContextData {
                    cluster: name.clone(),
                    user,
                },
            },
        }],
        current_context: name,
    };
    serde_yaml::to_string(&doc).map_err(|e| Error::internal(format!("failed to render kubeconfig: {}", e)))
}

/// Connect to the cluster's API server as admin
///
/// `master_fqdn` replaces the model's FQDN, e.g. when the API server is
/// reached through a different name than the one it was deployed with.
pub async fn admin_client(
    ctx: &Context,
    cs: &ContainerService,
    master_fqdn: Option<&str>,
) -> Result<Arc<dyn KubeClient>> {
    let yaml = match master_fqdn.filter(|f| !f.is_empty()) {
        Some(fqdn) => {
            let mut cs = cs.clone();
            if let Some(master) = cs.properties.master_profile.as_mut() {
                master.fqdn = fqdn.to_string();
            }
            generate_kubeconfig(&cs)?
        }
        None => {
            if cs.properties.master_fqdn().is_empty() {
                return Err(Error::invalid_args("--master-FQDN must be specified"));
            }
            generate_kubeconfig(cs)?
        }
    };
    ctx.kube
        .connect(&yaml)
        .await
        .context("connecting to the Kubernetes API server")
}

/// `kubeconfig/kubeconfig.{location}.yaml` under `dir`
pub fn kubeconfig_path(dir: &Path, location: &str) -> PathBuf {
    dir.join(KUBECONFIG_DIR)
        .join(format!("kubeconfig.{}.yaml", location))
}
