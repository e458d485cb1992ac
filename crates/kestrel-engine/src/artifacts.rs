//! Writing deployment artifacts to an output directory

use std::path::{Path, PathBuf};

use tracing::info;

use kestrel_common::api::{ApiVersion, ContainerService};
use kestrel_common::store::{artifact_path, to_pretty_json};
use kestrel_common::Result;
use kestrel_template::GeneratedTemplate;

use crate::context::Context;
use crate::kubeconfig::{generate_kubeconfig, kubeconfig_path};
use crate::options::API_MODEL_FILENAME;

pub const TEMPLATE_FILENAME: &str = "azuredeploy.json";
pub const PARAMETERS_FILENAME: &str = "azuredeploy.parameters.json";

/// What to write besides the parameters document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactSet {
    /// Everything: model, template, parameters, kubeconfig and PEM files
    Full,
    ParametersOnly,
}

/// PEM files for each certificate role, as `(file name, contents, secret)`
pub fn pem_files(cs: &ContainerService) -> Vec<(String, String, bool)> {
    let Some(certs) = cs.properties.certificate_profile.as_ref() else {
        return Vec::new();
    };
    let mut files = vec![
        ("ca.crt".to_string(), certs.ca_certificate.clone(), false),
        ("ca.key".to_string(), certs.ca_private_key.clone(), true),
        ("apiserver.crt".to_string(), certs.apiserver_certificate.clone(), false),
        ("apiserver.key".to_string(), certs.apiserver_private_key.clone(), true),
        ("client.crt".to_string(), certs.client_certificate.clone(), false),
        ("client.key".to_string(), certs.client_private_key.clone(), true),
        ("kubectlClient.crt".to_string(), certs.kube_config_certificate.clone(), false),
        ("kubectlClient.key".to_string(), certs.kube_config_private_key.clone(), true),
        ("etcdserver.crt".to_string(), certs.etcd_server_certificate.clone(), false),
        ("etcdserver.key".to_string(), certs.etcd_server_private_key.clone(), true),
        ("etcdclient.crt".to_string(), certs.etcd_client_certificate.clone(), false),
        ("etcdclient.key".to_string(), certs.etcd_client_private_key.clone(), true),
    ];
    for (i, cert) in certs.etcd_peer_certificates.iter().enumerate() {
        files.push((format!("etcdpeer{}.crt", i), cert.clone(), false));
    }
    for (i, key) in certs.etcd_peer_private_keys.iter().enumerate() {
        files.push((format!("etcdpeer{}.key", i), key.clone(), true));
    }
    files.retain(|(_, contents, _)| !contents.is_empty());
    files
}

/// Write the artifacts of a generated cluster into `dir`
pub async fn write_artifacts(
    ctx: &Context,
    dir: &Path,
    cs: &ContainerService,
    api_version: ApiVersion,
    generated: &GeneratedTemplate,
    set: ArtifactSet,
) -> Result<Vec<PathBuf>> {
    ctx.store.create_dir_all(dir).await?;
    let mut written = Vec::new();

    let parameters = artifact_path(dir, PARAMETERS_FILENAME);
    ctx.store
        .write(&parameters, &to_pretty_json(&generated.parameters.to_document())?)
        .await?;
    written.push(parameters);

    if set == ArtifactSet::ParametersOnly {
        return Ok(written);
    }

    let template = artifact_path(dir, TEMPLATE_FILENAME);
    ctx.store
        .write(&template, &to_pretty_json(&generated.template.to_value()?)?)
        .await?;
    written.push(template);

    let model = artifact_path(dir, API_MODEL_FILENAME);
    ctx.store
        .write(&model, &ctx.loader.serialize(cs, api_version)?)
        .await?;
    written.push(model);

    if cs.properties.master_profile.is_some() {
        let kubeconfig = kubeconfig_path(dir, &cs.location);
        ctx.store
            .write_private(&kubeconfig, generate_kubeconfig(cs)?.as_bytes())
            .await?;
        written.push(kubeconfig);
    }

    for (name, contents, secret) in pem_files(cs) {
        let path = artifact_path(dir, &name);
        if secret {
            ctx.store.write_private(&path, contents.as_bytes()).await?;
        } else {
            ctx.store.write(&path, contents.as_bytes()).await?;
        }
        written.push(path);
    }

    info!(dir = %dir.display(), files = written.len(), "Wrote artifacts");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::api::CertificateProfile;

    #[test]
    fn keys_are_secret_and_empty_roles_are_skipped() {
        let mut cs = ContainerService::default();
        cs.properties.certificate_profile = Some(CertificateProfile {
            ca_certificate: "cert".to_string(),
            ca_private_key: "key".to_string(),
            etcd_peer_certificates: vec!["p0".to_string(), "p1".to_string()],
            etcd_peer_private_keys: vec!["k0".to_string(), "k1".to_string()],
            ..Default::default()
        });
        let files = pem_files(&cs);
        let names: Vec<&str> = files.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["ca.crt", "ca.key", "etcdpeer0.crt", "etcdpeer1.crt", "etcdpeer0.key", "etcdpeer1.key"]
        );
        assert!(files.iter().filter(|(n, _, _)| n.ends_with(".key")).all(|(_, _, s)| *s));
    }

    #[test]
    fn no_profile_means_no_pem_files() {
        assert!(pem_files(&ContainerService::default()).is_empty());
    }
}
