//! `deploy`: create a cluster

use std::path::PathBuf;

use serde_json::json;
use tracing::info;

use kestrel_common::api::{
    ContainerService, LinuxProfile, PublicKey, ServicePrincipalProfile,
};
use kestrel_common::store::artifact_path;
use kestrel_common::{normalize_region, Error, Result, ResultExt, DEFAULT_ADMIN_USERNAME};
use kestrel_cloud::CloudClient;

use crate::artifacts::{write_artifacts, ArtifactSet};
use crate::context::Context;
use crate::deployment::{auto_suffix, deployment_name, submit};
use crate::generate::{finish_for_create, load_for_create, seed_ca, CreateModel};
use crate::options::{default_output_dir, DeployOptions};
use crate::session;

/// What a successful deploy produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub output_dir: PathBuf,
    pub resource_group: String,
    pub dns_prefix: String,
    pub deployment_name: String,
}

fn apply_dns_prefix(cs: &mut ContainerService, opts: &DeployOptions) -> Result<String> {
    let master = cs.properties.master_profile.as_mut().ok_or_else(|| {
        Error::model_invalid("properties.masterProfile", "is required to deploy")
    })?;
    match (&opts.dns_prefix, master.dns_prefix.is_empty()) {
        (Some(_), false) => {
            return Err(Error::invalid_args(
                "invalid --dns-prefix: the API model already specifies a DNS prefix",
            ))
        }
        (Some(prefix), true) => master.dns_prefix = prefix.clone(),
        (None, true) => return Err(Error::invalid_args("--dns-prefix must be specified")),
        (None, false) => {}
    }
    if opts.auto_suffix {
        master.dns_prefix = format!("{}-{}", master.dns_prefix, auto_suffix());
        info!(dns_prefix = %master.dns_prefix, "Added suffix to DNS prefix");
    }
    Ok(master.dns_prefix.clone())
}

fn apply_location(cs: &mut ContainerService, location: &str) -> Result<()> {
    if cs.location.is_empty() {
        cs.location = location.to_string();
    } else if normalize_region(&cs.location) != location {
        return Err(Error::invalid_args(
            "--location does not match api model location",
        ));
    }
    Ok(())
}

/// Make sure the model carries an SSH key; returns a generated private key
async fn ensure_ssh_key(ctx: &Context, cs: &mut ContainerService) -> Result<Option<(String, String)>> {
    let linux = cs
        .properties
        .linux_profile
        .get_or_insert_with(LinuxProfile::default);
    if linux.admin_username.is_empty() {
        linux.admin_username = DEFAULT_ADMIN_USERNAME.to_string();
    }
    if !linux.ssh.public_keys.is_empty() {
        return Ok(None);
    }
    let pair = ctx.pki.create_ssh_key().await?;
    linux.ssh.public_keys.push(PublicKey {
        key_data: pair.public_key,
    });
    info!(user = %linux.admin_username, "Generated SSH key pair");
    Ok(Some((
        format!("{}_rsa", linux.admin_username),
        pair.private_key_pem,
    )))
}

/// Create an application and role assignment when the model has no identity
async fn ensure_credentials(
    cloud: &dyn CloudClient,
    cs: &mut ContainerService,
    resource_group: &str,
) -> Result<()> {
    let props = &mut cs.properties;
    let has_identity = props.uses_managed_identity()
        || props
            .service_principal_profile
            .as_ref()
            .map(ServicePrincipalProfile::is_complete)
            .unwrap_or(false);
    if has_identity {
        return Ok(());
    }

    let name = props.dns_prefix().to_string();
    info!(app = %name, "Creating service principal");
    let credentials = cloud
        .create_app(&name, &[format!("https://{}/", name)], &json!([]))
        .await
        .context("creating application")?;
    cloud
        .create_role_assignment_simple(resource_group, &credentials.service_principal_object_id)
        .await
        .context("assigning role to the service principal")?;

    props.service_principal_profile = Some(ServicePrincipalProfile {
        client_id: credentials.app_id,
        secret: credentials.secret,
        object_id: credentials.service_principal_object_id,
        ..Default::default()
    });
    Ok(())
}

/// Run `deploy`
pub async fn deploy(ctx: &Context, opts: &DeployOptions) -> Result<DeployOutcome> {
    let mut opts = opts.clone();
    opts.validate()?;

    let CreateModel {
        mut model,
        api_version,
    } = load_for_create(ctx, &opts.api_model, &opts.set_flags).await?;
    let dns_prefix = apply_dns_prefix(&mut model, &opts)?;
    apply_location(&mut model, &opts.location)?;

    let output_dir = opts
        .output_dir
        .clone()
        .unwrap_or_else(|| default_output_dir(&dns_prefix));
    if !opts.force_overwrite && ctx.store.exists(&output_dir).await {
        return Err(Error::output_exists(output_dir.display().to_string()));
    }

    let ssh_key = ensure_ssh_key(ctx, &mut model).await?;
    seed_ca(
        ctx,
        &mut model,
        opts.ca_certificate_path.as_ref(),
        opts.ca_private_key_path.as_ref(),
    )
    .await?;
    finish_for_create(ctx, &mut model).await?;

    let resource_group = opts
        .resource_group
        .clone()
        .filter(|rg| !rg.is_empty())
        .unwrap_or_else(|| dns_prefix.clone());
    let (cloud, _environment) = session::connect(ctx, &model).await?;
    cloud
        .ensure_resource_group(&resource_group, &opts.location)
        .await
        .with_context(|| format!("ensuring resource group {}", resource_group))?;
    ensure_credentials(cloud.as_ref(), &mut model, &resource_group).await?;

    let generated = ctx.generator.generate(&model)?;
    let name = deployment_name(&resource_group);
    submit(
        cloud.as_ref(),
        &resource_group,
        &name,
        &generated.template,
        &generated.parameters,
    )
    .await?;

    write_artifacts(ctx, &output_dir, &model, api_version, &generated, ArtifactSet::Full).await?;
    if let Some((file, private_key)) = ssh_key {
        ctx.store
            .write_private(&artifact_path(&output_dir, &file), private_key.as_bytes())
            .await?;
    }

    info!(
        resource_group = %resource_group,
        dns_prefix = %dns_prefix,
        "Cluster deployed"
    );
    Ok(DeployOutcome {
        output_dir,
        resource_group,
        dns_prefix,
        deployment_name: name,
    })
}
