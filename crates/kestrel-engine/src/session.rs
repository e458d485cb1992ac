//! The prelude shared by verbs that mutate a deployed cluster
//!
//! Load the model, check its region, default it for the verb, validate it,
//! describe a custom cloud if there is one, connect to the cloud and make
//! sure the resource group exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use kestrel_cloud::{CloudClient, CloudEndpoints};
use kestrel_common::api::{
    apply_defaults, validate, ApiVersion, CertificateAction, ContainerService, DefaultsMode,
    LoadOptions,
};
use kestrel_common::cloud_env::CloudEnvironment;
use kestrel_common::{normalize_region, Error, Result, ResultExt};

use crate::context::Context;
use crate::options::ClusterTarget;

/// Cloud endpoints for a defaulted model
pub fn endpoints_for(cs: &ContainerService) -> Result<CloudEndpoints> {
    match &cs.properties.custom_cloud_profile {
        Some(profile) => CloudEndpoints::from_custom_cloud(profile),
        None => Ok(CloudEndpoints::AzurePublicCloud),
    }
}

/// Write the custom cloud descriptor, if the model targets one
pub async fn cloud_environment(cs: &ContainerService) -> Result<CloudEnvironment> {
    match &cs.properties.custom_cloud_profile {
        Some(profile) => {
            let name = cs.properties.dns_prefix();
            let env = CloudEnvironment::write(profile, &std::env::temp_dir(), name).await?;
            if let Some((var, value)) = env.env_var() {
                debug!(var = %var, path = %value, "Custom cloud environment written");
            }
            Ok(env)
        }
        None => Ok(CloudEnvironment::public()),
    }
}

/// Connect to the cloud a defaulted model targets
pub async fn connect(
    ctx: &Context,
    cs: &ContainerService,
) -> Result<(Arc<dyn CloudClient>, CloudEnvironment)> {
    let environment = cloud_environment(cs).await?;
    let cloud = ctx.cloud.connect(endpoints_for(cs)?)?;
    Ok((cloud, environment))
}

/// A loaded, defaulted and connected cluster
pub struct ClusterSession {
    pub model: ContainerService,
    pub api_version: ApiVersion,
    pub model_path: PathBuf,
    pub resource_group: String,
    pub location: String,
    /// What defaulting decided about certificates
    pub certificates: CertificateAction,
    pub cloud: Arc<dyn CloudClient>,
    pub environment: CloudEnvironment,
}

impl std::fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSession")
            .field("model_path", &self.model_path)
            .field("resource_group", &self.resource_group)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl ClusterSession {
    /// Run the prelude for `target` with defaults applied in `mode`
    pub async fn open(ctx: &Context, target: &ClusterTarget, mode: DefaultsMode) -> Result<Self> {
        let model_path = target.model_path()?;
        let loaded = ctx
            .loader
            .load(
                &model_path,
                &LoadOptions {
                    validate: false,
                    is_update: mode.is_update(),
                    defaults: None,
                    set_flags: Vec::new(),
                },
            )
            .await
            .with_context(|| format!("loading API model {}", model_path.display()))?;
        let mut model = loaded.model;

        let location = normalize_region(&target.location);
        if model.location.is_empty() {
            model.location = location.clone();
        } else if normalize_region(&model.location) != location {
            return Err(Error::invalid_args(format!(
                "--location does not match api model location ({} != {})",
                location,
                normalize_region(&model.location)
            )));
        }

        let outcome = apply_defaults(&mut model, mode, &ctx.policy)?;
        validate(&model, mode.is_update(), &ctx.policy)?;

        let (cloud, environment) = connect(ctx, &model).await?;
        cloud
            .ensure_resource_group(&target.resource_group, &location)
            .await
            .with_context(|| format!("ensuring resource group {}", target.resource_group))?;

        info!(
            resource_group = %target.resource_group,
            location = %location,
            cluster_id = %model.properties.cluster_id(),
            "Loaded cluster"
        );
        Ok(Self {
            model,
            api_version: loaded.api_version,
            model_path,
            resource_group: target.resource_group.clone(),
            location,
            certificates: outcome.certificates,
            cloud,
            environment,
        })
    }

    /// Cluster identity stamped on every resource
    pub fn cluster_id(&self) -> String {
        self.model.properties.cluster_id()
    }

    /// Directory holding the model, where artifacts are written
    pub fn model_dir(&self) -> PathBuf {
        self.model_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// The model file as stored, without defaults or validation
    ///
    /// Verbs that change one field persist it onto this copy so the saved
    /// model does not gain every defaulted value.
    pub async fn reload_stored(&self, ctx: &Context) -> Result<ContainerService> {
        let loaded = ctx
            .loader
            .load(
                &self.model_path,
                &LoadOptions {
                    validate: false,
                    is_update: true,
                    defaults: None,
                    set_flags: Vec::new(),
                },
            )
            .await
            .with_context(|| format!("reloading API model {}", self.model_path.display()))?;
        Ok(loaded.model)
    }

    /// Write `model` back over the loaded file
    pub async fn persist(&self, ctx: &Context, model: &ContainerService) -> Result<()> {
        persist_model(ctx, model, self.api_version, &self.model_path).await
    }
}

/// Serialize `model` under `api_version` and write it to `path`
pub async fn persist_model(
    ctx: &Context,
    model: &ContainerService,
    api_version: ApiVersion,
    path: &Path,
) -> Result<()> {
    let bytes = ctx.loader.serialize(model, api_version)?;
    ctx.store.write(path, &bytes).await?;
    info!(path = %path.display(), "Saved API model");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ModelSource;
    use crate::testing::{context, copy_fixture, MockCloud};
    use kestrel_common::versions::VersionPolicy;
    use kestrel_common::ErrorKind;
    use mockall::predicate::eq;

    fn target(path: PathBuf, location: &str) -> ClusterTarget {
        ClusterTarget {
            model: ModelSource::api_model(path),
            location: location.to_string(),
            resource_group: "kestrel-rg".to_string(),
        }
    }

    #[tokio::test]
    async fn open_defaults_validates_and_ensures_the_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = copy_fixture("kubernetes.json", dir.path());
        let mut cloud = MockCloud::new();
        cloud
            .expect_ensure_resource_group()
            .with(eq("kestrel-rg"), eq("westus2"))
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = context(cloud, VersionPolicy::builtin());

        let session = ClusterSession::open(&ctx, &target(path, "westus2"), DefaultsMode::Scale)
            .await
            .expect("session");
        assert_eq!(session.location, "westus2");
        assert_eq!(session.cluster_id().len(), 8);
        assert_eq!(
            session.model.properties.master_fqdn(),
            "kestrel-test.westus2.cloudapp.azure.com"
        );
        assert_eq!(session.environment, CloudEnvironment::public());
    }

    #[tokio::test]
    async fn mismatched_location_fails_before_any_cloud_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = copy_fixture("kubernetes.json", dir.path());
        let mut cloud = MockCloud::new();
        cloud.expect_ensure_resource_group().never();
        let ctx = context(cloud, VersionPolicy::builtin());

        let err = ClusterSession::open(&ctx, &target(path, "eastus"), DefaultsMode::Scale)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
    }

    #[tokio::test]
    async fn missing_model_is_reported_as_such() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());
        let err = ClusterSession::open(
            &ctx,
            &target(dir.path().join("absent.json"), "westus2"),
            DefaultsMode::Scale,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelNotFound);
    }
}
