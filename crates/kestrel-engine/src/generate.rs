//! `generate`: write deployment artifacts without touching the cloud

use std::path::{Path, PathBuf};

use tracing::info;

use kestrel_common::api::{
    apply_defaults, validate, ApiVersion, CertificateAction, CertificateProfile, ContainerService,
    DefaultsMode, LoadOptions,
};
use kestrel_common::{Error, Result, ResultExt};

use crate::artifacts::{write_artifacts, ArtifactSet};
use crate::certs::ensure_certificates;
use crate::context::Context;
use crate::options::{default_output_dir, GenerateOptions};

/// A model loaded for cluster creation, before defaulting
pub struct CreateModel {
    pub model: ContainerService,
    pub api_version: ApiVersion,
}

/// Load a model for creation with `--set` overrides merged in
pub async fn load_for_create(
    ctx: &Context,
    path: &Path,
    set_flags: &[String],
) -> Result<CreateModel> {
    let loaded = ctx
        .loader
        .load(
            path,
            &LoadOptions {
                validate: false,
                is_update: false,
                defaults: None,
                set_flags: set_flags.to_vec(),
            },
        )
        .await
        .with_context(|| format!("loading API model {}", path.display()))?;
    Ok(CreateModel {
        model: loaded.model,
        api_version: loaded.api_version,
    })
}

/// Seed the certificate profile with a user supplied CA
pub async fn seed_ca(
    ctx: &Context,
    cs: &mut ContainerService,
    certificate: Option<&PathBuf>,
    private_key: Option<&PathBuf>,
) -> Result<()> {
    let (Some(certificate), Some(private_key)) = (certificate, private_key) else {
        return Ok(());
    };
    let read = |path: &PathBuf| {
        let path = path.clone();
        async move {
            let bytes = ctx.store.read(&path).await?;
            String::from_utf8(bytes).map_err(|_| {
                Error::invalid_args(format!("{} is not a PEM file", path.display()))
            })
        }
    };
    let profile = cs
        .properties
        .certificate_profile
        .get_or_insert_with(CertificateProfile::default);
    profile.ca_certificate = read(certificate).await?;
    profile.ca_private_key = read(private_key).await?;
    info!(path = %certificate.display(), "Using provided CA certificate");
    Ok(())
}

/// Default and validate for creation, then make any missing certificates
pub async fn finish_for_create(ctx: &Context, cs: &mut ContainerService) -> Result<CertificateAction> {
    let outcome = apply_defaults(cs, DefaultsMode::Create, &ctx.policy)?;
    validate(cs, false, &ctx.policy)?;
    ensure_certificates(ctx, &mut cs.properties, outcome.certificates).await?;
    Ok(outcome.certificates)
}

/// Run `generate`; returns the output directory
pub async fn generate(ctx: &Context, opts: &GenerateOptions) -> Result<PathBuf> {
    opts.validate()?;
    let CreateModel {
        mut model,
        api_version,
    } = load_for_create(ctx, &opts.api_model, &opts.set_flags).await?;
    seed_ca(
        ctx,
        &mut model,
        opts.ca_certificate_path.as_ref(),
        opts.ca_private_key_path.as_ref(),
    )
    .await?;
    finish_for_create(ctx, &mut model).await?;

    let generated = ctx.generator.generate(&model)?;
    let dir = opts
        .output_dir
        .clone()
        .unwrap_or_else(|| default_output_dir(model.properties.dns_prefix()));
    let set = if opts.parameters_only {
        ArtifactSet::ParametersOnly
    } else {
        ArtifactSet::Full
    };
    write_artifacts(ctx, &dir, &model, api_version, &generated, set).await?;

    info!(dir = %dir.display(), "Generated artifacts");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, copy_fixture, MockCloud};
    use kestrel_common::versions::VersionPolicy;

    fn options(model: PathBuf, out: PathBuf) -> GenerateOptions {
        GenerateOptions {
            api_model: model,
            output_dir: Some(out),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_every_artifact_without_cloud_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = copy_fixture("kubernetes.json", dir.path());
        let out = dir.path().join("out");
        // no expectations: any cloud call panics
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());

        generate(&ctx, &options(model, out.clone())).await.expect("generate");

        for name in [
            "apimodel.json",
            "azuredeploy.json",
            "azuredeploy.parameters.json",
            "ca.crt",
            "ca.key",
            "etcdpeer2.key",
            "kubeconfig/kubeconfig.westus2.yaml",
        ] {
            assert!(out.join(name).exists(), "{} missing", name);
        }
        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("apimodel.json")).expect("read"))
                .expect("json");
        assert!(saved
            .pointer("/properties/certificateProfile/caCertificate")
            .is_some());
    }

    #[tokio::test]
    async fn parameters_only_writes_one_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = copy_fixture("kubernetes.json", dir.path());
        let out = dir.path().join("out");
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());
        let mut opts = options(model, out.clone());
        opts.parameters_only = true;

        generate(&ctx, &opts).await.expect("generate");

        assert!(out.join("azuredeploy.parameters.json").exists());
        assert!(!out.join("azuredeploy.json").exists());
        assert!(!out.join("apimodel.json").exists());
    }

    #[tokio::test]
    async fn set_flags_reach_the_parameters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = copy_fixture("kubernetes.json", dir.path());
        let out = dir.path().join("out");
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());
        let mut opts = options(model, out.clone());
        opts.set_flags = vec!["agentPoolProfiles[0].count=7".to_string()];

        generate(&ctx, &opts).await.expect("generate");

        let params: serde_json::Value = serde_json::from_slice(
            &std::fs::read(out.join("azuredeploy.parameters.json")).expect("read"),
        )
        .expect("json");
        assert_eq!(
            params.pointer("/parameters/agentpool1Count/value"),
            Some(&serde_json::json!(7))
        );
    }

    #[tokio::test]
    async fn provided_ca_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = copy_fixture("kubernetes.json", dir.path());
        let out = dir.path().join("out");
        std::fs::write(dir.path().join("ca.crt"), "user-ca-cert").expect("write");
        std::fs::write(dir.path().join("ca.key"), "user-ca-key").expect("write");
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());
        let mut opts = options(model, out.clone());
        opts.ca_certificate_path = Some(dir.path().join("ca.crt"));
        opts.ca_private_key_path = Some(dir.path().join("ca.key"));

        generate(&ctx, &opts).await.expect("generate");

        assert_eq!(
            std::fs::read_to_string(out.join("ca.crt")).expect("read"),
            "user-ca-cert"
        );
    }
}
