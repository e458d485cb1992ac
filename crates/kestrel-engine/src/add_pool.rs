//! `add-pool`: deploy a new agent pool into a running cluster

use tracing::info;

use kestrel_common::api::validate::validate_availability_consistency;
use kestrel_common::api::{apply_defaults, AgentPoolProfile, DefaultsMode};
use kestrel_common::naming::parse_vmss_name;
use kestrel_common::{Error, Result, ResultExt};
use kestrel_template::{transform_all, TransformMode};

use crate::certs::ensure_certificates;
use crate::context::Context;
use crate::deployment::{deployment_name, submit};
use crate::options::AddPoolOptions;
use crate::scale::{pool_template, scale_modes};
use crate::session::ClusterSession;

/// What `add-pool` deployed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPoolOutcome {
    pub pool: String,
    pub count: i32,
    pub deployment_name: String,
}

fn check_new_pool(existing: &[AgentPoolProfile], pool: &AgentPoolProfile) -> Result<()> {
    if pool.name.is_empty() {
        return Err(Error::model_invalid("nodePool.name", "is required"));
    }
    if let Some(p) = existing.iter().find(|p| p.name.eq_ignore_ascii_case(&pool.name)) {
        return Err(Error::invalid_args(format!("node pool {} already exists", p.name)));
    }
    let mut all = existing.to_vec();
    all.push(pool.clone());
    validate_availability_consistency(&all)
}

/// Run `add-pool`
pub async fn add_pool(ctx: &Context, opts: &AddPoolOptions) -> Result<AddPoolOutcome> {
    let mut opts = opts.clone();
    opts.validate()?;
    let session = ClusterSession::open(ctx, &opts.target, DefaultsMode::Scale).await?;

    let mut pool = ctx
        .loader
        .load_agent_pool(&opts.node_pool_path)
        .await
        .with_context(|| format!("loading node pool {}", opts.node_pool_path.display()))?;
    // The stored pools are already defaulted, so compare like with like
    if pool.availability_profile.is_none() {
        if let Some(first) = session.model.properties.agent_pool_profiles.first() {
            pool.availability_profile = first.availability_profile;
        }
    }
    check_new_pool(&session.model.properties.agent_pool_profiles, &pool)?;

    if pool.is_virtual_machine_scale_sets() {
        let sets = session
            .cloud
            .list_virtual_machine_scale_sets(&session.resource_group)
            .collect_all()
            .await
            .with_context(|| format!("listing scale sets in {}", session.resource_group))?;
        if sets
            .iter()
            .filter_map(|ss| parse_vmss_name(&ss.name).ok())
            .any(|parsed| parsed.pool == pool.name)
        {
            return Err(Error::invalid_args(
                "An agent pool with the given name already exists in the cluster",
            ));
        }
    }

    let pool_index = session.model.properties.agent_pool_profiles.len();
    let mut model = session.model.clone();
    model.properties.agent_pool_profiles = vec![pool];
    apply_defaults(&mut model, DefaultsMode::Scale, &ctx.policy)?;
    ensure_certificates(ctx, &mut model.properties, session.certificates).await?;
    let pool = model.properties.agent_pool_profiles[0].clone();

    info!(pool = %pool.name, count = pool.count, "Adding node pool");
    let generated = pool_template(ctx, &model, &pool, pool_index)?;
    let modes = if pool.is_virtual_machine_scale_sets() {
        scale_modes(&model, &[TransformMode::AddVmasPool])
    } else {
        let mut modes = vec![TransformMode::AddVmasPool];
        if model.properties.is_standard_load_balancer() {
            modes.push(TransformMode::ScaleSlb);
        }
        modes
    };
    let template = transform_all(&generated.template, &modes)?;

    let name = deployment_name(&session.resource_group);
    submit(
        session.cloud.as_ref(),
        &session.resource_group,
        &name,
        &template,
        &generated.parameters,
    )
    .await?;

    let mut stored = session.reload_stored(ctx).await?;
    stored.properties.agent_pool_profiles.push(pool.clone());
    session.persist(ctx, &stored).await?;

    info!(pool = %pool.name, "Node pool added");
    Ok(AddPoolOutcome {
        pool: pool.name,
        count: pool.count,
        deployment_name: name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ClusterTarget, ModelSource};
    use crate::testing::{context, fixture, write_model, MockCloud};
    use kestrel_cloud::{DeploymentResult, Pager, ScaleSet};
    use kestrel_common::versions::VersionPolicy;
    use kestrel_common::ErrorKind;
    use serde_json::{json, Value};
    use std::path::{Path, PathBuf};

    fn cluster(dir: &Path, availability: &str) -> PathBuf {
        let mut doc: Value =
            serde_json::from_slice(&std::fs::read(fixture("kubernetes.json")).expect("read"))
                .expect("json");
        doc["properties"]["agentPoolProfiles"][0]["availabilityProfile"] = json!(availability);
        write_model(dir, &doc)
    }

    fn new_pool(dir: &Path, name: &str, availability: &str) -> PathBuf {
        let path = dir.join("pool.json");
        let doc = json!({
            "name": name,
            "count": 2,
            "vmSize": "Standard_D2_v3",
            "availabilityProfile": availability,
        });
        std::fs::write(&path, serde_json::to_vec(&doc).expect("json")).expect("write");
        path
    }

    fn options(model: PathBuf, pool: PathBuf) -> AddPoolOptions {
        AddPoolOptions {
            target: ClusterTarget {
                model: ModelSource::api_model(model),
                location: "westus2".to_string(),
                resource_group: "kestrel-rg".to_string(),
            },
            node_pool_path: pool,
        }
    }

    fn vm_names(template: &Value) -> Vec<String> {
        template["resources"]
            .as_array()
            .map(|resources| {
                resources
                    .iter()
                    .filter(|r| r["type"] == "Microsoft.Compute/virtualMachines")
                    .filter_map(|r| r["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn pool_names(path: &Path) -> Vec<String> {
        let doc: Value = serde_json::from_slice(&std::fs::read(path).expect("read")).expect("json");
        doc["properties"]["agentPoolProfiles"]
            .as_array()
            .expect("pools")
            .iter()
            .filter_map(|p| p["name"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn story_an_availability_set_pool_is_added() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = cluster(dir.path(), "AvailabilitySet");
        let pool = new_pool(dir.path(), "pool2", "AvailabilitySet");

        // Chapter 1: only the new pool's VMs are deployed
        let mut cloud = MockCloud::new();
        cloud.expect_ensure_resource_group().returning(|_, _| Ok(()));
        cloud
            .expect_deploy_template()
            .withf(|rg, _, template, params| {
                let vms = vm_names(template);
                rg == "kestrel-rg"
                    && !vms.is_empty()
                    && vms.iter().all(|n| n.contains("pool2VMNamePrefix"))
                    && params["pool2Count"] == json!({"value": 2})
            })
            .times(1)
            .returning(|_, name, _, _| {
                Ok(DeploymentResult {
                    name: name.to_string(),
                    provisioning_state: "Succeeded".to_string(),
                    outputs: None,
                    body: String::new(),
                })
            });
        let ctx = context(cloud, VersionPolicy::builtin());

        let outcome = add_pool(&ctx, &options(model.clone(), pool)).await.expect("add pool");
        assert_eq!(outcome.pool, "pool2");
        assert!(outcome.deployment_name.starts_with("kestrel-rg-"));

        // Chapter 2: the stored model gains the pool
        assert_eq!(pool_names(&model), vec!["agentpool1", "pool2"]);
    }

    #[tokio::test]
    async fn an_existing_pool_name_is_rejected_before_deploying() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = cluster(dir.path(), "AvailabilitySet");
        let pool = new_pool(dir.path(), "agentpool1", "AvailabilitySet");

        let mut cloud = MockCloud::new();
        cloud.expect_ensure_resource_group().returning(|_, _| Ok(()));
        cloud.expect_deploy_template().never();
        let ctx = context(cloud, VersionPolicy::builtin());

        let err = add_pool(&ctx, &options(model.clone(), pool)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
        assert_eq!(pool_names(&model), vec!["agentpool1"]);
    }

    #[tokio::test]
    async fn mixed_availability_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = cluster(dir.path(), "VirtualMachineScaleSets");
        let pool = new_pool(dir.path(), "pool2", "AvailabilitySet");

        let mut cloud = MockCloud::new();
        cloud.expect_ensure_resource_group().returning(|_, _| Ok(()));
        cloud.expect_deploy_template().never();
        let ctx = context(cloud, VersionPolicy::builtin());

        let err = add_pool(&ctx, &options(model, pool)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelInvalid);
    }

    #[tokio::test]
    async fn a_scale_set_with_the_pool_name_blocks_the_add() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = cluster(dir.path(), "VirtualMachineScaleSets");
        let pool = new_pool(dir.path(), "pool2", "VirtualMachineScaleSets");

        let mut cloud = MockCloud::new();
        cloud.expect_ensure_resource_group().returning(|_, _| Ok(()));
        cloud.expect_list_virtual_machine_scale_sets().returning(|_| {
            Pager::from_pages(vec![vec![ScaleSet {
                name: "k8s-pool2-87654321-vmss".to_string(),
                ..Default::default()
            }]])
        });
        cloud.expect_deploy_template().never();
        let ctx = context(cloud, VersionPolicy::builtin());

        let err = add_pool(&ctx, &options(model, pool)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
        assert!(err.to_string().contains("already exists"));
    }
}
