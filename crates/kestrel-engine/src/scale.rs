//! `scale`: change the node count of one agent pool
//!
//! Availability-set pools are counted VM by VM. Scaling down drains and
//! deletes the highest indices; scaling up deploys only the new indices by
//! offsetting the pool's copy loop past the highest existing one. Scale set
//! pools are resized by redeploying the pool with the new capacity, without
//! draining.

use futures::future::join_all;
use tracing::info;

use kestrel_cloud::{CloudClient, VirtualMachine};
use kestrel_common::api::{AgentPoolProfile, ContainerService, DefaultsMode};
use kestrel_common::{Error, Result};
use kestrel_template::primitives::rewrite_indexed_variables;
use kestrel_template::{transform_all, GeneratedTemplate, TransformMode};

use crate::certs::ensure_certificates;
use crate::context::Context;
use crate::deployment::{deployment_name, submit};
use crate::drain::{drain_node, DrainOptions, DEFAULT_DRAIN_TIMEOUT};
use crate::inventory::{pool_scale_set, pool_vms};
use crate::kube_client::KubeClient;
use crate::kubeconfig::admin_client;
use crate::options::ScaleOptions;
use crate::session::ClusterSession;
use crate::vm_delete::clean_delete_vm;

/// What a scale did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOutcome {
    /// The pool already had the requested count
    Unchanged { count: usize },
    ScaledUp { from: usize, to: usize },
    ScaledDown { from: usize, to: usize },
}

/// The pool to scale: the named one, or the only one
pub fn select_pool<'a>(cs: &'a ContainerService, name: Option<&str>) -> Result<(usize, &'a AgentPoolProfile)> {
    let pools = &cs.properties.agent_pool_profiles;
    match name.filter(|n| !n.is_empty()) {
        Some(name) => pools
            .iter()
            .enumerate()
            .find(|(_, p)| p.name == name)
            .ok_or_else(|| {
                Error::invalid_args(format!(
                    "node pool {} was not found in the deployed api model",
                    name
                ))
            }),
        None if pools.len() == 1 => Ok((0, &pools[0])),
        None => Err(Error::invalid_args(
            "--node-pool must be specified when the api model has more than one node pool",
        )),
    }
}

/// Generate a template that describes only `pool`
///
/// Windows pools keep their original index in names and variables.
pub(crate) fn pool_template(
    ctx: &Context,
    cs: &ContainerService,
    pool: &AgentPoolProfile,
    pool_index: usize,
) -> Result<GeneratedTemplate> {
    let mut single = cs.clone();
    single.properties.agent_pool_profiles = vec![pool.clone()];
    let mut generated = ctx.generator.generate(&single)?;
    if pool.is_windows() {
        let prefix = cs.properties.agent_vm_prefix(pool, pool_index);
        rewrite_indexed_variables(&mut generated.template, &pool.name, pool_index, &prefix);
    }
    Ok(generated)
}

pub(crate) fn scale_modes(cs: &ContainerService, extra: &[TransformMode]) -> Vec<TransformMode> {
    let mut modes = vec![TransformMode::ScaleVmasUp];
    modes.extend_from_slice(extra);
    if cs.properties.is_standard_load_balancer() {
        modes.push(TransformMode::ScaleSlb);
    }
    modes
}

async fn remove_node(
    cloud: &dyn CloudClient,
    kube: &dyn KubeClient,
    resource_group: &str,
    vm: &VirtualMachine,
    drain: &DrainOptions,
) -> Result<()> {
    drain_node(kube, &vm.name, drain).await?;
    clean_delete_vm(cloud, resource_group, &vm.name).await
}

async fn scale_down_vmas(
    ctx: &Context,
    session: &ClusterSession,
    model: &ContainerService,
    opts: &ScaleOptions,
    victims: Vec<VirtualMachine>,
) -> Result<()> {
    let kube = admin_client(ctx, model, opts.master_fqdn.as_deref()).await?;
    let drain = DrainOptions::with_timeout(Some(opts.drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT)));
    let cloud = session.cloud.as_ref();

    info!(nodes = victims.len(), "Removing nodes");
    let results = join_all(victims.iter().map(|vm| {
        remove_node(cloud, kube.as_ref(), &session.resource_group, vm, &drain)
    }))
    .await;
    let failures: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
    match Error::from_node_failures(failures) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn scale_up_vmas(
    ctx: &Context,
    session: &ClusterSession,
    model: &ContainerService,
    pool: &AgentPoolProfile,
    pool_index: usize,
    count: usize,
    offset: usize,
) -> Result<()> {
    let generated = pool_template(ctx, model, pool, pool_index)?;
    let mut parameters = generated.parameters;
    parameters.set_pool_count(&pool.name, count);
    parameters.set_pool_offset(&pool.name, offset);

    let template = transform_all(&generated.template, &scale_modes(model, &[]))?;
    let name = deployment_name(&session.resource_group);
    submit(session.cloud.as_ref(), &session.resource_group, &name, &template, &parameters).await?;
    Ok(())
}

async fn scale_vmss(
    ctx: &Context,
    session: &ClusterSession,
    model: &ContainerService,
    pool: &AgentPoolProfile,
    pool_index: usize,
    desired: usize,
) -> Result<ScaleOutcome> {
    let cloud = session.cloud.as_ref();
    let current = pool_scale_set(cloud, &session.resource_group, &model.properties, pool, pool_index)
        .await?
        .map(|ss| ss.capacity as usize)
        .unwrap_or(0);
    if current == desired {
        info!(pool = %pool.name, count = current, "Pool already has the requested node count");
        return Ok(ScaleOutcome::Unchanged { count: current });
    }
    if desired < current {
        info!(pool = %pool.name, "Scale set pools are scaled down without draining");
    }

    let generated = pool_template(ctx, model, pool, pool_index)?;
    let mut parameters = generated.parameters;
    parameters.set_pool_count(&pool.name, desired);
    let template = transform_all(
        &generated.template,
        &scale_modes(model, &[TransformMode::StripImmutableVmssProps]),
    )?;
    let name = deployment_name(&session.resource_group);
    submit(cloud, &session.resource_group, &name, &template, &parameters).await?;

    Ok(if desired > current {
        ScaleOutcome::ScaledUp { from: current, to: desired }
    } else {
        ScaleOutcome::ScaledDown { from: current, to: desired }
    })
}

/// Record the new count on the stored model
async fn record_count(ctx: &Context, session: &ClusterSession, pool: &str, count: usize) -> Result<()> {
    let mut model = session.reload_stored(ctx).await?;
    if let Some(p) = model.properties.agent_pool_mut(pool) {
        p.count = count as i32;
    }
    session.persist(ctx, &model).await
}

/// Run `scale`
pub async fn scale(ctx: &Context, opts: &ScaleOptions) -> Result<ScaleOutcome> {
    let mut opts = opts.clone();
    opts.validate()?;
    let session = ClusterSession::open(ctx, &opts.target, DefaultsMode::Scale).await?;

    let (pool_index, pool) = select_pool(&session.model, opts.node_pool.as_deref())?;
    let pool = pool.clone();
    let desired = opts.new_node_count as usize;
    info!(pool = %pool.name, desired, "Scaling pool");

    let mut model = session.model.clone();
    ensure_certificates(ctx, &mut model.properties, session.certificates).await?;

    let outcome = if pool.is_virtual_machine_scale_sets() {
        scale_vmss(ctx, &session, &model, &pool, pool_index, desired).await?
    } else {
        let vms = pool_vms(
            session.cloud.as_ref(),
            &session.resource_group,
            &model.properties,
            &pool,
            pool_index,
        )
        .await?;
        let current = vms.len();
        let highest = vms.keys().next_back().copied();

        if current == desired {
            info!(pool = %pool.name, count = current, "Pool already has the requested node count");
            ScaleOutcome::Unchanged { count: current }
        } else if current > desired {
            let victims: Vec<VirtualMachine> =
                vms.into_values().rev().take(current - desired).collect();
            scale_down_vmas(ctx, &session, &model, &opts, victims).await?;
            ScaleOutcome::ScaledDown { from: current, to: desired }
        } else {
            // New VMs start past the highest index so gaps are never refilled
            let offset = highest.map(|h| h + 1).unwrap_or(0);
            let count = offset + desired - current;
            scale_up_vmas(ctx, &session, &model, &pool, pool_index, count, offset).await?;
            ScaleOutcome::ScaledUp { from: current, to: desired }
        }
    };

    if !matches!(outcome, ScaleOutcome::Unchanged { .. }) {
        record_count(ctx, &session, &pool.name, desired).await?;
    }
    info!(pool = %pool.name, ?outcome, "Scale finished");
    Ok(outcome)
}
