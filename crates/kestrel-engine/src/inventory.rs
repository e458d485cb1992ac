//! Finding the cluster's VMs and scale sets in a resource group
//!
//! A resource group may hold several clusters, so membership is decided by
//! tags where they exist and by the naming convention otherwise.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use kestrel_cloud::{CloudClient, ScaleSet, VirtualMachine};
use kestrel_common::api::{AgentPoolProfile, Properties};
use kestrel_common::naming::{parse_linux_vm_name, parse_vmss_name, parse_windows_vm_name};
use kestrel_common::{Result, ResultExt};

/// Tag naming the pool a resource belongs to
pub const POOL_NAME_TAG: &str = "poolName";
/// Tag carrying the cluster id
pub const NAME_SUFFIX_TAG: &str = "resourceNameSuffix";
/// Tag carrying `Kubernetes:{version}`
pub const ORCHESTRATOR_TAG: &str = "orchestrator";

static WINDOWS_VMSS_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([0-9a-fA-F]{4})k8s([0-9]{2})$").ok());

/// Kubernetes version from an `orchestrator` tag value
pub fn tagged_version(tag: Option<&str>) -> Option<&str> {
    tag.and_then(|t| t.split_once(':'))
        .map(|(_, version)| version)
        .filter(|v| !v.is_empty())
}

fn suffix_matches(tags_suffix: Option<&str>, cluster_id: &str) -> bool {
    tags_suffix.map(|s| s == cluster_id).unwrap_or(true)
}

/// Agent index of `vm` when it belongs to `pool`
///
/// The name must parse to this pool and cluster. Tags, when present, must
/// agree with the name.
pub fn pool_vm_index(
    vm: &VirtualMachine,
    props: &Properties,
    pool: &AgentPoolProfile,
    pool_index: usize,
) -> Option<usize> {
    let cluster_id = props.cluster_id();
    if !suffix_matches(vm.tag(NAME_SUFFIX_TAG), &cluster_id) {
        return None;
    }
    if vm.tag(POOL_NAME_TAG).is_some_and(|tag| tag != pool.name) {
        return None;
    }

    if pool.is_windows() {
        let parsed = parse_windows_vm_name(&vm.name).ok()?;
        let short: String = cluster_id.chars().take(4).collect();
        (parsed.prefix == short && parsed.pool_index == pool_index).then_some(parsed.agent_index)
    } else {
        let parsed = parse_linux_vm_name(&vm.name).ok()?;
        (parsed.pool == pool.name && parsed.cluster_id == cluster_id).then_some(parsed.index)
    }
}

/// Name of the VM at `agent_index` in `pool`
///
/// Windows names pad the agent index to three digits after the pool prefix.
pub fn agent_vm_name(
    props: &Properties,
    pool: &AgentPoolProfile,
    pool_index: usize,
    agent_index: usize,
) -> String {
    let prefix = props.agent_vm_prefix(pool, pool_index);
    if pool.is_windows() {
        format!("{}{:03}", prefix, agent_index)
    } else {
        format!("{}{}", prefix, agent_index)
    }
}

/// Pool VMs keyed by agent index
pub async fn pool_vms(
    cloud: &dyn CloudClient,
    resource_group: &str,
    props: &Properties,
    pool: &AgentPoolProfile,
    pool_index: usize,
) -> Result<BTreeMap<usize, VirtualMachine>> {
    let vms = cloud
        .list_virtual_machines(resource_group)
        .collect_all()
        .await
        .with_context(|| format!("listing VMs in {}", resource_group))?;
    let members: BTreeMap<usize, VirtualMachine> = vms
        .into_iter()
        .filter_map(|vm| pool_vm_index(&vm, props, pool, pool_index).map(|i| (i, vm)))
        .collect();
    debug!(pool = %pool.name, count = members.len(), "Found pool VMs");
    Ok(members)
}

/// Master VMs keyed by master index
pub async fn master_vms(
    cloud: &dyn CloudClient,
    resource_group: &str,
    props: &Properties,
) -> Result<BTreeMap<usize, VirtualMachine>> {
    let prefix = props.master_vm_prefix();
    let vms = cloud
        .list_virtual_machines(resource_group)
        .collect_all()
        .await
        .with_context(|| format!("listing VMs in {}", resource_group))?;
    Ok(vms
        .into_iter()
        .filter_map(|vm| {
            let index = vm.name.strip_prefix(&prefix)?.parse().ok()?;
            Some((index, vm))
        })
        .collect())
}

/// Whether `ss` is the scale set of `pool`
///
/// Linux scale sets must parse to the pool and carry its tag when tagged.
/// Windows names embed the pool index instead of the pool name.
pub fn is_pool_scale_set(
    ss: &ScaleSet,
    props: &Properties,
    pool: &AgentPoolProfile,
    pool_index: usize,
) -> bool {
    let cluster_id = props.cluster_id();
    if !suffix_matches(ss.tag(NAME_SUFFIX_TAG), &cluster_id) {
        return false;
    }
    if pool.is_windows() {
        let Some(caps) = WINDOWS_VMSS_NAME.as_ref().and_then(|re| re.captures(&ss.name)) else {
            return false;
        };
        let short: String = cluster_id.chars().take(4).collect();
        return caps[1] == short
            && caps[2].parse::<usize>().map(|i| i == pool_index).unwrap_or(false);
    }
    let Ok(parsed) = parse_vmss_name(&ss.name) else {
        return false;
    };
    parsed.pool == pool.name
        && parsed.cluster_id == cluster_id
        && ss.tag(POOL_NAME_TAG).map(|t| t == pool.name).unwrap_or(true)
}

/// The scale set of `pool`, if it exists
pub async fn pool_scale_set(
    cloud: &dyn CloudClient,
    resource_group: &str,
    props: &Properties,
    pool: &AgentPoolProfile,
    pool_index: usize,
) -> Result<Option<ScaleSet>> {
    let sets = cloud
        .list_virtual_machine_scale_sets(resource_group)
        .collect_all()
        .await
        .with_context(|| format!("listing scale sets in {}", resource_group))?;
    Ok(sets
        .into_iter()
        .find(|ss| is_pool_scale_set(ss, props, pool, pool_index)))
}
