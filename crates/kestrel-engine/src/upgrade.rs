//! `upgrade`: move every node of a cluster to a new Kubernetes version
//!
//! Masters go first, one at a time: each is deleted and redeployed at its
//! own index by narrowing the master copy loop to that index. Scale set
//! pools are redeployed with the new version and then have each instance
//! swapped for a fresh one. Availability-set pools get one surge node, after
//! which every old node is drained, deleted and recreated at its index; the
//! last one is not recreated because the surge node takes its place.
//!
//! A node's current version comes from its `orchestrator` tag, falling back
//! to the version its kubelet reports. Nodes already at the target are left
//! alone unless `--force` is given, so an interrupted upgrade can be re-run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use kestrel_cloud::{CloudClient, ScaleSet, ScaleSetVm, VirtualMachine};
use kestrel_common::api::{AgentPoolProfile, ContainerService, DefaultsMode, CLUSTER_INIT_COMPONENT};
use kestrel_common::naming::available_index;
use kestrel_common::poll::{wait_with_timeout, with_deadline};
use kestrel_common::versions::{KubernetesVersion, VersionPolicy};
use kestrel_common::{Error, Result, ResultExt};
use kestrel_template::{transform_all, GeneratedTemplate, Template, TransformMode};

use crate::certs::ensure_certificates;
use crate::context::Context;
use crate::deployment::{deployment_name, submit, upgrade_deployment_name};
use crate::drain::{drain_node, DrainOptions};
use crate::inventory::{agent_vm_name, master_vms, pool_scale_set, pool_vms, tagged_version, ORCHESTRATOR_TAG};
use crate::kube_client::{node_is_ready, node_version, KubeClient};
use crate::kubeconfig::admin_client;
use crate::options::UpgradeOptions;
use crate::session::ClusterSession;
use crate::vm_delete::clean_delete_vm;

/// Upper bound on a whole upgrade run
pub const CLUSTER_UPGRADE_TIMEOUT: Duration = Duration::from_secs(180 * 60);

/// Interval between node readiness checks
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What an upgrade did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOutcome {
    pub from: String,
    pub to: String,
    /// Masters created or replaced
    pub masters: usize,
    /// Agent VMs and scale set instances replaced
    pub agents: usize,
}

/// Reject targets the version policy does not offer, unless forced
pub fn check_upgrade_path(
    policy: &VersionPolicy,
    cs: &ContainerService,
    target: &str,
    force: bool,
) -> Result<()> {
    let props = &cs.properties;
    let current = props.orchestrator_version();
    if force {
        if current == target {
            info!(version = %target, "Forcing upgrade to the current version");
        }
        return Ok(());
    }
    if policy.is_upgrade_allowed(current, target, props.has_windows(), props.is_azure_stack()) {
        return Ok(());
    }
    Err(Error::unsupported_upgrade(current, target))
}

/// Lifecycle of an agent VM found during an upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentState {
    Upgraded,
    NotUpgraded,
    /// Mid-delete or in another transient state; keeps its index
    Ignored,
}

struct Upgrader<'a> {
    ctx: &'a Context,
    session: &'a ClusterSession,
    opts: &'a UpgradeOptions,
    model: ContainerService,
    generated: GeneratedTemplate,
    kube: Arc<dyn KubeClient>,
    target: String,
}

impl Upgrader<'_> {
    fn cloud(&self) -> &dyn CloudClient {
        self.session.cloud.as_ref()
    }

    fn resource_group(&self) -> &str {
        &self.session.resource_group
    }

    fn master_is_managed_disk(&self) -> bool {
        self.model
            .properties
            .master_profile
            .as_ref()
            .map(|m| m.is_managed_disks())
            .unwrap_or(false)
    }

    /// Jumpbox and load balancer handling every upgrade template shares
    fn modes(&self, core: TransformMode) -> Vec<TransformMode> {
        let props = &self.model.properties;
        let mut modes = Vec::new();
        if props.kubernetes_config().map(|k| k.has_jumpbox()).unwrap_or(false) {
            modes.push(TransformMode::RemoveJumpbox);
        }
        if props.is_standard_load_balancer() {
            modes.push(TransformMode::ScaleSlb);
        }
        modes.push(core);
        modes.push(TransformMode::StripImmutableVmssProps);
        modes
    }

    fn template(&self, core: TransformMode) -> Result<Template> {
        Ok(transform_all(&self.generated.template, &self.modes(core))?)
    }

    /// Version from the tag, else from the registered node
    async fn current_version(&self, name: &str, tag: Option<&str>) -> Option<String> {
        if let Some(v) = tagged_version(tag) {
            return Some(v.trim_start_matches('v').to_string());
        }
        warn!(vm = %name, "Expected tag \"orchestrator\" not found; asking the API server");
        match self.kube.get_node(&name.to_lowercase()).await {
            Ok(Some(node)) => node_version(&node).map(|v| v.trim_start_matches('v').to_string()),
            Ok(None) => None,
            Err(e) => {
                warn!(vm = %name, error = %e, "Failed to get node");
                None
            }
        }
    }

    /// Whether a node must be replaced; `None` when its version is unknown
    async fn needs_upgrade(&self, name: &str, tag: Option<&str>) -> Result<Option<bool>> {
        if self.opts.force {
            return Ok(Some(true));
        }
        let Some(current) = self.current_version(name, tag).await else {
            info!(vm = %name, "Skipping node as its version could not be determined");
            return Ok(None);
        };
        if current == self.target {
            return Ok(Some(false));
        }
        let props = &self.model.properties;
        let allowed = self.ctx.policy.is_upgrade_allowed(
            &current,
            &self.target,
            props.has_windows(),
            props.is_azure_stack(),
        );
        if !allowed && !props.is_hosted_master() {
            return Err(Error::unsupported_upgrade(current, &self.target));
        }
        Ok(Some(true))
    }

    async fn wait_ready(&self, vm_name: &str) -> Result<()> {
        let node = vm_name.to_lowercase();
        let kube = self.kube.clone();
        wait_with_timeout(None, READY_POLL_INTERVAL, &format!("node {} to be ready", node), || {
            let kube = kube.clone();
            let node = node.clone();
            async move {
                match kube.get_node(&node).await {
                    Ok(Some(n)) if node_is_ready(&n) => Ok(Some(())),
                    Ok(_) => {
                        debug!(node = %node, "Node not ready yet");
                        Ok(None)
                    }
                    Err(e) => {
                        debug!(node = %node, error = %e, "Node status error");
                        Ok(None)
                    }
                }
            }
        })
        .await?;
        info!(node = %node, "Node is ready");
        Ok(())
    }

    async fn drain(&self, node: &str) -> Result<()> {
        drain_node(
            self.kube.as_ref(),
            &node.to_lowercase(),
            &DrainOptions::with_timeout(self.opts.cordon_drain_timeout),
        )
        .await
    }

    async fn create_master(&self, template: &Template, index: usize) -> Result<()> {
        let mut parameters = self.generated.parameters.clone();
        parameters.set_master_offset(index);
        parameters.set_master_count(index + 1);
        let name = upgrade_deployment_name("master", index);
        info!(index, "Creating upgraded master VM");
        submit(self.cloud(), self.resource_group(), &name, template, &parameters).await?;
        let vm = format!("{}{}", self.model.properties.master_vm_prefix(), index);
        self.wait_ready(&vm).await
    }

    async fn upgrade_masters(&self) -> Result<usize> {
        let Some(master) = self.model.properties.master_profile.as_ref() else {
            return Ok(0);
        };
        let expected = master.count.max(0) as usize;
        let template = self.template(TransformMode::MasterUpgrade {
            preserve: BTreeSet::new(),
            master_is_managed_disk: self.master_is_managed_disk(),
        })?;

        let vms = master_vms(self.cloud(), self.resource_group(), &self.model.properties).await?;
        if vms.len() > expected {
            return Err(Error::internal(format!(
                "Total count of master VMs: {} exceeded expected count: {}",
                vms.len(),
                expected
            )));
        }

        let mut to_upgrade = Vec::new();
        for (index, vm) in &vms {
            match self.needs_upgrade(&vm.name, vm.tag(ORCHESTRATOR_TAG)).await? {
                Some(true) => to_upgrade.push((*index, vm.name.clone())),
                Some(false) => info!(vm = %vm.name, "Master is already at the target version"),
                None => {}
            }
        }
        info!(
            expected,
            found = vms.len(),
            to_upgrade = to_upgrade.len(),
            "Starting upgrade of master nodes"
        );

        let mut replaced = 0;
        // A previous run may have deleted a master without recreating it
        for index in (0..expected).filter(|i| !vms.contains_key(i)) {
            with_deadline(
                self.opts.step_timeout,
                &format!("recreating master {}", index),
                self.create_master(&template, index),
            )
            .await?;
            replaced += 1;
        }

        for (index, name) in to_upgrade {
            info!(vm = %name, "Upgrading master VM");
            with_deadline(self.opts.step_timeout, &format!("upgrading {}", name), async {
                clean_delete_vm(self.cloud(), self.resource_group(), &name).await?;
                self.create_master(&template, index).await
            })
            .await?;
            replaced += 1;
        }
        Ok(replaced)
    }

    async fn create_agent(
        &self,
        template: &Template,
        pool: &AgentPoolProfile,
        pool_index: usize,
        index: usize,
    ) -> Result<()> {
        let mut parameters = self.generated.parameters.clone();
        parameters.set_pool_count(&pool.name, index + 1);
        parameters.set_pool_offset(&pool.name, index);
        let vm = agent_vm_name(&self.model.properties, pool, pool_index, index);
        info!(vm = %vm, index, pool = %pool.name, "Creating agent node");
        let name = upgrade_deployment_name(&pool.name, index);
        submit(self.cloud(), self.resource_group(), &name, template, &parameters).await?;
        self.wait_ready(&vm).await
    }

    async fn remove_agent(&self, name: &str) -> Result<()> {
        self.drain(name).await?;
        clean_delete_vm(self.cloud(), self.resource_group(), name).await?;
        if let Err(e) = self.kube.delete_node(&name.to_lowercase()).await {
            warn!(node = %name, error = %e, "Failed to deregister node");
        }
        Ok(())
    }

    async fn classify_agents(
        &self,
        vms: BTreeMap<usize, VirtualMachine>,
    ) -> Result<BTreeMap<usize, (String, AgentState)>> {
        let mut agents = BTreeMap::new();
        for (index, vm) in vms {
            let state = match self.needs_upgrade(&vm.name, vm.tag(ORCHESTRATOR_TAG)).await? {
                Some(true) => AgentState::NotUpgraded,
                None => AgentState::Ignored,
                Some(false) => match vm.provisioning_state.as_str() {
                    "Creating" | "Updating" | "Succeeded" => AgentState::Upgraded,
                    _ if vm.is_failed() => {
                        info!(vm = %vm.name, "Deleting agent VM in a failed provisioning state");
                        clean_delete_vm(self.cloud(), self.resource_group(), &vm.name).await?;
                        continue;
                    }
                    other => {
                        info!(vm = %vm.name, state = %other, "Ignoring agent VM");
                        AgentState::Ignored
                    }
                },
            };
            agents.insert(index, (vm.name, state));
        }
        Ok(agents)
    }

    async fn upgrade_vmas_pool(&self, pool_index: usize, pool: &AgentPoolProfile) -> Result<usize> {
        let template = self.template(TransformMode::AgentUpgrade {
            preserve: BTreeSet::from([pool.name.clone()]),
            master_is_managed_disk: self.master_is_managed_disk(),
        })?;
        let vms = pool_vms(self.cloud(), self.resource_group(), &self.model.properties, pool, pool_index)
            .await?;
        let mut agents = self.classify_agents(vms).await?;

        let count_of = |agents: &BTreeMap<usize, (String, AgentState)>, state| {
            agents.values().filter(|(_, s)| *s == state).count()
        };
        let to_upgrade = count_of(&agents, AgentState::NotUpgraded);
        let mut upgraded = count_of(&agents, AgentState::Upgraded);
        let mut target_count = pool.count.max(0) as usize;
        if target_count == 0 {
            info!(pool = %pool.name, "Agent pool is empty");
            return Ok(0);
        }
        info!(pool = %pool.name, to_upgrade, of = target_count, "Starting upgrade of agent nodes");

        // One surge node takes the load of the node being replaced
        if to_upgrade > 0 {
            target_count += 1;
        }
        while upgraded + to_upgrade < target_count {
            let index = available_index(&agents.keys().copied().collect());
            with_deadline(
                self.opts.step_timeout,
                &format!("creating agent {} of pool {}", index, pool.name),
                self.create_agent(&template, pool, pool_index, index),
            )
            .await?;
            let name = agent_vm_name(&self.model.properties, pool, pool_index, index);
            agents.insert(index, (name, AgentState::Upgraded));
            upgraded += 1;
        }
        if to_upgrade == 0 {
            info!(pool = %pool.name, "No nodes to upgrade");
            return Ok(0);
        }

        let old: Vec<(usize, String)> = agents
            .iter()
            .filter(|(_, (_, s))| *s == AgentState::NotUpgraded)
            .map(|(i, (name, _))| (*i, name.clone()))
            .collect();
        for (done, (index, name)) in old.into_iter().enumerate() {
            info!(vm = %name, pool = %pool.name, "Upgrading agent VM");
            let is_last = done + 1 == to_upgrade;
            with_deadline(self.opts.step_timeout, &format!("upgrading {}", name), async {
                self.remove_agent(&name).await?;
                if is_last {
                    info!(vm = %name, index, "Skipping creation of the last VM in favor of the surge node");
                    return Ok(());
                }
                self.create_agent(&template, pool, pool_index, index).await
            })
            .await?;
        }
        Ok(to_upgrade)
    }

    async fn scale_sets_to_upgrade(&self) -> Result<Vec<(ScaleSet, Vec<ScaleSetVm>)>> {
        let mut sets = Vec::new();
        for (pool_index, pool) in self.model.properties.agent_pool_profiles.iter().enumerate() {
            if !pool.is_virtual_machine_scale_sets() {
                continue;
            }
            let Some(ss) =
                pool_scale_set(self.cloud(), self.resource_group(), &self.model.properties, pool, pool_index)
                    .await?
            else {
                warn!(pool = %pool.name, "No scale set found for pool");
                continue;
            };
            let instances = self
                .cloud()
                .list_scale_set_vms(self.resource_group(), &ss.name)
                .collect_all()
                .await
                .with_context(|| format!("listing instances of {}", ss.name))?;
            let mut stale = Vec::new();
            for vm in instances {
                let tag = vm.tags.get(ORCHESTRATOR_TAG).map(String::as_str);
                if self.needs_upgrade(&vm.computer_name, tag).await? == Some(true) {
                    stale.push(vm);
                }
            }
            sets.push((ss, stale));
        }
        Ok(sets)
    }

    async fn upgrade_scale_sets(&self) -> Result<usize> {
        let sets = self.scale_sets_to_upgrade().await?;
        if sets.iter().all(|(_, vms)| vms.is_empty()) {
            return Ok(0);
        }

        // New instances only get the target version once the scale set model has it
        info!("Deploying the agent scale sets template");
        let template = self.template(TransformMode::VmssPoolUpgrade)?;
        let name = deployment_name("agentscaleset");
        submit(self.cloud(), self.resource_group(), &name, &template, &self.generated.parameters)
            .await?;

        let mut replaced = 0;
        for (ss, vms) in sets {
            if vms.is_empty() {
                info!(scale_set = %ss.name, "No VMs to upgrade");
                continue;
            }
            let capacity = ss.capacity + 1;
            info!(scale_set = %ss.name, from = ss.capacity, to = capacity, "Swapping scale set instances");
            for vm in vms {
                with_deadline(self.opts.step_timeout, &format!("upgrading {}", vm.computer_name), async {
                    self.cloud()
                        .set_scale_set_capacity(self.resource_group(), &ss.name, capacity)
                        .await
                        .with_context(|| format!("setting capacity of {}", ss.name))?;
                    self.drain(&vm.computer_name).await?;
                    info!(vm = %vm.name, scale_set = %ss.name, "Deleting scale set instance");
                    self.cloud()
                        .delete_scale_set_vm(self.resource_group(), &ss.name, &vm.instance_id)
                        .await
                        .with_context(|| format!("deleting {} from {}", vm.name, ss.name))
                })
                .await?;
                replaced += 1;
            }
        }
        Ok(replaced)
    }

    async fn run(&self) -> Result<(usize, usize)> {
        let masters = self.upgrade_masters().await?;
        if self.opts.control_plane_only {
            return Ok((masters, 0));
        }
        let mut agents = self.upgrade_scale_sets().await?;
        for (pool_index, pool) in self.model.properties.agent_pool_profiles.iter().enumerate() {
            if !pool.is_virtual_machine_scale_sets() {
                agents += self.upgrade_vmas_pool(pool_index, pool).await?;
            }
        }
        Ok((masters, agents))
    }
}

/// Run `upgrade`
pub async fn upgrade(ctx: &Context, opts: &UpgradeOptions) -> Result<UpgradeOutcome> {
    let mut opts = opts.clone();
    opts.validate()?;
    let session = ClusterSession::open(ctx, &opts.target, DefaultsMode::Upgrade).await?;
    let from = session.model.properties.orchestrator_version().to_string();
    let target = opts.upgrade_version.clone();
    check_upgrade_path(&ctx.policy, &session.model, &target, opts.force)?;

    let mut model = session.model.clone();
    if let Some(profile) = model.properties.orchestrator_profile.as_mut() {
        profile.orchestrator_version = target.clone();
    }
    // cluster-init only runs on create
    if let Some(component) = model
        .properties
        .kubernetes_config_mut()
        .component_mut(CLUSTER_INIT_COMPONENT)
    {
        component.enabled = Some(false);
    }
    ensure_certificates(ctx, &mut model.properties, session.certificates).await?;
    let generated = ctx.generator.generate(&model)?;
    let kube = admin_client(ctx, &model, None).await?;

    info!(from = %from, to = %target, "Upgrading cluster");
    let upgrader = Upgrader {
        ctx,
        session: &session,
        opts: &opts,
        model,
        generated,
        kube,
        target: target.clone(),
    };
    let (masters, agents) =
        with_deadline(Some(CLUSTER_UPGRADE_TIMEOUT), "cluster upgrade", upgrader.run()).await?;

    let mut stored = session.reload_stored(ctx).await?;
    if let Some(profile) = stored.properties.orchestrator_profile.as_mut() {
        profile.orchestrator_version = target.clone();
        profile.orchestrator_release = KubernetesVersion::parse(&target)
            .map(|v| v.release())
            .unwrap_or_default();
    }
    session.persist(ctx, &stored).await?;

    info!(version = %target, masters, agents, "Cluster upgraded");
    Ok(UpgradeOutcome {
        from,
        to: target,
        masters,
        agents,
    })
}
