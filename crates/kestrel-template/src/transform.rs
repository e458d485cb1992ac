//! Verb-specific template transformation
//!
//! A freshly generated template describes the whole cluster. Post-deploy verbs
//! must not recreate infrastructure the cluster already owns, so each verb
//! runs the template through one or more [`TransformMode`]s before submitting
//! it. Every mode is a pure function of its input and is idempotent.

use std::collections::BTreeSet;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::Result;
use crate::model::{Resource, ResourceType, Template};
use crate::primitives::{remove_dependencies, remove_resource_type, remove_resources, strip_property};

/// VMSS properties the platform rejects on update
pub const IMMUTABLE_VMSS_PROPERTIES: &[&str] = &[
    "platformFaultDomainCount",
    "singlePlacementGroup",
    "proximityPlacementGroup",
];

const MASTER_PREFIX_VARIABLE: &str = "variables('masterVMNamePrefix')";

/// Resource id of a master's etcd data disk
pub const ETCD_DISK_ID: &str = "[concat('/subscriptions/', variables('subscriptionId'), '/resourceGroups/', variables('resourceGroup'),'/providers/Microsoft.Compute/disks/', variables('masterVMNamePrefix'), copyIndex(variables('masterOffset')),'-etcddisk')]";

/// How a verb wants the template narrowed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformMode {
    /// Emit only a new availability-set pool
    AddVmasPool,
    /// Emit extra VMs without touching cluster-wide resources
    ScaleVmasUp,
    /// Keep the existing standard load balancer
    ScaleSlb,
    /// Replace masters, keeping agent pools named in `preserve`
    MasterUpgrade {
        preserve: BTreeSet<String>,
        master_is_managed_disk: bool,
    },
    /// Replace agents of the pools named in `preserve`
    AgentUpgrade {
        preserve: BTreeSet<String>,
        master_is_managed_disk: bool,
    },
    /// Strip private-cluster jumpbox resources
    RemoveJumpbox,
    /// Strip the KMS key vault
    RemoveKms,
    /// Drop VMSS properties that cannot change after creation
    StripImmutableVmssProps,
    /// Keep only agent scale sets and their role assignments
    VmssPoolUpgrade,
}

/// Apply one mode, returning a new template
pub fn transform(template: &Template, mode: &TransformMode) -> Result<Template> {
    let mut out = template.clone();
    apply(&mut out, mode)?;
    Ok(out)
}

/// Apply modes in order
pub fn transform_all(template: &Template, modes: &[TransformMode]) -> Result<Template> {
    let mut out = template.clone();
    for mode in modes {
        apply(&mut out, mode)?;
    }
    Ok(out)
}

fn apply(template: &mut Template, mode: &TransformMode) -> Result<()> {
    debug!(?mode, resources = template.resources.len(), "transforming template");
    match mode {
        TransformMode::AddVmasPool => add_vmas_pool(template),
        TransformMode::ScaleVmasUp => scale_vmas_up(template),
        TransformMode::ScaleSlb => {
            scale_slb(template);
            Ok(())
        }
        TransformMode::MasterUpgrade {
            preserve,
            master_is_managed_disk,
        } => master_upgrade(template, preserve, *master_is_managed_disk),
        TransformMode::AgentUpgrade {
            preserve,
            master_is_managed_disk,
        } => {
            master_upgrade(template, preserve, *master_is_managed_disk)?;
            scale_vmas_up(template)
        }
        TransformMode::RemoveJumpbox => {
            remove_jumpbox(template);
            Ok(())
        }
        TransformMode::RemoveKms => {
            remove_resources(template, |r| r.name_mentions("variables('clusterKeyVaultName"));
            Ok(())
        }
        TransformMode::StripImmutableVmssProps => {
            strip_immutable_vmss_properties(template);
            Ok(())
        }
        TransformMode::VmssPoolUpgrade => {
            vmss_pool_upgrade(template);
            Ok(())
        }
    }
}

fn is_master(resource: &Resource) -> bool {
    resource.name_mentions("variables('master")
}

fn is_jumpbox(resource: &Resource) -> bool {
    resource.name_mentions("variables('jumpbox") || resource.name_mentions("parameters('jumpbox")
}

/// Name references a variable of `pool`, e.g. `variables('agentpool1VMNamePrefix')`
///
/// Pool names are lowercase so the next character must be uppercase; this
/// keeps `agentpool1` from matching `agentpool10`.
fn mentions_pool(name: &str, pool: &str) -> bool {
    let needle = format!("variables('{}", pool);
    name.match_indices(&needle).any(|(start, _)| {
        name[start + needle.len()..]
            .chars()
            .next()
            .map(|c| c.is_ascii_uppercase())
            .unwrap_or(false)
    })
}

fn is_preserved(resource: &Resource, preserve: &BTreeSet<String>) -> bool {
    if let Some(pool) = resource.pool_name() {
        return preserve.contains(pool);
    }
    preserve.iter().any(|pool| mentions_pool(&resource.name, pool))
}

fn is_master_vm(resource: &Resource) -> bool {
    resource.kind == ResourceType::VirtualMachine
        && resource.pool_name().is_none()
        && resource.name_mentions(MASTER_PREFIX_VARIABLE)
}

fn is_windows_vm(resource: &Resource) -> bool {
    resource
        .property(&["osProfile", "windowsConfiguration"])
        .is_some()
}

fn remove_availability_sets(template: &mut Template) {
    remove_resources(template, |r| r.kind == ResourceType::AvailabilitySet);
    let type_name = ResourceType::AvailabilitySet.as_str().to_string();
    remove_dependencies(template, |dep| dep.contains(&type_name));
}

fn remove_cluster_network(template: &mut Template) -> Result<()> {
    remove_resource_type(template, &ResourceType::NetworkSecurityGroup, is_jumpbox)?;
    remove_resource_type(template, &ResourceType::RouteTable, |_| false)?;
    remove_resource_type(template, &ResourceType::VirtualNetwork, |_| false)
}

fn remove_jumpbox(template: &mut Template) {
    remove_resources(template, is_jumpbox);
}

fn strip_immutable_vmss_properties(template: &mut Template) {
    for property in IMMUTABLE_VMSS_PROPERTIES {
        strip_property(template, &[property], |r| r.kind == ResourceType::ScaleSet);
    }
}

fn scale_vmas_up(template: &mut Template) -> Result<()> {
    strip_property(template, &["hardwareProfile", "vmSize"], is_master_vm);
    strip_property(template, &["osProfile", "customData"], |r| {
        is_master_vm(r) && !is_windows_vm(r)
    });
    strip_property(template, &["storageProfile", "dataDisks"], is_master_vm);
    strip_property(template, &["storageProfile", "imageReference"], is_master_vm);

    remove_resources(template, |r| {
        r.kind == ResourceType::VmExtension && is_master(r)
    });
    remove_cluster_network(template)?;
    remove_availability_sets(template);
    template.outputs = None;
    Ok(())
}

fn scale_slb(template: &mut Template) {
    remove_resources(template, |r| {
        r.kind == ResourceType::LoadBalancer && r.name_mentions("variables('agentLbName')")
    });
    let lb_type = ResourceType::LoadBalancer.as_str().to_string();
    let key_vault_type = ResourceType::KeyVault.as_str().to_string();
    remove_dependencies(template, |dep| {
        dep.contains(&lb_type) || dep.contains("variables('agentLbID')") || dep.contains(&key_vault_type)
    });
}

fn add_vmas_pool(template: &mut Template) -> Result<()> {
    strip_immutable_vmss_properties(template);
    remove_jumpbox(template);
    remove_resources(template, |r| {
        is_master(r) || r.name_mentions("variables('agentPublicIPAddressName')")
    });
    template.outputs = None;
    remove_cluster_network(template)
}

fn master_upgrade(
    template: &mut Template,
    preserve: &BTreeSet<String>,
    master_is_managed_disk: bool,
) -> Result<()> {
    remove_resources(template, |r| {
        r.kind == ResourceType::VirtualMachine
            && r.pool_name().map(|pool| !preserve.contains(pool)).unwrap_or(false)
    });
    for resource in template.resources.iter_mut().filter(|r| is_master_vm(r)) {
        attach_etcd_disk(resource, master_is_managed_disk);
    }

    remove_resources(template, |r| {
        matches!(
            r.kind,
            ResourceType::VmExtension
                | ResourceType::NetworkInterface
                | ResourceType::ScaleSet
                | ResourceType::RoleAssignment
        ) && !is_master(r)
            && !is_preserved(r, preserve)
    });
    remove_availability_sets(template);

    let pre_existing: Vec<String> = [
        ResourceType::NetworkSecurityGroup,
        ResourceType::RouteTable,
        ResourceType::VirtualNetwork,
        ResourceType::AvailabilitySet,
    ]
    .iter()
    .flat_map(|kind| {
        let mut needles = vec![kind.as_str().to_string()];
        needles.extend(kind.id_variable().map(|v| format!("variables('{}')", v)));
        needles
    })
    .collect();
    remove_dependencies(template, |dep| pre_existing.iter().any(|n| dep.contains(n)));

    remove_cluster_network(template)?;
    template.outputs = None;
    Ok(())
}

/// Reattach the existing etcd disk instead of creating an empty one
fn attach_etcd_disk(vm: &mut Resource, managed_disk: bool) {
    let Some(disk) = vm
        .property_object_mut(&["storageProfile"])
        .and_then(|storage| storage.get_mut("dataDisks"))
        .and_then(Value::as_array_mut)
        .and_then(|disks| disks.first_mut())
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    disk.insert("createOption".to_string(), json!("attach"));
    if managed_disk {
        disk.insert("managedDisk".to_string(), json!({ "id": ETCD_DISK_ID }));
    }
}

fn vmss_pool_upgrade(template: &mut Template) {
    remove_resources(template, |r| {
        let agent_kind = matches!(r.kind, ResourceType::ScaleSet | ResourceType::RoleAssignment);
        !agent_kind
            || r.name_mentions(MASTER_PREFIX_VARIABLE)
            || r.name_mentions("variables('userAssignedID')")
    });
    for resource in &mut template.resources {
        resource.depends_on.clear();
    }
    template.outputs = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use serde_json::Map;

    const MASTER_VM: &str =
        "[concat(variables('masterVMNamePrefix'), copyIndex(variables('masterOffset')))]";
    const MASTER_NIC: &str =
        "[concat(variables('masterVMNamePrefix'), 'nic-', copyIndex(variables('masterOffset')))]";
    const MASTER_EXT: &str = "[concat(variables('masterVMNamePrefix'), copyIndex(variables('masterOffset')),'/cse-master-', copyIndex(variables('masterOffset')))]";

    fn pool_vm(pool: &str) -> String {
        format!(
            "[concat(variables('{p}VMNamePrefix'), copyIndex(variables('{p}Offset')))]",
            p = pool
        )
    }

    fn pool_nic(pool: &str) -> String {
        format!(
            "[concat(variables('{p}VMNamePrefix'), 'nic-', copyIndex(variables('{p}Offset')))]",
            p = pool
        )
    }

    fn depends(kind: &ResourceType, name: &str) -> String {
        let inner = name
            .strip_prefix("[concat(")
            .and_then(|s| s.strip_suffix(")]"))
            .or_else(|| name.strip_prefix('[').and_then(|s| s.strip_suffix(']')))
            .unwrap_or(name);
        format!("[concat('{}/', {})]", kind, inner)
    }

    /// A two-pool availability-set cluster with a jumpbox and an SLB
    fn cluster_template() -> Template {
        let mut resources = vec![
            Resource::new(ResourceType::NetworkSecurityGroup, "[variables('nsgName')]"),
            Resource::new(ResourceType::RouteTable, "[variables('routeTableName')]"),
            Resource::new(ResourceType::VirtualNetwork, "[variables('virtualNetworkName')]")
                .depends_on("[variables('nsgID')]")
                .depends_on("[variables('routeTableID')]"),
            Resource::new(ResourceType::PublicIpAddress, "[variables('masterPublicIPAddressName')]"),
            Resource::new(ResourceType::LoadBalancer, "[variables('masterLbName')]").depends_on(
                "[concat('Microsoft.Network/publicIPAddresses/', variables('masterPublicIPAddressName'))]",
            ),
            Resource::new(ResourceType::PublicIpAddress, "[variables('agentPublicIPAddressName')]"),
            Resource::new(ResourceType::LoadBalancer, "[variables('agentLbName')]").depends_on(
                "[concat('Microsoft.Network/publicIPAddresses/', variables('agentPublicIPAddressName'))]",
            ),
            Resource::new(ResourceType::AvailabilitySet, "[variables('masterAvailabilitySet')]"),
            Resource::new(ResourceType::NetworkInterface, MASTER_NIC)
                .depends_on("[variables('vnetID')]")
                .depends_on(depends(&ResourceType::LoadBalancer, "[variables('masterLbName')]")),
            Resource::new(ResourceType::VirtualMachine, MASTER_VM)
                .depends_on(depends(&ResourceType::NetworkInterface, MASTER_NIC))
                .depends_on(depends(
                    &ResourceType::AvailabilitySet,
                    "[variables('masterAvailabilitySet')]",
                ))
                .properties(json!({
                    "hardwareProfile": {"vmSize": "[variables('masterVMSize')]"},
                    "osProfile": {"customData": "[variables('masterCustomData')]", "linuxConfiguration": {}},
                    "storageProfile": {
                        "imageReference": {"offer": "ubuntu"},
                        "dataDisks": [{"createOption": "Empty", "lun": 0, "diskSizeGB": 256}]
                    }
                })),
            Resource::new(ResourceType::VmExtension, MASTER_EXT)
                .depends_on(depends(&ResourceType::VirtualMachine, MASTER_VM)),
            Resource::new(ResourceType::NetworkSecurityGroup, "[variables('jumpboxNetworkSecurityGroupName')]"),
            Resource::new(ResourceType::NetworkInterface, "[variables('jumpboxNetworkInterfaceName')]")
                .depends_on("[variables('vnetID')]")
                .depends_on(depends(
                    &ResourceType::NetworkSecurityGroup,
                    "[variables('jumpboxNetworkSecurityGroupName')]",
                )),
            Resource::new(ResourceType::VirtualMachine, "[parameters('jumpboxVMName')]").depends_on(
                depends(&ResourceType::NetworkInterface, "[variables('jumpboxNetworkInterfaceName')]"),
            ),
        ];
        for pool in ["agentpool1", "agentpool2"] {
            let avset = format!("[variables('{}AvailabilitySet')]", pool);
            resources.push(Resource::new(ResourceType::AvailabilitySet, avset.clone()));
            resources.push(
                Resource::new(ResourceType::NetworkInterface, pool_nic(pool))
                    .depends_on("[variables('vnetID')]")
                    .depends_on("[variables('agentLbID')]"),
            );
            resources.push(
                Resource::new(ResourceType::VirtualMachine, pool_vm(pool))
                    .tag("poolName", pool)
                    .depends_on(depends(&ResourceType::NetworkInterface, &pool_nic(pool)))
                    .depends_on(depends(&ResourceType::AvailabilitySet, &avset)),
            );
            resources.push(
                Resource::new(
                    ResourceType::VmExtension,
                    format!(
                        "[concat(variables('{p}VMNamePrefix'), copyIndex(variables('{p}Offset')),'/cse-agent-', copyIndex(variables('{p}Offset')))]",
                        p = pool
                    ),
                )
                .depends_on(depends(&ResourceType::VirtualMachine, &pool_vm(pool))),
            );
        }
        let mut outputs = Map::new();
        outputs.insert("masterFQDN".into(), json!({"type": "string"}));
        Template {
            resources,
            outputs: Some(outputs),
            ..Default::default()
        }
    }

    fn names(template: &Template) -> Vec<&str> {
        template.resources.iter().map(|r| r.name.as_str()).collect()
    }

    fn canonical(template: &Template) -> String {
        serde_json::to_string(&template.to_value().expect("serializes")).expect("prints")
    }

    fn all_modes() -> Vec<TransformMode> {
        let preserve: BTreeSet<String> = ["agentpool2".to_string()].into();
        vec![
            TransformMode::AddVmasPool,
            TransformMode::ScaleVmasUp,
            TransformMode::ScaleSlb,
            TransformMode::MasterUpgrade {
                preserve: BTreeSet::new(),
                master_is_managed_disk: true,
            },
            TransformMode::AgentUpgrade {
                preserve,
                master_is_managed_disk: false,
            },
            TransformMode::RemoveJumpbox,
            TransformMode::RemoveKms,
            TransformMode::StripImmutableVmssProps,
            TransformMode::VmssPoolUpgrade,
        ]
    }

    #[test]
    fn the_fixture_has_no_dangling_dependencies() {
        assert_eq!(cluster_template().dangling_dependencies(), vec![]);
    }

    #[test]
    fn scale_up_removes_exactly_one_vnet() {
        let out = transform(&cluster_template(), &TransformMode::ScaleVmasUp).expect("transforms");
        assert_eq!(out.count_of(&ResourceType::VirtualNetwork), 0);
        for resource in &out.resources {
            for dep in &resource.depends_on {
                assert!(!dep.contains("vnetID"), "{} still depends on {}", resource.name, dep);
            }
        }

        let mut doubled = cluster_template();
        doubled.resources.push(Resource::new(
            ResourceType::VirtualNetwork,
            "[variables('virtualNetworkName')]",
        ));
        let err = transform(&doubled, &TransformMode::ScaleVmasUp).unwrap_err();
        assert!(matches!(err, TransformError::Malformed { .. }));
    }

    #[test]
    fn scale_up_strips_immutable_master_properties() {
        let out = transform(&cluster_template(), &TransformMode::ScaleVmasUp).expect("transforms");
        let master = out.resources.iter().find(|r| r.name == MASTER_VM).expect("master kept");
        assert!(master.property(&["hardwareProfile", "vmSize"]).is_none());
        assert!(master.property(&["osProfile", "customData"]).is_none());
        assert!(master.property(&["storageProfile", "dataDisks"]).is_none());
        assert!(master.property(&["storageProfile", "imageReference"]).is_none());
        assert!(!names(&out).contains(&MASTER_EXT));
        assert_eq!(out.count_of(&ResourceType::AvailabilitySet), 0);
        assert_eq!(out.count_of(&ResourceType::RouteTable), 0);
        assert!(out.outputs.is_none());
        // jumpbox NSG is not the cluster NSG
        assert_eq!(out.count_of(&ResourceType::NetworkSecurityGroup), 1);
    }

    #[test]
    fn windows_masters_keep_custom_data() {
        let mut template = cluster_template();
        if let Some(master) = template.resources.iter_mut().find(|r| r.name == MASTER_VM) {
            if let Some(os) = master.property_object_mut(&["osProfile"]) {
                os.remove("linuxConfiguration");
                os.insert("windowsConfiguration".into(), json!({}));
            }
        }
        let out = transform(&template, &TransformMode::ScaleVmasUp).expect("transforms");
        let master = out.resources.iter().find(|r| r.name == MASTER_VM).expect("master kept");
        assert!(master.property(&["osProfile", "customData"]).is_some());
    }

    #[test]
    fn every_mode_is_idempotent() {
        for mode in all_modes() {
            let once = transform(&cluster_template(), &mode).expect("first pass");
            let twice = transform(&once, &mode).expect("second pass");
            assert_eq!(canonical(&once), canonical(&twice), "{:?} is not idempotent", mode);
        }
    }

    #[test]
    fn story_master_upgrade_keeps_only_the_control_plane() {
        let template = transform(&cluster_template(), &TransformMode::RemoveJumpbox).expect("jumpbox");
        let template = transform(&template, &TransformMode::ScaleSlb).expect("slb");
        let out = transform(
            &template,
            &TransformMode::MasterUpgrade {
                preserve: BTreeSet::new(),
                master_is_managed_disk: true,
            },
        )
        .expect("transforms");

        // Chapter 1: agent VMs, NICs and extensions are gone
        assert!(out.resources.iter().all(|r| r.pool_name().is_none()));
        assert!(!names(&out).iter().any(|n| n.contains("agentpool")));

        // Chapter 2: the master reattaches its etcd disk
        let master = out.resources.iter().find(|r| r.name == MASTER_VM).expect("master kept");
        let disk = master
            .property(&["storageProfile", "dataDisks"])
            .and_then(|d| d.get(0))
            .expect("data disk");
        assert_eq!(disk["createOption"], json!("attach"));
        assert_eq!(disk["managedDisk"]["id"], json!(ETCD_DISK_ID));

        // Chapter 3: cluster network and availability sets are treated as existing
        for kind in [
            ResourceType::NetworkSecurityGroup,
            ResourceType::RouteTable,
            ResourceType::VirtualNetwork,
            ResourceType::AvailabilitySet,
        ] {
            assert_eq!(out.count_of(&kind), 0, "{} survived", kind);
        }

        // Chapter 4: nothing depends on a resource that is not there
        assert_eq!(out.dangling_dependencies(), vec![]);
        assert!(out.outputs.is_none());
    }

    #[test]
    fn master_upgrade_keeps_preserved_pools() {
        let out = transform(
            &cluster_template(),
            &TransformMode::MasterUpgrade {
                preserve: ["agentpool2".to_string()].into(),
                master_is_managed_disk: false,
            },
        )
        .expect("transforms");
        assert!(names(&out).contains(&pool_vm("agentpool2").as_str()));
        assert!(names(&out).contains(&pool_nic("agentpool2").as_str()));
        assert!(!names(&out).contains(&pool_vm("agentpool1").as_str()));
        assert_eq!(out.dangling_dependencies(), vec![]);
        let master = out.resources.iter().find(|r| r.name == MASTER_VM).expect("master kept");
        assert!(master
            .property(&["storageProfile", "dataDisks"])
            .and_then(|d| d.get(0))
            .and_then(|d| d.get("managedDisk"))
            .is_none());
    }

    #[test]
    fn pool_names_do_not_match_longer_pool_names() {
        assert!(mentions_pool("[variables('agentpool1VMNamePrefix')]", "agentpool1"));
        assert!(!mentions_pool("[variables('agentpool10VMNamePrefix')]", "agentpool1"));
    }

    #[test]
    fn slb_scaling_keeps_the_master_load_balancer() {
        let out = transform(&cluster_template(), &TransformMode::ScaleSlb).expect("transforms");
        assert_eq!(out.count_of(&ResourceType::LoadBalancer), 1);
        assert!(out
            .resources
            .iter()
            .all(|r| r.depends_on.iter().all(|d| !d.contains("agentLbID"))));
    }

    #[test]
    fn add_pool_drops_the_control_plane() {
        let out = transform(&cluster_template(), &TransformMode::AddVmasPool).expect("transforms");
        assert!(!out.resources.iter().any(is_master));
        assert!(!out.resources.iter().any(is_jumpbox));
        assert_eq!(out.count_of(&ResourceType::VirtualNetwork), 0);
        assert!(names(&out).contains(&pool_vm("agentpool1").as_str()));
    }

    #[test]
    fn vmss_pool_upgrade_keeps_agent_scale_sets() {
        let template = Template {
            resources: vec![
                Resource::new(ResourceType::VirtualNetwork, "[variables('virtualNetworkName')]"),
                Resource::new(ResourceType::ScaleSet, "[concat(variables('masterVMNamePrefix'), 'vmss')]"),
                Resource::new(ResourceType::ScaleSet, "[variables('poolaVMNamePrefix')]")
                    .depends_on("[variables('vnetID')]")
                    .properties(json!({"singlePlacementGroup": true, "overprovision": false})),
                Resource::new(
                    ResourceType::RoleAssignment,
                    "[guid(concat(variables('userAssignedID'), 'roleAssignment'))]",
                ),
            ],
            ..Default::default()
        };
        let out = transform_all(
            &template,
            &[
                TransformMode::VmssPoolUpgrade,
                TransformMode::StripImmutableVmssProps,
            ],
        )
        .expect("transforms");
        assert_eq!(names(&out), vec!["[variables('poolaVMNamePrefix')]"]);
        assert!(out.resources[0].depends_on.is_empty());
        assert!(out.resources[0].property(&["singlePlacementGroup"]).is_none());
        assert!(out.resources[0].property(&["overprovision"]).is_some());
    }
}
