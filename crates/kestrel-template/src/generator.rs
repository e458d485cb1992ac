//! ARM template generation from an API model
//!
//! Resource names are expressions over template variables
//! (`variables('masterVMNamePrefix')`, `variables('{pool}VMNamePrefix')`,
//! `variables('nsgName')`, ...). The transformer keys on those names, so they
//! are part of the contract between the two halves of this crate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};
use tracing::debug;

use kestrel_common::api::{AgentPoolProfile, ContainerService, MasterProfile, Properties};
use kestrel_common::{Error, Result, ORCHESTRATOR_NAME};

use crate::model::{Resource, ResourceType, Template};
use crate::params::Parameters;

/// A template together with the parameter values it was generated for
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTemplate {
    pub template: Template,
    pub parameters: Parameters,
}

/// Produces a deployment document from a defaulted API model
#[cfg_attr(test, mockall::automock)]
pub trait TemplateGenerator: Send + Sync {
    fn generate(&self, cs: &ContainerService) -> Result<GeneratedTemplate>;
}

/// Generator for Azure Resource Manager templates
#[derive(Debug, Clone, Default)]
pub struct ArmGenerator;

impl ArmGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl TemplateGenerator for ArmGenerator {
    fn generate(&self, cs: &ContainerService) -> Result<GeneratedTemplate> {
        let props = &cs.properties;
        let master = props
            .master_profile
            .as_ref()
            .ok_or_else(|| Error::model_invalid("properties.masterProfile", "required to generate a template"))?;
        if props.agent_pool_profiles.is_empty() {
            return Err(Error::model_invalid(
                "properties.agentPoolProfiles",
                "at least one pool is required to generate a template",
            ));
        }

        let mut builder = Builder::new(props);
        builder.declare_parameters(master);
        builder.network(master);
        builder.masters(master);
        for (index, pool) in props.agent_pool_profiles.iter().enumerate() {
            builder.pool(pool, index);
        }
        builder.identity();
        builder.kms();
        builder.jumpbox();
        builder.outputs();

        let parameters = parameter_values(cs, master);
        debug!(
            resources = builder.template.resources.len(),
            parameters = parameters.as_map().len(),
            "Generated ARM template"
        );
        Ok(GeneratedTemplate {
            template: builder.template,
            parameters,
        })
    }
}

fn resource_ref(kind: &ResourceType, name_args: &str) -> String {
    format!("[concat('{}/', {})]", kind, name_args)
}

fn copy_loop(name: &str, role: &str) -> Value {
    json!({
        "name": name,
        "count": format!("[sub(parameters('{r}Count'), parameters('{r}Offset'))]", r = role),
    })
}

struct Builder<'a> {
    props: &'a Properties,
    template: Template,
}

impl<'a> Builder<'a> {
    fn new(props: &'a Properties) -> Self {
        Self {
            props,
            template: Template::default(),
        }
    }

    fn variable(&mut self, name: &str, value: impl Into<Value>) {
        self.template.set_variable(name, value);
    }

    fn parameter(&mut self, name: &str, kind: &str, default: Option<Value>) {
        let mut decl = Map::new();
        decl.insert("type".to_string(), json!(kind));
        if let Some(default) = default {
            decl.insert("defaultValue".to_string(), default);
        }
        self.template
            .parameters
            .insert(name.to_string(), Value::Object(decl));
    }

    fn push(&mut self, resource: Resource) {
        self.template.resources.push(resource);
    }

    fn custom_vnet(&self) -> bool {
        self.props
            .master_profile
            .as_ref()
            .map(MasterProfile::is_custom_vnet)
            .unwrap_or(false)
    }

    fn declare_parameters(&mut self, master: &MasterProfile) {
        self.parameter("location", "string", None);
        self.parameter("nameSuffix", "string", Some(json!(self.props.cluster_id())));
        self.parameter("orchestratorVersion", "string", None);
        self.parameter("linuxAdminUsername", "string", None);
        self.parameter("sshRSAPublicKey", "string", None);
        self.parameter("servicePrincipalClientId", "securestring", None);
        self.parameter("servicePrincipalClientSecret", "securestring", None);
        for name in CERTIFICATE_PARAMETERS {
            self.parameter(name, "securestring", None);
        }
        for i in 0..self.props.master_count() {
            self.parameter(&format!("etcdPeerCertificate{}", i), "securestring", None);
            self.parameter(&format!("etcdPeerPrivateKey{}", i), "securestring", None);
        }
        self.parameter("masterCount", "int", Some(json!(master.count)));
        self.parameter("masterOffset", "int", Some(json!(0)));
        self.parameter("masterVMSize", "string", None);
        self.variable("masterOffset", "[parameters('masterOffset')]");
        self.variable("masterCount", "[parameters('masterCount')]");

        let props = self.props;
        for pool in &props.agent_pool_profiles {
            self.parameter(&format!("{}Count", pool.name), "int", Some(json!(pool.count)));
            self.parameter(&format!("{}Offset", pool.name), "int", Some(json!(0)));
            self.parameter(&format!("{}VMSize", pool.name), "string", None);
            self.variable(
                &format!("{}Offset", pool.name),
                format!("[parameters('{}Offset')]", pool.name),
            );
            self.variable(
                &format!("{}Count", pool.name),
                format!("[parameters('{}Count')]", pool.name),
            );
        }
        if self.props.has_windows() {
            self.parameter("windowsAdminUsername", "string", None);
            self.parameter("windowsAdminPassword", "securestring", None);
        }

        self.variable("subscriptionId", "[subscription().subscriptionId]");
        self.variable("resourceGroup", "[resourceGroup().name]");
        self.variable(
            "masterVMNamePrefix",
            format!("[concat('{}-master-', parameters('nameSuffix'), '-')]", ORCHESTRATOR_NAME),
        );
        self.variable("masterCustomData", custom_data("master"));
        self.variable("agentCustomData", custom_data("agent"));
    }

    fn network(&mut self, master: &MasterProfile) {
        self.variable("nsgName", "[concat(variables('masterVMNamePrefix'), 'nsg')]");
        self.variable(
            "nsgID",
            "[resourceId('Microsoft.Network/networkSecurityGroups', variables('nsgName'))]",
        );
        self.variable("routeTableName", "[concat(variables('masterVMNamePrefix'), 'routetable')]");
        self.variable(
            "routeTableID",
            "[resourceId('Microsoft.Network/routeTables', variables('routeTableName'))]",
        );
        self.variable(
            "virtualNetworkName",
            format!("[concat('{}-vnet-', parameters('nameSuffix'))]", ORCHESTRATOR_NAME),
        );
        self.variable(
            "vnetID",
            "[resourceId('Microsoft.Network/virtualNetworks', variables('virtualNetworkName'))]",
        );
        if self.custom_vnet() {
            self.variable("vnetSubnetID", master.vnet_subnet_id.clone());
            return;
        }
        self.variable("vnetSubnetID", "[concat(variables('vnetID'), '/subnets/subnet')]");

        self.push(
            Resource::new(ResourceType::NetworkSecurityGroup, "[variables('nsgName')]").properties(json!({
                "securityRules": [
                    security_rule("allow_ssh", 22, 101),
                    security_rule("allow_kube_tls", 443, 100),
                ]
            })),
        );
        self.push(
            Resource::new(ResourceType::RouteTable, "[variables('routeTableName')]")
                .with("location", json!("[parameters('location')]")),
        );
        let cluster_subnet = self
            .props
            .kubernetes_config()
            .map(|k| k.cluster_subnet.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "10.240.0.0/12".to_string());
        self.push(
            Resource::new(ResourceType::VirtualNetwork, "[variables('virtualNetworkName')]")
                .depends_on("[variables('nsgID')]")
                .depends_on("[variables('routeTableID')]")
                .properties(json!({
                    "addressSpace": {"addressPrefixes": [cluster_subnet]},
                    "subnets": [{
                        "name": "subnet",
                        "properties": {
                            "addressPrefix": cluster_subnet,
                            "networkSecurityGroup": {"id": "[variables('nsgID')]"},
                            "routeTable": {"id": "[variables('routeTableID')]"}
                        }
                    }]
                })),
        );
    }

    fn masters(&mut self, master: &MasterProfile) {
        self.variable("masterPublicIPAddressName", "[concat(variables('masterVMNamePrefix'), 'ip')]");
        self.variable("masterLbName", "[concat(variables('masterVMNamePrefix'), 'lb')]");
        self.variable(
            "masterInternalLbName",
            "[concat(variables('masterVMNamePrefix'), 'internal-lb')]",
        );
        self.variable("masterAvailabilitySet", "[concat(variables('masterVMNamePrefix'), 'availabilitySet')]");
        let (lb_sku, allocation) = if self.props.is_standard_load_balancer() {
            ("Standard", "Static")
        } else {
            ("Basic", "Dynamic")
        };

        self.push(
            Resource::new(ResourceType::PublicIpAddress, "[variables('masterPublicIPAddressName')]")
                .with("sku", json!({ "name": lb_sku }))
                .properties(json!({
                    "dnsSettings": {"domainNameLabel": self.props.dns_prefix()},
                    "publicIPAllocationMethod": allocation
                })),
        );
        self.push(
            Resource::new(ResourceType::LoadBalancer, "[variables('masterLbName')]")
                .with("sku", json!({ "name": lb_sku }))
                .depends_on(resource_ref(
                    &ResourceType::PublicIpAddress,
                    "variables('masterPublicIPAddressName')",
                )),
        );
        let mut internal_lb =
            Resource::new(ResourceType::LoadBalancer, "[variables('masterInternalLbName')]")
                .with("sku", json!({ "name": lb_sku }));
        if !self.custom_vnet() {
            internal_lb = internal_lb.depends_on("[variables('vnetID')]");
        }
        self.push(internal_lb);

        let nic_name =
            "variables('masterVMNamePrefix'), 'nic-', copyIndex(variables('masterOffset'))";
        let vm_name = "variables('masterVMNamePrefix'), copyIndex(variables('masterOffset'))";
        let [a, b, c, d] = master.first_master_ip().octets();
        self.variable("masterFirstAddrPrefix", format!("{}.{}.{}.", a, b, c));
        self.variable("masterFirstAddrOctet4", d);

        if master.is_virtual_machine_scale_sets() {
            let mut vmss = Resource::new(
                ResourceType::ScaleSet,
                "[concat(variables('masterVMNamePrefix'), 'vmss')]",
            )
            .tag("creationSource", "kestrel")
            .with("sku", json!({"name": master.vm_size, "capacity": "[parameters('masterCount')]"}))
            .depends_on(resource_ref(&ResourceType::LoadBalancer, "variables('masterLbName')"))
            .properties(json!({
                "singlePlacementGroup": true,
                "overprovision": false,
                "upgradePolicy": {"mode": "Manual"},
                "virtualMachineProfile": {
                    "osProfile": {
                        "computerNamePrefix": "[variables('masterVMNamePrefix')]",
                        "adminUsername": "[parameters('linuxAdminUsername')]",
                        "customData": "[variables('masterCustomData')]"
                    },
                    "storageProfile": {
                        "dataDisks": [{"createOption": "Empty", "diskSizeGB": 256, "lun": 0}]
                    }
                }
            }));
            if !self.custom_vnet() {
                vmss = vmss.depends_on("[variables('vnetID')]");
            }
            self.push(vmss);
            return;
        }

        self.push(
            Resource::new(ResourceType::AvailabilitySet, "[variables('masterAvailabilitySet')]").properties(
                json!({"platformFaultDomainCount": 2, "platformUpdateDomainCount": 3}),
            ),
        );
        let mut nic = Resource::new(ResourceType::NetworkInterface, format!("[concat({})]", nic_name))
            .with("copy", copy_loop("nicLoopNode", "master"))
            .depends_on(resource_ref(&ResourceType::LoadBalancer, "variables('masterLbName')"))
            .depends_on(resource_ref(&ResourceType::LoadBalancer, "variables('masterInternalLbName')"))
            .properties(json!({
                "ipConfigurations": [{
                    "name": "ipconfig1",
                    "properties": {
                        "privateIPAddress": "[concat(variables('masterFirstAddrPrefix'), add(copyIndex(variables('masterOffset')), variables('masterFirstAddrOctet4')))]",
                        "privateIPAllocationMethod": "Static",
                        "subnet": {"id": "[variables('vnetSubnetID')]"}
                    }
                }]
            }));
        if !self.custom_vnet() {
            nic = nic.depends_on("[variables('vnetID')]");
        }
        self.push(nic);

        let mut data_disk = json!({
            "createOption": "Empty",
            "diskSizeGB": 256,
            "lun": 0,
            "name": "[concat(variables('masterVMNamePrefix'), copyIndex(variables('masterOffset')),'-etcddisk')]"
        });
        if !master.is_managed_disks() {
            data_disk["vhd"] = json!({
                "uri": "[concat(reference(variables('masterStorageAccountName')).primaryEndpoints.blob, 'vhds/', variables('masterVMNamePrefix'), copyIndex(variables('masterOffset')), '-etcddisk.vhd')]"
            });
        }
        let os_disk_size = master.os_disk_size_gb.unwrap_or(128);
        let mut vm = Resource::new(ResourceType::VirtualMachine, format!("[concat({})]", vm_name))
            .with("copy", copy_loop("vmLoopNode", "master"))
            .tag("creationSource", "kestrel")
            .tag("resourceNameSuffix", "[parameters('nameSuffix')]")
            .tag("orchestrator", format!("Kubernetes:{}", self.props.orchestrator_version()))
            .depends_on(resource_ref(&ResourceType::NetworkInterface, nic_name))
            .depends_on(resource_ref(&ResourceType::AvailabilitySet, "variables('masterAvailabilitySet')"))
            .properties(json!({
                "availabilitySet": {"id": "[resourceId('Microsoft.Compute/availabilitySets', variables('masterAvailabilitySet'))]"},
                "hardwareProfile": {"vmSize": "[parameters('masterVMSize')]"},
                "networkProfile": {"networkInterfaces": [{"id": format!("[resourceId('Microsoft.Network/networkInterfaces', concat({}))]", nic_name)}]},
                "osProfile": {
                    "adminUsername": "[parameters('linuxAdminUsername')]",
                    "computerName": format!("[concat({})]", vm_name),
                    "customData": "[variables('masterCustomData')]",
                    "linuxConfiguration": {
                        "disablePasswordAuthentication": true,
                        "ssh": {"publicKeys": [{
                            "keyData": "[parameters('sshRSAPublicKey')]",
                            "path": "[concat('/home/', parameters('linuxAdminUsername'), '/.ssh/authorized_keys')]"
                        }]}
                    }
                },
                "storageProfile": {
                    "dataDisks": [data_disk],
                    "imageReference": ubuntu_image(),
                    "osDisk": {"caching": "ReadWrite", "createOption": "FromImage", "diskSizeGB": os_disk_size}
                }
            }));
        if !master.is_managed_disks() {
            self.variable(
                "masterStorageAccountName",
                "[concat(variables('masterVMNamePrefix'), 'sa')]",
            );
            self.push(Resource::new(
                ResourceType::StorageAccount,
                "[variables('masterStorageAccountName')]",
            ));
            vm = vm.depends_on(resource_ref(
                &ResourceType::StorageAccount,
                "variables('masterStorageAccountName')",
            ));
        }
        if self.props.uses_managed_identity() {
            vm = vm.with("identity", self.identity_block());
        }
        self.push(vm);
        self.push(
            Resource::new(
                ResourceType::VmExtension,
                "[concat(variables('masterVMNamePrefix'), copyIndex(variables('masterOffset')),'/cse-master-', copyIndex(variables('masterOffset')))]",
            )
            .with("copy", copy_loop("vmLoopNode", "master"))
            .depends_on(resource_ref(&ResourceType::VirtualMachine, vm_name))
            .properties(custom_script("master")),
        );
    }

    fn identity_block(&self) -> Value {
        let user_assigned = self
            .props
            .kubernetes_config()
            .map(|k| k.user_assigned_id.clone())
            .unwrap_or_default();
        if user_assigned.is_empty() {
            json!({"type": "systemAssigned"})
        } else {
            json!({
                "type": "userAssigned",
                "userAssignedIdentities": {"[variables('userAssignedIDReference')]": {}}
            })
        }
    }

    fn pool(&mut self, pool: &AgentPoolProfile, index: usize) {
        let p = pool.name.clone();
        let prefix_var = format!("{}VMNamePrefix", p);
        if pool.is_windows() {
            self.variable(&format!("{}Index", p), index);
            self.variable(&prefix_var, self.props.agent_vm_prefix(pool, index));
        } else {
            let suffix = if pool.is_virtual_machine_scale_sets() { "vmss" } else { "" };
            self.variable(
                &prefix_var,
                format!(
                    "[concat('{}-{}-', parameters('nameSuffix'), '-{}')]",
                    ORCHESTRATOR_NAME, p, suffix
                ),
            );
        }
        let standard_lb = self.props.is_standard_load_balancer();
        if standard_lb && !self.template.variables.contains_key("agentLbName") {
            self.agent_load_balancer();
        }

        let os_profile = if pool.is_windows() {
            json!({
                "adminUsername": "[parameters('windowsAdminUsername')]",
                "adminPassword": "[parameters('windowsAdminPassword')]",
                "customData": "[variables('agentCustomData')]",
                "windowsConfiguration": {"enableAutomaticUpdates": false}
            })
        } else {
            json!({
                "adminUsername": "[parameters('linuxAdminUsername')]",
                "customData": "[variables('agentCustomData')]",
                "linuxConfiguration": {"disablePasswordAuthentication": true}
            })
        };
        let data_disks: Vec<Value> = pool
            .disk_sizes_gb
            .iter()
            .enumerate()
            .map(|(lun, size)| json!({"createOption": "Empty", "diskSizeGB": size, "lun": lun}))
            .collect();
        let image = if pool.is_windows() {
            windows_image()
        } else {
            ubuntu_image()
        };
        let storage_profile = json!({
            "dataDisks": data_disks,
            "imageReference": image,
            "osDisk": {"caching": "ReadWrite", "createOption": "FromImage", "diskSizeGB": pool.os_disk_size_gb.unwrap_or(128)}
        });
        let orchestrator_tag = format!("Kubernetes:{}", self.props.orchestrator_version());

        if pool.is_virtual_machine_scale_sets() {
            let mut vmss = Resource::new(ResourceType::ScaleSet, format!("[variables('{}')]", prefix_var))
                .tag("poolName", p.clone())
                .tag("creationSource", "kestrel")
                .tag("resourceNameSuffix", "[parameters('nameSuffix')]")
                .tag("orchestrator", orchestrator_tag)
                .with("sku", json!({"name": format!("[parameters('{}VMSize')]", p), "tier": "Standard", "capacity": format!("[parameters('{}Count')]", p)}))
                .properties(json!({
                    "singlePlacementGroup": true,
                    "platformFaultDomainCount": 1,
                    "overprovision": false,
                    "upgradePolicy": {"mode": "Manual"},
                    "virtualMachineProfile": {
                        "osProfile": os_profile,
                        "storageProfile": storage_profile,
                        "networkProfile": {"networkInterfaceConfigurations": [{
                            "name": format!("[variables('{}')]", prefix_var),
                            "properties": {"primary": true, "ipConfigurations": [{
                                "name": "ipconfig1",
                                "properties": {"subnet": {"id": "[variables('vnetSubnetID')]"}}
                            }]}
                        }]}
                    }
                }));
            if !self.custom_vnet() {
                vmss = vmss.depends_on("[variables('vnetID')]");
            }
            if standard_lb {
                vmss = vmss.depends_on("[variables('agentLbID')]");
            }
            if self.props.uses_managed_identity() {
                vmss = vmss.with("identity", self.identity_block());
            }
            self.push(vmss);
            return;
        }

        let avset_var = format!("{}AvailabilitySet", p);
        self.variable(&avset_var, format!("[concat('{}-availabilitySet-', parameters('nameSuffix'))]", p));
        self.push(
            Resource::new(ResourceType::AvailabilitySet, format!("[variables('{}')]", avset_var))
                .properties(json!({"platformFaultDomainCount": 2, "platformUpdateDomainCount": 3})),
        );

        let offset = format!("copyIndex(variables('{}Offset'))", p);
        let nic_name = format!("variables('{}'), 'nic-', {}", prefix_var, offset);
        let vm_name = format!("variables('{}'), {}", prefix_var, offset);
        let mut nic = Resource::new(ResourceType::NetworkInterface, format!("[concat({})]", nic_name))
            .with("copy", copy_loop("loop", &p))
            .properties(json!({
                "ipConfigurations": [{
                    "name": "ipconfig1",
                    "properties": {
                        "primary": true,
                        "privateIPAllocationMethod": "Dynamic",
                        "subnet": {"id": "[variables('vnetSubnetID')]"}
                    }
                }]
            }));
        if !self.custom_vnet() {
            nic = nic.depends_on("[variables('vnetID')]");
        }
        if standard_lb {
            nic = nic.depends_on("[variables('agentLbID')]");
        }
        self.push(nic);

        let mut vm = Resource::new(ResourceType::VirtualMachine, format!("[concat({})]", vm_name))
            .with("copy", copy_loop("vmLoopNode", &p))
            .tag("poolName", p.clone())
            .tag("creationSource", "kestrel")
            .tag("resourceNameSuffix", "[parameters('nameSuffix')]")
            .tag("orchestrator", orchestrator_tag)
            .depends_on(resource_ref(&ResourceType::NetworkInterface, &nic_name))
            .depends_on(resource_ref(&ResourceType::AvailabilitySet, &format!("variables('{}')", avset_var)))
            .properties(json!({
                "availabilitySet": {"id": format!("[resourceId('Microsoft.Compute/availabilitySets', variables('{}'))]", avset_var)},
                "hardwareProfile": {"vmSize": format!("[parameters('{}VMSize')]", p)},
                "networkProfile": {"networkInterfaces": [{"id": format!("[resourceId('Microsoft.Network/networkInterfaces', concat({}))]", nic_name)}]},
                "osProfile": os_profile,
                "storageProfile": storage_profile
            }));
        if self.props.uses_managed_identity() {
            vm = vm.with("identity", self.identity_block());
        }
        self.push(vm);
        self.push(
            Resource::new(
                ResourceType::VmExtension,
                format!("[concat(variables('{}'), {},'/cse-agent-', {})]", prefix_var, offset, offset),
            )
            .with("copy", copy_loop("vmLoopNode", &p))
            .depends_on(resource_ref(&ResourceType::VirtualMachine, &vm_name))
            .properties(custom_script("agent")),
        );
    }

    fn agent_load_balancer(&mut self) {
        self.variable("agentLbName", "[parameters('nameSuffix')]");
        self.variable(
            "agentLbID",
            "[resourceId('Microsoft.Network/loadBalancers', variables('agentLbName'))]",
        );
        self.variable(
            "agentPublicIPAddressName",
            "[concat(parameters('nameSuffix'), '-agent-outbound-ip')]",
        );
        self.push(
            Resource::new(ResourceType::PublicIpAddress, "[variables('agentPublicIPAddressName')]")
                .with("sku", json!({"name": "Standard"}))
                .properties(json!({"publicIPAllocationMethod": "Static"})),
        );
        self.push(
            Resource::new(ResourceType::LoadBalancer, "[variables('agentLbName')]")
                .with("sku", json!({"name": "Standard"}))
                .depends_on(resource_ref(
                    &ResourceType::PublicIpAddress,
                    "variables('agentPublicIPAddressName')",
                )),
        );
    }

    fn identity(&mut self) {
        if !self.props.uses_managed_identity() {
            return;
        }
        let user_assigned = self
            .props
            .kubernetes_config()
            .map(|k| k.user_assigned_id.clone())
            .unwrap_or_default();
        if user_assigned.is_empty() {
            let vms = self
                .props
                .master_profile
                .as_ref()
                .map(|m| !m.is_virtual_machine_scale_sets())
                .unwrap_or(false);
            if vms {
                self.push(
                    Resource::new(
                        ResourceType::RoleAssignment,
                        "[guid(concat('Microsoft.Compute/virtualMachines/', variables('masterVMNamePrefix'), copyIndex(variables('masterOffset')), 'vmidentity'))]",
                    )
                    .with("copy", copy_loop("vmLoopNode", "master"))
                    .depends_on(resource_ref(
                        &ResourceType::VirtualMachine,
                        "variables('masterVMNamePrefix'), copyIndex(variables('masterOffset'))",
                    ))
                    .properties(json!({
                        "roleDefinitionId": "[variables('contributorRoleDefinitionId')]",
                        "principalId": "[reference(concat('Microsoft.Compute/virtualMachines/', variables('masterVMNamePrefix'), copyIndex(variables('masterOffset'))), '2019-07-01', 'Full').identity.principalId]"
                    })),
                );
            }
            self.variable(
                "contributorRoleDefinitionId",
                "[concat('/subscriptions/', subscription().subscriptionId, '/providers/Microsoft.Authorization/roleDefinitions/', 'b24988ac-6180-42a0-ab88-20f7382dd24c')]",
            );
            return;
        }
        self.variable("userAssignedID", user_assigned);
        self.variable(
            "userAssignedIDReference",
            "[resourceId('Microsoft.ManagedIdentity/userAssignedIdentities', variables('userAssignedID'))]",
        );
        self.variable(
            "contributorRoleDefinitionId",
            "[concat('/subscriptions/', subscription().subscriptionId, '/providers/Microsoft.Authorization/roleDefinitions/', 'b24988ac-6180-42a0-ab88-20f7382dd24c')]",
        );
        self.push(Resource::new(
            ResourceType::UserAssignedIdentity,
            "[variables('userAssignedID')]",
        ));
        self.push(
            Resource::new(
                ResourceType::RoleAssignment,
                "[guid(concat(variables('userAssignedID'), 'roleAssignment'))]",
            )
            .depends_on(resource_ref(
                &ResourceType::UserAssignedIdentity,
                "variables('userAssignedID')",
            ))
            .properties(json!({
                "roleDefinitionId": "[variables('contributorRoleDefinitionId')]",
                "principalId": "[reference(variables('userAssignedIDReference')).principalId]"
            })),
        );
    }

    fn kms(&mut self) {
        let kms = self
            .props
            .kubernetes_config()
            .map(|k| k.uses_external_kms())
            .unwrap_or(false);
        if !kms {
            return;
        }
        self.variable(
            "clusterKeyVaultName",
            "[take(concat('kv', tolower(uniqueString(concat(variables('masterVMNamePrefix'), resourceGroup().id)))), 22)]",
        );
        self.push(
            Resource::new(ResourceType::KeyVault, "[variables('clusterKeyVaultName')]").properties(json!({
                "enabledForDeployment": false,
                "enabledForDiskEncryption": false,
                "enabledForTemplateDeployment": false,
                "tenantId": "[subscription().tenantId]",
                "sku": {"family": "A", "name": "Standard"}
            })),
        );
    }

    fn jumpbox(&mut self) {
        let has_jumpbox = self
            .props
            .kubernetes_config()
            .map(|k| k.has_jumpbox())
            .unwrap_or(false);
        if !has_jumpbox {
            return;
        }
        self.parameter(
            "jumpboxVMName",
            "string",
            Some(json!(format!("{}-jumpbox", self.props.dns_prefix()))),
        );
        self.variable("jumpboxNetworkSecurityGroupName", "[concat(parameters('jumpboxVMName'), '-nsg')]");
        self.variable("jumpboxPublicIpAddressName", "[concat(parameters('jumpboxVMName'), '-ip')]");
        self.variable("jumpboxNetworkInterfaceName", "[concat(parameters('jumpboxVMName'), '-nic')]");

        self.push(
            Resource::new(
                ResourceType::NetworkSecurityGroup,
                "[variables('jumpboxNetworkSecurityGroupName')]",
            )
            .properties(json!({"securityRules": [security_rule("default-allow-ssh", 22, 1000)]})),
        );
        self.push(Resource::new(
            ResourceType::PublicIpAddress,
            "[variables('jumpboxPublicIpAddressName')]",
        ));
        let mut nic = Resource::new(
            ResourceType::NetworkInterface,
            "[variables('jumpboxNetworkInterfaceName')]",
        )
        .depends_on(resource_ref(
            &ResourceType::NetworkSecurityGroup,
            "variables('jumpboxNetworkSecurityGroupName')",
        ))
        .depends_on(resource_ref(
            &ResourceType::PublicIpAddress,
            "variables('jumpboxPublicIpAddressName')",
        ));
        if !self.custom_vnet() {
            nic = nic.depends_on("[variables('vnetID')]");
        }
        self.push(nic);
        self.push(
            Resource::new(ResourceType::VirtualMachine, "[parameters('jumpboxVMName')]")
                .depends_on(resource_ref(
                    &ResourceType::NetworkInterface,
                    "variables('jumpboxNetworkInterfaceName')",
                ))
                .properties(json!({
                    "osProfile": {
                        "adminUsername": "[parameters('linuxAdminUsername')]",
                        "computerName": "[parameters('jumpboxVMName')]",
                        "linuxConfiguration": {"disablePasswordAuthentication": true}
                    },
                    "storageProfile": {"imageReference": ubuntu_image()}
                })),
        );
    }

    fn outputs(&mut self) {
        let mut outputs = Map::new();
        outputs.insert(
            "masterFQDN".to_string(),
            json!({
                "type": "string",
                "value": "[reference(concat('Microsoft.Network/publicIPAddresses/', variables('masterPublicIPAddressName'))).dnsSettings.fqdn]"
            }),
        );
        outputs.insert(
            "resourceNameSuffix".to_string(),
            json!({"type": "string", "value": "[parameters('nameSuffix')]"}),
        );
        self.template.outputs = Some(outputs);
    }
}

const CERTIFICATE_PARAMETERS: &[&str] = &[
    "caCertificate",
    "caPrivateKey",
    "apiServerCertificate",
    "apiServerPrivateKey",
    "clientCertificate",
    "clientPrivateKey",
    "kubeConfigCertificate",
    "kubeConfigPrivateKey",
    "etcdServerCertificate",
    "etcdServerPrivateKey",
    "etcdClientCertificate",
    "etcdClientPrivateKey",
];

fn security_rule(name: &str, port: u16, priority: u32) -> Value {
    json!({
        "name": name,
        "properties": {
            "access": "Allow",
            "direction": "Inbound",
            "protocol": "Tcp",
            "priority": priority,
            "sourceAddressPrefix": "*",
            "sourcePortRange": "*",
            "destinationAddressPrefix": "*",
            "destinationPortRange": port.to_string()
        }
    })
}

fn ubuntu_image() -> Value {
    json!({"publisher": "Canonical", "offer": "UbuntuServer", "sku": "18.04-LTS", "version": "latest"})
}

fn windows_image() -> Value {
    json!({"publisher": "MicrosoftWindowsServer", "offer": "WindowsServer", "sku": "2019-Datacenter-Core-smalldisk", "version": "latest"})
}

fn custom_data(role: &str) -> String {
    format!(
        "[base64(concat('#cloud-config\\n', 'role: {}\\n', 'orchestratorVersion: ', parameters('orchestratorVersion')))]",
        role
    )
}

fn custom_script(role: &str) -> Value {
    json!({
        "publisher": "Microsoft.Azure.Extensions",
        "type": "CustomScript",
        "typeHandlerVersion": "2.0",
        "autoUpgradeMinorVersion": true,
        "settings": {},
        "protectedSettings": {"commandToExecute": format!("/opt/azure/containers/provision.sh {}", role)}
    })
}

fn encode(pem: &str) -> String {
    STANDARD.encode(pem.as_bytes())
}

/// Parameter values for a defaulted model
fn parameter_values(cs: &ContainerService, master: &MasterProfile) -> Parameters {
    let props = &cs.properties;
    let mut params = Parameters::new();
    params.set("location", cs.location.clone());
    params.set("orchestratorVersion", props.orchestrator_version());
    if let Some(linux) = &props.linux_profile {
        params.set("linuxAdminUsername", linux.admin_username.clone());
        let key = linux
            .ssh
            .public_keys
            .first()
            .map(|k| k.key_data.clone())
            .unwrap_or_default();
        params.set("sshRSAPublicKey", key);
    }
    if let Some(sp) = &props.service_principal_profile {
        params.set("servicePrincipalClientId", sp.client_id.clone());
        params.set("servicePrincipalClientSecret", sp.secret.clone());
    }
    if let Some(certs) = &props.certificate_profile {
        let pairs = [
            ("caCertificate", &certs.ca_certificate),
            ("caPrivateKey", &certs.ca_private_key),
            ("apiServerCertificate", &certs.apiserver_certificate),
            ("apiServerPrivateKey", &certs.apiserver_private_key),
            ("clientCertificate", &certs.client_certificate),
            ("clientPrivateKey", &certs.client_private_key),
            ("kubeConfigCertificate", &certs.kube_config_certificate),
            ("kubeConfigPrivateKey", &certs.kube_config_private_key),
            ("etcdServerCertificate", &certs.etcd_server_certificate),
            ("etcdServerPrivateKey", &certs.etcd_server_private_key),
            ("etcdClientCertificate", &certs.etcd_client_certificate),
            ("etcdClientPrivateKey", &certs.etcd_client_private_key),
        ];
        for (name, pem) in pairs {
            params.set(name, encode(pem));
        }
        for (i, (cert, key)) in certs
            .etcd_peer_certificates
            .iter()
            .zip(&certs.etcd_peer_private_keys)
            .enumerate()
        {
            params.set(&format!("etcdPeerCertificate{}", i), encode(cert));
            params.set(&format!("etcdPeerPrivateKey{}", i), encode(key));
        }
    }
    params.set_master_count(master.count.max(0) as usize);
    params.set_master_offset(0);
    params.set("masterVMSize", master.vm_size.clone());
    for pool in &props.agent_pool_profiles {
        params.set_pool_count(&pool.name, pool.count.max(0) as usize);
        params.set_pool_offset(&pool.name, 0);
        params.set(&format!("{}VMSize", pool.name), pool.vm_size.clone());
    }
    if let Some(windows) = &props.windows_profile {
        params.set("windowsAdminUsername", windows.admin_username.clone());
        params.set("windowsAdminPassword", windows.admin_password.clone());
    }
    params
}
