//! API model types
//!
//! Every struct carries a flattened `extra` map so fields this engine does not
//! interpret survive a load/serialize round trip. Optional scalars stay
//! `Option` (or skip when empty) so serialization reproduces the input.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::naming;
use crate::{DEFAULT_CLUSTER_DOMAIN, ORCHESTRATOR_NAME};

/// Orchestrator type accepted by this engine
pub const KUBERNETES: &str = "Kubernetes";

/// Static IP of master 0 on availability-set masters
pub const DEFAULT_FIRST_CONSECUTIVE_STATIC_IP: &str = "10.240.255.5";

/// Static IP of master 0 on scale-set masters
pub const DEFAULT_FIRST_CONSECUTIVE_STATIC_IP_VMSS: &str = "10.240.0.4";

/// Offset of the internal load balancer IP from master 0
pub const DEFAULT_INTERNAL_LB_STATIC_IP_OFFSET: u8 = 10;

/// Default service CIDR
pub const DEFAULT_SERVICE_CIDR: &str = "10.0.0.0/16";

/// Default pod CIDR
pub const DEFAULT_CLUSTER_SUBNET: &str = "10.244.0.0/16";

/// Default cluster DNS service IP
pub const DEFAULT_DNS_SERVICE_IP: &str = "10.0.0.10";

/// Kubelet flag carrying the cluster domain
pub const CLUSTER_DOMAIN_FLAG: &str = "--cluster-domain";

/// Component disabled for the duration of an upgrade
pub const CLUSTER_INIT_COMPONENT: &str = "cluster-init";

/// Standard load balancer SKU name
pub const STANDARD_LOAD_BALANCER_SKU: &str = "Standard";

/// Basic load balancer SKU name
pub const BASIC_LOAD_BALANCER_SKU: &str = "Basic";

/// Root of the API model document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerService {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub properties: Properties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Cluster definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_profile: Option<OrchestratorProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_profile: Option<MasterProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_master_profile: Option<HostedMasterProfile>,
    #[serde(default)]
    pub agent_pool_profiles: Vec<AgentPoolProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux_profile: Option<LinuxProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows_profile: Option<WindowsProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_principal_profile: Option<ServicePrincipalProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_profile: Option<CertificateProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_cloud_profile: Option<CustomCloudProfile>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Orchestrator selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorProfile {
    #[serde(default)]
    pub orchestrator_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub orchestrator_release: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub orchestrator_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_config: Option<KubernetesConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Cluster-wide Kubernetes settings the engine reads or defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_managed_identity: Option<bool>,
    #[serde(
        rename = "userAssignedID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub user_assigned_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub load_balancer_sku: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_cidr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_subnet: String,
    #[serde(
        rename = "dnsServiceIP",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub dns_service_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_encryption_with_external_kms: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_cluster: Option<PrivateCluster>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kubelet_config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<KubernetesComponent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<KubernetesAddon>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl KubernetesConfig {
    /// Whether the cluster uses a managed identity instead of a service principal
    pub fn uses_managed_identity(&self) -> bool {
        self.use_managed_identity.unwrap_or(false)
    }

    /// Whether the cluster load balancer uses the Standard SKU
    pub fn is_standard_load_balancer(&self) -> bool {
        self.load_balancer_sku
            .eq_ignore_ascii_case(STANDARD_LOAD_BALANCER_SKU)
    }

    /// Whether KMS encryption is configured
    pub fn uses_external_kms(&self) -> bool {
        self.enable_encryption_with_external_kms.unwrap_or(false)
    }

    /// Whether the private cluster has a jumpbox
    pub fn has_jumpbox(&self) -> bool {
        self.private_cluster
            .as_ref()
            .map(|p| p.enabled.unwrap_or(false) && p.jumpbox_profile.is_some())
            .unwrap_or(false)
    }

    /// Named component, if listed
    pub fn component_mut(&mut self, name: &str) -> Option<&mut KubernetesComponent> {
        self.components.iter_mut().find(|c| c.name == name)
    }
}

/// A control-plane component entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesComponent {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An addon entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesAddon {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Private cluster settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateCluster {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jumpbox_profile: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Availability mode shared by masters and pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvailabilityProfile {
    AvailabilitySet,
    VirtualMachineScaleSets,
}

impl std::fmt::Display for AvailabilityProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AvailabilityProfile::AvailabilitySet => write!(f, "AvailabilitySet"),
            AvailabilityProfile::VirtualMachineScaleSets => write!(f, "VirtualMachineScaleSets"),
        }
    }
}

/// Disk backing for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageProfile {
    StorageAccount,
    ManagedDisks,
    Ephemeral,
}

/// Node operating system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsType {
    Linux,
    Windows,
}

/// Control plane definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterProfile {
    #[serde(default)]
    pub count: i32,
    #[serde(default)]
    pub dns_prefix: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_alt_names: Vec<String>,
    #[serde(default)]
    pub vm_size: String,
    #[serde(
        rename = "osDiskSizeGB",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_disk_size_gb: Option<i32>,
    #[serde(
        rename = "vnetSubnetID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub vnet_subnet_id: String,
    #[serde(
        rename = "firstConsecutiveStaticIP",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub first_consecutive_static_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_profile: Option<AvailabilityProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_profile: Option<StorageProfile>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fqdn: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MasterProfile {
    pub fn is_virtual_machine_scale_sets(&self) -> bool {
        self.availability_profile == Some(AvailabilityProfile::VirtualMachineScaleSets)
    }

    pub fn is_managed_disks(&self) -> bool {
        self.storage_profile == Some(StorageProfile::ManagedDisks)
    }

    pub fn is_custom_vnet(&self) -> bool {
        !self.vnet_subnet_id.is_empty()
    }

    /// Static IP of master 0, defaulted by availability mode
    pub fn first_master_ip(&self) -> Ipv4Addr {
        let fallback = if self.is_virtual_machine_scale_sets() {
            DEFAULT_FIRST_CONSECUTIVE_STATIC_IP_VMSS
        } else {
            DEFAULT_FIRST_CONSECUTIVE_STATIC_IP
        };
        self.first_consecutive_static_ip
            .parse()
            .or_else(|_| fallback.parse())
            .unwrap_or(Ipv4Addr::new(10, 240, 255, 5))
    }
}

/// Hosted control plane reference
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedMasterProfile {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fqdn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_prefix: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A node pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPoolProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub count: i32,
    #[serde(default)]
    pub vm_size: String,
    #[serde(
        rename = "osDiskSizeGB",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_disk_size_gb: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<OsType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_profile: Option<AvailabilityProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_profile: Option<StorageProfile>,
    #[serde(
        rename = "diskSizesGB",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub disk_sizes_gb: Vec<i32>,
    #[serde(
        rename = "vnetSubnetID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub vnet_subnet_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_prefix: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentPoolProfile {
    pub fn is_windows(&self) -> bool {
        self.os_type == Some(OsType::Windows)
    }

    pub fn is_virtual_machine_scale_sets(&self) -> bool {
        self.availability_profile == Some(AvailabilityProfile::VirtualMachineScaleSets)
    }

    pub fn is_availability_sets(&self) -> bool {
        self.availability_profile == Some(AvailabilityProfile::AvailabilitySet)
    }

    pub fn is_managed_disks(&self) -> bool {
        self.storage_profile == Some(StorageProfile::ManagedDisks)
    }
}

/// Linux administrator access
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxProfile {
    #[serde(default)]
    pub admin_username: String,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    #[serde(default)]
    pub public_keys: Vec<PublicKey>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    #[serde(default)]
    pub key_data: String,
}

/// Windows administrator access
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsProfile {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_password: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Identity the cluster uses to call the cloud
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipalProfile {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyvault_secret_ref: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServicePrincipalProfile {
    /// Client id plus either an inline secret or a key vault reference
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty() && (!self.secret.is_empty() || self.keyvault_secret_ref.is_some())
    }
}

/// Cluster PKI material, PEM encoded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateProfile {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_private_key: String,
    #[serde(
        rename = "apiServerCertificate",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub apiserver_certificate: String,
    #[serde(
        rename = "apiServerPrivateKey",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub apiserver_private_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_private_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kube_config_certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kube_config_private_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_server_certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_server_private_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_client_certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_client_private_key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_peer_certificates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_peer_private_keys: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CertificateProfile {
    /// CA certificate and key are both present
    pub fn has_ca(&self) -> bool {
        !self.ca_certificate.is_empty() && !self.ca_private_key.is_empty()
    }

    /// Every derived certificate is present for `master_count` masters
    pub fn is_complete(&self, master_count: usize) -> bool {
        self.has_ca()
            && !self.apiserver_certificate.is_empty()
            && !self.apiserver_private_key.is_empty()
            && !self.client_certificate.is_empty()
            && !self.client_private_key.is_empty()
            && !self.kube_config_certificate.is_empty()
            && !self.kube_config_private_key.is_empty()
            && !self.etcd_server_certificate.is_empty()
            && !self.etcd_server_private_key.is_empty()
            && !self.etcd_client_certificate.is_empty()
            && !self.etcd_client_private_key.is_empty()
            && self.etcd_peer_certificates.len() == master_count
            && self.etcd_peer_private_keys.len() == master_count
    }
}

/// Endpoints of a custom (Azure Stack) cloud
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCloudProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<AzureEnvironment>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_system: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authentication_method: String,
    #[serde(
        rename = "portalURL",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub portal_url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Endpoint set of an Azure environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureEnvironment {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_manager_endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active_directory_endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub graph_endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_management_endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_manager_vm_dns_suffix: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Properties {
    /// Kubernetes config, if present
    pub fn kubernetes_config(&self) -> Option<&KubernetesConfig> {
        self.orchestrator_profile
            .as_ref()
            .and_then(|o| o.kubernetes_config.as_ref())
    }

    /// Kubernetes config, created on demand
    pub fn kubernetes_config_mut(&mut self) -> &mut KubernetesConfig {
        self.orchestrator_profile
            .get_or_insert_with(OrchestratorProfile::default)
            .kubernetes_config
            .get_or_insert_with(KubernetesConfig::default)
    }

    /// Current orchestrator version, empty when unset
    pub fn orchestrator_version(&self) -> &str {
        self.orchestrator_profile
            .as_ref()
            .map(|o| o.orchestrator_version.as_str())
            .unwrap_or_default()
    }

    pub fn has_windows(&self) -> bool {
        self.agent_pool_profiles.iter().any(|p| p.is_windows())
    }

    pub fn has_vmss_agent_pool(&self) -> bool {
        self.agent_pool_profiles
            .iter()
            .any(|p| p.is_virtual_machine_scale_sets())
    }

    /// A custom cloud profile marks an Azure Stack deployment
    pub fn is_azure_stack(&self) -> bool {
        self.custom_cloud_profile.is_some()
    }

    pub fn is_hosted_master(&self) -> bool {
        self.hosted_master_profile.is_some()
    }

    pub fn uses_managed_identity(&self) -> bool {
        self.kubernetes_config()
            .map(KubernetesConfig::uses_managed_identity)
            .unwrap_or(false)
    }

    /// DNS prefix of the control plane
    pub fn dns_prefix(&self) -> &str {
        if let Some(master) = &self.master_profile {
            return &master.dns_prefix;
        }
        self.hosted_master_profile
            .as_ref()
            .map(|h| h.dns_prefix.as_str())
            .unwrap_or_default()
    }

    /// FQDN of the API server
    pub fn master_fqdn(&self) -> &str {
        if let Some(hosted) = &self.hosted_master_profile {
            return &hosted.fqdn;
        }
        self.master_profile
            .as_ref()
            .map(|m| m.fqdn.as_str())
            .unwrap_or_default()
    }

    pub fn master_count(&self) -> usize {
        self.master_profile
            .as_ref()
            .map(|m| m.count.max(0) as usize)
            .unwrap_or(0)
    }

    /// Eight-character cluster identity derived from the DNS prefix
    pub fn cluster_id(&self) -> String {
        let seed = match (&self.master_profile, &self.hosted_master_profile) {
            (Some(m), _) => m.dns_prefix.as_str(),
            (None, Some(h)) => h.dns_prefix.as_str(),
            (None, None) => self
                .agent_pool_profiles
                .first()
                .map(|p| p.name.as_str())
                .unwrap_or_default(),
        };
        naming::cluster_id(seed)
    }

    /// Prefix of master VM names, e.g. `k8s-master-12345678-`
    pub fn master_vm_prefix(&self) -> String {
        format!("{}-master-{}-", ORCHESTRATOR_NAME, self.cluster_id())
    }

    /// Prefix of a pool's VM names
    ///
    /// Linux pools use `k8s-{pool}-{clusterID}-` (plus `vmss` for scale sets);
    /// Windows pools embed the pool index: `{clusterID[:4]}k8s{index:02}`.
    pub fn agent_vm_prefix(&self, pool: &AgentPoolProfile, index: usize) -> String {
        let cluster_id = self.cluster_id();
        if pool.is_windows() {
            let short: String = cluster_id.chars().take(4).collect();
            format!("{}{}{:02}", short, ORCHESTRATOR_NAME, index)
        } else {
            let mut prefix = format!("{}-{}-{}-", ORCHESTRATOR_NAME, pool.name, cluster_id);
            if pool.is_virtual_machine_scale_sets() {
                prefix.push_str("vmss");
            }
            prefix
        }
    }

    pub fn agent_pool_index(&self, name: &str) -> Option<usize> {
        self.agent_pool_profiles.iter().position(|p| p.name == name)
    }

    pub fn agent_pool(&self, name: &str) -> Option<&AgentPoolProfile> {
        self.agent_pool_profiles.iter().find(|p| p.name == name)
    }

    pub fn agent_pool_mut(&mut self, name: &str) -> Option<&mut AgentPoolProfile> {
        self.agent_pool_profiles.iter_mut().find(|p| p.name == name)
    }

    /// Cluster DNS domain from the kubelet flags
    pub fn cluster_domain(&self) -> String {
        self.kubernetes_config()
            .and_then(|k| k.kubelet_config.get(CLUSTER_DOMAIN_FLAG))
            .filter(|d| !d.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string())
    }

    /// Service CIDR, defaulted when unset
    pub fn service_cidr(&self) -> String {
        self.kubernetes_config()
            .map(|k| k.service_cidr.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_CIDR.to_string())
    }

    pub fn is_standard_load_balancer(&self) -> bool {
        self.kubernetes_config()
            .map(KubernetesConfig::is_standard_load_balancer)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, os: OsType, availability: AvailabilityProfile) -> AgentPoolProfile {
        AgentPoolProfile {
            name: name.to_string(),
            count: 1,
            os_type: Some(os),
            availability_profile: Some(availability),
            ..Default::default()
        }
    }

    #[test]
    fn vm_prefixes_follow_naming_convention() {
        let props = Properties {
            master_profile: Some(MasterProfile {
                dns_prefix: "mycluster".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let id = props.cluster_id();
        assert_eq!(id.len(), 8);

        let linux = pool("agentpool1", OsType::Linux, AvailabilityProfile::AvailabilitySet);
        assert_eq!(
            props.agent_vm_prefix(&linux, 0),
            format!("k8s-agentpool1-{}-", id)
        );

        let vmss = pool("agentpool2", OsType::Linux, AvailabilityProfile::VirtualMachineScaleSets);
        assert_eq!(
            props.agent_vm_prefix(&vmss, 1),
            format!("k8s-agentpool2-{}-vmss", id)
        );

        let windows = pool("winpool", OsType::Windows, AvailabilityProfile::AvailabilitySet);
        assert_eq!(
            props.agent_vm_prefix(&windows, 2),
            format!("{}k8s02", &id[..4])
        );

        assert_eq!(props.master_vm_prefix(), format!("k8s-master-{}-", id));
    }

    #[test]
    fn cluster_domain_comes_from_kubelet_flags() {
        let mut props = Properties::default();
        assert_eq!(props.cluster_domain(), "cluster.local");
        props
            .kubernetes_config_mut()
            .kubelet_config
            .insert(CLUSTER_DOMAIN_FLAG.to_string(), "corp.local".to_string());
        assert_eq!(props.cluster_domain(), "corp.local");
    }

    #[test]
    fn first_master_ip_defaults_by_availability_mode() {
        let mut master = MasterProfile::default();
        assert_eq!(master.first_master_ip(), Ipv4Addr::new(10, 240, 255, 5));
        master.availability_profile = Some(AvailabilityProfile::VirtualMachineScaleSets);
        assert_eq!(master.first_master_ip(), Ipv4Addr::new(10, 240, 0, 4));
        master.first_consecutive_static_ip = "10.1.2.3".to_string();
        assert_eq!(master.first_master_ip(), Ipv4Addr::new(10, 1, 2, 3));
    }

    #[test]
    fn unknown_fields_survive_deserialization() {
        let json = r#"{"name":"p","count":2,"vmSize":"Standard_D2_v3","customNodeLabels":{"a":"b"}}"#;
        let pool: AgentPoolProfile = serde_json::from_str(json).expect("valid pool");
        assert_eq!(pool.extra["customNodeLabels"]["a"], "b");
        let back = serde_json::to_value(&pool).expect("serializable");
        assert_eq!(back["customNodeLabels"]["a"], "b");
    }
}
