//! Cloud resources as the engine sees them
//!
//! These are narrow views over the resource manager's JSON: only the fields the
//! engine reads are typed, everything else is dropped on deserialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provisioning state that marks a VM as broken and in need of recreation
pub const PROVISIONING_FAILED: &str = "Failed";

/// A virtual machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub provisioning_state: String,
    pub os_disk: OsDisk,
    pub network_interface_ids: Vec<String>,
    /// Principal id of the system-assigned identity
    pub principal_id: Option<String>,
}

/// Where a VM's OS disk lives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsDisk {
    pub name: String,
    pub managed_disk_id: Option<String>,
    pub vhd_uri: Option<String>,
}

impl VirtualMachine {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn is_failed(&self) -> bool {
        self.provisioning_state.eq_ignore_ascii_case(PROVISIONING_FAILED)
    }
}

/// A virtual machine scale set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleSet {
    pub id: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub sku_name: String,
    pub capacity: u32,
}

impl ScaleSet {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// One instance of a scale set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleSetVm {
    pub instance_id: String,
    pub name: String,
    /// Hostname the node registers with
    pub computer_name: String,
    pub tags: BTreeMap<String, String>,
    pub provisioning_state: String,
}

/// An Azure region
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

/// A purchasable resource SKU
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSku {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub locations: Vec<String>,
}

/// Terminal state of a template deployment
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentResult {
    pub name: String,
    pub provisioning_state: String,
    pub outputs: Option<Value>,
    /// Raw response body, kept for diagnostics
    pub body: String,
}

/// Credentials of an application created for the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCredentials {
    pub app_id: String,
    pub service_principal_object_id: String,
    pub secret: String,
}

/// A role assignment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleAssignment {
    pub id: String,
    pub principal_id: String,
    pub scope: String,
}

fn string_tags(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|tags| {
            tags.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .and_then(Value::as_str)
}

pub(crate) fn vm_from_json(value: &Value) -> VirtualMachine {
    let os_disk = value
        .get("properties")
        .and_then(|p| p.get("storageProfile"))
        .and_then(|s| s.get("osDisk"));
    VirtualMachine {
        id: str_at(value, &["id"]).unwrap_or_default().to_string(),
        name: str_at(value, &["name"]).unwrap_or_default().to_string(),
        tags: string_tags(value.get("tags")),
        provisioning_state: str_at(value, &["properties", "provisioningState"])
            .unwrap_or_default()
            .to_string(),
        os_disk: OsDisk {
            name: os_disk
                .and_then(|d| str_at(d, &["name"]))
                .unwrap_or_default()
                .to_string(),
            managed_disk_id: os_disk
                .and_then(|d| str_at(d, &["managedDisk", "id"]))
                .map(str::to_string),
            vhd_uri: os_disk.and_then(|d| str_at(d, &["vhd", "uri"])).map(str::to_string),
        },
        network_interface_ids: value
            .get("properties")
            .and_then(|p| p.get("networkProfile"))
            .and_then(|n| n.get("networkInterfaces"))
            .and_then(Value::as_array)
            .map(|nics| {
                nics.iter()
                    .filter_map(|nic| str_at(nic, &["id"]).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        principal_id: str_at(value, &["identity", "principalId"]).map(str::to_string),
    }
}

pub(crate) fn scale_set_from_json(value: &Value) -> ScaleSet {
    ScaleSet {
        id: str_at(value, &["id"]).unwrap_or_default().to_string(),
        name: str_at(value, &["name"]).unwrap_or_default().to_string(),
        tags: string_tags(value.get("tags")),
        sku_name: str_at(value, &["sku", "name"]).unwrap_or_default().to_string(),
        capacity: value
            .get("sku")
            .and_then(|s| s.get("capacity"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    }
}

pub(crate) fn scale_set_vm_from_json(value: &Value) -> ScaleSetVm {
    ScaleSetVm {
        instance_id: str_at(value, &["instanceId"]).unwrap_or_default().to_string(),
        name: str_at(value, &["name"]).unwrap_or_default().to_string(),
        computer_name: str_at(value, &["properties", "osProfile", "computerName"])
            .unwrap_or_default()
            .to_string(),
        tags: string_tags(value.get("tags")),
        provisioning_state: str_at(value, &["properties", "provisioningState"])
            .unwrap_or_default()
            .to_string(),
    }
}

pub(crate) fn role_assignment_from_json(value: &Value) -> RoleAssignment {
    RoleAssignment {
        id: str_at(value, &["id"]).unwrap_or_default().to_string(),
        principal_id: str_at(value, &["properties", "principalId"])
            .unwrap_or_default()
            .to_string(),
        scope: str_at(value, &["properties", "scope"]).unwrap_or_default().to_string(),
    }
}
