//! Typed ARM template model
//!
//! A template is parsed into a list of [`Resource`] records whose `type` is a
//! closed [`ResourceType`] sum with an `Other` fallback. Everything the engine
//! does not address (copy loops, sku, identity, apiVersion, ...) rides along in
//! each record's `extra` map, so a parsed template serializes back to the same
//! document.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TransformError};

/// ARM deployment template schema
pub const TEMPLATE_SCHEMA: &str =
    "https://schema.management.azure.com/schemas/2015-01-01/deploymentTemplate.json#";

/// ARM deployment parameters schema
pub const PARAMETERS_SCHEMA: &str =
    "https://schema.management.azure.com/schemas/2015-01-01/deploymentParameters.json#";

pub const CONTENT_VERSION: &str = "1.0.0.0";

/// Resource types the transformer reasons about
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceType {
    VirtualMachine,
    VmExtension,
    NetworkInterface,
    VirtualNetwork,
    NetworkSecurityGroup,
    RouteTable,
    AvailabilitySet,
    ScaleSet,
    LoadBalancer,
    RoleAssignment,
    KeyVault,
    PublicIpAddress,
    StorageAccount,
    UserAssignedIdentity,
    Other(String),
}

const KNOWN_TYPES: &[(ResourceType, &str)] = &[
    (ResourceType::VirtualMachine, "Microsoft.Compute/virtualMachines"),
    (ResourceType::VmExtension, "Microsoft.Compute/virtualMachines/extensions"),
    (ResourceType::NetworkInterface, "Microsoft.Network/networkInterfaces"),
    (ResourceType::VirtualNetwork, "Microsoft.Network/virtualNetworks"),
    (ResourceType::NetworkSecurityGroup, "Microsoft.Network/networkSecurityGroups"),
    (ResourceType::RouteTable, "Microsoft.Network/routeTables"),
    (ResourceType::AvailabilitySet, "Microsoft.Compute/availabilitySets"),
    (ResourceType::ScaleSet, "Microsoft.Compute/virtualMachineScaleSets"),
    (ResourceType::LoadBalancer, "Microsoft.Network/loadBalancers"),
    (ResourceType::RoleAssignment, "Microsoft.Authorization/roleAssignments"),
    (ResourceType::KeyVault, "Microsoft.KeyVault/vaults"),
    (ResourceType::PublicIpAddress, "Microsoft.Network/publicIPAddresses"),
    (ResourceType::StorageAccount, "Microsoft.Storage/storageAccounts"),
    (
        ResourceType::UserAssignedIdentity,
        "Microsoft.ManagedIdentity/userAssignedIdentities",
    ),
];

impl ResourceType {
    /// The ARM type string
    pub fn as_str(&self) -> &str {
        if let ResourceType::Other(raw) = self {
            return raw;
        }
        KNOWN_TYPES
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, name)| *name)
            .unwrap_or_default()
    }

    /// Variable holding the resource id of the cluster's singleton of this type
    pub fn id_variable(&self) -> Option<&'static str> {
        match self {
            ResourceType::NetworkSecurityGroup => Some("nsgID"),
            ResourceType::RouteTable => Some("routeTableID"),
            ResourceType::VirtualNetwork => Some("vnetID"),
            ResourceType::LoadBalancer => Some("agentLbID"),
            _ => None,
        }
    }
}

impl From<String> for ResourceType {
    fn from(raw: String) -> Self {
        KNOWN_TYPES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(&raw))
            .map(|(kind, _)| kind.clone())
            .unwrap_or(ResourceType::Other(raw))
    }
}

impl From<ResourceType> for String {
    fn from(kind: ResourceType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the template's `resources` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Resource {
    pub fn new(kind: ResourceType, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            depends_on: Vec::new(),
            tags: BTreeMap::new(),
            properties: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn tag(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn properties(mut self, properties: Value) -> Self {
        if let Value::Object(map) = properties {
            self.properties = map;
        }
        self
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// The pool named by the `poolName` tag
    pub fn pool_name(&self) -> Option<&str> {
        self.tags.get("poolName").and_then(Value::as_str)
    }

    /// Name expression references the given template variable or parameter prefix
    pub fn name_mentions(&self, needle: &str) -> bool {
        self.name.contains(needle)
    }

    /// Token identifying this resource inside another resource's `dependsOn`
    ///
    /// The first `variables('..')` or `parameters('..')` call in the name, or
    /// the literal name when the name is not an expression.
    pub fn name_stem(&self) -> &str {
        name_stem(&self.name)
    }

    /// Whether a `dependsOn` entry names this resource
    pub fn is_referenced_by(&self, dep: &str) -> bool {
        if dep == self.name {
            return true;
        }
        if !dep.contains(self.kind.as_str()) {
            return false;
        }
        let stem = self.name_stem();
        !stem.is_empty() && dep.contains(stem) && name_tail(dep) == name_tail(&self.name)
    }

    /// Mutable access to a nested object under `properties`
    pub fn property_object_mut(&mut self, path: &[&str]) -> Option<&mut Map<String, Value>> {
        let mut current = &mut self.properties;
        for key in path {
            current = current.get_mut(*key)?.as_object_mut()?;
        }
        Some(current)
    }

    /// Nested value under `properties`
    pub fn property(&self, path: &[&str]) -> Option<&Value> {
        let (last, parents) = path.split_last()?;
        let mut current = &self.properties;
        for key in parents {
            current = current.get(*key)?.as_object()?;
        }
        current.get(*last)
    }
}

fn name_stem(name: &str) -> &str {
    ["variables('", "parameters('"]
        .iter()
        .filter_map(|call| {
            let start = name.find(call)?;
            let close = name[start..].find("')")?;
            Some((start, &name[start..start + close + 2]))
        })
        .min_by_key(|(start, _)| *start)
        .map(|(_, stem)| stem)
        .unwrap_or(name)
}

/// Literal fragments after the stem, e.g. `'nic-'` in a NIC name
///
/// Distinguishes resources that share a name variable but differ by suffix,
/// such as a VM and its NIC.
fn name_tail(expr: &str) -> Vec<&str> {
    let stem = name_stem(expr);
    let rest = expr
        .find(stem)
        .map(|start| &expr[start + stem.len()..])
        .unwrap_or_default();
    rest.split('\'')
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, literal)| literal)
        .collect()
}

/// A parsed ARM deployment template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(rename = "$schema", default, skip_serializing_if = "String::is_empty")]
    pub schema: String,
    #[serde(default)]
    pub content_version: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            schema: TEMPLATE_SCHEMA.to_string(),
            content_version: CONTENT_VERSION.to_string(),
            parameters: Map::new(),
            variables: Map::new(),
            resources: Vec::new(),
            outputs: None,
            extra: Map::new(),
        }
    }
}

impl Template {
    /// Parse a template document, reporting the offending path on failure
    pub fn from_value(mut doc: Value) -> Result<Self> {
        let root = doc
            .as_object_mut()
            .ok_or_else(|| TransformError::malformed("$", "template is not a JSON object"))?;
        let raw_resources = match root.remove("resources") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(TransformError::malformed(
                    "resources",
                    "resources is not an array",
                ))
            }
            None => return Err(TransformError::malformed("resources", "missing resources array")),
        };

        let mut resources = Vec::with_capacity(raw_resources.len());
        for (index, raw) in raw_resources.into_iter().enumerate() {
            let location = format!("resources[{}]", index);
            if !raw.is_object() {
                return Err(TransformError::malformed(location, "resource is not an object"));
            }
            if let Some(deps) = raw.get("dependsOn") {
                let well_formed = deps
                    .as_array()
                    .map(|d| d.iter().all(Value::is_string))
                    .unwrap_or(false);
                if !well_formed {
                    return Err(TransformError::malformed(
                        format!("{}.dependsOn", location),
                        "dependsOn must be an array of strings",
                    ));
                }
            }
            let resource = serde_json::from_value(raw)
                .map_err(|e| TransformError::malformed(location, e.to_string()))?;
            resources.push(resource);
        }

        root.insert("resources".to_string(), Value::Array(Vec::new()));
        let mut template: Template = serde_json::from_value(doc)
            .map_err(|e| TransformError::malformed("$", e.to_string()))?;
        template.resources = resources;
        Ok(template)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let doc: Value = serde_json::from_slice(bytes)
            .map_err(|e| TransformError::malformed("$", format!("invalid JSON: {}", e)))?;
        Self::from_value(doc)
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| TransformError::malformed("$", e.to_string()))
    }

    /// Indices of resources of the given type
    pub fn indices_of(&self, kind: &ResourceType) -> Vec<usize> {
        self.resources
            .iter()
            .enumerate()
            .filter(|(_, r)| &r.kind == kind)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn count_of(&self, kind: &ResourceType) -> usize {
        self.resources.iter().filter(|r| &r.kind == kind).count()
    }

    /// `dependsOn` entries that name no resource in the template
    ///
    /// An entry resolves when it names a resource directly, or when it is the
    /// canonical id variable of a type that is still present.
    pub fn dangling_dependencies(&self) -> Vec<(String, String)> {
        let mut dangling = Vec::new();
        for resource in &self.resources {
            for dep in &resource.depends_on {
                if !self.resolves(dep) {
                    dangling.push((resource.name.clone(), dep.clone()));
                }
            }
        }
        dangling
    }

    fn resolves(&self, dep: &str) -> bool {
        self.resources.iter().any(|r| {
            r.is_referenced_by(dep)
                || r.kind
                    .id_variable()
                    .map(|var| dep.contains(&format!("variables('{}')", var)))
                    .unwrap_or(false)
        })
    }

    /// Set a template variable, replacing any previous value
    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) {
        self.variables.insert(name.to_string(), value.into());
    }

    /// The `defaultValue` of a declared parameter
    pub fn parameter_default(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)?.get("defaultValue")
    }
}
