//! Read-only verbs: `get-versions`, `get-locations` and `get-skus`

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Serialize;

use kestrel_cloud::{CloudEndpoints, Location};
use kestrel_common::versions::{KubernetesVersion, VersionPolicy};
use kestrel_common::{Error, Result, ResultExt};

use crate::context::Context;

/// Resource type of VM sizes in the SKU listing
pub const VIRTUAL_MACHINES_RESOURCE_TYPE: &str = "virtualMachines";

/// A supported version and where it can go next
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionProfile {
    pub orchestrator_version: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
    pub upgrades: Vec<String>,
}

/// Supported versions, oldest first; just `version` when given
pub fn get_versions(
    policy: &VersionPolicy,
    version: Option<&str>,
    windows: bool,
    azure_stack: bool,
) -> Result<Vec<VersionProfile>> {
    let default = policy.default_version(windows, azure_stack);
    let versions = match version.filter(|v| !v.is_empty()) {
        Some(v) => {
            let v = KubernetesVersion::parse(v)?.to_string();
            if !policy.is_supported(&v, true, windows, azure_stack) {
                return Err(Error::unsupported_version(format!(
                    "Kubernetes version {} is not supported",
                    v
                )));
            }
            vec![v]
        }
        None => policy.all_supported_versions(false, windows, azure_stack),
    };
    versions
        .into_iter()
        .map(|v| {
            let upgrades = policy.available_upgrades(&v, windows, azure_stack)?;
            Ok(VersionProfile {
                default: v == default,
                orchestrator_version: v,
                upgrades,
            })
        })
        .collect()
}

/// `Version  Upgrades` table, newest first
pub fn render_versions(profiles: &[VersionProfile]) -> String {
    let width = profiles
        .iter()
        .map(|p| p.orchestrator_version.len())
        .max()
        .unwrap_or(0)
        .max("Version".len());
    let mut out = format!("{:<width$} Upgrades\n", "Version", width = width);
    for p in profiles.iter().rev() {
        let _ = writeln!(
            out,
            "{:<width$} {}",
            p.orchestrator_version,
            p.upgrades.join(", "),
            width = width
        );
    }
    out
}

/// Regions of the subscription, sorted by name
pub async fn get_locations(ctx: &Context) -> Result<Vec<Location>> {
    let cloud = ctx.cloud.connect(CloudEndpoints::AzurePublicCloud)?;
    let mut locations = cloud.list_locations().await.context("listing locations")?;
    locations.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(locations)
}

/// Distinct VM sizes offered to the subscription, sorted
pub async fn get_skus(ctx: &Context) -> Result<Vec<String>> {
    let cloud = ctx.cloud.connect(CloudEndpoints::AzurePublicCloud)?;
    let skus = cloud
        .list_resource_skus(&format!("resourceType eq '{}'", VIRTUAL_MACHINES_RESOURCE_TYPE))
        .collect_all()
        .await
        .context("listing resource SKUs")?;
    let names: BTreeSet<String> = skus
        .into_iter()
        .filter(|s| s.resource_type == VIRTUAL_MACHINES_RESOURCE_TYPE)
        .map(|s| s.name)
        .collect();
    Ok(names.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, MockCloud};
    use kestrel_cloud::{Pager, ResourceSku};
    use kestrel_common::ErrorKind;

    fn policy() -> VersionPolicy {
        VersionPolicy::from_table(&[
            ("1.23.15", true),
            ("1.24.9", true),
            ("1.24.10", true),
            ("1.25.5", false),
        ])
    }

    #[test]
    fn versions_list_creatable_releases_with_their_upgrades() {
        let profiles = get_versions(&policy(), None, false, false).expect("versions");
        let names: Vec<&str> = profiles.iter().map(|p| p.orchestrator_version.as_str()).collect();
        assert_eq!(names, vec!["1.23.15", "1.24.9", "1.24.10"]);
        assert_eq!(profiles[1].upgrades, vec!["1.24.10", "1.25.5"]);
    }

    #[test]
    fn a_single_version_can_be_queried() {
        let profiles = get_versions(&policy(), Some("v1.24.9"), false, false).expect("versions");
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].orchestrator_version, "1.24.9");

        let err = get_versions(&policy(), Some("1.9.0"), false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
    }

    #[test]
    fn human_output_is_newest_first() {
        let table = render_versions(&[
            VersionProfile {
                orchestrator_version: "1.24.9".to_string(),
                default: false,
                upgrades: vec!["1.24.10".to_string()],
            },
            VersionProfile {
                orchestrator_version: "1.24.10".to_string(),
                default: true,
                upgrades: Vec::new(),
            },
        ]);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("Version"));
        assert!(lines[1].starts_with("1.24.10"));
        assert_eq!(lines[2], "1.24.9  1.24.10");
    }

    #[tokio::test]
    async fn skus_are_vm_sizes_without_duplicates() {
        let mut cloud = MockCloud::new();
        cloud
            .expect_list_resource_skus()
            .withf(|filter| filter == "resourceType eq 'virtualMachines'")
            .returning(|_| {
                let sku = |name: &str, kind: &str| ResourceSku {
                    name: name.to_string(),
                    resource_type: kind.to_string(),
                    ..Default::default()
                };
                Pager::from_pages(vec![
                    vec![sku("Standard_D4_v3", "virtualMachines"), sku("Premium_LRS", "disks")],
                    vec![sku("Standard_D2_v3", "virtualMachines"), sku("Standard_D4_v3", "virtualMachines")],
                ])
            });
        let ctx = context(cloud, VersionPolicy::builtin());
        assert_eq!(
            get_skus(&ctx).await.expect("skus"),
            vec!["Standard_D2_v3", "Standard_D4_v3"]
        );
    }

    #[tokio::test]
    async fn locations_are_sorted() {
        let mut cloud = MockCloud::new();
        cloud.expect_list_locations().returning(|| {
            Ok(["westus2", "eastus", "northeurope"]
                .iter()
                .map(|n| Location {
                    name: n.to_string(),
                    display_name: String::new(),
                })
                .collect())
        });
        let ctx = context(cloud, VersionPolicy::builtin());
        let names: Vec<String> = get_locations(&ctx)
            .await
            .expect("locations")
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec!["eastus", "northeurope", "westus2"]);
    }
}
