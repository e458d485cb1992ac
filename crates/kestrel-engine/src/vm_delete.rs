//! Deleting a VM together with what it leaves behind
//!
//! Deleting a VM does not delete its NICs, its OS disk or the role
//! assignments of its system identity. A replaced node would otherwise leak
//! all three, and a recreated VM with the same name would collide with the
//! old NIC.

use tracing::{debug, info};

use kestrel_cloud::CloudClient;
use kestrel_common::naming::{resource_group, resource_name, split_blob_uri};
use kestrel_common::{Result, ResultExt};

/// Delete `name` and its NICs, OS disk and identity role assignments
pub async fn clean_delete_vm(
    cloud: &dyn CloudClient,
    resource_group_name: &str,
    name: &str,
) -> Result<()> {
    info!(vm = %name, "Deleting VM");
    let vm = cloud
        .get_virtual_machine(resource_group_name, name)
        .await
        .with_context(|| format!("reading VM {}", name))?;

    cloud
        .delete_virtual_machine(resource_group_name, name)
        .await
        .with_context(|| format!("deleting VM {}", name))?;

    for nic_id in &vm.network_interface_ids {
        let nic = resource_name(nic_id)?;
        debug!(vm = %name, nic = %nic, "Deleting NIC");
        cloud
            .delete_network_interface(resource_group_name, &nic)
            .await
            .with_context(|| format!("deleting NIC {}", nic))?;
    }

    if let Some(uri) = &vm.os_disk.vhd_uri {
        let (account, container, blob) = split_blob_uri(uri)?;
        debug!(vm = %name, account = %account, blob = %blob, "Deleting OS disk blob");
        cloud
            .delete_blob(&account, &container, &blob)
            .await
            .with_context(|| format!("deleting OS disk blob {}", uri))?;
    } else if let Some(disk_id) = &vm.os_disk.managed_disk_id {
        let disk_group =
            resource_group(disk_id).unwrap_or_else(|| resource_group_name.to_string());
        let disk = resource_name(disk_id).unwrap_or_else(|_| vm.os_disk.name.clone());
        debug!(vm = %name, disk = %disk, "Deleting managed OS disk");
        cloud
            .delete_managed_disk(&disk_group, &disk)
            .await
            .with_context(|| format!("deleting managed disk {}", disk))?;
    }

    if let Some(principal) = &vm.principal_id {
        let assignments = cloud.list_role_assignments_for_principal(principal).await?;
        for assignment in assignments {
            debug!(vm = %name, role_assignment = %assignment.id, "Deleting role assignment");
            cloud
                .delete_role_assignment(&assignment.id)
                .await
                .with_context(|| format!("deleting role assignment {}", assignment.id))?;
        }
    }

    info!(vm = %name, "VM deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCloud;
    use kestrel_cloud::{OsDisk, RoleAssignment, VirtualMachine};
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn vm(os_disk: OsDisk, principal: Option<&str>) -> VirtualMachine {
        VirtualMachine {
            id: "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/k8s-agentpool1-12345678-1".to_string(),
            name: "k8s-agentpool1-12345678-1".to_string(),
            os_disk,
            network_interface_ids: vec![
                "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/k8s-agentpool1-12345678-nic-1".to_string(),
            ],
            principal_id: principal.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn managed_disk_vm_is_removed_in_order() {
        let mut cloud = MockCloud::new();
        let mut seq = Sequence::new();
        let found = vm(
            OsDisk {
                name: "osdisk".to_string(),
                managed_disk_id: Some("/subscriptions/s/resourceGroups/disks-rg/providers/Microsoft.Compute/disks/k8s-agentpool1-12345678-1_OsDisk".to_string()),
                vhd_uri: None,
            },
            Some("principal-1"),
        );
        cloud
            .expect_get_virtual_machine()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(found.clone()));
        cloud
            .expect_delete_virtual_machine()
            .with(eq("rg"), eq("k8s-agentpool1-12345678-1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        cloud
            .expect_delete_network_interface()
            .with(eq("rg"), eq("k8s-agentpool1-12345678-nic-1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        cloud
            .expect_delete_managed_disk()
            .with(eq("disks-rg"), eq("k8s-agentpool1-12345678-1_OsDisk"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        cloud
            .expect_list_role_assignments_for_principal()
            .with(eq("principal-1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(vec![RoleAssignment {
                    id: "/ra/1".to_string(),
                    principal_id: "principal-1".to_string(),
                    scope: "/subscriptions/s/resourceGroups/rg".to_string(),
                }])
            });
        cloud
            .expect_delete_role_assignment()
            .with(eq("/ra/1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        clean_delete_vm(&cloud, "rg", "k8s-agentpool1-12345678-1")
            .await
            .expect("clean delete");
    }

    #[tokio::test]
    async fn vhd_disks_are_deleted_as_blobs() {
        let mut cloud = MockCloud::new();
        let found = vm(
            OsDisk {
                name: "osdisk".to_string(),
                managed_disk_id: None,
                vhd_uri: Some("https://00abcdefagnt0.blob.core.windows.net/osdisk/k8s-agentpool1-12345678-1-osdisk.vhd".to_string()),
            },
            None,
        );
        cloud
            .expect_get_virtual_machine()
            .returning(move |_, _| Ok(found.clone()));
        cloud.expect_delete_virtual_machine().returning(|_, _| Ok(()));
        cloud.expect_delete_network_interface().returning(|_, _| Ok(()));
        cloud
            .expect_delete_blob()
            .with(
                eq("00abcdefagnt0"),
                eq("osdisk"),
                eq("k8s-agentpool1-12345678-1-osdisk.vhd"),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));
        cloud.expect_delete_managed_disk().never();
        cloud.expect_list_role_assignments_for_principal().never();

        clean_delete_vm(&cloud, "rg", "k8s-agentpool1-12345678-1")
            .await
            .expect("clean delete");
    }

    #[tokio::test]
    async fn a_failed_vm_delete_leaves_the_nic_alone() {
        let mut cloud = MockCloud::new();
        let found = vm(OsDisk::default(), None);
        cloud
            .expect_get_virtual_machine()
            .returning(move |_, _| Ok(found.clone()));
        cloud
            .expect_delete_virtual_machine()
            .returning(|_, _| Err(kestrel_common::Error::cloud_api("Conflict", "operation in progress")));
        cloud.expect_delete_network_interface().never();

        let err = clean_delete_vm(&cloud, "rg", "k8s-agentpool1-12345678-1")
            .await
            .expect_err("delete fails");
        assert!(err.to_string().contains("deleting VM k8s-agentpool1-12345678-1"));
    }
}
