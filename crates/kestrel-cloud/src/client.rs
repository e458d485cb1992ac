//! The cloud surface the engine calls

use async_trait::async_trait;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use kestrel_common::Result;

use crate::pager::Pager;
use crate::types::{
    AppCredentials, DeploymentResult, Location, ResourceSku, RoleAssignment, ScaleSet, ScaleSetVm,
    VirtualMachine,
};

/// Resource groups, deployments, compute and graph capabilities of a cloud
///
/// Long-running operations resolve when the cloud reports a terminal state.
/// Listings return a [`Pager`] that must be driven to the last page.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Create the resource group if it does not exist
    async fn ensure_resource_group(&self, name: &str, location: &str) -> Result<()>;

    /// Submit an incremental deployment and wait for it to finish
    ///
    /// A failed deployment is `DeploymentFailed` carrying the cloud's body.
    async fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<DeploymentResult>;

    fn list_virtual_machines(&self, resource_group: &str) -> Pager<VirtualMachine>;

    fn list_virtual_machine_scale_sets(&self, resource_group: &str) -> Pager<ScaleSet>;

    fn list_scale_set_vms(&self, resource_group: &str, scale_set: &str) -> Pager<ScaleSetVm>;

    async fn get_virtual_machine(&self, resource_group: &str, name: &str) -> Result<VirtualMachine>;

    async fn list_locations(&self) -> Result<Vec<Location>>;

    fn list_resource_skus(&self, filter: &str) -> Pager<ResourceSku>;

    async fn delete_virtual_machine(&self, resource_group: &str, name: &str) -> Result<()>;

    async fn delete_network_interface(&self, resource_group: &str, name: &str) -> Result<()>;

    async fn delete_managed_disk(&self, resource_group: &str, name: &str) -> Result<()>;

    async fn delete_blob(&self, account: &str, container: &str, blob: &str) -> Result<()>;

    async fn list_role_assignments_for_principal(
        &self,
        principal_id: &str,
    ) -> Result<Vec<RoleAssignment>>;

    async fn delete_role_assignment(&self, id: &str) -> Result<()>;

    /// Register an application and its service principal, returning a secret
    async fn create_app(
        &self,
        name: &str,
        reply_urls: &[String],
        required_resource_access: &Value,
    ) -> Result<AppCredentials>;

    /// Grant `principal_id` Contributor on the resource group
    async fn create_role_assignment_simple(
        &self,
        resource_group: &str,
        principal_id: &str,
    ) -> Result<()>;

    async fn set_scale_set_capacity(
        &self,
        resource_group: &str,
        scale_set: &str,
        capacity: u32,
    ) -> Result<()>;

    async fn delete_scale_set_vm(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<()>;
}
