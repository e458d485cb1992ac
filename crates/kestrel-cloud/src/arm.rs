//! Resource manager REST client
//!
//! Talks to the ARM and Graph REST APIs with reqwest. Bearer tokens are
//! acquired by the caller; this client only attaches them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use kestrel_common::poll::{wait_with_timeout, with_deadline};
use kestrel_common::{Error, Result};

use crate::client::CloudClient;
use crate::config::{CloudConfig, CONTRIBUTOR_ROLE_DEFINITION_ID};
use crate::pager::{Page, PageSource, Pager};
use crate::types::{
    role_assignment_from_json, scale_set_from_json, scale_set_vm_from_json, vm_from_json,
    AppCredentials, DeploymentResult, Location, ResourceSku, RoleAssignment, ScaleSet, ScaleSetVm,
    VirtualMachine,
};

const ASYNC_OPERATION: &str = "azure-asyncoperation";
const STORAGE_API_VERSION: &str = "2019-12-12";

/// Map an error response to a typed error
fn api_error(status: StatusCode, body: &str) -> Error {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| status.as_u16().to_string());
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Error::cloud_auth(format!("{}: {}", code, message));
    }
    Error::cloud_api(code, message)
}

fn transport_error(err: reqwest::Error) -> Error {
    Error::cloud_api("RequestFailed", err.to_string())
}

async fn read_json(response: Response) -> Result<Value> {
    let text = response.text().await.map_err(transport_error)?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

fn poll_url(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ASYNC_OPERATION)
        .or_else(|| headers.get(LOCATION))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// ARM and Graph client
#[derive(Clone)]
pub struct ArmClient {
    http: reqwest::Client,
    config: Arc<CloudConfig>,
}

impl std::fmt::Debug for ArmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmClient")
            .field("endpoints", &self.config.endpoints)
            .field("subscription_id", &self.config.subscription_id)
            .finish()
    }
}

impl ArmClient {
    pub fn new(config: CloudConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::internal(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    fn arm_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.endpoints.resource_manager().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn subscription_path(&self) -> String {
        format!("subscriptions/{}", self.config.subscription_id)
    }

    fn group_path(&self, resource_group: &str) -> String {
        format!("{}/resourceGroups/{}", self.subscription_path(), resource_group)
    }

    fn compute_path(&self, resource_group: &str, kind: &str, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Compute/{}/{}",
            self.group_path(resource_group),
            kind,
            name
        )
    }

    fn arm(&self, method: Method, path: &str, api_version: &str) -> RequestBuilder {
        self.http
            .request(method, self.arm_url(path))
            .query(&[("api-version", api_version)])
            .bearer_auth(&self.config.access_token)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    /// Execute a request whose result may be a long-running operation
    async fn execute_lro(&self, request: RequestBuilder, what: &str) -> Result<Value> {
        let response = self.execute(request).await?;
        let status = response.status();
        let url = poll_url(response.headers());
        let body = read_json(response).await?;
        match (status, url) {
            (StatusCode::ACCEPTED, Some(url)) | (StatusCode::CREATED, Some(url)) => {
                self.wait_operation(&url, what).await
            }
            _ => Ok(body),
        }
    }

    async fn wait_operation(&self, url: &str, what: &str) -> Result<Value> {
        wait_with_timeout(
            Some(self.config.operation_timeout),
            self.config.poll_interval,
            what,
            || async move {
                let response = self
                    .execute(self.http.get(url).bearer_auth(&self.config.access_token))
                    .await?;
                if response.status() == StatusCode::ACCEPTED {
                    return Ok(None);
                }
                let body = read_json(response).await?;
                match body.get("status").and_then(Value::as_str) {
                    Some("InProgress") | Some("Running") => Ok(None),
                    Some("Failed") | Some("Canceled") => {
                        let code = body
                            .pointer("/error/code")
                            .and_then(Value::as_str)
                            .unwrap_or("OperationFailed");
                        let message = body
                            .pointer("/error/message")
                            .and_then(Value::as_str)
                            .unwrap_or("long-running operation failed");
                        Err(Error::cloud_api(code, message))
                    }
                    _ => Ok(Some(body)),
                }
            },
        )
        .await
    }

    /// DELETE that treats an already-missing resource as deleted
    async fn delete(&self, path: &str, api_version: &str, what: &str) -> Result<()> {
        let request = self.arm(Method::DELETE, path, api_version);
        match self.execute_lro(request, what).await {
            Ok(_) => Ok(()),
            Err(Error::CloudApi { code, .. })
                if code == "404" || code == "ResourceNotFound" || code == "NotFound" =>
            {
                debug!(path = %path, "Resource already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn pager<T, F>(&self, path: &str, api_version: &str, extra_query: Vec<(String, String)>, parse: F) -> Pager<T>
    where
        T: Send + 'static,
        F: Fn(&Value) -> T + Send + Sync + 'static,
    {
        let mut query = vec![("api-version".to_string(), api_version.to_string())];
        query.extend(extra_query);
        Pager::new(Arc::new(ArmListSource {
            client: self.clone(),
            url: self.arm_url(path),
            query,
            parse,
        }))
    }

    fn graph(&self) -> Result<(String, String)> {
        let endpoint = self.config.endpoints.graph().ok_or_else(|| {
            Error::cloud_api(
                "GraphUnavailable",
                "application management is not available on this cloud; supply a service principal",
            )
        })?;
        let token = self
            .config
            .graph_token
            .clone()
            .ok_or_else(|| Error::cloud_auth("no Graph token available to create an application"))?;
        Ok((endpoint.trim_end_matches('/').to_string(), token))
    }

    async fn graph_post(&self, endpoint: &str, token: &str, path: &str, body: Value) -> Result<Value> {
        let request = self
            .http
            .post(format!("{}/v1.0/{}", endpoint, path))
            .bearer_auth(token)
            .json(&body);
        read_json(self.execute(request).await?).await
    }

    fn storage_suffix(&self) -> String {
        match &self.config.endpoints {
            crate::config::CloudEndpoints::AzurePublicCloud => "core.windows.net".to_string(),
            crate::config::CloudEndpoints::AzureStack {
                resource_manager_vm_dns_suffix,
                ..
            } => resource_manager_vm_dns_suffix
                .trim_start_matches("cloudapp.")
                .to_string(),
        }
    }
}

struct ArmListSource<F> {
    client: ArmClient,
    url: String,
    query: Vec<(String, String)>,
    parse: F,
}

#[async_trait]
impl<T, F> PageSource<T> for ArmListSource<F>
where
    T: Send + 'static,
    F: Fn(&Value) -> T + Send + Sync + 'static,
{
    async fn fetch(&self, link: Option<&str>) -> Result<Page<T>> {
        let request = match link {
            // next links carry their own query string
            Some(link) => self.client.http.get(link),
            None => self.client.http.get(&self.url).query(&self.query),
        }
        .bearer_auth(&self.client.config.access_token);
        let body = read_json(self.client.execute(request).await?).await?;
        let items = body
            .get("value")
            .and_then(Value::as_array)
            .map(|values| values.iter().map(|v| (self.parse)(v)).collect())
            .unwrap_or_default();
        let next_link = body
            .get("nextLink")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Page { items, next_link })
    }
}

#[async_trait]
impl CloudClient for ArmClient {
    async fn ensure_resource_group(&self, name: &str, location: &str) -> Result<()> {
        let versions = self.config.endpoints.api_versions();
        let request = self
            .arm(Method::PUT, &self.group_path(name), versions.resources)
            .json(&json!({ "location": location }));
        self.execute(request).await?;
        info!(resource_group = %name, location = %location, "Ensured resource group");
        Ok(())
    }

    async fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<DeploymentResult> {
        let versions = self.config.endpoints.api_versions();
        let path = format!(
            "{}/providers/Microsoft.Resources/deployments/{}",
            self.group_path(resource_group),
            deployment_name
        );
        let request = self.arm(Method::PUT, &path, versions.resources).json(&json!({
            "properties": {
                "template": template,
                "parameters": parameters,
                "mode": "Incremental",
            }
        }));
        self.execute(request).await?;
        info!(deployment = %deployment_name, resource_group = %resource_group, "Submitted deployment");

        let step = format!("deployment {}", deployment_name);
        let body = with_deadline(
            Some(self.config.operation_timeout),
            &step,
            wait_with_timeout(None, self.config.poll_interval, &step, || {
                let path = path.clone();
                async move {
                    let response = self.execute(self.arm(Method::GET, &path, versions.resources)).await?;
                    let body = read_json(response).await?;
                    let state = body
                        .pointer("/properties/provisioningState")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    match state {
                        "Succeeded" | "Failed" | "Canceled" => Ok(Some(body)),
                        _ => Ok(None),
                    }
                }
            }),
        )
        .await?;

        let provisioning_state = body
            .pointer("/properties/provisioningState")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let raw = body.to_string();
        if provisioning_state != "Succeeded" {
            warn!(deployment = %deployment_name, state = %provisioning_state, "Deployment did not succeed");
            let detail = body
                .pointer("/properties/error")
                .map(Value::to_string)
                .unwrap_or_else(|| raw.clone());
            return Err(Error::deployment_failed(detail));
        }
        Ok(DeploymentResult {
            name: deployment_name.to_string(),
            provisioning_state,
            outputs: body.pointer("/properties/outputs").cloned(),
            body: raw,
        })
    }

    fn list_virtual_machines(&self, resource_group: &str) -> Pager<VirtualMachine> {
        let path = format!(
            "{}/providers/Microsoft.Compute/virtualMachines",
            self.group_path(resource_group)
        );
        self.pager(&path, self.config.endpoints.api_versions().compute, Vec::new(), vm_from_json)
    }

    fn list_virtual_machine_scale_sets(&self, resource_group: &str) -> Pager<ScaleSet> {
        let path = format!(
            "{}/providers/Microsoft.Compute/virtualMachineScaleSets",
            self.group_path(resource_group)
        );
        self.pager(
            &path,
            self.config.endpoints.api_versions().compute,
            Vec::new(),
            scale_set_from_json,
        )
    }

    fn list_scale_set_vms(&self, resource_group: &str, scale_set: &str) -> Pager<ScaleSetVm> {
        let path = format!(
            "{}/virtualMachines",
            self.compute_path(resource_group, "virtualMachineScaleSets", scale_set)
        );
        self.pager(
            &path,
            self.config.endpoints.api_versions().compute,
            Vec::new(),
            scale_set_vm_from_json,
        )
    }

    async fn get_virtual_machine(&self, resource_group: &str, name: &str) -> Result<VirtualMachine> {
        let path = self.compute_path(resource_group, "virtualMachines", name);
        let request = self.arm(Method::GET, &path, self.config.endpoints.api_versions().compute);
        let body = read_json(self.execute(request).await?).await?;
        Ok(vm_from_json(&body))
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        let path = format!("{}/locations", self.subscription_path());
        let request = self.arm(
            Method::GET,
            &path,
            self.config.endpoints.api_versions().subscriptions,
        );
        let body = read_json(self.execute(request).await?).await?;
        let values = body.get("value").cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(values)?)
    }

    fn list_resource_skus(&self, filter: &str) -> Pager<ResourceSku> {
        let path = format!("{}/providers/Microsoft.Compute/skus", self.subscription_path());
        let query = if filter.is_empty() {
            Vec::new()
        } else {
            vec![("$filter".to_string(), filter.to_string())]
        };
        self.pager(&path, self.config.endpoints.api_versions().skus, query, |v| {
            serde_json::from_value(v.clone()).unwrap_or_default()
        })
    }

    async fn delete_virtual_machine(&self, resource_group: &str, name: &str) -> Result<()> {
        let path = self.compute_path(resource_group, "virtualMachines", name);
        self.delete(
            &path,
            self.config.endpoints.api_versions().compute,
            &format!("deletion of VM {}", name),
        )
        .await
    }

    async fn delete_network_interface(&self, resource_group: &str, name: &str) -> Result<()> {
        let path = format!(
            "{}/providers/Microsoft.Network/networkInterfaces/{}",
            self.group_path(resource_group),
            name
        );
        self.delete(
            &path,
            self.config.endpoints.api_versions().network,
            &format!("deletion of NIC {}", name),
        )
        .await
    }

    async fn delete_managed_disk(&self, resource_group: &str, name: &str) -> Result<()> {
        let path = self.compute_path(resource_group, "disks", name);
        self.delete(
            &path,
            self.config.endpoints.api_versions().compute,
            &format!("deletion of disk {}", name),
        )
        .await
    }

    async fn delete_blob(&self, account: &str, container: &str, blob: &str) -> Result<()> {
        let url = format!(
            "https://{}.blob.{}/{}/{}",
            account,
            self.storage_suffix(),
            container,
            blob
        );
        let request = self
            .http
            .delete(url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .bearer_auth(&self.config.access_token);
        match self.execute(request).await {
            Ok(_) => Ok(()),
            Err(Error::CloudApi { code, .. }) if code == "404" || code == "BlobNotFound" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_role_assignments_for_principal(
        &self,
        principal_id: &str,
    ) -> Result<Vec<RoleAssignment>> {
        let path = format!(
            "{}/providers/Microsoft.Authorization/roleAssignments",
            self.subscription_path()
        );
        let filter = format!("principalId eq '{}'", principal_id);
        self.pager(
            &path,
            self.config.endpoints.api_versions().authorization,
            vec![("$filter".to_string(), filter)],
            role_assignment_from_json,
        )
        .collect_all()
        .await
    }

    async fn delete_role_assignment(&self, id: &str) -> Result<()> {
        self.delete(
            id,
            self.config.endpoints.api_versions().authorization,
            "deletion of role assignment",
        )
        .await
    }

    async fn create_app(
        &self,
        name: &str,
        reply_urls: &[String],
        required_resource_access: &Value,
    ) -> Result<AppCredentials> {
        let (endpoint, token) = self.graph()?;
        let app = self
            .graph_post(
                &endpoint,
                &token,
                "applications",
                json!({
                    "displayName": name,
                    "web": {"redirectUris": reply_urls},
                    "requiredResourceAccess": required_resource_access,
                }),
            )
            .await?;
        let app_id = app
            .get("appId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::cloud_api("InvalidResponse", "application has no appId"))?
            .to_string();
        let object_id = app
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::cloud_api("InvalidResponse", "application has no id"))?
            .to_string();

        let sp = self
            .graph_post(&endpoint, &token, "servicePrincipals", json!({ "appId": app_id }))
            .await?;
        let sp_object_id = sp
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::cloud_api("InvalidResponse", "service principal has no id"))?
            .to_string();

        let password = self
            .graph_post(
                &endpoint,
                &token,
                &format!("applications/{}/addPassword", object_id),
                json!({ "passwordCredential": {"displayName": name} }),
            )
            .await?;
        let secret = password
            .get("secretText")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::cloud_api("InvalidResponse", "password credential has no secret"))?
            .to_string();

        info!(app_id = %app_id, "Created application and service principal");
        Ok(AppCredentials {
            app_id,
            service_principal_object_id: sp_object_id,
            secret,
        })
    }

    async fn create_role_assignment_simple(
        &self,
        resource_group: &str,
        principal_id: &str,
    ) -> Result<()> {
        let path = format!(
            "{}/providers/Microsoft.Authorization/roleAssignments/{}",
            self.group_path(resource_group),
            uuid::Uuid::new_v4()
        );
        let role_definition = format!(
            "/{}/providers/Microsoft.Authorization/roleDefinitions/{}",
            self.subscription_path(),
            CONTRIBUTOR_ROLE_DEFINITION_ID
        );
        let request = self
            .arm(
                Method::PUT,
                &path,
                self.config.endpoints.api_versions().authorization,
            )
            .json(&json!({
                "properties": {
                    "roleDefinitionId": role_definition,
                    "principalId": principal_id,
                }
            }));
        self.execute(request).await?;
        info!(principal = %principal_id, resource_group = %resource_group, "Assigned Contributor role");
        Ok(())
    }

    async fn set_scale_set_capacity(
        &self,
        resource_group: &str,
        scale_set: &str,
        capacity: u32,
    ) -> Result<()> {
        let path = self.compute_path(resource_group, "virtualMachineScaleSets", scale_set);
        let request = self
            .arm(
                Method::PATCH,
                &path,
                self.config.endpoints.api_versions().compute,
            )
            .json(&json!({ "sku": {"capacity": capacity} }));
        self.execute_lro(request, &format!("capacity update of {}", scale_set))
            .await?;
        info!(scale_set = %scale_set, capacity, "Set scale set capacity");
        Ok(())
    }

    async fn delete_scale_set_vm(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<()> {
        let path = format!(
            "{}/virtualMachines/{}",
            self.compute_path(resource_group, "virtualMachineScaleSets", scale_set),
            instance_id
        );
        self.delete(
            &path,
            self.config.endpoints.api_versions().compute,
            &format!("deletion of {} instance {}", scale_set, instance_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudEndpoints;
    use kestrel_common::ErrorKind;

    fn client() -> ArmClient {
        ArmClient::new(CloudConfig::new(CloudEndpoints::AzurePublicCloud, "sub-1", "token"))
            .expect("client")
    }

    #[test]
    fn error_bodies_become_typed_errors() {
        let body = r#"{"error":{"code":"QuotaExceeded","message":"not enough cores"}}"#;
        let err = api_error(StatusCode::CONFLICT, body);
        assert_eq!(err.kind(), ErrorKind::CloudApiError);
        assert!(err.to_string().contains("QuotaExceeded"));

        let err = api_error(StatusCode::FORBIDDEN, body);
        assert_eq!(err.kind(), ErrorKind::CloudAuthFailed);

        let err = api_error(StatusCode::BAD_GATEWAY, "upstream sad");
        assert!(matches!(err, Error::CloudApi { ref code, .. } if code == "502"));
    }

    #[test]
    fn urls_are_rooted_at_the_configured_endpoint() {
        let client = client();
        assert_eq!(
            client.arm_url(&client.compute_path("rg", "virtualMachines", "vm-0")),
            "https://management.azure.com/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm-0"
        );
        assert_eq!(client.storage_suffix(), "core.windows.net");
    }

    #[test]
    fn azure_stack_uses_its_own_endpoints() {
        let endpoints = CloudEndpoints::AzureStack {
            resource_manager_endpoint: "https://management.local.azurestack.external".into(),
            active_directory_endpoint: String::new(),
            graph_endpoint: String::new(),
            resource_manager_vm_dns_suffix: "cloudapp.local.azurestack.external".into(),
            adfs: true,
        };
        let client = ArmClient::new(CloudConfig::new(endpoints, "sub-1", "token")).expect("client");
        assert!(client.arm_url("subscriptions/sub-1").starts_with("https://management.local.azurestack.external/"));
        assert_eq!(client.storage_suffix(), "local.azurestack.external");
        assert_eq!(client.graph().unwrap_err().kind(), ErrorKind::CloudApiError);
    }

    #[test]
    fn listings_start_with_a_first_page_pending() {
        let client = client();
        let vms: Pager<VirtualMachine> = client.list_virtual_machines("rg");
        assert!(vms.not_done());
        let skus = client.list_resource_skus("resourceType eq 'virtualMachines'");
        assert!(skus.not_done());
    }

    #[test]
    fn async_operation_header_wins_over_location() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, "https://loc".parse().expect("header"));
        assert_eq!(poll_url(&headers).as_deref(), Some("https://loc"));
        headers.insert(ASYNC_OPERATION, "https://op".parse().expect("header"));
        assert_eq!(poll_url(&headers).as_deref(), Some("https://op"));
    }
}
