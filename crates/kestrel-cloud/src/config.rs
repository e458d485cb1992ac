//! Which cloud to talk to, and as whom
//!
//! Azure and Azure Stack expose the same resource manager surface at different
//! endpoints and with older API versions on Stack. The client dispatches on a
//! [`CloudConfig`] value rather than on a type per cloud.

use std::time::Duration;

use kestrel_common::api::CustomCloudProfile;
use kestrel_common::{Error, Result};

/// Default bound on one cloud operation, including long-running ones
pub const DEFAULT_ARM_OPERATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Contributor built-in role definition id
pub const CONTRIBUTOR_ROLE_DEFINITION_ID: &str = "b24988ac-6180-42a0-ab88-20f7382dd24c";

/// Endpoint set of the target cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudEndpoints {
    AzurePublicCloud,
    AzureStack {
        resource_manager_endpoint: String,
        active_directory_endpoint: String,
        graph_endpoint: String,
        resource_manager_vm_dns_suffix: String,
        /// Graph is unavailable when Stack uses ADFS
        adfs: bool,
    },
}

impl CloudEndpoints {
    /// Endpoints described by an Azure Stack custom cloud profile
    pub fn from_custom_cloud(profile: &CustomCloudProfile) -> Result<Self> {
        let env = profile.environment.as_ref().ok_or_else(|| {
            Error::model_invalid(
                "properties.customCloudProfile.environment",
                "custom cloud profile requires an environment",
            )
        })?;
        if env.resource_manager_endpoint.is_empty() {
            return Err(Error::model_invalid(
                "properties.customCloudProfile.environment.resourceManagerEndpoint",
                "must be set",
            ));
        }
        Ok(CloudEndpoints::AzureStack {
            resource_manager_endpoint: env.resource_manager_endpoint.clone(),
            active_directory_endpoint: env.active_directory_endpoint.clone(),
            graph_endpoint: env.graph_endpoint.clone(),
            resource_manager_vm_dns_suffix: env.resource_manager_vm_dns_suffix.clone(),
            adfs: profile.identity_system.eq_ignore_ascii_case("adfs"),
        })
    }

    pub fn resource_manager(&self) -> &str {
        match self {
            CloudEndpoints::AzurePublicCloud => "https://management.azure.com/",
            CloudEndpoints::AzureStack {
                resource_manager_endpoint,
                ..
            } => resource_manager_endpoint,
        }
    }

    /// Graph endpoint, `None` where application management is unavailable
    pub fn graph(&self) -> Option<&str> {
        match self {
            CloudEndpoints::AzurePublicCloud => Some("https://graph.microsoft.com/"),
            CloudEndpoints::AzureStack { adfs: true, .. } => None,
            CloudEndpoints::AzureStack { graph_endpoint, .. } if graph_endpoint.is_empty() => None,
            CloudEndpoints::AzureStack { graph_endpoint, .. } => Some(graph_endpoint),
        }
    }

    pub fn api_versions(&self) -> &'static ApiVersions {
        match self {
            CloudEndpoints::AzurePublicCloud => &PUBLIC_API_VERSIONS,
            CloudEndpoints::AzureStack { .. } => &STACK_API_VERSIONS,
        }
    }

    pub fn is_azure_stack(&self) -> bool {
        matches!(self, CloudEndpoints::AzureStack { .. })
    }
}

/// REST API versions per resource provider
#[derive(Debug, PartialEq, Eq)]
pub struct ApiVersions {
    pub resources: &'static str,
    pub compute: &'static str,
    pub network: &'static str,
    pub storage: &'static str,
    pub authorization: &'static str,
    pub subscriptions: &'static str,
    pub skus: &'static str,
}

const PUBLIC_API_VERSIONS: ApiVersions = ApiVersions {
    resources: "2021-04-01",
    compute: "2022-08-01",
    network: "2022-07-01",
    storage: "2021-09-01",
    authorization: "2022-04-01",
    subscriptions: "2020-01-01",
    skus: "2021-07-01",
};

const STACK_API_VERSIONS: ApiVersions = ApiVersions {
    resources: "2018-05-01",
    compute: "2020-06-01",
    network: "2018-11-01",
    storage: "2019-06-01",
    authorization: "2015-07-01",
    subscriptions: "2016-06-01",
    skus: "2017-09-01",
};

/// Everything the client needs to reach the cloud
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub endpoints: CloudEndpoints,
    pub subscription_id: String,
    pub tenant_id: String,
    /// Bearer token for the resource manager
    pub access_token: String,
    /// Bearer token for Graph, when application management is needed
    pub graph_token: Option<String>,
    pub operation_timeout: Duration,
    /// Poll interval for long-running operations
    pub poll_interval: Duration,
}

impl CloudConfig {
    pub fn new(endpoints: CloudEndpoints, subscription_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            endpoints,
            subscription_id: subscription_id.into(),
            tenant_id: String::new(),
            access_token: access_token.into(),
            graph_token: None,
            operation_timeout: DEFAULT_ARM_OPERATION_TIMEOUT,
            poll_interval: Duration::from_secs(10),
        }
    }

    /// Reject configurations that cannot authenticate
    pub fn validate(&self) -> Result<()> {
        if self.subscription_id.is_empty() {
            return Err(Error::invalid_args("--subscription-id is required"));
        }
        if self.access_token.is_empty() {
            return Err(Error::cloud_auth("no access token available for the resource manager"));
        }
        Ok(())
    }
}
