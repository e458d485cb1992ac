//! Custom cloud environment descriptor
//!
//! Azure Stack deployments describe their endpoints in the API model. After
//! defaulting, the descriptor is written once to a temp file and its path is
//! carried in a [`CloudEnvironment`] value threaded through the engine. Only
//! child processes that need the file see it, through [`CloudEnvironment::env_var`].

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::debug;

use crate::api::CustomCloudProfile;
use crate::{Error, Result};

/// Environment variable consumed by Azure SDKs to locate the descriptor
pub const ENVIRONMENT_FILEPATH_VAR: &str = "AZURE_ENVIRONMENT_FILEPATH";

/// Cloud name written into the descriptor
pub const AZURE_STACK_CLOUD_NAME: &str = "AzureStackCloud";

/// Identity system used when the model does not name one
pub const DEFAULT_IDENTITY_SYSTEM: &str = "azure_ad";

/// Authentication method used when the model does not name one
pub const DEFAULT_AUTHENTICATION_METHOD: &str = "client_secret";

/// Where the custom cloud descriptor lives, if any
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudEnvironment {
    profile_path: Option<PathBuf>,
}

impl CloudEnvironment {
    /// Public Azure: no descriptor
    pub fn public() -> Self {
        Self::default()
    }

    /// Path of the written descriptor
    pub fn profile_path(&self) -> Option<&Path> {
        self.profile_path.as_deref()
    }

    /// `(name, value)` pair for child process environments
    pub fn env_var(&self) -> Option<(&'static str, String)> {
        self.profile_path
            .as_ref()
            .map(|p| (ENVIRONMENT_FILEPATH_VAR, p.display().to_string()))
    }

    /// Write the descriptor for `profile` under `dir` and remember its path
    pub async fn write(profile: &CustomCloudProfile, dir: &Path, name: &str) -> Result<Self> {
        let environment = profile.environment.as_ref().ok_or_else(|| {
            Error::model_invalid(
                "properties.customCloudProfile.environment",
                "custom cloud profile requires an environment",
            )
        })?;
        if environment.resource_manager_endpoint.is_empty() {
            return Err(Error::model_invalid(
                "properties.customCloudProfile.environment.resourceManagerEndpoint",
                "must be set",
            ));
        }

        let mut descriptor = serde_json::to_value(environment)?;
        if let Some(obj) = descriptor.as_object_mut() {
            obj.entry("name")
                .or_insert_with(|| json!(AZURE_STACK_CLOUD_NAME));
        }
        let bytes = serde_json::to_vec_pretty(&descriptor)?;

        let path = dir.join(format!("{}.azurestackcloud.json", name));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        debug!(path = %path.display(), "Wrote custom cloud environment descriptor");

        Ok(Self {
            profile_path: Some(path),
        })
    }
}

/// Fill identity defaults of a custom cloud profile
pub fn set_custom_cloud_defaults(profile: &mut CustomCloudProfile) {
    if profile.identity_system.is_empty() {
        profile.identity_system = DEFAULT_IDENTITY_SYSTEM.to_string();
    }
    if profile.authentication_method.is_empty() {
        profile.authentication_method = DEFAULT_AUTHENTICATION_METHOD.to_string();
    }
    if let Some(env) = profile.environment.as_mut() {
        if env.name.is_empty() {
            env.name = AZURE_STACK_CLOUD_NAME.to_string();
        }
    }
}
