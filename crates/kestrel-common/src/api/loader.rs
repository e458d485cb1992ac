//! Loading and serializing API model documents

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::debug;

use super::defaults::{apply_defaults, DefaultsMode, DefaultsOutcome};
use super::merge::apply_set_flags;
use super::types::{AgentPoolProfile, ContainerService};
use super::validate::validate;
use crate::store::{to_canonical_json, FileStore};
use crate::versions::VersionPolicy;
use crate::{Error, Result};

/// Schema label of an API model document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    /// Current schema
    Vlabs,
    /// Legacy schema without orchestrator release or version fields
    V20160930,
}

impl ApiVersion {
    pub fn label(self) -> &'static str {
        match self {
            ApiVersion::Vlabs => "vlabs",
            ApiVersion::V20160930 => "2016-09-30",
        }
    }

    pub fn from_label(label: &str) -> Result<Self> {
        match label {
            "vlabs" => Ok(ApiVersion::Vlabs),
            "2016-09-30" => Ok(ApiVersion::V20160930),
            other => Err(Error::model_invalid(
                "apiVersion",
                format!("unrecognized APIVersion '{}'", other),
            )),
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How to post-process a loaded document
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Run validation after defaulting
    pub validate: bool,
    /// The model describes an existing cluster
    pub is_update: bool,
    /// Apply defaults in this mode
    pub defaults: Option<DefaultsMode>,
    /// `--set` flags merged before typed parsing
    pub set_flags: Vec<String>,
}

/// A loaded model and what defaulting decided
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub model: ContainerService,
    pub api_version: ApiVersion,
    pub defaults: Option<DefaultsOutcome>,
}

/// Reads and writes API model documents
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiModelLoader: Send + Sync {
    /// Load a model from disk; a missing file is `ModelNotFound`
    async fn load(&self, path: &Path, options: &LoadOptions) -> Result<LoadedModel>;

    /// Load a model from bytes
    fn deserialize(&self, contents: &[u8], options: &LoadOptions) -> Result<LoadedModel>;

    /// Canonical bytes of a model under a schema label
    fn serialize(&self, model: &ContainerService, api_version: ApiVersion) -> Result<Vec<u8>>;

    /// Load a standalone agent pool document
    async fn load_agent_pool(&self, path: &Path) -> Result<AgentPoolProfile>;
}

/// [`ApiModelLoader`] over JSON documents read through a [`FileStore`]
pub struct JsonApiModelLoader {
    store: Arc<dyn FileStore>,
    policy: VersionPolicy,
}

impl JsonApiModelLoader {
    pub fn new(store: Arc<dyn FileStore>, policy: VersionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &VersionPolicy {
        &self.policy
    }
}

fn require(doc: &Value, pointer: &str, field: &str) -> Result<()> {
    match doc.pointer(pointer) {
        Some(v) if !v.is_null() => Ok(()),
        _ => Err(Error::model_invalid(field, "is required")),
    }
}

fn check_required(doc: &Value) -> Result<()> {
    require(doc, "/properties", "properties")?;
    require(
        doc,
        "/properties/orchestratorProfile",
        "properties.orchestratorProfile",
    )?;
    if doc.pointer("/properties/masterProfile").is_none()
        && doc.pointer("/properties/hostedMasterProfile").is_none()
    {
        return Err(Error::model_invalid(
            "properties.masterProfile",
            "masterProfile or hostedMasterProfile is required",
        ));
    }
    require(
        doc,
        "/properties/agentPoolProfiles",
        "properties.agentPoolProfiles",
    )
}

fn check_legacy(doc: &Value) -> Result<()> {
    for field in ["orchestratorRelease", "orchestratorVersion"] {
        if doc
            .pointer(&format!("/properties/orchestratorProfile/{}", field))
            .is_some()
        {
            return Err(Error::model_invalid(
                format!("properties.orchestratorProfile.{}", field),
                format!(
                    "is not part of API version {}",
                    ApiVersion::V20160930.label()
                ),
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl ApiModelLoader for JsonApiModelLoader {
    async fn load(&self, path: &Path, options: &LoadOptions) -> Result<LoadedModel> {
        if !self.store.exists(path).await {
            return Err(Error::model_not_found(path.display().to_string()));
        }
        let contents = self.store.read(path).await?;
        debug!(path = %path.display(), "Loading API model");
        self.deserialize(&contents, options)
            .map_err(|e| e.context(format!("error parsing the api model {}", path.display())))
    }

    fn deserialize(&self, contents: &[u8], options: &LoadOptions) -> Result<LoadedModel> {
        let mut doc: Value = serde_json::from_slice(contents)?;
        if !doc.is_object() {
            return Err(Error::model_invalid("(root)", "API model must be a JSON object"));
        }

        let label = doc
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let api_version = ApiVersion::from_label(&label)?;

        if !options.set_flags.is_empty() {
            apply_set_flags(&mut doc, &options.set_flags)?;
        }

        check_required(&doc)?;
        if api_version == ApiVersion::V20160930 {
            check_legacy(&doc)?;
        }

        let mut model: ContainerService = serde_json::from_value(doc)?;

        let defaults = match options.defaults {
            Some(mode) => Some(apply_defaults(&mut model, mode, &self.policy)?),
            None => None,
        };

        if options.validate {
            validate(&model, options.is_update, &self.policy)?;
        }

        Ok(LoadedModel {
            model,
            api_version,
            defaults,
        })
    }

    fn serialize(&self, model: &ContainerService, api_version: ApiVersion) -> Result<Vec<u8>> {
        let mut labelled = model.clone();
        labelled.api_version = api_version.label().to_string();
        to_canonical_json(&labelled)
    }

    async fn load_agent_pool(&self, path: &Path) -> Result<AgentPoolProfile> {
        if !self.store.exists(path).await {
            return Err(Error::model_not_found(path.display().to_string()));
        }
        let contents = self.store.read(path).await?;
        let pool: AgentPoolProfile = serde_json::from_slice(&contents)
            .map_err(|e| Error::model_invalid("nodePool", e.to_string()))?;
        Ok(pool)
    }
}
