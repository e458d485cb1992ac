//! Deployment parameters
//!
//! ARM takes parameter values wrapped in a `{"value": ...}` envelope. The
//! scaling and upgrade verbs narrow a deployment by rewriting the count and
//! offset parameters of the master role or of one pool.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Result, TransformError};
use crate::model::{CONTENT_VERSION, PARAMETERS_SCHEMA};

/// Parameter values keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter value
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_string(), json!({ "value": value.into() }));
    }

    /// Unwrapped value of a parameter
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)?.get("value")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn set_pool_count(&mut self, pool: &str, count: usize) {
        self.set(&format!("{}Count", pool), count);
    }

    pub fn set_pool_offset(&mut self, pool: &str, offset: usize) {
        self.set(&format!("{}Offset", pool), offset);
    }

    pub fn set_master_count(&mut self, count: usize) {
        self.set("masterCount", count);
    }

    pub fn set_master_offset(&mut self, offset: usize) {
        self.set("masterOffset", offset);
    }

    /// The envelope map sent to the deployments API
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// The `azuredeploy.parameters.json` document
    pub fn to_document(&self) -> Value {
        json!({
            "$schema": PARAMETERS_SCHEMA,
            "contentVersion": CONTENT_VERSION,
            "parameters": self.0,
        })
    }

    /// Read a parameters document, or a bare parameter map
    pub fn from_document(doc: Value) -> Result<Self> {
        let map = match doc {
            Value::Object(mut root) => match root.remove("parameters") {
                Some(Value::Object(params)) => params,
                Some(_) => {
                    return Err(TransformError::malformed(
                        "parameters",
                        "parameters is not an object",
                    ))
                }
                None => root,
            },
            _ => return Err(TransformError::malformed("$", "parameters document is not an object")),
        };
        for (name, entry) in &map {
            if entry.get("value").is_none() && entry.get("reference").is_none() {
                return Err(TransformError::malformed(
                    format!("parameters.{}", name),
                    "missing value envelope",
                ));
            }
        }
        Ok(Self(map))
    }
}
