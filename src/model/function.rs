//! Catalog entries consumed by the executor.
//!
//! Functions and secrets are owned by the CRUD side of the platform; this
//! crate only reads them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered, user-owned reference to a container image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    /// Container image reference, e.g. `registry/hello:latest`.
    pub image_url: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Function {
    /// Creates a function entry owned by `user_id`.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        image_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            name: String::new(),
            image_url: image_url.into(),
            description: String::new(),
            created_at: Utc::now(),
        }
    }
}

/// A named secret value owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            user_id: user_id.into(),
            name: name.into(),
            value: value.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Renders the secret as a `NAME=value` container environment entry.
    pub fn to_env(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// Structured view of an execution input.
///
/// Inputs are opaque strings; when they are a JSON object they may carry
/// direct values, object-store references and the names of secrets to inject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionInput {
    #[serde(default)]
    pub direct_inputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub object_inputs: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
}

impl FunctionInput {
    /// Parses a raw input string.
    ///
    /// Empty input and anything that is not a JSON object yield an input with
    /// no declared secrets; plain-string inputs are legitimate. A JSON object
    /// whose fields do not match the schema is an error, so declared secrets
    /// are never dropped silently.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value @ serde_json::Value::Object(_)) => serde_json::from_value(value),
            _ => Ok(Self::default()),
        }
    }

    /// Returns whether the input declares any secret names.
    pub fn declares_secrets(&self) -> bool {
        !self.secrets.is_empty()
    }
}
