//! Tenant context decoded from the invocation secrets payload.

use crate::error::RequestFault;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Secret key that enables the reporting proxy agent.
pub const ENGINE_KEY: &str = "APOLLO_ENGINE_KEY";

/// Secret key naming the origin the proxy agent reports for.
pub const ORIGIN_URL_KEY: &str = "url";

/// Per-invocation secrets supplied by the hosting platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationSecrets {
    /// JSON-encoded list of `{key, value}` pairs.
    #[serde(rename = "userContext")]
    pub user_context: String,
    /// Public URL of this function, when the platform provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl InvocationSecrets {
    pub fn new(user_context: impl Into<String>) -> Self {
        Self {
            user_context: user_context.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

#[derive(Deserialize)]
struct SecretEntry {
    key: String,
    #[serde(default)]
    value: serde_json::Value,
}

/// Flat mapping from secret key to value, rebuilt on every invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TenantContext(IndexMap<String, serde_json::Value>);

impl TenantContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the `userContext` payload. Later duplicate keys overwrite earlier ones.
    pub fn from_payload(payload: &str) -> Result<Self, RequestFault> {
        let entries: Vec<SecretEntry> = serde_json::from_str(payload)
            .map_err(|e| RequestFault::MalformedSecrets(e.to_string()))?;

        Ok(entries.into_iter().fold(Self::new(), |mut acc, entry| {
            acc.0.insert(entry.key, entry.value);
            acc
        }))
    }

    /// Adds an entry and returns self.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Gets a value as a non-empty string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}
