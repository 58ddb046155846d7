//! Request and response types exchanged with the remote key service.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters for minting a new virtual key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerateKeyRequest {
    /// Idempotency token; the remote service deduplicates on it.
    pub key_alias: String,
    pub models: Vec<String>,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<f64>,
    /// Lifetime such as `"30d"`; `None` means no expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// A freshly generated virtual key.
#[derive(Debug)]
pub struct GeneratedKey {
    pub key: SecretString,
    pub key_alias: Option<String>,
    pub user_id: Option<String>,
    pub models: Vec<String>,
    pub metadata: Value,
}

/// Non-secret view of an existing virtual key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    #[serde(default)]
    pub key_alias: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub max_budget: Option<f64>,
    #[serde(default)]
    pub spend: Option<f64>,
}

/// Partial update of a virtual key; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateKeyRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}
