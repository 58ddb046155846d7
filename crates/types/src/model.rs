//! Credential Store records: profiles, overrides and virtual keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::GateError;

/// Namespace for deriving deterministic virtual key aliases.
const KEY_ALIAS_NAMESPACE: Uuid = Uuid::from_u128(0x8c5e_31b2_4f7a_4d06_9a1e_5b2c_d3f4_a617);

/// Which set of model aliases a virtual key may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Billed to the caller's own BYOK credential; may call the BYOK tier aliases.
    User,
    /// Issued on the caller's behalf against system profiles.
    System,
}

impl KeyType {
    /// Every key type a caller needs to be fully provisioned.
    #[must_use]
    pub fn all() -> &'static [Self] {
        &[Self::User, Self::System]
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }

    /// Deterministic idempotency alias for this caller's key of this type.
    ///
    /// The same `(caller_id, key_type)` always yields the same alias, so a
    /// repeated generate request is deduplicated by the remote service.
    #[must_use]
    pub fn alias_for(self, caller_id: &str) -> String {
        let name = format!("{caller_id}:{}", self.as_str());
        let id = Uuid::new_v5(&KEY_ALIAS_NAMESPACE, name.as_bytes());
        format!("vk-{}-{}", self.as_str(), id.simple())
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyType {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "system" | "system-on-behalf" => Ok(Self::System),
            other => Err(GateError::InvalidValue {
                field: "key_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Persisted lifecycle state of a virtual key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Provisioning,
    Active,
    Failed,
    Revoked,
}

impl KeyStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyStatus {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            "revoked" => Ok(Self::Revoked),
            other => Err(GateError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Routing mode recorded by a [`RoutingOverride`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    ForceSystem,
    ForceByok,
    Auto,
}

impl RoutingMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForceSystem => "force_system",
            Self::ForceByok => "force_byok",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoutingMode {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "force_system" | "force-system" | "system" => Ok(Self::ForceSystem),
            "force_byok" | "force-byok" | "byok" => Ok(Self::ForceByok),
            "auto" => Ok(Self::Auto),
            other => Err(GateError::InvalidValue {
                field: "mode",
                value: other.to_string(),
            }),
        }
    }
}

/// A centrally managed model profile for a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemProfile {
    pub id: i64,
    pub scope: String,
    /// Model alias understood by the remote proxy.
    pub proxy_model_name: String,
    pub enabled: bool,
    /// Per-profile model parameter overrides (e.g. `temperature`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_params: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating or replacing a [`SystemProfile`].
#[derive(Debug, Clone, Default)]
pub struct NewSystemProfile {
    pub scope: String,
    pub proxy_model_name: String,
    pub enabled: bool,
    pub model_params: Option<Value>,
}

/// Result of the last connectivity test run against a BYOK profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileTestStatus {
    Ok,
    Failed,
}

impl ProfileTestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ProfileTestStatus {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" | "success" => Ok(Self::Ok),
            "failed" | "error" => Ok(Self::Failed),
            other => Err(GateError::InvalidValue {
                field: "test_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileTest {
    pub status: ProfileTestStatus,
    pub code: Option<String>,
    pub message: Option<String>,
    pub tested_at: i64,
}

/// Where a BYOK profile's credential and model come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByokSource {
    /// Current layout: references to a stored credential and model selection.
    Referenced {
        credential_id: i64,
        model_selection_id: i64,
    },
    /// Legacy layout with the encrypted key, provider and model inline.
    /// Read-only; no code path writes this shape.
    Legacy {
        encrypted_key: String,
        provider: String,
        model: String,
    },
}

/// A caller's own provider credential for one scenario (tier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByokProfile {
    pub id: i64,
    pub caller_id: String,
    pub scenario: String,
    pub source: ByokSource,
    pub endpoint_override: Option<String>,
    pub enabled: bool,
    pub last_test: Option<ProfileTest>,
}

impl ByokProfile {
    /// Returns `true` if the last recorded test failed.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.last_test
            .as_ref()
            .is_some_and(|t| t.status == ProfileTestStatus::Failed)
    }

    /// Returns `true` if routing may use this profile.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.is_broken()
    }
}

/// Input for creating or replacing a [`ByokProfile`] in the current layout.
#[derive(Debug, Clone)]
pub struct NewByokProfile {
    pub caller_id: String,
    pub scenario: String,
    pub credential_id: i64,
    pub model_selection_id: i64,
    pub endpoint_override: Option<String>,
    pub enabled: bool,
}

/// An encrypted upstream provider credential owned by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCredential {
    pub id: i64,
    pub caller_id: String,
    pub provider: String,
    pub encrypted_api_key: String,
    pub base_url: Option<String>,
    pub api_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewProviderCredential {
    pub caller_id: String,
    pub provider: String,
    pub encrypted_api_key: String,
    pub base_url: Option<String>,
    pub api_version: Option<String>,
}

/// A caller's chosen upstream model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub id: i64,
    pub caller_id: String,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct NewModelSelection {
    pub caller_id: String,
    pub provider: String,
    pub model: String,
}

/// Administrator- or user-set routing mode for a (caller, scope).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOverride {
    pub id: i64,
    pub caller_id: String,
    pub scope: String,
    pub mode: RoutingMode,
}

/// A proxy-side access token and its provisioning state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualKey {
    pub id: i64,
    pub caller_id: String,
    pub key_type: KeyType,
    pub status: KeyStatus,
    /// Encrypted token; present only once the key is active.
    pub encrypted_token: Option<String>,
    pub allowed_models: Vec<String>,
    pub key_alias: String,
    pub retry_count: u32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    /// Worker currently reconciling this row.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub provisioned_at: Option<i64>,
    pub rotated_at: Option<i64>,
    pub revoked_at: Option<i64>,
}

/// Input for inserting a PROVISIONING [`VirtualKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVirtualKey {
    pub caller_id: String,
    pub key_type: KeyType,
    pub key_alias: String,
    pub allowed_models: Vec<String>,
}

impl NewVirtualKey {
    #[must_use]
    pub fn new(caller_id: impl Into<String>, key_type: KeyType, allowed_models: Vec<String>) -> Self {
        let caller_id = caller_id.into();
        Self {
            key_alias: key_type.alias_for(&caller_id),
            caller_id,
            key_type,
            allowed_models,
        }
    }
}

/// Outcome of inserting a virtual key row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(VirtualKey),
    /// A row for this `(caller_id, key_type)` or alias already exists.
    Conflict,
}
