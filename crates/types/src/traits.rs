//! Async traits shared across all vkgate crates.
//!
//! Every cross-crate abstraction is defined here so that higher layers depend
//! only on `vkgate-types`, not on each other.

use crate::{
    ByokProfile, GenerateKeyRequest, GeneratedKey, InsertOutcome, KeyInfo, KeyServiceError,
    KeyType, ModelSelection, NewByokProfile, NewModelSelection, NewProviderCredential,
    NewSystemProfile, NewVirtualKey, ProfileTest, ProviderCredential, Result, RoutingMode,
    RoutingOverride, SystemProfile, UpdateKeyRequest, VirtualKey,
};
use async_trait::async_trait;
use secrecy::SecretString;

/// Durable records read by the router and driven by the provisioner.
///
/// Every virtual-key write that finishes a reconcile step is guarded by the
/// claim owner: if `worker_id` no longer holds the claim the write is skipped
/// and `Ok(false)` is returned.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    // ── System profiles ───────────────────────────────────────────────────

    /// Load the system profile for a scope, enabled or not.
    async fn system_profile(&self, scope: &str) -> Result<Option<SystemProfile>>;
    /// Create or replace the system profile for `profile.scope`.
    async fn upsert_system_profile(&self, profile: &NewSystemProfile) -> Result<SystemProfile>;
    /// Distinct `proxy_model_name`s of every enabled system profile, sorted.
    async fn enabled_system_models(&self) -> Result<Vec<String>>;

    // ── BYOK profiles and their references ────────────────────────────────

    async fn byok_profile(&self, caller_id: &str, scenario: &str) -> Result<Option<ByokProfile>>;
    /// Create or replace the profile for `(caller_id, scenario)`.
    ///
    /// Clears any recorded test result and legacy inline fields.
    async fn upsert_byok_profile(&self, profile: &NewByokProfile) -> Result<ByokProfile>;
    /// Record the outcome of a connectivity test.
    async fn record_byok_test(&self, profile_id: i64, test: &ProfileTest) -> Result<()>;
    async fn provider_credential(&self, id: i64) -> Result<Option<ProviderCredential>>;
    async fn insert_provider_credential(
        &self,
        credential: &NewProviderCredential,
    ) -> Result<ProviderCredential>;
    async fn model_selection(&self, id: i64) -> Result<Option<ModelSelection>>;
    async fn insert_model_selection(&self, selection: &NewModelSelection)
    -> Result<ModelSelection>;

    // ── Overrides and preferences ─────────────────────────────────────────

    async fn routing_override(&self, caller_id: &str, scope: &str)
    -> Result<Option<RoutingOverride>>;
    /// Set the override for `(caller_id, scope)`; `None` removes it.
    async fn set_routing_override(
        &self,
        caller_id: &str,
        scope: &str,
        mode: Option<RoutingMode>,
    ) -> Result<()>;
    /// The caller's global "use my own keys" preference; `false` if unset.
    async fn use_own_keys(&self, caller_id: &str) -> Result<bool>;
    async fn set_use_own_keys(&self, caller_id: &str, enabled: bool) -> Result<()>;

    // ── Virtual keys ──────────────────────────────────────────────────────

    async fn virtual_key(&self, caller_id: &str, key_type: KeyType) -> Result<Option<VirtualKey>>;
    async fn virtual_key_by_id(&self, id: i64) -> Result<Option<VirtualKey>>;
    /// List virtual keys, optionally for a single caller, ordered by id.
    async fn list_virtual_keys(&self, caller_id: Option<&str>) -> Result<Vec<VirtualKey>>;
    /// Insert a PROVISIONING row.
    ///
    /// A uniqueness violation is reported as [`InsertOutcome::Conflict`].
    async fn insert_virtual_key(&self, key: &NewVirtualKey, now: i64) -> Result<InsertOutcome>;
    /// Reset a non-active, unclaimed row to PROVISIONING with `retry_count = 0`.
    ///
    /// Returns `false` if the row is active, claimed, or gone.
    async fn requeue_virtual_key(
        &self,
        id: i64,
        allowed_models: &[String],
        now: i64,
    ) -> Result<bool>;
    /// Atomically claim up to `limit` due rows for `worker_id`.
    ///
    /// Due means PROVISIONING, or FAILED with `next_retry_at` unset or not in
    /// the future. Rows claimed by someone else are skipped, never waited on.
    async fn claim_due(&self, worker_id: &str, now: i64, limit: u32) -> Result<Vec<VirtualKey>>;
    /// The rows [`claim_due`](Self::claim_due) would claim, without claiming.
    async fn preview_due(&self, now: i64, limit: u32) -> Result<Vec<VirtualKey>>;
    async fn release_claim(&self, id: i64, worker_id: &str, now: i64) -> Result<bool>;
    /// Store the encrypted token and move the row to ACTIVE.
    async fn mark_active(
        &self,
        id: i64,
        worker_id: &str,
        encrypted_token: &str,
        now: i64,
    ) -> Result<bool>;
    /// Move the row to FAILED with the given retry bookkeeping.
    async fn mark_failed(
        &self,
        id: i64,
        worker_id: &str,
        retry_count: u32,
        next_retry_at: i64,
        error: &str,
        now: i64,
    ) -> Result<bool>;
    /// Move the row to REVOKED, clear its token and claim.
    ///
    /// Returns `false` if the row does not exist.
    async fn mark_revoked(&self, id: i64, now: i64) -> Result<bool>;
    /// Release claims taken before `claimed_before`.
    ///
    /// PROVISIONING rows become FAILED with `next_retry_at` cleared so the
    /// next pass retries them; `retry_count` is unchanged. Returns the number
    /// of rows released.
    async fn demote_stale_claims(&self, claimed_before: i64, now: i64) -> Result<u64>;
}

/// Admin API of the remote proxy that issues virtual keys.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Mint a key. Repeating a request with the same alias must not mint a
    /// second key.
    async fn generate(
        &self,
        request: &GenerateKeyRequest,
    ) -> std::result::Result<GeneratedKey, KeyServiceError>;
    /// Look a key up; `None` if the service does not know it.
    async fn get_info(
        &self,
        token: &SecretString,
    ) -> std::result::Result<Option<KeyInfo>, KeyServiceError>;
    /// Delete a key; `false` if it was already gone.
    async fn delete(&self, token: &SecretString) -> std::result::Result<bool, KeyServiceError>;
    async fn update(
        &self,
        token: &SecretString,
        request: &UpdateKeyRequest,
    ) -> std::result::Result<KeyInfo, KeyServiceError>;
}
