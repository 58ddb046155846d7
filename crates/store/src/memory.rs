//! In-memory credential store backed by `HashMap`s behind a `Mutex`.
//!
//! Mirrors the `SQLite` store's semantics, including uniqueness conflicts and
//! claim-owner guards, so router and provisioner tests can run without a
//! database.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use vkgate_types::{
    ByokProfile, ByokSource, CredentialStore, GateError, InsertOutcome, KeyStatus, KeyType,
    ModelSelection, NewByokProfile, NewModelSelection, NewProviderCredential, NewSystemProfile,
    NewVirtualKey, ProfileTest, ProviderCredential, Result, RoutingMode, RoutingOverride,
    SystemProfile, VirtualKey,
};

#[derive(Default)]
struct State {
    next_id: i64,
    system_profiles: HashMap<String, SystemProfile>,
    byok_profiles: HashMap<(String, String), ByokProfile>,
    credentials: HashMap<i64, ProviderCredential>,
    selections: HashMap<i64, ModelSelection>,
    overrides: HashMap<(String, String), RoutingOverride>,
    preferences: HashMap<String, bool>,
    keys: HashMap<i64, VirtualKey>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_due(key: &VirtualKey, now: i64) -> bool {
        key.claimed_by.is_none()
            && match key.status {
                KeyStatus::Provisioning => true,
                KeyStatus::Failed => key.next_retry_at.is_none_or(|at| at <= now),
                KeyStatus::Active | KeyStatus::Revoked => false,
            }
    }

    /// Due rows in claim order.
    fn due(&self, now: i64, limit: u32) -> Vec<VirtualKey> {
        let mut due: Vec<&VirtualKey> = self.keys.values().filter(|k| Self::is_due(k, now)).collect();
        due.sort_by_key(|k| (k.retry_count, k.next_retry_at.unwrap_or(k.created_at), k.id));
        due.into_iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Returns the row if `worker_id` holds its claim.
    fn claimed_mut(&mut self, id: i64, worker_id: &str) -> Option<&mut VirtualKey> {
        self.keys
            .get_mut(&id)
            .filter(|k| k.claimed_by.as_deref() == Some(worker_id))
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// An in-memory [`CredentialStore`] implementation for testing and ephemeral use.
pub struct InMemoryCredentialStore {
    state: Mutex<State>,
}

impl InMemoryCredentialStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| GateError::Storage("in-memory store lock poisoned".into()))
    }

    /// Insert a BYOK profile in the legacy inline layout, as found in
    /// databases written before credentials became separate records.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Storage`] if a profile already exists for the
    /// `(caller_id, scenario)` pair.
    pub fn seed_legacy_byok_profile(
        &self,
        caller_id: &str,
        scenario: &str,
        encrypted_key: &str,
        provider: &str,
        model: &str,
    ) -> Result<ByokProfile> {
        let mut state = self.lock()?;
        let key = (caller_id.to_string(), scenario.to_string());
        if state.byok_profiles.contains_key(&key) {
            return Err(GateError::Storage(format!(
                "byok profile already exists for {caller_id}/{scenario}"
            )));
        }
        let profile = ByokProfile {
            id: state.next_id(),
            caller_id: caller_id.to_string(),
            scenario: scenario.to_string(),
            source: ByokSource::Legacy {
                encrypted_key: encrypted_key.to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
            },
            endpoint_override: None,
            enabled: true,
            last_test: None,
        };
        state.byok_profiles.insert(key, profile.clone());
        Ok(profile)
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn system_profile(&self, scope: &str) -> Result<Option<SystemProfile>> {
        Ok(self.lock()?.system_profiles.get(scope).cloned())
    }

    async fn upsert_system_profile(&self, profile: &NewSystemProfile) -> Result<SystemProfile> {
        let mut state = self.lock()?;
        let now = unix_now();
        let existing = state
            .system_profiles
            .get(&profile.scope)
            .map(|p| (p.id, p.created_at));
        let (id, created_at) = match existing {
            Some(found) => found,
            None => (state.next_id(), now),
        };
        let record = SystemProfile {
            id,
            scope: profile.scope.clone(),
            proxy_model_name: profile.proxy_model_name.clone(),
            enabled: profile.enabled,
            model_params: profile.model_params.clone(),
            created_at,
            updated_at: now,
        };
        state
            .system_profiles
            .insert(profile.scope.clone(), record.clone());
        Ok(record)
    }

    async fn enabled_system_models(&self) -> Result<Vec<String>> {
        let state = self.lock()?;
        let mut models: Vec<String> = state
            .system_profiles
            .values()
            .filter(|p| p.enabled)
            .map(|p| p.proxy_model_name.clone())
            .collect();
        models.sort();
        models.dedup();
        Ok(models)
    }

    async fn byok_profile(&self, caller_id: &str, scenario: &str) -> Result<Option<ByokProfile>> {
        Ok(self
            .lock()?
            .byok_profiles
            .get(&(caller_id.to_string(), scenario.to_string()))
            .cloned())
    }

    async fn upsert_byok_profile(&self, profile: &NewByokProfile) -> Result<ByokProfile> {
        let mut state = self.lock()?;
        let key = (profile.caller_id.clone(), profile.scenario.clone());
        let existing = state.byok_profiles.get(&key).map(|p| p.id);
        let id = match existing {
            Some(id) => id,
            None => state.next_id(),
        };
        let record = ByokProfile {
            id,
            caller_id: profile.caller_id.clone(),
            scenario: profile.scenario.clone(),
            source: ByokSource::Referenced {
                credential_id: profile.credential_id,
                model_selection_id: profile.model_selection_id,
            },
            endpoint_override: profile.endpoint_override.clone(),
            enabled: profile.enabled,
            last_test: None,
        };
        state.byok_profiles.insert(key, record.clone());
        Ok(record)
    }

    async fn record_byok_test(&self, profile_id: i64, test: &ProfileTest) -> Result<()> {
        let mut state = self.lock()?;
        let profile = state
            .byok_profiles
            .values_mut()
            .find(|p| p.id == profile_id)
            .ok_or_else(|| GateError::Storage(format!("byok profile {profile_id} not found")))?;
        profile.last_test = Some(test.clone());
        Ok(())
    }

    async fn provider_credential(&self, id: i64) -> Result<Option<ProviderCredential>> {
        Ok(self.lock()?.credentials.get(&id).cloned())
    }

    async fn insert_provider_credential(
        &self,
        credential: &NewProviderCredential,
    ) -> Result<ProviderCredential> {
        let mut state = self.lock()?;
        let record = ProviderCredential {
            id: state.next_id(),
            caller_id: credential.caller_id.clone(),
            provider: credential.provider.clone(),
            encrypted_api_key: credential.encrypted_api_key.clone(),
            base_url: credential.base_url.clone(),
            api_version: credential.api_version.clone(),
        };
        state.credentials.insert(record.id, record.clone());
        Ok(record)
    }

    async fn model_selection(&self, id: i64) -> Result<Option<ModelSelection>> {
        Ok(self.lock()?.selections.get(&id).cloned())
    }

    async fn insert_model_selection(
        &self,
        selection: &NewModelSelection,
    ) -> Result<ModelSelection> {
        let mut state = self.lock()?;
        let record = ModelSelection {
            id: state.next_id(),
            caller_id: selection.caller_id.clone(),
            provider: selection.provider.clone(),
            model: selection.model.clone(),
        };
        state.selections.insert(record.id, record.clone());
        Ok(record)
    }

    async fn routing_override(
        &self,
        caller_id: &str,
        scope: &str,
    ) -> Result<Option<RoutingOverride>> {
        Ok(self
            .lock()?
            .overrides
            .get(&(caller_id.to_string(), scope.to_string()))
            .cloned())
    }

    async fn set_routing_override(
        &self,
        caller_id: &str,
        scope: &str,
        mode: Option<RoutingMode>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let key = (caller_id.to_string(), scope.to_string());
        match mode {
            Some(mode) => {
                let existing = state.overrides.get(&key).map(|o| o.id);
                let id = match existing {
                    Some(id) => id,
                    None => state.next_id(),
                };
                state.overrides.insert(
                    key,
                    RoutingOverride {
                        id,
                        caller_id: caller_id.to_string(),
                        scope: scope.to_string(),
                        mode,
                    },
                );
            }
            None => {
                state.overrides.remove(&key);
            }
        }
        Ok(())
    }

    async fn use_own_keys(&self, caller_id: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .preferences
            .get(caller_id)
            .copied()
            .unwrap_or(false))
    }

    async fn set_use_own_keys(&self, caller_id: &str, enabled: bool) -> Result<()> {
        self.lock()?
            .preferences
            .insert(caller_id.to_string(), enabled);
        Ok(())
    }

    async fn virtual_key(&self, caller_id: &str, key_type: KeyType) -> Result<Option<VirtualKey>> {
        Ok(self
            .lock()?
            .keys
            .values()
            .find(|k| k.caller_id == caller_id && k.key_type == key_type)
            .cloned())
    }

    async fn virtual_key_by_id(&self, id: i64) -> Result<Option<VirtualKey>> {
        Ok(self.lock()?.keys.get(&id).cloned())
    }

    async fn list_virtual_keys(&self, caller_id: Option<&str>) -> Result<Vec<VirtualKey>> {
        let state = self.lock()?;
        let mut keys: Vec<VirtualKey> = state
            .keys
            .values()
            .filter(|k| caller_id.is_none_or(|c| k.caller_id == c))
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.id);
        Ok(keys)
    }

    async fn insert_virtual_key(&self, key: &NewVirtualKey, now: i64) -> Result<InsertOutcome> {
        let mut state = self.lock()?;
        let conflict = state.keys.values().any(|k| {
            (k.caller_id == key.caller_id && k.key_type == key.key_type)
                || k.key_alias == key.key_alias
        });
        if conflict {
            return Ok(InsertOutcome::Conflict);
        }
        let record = VirtualKey {
            id: state.next_id(),
            caller_id: key.caller_id.clone(),
            key_type: key.key_type,
            status: KeyStatus::Provisioning,
            encrypted_token: None,
            allowed_models: key.allowed_models.clone(),
            key_alias: key.key_alias.clone(),
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            provisioned_at: None,
            rotated_at: None,
            revoked_at: None,
        };
        state.keys.insert(record.id, record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn requeue_virtual_key(
        &self,
        id: i64,
        allowed_models: &[String],
        now: i64,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(key) = state
            .keys
            .get_mut(&id)
            .filter(|k| k.status != KeyStatus::Active && k.claimed_by.is_none())
        else {
            return Ok(false);
        };
        key.status = KeyStatus::Provisioning;
        key.retry_count = 0;
        key.next_retry_at = None;
        key.last_error = None;
        key.encrypted_token = None;
        key.allowed_models = allowed_models.to_vec();
        key.updated_at = now;
        Ok(true)
    }

    async fn claim_due(&self, worker_id: &str, now: i64, limit: u32) -> Result<Vec<VirtualKey>> {
        let mut state = self.lock()?;
        let ids: Vec<i64> = state.due(now, limit).iter().map(|k| k.id).collect();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(key) = state.keys.get_mut(&id) {
                key.claimed_by = Some(worker_id.to_string());
                key.claimed_at = Some(now);
                key.updated_at = now;
                claimed.push(key.clone());
            }
        }
        claimed.sort_by_key(|k| k.id);
        Ok(claimed)
    }

    async fn preview_due(&self, now: i64, limit: u32) -> Result<Vec<VirtualKey>> {
        Ok(self.lock()?.due(now, limit))
    }

    async fn release_claim(&self, id: i64, worker_id: &str, now: i64) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(key) = state.claimed_mut(id, worker_id) else {
            return Ok(false);
        };
        key.claimed_by = None;
        key.claimed_at = None;
        key.updated_at = now;
        Ok(true)
    }

    async fn mark_active(
        &self,
        id: i64,
        worker_id: &str,
        encrypted_token: &str,
        now: i64,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(key) = state.claimed_mut(id, worker_id) else {
            return Ok(false);
        };
        key.status = KeyStatus::Active;
        key.encrypted_token = Some(encrypted_token.to_string());
        key.last_error = None;
        key.next_retry_at = None;
        key.provisioned_at = Some(now);
        key.updated_at = now;
        key.claimed_by = None;
        key.claimed_at = None;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: i64,
        worker_id: &str,
        retry_count: u32,
        next_retry_at: i64,
        error: &str,
        now: i64,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(key) = state.claimed_mut(id, worker_id) else {
            return Ok(false);
        };
        key.status = KeyStatus::Failed;
        key.retry_count = retry_count;
        key.next_retry_at = Some(next_retry_at);
        key.last_error = Some(error.to_string());
        key.updated_at = now;
        key.claimed_by = None;
        key.claimed_at = None;
        Ok(true)
    }

    async fn mark_revoked(&self, id: i64, now: i64) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(key) = state.keys.get_mut(&id) else {
            return Ok(false);
        };
        key.status = KeyStatus::Revoked;
        key.encrypted_token = None;
        key.revoked_at = Some(now);
        key.updated_at = now;
        key.claimed_by = None;
        key.claimed_at = None;
        Ok(true)
    }

    async fn demote_stale_claims(&self, claimed_before: i64, now: i64) -> Result<u64> {
        let mut state = self.lock()?;
        let mut released = 0;
        for key in state.keys.values_mut() {
            if key.claimed_by.is_none() || key.claimed_at.is_none_or(|at| at >= claimed_before) {
                continue;
            }
            if key.status == KeyStatus::Provisioning {
                key.status = KeyStatus::Failed;
                key.next_retry_at = None;
                key.last_error.get_or_insert_with(|| "claim expired".to_string());
            }
            key.claimed_by = None;
            key.claimed_at = None;
            key.updated_at = now;
            released += 1;
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_key(caller: &str, key_type: KeyType) -> NewVirtualKey {
        NewVirtualKey::new(caller, key_type, vec!["fast".into()])
    }

    #[tokio::test]
    async fn test_insert_and_conflict() {
        let store = InMemoryCredentialStore::new();
        let first = store
            .insert_virtual_key(&new_key("c1", KeyType::User), 10)
            .await
            .unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));
        let again = store
            .insert_virtual_key(&new_key("c1", KeyType::User), 11)
            .await
            .unwrap();
        assert_eq!(again, InsertOutcome::Conflict);
        let k = store.virtual_key("c1", KeyType::User).await.unwrap().unwrap();
        assert_eq!(k.created_at, 10);
    }

    #[tokio::test]
    async fn test_claim_guards_and_release() {
        let store = InMemoryCredentialStore::new();
        store
            .insert_virtual_key(&new_key("c1", KeyType::System), 10)
            .await
            .unwrap();
        let claimed = store.claim_due("w1", 10, 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let id = claimed[0].id;
        assert!(store.claim_due("w2", 10, 5).await.unwrap().is_empty());
        assert!(!store.mark_failed(id, "w2", 1, 12, "x", 11).await.unwrap());
        assert!(store.release_claim(id, "w1", 11).await.unwrap());
        assert_eq!(store.claim_due("w2", 11, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_row_waits_for_backoff() {
        let store = InMemoryCredentialStore::new();
        store
            .insert_virtual_key(&new_key("c1", KeyType::User), 10)
            .await
            .unwrap();
        let id = store.claim_due("w1", 10, 5).await.unwrap()[0].id;
        store.mark_failed(id, "w1", 1, 12, "boom", 10).await.unwrap();
        assert!(store.preview_due(11, 5).await.unwrap().is_empty());
        assert_eq!(store.preview_due(12, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_demote_stale_provisioning() {
        let store = InMemoryCredentialStore::new();
        store
            .insert_virtual_key(&new_key("c1", KeyType::User), 10)
            .await
            .unwrap();
        let id = store.claim_due("w1", 10, 5).await.unwrap()[0].id;
        assert_eq!(store.demote_stale_claims(5, 400).await.unwrap(), 0);
        assert_eq!(store.demote_stale_claims(11, 400).await.unwrap(), 1);
        let k = store.virtual_key_by_id(id).await.unwrap().unwrap();
        assert_eq!(k.status, KeyStatus::Failed);
        assert_eq!(k.retry_count, 0);
        assert_eq!(k.last_error.as_deref(), Some("claim expired"));
        // the demoted worker can no longer complete
        assert!(!store.mark_active(id, "w1", "enc", 401).await.unwrap());
    }

    #[tokio::test]
    async fn test_legacy_seed_conflicts_with_existing() {
        let store = InMemoryCredentialStore::new();
        let p = store
            .seed_legacy_byok_profile("c1", "fast", "enc", "openai", "gpt-4o")
            .unwrap();
        assert!(matches!(p.source, ByokSource::Legacy { .. }));
        assert!(
            store
                .seed_legacy_byok_profile("c1", "fast", "enc", "openai", "gpt-4o")
                .is_err()
        );
        assert_eq!(
            store.byok_profile("c1", "fast").await.unwrap().unwrap().id,
            p.id
        );
    }

    #[tokio::test]
    async fn test_preferences_and_overrides() {
        let store = InMemoryCredentialStore::new();
        assert!(!store.use_own_keys("c1").await.unwrap());
        store.set_use_own_keys("c1", true).await.unwrap();
        assert!(store.use_own_keys("c1").await.unwrap());
        store
            .set_routing_override("c1", "chat", Some(RoutingMode::Auto))
            .await
            .unwrap();
        assert_eq!(
            store
                .routing_override("c1", "chat")
                .await
                .unwrap()
                .unwrap()
                .mode,
            RoutingMode::Auto
        );
        store.set_routing_override("c1", "chat", None).await.unwrap();
        assert!(store.routing_override("c1", "chat").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_single_winner() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .insert_virtual_key(&new_key("c1", KeyType::User), 10)
                    .await
                    .unwrap()
            }));
        }
        let mut inserted = 0;
        for h in handles {
            if matches!(h.await.unwrap(), InsertOutcome::Inserted(_)) {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.list_virtual_keys(None).await.unwrap().len(), 1);
    }
}
