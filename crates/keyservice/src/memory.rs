//! Scriptable in-memory key service.
//!
//! Honors the alias idempotency contract, records how often each alias was
//! requested, and can be told to fail or stall.

use async_trait::async_trait;
use secrecy::{ExposeSecret as _, SecretString};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use vkgate_types::{
    GenerateKeyRequest, GeneratedKey, KeyInfo, KeyService, KeyServiceError, UpdateKeyRequest,
};

type Result<T> = std::result::Result<T, KeyServiceError>;

#[derive(Default)]
struct FakeState {
    /// alias -> token
    aliases: HashMap<String, String>,
    /// token -> info
    keys: HashMap<String, KeyInfo>,
    generate_calls: HashMap<String, u32>,
    delete_calls: u32,
    fail_next: u32,
    fail_always: bool,
    failure: Option<KeyServiceError>,
    delay: Option<Duration>,
}

impl FakeState {
    fn take_failure(&mut self) -> Option<KeyServiceError> {
        let err = self
            .failure
            .clone()
            .unwrap_or_else(|| KeyServiceError::Upstream {
                status: 503,
                body: "injected failure".into(),
            });
        if self.fail_always {
            return Some(err);
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Some(err);
        }
        None
    }
}

/// [`KeyService`] that keeps keys in process memory.
#[derive(Default)]
pub struct InMemoryKeyService {
    state: Mutex<FakeState>,
}

impl InMemoryKeyService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, FakeState>> {
        self.state
            .lock()
            .map_err(|_| KeyServiceError::Rejected("key service state poisoned".into()))
    }

    fn with_state(&self, f: impl FnOnce(&mut FakeState)) {
        if let Ok(mut state) = self.lock() {
            f(&mut state);
        }
    }

    /// Make the next `n` generate calls fail with `error`
    /// (a 503 when `None`).
    pub fn fail_next(&self, n: u32, error: Option<KeyServiceError>) {
        self.with_state(|s| {
            s.fail_next = n;
            s.failure = error;
        });
    }

    /// Make every generate call fail until [`heal`](Self::heal) is called.
    pub fn fail_always(&self, error: Option<KeyServiceError>) {
        self.with_state(|s| {
            s.fail_always = true;
            s.failure = error;
        });
    }

    /// Clear injected failures.
    pub fn heal(&self) {
        self.with_state(|s| {
            s.fail_next = 0;
            s.fail_always = false;
            s.failure = None;
        });
    }

    /// Stall every generate call for `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.delay = delay);
    }

    /// Forget a key as if an operator deleted it remotely.
    pub fn forget(&self, token: &str) {
        self.with_state(|s| {
            s.keys.remove(token);
            s.aliases.retain(|_, t| *t != token);
        });
    }

    /// Number of generate calls made for `alias`, including failed ones.
    #[must_use]
    pub fn generate_calls(&self, alias: &str) -> u32 {
        self.lock()
            .map(|s| s.generate_calls.get(alias).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of generate calls across every alias.
    #[must_use]
    pub fn total_generate_calls(&self) -> u32 {
        self.lock()
            .map(|s| s.generate_calls.values().sum())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn delete_calls(&self) -> u32 {
        self.lock().map(|s| s.delete_calls).unwrap_or(0)
    }

    /// Number of keys currently live.
    #[must_use]
    pub fn live_keys(&self) -> usize {
        self.lock().map(|s| s.keys.len()).unwrap_or(0)
    }

    /// Token minted for `alias`, if any.
    #[must_use]
    pub fn token_for(&self, alias: &str) -> Option<String> {
        self.lock().ok()?.aliases.get(alias).cloned()
    }
}

#[async_trait]
impl KeyService for InMemoryKeyService {
    async fn generate(&self, request: &GenerateKeyRequest) -> Result<GeneratedKey> {
        let delay = {
            let mut state = self.lock()?;
            *state
                .generate_calls
                .entry(request.key_alias.clone())
                .or_default() += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock()?;
        if let Some(err) = state.take_failure() {
            return Err(err);
        }
        let existing = state.aliases.get(&request.key_alias).cloned();
        let token = match existing {
            Some(existing) => existing,
            None => {
                let token = format!("sk-vk-{}", uuid::Uuid::new_v4().simple());
                state
                    .aliases
                    .insert(request.key_alias.clone(), token.clone());
                state.keys.insert(
                    token.clone(),
                    KeyInfo {
                        key_alias: Some(request.key_alias.clone()),
                        models: request.models.clone(),
                        metadata: request.metadata.clone(),
                        user_id: request.user_id.clone(),
                        max_budget: request.max_budget,
                        spend: Some(0.0),
                    },
                );
                token
            }
        };
        let info = state.keys.get(&token).cloned().unwrap_or_default();
        Ok(GeneratedKey {
            key: SecretString::from(token),
            key_alias: info.key_alias,
            user_id: info.user_id,
            models: info.models,
            metadata: info.metadata,
        })
    }

    async fn get_info(&self, token: &SecretString) -> Result<Option<KeyInfo>> {
        Ok(self.lock()?.keys.get(token.expose_secret()).cloned())
    }

    async fn delete(&self, token: &SecretString) -> Result<bool> {
        let mut state = self.lock()?;
        state.delete_calls += 1;
        let token = token.expose_secret();
        let existed = state.keys.remove(token).is_some();
        state.aliases.retain(|_, t| *t != token);
        Ok(existed)
    }

    async fn update(&self, token: &SecretString, request: &UpdateKeyRequest) -> Result<KeyInfo> {
        let mut state = self.lock()?;
        let info = state
            .keys
            .get_mut(token.expose_secret())
            .ok_or_else(|| KeyServiceError::Upstream {
                status: 404,
                body: "key not found".into(),
            })?;
        if let Some(models) = &request.models {
            info.models.clone_from(models);
        }
        if let Some(budget) = request.max_budget {
            info.max_budget = Some(budget);
        }
        if let Some(metadata) = &request.metadata {
            info.metadata = metadata.clone();
        }
        Ok(info.clone())
    }
}
