//! Lazy creation of virtual key rows.
//!
//! Shared by the router, which creates a row the first time a caller
//! resolves, and by explicit provisioning.

use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::debug;
use vkgate_config::Config;
use vkgate_types::{
    Clock, CredentialStore, InsertOutcome, KeyType, NewVirtualKey, Result, VirtualKey,
};

/// Result of [`KeyPlanner::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A row already existed, in any status.
    Existing(VirtualKey),
    /// A fresh PROVISIONING row was inserted.
    Created(VirtualKey),
    /// Another writer inserted concurrently and the row is not yet readable.
    Contended,
}

impl EnsureOutcome {
    #[must_use]
    pub fn key(&self) -> Option<&VirtualKey> {
        match self {
            Self::Existing(key) | Self::Created(key) => Some(key),
            Self::Contended => None,
        }
    }
}

/// Decides which models a virtual key may call and inserts missing rows.
pub struct KeyPlanner {
    store: Arc<dyn CredentialStore>,
    config: Arc<ArcSwap<Config>>,
    clock: Arc<dyn Clock>,
}

impl KeyPlanner {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        config: Arc<ArcSwap<Config>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Models a key of `key_type` may call, as configured right now.
    ///
    /// System keys fall back to the proxy model of every enabled system
    /// profile when no explicit list is configured.
    pub async fn allowed_models(&self, key_type: KeyType) -> Result<Vec<String>> {
        let configured = {
            let config = self.config.load();
            match key_type {
                KeyType::User => Some(config.user_key_models()),
                KeyType::System => {
                    Some(config.keys.system_models.clone()).filter(|models| !models.is_empty())
                }
            }
        };
        match configured {
            Some(models) => Ok(models),
            None => self.store.enabled_system_models().await,
        }
    }

    /// The row that would be inserted for `(caller_id, key_type)`.
    pub async fn plan(&self, caller_id: &str, key_type: KeyType) -> Result<NewVirtualKey> {
        let models = self.allowed_models(key_type).await?;
        Ok(NewVirtualKey::new(caller_id, key_type, models))
    }

    /// Returns the caller's row for `key_type`, inserting a PROVISIONING row
    /// if none exists.
    ///
    /// A unique-constraint race with another writer is never an error.
    pub async fn ensure(&self, caller_id: &str, key_type: KeyType) -> Result<EnsureOutcome> {
        if let Some(existing) = self.store.virtual_key(caller_id, key_type).await? {
            return Ok(EnsureOutcome::Existing(existing));
        }
        let planned = self.plan(caller_id, key_type).await?;
        match self
            .store
            .insert_virtual_key(&planned, self.clock.now())
            .await?
        {
            InsertOutcome::Inserted(row) => {
                debug!(
                    caller_id,
                    key_type = %key_type,
                    key_alias = %row.key_alias,
                    row_id = row.id,
                    "virtual key row created"
                );
                Ok(EnsureOutcome::Created(row))
            }
            InsertOutcome::Conflict => {
                debug!(caller_id, key_type = %key_type, "virtual key insert lost a race");
                Ok(self
                    .store
                    .virtual_key(caller_id, key_type)
                    .await?
                    .map_or(EnsureOutcome::Contended, EnsureOutcome::Existing))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkgate_store::InMemoryCredentialStore;
    use vkgate_types::{KeyStatus, ManualClock, NewSystemProfile};

    fn config() -> Config {
        Config::from_yaml(
            r"
router:
  tiers:
    chat: fast
    summarize: smart
    translate: fast
",
        )
        .unwrap()
    }

    fn planner(store: Arc<InMemoryCredentialStore>, config: Config) -> KeyPlanner {
        KeyPlanner::new(
            store,
            Arc::new(ArcSwap::from_pointee(config)),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[tokio::test]
    async fn test_user_models_are_tier_names() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let p = planner(store, config());
        assert_eq!(
            p.allowed_models(KeyType::User).await.unwrap(),
            vec!["fast", "smart"]
        );
    }

    #[tokio::test]
    async fn test_system_models_fall_back_to_profiles() {
        let store = Arc::new(InMemoryCredentialStore::new());
        for (scope, model, enabled) in [
            ("chat", "gpt-small", true),
            ("summarize", "gpt-large", true),
            ("legacy", "gpt-old", false),
        ] {
            store
                .upsert_system_profile(&NewSystemProfile {
                    scope: scope.into(),
                    proxy_model_name: model.into(),
                    enabled,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let p = planner(Arc::clone(&store), config());
        assert_eq!(
            p.allowed_models(KeyType::System).await.unwrap(),
            vec!["gpt-large", "gpt-small"]
        );

        let mut explicit = config();
        explicit.keys.system_models = vec!["only-this".into()];
        let p = planner(store, explicit);
        assert_eq!(
            p.allowed_models(KeyType::System).await.unwrap(),
            vec!["only-this"]
        );
    }

    #[tokio::test]
    async fn test_ensure_creates_once() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let p = planner(Arc::clone(&store), config());

        let first = p.ensure("c1", KeyType::User).await.unwrap();
        let EnsureOutcome::Created(row) = first else {
            panic!("expected a new row, got {first:?}");
        };
        assert_eq!(row.status, KeyStatus::Provisioning);
        assert_eq!(row.key_alias, KeyType::User.alias_for("c1"));
        assert_eq!(row.created_at, 1_000);

        let second = p.ensure("c1", KeyType::User).await.unwrap();
        assert_eq!(second, EnsureOutcome::Existing(row));
        assert_eq!(store.list_virtual_keys(Some("c1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_never_errors() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let p = Arc::new(planner(Arc::clone(&store), config()));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let p = Arc::clone(&p);
                tokio::spawn(async move { p.ensure("c1", KeyType::System).await })
            })
            .collect();
        let mut created = 0;
        for task in tasks {
            if let EnsureOutcome::Created(_) = task.await.unwrap().unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.list_virtual_keys(Some("c1")).await.unwrap().len(), 1);
    }
}
