//! The virtual key state machine.
//!
//! `PROVISIONING -> ACTIVE`, `PROVISIONING | FAILED -> FAILED`, and
//! `any -> REVOKED` on explicit admin action. Rows that have used up their
//! retries stay FAILED and are reported as skipped.

use arc_swap::ArcSwap;
use futures::StreamExt as _;
use futures::stream;
use secrecy::SecretString;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vkgate_auth::TokenCipher;
use vkgate_config::Config;
use vkgate_types::{
    Clock, CredentialStore, GateError, GenerateKeyRequest, KeyService, KeyServiceError, KeyStatus,
    KeyType, Result, SystemClock, VirtualKey,
};

use crate::backoff::{backoff_secs, truncate_error};
use crate::planner::{EnsureOutcome, KeyPlanner};

/// Rows processed in parallel within one reconcile pass.
const ROW_CONCURRENCY: usize = 8;

/// What [`KeyProvisioner::provision_caller`] did for one key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created,
    AlreadyActive,
    /// An existing non-active row was reset to PROVISIONING.
    Requeued,
    /// Another writer got there first; the row is theirs to finish.
    Contended,
}

impl ProvisionOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AlreadyActive => "already active",
            Self::Requeued => "requeued",
            Self::Contended => "contended",
        }
    }
}

impl fmt::Display for ProvisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for a single reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl fmt::Display for ReconcileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} success={} failed={} skipped={}",
            self.processed, self.success, self.failed, self.skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Success,
    Failed,
    Skipped,
}

/// What happened to the remote key during a revoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDelete {
    Deleted,
    /// The key service did not know the token.
    NotFound,
    /// The row never held a token.
    NoToken,
    /// The delete call failed; the row is revoked locally anyway.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked { remote: RemoteDelete },
    AlreadyRevoked,
}

/// Drives virtual key rows through their lifecycle.
pub struct KeyProvisioner {
    store: Arc<dyn CredentialStore>,
    keys: Arc<dyn KeyService>,
    cipher: Arc<TokenCipher>,
    config: Arc<ArcSwap<Config>>,
    clock: Arc<dyn Clock>,
    planner: KeyPlanner,
    worker_id: String,
}

impl KeyProvisioner {
    /// Creates a provisioner with a fresh worker id and the system clock.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        keys: Arc<dyn KeyService>,
        cipher: Arc<TokenCipher>,
        config: Arc<ArcSwap<Config>>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            planner: KeyPlanner::new(Arc::clone(&store), Arc::clone(&config), Arc::clone(&clock)),
            store,
            keys,
            cipher,
            config,
            clock,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.planner = KeyPlanner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&clock),
        );
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub(crate) fn config(&self) -> &ArcSwap<Config> {
        &self.config
    }

    // ── Explicit provisioning ─────────────────────────────────────────────

    /// Makes sure the caller has a row of every key type that is either
    /// ACTIVE or queued for the next reconcile pass.
    ///
    /// # Errors
    ///
    /// Returns storage errors. Losing an insert race is reported as
    /// [`ProvisionOutcome::Contended`], never as an error.
    pub async fn provision_caller(&self, caller_id: &str) -> Result<Vec<(KeyType, ProvisionOutcome)>> {
        let mut outcomes = Vec::with_capacity(KeyType::all().len());
        for &key_type in KeyType::all() {
            let outcome = self.provision_one(caller_id, key_type).await?;
            info!(caller_id, key_type = %key_type, outcome = %outcome, "provision");
            outcomes.push((key_type, outcome));
        }
        Ok(outcomes)
    }

    async fn provision_one(&self, caller_id: &str, key_type: KeyType) -> Result<ProvisionOutcome> {
        match self.store.virtual_key(caller_id, key_type).await? {
            Some(row) if row.status == KeyStatus::Active => Ok(ProvisionOutcome::AlreadyActive),
            Some(row) => {
                let models = self.planner.allowed_models(key_type).await?;
                if self
                    .store
                    .requeue_virtual_key(row.id, &models, self.clock.now())
                    .await?
                {
                    return Ok(ProvisionOutcome::Requeued);
                }
                // Claimed by a worker, or it just went active.
                let now_active = self
                    .store
                    .virtual_key_by_id(row.id)
                    .await?
                    .is_some_and(|r| r.status == KeyStatus::Active);
                Ok(if now_active {
                    ProvisionOutcome::AlreadyActive
                } else {
                    ProvisionOutcome::Contended
                })
            }
            None => Ok(match self.planner.ensure(caller_id, key_type).await? {
                EnsureOutcome::Created(_) => ProvisionOutcome::Created,
                EnsureOutcome::Existing(_) | EnsureOutcome::Contended => {
                    ProvisionOutcome::Contended
                }
            }),
        }
    }

    /// What [`provision_caller`](Self::provision_caller) would do, without
    /// writing anything.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn plan_caller(&self, caller_id: &str) -> Result<Vec<(KeyType, ProvisionOutcome)>> {
        let mut outcomes = Vec::with_capacity(KeyType::all().len());
        for &key_type in KeyType::all() {
            let outcome = match self.store.virtual_key(caller_id, key_type).await? {
                Some(row) if row.status == KeyStatus::Active => ProvisionOutcome::AlreadyActive,
                Some(row) if row.claimed_by.is_some() => ProvisionOutcome::Contended,
                Some(_) => ProvisionOutcome::Requeued,
                None => ProvisionOutcome::Created,
            };
            outcomes.push((key_type, outcome));
        }
        Ok(outcomes)
    }

    // ── Reconciliation ────────────────────────────────────────────────────

    /// Runs one batch pass over up to `limit` due rows.
    ///
    /// Remote failures and per-row storage errors are recorded on the rows
    /// and counted, never returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if the batch could not be claimed.
    pub async fn reconcile(&self, limit: u32) -> Result<ReconcileStats> {
        let config = self.config.load_full();
        let now = self.clock.now();

        let stale_secs = i64::try_from(config.provisioner.stale_claim_secs).unwrap_or(i64::MAX);
        match self
            .store
            .demote_stale_claims(now.saturating_sub(stale_secs), now)
            .await
        {
            Ok(0) => {}
            Ok(released) => warn!(released, "released stale claims"),
            Err(e) => warn!(error = %e, "failed to release stale claims"),
        }

        let claimed = self.store.claim_due(&self.worker_id, now, limit).await?;
        if claimed.is_empty() {
            return Ok(ReconcileStats::default());
        }
        debug!(worker_id = %self.worker_id, rows = claimed.len(), "claimed due rows");

        let outcomes: Vec<RowOutcome> = stream::iter(claimed)
            .map(|row| self.process_row(row, &config))
            .buffer_unordered(ROW_CONCURRENCY)
            .collect()
            .await;

        let mut stats = ReconcileStats {
            processed: outcomes.len(),
            ..ReconcileStats::default()
        };
        for outcome in outcomes {
            match outcome {
                RowOutcome::Success => stats.success += 1,
                RowOutcome::Failed => stats.failed += 1,
                RowOutcome::Skipped => stats.skipped += 1,
            }
        }
        Ok(stats)
    }

    async fn process_row(&self, row: VirtualKey, config: &Config) -> RowOutcome {
        if row.retry_count >= config.provisioner.max_retries {
            debug!(row_id = row.id, retry_count = row.retry_count, "retries exhausted");
            if let Err(e) = self
                .store
                .release_claim(row.id, &self.worker_id, self.clock.now())
                .await
            {
                warn!(row_id = row.id, error = %e, "failed to release claim");
            }
            return RowOutcome::Skipped;
        }

        let request = GenerateKeyRequest {
            key_alias: row.key_alias.clone(),
            models: row.allowed_models.clone(),
            metadata: json!({
                "caller_id": row.caller_id,
                "key_type": row.key_type.as_str(),
            }),
            ..GenerateKeyRequest::default()
        };
        let generated = tokio::time::timeout(config.request_timeout(), self.keys.generate(&request))
            .await
            .unwrap_or(Err(KeyServiceError::Timeout));

        let key = match generated {
            Ok(key) => key,
            Err(e) => return self.finish_failed(&row, &e.to_string(), config).await,
        };
        match self.cipher.encrypt_secret(&key.key) {
            Ok(encrypted) => self.finish_active(&row, &key.key, &encrypted).await,
            Err(e) => self.finish_failed(&row, &e.to_string(), config).await,
        }
    }

    async fn finish_active(
        &self,
        row: &VirtualKey,
        token: &SecretString,
        encrypted_token: &str,
    ) -> RowOutcome {
        match self
            .store
            .mark_active(row.id, &self.worker_id, encrypted_token, self.clock.now())
            .await
        {
            Ok(true) => {
                info!(
                    row_id = row.id,
                    caller_id = %row.caller_id,
                    key_alias = %row.key_alias,
                    "virtual key active"
                );
                RowOutcome::Success
            }
            Ok(false) => self.discard_if_revoked(row, token).await,
            Err(e) => {
                error!(row_id = row.id, error = %e, "failed to store virtual key");
                RowOutcome::Failed
            }
        }
    }

    /// The guarded write lost its claim. A row revoked while the key was
    /// being generated must not leave that key live on the proxy.
    async fn discard_if_revoked(&self, row: &VirtualKey, token: &SecretString) -> RowOutcome {
        let revoked = match self.store.virtual_key_by_id(row.id).await {
            Ok(current) => current.is_none_or(|r| r.status == KeyStatus::Revoked),
            Err(e) => {
                error!(row_id = row.id, error = %e, "failed to re-read row after lost claim");
                false
            }
        };
        if !revoked {
            warn!(
                row_id = row.id,
                key_alias = %row.key_alias,
                "claim lost before activation; next pass regenerates by alias"
            );
            return RowOutcome::Failed;
        }
        let remote = self.delete_token(row.id, token).await;
        info!(
            row_id = row.id,
            key_alias = %row.key_alias,
            ?remote,
            "row revoked during generation; discarded new key"
        );
        RowOutcome::Skipped
    }

    async fn finish_failed(&self, row: &VirtualKey, message: &str, config: &Config) -> RowOutcome {
        let retry_count = row.retry_count.saturating_add(1);
        let delay = backoff_secs(retry_count, config.provisioner.max_backoff_secs);
        let now = self.clock.now();
        let next_retry_at = now.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
        warn!(
            row_id = row.id,
            key_alias = %row.key_alias,
            retry_count,
            next_retry_at,
            error = %message,
            "virtual key generation failed"
        );
        match self
            .store
            .mark_failed(
                row.id,
                &self.worker_id,
                retry_count,
                next_retry_at,
                &truncate_error(message),
                now,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(row_id = row.id, "claim lost before recording failure"),
            Err(e) => error!(row_id = row.id, error = %e, "failed to record failure"),
        }
        RowOutcome::Failed
    }

    /// Rows the next reconcile pass would claim.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn preview_due(&self, limit: u32) -> Result<Vec<VirtualKey>> {
        self.store.preview_due(self.clock.now(), limit).await
    }

    // ── Revocation ────────────────────────────────────────────────────────

    /// Revokes a virtual key row, deleting the remote key on a best-effort
    /// basis.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::KeyNotFound`] for an unknown id, or storage errors.
    pub async fn revoke(&self, id: i64) -> Result<RevokeOutcome> {
        let row = self
            .store
            .virtual_key_by_id(id)
            .await?
            .ok_or(GateError::KeyNotFound(id))?;
        if row.status == KeyStatus::Revoked {
            return Ok(RevokeOutcome::AlreadyRevoked);
        }

        let remote = self.delete_remote(&row).await;
        if !self.store.mark_revoked(id, self.clock.now()).await? {
            return Err(GateError::KeyNotFound(id));
        }
        info!(row_id = id, caller_id = %row.caller_id, ?remote, "virtual key revoked");
        Ok(RevokeOutcome::Revoked { remote })
    }

    async fn delete_remote(&self, row: &VirtualKey) -> RemoteDelete {
        let Some(encrypted) = row.encrypted_token.as_deref() else {
            return RemoteDelete::NoToken;
        };
        let token = match self.cipher.decrypt(encrypted) {
            Ok(token) => token,
            Err(e) => {
                warn!(row_id = row.id, error = %e, "cannot decrypt token for remote delete");
                return RemoteDelete::Failed;
            }
        };
        self.delete_token(row.id, &token).await
    }

    async fn delete_token(&self, row_id: i64, token: &SecretString) -> RemoteDelete {
        let timeout = self.config.load().request_timeout();
        match tokio::time::timeout(timeout, self.keys.delete(token)).await {
            Ok(Ok(true)) => RemoteDelete::Deleted,
            Ok(Ok(false)) => RemoteDelete::NotFound,
            Ok(Err(e)) => {
                warn!(row_id, error = %e, "remote delete failed");
                RemoteDelete::Failed
            }
            Err(_) => {
                warn!(row_id, "remote delete timed out");
                RemoteDelete::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret as _;
    use std::time::Duration;
    use vkgate_keyservice::InMemoryKeyService;
    use vkgate_store::InMemoryCredentialStore;
    use vkgate_types::{ManualClock, NewVirtualKey};

    const T0: i64 = 1_700_000_000;

    struct Harness {
        store: Arc<InMemoryCredentialStore>,
        keys: Arc<InMemoryKeyService>,
        cipher: Arc<TokenCipher>,
        clock: Arc<ManualClock>,
        provisioner: KeyProvisioner,
    }

    fn harness_with(config: Config) -> Harness {
        let store = Arc::new(InMemoryCredentialStore::new());
        let keys = Arc::new(InMemoryKeyService::new());
        let cipher = Arc::new(TokenCipher::from_bytes(&[3u8; 32]).unwrap());
        let clock = Arc::new(ManualClock::new(T0));
        let provisioner = KeyProvisioner::new(
            Arc::clone(&store) as Arc<dyn CredentialStore>,
            Arc::clone(&keys) as Arc<dyn KeyService>,
            Arc::clone(&cipher),
            Arc::new(ArcSwap::from_pointee(config)),
        )
        .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .with_worker_id("worker-a");
        Harness {
            store,
            keys,
            cipher,
            clock,
            provisioner,
        }
    }

    fn harness() -> Harness {
        let mut config = Config::from_yaml("router:\n  tiers:\n    chat: fast\n").unwrap();
        config.keys.system_models = vec!["gpt-small".into()];
        harness_with(config)
    }

    async fn seed(h: &Harness, caller: &str, key_type: KeyType) -> VirtualKey {
        match h
            .store
            .insert_virtual_key(&NewVirtualKey::new(caller, key_type, vec!["fast".into()]), T0)
            .await
            .unwrap()
        {
            vkgate_types::InsertOutcome::Inserted(row) => row,
            vkgate_types::InsertOutcome::Conflict => panic!("seed conflict"),
        }
    }

    #[tokio::test]
    async fn test_provision_caller_creates_both_keys() {
        let h = harness();
        let outcomes = h.provisioner.provision_caller("c1").await.unwrap();
        assert_eq!(
            outcomes,
            vec![
                (KeyType::User, ProvisionOutcome::Created),
                (KeyType::System, ProvisionOutcome::Created)
            ]
        );
        let system = h.store.virtual_key("c1", KeyType::System).await.unwrap().unwrap();
        assert_eq!(system.allowed_models, vec!["gpt-small"]);
        let user = h.store.virtual_key("c1", KeyType::User).await.unwrap().unwrap();
        assert_eq!(user.allowed_models, vec!["fast"]);
    }

    #[tokio::test]
    async fn test_provision_caller_requeues_and_skips_active() {
        let h = harness();
        h.provisioner.provision_caller("c1").await.unwrap();
        h.keys.fail_always(None);
        h.provisioner.reconcile(10).await.unwrap();
        h.keys.heal();

        // Both rows failed; explicit provisioning resets them.
        let outcomes = h.provisioner.provision_caller("c1").await.unwrap();
        assert!(outcomes.iter().all(|(_, o)| *o == ProvisionOutcome::Requeued));
        let row = h.store.virtual_key("c1", KeyType::User).await.unwrap().unwrap();
        assert_eq!(row.status, KeyStatus::Provisioning);
        assert_eq!(row.retry_count, 0);

        h.provisioner.reconcile(10).await.unwrap();
        let outcomes = h.provisioner.provision_caller("c1").await.unwrap();
        assert!(
            outcomes
                .iter()
                .all(|(_, o)| *o == ProvisionOutcome::AlreadyActive)
        );
    }

    #[tokio::test]
    async fn test_plan_caller_writes_nothing() {
        let h = harness();
        seed(&h, "c1", KeyType::User).await;
        let plan = h.provisioner.plan_caller("c1").await.unwrap();
        assert_eq!(
            plan,
            vec![
                (KeyType::User, ProvisionOutcome::Requeued),
                (KeyType::System, ProvisionOutcome::Created)
            ]
        );
        assert_eq!(h.store.list_virtual_keys(Some("c1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_activates_and_encrypts() {
        let h = harness();
        let row = seed(&h, "c1", KeyType::User).await;

        let stats = h.provisioner.reconcile(10).await.unwrap();
        assert_eq!(
            stats,
            ReconcileStats {
                processed: 1,
                success: 1,
                failed: 0,
                skipped: 0
            }
        );

        let active = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(active.status, KeyStatus::Active);
        assert_eq!(active.provisioned_at, Some(T0));
        assert!(active.claimed_by.is_none());
        let stored = active.encrypted_token.unwrap();
        let token = h.keys.token_for(&row.key_alias).unwrap();
        assert!(!stored.contains(&token));
        assert_eq!(h.cipher.decrypt(&stored).unwrap().expose_secret(), token);
    }

    #[tokio::test]
    async fn test_failure_backoff_doubles_and_caps() {
        let mut config = Config::default();
        config.provisioner.max_retries = 20;
        config.provisioner.max_backoff_secs = 16;
        let h = harness_with(config);
        let row = seed(&h, "c1", KeyType::User).await;
        h.keys.fail_always(None);

        for attempt in 1..=6u32 {
            let stats = h.provisioner.reconcile(10).await.unwrap();
            assert_eq!(stats.failed, 1, "attempt {attempt}");
            let failed = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
            assert_eq!(failed.status, KeyStatus::Failed);
            assert_eq!(failed.retry_count, attempt);
            let expected = 2i64.pow(attempt).min(16);
            assert_eq!(failed.next_retry_at, Some(h.clock.now() + expected));
            assert!(failed.last_error.unwrap().contains("injected failure"));

            // Not due before the deadline.
            h.clock.advance(expected - 1);
            assert_eq!(h.provisioner.reconcile(10).await.unwrap().processed, 0);
            h.clock.advance(1);
        }
    }

    #[tokio::test]
    async fn test_exhausted_rows_are_skipped_without_remote_call() {
        let mut config = Config::default();
        config.provisioner.max_retries = 2;
        let h = harness_with(config);
        let row = seed(&h, "c1", KeyType::User).await;
        h.keys.fail_always(None);

        for _ in 0..2 {
            h.provisioner.reconcile(10).await.unwrap();
            h.clock.advance(3_600);
        }
        assert_eq!(h.keys.generate_calls(&row.key_alias), 2);

        let stats = h.provisioner.reconcile(10).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(h.keys.generate_calls(&row.key_alias), 2);
        let after = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(after.status, KeyStatus::Failed);
        assert_eq!(after.retry_count, 2);
        assert!(after.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_long_error_is_truncated() {
        let h = harness();
        let row = seed(&h, "c1", KeyType::User).await;
        h.keys.fail_next(
            1,
            Some(KeyServiceError::Rejected("x".repeat(2_000))),
        );
        h.provisioner.reconcile(10).await.unwrap();
        let failed = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(failed.last_error.unwrap().chars().count(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_remote_times_out() {
        let mut config = Config::default();
        config.key_service.timeout_secs = 2;
        let h = harness_with(config);
        let row = seed(&h, "c1", KeyType::System).await;
        h.keys.set_delay(Some(Duration::from_secs(60)));

        let stats = h.provisioner.reconcile(10).await.unwrap();
        assert_eq!(stats.failed, 1);
        let failed = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("request timed out"));
    }

    #[tokio::test]
    async fn test_stale_claim_is_demoted_and_retried() {
        let h = harness();
        let row = seed(&h, "c1", KeyType::User).await;
        // A worker that died mid-pass.
        let claimed = h.store.claim_due("worker-dead", T0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Fresh claims are left alone.
        h.clock.advance(60);
        assert_eq!(h.provisioner.reconcile(10).await.unwrap().processed, 0);

        h.clock.advance(300);
        let stats = h.provisioner.reconcile(10).await.unwrap();
        assert_eq!(stats.success, 1);
        let active = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(active.status, KeyStatus::Active);
        assert_eq!(active.retry_count, 0);
    }

    #[tokio::test]
    async fn test_preview_due_does_not_claim() {
        let h = harness();
        seed(&h, "c1", KeyType::User).await;
        seed(&h, "c2", KeyType::User).await;
        let preview = h.provisioner.preview_due(10).await.unwrap();
        assert_eq!(preview.len(), 2);
        assert!(preview.iter().all(|r| r.claimed_by.is_none()));
        assert_eq!(h.provisioner.reconcile(10).await.unwrap().success, 2);
        assert!(h.provisioner.preview_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revoke_active_deletes_remote() {
        let h = harness();
        let row = seed(&h, "c1", KeyType::User).await;
        h.provisioner.reconcile(10).await.unwrap();

        let outcome = h.provisioner.revoke(row.id).await.unwrap();
        assert_eq!(
            outcome,
            RevokeOutcome::Revoked {
                remote: RemoteDelete::Deleted
            }
        );
        assert_eq!(h.keys.live_keys(), 0);
        let revoked = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(revoked.status, KeyStatus::Revoked);
        assert!(revoked.encrypted_token.is_none());
        assert_eq!(revoked.revoked_at, Some(T0));

        assert_eq!(
            h.provisioner.revoke(row.id).await.unwrap(),
            RevokeOutcome::AlreadyRevoked
        );
        assert_eq!(h.keys.delete_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_during_generation_deletes_new_key() {
        let mut config = Config::default();
        config.key_service.timeout_secs = 30;
        let h = Arc::new(harness_with(config));
        let row = seed(&h, "c1", KeyType::User).await;
        h.keys.set_delay(Some(Duration::from_secs(5)));

        let worker = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.provisioner.reconcile(10).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            h.provisioner.revoke(row.id).await.unwrap(),
            RevokeOutcome::Revoked {
                remote: RemoteDelete::NoToken
            }
        );

        let stats = worker.await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(h.keys.live_keys(), 0);
        assert_eq!(h.keys.delete_calls(), 1);
        let revoked = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(revoked.status, KeyStatus::Revoked);
        assert!(revoked.encrypted_token.is_none());
    }

    #[tokio::test]
    async fn test_revoke_remotely_deleted_key_still_revokes() {
        let h = harness();
        let row = seed(&h, "c1", KeyType::User).await;
        h.provisioner.reconcile(10).await.unwrap();
        let token = h.keys.token_for(&row.key_alias).unwrap();
        h.keys.forget(&token);

        let outcome = h.provisioner.revoke(row.id).await.unwrap();
        assert_eq!(
            outcome,
            RevokeOutcome::Revoked {
                remote: RemoteDelete::NotFound
            }
        );
        let revoked = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(revoked.status, KeyStatus::Revoked);
    }

    #[tokio::test]
    async fn test_revoke_without_token_and_unknown_id() {
        let h = harness();
        let row = seed(&h, "c1", KeyType::User).await;
        assert_eq!(
            h.provisioner.revoke(row.id).await.unwrap(),
            RevokeOutcome::Revoked {
                remote: RemoteDelete::NoToken
            }
        );
        assert_eq!(h.keys.delete_calls(), 0);
        assert!(matches!(
            h.provisioner.revoke(9_999).await,
            Err(GateError::KeyNotFound(9_999))
        ));
    }

    #[tokio::test]
    async fn test_revoked_key_is_requeued_by_provision() {
        let h = harness();
        let row = seed(&h, "c1", KeyType::User).await;
        h.provisioner.revoke(row.id).await.unwrap();
        let outcomes = h.provisioner.provision_caller("c1").await.unwrap();
        assert_eq!(outcomes[0], (KeyType::User, ProvisionOutcome::Requeued));
        h.provisioner.reconcile(10).await.unwrap();
        let active = h.store.virtual_key_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(active.status, KeyStatus::Active);
    }
}
