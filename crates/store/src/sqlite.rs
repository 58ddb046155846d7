//! SQLite-backed credential store using sqlx.
//!
//! Schema: `system_profiles`, `byok_profiles`, `provider_credentials`,
//! `model_selections`, `routing_overrides`, `caller_preferences` and
//! `virtual_keys`, all created idempotently on open.
//!
//! Virtual-key claiming is a single conditional `UPDATE … RETURNING`, so two
//! workers never claim the same row and neither waits on the other.

use async_trait::async_trait;
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::str::FromStr;
use std::time::Duration;
use vkgate_types::{
    ByokProfile, ByokSource, CredentialStore, GateError, InsertOutcome, KeyStatus, KeyType,
    ModelSelection, NewByokProfile, NewModelSelection, NewProviderCredential, NewSystemProfile,
    NewVirtualKey, ProfileTest, ProfileTestStatus, ProviderCredential, Result, RoutingMode,
    RoutingOverride, SystemProfile, VirtualKey,
};

macro_rules! vk_columns {
    () => {
        "id, caller_id, key_type, status, encrypted_token, allowed_models, key_alias, \
         retry_count, next_retry_at, last_error, claimed_by, claimed_at, created_at, \
         updated_at, provisioned_at, rotated_at, revoked_at"
    };
}

macro_rules! byok_columns {
    () => {
        "id, caller_id, scenario, credential_id, model_selection_id, endpoint_override, \
         enabled, test_status, test_code, test_message, tested_at, legacy_encrypted_key, \
         legacy_provider, legacy_model"
    };
}

/// Rows a reconcile pass may pick up. Exhausted rows sort last so they never
/// crowd out fresh work.
macro_rules! due_filter {
    () => {
        "claimed_by IS NULL
           AND (status = 'provisioning'
                OR (status = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= ?1)))
         ORDER BY retry_count, COALESCE(next_retry_at, created_at), id"
    };
}

#[derive(FromRow)]
struct VirtualKeyRow {
    id: i64,
    caller_id: String,
    key_type: String,
    status: String,
    encrypted_token: Option<String>,
    allowed_models: String,
    key_alias: String,
    retry_count: i64,
    next_retry_at: Option<i64>,
    last_error: Option<String>,
    claimed_by: Option<String>,
    claimed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    provisioned_at: Option<i64>,
    rotated_at: Option<i64>,
    revoked_at: Option<i64>,
}

impl TryFrom<VirtualKeyRow> for VirtualKey {
    type Error = GateError;

    fn try_from(row: VirtualKeyRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            key_type: KeyType::from_str(&row.key_type)?,
            status: KeyStatus::from_str(&row.status)?,
            allowed_models: serde_json::from_str(&row.allowed_models)?,
            retry_count: u32::try_from(row.retry_count).map_err(|_| GateError::InvalidValue {
                field: "retry_count",
                value: row.retry_count.to_string(),
            })?,
            caller_id: row.caller_id,
            encrypted_token: row.encrypted_token,
            key_alias: row.key_alias,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            provisioned_at: row.provisioned_at,
            rotated_at: row.rotated_at,
            revoked_at: row.revoked_at,
        })
    }
}

fn into_keys(rows: Vec<VirtualKeyRow>) -> Result<Vec<VirtualKey>> {
    let mut keys = rows
        .into_iter()
        .map(VirtualKey::try_from)
        .collect::<Result<Vec<_>>>()?;
    keys.sort_by_key(|k| k.id);
    Ok(keys)
}

#[derive(FromRow)]
struct SystemProfileRow {
    id: i64,
    scope: String,
    proxy_model_name: String,
    enabled: bool,
    model_params: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SystemProfileRow> for SystemProfile {
    type Error = GateError;

    fn try_from(row: SystemProfileRow) -> Result<Self> {
        let model_params = row
            .model_params
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Self {
            id: row.id,
            scope: row.scope,
            proxy_model_name: row.proxy_model_name,
            enabled: row.enabled,
            model_params,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ByokProfileRow {
    id: i64,
    caller_id: String,
    scenario: String,
    credential_id: Option<i64>,
    model_selection_id: Option<i64>,
    endpoint_override: Option<String>,
    enabled: bool,
    test_status: Option<String>,
    test_code: Option<String>,
    test_message: Option<String>,
    tested_at: Option<i64>,
    legacy_encrypted_key: Option<String>,
    legacy_provider: Option<String>,
    legacy_model: Option<String>,
}

impl TryFrom<ByokProfileRow> for ByokProfile {
    type Error = GateError;

    fn try_from(row: ByokProfileRow) -> Result<Self> {
        let source = match (
            row.credential_id,
            row.model_selection_id,
            row.legacy_encrypted_key,
            row.legacy_provider,
            row.legacy_model,
        ) {
            (Some(credential_id), Some(model_selection_id), ..) => ByokSource::Referenced {
                credential_id,
                model_selection_id,
            },
            (_, _, Some(encrypted_key), Some(provider), Some(model)) => ByokSource::Legacy {
                encrypted_key,
                provider,
                model,
            },
            _ => {
                return Err(GateError::InvalidValue {
                    field: "byok_profile",
                    value: format!("row {} has neither references nor legacy fields", row.id),
                });
            }
        };
        let last_test = match row.test_status {
            Some(status) => Some(ProfileTest {
                status: ProfileTestStatus::from_str(&status)?,
                code: row.test_code,
                message: row.test_message,
                tested_at: row.tested_at.unwrap_or_default(),
            }),
            None => None,
        };
        Ok(Self {
            id: row.id,
            caller_id: row.caller_id,
            scenario: row.scenario,
            source,
            endpoint_override: row.endpoint_override,
            enabled: row.enabled,
            last_test,
        })
    }
}

/// A persistent [`CredentialStore`] backed by `SQLite`.
pub struct SqliteCredentialStore {
    /// Connection pool to the `SQLite` database.
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    /// Connects to a `SQLite` database (e.g. `"sqlite:./vkgate.db"` or `"sqlite::memory:"`).
    ///
    /// Automatically creates the database file if it does not exist and runs
    /// migrations. File databases use WAL and a busy timeout so concurrent
    /// writers queue instead of failing; in-memory databases are pinned to a
    /// single connection because each connection would otherwise see its own
    /// empty database.
    ///
    /// # Errors
    ///
    /// Returns a [`sqlx::Error`] if the connection or table creation fails.
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let mut pool_opts = SqlitePoolOptions::new();
        if in_memory {
            pool_opts = pool_opts
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
            pool_opts = pool_opts.max_connections(5);
        }
        let pool = pool_opts.connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Create every table if it does not exist.
    async fn migrate(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
        const SCHEMA: &[&str] = &[
            "CREATE TABLE IF NOT EXISTS system_profiles (
                id                INTEGER PRIMARY KEY,
                scope             TEXT    NOT NULL UNIQUE,
                proxy_model_name  TEXT    NOT NULL,
                enabled           INTEGER NOT NULL DEFAULT 1,
                model_params      TEXT,
                created_at        INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at        INTEGER NOT NULL DEFAULT (unixepoch())
            )",
            "CREATE TABLE IF NOT EXISTS provider_credentials (
                id                 INTEGER PRIMARY KEY,
                caller_id          TEXT    NOT NULL,
                provider           TEXT    NOT NULL,
                encrypted_api_key  TEXT    NOT NULL,
                base_url           TEXT,
                api_version        TEXT,
                created_at         INTEGER NOT NULL DEFAULT (unixepoch())
            )",
            "CREATE TABLE IF NOT EXISTS model_selections (
                id          INTEGER PRIMARY KEY,
                caller_id   TEXT    NOT NULL,
                provider    TEXT    NOT NULL,
                model       TEXT    NOT NULL,
                created_at  INTEGER NOT NULL DEFAULT (unixepoch())
            )",
            "CREATE TABLE IF NOT EXISTS byok_profiles (
                id                    INTEGER PRIMARY KEY,
                caller_id             TEXT    NOT NULL,
                scenario              TEXT    NOT NULL,
                credential_id         INTEGER REFERENCES provider_credentials(id),
                model_selection_id    INTEGER REFERENCES model_selections(id),
                endpoint_override     TEXT,
                enabled               INTEGER NOT NULL DEFAULT 1,
                test_status           TEXT,
                test_code             TEXT,
                test_message          TEXT,
                tested_at             INTEGER,
                legacy_encrypted_key  TEXT,
                legacy_provider       TEXT,
                legacy_model          TEXT,
                created_at            INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at            INTEGER NOT NULL DEFAULT (unixepoch()),
                UNIQUE (caller_id, scenario)
            )",
            "CREATE TABLE IF NOT EXISTS routing_overrides (
                id          INTEGER PRIMARY KEY,
                caller_id   TEXT    NOT NULL,
                scope       TEXT    NOT NULL,
                mode        TEXT    NOT NULL,
                created_at  INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at  INTEGER NOT NULL DEFAULT (unixepoch()),
                UNIQUE (caller_id, scope)
            )",
            "CREATE TABLE IF NOT EXISTS caller_preferences (
                caller_id     TEXT    PRIMARY KEY,
                use_own_keys  INTEGER NOT NULL DEFAULT 0,
                updated_at    INTEGER NOT NULL DEFAULT (unixepoch())
            )",
            "CREATE TABLE IF NOT EXISTS virtual_keys (
                id               INTEGER PRIMARY KEY,
                caller_id        TEXT    NOT NULL,
                key_type         TEXT    NOT NULL,
                status           TEXT    NOT NULL,
                encrypted_token  TEXT,
                allowed_models   TEXT    NOT NULL DEFAULT '[]',
                key_alias        TEXT    NOT NULL UNIQUE,
                retry_count      INTEGER NOT NULL DEFAULT 0,
                next_retry_at    INTEGER,
                last_error       TEXT,
                claimed_by       TEXT,
                claimed_at       INTEGER,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL,
                provisioned_at   INTEGER,
                rotated_at       INTEGER,
                revoked_at       INTEGER,
                UNIQUE (caller_id, key_type)
            )",
            "CREATE INDEX IF NOT EXISTS idx_virtual_keys_due
             ON virtual_keys(status, next_retry_at) WHERE claimed_by IS NULL",
        ];
        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    // ── System profiles ───────────────────────────────────────────────────

    async fn system_profile(&self, scope: &str) -> Result<Option<SystemProfile>> {
        let row: Option<SystemProfileRow> = sqlx::query_as(
            "SELECT id, scope, proxy_model_name, enabled, model_params, created_at, updated_at
             FROM system_profiles WHERE scope = ?",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SystemProfile::try_from).transpose()
    }

    async fn upsert_system_profile(&self, profile: &NewSystemProfile) -> Result<SystemProfile> {
        let params = profile
            .model_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let row: SystemProfileRow = sqlx::query_as(
            "INSERT INTO system_profiles (scope, proxy_model_name, enabled, model_params)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(scope) DO UPDATE SET
                 proxy_model_name = excluded.proxy_model_name,
                 enabled = excluded.enabled,
                 model_params = excluded.model_params,
                 updated_at = unixepoch()
             RETURNING id, scope, proxy_model_name, enabled, model_params, created_at, updated_at",
        )
        .bind(&profile.scope)
        .bind(&profile.proxy_model_name)
        .bind(profile.enabled)
        .bind(params)
        .fetch_one(&self.pool)
        .await?;
        SystemProfile::try_from(row)
    }

    async fn enabled_system_models(&self) -> Result<Vec<String>> {
        let models: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT proxy_model_name FROM system_profiles
             WHERE enabled = 1 ORDER BY proxy_model_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(models)
    }

    // ── BYOK profiles ─────────────────────────────────────────────────────

    async fn byok_profile(&self, caller_id: &str, scenario: &str) -> Result<Option<ByokProfile>> {
        let row: Option<ByokProfileRow> = sqlx::query_as(concat!(
            "SELECT ",
            byok_columns!(),
            " FROM byok_profiles WHERE caller_id = ? AND scenario = ?"
        ))
        .bind(caller_id)
        .bind(scenario)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ByokProfile::try_from).transpose()
    }

    async fn upsert_byok_profile(&self, profile: &NewByokProfile) -> Result<ByokProfile> {
        let row: ByokProfileRow = sqlx::query_as(concat!(
            "INSERT INTO byok_profiles
                 (caller_id, scenario, credential_id, model_selection_id, endpoint_override, enabled)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(caller_id, scenario) DO UPDATE SET
                 credential_id = excluded.credential_id,
                 model_selection_id = excluded.model_selection_id,
                 endpoint_override = excluded.endpoint_override,
                 enabled = excluded.enabled,
                 test_status = NULL,
                 test_code = NULL,
                 test_message = NULL,
                 tested_at = NULL,
                 legacy_encrypted_key = NULL,
                 legacy_provider = NULL,
                 legacy_model = NULL,
                 updated_at = unixepoch()
             RETURNING ",
            byok_columns!()
        ))
        .bind(&profile.caller_id)
        .bind(&profile.scenario)
        .bind(profile.credential_id)
        .bind(profile.model_selection_id)
        .bind(&profile.endpoint_override)
        .bind(profile.enabled)
        .fetch_one(&self.pool)
        .await?;
        ByokProfile::try_from(row)
    }

    async fn record_byok_test(&self, profile_id: i64, test: &ProfileTest) -> Result<()> {
        let res = sqlx::query(
            "UPDATE byok_profiles
             SET test_status = ?, test_code = ?, test_message = ?, tested_at = ?,
                 updated_at = unixepoch()
             WHERE id = ?",
        )
        .bind(test.status.as_str())
        .bind(&test.code)
        .bind(&test.message)
        .bind(test.tested_at)
        .bind(profile_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(GateError::Storage(format!(
                "byok profile {profile_id} not found"
            )));
        }
        Ok(())
    }

    async fn provider_credential(&self, id: i64) -> Result<Option<ProviderCredential>> {
        let row: Option<(i64, String, String, String, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT id, caller_id, provider, encrypted_api_key, base_url, api_version
                 FROM provider_credentials WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(
            |(id, caller_id, provider, encrypted_api_key, base_url, api_version)| {
                ProviderCredential {
                    id,
                    caller_id,
                    provider,
                    encrypted_api_key,
                    base_url,
                    api_version,
                }
            },
        ))
    }

    async fn insert_provider_credential(
        &self,
        credential: &NewProviderCredential,
    ) -> Result<ProviderCredential> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO provider_credentials
                 (caller_id, provider, encrypted_api_key, base_url, api_version)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&credential.caller_id)
        .bind(&credential.provider)
        .bind(&credential.encrypted_api_key)
        .bind(&credential.base_url)
        .bind(&credential.api_version)
        .fetch_one(&self.pool)
        .await?;
        Ok(ProviderCredential {
            id,
            caller_id: credential.caller_id.clone(),
            provider: credential.provider.clone(),
            encrypted_api_key: credential.encrypted_api_key.clone(),
            base_url: credential.base_url.clone(),
            api_version: credential.api_version.clone(),
        })
    }

    async fn model_selection(&self, id: i64) -> Result<Option<ModelSelection>> {
        let row: Option<(i64, String, String, String)> = sqlx::query_as(
            "SELECT id, caller_id, provider, model FROM model_selections WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, caller_id, provider, model)| ModelSelection {
            id,
            caller_id,
            provider,
            model,
        }))
    }

    async fn insert_model_selection(
        &self,
        selection: &NewModelSelection,
    ) -> Result<ModelSelection> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO model_selections (caller_id, provider, model)
             VALUES (?, ?, ?) RETURNING id",
        )
        .bind(&selection.caller_id)
        .bind(&selection.provider)
        .bind(&selection.model)
        .fetch_one(&self.pool)
        .await?;
        Ok(ModelSelection {
            id,
            caller_id: selection.caller_id.clone(),
            provider: selection.provider.clone(),
            model: selection.model.clone(),
        })
    }

    // ── Overrides and preferences ─────────────────────────────────────────

    async fn routing_override(
        &self,
        caller_id: &str,
        scope: &str,
    ) -> Result<Option<RoutingOverride>> {
        let row: Option<(i64, String, String, String)> = sqlx::query_as(
            "SELECT id, caller_id, scope, mode FROM routing_overrides
             WHERE caller_id = ? AND scope = ?",
        )
        .bind(caller_id)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(id, caller_id, scope, mode)| {
            Ok::<_, GateError>(RoutingOverride {
                id,
                caller_id,
                scope,
                mode: RoutingMode::from_str(&mode)?,
            })
        })
        .transpose()
    }

    async fn set_routing_override(
        &self,
        caller_id: &str,
        scope: &str,
        mode: Option<RoutingMode>,
    ) -> Result<()> {
        match mode {
            Some(mode) => {
                sqlx::query(
                    "INSERT INTO routing_overrides (caller_id, scope, mode) VALUES (?, ?, ?)
                     ON CONFLICT(caller_id, scope) DO UPDATE SET
                         mode = excluded.mode,
                         updated_at = unixepoch()",
                )
                .bind(caller_id)
                .bind(scope)
                .bind(mode.as_str())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM routing_overrides WHERE caller_id = ? AND scope = ?")
                    .bind(caller_id)
                    .bind(scope)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn use_own_keys(&self, caller_id: &str) -> Result<bool> {
        let value: Option<bool> =
            sqlx::query_scalar("SELECT use_own_keys FROM caller_preferences WHERE caller_id = ?")
                .bind(caller_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.unwrap_or(false))
    }

    async fn set_use_own_keys(&self, caller_id: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO caller_preferences (caller_id, use_own_keys) VALUES (?, ?)
             ON CONFLICT(caller_id) DO UPDATE SET
                 use_own_keys = excluded.use_own_keys,
                 updated_at = unixepoch()",
        )
        .bind(caller_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Virtual keys ──────────────────────────────────────────────────────

    async fn virtual_key(&self, caller_id: &str, key_type: KeyType) -> Result<Option<VirtualKey>> {
        let row: Option<VirtualKeyRow> = sqlx::query_as(concat!(
            "SELECT ",
            vk_columns!(),
            " FROM virtual_keys WHERE caller_id = ? AND key_type = ?"
        ))
        .bind(caller_id)
        .bind(key_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(VirtualKey::try_from).transpose()
    }

    async fn virtual_key_by_id(&self, id: i64) -> Result<Option<VirtualKey>> {
        let row: Option<VirtualKeyRow> = sqlx::query_as(concat!(
            "SELECT ",
            vk_columns!(),
            " FROM virtual_keys WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(VirtualKey::try_from).transpose()
    }

    async fn list_virtual_keys(&self, caller_id: Option<&str>) -> Result<Vec<VirtualKey>> {
        let rows: Vec<VirtualKeyRow> = match caller_id {
            Some(caller_id) => {
                sqlx::query_as(concat!(
                    "SELECT ",
                    vk_columns!(),
                    " FROM virtual_keys WHERE caller_id = ? ORDER BY id"
                ))
                .bind(caller_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(concat!(
                    "SELECT ",
                    vk_columns!(),
                    " FROM virtual_keys ORDER BY id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        into_keys(rows)
    }

    async fn insert_virtual_key(&self, key: &NewVirtualKey, now: i64) -> Result<InsertOutcome> {
        let models = serde_json::to_string(&key.allowed_models)?;
        let res: std::result::Result<VirtualKeyRow, sqlx::Error> = sqlx::query_as(concat!(
            "INSERT INTO virtual_keys
                 (caller_id, key_type, status, allowed_models, key_alias, retry_count,
                  created_at, updated_at)
             VALUES (?1, ?2, 'provisioning', ?3, ?4, 0, ?5, ?5)
             RETURNING ",
            vk_columns!()
        ))
        .bind(&key.caller_id)
        .bind(key.key_type.as_str())
        .bind(models)
        .bind(&key.key_alias)
        .bind(now)
        .fetch_one(&self.pool)
        .await;
        match res {
            Ok(row) => Ok(InsertOutcome::Inserted(VirtualKey::try_from(row)?)),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn requeue_virtual_key(
        &self,
        id: i64,
        allowed_models: &[String],
        now: i64,
    ) -> Result<bool> {
        let models = serde_json::to_string(allowed_models)?;
        let res = sqlx::query(
            "UPDATE virtual_keys
             SET status = 'provisioning', retry_count = 0, next_retry_at = NULL,
                 last_error = NULL, encrypted_token = NULL, allowed_models = ?2,
                 updated_at = ?3
             WHERE id = ?1 AND status <> 'active' AND claimed_by IS NULL",
        )
        .bind(id)
        .bind(models)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn claim_due(&self, worker_id: &str, now: i64, limit: u32) -> Result<Vec<VirtualKey>> {
        let rows: Vec<VirtualKeyRow> = sqlx::query_as(concat!(
            "UPDATE virtual_keys
             SET claimed_by = ?2, claimed_at = ?1, updated_at = ?1
             WHERE id IN (
                 SELECT id FROM virtual_keys WHERE ",
            due_filter!(),
            " LIMIT ?3
             ) AND claimed_by IS NULL
             RETURNING ",
            vk_columns!()
        ))
        .bind(now)
        .bind(worker_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        into_keys(rows)
    }

    async fn preview_due(&self, now: i64, limit: u32) -> Result<Vec<VirtualKey>> {
        let rows: Vec<VirtualKeyRow> = sqlx::query_as(concat!(
            "SELECT ",
            vk_columns!(),
            " FROM virtual_keys WHERE ",
            due_filter!(),
            " LIMIT ?2"
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(VirtualKey::try_from).collect()
    }

    async fn release_claim(&self, id: i64, worker_id: &str, now: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE virtual_keys SET claimed_by = NULL, claimed_at = NULL, updated_at = ?3
             WHERE id = ?1 AND claimed_by = ?2",
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_active(
        &self,
        id: i64,
        worker_id: &str,
        encrypted_token: &str,
        now: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE virtual_keys
             SET status = 'active', encrypted_token = ?3, last_error = NULL,
                 next_retry_at = NULL, provisioned_at = ?4, updated_at = ?4,
                 claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1 AND claimed_by = ?2",
        )
        .bind(id)
        .bind(worker_id)
        .bind(encrypted_token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
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
        let res = sqlx::query(
            "UPDATE virtual_keys
             SET status = 'failed', retry_count = ?3, next_retry_at = ?4, last_error = ?5,
                 updated_at = ?6, claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1 AND claimed_by = ?2",
        )
        .bind(id)
        .bind(worker_id)
        .bind(i64::from(retry_count))
        .bind(next_retry_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_revoked(&self, id: i64, now: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE virtual_keys
             SET status = 'revoked', encrypted_token = NULL, revoked_at = ?2, updated_at = ?2,
                 claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn demote_stale_claims(&self, claimed_before: i64, now: i64) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE virtual_keys
             SET status = CASE WHEN status = 'provisioning' THEN 'failed' ELSE status END,
                 next_retry_at = CASE WHEN status = 'provisioning' THEN NULL ELSE next_retry_at END,
                 last_error = CASE WHEN status = 'provisioning'
                                   THEN COALESCE(last_error, 'claim expired')
                                   ELSE last_error END,
                 claimed_by = NULL, claimed_at = NULL, updated_at = ?2
             WHERE claimed_by IS NOT NULL AND claimed_at < ?1",
        )
        .bind(claimed_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}
