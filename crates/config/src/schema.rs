use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vkgate_types::GateError;

/// Prefix of environment variables merged over the YAML file.
pub const ENV_PREFIX: &str = "VKGATE_";

fn default_base_url() -> String {
    "http://127.0.0.1:4000".to_string()
}
fn default_admin_key_env() -> String {
    "VKGATE_ADMIN_KEY".to_string()
}
fn default_master_key_env() -> String {
    "VKGATE_MASTER_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_product() -> String {
    "vkgate".to_string()
}
fn default_pending_retry_after_secs() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    5
}
fn default_max_backoff_secs() -> u64 {
    3600
}
fn default_stale_claim_secs() -> u64 {
    300
}
fn default_batch_limit() -> u32 {
    50
}
fn default_interval_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

/// SQLite location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file; falls back to `~/.vkgate/vkgate.db` when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Remote key service admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the admin key.
    #[serde(default = "default_admin_key_env")]
    pub admin_key_env: String,
    /// Upper bound for every remote call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for KeyServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            admin_key_env: default_admin_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherConfig {
    /// Name of the environment variable holding the base64 master key.
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            master_key_env: default_master_key_env(),
        }
    }
}

/// Policy router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Base URL callers send resolved requests to.
    #[serde(default = "default_base_url")]
    pub proxy_endpoint: String,
    /// Value of the `product:` tag.
    #[serde(default = "default_product")]
    pub product: String,
    #[serde(default = "default_pending_retry_after_secs")]
    pub pending_retry_after_secs: u64,
    /// Scopes that always use the system path unless overridden.
    #[serde(default)]
    pub system_only_scopes: BTreeSet<String>,
    /// Scope to BYOK tier (scenario) mapping.
    #[serde(default)]
    pub tiers: BTreeMap<String, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            proxy_endpoint: default_base_url(),
            product: default_product(),
            pending_retry_after_secs: default_pending_retry_after_secs(),
            system_only_scopes: BTreeSet::new(),
            tiers: BTreeMap::new(),
        }
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Claims older than this are considered abandoned.
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_backoff_secs: default_max_backoff_secs(),
            stale_claim_secs: default_stale_claim_secs(),
            batch_limit: default_batch_limit(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Model aliases granted to newly planned virtual keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Models for `user` keys; empty means every configured tier name.
    #[serde(default)]
    pub user_models: Vec<String>,
    /// Models for `system` keys; empty means every enabled system profile.
    #[serde(default)]
    pub system_models: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Append logs to this file instead of stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub key_service: KeyServiceConfig,
    #[serde(default)]
    pub cipher: CipherConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Parses configuration from a YAML string, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the YAML is invalid or extraction fails.
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Format as _, Serialized, Yaml},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
    }

    /// Loads configuration: defaults, then the YAML file (if any), then
    /// `VKGATE_*` environment variables (`__` separates nested keys).
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the file cannot be parsed or a value
    /// has the wrong type.
    #[allow(clippy::result_large_err)]
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Env, Format as _, Serialized, Yaml},
        };
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Checks values that would make the gateway misbehave at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.key_service.timeout_secs == 0 {
            return Err(GateError::Config(
                "key_service.timeout_secs must be positive".into(),
            ));
        }
        if self.provisioner.batch_limit == 0 {
            return Err(GateError::Config(
                "provisioner.batch_limit must be positive".into(),
            ));
        }
        if self.provisioner.interval_secs == 0 {
            return Err(GateError::Config(
                "provisioner.interval_secs must be positive".into(),
            ));
        }
        if self.provisioner.stale_claim_secs <= self.key_service.timeout_secs {
            // Shorter would release claims whose generate call is still in flight.
            return Err(GateError::Config(format!(
                "provisioner.stale_claim_secs ({}) must exceed key_service.timeout_secs ({})",
                self.provisioner.stale_claim_secs, self.key_service.timeout_secs
            )));
        }
        if self.router.product.is_empty() {
            return Err(GateError::Config("router.product must not be empty".into()));
        }
        if let Some((scope, _)) = self.router.tiers.iter().find(|(_, tier)| tier.is_empty()) {
            return Err(GateError::Config(format!(
                "router.tiers.{scope} maps to an empty tier"
            )));
        }
        Ok(())
    }

    /// BYOK tier for a scope, if one is configured.
    #[must_use]
    pub fn tier_for(&self, scope: &str) -> Option<&str> {
        self.router.tiers.get(scope).map(String::as_str)
    }

    #[must_use]
    pub fn is_system_only(&self, scope: &str) -> bool {
        self.router.system_only_scopes.contains(scope)
    }

    /// Models a `user` virtual key may call.
    #[must_use]
    pub fn user_key_models(&self) -> Vec<String> {
        if !self.keys.user_models.is_empty() {
            return self.keys.user_models.clone();
        }
        let tiers: BTreeSet<&String> = self.router.tiers.values().collect();
        tiers.into_iter().cloned().collect()
    }

    #[must_use]
    pub fn pending_retry_after(&self) -> Duration {
        Duration::from_secs(self.router.pending_retry_after_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.key_service.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
database:
  path: "/var/lib/vkgate/gate.db"
key_service:
  base_url: "http://litellm.internal:4000"
  timeout_secs: 10
router:
  product: "assistant"
  system_only_scopes: ["moderation"]
  tiers:
    chat: fast
    summarize: fast
    research: smart
provisioner:
  max_retries: 3
keys:
  system_models: ["gpt-small"]
log:
  format: json
"#;

    #[test]
    fn test_default_config() {
        let c = Config::default();
        assert_eq!(c.router.pending_retry_after_secs, 5);
        assert_eq!(c.provisioner.max_retries, 5);
        assert_eq!(c.provisioner.max_backoff_secs, 3600);
        assert_eq!(c.provisioner.stale_claim_secs, 300);
        assert_eq!(c.key_service.timeout_secs, 30);
        assert_eq!(c.log.format, LogFormat::Text);
        assert!(c.router.tiers.is_empty());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_sections() {
        let c = Config::from_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(
            c.database.path.as_deref(),
            Some(Path::new("/var/lib/vkgate/gate.db"))
        );
        assert_eq!(c.key_service.base_url, "http://litellm.internal:4000");
        assert_eq!(c.request_timeout(), Duration::from_secs(10));
        assert_eq!(c.router.product, "assistant");
        assert_eq!(c.provisioner.max_retries, 3);
        assert_eq!(c.log.format, LogFormat::Json);
    }

    #[test]
    fn test_from_yaml_defaults_applied() {
        let c = Config::from_yaml("provisioner:\n  batch_limit: 7\n").unwrap();
        assert_eq!(c.provisioner.batch_limit, 7);
        assert_eq!(c.provisioner.interval_secs, 30); // default preserved
        assert_eq!(c.cipher.master_key_env, "VKGATE_MASTER_KEY");
    }

    #[test]
    fn test_scope_classification() {
        let c = Config::from_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(c.tier_for("chat"), Some("fast"));
        assert_eq!(c.tier_for("moderation"), None);
        assert!(c.is_system_only("moderation"));
        assert!(!c.is_system_only("chat"));
    }

    #[test]
    fn test_user_key_models_from_tiers() {
        let c = Config::from_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(c.user_key_models(), vec!["fast", "smart"]);
        assert_eq!(c.keys.system_models, vec!["gpt-small"]);
    }

    #[test]
    fn test_user_key_models_explicit() {
        let c = Config::from_yaml("keys:\n  user_models: [a, b]\n").unwrap();
        assert_eq!(c.user_key_models(), vec!["a", "b"]);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let c = Config::from_yaml("provisioner:\n  batch_limit: 0\n").unwrap();
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("batch_limit"));
    }

    #[test]
    fn test_validate_rejects_zero_stale_claim() {
        let mut c = Config::default();
        c.provisioner.stale_claim_secs = 0;
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("stale_claim_secs"));
    }

    #[test]
    fn test_validate_rejects_stale_claim_within_timeout() {
        let mut c = Config::default();
        c.key_service.timeout_secs = 60;
        c.provisioner.stale_claim_secs = 60;
        assert!(c.validate().is_err());
        c.provisioner.stale_claim_secs = 61;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_tier() {
        let c = Config::from_yaml("router:\n  tiers:\n    chat: \"\"\n").unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_load_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("vkgate.yaml", "provisioner:\n  max_retries: 2\n")?;
            jail.set_env("VKGATE_PROVISIONER__MAX_RETRIES", "9");
            jail.set_env("VKGATE_ROUTER__PRODUCT", "from-env");
            let c = Config::load(Some(Path::new("vkgate.yaml")))?;
            assert_eq!(c.provisioner.max_retries, 9);
            assert_eq!(c.router.product, "from-env");
            Ok(())
        });
    }

    #[test]
    fn test_load_without_file() {
        figment::Jail::expect_with(|_jail| {
            let c = Config::load(None)?;
            assert_eq!(c.provisioner.batch_limit, 50);
            Ok(())
        });
    }
}
