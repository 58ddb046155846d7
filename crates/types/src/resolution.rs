//! Routing decisions returned by the policy router.

use secrecy::SecretString;
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::KeyType;

/// Which billing path a resolved call takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    System,
    Byok,
}

impl RouteKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Byok => "byok",
        }
    }

    /// The virtual key type this route authenticates with.
    #[must_use]
    pub fn key_type(self) -> KeyType {
        match self {
            Self::System => KeyType::System,
            Self::Byok => KeyType::User,
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving a (scope, caller) pair.
#[derive(Debug)]
pub enum Resolution {
    /// A ready-to-use call descriptor.
    Resolved(Box<ResolvedCall>),
    /// The caller's virtual key is not active yet; retry after the given delay.
    Pending { retry_after: Duration },
    /// The request can never succeed without a change by the caller or an admin.
    Rejected(PermanentError),
}

impl Resolution {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    /// Returns the descriptor if resolved.
    #[must_use]
    pub fn into_resolved(self) -> Option<ResolvedCall> {
        match self {
            Self::Resolved(call) => Some(*call),
            _ => None,
        }
    }
}

/// Non-retryable caller-facing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermanentError {
    /// BYOK was forced but the caller has no enabled profile for the tier.
    #[error("no BYOK profile for tier {tier} (scope {scope})")]
    ByokProfileMissing { scope: String, tier: String },

    /// BYOK was forced but the profile's last connectivity test failed.
    #[error("BYOK profile for tier {tier} is broken: {}", .message.as_deref().unwrap_or("last test failed"))]
    ByokProfileBroken {
        tier: String,
        code: Option<String>,
        message: Option<String>,
    },

    /// The caller's virtual key was revoked by an administrator.
    #[error("{key_type} virtual key has been revoked")]
    VirtualKeyRevoked { key_type: KeyType },
}

/// The caller's own provider credential, decrypted for a single call.
///
/// Lives only in memory; never persisted or logged.
#[derive(Debug)]
pub struct ByokPayload {
    pub provider: String,
    pub model: String,
    pub api_key: SecretString,
    pub base_url: Option<String>,
    pub api_version: Option<String>,
}

/// Everything needed to issue one request through the downstream proxy.
#[derive(Debug)]
pub struct ResolvedCall {
    /// Fresh per call; lets the proxy correlate traces.
    pub run_id: Uuid,
    pub scope: String,
    pub caller_id: String,
    pub route: RouteKind,
    pub key_type: KeyType,
    pub endpoint: String,
    /// Decrypted virtual key token.
    pub credential: SecretString,
    pub model_alias: String,
    pub model_params: Option<Value>,
    pub byok: Option<ByokPayload>,
    pub tags: Vec<String>,
}

impl ResolvedCall {
    /// Request metadata to attach to the downstream call. Contains no secrets.
    #[must_use]
    pub fn request_metadata(&self) -> Value {
        let mut meta = json!({
            "run_id": self.run_id.to_string(),
            "scope": self.scope,
            "caller_id": self.caller_id,
            "routing": self.route.as_str(),
            "model": self.model_alias,
            "tags": self.tags,
        });
        if let Some(byok) = &self.byok {
            meta["byok_provider"] = json!(byok.provider);
            meta["byok_model"] = json!(byok.model);
        }
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(byok: Option<ByokPayload>) -> ResolvedCall {
        ResolvedCall {
            run_id: Uuid::new_v4(),
            scope: "summarize".into(),
            caller_id: "caller-1".into(),
            route: if byok.is_some() {
                RouteKind::Byok
            } else {
                RouteKind::System
            },
            key_type: KeyType::System,
            endpoint: "http://proxy.local".into(),
            credential: SecretString::from("sk-virtual-abc123".to_string()),
            model_alias: "gpt-small".into(),
            model_params: None,
            byok,
            tags: vec!["scope:summarize".into()],
        }
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let c = call(Some(ByokPayload {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            api_key: SecretString::from("sk-user-secret-999".to_string()),
            base_url: None,
            api_version: None,
        }));
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-virtual-abc123"));
        assert!(!dbg.contains("sk-user-secret-999"));
        assert!(dbg.contains("gpt-small"));
    }

    #[test]
    fn test_request_metadata_has_no_secrets() {
        let c = call(Some(ByokPayload {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            api_key: SecretString::from("sk-user-secret-999".to_string()),
            base_url: Some("https://example.invalid".into()),
            api_version: None,
        }));
        let meta = c.request_metadata().to_string();
        assert!(!meta.contains("sk-user-secret-999"));
        assert!(!meta.contains("sk-virtual-abc123"));
        assert!(meta.contains("\"routing\":\"byok\""));
        assert!(meta.contains("openai"));
    }

    #[test]
    fn test_route_kind_key_type() {
        assert_eq!(RouteKind::System.key_type(), KeyType::System);
        assert_eq!(RouteKind::Byok.key_type(), KeyType::User);
    }

    #[test]
    fn test_permanent_error_display() {
        let err = PermanentError::ByokProfileBroken {
            tier: "fast".into(),
            code: Some("401".into()),
            message: Some("invalid api key".into()),
        };
        assert_eq!(
            err.to_string(),
            "BYOK profile for tier fast is broken: invalid api key"
        );
        let err = PermanentError::ByokProfileMissing {
            scope: "chat".into(),
            tier: "fast".into(),
        };
        assert!(err.to_string().contains("chat"));
    }

    #[test]
    fn test_resolution_helpers() {
        let pending = Resolution::Pending {
            retry_after: Duration::from_secs(5),
        };
        assert!(pending.is_pending());
        assert!(pending.into_resolved().is_none());
        let resolved = Resolution::Resolved(Box::new(call(None)));
        assert!(!resolved.is_pending());
        assert_eq!(resolved.into_resolved().unwrap().model_alias, "gpt-small");
    }
}
