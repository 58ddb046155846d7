//! The access policy decision engine.
//!
//! Resolution order, first match wins:
//!
//! 1. a routing override for `(caller, scope)`;
//! 2. system-only scopes are forced onto the system path;
//! 3. everything else is AUTO: BYOK when the caller allows it, prefers it,
//!    and has a usable profile for the scope's tier, system otherwise.
//!
//! The router only reads the credential store and may insert a PROVISIONING
//! virtual key row. It never talks to the remote key service.

use arc_swap::ArcSwap;
use secrecy::{ExposeSecret as _, SecretString};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vkgate_auth::TokenCipher;
use vkgate_config::Config;
use vkgate_provisioner::KeyPlanner;
use vkgate_types::{
    ByokPayload, ByokProfile, ByokSource, Clock, CredentialStore, GateError, KeyStatus,
    PermanentError, Resolution, ResolvedCall, Result, RouteKind, RoutingMode, SystemClock,
};

use crate::tags::build_tags;

/// State of the virtual key a route needs.
enum KeyState {
    Active(SecretString),
    Pending,
    Revoked,
}

/// A BYOK profile resolved down to its decrypted credential.
struct ByokRoute {
    tier: String,
    payload: ByokPayload,
}

/// Why the BYOK path is unavailable.
enum ByokUnavailable {
    Missing { tier: String },
    Broken(PermanentError),
}

/// Resolves `(scope, caller)` pairs into call descriptors.
pub struct PolicyRouter {
    store: Arc<dyn CredentialStore>,
    planner: KeyPlanner,
    cipher: Arc<TokenCipher>,
    config: Arc<ArcSwap<Config>>,
}

impl PolicyRouter {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<TokenCipher>,
        config: Arc<ArcSwap<Config>>,
    ) -> Self {
        Self::with_clock(store, cipher, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<TokenCipher>,
        config: Arc<ArcSwap<Config>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            planner: KeyPlanner::new(Arc::clone(&store), Arc::clone(&config), clock),
            store,
            cipher,
            config,
        }
    }

    /// Decides how `caller_id` reaches the model behind `scope`.
    ///
    /// `byok_allowed` is supplied by the caller's entitlement layer and taken
    /// at face value. Custom tags that are malformed or carry secret material
    /// are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::MissingSystemProfile`] or
    /// [`GateError::UnknownScope`] for configuration problems, and storage or
    /// crypto errors. A key that is not active yet is
    /// [`Resolution::Pending`], not an error.
    pub async fn resolve(
        &self,
        scope: &str,
        caller_id: &str,
        byok_allowed: bool,
        custom_tags: &[String],
    ) -> Result<Resolution> {
        let config = self.config.load_full();

        let mode = match self.store.routing_override(caller_id, scope).await? {
            Some(rule) => {
                debug!(caller_id, scope, mode = %rule.mode, "routing override applies");
                rule.mode
            }
            None if config.is_system_only(scope) => RoutingMode::ForceSystem,
            None => RoutingMode::Auto,
        };

        match mode {
            RoutingMode::ForceSystem => {
                self.resolve_system(scope, caller_id, custom_tags, &config)
                    .await
            }
            RoutingMode::ForceByok => {
                let tier = config
                    .tier_for(scope)
                    .ok_or_else(|| GateError::UnknownScope(scope.to_string()))?;
                match self.byok_route(caller_id, tier).await? {
                    Ok(route) => {
                        self.resolve_byok(scope, caller_id, route, custom_tags, &config)
                            .await
                    }
                    Err(ByokUnavailable::Missing { tier }) => Ok(Resolution::Rejected(
                        PermanentError::ByokProfileMissing {
                            scope: scope.to_string(),
                            tier,
                        },
                    )),
                    Err(ByokUnavailable::Broken(err)) => Ok(Resolution::Rejected(err)),
                }
            }
            RoutingMode::Auto => {
                if let Some(route) = self
                    .auto_byok_route(scope, caller_id, byok_allowed, &config)
                    .await?
                {
                    return self
                        .resolve_byok(scope, caller_id, route, custom_tags, &config)
                        .await;
                }
                self.resolve_system(scope, caller_id, custom_tags, &config)
                    .await
            }
        }
    }

    /// The BYOK route AUTO mode may take, if every eligibility condition holds.
    async fn auto_byok_route(
        &self,
        scope: &str,
        caller_id: &str,
        byok_allowed: bool,
        config: &Config,
    ) -> Result<Option<ByokRoute>> {
        if !byok_allowed {
            return Ok(None);
        }
        let Some(tier) = config.tier_for(scope) else {
            return Ok(None);
        };
        if !self.store.use_own_keys(caller_id).await? {
            return Ok(None);
        }
        match self.byok_route(caller_id, tier).await? {
            Ok(route) => Ok(Some(route)),
            Err(ByokUnavailable::Broken(_)) => {
                debug!(caller_id, scope, tier, "BYOK profile broken, using system path");
                Ok(None)
            }
            Err(ByokUnavailable::Missing { .. }) => Ok(None),
        }
    }

    /// Loads the caller's profile for `tier` and decrypts its credential.
    async fn byok_route(
        &self,
        caller_id: &str,
        tier: &str,
    ) -> Result<std::result::Result<ByokRoute, ByokUnavailable>> {
        let missing = |tier: &str| ByokUnavailable::Missing {
            tier: tier.to_string(),
        };
        let Some(profile) = self
            .store
            .byok_profile(caller_id, tier)
            .await?
            .filter(|p| p.enabled)
        else {
            return Ok(Err(missing(tier)));
        };
        if profile.is_broken() {
            let (code, message) = profile
                .last_test
                .map(|test| (test.code, test.message))
                .unwrap_or_default();
            return Ok(Err(ByokUnavailable::Broken(
                PermanentError::ByokProfileBroken {
                    tier: tier.to_string(),
                    code,
                    message,
                },
            )));
        }
        Ok(match self.byok_payload(&profile).await? {
            Some(payload) => Ok(ByokRoute {
                tier: tier.to_string(),
                payload,
            }),
            None => Err(missing(tier)),
        })
    }

    /// Decrypts the profile's credential; `None` if a reference dangles.
    async fn byok_payload(&self, profile: &ByokProfile) -> Result<Option<ByokPayload>> {
        match &profile.source {
            ByokSource::Referenced {
                credential_id,
                model_selection_id,
            } => {
                let credential = self.store.provider_credential(*credential_id).await?;
                let selection = self.store.model_selection(*model_selection_id).await?;
                let (Some(credential), Some(selection)) = (credential, selection) else {
                    warn!(profile_id = profile.id, "BYOK profile references a missing record");
                    return Ok(None);
                };
                Ok(Some(ByokPayload {
                    provider: selection.provider,
                    model: selection.model,
                    api_key: self.cipher.decrypt(&credential.encrypted_api_key)?,
                    base_url: profile.endpoint_override.clone().or(credential.base_url),
                    api_version: credential.api_version,
                }))
            }
            ByokSource::Legacy {
                encrypted_key,
                provider,
                model,
            } => Ok(Some(ByokPayload {
                provider: provider.clone(),
                model: model.clone(),
                api_key: self.cipher.decrypt(encrypted_key)?,
                base_url: profile.endpoint_override.clone(),
                api_version: None,
            })),
        }
    }

    async fn resolve_system(
        &self,
        scope: &str,
        caller_id: &str,
        custom_tags: &[String],
        config: &Config,
    ) -> Result<Resolution> {
        let profile = match self.store.system_profile(scope).await? {
            Some(profile) if profile.enabled => profile,
            None if config.tier_for(scope).is_none() && !config.is_system_only(scope) => {
                return Err(GateError::UnknownScope(scope.to_string()));
            }
            _ => return Err(GateError::MissingSystemProfile(scope.to_string())),
        };

        let credential = match self.key_state(caller_id, RouteKind::System).await? {
            KeyState::Active(token) => token,
            KeyState::Pending => return Ok(pending(config)),
            KeyState::Revoked => return Ok(revoked(RouteKind::System)),
        };

        let tags = build_tags(
            scope,
            &config.router.product,
            caller_id,
            RouteKind::System,
            custom_tags,
            &[credential.expose_secret()],
        );
        info!(scope, caller_id, route = "system", "resolved");
        Ok(Resolution::Resolved(Box::new(ResolvedCall {
            run_id: Uuid::new_v4(),
            scope: scope.to_string(),
            caller_id: caller_id.to_string(),
            route: RouteKind::System,
            key_type: RouteKind::System.key_type(),
            endpoint: config.router.proxy_endpoint.clone(),
            credential,
            model_alias: profile.proxy_model_name,
            model_params: profile.model_params,
            byok: None,
            tags,
        })))
    }

    async fn resolve_byok(
        &self,
        scope: &str,
        caller_id: &str,
        route: ByokRoute,
        custom_tags: &[String],
        config: &Config,
    ) -> Result<Resolution> {
        let credential = match self.key_state(caller_id, RouteKind::Byok).await? {
            KeyState::Active(token) => token,
            KeyState::Pending => return Ok(pending(config)),
            KeyState::Revoked => return Ok(revoked(RouteKind::Byok)),
        };

        let tags = build_tags(
            scope,
            &config.router.product,
            caller_id,
            RouteKind::Byok,
            custom_tags,
            &[
                credential.expose_secret(),
                route.payload.api_key.expose_secret(),
            ],
        );
        info!(scope, caller_id, route = "byok", tier = %route.tier, "resolved");
        Ok(Resolution::Resolved(Box::new(ResolvedCall {
            run_id: Uuid::new_v4(),
            scope: scope.to_string(),
            caller_id: caller_id.to_string(),
            route: RouteKind::Byok,
            key_type: RouteKind::Byok.key_type(),
            endpoint: config.router.proxy_endpoint.clone(),
            credential,
            model_alias: route.tier,
            model_params: None,
            byok: Some(route.payload),
            tags,
        })))
    }

    /// Reads the virtual key backing `route`, creating a PROVISIONING row if absent.
    async fn key_state(&self, caller_id: &str, route: RouteKind) -> Result<KeyState> {
        let key_type = route.key_type();
        let outcome = self.planner.ensure(caller_id, key_type).await?;
        let Some(row) = outcome.key() else {
            return Ok(KeyState::Pending);
        };
        match (row.status, row.encrypted_token.as_deref()) {
            (KeyStatus::Active, Some(encrypted)) => {
                Ok(KeyState::Active(self.cipher.decrypt(encrypted)?))
            }
            (KeyStatus::Active, None) => {
                warn!(row_id = row.id, "active virtual key has no token");
                Ok(KeyState::Pending)
            }
            (KeyStatus::Revoked, _) => Ok(KeyState::Revoked),
            (KeyStatus::Provisioning | KeyStatus::Failed, _) => {
                debug!(caller_id, key_type = %key_type, status = %row.status, "virtual key pending");
                Ok(KeyState::Pending)
            }
        }
    }
}

fn pending(config: &Config) -> Resolution {
    Resolution::Pending {
        retry_after: config.pending_retry_after(),
    }
}

fn revoked(route: RouteKind) -> Resolution {
    Resolution::Rejected(PermanentError::VirtualKeyRevoked {
        key_type: route.key_type(),
    })
}
