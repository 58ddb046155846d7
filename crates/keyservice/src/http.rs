//! HTTP client for the proxy's key-management admin API.
//!
//! Endpoints: `POST /key/generate`, `GET /key/info?key=…`,
//! `POST /key/delete`, `POST /key/update`, all authenticated with
//! `Authorization: Bearer <admin key>`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use vkgate_types::{
    GenerateKeyRequest, GeneratedKey, KeyInfo, KeyService, KeyServiceError, UpdateKeyRequest,
};

type Result<T> = std::result::Result<T, KeyServiceError>;

#[derive(Deserialize)]
struct GenerateResponse {
    key: String,
    #[serde(default)]
    key_alias: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Deserialize)]
struct InfoResponse {
    info: KeyInfo,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    keys: [&'a str; 1],
}

#[derive(Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    deleted_keys: Option<Vec<Value>>,
}

#[derive(Serialize)]
struct UpdateBody<'a> {
    key: &'a str,
    #[serde(flatten)]
    request: &'a UpdateKeyRequest,
}

/// [`KeyService`] over HTTP.
pub struct HttpKeyService {
    http: Client,
    base_url: String,
    admin_key: SecretString,
}

impl HttpKeyService {
    /// Creates a client with `timeout` applied to every request.
    ///
    /// # Errors
    ///
    /// Returns [`KeyServiceError::Http`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        admin_key: SecretString,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            admin_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Sends a request and checks for success status.
    ///
    /// On non-2xx responses, reads the body text and returns
    /// [`KeyServiceError::Upstream`].
    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let resp = builder
            .bearer_auth(self.admin_key.expose_secret())
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            let text = resp.text().await.unwrap_or_default();
            Err(KeyServiceError::Upstream {
                status: status.as_u16(),
                body: text,
            })
        }
    }
}

#[async_trait]
impl KeyService for HttpKeyService {
    async fn generate(&self, request: &GenerateKeyRequest) -> Result<GeneratedKey> {
        let resp = self
            .send(self.http.post(self.url("/key/generate")).json(request))
            .await?;
        let body: GenerateResponse = resp.json().await?;
        tracing::debug!(key_alias = %request.key_alias, "virtual key generated");
        Ok(GeneratedKey {
            key: SecretString::from(body.key),
            key_alias: body.key_alias,
            user_id: body.user_id,
            models: body.models,
            metadata: body.metadata,
        })
    }

    async fn get_info(&self, token: &SecretString) -> Result<Option<KeyInfo>> {
        let req = self
            .http
            .get(self.url("/key/info"))
            .query(&[("key", token.expose_secret())]);
        match self.send(req).await {
            Ok(resp) => {
                let body: InfoResponse = resp.json().await?;
                Ok(Some(body.info))
            }
            Err(KeyServiceError::Upstream { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, token: &SecretString) -> Result<bool> {
        let body = DeleteRequest {
            keys: [token.expose_secret()],
        };
        match self
            .send(self.http.post(self.url("/key/delete")).json(&body))
            .await
        {
            Ok(resp) => {
                let parsed: DeleteResponse = resp.json().await.unwrap_or(DeleteResponse {
                    deleted_keys: None,
                });
                Ok(parsed.deleted_keys.is_none_or(|keys| !keys.is_empty()))
            }
            Err(KeyServiceError::Upstream { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn update(&self, token: &SecretString, request: &UpdateKeyRequest) -> Result<KeyInfo> {
        let body = UpdateBody {
            key: token.expose_secret(),
            request,
        };
        let resp = self
            .send(self.http.post(self.url("/key/update")).json(&body))
            .await?;
        let mut value: Value = resp.json().await?;
        // Some proxy versions nest the record under `info`.
        if let Some(info) = value.get_mut("info") {
            value = info.take();
        }
        serde_json::from_value(value).map_err(|e| KeyServiceError::Decode(e.to_string()))
    }
}
