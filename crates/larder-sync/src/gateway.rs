//! Remote gateway: outbound query and mutation calls.
//!
//! Stateless. No retries, no caching; failures are surfaced as-is so callers
//! decide between rollback, silent drop, and surfacing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::UNIQUE_VIOLATION;
use crate::wire;
use crate::{EntityId, EntityKind, EntityValue, MutationKind, OnceActionKind, SyncError, ToggleOutcome};

/// Backend operations the engine depends on.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// One page of the viewer's feed.
    async fn fetch_feed_page(&self, user_id: &EntityId, limit: u32, offset: u32) -> Result<Vec<EntityValue>, SyncError>;

    /// Full value of one entity as seen by `viewer_id`.
    async fn fetch_entity_detail(
        &self,
        kind: EntityKind,
        id: &EntityId,
        viewer_id: &EntityId,
    ) -> Result<EntityValue, SyncError>;

    /// Set a toggle to `desired`. Idempotent by state.
    async fn mutate_toggle(
        &self,
        kind: MutationKind,
        actor_id: &EntityId,
        target_id: &EntityId,
        desired: bool,
    ) -> Result<ToggleOutcome, SyncError>;

    /// Record a one-shot action. A repeat fails with a duplicate conflict.
    async fn log_once_action(
        &self,
        kind: OnceActionKind,
        actor_id: &EntityId,
        target_id: &EntityId,
    ) -> Result<(), SyncError>;
}

/// Gateway that calls remote procedures over HTTP.
///
/// Each operation is a `POST {base}/rest/v1/rpc/{name}` with a JSON body of
/// `p_`-prefixed parameters.
pub struct HttpGateway {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl HttpGateway {
    /// Create a gateway for the given base URL and API key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, SyncError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
        })
    }

    /// Authenticate calls as a signed-in user instead of the anonymous key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn rpc<P: Serialize + ?Sized>(&self, name: &str, params: &P) -> Result<Value, SyncError> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, name);
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);

        trace!(rpc = name, "calling remote procedure");
        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
            .json(params)
            .send()
            .await?;

        self.handle_response(name, response).await
    }

    async fn handle_response(&self, name: &str, response: reqwest::Response) -> Result<Value, SyncError> {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(SyncError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let text = response.text().await.map_err(|e| {
                SyncError::Network(format!("{} failed ({}): failed to read response: {}", name, status, e))
            })?;
            let body = serde_json::from_str::<RpcError>(&text).ok();
            debug!(rpc = name, status = status.as_u16(), "remote procedure failed");
            return Err(map_status(status, body, text));
        }

        // Procedures returning void answer with an empty body.
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Error body returned by the backend.
#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn map_status(status: reqwest::StatusCode, body: Option<RpcError>, text: String) -> SyncError {
    let (code, message) = match body {
        Some(RpcError { code, message }) => (code, message.unwrap_or_else(|| text.clone())),
        None => (None, text),
    };

    if status == reqwest::StatusCode::CONFLICT || code.as_deref() == Some(UNIQUE_VIOLATION) {
        return SyncError::Conflict {
            code: code.unwrap_or_else(|| status.as_u16().to_string()),
            message,
        };
    }

    match status.as_u16() {
        400 | 422 => SyncError::Validation(message),
        404 => SyncError::NotFound(message),
        500..=599 => SyncError::Network(format!("server error ({}): {}", status, message)),
        _ => SyncError::InvalidResponse(format!("request failed ({}): {}", status, message)),
    }
}

#[derive(Serialize)]
struct FeedParams<'a> {
    p_user_id: &'a EntityId,
    p_limit: u32,
    p_offset: u32,
}

#[derive(Serialize)]
struct DetailParams<'a> {
    p_kind: EntityKind,
    p_id: &'a EntityId,
    p_viewer_id: &'a EntityId,
}

#[derive(Serialize)]
struct ToggleParams<'a> {
    p_kind: MutationKind,
    p_actor_id: &'a EntityId,
    p_target_id: &'a EntityId,
    p_desired: bool,
}

#[derive(Serialize)]
struct OnceParams<'a> {
    p_kind: OnceActionKind,
    p_actor_id: &'a EntityId,
    p_target_id: &'a EntityId,
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn fetch_feed_page(&self, user_id: &EntityId, limit: u32, offset: u32) -> Result<Vec<EntityValue>, SyncError> {
        let body = self
            .rpc(
                "fetch_feed_page",
                &FeedParams {
                    p_user_id: user_id,
                    p_limit: limit,
                    p_offset: offset,
                },
            )
            .await?;
        wire::normalize_feed(&body, Utc::now())
    }

    async fn fetch_entity_detail(
        &self,
        kind: EntityKind,
        id: &EntityId,
        viewer_id: &EntityId,
    ) -> Result<EntityValue, SyncError> {
        let body = self
            .rpc(
                "fetch_entity_detail",
                &DetailParams {
                    p_kind: kind,
                    p_id: id,
                    p_viewer_id: viewer_id,
                },
            )
            .await?;
        if body.is_null() {
            return Err(SyncError::NotFound(format!("{}:{}", kind, id)));
        }
        wire::normalize_entity(kind, wire::single_row(&body)?, Utc::now())
    }

    async fn mutate_toggle(
        &self,
        kind: MutationKind,
        actor_id: &EntityId,
        target_id: &EntityId,
        desired: bool,
    ) -> Result<ToggleOutcome, SyncError> {
        let body = self
            .rpc(
                "mutate_toggle",
                &ToggleParams {
                    p_kind: kind,
                    p_actor_id: actor_id,
                    p_target_id: target_id,
                    p_desired: desired,
                },
            )
            .await?;
        wire::normalize_toggle(kind, &body)
    }

    async fn log_once_action(
        &self,
        kind: OnceActionKind,
        actor_id: &EntityId,
        target_id: &EntityId,
    ) -> Result<(), SyncError> {
        self.rpc(
            "log_once_action",
            &OnceParams {
                p_kind: kind,
                p_actor_id: actor_id,
                p_target_id: target_id,
            },
        )
        .await?;
        Ok(())
    }
}
