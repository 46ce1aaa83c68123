// Hub administrative API: register, status heartbeat, unregister and full resync.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use dartplan_core::model::{Tournament, TournamentClass};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("could not build HTTP client: {source}")]
    Client { source: reqwest::Error },
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub tournament_id: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub access_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    #[serde(default)]
    pub join_url: Option<String>,
    #[serde(default, alias = "websocketUrl")]
    pub stream_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub active_matches: usize,
    pub total_players: usize,
    pub timestamp: DateTime<Utc>,
}

/// Body of a full resync: everything the Hub needs to rebuild its view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResyncPayload<'a> {
    tournament_id: &'a str,
    name: &'a str,
    description: &'a str,
    classes: &'a [TournamentClass],
    synced_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HubApi: Send + Sync {
    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ApiError>;
    async fn heartbeat(&self, tournament_id: &str, report: &StatusReport) -> Result<(), ApiError>;
    async fn unregister(&self, tournament_id: &str) -> Result<(), ApiError>;
    async fn resync(&self, tournament: &Tournament) -> Result<(), ApiError>;
}

/// `HubApi` over HTTPS with reqwest. Every request is bounded by the
/// client-wide timeout.
pub struct HttpHubApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpHubApi {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Client { source: e })?;
        Ok(HttpHubApi {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn execute(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ApiError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport {
                url: url.to_string(),
                source: e,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl HubApi for HttpHubApi {
    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ApiError> {
        let url = self.url("/api/tournaments/register");
        let response = self
            .execute(&url, self.client.post(&url).json(request))
            .await?;
        let body = response.text().await.map_err(|e| ApiError::Transport {
            url: url.clone(),
            source: e,
        })?;
        if body.trim().is_empty() {
            return Ok(RegisterResponse::default());
        }
        let registered: RegisterResponse =
            serde_json::from_str(&body).map_err(|e| ApiError::Decode {
                url: url.clone(),
                message: e.to_string(),
            })?;
        info!(
            "registered tournament {} (join url: {})",
            request.tournament_id,
            registered.join_url.as_deref().unwrap_or("-")
        );
        Ok(registered)
    }

    async fn heartbeat(&self, tournament_id: &str, report: &StatusReport) -> Result<(), ApiError> {
        let url = self.url(&format!("/api/tournaments/{tournament_id}/heartbeat"));
        self.execute(&url, self.client.post(&url).json(report))
            .await?;
        debug!(
            "status heartbeat: {} active matches, {} players",
            report.active_matches, report.total_players
        );
        Ok(())
    }

    async fn unregister(&self, tournament_id: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("/api/tournaments/{tournament_id}"));
        self.execute(&url, self.client.delete(&url)).await?;
        info!("unregistered tournament {tournament_id}");
        Ok(())
    }

    async fn resync(&self, tournament: &Tournament) -> Result<(), ApiError> {
        let url = self.url(&format!("/api/tournaments/{}/sync", tournament.id));
        let payload = ResyncPayload {
            tournament_id: &tournament.id,
            name: &tournament.name,
            description: &tournament.description,
            classes: &tournament.classes,
            synced_at: Utc::now(),
        };
        self.execute(&url, self.client.post(&url).json(&payload))
            .await?;
        info!(
            "resynced tournament {} ({} classes)",
            tournament.id,
            tournament.classes.len()
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
