//! HTTP-backed implementations of the tool service traits.
//!
//! Every integration is reached through a single integrations gateway that
//! exposes `POST {base}/v1/{integration}/{action}` with the user's stored
//! access token as a bearer credential.

use super::services::{
    CalendarEvent, CalendarService, EmailService, EmailSummary, FocusSession, MusicService,
    NewCalendarEvent, NewTask, OutgoingEmail, PlaybackState, ProductivityService,
    ProductivitySummary, ReportRange, SearchResult, ServiceError, Task, TaskService, Track,
    WebSearchService,
};
use super::{Integration, ToolHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Builds gateway-backed handles that share one connection pool.
#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns a handle for `integration` that authenticates with `token`.
    pub fn handle(&self, integration: Integration, token: impl Into<String>) -> ToolHandle {
        let client = Arc::new(GatewayClient {
            http: self.client.clone(),
            base_url: self.base_url.clone(),
            integration,
            token: token.into(),
        });
        match integration {
            Integration::Calendar => ToolHandle::Calendar(client),
            Integration::Tasks => ToolHandle::Tasks(client),
            Integration::Music => ToolHandle::Music(client),
            Integration::Email => ToolHandle::Email(client),
            Integration::Productivity => ToolHandle::Productivity(client),
            Integration::WebSearch => ToolHandle::WebSearch(client),
        }
    }
}

struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    integration: Integration,
    token: String,
}

impl GatewayClient {
    fn endpoint(&self, action: &str) -> String {
        format!("{}/v1/{}/{}", self.base_url, self.integration.as_str(), action)
    }

    async fn call<B, T>(&self, action: &str, body: &B) -> Result<T, ServiceError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(action);
        debug!(%url, "Calling integration gateway");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                ServiceError::Upstream(format!(
                    "{} is unreachable right now ({e})",
                    self.integration.display_name()
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(self.integration, status));
        }
        response.json::<T>().await.map_err(|e| {
            ServiceError::Upstream(format!(
                "{} sent a response I couldn't read ({e})",
                self.integration.display_name()
            ))
        })
    }
}

pub(crate) fn status_error(integration: Integration, status: StatusCode) -> ServiceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ServiceError::Unauthorized(integration.as_str().replace('_', " "))
        }
        StatusCode::NOT_FOUND => ServiceError::NotFound("I couldn't find that".to_string()),
        other => ServiceError::Upstream(format!(
            "{} returned an error ({})",
            integration.display_name(),
            other.as_u16()
        )),
    }
}

#[async_trait]
impl CalendarService for GatewayClient {
    async fn create_event(&self, event: NewCalendarEvent) -> Result<CalendarEvent, ServiceError> {
        self.call("create_event", &event).await
    }

    async fn list_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, ServiceError> {
        self.call("list_events", &json!({ "from": from, "to": to })).await
    }
}

#[async_trait]
impl TaskService for GatewayClient {
    async fn create_task(&self, task: NewTask) -> Result<Task, ServiceError> {
        self.call("create_task", &task).await
    }

    async fn list_tasks(&self, include_completed: bool) -> Result<Vec<Task>, ServiceError> {
        self.call("list_tasks", &json!({ "include_completed": include_completed }))
            .await
    }

    async fn complete_task(&self, id: &str) -> Result<Task, ServiceError> {
        self.call("complete_task", &json!({ "id": id })).await
    }
}

#[async_trait]
impl MusicService for GatewayClient {
    async fn play(&self, query: &str) -> Result<Track, ServiceError> {
        self.call("play", &json!({ "query": query })).await
    }

    async fn pause(&self) -> Result<(), ServiceError> {
        let _: serde_json::Value = self.call("pause", &json!({})).await?;
        Ok(())
    }

    async fn skip(&self) -> Result<Option<Track>, ServiceError> {
        self.call("skip", &json!({})).await
    }

    async fn now_playing(&self) -> Result<PlaybackState, ServiceError> {
        self.call("now_playing", &json!({})).await
    }
}

#[async_trait]
impl EmailService for GatewayClient {
    async fn list_unread(&self, limit: u32) -> Result<Vec<EmailSummary>, ServiceError> {
        self.call("list_unread", &json!({ "limit": limit })).await
    }

    async fn send(&self, email: OutgoingEmail) -> Result<(), ServiceError> {
        let _: serde_json::Value = self.call("send", &email).await?;
        Ok(())
    }
}

#[async_trait]
impl ProductivityService for GatewayClient {
    async fn summary(&self, range: ReportRange) -> Result<ProductivitySummary, ServiceError> {
        self.call("summary", &json!({ "range": range })).await
    }

    async fn start_focus(&self, minutes: u32) -> Result<FocusSession, ServiceError> {
        self.call("start_focus", &json!({ "minutes": minutes })).await
    }
}

#[async_trait]
impl WebSearchService for GatewayClient {
    async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchResult>, ServiceError> {
        self.call("search", &json!({ "query": query, "limit": limit }))
            .await
    }
}
