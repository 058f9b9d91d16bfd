//! Pull surface: authoritative room fetches, topic mutations, and the
//! activity endpoints used while the push channel is down.
//!
//! Implementations:
//! - [`HttpRoomApi`]: JSON over HTTPS with a bearer token
//! - [`InMemoryRoomApi`](super::memory::InMemoryRoomApi): in-process authority for testing

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use copresence_proto::ids::{RoomId, TopicId, UserId};
use copresence_proto::presence::ActivityReport;
use copresence_proto::room::{CompletionResult, RoomSnapshot};

/// Errors returned by the pull surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// 401/403: the token is missing, expired or not allowed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 400/422: the request was refused as invalid.
    #[error("invalid request: {0}")]
    Validation(String),

    /// 409: the authority's state moved under the request.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-success status.
    #[error("server returned {status}: {body}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The request never completed.
    #[error("network failure: {0}")]
    Network(String),

    /// The request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The response body did not have the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Request/response surface of the server of record.
pub trait RoomApi: Send + Sync + 'static {
    /// Fetch the authoritative snapshot of a room.
    fn fetch_room(
        &self,
        room: &RoomId,
    ) -> impl std::future::Future<Output = Result<RoomSnapshot, ApiError>> + Send;

    /// Mark a topic complete for the caller. Returns the recalculated fields.
    fn complete_topic(
        &self,
        room: &RoomId,
        topic: &TopicId,
    ) -> impl std::future::Future<Output = Result<CompletionResult, ApiError>> + Send;

    /// Undo a completion for the caller. Returns the recalculated fields.
    fn reopen_topic(
        &self,
        room: &RoomId,
        topic: &TopicId,
    ) -> impl std::future::Future<Output = Result<CompletionResult, ApiError>> + Send;

    /// Fetch a user's last reported activity, if any.
    fn fetch_activity(
        &self,
        user: &UserId,
    ) -> impl std::future::Future<Output = Result<Option<ActivityReport>, ApiError>> + Send;

    /// Record the caller's current activity.
    fn post_activity(
        &self,
        report: &ActivityReport,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;
}

/// Map a non-success HTTP status onto the error taxonomy.
#[must_use]
pub fn map_status(status: u16, body: String) -> ApiError {
    match status {
        401 | 403 => ApiError::Unauthorized(body),
        400 | 422 => ApiError::Validation(body),
        409 => ApiError::Conflict(body),
        408 | 504 => ApiError::Timeout,
        _ => ApiError::Server { status, body },
    }
}

fn map_reqwest_error(err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else if err.is_decode() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::Network(err.to_string())
    }
}

/// [`RoomApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRoomApi {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpRoomApi {
    /// Creates a client for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Validation`] if the URL does not parse, and
    /// [`ApiError::Network`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::Validation(format!("bad api url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Validation(format!("bad api url {base_url}")));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    /// Build `{base}/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&ActivityReport>,
    ) -> Result<reqwest::Response, ApiError> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| {
            tracing::warn!(%method, %url, err = %e, "request failed");
            map_reqwest_error(&e)
        })?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(%method, %url, status = status.as_u16(), "request refused");
        Err(map_status(status.as_u16(), body))
    }

    async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
    ) -> Result<T, ApiError> {
        let response = self.send(method, url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(404, body));
        }
        response.json::<T>().await.map_err(|e| map_reqwest_error(&e))
    }
}

impl RoomApi for HttpRoomApi {
    async fn fetch_room(&self, room: &RoomId) -> Result<RoomSnapshot, ApiError> {
        let url = self.endpoint(&["rooms", room.as_str()]);
        self.json(Method::GET, url).await
    }

    async fn complete_topic(
        &self,
        room: &RoomId,
        topic: &TopicId,
    ) -> Result<CompletionResult, ApiError> {
        let url = self.endpoint(&["rooms", room.as_str(), "topics", topic.as_str(), "complete"]);
        self.json(Method::POST, url).await
    }

    async fn reopen_topic(
        &self,
        room: &RoomId,
        topic: &TopicId,
    ) -> Result<CompletionResult, ApiError> {
        let url = self.endpoint(&["rooms", room.as_str(), "topics", topic.as_str(), "complete"]);
        self.json(Method::DELETE, url).await
    }

    async fn fetch_activity(&self, user: &UserId) -> Result<Option<ActivityReport>, ApiError> {
        let url = self.endpoint(&["activity", user.as_str()]);
        let response = self.send(Method::GET, url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        response
            .json::<ActivityReport>()
            .await
            .map(Some)
            .map_err(|e| map_reqwest_error(&e))
    }

    async fn post_activity(&self, report: &ActivityReport) -> Result<(), ApiError> {
        let url = self.endpoint(&["activity"]);
        let response = self.send(Method::POST, url, Some(report)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(map_status(404, String::new()));
        }
        Ok(())
    }
}
