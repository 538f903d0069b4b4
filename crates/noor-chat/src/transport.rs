//! Network seam between the engine and the answer service.
//!
//! `AskTransport` is what the engine talks to; `HttpTransport` is the
//! reqwest implementation for the real service. Status codes are classified
//! here so the engine only ever sees a [`TransportError`] or a body stream.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use noor_core::config::ApiConfig;
use noor_core::types::{HistoryTurn, SourceFilter};

use crate::error::ChatError;

/// A response body arriving in arbitrary chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Failure of the network call itself, before or while reading the body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {message}")]
    Forbidden {
        message: String,
        reset_time: Option<String>,
    },
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("body read failed: {0}")]
    Body(String),
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized => ChatError::Unauthenticated,
            TransportError::Forbidden { reset_time, .. } => ChatError::LimitReached { reset_time },
            other => ChatError::Network(other.to_string()),
        }
    }
}

/// Body of a streaming question request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AskRequest {
    pub q: String,
    pub limit: u32,
    pub source_filter: SourceFilter,
}

/// JSON body of a 403 response.
#[derive(Debug, Deserialize)]
struct ForbiddenBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reset_time: Option<String>,
}

/// Operations the engine needs from the answer service.
#[async_trait]
pub trait AskTransport: Send + Sync {
    /// Open a streaming answer. Resolves once response headers are in.
    async fn ask_stream(&self, request: &AskRequest) -> Result<ByteStream, TransportError>;

    /// Fetch the signed-in user's past turns, newest first.
    async fn history(&self) -> Result<Vec<HistoryTurn>, TransportError>;
}

/// `AskTransport` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    ask_url: String,
    history_url: String,
    token: Option<String>,
}

impl HttpTransport {
    /// Build a transport from the `[api]` configuration section.
    pub fn new(config: &ApiConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            client,
            ask_url: config.ask_stream_url(),
            history_url: config.history_url(),
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Map a non-success status to a transport error, consuming the body when
/// it carries information.
async fn classify_status(response: reqwest::Response) -> TransportError {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED => TransportError::Unauthorized,
        StatusCode::FORBIDDEN => {
            let text = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ForbiddenBody>(&text) {
                Ok(body) => TransportError::Forbidden {
                    message: body.error,
                    reset_time: body.reset_time,
                },
                Err(_) => TransportError::Forbidden {
                    message: text,
                    reset_time: None,
                },
            }
        }
        other => TransportError::Status(other.as_u16()),
    }
}

#[async_trait]
impl AskTransport for HttpTransport {
    async fn ask_stream(&self, request: &AskRequest) -> Result<ByteStream, TransportError> {
        let builder = self.client.post(&self.ask_url).json(request);
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let err = classify_status(response).await;
            tracing::warn!(url = %self.ask_url, error = %err, "Ask request rejected");
            return Err(err);
        }

        tracing::debug!(url = %self.ask_url, "Answer stream opened");
        let stream = response
            .bytes_stream()
            .map_err(|e| TransportError::Body(e.to_string()));
        Ok(Box::pin(stream))
    }

    async fn history(&self) -> Result<Vec<HistoryTurn>, TransportError> {
        let response = self
            .authorize(self.client.get(&self.history_url))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(classify_status(response).await);
        }

        response
            .json::<Vec<HistoryTurn>>()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))
    }
}
