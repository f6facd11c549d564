use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChannelId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{EditMessageRequest, MessagePayload, MessageQuery, SendMessageRequest},
};
use tracing::debug;
use url::Url;

use crate::{error::TransportError, MessageTransport};

const API_PREFIX: [&str; 2] = ["api", "v1"];
const MAX_ERROR_BODY_CHARS: usize = 512;

/// REST transport against `/api/v1`. Every request carries the bearer token
/// and its own timeout.
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    token: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(server_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(server_url)
            .with_context(|| format!("invalid server url {server_url}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("server url {server_url} cannot carry a path");
        }
        let http = Client::builder()
            .user_agent(concat!("channel-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            token: token.into(),
            timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(API_PREFIX).extend(segments);
        }
        url
    }

    fn channel_endpoint(&self, channel_id: &ChannelId, rest: &[&str]) -> Url {
        let mut segments = vec!["channels", channel_id.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = request
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| self.map_reqwest_error(err))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "http: request failed");
        Err(map_status(status, body))
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, TransportError> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))
    }

    fn map_reqwest_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

fn map_status(status: StatusCode, body: String) -> TransportError {
    let summary: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    match status.as_u16() {
        404 | 409 => TransportError::Conflict(if summary.is_empty() {
            status.to_string()
        } else {
            summary
        }),
        429 => TransportError::RateLimited(summary),
        500..=599 => TransportError::Server {
            status: status.as_u16(),
            message: summary,
        },
        _ => TransportError::Rejected(
            serde_json::from_str::<ApiError>(&body)
                .unwrap_or_else(|_| ApiError::new(ErrorCode::Unknown, summary)),
        ),
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        query: &MessageQuery,
    ) -> Result<Vec<MessagePayload>, TransportError> {
        let url = self.channel_endpoint(channel_id, &["messages"]);
        self.execute_json(self.http.get(url).query(query)).await
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload, TransportError> {
        let url = self.channel_endpoint(channel_id, &["messages"]);
        self.execute_json(self.http.post(url).json(request)).await
    }

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        request: &EditMessageRequest,
    ) -> Result<MessagePayload, TransportError> {
        let url = self.channel_endpoint(channel_id, &["messages", message_id.as_str()]);
        self.execute_json(self.http.patch(url).json(request)).await
    }

    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        let url = self.channel_endpoint(channel_id, &["messages", message_id.as_str()]);
        self.execute(self.http.delete(url)).await.map(drop)
    }

    async fn add_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), TransportError> {
        let url = self.channel_endpoint(
            channel_id,
            &["messages", message_id.as_str(), "reactions", emoji, "@me"],
        );
        self.execute(self.http.put(url)).await.map(drop)
    }

    async fn remove_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), TransportError> {
        let url = self.channel_endpoint(
            channel_id,
            &["messages", message_id.as_str(), "reactions", emoji, "@me"],
        );
        self.execute(self.http.delete(url)).await.map(drop)
    }

    async fn pin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        let url = self.channel_endpoint(channel_id, &["pins", message_id.as_str()]);
        self.execute(self.http.put(url)).await.map(drop)
    }

    async fn unpin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        let url = self.channel_endpoint(channel_id, &["pins", message_id.as_str()]);
        self.execute(self.http.delete(url)).await.map(drop)
    }

    async fn fetch_pins(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessagePayload>, TransportError> {
        let url = self.channel_endpoint(channel_id, &["pins"]);
        self.execute_json(self.http.get(url)).await
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
