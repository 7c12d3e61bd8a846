use std::{future::Future, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::{Channel, ChannelId, Message, UserId},
    error::ApiError,
    protocol::{CreateChannelRequest, SendMessageRequest},
};
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Request/response API of the chat service.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<Channel>>;
    async fn create_channel(&self, name: &str, logo_ref: Option<&str>) -> Result<Channel>;
    async fn delete_channel(&self, channel_id: &ChannelId) -> Result<()>;
    async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<Message>>;
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        text: &str,
        author_id: &UserId,
        author_name: &str,
    ) -> Result<Message>;
}

/// Runs a remote call, turning a missed deadline into a remote failure.
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: &'static str, call: F) -> SyncResult<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(SyncError::remote(operation, err)),
        Err(_) => Err(SyncError::Timeout { operation, timeout }),
    }
}

pub struct HttpRemoteClient {
    http: Client,
    base_url: Url,
}

impl HttpRemoteClient {
    pub fn new(server_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(server_url).with_context(|| format!("invalid server url '{server_url}'"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("server url cannot be a base: {server_url}"));
        }
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Maps non-2xx responses to the service's structured error body.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_status(status.as_u16(), &body).into())
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let response = self.http.get(self.endpoint(&["channels"])?).send().await?;
        let channels = check(response).await?.json().await?;
        Ok(channels)
    }

    async fn create_channel(&self, name: &str, logo_ref: Option<&str>) -> Result<Channel> {
        let response = self
            .http
            .post(self.endpoint(&["channels"])?)
            .json(&CreateChannelRequest {
                name: name.to_string(),
                logo_ref: logo_ref.map(str::to_string),
            })
            .send()
            .await?;
        let channel = check(response).await?.json().await?;
        Ok(channel)
    }

    async fn delete_channel(&self, channel_id: &ChannelId) -> Result<()> {
        let response = self
            .http
            .delete(self.endpoint(&["channels", channel_id.as_str()])?)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<Message>> {
        let response = self
            .http
            .get(self.endpoint(&["channels", channel_id.as_str(), "messages"])?)
            .send()
            .await?;
        let messages = check(response).await?.json().await?;
        Ok(messages)
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        text: &str,
        author_id: &UserId,
        author_name: &str,
    ) -> Result<Message> {
        let response = self
            .http
            .post(self.endpoint(&["channels", channel_id.as_str(), "messages"])?)
            .json(&SendMessageRequest {
                text: text.to_string(),
                author_id: author_id.clone(),
                author_name: author_name.to_string(),
            })
            .send()
            .await?;
        let message = check(response).await?.json().await?;
        Ok(message)
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
