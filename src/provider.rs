//! Provider Client Module
//!
//! `ProviderApi` is the seam between the relay core and the remote chat
//! provider. `HttpProvider` talks to the provider over HTTP with `reqwest`;
//! tests substitute in-memory implementations.
//!
//! Every lease-authenticated call carries `Authorization: Bearer <lease token>`
//! and `X-Device-Id`. HTTP 401/403 maps to `RelayError::AuthFailure`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::RelayError;
use crate::lease::{Lease, LeaseExchange, LeaseGrant};

/// Raw provider response body, chunked however the transport delivers it.
pub type ByteStream = BoxStream<'static, Result<Bytes, RelayError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatus {
    pub status: i64,
    /// Provider says no further status call is needed.
    pub done: bool,
}

#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Create an ephemeral conversation and return its id.
    async fn create_conversation(&self, lease: &Lease) -> Result<String, RelayError>;

    async fn delete_conversation(
        &self,
        lease: &Lease,
        conversation_id: &str,
    ) -> Result<(), RelayError>;

    /// Send one encoded frame and return the framed response body.
    async fn send(&self, lease: &Lease, frame: Bytes) -> Result<ByteStream, RelayError>;

    async fn transfer_file(
        &self,
        lease: &Lease,
        name: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<TransferReceipt, RelayError>;

    async fn file_status(&self, lease: &Lease, file_id: &str) -> Result<FileStatus, RelayError>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(alias = "refreshToken")]
    refresh_token: String,
    #[serde(default, alias = "deviceId")]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateConversationResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: i64,
    #[serde(default, alias = "noNeedCall")]
    done: bool,
}

/// HTTP-based provider client.
pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(client: reqwest::Client, config: ProviderConfig) -> Self {
        Self { client, config }
    }

    fn authed(&self, builder: reqwest::RequestBuilder, lease: &Lease) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(lease.token())
            .header("x-device-id", lease.device_id.as_str())
    }

    async fn send_checked(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, RelayError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(512).collect();
        debug!("Provider {} failed with {}: {}", what, status, body);
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(RelayError::AuthFailure(format!("{what} returned {status}")))
        } else {
            Err(RelayError::UpstreamRequestFailed(format!(
                "{what} returned {status}: {body}"
            )))
        }
    }

    async fn json_checked<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, RelayError> {
        let response = self.send_checked(builder, what).await?;
        response.json::<T>().await.map_err(|e| {
            RelayError::UpstreamRequestFailed(format!("decoding {what} response: {e}"))
        })
    }
}

#[async_trait]
impl LeaseExchange for HttpProvider {
    async fn exchange(&self, refresh_key: &str) -> Result<LeaseGrant, RelayError> {
        let url = self.config.url(&self.config.endpoints.refresh);
        let builder = self
            .client
            .post(&url)
            .bearer_auth(refresh_key)
            .json(&serde_json::json!({}));
        let refreshed: RefreshResponse = self.json_checked(builder, "token refresh").await?;
        Ok(LeaseGrant {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token,
            device_id: refreshed.device_id.filter(|d| !d.is_empty()),
        })
    }
}

#[async_trait]
impl ProviderApi for HttpProvider {
    async fn create_conversation(&self, lease: &Lease) -> Result<String, RelayError> {
        let url = self.config.url(&self.config.endpoints.create_conversation);
        let builder = self.authed(self.client.post(&url), lease).json(&serde_json::json!({
            "name": self.config.conversation_name,
            "is_example": false,
        }));
        let created: CreateConversationResponse =
            self.json_checked(builder, "create conversation").await?;
        Ok(created.id)
    }

    async fn delete_conversation(
        &self,
        lease: &Lease,
        conversation_id: &str,
    ) -> Result<(), RelayError> {
        let path = self
            .config
            .endpoints
            .delete_conversation
            .replace("{id}", conversation_id);
        let url = self.config.url(&path);
        self.send_checked(self.authed(self.client.delete(&url), lease), "delete conversation")
            .await?;
        Ok(())
    }

    async fn send(&self, lease: &Lease, frame: Bytes) -> Result<ByteStream, RelayError> {
        let url = self.config.url(&self.config.endpoints.send);
        let builder = self
            .authed(self.client.post(&url), lease)
            .header("content-type", "application/connect+json")
            .header("connect-protocol-version", "1")
            .body(frame);
        let response = self.send_checked(builder, "send message").await?;
        Ok(response.bytes_stream().map_err(RelayError::from).boxed())
    }

    async fn transfer_file(
        &self,
        lease: &Lease,
        name: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<TransferReceipt, RelayError> {
        let url = self.config.url(&self.config.endpoints.upload);
        let builder = self
            .authed(self.client.post(&url), lease)
            .header("content-type", mime_type)
            .header("x-file-name", name)
            .body(data);
        let uploaded: UploadResponse = self
            .json_checked(builder, "file transfer")
            .await
            .map_err(|e| match e {
                RelayError::UpstreamRequestFailed(msg) => RelayError::FileUploadFailed(msg),
                other => other,
            })?;
        Ok(TransferReceipt {
            id: uploaded.id,
            width: uploaded.width,
            height: uploaded.height,
            size: uploaded.size,
        })
    }

    async fn file_status(&self, lease: &Lease, file_id: &str) -> Result<FileStatus, RelayError> {
        let url = self.config.url(&self.config.endpoints.file_status);
        let builder = self
            .authed(self.client.post(&url), lease)
            .json(&serde_json::json!({ "id": file_id }));
        let status: StatusResponse = self.json_checked(builder, "file status").await?;
        Ok(FileStatus {
            status: status.status,
            done: status.done,
        })
    }
}
