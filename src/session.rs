//! Session orchestration.
//!
//! One request runs `create conversation -> upload attachments -> prepare
//! message -> send -> decode/transcode -> delete conversation`. The whole
//! pipeline is retried with a fixed delay; deletion is detached and only logged.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, SessionConfig};
use crate::error::RelayError;
use crate::frame::{decode_events, encode_frame, FLAG_MESSAGE};
use crate::lease::{Lease, LeaseExchange, LeaseStore};
use crate::models::chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ContentPart, MessageContent, Role,
};
use crate::models::provider::{Attachment, MessageInfo, OutgoingMessage, ProviderEvent};
use crate::provider::{HttpProvider, ProviderApi};
use crate::transcode::{transcode_buffered, ChunkStream, CompletionMeta};
use crate::upload::{AttachmentUploader, HttpSource};
use crate::util::{credential_fingerprint, unix_timestamp};

const FOCUS_FILES_AND_MESSAGE: &str = "关注用户最新发送文件和消息";
const FOCUS_MESSAGE: &str = "关注用户最新的消息";

static MARKDOWN_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid markdown image pattern"));
static INLINE_PAYLOAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"data:[A-Za-z0-9.+/-]*(?:;[A-Za-z0-9=.+-]+)*;base64,[A-Za-z0-9+/=]*")
        .expect("valid inline payload pattern")
});

fn strip_inline(text: &str) -> String {
    let without_images = MARKDOWN_IMAGE.replace_all(text, "");
    INLINE_PAYLOAD.replace_all(&without_images, "").into_owned()
}

/// Merge the conversation history into the single text the provider accepts.
///
/// Each text fragment becomes a `"<role>:<text>\n"` line. A system line
/// steering attention to the newest turn is placed before the final user turn.
pub fn prepare_message_text(messages: &[ChatMessage]) -> String {
    let last_user = messages.iter().rposition(|m| m.role == Role::User);
    let mut out = String::new();

    for (idx, message) in messages.iter().enumerate() {
        if Some(idx) == last_user {
            let focus = if message.has_attachments() {
                FOCUS_FILES_AND_MESSAGE
            } else {
                FOCUS_MESSAGE
            };
            push_line(&mut out, Role::System, focus);
        }

        match &message.content {
            Some(MessageContent::Text(text)) => {
                push_line(&mut out, message.role, &strip_inline(text))
            }
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    if let ContentPart::Text { text } = part {
                        push_line(&mut out, message.role, &strip_inline(text));
                    }
                }
            }
            None => {}
        }
    }
    out
}

fn push_line(out: &mut String, role: Role, text: &str) {
    out.push_str(role.as_str());
    out.push(':');
    out.push_str(text);
    out.push('\n');
}

/// Encode the outgoing message as a single provider frame.
pub fn build_frame(
    conversation_id: &str,
    text: String,
    attachments: Vec<Attachment>,
) -> Result<Bytes, RelayError> {
    let message = OutgoingMessage {
        conversation_id: conversation_id.to_string(),
        message_info: MessageInfo {
            text,
            attachments: (!attachments.is_empty()).then_some(attachments),
        },
    };
    let payload = serde_json::to_vec(&message)
        .map_err(|e| RelayError::UpstreamRequestFailed(format!("encoding message: {e}")))?;
    encode_frame(FLAG_MESSAGE, &payload)
}

/// Deletes its conversation when dropped.
struct ConversationGuard {
    provider: Arc<dyn ProviderApi>,
    lease: Lease,
    conversation_id: String,
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        let provider = Arc::clone(&self.provider);
        let lease = self.lease.clone();
        let conversation_id = std::mem::take(&mut self.conversation_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match provider.delete_conversation(&lease, &conversation_id).await {
                        Ok(()) => debug!("Deleted conversation {}", conversation_id),
                        Err(err) => {
                            warn!("Failed to delete conversation {}: {}", conversation_id, err)
                        }
                    }
                });
            }
            Err(_) => warn!(
                "No runtime available to delete conversation {}",
                conversation_id
            ),
        }
    }
}

type EventSource = BoxStream<'static, Result<ProviderEvent, RelayError>>;

/// A sent message whose response body is ready to be transcoded.
struct OpenExchange {
    guard: ConversationGuard,
    meta: CompletionMeta,
    events: EventSource,
}

pub struct ChatRelay {
    provider: Arc<dyn ProviderApi>,
    leases: Arc<LeaseStore>,
    uploader: AttachmentUploader,
    config: SessionConfig,
}

impl ChatRelay {
    pub fn new(
        provider: Arc<dyn ProviderApi>,
        leases: Arc<LeaseStore>,
        uploader: AttachmentUploader,
        config: SessionConfig,
    ) -> Self {
        Self {
            provider,
            leases,
            uploader,
            config,
        }
    }

    /// Relay wired to the HTTP provider and HTTP file sources.
    pub fn over_http(http: reqwest::Client, config: &RelayConfig) -> Self {
        let provider = Arc::new(HttpProvider::new(http.clone(), config.provider.clone()));
        let exchange: Arc<dyn LeaseExchange> = provider.clone();
        let leases = Arc::new(LeaseStore::new(exchange, config.lease.ttl));
        let uploader = AttachmentUploader::new(
            provider.clone(),
            Arc::new(HttpSource::new(http)),
            config.upload.clone(),
        );
        Self::new(provider, leases, uploader, config.session.clone())
    }

    /// Whether `key` can currently be exchanged for a lease.
    pub async fn check(&self, key: &str) -> bool {
        self.leases.check(key).await
    }

    /// Run the request and return one buffered completion.
    pub async fn complete(
        &self,
        key: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, RelayError> {
        self.with_retries(key, move || async move {
            let open = self.open(key, request).await?;
            let OpenExchange {
                guard,
                meta,
                events,
            } = open;
            let result = transcode_buffered(meta, events).await;
            drop(guard);
            result
        })
        .await
    }

    /// Run the request and return its SSE body.
    ///
    /// Retries cover everything up to the provider accepting the send. After
    /// that, failures are reported in-band by the chunk stream.
    pub async fn complete_stream(
        &self,
        key: &str,
        request: &ChatCompletionRequest,
    ) -> Result<BoxStream<'static, Bytes>, RelayError> {
        let OpenExchange {
            guard,
            meta,
            events,
        } = self.with_retries(key, || self.open(key, request)).await?;

        let mut chunks = ChunkStream::new(meta, events);
        let body = async_stream::stream! {
            let _guard = guard;
            while let Some(chunk) = chunks.next().await {
                yield chunk;
            }
        };
        Ok(body.boxed())
    }

    async fn with_retries<T, F, Fut>(&self, key: &str, mut attempt: F) -> Result<T, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let attempts = self.config.max_retries.saturating_add(1);
        let mut made = 0u32;
        loop {
            made += 1;
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || made >= attempts {
                warn!(
                    "Request for {} failed after {} attempt(s): {}",
                    credential_fingerprint(key),
                    made,
                    err
                );
                return Err(err);
            }
            warn!(
                "Attempt {}/{} failed: {}; retrying in {:?}",
                made, attempts, err, self.config.retry_delay
            );
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    async fn open(
        &self,
        key: &str,
        request: &ChatCompletionRequest,
    ) -> Result<OpenExchange, RelayError> {
        let lease = self.leases.acquire(key).await?;
        self.open_with(key, &lease, request).await.map_err(|err| {
            if err.is_auth_failure() {
                self.leases.evict_if(key, &lease);
            }
            err
        })
    }

    async fn open_with(
        &self,
        key: &str,
        lease: &Lease,
        request: &ChatCompletionRequest,
    ) -> Result<OpenExchange, RelayError> {
        let started = unix_timestamp();
        let conversation_id = self.provider.create_conversation(lease).await?;
        info!("Created conversation {}", conversation_id);
        let guard = ConversationGuard {
            provider: Arc::clone(&self.provider),
            lease: lease.clone(),
            conversation_id: conversation_id.clone(),
        };

        let mut attachments = Vec::new();
        if let Some(last_user) = request.messages.iter().rev().find(|m| m.role == Role::User) {
            if let Some(content) = &last_user.content {
                for url in content.attachment_urls() {
                    attachments.push(self.uploader.upload(url, lease).await?);
                }
            }
        }

        let text = prepare_message_text(&request.messages);
        let frame = build_frame(&conversation_id, text, attachments)?;
        let body = self.provider.send(lease, frame).await?;

        let leases = Arc::clone(&self.leases);
        let auth_codes = self.config.auth_failure_codes.clone();
        let owner = key.to_string();
        let rejected = lease.clone();
        let events = decode_events(body)
            .inspect(move |event| {
                if let Ok(ProviderEvent::Error { code, message }) = event {
                    if auth_codes.iter().any(|c| c == code) {
                        warn!("Provider rejected lease: [{}] {}", code, message);
                        leases.evict_if(&owner, &rejected);
                    }
                }
            })
            .boxed();

        Ok(OpenExchange {
            meta: CompletionMeta {
                id: conversation_id,
                model: request.model.clone(),
                created: started,
            },
            guard,
            events,
        })
    }
}
