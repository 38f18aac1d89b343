//! JSON shapes exchanged with the provider inside binary frames.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

/// Typed provider event decoded from one frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Error { code: String, message: String },
    Search { results: Vec<SearchResult> },
    Text { text: String },
    Done,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    error: Option<RawError>,
    pipeline_event: Option<RawPipelineEvent>,
    text_event: Option<RawTextEvent>,
    done_event: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    #[serde(default)]
    code: serde_json::Value,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPipelineEvent {
    event_search: Option<RawSearch>,
}

#[derive(Debug, Deserialize)]
struct RawSearch {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct RawTextEvent {
    #[serde(default)]
    text: String,
}

impl ProviderEvent {
    /// Parse one frame payload. `Ok(None)` means valid JSON carrying no event
    /// this relay understands (trailers, pipeline stages other than search).
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, RelayError> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| RelayError::StreamDecodeError(e.to_string()))?;

        if let Some(err) = raw.error {
            let code = match err.code {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            return Ok(Some(ProviderEvent::Error {
                code,
                message: err.message,
            }));
        }
        if let Some(search) = raw.pipeline_event.and_then(|p| p.event_search) {
            return Ok(Some(ProviderEvent::Search {
                results: search.results,
            }));
        }
        if let Some(text) = raw.text_event {
            return Ok(Some(ProviderEvent::Text { text: text.text }));
        }
        if raw.done_event.is_some() {
            return Ok(Some(ProviderEvent::Done));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub mime_type: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

/// Payload of the single outgoing frame for a send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub conversation_id: String,
    pub message_info: MessageInfo,
}
