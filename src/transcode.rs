use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use tracing::warn;

use crate::error::RelayError;
use crate::models::chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatResponseMessage, ChunkChoice,
    ChunkDelta, PLACEHOLDER_USAGE,
};
use crate::models::provider::{ProviderEvent, SearchResult};

// ============================================================================
// Shared formatting
// ============================================================================

pub const DONE_SENTINEL: &str = "data: [DONE]\n\n";
pub const FINISH_STOP: &str = "stop";
const SEARCH_RESULTS_HEADER: &str = "\n\n搜索结果来自：\n";

/// Identity stamped on every record produced for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMeta {
    pub id: String,
    pub model: String,
    pub created: u64,
}

/// Notice shown to the client when the provider reports an error event.
pub fn error_notice(code: &str, message: &str) -> String {
    format!("服务暂时不可用，第三方响应错误：[{code}] {message}")
}

fn failure_notice(err: &RelayError) -> String {
    format!("服务暂时不可用，第三方响应错误：{err}")
}

fn search_entry(result: &SearchResult) -> String {
    format!("{}({})\n", result.title, result.url)
}

/// Visible "searching" lines for one search event.
pub fn search_progress(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| format!("检索 {}({}) ...\n", r.title, r.url))
        .collect()
}

// ============================================================================
// Buffered mode
// ============================================================================

/// Accumulates events into a single completion.
#[derive(Debug)]
pub struct CompletionAccumulator {
    meta: CompletionMeta,
    content: String,
    search: String,
}

impl CompletionAccumulator {
    pub fn new(meta: CompletionMeta) -> Self {
        Self {
            meta,
            content: String::new(),
            search: String::new(),
        }
    }

    /// Apply one event. Returns `true` once the provider signalled completion.
    pub fn apply(&mut self, event: ProviderEvent) -> bool {
        match event {
            ProviderEvent::Error { code, message } => {
                self.content.push_str(&error_notice(&code, &message));
                false
            }
            ProviderEvent::Search { results } => {
                for result in &results {
                    self.search.push_str(&search_entry(result));
                }
                false
            }
            ProviderEvent::Text { text } => {
                self.content.push_str(&text);
                false
            }
            ProviderEvent::Done => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.search.is_empty()
    }

    pub fn finish(self) -> ChatCompletionResponse {
        let mut content = self.content;
        if !self.search.is_empty() {
            content.push_str(SEARCH_RESULTS_HEADER);
            content.push_str(self.search.trim_end_matches('\n'));
        }

        ChatCompletionResponse {
            id: self.meta.id,
            model: self.meta.model,
            object: "chat.completion".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatResponseMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: FINISH_STOP.to_string(),
            }],
            usage: PLACEHOLDER_USAGE,
            created: self.meta.created,
        }
    }
}

/// Drain an event stream into one completion.
///
/// A stream that closes without a done event still resolves if anything was
/// accumulated; an empty one is an upstream failure.
pub async fn transcode_buffered<S>(
    meta: CompletionMeta,
    mut events: S,
) -> Result<ChatCompletionResponse, RelayError>
where
    S: Stream<Item = Result<ProviderEvent, RelayError>> + Unpin,
{
    let mut acc = CompletionAccumulator::new(meta);
    while let Some(event) = events.next().await {
        if acc.apply(event?) {
            return Ok(acc.finish());
        }
    }

    if acc.is_empty() {
        return Err(RelayError::UpstreamRequestFailed(
            "provider stream closed before any content".to_string(),
        ));
    }
    warn!("Provider stream closed without a done event; returning partial completion");
    Ok(acc.finish())
}

// ============================================================================
// Streaming mode
// ============================================================================

/// Converts provider events into `chat.completion.chunk` SSE frames.
///
/// Always ends with `data: [DONE]`. Upstream failures become an in-band notice
/// chunk instead of a stream error. Fused after the sentinel.
pub struct ChunkStream<S> {
    inner: S,
    meta: CompletionMeta,
    queue: VecDeque<Bytes>,
    started: bool,
    finished: bool,
}

impl<S> ChunkStream<S>
where
    S: Stream<Item = Result<ProviderEvent, RelayError>> + Unpin,
{
    pub fn new(meta: CompletionMeta, inner: S) -> Self {
        Self {
            inner,
            meta,
            queue: VecDeque::new(),
            started: false,
            finished: false,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&str>, usage: bool) -> Bytes {
        let chunk = ChatCompletionChunk {
            id: self.meta.id.clone(),
            model: self.meta.model.clone(),
            object: "chat.completion.chunk".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage: usage.then_some(PLACEHOLDER_USAGE),
            created: self.meta.created,
        };
        // Serializing plain strings and integers cannot fail.
        let json = serde_json::to_string(&chunk).unwrap_or_default();
        Bytes::from(format!("data: {json}\n\n"))
    }

    fn push_content(&mut self, content: String) {
        let chunk = self.chunk(
            ChunkDelta {
                role: None,
                content: Some(content),
            },
            None,
            false,
        );
        self.queue.push_back(chunk);
    }

    fn push_terminal_notice(&mut self, notice: String) {
        let chunk = self.chunk(
            ChunkDelta {
                role: None,
                content: Some(notice),
            },
            Some(FINISH_STOP),
            false,
        );
        self.queue.push_back(chunk);
        self.queue.push_back(Bytes::from_static(DONE_SENTINEL.as_bytes()));
        self.finished = true;
    }

    fn push_stop(&mut self) {
        let chunk = self.chunk(ChunkDelta::default(), Some(FINISH_STOP), true);
        self.queue.push_back(chunk);
        self.queue.push_back(Bytes::from_static(DONE_SENTINEL.as_bytes()));
        self.finished = true;
    }

    fn on_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::Error { code, message } => {
                self.push_terminal_notice(error_notice(&code, &message));
            }
            ProviderEvent::Search { results } => {
                if !results.is_empty() {
                    self.push_content(search_progress(&results));
                }
            }
            ProviderEvent::Text { text } => self.push_content(text),
            ProviderEvent::Done => self.push_stop(),
        }
    }
}

impl<S> Stream for ChunkStream<S>
where
    S: Stream<Item = Result<ProviderEvent, RelayError>> + Unpin,
{
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(bytes) = this.queue.pop_front() {
                return Poll::Ready(Some(bytes));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            if !this.started {
                this.started = true;
                let opening = this.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                    },
                    None,
                    false,
                );
                this.queue.push_back(opening);
                continue;
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => this.on_event(event),
                Poll::Ready(Some(Err(err))) => {
                    warn!("Provider stream failed mid-response: {}", err);
                    this.push_terminal_notice(failure_notice(&err));
                }
                Poll::Ready(None) => {
                    warn!("Provider stream closed without a done event");
                    this.push_stop();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
