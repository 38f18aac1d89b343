#![forbid(unsafe_code)]
#![doc = r#"
Chatrelay

Expose a framed binary streaming chat provider through the OpenAI Chat
Completions contract, both buffered and as server-sent events.

Crate highlights
- Library: `ChatRelay::complete` / `ChatRelay::complete_stream` run one request
  through the provider with bounded retry.
- HTTP server (in `server`): `/v1/chat/completions`, `/token/check`,
  `/v1/models` and `/status`.

Modules
- `lease`: refresh-credential exchange with single-flight dedup and TTL cache.
- `frame`: length-prefixed frame codec and provider event decoding.
- `transcode`: provider events into `chat.completion` / `chat.completion.chunk`.
- `upload`: attachment validate, transfer and status polling.
- `session`: per-request pipeline, message preparation, retry and cleanup.
- `provider`: the `ProviderApi` seam and its `reqwest` implementation.
- `models`: Chat Completions and provider wire types.
- `config`, `error`, `util`: configuration, error taxonomy, shared helpers.
"#]

pub mod config;
pub mod error;
pub mod frame;
pub mod lease;
pub mod models;
pub mod provider;
pub mod server;
pub mod session;
pub mod transcode;
pub mod upload;
pub mod util;

pub use crate::config::RelayConfig;
pub use crate::error::RelayError;
pub use crate::frame::{decode_events, encode_frame, Frame, FrameBuffer, FrameDecoder};
pub use crate::lease::{Lease, LeaseExchange, LeaseGrant, LeaseStore};
pub use crate::provider::{HttpProvider, ProviderApi};
pub use crate::session::{prepare_message_text, ChatRelay};
pub use crate::transcode::{transcode_buffered, ChunkStream, CompletionMeta};
pub use crate::upload::{AttachmentUploader, HttpSource, SourceFetcher};

// Re-export model namespaces for convenience (downstream users can do `use chatrelay::chat`).
pub use crate::models::{chat, provider as wire};
