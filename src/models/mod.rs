//! Serde data model.
//!
//! - `chat`: the OpenAI Chat Completions contract exposed to callers.
//! - `provider`: JSON carried inside the provider's binary frames.

pub mod chat;
pub mod provider;
