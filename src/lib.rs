//! Chat gateway in front of an OpenAI-compatible backend: authentication,
//! per-user quotas, server-side conversation history, streaming relay and
//! usage accounting.

#[cfg(feature = "gateway")]
pub mod gateway;
