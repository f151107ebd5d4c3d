//! flowgate: OpenAI-compatible gateway for chat-flow conversation backends
//!
//! Exposes `/v1/chat/completions` and translates each exchange onto a
//! backend that speaks a single-query, SSE-streamed chat protocol. The
//! adapter lives in [`routers::chatflow`]: request normalization with
//! attachment resolution, byte-level frame reassembly, event classification,
//! and re-emission as OpenAI SSE chunks or one aggregated response.

pub mod config;
pub mod routers;
pub mod server;

pub use openai_protocol as protocols;
