//! OpenAI-compatible protocol definitions
//!
//! Wire types for the chat completion surface exposed by the gateway:
//! request shapes accepted from OpenAI SDK clients, and the response /
//! stream-chunk shapes written back to them.

pub mod chat;
pub mod common;
