//! Request routing
//!
//! One router per exposed API surface; `chatflow` carries the chat
//! completions adapter, `error` the shared error-response builders.

pub mod chatflow;
pub mod error;
