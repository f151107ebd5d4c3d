//! Types shared across the chat completion request and response surfaces.

use serde::{Deserialize, Serialize};

/// Token usage accounting attached to completion responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32, total_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

/// List wrapper used by the models endpoint (`{"object": "list", "data": [...]}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String, // "list"
    pub data: Vec<ModelInfo>,
}

/// A single entry in the models listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String, // "model"
    pub created: u64,
    pub owned_by: String,
}
