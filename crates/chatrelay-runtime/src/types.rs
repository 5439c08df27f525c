//! Runtime types.

use serde::Serialize;

use chatrelay_chat::ChatRequest;
use chatrelay_core::AppConfig;

/// What the persister needs to know about a turn besides its chunks.
#[derive(Debug, Clone)]
pub struct TurnContext {
    /// Per-turn id for log correlation.
    pub trace_id: String,
    pub request: ChatRequest,
    pub app: AppConfig,
}

/// How a turn's transcript write ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PersistOutcome {
    Saved {
        #[serde(rename = "conversationId")]
        conversation_id: i64,
        #[serde(rename = "userMessageId")]
        user_message_id: i64,
        #[serde(rename = "assistantMessageId")]
        assistant_message_id: i64,
        #[serde(rename = "totalTokens")]
        total_tokens: i64,
    },
    /// No answer text was produced; nothing was written.
    Skipped,
    /// The write failed and was rolled back.
    Failed { error: String },
}

impl PersistOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, PersistOutcome::Saved { .. })
    }
}

/// Runtime-level knobs.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Owner recorded when a request carries no user id.
    pub system_user_id: i64,
    /// Dify `user` for anonymous callers.
    pub dify_default_user: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            system_user_id: chatrelay_core::DEFAULT_SYSTEM_USER_ID,
            dify_default_user: chatrelay_chat::config::DEFAULT_DIFY_USER.into(),
        }
    }
}
