//! Chat types shared by adapters, the orchestrator, and the HTTP layer.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// One normalized unit of upstream output.
///
/// Every field is optional: a provider event usually carries either an
/// answer delta or metadata (ids, token usage), rarely both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatChunk {
    pub answer: Option<String>,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl ChatChunk {
    /// A chunk carrying only an answer delta.
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            answer: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Chat message in conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Image attached to a multimodal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    /// Raw upload, sent upstream as a base64 data URI.
    Binary { content_type: String, bytes: Vec<u8> },
    /// An http(s) URL or an already-encoded data URI.
    Url(String),
}

impl ImageInput {
    /// The value placed in the upstream `image_url.url` field.
    pub fn to_image_url(&self) -> String {
        match self {
            ImageInput::Binary {
                content_type,
                bytes,
            } => format!(
                "data:{};base64,{}",
                content_type,
                base64::engine::general_purpose::STANDARD.encode(bytes)
            ),
            ImageInput::Url(url) => url.clone(),
        }
    }
}

/// Incoming chat request, with the caller identity already resolved by the
/// boundary layer.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub app_code: String,
    pub text: String,
    /// Internal conversation id as shown to clients.
    pub conversation_id: Option<String>,
    pub image: Option<ImageInput>,
    pub user_id: Option<i64>,
}

impl ChatRequest {
    pub fn text(app_code: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            app_code: app_code.into(),
            text: text.into(),
            conversation_id: None,
            image: None,
            user_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Supplied conversation id, if it is non-blank.
    pub fn conversation_ref(&self) -> Option<&str> {
        self.conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// JSON body of a text chat request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextChatPayload {
    pub app_code: String,
    pub text: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Event relayed to the caller for every upstream chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub conversation_id: Option<String>,
    pub answer: Option<String>,
}

impl From<&ChatChunk> for ChatEvent {
    fn from(chunk: &ChatChunk) -> Self {
        Self {
            conversation_id: chunk.conversation_id.clone(),
            answer: chunk.answer.clone(),
        }
    }
}
