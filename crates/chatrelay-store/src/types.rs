//! Row types for conversations and messages.

use serde::{Deserialize, Serialize};

/// Author of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A conversation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub app_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_conversation_id: Option<String>,
    pub user_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    /// Display title used by listings.
    pub fn title(&self) -> String {
        format!("Conversation with {}", self.app_code)
    }
}

/// A message row. Token counts are only present on assistant messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i64>,
    pub created_at: i64,
}

/// Token accounting for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt: i64,
    pub completion: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.prompt + self.completion
    }
}

/// Fields for a conversation about to be created.
#[derive(Debug, Clone)]
pub struct NewConversation<'a> {
    pub app_code: &'a str,
    pub platform_conversation_id: Option<&'a str>,
    pub user_id: i64,
}

/// Fields for a message about to be inserted.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub conversation_id: i64,
    pub role: Role,
    pub content: &'a str,
    pub usage: Option<TokenUsage>,
}

/// Listing entry for a conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: i64,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&Conversation> for ConversationSummary {
    fn from(c: &Conversation) -> Self {
        Self {
            id: c.id,
            title: c.title(),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// A conversation with its full message list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDetail {
    pub id: i64,
    pub title: String,
    pub app_code: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub messages: Vec<Message>,
}

/// One page of a listing plus the total row count.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: usize,
    pub size: usize,
}
