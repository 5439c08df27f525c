//! SiliconFlow adapters: the text endpoint speaks a typed event protocol,
//! the VLM endpoint speaks OpenAI-style `data:` chunks ending in `[DONE]`.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{stream_lines, AdapterKind, ChatAdapter, ChunkStream, LineOutcome, UpstreamRequest};
use crate::types::{ChatChunk, ChatMessage};
use chatrelay_core::{Error, Result};

/// Generation parameters shared by both endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformChatRequest {
    pub model: String,
    pub messages: Vec<PlatformMessage>,
    pub stream: bool,
    pub max_tokens: u32,
    pub enable_thinking: bool,
    pub thinking_budget: u32,
    pub min_p: f32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub frequency_penalty: f32,
    pub n: u32,
    pub stop: Vec<String>,
}

impl PlatformChatRequest {
    fn new(model: String, messages: Vec<PlatformMessage>, max_tokens: u32) -> Self {
        Self {
            model,
            messages,
            stream: true,
            max_tokens,
            enable_thinking: true,
            thinking_budget: 4096,
            min_p: 0.05,
            temperature: 0.7,
            top_p: 0.7,
            top_k: 50,
            frequency_penalty: 0.5,
            n: 1,
            stop: Vec::new(),
        }
    }
}

pub const TEXT_MAX_TOKENS: u32 = 512;
pub const VLM_MAX_TOKENS: u32 = 2048;

#[derive(Debug, Clone, Serialize)]
pub struct PlatformMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Plain text, or a list of typed parts for multimodal input.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    ImageUrl { image_url: ImageUrl },
    Text { text: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
    pub detail: String,
}

impl From<&ChatMessage> for PlatformMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.clone(),
            content: MessageContent::Text(msg.content.clone()),
        }
    }
}

/// System prompt (if any), then history, then the current user turn.
fn build_messages(request: &UpstreamRequest, user_content: MessageContent) -> Vec<PlatformMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    if let Some(prompt) = request
        .system_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
    {
        messages.push(PlatformMessage {
            role: "system".into(),
            content: MessageContent::Text(prompt.to_string()),
        });
    }
    messages.extend(request.history.iter().map(PlatformMessage::from));
    messages.push(PlatformMessage {
        role: "user".into(),
        content: user_content,
    });
    messages
}

// ---------- text endpoint ----------

#[derive(Debug, Deserialize)]
struct TextEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<TextMessagePayload>,
    #[serde(default)]
    delta: Option<TextDelta>,
    #[serde(default)]
    usage: Option<TextUsage>,
}

#[derive(Debug, Deserialize)]
struct TextMessagePayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<TextUsage>,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TextUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

/// Map one text-endpoint line to a chunk.
pub fn parse_text_line(line: &str) -> Result<LineOutcome> {
    let event: TextEvent = serde_json::from_str(line)
        .map_err(|e| Error::UpstreamParse(format!("Invalid SiliconFlow event: {}", e)))?;

    let chunk = match event.kind.as_str() {
        "message_start" => {
            let message = event.message.ok_or_else(|| {
                Error::UpstreamParse("message_start without message payload".into())
            })?;
            ChatChunk {
                message_id: message.id,
                prompt_tokens: message.usage.and_then(|u| u.input_tokens),
                ..Default::default()
            }
        }
        "content_block_delta" => ChatChunk {
            answer: event.delta.and_then(|d| d.text),
            ..Default::default()
        },
        "message_delta" => ChatChunk {
            completion_tokens: event.usage.and_then(|u| u.output_tokens),
            ..Default::default()
        },
        _ => return Ok(LineOutcome::Ignore),
    };
    Ok(LineOutcome::Chunk(chunk))
}

/// Stateless text chat; history travels with every request.
pub struct SiliconFlowTextAdapter {
    client: Client,
}

impl SiliconFlowTextAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn build_body(request: &UpstreamRequest) -> PlatformChatRequest {
        let messages = build_messages(request, MessageContent::Text(request.text.clone()));
        PlatformChatRequest::new(request.model.clone(), messages, TEXT_MAX_TOKENS)
    }
}

impl ChatAdapter for SiliconFlowTextAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::SiliconFlowText
    }

    fn open_stream(&self, request: UpstreamRequest) -> ChunkStream {
        let body = match serde_json::to_value(Self::build_body(&request)) {
            Ok(body) => body,
            Err(e) => return Box::pin(futures::stream::once(async move { Err(Error::from(e)) })),
        };
        stream_lines(
            self.client.clone(),
            self.kind(),
            request.api_url,
            request.api_key,
            body,
            parse_text_line,
        )
    }
}

// ---------- VLM endpoint ----------

#[derive(Debug, Deserialize)]
struct VlmChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<VlmChoice>,
    #[serde(default)]
    usage: Option<VlmUsage>,
}

#[derive(Debug, Deserialize)]
struct VlmChoice {
    #[serde(default)]
    delta: Option<VlmDelta>,
}

#[derive(Debug, Deserialize)]
struct VlmDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VlmUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

/// Map one VLM line to a chunk. Tolerates a leading `data:` even when the
/// framer has not already removed it.
pub fn parse_vlm_line(line: &str) -> Result<LineOutcome> {
    let line = line.strip_prefix("data:").unwrap_or(line).trim();
    if line == "[DONE]" {
        return Ok(LineOutcome::Done);
    }

    let chunk: VlmChunk = serde_json::from_str(line)
        .map_err(|e| Error::UpstreamParse(format!("Invalid VLM chunk: {}", e)))?;

    let answer = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content);
    let (prompt_tokens, completion_tokens) = chunk
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((None, None));

    Ok(LineOutcome::Chunk(ChatChunk {
        answer,
        conversation_id: None,
        message_id: chunk.id,
        prompt_tokens,
        completion_tokens,
        total_tokens: None,
    }))
}

/// Image+text chat against the configured VLM endpoint. The app's own
/// `api_url` is not used; only its key and model are.
pub struct SiliconFlowVlmAdapter {
    client: Client,
    url: String,
}

impl SiliconFlowVlmAdapter {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn build_body(request: &UpstreamRequest) -> PlatformChatRequest {
        let mut parts = Vec::with_capacity(2);
        if let Some(url) = &request.image_url {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: url.clone(),
                    detail: "auto".into(),
                },
            });
        }
        parts.push(ContentPart::Text {
            text: request.text.clone(),
        });
        let messages = build_messages(request, MessageContent::Parts(parts));
        PlatformChatRequest::new(request.model.clone(), messages, VLM_MAX_TOKENS)
    }
}

impl ChatAdapter for SiliconFlowVlmAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::SiliconFlowVlm
    }

    fn open_stream(&self, request: UpstreamRequest) -> ChunkStream {
        let body = match serde_json::to_value(Self::build_body(&request)) {
            Ok(body) => body,
            Err(e) => return Box::pin(futures::stream::once(async move { Err(Error::from(e)) })),
        };
        stream_lines(
            self.client.clone(),
            self.kind(),
            self.url.clone(),
            request.api_key,
            body,
            parse_vlm_line,
        )
    }
}
