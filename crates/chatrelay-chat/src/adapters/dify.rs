//! Dify chat-messages streaming adapter.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{stream_lines, AdapterKind, ChatAdapter, ChunkStream, LineOutcome, UpstreamRequest};
use crate::types::ChatChunk;
use chatrelay_core::{Error, Result};

/// Body of `POST {base}/chat-messages`.
#[derive(Debug, Serialize)]
pub struct DifyChatRequest {
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub query: String,
    pub response_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub user: String,
}

/// One streamed Dify event. Only the fields the relay reads are modelled.
#[derive(Debug, Deserialize)]
pub struct DifyEvent {
    pub event: String,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<DifyMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DifyMetadata {
    #[serde(default)]
    pub usage: Option<DifyUsage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DifyUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
}

/// Map one Dify line to a chunk.
///
/// `agent_message` carries only the answer delta; `message_end` carries only
/// ids and usage. Every other event is ignored.
pub fn parse_line(line: &str) -> Result<LineOutcome> {
    let event: DifyEvent = serde_json::from_str(line)
        .map_err(|e| Error::UpstreamParse(format!("Invalid Dify event: {}", e)))?;

    match event.event.as_str() {
        "agent_message" => Ok(LineOutcome::Chunk(ChatChunk {
            answer: event.answer,
            ..Default::default()
        })),
        "message_end" => {
            let usage = event.metadata.and_then(|m| m.usage).unwrap_or_default();
            Ok(LineOutcome::Chunk(ChatChunk {
                answer: None,
                conversation_id: event.conversation_id,
                message_id: event.message_id,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }))
        }
        _ => Ok(LineOutcome::Ignore),
    }
}

/// Dify keeps conversation state server-side; history is never sent.
pub struct DifyAdapter {
    client: Client,
}

impl DifyAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn build_body(request: &UpstreamRequest) -> DifyChatRequest {
        DifyChatRequest {
            inputs: serde_json::Map::new(),
            query: request.text.clone(),
            response_mode: "streaming",
            conversation_id: request
                .platform_conversation_id
                .clone()
                .filter(|id| !id.is_empty()),
            user: request.user.clone().unwrap_or_default(),
        }
    }
}

impl ChatAdapter for DifyAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Dify
    }

    fn open_stream(&self, request: UpstreamRequest) -> ChunkStream {
        let url = format!("{}/chat-messages", request.api_url.trim_end_matches('/'));
        let body = match serde_json::to_value(Self::build_body(&request)) {
            Ok(body) => body,
            Err(e) => return Box::pin(futures::stream::once(async move { Err(Error::from(e)) })),
        };
        stream_lines(
            self.client.clone(),
            self.kind(),
            url,
            request.api_key,
            body,
            parse_line,
        )
    }
}
