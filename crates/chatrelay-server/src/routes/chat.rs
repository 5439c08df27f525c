//! Chat routes: text and image+text streaming over SSE.
//!
//! Every relayed chunk becomes one `data:` event carrying
//! `{conversationId, answer}`. The stream ends with a `done` event, or with a
//! single `error` event when the turn cannot start or the upstream fails.
//!
//! `conversationId` is the upstream platform's id and only Dify sends one.
//! The internal conversation id is assigned after the stream ends, so it is
//! never part of the stream: SiliconFlow clients look it up through
//! `GET /api/conversations` and pass it back to continue the conversation.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::response::sse::{Event, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use super::{ApiError, CallerId};
use crate::state::AppState;
use chatrelay_chat::{ChatRequest, ImageInput, TextChatPayload};
use chatrelay_core::Error;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Uploads larger than this are rejected by the multipart extractor.
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/stream", post(stream_text))
        .route(
            "/chat/vlm/stream",
            post(stream_vlm).layer(axum::extract::DefaultBodyLimit::max(MAX_IMAGE_BYTES)),
        )
}

/// POST /api/chat/stream
async fn stream_text(
    State(state): State<Arc<AppState>>,
    CallerId(caller): CallerId,
    Json(payload): Json<TextChatPayload>,
) -> Result<Sse<SseStream>, ApiError> {
    let mut request = ChatRequest::text(
        require("appCode", &payload.app_code)?,
        require("text", &payload.text)?,
    );
    request.conversation_id = payload.conversation_id;
    request.user_id = caller;

    info!("Text chat request: app={}, user={:?}", request.app_code, caller);
    Ok(Sse::new(relay(state, request).await))
}

/// POST /api/chat/vlm/stream (multipart: appCode, text, conversationId?,
/// imageUrl?, image?)
async fn stream_vlm(
    State(state): State<Arc<AppState>>,
    CallerId(caller): CallerId,
    mut multipart: Multipart,
) -> Result<Sse<SseStream>, ApiError> {
    let mut app_code = String::new();
    let mut text = String::new();
    let mut conversation_id = None;
    let mut image_url = None;
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidRequest(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| "image/jpeg".into());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("Failed to read image: {}", e)))?;
                if !bytes.is_empty() {
                    upload = Some(ImageInput::Binary {
                        content_type,
                        bytes: bytes.to_vec(),
                    });
                }
            }
            "appCode" | "text" | "conversationId" | "imageUrl" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("Invalid field {}: {}", name, e)))?;
                match name.as_str() {
                    "appCode" => app_code = value,
                    "text" => text = value,
                    "conversationId" => conversation_id = Some(value),
                    _ => image_url = Some(value),
                }
            }
            other => warn!("Ignoring unexpected multipart field '{}'", other),
        }
    }

    let mut request = ChatRequest::text(require("appCode", &app_code)?, require("text", &text)?);
    request.conversation_id = conversation_id;
    request.user_id = caller;
    request.image = upload.or_else(|| {
        image_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .map(ImageInput::Url)
    });

    info!(
        "VLM chat request: app={}, user={:?}, image={}",
        request.app_code,
        caller,
        match &request.image {
            Some(ImageInput::Binary { bytes, .. }) => format!("upload ({} bytes)", bytes.len()),
            Some(ImageInput::Url(_)) => "url".to_string(),
            None => "none".to_string(),
        }
    );
    Ok(Sse::new(relay(state, request).await))
}

/// Start the turn and map its events onto SSE.
async fn relay(state: Arc<AppState>, request: ChatRequest) -> SseStream {
    let turn = match state.orchestrator.stream_chat(request).await {
        Ok(turn) => turn,
        Err(e) => {
            warn!("Chat turn not started: {}", e);
            return Box::pin(futures::stream::once(async move { Ok(error_event(&e)) }));
        }
    };

    let trace_id = turn.trace_id;
    let mut events = turn.events;

    Box::pin(async_stream::stream! {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse) => {
                        yield Ok(sse);
                    }
                    Err(e) => error!("[{}] failed to encode event: {}", trace_id, e),
                },
                Err(e) => {
                    yield Ok(error_event(&e));
                    return;
                }
            }
        }
        yield Ok(Event::default().event("done").data("[DONE]"));
    })
}

fn error_event(e: &Error) -> Event {
    Event::default()
        .event("error")
        .data(serde_json::json!({ "error": e.to_string() }).to_string())
}

fn require(field: &str, value: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidRequest(format!("{} must not be blank", field)).into());
    }
    Ok(value.to_string())
}
