//! Provider adapters.
//!
//! Every adapter turns an [`UpstreamRequest`] into a lazy [`ChunkStream`]:
//! nothing is sent until the stream is first polled, and dropping the stream
//! drops the upstream response, which releases the connection.

pub mod dify;
pub mod siliconflow;

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use tokio_stream::StreamExt;
use tracing::{debug, error, warn};

use crate::config::ProviderSettings;
use crate::sse::LineFramer;
use crate::types::{ChatChunk, ChatMessage};
use chatrelay_core::{Error, Platform, Result};

pub use dify::DifyAdapter;
pub use siliconflow::{SiliconFlowTextAdapter, SiliconFlowVlmAdapter};

/// Ordered, finite chunk sequence. An `Err` item is terminal.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// Everything an adapter needs for one upstream call.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequest {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub text: String,
    pub image_url: Option<String>,
    /// Provider-side conversation to continue (Dify only).
    pub platform_conversation_id: Option<String>,
    /// Prior turns, oldest first (stateless providers only).
    pub history: Vec<ChatMessage>,
    /// Caller identity as the provider should see it.
    pub user: Option<String>,
}

/// Which adapter serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Dify,
    SiliconFlowText,
    SiliconFlowVlm,
}

impl AdapterKind {
    /// Image requests always go to the SiliconFlow VLM endpoint, the only
    /// multimodal provider; text requests follow the app's platform.
    pub fn select(platform: Platform, has_image: bool) -> Self {
        match (platform, has_image) {
            (_, true) => AdapterKind::SiliconFlowVlm,
            (Platform::Dify, false) => AdapterKind::Dify,
            (Platform::SiliconFlow, false) => AdapterKind::SiliconFlowText,
        }
    }

    /// Whether the provider needs the message history sent with each call.
    pub fn is_stateless(&self) -> bool {
        !matches!(self, AdapterKind::Dify)
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Dify => write!(f, "dify"),
            AdapterKind::SiliconFlowText => write!(f, "siliconflow"),
            AdapterKind::SiliconFlowVlm => write!(f, "siliconflow-vlm"),
        }
    }
}

/// One upstream provider protocol.
pub trait ChatAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Open the upstream stream for `request`.
    fn open_stream(&self, request: UpstreamRequest) -> ChunkStream;
}

/// The adapter for each [`AdapterKind`].
#[derive(Clone)]
pub struct AdapterSet {
    dify: Arc<dyn ChatAdapter>,
    siliconflow_text: Arc<dyn ChatAdapter>,
    siliconflow_vlm: Arc<dyn ChatAdapter>,
}

impl AdapterSet {
    pub fn new(
        dify: Arc<dyn ChatAdapter>,
        siliconflow_text: Arc<dyn ChatAdapter>,
        siliconflow_vlm: Arc<dyn ChatAdapter>,
    ) -> Self {
        Self {
            dify,
            siliconflow_text,
            siliconflow_vlm,
        }
    }

    /// Real HTTP adapters sharing one client.
    pub fn http(client: Client, settings: &ProviderSettings) -> Self {
        Self::new(
            Arc::new(DifyAdapter::new(client.clone())),
            Arc::new(SiliconFlowTextAdapter::new(client.clone())),
            Arc::new(SiliconFlowVlmAdapter::new(client, settings.vlm_url())),
        )
    }

    pub fn get(&self, kind: AdapterKind) -> Arc<dyn ChatAdapter> {
        match kind {
            AdapterKind::Dify => self.dify.clone(),
            AdapterKind::SiliconFlowText => self.siliconflow_text.clone(),
            AdapterKind::SiliconFlowVlm => self.siliconflow_vlm.clone(),
        }
    }
}

/// What one payload line means to a provider parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Chunk(ChatChunk),
    /// A well-formed event the pipeline does not care about.
    Ignore,
    /// End-of-stream sentinel.
    Done,
}

/// Parses one payload line. `Err` means the line is malformed and skipped.
pub type LineParser = fn(&str) -> Result<LineOutcome>;

/// POST `body` as a streaming request and run every response line through
/// `parse`.
///
/// Connection failures, non-2xx statuses, and body read errors end the
/// stream with one `Err`. Malformed lines are logged and skipped.
pub(crate) fn stream_lines(
    client: Client,
    kind: AdapterKind,
    url: String,
    api_key: String,
    body: serde_json::Value,
    parse: LineParser,
) -> ChunkStream {
    Box::pin(async_stream::stream! {
        debug!("[{}] POST {}", kind, url);

        let response = match client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", api_key))
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("[{}] request failed: {}", kind, e);
                yield Err(Error::Upstream(format!("Request failed: {}", e)));
                return;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("[{}] upstream returned {}: {}", kind, status, body);
            yield Err(Error::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
            return;
        }

        let mut upstream = response.bytes_stream();
        let mut framer = LineFramer::default();

        loop {
            let lines = match upstream.next().await {
                Some(Ok(bytes)) => framer.push(&bytes),
                Some(Err(e)) => {
                    error!("[{}] stream read error: {}", kind, e);
                    yield Err(Error::Upstream(format!("Stream read error: {}", e)));
                    return;
                }
                None => framer.finish(),
            };

            for line in lines {
                match parse(&line) {
                    Ok(LineOutcome::Chunk(chunk)) => yield Ok(chunk),
                    Ok(LineOutcome::Ignore) => {}
                    Ok(LineOutcome::Done) => {
                        debug!("[{}] end-of-stream marker", kind);
                        return;
                    }
                    Err(e) => warn!("[{}] skipping line: {} (raw: '{}')", kind, e, line),
                }
            }

            if framer.is_finished() {
                debug!("[{}] upstream stream complete", kind);
                break;
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Minimal upstream server for adapter tests.

    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::Router;

    /// Request details seen by the fake upstream.
    #[derive(Default)]
    pub struct Captured {
        pub body: Mutex<Option<serde_json::Value>>,
        pub authorization: Mutex<Option<String>>,
        pub accept: Mutex<Option<String>>,
    }

    /// Serve `reply` with `status` on `route`; returns the base URL.
    pub async fn spawn_upstream(
        route: &'static str,
        status: StatusCode,
        reply: &'static str,
    ) -> (String, Arc<Captured>) {
        let captured = Arc::new(Captured::default());
        let state = captured.clone();
        let app = Router::new().route(
            route,
            post(move |headers: HeaderMap, body: String| {
                let state = state.clone();
                async move {
                    *state.body.lock().unwrap() = serde_json::from_str(&body).ok();
                    *state.authorization.lock().unwrap() = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *state.accept.lock().unwrap() = headers
                        .get("accept")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let response: Response = (status, Body::from(reply)).into_response();
                    response
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), captured)
    }
}
