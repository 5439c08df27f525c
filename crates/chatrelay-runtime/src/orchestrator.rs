//! Orchestrator: resolves the app, opens the upstream stream, relays events
//! to the caller, and hands the captured chunks to the persister exactly once.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use chatrelay_chat::{
    AdapterKind, AdapterSet, ChatChunk, ChatEvent, ChatMessage, ChatRequest, UpstreamRequest,
};
use chatrelay_core::{AppConfig, Error, Result};
use chatrelay_store::SqliteStore;

use crate::persister::TranscriptPersister;
use crate::types::{PersistOutcome, RuntimeOptions, TurnContext};

/// Events relayed to the caller. An `Err` item is terminal.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChatEvent>> + Send>>;

/// A running turn.
pub struct ChatTurn {
    pub trace_id: String,
    pub events: EventStream,
    /// Resolves once the transcript write has finished (or been skipped).
    pub persisted: oneshot::Receiver<PersistOutcome>,
}

/// Upstream context for a turn, loaded from an existing conversation.
#[derive(Debug, Default)]
struct UpstreamContext {
    platform_conversation_id: Option<String>,
    history: Vec<ChatMessage>,
}

pub struct Orchestrator {
    store: Arc<SqliteStore>,
    adapters: AdapterSet,
    persister: Arc<TranscriptPersister>,
    options: RuntimeOptions,
}

impl Orchestrator {
    pub fn new(store: Arc<SqliteStore>, adapters: AdapterSet, options: RuntimeOptions) -> Self {
        let persister = Arc::new(TranscriptPersister::new(
            store.clone(),
            options.system_user_id,
        ));
        info!(
            "Orchestrator initialized: system_user={}, dify_default_user={}",
            options.system_user_id, options.dify_default_user
        );
        Self {
            store,
            adapters,
            persister,
            options,
        }
    }

    /// Start a chat turn.
    ///
    /// Fails with [`Error::ConfigNotFound`] before any upstream call when the
    /// app code is unknown. Every later failure arrives on `events`.
    pub async fn stream_chat(&self, request: ChatRequest) -> Result<ChatTurn> {
        let trace_id = uuid::Uuid::new_v4().to_string();

        let app = self.load_app(&request.app_code).await?;
        let kind = AdapterKind::select(app.platform, request.image.is_some());
        info!(
            "[{}] chat turn: app={}, adapter={}, user={:?}, conversation={:?}",
            trace_id,
            app.app_code,
            kind,
            request.user_id,
            request.conversation_ref()
        );

        let context = self.load_context(&trace_id, kind, &request).await?;
        let upstream_request = self.upstream_request(&app, &request, kind, context);
        let upstream = self.adapters.get(kind).open_stream(upstream_request);

        let (done, persisted) = oneshot::channel();
        let recorder = TurnRecorder::new(
            TurnContext {
                trace_id: trace_id.clone(),
                request,
                app,
            },
            self.persister.clone(),
            done,
        );

        let events: EventStream = Box::pin(async_stream::stream! {
            let mut recorder = recorder;
            let mut upstream = upstream;
            let mut failure = None;

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        let event = ChatEvent::from(&chunk);
                        recorder.record(chunk);
                        yield Ok(event);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            drop(upstream);

            match failure {
                Some(e) => {
                    warn!("[{}] upstream failed after {} chunks: {}", recorder.trace_id(), recorder.len(), e);
                    recorder.finish();
                    yield Err(e);
                }
                None => {
                    debug!("[{}] upstream complete with {} chunks", recorder.trace_id(), recorder.len());
                    recorder.finish();
                }
            }
        });

        Ok(ChatTurn {
            trace_id,
            events,
            persisted,
        })
    }

    async fn load_app(&self, app_code: &str) -> Result<AppConfig> {
        let store = self.store.clone();
        let code = app_code.to_string();
        let app = tokio::task::spawn_blocking(move || store.get_app_config(&code))
            .await
            .map_err(|e| Error::Internal(format!("App lookup task failed: {}", e)))??;

        app.ok_or_else(|| {
            warn!("Unknown app code: {}", app_code);
            Error::ConfigNotFound(app_code.to_string())
        })
    }

    /// Load the provider-side conversation id and, for stateless providers,
    /// the stored history of the conversation the caller is continuing.
    async fn load_context(
        &self,
        trace_id: &str,
        kind: AdapterKind,
        request: &ChatRequest,
    ) -> Result<UpstreamContext> {
        let Some(raw) = request.conversation_ref() else {
            return Ok(UpstreamContext::default());
        };
        let Ok(id) = raw.parse::<i64>() else {
            warn!("[{}] conversation id '{}' is not an internal id, starting fresh", trace_id, raw);
            return Ok(UpstreamContext::default());
        };

        let store = self.store.clone();
        let user_id = request.user_id.unwrap_or(self.options.system_user_id);
        let with_history = kind.is_stateless();
        let trace = trace_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<UpstreamContext> {
            let Some(conversation) = store.get_conversation(id)? else {
                warn!("[{}] conversation {} not found, starting fresh", trace, id);
                return Ok(UpstreamContext::default());
            };
            if conversation.user_id != user_id {
                warn!(
                    "[{}] conversation {} is not owned by user {}, starting fresh",
                    trace, id, user_id
                );
                return Ok(UpstreamContext::default());
            }

            let history = if with_history {
                store
                    .get_messages(id)?
                    .into_iter()
                    .map(|m| ChatMessage::new(m.role.as_str(), m.content))
                    .collect()
            } else {
                Vec::new()
            };
            debug!(
                "[{}] continuing conversation {} ({} history messages)",
                trace,
                id,
                history.len()
            );
            Ok(UpstreamContext {
                platform_conversation_id: conversation.platform_conversation_id,
                history,
            })
        })
        .await
        .map_err(|e| Error::Internal(format!("Context task failed: {}", e)))?
    }

    fn upstream_request(
        &self,
        app: &AppConfig,
        request: &ChatRequest,
        kind: AdapterKind,
        context: UpstreamContext,
    ) -> UpstreamRequest {
        let user = match request.user_id {
            Some(id) => format!("user-{}", id),
            None => self.options.dify_default_user.clone(),
        };
        UpstreamRequest {
            api_url: app.api_url.clone(),
            api_key: app.api_key.clone(),
            model: app.model_name.clone(),
            system_prompt: app.system_prompt.clone(),
            text: request.text.clone(),
            image_url: request.image.as_ref().map(|i| i.to_image_url()),
            platform_conversation_id: match kind {
                AdapterKind::Dify => context.platform_conversation_id,
                _ => None,
            },
            history: context.history,
            user: Some(user),
        }
    }
}

/// Per-turn chunk buffer that fires the persister exactly once: on
/// [`finish`](Self::finish), or on drop when the caller abandons the stream.
struct TurnRecorder {
    pending: Option<(TurnContext, oneshot::Sender<PersistOutcome>)>,
    trace_id: String,
    chunks: Vec<ChatChunk>,
    persister: Arc<TranscriptPersister>,
}

impl TurnRecorder {
    fn new(
        ctx: TurnContext,
        persister: Arc<TranscriptPersister>,
        done: oneshot::Sender<PersistOutcome>,
    ) -> Self {
        Self {
            trace_id: ctx.trace_id.clone(),
            pending: Some((ctx, done)),
            chunks: Vec::new(),
            persister,
        }
    }

    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn len(&self) -> usize {
        self.chunks.len()
    }

    fn record(&mut self, chunk: ChatChunk) {
        self.chunks.push(chunk);
    }

    fn finish(&mut self) {
        if let Some((ctx, done)) = self.pending.take() {
            let chunks = std::mem::take(&mut self.chunks);
            self.persister.clone().persist_detached(ctx, chunks, done);
        }
    }
}

impl Drop for TurnRecorder {
    fn drop(&mut self) {
        if self.pending.is_some() {
            info!(
                "[{}] caller went away after {} chunks, persisting what was captured",
                self.trace_id,
                self.chunks.len()
            );
            self.finish();
        }
    }
}
