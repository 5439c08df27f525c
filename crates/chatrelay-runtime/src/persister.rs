//! Transcript persister: turns a finished turn's chunk buffer into one
//! user message and one assistant message, written as a single unit of work.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use chatrelay_chat::ChatChunk;
use chatrelay_core::Result;
use chatrelay_store::{
    Conversation, NewConversation, NewMessage, Role, SqliteStore, TokenUsage, UnitOfWork,
};

use crate::types::{PersistOutcome, TurnContext};

/// Values derived from the chunk buffer before touching storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSummary {
    pub answer: String,
    pub platform_conversation_id: Option<String>,
    pub usage: TokenUsage,
}

impl TurnSummary {
    /// Fold chunks in arrival order.
    pub fn from_chunks(chunks: &[ChatChunk]) -> Self {
        let mut answer = String::new();
        let mut platform_conversation_id = None;
        let mut usage = TokenUsage::default();

        for chunk in chunks {
            if let Some(delta) = &chunk.answer {
                answer.push_str(delta);
            }
            if platform_conversation_id.is_none() {
                platform_conversation_id = chunk
                    .conversation_id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .map(str::to_string);
            }
            usage.prompt += chunk.prompt_tokens.map(i64::from).unwrap_or(0);
            usage.completion += chunk.completion_tokens.map(i64::from).unwrap_or(0);
        }

        Self {
            answer,
            platform_conversation_id,
            usage,
        }
    }
}

pub struct TranscriptPersister {
    store: Arc<SqliteStore>,
    system_user_id: i64,
}

impl TranscriptPersister {
    pub fn new(store: Arc<SqliteStore>, system_user_id: i64) -> Self {
        Self {
            store,
            system_user_id,
        }
    }

    /// Write the turn. Blocking; call from the blocking pool.
    pub fn persist(&self, ctx: &TurnContext, chunks: &[ChatChunk]) -> Result<PersistOutcome> {
        let summary = TurnSummary::from_chunks(chunks);
        if summary.answer.is_empty() {
            info!(
                "[{}] no answer text in {} chunks, nothing persisted",
                ctx.trace_id,
                chunks.len()
            );
            return Ok(PersistOutcome::Skipped);
        }

        let user_id = match ctx.request.user_id {
            Some(id) => id,
            None => {
                warn!(
                    "[{}] request has no user id, recording turn under system user {}",
                    ctx.trace_id, self.system_user_id
                );
                self.system_user_id
            }
        };

        self.store.unit_of_work(|uow| {
            let conversation = self.resolve_conversation(uow, ctx, &summary, user_id)?;

            let user_message_id = uow.insert_message(NewMessage {
                conversation_id: conversation.id,
                role: Role::User,
                content: &ctx.request.text,
                usage: None,
            })?;
            let assistant_message_id = uow.insert_message(NewMessage {
                conversation_id: conversation.id,
                role: Role::Assistant,
                content: &summary.answer,
                usage: Some(summary.usage),
            })?;
            uow.touch_conversation(conversation.id)?;

            info!(
                "[{}] saved turn: conversation={}, messages=({}, {}), tokens={}",
                ctx.trace_id,
                conversation.id,
                user_message_id,
                assistant_message_id,
                summary.usage.total()
            );

            Ok(PersistOutcome::Saved {
                conversation_id: conversation.id,
                user_message_id,
                assistant_message_id,
                total_tokens: summary.usage.total(),
            })
        })
    }

    fn resolve_conversation(
        &self,
        uow: &UnitOfWork<'_>,
        ctx: &TurnContext,
        summary: &TurnSummary,
        user_id: i64,
    ) -> Result<Conversation> {
        let platform_id = summary.platform_conversation_id.as_deref();

        if let Some(raw) = ctx.request.conversation_ref() {
            match raw.parse::<i64>() {
                Ok(id) => match uow.find_conversation(id)? {
                    Some(existing) if existing.user_id == user_id => {
                        if let Some(pid) = platform_id {
                            self.record_platform_id(uow, ctx, &existing, pid)?;
                        }
                        debug!("[{}] appending to conversation {}", ctx.trace_id, id);
                        return Ok(existing);
                    }
                    Some(existing) => warn!(
                        "[{}] conversation {} belongs to user {}, not {}; starting a new one",
                        ctx.trace_id, id, existing.user_id, user_id
                    ),
                    None => warn!(
                        "[{}] conversation {} not found; starting a new one",
                        ctx.trace_id, id
                    ),
                },
                Err(_) => warn!(
                    "[{}] conversation id '{}' is not an internal id; starting a new one",
                    ctx.trace_id, raw
                ),
            }
        }

        let created = uow.create_conversation(NewConversation {
            app_code: &ctx.app.app_code,
            platform_conversation_id: platform_id,
            user_id,
        })?;
        info!(
            "[{}] created conversation {} for app {} (user {})",
            ctx.trace_id, created.id, created.app_code, user_id
        );
        Ok(created)
    }

    fn record_platform_id(
        &self,
        uow: &UnitOfWork<'_>,
        ctx: &TurnContext,
        conversation: &Conversation,
        platform_id: &str,
    ) -> Result<()> {
        match conversation.platform_conversation_id.as_deref() {
            Some(stored) if stored == platform_id => {}
            Some(stored) => warn!(
                "[{}] upstream reported conversation '{}' but {} is bound to '{}'; keeping stored id",
                ctx.trace_id, platform_id, conversation.id, stored
            ),
            None => {
                if uow.assign_platform_conversation_id(conversation.id, platform_id)? {
                    debug!(
                        "[{}] bound conversation {} to upstream '{}'",
                        ctx.trace_id, conversation.id, platform_id
                    );
                }
            }
        }
        Ok(())
    }

    /// Persist on the blocking pool and report the outcome on `done`.
    ///
    /// Errors are logged and reported as [`PersistOutcome::Failed`]; they
    /// never reach the caller's event stream. Falls back to running inline
    /// when no tokio runtime is available (e.g. during runtime shutdown).
    pub fn persist_detached(
        self: Arc<Self>,
        ctx: TurnContext,
        chunks: Vec<ChatChunk>,
        done: oneshot::Sender<PersistOutcome>,
    ) {
        let run = move || {
            let outcome = match self.persist(&ctx, &chunks) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("[{}] failed to persist turn: {}", ctx.trace_id, e);
                    PersistOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            let _ = done.send(outcome);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(run);
            }
            Err(_) => run(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_chat::ChatRequest;
    use chatrelay_core::{AppConfig, Platform};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<SqliteStore>, TranscriptPersister) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
        let persister = TranscriptPersister::new(store.clone(), 1);
        (dir, store, persister)
    }

    fn ctx(request: ChatRequest) -> TurnContext {
        TurnContext {
            trace_id: "test".into(),
            request,
            app: AppConfig {
                app_code: "health-bot".into(),
                app_name: "Health Bot".into(),
                platform: Platform::Dify,
                model_name: String::new(),
                system_prompt: None,
                api_url: "http://dify.local/v1".into(),
                api_key: "app-key".into(),
            },
        }
    }

    fn dify_chunks() -> Vec<ChatChunk> {
        vec![
            ChatChunk::answer("Hello"),
            ChatChunk::answer(" world"),
            ChatChunk {
                prompt_tokens: Some(5),
                completion_tokens: Some(2),
                ..Default::default()
            },
            ChatChunk {
                conversation_id: Some("dify-123".into()),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_dify_turn_is_saved() {
        let (_dir, store, persister) = setup();
        let request = ChatRequest::text("health-bot", "hi").with_user(7);

        let outcome = persister.persist(&ctx(request), &dify_chunks()).unwrap();
        let PersistOutcome::Saved {
            conversation_id,
            total_tokens,
            ..
        } = outcome
        else {
            panic!("expected saved, got {:?}", outcome);
        };
        assert_eq!(total_tokens, 7);

        let conversation = store.get_conversation(conversation_id).unwrap().unwrap();
        assert_eq!(conversation.platform_conversation_id.as_deref(), Some("dify-123"));
        assert_eq!(conversation.user_id, 7);
        assert_eq!(conversation.app_code, "health-bot");

        let messages = store.get_messages(conversation_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[0].total_tokens, None);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello world");
        assert_eq!(messages[1].prompt_tokens, Some(5));
        assert_eq!(messages[1].completion_tokens, Some(2));
        assert_eq!(messages[1].total_tokens, Some(7));
    }

    #[test]
    fn test_tokens_summed_across_chunks() {
        let (_dir, store, persister) = setup();
        let chunks = vec![
            ChatChunk {
                message_id: Some("sf-1".into()),
                prompt_tokens: Some(10),
                ..Default::default()
            },
            ChatChunk::answer("Hi"),
            ChatChunk {
                completion_tokens: Some(3),
                ..Default::default()
            },
        ];
        let request = ChatRequest::text("health-bot", "hello").with_user(1);
        let outcome = persister.persist(&ctx(request), &chunks).unwrap();
        let PersistOutcome::Saved {
            conversation_id,
            total_tokens,
            ..
        } = outcome
        else {
            panic!("expected saved");
        };
        assert_eq!(total_tokens, 13);
        let messages = store.get_messages(conversation_id).unwrap();
        assert_eq!(messages[1].content, "Hi");
        assert_eq!(
            store
                .get_conversation(conversation_id)
                .unwrap()
                .unwrap()
                .platform_conversation_id,
            None
        );
    }

    #[test]
    fn test_empty_answer_writes_nothing() {
        let (_dir, store, persister) = setup();
        let chunks = vec![ChatChunk {
            conversation_id: Some("dify-1".into()),
            prompt_tokens: Some(4),
            ..Default::default()
        }];
        let request = ChatRequest::text("health-bot", "hi").with_user(1);

        assert_eq!(
            persister.persist(&ctx(request.clone()), &chunks).unwrap(),
            PersistOutcome::Skipped
        );
        assert_eq!(
            persister.persist(&ctx(request), &[]).unwrap(),
            PersistOutcome::Skipped
        );
        assert_eq!(store.count_conversations().unwrap(), 0);
        assert_eq!(store.count_messages().unwrap(), 0);
    }

    #[test]
    fn test_existing_conversation_is_reused() {
        let (_dir, store, persister) = setup();
        let first = persister
            .persist(
                &ctx(ChatRequest::text("health-bot", "one").with_user(3)),
                &dify_chunks(),
            )
            .unwrap();
        let PersistOutcome::Saved { conversation_id, .. } = first else {
            panic!("expected saved");
        };

        let second_chunks = vec![
            ChatChunk::answer("again"),
            ChatChunk {
                conversation_id: Some("dify-999".into()),
                ..Default::default()
            },
        ];
        let request = ChatRequest::text("health-bot", "two")
            .with_user(3)
            .with_conversation(conversation_id.to_string());
        let second = persister.persist(&ctx(request), &second_chunks).unwrap();
        let PersistOutcome::Saved {
            conversation_id: reused,
            ..
        } = second
        else {
            panic!("expected saved");
        };

        assert_eq!(reused, conversation_id);
        assert_eq!(store.count_conversations().unwrap(), 1);
        let messages = store.get_messages(conversation_id).unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "Hello world", "two", "again"]);

        // The first upstream id stays bound.
        let conversation = store.get_conversation(conversation_id).unwrap().unwrap();
        assert_eq!(conversation.platform_conversation_id.as_deref(), Some("dify-123"));
        assert_eq!(conversation.user_id, 3);
    }

    #[test]
    fn test_platform_id_filled_when_missing() {
        let (_dir, store, persister) = setup();
        let first = persister
            .persist(
                &ctx(ChatRequest::text("health-bot", "one").with_user(3)),
                &[ChatChunk::answer("a")],
            )
            .unwrap();
        let PersistOutcome::Saved { conversation_id, .. } = first else {
            panic!("expected saved");
        };
        assert_eq!(
            store
                .get_conversation(conversation_id)
                .unwrap()
                .unwrap()
                .platform_conversation_id,
            None
        );

        let request = ChatRequest::text("health-bot", "two")
            .with_user(3)
            .with_conversation(conversation_id.to_string());
        persister.persist(&ctx(request), &dify_chunks()).unwrap();
        assert_eq!(
            store
                .get_conversation(conversation_id)
                .unwrap()
                .unwrap()
                .platform_conversation_id
                .as_deref(),
            Some("dify-123")
        );
    }

    #[test]
    fn test_unknown_conversation_creates_new() {
        let (_dir, store, persister) = setup();
        let request = ChatRequest::text("health-bot", "hi")
            .with_user(2)
            .with_conversation("9999");
        let outcome = persister.persist(&ctx(request), &dify_chunks()).unwrap();
        let PersistOutcome::Saved { conversation_id, .. } = outcome else {
            panic!("expected saved");
        };
        assert_ne!(conversation_id, 9999);
        assert_eq!(store.count_conversations().unwrap(), 1);

        let request = ChatRequest::text("health-bot", "hi")
            .with_user(2)
            .with_conversation("not-a-number");
        assert!(persister
            .persist(&ctx(request), &dify_chunks())
            .unwrap()
            .is_saved());
        assert_eq!(store.count_conversations().unwrap(), 2);
    }

    #[test]
    fn test_foreign_conversation_not_reused() {
        let (_dir, store, persister) = setup();
        let owned = persister
            .persist(
                &ctx(ChatRequest::text("health-bot", "mine").with_user(1)),
                &dify_chunks(),
            )
            .unwrap();
        let PersistOutcome::Saved { conversation_id, .. } = owned else {
            panic!("expected saved");
        };

        let request = ChatRequest::text("health-bot", "theirs")
            .with_user(2)
            .with_conversation(conversation_id.to_string());
        let outcome = persister.persist(&ctx(request), &dify_chunks()).unwrap();
        let PersistOutcome::Saved {
            conversation_id: other,
            ..
        } = outcome
        else {
            panic!("expected saved");
        };
        assert_ne!(other, conversation_id);
        assert_eq!(store.get_messages(conversation_id).unwrap().len(), 2);
        assert_eq!(store.get_conversation(other).unwrap().unwrap().user_id, 2);
    }

    #[test]
    fn test_missing_user_falls_back_to_system_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
        let persister = TranscriptPersister::new(store.clone(), 42);

        let outcome = persister
            .persist(&ctx(ChatRequest::text("health-bot", "hi")), &dify_chunks())
            .unwrap();
        let PersistOutcome::Saved { conversation_id, .. } = outcome else {
            panic!("expected saved");
        };
        assert_eq!(store.get_conversation(conversation_id).unwrap().unwrap().user_id, 42);
    }

    #[test]
    fn test_summary_takes_first_platform_id() {
        let chunks = vec![
            ChatChunk {
                conversation_id: Some(String::new()),
                ..Default::default()
            },
            ChatChunk {
                conversation_id: Some("first".into()),
                ..Default::default()
            },
            ChatChunk {
                conversation_id: Some("second".into()),
                answer: Some("x".into()),
                ..Default::default()
            },
        ];
        let summary = TurnSummary::from_chunks(&chunks);
        assert_eq!(summary.platform_conversation_id.as_deref(), Some("first"));
        assert_eq!(summary.answer, "x");
        assert_eq!(summary.usage, TokenUsage::default());
    }

    #[tokio::test]
    async fn test_failed_assistant_insert_rolls_back_turn() {
        let (dir, store, persister) = setup();
        let conn = rusqlite::Connection::open(dir.path().join("chatrelay.db")).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_assistant BEFORE INSERT ON messages
             WHEN NEW.role = 'assistant'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
        drop(conn);

        let request = ChatRequest::text("health-bot", "hi").with_user(1);
        assert!(persister.persist(&ctx(request.clone()), &dify_chunks()).is_err());
        assert_eq!(store.count_conversations().unwrap(), 0);
        assert_eq!(store.count_messages().unwrap(), 0);

        let (tx, rx) = oneshot::channel();
        Arc::new(persister).persist_detached(ctx(request), dify_chunks(), tx);
        let PersistOutcome::Failed { error } = rx.await.unwrap() else {
            panic!("expected a failed outcome");
        };
        assert!(error.contains("disk full"));
        assert_eq!(store.count_messages().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persist_detached_reports_outcome() {
        let (_dir, store, persister) = setup();
        let (tx, rx) = oneshot::channel();
        Arc::new(persister).persist_detached(
            ctx(ChatRequest::text("health-bot", "hi").with_user(1)),
            dify_chunks(),
            tx,
        );
        let outcome = rx.await.unwrap();
        assert!(outcome.is_saved());
        assert_eq!(store.count_messages().unwrap(), 2);
    }
}
