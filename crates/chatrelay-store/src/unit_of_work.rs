//! Transactional write scope for one chat turn.
//!
//! A [`UnitOfWork`] is handed out by [`SqliteStore::unit_of_work`]: the
//! transaction is opened before the closure runs, committed when the closure
//! returns `Ok`, and rolled back when it returns `Err` (or panics and the
//! transaction is dropped).
//!
//! [`SqliteStore::unit_of_work`]: crate::SqliteStore::unit_of_work

use rusqlite::{params, OptionalExtension, Transaction};

use crate::sqlite::{now_millis, SqliteStore};
use crate::types::*;
use chatrelay_core::{Error, Result};

pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> UnitOfWork<'conn> {
    pub(crate) fn new(tx: Transaction<'conn>) -> Self {
        Self { tx }
    }

    pub(crate) fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .map_err(|e| Error::Database(format!("Commit failed: {}", e)))
    }

    /// Load a conversation inside the transaction.
    pub fn find_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        self.tx
            .prepare_cached("SELECT * FROM conversations WHERE id = ?1")
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![id], |row| Ok(SqliteStore::row_to_conversation(row)))
            .optional()
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Insert a new conversation and return the stored row.
    pub fn create_conversation(&self, new: NewConversation<'_>) -> Result<Conversation> {
        let now = now_millis();
        let id = self
            .tx
            .prepare_cached(
                "INSERT INTO conversations (app_code, platform_conversation_id, user_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4)",
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .insert(params![new.app_code, new.platform_conversation_id, new.user_id, now])
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Conversation {
            id,
            app_code: new.app_code.to_string(),
            platform_conversation_id: new.platform_conversation_id.map(str::to_string),
            user_id: new.user_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Record the upstream conversation id, only if none is stored yet.
    ///
    /// Returns whether the row was updated.
    pub fn assign_platform_conversation_id(&self, id: i64, platform_id: &str) -> Result<bool> {
        let count = self
            .tx
            .execute(
                "UPDATE conversations SET platform_conversation_id = ?1 \
                 WHERE id = ?2 AND platform_conversation_id IS NULL",
                params![platform_id, id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count > 0)
    }

    /// Bump `updated_at` on a conversation.
    pub fn touch_conversation(&self, id: i64) -> Result<()> {
        self.tx
            .execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![now_millis(), id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Insert a message. Returns the new message ID.
    pub fn insert_message(&self, new: NewMessage<'_>) -> Result<i64> {
        let (prompt, completion, total) = match new.usage {
            Some(u) => (Some(u.prompt), Some(u.completion), Some(u.total())),
            None => (None, None, None),
        };
        let id = self
            .tx
            .prepare_cached(
                "INSERT INTO messages (conversation_id, role, content, prompt_tokens, \
                 completion_tokens, total_tokens, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .insert(params![
                new.conversation_id,
                new.role.as_str(),
                new.content,
                prompt,
                completion,
                total,
                now_millis(),
            ])
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(id)
    }
}
