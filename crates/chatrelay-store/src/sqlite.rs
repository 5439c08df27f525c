//! SQLite-backed store for the app registry and chat transcripts.
//!
//! A single connection guarded by a mutex serves all requests. Callers on an
//! async executor are expected to reach it through `spawn_blocking`.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::schema::{APP_SCHEMA_SQL, TRANSCRIPT_SCHEMA_SQL};
use crate::types::*;
use crate::unit_of_work::UnitOfWork;
use chatrelay_core::{AppConfig, AppSummary, Error, Platform, Result};

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SQLite store for app configs, conversations, and messages.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open or create the SQLite store.
    ///
    /// `db_dir` is the directory (e.g., `data/db/`). The file will be `db_dir/chatrelay.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir)?;
        let db_path = db_dir.join("chatrelay.db");

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        info!(
            "SqliteStore initialized: {} conversations, {} messages, path={}",
            store.count_conversations()?,
            store.count_messages()?,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}", APP_SCHEMA_SQL, TRANSCRIPT_SCHEMA_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    /// Run `work` inside one transaction.
    ///
    /// Commits when `work` returns `Ok`; any `Err` rolls the whole unit back.
    pub fn unit_of_work<T>(&self, work: impl FnOnce(&UnitOfWork<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("Begin failed: {}", e)))?;
        let uow = UnitOfWork::new(tx);
        let value = work(&uow)?;
        uow.commit()?;
        Ok(value)
    }

    // ---------------------------------------------------------------
    // App registry
    // ---------------------------------------------------------------

    /// Insert or update an app config keyed by app code.
    pub fn upsert_app_config(&self, app: &AppConfig) -> Result<()> {
        let now = now_millis();
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO app_configs (app_code, app_name, platform, model_name, system_prompt, \
             api_url, api_key, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
             ON CONFLICT(app_code) DO UPDATE SET \
             app_name = excluded.app_name, platform = excluded.platform, \
             model_name = excluded.model_name, system_prompt = excluded.system_prompt, \
             api_url = excluded.api_url, api_key = excluded.api_key, \
             updated_at = excluded.updated_at",
        )
        .map_err(|e| Error::Database(e.to_string()))?
        .execute(params![
            app.app_code,
            app.app_name,
            app.platform.as_str(),
            app.model_name,
            app.system_prompt,
            app.api_url,
            app.api_key,
            now,
        ])
        .map_err(|e| Error::Database(e.to_string()))?;
        debug!("Upserted app config {}", app.app_code);
        Ok(())
    }

    /// Seed the registry from a list of configs. Returns how many were written.
    pub fn seed_apps(&self, apps: &[AppConfig]) -> Result<usize> {
        for app in apps {
            self.upsert_app_config(app)?;
        }
        Ok(apps.len())
    }

    /// Look up an app config by app code.
    pub fn get_app_config(&self, app_code: &str) -> Result<Option<AppConfig>> {
        let conn = self.conn.lock();
        let row = conn
            .prepare_cached("SELECT * FROM app_configs WHERE app_code = ?1")
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![app_code], |row| Ok(Self::row_to_app_config(row)))
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        row.transpose()
    }

    /// All registered apps, without credentials.
    pub fn list_apps(&self) -> Result<Vec<AppSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM app_configs ORDER BY app_code")
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Self::row_to_app_config(row).map(|app| AppSummary {
                    app_code: app.app_code,
                    app_name: app.app_name,
                    model_name: app.model_name,
                    platform: app.platform,
                    created_at: row.get("created_at").unwrap_or(0),
                    updated_at: row.get("updated_at").unwrap_or(0),
                }))
            })
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.filter_map(|r| r.ok()).collect()
    }

    // ---------------------------------------------------------------
    // Conversations and messages (read side)
    // ---------------------------------------------------------------

    /// Get a conversation by ID.
    pub fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        let row = conn
            .prepare_cached("SELECT * FROM conversations WHERE id = ?1")
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![id], |row| Ok(Self::row_to_conversation(row)))
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row)
    }

    /// All messages of a conversation in the order they were written.
    pub fn get_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![conversation_id], |row| Ok(Self::row_to_message(row)))
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// A user's conversations for one app, most recently updated first.
    pub fn list_conversations(
        &self,
        app_code: &str,
        user_id: i64,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ConversationSummary>> {
        let page = page.max(1);
        let offset = (page - 1)
            .checked_mul(page_size)
            .and_then(|o| i64::try_from(o).ok())
            .ok_or_else(|| Error::InvalidRequest(format!("Page {} is out of range", page)))?;
        let limit = i64::try_from(page_size)
            .map_err(|_| Error::InvalidRequest(format!("Page size {} is out of range", page_size)))?;

        let conn = self.conn.lock();
        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversations WHERE app_code = ?1 AND user_id = ?2",
                params![app_code, user_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM conversations WHERE app_code = ?1 AND user_id = ?2 \
                 ORDER BY updated_at DESC, id DESC LIMIT ?3 OFFSET ?4",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(
                params![app_code, user_id, limit, offset],
                |row| Ok(Self::row_to_conversation(row)),
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let items = rows
            .filter_map(|r| r.ok())
            .map(|c| ConversationSummary::from(&c))
            .collect();

        Ok(Page {
            items,
            total,
            page,
            size: page_size,
        })
    }

    /// A conversation together with its messages.
    pub fn get_conversation_detail(&self, id: i64) -> Result<Option<ConversationDetail>> {
        let conversation = match self.get_conversation(id)? {
            Some(c) => c,
            None => return Ok(None),
        };
        let messages = self.get_messages(id)?;
        Ok(Some(ConversationDetail {
            id: conversation.id,
            title: conversation.title(),
            app_code: conversation.app_code,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            messages,
        }))
    }

    /// Count total conversations.
    pub fn count_conversations(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Count total messages.
    pub fn count_messages(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_app_config(row: &rusqlite::Row<'_>) -> Result<AppConfig> {
        let platform: String = row.get("platform").unwrap_or_default();
        Ok(AppConfig {
            app_code: row.get("app_code").unwrap_or_default(),
            app_name: row.get("app_name").unwrap_or_default(),
            platform: platform.parse::<Platform>()?,
            model_name: row.get("model_name").unwrap_or_default(),
            system_prompt: row.get("system_prompt").ok().flatten(),
            api_url: row.get("api_url").unwrap_or_default(),
            api_key: row.get("api_key").unwrap_or_default(),
        })
    }

    pub(crate) fn row_to_conversation(row: &rusqlite::Row<'_>) -> Conversation {
        Conversation {
            id: row.get("id").unwrap_or(0),
            app_code: row.get("app_code").unwrap_or_default(),
            platform_conversation_id: row.get("platform_conversation_id").ok().flatten(),
            user_id: row.get("user_id").unwrap_or(0),
            created_at: row.get("created_at").unwrap_or(0),
            updated_at: row.get("updated_at").unwrap_or(0),
        }
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> Message {
        let role: String = row.get("role").unwrap_or_default();
        Message {
            id: row.get("id").unwrap_or(0),
            conversation_id: row.get("conversation_id").unwrap_or(0),
            role: Role::parse(&role).unwrap_or(Role::User),
            content: row.get("content").unwrap_or_default(),
            prompt_tokens: row.get("prompt_tokens").ok().flatten(),
            completion_tokens: row.get("completion_tokens").ok().flatten(),
            total_tokens: row.get("total_tokens").ok().flatten(),
            created_at: row.get("created_at").unwrap_or(0),
        }
    }
}
