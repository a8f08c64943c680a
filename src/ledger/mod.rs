//! Durable ledger of conversations and messages.
//!
//! The ledger is the single source of truth for the processing pipeline:
//! producers append user messages, the [`crate::processor::ChatProcessor`]
//! claims unprocessed ones and appends assistant replies, and readers build
//! context windows from processed rows only.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use rand::rngs::SysRng;
use rand::TryRng;
use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::db::{SqlitePool, SqlitePooledConn};
use crate::error::{Result, VesperError};

mod dedup;
mod schema;

pub use dedup::{content_fingerprint, normalize_content, DedupGuard, DEFAULT_DEDUP_WINDOW_SECS};
use schema::{conversations, messages};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
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
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = VesperError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(VesperError::InvalidInput(format!("unknown role `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: i32,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
    pub processed: bool,
    pub is_error: bool,
    pub parent_message_id: Option<i32>,
    pub content_fingerprint: String,
}

/// One `(role, content)` pair of a context window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextTurn {
    pub role: Role,
    pub content: String,
}

impl ContextTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A message that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub conversation_id: Option<String>,
    pub parent_message_id: Option<i32>,
    pub is_error: bool,
}

impl MessageDraft {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            conversation_id: None,
            parent_message_id: None,
            is_error: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn replying_to(mut self, parent_message_id: i32) -> Self {
        self.parent_message_id = Some(parent_message_id);
        self
    }

    pub fn as_error(mut self) -> Self {
        self.is_error = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsertedMessage {
    pub id: i32,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub total_messages: i64,
    pub processed_messages: i64,
    pub pending_user_messages: i64,
    pub total_user_messages: i64,
    pub total_assistant_messages: i64,
}

#[derive(Queryable)]
struct MessageRow {
    id: i32,
    conversation_id: String,
    role: String,
    content: String,
    created_at: i64,
    processed: bool,
    is_error: bool,
    parent_message_id: Option<i32>,
    content_fingerprint: String,
}

#[derive(Queryable)]
struct ConversationRow {
    id: String,
    title: Option<String>,
    status: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
struct NewMessageRow<'a> {
    conversation_id: &'a str,
    role: &'a str,
    content: &'a str,
    created_at: i64,
    processed: bool,
    is_error: bool,
    parent_message_id: Option<i32>,
    content_fingerprint: &'a str,
}

#[derive(Insertable)]
#[diesel(table_name = conversations)]
struct NewConversationRow<'a> {
    id: &'a str,
    title: Option<&'a str>,
    status: &'a str,
    created_at: i64,
    updated_at: i64,
}

#[derive(Clone)]
pub struct MessageStoreConfig {
    pub sqlite_path: String,
    pub pool_size: u32,
    pub dedup_window: Duration,
    pub clock: Arc<dyn Clock>,
}

impl MessageStoreConfig {
    pub fn new(sqlite_path: impl Into<String>) -> Self {
        Self {
            sqlite_path: sqlite_path.into(),
            pool_size: crate::config::DEFAULT_POOL_SIZE,
            dedup_window: Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }
}

/// Handle to the message ledger. Cheap to clone; every operation checks out
/// its own pooled connection, so clones can be used from any task.
#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
    write_gate: Arc<tokio::sync::Mutex<()>>,
    dedup: DedupGuard,
    clock: Arc<dyn Clock>,
}

impl MessageStore {
    pub async fn new(sqlite_path: impl AsRef<str>) -> Result<Self> {
        Self::open(MessageStoreConfig::new(sqlite_path.as_ref())).await
    }

    pub async fn open(config: MessageStoreConfig) -> Result<Self> {
        crate::db::prepare_database(&config.sqlite_path).await?;
        let pool = crate::db::build_pool(&config.sqlite_path, config.pool_size).await?;
        Ok(Self {
            pool,
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
            dedup: DedupGuard::new(config.dedup_window),
            clock: config.clock,
        })
    }

    /// Appends a message. Returns `Ok(None)` when the dedup guard suppressed
    /// it; callers treat that as "already recorded".
    ///
    /// User messages start unprocessed, assistant messages are written
    /// processed. A missing conversation id gets a fresh one, and the
    /// conversation's `updated_at` is bumped on every insert.
    pub async fn add_message(&self, draft: MessageDraft) -> Result<Option<InsertedMessage>> {
        if draft.content.trim().is_empty() {
            return Err(VesperError::InvalidInput(
                "message content must not be empty".to_string(),
            ));
        }
        let conversation_id = match draft
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(id) => id.to_string(),
            None => new_conversation_id()?,
        };
        let fingerprint = content_fingerprint(&draft.content);

        let _write_guard = self.write_gate.lock().await;
        let now = self.clock.now_millis();
        let mut conn = self.conn().await?;

        let admitted = self
            .dedup
            .admits(
                &mut conn,
                &conversation_id,
                draft.role,
                &draft.content,
                &fingerprint,
                now,
            )
            .await?;
        if !admitted {
            debug!(
                conversation_id = %conversation_id,
                role = %draft.role,
                "duplicate message suppressed"
            );
            return Ok(None);
        }

        touch_conversation(&mut conn, &conversation_id, now).await?;

        let row = NewMessageRow {
            conversation_id: &conversation_id,
            role: draft.role.as_str(),
            content: &draft.content,
            created_at: now,
            processed: draft.role == Role::Assistant,
            is_error: draft.is_error,
            parent_message_id: draft.parent_message_id,
            content_fingerprint: &fingerprint,
        };
        diesel::insert_into(messages::table)
            .values(&row)
            .execute(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        let id = crate::db::last_insert_id(&mut conn).await?;

        debug!(
            message_id = id,
            conversation_id = %conversation_id,
            role = %draft.role,
            "message stored"
        );
        Ok(Some(InsertedMessage {
            id,
            conversation_id,
        }))
    }

    pub async fn get_message(&self, id: i32) -> Result<Option<Message>> {
        let mut conn = self.conn().await?;
        let row = messages::table
            .find(id)
            .first::<MessageRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        row.map(map_message).transpose()
    }

    /// Unprocessed, non-error user messages, oldest first.
    pub async fn get_unprocessed(
        &self,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut query = messages::table
            .filter(messages::role.eq(Role::User.as_str()))
            .filter(messages::processed.eq(false))
            .filter(messages::is_error.eq(false))
            .into_boxed();
        if let Some(conversation_id) = conversation_id {
            query = query.filter(messages::conversation_id.eq(conversation_id));
        }

        let rows: Vec<MessageRow> = query
            .order(messages::created_at.asc())
            .then_order_by(messages::id.asc())
            .limit(sql_limit(limit))
            .load(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        rows.into_iter().map(map_message).collect()
    }

    /// Idempotent: an already processed message reports `true` without
    /// writing; an unknown id reports `false`.
    pub async fn mark_processed(&self, id: i32) -> Result<bool> {
        let mut conn = self.conn().await?;
        let current = messages::table
            .find(id)
            .select(messages::processed)
            .first::<bool>(&mut conn)
            .await
            .optional()
            .map_err(|e| VesperError::Storage(e.to_string()))?;

        match current {
            None => Ok(false),
            Some(true) => Ok(true),
            Some(false) => {
                diesel::update(
                    messages::table
                        .find(id)
                        .filter(messages::processed.eq(false)),
                )
                .set(messages::processed.eq(true))
                .execute(&mut conn)
                .await
                .map_err(|e| VesperError::Storage(e.to_string()))?;
                Ok(true)
            }
        }
    }

    /// Flips a pending message to processed. Unlike [`Self::mark_processed`]
    /// this reports `true` only to the caller whose update made the change, so
    /// two workers racing on the same row cannot both win.
    pub async fn claim_pending(&self, id: i32) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            messages::table
                .find(id)
                .filter(messages::processed.eq(false)),
        )
        .set(messages::processed.eq(true))
        .execute(&mut conn)
        .await
        .map_err(|e| VesperError::Storage(e.to_string()))?;
        Ok(updated == 1)
    }

    /// The most recent `limit` processed, non-error turns in chronological
    /// order. Unprocessed rows never show up here.
    pub async fn get_context(&self, conversation_id: &str, limit: usize) -> Result<Vec<ContextTurn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let rows: Vec<(String, String)> = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .filter(messages::processed.eq(true))
            .filter(messages::is_error.eq(false))
            .order(messages::created_at.desc())
            .then_order_by(messages::id.desc())
            .limit(sql_limit(limit))
            .select((messages::role, messages::content))
            .load(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;

        rows.into_iter()
            .rev()
            .map(|(role, content)| -> Result<ContextTurn> {
                Ok(ContextTurn {
                    role: role.parse()?,
                    content,
                })
            })
            .collect()
    }

    /// Full non-error history of a conversation, oldest first. For display and
    /// audit only; context windows come from [`MessageStore::get_context`].
    pub async fn get_conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows: Vec<MessageRow> = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .filter(messages::is_error.eq(false))
            .order(messages::created_at.asc())
            .then_order_by(messages::id.asc())
            .load(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        rows.into_iter().map(map_message).collect()
    }

    /// Latest non-error messages, optionally scoped to one conversation,
    /// returned oldest first.
    pub async fn recent_messages(
        &self,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut query = messages::table
            .filter(messages::is_error.eq(false))
            .into_boxed();
        if let Some(conversation_id) = conversation_id {
            query = query.filter(messages::conversation_id.eq(conversation_id));
        }
        let mut rows: Vec<MessageRow> = query
            .order(messages::created_at.desc())
            .then_order_by(messages::id.desc())
            .limit(sql_limit(limit))
            .load(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        rows.reverse();
        rows.into_iter().map(map_message).collect()
    }

    /// Whether an assistant reply already points at `parent_message_id`.
    pub async fn has_reply(&self, parent_message_id: i32) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply = messages::table
            .filter(messages::parent_message_id.eq(parent_message_id))
            .filter(messages::role.eq(Role::Assistant.as_str()))
            .select(messages::id)
            .first::<i32>(&mut conn)
            .await
            .optional()
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        Ok(reply.is_some())
    }

    pub async fn processing_stats(&self) -> Result<ProcessingStats> {
        let mut conn = self.conn().await?;
        let visible = || messages::table.filter(messages::is_error.eq(false));

        let total_messages = visible()
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        let processed_messages = visible()
            .filter(messages::processed.eq(true))
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        let pending_user_messages = visible()
            .filter(messages::processed.eq(false))
            .filter(messages::role.eq(Role::User.as_str()))
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        let total_user_messages = visible()
            .filter(messages::role.eq(Role::User.as_str()))
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        let total_assistant_messages = visible()
            .filter(messages::role.eq(Role::Assistant.as_str()))
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;

        Ok(ProcessingStats {
            total_messages,
            processed_messages,
            pending_user_messages,
            total_user_messages,
            total_assistant_messages,
        })
    }

    /// Creates a conversation, or refreshes an existing one. A `Some` title
    /// replaces the stored title; `None` leaves it alone.
    pub async fn create_conversation(
        &self,
        conversation_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<String> {
        let conversation_id = match conversation_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => new_conversation_id()?,
        };
        let now = self.clock.now_millis();
        let mut conn = self.conn().await?;
        let row = NewConversationRow {
            id: &conversation_id,
            title,
            status: "active",
            created_at: now,
            updated_at: now,
        };
        let insert = diesel::insert_into(conversations::table)
            .values(&row)
            .on_conflict(conversations::id)
            .do_update();
        let written = match title {
            Some(title) => {
                insert
                    .set((
                        conversations::title.eq(Some(title)),
                        conversations::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await
            }
            None => {
                insert
                    .set(conversations::updated_at.eq(now))
                    .execute(&mut conn)
                    .await
            }
        };
        written.map_err(|e| VesperError::Storage(e.to_string()))?;
        Ok(conversation_id)
    }

    pub async fn set_conversation_title(&self, conversation_id: &str, title: &str) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut conn = self.conn().await?;
        let updated = diesel::update(conversations::table.find(conversation_id))
            .set((
                conversations::title.eq(Some(title)),
                conversations::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        Ok(updated > 0)
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let mut conn = self.conn().await?;
        let row = conversations::table
            .find(conversation_id)
            .first::<ConversationRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        Ok(row.map(map_conversation))
    }

    /// Most recently updated first.
    pub async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let mut conn = self.conn().await?;
        let mut query = conversations::table
            .order(conversations::updated_at.desc())
            .then_order_by(conversations::id.asc())
            .into_boxed();
        if limit > 0 {
            query = query.limit(sql_limit(limit));
        }
        let rows: Vec<ConversationRow> = query
            .load(&mut conn)
            .await
            .map_err(|e| VesperError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_conversation).collect())
    }

    async fn conn(&self) -> Result<SqlitePooledConn<'_>> {
        crate::db::checkout(&self.pool).await
    }
}

async fn touch_conversation(
    conn: &mut SqlitePooledConn<'_>,
    conversation_id: &str,
    now: i64,
) -> Result<()> {
    let row = NewConversationRow {
        id: conversation_id,
        title: None,
        status: "active",
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(conversations::table)
        .values(&row)
        .on_conflict(conversations::id)
        .do_update()
        .set(conversations::updated_at.eq(now))
        .execute(conn)
        .await
        .map_err(|e| VesperError::Storage(e.to_string()))?;
    Ok(())
}

fn new_conversation_id() -> Result<String> {
    let mut bytes = [0u8; 9];
    let mut rng = SysRng;
    rng.try_fill_bytes(&mut bytes)
        .map_err(|e| VesperError::Runtime(e.to_string()))?;
    Ok(format!("conv_{}", URL_SAFE_NO_PAD.encode(bytes)))
}

// SQLite reads a negative LIMIT as "no limit", so the cast must not wrap.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn map_message(row: MessageRow) -> Result<Message> {
    Ok(Message {
        id: row.id,
        conversation_id: row.conversation_id,
        role: row.role.parse()?,
        content: row.content,
        created_at: row.created_at,
        processed: row.processed,
        is_error: row.is_error,
        parent_message_id: row.parent_message_id,
        content_fingerprint: row.content_fingerprint,
    })
}

fn map_conversation(row: ConversationRow) -> Conversation {
    Conversation {
        id: row.id,
        title: row.title,
        status: row.status,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

const TIMESTAMP_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Renders a millisecond timestamp for display, UTC.
pub fn format_timestamp(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp(millis.div_euclid(1000))
        .ok()
        .and_then(|dt| dt.format(TIMESTAMP_FORMAT).ok())
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn store_with_clock(dir: &tempfile::TempDir) -> (MessageStore, Arc<ManualClock>) {
        let db_path = dir.path().join("ledger.db");
        let clock = Arc::new(ManualClock::new(1_771_147_543_000));
        let store = MessageStore::open(
            MessageStoreConfig::new(db_path.to_string_lossy()).with_clock(clock.clone()),
        )
        .await
        .expect("store");
        (store, clock)
    }

    #[tokio::test]
    async fn user_messages_start_pending_and_assistant_messages_processed() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (store, _clock) = store_with_clock(&dir).await;

        let user = store
            .add_message(MessageDraft::user("hi").in_conversation("c1"))
            .await
            .expect("add user")
            .expect("not a duplicate");
        let reply = store
            .add_message(
                MessageDraft::assistant("hello")
                    .in_conversation("c1")
                    .replying_to(user.id),
            )
            .await
            .expect("add assistant")
            .expect("not a duplicate");

        let user = store.get_message(user.id).await.unwrap().unwrap();
        let reply = store.get_message(reply.id).await.unwrap().unwrap();
        assert!(!user.processed);
        assert!(reply.processed);
        assert_eq!(reply.parent_message_id, Some(user.id));
        assert_eq!(user.content_fingerprint, content_fingerprint("hi"));
    }

    #[tokio::test]
    async fn dedup_window_expires() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (store, clock) = store_with_clock(&dir).await;

        let first = store
            .add_message(MessageDraft::user("hi").in_conversation("c1"))
            .await
            .unwrap();
        assert!(first.is_some());
        clock.advance(Duration::from_secs(59));
        let second = store
            .add_message(MessageDraft::user("hi").in_conversation("c1"))
            .await
            .unwrap();
        assert!(second.is_none());

        clock.advance(Duration::from_secs(2));
        let third = store
            .add_message(MessageDraft::user("hi").in_conversation("c1"))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn dedup_is_scoped_to_conversation_and_role() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (store, _clock) = store_with_clock(&dir).await;

        for draft in [
            MessageDraft::user("same").in_conversation("c1"),
            MessageDraft::user("same").in_conversation("c2"),
            MessageDraft::assistant("same").in_conversation("c1"),
            MessageDraft::user("Same").in_conversation("c1"),
        ] {
            assert!(store.add_message(draft).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn missing_conversation_id_is_assigned() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (store, _clock) = store_with_clock(&dir).await;

        let inserted = store
            .add_message(MessageDraft::user("start something"))
            .await
            .unwrap()
            .unwrap();
        assert!(inserted.conversation_id.starts_with("conv_"));
        let conversation = store
            .get_conversation(&inserted.conversation_id)
            .await
            .unwrap()
            .expect("conversation row created");
        assert_eq!(conversation.status, "active");
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (store, _clock) = store_with_clock(&dir).await;
        let err = store
            .add_message(MessageDraft::user("   ").in_conversation("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, VesperError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn conversation_updated_at_tracks_inserts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (store, clock) = store_with_clock(&dir).await;

        let id = store
            .create_conversation(Some("c1"), Some("Morning"))
            .await
            .unwrap();
        let created = store.get_conversation(&id).await.unwrap().unwrap();
        assert_eq!(created.title.as_deref(), Some("Morning"));

        clock.advance(Duration::from_secs(5));
        store
            .add_message(MessageDraft::user("ping").in_conversation("c1"))
            .await
            .unwrap();
        let touched = store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(touched.created_at, created.created_at);
        assert_eq!(touched.updated_at, created.updated_at + 5_000);
        assert_eq!(touched.title.as_deref(), Some("Morning"));

        store.create_conversation(Some("c1"), None).await.unwrap();
        let untouched_title = store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(untouched_title.title.as_deref(), Some("Morning"));

        assert!(store.set_conversation_title("c1", "Evening").await.unwrap());
        assert!(!store.set_conversation_title("nope", "x").await.unwrap());
    }

    #[tokio::test]
    async fn error_rows_are_hidden_from_reads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (store, _clock) = store_with_clock(&dir).await;

        store
            .add_message(MessageDraft::user("broken").in_conversation("c1").as_error())
            .await
            .unwrap();
        store
            .add_message(MessageDraft::user("fine").in_conversation("c1"))
            .await
            .unwrap();

        let pending = store.get_unprocessed(Some("c1"), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "fine");
        let history = store.get_conversation_messages("c1").await.unwrap();
        assert_eq!(history.len(), 1);
        let stats = store.processing_stats().await.unwrap();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.pending_user_messages, 1);
    }

    #[test]
    fn role_parsing() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("system".parse::<Role>().is_err());
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn timestamps_render_in_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(1_500), "1970-01-01 00:00:01");
    }
}
