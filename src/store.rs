use crate::chat::{Chat, ChatMessage, ChatSettings};
use crate::constants::{DEFAULT_CHAT_TITLE, MAX_CHATS, TITLE_WORDS};
use crate::session::MessageSink;
use crate::types::{now_millis, RelayError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

pub type DbPool = SqlitePool;

const CURRENT_CHAT_KEY: &str = "current_chat_id";

/// Change notifications for anyone showing the chat list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created(String),
    Updated(String),
    Deleted(String),
    CurrentChanged(Option<String>),
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: String,
    title: String,
    messages_json: String,
    settings_json: String,
    created_at: i64,
    updated_at: i64,
}

impl ChatRow {
    fn into_chat(self) -> Result<Chat> {
        Ok(Chat {
            id: self.id,
            title: self.title,
            messages: serde_json::from_str(&self.messages_json)?,
            settings: serde_json::from_str(&self.settings_json)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Chat history in a local SQLite file, newest chat first, capped at
/// [`MAX_CHATS`].
#[derive(Clone)]
pub struct ChatStore {
    pool: DbPool,
    events: broadcast::Sender<StoreEvent>,
}

impl ChatStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pool = init_db(path).await?;
        let (events, _) = broadcast::channel(64);
        Ok(Self { pool, events })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Creates a chat, makes it current and evicts the oldest beyond the cap.
    pub async fn create_chat(&self, title: Option<&str>, settings: &ChatSettings) -> Result<Chat> {
        let now = now_millis();
        let chat = Chat {
            id: ChatMessage::new_id(),
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_CHAT_TITLE)
                .to_string(),
            messages: Vec::new(),
            settings: settings.clone(),
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO chats (id, title, messages_json, settings_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chat.id)
        .bind(&chat.title)
        .bind(serde_json::to_string(&chat.messages)?)
        .bind(serde_json::to_string(&chat.settings)?)
        .bind(chat.created_at)
        .bind(chat.updated_at)
        .execute(&mut *tx)
        .await?;

        let evicted: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM chats ORDER BY created_at DESC, rowid DESC LIMIT -1 OFFSET ?",
        )
        .bind(MAX_CHATS)
        .fetch_all(&mut *tx)
        .await?;
        for (id,) in &evicted {
            sqlx::query("DELETE FROM chats WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        set_current(&mut tx, Some(&chat.id)).await?;
        tx.commit().await?;

        if !evicted.is_empty() {
            tracing::info!("Evicted {} chats beyond the history cap", evicted.len());
        }
        self.emit(StoreEvent::Created(chat.id.clone()));
        for (id,) in evicted {
            self.emit(StoreEvent::Deleted(id));
        }
        self.emit(StoreEvent::CurrentChanged(Some(chat.id.clone())));
        Ok(chat)
    }

    /// Replaces the messages (and optionally the title) and bumps `updatedAt`.
    pub async fn update_chat(
        &self,
        id: &str,
        messages: &[ChatMessage],
        title: Option<&str>,
    ) -> Result<()> {
        let messages_json = serde_json::to_string(messages)?;
        let result = sqlx::query(
            "UPDATE chats SET messages_json = ?, title = COALESCE(?, title), updated_at = ?
             WHERE id = ?",
        )
        .bind(messages_json)
        .bind(title)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::Validation(format!("Chat {} not found", id)).into());
        }
        self.emit(StoreEvent::Updated(id.to_string()));
        Ok(())
    }

    pub async fn update_settings(&self, id: &str, settings: &ChatSettings) -> Result<()> {
        let result = sqlx::query("UPDATE chats SET settings_json = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(settings)?)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RelayError::Validation(format!("Chat {} not found", id)).into());
        }
        self.emit(StoreEvent::Updated(id.to_string()));
        Ok(())
    }

    /// Deletes a chat. If it was current, the newest remaining chat becomes
    /// current (or none). Returns whether anything was deleted.
    pub async fn delete_chat(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        let current = get_current(&mut tx).await?;
        let mut new_current = None;
        if deleted && current.as_deref() == Some(id) {
            let next: Option<(String,)> =
                sqlx::query_as("SELECT id FROM chats ORDER BY created_at DESC, rowid DESC LIMIT 1")
                    .fetch_optional(&mut *tx)
                    .await?;
            let next = next.map(|(id,)| id);
            set_current(&mut tx, next.as_deref()).await?;
            new_current = Some(next);
        }
        tx.commit().await?;

        if deleted {
            self.emit(StoreEvent::Deleted(id.to_string()));
        }
        if let Some(next) = new_current {
            self.emit(StoreEvent::CurrentChanged(next));
        }
        Ok(deleted)
    }

    /// Newest first.
    pub async fn list_chats(&self) -> Result<Vec<Chat>> {
        let rows: Vec<ChatRow> = sqlx::query_as(
            "SELECT id, title, messages_json, settings_json, created_at, updated_at
             FROM chats ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ChatRow::into_chat).collect()
    }

    pub async fn get_chat(&self, id: &str) -> Result<Option<Chat>> {
        let row: Option<ChatRow> = sqlx::query_as(
            "SELECT id, title, messages_json, settings_json, created_at, updated_at
             FROM chats WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ChatRow::into_chat).transpose()
    }

    pub async fn current_chat_id(&self) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        get_current(&mut conn).await
    }

    pub async fn current_chat(&self) -> Result<Option<Chat>> {
        match self.current_chat_id().await? {
            Some(id) => self.get_chat(&id).await,
            None => Ok(None),
        }
    }

    pub async fn select_chat(&self, id: Option<&str>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        set_current(&mut conn, id).await?;
        self.emit(StoreEvent::CurrentChanged(id.map(str::to_string)));
        Ok(())
    }
}

async fn get_current(conn: &mut sqlx::SqliteConnection) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT value FROM app_state WHERE key = ?")
        .bind(CURRENT_CHAT_KEY)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.and_then(|(v,)| v))
}

async fn set_current(conn: &mut sqlx::SqliteConnection, id: Option<&str>) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO app_state (key, value) VALUES (?, ?)")
        .bind(CURRENT_CHAT_KEY)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(RelayError::Configuration(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
            )
            .into())
        }
    };

    let options = SqliteConnectOptions::new()
        .filename(path_str)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePool::connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    verify_schema_version(&pool).await;
    Ok(pool)
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::debug!("Chat history ready. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// First six space-separated words of `text`, with `...` if there were more.
pub fn generate_chat_title(text: &str) -> String {
    let words: Vec<&str> = text.split(' ').collect();
    let mut title = words
        .iter()
        .take(TITLE_WORDS)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    if words.len() > TITLE_WORDS {
        title.push_str("...");
    }
    title
}

/// Writes a session's messages into one stored chat.
pub struct ChatHistorySink {
    store: ChatStore,
    chat_id: String,
    title: String,
}

impl ChatHistorySink {
    pub fn new(store: ChatStore, chat: &Chat) -> Self {
        Self {
            store,
            chat_id: chat.id.clone(),
            title: chat.title.clone(),
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

impl MessageSink for ChatHistorySink {
    async fn messages_changed(&mut self, messages: &[ChatMessage]) -> Result<()> {
        if let Some(first) = messages.first() {
            if messages.len() == 1 || self.title == DEFAULT_CHAT_TITLE {
                self.title = generate_chat_title(&first.content);
            }
        }
        self.store
            .update_chat(&self.chat_id, messages, Some(&self.title))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_keep_six_words() {
        assert_eq!(generate_chat_title("What is Apple's revenue"), "What is Apple's revenue");
        assert_eq!(
            generate_chat_title("one two three four five six seven"),
            "one two three four five six..."
        );
        assert_eq!(
            generate_chat_title("one two three four five six"),
            "one two three four five six"
        );
    }
}
