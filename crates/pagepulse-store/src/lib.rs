//! Durable storage for synced pages, conversations, and messages.
//!
//! All ids are platform-assigned opaque strings and act as the upsert keys,
//! so re-applying an identical fetched batch converges to identical stored
//! state. Timestamps are stored as the raw strings the platform returned;
//! parsing happens in the sync engine, never here.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::instrument;

/// A tenant page. Seeded externally; read-only to the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub page_id: String,
    pub page_name: String,
}

/// A conversation between a page and one external participant.
///
/// `updated_time` is the platform watermark used only for change detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub page_id: String,
    pub participant_id: Option<String>,
    pub participant_name: Option<String>,
    pub updated_time: Option<String>,
    pub message_count: i64,
}

/// A single message. `response_latency_seconds` is derived after upsert and
/// may be rewritten on every derivation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub page_id: String,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub message_text: String,
    pub message_time: Option<String>,
    pub from_page: bool,
}

/// Per-page sync cursor. Absence of a row means "first run".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSyncState {
    pub page_id: String,
    pub last_sync_time: DateTime<Utc>,
    pub conversations_last_run: i64,
    pub messages_last_run: i64,
}

/// Minimal projection of a message used by the latency deriver.
#[derive(Debug, Clone)]
pub struct MessageTiming {
    pub message_id: String,
    pub message_time: Option<String>,
    pub from_page: bool,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store, used by tests across the workspace.
    pub async fn open_in_memory() -> Result<Self> {
        // A single connection, or each checkout would see its own empty db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip_all)]
    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pages (\
                page_id TEXT PRIMARY KEY,\
                page_name TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (\
                conversation_id TEXT PRIMARY KEY,\
                page_id TEXT NOT NULL,\
                participant_id TEXT,\
                participant_name TEXT,\
                updated_time TEXT,\
                message_count INTEGER NOT NULL DEFAULT 0\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (\
                message_id TEXT PRIMARY KEY,\
                conversation_id TEXT NOT NULL,\
                page_id TEXT NOT NULL,\
                sender_id TEXT,\
                sender_name TEXT,\
                message_text TEXT NOT NULL,\
                message_time TEXT,\
                is_from_page INTEGER NOT NULL,\
                response_latency_seconds REAL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation \
             ON messages(conversation_id, message_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS page_sync_state (\
                page_id TEXT PRIMARY KEY,\
                last_sync_time TEXT NOT NULL,\
                conversations_last_run INTEGER NOT NULL,\
                messages_last_run INTEGER NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_pages(&self) -> Result<Vec<PageRecord>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT page_id, page_name FROM pages ORDER BY page_name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(page_id, page_name)| PageRecord { page_id, page_name })
            .collect())
    }

    pub async fn upsert_pages(&self, pages: &[PageRecord]) -> Result<usize> {
        if pages.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for page in pages {
            sqlx::query(
                "INSERT INTO pages (page_id, page_name) VALUES (?1, ?2)\
                ON CONFLICT(page_id) DO UPDATE SET page_name=excluded.page_name",
            )
            .bind(&page.page_id)
            .bind(&page.page_name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(pages.len())
    }

    /// Batched insert-or-update of conversation metadata.
    ///
    /// One transaction per batch; a failure rolls the whole batch back and
    /// zero rows count as written. The update path refreshes only the
    /// mutable fields, never identity or ownership.
    #[instrument(skip_all, fields(batch = batch.len()))]
    pub async fn upsert_conversations(&self, batch: &[ConversationRecord]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for conv in batch {
            sqlx::query(
                "INSERT INTO conversations \
                    (conversation_id, page_id, participant_id, participant_name, updated_time, message_count) \
                VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                ON CONFLICT(conversation_id) DO UPDATE SET \
                    updated_time=excluded.updated_time, \
                    message_count=excluded.message_count, \
                    participant_name=excluded.participant_name",
            )
            .bind(&conv.conversation_id)
            .bind(&conv.page_id)
            .bind(&conv.participant_id)
            .bind(&conv.participant_name)
            .bind(&conv.updated_time)
            .bind(conv.message_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(batch.len())
    }

    /// Batched insert-or-update of messages. Same rollback-as-unit contract
    /// as [`Store::upsert_conversations`]; the update path covers resends
    /// and edits (text, time, sender name) and leaves
    /// `response_latency_seconds` alone so derivation survives re-upserts.
    #[instrument(skip_all, fields(batch = batch.len()))]
    pub async fn upsert_messages(&self, batch: &[MessageRecord]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for msg in batch {
            sqlx::query(
                "INSERT INTO messages \
                    (message_id, conversation_id, page_id, sender_id, sender_name, message_text, message_time, is_from_page) \
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                ON CONFLICT(message_id) DO UPDATE SET \
                    message_text=excluded.message_text, \
                    message_time=excluded.message_time, \
                    sender_name=excluded.sender_name",
            )
            .bind(&msg.message_id)
            .bind(&msg.conversation_id)
            .bind(&msg.page_id)
            .bind(&msg.sender_id)
            .bind(&msg.sender_name)
            .bind(&msg.message_text)
            .bind(&msg.message_time)
            .bind(msg.from_page)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(batch.len())
    }

    /// Stored change-detection watermarks for one page:
    /// `conversation_id -> updated_time` as last persisted.
    pub async fn conversation_watermarks(
        &self,
        page_id: &str,
    ) -> Result<std::collections::HashMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT conversation_id, updated_time FROM conversations WHERE page_id = ?1",
        )
        .bind(page_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, updated)| updated.map(|u| (id, u)))
            .collect())
    }

    /// Message timings for one conversation, ordered by the stored raw
    /// timestamp string. Chronological ordering across mixed offsets is
    /// the deriver's job, after parsing.
    pub async fn message_timeline(&self, conversation_id: &str) -> Result<Vec<MessageTiming>> {
        let rows = sqlx::query_as::<_, (String, Option<String>, bool)>(
            "SELECT message_id, message_time, is_from_page FROM messages \
            WHERE conversation_id = ?1 ORDER BY message_time ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(message_id, message_time, from_page)| MessageTiming {
                message_id,
                message_time,
                from_page,
            })
            .collect())
    }

    /// Write derived response latencies. Recomputation is not a content
    /// change, so this never touches the upsert-managed columns.
    pub async fn apply_latencies(&self, updates: &[(String, f64)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (message_id, seconds) in updates {
            sqlx::query(
                "UPDATE messages SET response_latency_seconds = ?1 WHERE message_id = ?2",
            )
            .bind(seconds)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Every conversation that has at least one stored message; drives the
    /// maintenance recompute mode.
    pub async fn all_conversation_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT conversation_id FROM messages ORDER BY conversation_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn get_sync_state(&self, page_id: &str) -> Result<Option<PageSyncState>> {
        let row = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT last_sync_time, conversations_last_run, messages_last_run \
            FROM page_sync_state WHERE page_id = ?1",
        )
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(last_sync_time, conversations, messages)| PageSyncState {
            page_id: page_id.to_string(),
            last_sync_time: DateTime::parse_from_rfc3339(&last_sync_time)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            conversations_last_run: conversations,
            messages_last_run: messages,
        }))
    }

    /// Rewrite a page's cursor wholesale after a successful pipeline.
    pub async fn set_sync_state(&self, state: &PageSyncState) -> Result<()> {
        sqlx::query(
            "INSERT INTO page_sync_state (page_id, last_sync_time, conversations_last_run, messages_last_run) \
            VALUES (?1, ?2, ?3, ?4) \
            ON CONFLICT(page_id) DO UPDATE SET \
                last_sync_time=excluded.last_sync_time, \
                conversations_last_run=excluded.conversations_last_run, \
                messages_last_run=excluded.messages_last_run",
        )
        .bind(&state.page_id)
        .bind(state.last_sync_time.to_rfc3339())
        .bind(state.conversations_last_run)
        .bind(state.messages_last_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn conversation_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn message_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let row = sqlx::query_as::<
            _,
            (
                String,
                String,
                String,
                Option<String>,
                Option<String>,
                String,
                Option<String>,
                bool,
            ),
        >(
            "SELECT message_id, conversation_id, page_id, sender_id, sender_name, \
                    message_text, message_time, is_from_page \
            FROM messages WHERE message_id = ?1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(message_id, conversation_id, page_id, sender_id, sender_name, message_text, message_time, from_page)| {
                MessageRecord {
                    message_id,
                    conversation_id,
                    page_id,
                    sender_id,
                    sender_name,
                    message_text,
                    message_time,
                    from_page,
                }
            },
        ))
    }

    pub async fn get_latency(&self, message_id: &str) -> Result<Option<f64>> {
        let row = sqlx::query_as::<_, (Option<f64>,)>(
            "SELECT response_latency_seconds FROM messages WHERE message_id = ?1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(latency,)| latency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    fn conversation(id: &str, updated: &str, count: i64) -> ConversationRecord {
        ConversationRecord {
            conversation_id: id.to_string(),
            page_id: "page1".to_string(),
            participant_id: Some("user1".to_string()),
            participant_name: Some("Alice".to_string()),
            updated_time: Some(updated.to_string()),
            message_count: count,
        }
    }

    fn message(id: &str, conv: &str, time: &str, from_page: bool) -> MessageRecord {
        MessageRecord {
            message_id: id.to_string(),
            conversation_id: conv.to_string(),
            page_id: "page1".to_string(),
            sender_id: Some(if from_page { "page1" } else { "user1" }.to_string()),
            sender_name: Some(if from_page { "Page" } else { "Alice" }.to_string()),
            message_text: format!("text for {}", id),
            message_time: Some(time.to_string()),
            from_page,
        }
    }

    #[tokio::test]
    async fn test_upsert_conversations_idempotent() {
        let store = test_store().await;
        let batch = vec![
            conversation("c1", "2024-01-15T10:00:00+0000", 3),
            conversation("c2", "2024-01-15T11:00:00+0000", 1),
        ];

        assert_eq!(store.upsert_conversations(&batch).await.unwrap(), 2);
        assert_eq!(store.conversation_count().await.unwrap(), 2);

        // Re-applying the identical batch converges to identical state.
        assert_eq!(store.upsert_conversations(&batch).await.unwrap(), 2);
        assert_eq!(store.conversation_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_messages_idempotent() {
        let store = test_store().await;
        let batch = vec![
            message("m1", "c1", "2024-01-15T10:00:00+0000", false),
            message("m2", "c1", "2024-01-15T10:05:00+0000", true),
        ];

        assert_eq!(store.upsert_messages(&batch).await.unwrap(), 2);
        assert_eq!(store.upsert_messages(&batch).await.unwrap(), 2);
        assert_eq!(store.message_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_message_upsert_refreshes_mutable_fields_only() {
        let store = test_store().await;
        store
            .upsert_messages(&[message("m1", "c1", "2024-01-15T10:00:00+0000", false)])
            .await
            .unwrap();
        store.apply_latencies(&[("m1".to_string(), 42.0)]).await.unwrap();

        // An edited resend updates text but must not clear derived latency.
        let mut edited = message("m1", "c1", "2024-01-15T10:00:00+0000", false);
        edited.message_text = "edited".to_string();
        store.upsert_messages(&[edited]).await.unwrap();

        let stored = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.message_text, "edited");
        assert_eq!(store.get_latency("m1").await.unwrap(), Some(42.0));
    }

    #[tokio::test]
    async fn test_conversation_watermarks() {
        let store = test_store().await;
        store
            .upsert_conversations(&[
                conversation("c1", "2024-01-15T10:00:00+0000", 3),
                conversation("c2", "2024-01-16T09:30:00+0000", 1),
            ])
            .await
            .unwrap();

        let watermarks = store.conversation_watermarks("page1").await.unwrap();
        assert_eq!(watermarks.len(), 2);
        assert_eq!(
            watermarks.get("c1").map(|s| s.as_str()),
            Some("2024-01-15T10:00:00+0000")
        );
        assert!(store.conversation_watermarks("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_timeline_ordering() {
        let store = test_store().await;
        store
            .upsert_messages(&[
                message("m2", "c1", "2024-01-15T10:05:00+0000", true),
                message("m1", "c1", "2024-01-15T10:00:00+0000", false),
                message("m3", "c1", "2024-01-15T10:09:00+0000", true),
            ])
            .await
            .unwrap();

        let timeline = store.message_timeline("c1").await.unwrap();
        let ids: Vec<_> = timeline.iter().map(|t| t.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert!(!timeline[0].from_page);
        assert!(timeline[1].from_page);
    }

    #[tokio::test]
    async fn test_sync_state_roundtrip() {
        let store = test_store().await;
        assert!(store.get_sync_state("page1").await.unwrap().is_none());

        let state = PageSyncState {
            page_id: "page1".to_string(),
            last_sync_time: Utc::now(),
            conversations_last_run: 5,
            messages_last_run: 17,
        };
        store.set_sync_state(&state).await.unwrap();

        let loaded = store.get_sync_state("page1").await.unwrap().unwrap();
        assert_eq!(loaded.conversations_last_run, 5);
        assert_eq!(loaded.messages_last_run, 17);
        assert_eq!(
            loaded.last_sync_time.timestamp(),
            state.last_sync_time.timestamp()
        );

        // Rewritten wholesale on the next run.
        let next = PageSyncState {
            messages_last_run: 3,
            ..state
        };
        store.set_sync_state(&next).await.unwrap();
        let loaded = store.get_sync_state("page1").await.unwrap().unwrap();
        assert_eq!(loaded.messages_last_run, 3);
    }

    #[tokio::test]
    async fn test_pages_roundtrip() {
        let store = test_store().await;
        store
            .upsert_pages(&[
                PageRecord {
                    page_id: "p1".to_string(),
                    page_name: "PageA".to_string(),
                },
                PageRecord {
                    page_id: "p2".to_string(),
                    page_name: "PageB".to_string(),
                },
            ])
            .await
            .unwrap();

        let pages = store.list_pages().await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page_name, "PageA");
    }

    #[tokio::test]
    async fn test_all_conversation_ids() {
        let store = test_store().await;
        store
            .upsert_messages(&[
                message("m1", "c1", "2024-01-15T10:00:00+0000", false),
                message("m2", "c2", "2024-01-15T10:05:00+0000", true),
                message("m3", "c1", "2024-01-15T10:09:00+0000", true),
            ])
            .await
            .unwrap();

        let ids = store.all_conversation_ids().await.unwrap();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
    }
}
