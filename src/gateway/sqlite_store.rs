use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use thiserror::Error;

use super::history::truncate_runes;
use super::store_types::{
    ChatMessageRecord, ConversationPage, ConversationRecord, MessagePage, MessageRecord,
    NewConversation, NewMessage, UsageEndpointDetail, UsageRecord, UsageTotals,
};

pub const PREVIEW_MAX_RUNES: usize = 120;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("conversation {0} not found")]
    ConversationNotFound(i64),
}

const CONVERSATION_COLUMNS: &str = "id, user_id, title, model, message_count, \
     last_message_preview, last_message_at_ms, created_at_ms, updated_at_ms";

const MESSAGE_COLUMNS: &str = "id, conversation_id, user_id, role, content, message_json, \
     model, created_at_ms, updated_at_ms";

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn create_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<ConversationRecord, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<ConversationRecord, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO llm_conversation (id, user_id, title, model, message_count, \
                 last_message_preview, last_message_at_ms, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, 0, '', ?5, ?5, ?5)",
                rusqlite::params![
                    conversation.id,
                    conversation.user_id,
                    conversation.title,
                    conversation.model,
                    conversation.created_at_ms,
                ],
            )?;
            Ok(ConversationRecord {
                id: conversation.id,
                user_id: conversation.user_id,
                title: conversation.title,
                model: conversation.model,
                message_count: 0,
                last_message_preview: String::new(),
                last_message_at_ms: conversation.created_at_ms,
                created_at_ms: conversation.created_at_ms,
                updated_at_ms: conversation.created_at_ms,
            })
        })
        .await?
    }

    /// Looks a conversation up by id, visible only to its owner.
    pub async fn get_conversation(
        &self,
        conversation_id: i64,
        user_id: i64,
    ) -> Result<Option<ConversationRecord>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(
            move || -> Result<Option<ConversationRecord>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;
                let record = conn
                    .query_row(
                        &format!(
                            "SELECT {CONVERSATION_COLUMNS} FROM llm_conversation \
                             WHERE id=?1 AND user_id=?2"
                        ),
                        rusqlite::params![conversation_id, user_id],
                        conversation_from_row,
                    )
                    .optional()?;
                Ok(record)
            },
        )
        .await?
    }

    pub async fn conversation_belongs_to_user(
        &self,
        conversation_id: i64,
        user_id: i64,
    ) -> Result<bool, SqliteStoreError> {
        Ok(self
            .get_conversation(conversation_id, user_id)
            .await?
            .is_some())
    }

    pub async fn list_conversations(
        &self,
        user_id: i64,
        offset: u64,
        limit: u64,
    ) -> Result<ConversationPage, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<ConversationPage, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM llm_conversation WHERE user_id=?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM llm_conversation WHERE user_id=?1 \
                 ORDER BY last_message_at_ms DESC, id DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![user_id, u64_to_i64(limit), u64_to_i64(offset)],
                conversation_from_row,
            )?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            Ok(ConversationPage {
                items,
                total: i64_to_u64(total),
            })
        })
        .await?
    }

    /// Messages of one conversation: the system message first, then by creation time.
    pub async fn list_messages(
        &self,
        conversation_id: i64,
        offset: u64,
        limit: u64,
    ) -> Result<MessagePage, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<MessagePage, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM llm_conversation_message WHERE conversation_id=?1",
                rusqlite::params![conversation_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM llm_conversation_message WHERE conversation_id=?1 \
                 ORDER BY CASE WHEN role='system' THEN 0 ELSE 1 END, created_at_ms ASC, id ASC \
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![conversation_id, u64_to_i64(limit), u64_to_i64(offset)],
                message_from_row,
            )?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            Ok(MessagePage {
                items,
                total: i64_to_u64(total),
            })
        })
        .await?
    }

    pub async fn insert_messages(&self, messages: Vec<NewMessage>) -> Result<(), SqliteStoreError> {
        if messages.is_empty() {
            return Ok(());
        }
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            for message in &messages {
                insert_message(&tx, message)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Writes the conversation's single system message.
    ///
    /// The most recent existing system row is updated in place and any other
    /// system rows are deleted; with no existing row, `message` is inserted.
    pub async fn upsert_system_message(
        &self,
        message: NewMessage,
    ) -> Result<i64, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<i64, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM llm_conversation_message \
                     WHERE conversation_id=?1 AND role='system' \
                     ORDER BY created_at_ms DESC, id DESC LIMIT 1",
                    rusqlite::params![message.conversation_id],
                    |row| row.get(0),
                )
                .optional()?;

            let id = match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE llm_conversation_message \
                         SET content=?2, message_json=?3, model=?4, user_id=?5, updated_at_ms=?6 \
                         WHERE id=?1",
                        rusqlite::params![
                            id,
                            message.content,
                            message.message_json,
                            message.model,
                            message.user_id,
                            message.created_at_ms,
                        ],
                    )?;
                    tx.execute(
                        "DELETE FROM llm_conversation_message \
                         WHERE conversation_id=?1 AND role='system' AND id<>?2",
                        rusqlite::params![message.conversation_id, id],
                    )?;
                    id
                }
                None => {
                    insert_message(&tx, &message)?;
                    message.id
                }
            };
            tx.commit()?;
            Ok(id)
        })
        .await?
    }

    pub async fn latest_system_message(
        &self,
        conversation_id: i64,
    ) -> Result<Option<MessageRecord>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<MessageRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let record = conn
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM llm_conversation_message \
                         WHERE conversation_id=?1 AND role='system' \
                         ORDER BY created_at_ms DESC, id DESC LIMIT 1"
                    ),
                    rusqlite::params![conversation_id],
                    message_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await?
    }

    /// The `limit` most recent non-system messages, oldest first.
    pub async fn recent_history(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, SqliteStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<MessageRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM llm_conversation_message \
                 WHERE conversation_id=?1 AND role<>'system' \
                 ORDER BY created_at_ms DESC, id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![conversation_id, u64_to_i64(limit as u64)],
                message_from_row,
            )?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            items.reverse();
            Ok(items)
        })
        .await?
    }

    /// Recomputes count, preview and last-activity time from the stored messages.
    /// The preview tracks the latest user/assistant message; the system slot is
    /// only used when nothing else exists. A blank `model` leaves the stored
    /// model untouched.
    pub async fn refresh_conversation_stats(
        &self,
        conversation_id: i64,
        model: Option<String>,
        now_ms: i64,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM llm_conversation_message WHERE conversation_id=?1",
                rusqlite::params![conversation_id],
                |row| row.get(0),
            )?;
            let latest: Option<(String, i64)> = tx
                .query_row(
                    "SELECT content, created_at_ms FROM llm_conversation_message \
                     WHERE conversation_id=?1 \
                     ORDER BY CASE WHEN role='system' THEN 1 ELSE 0 END, created_at_ms DESC, id DESC LIMIT 1",
                    rusqlite::params![conversation_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let changed = tx.execute(
                "UPDATE llm_conversation SET message_count=?2, updated_at_ms=?3 WHERE id=?1",
                rusqlite::params![conversation_id, count, now_ms],
            )?;
            if changed == 0 {
                return Err(SqliteStoreError::ConversationNotFound(conversation_id));
            }
            if let Some((content, created_at_ms)) = latest {
                tx.execute(
                    "UPDATE llm_conversation SET last_message_preview=?2, last_message_at_ms=?3 \
                     WHERE id=?1",
                    rusqlite::params![
                        conversation_id,
                        truncate_runes(content.trim(), PREVIEW_MAX_RUNES),
                        created_at_ms
                    ],
                )?;
            }
            let model = model
                .map(|model| model.trim().to_string())
                .filter(|model| !model.is_empty());
            if let Some(model) = model {
                tx.execute(
                    "UPDATE llm_conversation SET model=?2 WHERE id=?1",
                    rusqlite::params![conversation_id, model],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn insert_usage(&self, record: UsageRecord) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO api_usage (id, user_id, endpoint, method, status, request_size, \
                 response_size, latency_ms, model, input_tokens, output_tokens, total_tokens, \
                 error_message, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                rusqlite::params![
                    record.id,
                    record.user_id,
                    record.endpoint,
                    record.method,
                    i64::from(record.status),
                    u64_to_i64(record.request_size),
                    u64_to_i64(record.response_size),
                    u64_to_i64(record.latency_ms),
                    record.model,
                    u64_to_i64(record.input_tokens),
                    u64_to_i64(record.output_tokens),
                    u64_to_i64(record.total_tokens),
                    record.error_message,
                    record.created_at_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Totals over a user's usage rows, optionally restricted to `[start_ms, end_ms)`.
    ///
    /// Over the whole history a call fails when its status is >= 400; within a
    /// single day every non-2xx call counts as failed.
    pub async fn usage_totals(
        &self,
        user_id: i64,
        range_ms: Option<(i64, i64)>,
    ) -> Result<UsageTotals, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<UsageTotals, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let (start, end) = range_ms.unwrap_or((i64::MIN, i64::MAX));
            let (total, success, failed, tokens, avg_latency): (i64, i64, i64, i64, f64) = conn
                .query_row(
                    "SELECT COUNT(*), \
                     COALESCE(SUM(CASE WHEN status >= 200 AND status < 300 THEN 1 ELSE 0 END), 0), \
                     COALESCE(SUM(CASE WHEN status >= 400 THEN 1 ELSE 0 END), 0), \
                     COALESCE(SUM(total_tokens), 0), \
                     COALESCE(AVG(latency_ms), 0.0) \
                     FROM api_usage WHERE user_id=?1 AND created_at_ms>=?2 AND created_at_ms<?3",
                    rusqlite::params![user_id, start, end],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )?;
            let fail_count = if range_ms.is_some() {
                total - success
            } else {
                failed
            };
            Ok(UsageTotals {
                total_requests: i64_to_u64(total),
                success_count: i64_to_u64(success),
                fail_count: i64_to_u64(fail_count),
                total_tokens: i64_to_u64(tokens),
                avg_latency_ms: avg_latency,
            })
        })
        .await?
    }

    pub async fn usage_by_endpoint(
        &self,
        user_id: i64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<UsageEndpointDetail>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageEndpointDetail>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT endpoint, COUNT(*), COALESCE(SUM(total_tokens), 0), \
                 COALESCE(AVG(latency_ms), 0.0) \
                 FROM api_usage WHERE user_id=?1 AND created_at_ms>=?2 AND created_at_ms<?3 \
                 GROUP BY endpoint ORDER BY endpoint",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, start_ms, end_ms], |row| {
                Ok(UsageEndpointDetail {
                    endpoint: row.get(0)?,
                    count: i64_to_u64(row.get(1)?),
                    total_tokens: i64_to_u64(row.get(2)?),
                    avg_latency_ms: row.get(3)?,
                })
            })?;
            let mut details = Vec::new();
            for row in rows {
                details.push(row?);
            }
            Ok(details)
        })
        .await?
    }

    pub async fn list_usage(&self, user_id: i64) -> Result<Vec<UsageRecord>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, endpoint, method, status, request_size, response_size, \
                 latency_ms, model, input_tokens, output_tokens, total_tokens, error_message, \
                 created_at_ms FROM api_usage WHERE user_id=?1 ORDER BY created_at_ms, id",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id], |row| {
                let status: i64 = row.get(4)?;
                Ok(UsageRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    endpoint: row.get(2)?,
                    method: row.get(3)?,
                    status: u16::try_from(status).unwrap_or(0),
                    request_size: i64_to_u64(row.get(5)?),
                    response_size: i64_to_u64(row.get(6)?),
                    latency_ms: i64_to_u64(row.get(7)?),
                    model: row.get(8)?,
                    input_tokens: i64_to_u64(row.get(9)?),
                    output_tokens: i64_to_u64(row.get(10)?),
                    total_tokens: i64_to_u64(row.get(11)?),
                    error_message: row.get(12)?,
                    created_at_ms: row.get(13)?,
                })
            })?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await?
    }

    pub async fn insert_chat_message(
        &self,
        record: ChatMessageRecord,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO chat_message (id, from_id, to_id, message_type, message_media, \
                 content, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.id,
                    record.from_id,
                    record.to_id,
                    record.message_type,
                    record.message_media,
                    record.content,
                    record.created_at_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_chat_messages_between(
        &self,
        user_a: i64,
        user_b: i64,
    ) -> Result<Vec<ChatMessageRecord>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ChatMessageRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, from_id, to_id, message_type, message_media, content, created_at_ms \
                 FROM chat_message \
                 WHERE (from_id=?1 AND to_id=?2) OR (from_id=?2 AND to_id=?1) \
                 ORDER BY created_at_ms, id",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_a, user_b], |row| {
                Ok(ChatMessageRecord {
                    id: row.get(0)?,
                    from_id: row.get(1)?,
                    to_id: row.get(2)?,
                    message_type: row.get(3)?,
                    message_media: row.get(4)?,
                    content: row.get(5)?,
                    created_at_ms: row.get(6)?,
                })
            })?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await?
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS llm_conversation (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            model TEXT NOT NULL DEFAULT '',
            message_count INTEGER NOT NULL DEFAULT 0,
            last_message_preview TEXT NOT NULL DEFAULT '',
            last_message_at_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_llm_conversation_user_last
            ON llm_conversation(user_id, last_message_at_ms);

        CREATE TABLE IF NOT EXISTS llm_conversation_message (
            id INTEGER PRIMARY KEY,
            conversation_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            message_json TEXT,
            model TEXT NOT NULL DEFAULT '',
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_llm_conversation_message_conv
            ON llm_conversation_message(conversation_id, created_at_ms);

        CREATE TABLE IF NOT EXISTS api_usage (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            endpoint TEXT NOT NULL,
            method TEXT NOT NULL,
            status INTEGER NOT NULL,
            request_size INTEGER NOT NULL,
            response_size INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            model TEXT NOT NULL DEFAULT '',
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_usage_user_created
            ON api_usage(user_id, created_at_ms);

        CREATE TABLE IF NOT EXISTS chat_message (
            id INTEGER PRIMARY KEY,
            from_id INTEGER NOT NULL,
            to_id INTEGER NOT NULL,
            message_type INTEGER,
            message_media INTEGER,
            content TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn insert_message(conn: &rusqlite::Connection, message: &NewMessage) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO llm_conversation_message (id, conversation_id, user_id, role, content, \
         message_json, model, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        rusqlite::params![
            message.id,
            message.conversation_id,
            message.user_id,
            message.role,
            message.content,
            message.message_json,
            message.model,
            message.created_at_ms,
        ],
    )?;
    Ok(())
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> Result<ConversationRecord, rusqlite::Error> {
    Ok(ConversationRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        model: row.get(3)?,
        message_count: row.get(4)?,
        last_message_preview: row.get(5)?,
        last_message_at_ms: row.get(6)?,
        created_at_ms: row.get(7)?,
        updated_at_ms: row.get(8)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> Result<MessageRecord, rusqlite::Error> {
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        message_json: row.get(5)?,
        model: row.get(6)?,
        created_at_ms: row.get(7)?,
        updated_at_ms: row.get(8)?,
    })
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
