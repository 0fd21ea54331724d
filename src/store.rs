//! SQLite-backed persistent store for jobs and conversations.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::conversation::{Conversation, ConversationStore, ConversationSummary, Turn};
use crate::council::DEFAULT_TITLE;
use crate::council::CouncilResult;
use crate::jobs::{Job, JobStatus, JobStore};

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("store closed")]
    Closed,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    /// Gate concurrent spawn_blocking calls so only one blocking thread waits
    /// on the connection mutex at a time.
    sem: Arc<Semaphore>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    /// Lock the connection. A poisoned mutex still holds a usable connection.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (\
               id TEXT PRIMARY KEY,\
               status TEXT NOT NULL,\
               conversation_id TEXT,\
               created_at_ms INTEGER NOT NULL,\
               body TEXT NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS conversations (\
               id TEXT PRIMARY KEY,\
               created_at TEXT NOT NULL,\
               title TEXT,\
               total_cost_nanodollars INTEGER NOT NULL DEFAULT 0\
             );\
             CREATE TABLE IF NOT EXISTS turns (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,\
               job_id TEXT,\
               body TEXT NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at_ms);\
             CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id, id);\
             CREATE INDEX IF NOT EXISTS idx_turns_job ON turns(conversation_id, job_id);",
        )?;
        Ok(())
    }

    fn ensure_conversation(conn: &Connection, id: &str) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR IGNORE INTO conversations (id, created_at) VALUES (?1, ?2)",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn insert_turn(
        conn: &Connection,
        conversation_id: &str,
        turn: &Turn,
    ) -> Result<(), StoreError> {
        Self::ensure_conversation(conn, conversation_id)?;
        conn.execute(
            "INSERT INTO turns (conversation_id, job_id, body) VALUES (?1, ?2, ?3)",
            params![
                conversation_id,
                turn.job_id().map(|id| id.to_string()),
                serde_json::to_string(turn)?,
            ],
        )?;
        Ok(())
    }
}

fn decode_job(body: String) -> Result<Job, StoreError> {
    Ok(serde_json::from_str(&body)?)
}

fn parse_timestamp(raw: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// -----------------------------------------------------------------------------
// Jobs
// -----------------------------------------------------------------------------

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let body = serde_json::to_string(job)?;
        let id = job.id.to_string();
        let status = job.status().as_str();
        let conversation_id = job.conversation_id.clone();
        let created_at_ms = job.created_at.timestamp_millis();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, status, conversation_id, created_at_ms, body) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, status, conversation_id, created_at_ms, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let id = id.to_string();
        let body: Option<String> = self
            .blocking(move |conn| {
                Ok(conn
                    .query_row("SELECT body FROM jobs WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?)
            })
            .await?;
        body.map(decode_job).transpose()
    }

    async fn replace(&self, job: &Job, expected: JobStatus) -> Result<bool, StoreError> {
        let body = serde_json::to_string(job)?;
        let id = job.id.to_string();
        let status = job.status().as_str();
        self.blocking(move |conn| {
            let rows = conn.execute(
                "UPDATE jobs SET status = ?1, body = ?2 WHERE id = ?3 AND status = ?4",
                params![status, body, id, expected.as_str()],
            )?;
            Ok(rows == 1)
        })
        .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let bodies: Vec<String> = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM jobs ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<String>, _>>()?)
            })
            .await?;
        bodies.into_iter().map(decode_job).collect()
    }
}

// -----------------------------------------------------------------------------
// Conversations
// -----------------------------------------------------------------------------

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn append_user_turn(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let conversation_id = conversation_id.to_string();
        let turn = Turn::User {
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.blocking(move |conn| Self::insert_turn(conn, &conversation_id, &turn))
            .await
    }

    async fn append_assistant_turn(
        &self,
        conversation_id: &str,
        job_id: Uuid,
        result: &CouncilResult,
    ) -> Result<(), StoreError> {
        let conversation_id = conversation_id.to_string();
        let turn = Turn::assistant(job_id, result);
        self.blocking(move |conn| Self::insert_turn(conn, &conversation_id, &turn))
            .await
    }

    async fn update_assistant_turn(
        &self,
        conversation_id: &str,
        job_id: Uuid,
        result: &CouncilResult,
    ) -> Result<Option<i64>, StoreError> {
        let conversation_id = conversation_id.to_string();
        let result = result.clone();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, body FROM turns WHERE conversation_id = ?1 AND job_id = ?2",
                    params![conversation_id, job_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((row_id, body)) = existing else {
                return Ok(None);
            };
            let turn: Turn = serde_json::from_str(&body)?;
            let updated = turn.refreshed(job_id, &result);
            let delta = updated.cost() - turn.cost();

            tx.execute(
                "UPDATE turns SET body = ?1 WHERE id = ?2",
                params![serde_json::to_string(&updated)?, row_id],
            )?;
            tx.execute(
                "UPDATE conversations SET total_cost_nanodollars = total_cost_nanodollars + ?1 \
                 WHERE id = ?2",
                params![delta, conversation_id],
            )?;
            tx.commit()?;
            Ok(Some(delta))
        })
        .await
    }

    async fn add_cost(
        &self,
        conversation_id: &str,
        delta_nanodollars: i64,
    ) -> Result<(), StoreError> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| {
            Self::ensure_conversation(conn, &conversation_id)?;
            conn.execute(
                "UPDATE conversations SET total_cost_nanodollars = total_cost_nanodollars + ?1 \
                 WHERE id = ?2",
                params![delta_nanodollars, conversation_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), StoreError> {
        let conversation_id = conversation_id.to_string();
        let title = title.to_string();
        self.blocking(move |conn| {
            Self::ensure_conversation(conn, &conversation_id)?;
            conn.execute(
                "UPDATE conversations SET title = ?1 WHERE id = ?2",
                params![title, conversation_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| {
            let header: Option<(String, Option<String>, i64)> = conn
                .query_row(
                    "SELECT created_at, title, total_cost_nanodollars \
                     FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((created_at, title, total_cost_nanodollars)) = header else {
                return Ok(None);
            };

            let mut stmt =
                conn.prepare("SELECT body FROM turns WHERE conversation_id = ?1 ORDER BY id")?;
            let bodies = stmt
                .query_map(params![conversation_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let turns = bodies
                .iter()
                .map(|b| serde_json::from_str(b))
                .collect::<Result<Vec<Turn>, _>>()?;

            Ok(Some(Conversation {
                id: conversation_id,
                created_at: parse_timestamp(&created_at),
                title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
                turns,
                total_cost_nanodollars,
            }))
        })
        .await
    }

    async fn list_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_at, c.title, c.total_cost_nanodollars, \
                        (SELECT COUNT(*) FROM turns t WHERE t.conversation_id = c.id) \
                 FROM conversations c \
                 ORDER BY c.created_at DESC, c.rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, created_at, title, total_cost_nanodollars, turns) = row?;
                summaries.push(ConversationSummary {
                    id,
                    created_at: parse_timestamp(&created_at),
                    title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
                    message_count: usize::try_from(turns).unwrap_or(0),
                    total_cost_nanodollars,
                });
            }
            Ok(summaries)
        })
        .await
    }
}
