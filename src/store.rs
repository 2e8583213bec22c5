//! Persistence layer for WatchParty.
//!
//! Users, sessions, queued streams, upvotes and the per-creator "current
//! stream" pointer all live in one SQLite file accessed through `libsql`.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Database, Row, TransactionBehavior, params};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{resource} not found")]
    NotFound { resource: &'static str },
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Database(#[from] libsql::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub created_at: String,
}

/// Only one kind of stream exists today; the column is kept so other hosts
/// can be added without a schema change.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamKind {
    #[default]
    Youtube,
}

impl StreamKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "Youtube",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "Youtube" => Some(Self::Youtube),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub url: String,
    pub extracted_id: String,
    pub title: String,
    pub small_img: String,
    pub big_img: String,
    pub active: bool,
    pub user_id: String,
    pub added_by: String,
    pub created_at: String,
}

/// A queued stream as seen by one viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    #[serde(flatten)]
    pub stream: StreamRecord,
    pub upvotes: i64,
    pub have_upvoted: bool,
}

#[derive(Debug, Clone)]
pub struct NewStream {
    pub creator_id: String,
    pub added_by: String,
    pub kind: StreamKind,
    pub url: String,
    pub extracted_id: String,
    pub title: String,
    pub small_img: String,
    pub big_img: String,
}

const STREAM_COLUMNS: &str = "s.id, s.type, s.url, s.extracted_id, s.title, s.small_img, \
     s.big_img, s.active, s.user_id, s.added_by, s.created_at";

const USER_COLUMNS: &str = "u.id, u.email, u.password_hash, u.created_at";

/// Pragmas that answer with their new value as a row. `execute_batch` rejects
/// those, so they are queried and drained one by one.
const ROW_RETURNING_PRAGMAS: [&str; 2] = ["PRAGMA busy_timeout=5000", "PRAGMA journal_mode=WAL"];

async fn configure_connection(conn: &Connection) -> anyhow::Result<()> {
    for pragma in ROW_RETURNING_PRAGMAS {
        let mut rows = conn
            .query(pragma, params![])
            .await
            .with_context(|| format!("running {pragma}"))?;
        while rows.next().await?.is_some() {}
    }

    conn.execute_batch(
        r#"
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            token_hash TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS streams (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            added_by TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            type TEXT NOT NULL DEFAULT 'Youtube',
            url TEXT NOT NULL,
            extracted_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            small_img TEXT NOT NULL DEFAULT '',
            big_img TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS upvotes (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            stream_id TEXT NOT NULL REFERENCES streams(id) ON DELETE CASCADE,
            PRIMARY KEY (user_id, stream_id)
        );

        CREATE TABLE IF NOT EXISTS current_streams (
            user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
            stream_id TEXT NOT NULL UNIQUE REFERENCES streams(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_streams_queue ON streams(user_id, active);
        CREATE INDEX IF NOT EXISTS idx_upvotes_stream ON upvotes(stream_id);
        "#,
    )
    .await?;
    Ok(())
}

/// RFC 3339 with fixed precision so lexical order matches time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Handle to the database file. Every operation opens its own connection so
/// concurrent requests never share a transaction.
#[derive(Clone)]
pub struct Store {
    db: std::sync::Arc<Database>,
}

impl Store {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;

        let store = Self {
            db: std::sync::Arc::new(db),
        };
        let conn = store.connect().await?;
        ensure_schema(&conn).await?;
        info!("database ready at {}", path.display());
        Ok(store)
    }

    async fn connect(&self) -> anyhow::Result<Connection> {
        let conn = self.db.connect()?;
        configure_connection(&conn).await?;
        Ok(conn)
    }

    pub async fn create_user(&self, email: &str, password_hash: &str) -> StoreResult<UserRecord> {
        let conn = self.connect().await?;
        let user = UserRecord {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: timestamp(Utc::now()),
        };

        let inserted = conn
            .execute(
                r#"
                INSERT INTO users (id, email, password_hash, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(email) DO NOTHING
                "#,
                params![
                    user.id.as_str(),
                    user.email.as_str(),
                    user.password_hash.as_str(),
                    user.created_at.as_str(),
                ],
            )
            .await?;

        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "a user with email {email} already exists"
            )));
        }
        debug!("created user {}", user.id);
        Ok(user)
    }

    pub async fn user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        self.fetch_user("u.email = ?1", email).await
    }

    pub async fn user_by_id(&self, id: &str) -> StoreResult<Option<UserRecord>> {
        self.fetch_user("u.id = ?1", id).await
    }

    async fn fetch_user(&self, predicate: &str, value: &str) -> StoreResult<Option<UserRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users u WHERE {predicate}"),
                params![value],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                token_hash,
                user_id,
                timestamp(Utc::now()),
                timestamp(expires_at)
            ],
        )
        .await?;
        Ok(())
    }

    /// Resolves a session hash to its user, ignoring sessions that expired
    /// before `now`.
    pub async fn session_user(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UserRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {USER_COLUMNS}
                    FROM sessions s
                    JOIN users u ON u.id = s.user_id
                    WHERE s.token_hash = ?1 AND s.expires_at > ?2
                    "#
                ),
                params![token_hash, timestamp(now)],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_session(&self, token_hash: &str) -> StoreResult<()> {
        let conn = self.connect().await?;
        conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            params![token_hash],
        )
        .await?;
        Ok(())
    }

    pub async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let conn = self.connect().await?;
        let removed = conn
            .execute(
                "DELETE FROM sessions WHERE expires_at <= ?1",
                params![timestamp(now)],
            )
            .await?;
        if removed > 0 {
            debug!("purged {removed} expired sessions");
        }
        Ok(removed)
    }

    pub async fn insert_stream(&self, new_stream: NewStream) -> StoreResult<StreamRecord> {
        if self.user_by_id(&new_stream.creator_id).await?.is_none() {
            return Err(StoreError::NotFound { resource: "creator" });
        }

        let record = StreamRecord {
            id: Uuid::new_v4().to_string(),
            kind: new_stream.kind,
            url: new_stream.url,
            extracted_id: new_stream.extracted_id,
            title: new_stream.title,
            small_img: new_stream.small_img,
            big_img: new_stream.big_img,
            active: true,
            user_id: new_stream.creator_id,
            added_by: new_stream.added_by,
            created_at: timestamp(Utc::now()),
        };

        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO streams (
                id, type, url, extracted_id, title, small_img, big_img,
                active, user_id, added_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10)
            "#,
            params![
                record.id.as_str(),
                record.kind.as_str(),
                record.url.as_str(),
                record.extracted_id.as_str(),
                record.title.as_str(),
                record.small_img.as_str(),
                record.big_img.as_str(),
                record.user_id.as_str(),
                record.added_by.as_str(),
                record.created_at.as_str(),
            ],
        )
        .await?;

        debug!(
            "queued {} for creator {}",
            record.extracted_id, record.user_id
        );
        Ok(record)
    }

    pub async fn stream_by_id(&self, id: &str) -> StoreResult<Option<StreamRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {STREAM_COLUMNS} FROM streams s WHERE s.id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_stream(&row)?)),
            None => Ok(None),
        }
    }

    /// Active streams of `creator_id`, most upvoted first, annotated for
    /// `viewer_id`.
    pub async fn list_queue(
        &self,
        creator_id: &str,
        viewer_id: &str,
    ) -> StoreResult<Vec<QueueEntry>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {STREAM_COLUMNS},
                           (SELECT COUNT(*) FROM upvotes v WHERE v.stream_id = s.id) AS upvotes,
                           EXISTS (
                               SELECT 1 FROM upvotes v
                               WHERE v.stream_id = s.id AND v.user_id = ?2
                           ) AS have_upvoted
                    FROM streams s
                    WHERE s.user_id = ?1 AND s.active = 1
                    ORDER BY upvotes DESC, s.created_at ASC, s.rowid ASC
                    "#
                ),
                params![creator_id, viewer_id],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(QueueEntry {
                stream: row_to_stream(&row)?,
                upvotes: row.get::<i64>(11)?,
                have_upvoted: row.get::<i64>(12)? != 0,
            });
        }
        Ok(entries)
    }

    pub async fn current_stream(&self, creator_id: &str) -> StoreResult<Option<StreamRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {STREAM_COLUMNS}
                    FROM current_streams c
                    JOIN streams s ON s.id = c.stream_id
                    WHERE c.user_id = ?1
                    "#
                ),
                params![creator_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_stream(&row)?)),
            None => Ok(None),
        }
    }

    /// Records `user_id`'s vote for a queued stream. The active check and the
    /// insert are one statement, so a stream promoted by a concurrent
    /// `play_next` can never gain a vote.
    pub async fn upvote(&self, user_id: &str, stream_id: &str) -> StoreResult<()> {
        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                r#"
                INSERT INTO upvotes (user_id, stream_id)
                SELECT ?1, s.id FROM streams s WHERE s.id = ?2 AND s.active = 1
                ON CONFLICT(user_id, stream_id) DO NOTHING
                "#,
                params![user_id, stream_id],
            )
            .await?;
        if inserted > 0 {
            return Ok(());
        }

        // Nothing inserted: either the stream is not queued or the vote exists.
        let mut rows = conn
            .query(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM upvotes v
                    JOIN streams s ON s.id = v.stream_id
                    WHERE v.user_id = ?1 AND v.stream_id = ?2 AND s.active = 1
                )
                "#,
                params![user_id, stream_id],
            )
            .await?;
        let already_voted = match rows.next().await? {
            Some(row) => row.get::<i64>(0)? != 0,
            None => false,
        };

        if already_voted {
            Err(StoreError::Conflict("stream already upvoted".into()))
        } else {
            Err(StoreError::NotFound { resource: "stream" })
        }
    }

    pub async fn remove_upvote(&self, user_id: &str, stream_id: &str) -> StoreResult<()> {
        let conn = self.connect().await?;
        let removed = conn
            .execute(
                "DELETE FROM upvotes WHERE user_id = ?1 AND stream_id = ?2",
                params![user_id, stream_id],
            )
            .await?;

        if removed == 0 {
            return Err(StoreError::NotFound { resource: "upvote" });
        }
        Ok(())
    }

    /// Promotes the creator's most upvoted queued stream to "now playing" and
    /// takes it out of the queue. Selection and replacement happen in one
    /// immediate transaction, so there is never a moment with zero or two
    /// current streams for the creator. An empty queue clears the pointer.
    pub async fn play_next(&self, creator_id: &str) -> StoreResult<Option<StreamRecord>> {
        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        let mut rows = tx
            .query(
                &format!(
                    r#"
                    SELECT {STREAM_COLUMNS},
                           (SELECT COUNT(*) FROM upvotes v WHERE v.stream_id = s.id) AS upvotes
                    FROM streams s
                    WHERE s.user_id = ?1 AND s.active = 1
                    ORDER BY upvotes DESC, s.created_at ASC, s.rowid ASC
                    LIMIT 1
                    "#
                ),
                params![creator_id],
            )
            .await?;
        let next = match rows.next().await? {
            Some(row) => Some(row_to_stream(&row)?),
            None => None,
        };
        drop(rows);

        let Some(mut next) = next else {
            tx.execute(
                "DELETE FROM current_streams WHERE user_id = ?1",
                params![creator_id],
            )
            .await?;
            tx.commit().await?;
            debug!("queue of {creator_id} is empty; cleared current stream");
            return Ok(None);
        };

        tx.execute(
            r#"
            INSERT INTO current_streams (user_id, stream_id) VALUES (?1, ?2)
            ON CONFLICT(user_id) DO UPDATE SET stream_id = excluded.stream_id
            "#,
            params![creator_id, next.id.as_str()],
        )
        .await?;
        tx.execute(
            "UPDATE streams SET active = 0 WHERE id = ?1",
            params![next.id.as_str()],
        )
        .await?;
        tx.commit().await?;

        next.active = false;
        info!("creator {creator_id} now playing {}", next.extracted_id);
        Ok(Some(next))
    }
}

fn row_to_user(row: &Row) -> anyhow::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Column order must match `STREAM_COLUMNS`.
fn row_to_stream(row: &Row) -> anyhow::Result<StreamRecord> {
    let kind_raw: String = row.get(1)?;
    let kind = StreamKind::parse(&kind_raw)
        .with_context(|| format!("unknown stream type {kind_raw:?}"))?;
    Ok(StreamRecord {
        id: row.get(0)?,
        kind,
        url: row.get(2)?,
        extracted_id: row.get(3)?,
        title: row.get(4)?,
        small_img: row.get(5)?,
        big_img: row.get(6)?,
        active: row.get::<i64>(7)? != 0,
        user_id: row.get(8)?,
        added_by: row.get(9)?,
        created_at: row.get(10)?,
    })
}
