#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sequent-store-sqlite** – SQLite-based persistent storage driver for
//! Sequent.
//!
//! This crate provides a reliable, portable recorder using the SQLite
//! database engine via sqlx. It offers ACID transactions and efficient
//! storage while maintaining the same interface as the other drivers.
//!
//! Notification-id assignment runs inside `BEGIN IMMEDIATE` transactions:
//! SQLite serializes writers, so `MAX(notification_id) + n` read inside the
//! inserting transaction is stable and readers never observe a gap. A
//! bookkeeping row remembers the head across erasure of the newest records,
//! so an id is never reused.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use sequent_store_core::{
    AggregateRecorder, ApplicationRecorder, ProcessRecorder, RecorderError, SequenceQuery,
};
use sequent_types::{Notification, NotificationId, SequenceId, StoredEvent, Topic, Tracking};

/// Default write-lock wait bound, in milliseconds.
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// A persistent recorder backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteRecorder {
    pool: SqlitePool,
}

impl SqliteRecorder {
    /// Opens or creates a database at the specified path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, RecorderError> {
        Self::open_with_lock_timeout(path, DEFAULT_LOCK_TIMEOUT_MS).await
    }

    /// Opens or creates a database with an explicit write-lock wait bound.
    pub async fn open_with_lock_timeout<P: AsRef<Path>>(
        path: P,
        lock_timeout_ms: u64,
    ) -> Result<Self, RecorderError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_millis(lock_timeout_ms));
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(operational)?;
        Self::from_pool(pool).await
    }

    /// Opens an in-memory database.
    ///
    /// The pool is capped at one connection: every pooled `:memory:`
    /// connection would otherwise be a separate database.
    pub async fn in_memory() -> Result<Self, RecorderError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(operational)?;
        Self::from_pool(pool).await
    }

    /// Creates a recorder from an existing pool, running migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, RecorderError> {
        let recorder = Self { pool };
        recorder.migrate().await?;
        Ok(recorder)
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), RecorderError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stored_events (
                sequence_id BLOB NOT NULL,
                position INTEGER NOT NULL,
                topic TEXT NOT NULL,
                state BLOB NOT NULL,
                notification_id INTEGER,
                PRIMARY KEY (sequence_id, position)
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(operational)?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_stored_events_notification
             ON stored_events(notification_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(operational)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracking (
                application_name TEXT NOT NULL,
                upstream_name TEXT NOT NULL,
                notification_id INTEGER NOT NULL,
                PRIMARY KEY (application_name, upstream_name, notification_id)
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(operational)?;

        // Remembers the highest id ever assigned, so erasing the newest
        // records never lets an id be reused.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_head (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                head INTEGER NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(operational)?;

        sqlx::query("INSERT OR IGNORE INTO notification_head (id, head) VALUES (0, 0)")
            .execute(&self.pool)
            .await
            .map_err(operational)?;

        Ok(())
    }

    async fn tx_insert(
        &self,
        records: Vec<StoredEvent>,
        tracking: Option<Tracking>,
        notify: bool,
    ) -> Result<Vec<NotificationId>, RecorderError> {
        let mut conn = self.pool.acquire().await.map_err(operational)?;

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(operational)?;

        match insert_body(&mut conn, records, tracking, notify).await {
            Ok(ids) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(operational)?;
                Ok(ids)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }
}

async fn insert_body(
    conn: &mut SqliteConnection,
    records: Vec<StoredEvent>,
    tracking: Option<Tracking>,
    notify: bool,
) -> Result<Vec<NotificationId>, RecorderError> {
    if let Some(tracking) = tracking {
        sqlx::query(
            "INSERT INTO tracking (application_name, upstream_name, notification_id)
             VALUES (?, ?, ?)",
        )
        .bind(&tracking.application_name)
        .bind(&tracking.upstream_name)
        .bind(tracking.notification_id as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RecorderError::TrackingConflict {
                    application_name: tracking.application_name.clone(),
                    upstream_name: tracking.upstream_name.clone(),
                    notification_id: tracking.notification_id,
                }
            } else {
                operational(e)
            }
        })?;
    }

    let mut next_id = if notify {
        let row = sqlx::query(
            "SELECT MAX(
                 COALESCE((SELECT MAX(notification_id) FROM stored_events), 0),
                 (SELECT head FROM notification_head WHERE id = 0)
             ) AS head",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(operational)?;
        row.get::<i64, _>("head") as NotificationId
    } else {
        0
    };

    let mut ids = Vec::with_capacity(records.len());
    for record in &records {
        let notification_id = if notify {
            next_id += 1;
            ids.push(next_id);
            Some(next_id as i64)
        } else {
            None
        };
        sqlx::query(
            "INSERT INTO stored_events (sequence_id, position, topic, state, notification_id)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.sequence_id.as_bytes().to_vec())
        .bind(record.position as i64)
        .bind(record.topic.as_str())
        .bind(&record.state)
        .bind(notification_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RecorderError::SequenceConflict {
                    sequence_id: record.sequence_id,
                    position: record.position,
                }
            } else {
                operational(e)
            }
        })?;
    }

    Ok(ids)
}

#[async_trait]
impl AggregateRecorder for SqliteRecorder {
    async fn insert_events(&self, records: Vec<StoredEvent>) -> Result<(), RecorderError> {
        self.tx_insert(records, None, false).await.map(|_| ())
    }

    async fn select_events(
        &self,
        sequence_id: SequenceId,
        query: SequenceQuery,
    ) -> Result<Vec<StoredEvent>, RecorderError> {
        let mut sql = String::from(
            "SELECT sequence_id, position, topic, state FROM stored_events WHERE sequence_id = ?",
        );
        if query.gt.is_some() {
            sql.push_str(" AND position > ?");
        }
        if query.gte.is_some() {
            sql.push_str(" AND position >= ?");
        }
        if query.lt.is_some() {
            sql.push_str(" AND position < ?");
        }
        if query.lte.is_some() {
            sql.push_str(" AND position <= ?");
        }
        sql.push_str(if query.descending {
            " ORDER BY position DESC"
        } else {
            " ORDER BY position ASC"
        });
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(sequence_id.as_bytes().to_vec());
        for bound in [query.gt, query.gte, query.lt, query.lte]
            .into_iter()
            .flatten()
        {
            q = q.bind(bound as i64);
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit as i64);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(operational)?;
        rows.iter().map(stored_event_from_row).collect()
    }

    async fn delete_events(&self, sequence_id: SequenceId) -> Result<u64, RecorderError> {
        let mut conn = self.pool.acquire().await.map_err(operational)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(operational)?;

        let result = async {
            // Keep the head watermark ahead of any id being erased.
            sqlx::query(
                "UPDATE notification_head SET head = MAX(head,
                     COALESCE((SELECT MAX(notification_id) FROM stored_events
                               WHERE sequence_id = ?), 0))
                 WHERE id = 0",
            )
            .bind(sequence_id.as_bytes().to_vec())
            .execute(&mut *conn)
            .await
            .map_err(operational)?;

            sqlx::query("DELETE FROM stored_events WHERE sequence_id = ?")
                .bind(sequence_id.as_bytes().to_vec())
                .execute(&mut *conn)
                .await
                .map_err(operational)
        }
        .await;

        match result {
            Ok(done) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(operational)?;
                Ok(done.rows_affected())
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ApplicationRecorder for SqliteRecorder {
    async fn insert_notifications(
        &self,
        records: Vec<StoredEvent>,
    ) -> Result<Vec<NotificationId>, RecorderError> {
        self.tx_insert(records, None, true).await
    }

    async fn select_notifications(
        &self,
        after: Option<NotificationId>,
        limit: usize,
    ) -> Result<Vec<Notification>, RecorderError> {
        let rows = sqlx::query(
            "SELECT notification_id, sequence_id, position, topic, state
             FROM stored_events
             WHERE notification_id > ?
             ORDER BY notification_id ASC
             LIMIT ?",
        )
        .bind(after.unwrap_or(0) as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(operational)?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn max_notification_id(&self) -> Result<Option<NotificationId>, RecorderError> {
        let row = sqlx::query("SELECT MAX(notification_id) AS head FROM stored_events")
            .fetch_one(&self.pool)
            .await
            .map_err(operational)?;
        let head: Option<i64> = row.get("head");
        Ok(head.map(|id| id as NotificationId))
    }
}

#[async_trait]
impl ProcessRecorder for SqliteRecorder {
    async fn insert_with_tracking(
        &self,
        records: Vec<StoredEvent>,
        tracking: Tracking,
    ) -> Result<Vec<NotificationId>, RecorderError> {
        self.tx_insert(records, Some(tracking), true).await
    }

    async fn max_tracking_id(
        &self,
        application_name: &str,
        upstream_name: &str,
    ) -> Result<Option<NotificationId>, RecorderError> {
        let row = sqlx::query(
            "SELECT MAX(notification_id) AS head FROM tracking
             WHERE application_name = ? AND upstream_name = ?",
        )
        .bind(application_name)
        .bind(upstream_name)
        .fetch_one(&self.pool)
        .await
        .map_err(operational)?;
        let head: Option<i64> = row.get("head");
        Ok(head.map(|id| id as NotificationId))
    }

    async fn has_tracking(
        &self,
        application_name: &str,
        upstream_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, RecorderError> {
        let row = sqlx::query(
            "SELECT 1 FROM tracking
             WHERE application_name = ? AND upstream_name = ? AND notification_id = ?",
        )
        .bind(application_name)
        .bind(upstream_name)
        .bind(notification_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(operational)?;
        Ok(row.is_some())
    }
}

fn stored_event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredEvent, RecorderError> {
    Ok(StoredEvent {
        sequence_id: sequence_id_from_row(row)?,
        position: row.get::<i64, _>("position") as u64,
        topic: Topic::new(row.get::<String, _>("topic")),
        state: row.get("state"),
    })
}

fn notification_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Notification, RecorderError> {
    Ok(Notification {
        id: row.get::<i64, _>("notification_id") as NotificationId,
        sequence_id: sequence_id_from_row(row)?,
        position: row.get::<i64, _>("position") as u64,
        topic: Topic::new(row.get::<String, _>("topic")),
        state: row.get("state"),
    })
}

fn sequence_id_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SequenceId, RecorderError> {
    let bytes: Vec<u8> = row.get("sequence_id");
    Uuid::from_slice(&bytes)
        .map_err(|e| RecorderError::Integrity(format!("malformed sequence id: {e}")))
}

fn operational(e: sqlx::Error) -> RecorderError {
    RecorderError::Operational(e.into())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
