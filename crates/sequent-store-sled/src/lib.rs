#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sequent-store-sled** – Sled-based persistent storage driver for
//! Sequent.
//!
//! This crate provides a durable, embedded recorder using the sled
//! database engine. It offers ACID multi-tree transactions, crash
//! recovery, and efficient on-disk storage while maintaining the same
//! interface as the other drivers.
//!
//! Notification ids come from a durable issuer: a counter record advanced
//! inside the same sled transaction that inserts the rows. An id that is
//! visible was committed together with its row, so readers never observe a
//! gap, and the counter never moves backwards, so an id is never reused.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use uuid::Uuid;

use sequent_store_core::{
    AggregateRecorder, ApplicationRecorder, ProcessRecorder, RecorderError, SequenceQuery,
};
use sequent_types::{
    Notification, NotificationId, Position, SequenceId, StoredEvent, Topic, Tracking,
};

const COUNTER_KEY: &[u8] = b"notification_head";

#[derive(Serialize, Deserialize)]
struct EventRow {
    topic: String,
    state: Vec<u8>,
    notification_id: Option<NotificationId>,
}

/// A persistent recorder backed by the sled embedded database.
#[derive(Debug, Clone)]
pub struct SledRecorder {
    _db: Db, // Keeps the database open for the recorder's lifetime
    events: Tree,
    notifications: Tree,
    tracking: Tree,
    counters: Tree,
}

impl SledRecorder {
    /// Opens or creates a database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RecorderError> {
        Self::open_with_config(path, sled::Config::default())
    }

    /// Opens a database with custom sled configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: sled::Config,
    ) -> Result<Self, RecorderError> {
        let db = config.path(path).open().map_err(operational)?;
        Self::from_db(db)
    }

    /// Creates a recorder from an existing sled database instance.
    pub fn from_db(db: Db) -> Result<Self, RecorderError> {
        Ok(Self {
            events: db.open_tree("events").map_err(operational)?,
            notifications: db.open_tree("notifications").map_err(operational)?,
            tracking: db.open_tree("tracking").map_err(operational)?,
            counters: db.open_tree("counters").map_err(operational)?,
            _db: db,
        })
    }

    /// Creates a temporary recorder for testing purposes.
    #[cfg(test)]
    fn temporary() -> Result<Self, RecorderError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(operational)?;
        Self::from_db(db)
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<(), RecorderError> {
        self.events.flush_async().await.map_err(operational)?;
        self.notifications.flush_async().await.map_err(operational)?;
        self.tracking.flush_async().await.map_err(operational)?;
        self.counters.flush_async().await.map_err(operational)?;
        Ok(())
    }

    fn run_insert(
        &self,
        records: &[StoredEvent],
        tracking: Option<&Tracking>,
        notify: bool,
    ) -> Result<Vec<NotificationId>, RecorderError> {
        let trees: &[&Tree] = &[&self.events, &self.notifications, &self.tracking, &self.counters];
        let result = trees.transaction(|trees| {
                let (events, notifications, tracking_tree, counters) =
                    (&trees[0], &trees[1], &trees[2], &trees[3]);
                if let Some(t) = tracking {
                    let key = tracking_key(&t.application_name, &t.upstream_name, t.notification_id);
                    if tracking_tree.get(&key)?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            RecorderError::TrackingConflict {
                                application_name: t.application_name.clone(),
                                upstream_name: t.upstream_name.clone(),
                                notification_id: t.notification_id,
                            },
                        ));
                    }
                    tracking_tree.insert(key.as_slice(), Vec::<u8>::new())?;
                }

                let mut batch_keys = std::collections::BTreeSet::new();
                for record in records {
                    let key = event_key(record.sequence_id, record.position);
                    if events.get(key)?.is_some() || !batch_keys.insert(key) {
                        return Err(ConflictableTransactionError::Abort(
                            RecorderError::SequenceConflict {
                                sequence_id: record.sequence_id,
                                position: record.position,
                            },
                        ));
                    }
                }

                let mut next_id = if notify {
                    counters
                        .get(COUNTER_KEY)?
                        .map(|v| decode_u64(&v))
                        .transpose()
                        .map_err(ConflictableTransactionError::Abort)?
                        .unwrap_or(0)
                } else {
                    0
                };

                let mut ids = Vec::with_capacity(records.len());
                for record in records {
                    let notification_id = if notify {
                        next_id += 1;
                        ids.push(next_id);
                        Some(next_id)
                    } else {
                        None
                    };
                    let row = EventRow {
                        topic: record.topic.as_str().to_owned(),
                        state: record.state.clone(),
                        notification_id,
                    };
                    let bytes = serde_json::to_vec(&row).map_err(|e| {
                        ConflictableTransactionError::Abort(RecorderError::Integrity(
                            format!("row encoding failed: {e}"),
                        ))
                    })?;
                    let key = event_key(record.sequence_id, record.position);
                    events.insert(key.as_slice(), bytes)?;
                    if let Some(id) = notification_id {
                        notifications.insert(id.to_be_bytes().to_vec(), key.as_slice())?;
                    }
                }

                if notify {
                    counters.insert(COUNTER_KEY, next_id.to_be_bytes().to_vec())?;
                }

                Ok(ids)
            });

        result.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => operational(err),
        })
    }

    fn read_event(&self, key: &[u8]) -> Result<Option<StoredEvent>, RecorderError> {
        let Some(bytes) = self.events.get(key).map_err(operational)? else {
            return Ok(None);
        };
        let (sequence_id, position) = split_event_key(key)?;
        let row: EventRow = serde_json::from_slice(&bytes)
            .map_err(|e| RecorderError::Integrity(format!("malformed event row: {e}")))?;
        Ok(Some(StoredEvent {
            sequence_id,
            position,
            topic: Topic::new(row.topic),
            state: row.state,
        }))
    }
}

#[async_trait]
impl AggregateRecorder for SledRecorder {
    async fn insert_events(&self, records: Vec<StoredEvent>) -> Result<(), RecorderError> {
        self.run_insert(&records, None, false).map(|_| ())
    }

    async fn select_events(
        &self,
        sequence_id: SequenceId,
        query: SequenceQuery,
    ) -> Result<Vec<StoredEvent>, RecorderError> {
        let mut records = Vec::new();
        for entry in self.events.scan_prefix(sequence_id.as_bytes()) {
            let (key, bytes) = entry.map_err(operational)?;
            let (_, position) = split_event_key(&key)?;
            let row: EventRow = serde_json::from_slice(&bytes)
                .map_err(|e| RecorderError::Integrity(format!("malformed event row: {e}")))?;
            records.push(StoredEvent {
                sequence_id,
                position,
                topic: Topic::new(row.topic),
                state: row.state,
            });
        }
        Ok(query.apply(records))
    }

    async fn delete_events(&self, sequence_id: SequenceId) -> Result<u64, RecorderError> {
        let mut removed = 0;
        for entry in self.events.scan_prefix(sequence_id.as_bytes()) {
            let (key, bytes) = entry.map_err(operational)?;
            let row: EventRow = serde_json::from_slice(&bytes)
                .map_err(|e| RecorderError::Integrity(format!("malformed event row: {e}")))?;
            self.events.remove(&key).map_err(operational)?;
            if let Some(id) = row.notification_id {
                self.notifications
                    .remove(id.to_be_bytes())
                    .map_err(operational)?;
            }
            removed += 1;
        }
        Ok(removed)
    }
}

#[async_trait]
impl ApplicationRecorder for SledRecorder {
    async fn insert_notifications(
        &self,
        records: Vec<StoredEvent>,
    ) -> Result<Vec<NotificationId>, RecorderError> {
        self.run_insert(&records, None, true)
    }

    async fn select_notifications(
        &self,
        after: Option<NotificationId>,
        limit: usize,
    ) -> Result<Vec<Notification>, RecorderError> {
        let start = after.map_or(1, |id| id + 1);
        let mut out = Vec::new();
        for entry in self.notifications.range(start.to_be_bytes()..) {
            if out.len() == limit {
                break;
            }
            let (id_bytes, event_key) = entry.map_err(operational)?;
            let id = decode_u64(&id_bytes)?;
            // Erased sequences leave no pointer target; their ids simply
            // no longer appear in the log.
            if let Some(record) = self.read_event(&event_key)? {
                out.push(Notification {
                    id,
                    sequence_id: record.sequence_id,
                    position: record.position,
                    topic: record.topic,
                    state: record.state,
                });
            }
        }
        Ok(out)
    }

    async fn max_notification_id(&self) -> Result<Option<NotificationId>, RecorderError> {
        self.counters
            .get(COUNTER_KEY)
            .map_err(operational)?
            .map(|v| decode_u64(&v))
            .transpose()
            .map(|head| head.filter(|id| *id > 0))
    }
}

#[async_trait]
impl ProcessRecorder for SledRecorder {
    async fn insert_with_tracking(
        &self,
        records: Vec<StoredEvent>,
        tracking: Tracking,
    ) -> Result<Vec<NotificationId>, RecorderError> {
        self.run_insert(&records, Some(&tracking), true)
    }

    async fn max_tracking_id(
        &self,
        application_name: &str,
        upstream_name: &str,
    ) -> Result<Option<NotificationId>, RecorderError> {
        let prefix = tracking_prefix(application_name, upstream_name);
        let Some(entry) = self.tracking.scan_prefix(&prefix).last() else {
            return Ok(None);
        };
        let (key, _) = entry.map_err(operational)?;
        let id_bytes = &key[prefix.len()..];
        decode_u64(id_bytes).map(Some)
    }

    async fn has_tracking(
        &self,
        application_name: &str,
        upstream_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, RecorderError> {
        let key = tracking_key(application_name, upstream_name, notification_id);
        self.tracking
            .contains_key(key)
            .map_err(operational)
    }
}

fn event_key(sequence_id: SequenceId, position: Position) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(sequence_id.as_bytes());
    key[16..].copy_from_slice(&position.to_be_bytes());
    key
}

fn split_event_key(key: &[u8]) -> Result<(SequenceId, Position), RecorderError> {
    if key.len() != 24 {
        return Err(RecorderError::Integrity(format!(
            "malformed event key of {} bytes",
            key.len()
        )));
    }
    let sequence_id = Uuid::from_slice(&key[..16])
        .map_err(|e| RecorderError::Integrity(format!("malformed sequence id: {e}")))?;
    let mut position = [0u8; 8];
    position.copy_from_slice(&key[16..]);
    Ok((sequence_id, Position::from_be_bytes(position)))
}

fn tracking_prefix(application_name: &str, upstream_name: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(application_name.len() + upstream_name.len() + 2);
    prefix.extend_from_slice(application_name.as_bytes());
    prefix.push(0);
    prefix.extend_from_slice(upstream_name.as_bytes());
    prefix.push(0);
    prefix
}

fn tracking_key(
    application_name: &str,
    upstream_name: &str,
    notification_id: NotificationId,
) -> Vec<u8> {
    let mut key = tracking_prefix(application_name, upstream_name);
    key.extend_from_slice(&notification_id.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64, RecorderError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| RecorderError::Integrity(format!("malformed counter of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

fn operational(e: sled::Error) -> RecorderError {
    RecorderError::Operational(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sequence_id: SequenceId, position: Position) -> StoredEvent {
        StoredEvent {
            sequence_id,
            position,
            topic: Topic::new("test.Event"),
            state: vec![position as u8],
        }
    }

    #[tokio::test]
    async fn insert_and_select_by_sequence() {
        let recorder = SledRecorder::temporary().unwrap();
        let seq = Uuid::new_v4();

        recorder
            .insert_events(vec![record(seq, 0), record(seq, 1), record(seq, 2)])
            .await
            .unwrap();

        let all = recorder
            .select_events(seq, SequenceQuery::all())
            .await
            .unwrap();
        let positions: Vec<_> = all.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);

        let newest = recorder
            .select_events(seq, SequenceQuery::all().descending().limit(1))
            .await
            .unwrap();
        assert_eq!(newest[0].position, 2);
    }

    #[tokio::test]
    async fn conflicting_batch_changes_nothing() {
        let recorder = SledRecorder::temporary().unwrap();
        let seq = Uuid::new_v4();
        recorder.insert_events(vec![record(seq, 0)]).await.unwrap();

        let result = recorder
            .insert_events(vec![record(seq, 1), record(seq, 0)])
            .await;
        assert!(matches!(
            result,
            Err(RecorderError::SequenceConflict { position: 0, .. })
        ));

        let all = recorder
            .select_events(seq, SequenceQuery::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn issuer_assigns_contiguous_ids() {
        let recorder = SledRecorder::temporary().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = recorder
            .insert_notifications(vec![record(a, 0), record(a, 1)])
            .await
            .unwrap();
        let second = recorder
            .insert_notifications(vec![record(b, 0)])
            .await
            .unwrap();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3]);
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(3));

        let tail = recorder.select_notifications(Some(1), 10).await.unwrap();
        let ids: Vec<_> = tail.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn failed_insert_does_not_consume_ids() {
        let recorder = SledRecorder::temporary().unwrap();
        let seq = Uuid::new_v4();

        recorder
            .insert_notifications(vec![record(seq, 0)])
            .await
            .unwrap();
        // Aborted transaction: the conflicting batch must not advance the
        // issuer.
        let conflict = recorder
            .insert_notifications(vec![record(seq, 0)])
            .await;
        assert!(conflict.is_err());

        let next = recorder
            .insert_notifications(vec![record(seq, 1)])
            .await
            .unwrap();
        assert_eq!(next, vec![2]);
    }

    #[tokio::test]
    async fn tracking_is_exactly_once() {
        let recorder = SledRecorder::temporary().unwrap();
        let seq = Uuid::new_v4();

        recorder
            .insert_with_tracking(vec![record(seq, 0)], Tracking::new("b", "a", 1))
            .await
            .unwrap();
        assert!(recorder.has_tracking("b", "a", 1).await.unwrap());
        assert_eq!(recorder.max_tracking_id("b", "a").await.unwrap(), Some(1));

        let replay = recorder
            .insert_with_tracking(vec![record(seq, 1)], Tracking::new("b", "a", 1))
            .await;
        assert!(matches!(
            replay,
            Err(RecorderError::TrackingConflict { notification_id: 1, .. })
        ));

        let all = recorder
            .select_events(seq, SequenceQuery::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn erased_ids_are_never_reused() {
        let recorder = SledRecorder::temporary().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        recorder
            .insert_notifications(vec![record(a, 0), record(a, 1)])
            .await
            .unwrap();
        assert_eq!(recorder.delete_events(a).await.unwrap(), 2);

        // The issuer never moves backwards.
        let ids = recorder
            .insert_notifications(vec![record(b, 0)])
            .await
            .unwrap();
        assert_eq!(ids, vec![3]);

        let visible = recorder.select_notifications(None, 10).await.unwrap();
        let ids: Vec<_> = visible.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let seq = Uuid::new_v4();

        {
            let recorder = SledRecorder::open(dir.path()).unwrap();
            recorder
                .insert_notifications(vec![record(seq, 0)])
                .await
                .unwrap();
            recorder.flush().await.unwrap();
        }

        let recorder = SledRecorder::open(dir.path()).unwrap();
        let all = recorder
            .select_events(seq, SequenceQuery::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(1));
    }
}
