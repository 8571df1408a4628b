#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sequent-store-memory** – In-memory storage driver for Sequent.
//!
//! This crate provides a fast, non-persistent recorder suitable for
//! testing, development, and scenarios where event persistence is not
//! required. All data is stored in memory and lost when the process
//! terminates.
//!
//! Writers are serialized on the table write-lock, so notification-id
//! assignment is trivially contiguous: ids are taken as `max + 1 ..` while
//! the lock is held, and an id never exists outside a completed insert.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use sequent_store_core::{
    AggregateRecorder, ApplicationRecorder, ProcessRecorder, RecorderError, SequenceQuery,
};
use sequent_types::{Notification, NotificationId, Position, SequenceId, StoredEvent, Tracking};

#[derive(Default)]
struct Tables {
    sequences: HashMap<SequenceId, BTreeMap<Position, StoredEvent>>,
    notifications: BTreeMap<NotificationId, Notification>,
    next_notification: NotificationId,
    tracking: HashMap<(String, String), BTreeSet<NotificationId>>,
}

impl Tables {
    fn check_free(&self, records: &[StoredEvent]) -> Result<(), RecorderError> {
        let mut batch = BTreeSet::new();
        for record in records {
            let taken = self
                .sequences
                .get(&record.sequence_id)
                .map_or(false, |seq| seq.contains_key(&record.position));
            if taken || !batch.insert((record.sequence_id, record.position)) {
                return Err(RecorderError::SequenceConflict {
                    sequence_id: record.sequence_id,
                    position: record.position,
                });
            }
        }
        Ok(())
    }

    fn store(&mut self, records: Vec<StoredEvent>) {
        for record in records {
            self.sequences
                .entry(record.sequence_id)
                .or_default()
                .insert(record.position, record);
        }
    }

    fn assign_and_store(&mut self, records: Vec<StoredEvent>) -> Vec<NotificationId> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            self.next_notification += 1;
            let id = self.next_notification;
            ids.push(id);
            self.notifications.insert(
                id,
                Notification {
                    id,
                    sequence_id: record.sequence_id,
                    position: record.position,
                    topic: record.topic.clone(),
                    state: record.state.clone(),
                },
            );
            self.sequences
                .entry(record.sequence_id)
                .or_default()
                .insert(record.position, record);
        }
        ids
    }
}

/// An in-memory, non-persistent recorder implementing all three tiers.
#[derive(Clone, Default)]
pub struct MemoryRecorder {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryRecorder {
    /// Creates a new, empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of stored event records.
    pub async fn event_count(&self) -> usize {
        self.tables
            .read()
            .await
            .sequences
            .values()
            .map(|seq| seq.len())
            .sum()
    }

    /// Current number of notification records.
    pub async fn notification_count(&self) -> usize {
        self.tables.read().await.notifications.len()
    }

    /// Clear all tables. Useful for resetting test state.
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        *tables = Tables::default();
    }
}

#[async_trait]
impl AggregateRecorder for MemoryRecorder {
    async fn insert_events(&self, records: Vec<StoredEvent>) -> Result<(), RecorderError> {
        let mut tables = self.tables.write().await;
        tables.check_free(&records)?;
        tables.store(records);
        Ok(())
    }

    async fn select_events(
        &self,
        sequence_id: SequenceId,
        query: SequenceQuery,
    ) -> Result<Vec<StoredEvent>, RecorderError> {
        let tables = self.tables.read().await;
        let records = tables
            .sequences
            .get(&sequence_id)
            .map(|seq| seq.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(query.apply(records))
    }

    async fn delete_events(&self, sequence_id: SequenceId) -> Result<u64, RecorderError> {
        let mut tables = self.tables.write().await;
        let removed = tables
            .sequences
            .remove(&sequence_id)
            .map(|seq| seq.len() as u64)
            .unwrap_or(0);
        // Notification rows of the erased sequence disappear too, but ids
        // are never reassigned, so remaining readers keep their order.
        tables
            .notifications
            .retain(|_, n| n.sequence_id != sequence_id);
        Ok(removed)
    }
}

#[async_trait]
impl ApplicationRecorder for MemoryRecorder {
    async fn insert_notifications(
        &self,
        records: Vec<StoredEvent>,
    ) -> Result<Vec<NotificationId>, RecorderError> {
        let mut tables = self.tables.write().await;
        tables.check_free(&records)?;
        Ok(tables.assign_and_store(records))
    }

    async fn select_notifications(
        &self,
        after: Option<NotificationId>,
        limit: usize,
    ) -> Result<Vec<Notification>, RecorderError> {
        let tables = self.tables.read().await;
        let start = after.map_or(0, |id| id + 1);
        Ok(tables
            .notifications
            .range(start..)
            .take(limit)
            .map(|(_, n)| n.clone())
            .collect())
    }

    async fn max_notification_id(&self) -> Result<Option<NotificationId>, RecorderError> {
        let tables = self.tables.read().await;
        Ok(match tables.next_notification {
            0 => None,
            id => Some(id),
        })
    }
}

#[async_trait]
impl ProcessRecorder for MemoryRecorder {
    async fn insert_with_tracking(
        &self,
        records: Vec<StoredEvent>,
        tracking: Tracking,
    ) -> Result<Vec<NotificationId>, RecorderError> {
        let mut tables = self.tables.write().await;
        let key = (
            tracking.application_name.clone(),
            tracking.upstream_name.clone(),
        );
        if tables
            .tracking
            .get(&key)
            .map_or(false, |ids| ids.contains(&tracking.notification_id))
        {
            return Err(RecorderError::TrackingConflict {
                application_name: tracking.application_name,
                upstream_name: tracking.upstream_name,
                notification_id: tracking.notification_id,
            });
        }
        tables.check_free(&records)?;

        let ids = tables.assign_and_store(records);
        tables
            .tracking
            .entry(key)
            .or_default()
            .insert(tracking.notification_id);
        Ok(ids)
    }

    async fn max_tracking_id(
        &self,
        application_name: &str,
        upstream_name: &str,
    ) -> Result<Option<NotificationId>, RecorderError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tracking
            .get(&(application_name.to_owned(), upstream_name.to_owned()))
            .and_then(|ids| ids.last().copied()))
    }

    async fn has_tracking(
        &self,
        application_name: &str,
        upstream_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, RecorderError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tracking
            .get(&(application_name.to_owned(), upstream_name.to_owned()))
            .map_or(false, |ids| ids.contains(&notification_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequent_types::Topic;
    use uuid::Uuid;

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
        let recorder = MemoryRecorder::new();
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
        let recorder = MemoryRecorder::new();
        let seq = Uuid::new_v4();
        recorder.insert_events(vec![record(seq, 0)]).await.unwrap();

        let result = recorder
            .insert_events(vec![record(seq, 1), record(seq, 0)])
            .await;
        assert!(matches!(
            result,
            Err(RecorderError::SequenceConflict { position: 0, .. })
        ));
        // The non-conflicting half of the batch must not have landed.
        assert_eq!(recorder.event_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_position_within_batch_conflicts() {
        let recorder = MemoryRecorder::new();
        let seq = Uuid::new_v4();
        let result = recorder
            .insert_events(vec![record(seq, 0), record(seq, 0)])
            .await;
        assert!(matches!(
            result,
            Err(RecorderError::SequenceConflict { .. })
        ));
    }

    #[tokio::test]
    async fn notification_ids_are_contiguous_from_one() {
        let recorder = MemoryRecorder::new();
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

        let all = recorder.select_notifications(None, 10).await.unwrap();
        let ids: Vec<_> = all.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let after = recorder.select_notifications(Some(1), 10).await.unwrap();
        assert_eq!(after[0].id, 2);
    }

    #[tokio::test]
    async fn contiguous_ids_under_contention() {
        let recorder = MemoryRecorder::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let recorder = recorder.clone();
            let seq = Uuid::new_v4();
            handles.push(tokio::spawn(async move {
                for position in 0..100 {
                    recorder
                        .insert_notifications(vec![record(seq, position)])
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let all = recorder.select_notifications(None, 2_000).await.unwrap();
        let ids: Vec<_> = all.iter().map(|n| n.id).collect();
        assert_eq!(ids, (1..=1_000).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn tracking_is_exactly_once() {
        let recorder = MemoryRecorder::new();
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
        // The replayed records must not have landed.
        assert_eq!(recorder.event_count().await, 1);
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn tracking_with_no_new_events_is_recorded() {
        let recorder = MemoryRecorder::new();
        recorder
            .insert_with_tracking(Vec::new(), Tracking::new("b", "a", 7))
            .await
            .unwrap();
        assert!(recorder.has_tracking("b", "a", 7).await.unwrap());
        assert_eq!(recorder.max_notification_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn deletion_keeps_notification_order() {
        let recorder = MemoryRecorder::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        recorder
            .insert_notifications(vec![record(a, 0), record(b, 0)])
            .await
            .unwrap();

        assert_eq!(recorder.delete_events(a).await.unwrap(), 1);
        assert_eq!(recorder.delete_events(a).await.unwrap(), 0);

        // Remaining notifications keep their original ids; the head does
        // not move backwards.
        let all = recorder.select_notifications(None, 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 2);
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(2));
    }
}
