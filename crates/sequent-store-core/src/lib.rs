#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sequent-store-core** – Core storage abstractions for Sequent.
//!
//! This crate defines the recorder contracts that storage backends must
//! satisfy, the error taxonomy shared across the storage layer, and the
//! [`EventStore`] facade that combines a recorder with the codec pipeline.
//! Concrete drivers (in-memory, SQLite, sled) implement these traits in
//! separate crates that depend on this core abstraction.

use async_trait::async_trait;

use sequent_types::{Notification, NotificationId, Position, SequenceId, StoredEvent, Tracking};

mod config;
mod store;

pub use config::{BackendKind, CompressorKind, RuntimeSettings};
pub use store::{EventStore, StoreError};

//─────────────────────────────
//  Error taxonomy
//─────────────────────────────

/// Errors produced by recorders.
///
/// Conflicts are the optimistic-concurrency signals the layers above
/// recover from; `Operational` is transient and retryable with backoff;
/// `Integrity` is fatal for the affected record and never swallowed.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// A `(sequence_id, position)` pair already exists.
    #[error("position {position} already recorded in sequence {sequence_id}")]
    SequenceConflict {
        /// The conflicting sequence.
        sequence_id: SequenceId,
        /// The conflicting position.
        position: Position,
    },
    /// The `(application, upstream, notification_id)` triple already exists.
    #[error("notification {notification_id} from '{upstream_name}' already tracked by '{application_name}'")]
    TrackingConflict {
        /// The consuming process.
        application_name: String,
        /// The source notification log.
        upstream_name: String,
        /// The already-tracked notification.
        notification_id: NotificationId,
    },
    /// Transient backend fault; retryable with bounded backoff.
    #[error("operational storage failure: {0}")]
    Operational(#[source] anyhow::Error),
    /// A stored record is malformed at the storage layer.
    #[error("stored data integrity failure: {0}")]
    Integrity(String),
}

//─────────────────────────────
//  Sequence queries
//─────────────────────────────

/// Position filter for per-sequence reads.
///
/// Bounds are inclusive or exclusive per field; `ascending` defaults to
/// true; `limit` truncates after ordering.
#[derive(Debug, Clone, Default)]
pub struct SequenceQuery {
    /// Exclusive lower bound.
    pub gt: Option<Position>,
    /// Inclusive lower bound.
    pub gte: Option<Position>,
    /// Exclusive upper bound.
    pub lt: Option<Position>,
    /// Inclusive upper bound.
    pub lte: Option<Position>,
    /// Maximum number of records returned.
    pub limit: Option<usize>,
    /// Descending order when true.
    pub descending: bool,
}

impl SequenceQuery {
    /// All records, ascending.
    pub fn all() -> Self {
        Self::default()
    }

    /// Exclusive lower bound.
    pub fn gt(mut self, position: Position) -> Self {
        self.gt = Some(position);
        self
    }

    /// Inclusive lower bound.
    pub fn gte(mut self, position: Position) -> Self {
        self.gte = Some(position);
        self
    }

    /// Exclusive upper bound.
    pub fn lt(mut self, position: Position) -> Self {
        self.lt = Some(position);
        self
    }

    /// Inclusive upper bound.
    pub fn lte(mut self, position: Position) -> Self {
        self.lte = Some(position);
        self
    }

    /// Truncate after ordering.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Return records in descending position order.
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Whether a position satisfies the bounds.
    pub fn matches(&self, position: Position) -> bool {
        self.gt.map_or(true, |b| position > b)
            && self.gte.map_or(true, |b| position >= b)
            && self.lt.map_or(true, |b| position < b)
            && self.lte.map_or(true, |b| position <= b)
    }

    /// Filter, order and truncate a record set in memory.
    ///
    /// Shared by drivers whose native store does not evaluate the query.
    pub fn apply(&self, records: impl IntoIterator<Item = StoredEvent>) -> Vec<StoredEvent> {
        let mut out: Vec<StoredEvent> = records
            .into_iter()
            .filter(|r| self.matches(r.position))
            .collect();
        out.sort_by_key(|r| r.position);
        if self.descending {
            out.reverse();
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

//─────────────────────────────
//  Recorder contracts
//─────────────────────────────

/// The minimum recorder: atomic per-sequence insertion with optimistic
/// concurrency, plus per-sequence reads.
#[async_trait]
pub trait AggregateRecorder: Send + Sync {
    /// Atomically insert all records.
    ///
    /// Fails with [`RecorderError::SequenceConflict`] if any
    /// `(sequence_id, position)` pair already exists; on failure nothing
    /// is inserted.
    async fn insert_events(&self, records: Vec<StoredEvent>) -> Result<(), RecorderError>;

    /// Read records of one sequence, filtered and ordered by position.
    async fn select_events(
        &self,
        sequence_id: SequenceId,
        query: SequenceQuery,
    ) -> Result<Vec<StoredEvent>, RecorderError>;

    /// Delete all stored records of a sequence, returning the count.
    ///
    /// Supports erasure compliance only; assigned notification ids are
    /// never removed or renumbered, so the global order keeps its
    /// contiguity for readers.
    async fn delete_events(&self, sequence_id: SequenceId) -> Result<u64, RecorderError>;
}

/// A recorder that additionally assigns each inserted record a globally
/// unique, contiguous notification id, and can read across all sequences
/// in notification order.
#[async_trait]
pub trait ApplicationRecorder: AggregateRecorder {
    /// Atomically insert all records and assign their notification ids.
    ///
    /// Ids are contiguous from 1: whenever a record with id `k` is visible
    /// to a reader, every record with id `< k` is already visible, and an
    /// id never escapes a transaction that does not commit.
    async fn insert_notifications(
        &self,
        records: Vec<StoredEvent>,
    ) -> Result<Vec<NotificationId>, RecorderError>;

    /// Read records across all sequences in ascending notification order,
    /// strictly after `after` (from the start when `None`).
    async fn select_notifications(
        &self,
        after: Option<NotificationId>,
        limit: usize,
    ) -> Result<Vec<Notification>, RecorderError>;

    /// The highest assigned notification id, if any.
    async fn max_notification_id(&self) -> Result<Option<NotificationId>, RecorderError>;
}

/// A recorder for process applications: commits a tracking record in the
/// same atomic transaction as the event records it produced.
#[async_trait]
pub trait ProcessRecorder: ApplicationRecorder {
    /// Atomically insert the records, assign notification ids, and commit
    /// the tracking record; all or nothing.
    ///
    /// Fails with [`RecorderError::TrackingConflict`] if the tracking
    /// triple already exists, leaving the store unchanged.
    async fn insert_with_tracking(
        &self,
        records: Vec<StoredEvent>,
        tracking: Tracking,
    ) -> Result<Vec<NotificationId>, RecorderError>;

    /// The highest upstream notification tracked by `application_name`
    /// for `upstream_name`, if any.
    async fn max_tracking_id(
        &self,
        application_name: &str,
        upstream_name: &str,
    ) -> Result<Option<NotificationId>, RecorderError>;

    /// Whether the exact tracking triple has been committed.
    async fn has_tracking(
        &self,
        application_name: &str,
        upstream_name: &str,
        notification_id: NotificationId,
    ) -> Result<bool, RecorderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequent_types::Topic;

    fn record(position: Position) -> StoredEvent {
        StoredEvent {
            sequence_id: uuid::Uuid::nil(),
            position,
            topic: Topic::new("t"),
            state: Vec::new(),
        }
    }

    #[test]
    fn query_bounds_compose() {
        let query = SequenceQuery::all().gte(2).lt(5);
        assert!(!query.matches(1));
        assert!(query.matches(2));
        assert!(query.matches(4));
        assert!(!query.matches(5));
    }

    #[test]
    fn query_apply_orders_and_truncates() {
        let records = vec![record(3), record(0), record(2), record(1)];

        let asc = SequenceQuery::all().apply(records.clone());
        let positions: Vec<_> = asc.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);

        let top_two = SequenceQuery::all().descending().limit(2).apply(records);
        let positions: Vec<_> = top_two.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![3, 2]);
    }
}
