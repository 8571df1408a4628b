//! The event store facade: codec pipeline + recorder.

use std::sync::Arc;

use sequent_codec::{CodecError, EventMapper};
use sequent_types::{DomainEvent, NotificationId, Position, SequenceId, Tracking};
use tracing::debug;

use crate::{
    AggregateRecorder, ApplicationRecorder, ProcessRecorder, RecorderError, SequenceQuery,
};

/// Errors surfaced by the event store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer appended at the same `(sequence_id, position)`.
    ///
    /// The caller reloads the aggregate and retries.
    #[error("optimistic concurrency conflict on sequence {sequence_id} at position {position}")]
    Concurrency {
        /// The contended sequence.
        sequence_id: SequenceId,
        /// The contended position.
        position: Position,
    },
    /// Encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Any other recorder failure, including tracking conflicts.
    #[error(transparent)]
    Recorder(RecorderError),
}

impl From<RecorderError> for StoreError {
    fn from(err: RecorderError) -> Self {
        match err {
            RecorderError::SequenceConflict { sequence_id, position } => {
                StoreError::Concurrency { sequence_id, position }
            }
            other => StoreError::Recorder(other),
        }
    }
}

/// Thin facade combining an [`EventMapper`] with a recorder.
///
/// Generic over the recorder tier: sequence-level operations need only an
/// [`AggregateRecorder`], notification reads an [`ApplicationRecorder`],
/// and tracked commits a [`ProcessRecorder`].
pub struct EventStore<R: ?Sized> {
    mapper: Arc<EventMapper>,
    recorder: Arc<R>,
}

impl<R: ?Sized> Clone for EventStore<R> {
    fn clone(&self) -> Self {
        Self {
            mapper: Arc::clone(&self.mapper),
            recorder: Arc::clone(&self.recorder),
        }
    }
}

impl<R: ?Sized> EventStore<R> {
    /// Combine a mapper and a recorder.
    pub fn new(mapper: Arc<EventMapper>, recorder: Arc<R>) -> Self {
        Self { mapper, recorder }
    }

    /// The codec pipeline.
    pub fn mapper(&self) -> &Arc<EventMapper> {
        &self.mapper
    }

    /// The underlying recorder.
    pub fn recorder(&self) -> &Arc<R> {
        &self.recorder
    }
}

impl<R: AggregateRecorder + ?Sized> EventStore<R> {
    /// Atomically append domain events.
    pub async fn append(&self, events: &[DomainEvent]) -> Result<(), StoreError> {
        let records = events
            .iter()
            .map(|e| self.mapper.to_stored(e))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = records.len(), "appending events");
        self.recorder.insert_events(records).await?;
        Ok(())
    }

    /// List decoded events of one sequence.
    pub async fn list_events(
        &self,
        sequence_id: SequenceId,
        query: SequenceQuery,
    ) -> Result<Vec<DomainEvent>, StoreError> {
        let records = self.recorder.select_events(sequence_id, query).await?;
        let events = records
            .iter()
            .map(|r| self.mapper.decode_stored(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// The last recorded position of a sequence, if any.
    pub async fn last_position(
        &self,
        sequence_id: SequenceId,
    ) -> Result<Option<Position>, StoreError> {
        let newest = self
            .recorder
            .select_events(sequence_id, SequenceQuery::all().descending().limit(1))
            .await?;
        Ok(newest.first().map(|r| r.position))
    }

    /// Delete all stored records of a sequence (erasure compliance).
    pub async fn delete_sequence(&self, sequence_id: SequenceId) -> Result<u64, StoreError> {
        Ok(self.recorder.delete_events(sequence_id).await?)
    }
}

impl<R: ApplicationRecorder + ?Sized> EventStore<R> {
    /// Atomically append domain events, assigning notification ids.
    pub async fn append_notified(
        &self,
        events: &[DomainEvent],
    ) -> Result<Vec<NotificationId>, StoreError> {
        let records = events
            .iter()
            .map(|e| self.mapper.to_stored(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.recorder.insert_notifications(records).await?)
    }

    /// Read decoded notifications strictly after `after`.
    pub async fn read_notifications(
        &self,
        after: Option<NotificationId>,
        limit: usize,
    ) -> Result<Vec<(NotificationId, DomainEvent)>, StoreError> {
        let notifications = self.recorder.select_notifications(after, limit).await?;
        let decoded = notifications
            .iter()
            .map(|n| self.mapper.decode_notification(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(decoded)
    }

    /// The current head of the notification log, if any.
    pub async fn max_notification_id(&self) -> Result<Option<NotificationId>, StoreError> {
        Ok(self.recorder.max_notification_id().await?)
    }
}

impl<R: ProcessRecorder + ?Sized> EventStore<R> {
    /// Atomically append domain events together with a tracking record.
    ///
    /// Tracking conflicts surface as
    /// [`StoreError::Recorder`]`(`[`RecorderError::TrackingConflict`]`)`;
    /// the process loop treats them as already-processed.
    pub async fn append_with_tracking(
        &self,
        events: &[DomainEvent],
        tracking: Tracking,
    ) -> Result<Vec<NotificationId>, StoreError> {
        let records = events
            .iter()
            .map(|e| self.mapper.to_stored(e))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            count = records.len(),
            upstream = %tracking.upstream_name,
            notification = tracking.notification_id,
            "committing tracked records"
        );
        Ok(self
            .recorder
            .insert_with_tracking(records, tracking)
            .await?)
    }
}
