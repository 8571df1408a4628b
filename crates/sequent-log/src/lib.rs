#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sequent-log** – Sectioned, resumable read-side view over the globally
//! ordered notification stream.
//!
//! A [`NotificationLog`] presents the recorder's notification stream as
//! fixed-size sections addressed by inclusive id ranges. Sections below the
//! current head are immutable and may be cached by consumers; the head
//! section may still grow. A [`NotificationReader`] maintains a cursor and
//! pulls batches past it; two readers started at the same position observe
//! the same sequence, because ids are contiguous and records immutable.

use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use sequent_store_core::{ApplicationRecorder, RecorderError};
use sequent_types::{Notification, NotificationId};

//─────────────────────────────
//  Sections
//─────────────────────────────

/// Inclusive id range addressing one section of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionId {
    /// First notification id of the section.
    pub first: NotificationId,
    /// Last notification id of the section.
    pub last: NotificationId,
}

impl SectionId {
    /// The section of `size` containing `id`.
    pub fn containing(id: NotificationId, size: usize) -> Self {
        let size = size.max(1) as NotificationId;
        let first = ((id.saturating_sub(1)) / size) * size + 1;
        Self {
            first,
            last: first + size - 1,
        }
    }

    /// The section immediately after this one, keeping its width.
    pub fn next(&self) -> Self {
        let size = self.last - self.first + 1;
        Self {
            first: self.last + 1,
            last: self.last + size,
        }
    }
}

impl std::fmt::Display for SectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.first, self.last)
    }
}

/// Error parsing a section id of the form `"first,last"`.
#[derive(Debug, thiserror::Error)]
#[error("malformed section id '{0}', expected 'first,last'")]
pub struct ParseSectionIdError(String);

impl FromStr for SectionId {
    type Err = ParseSectionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseSectionIdError(s.to_owned());
        let (first, last) = s.split_once(',').ok_or_else(malformed)?;
        let first = first.trim().parse().map_err(|_| malformed())?;
        let last = last.trim().parse().map_err(|_| malformed())?;
        if first == 0 || last < first {
            return Err(malformed());
        }
        Ok(Self { first, last })
    }
}

/// One page of the notification log.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// The requested range.
    pub id: SectionId,
    /// Notifications within the range, ascending; may be sparse after
    /// explicit erasure, and shorter than the range at the head.
    pub items: Vec<Notification>,
    /// The following section, present iff this section is not the head.
    pub next: Option<SectionId>,
}

//─────────────────────────────
//  Notification log
//─────────────────────────────

/// Sectioned view over an application recorder's notification stream.
pub struct NotificationLog<R: ?Sized> {
    recorder: Arc<R>,
    section_size: usize,
}

impl<R: ?Sized> Clone for NotificationLog<R> {
    fn clone(&self) -> Self {
        Self {
            recorder: Arc::clone(&self.recorder),
            section_size: self.section_size,
        }
    }
}

impl<R: ApplicationRecorder + ?Sized> NotificationLog<R> {
    /// View `recorder` in sections of `section_size` notifications.
    pub fn new(recorder: Arc<R>, section_size: usize) -> Self {
        Self {
            recorder,
            section_size: section_size.max(1),
        }
    }

    /// The configured section size.
    pub fn section_size(&self) -> usize {
        self.section_size
    }

    /// Read the section with the given id.
    pub async fn section(&self, id: &SectionId) -> Result<Section, RecorderError> {
        let limit = (id.last - id.first + 1) as usize;
        let items = self
            .recorder
            .select_notifications(Some(id.first - 1), limit)
            .await?
            .into_iter()
            .filter(|n| n.id <= id.last)
            .collect();
        let head = self.recorder.max_notification_id().await?.unwrap_or(0);
        let next = (head > id.last).then(|| id.next());
        debug!(section = %id, head, "read log section");
        Ok(Section { id: *id, items, next })
    }

    /// Read the current head section.
    pub async fn current(&self) -> Result<Section, RecorderError> {
        let head = self.recorder.max_notification_id().await?.unwrap_or(0);
        let id = SectionId::containing(head.max(1), self.section_size);
        self.section(&id).await
    }
}

//─────────────────────────────
//  Reader
//─────────────────────────────

/// Cursor-driven consumer of a notification log.
///
/// The sequence is finite (it exhausts at the head), resumable via
/// [`NotificationReader::seek`], and restartable: a fresh reader with the
/// same start position reproduces the sequence exactly.
pub struct NotificationReader<R: ?Sized> {
    recorder: Arc<R>,
    last_seen: Option<NotificationId>,
    batch_size: usize,
}

impl<R: ?Sized> Clone for NotificationReader<R> {
    fn clone(&self) -> Self {
        Self {
            recorder: Arc::clone(&self.recorder),
            last_seen: self.last_seen,
            batch_size: self.batch_size,
        }
    }
}

impl<R: ApplicationRecorder + ?Sized> NotificationReader<R> {
    /// A reader positioned at the start of the log.
    pub fn new(recorder: Arc<R>) -> Self {
        Self {
            recorder,
            last_seen: None,
            batch_size: 64,
        }
    }

    /// Override the pull batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The cursor: the last notification id returned, if any.
    pub fn position(&self) -> Option<NotificationId> {
        self.last_seen
    }

    /// Reposition so subsequent reads return notifications after `id`.
    pub fn seek(&mut self, id: NotificationId) {
        self.last_seen = Some(id);
    }

    /// Reposition at the start of the log.
    pub fn rewind(&mut self) {
        self.last_seen = None;
    }

    /// Pull the next batch after the cursor, advancing it.
    ///
    /// An empty batch means the reader is at the head.
    pub async fn read_batch(&mut self) -> Result<Vec<Notification>, RecorderError> {
        let batch = self
            .recorder
            .select_notifications(self.last_seen, self.batch_size)
            .await?;
        if let Some(last) = batch.last() {
            self.last_seen = Some(last.id);
        }
        Ok(batch)
    }

    /// Drain everything between the cursor and the head.
    pub async fn read_to_head(&mut self) -> Result<Vec<Notification>, RecorderError> {
        let mut out = Vec::new();
        loop {
            let batch = self.read_batch().await?;
            if batch.is_empty() {
                return Ok(out);
            }
            out.extend(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequent_store_memory::MemoryRecorder;
    use sequent_types::{StoredEvent, Topic};
    use uuid::Uuid;

    async fn seed(recorder: &MemoryRecorder, count: u64) {
        let seq = Uuid::new_v4();
        for position in 0..count {
            recorder
                .insert_notifications(vec![StoredEvent {
                    sequence_id: seq,
                    position,
                    topic: Topic::new("test.Event"),
                    state: Vec::new(),
                }])
                .await
                .unwrap();
        }
    }

    #[test]
    fn section_ids_parse_and_print() {
        let id: SectionId = "1,10".parse().unwrap();
        assert_eq!(id, SectionId { first: 1, last: 10 });
        assert_eq!(id.to_string(), "1,10");
        assert_eq!(id.next(), SectionId { first: 11, last: 20 });

        assert!("10,1".parse::<SectionId>().is_err());
        assert!("0,5".parse::<SectionId>().is_err());
        assert!("nope".parse::<SectionId>().is_err());
    }

    #[test]
    fn containing_maps_ids_to_pages() {
        assert_eq!(SectionId::containing(1, 10), SectionId { first: 1, last: 10 });
        assert_eq!(SectionId::containing(10, 10), SectionId { first: 1, last: 10 });
        assert_eq!(SectionId::containing(11, 10), SectionId { first: 11, last: 20 });
    }

    #[tokio::test]
    async fn archived_sections_link_forward() {
        let recorder = Arc::new(MemoryRecorder::new());
        seed(&recorder, 25).await;
        let log = NotificationLog::new(Arc::clone(&recorder), 10);

        let first = log.section(&"1,10".parse().unwrap()).await.unwrap();
        assert_eq!(first.items.len(), 10);
        assert_eq!(first.next, Some(SectionId { first: 11, last: 20 }));

        let head = log.current().await.unwrap();
        assert_eq!(head.id, SectionId { first: 21, last: 30 });
        assert_eq!(head.items.len(), 5);
        assert!(head.next.is_none());
    }

    #[tokio::test]
    async fn empty_log_has_an_empty_head() {
        let recorder = Arc::new(MemoryRecorder::new());
        let log = NotificationLog::new(Arc::clone(&recorder), 10);

        let head = log.current().await.unwrap();
        assert_eq!(head.id, SectionId { first: 1, last: 10 });
        assert!(head.items.is_empty());
        assert!(head.next.is_none());
    }

    #[tokio::test]
    async fn full_head_section_does_not_link_forward() {
        let recorder = Arc::new(MemoryRecorder::new());
        seed(&recorder, 10).await;
        let log = NotificationLog::new(Arc::clone(&recorder), 10);

        let head = log.section(&"1,10".parse().unwrap()).await.unwrap();
        assert_eq!(head.items.len(), 10);
        assert!(head.next.is_none());
    }

    #[tokio::test]
    async fn reader_is_resumable_and_restartable() {
        let recorder = Arc::new(MemoryRecorder::new());
        seed(&recorder, 7).await;

        let mut reader = NotificationReader::new(Arc::clone(&recorder)).with_batch_size(3);
        let all = reader.read_to_head().await.unwrap();
        let ids: Vec<_> = all.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(reader.position(), Some(7));
        assert!(reader.read_batch().await.unwrap().is_empty());

        // Seek back and observe the same tail again.
        reader.seek(4);
        let tail = reader.read_to_head().await.unwrap();
        let ids: Vec<_> = tail.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![5, 6, 7]);

        // A fresh reader from the start reproduces the sequence.
        let mut restarted = NotificationReader::new(Arc::clone(&recorder));
        let replay = restarted.read_to_head().await.unwrap();
        assert_eq!(replay, all);
    }
}
