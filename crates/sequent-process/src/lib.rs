#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sequent-process** – Event-sourced process applications for Sequent.
//!
//! A [`ProcessApplication`] consumes one or more notification logs,
//! invokes a user [`Policy`] for each matching notification, and commits
//! the policy's staged events *atomically with* a tracking record through
//! a [`ProcessRecorder`]. The tracking triple is unique, so for each
//! upstream notification at most one set of effects is ever committed:
//! replays surface a tracking conflict, which the loop swallows and moves
//! past. Combined with the atomic commit this yields exactly-once
//! effective processing without relying on message delivery.
//!
//! The loop is single-threaded cooperative: one notification in flight at
//! a time, committed or abandoned before the next is read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sequent_codec::EventMapper;
use sequent_log::NotificationReader;
use sequent_store_core::{
    ApplicationRecorder, EventStore, ProcessRecorder, RecorderError, SequenceQuery, StoreError,
};
use sequent_types::{
    CausalDependency, DomainEvent, EventProvenance, NotificationId, PipelineId, Position,
    SequenceId, Topic, Tracking, DEFAULT_PIPELINE,
};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by the processing loop.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Storage or codec failure that the loop does not recover from.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The user policy failed; the notification is not marked processed
    /// and will be retried on the next tick.
    #[error("policy failed on notification {notification_id} from '{upstream}': {source}")]
    Policy {
        /// Upstream log the notification came from.
        upstream: String,
        /// The notification being processed.
        notification_id: NotificationId,
        /// The policy's error.
        #[source]
        source: anyhow::Error,
    },
    /// The bounded retry budget was exhausted.
    #[error("retries exhausted processing notification {notification_id} from '{upstream}'")]
    RetriesExhausted {
        /// Upstream log the notification came from.
        upstream: String,
        /// The notification being processed.
        notification_id: NotificationId,
    },
    /// A causal dependency on another pipeline stayed unmet within the
    /// wait bound.
    #[error("causal dependencies unmet for notification {notification_id} from '{upstream}'")]
    DependencyUnmet {
        /// Upstream log the notification came from.
        upstream: String,
        /// The notification being processed.
        notification_id: NotificationId,
    },
}

//─────────────────────────────
//  Policy
//─────────────────────────────

/// User-supplied reaction to an upstream event.
///
/// The policy may load aggregates and stage new events through the
/// [`PolicyContext`]; it must never commit independently. The loop commits
/// everything staged, atomically with the tracking record. Policies must be
/// deterministic in the repository state observed at call time: a conflict
/// rerun sees fresh state and must stage accordingly.
#[async_trait]
pub trait Policy: Send + Sync {
    /// React to one upstream event.
    async fn handle(
        &self,
        ctx: &mut PolicyContext<'_>,
        event: &DomainEvent,
    ) -> anyhow::Result<()>;
}

/// Repository view handed to policies.
///
/// Loads are recorded so the loop can infer causal dependencies; staged
/// events are collected for the atomic tracked commit.
pub struct PolicyContext<'a> {
    store: &'a EventStore<dyn ProcessRecorder>,
    pending: Vec<DomainEvent>,
    used: Vec<(SequenceId, Vec<EventProvenance>)>,
}

impl<'a> PolicyContext<'a> {
    fn new(store: &'a EventStore<dyn ProcessRecorder>) -> Self {
        Self {
            store,
            pending: Vec::new(),
            used: Vec::new(),
        }
    }

    /// Load the event history of an aggregate, recording the use.
    pub async fn load(&mut self, sequence_id: SequenceId) -> Result<Vec<DomainEvent>, StoreError> {
        let events = self.store.list_events(sequence_id, SequenceQuery::all()).await?;
        let provenance = events.iter().filter_map(|e| e.caused_by()).collect();
        self.used.push((sequence_id, provenance));
        Ok(events)
    }

    /// The next free position of a sequence.
    pub async fn next_position(&self, sequence_id: SequenceId) -> Result<Position, StoreError> {
        Ok(self
            .store
            .last_position(sequence_id)
            .await?
            .map_or(0, |p| p + 1))
    }

    /// Stage a new event for the tracked commit.
    pub fn emit(&mut self, event: DomainEvent) {
        self.pending.push(event);
    }

    /// Events staged so far.
    pub fn pending(&self) -> &[DomainEvent] {
        &self.pending
    }
}

//─────────────────────────────
//  Retry settings
//─────────────────────────────

/// Bounds for conflict retries and transient-fault backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    /// Attempt bound per notification.
    pub max_retries: u32,
    /// Base delay of the exponential backoff.
    pub base_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetrySettings {
    fn delay(&self, attempt: u32) -> Duration {
        // Exponential with a hard cap so a misconfigured base cannot stall
        // the loop for minutes.
        let factor = 1u32 << attempt.min(6);
        (self.base_delay * factor).min(Duration::from_secs(5))
    }
}

//─────────────────────────────
//  Upstream state
//─────────────────────────────

struct UpstreamState {
    name: String,
    tracking_key: String,
    mapper: Arc<EventMapper>,
    reader: NotificationReader<dyn ApplicationRecorder>,
    // The reader starts at the durable tracking head, once, lazily.
    initialized: bool,
}

/// Tracking key of an upstream log, qualified by pipeline outside the
/// default partition.
pub fn upstream_key(upstream_name: &str, pipeline_id: PipelineId) -> String {
    if pipeline_id == DEFAULT_PIPELINE {
        upstream_name.to_owned()
    } else {
        format!("{upstream_name}.{pipeline_id}")
    }
}

//─────────────────────────────
//  Process application
//─────────────────────────────

/// An event-sourced consumer with exactly-once effective semantics.
pub struct ProcessApplication {
    name: String,
    pipeline_id: PipelineId,
    store: EventStore<dyn ProcessRecorder>,
    log: EventStore<dyn ApplicationRecorder>,
    policy: Arc<dyn Policy>,
    filter: Option<Vec<Topic>>,
    retry: RetrySettings,
    upstreams: Mutex<Vec<UpstreamState>>,
    cancel: CancellationToken,
}

impl ProcessApplication {
    /// Create a process application over its recorder.
    ///
    /// The same recorder backs both the process's tracked writes and the
    /// notification log it offers to followers.
    pub fn new<R>(
        name: impl Into<String>,
        pipeline_id: PipelineId,
        mapper: Arc<EventMapper>,
        recorder: Arc<R>,
        policy: Arc<dyn Policy>,
    ) -> Self
    where
        R: ProcessRecorder + 'static,
    {
        let process: Arc<dyn ProcessRecorder> = recorder.clone();
        let application: Arc<dyn ApplicationRecorder> = recorder;
        Self {
            name: name.into(),
            pipeline_id,
            store: EventStore::new(Arc::clone(&mapper), process),
            log: EventStore::new(mapper, application),
            policy,
            filter: None,
            retry: RetrySettings::default(),
            upstreams: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Only invoke the policy for these topics; everything else is
    /// tracked and skipped without decoding.
    pub fn with_topic_filter(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.filter = Some(topics.into_iter().collect());
        self
    }

    /// Override the retry bounds.
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pipeline this instance works.
    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Token that cooperatively stops the loop; the current iteration
    /// completes before the loop exits.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The notification log this process offers to followers.
    pub fn log(&self) -> EventStore<dyn ApplicationRecorder> {
        self.log.clone()
    }

    /// The process's own tracked store.
    pub fn store(&self) -> &EventStore<dyn ProcessRecorder> {
        &self.store
    }

    /// Follow an upstream notification log. Self-follow is permitted via
    /// [`ProcessApplication::log`].
    pub async fn follow(
        &self,
        upstream_name: impl Into<String>,
        log: EventStore<dyn ApplicationRecorder>,
    ) {
        let name = upstream_name.into();
        let tracking_key = upstream_key(&name, self.pipeline_id);
        info!(process = %self.name, upstream = %name, "following");
        let reader = NotificationReader::new(Arc::clone(log.recorder())).with_batch_size(1);
        self.upstreams.lock().await.push(UpstreamState {
            name,
            tracking_key,
            mapper: Arc::clone(log.mapper()),
            reader,
            initialized: false,
        });
    }

    /// Reposition the reader of one upstream. Mainly useful in tests and
    /// recovery tooling; the durable cursor is the tracking table.
    pub async fn seek_upstream(&self, upstream_name: &str, position: Option<NotificationId>) {
        let mut upstreams = self.upstreams.lock().await;
        for upstream in upstreams.iter_mut() {
            if upstream.name == upstream_name {
                match position {
                    Some(id) => upstream.reader.seek(id),
                    None => upstream.reader.rewind(),
                }
                upstream.initialized = true;
            }
        }
    }

    /// Process at most one notification per upstream; returns how many
    /// were processed. Zero means every upstream is at its head.
    pub async fn run_once(&self) -> Result<usize, ProcessError> {
        let mut upstreams = self.upstreams.lock().await;
        let mut processed = 0;
        for upstream in upstreams.iter_mut() {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.step(upstream).await? {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Drain every upstream to its head.
    pub async fn run_to_head(&self) -> Result<usize, ProcessError> {
        let mut total = 0;
        loop {
            let processed = self.run_once().await?;
            if processed == 0 || self.cancel.is_cancelled() {
                return Ok(total);
            }
            total += processed;
        }
    }

    async fn step(&self, upstream: &mut UpstreamState) -> Result<bool, ProcessError> {
        if !upstream.initialized {
            // The durable tracking head is the authoritative resume point.
            let head = self
                .store
                .recorder()
                .max_tracking_id(&self.name, &upstream.tracking_key)
                .await
                .map_err(StoreError::from)?;
            if let Some(head) = head {
                upstream.reader.seek(head);
            }
            upstream.initialized = true;
        }

        let previous = upstream.reader.position();
        let batch = upstream
            .reader
            .read_batch()
            .await
            .map_err(StoreError::from)?;
        let Some(notification) = batch.into_iter().next() else {
            return Ok(false);
        };

        let notification_id = notification.id;
        let matches = self
            .filter
            .as_ref()
            .map_or(true, |topics| topics.contains(&notification.topic));

        let outcome = if matches {
            match upstream.mapper.decode_notification(&notification) {
                Ok((_, event)) => {
                    match self
                        .wait_for_dependencies(upstream, &event, notification_id)
                        .await
                    {
                        Ok(()) => self.process_event(upstream, &event, notification_id).await,
                        Err(err) => Err(err),
                    }
                }
                Err(err) => Err(StoreError::from(err).into()),
            }
        } else {
            // Still tracked, so the durable cursor never regresses.
            self.commit(
                upstream,
                Vec::new(),
                Tracking::new(&self.name, &upstream.tracking_key, notification_id),
            )
            .await
        };

        if let Err(err) = outcome {
            // Not marked processed: rewind so the next tick retries it.
            match previous {
                Some(id) => upstream.reader.seek(id),
                None => upstream.reader.rewind(),
            }
            return Err(err);
        }
        Ok(true)
    }

    async fn process_event(
        &self,
        upstream: &UpstreamState,
        event: &DomainEvent,
        notification_id: NotificationId,
    ) -> Result<(), ProcessError> {
        let provenance = EventProvenance {
            upstream_name: upstream.name.clone(),
            pipeline_id: self.pipeline_id,
            notification_id,
        };

        let mut attempt = 0;
        loop {
            // The policy reruns against fresh repository state on each
            // attempt, so staged events are rebuilt, never reused.
            let mut ctx = PolicyContext::new(&self.store);
            self.policy
                .handle(&mut ctx, event)
                .await
                .map_err(|source| ProcessError::Policy {
                    upstream: upstream.name.clone(),
                    notification_id,
                    source,
                })?;

            let mut staged = ctx.pending;
            for staged_event in staged.iter_mut() {
                staged_event.set_caused_by(&provenance);
            }
            let dependencies = infer_causal_dependencies(&ctx.used, self.pipeline_id);
            if let Some(first) = staged.first_mut() {
                first.set_causal_dependencies(&dependencies);
            }

            let tracking = Tracking::new(&self.name, &upstream.tracking_key, notification_id);
            match self.commit_once(staged, tracking).await {
                Ok(CommitOutcome::Done) => return Ok(()),
                Ok(CommitOutcome::RetryConflict) => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        return Err(ProcessError::RetriesExhausted {
                            upstream: upstream.name.clone(),
                            notification_id,
                        });
                    }
                    warn!(
                        process = %self.name,
                        upstream = %upstream.name,
                        notification_id,
                        attempt,
                        "sequence conflict, rerunning policy"
                    );
                }
                Ok(CommitOutcome::RetryOperational) => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        return Err(ProcessError::RetriesExhausted {
                            upstream: upstream.name.clone(),
                            notification_id,
                        });
                    }
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn commit(
        &self,
        upstream: &UpstreamState,
        events: Vec<DomainEvent>,
        tracking: Tracking,
    ) -> Result<(), ProcessError> {
        let mut attempt = 0;
        loop {
            match self.commit_once(events.clone(), tracking.clone()).await? {
                CommitOutcome::Done => return Ok(()),
                CommitOutcome::RetryConflict | CommitOutcome::RetryOperational => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        return Err(ProcessError::RetriesExhausted {
                            upstream: upstream.name.clone(),
                            notification_id: tracking.notification_id,
                        });
                    }
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
            }
        }
    }

    async fn commit_once(
        &self,
        events: Vec<DomainEvent>,
        tracking: Tracking,
    ) -> Result<CommitOutcome, ProcessError> {
        match self.store.append_with_tracking(&events, tracking).await {
            Ok(ids) => {
                debug!(process = %self.name, assigned = ?ids, "tracked commit");
                Ok(CommitOutcome::Done)
            }
            Err(StoreError::Recorder(RecorderError::TrackingConflict {
                notification_id, ..
            })) => {
                // Already handled, possibly by a previous incarnation that
                // crashed between commit and cursor advance. The staged
                // events are discarded; effects exist exactly once.
                debug!(process = %self.name, notification_id, "already tracked, skipping");
                Ok(CommitOutcome::Done)
            }
            Err(StoreError::Concurrency { .. }) => Ok(CommitOutcome::RetryConflict),
            Err(StoreError::Recorder(RecorderError::Operational(e))) => {
                warn!(process = %self.name, error = %e, "transient storage fault");
                Ok(CommitOutcome::RetryOperational)
            }
            Err(fatal) => Err(fatal.into()),
        }
    }

    async fn wait_for_dependencies(
        &self,
        upstream: &UpstreamState,
        event: &DomainEvent,
        notification_id: NotificationId,
    ) -> Result<(), ProcessError> {
        let dependencies = event.causal_dependencies();
        for dependency in dependencies {
            if dependency.pipeline_id == self.pipeline_id {
                // Same pipeline: id order already guarantees it.
                continue;
            }
            let key = upstream_key(&upstream.name, dependency.pipeline_id);
            let mut attempt = 0;
            loop {
                let tracked = self
                    .store
                    .recorder()
                    .max_tracking_id(&self.name, &key)
                    .await
                    .map_err(StoreError::from)?
                    .unwrap_or(0);
                if tracked >= dependency.notification_id {
                    break;
                }
                attempt += 1;
                if attempt > self.retry.max_retries || self.cancel.is_cancelled() {
                    return Err(ProcessError::DependencyUnmet {
                        upstream: upstream.name.clone(),
                        notification_id,
                    });
                }
                tokio::time::sleep(self.retry.delay(attempt)).await;
            }
        }
        Ok(())
    }
}

enum CommitOutcome {
    Done,
    RetryConflict,
    RetryOperational,
}

/// The cross-pipeline prerequisites of a commit: for each distinct other
/// pipeline that contributed to a used aggregate, the highest contributing
/// notification.
fn infer_causal_dependencies(
    used: &[(SequenceId, Vec<EventProvenance>)],
    own_pipeline: PipelineId,
) -> Vec<CausalDependency> {
    let mut max_per_pipeline: HashMap<PipelineId, NotificationId> = HashMap::new();
    for (_, provenance) in used {
        for p in provenance {
            if p.pipeline_id == own_pipeline {
                continue;
            }
            let entry = max_per_pipeline.entry(p.pipeline_id).or_insert(0);
            *entry = (*entry).max(p.notification_id);
        }
    }
    let mut dependencies: Vec<CausalDependency> = max_per_pipeline
        .into_iter()
        .map(|(pipeline_id, notification_id)| CausalDependency {
            pipeline_id,
            notification_id,
        })
        .collect();
    dependencies.sort_by_key(|d| d.pipeline_id);
    dependencies
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequent_codec::{EventMapper, TopicRegistry};
    use sequent_store_memory::MemoryRecorder;
    use sequent_types::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn mapper() -> Arc<EventMapper> {
        Arc::new(
            EventMapper::builder(
                TopicRegistry::builder()
                    .topic("orders.Created")
                    .topic("reservations.Created")
                    .build(),
            )
            .build(),
        )
    }

    /// Reacts to order creation by reserving stock.
    struct ReservationPolicy;

    #[async_trait]
    impl Policy for ReservationPolicy {
        async fn handle(
            &self,
            ctx: &mut PolicyContext<'_>,
            event: &DomainEvent,
        ) -> anyhow::Result<()> {
            let reservation_id = Uuid::new_v4();
            let position = ctx.next_position(reservation_id).await?;
            ctx.emit(
                DomainEvent::new(reservation_id, position, "reservations.Created")
                    .with_attr("order", Value::custom(event.sequence_id)),
            );
            Ok(())
        }
    }

    async fn seed_order(recorder: &Arc<MemoryRecorder>, mapper: &Arc<EventMapper>) -> SequenceId {
        let order_id = Uuid::new_v4();
        let upstream = EventStore::<dyn ApplicationRecorder>::new(
            Arc::clone(mapper),
            Arc::clone(recorder) as Arc<dyn ApplicationRecorder>,
        );
        upstream
            .append_notified(&[
                DomainEvent::new(order_id, 0, "orders.Created").with_attr("total", 100i64)
            ])
            .await
            .unwrap();
        order_id
    }

    fn reservation_process(recorder: &Arc<MemoryRecorder>) -> ProcessApplication {
        ProcessApplication::new(
            "reservations",
            DEFAULT_PIPELINE,
            mapper(),
            Arc::clone(recorder),
            Arc::new(ReservationPolicy),
        )
        .with_topic_filter([Topic::new("orders.Created")])
    }

    #[tokio::test]
    async fn process_follows_process() {
        let recorder = Arc::new(MemoryRecorder::new());
        let mapper = mapper();
        seed_order(&recorder, &mapper).await;

        let process = reservation_process(&recorder);
        process.follow("orders", process.log()).await;

        assert_eq!(process.run_once().await.unwrap(), 1);

        // Tracking shows (reservations, orders, 1) and the policy's new
        // event took the next global id.
        assert!(recorder.has_tracking("reservations", "orders", 1).await.unwrap());
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(2));

        let tail = recorder.select_notifications(Some(1), 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].topic, Topic::new("reservations.Created"));
    }

    #[tokio::test]
    async fn replay_is_swallowed_exactly_once() {
        let recorder = Arc::new(MemoryRecorder::new());
        let mapper = mapper();
        seed_order(&recorder, &mapper).await;

        let process = reservation_process(&recorder);
        process.follow("orders", process.log()).await;
        assert_eq!(process.run_once().await.unwrap(), 1);
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(2));

        // Crash between commit and cursor advance: the reader is fed the
        // same notification again.
        process.seek_upstream("orders", None).await;
        assert_eq!(process.run_once().await.unwrap(), 1);

        // No duplicate effects.
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(2));
        assert_eq!(recorder.event_count().await, 2);
    }

    #[tokio::test]
    async fn draining_twice_is_idempotent() {
        let recorder = Arc::new(MemoryRecorder::new());
        let mapper = mapper();
        seed_order(&recorder, &mapper).await;
        seed_order(&recorder, &mapper).await;

        let process = reservation_process(&recorder);
        process.follow("orders", process.log()).await;

        // Drain: two orders processed, plus the process's own output
        // notifications tracked-and-skipped by the filter.
        process.run_to_head().await.unwrap();
        let events_after_first = recorder.event_count().await;
        let head_after_first = recorder.max_notification_id().await.unwrap();

        process.run_to_head().await.unwrap();
        assert_eq!(recorder.event_count().await, events_after_first);
        assert_eq!(recorder.max_notification_id().await.unwrap(), head_after_first);
    }

    #[tokio::test]
    async fn filtered_notifications_are_tracked_without_effects() {
        let recorder = Arc::new(MemoryRecorder::new());
        let mapper = mapper();

        // An event the filter excludes.
        let upstream = EventStore::<dyn ApplicationRecorder>::new(
            Arc::clone(&mapper),
            Arc::clone(&recorder) as Arc<dyn ApplicationRecorder>,
        );
        upstream
            .append_notified(&[DomainEvent::new(Uuid::new_v4(), 0, "reservations.Created")])
            .await
            .unwrap();

        let process = reservation_process(&recorder);
        process.follow("orders", process.log()).await;
        assert_eq!(process.run_once().await.unwrap(), 1);

        assert!(recorder.has_tracking("reservations", "orders", 1).await.unwrap());
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(1));
    }

    struct FailingPolicy;

    #[async_trait]
    impl Policy for FailingPolicy {
        async fn handle(
            &self,
            _ctx: &mut PolicyContext<'_>,
            _event: &DomainEvent,
        ) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn policy_error_leaves_no_tracking() {
        let recorder = Arc::new(MemoryRecorder::new());
        let mapper = mapper();
        seed_order(&recorder, &mapper).await;

        let process = ProcessApplication::new(
            "reservations",
            DEFAULT_PIPELINE,
            mapper,
            Arc::clone(&recorder),
            Arc::new(FailingPolicy),
        );
        process.follow("orders", process.log()).await;

        let err = process.run_once().await.unwrap_err();
        assert!(matches!(err, ProcessError::Policy { notification_id: 1, .. }));

        // Not marked processed: the notification is retried next tick.
        assert!(!recorder.has_tracking("reservations", "orders", 1).await.unwrap());
        assert_eq!(recorder.max_notification_id().await.unwrap(), Some(1));
    }

    /// First attempt emits at a stale position; reruns consult the store.
    struct ContendedPolicy {
        target: SequenceId,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Policy for ContendedPolicy {
        async fn handle(
            &self,
            ctx: &mut PolicyContext<'_>,
            _event: &DomainEvent,
        ) -> anyhow::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let position = if attempt == 0 {
                0 // stale view: another writer got here first
            } else {
                ctx.next_position(self.target).await?
            };
            ctx.emit(DomainEvent::new(self.target, position, "reservations.Created"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn sequence_conflict_reruns_the_policy() {
        let recorder = Arc::new(MemoryRecorder::new());
        let mapper = mapper();
        seed_order(&recorder, &mapper).await;

        let target = Uuid::new_v4();
        // Position 0 of the target is already taken.
        let store = EventStore::<dyn ApplicationRecorder>::new(
            Arc::clone(&mapper),
            Arc::clone(&recorder) as Arc<dyn ApplicationRecorder>,
        );
        store
            .append_notified(&[DomainEvent::new(target, 0, "reservations.Created")])
            .await
            .unwrap();

        let policy = Arc::new(ContendedPolicy {
            target,
            attempts: AtomicU32::new(0),
        });
        let process = ProcessApplication::new(
            "reservations",
            DEFAULT_PIPELINE,
            mapper,
            Arc::clone(&recorder),
            policy.clone(),
        )
        .with_topic_filter([Topic::new("orders.Created")]);
        process.follow("orders", process.log()).await;

        assert_eq!(process.run_once().await.unwrap(), 1);
        assert_eq!(policy.attempts.load(Ordering::SeqCst), 2);

        // The rerun landed at position 1.
        let events = store
            .list_events(target, SequenceQuery::all())
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn causal_dependencies_are_inferred_from_used_aggregates() {
        let used = vec![
            (
                Uuid::new_v4(),
                vec![
                    EventProvenance {
                        upstream_name: "orders".into(),
                        pipeline_id: 1,
                        notification_id: 5,
                    },
                    EventProvenance {
                        upstream_name: "orders".into(),
                        pipeline_id: 1,
                        notification_id: 9,
                    },
                ],
            ),
            (
                Uuid::new_v4(),
                vec![EventProvenance {
                    upstream_name: "orders".into(),
                    pipeline_id: 0,
                    notification_id: 3,
                }],
            ),
        ];

        // Own pipeline 0: only the pipeline-1 contributions remain, at
        // their maximum.
        let deps = infer_causal_dependencies(&used, 0);
        assert_eq!(
            deps,
            vec![CausalDependency { pipeline_id: 1, notification_id: 9 }]
        );
    }

    #[tokio::test]
    async fn unmet_dependency_bounds_out() {
        let recorder = Arc::new(MemoryRecorder::new());
        let mapper = mapper();

        // An upstream event carrying a dependency on pipeline 7 that this
        // application has never tracked.
        let upstream = EventStore::<dyn ApplicationRecorder>::new(
            Arc::clone(&mapper),
            Arc::clone(&recorder) as Arc<dyn ApplicationRecorder>,
        );
        let mut event = DomainEvent::new(Uuid::new_v4(), 0, "orders.Created");
        event.set_causal_dependencies(&[CausalDependency {
            pipeline_id: 7,
            notification_id: 4,
        }]);
        upstream.append_notified(&[event]).await.unwrap();

        let process = reservation_process(&recorder).with_retry(RetrySettings {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
        });
        process.follow("orders", process.log()).await;

        let err = process.run_once().await.unwrap_err();
        assert!(matches!(err, ProcessError::DependencyUnmet { .. }));
        assert!(!recorder.has_tracking("reservations", "orders", 1).await.unwrap());
    }
}
