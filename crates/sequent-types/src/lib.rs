#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sequent-types** – Shared primitive data structures for Sequent.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the identifiers, record envelopes and the value model that the
//! codec, storage and process layers all share, and makes no assumptions
//! about I/O, cryptography, or storage.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Value model
//─────────────────────────────

/// The extensible value tree carried inside event state mappings.
pub mod value;
pub use value::{Extension, StateMap, Value};

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Opaque 128-bit identifier of the sequence a record belongs to.
///
/// Typically this is the identifier of a domain entity; the storage layer
/// treats it uniformly which keeps indices and schemas simple.
pub type SequenceId = uuid::Uuid;

/// Zero-based position of a record within its sequence.
///
/// Positions are densely packed: for any sequence the stored positions are
/// exactly `0..n` with no gaps and no duplicates.
pub type Position = u64;

/// Global order key assigned at insert time.
///
/// Notification ids are unique across a recorder and form a contiguous
/// run starting at 1. They are never reused and never renumbered.
pub type NotificationId = u64;

/// Partition selector for multi-pipeline deployments.
pub type PipelineId = u32;

/// Default pipeline for systems that do not partition their notification
/// space.
pub const DEFAULT_PIPELINE: PipelineId = 0;

//─────────────────────────────
//  Topics
//─────────────────────────────

/// Symbolic name identifying a concrete event type.
///
/// Topics are opaque registered strings, not module paths: renaming or
/// moving a type in the source tree never changes its topic, and schema
/// evolution is handled through an explicit substitution table in the
/// mapper layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Create a topic from its registered name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The registered name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(name)
    }
}

//─────────────────────────────
//  Reserved state keys
//─────────────────────────────

/// State key carrying the class version of the stored schema.
///
/// Only embedded when the event type's registered version is greater than
/// zero; absent means version 0.
pub const CLASS_VERSION_KEY: &str = "__class_version__";

/// State key carrying the causal dependencies of a process commit.
///
/// Set on the first event of each commit; a list of
/// [`CausalDependency`] mappings.
pub const CAUSAL_DEPENDENCIES_KEY: &str = "__causal_dependencies__";

/// State key carrying per-event provenance stamped by process
/// applications: which upstream notification caused this event.
pub const CAUSED_BY_KEY: &str = "__caused_by__";

//─────────────────────────────
//  Domain event
//─────────────────────────────

/// A decoded domain event: the envelope fields plus its state mapping.
///
/// This is the core's entire view of the domain model. User-facing event
/// types convert to and from this shape through the codec layer's
/// transcoding registry; the core never inspects domain attributes beyond
/// the reserved keys.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    /// Sequence (entity) this event belongs to.
    pub sequence_id: SequenceId,
    /// Position within the sequence.
    pub position: Position,
    /// Registered type name.
    pub topic: Topic,
    /// Attribute mapping, including any reserved keys.
    pub state: StateMap,
}

impl DomainEvent {
    /// Create an event with an empty state mapping.
    pub fn new(sequence_id: SequenceId, position: Position, topic: impl Into<Topic>) -> Self {
        Self {
            sequence_id,
            position,
            topic: topic.into(),
            state: StateMap::new(),
        }
    }

    /// Builder-style attribute insertion.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.state.insert(key.into(), value.into());
        self
    }

    /// Read a state attribute.
    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Causal dependencies recorded on this event, empty when none.
    pub fn causal_dependencies(&self) -> Vec<CausalDependency> {
        match self.state.get(CAUSAL_DEPENDENCIES_KEY) {
            Some(Value::Seq(items)) => items
                .iter()
                .filter_map(CausalDependency::from_value)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Record causal dependencies on this event.
    ///
    /// An empty list removes the reserved key entirely.
    pub fn set_causal_dependencies(&mut self, deps: &[CausalDependency]) {
        if deps.is_empty() {
            self.state.remove(CAUSAL_DEPENDENCIES_KEY);
        } else {
            let items = deps.iter().map(CausalDependency::to_value).collect();
            self.state
                .insert(CAUSAL_DEPENDENCIES_KEY.to_owned(), Value::Seq(items));
        }
    }

    /// The upstream notification that caused this event, if stamped.
    pub fn caused_by(&self) -> Option<EventProvenance> {
        self.state.get(CAUSED_BY_KEY).and_then(EventProvenance::from_value)
    }

    /// Stamp the upstream notification that caused this event.
    pub fn set_caused_by(&mut self, provenance: &EventProvenance) {
        self.state
            .insert(CAUSED_BY_KEY.to_owned(), provenance.to_value());
    }
}

//─────────────────────────────
//  Stored records
//─────────────────────────────

/// The persisted form of an event, before a notification id is assigned.
///
/// `state` is opaque: serialized, optionally compressed, optionally
/// encrypted. Records are immutable once written; only whole-sequence
/// deletion is permitted, never mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Sequence the record belongs to.
    pub sequence_id: SequenceId,
    /// Position within the sequence.
    pub position: Position,
    /// Registered type name.
    pub topic: Topic,
    /// Opaque payload bytes.
    pub state: Vec<u8>,
}

/// A stored event viewed as an item of the global totally-ordered log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// The unique, contiguous global order key, starting at 1.
    pub id: NotificationId,
    /// Sequence the record belongs to.
    pub sequence_id: SequenceId,
    /// Position within the sequence.
    pub position: Position,
    /// Registered type name.
    pub topic: Topic,
    /// Opaque payload bytes.
    pub state: Vec<u8>,
}

impl Notification {
    /// Drop the notification id, recovering the insert-form record.
    pub fn into_stored(self) -> StoredEvent {
        StoredEvent {
            sequence_id: self.sequence_id,
            position: self.position,
            topic: self.topic,
            state: self.state,
        }
    }
}

//─────────────────────────────
//  Tracking records
//─────────────────────────────

/// Durable proof that a given notification has been consumed by a given
/// process application.
///
/// The triple `(application_name, upstream_name, notification_id)` is
/// unique; a second insert of the same triple is the signal that the
/// notification has already been processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tracking {
    /// The consuming process.
    pub application_name: String,
    /// The source notification log.
    pub upstream_name: String,
    /// The upstream notification that has been processed.
    pub notification_id: NotificationId,
}

impl Tracking {
    /// Create a tracking record.
    pub fn new(
        application_name: impl Into<String>,
        upstream_name: impl Into<String>,
        notification_id: NotificationId,
    ) -> Self {
        Self {
            application_name: application_name.into(),
            upstream_name: upstream_name.into(),
            notification_id,
        }
    }
}

//─────────────────────────────
//  Causal dependencies
//─────────────────────────────

/// A cross-pipeline ordering constraint: the downstream consumer must not
/// process the carrying event before `notification_id` has been tracked in
/// pipeline `pipeline_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CausalDependency {
    /// Pipeline the prerequisite was recorded in.
    pub pipeline_id: PipelineId,
    /// The prerequisite notification.
    pub notification_id: NotificationId,
}

impl CausalDependency {
    /// Encode as a state-mapping value.
    pub fn to_value(&self) -> Value {
        let mut map = StateMap::new();
        map.insert("pipeline_id".to_owned(), Value::Int(self.pipeline_id as i64));
        map.insert(
            "notification_id".to_owned(),
            Value::Int(self.notification_id as i64),
        );
        Value::Map(map)
    }

    /// Decode from a state-mapping value, `None` when the shape is wrong.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        Some(Self {
            pipeline_id: map.get("pipeline_id")?.as_int()? as PipelineId,
            notification_id: map.get("notification_id")?.as_int()? as NotificationId,
        })
    }
}

/// Provenance of an event written by a process application: the upstream
/// notification whose processing produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventProvenance {
    /// Name of the upstream notification log.
    pub upstream_name: String,
    /// Pipeline the notification was read from.
    pub pipeline_id: PipelineId,
    /// The originating notification.
    pub notification_id: NotificationId,
}

impl EventProvenance {
    /// Encode as a state-mapping value.
    pub fn to_value(&self) -> Value {
        let mut map = StateMap::new();
        map.insert("upstream".to_owned(), Value::Str(self.upstream_name.clone()));
        map.insert("pipeline_id".to_owned(), Value::Int(self.pipeline_id as i64));
        map.insert(
            "notification_id".to_owned(),
            Value::Int(self.notification_id as i64),
        );
        Value::Map(map)
    }

    /// Decode from a state-mapping value, `None` when the shape is wrong.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        Some(Self {
            upstream_name: map.get("upstream")?.as_str()?.to_owned(),
            pipeline_id: map.get("pipeline_id")?.as_int()? as PipelineId,
            notification_id: map.get("notification_id")?.as_int()? as NotificationId,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_roundtrips_through_serde() {
        let topic = Topic::new("orders.Created");
        let json = serde_json::to_string(&topic).unwrap();
        assert_eq!(json, "\"orders.Created\"");
        let back: Topic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topic);
    }

    #[test]
    fn causal_dependencies_roundtrip_through_state() {
        let mut event = DomainEvent::new(uuid::Uuid::new_v4(), 0, "orders.Created");
        assert!(event.causal_dependencies().is_empty());

        let deps = vec![
            CausalDependency { pipeline_id: 1, notification_id: 42 },
            CausalDependency { pipeline_id: 2, notification_id: 7 },
        ];
        event.set_causal_dependencies(&deps);
        assert_eq!(event.causal_dependencies(), deps);

        event.set_causal_dependencies(&[]);
        assert!(event.state.get(CAUSAL_DEPENDENCIES_KEY).is_none());
    }

    #[test]
    fn provenance_roundtrips_through_state() {
        let mut event = DomainEvent::new(uuid::Uuid::new_v4(), 3, "orders.Reserved");
        assert!(event.caused_by().is_none());

        let provenance = EventProvenance {
            upstream_name: "orders".to_owned(),
            pipeline_id: 0,
            notification_id: 9,
        };
        event.set_caused_by(&provenance);
        assert_eq!(event.caused_by(), Some(provenance));
    }

    #[test]
    fn notification_into_stored_drops_id() {
        let notification = Notification {
            id: 12,
            sequence_id: uuid::Uuid::new_v4(),
            position: 4,
            topic: Topic::new("t"),
            state: vec![1, 2, 3],
        };
        let stored = notification.clone().into_stored();
        assert_eq!(stored.sequence_id, notification.sequence_id);
        assert_eq!(stored.position, 4);
        assert_eq!(stored.state, vec![1, 2, 3]);
    }
}
