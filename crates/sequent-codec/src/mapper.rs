//! The event mapper: domain events ↔ stored record envelopes.
//!
//! Topics are opaque names registered in an explicit table together with
//! their current class version and upcaster; renamed types keep working
//! through `old → new` substitution entries. Resolution failures are never
//! silent.

use std::collections::HashMap;
use std::sync::Arc;

use sequent_types::{
    DomainEvent, Notification, NotificationId, Position, SequenceId, StateMap, StoredEvent, Topic,
    Value, CLASS_VERSION_KEY,
};

use crate::{Cipher, CodecError, Compressor, Transcoder};

//─────────────────────────────
//  Topic registry
//─────────────────────────────

/// Schema evolution hook for one event type.
///
/// Called once per intermediate version: an event stored at version 2 and
/// registered at version 4 sees `upcast(state, 2)` then `upcast(state, 3)`.
/// Implementations supply defaults for attributes added in each version.
pub trait Upcaster: Send + Sync {
    /// Transform `state` from `from_version` to `from_version + 1`.
    fn upcast(&self, state: &mut StateMap, from_version: u32);
}

impl<F> Upcaster for F
where
    F: Fn(&mut StateMap, u32) + Send + Sync,
{
    fn upcast(&self, state: &mut StateMap, from_version: u32) {
        self(state, from_version)
    }
}

struct TypeSpec {
    class_version: u32,
    upcaster: Option<Arc<dyn Upcaster>>,
}

/// Builder for the topic table.
#[derive(Default)]
pub struct TopicRegistryBuilder {
    types: HashMap<String, TypeSpec>,
    substitutions: HashMap<String, String>,
}

impl TopicRegistryBuilder {
    /// Register a topic at class version 0.
    pub fn topic(self, name: impl Into<String>) -> Self {
        self.versioned_topic(name, 0, None::<fn(&mut StateMap, u32)>)
    }

    /// Register a topic with a class version and its upcaster.
    pub fn versioned_topic(
        mut self,
        name: impl Into<String>,
        class_version: u32,
        upcaster: Option<impl Upcaster + 'static>,
    ) -> Self {
        self.types.insert(
            name.into(),
            TypeSpec {
                class_version,
                upcaster: upcaster.map(|u| Arc::new(u) as Arc<dyn Upcaster>),
            },
        );
        self
    }

    /// Record that records stored under `old` resolve to `new`.
    pub fn substitute(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.substitutions.insert(old.into(), new.into());
        self
    }

    /// Freeze the table.
    pub fn build(self) -> TopicRegistry {
        TopicRegistry {
            types: self.types,
            substitutions: self.substitutions,
        }
    }
}

/// Immutable topic table: registered event types and substitutions.
pub struct TopicRegistry {
    types: HashMap<String, TypeSpec>,
    substitutions: HashMap<String, String>,
}

impl TopicRegistry {
    /// Start building a registry.
    pub fn builder() -> TopicRegistryBuilder {
        TopicRegistryBuilder::default()
    }

    fn resolve<'a>(&'a self, topic: &'a str) -> Result<(&'a str, &'a TypeSpec), CodecError> {
        let mut name = topic;
        // Substitutions may chain across successive renames; the hop bound
        // guards against accidental cycles in the table.
        for _ in 0..=self.substitutions.len() {
            if let Some(spec) = self.types.get(name) {
                return Ok((name, spec));
            }
            match self.substitutions.get(name) {
                Some(next) => name = next,
                None => break,
            }
        }
        Err(CodecError::UnknownTopic {
            topic: topic.to_owned(),
        })
    }
}

//─────────────────────────────
//  Event mapper
//─────────────────────────────

/// Builder for [`EventMapper`].
pub struct EventMapperBuilder {
    transcoder: Arc<Transcoder>,
    topics: TopicRegistry,
    compressor: Option<Arc<dyn Compressor>>,
    cipher: Option<Arc<dyn Cipher>>,
}

impl EventMapperBuilder {
    /// Start from a topic table, with the default transcoder and neither
    /// compression nor encryption.
    pub fn new(topics: TopicRegistry) -> Self {
        Self {
            transcoder: Arc::new(Transcoder::with_defaults()),
            topics,
            compressor: None,
            cipher: None,
        }
    }

    /// Replace the transcoder.
    pub fn transcoder(mut self, transcoder: Arc<Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Enable compression.
    pub fn compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Some(Arc::new(compressor));
        self
    }

    /// Enable at-rest encryption.
    pub fn cipher(mut self, cipher: impl Cipher + 'static) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Freeze the mapper.
    pub fn build(self) -> EventMapper {
        EventMapper {
            transcoder: self.transcoder,
            topics: self.topics,
            compressor: self.compressor,
            cipher: self.cipher,
        }
    }
}

/// Converts domain events to stored records and back, applying the
/// configured codec stages and class-version upcasting.
///
/// Immutable after construction; share behind an `Arc`.
pub struct EventMapper {
    transcoder: Arc<Transcoder>,
    topics: TopicRegistry,
    compressor: Option<Arc<dyn Compressor>>,
    cipher: Option<Arc<dyn Cipher>>,
}

impl EventMapper {
    /// Start building a mapper over a topic table.
    pub fn builder(topics: TopicRegistry) -> EventMapperBuilder {
        EventMapperBuilder::new(topics)
    }

    /// Serialize a domain event into its stored form.
    pub fn to_stored(&self, event: &DomainEvent) -> Result<StoredEvent, CodecError> {
        let (_, spec) = self.topics.resolve(event.topic.as_str())?;

        let mut state = event.state.clone();
        if spec.class_version > 0 {
            state.insert(
                CLASS_VERSION_KEY.to_owned(),
                Value::Int(spec.class_version as i64),
            );
        }

        let mut bytes = self.transcoder.encode(&Value::Map(state))?;
        if let Some(compressor) = &self.compressor {
            bytes = compressor.compress(&bytes)?;
        }
        if let Some(cipher) = &self.cipher {
            bytes = cipher.encrypt(&bytes)?;
        }

        Ok(StoredEvent {
            sequence_id: event.sequence_id,
            position: event.position,
            topic: event.topic.clone(),
            state: bytes,
        })
    }

    /// Decode a stored record back into a domain event.
    pub fn to_domain(
        &self,
        sequence_id: SequenceId,
        position: Position,
        topic: &Topic,
        state: &[u8],
    ) -> Result<DomainEvent, CodecError> {
        let (resolved, spec) = self.topics.resolve(topic.as_str())?;

        let mut bytes = state.to_vec();
        if let Some(cipher) = &self.cipher {
            bytes = cipher.decrypt(&bytes)?;
        }
        if let Some(compressor) = &self.compressor {
            bytes = compressor.decompress(&bytes)?;
        }

        let mut map = match self.transcoder.decode(&bytes)? {
            Value::Map(map) => map,
            other => {
                return Err(CodecError::Integrity(format!(
                    "state payload is not a mapping: {other:?}"
                )))
            }
        };

        let stored_version = match map.remove(CLASS_VERSION_KEY) {
            Some(Value::Int(v)) if v >= 0 => v as u32,
            Some(other) => {
                return Err(CodecError::Integrity(format!(
                    "malformed {CLASS_VERSION_KEY}: {other:?}"
                )))
            }
            None => 0,
        };

        if stored_version > spec.class_version {
            return Err(CodecError::Integrity(format!(
                "record at class version {stored_version} but '{resolved}' is registered at {}",
                spec.class_version
            )));
        }
        if stored_version < spec.class_version {
            let upcaster = spec.upcaster.as_ref().ok_or_else(|| {
                CodecError::Integrity(format!(
                    "no upcaster registered for '{resolved}' (stored {stored_version}, current {})",
                    spec.class_version
                ))
            })?;
            for version in stored_version..spec.class_version {
                upcaster.upcast(&mut map, version);
            }
        }

        Ok(DomainEvent {
            sequence_id,
            position,
            topic: Topic::new(resolved),
            state: map,
        })
    }

    /// Decode a stored record envelope.
    pub fn decode_stored(&self, record: &StoredEvent) -> Result<DomainEvent, CodecError> {
        self.to_domain(record.sequence_id, record.position, &record.topic, &record.state)
    }

    /// Decode a notification, keeping its global order key.
    pub fn decode_notification(
        &self,
        notification: &Notification,
    ) -> Result<(NotificationId, DomainEvent), CodecError> {
        let event = self.to_domain(
            notification.sequence_id,
            notification.position,
            &notification.topic,
            &notification.state,
        )?;
        Ok((notification.id, event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AesGcmCipher, ZlibCompressor};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn plain_mapper() -> EventMapper {
        EventMapper::builder(TopicRegistry::builder().topic("orders.Created").build()).build()
    }

    fn sample_event() -> DomainEvent {
        DomainEvent::new(Uuid::from_u128(1), 0, "orders.Created")
            .with_attr("customer", Value::custom(Uuid::from_u128(0xabcdef)))
            .with_attr(
                "placed_at",
                Value::custom(Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap()),
            )
            .with_attr("total_cents", 12_500i64)
    }

    #[test]
    fn stored_roundtrip_is_identity() {
        let mapper = plain_mapper();
        let event = sample_event();
        let stored = mapper.to_stored(&event).unwrap();
        assert_eq!(stored.topic, event.topic);
        assert_eq!(stored.position, 0);
        let back = mapper.decode_stored(&stored).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unknown_topic_is_fatal_both_ways() {
        let mapper = plain_mapper();
        let event = DomainEvent::new(Uuid::from_u128(1), 0, "orders.Unregistered");
        assert!(matches!(
            mapper.to_stored(&event),
            Err(CodecError::UnknownTopic { .. })
        ));
        assert!(matches!(
            mapper.to_domain(Uuid::from_u128(1), 0, &Topic::new("nope"), b"{}"),
            Err(CodecError::UnknownTopic { .. })
        ));
    }

    #[test]
    fn substitution_resolves_renamed_topics() {
        let mapper = plain_mapper();
        let stored = mapper.to_stored(&sample_event()).unwrap();

        let renamed = EventMapper::builder(
            TopicRegistry::builder()
                .topic("orders.OrderCreated")
                .substitute("orders.Created", "orders.OrderCreated")
                .build(),
        )
        .build();

        let back = renamed.decode_stored(&stored).unwrap();
        assert_eq!(back.topic, Topic::new("orders.OrderCreated"));
        assert_eq!(back.attr("total_cents"), Some(&Value::Int(12_500)));
    }

    #[test]
    fn upcast_chain_reaches_current_version() {
        // Version history: v1 added "currency", v2 added "channel".
        let upcaster = |state: &mut StateMap, from_version: u32| match from_version {
            0 => {
                state.insert("currency".into(), Value::Str("EUR".into()));
            }
            1 => {
                state.insert("channel".into(), Value::Str("web".into()));
            }
            _ => {}
        };

        let v0 = EventMapper::builder(TopicRegistry::builder().topic("orders.Created").build())
            .build();
        let stored_v0 = v0.to_stored(&sample_event()).unwrap();

        let v2 = EventMapper::builder(
            TopicRegistry::builder()
                .versioned_topic("orders.Created", 2, Some(upcaster))
                .build(),
        )
        .build();

        // Decoding an old record upcasts through both versions.
        let upcast = v2.decode_stored(&stored_v0).unwrap();
        assert_eq!(upcast.attr("currency"), Some(&Value::Str("EUR".into())));
        assert_eq!(upcast.attr("channel"), Some(&Value::Str("web".into())));

        // Storing at v2 and decoding at v2 produces the same in-memory event.
        let direct = v2
            .to_stored(&upcast)
            .and_then(|s| v2.decode_stored(&s))
            .unwrap();
        assert_eq!(direct, upcast);
    }

    #[test]
    fn missing_upcaster_is_an_integrity_error() {
        let v0 = plain_mapper();
        let stored = v0.to_stored(&sample_event()).unwrap();

        let v1 = EventMapper::builder(
            TopicRegistry::builder()
                .versioned_topic("orders.Created", 1, None::<fn(&mut StateMap, u32)>)
                .build(),
        )
        .build();

        assert!(matches!(
            v1.decode_stored(&stored),
            Err(CodecError::Integrity(_))
        ));
    }

    #[test]
    fn encrypted_state_reveals_nothing() {
        let customer = Uuid::from_u128(0xabcdef);
        let mapper = EventMapper::builder(
            TopicRegistry::builder().topic("orders.Created").build(),
        )
        .compressor(ZlibCompressor::default())
        .cipher(AesGcmCipher::from_key(&[42u8; 32]).unwrap())
        .build();

        let event = sample_event();
        let stored = mapper.to_stored(&event).unwrap();

        let state_text = String::from_utf8_lossy(&stored.state);
        assert!(!state_text.contains(&customer.simple().to_string()));
        assert!(!state_text.contains("2024-05-17"));

        let back = mapper.decode_stored(&stored).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn wrong_key_surfaces_integrity() {
        let sealed = EventMapper::builder(
            TopicRegistry::builder().topic("orders.Created").build(),
        )
        .cipher(AesGcmCipher::from_key(&[1u8; 32]).unwrap())
        .build();
        let other = EventMapper::builder(
            TopicRegistry::builder().topic("orders.Created").build(),
        )
        .cipher(AesGcmCipher::from_key(&[2u8; 32]).unwrap())
        .build();

        let stored = sealed.to_stored(&sample_event()).unwrap();
        assert!(matches!(
            other.decode_stored(&stored),
            Err(CodecError::Integrity(_))
        ));
    }
}
