#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sequent-codec** – Domain event ↔ stored record transcoding for Sequent.
//!
//! This crate owns the whole codec pipeline: the [`Transcoder`] serializes
//! value trees to canonical bytes through an extensible registry of named
//! [`Transcoding`]s, the optional [`Compressor`] and [`Cipher`] stages wrap
//! the serialized payload, and the [`EventMapper`] ties everything together
//! with topic resolution and class-version upcasting.
//!
//! All registries are built once and immutable afterwards; a mapper is
//! shared across threads behind an `Arc` and carries no interior mutability.

mod cipher;
mod compress;
mod mapper;
mod transcoder;

pub use cipher::{AesGcmCipher, Cipher, NONCE_LEN, TAG_LEN};
pub use compress::{Compressor, ZlibCompressor};
pub use mapper::{EventMapper, EventMapperBuilder, TopicRegistry, TopicRegistryBuilder, Upcaster};
pub use transcoder::{
    TimestampTranscoding, Transcoder, TranscoderBuilder, Transcoding, UuidTranscoding,
};

/// Errors produced by the codec pipeline.
///
/// `UnsupportedType`, `UnknownTranscoding` and `UnknownTopic` are
/// configuration errors, fatal at the operation site. `Integrity` means a
/// stored record cannot be decoded, decrypted or upcast; it is fatal for
/// the affected record and is never swallowed.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// No transcoding registered for a value's concrete type.
    #[error("no transcoding registered for type {type_name}")]
    UnsupportedType {
        /// Name of the unregistered Rust type.
        type_name: String,
    },
    /// An encoded blob references a transcoding name not in the registry.
    #[error("unknown transcoding name '{name}'")]
    UnknownTranscoding {
        /// The unresolvable name.
        name: String,
    },
    /// A stored record references a topic that is neither registered nor
    /// substituted.
    #[error("unknown topic '{topic}'")]
    UnknownTopic {
        /// The unresolvable topic.
        topic: String,
    },
    /// A domain mapping uses exactly the reserved codec envelope keys.
    #[error("state mapping collides with the reserved codec envelope keys")]
    ReservedEnvelope,
    /// Decryption, decompression, decoding or upcasting of a stored record
    /// failed.
    #[error("data integrity failure: {0}")]
    Integrity(String),
    /// Value tree could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),
}
