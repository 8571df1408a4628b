//! Settings-driven construction of recorders and mappers.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use sequent_codec::{AesGcmCipher, EventMapper, TopicRegistry, ZlibCompressor};
use sequent_store_core::{BackendKind, CompressorKind, ProcessRecorder, RuntimeSettings};
use sequent_store_memory::MemoryRecorder;
use sequent_store_sled::SledRecorder;
use sequent_store_sqlite::SqliteRecorder;

use crate::RunnerError;

/// Construct the recorder selected by `infrastructure_backend`.
pub async fn build_recorder(
    settings: &RuntimeSettings,
) -> Result<Arc<dyn ProcessRecorder>, RunnerError> {
    match settings.infrastructure_backend {
        BackendKind::Memory => Ok(Arc::new(MemoryRecorder::new())),
        BackendKind::Sqlite => {
            let uri = required_uri(settings, "sqlite")?;
            let recorder =
                SqliteRecorder::open_with_lock_timeout(uri, settings.lock_timeout_ms).await?;
            Ok(Arc::new(recorder))
        }
        BackendKind::Sled => {
            let uri = required_uri(settings, "sled")?;
            Ok(Arc::new(SledRecorder::open(uri)?))
        }
    }
}

/// Construct an event mapper over a topic table, applying the settings'
/// compressor and cipher key.
pub fn build_mapper(
    settings: &RuntimeSettings,
    topics: TopicRegistry,
) -> Result<Arc<EventMapper>, RunnerError> {
    let mut builder = EventMapper::builder(topics);
    if let Some(kind) = settings.compressor {
        match kind {
            CompressorKind::Zlib => builder = builder.compressor(ZlibCompressor::default()),
        }
    }
    if let Some(encoded) = &settings.cipher_key {
        let key = BASE64
            .decode(encoded)
            .map_err(|e| RunnerError::Config(format!("cipher_key is not valid base64: {e}")))?;
        let cipher = AesGcmCipher::from_key(&key)
            .map_err(|e| RunnerError::Config(e.to_string()))?;
        builder = builder.cipher(cipher);
    }
    Ok(Arc::new(builder.build()))
}

fn required_uri<'a>(
    settings: &'a RuntimeSettings,
    backend: &str,
) -> Result<&'a str, RunnerError> {
    settings
        .connection_uri
        .as_deref()
        .ok_or_else(|| RunnerError::Config(format!("connection_uri required for the {backend} backend")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_needs_no_uri() {
        let settings = RuntimeSettings::default();
        let recorder = build_recorder(&settings).await.unwrap();
        assert_eq!(recorder.max_notification_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn persistent_backends_require_a_uri() {
        let settings = RuntimeSettings {
            infrastructure_backend: BackendKind::Sqlite,
            ..RuntimeSettings::default()
        };
        assert!(matches!(
            build_recorder(&settings).await,
            Err(RunnerError::Config(_))
        ));
    }

    #[test]
    fn mapper_applies_cipher_and_compressor() {
        let settings = RuntimeSettings {
            cipher_key: Some(BASE64.encode([7u8; 32])),
            compressor: Some(CompressorKind::Zlib),
            ..RuntimeSettings::default()
        };
        let topics = TopicRegistry::builder().topic("t").build();
        assert!(build_mapper(&settings, topics).is_ok());
    }

    #[test]
    fn malformed_cipher_key_is_a_config_error() {
        let settings = RuntimeSettings {
            cipher_key: Some("not base64!!!".into()),
            ..RuntimeSettings::default()
        };
        let topics = TopicRegistry::builder().topic("t").build();
        assert!(matches!(
            build_mapper(&settings, topics),
            Err(RunnerError::Config(_))
        ));
    }
}
