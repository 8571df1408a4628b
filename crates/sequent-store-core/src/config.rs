//! Runtime settings recognized across the storage and process layers.

use serde::{Deserialize, Serialize};

use sequent_types::{PipelineId, DEFAULT_PIPELINE};

/// Selects the recorder implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Non-persistent in-memory tables.
    Memory,
    /// SQLite via sqlx.
    Sqlite,
    /// Embedded sled database.
    Sled,
}

/// Selects the payload compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    /// Zlib (deflate).
    Zlib,
}

/// The recognized configuration options.
///
/// Deserializable from JSON; unknown fields are rejected so configuration
/// typos surface instead of silently doing nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeSettings {
    /// Recorder implementation.
    pub infrastructure_backend: BackendKind,
    /// Database endpoint (file path or URI), for persistent backends.
    pub connection_uri: Option<String>,
    /// Base64-encoded AES key; enables at-rest encryption when present.
    pub cipher_key: Option<String>,
    /// Enables payload compression when present.
    pub compressor: Option<CompressorKind>,
    /// Topics that are persisted; everything is persisted when empty.
    pub persist_event_type: Vec<String>,
    /// Tracking-record discriminator for process applications.
    pub application_name: String,
    /// Partition selector for multi-pipeline deployments.
    pub pipeline_id: PipelineId,
    /// Page size of notification-log sections.
    pub notification_section_size: usize,
    /// Polling fallback interval when no prompt arrives, in milliseconds.
    pub prompt_timeout_ms: u64,
    /// Database write-lock wait bound, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Attempt bound for transient-fault retries.
    pub max_retries: u32,
    /// Base delay of the exponential backoff, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            infrastructure_backend: BackendKind::Memory,
            connection_uri: None,
            cipher_key: None,
            compressor: None,
            persist_event_type: Vec::new(),
            application_name: "application".to_owned(),
            pipeline_id: DEFAULT_PIPELINE,
            notification_section_size: 20,
            prompt_timeout_ms: 1_000,
            lock_timeout_ms: 5_000,
            max_retries: 5,
            retry_delay_ms: 50,
        }
    }
}

impl RuntimeSettings {
    /// Parse settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_memory_backed() {
        let settings = RuntimeSettings::default();
        assert_eq!(settings.infrastructure_backend, BackendKind::Memory);
        assert!(settings.cipher_key.is_none());
        assert_eq!(settings.pipeline_id, DEFAULT_PIPELINE);
    }

    #[test]
    fn json_roundtrip_and_unknown_field_rejection() {
        let settings = RuntimeSettings::from_json(
            r#"{
                "infrastructure_backend": "sqlite",
                "connection_uri": "events.db",
                "application_name": "orders",
                "notification_section_size": 10
            }"#,
        )
        .unwrap();
        assert_eq!(settings.infrastructure_backend, BackendKind::Sqlite);
        assert_eq!(settings.connection_uri.as_deref(), Some("events.db"));
        assert_eq!(settings.notification_section_size, 10);

        assert!(RuntimeSettings::from_json(r#"{"connection_url": "typo"}"#).is_err());
    }
}
