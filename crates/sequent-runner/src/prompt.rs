//! Prompt propagation: fire-and-forget "new work available" signals.

use std::sync::Arc;

use tokio::sync::broadcast;

use sequent_types::PipelineId;

/// A hint that new notifications are available on an upstream log.
///
/// Loss is harmless (workers fall back to polling); duplication is
/// harmless (wakeups are idempotent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// The log that grew.
    pub upstream_name: String,
    /// The pipeline it grew in.
    pub pipeline_id: PipelineId,
}

/// Transport carrying prompts between workers.
///
/// In-process deployments use [`InProcessTransport`]; multi-process
/// deployments plug in an external broker behind the same interface.
pub trait PromptTransport: Send + Sync {
    /// Publish a prompt to all subscribers. Never blocks; failures are
    /// swallowed because polling guarantees progress regardless.
    fn send(&self, prompt: Prompt);

    /// Subscribe to the prompt stream.
    fn subscribe(&self) -> broadcast::Receiver<Prompt>;
}

/// Broadcast-channel transport for workers sharing one address space.
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    tx: Arc<broadcast::Sender<Prompt>>,
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

impl InProcessTransport {
    /// Create a transport with the given ring-buffer capacity.
    ///
    /// Slow subscribers may miss prompts when the buffer overflows; they
    /// catch up on their next polling tick.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl PromptTransport for InProcessTransport {
    fn send(&self, prompt: Prompt) {
        // Lagging or absent receivers are fine.
        let _ = self.tx.send(prompt);
    }

    fn subscribe(&self) -> broadcast::Receiver<Prompt> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prompts_reach_all_subscribers() {
        let transport = InProcessTransport::new(16);
        let mut rx1 = transport.subscribe();
        let mut rx2 = transport.subscribe();
        assert_eq!(transport.subscriber_count(), 2);

        let prompt = Prompt {
            upstream_name: "orders".into(),
            pipeline_id: 0,
        };
        transport.send(prompt.clone());

        assert_eq!(rx1.recv().await.unwrap(), prompt);
        assert_eq!(rx2.recv().await.unwrap(), prompt);
    }

    #[test]
    fn sending_without_subscribers_is_harmless() {
        let transport = InProcessTransport::default();
        transport.send(Prompt {
            upstream_name: "orders".into(),
            pipeline_id: 0,
        });
    }
}
