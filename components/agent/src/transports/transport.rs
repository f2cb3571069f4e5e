// External crates
use async_trait::async_trait;
use thiserror::Error;

/// Delivery failures, split by how the consumer should react.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transient: throttling, timeouts, 5xx. Retried within policy.
    #[error("transient transport failure: {0}")]
    Retry(String),
    /// Permanent: auth, malformed request. The item is dropped after
    /// policy exhaustion and the worker is recycled.
    #[error("fatal transport failure: {0}")]
    Fatal(String),
    /// Startup-time misconfiguration; names the offending option.
    #[error("transport configuration error: {0}")]
    Config(String),
}

/// Error surfaced by an external sink client. `transient` decides whether
/// the failure is retryable under the sink's policy.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SinkError {
    pub message: String,
    pub transient: bool,
}

impl SinkError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Uniform sink contract. One instance per consumer worker; per-file line
/// order is preserved by construction (one batch in flight per worker).
/// `send` runs on the worker's task, so any waiting inside it must be an
/// async, cancellable wait rather than a thread block.
#[async_trait]
pub trait Transport: Send {
    async fn send(
        &mut self,
        filename: &str,
        lines: &[String],
        fields: &[String],
        timestamp: &str,
    ) -> Result<(), TransportError>;

    /// Invoked when delivery is being interrupted; sinks flush or release
    /// what they hold.
    fn interrupt(&mut self) {}

    /// Whether failures outside `send` should be escalated.
    fn unhandled(&self) -> bool {
        true
    }
}
