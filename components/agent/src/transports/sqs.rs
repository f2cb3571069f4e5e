// Local crates
use crate::config::config::BeaverConfig;
use crate::transports::formatter::Formatter;
use crate::transports::transport::{SinkError, Transport, TransportError};

// External crates
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Broker limit on entries per batch call.
const MAX_BATCH_ENTRIES: usize = 10;

/// The external queue-service client. The concrete SDK lives outside the
/// agent; the embedding application registers an implementation.
pub trait SqsClient: Send {
    fn send_message(&mut self, queue: &str, body: &str) -> Result<(), SinkError>;
    fn send_message_batch(&mut self, queue: &str, bodies: &[String]) -> Result<(), SinkError>;
}

/// Queue/broker sink. Multiple destinations are selected round-robin per
/// source file. Bulk mode joins lines into newline-separated messages
/// bounded by `sqs_bulk_size_max` bytes; single mode sends batches of
/// one-line entries.
pub struct SqsTransport {
    queues: Vec<String>,
    bulk_lines: bool,
    bulk_size_max: usize,
    formatter: Formatter,
    client: Box<dyn SqsClient>,
    next_queue: HashMap<String, usize>,
}

impl std::fmt::Debug for SqsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsTransport")
            .field("queues", &self.queues)
            .field("bulk_lines", &self.bulk_lines)
            .finish_non_exhaustive()
    }
}

impl SqsTransport {
    pub fn new(config: &BeaverConfig, client: Box<dyn SqsClient>) -> Result<Self, TransportError> {
        let queues: Vec<String> = config
            .beaver
            .sqs_aws_queue
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if queues.is_empty() {
            return Err(TransportError::Config(
                "sqs_aws_queue is not set".to_string(),
            ));
        }
        Ok(Self {
            queues,
            bulk_lines: config.beaver.sqs_bulk_lines,
            bulk_size_max: config.beaver.sqs_bulk_size_max,
            formatter: Formatter::from_config(config)?,
            client,
            next_queue: HashMap::new(),
        })
    }

    fn pick_queue(&mut self, filename: &str) -> String {
        let slot = self.next_queue.entry(filename.to_string()).or_insert(0);
        let queue = self.queues[*slot % self.queues.len()].clone();
        *slot = slot.wrapping_add(1);
        queue
    }

    fn send_bulk(&mut self, queue: &str, formatted: &[String]) -> Result<(), TransportError> {
        let mut message = String::new();
        for line in formatted {
            if line.len() > self.bulk_size_max {
                warn!(bytes = line.len(), "Dropping oversized line for queue sink");
                continue;
            }
            if !message.is_empty() && message.len() + 1 + line.len() > self.bulk_size_max {
                self.send_message(queue, &std::mem::take(&mut message))?;
            }
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str(line);
        }
        if !message.is_empty() {
            self.send_message(queue, &message)?;
        }
        Ok(())
    }

    fn send_single(&mut self, queue: &str, formatted: &[String]) -> Result<(), TransportError> {
        for chunk in formatted.chunks(MAX_BATCH_ENTRIES) {
            self.send_message_batch(queue, chunk)?;
        }
        Ok(())
    }

    fn send_message(&mut self, queue: &str, body: &str) -> Result<(), TransportError> {
        debug!(queue, bytes = body.len(), "Sending bulk message");
        self.client.send_message(queue, body).map_err(map_sink_error)
    }

    fn send_message_batch(&mut self, queue: &str, bodies: &[String]) -> Result<(), TransportError> {
        debug!(queue, entries = bodies.len(), "Sending message batch");
        self.client
            .send_message_batch(queue, bodies)
            .map_err(map_sink_error)
    }
}

fn map_sink_error(e: SinkError) -> TransportError {
    if e.transient {
        TransportError::Retry(e.message)
    } else {
        TransportError::Fatal(e.message)
    }
}

#[async_trait]
impl Transport for SqsTransport {
    async fn send(
        &mut self,
        filename: &str,
        lines: &[String],
        fields: &[String],
        timestamp: &str,
    ) -> Result<(), TransportError> {
        let formatted: Vec<String> = lines
            .iter()
            .map(|line| self.formatter.format(filename, line, timestamp, fields))
            .collect();
        let queue = self.pick_queue(filename);
        if self.bulk_lines {
            self.send_bulk(&queue, &formatted)
        } else {
            self.send_single(&queue, &formatted)
        }
    }
}
