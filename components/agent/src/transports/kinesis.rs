// Local crates
use crate::config::config::BeaverConfig;
use crate::helpers::shutdown::Shutdown;
use crate::transports::formatter::Formatter;
use crate::transports::transport::{SinkError, Transport, TransportError};

// External crates
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Service limit on records per put-records call.
const MAX_RECORDS_PER_BATCH: usize = 500;

#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub partition_key: String,
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct PutRecordsOutcome {
    pub failed_record_count: usize,
}

/// The external streaming-service client. The concrete SDK lives outside
/// the agent; the embedding application registers an implementation.
pub trait StreamClient: Send {
    fn put_records(
        &mut self,
        stream: &str,
        records: &[StreamRecord],
    ) -> Result<PutRecordsOutcome, SinkError>;
}

/// Stream sink with batched put-records delivery.
///
/// Batches flush when the record count reaches the service limit or the
/// next record would push the byte total past `kinesis_aws_batch_size_max`.
/// Partition keys are random unique ids so records spread across shards.
/// Backoff waits race the termination event so a shutdown is observed
/// between retry attempts.
pub struct KinesisTransport {
    stream: String,
    batch_size_max: usize,
    max_retries: u32,
    initial_backoff: Duration,
    formatter: Formatter,
    client: Box<dyn StreamClient>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for KinesisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KinesisTransport")
            .field("stream", &self.stream)
            .field("batch_size_max", &self.batch_size_max)
            .finish_non_exhaustive()
    }
}

impl KinesisTransport {
    pub fn new(
        config: &BeaverConfig,
        client: Box<dyn StreamClient>,
        shutdown: Shutdown,
    ) -> Result<Self, TransportError> {
        let stream = config
            .beaver
            .kinesis_aws_stream
            .clone()
            .ok_or_else(|| TransportError::Config("kinesis_aws_stream is not set".to_string()))?;
        Ok(Self {
            stream,
            batch_size_max: config.beaver.kinesis_aws_batch_size_max,
            max_retries: config.beaver.kinesis_max_retries.max(1),
            initial_backoff: Duration::from_millis(config.beaver.kinesis_initial_backoff_millis),
            formatter: Formatter::from_config(config)?,
            client,
            shutdown,
        })
    }

    async fn send_record_batch(&mut self, records: &[StreamRecord]) -> Result<(), TransportError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let retryable = match self.client.put_records(&self.stream, records) {
                Ok(outcome) if outcome.failed_record_count == 0 => return Ok(()),
                Ok(outcome) => format!("{} records failed", outcome.failed_record_count),
                Err(e) if is_throttle(&e.message) => e.message,
                Err(e) => return Err(TransportError::Fatal(e.message)),
            };

            if attempt >= self.max_retries {
                return Err(TransportError::Retry(format!(
                    "put_records exhausted {} attempts: {retryable}",
                    self.max_retries
                )));
            }
            let backoff = self.initial_backoff * 2u32.saturating_pow(attempt - 1);
            warn!(attempt, ?backoff, reason = %retryable, "Stream put throttled, backing off");
            tokio::select! {
                _ = self.shutdown.triggered() => {
                    return Err(TransportError::Retry(
                        "put_records interrupted by shutdown during backoff".to_string(),
                    ));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

fn is_throttle(message: &str) -> bool {
    message.contains("ProvisionedThroughputExceededException")
        || message.contains("Throttle")
        || message.contains("Throttling")
}

fn partition_key() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[async_trait]
impl Transport for KinesisTransport {
    async fn send(
        &mut self,
        filename: &str,
        lines: &[String],
        fields: &[String],
        timestamp: &str,
    ) -> Result<(), TransportError> {
        let mut batch: Vec<StreamRecord> = Vec::new();
        let mut batch_bytes = 0usize;

        for line in lines {
            let data = self.formatter.format(filename, line, timestamp, fields);
            let size = data.len();
            if size > self.batch_size_max {
                debug!(bytes = size, "Dropping record too large for the stream");
                continue;
            }

            if !batch.is_empty()
                && (batch.len() == MAX_RECORDS_PER_BATCH
                    || batch_bytes + size >= self.batch_size_max)
            {
                debug!(records = batch.len(), bytes = batch_bytes, "Flushing record batch");
                self.send_record_batch(&batch).await?;
                batch.clear();
                batch_bytes = 0;
            }

            batch_bytes += size;
            batch.push(StreamRecord {
                partition_key: partition_key(),
                data,
            });
        }

        if !batch.is_empty() {
            debug!(records = batch.len(), bytes = batch_bytes, "Flushing final record batch");
            self.send_record_batch(&batch).await?;
        }
        Ok(())
    }
}
