// Local crates
use crate::config::config::BeaverConfig;
use crate::encrypters::create_encrypter;
use crate::encrypters::encrypter::{Encrypter, EncrypterError};
use crate::encrypters::kms::ProviderFactory;
use crate::helpers::shutdown::Shutdown;
use crate::queue::queue::{DispatchQueue, EventBatch, QueueItem};
use crate::transports::transport::{Transport, TransportError};

// External crates
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A consumer worker: pulls queue items and drives one transport.
///
/// Workers isolate failures. Delivery problems are retried within policy;
/// anything persistent ends the worker loop so the ConsumerManager can
/// recycle it with a fresh transport. The pipeline itself never crashes.
pub struct QueueConsumer {
    queue: DispatchQueue,
    config: Arc<BeaverConfig>,
    transport: Box<dyn Transport>,
    kms_provider: Option<ProviderFactory>,
    shutdown: Shutdown,
    encrypters: HashMap<String, Arc<dyn Encrypter>>,
    routes: HashMap<String, Vec<String>>,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl QueueConsumer {
    pub fn new(
        queue: DispatchQueue,
        config: Arc<BeaverConfig>,
        transport: Box<dyn Transport>,
        kms_provider: Option<ProviderFactory>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            queue,
            config,
            transport,
            kms_provider,
            shutdown,
            encrypters: HashMap::new(),
            routes: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        debug!("Consumer worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.triggered() => {
                    self.transport.interrupt();
                    break;
                }
                item = self.queue.get() => {
                    match item {
                        None => break,
                        Some(QueueItem::Exit) => {
                            info!("Consumer worker draining on exit sentinel");
                            self.transport.interrupt();
                            break;
                        }
                        Some(QueueItem::AddGlob { pattern, paths }) => {
                            debug!(pattern, files = paths.len(), "Routing table updated");
                            self.routes.insert(pattern, paths);
                        }
                        Some(QueueItem::Callback(batch)) => {
                            if self.deliver(batch).await.is_err() {
                                // Recycle: the manager will respawn a
                                // worker with a fresh transport.
                                self.transport.interrupt();
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!("Consumer worker stopped");
    }

    async fn deliver(&mut self, batch: EventBatch) -> Result<(), ()> {
        let lines = match self.transform(&batch) {
            Ok(lines) => lines,
            Err(e) => {
                error!(filename = %batch.filename, error = %e, "Payload transform failed, dropping batch");
                return Err(());
            }
        };

        let max_failure = self.config.beaver.max_failure.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .transport
                .send(&batch.filename, &lines, &batch.fields, &batch.timestamp)
                .await
            {
                Ok(()) => return Ok(()),
                Err(TransportError::Retry(reason)) if attempt < max_failure => {
                    warn!(
                        filename = %batch.filename,
                        attempt,
                        reason = %reason,
                        "Transient delivery failure, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.triggered() => return Err(()),
                        _ = tokio::time::sleep(self.config.respawn_delay()) => {}
                    }
                }
                Err(e) => {
                    error!(
                        filename = %batch.filename,
                        attempt,
                        error = %e,
                        "Delivery failed, dropping batch and recycling worker"
                    );
                    return Err(());
                }
            }
        }
    }

    /// Apply the batch's encrypter, when one is configured. Instances are
    /// resolved once per filename and the process-wide cache dedups the
    /// expensive providers underneath.
    fn transform(&mut self, batch: &EventBatch) -> Result<Vec<String>, EncrypterError> {
        let Some(name) = batch.encrypter.as_deref() else {
            return Ok(batch.lines.clone());
        };

        if !self.encrypters.contains_key(&batch.filename) {
            let encrypter = create_encrypter(
                Some(name),
                &self.config,
                &batch.filename,
                self.kms_provider.as_ref(),
            )?;
            self.encrypters.insert(batch.filename.clone(), encrypter);
        }
        let encrypter = &self.encrypters[&batch.filename];

        batch
            .lines
            .iter()
            .map(|line| {
                encrypter
                    .encrypt(line.as_bytes())
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn routes(&self) -> &HashMap<String, Vec<String>> {
        &self.routes
    }
}
