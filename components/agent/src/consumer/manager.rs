// Local crates
use crate::helpers::shutdown::Shutdown;

// External crates
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("consumer manager did not exit within {0:?}")]
    StopTimeout(Duration),
}

/// Spawns one consumer worker and returns its handle. Injected so the
/// wiring (and the tests) decide what a worker actually is.
pub type ConsumerFactory = Arc<dyn Fn() -> JoinHandle<()> + Send + Sync>;

/// Supervises a fixed pool of consumer workers.
///
/// Dead or missing slots are respawned through the factory on every
/// refresh interval. Kept deliberately simple: its sole responsibility is
/// monitoring and reviving, so a wedged worker can never take the
/// supervision loop down with it.
pub struct ConsumerManager {
    handle: JoinHandle<()>,
    stop: Shutdown,
}

impl std::fmt::Debug for ConsumerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerManager").finish_non_exhaustive()
    }
}

impl ConsumerManager {
    pub fn start(factory: ConsumerFactory, pool_size: usize, interval: Duration) -> Self {
        let stop = Shutdown::new();
        let handle = tokio::spawn(supervise(factory, pool_size, interval, stop.clone()));
        Self { handle, stop }
    }

    /// Signal the supervision loop and wait for it to wind down. On
    /// overrun the loop is aborted and the caller gets a lifecycle error
    /// so the process can exit nonzero.
    pub async fn stop(self, timeout: Duration) -> Result<(), SupervisionError> {
        self.stop.trigger();
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => Ok(()),
            Err(_) => {
                handle.abort();
                Err(SupervisionError::StopTimeout(timeout))
            }
        }
    }
}

async fn supervise(factory: ConsumerFactory, pool_size: usize, interval: Duration, stop: Shutdown) {
    let mut slots: Vec<Option<JoinHandle<()>>> = (0..pool_size).map(|_| None).collect();

    loop {
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.as_ref().map_or(true, |h| h.is_finished()) {
                debug!(index, "Spawning consumer worker");
                *slot = Some(factory());
            }
        }
        tokio::select! {
            _ = stop.triggered() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    for handle in slots.into_iter().flatten() {
        if !handle.is_finished() {
            debug!("Terminating consumer worker");
            handle.abort();
        }
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    async fn assert_eventually(condition: impl Fn() -> bool, timeout: Duration) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for condition");
    }

    #[tokio::test]
    async fn respawns_a_dead_worker() {
        let calls = Arc::new(AtomicU32::new(0));
        let factory_calls = Arc::clone(&calls);
        let factory: ConsumerFactory = Arc::new(move || {
            let call = factory_calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                // First worker dies immediately; the reviver must notice.
                tokio::spawn(async {})
            } else {
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                })
            }
        });

        let manager = ConsumerManager::start(factory, 1, Duration::from_millis(100));
        // Once to fire up the consumer, once more when the first one is
        // found dead.
        assert_eventually(
            || calls.load(Ordering::SeqCst) == 2,
            Duration::from_secs(2),
        )
        .await;

        manager.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn keeps_every_slot_filled() {
        let calls = Arc::new(AtomicU32::new(0));
        let factory_calls = Arc::clone(&calls);
        let factory: ConsumerFactory = Arc::new(move || {
            factory_calls.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
        });

        let manager = ConsumerManager::start(factory, 3, Duration::from_millis(50));
        assert_eventually(
            || calls.load(Ordering::SeqCst) == 3,
            Duration::from_secs(2),
        )
        .await;
        manager.stop(Duration::from_secs(2)).await.unwrap();
    }
}
