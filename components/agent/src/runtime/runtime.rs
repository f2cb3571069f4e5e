// Local crates
use crate::config::config::BeaverConfig;
use crate::consumer::consumer::QueueConsumer;
use crate::consumer::manager::ConsumerFactory;
use crate::encrypters::create_encrypter;
use crate::encrypters::kms::ProviderFactory;
use crate::helpers::shutdown::Shutdown;
use crate::helpers::REOPEN_FILES;
use crate::queue::queue::{DispatchQueue, QueueItem};
use crate::tailer::manager::TailManager;
use crate::transports::TransportRegistry;
use crate::tunnel::tunnel::create_ssh_tunnel;

// External crates
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often the tailing worker cycles through its files.
const SCAN_INTERVAL: Duration = Duration::from_millis(100);
/// How often the supervisor re-checks worker health and refresh age.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(500);

/// Run the agent until a signal arrives. Returns the process exit code:
/// 0 for a clean shutdown, 130 when interrupted.
pub async fn run(
    config: Arc<BeaverConfig>,
    registry: TransportRegistry,
    kms_provider: Option<ProviderFactory>,
) -> Result<i32> {
    let shutdown = Shutdown::new();
    let signal_code = Arc::new(AtomicI32::new(0));
    spawn_signal_listener(shutdown.clone(), Arc::clone(&signal_code));

    run_with_shutdown(config, registry, kms_provider, shutdown).await?;
    Ok(signal_code.load(Ordering::SeqCst))
}

/// The supervisor body, driven by an externally owned termination event.
///
/// Owns the dispatch queue, the tunnel lifecycle, and the tailing worker:
/// a dead worker is restarted, and a worker older than
/// `refresh_worker_process` is recycled through an orderly stop. Every
/// respawn resets the worker's start timestamp.
pub async fn run_with_shutdown(
    config: Arc<BeaverConfig>,
    registry: TransportRegistry,
    kms_provider: Option<ProviderFactory>,
    shutdown: Shutdown,
) -> Result<()> {
    // Fail startup on anything misconfigured before touching the
    // filesystem: transport, encrypter, position store, tunnel.
    registry
        .create(&config.beaver.transport, &config)
        .with_context(|| format!("configuring transport `{}`", config.beaver.transport))?;
    if let Some(encrypter) = config.beaver.encrypter.clone() {
        create_encrypter(Some(&encrypter), &config, "", kms_provider.as_ref())
            .with_context(|| format!("configuring encrypter `{encrypter}`"))?;
    }
    match &config.beaver.sincedb_path {
        Some(path) => info!(sincedb = %path.display(), "Using position store"),
        None => bail!("sincedb_path is not set"),
    }
    let mut tunnel = create_ssh_tunnel(&config)?;

    if REOPEN_FILES {
        debug!("Files will be reopened on every scan pass on this platform");
    }

    let queue = DispatchQueue::bounded(config.beaver.max_queue_size);
    let registry = Arc::new(registry);
    let consumer_factory = build_consumer_factory(
        Arc::clone(&config),
        queue.clone(),
        Arc::clone(&registry),
        kms_provider,
        shutdown.clone(),
    );

    info!(
        transport = %config.beaver.transport,
        consumers = config.beaver.number_of_consumer_processes,
        "Starting worker..."
    );
    let mut worker = spawn_worker(&config, &queue, &consumer_factory, &shutdown)?;
    let mut lifecycle_failure = false;

    while !shutdown.is_triggered() {
        if worker.handle.is_finished() {
            reap(&mut worker).await;
            info!("Worker exited, starting a fresh one...");
            worker = spawn_worker(&config, &queue, &consumer_factory, &shutdown)?;
        } else if let Some(refresh) = config.beaver.refresh_worker_process {
            if worker.started.elapsed() >= Duration::from_secs(refresh) {
                info!("Worker has exceeded the refresh limit, recycling...");
                let _ = queue.try_put(QueueItem::Exit);
                worker.scope.trigger();
                if stop_worker(&mut worker, config.shutdown_timeout()).await.is_err() {
                    lifecycle_failure = true;
                }
                worker = spawn_worker(&config, &queue, &consumer_factory, &shutdown)?;
            }
        }

        tokio::select! {
            _ = shutdown.triggered() => {}
            _ = tokio::time::sleep(SUPERVISE_INTERVAL) => {}
        }
    }

    info!("Shutting down. Please wait...");
    let _ = queue.try_put(QueueItem::Exit);
    worker.scope.trigger();
    let stopped = stop_worker(&mut worker, config.shutdown_timeout()).await;

    if let Some(tunnel) = tunnel.as_mut() {
        info!("Closing ssh tunnel...");
        tunnel.close();
    }

    stopped.context("worker did not exit within shutdown_timeout")?;
    if lifecycle_failure {
        bail!("a recycled worker did not exit within shutdown_timeout");
    }
    info!("Shutdown complete");
    Ok(())
}

struct Worker {
    handle: JoinHandle<Result<()>>,
    scope: Shutdown,
    started: Instant,
}

fn spawn_worker(
    config: &Arc<BeaverConfig>,
    queue: &DispatchQueue,
    consumer_factory: &ConsumerFactory,
    shutdown: &Shutdown,
) -> Result<Worker> {
    let scope = shutdown.child();
    let mut manager = TailManager::new(
        Arc::clone(config),
        queue.clone(),
        consumer_factory.clone(),
        scope.clone(),
    )?;
    let shutdown_timeout = config.shutdown_timeout();
    let handle = tokio::spawn(async move { manager.run(SCAN_INTERVAL, shutdown_timeout).await });
    Ok(Worker {
        handle,
        scope,
        started: Instant::now(),
    })
}

async fn reap(worker: &mut Worker) {
    match (&mut worker.handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Worker ended with an error"),
        Err(e) => warn!(error = %e, "Worker task failed"),
    }
}

async fn stop_worker(worker: &mut Worker, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, &mut worker.handle).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Worker ended with an error during stop");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Worker task failed during stop");
            Ok(())
        }
        Err(_) => {
            worker.handle.abort();
            bail!("worker still alive after {timeout:?}");
        }
    }
}

fn build_consumer_factory(
    config: Arc<BeaverConfig>,
    queue: DispatchQueue,
    registry: Arc<TransportRegistry>,
    kms_provider: Option<ProviderFactory>,
    shutdown: Shutdown,
) -> ConsumerFactory {
    Arc::new(move || {
        let transport_name = config.beaver.transport.clone();
        match registry.create(&transport_name, &config) {
            Ok(transport) => {
                info!(transport = %transport_name, "Starting queue consumer");
                let consumer = QueueConsumer::new(
                    queue.clone(),
                    Arc::clone(&config),
                    transport,
                    kms_provider.clone(),
                    shutdown.clone(),
                );
                tokio::spawn(consumer.run())
            }
            Err(e) => {
                error!(transport = %transport_name, error = %e, "Failed to create transport");
                // Pause so the reviver does not spin on a broken factory.
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                })
            }
        }
    })
}

fn spawn_signal_listener(shutdown: Shutdown, code: Arc<AtomicI32>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut term, mut int, mut quit) = match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::quit()),
            ) {
                (Ok(t), Ok(i), Ok(q)) => (t, i, q),
                _ => {
                    error!("Failed to install signal handlers");
                    return;
                }
            };
            tokio::select! {
                _ = term.recv() => info!("SIGTERM detected"),
                _ = int.recv() => {
                    info!("SIGINT detected");
                    code.store(130, Ordering::SeqCst);
                }
                _ = quit.recv() => info!("SIGQUIT detected"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt detected");
                code.store(130, Ordering::SeqCst);
            }
        }
        info!("Shutting down. Please wait...");
        shutdown.trigger();
    });
}
