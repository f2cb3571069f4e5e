// Local crates
use crate::config::config::BeaverConfig;
use crate::consumer::manager::{ConsumerFactory, ConsumerManager};
use crate::helpers::glob::eglob;
use crate::helpers::shutdown::Shutdown;
use crate::queue::queue::{DispatchQueue, QueueItem};
use crate::sincedb::sincedb::SinceDb;
use crate::tailer::tail::{file_id, Tail, TailError};

// External crates
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

/// The tailing worker: discovers files, owns the live tails, and drives
/// their scan cycle.
///
/// Discovery runs in glob mode when patterns are configured (explicit
/// `files` or `[globs]` sections) and falls back to scanning `path` for
/// `.log` files. Each fresh identity gets its own Tail; inactive tails
/// are closed and pruned. The consumer pool is started and stopped with
/// the worker so a recycled worker always gets fresh consumers.
pub struct TailManager {
    config: Arc<BeaverConfig>,
    queue: DispatchQueue,
    sincedb: Arc<Mutex<SinceDb>>,
    consumer_factory: ConsumerFactory,
    shutdown: Shutdown,
    tails: HashMap<String, Tail>,
    routes: HashMap<String, Vec<String>>,
    last_discovery: Option<Instant>,
}

impl std::fmt::Debug for TailManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailManager")
            .field("tails", &self.tails.len())
            .finish_non_exhaustive()
    }
}

impl TailManager {
    pub fn new(
        config: Arc<BeaverConfig>,
        queue: DispatchQueue,
        consumer_factory: ConsumerFactory,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let sincedb_path = config
            .beaver
            .sincedb_path
            .clone()
            .context("sincedb_path is not set")?;
        let sincedb = SinceDb::open(&sincedb_path, config.sincedb_write_interval())
            .with_context(|| format!("opening sincedb at {}", sincedb_path.display()))?;

        Ok(Self {
            config,
            queue,
            sincedb: Arc::new(Mutex::new(sincedb)),
            consumer_factory,
            shutdown,
            tails: HashMap::new(),
            routes: HashMap::new(),
            last_discovery: None,
        })
    }

    /// Outer scan loop. Runs until the shutdown event fires, then closes
    /// every tail and stops the consumer pool within `shutdown_timeout`.
    #[instrument(name = "tail_manager_run", skip_all)]
    pub async fn run(&mut self, interval: Duration, shutdown_timeout: Duration) -> Result<()> {
        let consumers = ConsumerManager::start(
            self.consumer_factory.clone(),
            self.config.beaver.number_of_consumer_processes,
            self.config.consumer_refresh_interval(),
        );

        let result = self.scan_loop(interval).await;

        info!("Closing all tails");
        for tail in self.tails.values_mut() {
            if let Err(e) = tail.close(false).await {
                warn!(file = tail.filename(), error = %e, "Error closing tail");
            }
        }
        self.tails.clear();

        consumers
            .stop(shutdown_timeout)
            .await
            .context("stopping consumer pool")?;
        result
    }

    async fn scan_loop(&mut self, interval: Duration) -> Result<()> {
        while !self.shutdown.is_triggered() {
            self.update_files().await?;

            let fids: Vec<String> = self.tails.keys().cloned().collect();
            for fid in fids {
                if self.shutdown.is_triggered() {
                    break;
                }
                self.update_files().await?;

                debug!(identity = %fid, "Processing");
                let inactive = match self.tails.get_mut(&fid) {
                    Some(tail) => {
                        tail.run_pass().await?;
                        !tail.active()
                    }
                    None => continue,
                };
                if inactive {
                    if let Some(mut tail) = self.tails.remove(&fid) {
                        info!(file = tail.filename(), "Tail went inactive, pruning");
                        tail.close(false).await?;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.triggered() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Ok(())
    }

    /// Rescan for new, rotated, or removed files, at most once per
    /// discover interval.
    async fn update_files(&mut self) -> Result<()> {
        if let Some(last) = self.last_discovery {
            if last.elapsed() < self.config.discover_interval() {
                return Ok(());
            }
        }
        self.last_discovery = Some(Instant::now());

        let mut candidates: Vec<PathBuf> = Vec::new();
        let patterns = self.config.watch_patterns();
        if !patterns.is_empty() {
            for (pattern, excludes) in patterns {
                let paths: Vec<PathBuf> = eglob(&pattern, &excludes)
                    .into_iter()
                    .filter_map(|p| std::fs::canonicalize(&p).ok())
                    .collect();
                let rendered: Vec<String> = paths
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect();
                // Both sides need the expansion: the manager for its own
                // routing state, the consumers via the queue event.
                self.routes.insert(pattern.clone(), rendered.clone());
                self.queue
                    .put(QueueItem::AddGlob {
                        pattern,
                        paths: rendered,
                    })
                    .await
                    .ok();
                candidates.extend(paths);
            }
        } else if let Some(folder) = self.config.beaver.path.clone() {
            candidates.extend(self.listdir(&folder));
        }

        for path in candidates {
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
            };
            if !metadata.is_file() {
                continue;
            }
            if self.too_old(&metadata, &path) {
                continue;
            }

            let fid = file_id(&metadata);
            if self.tails.contains_key(&fid) {
                continue;
            }
            self.watch(path, fid).await;
        }
        Ok(())
    }

    /// List-mode discovery: files with a `.log` extension directly under
    /// the configured folder.
    fn listdir(&self, folder: &Path) -> Vec<PathBuf> {
        WalkDir::new(folder)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().map_or(false, |ext| ext == "log"))
            .filter_map(|path| std::fs::canonicalize(&path).ok())
            .collect()
    }

    fn too_old(&self, metadata: &std::fs::Metadata, path: &Path) -> bool {
        let Some(window) = self.config.ignore_old_files() else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        let Ok(age) = modified.elapsed() else {
            return false;
        };
        match chrono::Duration::from_std(age) {
            Ok(age) if age > window => {
                debug!(file = %path.display(), "File is older than the ignore window, skipping");
                true
            }
            _ => false,
        }
    }

    async fn watch(&mut self, path: PathBuf, fid: String) {
        if self.shutdown.is_triggered() {
            return;
        }
        match Tail::open(
            path.clone(),
            &self.config,
            Arc::clone(&self.sincedb),
            self.queue.clone(),
        )
        .await
        {
            Ok(tail) => {
                if tail.active() {
                    self.tails.insert(fid, tail);
                }
            }
            Err(TailError::Io(e))
                if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::PermissionDenied =>
            {
                debug!(file = %path.display(), error = %e, "Skipping unreadable file");
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "Failed to open tail");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_files(&self) -> usize {
        self.tails.len()
    }

    #[cfg(test)]
    pub(crate) fn routes(&self) -> &HashMap<String, Vec<String>> {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::{BeaverConfig, CliOverrides};
    use std::io::Write;

    fn factory() -> ConsumerFactory {
        Arc::new(|| tokio::spawn(async {}))
    }

    struct Fixture {
        dir: tempfile::TempDir,
        queue: DispatchQueue,
    }

    fn load_config(dir: &tempfile::TempDir, body: &str) -> Arc<BeaverConfig> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[beaver]\nlogstash_version = 0\nsincedb_path = \"{}\"\n{body}",
            dir.path().join("sincedb").display()
        )
        .unwrap();
        file.flush().unwrap();
        Arc::new(BeaverConfig::load(Some(file.path()), CliOverrides::default()).unwrap())
    }

    fn touch(path: &std::path::Path, contents: &str) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn list_mode_only_picks_up_log_extensions() {
        let fixture = Fixture {
            dir: tempfile::tempdir().unwrap(),
            queue: DispatchQueue::bounded(16),
        };
        touch(&fixture.dir.path().join("app.log"), "x\n");
        touch(&fixture.dir.path().join("app.log.1"), "x\n");
        touch(&fixture.dir.path().join("notes.txt"), "x\n");
        touch(&fixture.dir.path().join("catalog"), "x\n");

        let config = load_config(
            &fixture.dir,
            &format!("path = \"{}\"", fixture.dir.path().display()),
        );
        let mut manager = TailManager::new(
            config,
            fixture.queue.clone(),
            factory(),
            Shutdown::new(),
        )
        .unwrap();

        manager.update_files().await.unwrap();
        assert_eq!(manager.tracked_files(), 1);
    }

    #[tokio::test]
    async fn glob_mode_excludes_and_announces_expansions() {
        let fixture = Fixture {
            dir: tempfile::tempdir().unwrap(),
            queue: DispatchQueue::bounded(16),
        };
        // The watched files live below the sincedb so the bare `*`
        // pattern cannot pick the position store up.
        let logs = fixture.dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        touch(&logs.join("a.log"), "x\n");
        touch(&logs.join("b.log"), "x\n");
        touch(&logs.join("c.gz"), "x\n");

        let pattern = format!("{}/*", logs.display());
        let config = load_config(
            &fixture.dir,
            &format!("[globs.\"{pattern}\"]\nexclude = [\"*.gz\"]"),
        );
        let mut manager = TailManager::new(
            config,
            fixture.queue.clone(),
            factory(),
            Shutdown::new(),
        )
        .unwrap();

        manager.update_files().await.unwrap();
        assert_eq!(manager.tracked_files(), 2);
        assert_eq!(manager.routes().len(), 1);

        match fixture.queue.get().await.unwrap() {
            QueueItem::AddGlob { pattern: p, paths } => {
                assert_eq!(p, pattern);
                assert_eq!(paths.len(), 2);
            }
            other => panic!("expected an addglob event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rescans_are_gated_by_the_discover_interval() {
        let fixture = Fixture {
            dir: tempfile::tempdir().unwrap(),
            queue: DispatchQueue::bounded(16),
        };
        let config = load_config(
            &fixture.dir,
            &format!(
                "discover_interval = 3600\npath = \"{}\"",
                fixture.dir.path().display()
            ),
        );
        let mut manager = TailManager::new(
            config,
            fixture.queue.clone(),
            factory(),
            Shutdown::new(),
        )
        .unwrap();

        manager.update_files().await.unwrap();
        assert_eq!(manager.tracked_files(), 0);

        // A file created after the first scan stays invisible until the
        // interval elapses.
        touch(&fixture.dir.path().join("late.log"), "x\n");
        manager.update_files().await.unwrap();
        assert_eq!(manager.tracked_files(), 0);
    }

    #[tokio::test]
    async fn old_files_are_ignored_by_mtime() {
        let fixture = Fixture {
            dir: tempfile::tempdir().unwrap(),
            queue: DispatchQueue::bounded(16),
        };
        let stale = fixture.dir.path().join("stale.log");
        touch(&stale, "x\n");
        // Backdate the mtime well past the one-minute window.
        let old = std::time::SystemTime::now() - Duration::from_secs(600);
        let file = std::fs::OpenOptions::new().write(true).open(&stale).unwrap();
        file.set_modified(old).unwrap();

        let config = load_config(
            &fixture.dir,
            &format!(
                "ignore_old_files_minutes = 1\npath = \"{}\"",
                fixture.dir.path().display()
            ),
        );
        let mut manager = TailManager::new(
            config,
            fixture.queue.clone(),
            factory(),
            Shutdown::new(),
        )
        .unwrap();

        manager.update_files().await.unwrap();
        assert_eq!(manager.tracked_files(), 0);
    }
}
