// Local crates
use crate::config::config::BeaverConfig;
use crate::helpers::REOPEN_FILES;
use crate::queue::queue::{DispatchQueue, EventBatch, QueueItem};
use crate::sincedb::sincedb::{SinceDb, SinceDbError};
use crate::tailer::buffer::{BatchBuffer, FlushTriggers};
use crate::tailer::framer::{LineFramer, MultilinePolicy};

// External crates
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum TailError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SinceDb(#[from] SinceDbError),
    #[error("invalid multiline policy: {0}")]
    Multiline(#[from] regex::Error),
    #[error("dispatch queue closed")]
    QueueClosed,
}

/// Stable file identity: `devicegInode` in hex. Two live files on one
/// host never collide on it.
#[cfg(unix)]
pub fn file_id(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!("{:x}g{:x}", metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
pub fn file_id(metadata: &std::fs::Metadata) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    metadata.created().ok().hash(&mut hasher);
    metadata.len().hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// One file's reader and state machine.
///
/// A tail owns its handle exclusively: it reconciles the handle against
/// the persisted position on open, reads appended bytes each pass, and
/// maintains identity through rotation and truncation. `byte_offset`
/// tracks bytes consumed from the current incarnation and only ever
/// grows while the identity is unchanged; the persisted offset is the
/// count of lines handed to the batch buffer.
#[derive(Debug)]
pub struct Tail {
    filename: String,
    path: PathBuf,
    file: Option<File>,
    fid: String,
    byte_offset: u64,
    line_base: u64,
    framer: LineFramer,
    buffer: BatchBuffer,
    active: bool,
    sincedb: Arc<Mutex<SinceDb>>,
    queue: DispatchQueue,
}

impl Tail {
    #[instrument(name = "tail_open", skip_all, fields(file = %path.display()))]
    pub async fn open(
        path: PathBuf,
        config: &BeaverConfig,
        sincedb: Arc<Mutex<SinceDb>>,
        queue: DispatchQueue,
    ) -> Result<Self, TailError> {
        let filename = path.to_string_lossy().into_owned();

        let multiline = match config.multiline_for(&filename) {
            Some(settings) => Some(MultilinePolicy::new(&settings)?),
            None => None,
        };
        let triggers = FlushTriggers {
            max_lines: config.beaver.buffered_lines_max_lines,
            max_bytes: config.beaver.buffered_lines_max_bytes,
            max_age: config
                .beaver
                .buffered_lines_max_seconds
                .map(Duration::from_secs_f64),
        };
        let buffer = BatchBuffer::new(
            filename.clone(),
            config.fields_for(&filename),
            config.encrypter_for(&filename),
            triggers,
        );

        let metadata = tokio::fs::metadata(&path).await?;
        let fid = file_id(&metadata);
        let mut file = File::open(&path).await?;

        let stored = sincedb.lock().await.start_position(&filename)?;
        let (byte_offset, line_base) = match stored {
            Some((identity, offset)) if identity == fid && offset > 0 => {
                let resumed = skip_lines(&mut file, offset).await?;
                debug!(offset, bytes = resumed.0, "Resuming from persisted position");
                resumed
            }
            Some((identity, _)) if identity != fid => {
                debug!(stored = %identity, current = %fid, "Stored identity is stale, starting over");
                (0, 0)
            }
            _ => (0, 0),
        };
        sincedb.lock().await.update(&filename, &fid, line_base, true)?;

        info!(identity = %fid, line = line_base, "Tailing file");
        Ok(Self {
            filename,
            path,
            file: Some(file),
            fid,
            byte_offset,
            line_base,
            framer: LineFramer::new(multiline),
            buffer,
            active: true,
            sincedb,
            queue,
        })
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn fid(&self) -> &str {
        &self.fid
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// One scan pass: reconcile the on-disk file with our handle, read
    /// what was appended, and run the time-based flush checks.
    #[instrument(name = "tail_pass", skip_all, fields(file = %self.filename))]
    pub async fn run_pass(&mut self) -> Result<(), TailError> {
        if !self.active {
            return Ok(());
        }

        if REOPEN_FILES {
            self.reopen().await?;
        }

        match tokio::fs::metadata(&self.path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("File removed, draining and closing");
                self.drain_available().await?;
                self.finish_remaining().await?;
                self.persist(true).await?;
                self.active = false;
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!(error = %e, "Cannot stat file, skipping pass");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
            Ok(metadata) => {
                let current = file_id(&metadata);
                if current != self.fid {
                    info!(old = %self.fid, new = %current, "Rotation detected");
                    self.drain_available().await?;
                    self.finish_remaining().await?;
                    if !self.swap_to(current).await? {
                        return Ok(());
                    }
                } else if metadata.len() < self.byte_offset {
                    info!(
                        size = metadata.len(),
                        offset = self.byte_offset,
                        "Truncation detected, restarting from the top"
                    );
                    self.restart_from_top().await?;
                }
            }
        }

        self.drain_available().await?;

        let now = Instant::now();
        if let Some(line) = self.framer.poll(now) {
            self.buffer_line(line).await?;
        }
        if let Some(batch) = self.buffer.poll(now) {
            self.emit(batch).await?;
        }

        self.persist(false).await?;
        Ok(())
    }

    /// Close the handle and stop tailing. Safe to call around a
    /// concurrent pass: the tail goes inactive and later passes no-op.
    pub async fn close(&mut self, remove_db_entry: bool) -> Result<(), TailError> {
        self.active = false;
        self.file = None;
        if remove_db_entry {
            self.sincedb.lock().await.remove(&self.filename)?;
        } else {
            self.persist(true).await?;
        }
        Ok(())
    }

    async fn drain_available(&mut self) -> Result<(), TailError> {
        let mut chunk = [0u8; 8192];
        loop {
            let read = match self.file.as_mut() {
                Some(file) => file.read(&mut chunk).await?,
                None => return Ok(()),
            };
            if read == 0 {
                return Ok(());
            }
            self.byte_offset += read as u64;
            for line in self.framer.push(&chunk[..read]) {
                self.buffer_line(line).await?;
            }
        }
    }

    /// Closeout: the carry-over and pending multiline block become final
    /// lines, and whatever is buffered is flushed.
    async fn finish_remaining(&mut self) -> Result<(), TailError> {
        for line in self.framer.take_remaining() {
            self.buffer_line(line).await?;
        }
        if let Some(batch) = self.buffer.drain() {
            self.emit(batch).await?;
        }
        Ok(())
    }

    /// Reopen the rotated path under its new identity, back at the top.
    /// Returns false when the file disappeared between stat and open.
    async fn swap_to(&mut self, fid: String) -> Result<bool, TailError> {
        self.file = None;
        self.fid = fid;
        self.byte_offset = 0;
        self.line_base = 0;
        self.framer.reset();
        match File::open(&self.path).await {
            Ok(file) => {
                self.file = Some(file);
                self.persist(true).await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("File vanished while reopening after rotation");
                self.active = false;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn restart_from_top(&mut self) -> Result<(), TailError> {
        self.framer.reset();
        self.byte_offset = 0;
        self.line_base = 0;
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(0)).await?;
        }
        self.persist(true).await?;
        Ok(())
    }

    /// Per-pass reopen for platforms that cache EOF on open descriptors.
    async fn reopen(&mut self) -> Result<(), TailError> {
        self.file = None;
        match File::open(&self.path).await {
            Ok(mut file) => {
                file.seek(SeekFrom::Start(self.byte_offset)).await?;
                self.file = Some(file);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn buffer_line(&mut self, line: String) -> Result<(), TailError> {
        if let Some(batch) = self.buffer.push(line) {
            self.emit(batch).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, batch: EventBatch) -> Result<(), TailError> {
        debug!(lines = batch.lines.len(), "Batch flushed to dispatch queue");
        self.queue
            .put(QueueItem::Callback(batch))
            .await
            .map_err(|_| TailError::QueueClosed)?;
        self.persist(false).await?;
        Ok(())
    }

    async fn persist(&mut self, force: bool) -> Result<(), TailError> {
        let lines = self.line_base + self.framer.delivered_lines();
        self.sincedb
            .lock()
            .await
            .update(&self.filename, &self.fid, lines, force)?;
        Ok(())
    }
}

/// Skip past `count` lines from the start of the file, leaving the cursor
/// on the byte after the last skipped newline. Returns `(bytes, lines)`
/// actually skipped; a shorter-than-recorded file just ends early.
async fn skip_lines(file: &mut File, count: u64) -> Result<(u64, u64), std::io::Error> {
    let mut remaining = count;
    let mut position: u64 = 0;
    let mut chunk = [0u8; 8192];

    while remaining > 0 {
        let read = file.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        for (index, byte) in chunk[..read].iter().enumerate() {
            if *byte == b'\n' {
                remaining -= 1;
                if remaining == 0 {
                    position += index as u64 + 1;
                    file.seek(SeekFrom::Start(position)).await?;
                    return Ok((position, count));
                }
            }
        }
        position += read as u64;
    }
    Ok((position, count - remaining))
}
