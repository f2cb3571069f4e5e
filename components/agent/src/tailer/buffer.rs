// Local crates
use crate::queue::queue::EventBatch;

// External crates
use std::time::{Duration, Instant};

/// Flush thresholds for one file's batch buffer. With none configured the
/// buffer degenerates to flush-per-line.
#[derive(Debug, Clone, Default)]
pub struct FlushTriggers {
    pub max_lines: Option<usize>,
    pub max_bytes: Option<usize>,
    pub max_age: Option<Duration>,
}

impl FlushTriggers {
    fn effective_max_lines(&self) -> Option<usize> {
        if self.max_lines.is_none() && self.max_bytes.is_none() && self.max_age.is_none() {
            Some(1)
        } else {
            self.max_lines
        }
    }
}

/// Per-file line accumulator.
///
/// A batch exists from the first buffered line to the flush that drains
/// it; the flush timestamp is stamped in UTC with microsecond precision.
#[derive(Debug)]
pub struct BatchBuffer {
    filename: String,
    fields: Vec<String>,
    encrypter: Option<String>,
    triggers: FlushTriggers,
    lines: Vec<String>,
    bytes: usize,
    first_line_at: Option<Instant>,
}

impl BatchBuffer {
    pub fn new(
        filename: String,
        fields: Vec<String>,
        encrypter: Option<String>,
        triggers: FlushTriggers,
    ) -> Self {
        Self {
            filename,
            fields,
            encrypter,
            triggers,
            lines: Vec::new(),
            bytes: 0,
            first_line_at: None,
        }
    }

    /// Buffer one line; returns the drained batch when a threshold fires.
    pub fn push(&mut self, line: String) -> Option<EventBatch> {
        if self.lines.is_empty() {
            self.first_line_at = Some(Instant::now());
        }
        self.bytes += line.len();
        self.lines.push(line);

        let lines_hit = self
            .triggers
            .effective_max_lines()
            .is_some_and(|max| self.lines.len() >= max);
        let bytes_hit = self.triggers.max_bytes.is_some_and(|max| self.bytes >= max);
        if lines_hit || bytes_hit {
            return Some(self.flush());
        }
        None
    }

    /// Age check, called once per scan pass even when no bytes arrived.
    pub fn poll(&mut self, now: Instant) -> Option<EventBatch> {
        let max_age = self.triggers.max_age?;
        let first = self.first_line_at?;
        if now.duration_since(first) >= max_age {
            return Some(self.flush());
        }
        None
    }

    /// Drain whatever is buffered, returning `None` when empty.
    pub fn drain(&mut self) -> Option<EventBatch> {
        if self.lines.is_empty() {
            return None;
        }
        Some(self.flush())
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn flush(&mut self) -> EventBatch {
        self.first_line_at = None;
        self.bytes = 0;
        EventBatch {
            filename: self.filename.clone(),
            lines: std::mem::take(&mut self.lines),
            fields: self.fields.clone(),
            timestamp: chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.6fZ")
                .to_string(),
            encrypter: self.encrypter.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(triggers: FlushTriggers) -> BatchBuffer {
        BatchBuffer::new("test.log".to_string(), Vec::new(), None, triggers)
    }

    #[test]
    fn unconfigured_buffer_flushes_every_line() {
        let mut buf = buffer(FlushTriggers::default());
        let batch = buf.push("solo".to_string()).unwrap();
        assert_eq!(batch.lines, vec!["solo"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn flushes_on_line_count() {
        let mut buf = buffer(FlushTriggers {
            max_lines: Some(2),
            max_bytes: Some(10_000),
            max_age: Some(Duration::from_secs(60)),
        });
        assert!(buf.push("test".to_string()).is_none());
        let batch = buf.push("test2".to_string()).unwrap();
        assert_eq!(batch.lines, vec!["test", "test2"]);
    }

    #[test]
    fn flushes_on_byte_count() {
        let mut buf = buffer(FlushTriggers {
            max_lines: Some(100),
            max_bytes: Some(8),
            max_age: Some(Duration::from_secs(60)),
        });
        assert!(buf.push("test".to_string()).is_none());
        let batch = buf.push("test2".to_string()).unwrap();
        assert_eq!(batch.lines.len(), 2);

        // Small lines stay buffered below the byte cap.
        assert!(buf.push("a".to_string()).is_none());
        assert!(buf.push("b".to_string()).is_none());
    }

    #[test]
    fn flushes_on_age() {
        let mut buf = buffer(FlushTriggers {
            max_lines: Some(100),
            max_bytes: Some(10_000),
            max_age: Some(Duration::from_secs(1)),
        });
        assert!(buf.push("old".to_string()).is_none());
        assert!(buf.poll(Instant::now()).is_none());
        let batch = buf.poll(Instant::now() + Duration::from_secs(1)).unwrap();
        assert_eq!(batch.lines, vec!["old"]);
        assert!(buf.poll(Instant::now() + Duration::from_secs(2)).is_none());
    }

    #[test]
    fn timestamp_is_utc_microseconds() {
        let mut buf = buffer(FlushTriggers::default());
        let batch = buf.push("x".to_string()).unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(&batch.timestamp, "%Y-%m-%dT%H:%M:%S%.fZ")
            .is_ok());
        assert!(batch.timestamp.ends_with('Z'));
        // Six fractional digits between the dot and the Z.
        let frac = batch.timestamp.split('.').nth(1).unwrap();
        assert_eq!(frac.len(), 7);
    }
}
