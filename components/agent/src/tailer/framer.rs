// Local crates
use crate::config::config::MultilineSettings;

// External crates
use bytes::BytesMut;
use regex::Regex;
use std::time::{Duration, Instant};

/// Multiline merge policy: continuation lines are appended to the line
/// before them. `negate` inverts the match, so either "lines matching the
/// pattern continue the previous line" or "lines NOT matching start a new
/// record" can be expressed.
#[derive(Debug)]
pub struct MultilinePolicy {
    regex: Regex,
    negate: bool,
    flush_after: Duration,
}

impl MultilinePolicy {
    pub fn new(settings: &MultilineSettings) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&settings.regex)?,
            negate: settings.negate,
            flush_after: settings.flush_after,
        })
    }

    fn is_continuation(&self, line: &str) -> bool {
        self.regex.is_match(line) != self.negate
    }
}

/// Splits a byte stream into complete logical lines.
///
/// Reads never end on newline boundaries, so the unterminated tail of every
/// chunk is carried over to the next one. With a multiline policy, the
/// newest non-continuation line is held pending until the next record
/// starts or the flush window passes.
#[derive(Debug)]
pub struct LineFramer {
    carry: BytesMut,
    multiline: Option<MultilinePolicy>,
    pending: Option<String>,
    pending_physical: u64,
    pending_since: Option<Instant>,
    delivered: u64,
}

impl LineFramer {
    pub fn new(multiline: Option<MultilinePolicy>) -> Self {
        Self {
            carry: BytesMut::new(),
            multiline,
            pending: None,
            pending_physical: 0,
            pending_since: None,
            delivered: 0,
        }
    }

    /// Feed newly read bytes; returns the logical lines completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.carry.iter().position(|b| *b == b'\n') {
            let raw = self.carry.split_to(pos + 1);
            let line = decode(&raw[..raw.len() - 1]);
            self.accept(line, &mut out);
        }
        out
    }

    fn accept(&mut self, line: String, out: &mut Vec<String>) {
        let Some(policy) = &self.multiline else {
            self.delivered += 1;
            out.push(line);
            return;
        };

        if self.pending.is_some() && policy.is_continuation(&line) {
            if let Some(pending) = self.pending.as_mut() {
                pending.push('\n');
                pending.push_str(&line);
            }
            self.pending_physical += 1;
            self.pending_since = Some(Instant::now());
            return;
        }

        if let Some(done) = self.pending.take() {
            self.delivered += self.pending_physical;
            out.push(done);
        }
        self.pending = Some(line);
        self.pending_physical = 1;
        self.pending_since = Some(Instant::now());
    }

    /// Time-based flush of a pending multiline block that has gone quiet.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        let policy = self.multiline.as_ref()?;
        let since = self.pending_since?;
        if now.duration_since(since) < policy.flush_after {
            return None;
        }
        self.pending_since = None;
        self.delivered += self.pending_physical;
        self.pending_physical = 0;
        self.pending.take()
    }

    /// Closeout drain: the pending block and any unterminated carry-over
    /// become final lines. Used when a file is rotated away or removed.
    pub fn take_remaining(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.carry.is_empty() {
            let raw = self.carry.split();
            self.accept(decode(&raw), &mut out);
        }
        if let Some(pending) = self.pending.take() {
            self.delivered += self.pending_physical;
            out.push(pending);
        }
        self.pending_physical = 0;
        self.pending_since = None;
        out
    }

    /// Physical lines folded into output so far. Pending multiline blocks
    /// and carry-over bytes are not counted until actually emitted, which
    /// keeps persisted positions behind delivery.
    pub fn delivered_lines(&self) -> u64 {
        self.delivered
    }

    pub fn reset(&mut self) {
        self.carry.clear();
        self.pending = None;
        self.pending_physical = 0;
        self.pending_since = None;
        self.delivered = 0;
    }
}

fn decode(raw: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(raw).into_owned();
    if line.ends_with('\r') {
        line.pop();
    }
    line
}
