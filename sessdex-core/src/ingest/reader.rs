//! Streaming log record reader
//!
//! [`LogReader`] turns a line-oriented source into a stream of [`LogEvent`]s.
//! It never fails on bad content: lines that are not valid UTF-8, not JSON,
//! or not a typed object are counted as malformed and skipped. I/O errors end
//! the stream and are kept for the caller to inspect via [`LogReader::take_error`].

use super::dialects::decode_line;
use crate::types::LogEvent;
use std::collections::VecDeque;
use std::io::{self, BufRead, Seek, SeekFrom};

/// Iterator over the events of a session log.
pub struct LogReader<R> {
    inner: R,
    buf: Vec<u8>,
    pending: VecDeque<LogEvent>,
    lines_read: u64,
    malformed_lines: u64,
    bytes_read: u64,
    line_limit: Option<u64>,
    byte_limit: Option<u64>,
    error: Option<io::Error>,
    finished: bool,
}

impl<R: BufRead + Seek> LogReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
            pending: VecDeque::new(),
            lines_read: 0,
            malformed_lines: 0,
            bytes_read: 0,
            line_limit: None,
            byte_limit: None,
            error: None,
            finished: false,
        }
    }

    /// Stop after `limit` physical lines.
    pub fn with_line_limit(mut self, limit: u64) -> Self {
        self.line_limit = Some(limit);
        self
    }

    /// Stop at `limit` bytes.
    ///
    /// Used to pin a scan to the file size observed when the scan started, so
    /// that appends made during the scan are not attributed to the old identity.
    /// A trailing partial line within the limit is still read.
    pub fn with_byte_limit(mut self, limit: u64) -> Self {
        self.byte_limit = Some(limit);
        self
    }

    /// Physical lines consumed so far, including blank and malformed lines.
    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Lines that could not be decoded.
    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines
    }

    /// True while events decoded from the last line are still queued.
    ///
    /// A caller that stops while this is true would cut a line in half.
    pub fn mid_line(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The I/O error that ended the stream, if any.
    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }

    /// Rewind to the beginning and reset all counters.
    ///
    /// Limits are kept.
    pub fn restart(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(0))?;
        self.pending.clear();
        self.lines_read = 0;
        self.malformed_lines = 0;
        self.bytes_read = 0;
        self.error = None;
        self.finished = false;
        Ok(())
    }

    /// Remove the line limit (the byte limit stays).
    pub fn clear_line_limit(&mut self) {
        self.line_limit = None;
    }

    fn at_limit(&self) -> bool {
        if let Some(limit) = self.line_limit {
            if self.lines_read >= limit {
                return true;
            }
        }
        if let Some(limit) = self.byte_limit {
            if self.bytes_read >= limit {
                return true;
            }
        }
        false
    }

    /// Read and decode the next physical line. Returns false at end of input.
    fn advance_line(&mut self) -> bool {
        if self.finished || self.at_limit() {
            self.finished = true;
            return false;
        }

        self.buf.clear();
        let read = match self.inner.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.finished = true;
                return false;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return true,
            Err(e) => {
                self.error = Some(e);
                self.finished = true;
                return false;
            }
        };

        if let Some(limit) = self.byte_limit {
            let remaining = limit.saturating_sub(self.bytes_read) as usize;
            if read > remaining {
                self.buf.truncate(remaining);
            }
        }
        self.bytes_read += read as u64;
        self.lines_read += 1;

        let line_no = self.lines_read;
        match std::str::from_utf8(&self.buf).ok().and_then(|line| decode_line(line, line_no)) {
            Some(events) => self.pending.extend(events),
            None => {
                self.malformed_lines += 1;
                tracing::debug!(line = line_no, "Skipping malformed log line");
            }
        }
        true
    }
}

impl<R: BufRead + Seek> Iterator for LogReader<R> {
    type Item = LogEvent;

    fn next(&mut self) -> Option<LogEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if !self.advance_line() {
                return None;
            }
        }
    }
}
