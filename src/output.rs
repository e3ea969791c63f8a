//! Routing of one child output channel.
//!
//! Bytes read from a pipe go to the channel's log bus. When capture is
//! enabled, anything a child writes between `BEGIN_TOKEN` and `END_TOKEN` is
//! held back from the log and handed out as one communication payload
//! instead. A token can be split across reads, so a tail that might be the
//! start of one is kept until the next read settles it.
use std::io;
use std::path::Path;

use crate::bus::Bus;

pub const BEGIN_TOKEN: &[u8] = b"<!--XSUPERVISOR:BEGIN-->";
pub const END_TOKEN: &[u8] = b"<!--XSUPERVISOR:END-->";

/// Output that matters beyond the log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emitted {
    /// Plain output, reported only when log events are enabled.
    Log(Vec<u8>),
    /// Everything between a begin and an end token.
    Communication(Vec<u8>),
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest proper prefix of `token` that `data` ends with.
fn prefix_at_end(data: &[u8], token: &[u8]) -> usize {
    (1..token.len().min(data.len() + 1))
        .rev()
        .find(|&n| data.ends_with(&token[..n]))
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct Capture {
    maxbytes: usize,
    capturing: bool,
    pending: Vec<u8>,
    captured: Vec<u8>,
}

impl Capture {
    pub fn new(maxbytes: usize) -> Self {
        Self {
            maxbytes,
            capturing: false,
            pending: Vec::new(),
            captured: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.maxbytes > 0
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Split `data` into log pieces and finished communication payloads, in
    /// the order the child wrote them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Emitted> {
        if !self.is_enabled() {
            return vec![Emitted::Log(data.to_vec())];
        }

        self.pending.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            let token = if self.capturing { END_TOKEN } else { BEGIN_TOKEN };
            match find(&self.pending, token) {
                Some(at) => {
                    let before: Vec<u8> = self.pending.drain(..at).collect();
                    self.pending.drain(..token.len());
                    self.take(before, &mut out);
                    if self.capturing {
                        out.push(Emitted::Communication(std::mem::take(&mut self.captured)));
                    }
                    self.capturing = !self.capturing;
                }
                None => {
                    let keep = prefix_at_end(&self.pending, token);
                    let ready: Vec<u8> = self.pending.drain(..self.pending.len() - keep).collect();
                    self.take(ready, &mut out);
                    return out;
                }
            }
        }
    }

    fn take(&mut self, bytes: Vec<u8>, out: &mut Vec<Emitted>) {
        if bytes.is_empty() {
            return;
        }
        if !self.capturing {
            out.push(Emitted::Log(bytes));
            return;
        }
        self.captured.extend_from_slice(&bytes);
        // only the newest bytes are kept
        if self.captured.len() > self.maxbytes {
            let excess = self.captured.len() - self.maxbytes;
            self.captured.drain(..excess);
        }
    }

    /// The channel hit EOF: a held-back tail is plain output after all, and
    /// an unterminated capture is dropped.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let capturing = std::mem::replace(&mut self.capturing, false);
        let captured = std::mem::take(&mut self.captured);
        let rest = std::mem::take(&mut self.pending);
        if capturing {
            log::debug!(
                "dropping {} bytes of unterminated capture",
                captured.len() + rest.len()
            );
            return None;
        }
        (!rest.is_empty()).then_some(rest)
    }
}

/// Log bus, capture state and event switch of one channel.
#[derive(Debug)]
pub struct Output {
    label: String,
    bus: Bus,
    capture: Capture,
    log_events: bool,
}

impl Output {
    pub fn new(label: impl Into<String>, bus: Bus, capture_maxbytes: usize, log_events: bool) -> Self {
        Self {
            label: label.into(),
            bus,
            capture: Capture::new(capture_maxbytes),
            log_events,
        }
    }

    pub fn record(&mut self, data: &[u8]) -> Vec<Emitted> {
        let pieces = self.capture.feed(data);
        self.route(pieces)
    }

    pub fn finish(&mut self) -> Vec<Emitted> {
        let pieces = self.capture.finish().map(Emitted::Log).into_iter().collect();
        self.route(pieces)
    }

    fn route(&mut self, pieces: Vec<Emitted>) -> Vec<Emitted> {
        let mut emitted = Vec::new();
        for piece in pieces {
            match piece {
                Emitted::Log(bytes) => {
                    if let Err(e) = self.bus.consume(&bytes) {
                        log::error!("{}: failed to write log: {e}", self.label);
                    }
                    if self.log_events {
                        emitted.push(Emitted::Log(bytes));
                    }
                }
                Emitted::Communication(bytes) => {
                    log::debug!("{} emitted a comm event", self.label);
                    emitted.push(Emitted::Communication(bytes));
                }
            }
        }
        emitted
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.bus.flush()
    }

    pub fn reopen(&mut self) -> io::Result<()> {
        self.bus.reopen()
    }

    pub fn logfile(&self) -> Option<(&Path, u64)> {
        self.bus.logfile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{FileLogHandler, LogHandler};
    use std::fs;

    fn log(bytes: &[u8]) -> Emitted {
        Emitted::Log(bytes.to_vec())
    }

    fn comm(bytes: &[u8]) -> Emitted {
        Emitted::Communication(bytes.to_vec())
    }

    #[test]
    fn disabled_capture_passes_everything_through() {
        let mut capture = Capture::new(0);
        let data = b"a<!--XSUPERVISOR:BEGIN-->b";
        assert_eq!(capture.feed(data), vec![log(data)]);
        assert!(!capture.is_capturing());
    }

    #[test]
    fn tokens_split_log_from_communication() {
        let mut capture = Capture::new(100);
        let out = capture.feed(b"before<!--XSUPERVISOR:BEGIN--><msg/><!--XSUPERVISOR:END-->after");
        assert_eq!(out, vec![log(b"before"), comm(b"<msg/>"), log(b"after")]);
    }

    #[test]
    fn tokens_split_across_reads() {
        let mut capture = Capture::new(100);
        assert_eq!(capture.feed(b"x<!--XSUPER"), vec![log(b"x")]);
        assert!(capture.feed(b"VISOR:BEGIN-->pay").is_empty());
        assert!(capture.is_capturing());
        assert!(capture.feed(b"load<!--XSUPERVISOR:E").is_empty());
        assert_eq!(capture.feed(b"ND-->"), vec![comm(b"payload")]);
        assert!(!capture.is_capturing());
    }

    #[test]
    fn capture_keeps_newest_bytes() {
        let mut capture = Capture::new(4);
        let out = capture.feed(b"<!--XSUPERVISOR:BEGIN-->abcdefgh<!--XSUPERVISOR:END-->");
        assert_eq!(out, vec![comm(b"efgh")]);
    }

    #[test]
    fn finish_releases_held_tail() {
        let mut capture = Capture::new(100);
        assert_eq!(capture.feed(b"tail<!--"), vec![log(b"tail")]);
        assert_eq!(capture.finish(), Some(b"<!--".to_vec()));

        capture.feed(b"<!--XSUPERVISOR:BEGIN-->half");
        assert_eq!(capture.finish(), None);
        assert!(!capture.is_capturing());
    }

    #[test]
    fn output_logs_plain_bytes_and_reports_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut bus = Bus::new(0);
        bus.add_handler(LogHandler::File(FileLogHandler::new(&path).unwrap()));
        let mut output = Output::new("web stdout", bus, 64, true);

        let emitted = output.record(b"hi <!--XSUPERVISOR:BEGIN-->ping<!--XSUPERVISOR:END--> bye");
        assert_eq!(emitted, vec![log(b"hi "), comm(b"ping"), log(b" bye")]);
        assert_eq!(fs::read(&path).unwrap(), b"hi  bye");

        let mut quiet = Output::new("web stderr", Bus::new(0), 0, false);
        assert!(quiet.record(b"noise").is_empty());
        assert!(quiet.finish().is_empty());
    }
}
