//! Byte-stream framing.
//!
//! The [`Framer`] splits an unbounded incoming byte stream into CRLF-delimited
//! command lines and, while a DATA transfer is active, into dot-unstuffed
//! message body chunks. It is pull-based: [`Framer::feed`] only appends bytes,
//! and [`Framer::next_segment`] produces at most one segment per call, so a
//! mode switch triggered by a dispatched command (DATA, STARTTLS) applies to
//! any bytes that arrived in the same chunk.

pub mod address;

use std::collections::VecDeque;

pub use address::{Address, decode_xtext, parse_address};

/// One unit of framed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A complete command line, CRLF stripped.
    Command(String),
    /// A run of message body bytes, dot-unstuffing already applied.
    Body(Vec<u8>),
    /// The body terminator was seen; the framer is back in command mode.
    BodyEnd { exceeded: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    Body,
}

/// Number of trailing bytes retained in body mode so a terminator split
/// across chunks is never mistaken for content.
const BODY_HOLDBACK: usize = 4;

#[derive(Debug)]
pub struct Framer {
    buf: Vec<u8>,
    pos: usize,
    mode: Mode,
    queued: VecDeque<Segment>,
    body_bytes: u64,
    max_bytes: u64,
    at_body_start: bool,
    closed: bool,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            mode: Mode::Command,
            queued: VecDeque::new(),
            body_bytes: 0,
            max_bytes: 0,
            at_body_start: false,
            closed: false,
        }
    }

    /// Append a chunk of raw input. Chunks may split lines, CRLF pairs, and
    /// the body terminator at any byte boundary.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.closed {
            return;
        }

        self.buf.extend_from_slice(chunk);
    }

    /// Switch to body mode. Bytes already buffered behind the DATA line are
    /// reinterpreted as body content, preserving arrival order.
    /// `max_bytes == 0` means unlimited.
    pub fn start_body(&mut self, max_bytes: u64) {
        if self.closed {
            return;
        }

        self.mode = Mode::Body;
        self.body_bytes = 0;
        self.max_bytes = max_bytes;
        self.at_body_start = true;
    }

    /// Return to command mode, leaving any buffered bytes to be parsed as
    /// commands. Called internally once the terminator is seen.
    pub fn stop_body(&mut self) {
        if self.closed {
            return;
        }

        self.mode = Mode::Command;
    }

    /// Discard everything buffered. Used when the plaintext stream is
    /// abandoned for a TLS handshake.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
        self.queued.clear();
    }

    /// After close every operation is a no-op.
    pub fn close(&mut self) {
        self.closed = true;
        self.clear();
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Produce the next segment, or `None` if more input is needed.
    pub fn next_segment(&mut self) -> Option<Segment> {
        if self.closed {
            return None;
        }

        if let Some(segment) = self.queued.pop_front() {
            return Some(segment);
        }

        self.compact();

        match self.mode {
            Mode::Command => self.next_command(),
            Mode::Body => self.next_body(),
        }
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    fn next_command(&mut self) -> Option<Segment> {
        loop {
            let data = &self.buf[self.pos..];
            let end = find(data, b"\r\n")?;
            let line = &data[..end];

            if line.is_empty() {
                // Stray CRLF between commands, skip it.
                self.pos += 2;
                continue;
            }

            let line = String::from_utf8_lossy(line).into_owned();
            self.pos += end + 2;
            return Some(Segment::Command(line));
        }
    }

    fn next_body(&mut self) -> Option<Segment> {
        loop {
            let data = &self.buf[self.pos..];

            if data.is_empty() {
                return None;
            }

            if self.at_body_start && data[0] == b'.' {
                match (data.get(1), data.get(2)) {
                    // "." CRLF straight away: the body is empty.
                    (Some(b'\r'), Some(b'\n')) => {
                        self.pos += 3;
                        return Some(self.terminate());
                    }
                    // Could still turn into the terminator.
                    (None, _) | (Some(b'\r'), None) => return None,
                    // Dot-stuffed first line: drop the escape dot.
                    (Some(b'.'), _) => {
                        self.pos += 1;
                        self.at_body_start = false;
                        continue;
                    }
                    // Lone leading dot that is not a terminator: plain content.
                    _ => self.at_body_start = false,
                }
            }

            let data = &self.buf[self.pos..];
            let mut from = 0;

            while let Some(found) = find(&data[from..], b"\r\n.") {
                let at = from + found;

                if data.len() < at + 5 {
                    // Cannot classify yet; the holdback below keeps it.
                    break;
                }

                if data[at + 3] == b'\r' && data[at + 4] == b'\n' {
                    // CRLF "." CRLF: end of body. The leading CRLF belongs
                    // to the content, the rest is never delivered.
                    let chunk = data[..at + 2].to_vec();
                    self.pos += at + 5;
                    self.at_body_start = false;

                    let end = self.terminate();

                    if chunk.is_empty() {
                        return Some(end);
                    }

                    self.body_bytes += chunk.len() as u64;
                    self.queued.push_back(end);
                    return Some(Segment::Body(chunk));
                }

                if data[at + 3] == b'.' {
                    // CRLF ".." — dot-stuffed line: emit up to the CRLF and
                    // drop the escape dot.
                    let chunk = data[..at + 2].to_vec();
                    self.pos += at + 3;
                    self.at_body_start = false;
                    self.body_bytes += chunk.len() as u64;
                    return Some(Segment::Body(chunk));
                }

                // Single mid-body leading dot, passes through as content.
                from = at + 2;
            }

            if data.len() <= BODY_HOLDBACK {
                return None;
            }

            let emit = data.len() - BODY_HOLDBACK;
            let chunk = data[..emit].to_vec();
            self.pos += emit;
            self.at_body_start = false;
            self.body_bytes += chunk.len() as u64;
            return Some(Segment::Body(chunk));
        }
    }

    fn terminate(&mut self) -> Segment {
        self.mode = Mode::Command;
        self.at_body_start = false;

        Segment::BodyEnd {
            exceeded: self.max_bytes > 0 && self.body_bytes > self.max_bytes,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }

    haystack.windows(needle.len()).position(|w| w == needle)
}
