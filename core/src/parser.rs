//! Response parser and the pool parsers are borrowed from.
//!
//! # Design
//! `ResponseParser` is push-based: the connection hands it whatever bytes
//! the transport produced and the parser calls back into a `ParserHandler` as
//! heads, body chunks and message ends are recognized. The head callback
//! decides whether a body follows (HEAD responses announce a length that
//! never arrives), so framing is chosen only after the handler has seen the
//! head.
//!
//! Heads are parsed with `httparse`; body framing (content-length, chunked,
//! read-until-close) is a small state machine here. A `101 Switching
//! Protocols` head stops parsing at the end of the head: the bytes after it
//! belong to whatever protocol takes over the connection.
//!
//! Parsers are recycled through `ParserPool` so a reconnecting client does
//! not allocate a fresh one every time.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};

use crate::http::ResponseHead;

/// Largest response head accepted, in bytes.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Most headers accepted in one response head.
const MAX_HEADERS: usize = 64;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 8 * 1024;

/// Idle parsers a pool keeps before dropping returned ones.
const DEFAULT_POOL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The status line or a header line is malformed.
    Head(httparse::Error),
    HeadTooLarge,
    InvalidContentLength,
    InvalidChunkSize,
    /// A chunk-size or trailer line exceeds the line limit.
    LineTooLong,
    /// Chunk data was not followed by CRLF.
    InvalidChunkTerminator,
    /// The stream ended inside a head or a length-delimited body.
    UnexpectedEof,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Head(err) => write!(f, "malformed response head: {err}"),
            ParseError::HeadTooLarge => write!(f, "response head exceeds {MAX_HEAD_SIZE} bytes"),
            ParseError::InvalidContentLength => write!(f, "invalid content-length"),
            ParseError::InvalidChunkSize => write!(f, "invalid chunk size line"),
            ParseError::LineTooLong => write!(f, "chunked framing line exceeds {MAX_LINE} bytes"),
            ParseError::InvalidChunkTerminator => write!(f, "chunk data not terminated by CRLF"),
            ParseError::UnexpectedEof => write!(f, "stream ended mid-response"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Receiver of parse results.
pub trait ParserHandler {
    /// A complete response head. Return `true` to treat the response as
    /// having no body.
    fn on_head(&mut self, head: ResponseHead) -> bool;

    fn on_body(&mut self, chunk: Bytes);

    /// The current response is complete. Return `false` to stop parsing the
    /// rest of the input.
    fn on_message_complete(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    Length(u64),
    Chunked(Chunk),
    UntilClose,
    Upgraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

#[derive(Debug)]
pub struct ResponseParser {
    mode: ParserMode,
    phase: Phase,
    /// Partial head or partial line carried between `execute` calls.
    buf: BytesMut,
    upgrade_head: Option<ResponseHead>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            mode: ParserMode::Response,
            phase: Phase::Head,
            buf: BytesMut::new(),
            upgrade_head: None,
        }
    }

    /// Reset all parsing state.
    pub fn reinitialize(&mut self, mode: ParserMode) {
        self.mode = mode;
        self.phase = Phase::Head;
        self.buf.clear();
        self.upgrade_head = None;
    }

    pub fn mode(&self) -> ParserMode {
        self.mode
    }

    /// The peer switched protocols; no further input is parsed.
    pub fn is_upgrade(&self) -> bool {
        self.phase == Phase::Upgraded
    }

    pub fn take_upgrade_head(&mut self) -> Option<ResponseHead> {
        self.upgrade_head.take()
    }

    /// A response has started and not yet completed.
    pub fn has_incoming(&self) -> bool {
        match self.phase {
            Phase::Head => !self.buf.is_empty(),
            Phase::Upgraded => false,
            _ => true,
        }
    }

    /// Feed `data` to the parser. Returns the number of bytes consumed; this
    /// is less than `data.len()` only after an upgrade or when the handler
    /// asked to stop.
    pub fn execute<H: ParserHandler>(&mut self, data: &[u8], handler: &mut H) -> Result<usize, ParseError> {
        let mut pos = 0;

        while pos < data.len() {
            let rest = &data[pos..];
            match self.phase {
                Phase::Upgraded => break,
                Phase::Head => {
                    let Some((head, used)) = self.parse_head(rest)? else {
                        pos = data.len();
                        continue;
                    };
                    pos += used;

                    if head.status == 101 {
                        self.phase = Phase::Upgraded;
                        self.upgrade_head = Some(head);
                        break;
                    }

                    let body = body_phase(&head)?;
                    let skip_body = handler.on_head(head);
                    match body {
                        Some(phase) if !skip_body => self.phase = phase,
                        _ => {
                            if !self.complete(handler) {
                                break;
                            }
                        }
                    }
                }
                Phase::Length(remaining) => {
                    let take = remaining.min(rest.len() as u64) as usize;
                    handler.on_body(Bytes::copy_from_slice(&rest[..take]));
                    pos += take;
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        if !self.complete(handler) {
                            break;
                        }
                    } else {
                        self.phase = Phase::Length(remaining);
                    }
                }
                Phase::UntilClose => {
                    handler.on_body(Bytes::copy_from_slice(rest));
                    pos = data.len();
                }
                Phase::Chunked(Chunk::Data(remaining)) => {
                    let take = remaining.min(rest.len() as u64) as usize;
                    handler.on_body(Bytes::copy_from_slice(&rest[..take]));
                    pos += take;
                    let remaining = remaining - take as u64;
                    self.phase = if remaining == 0 {
                        Phase::Chunked(Chunk::DataEnd)
                    } else {
                        Phase::Chunked(Chunk::Data(remaining))
                    };
                }
                Phase::Chunked(Chunk::Size) => {
                    let Some((line, used)) = self.take_line(rest)? else {
                        pos = data.len();
                        continue;
                    };
                    pos += used;
                    let size = parse_chunk_size(&line)?;
                    self.phase = if size == 0 {
                        Phase::Chunked(Chunk::Trailer)
                    } else {
                        Phase::Chunked(Chunk::Data(size))
                    };
                }
                Phase::Chunked(Chunk::DataEnd) => {
                    let Some((line, used)) = self.take_line(rest)? else {
                        pos = data.len();
                        continue;
                    };
                    pos += used;
                    if !line.is_empty() {
                        return Err(ParseError::InvalidChunkTerminator);
                    }
                    self.phase = Phase::Chunked(Chunk::Size);
                }
                Phase::Chunked(Chunk::Trailer) => {
                    let Some((line, used)) = self.take_line(rest)? else {
                        pos = data.len();
                        continue;
                    };
                    pos += used;
                    // Trailer fields are not surfaced.
                    if line.is_empty() && !self.complete(handler) {
                        break;
                    }
                }
            }
        }

        Ok(pos)
    }

    /// Signal end of input. Completes a read-until-close body.
    pub fn finish<H: ParserHandler>(&mut self, handler: &mut H) -> Result<(), ParseError> {
        match self.phase {
            Phase::UntilClose => {
                self.complete(handler);
                Ok(())
            }
            Phase::Head if self.buf.is_empty() => Ok(()),
            Phase::Upgraded => Ok(()),
            _ => Err(ParseError::UnexpectedEof),
        }
    }

    fn complete<H: ParserHandler>(&mut self, handler: &mut H) -> bool {
        self.phase = Phase::Head;
        self.buf.clear();
        handler.on_message_complete()
    }

    /// Accumulate head bytes. Returns the head and how many bytes of `data`
    /// it used once the blank line has been seen.
    fn parse_head(&mut self, data: &[u8]) -> Result<Option<(ResponseHead, usize)>, ParseError> {
        let carried = self.buf.len();
        self.buf.extend_from_slice(data);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let parsed = match response.parse(&self.buf).map_err(ParseError::Head)? {
            httparse::Status::Partial => None,
            httparse::Status::Complete(len) => {
                let head = ResponseHead {
                    version: response.version.unwrap_or(1),
                    status: response.code.unwrap_or(0),
                    reason: response.reason.unwrap_or_default().to_string(),
                    headers: response
                        .headers
                        .iter()
                        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                        .collect(),
                };
                Some((head, len.saturating_sub(carried)))
            }
        };

        match parsed {
            Some(done) => {
                self.buf.clear();
                Ok(Some(done))
            }
            None if self.buf.len() > MAX_HEAD_SIZE => Err(ParseError::HeadTooLarge),
            None => Ok(None),
        }
    }

    /// Accumulate one CRLF-terminated line. The returned line excludes the
    /// terminator.
    fn take_line(&mut self, data: &[u8]) -> Result<Option<(Bytes, usize)>, ParseError> {
        match data.iter().position(|&b| b == b'\n') {
            Some(end) => {
                self.buf.extend_from_slice(&data[..end]);
                let mut line = self.buf.split().freeze();
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Ok(Some((line, end + 1)))
            }
            None => {
                if self.buf.len() + data.len() > MAX_LINE {
                    return Err(ParseError::LineTooLong);
                }
                self.buf.extend_from_slice(data);
                Ok(None)
            }
        }
    }
}

/// Body framing implied by a head, or `None` when no body follows.
fn body_phase(head: &ResponseHead) -> Result<Option<Phase>, ParseError> {
    if head.is_bodyless() {
        return Ok(None);
    }
    if head.is_chunked() {
        return Ok(Some(Phase::Chunked(Chunk::Size)));
    }
    match head.header("content-length") {
        Some(value) => {
            let len: u64 = value.trim().parse().map_err(|_| ParseError::InvalidContentLength)?;
            Ok((len > 0).then_some(Phase::Length(len)))
        }
        None => Ok(Some(Phase::UntilClose)),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidChunkSize)?;
    let hex = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(hex, 16).map_err(|_| ParseError::InvalidChunkSize)
}

/// Allocation counters for a `ParserPool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub allocated: u64,
    pub released: u64,
    pub idle: usize,
}

#[derive(Debug)]
struct PoolInner {
    idle: Vec<ResponseParser>,
    capacity: usize,
    allocated: u64,
    released: u64,
}

/// Free list of parsers shared by every client that clones the pool.
#[derive(Debug, Clone)]
pub struct ParserPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl Default for ParserPool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }
}

impl ParserPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                idle: Vec::new(),
                capacity,
                allocated: 0,
                released: 0,
            })),
        }
    }

    pub fn allocate(&self) -> ResponseParser {
        let mut inner = self.lock();
        inner.allocated += 1;
        inner.idle.pop().unwrap_or_default()
    }

    pub fn free(&self, mut parser: ResponseParser) {
        parser.reinitialize(ParserMode::Response);
        let mut inner = self.lock();
        inner.released += 1;
        if inner.idle.len() < inner.capacity {
            inner.idle.push(parser);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            allocated: inner.allocated,
            released: inner.released,
            idle: inner.idle.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        heads: Vec<ResponseHead>,
        body: Vec<u8>,
        chunks: usize,
        completed: usize,
        skip_body: bool,
        stop_on_complete: bool,
    }

    impl ParserHandler for Recorder {
        fn on_head(&mut self, head: ResponseHead) -> bool {
            self.heads.push(head);
            self.skip_body
        }

        fn on_body(&mut self, chunk: Bytes) {
            self.body.extend_from_slice(&chunk);
            self.chunks += 1;
        }

        fn on_message_complete(&mut self) -> bool {
            self.completed += 1;
            !self.stop_on_complete
        }
    }

    #[test]
    fn content_length_response() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(p.execute(data, &mut r), Ok(data.len()));
        assert_eq!(r.heads[0].status, 200);
        assert_eq!(r.heads[0].reason, "OK");
        assert_eq!(r.body, b"hello");
        assert_eq!(r.completed, 1);
        assert!(!p.has_incoming());
    }

    #[test]
    fn head_and_body_split_across_calls() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let data: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nabcdef";
        for piece in data.chunks(7) {
            assert_eq!(p.execute(piece, &mut r), Ok(piece.len()));
        }
        assert_eq!(r.heads.len(), 1);
        assert_eq!(r.body, b"abcdef");
        assert_eq!(r.completed, 1);
    }

    #[test]
    fn chunked_response_with_trailer() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\n";
        assert_eq!(p.execute(data, &mut r), Ok(data.len()));
        assert_eq!(r.body, b"Wikipedia");
        assert_eq!(r.completed, 1);
    }

    #[test]
    fn chunked_byte_at_a_time() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let data = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        for b in data.iter() {
            p.execute(std::slice::from_ref(b), &mut r).unwrap();
        }
        assert_eq!(r.body, b"abc");
        assert_eq!(r.completed, 1);
    }

    #[test]
    fn bad_chunk_terminator() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcXX\r\n";
        assert_eq!(p.execute(data, &mut r), Err(ParseError::InvalidChunkTerminator));
    }

    #[test]
    fn skip_body_ignores_content_length() {
        let mut p = ResponseParser::new();
        let mut r = Recorder {
            skip_body: true,
            ..Default::default()
        };
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n";
        assert_eq!(p.execute(data, &mut r), Ok(data.len()));
        assert_eq!(r.completed, 1);
        assert!(r.body.is_empty());
        assert!(!p.has_incoming());
    }

    #[test]
    fn interim_response_then_final() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let data = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        assert_eq!(p.execute(data, &mut r), Ok(data.len()));
        let statuses: Vec<u16> = r.heads.iter().map(|h| h.status).collect();
        assert_eq!(statuses, vec![100, 204]);
        assert_eq!(r.completed, 2);
    }

    #[test]
    fn upgrade_stops_at_end_of_head() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n";
        let mut data = head.to_vec();
        data.extend_from_slice(b"\x00\x01raw");

        assert_eq!(p.execute(&data, &mut r), Ok(head.len()));
        assert!(p.is_upgrade());
        assert!(r.heads.is_empty());
        assert_eq!(p.take_upgrade_head().map(|h| h.status), Some(101));
        assert_eq!(p.execute(b"more", &mut r), Ok(0));
    }

    #[test]
    fn until_close_completes_on_finish() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        p.execute(b"HTTP/1.0 200 OK\r\n\r\npart one ", &mut r).unwrap();
        p.execute(b"part two", &mut r).unwrap();
        assert_eq!(r.completed, 0);
        assert!(p.has_incoming());
        p.finish(&mut r).unwrap();
        assert_eq!(r.body, b"part one part two");
        assert_eq!(r.completed, 1);
    }

    #[test]
    fn eof_mid_length_body_is_error() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        p.execute(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc", &mut r).unwrap();
        assert_eq!(p.finish(&mut r), Err(ParseError::UnexpectedEof));
    }

    #[test]
    fn stop_leaves_rest_unconsumed() {
        let mut p = ResponseParser::new();
        let mut r = Recorder {
            stop_on_complete: true,
            ..Default::default()
        };
        let first = b"HTTP/1.1 204 No Content\r\n\r\n";
        let mut data = first.to_vec();
        data.extend_from_slice(b"HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(p.execute(&data, &mut r), Ok(first.len()));
        assert_eq!(r.completed, 1);
    }

    #[test]
    fn malformed_status_line() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        assert!(matches!(p.execute(b"NOT HTTP\r\n\r\n", &mut r), Err(ParseError::Head(_))));
    }

    #[test]
    fn invalid_content_length() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: lots\r\n\r\n";
        assert_eq!(p.execute(data, &mut r), Err(ParseError::InvalidContentLength));
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        p.execute(b"HTTP/1.1 200 OK\r\n", &mut r).unwrap();
        let filler = format!("X-Filler: {}\r\n", "a".repeat(4096));
        let mut result = Ok(0);
        for _ in 0..20 {
            result = p.execute(filler.as_bytes(), &mut r);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(ParseError::HeadTooLarge));
    }

    #[test]
    fn overlong_trailer_line_is_rejected() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        p.execute(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n", &mut r)
            .unwrap();
        let trailer = format!("X-Trailer: {}", "t".repeat(MAX_LINE));
        assert_eq!(p.execute(trailer.as_bytes(), &mut r), Err(ParseError::LineTooLong));
        assert_eq!(r.completed, 0);
    }

    #[test]
    fn overlong_chunk_size_line_is_rejected() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        p.execute(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n", &mut r).unwrap();
        let size_line = format!("5;ext={}", "e".repeat(MAX_LINE));
        assert_eq!(p.execute(size_line.as_bytes(), &mut r), Err(ParseError::LineTooLong));
    }

    #[test]
    fn reinitialize_discards_partial_state() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        p.execute(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc", &mut r).unwrap();
        p.reinitialize(ParserMode::Response);
        assert_eq!(p.mode(), ParserMode::Response);
        assert!(!p.has_incoming());
        p.execute(b"HTTP/1.1 204 No Content\r\n\r\n", &mut r).unwrap();
        assert_eq!(r.completed, 1);
    }

    #[test]
    fn pool_recycles_and_counts() {
        let pool = ParserPool::with_capacity(1);
        let a = pool.allocate();
        let b = pool.allocate();
        pool.free(a);
        pool.free(b);
        assert_eq!(
            pool.stats(),
            PoolStats {
                allocated: 2,
                released: 2,
                idle: 1
            }
        );
        let _c = pool.allocate();
        assert_eq!(pool.stats().idle, 0);
    }
}
