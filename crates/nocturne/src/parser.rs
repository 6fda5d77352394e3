// src/parser.rs
//! Resumable HTTP/1.x request parser.
//!
//! The parser never owns bytes: the connection appends to its read buffer and
//! calls [`RequestParser::advance`] with the filled prefix. The parser keeps
//! its cursor between calls, so each byte is scanned once no matter how the
//! request is split across reads.
use crate::http::Method;
use memchr::memchr2;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseStage {
    #[default]
    RequestLine,
    Headers,
    Body,
}

/// Result of scanning for one CR LF terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line ends at `end` (exclusive, before CR); the next line starts
    /// at `next`.
    Complete { end: usize, next: usize },
    /// No terminator yet; resume scanning at `next`.
    Open { next: usize },
    /// A bare CR or LF.
    Bad,
}

/// Scan `buf[from..]` for a CR LF terminator.
pub fn scan_line(buf: &[u8], from: usize) -> LineStatus {
    let Some(offset) = memchr2(b'\r', b'\n', &buf[from..]) else {
        return LineStatus::Open { next: buf.len() };
    };
    let at = from + offset;
    if buf[at] == b'\n' {
        return LineStatus::Bad;
    }
    match buf.get(at + 1) {
        // CR is the last byte so far; rescan it once more bytes arrive.
        None => LineStatus::Open { next: at },
        Some(b'\n') => LineStatus::Complete { end: at, next: at + 2 },
        Some(_) => LineStatus::Bad,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed line terminator")]
    BadLine,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("method not supported: {0}")]
    UnsupportedMethod(String),
    #[error("malformed request target")]
    BadTarget,
    #[error("unsupported protocol version: {0}")]
    BadVersion(String),
    #[error("malformed header line")]
    BadHeader,
    #[error("invalid Content-Length: {0}")]
    BadContentLength(String),
    #[error("request exceeds the read buffer")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Need more bytes.
    Incomplete,
    /// Request line, headers and any declared body are all buffered.
    Complete,
}

#[derive(Debug, Default)]
pub struct RequestParser {
    stage: ParseStage,
    /// Bytes already scanned.
    checked: usize,
    /// Start of the line currently being scanned.
    line_start: usize,
    /// Offset just past the declared body, once headers ended.
    body_end: usize,
    complete: bool,
    /// Largest request the caller can buffer, if bounded.
    limit: Option<usize>,

    method: Option<Method>,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    content_length: usize,
    keep_alive: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// A parser that rejects any request whose head plus declared body
    /// cannot fit in `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = Some(limit);
    }

    /// Forget the previous request but keep allocations.
    pub fn reset(&mut self) {
        self.stage = ParseStage::RequestLine;
        self.checked = 0;
        self.line_start = 0;
        self.body_end = 0;
        self.complete = false;
        self.method = None;
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.content_length = 0;
        self.keep_alive = false;
    }

    pub fn advance(&mut self, buf: &[u8]) -> Result<ParseStatus, ParseError> {
        if self.complete {
            return Ok(ParseStatus::Complete);
        }

        loop {
            if self.stage == ParseStage::Body {
                if buf.len() >= self.body_end {
                    self.complete = true;
                    return Ok(ParseStatus::Complete);
                }
                return Ok(ParseStatus::Incomplete);
            }

            let (end, next) = match scan_line(buf, self.checked) {
                LineStatus::Complete { end, next } => (end, next),
                LineStatus::Open { next } => {
                    self.checked = next;
                    return Ok(ParseStatus::Incomplete);
                }
                LineStatus::Bad => return Err(ParseError::BadLine),
            };

            let line = &buf[self.line_start..end];
            self.checked = next;
            self.line_start = next;

            match self.stage {
                ParseStage::RequestLine => {
                    self.parse_request_line(line)?;
                    self.stage = ParseStage::Headers;
                }
                ParseStage::Headers if line.is_empty() => {
                    self.body_end = self.request_end(next, self.content_length)?;
                    if self.content_length == 0 {
                        self.complete = true;
                        return Ok(ParseStatus::Complete);
                    }
                    self.stage = ParseStage::Body;
                }
                ParseStage::Headers => self.parse_header(line)?,
                ParseStage::Body => unreachable!("body stage handled above"),
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
        let mut parts = line.split([' ', '\t']).filter(|s| !s.is_empty());

        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) => (m, t, v),
            _ => return Err(ParseError::BadRequestLine),
        };

        let parsed = Method::from_bytes(method.as_bytes());
        if parsed != Method::Get {
            return Err(ParseError::UnsupportedMethod(method.to_string()));
        }
        if !version.starts_with("HTTP/") {
            return Err(ParseError::BadVersion(version.to_string()));
        }

        self.method = Some(parsed);
        self.path.push_str(normalize_target(target)?);
        self.version.push_str(version);
        Ok(())
    }

    fn parse_header(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadHeader)?;
        let (name, value) = line.split_once(':').ok_or(ParseError::BadHeader)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::BadHeader);
        }
        let value = value.trim();
        let key = name.to_ascii_lowercase();

        match key.as_str() {
            "connection" => {
                self.keep_alive = value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"));
            }
            "content-length" => {
                let len = value
                    .parse()
                    .map_err(|_| ParseError::BadContentLength(value.to_string()))?;
                // Fail early: the body can start no sooner than here.
                self.request_end(self.checked, len)?;
                self.content_length = len;
            }
            _ => {}
        }

        self.headers.insert(key, value.to_string());
        Ok(())
    }

    /// End offset of a request whose body of `len` bytes starts at `start`.
    fn request_end(&self, start: usize, len: usize) -> Result<usize, ParseError> {
        let end = start.checked_add(len).ok_or(ParseError::TooLarge)?;
        if self.limit.is_some_and(|limit| end > limit) {
            return Err(ParseError::TooLarge);
        }
        Ok(end)
    }

    pub fn stage(&self) -> ParseStage {
        self.stage
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// Request path, without scheme/host prefix, query or fragment.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

/// Strip an absolute-form `http://host` prefix, query and fragment.
fn normalize_target(target: &str) -> Result<&str, ParseError> {
    let mut path = target;
    if path.get(..7).is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://")) {
        path = &path[7..];
        path = match path.find('/') {
            Some(idx) => &path[idx..],
            None => "/",
        };
    }
    if !path.starts_with('/') {
        return Err(ParseError::BadTarget);
    }
    if let Some(idx) = path.find(['?', '#']) {
        path = &path[..idx];
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(req: &[u8]) -> (RequestParser, Result<ParseStatus, ParseError>) {
        let mut p = RequestParser::new();
        let res = p.advance(req);
        (p, res)
    }

    #[test]
    fn test_scan_line() {
        assert_eq!(
            scan_line(b"GET / HTTP/1.1\r\nHost", 0),
            LineStatus::Complete { end: 14, next: 16 }
        );
        assert_eq!(scan_line(b"GET / HT", 0), LineStatus::Open { next: 8 });
        assert_eq!(scan_line(b"GET /\r", 0), LineStatus::Open { next: 5 });
        assert_eq!(scan_line(b"GET /\nx", 0), LineStatus::Bad);
        assert_eq!(scan_line(b"GET /\rx", 0), LineStatus::Bad);
    }

    #[test]
    fn test_parse_basic_request() {
        let req = b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n";
        let (p, res) = parse(req);

        assert_eq!(res, Ok(ParseStatus::Complete));
        assert_eq!(p.method(), Some(Method::Get));
        assert_eq!(p.path(), "/some/path");
        assert_eq!(p.version(), "HTTP/1.1");
        assert_eq!(p.header("host"), Some("localhost"));
        assert_eq!(p.header("HOST"), Some("localhost"));
        assert!(p.keep_alive());
    }

    #[test]
    fn test_parse_incomplete_request() {
        let (p, res) = parse(b"GET /some/path?foo=bar HTT");
        assert_eq!(res, Ok(ParseStatus::Incomplete));
        assert_eq!(p.stage(), ParseStage::RequestLine);
    }

    #[test]
    fn test_parse_byte_by_byte() {
        let req = b"GET /a.txt HTTP/1.0\r\nConnection: Keep-Alive\r\nX-Other: 1\r\n\r\n";
        let mut p = RequestParser::new();
        for n in 1..req.len() {
            assert_eq!(p.advance(&req[..n]), Ok(ParseStatus::Incomplete), "at {}", n);
        }
        assert_eq!(p.advance(req), Ok(ParseStatus::Complete));
        assert_eq!(p.path(), "/a.txt");
        assert!(p.keep_alive());
    }

    #[test]
    fn test_non_get_method_is_rejected() {
        let (_, res) = parse(b"POST /form HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc");
        assert_eq!(res, Err(ParseError::UnsupportedMethod("POST".into())));
        let (_, res) = parse(b"get / HTTP/1.1\r\n\r\n");
        assert_eq!(res, Err(ParseError::UnsupportedMethod("get".into())));
    }

    #[test]
    fn test_malformed_request_lines() {
        assert_eq!(parse(b"GET /\r\n\r\n").1, Err(ParseError::BadRequestLine));
        assert_eq!(
            parse(b"GET / HTTP/1.1 extra\r\n\r\n").1,
            Err(ParseError::BadRequestLine)
        );
        assert_eq!(
            parse(b"GET / FTP/1.0\r\n\r\n").1,
            Err(ParseError::BadVersion("FTP/1.0".into()))
        );
        assert_eq!(parse(b"GET index HTTP/1.1\r\n\r\n").1, Err(ParseError::BadTarget));
        assert_eq!(parse(b"GET / HTTP/1.1\n\n").1, Err(ParseError::BadLine));
    }

    #[test]
    fn test_absolute_form_target_is_stripped() {
        let (p, res) = parse(b"GET http://example.com/docs/a.html HTTP/1.1\r\n\r\n");
        assert_eq!(res, Ok(ParseStatus::Complete));
        assert_eq!(p.path(), "/docs/a.html");

        let (p, _) = parse(b"GET HTTP://example.com HTTP/1.1\r\n\r\n");
        assert_eq!(p.path(), "/");
    }

    #[test]
    fn test_header_rules() {
        let req = b"GET / HTTP/1.1\r\nX-Dup: one\r\nx-dup: two\r\nConnection: close\r\nEmpty:\r\n\r\n";
        let (p, res) = parse(req);
        assert_eq!(res, Ok(ParseStatus::Complete));
        assert_eq!(p.header("X-Dup"), Some("two"));
        assert_eq!(p.header("empty"), Some(""));
        assert!(!p.keep_alive());

        let (_, res) = parse(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n");
        assert_eq!(res, Err(ParseError::BadHeader));

        let (_, res) = parse(b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(res, Err(ParseError::BadContentLength("ten".into())));
    }

    #[test]
    fn test_body_stage_waits_for_declared_length() {
        let head = b"GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\n".to_vec();
        let mut p = RequestParser::new();
        assert_eq!(p.advance(&head), Ok(ParseStatus::Incomplete));
        assert_eq!(p.stage(), ParseStage::Body);

        let mut full = head.clone();
        full.extend_from_slice(b"abc");
        assert_eq!(p.advance(&full), Ok(ParseStatus::Incomplete));

        full.extend_from_slice(b"de");
        assert_eq!(p.advance(&full), Ok(ParseStatus::Complete));
        assert_eq!(p.content_length(), 5);
    }

    #[test]
    fn test_content_length_past_address_space_is_too_large() {
        let req = format!("GET / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", usize::MAX);
        let (p, res) = parse(req.as_bytes());
        assert_eq!(res, Err(ParseError::TooLarge));
        assert!(!p.is_complete());

        let req = format!("GET / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", usize::MAX - 20);
        assert_eq!(parse(req.as_bytes()).1, Err(ParseError::TooLarge));
    }

    #[test]
    fn test_body_beyond_limit_is_too_large() {
        let head = b"GET / HTTP/1.1\r\nContent-Length: 20\r\n\r\n";
        let mut p = RequestParser::with_limit(head.len() + 19);
        assert_eq!(p.advance(head), Err(ParseError::TooLarge));

        let mut p = RequestParser::with_limit(head.len() + 20);
        assert_eq!(p.advance(head), Ok(ParseStatus::Incomplete));

        // Headers after Content-Length still count against the limit.
        let req = b"GET / HTTP/1.1\r\nContent-Length: 4\r\nX-Pad: aaaaaaaa\r\n\r\n";
        let mut p = RequestParser::with_limit(req.len() + 3);
        assert_eq!(p.advance(req), Err(ParseError::TooLarge));
    }

    #[test]
    fn test_headers_without_terminator_stay_incomplete() {
        // Request line plus headers but no empty line: must wait, not fail.
        let (p, res) = parse(b"GET / HTTP/1.1\r\nHost: a\r\nAccept: */*\r\n");
        assert_eq!(res, Ok(ParseStatus::Incomplete));
        assert_eq!(p.stage(), ParseStage::Headers);
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut p = RequestParser::new();
        assert_eq!(
            p.advance(b"GET /one HTTP/1.1\r\nConnection: keep-alive\r\n\r\n"),
            Ok(ParseStatus::Complete)
        );
        p.reset();
        assert_eq!(p.header_count(), 0);
        assert_eq!(p.advance(b"GET /two HTTP/1.1\r\n\r\n"), Ok(ParseStatus::Complete));
        assert_eq!(p.path(), "/two");
        assert!(!p.keep_alive());
    }
}
