// src/conn.rs
//! Per-connection state: read buffer, resumable parser, response segments.
//!
//! A `Conn` is never locked. Exactly one thread touches it at a time, which
//! the connection table enforces through its ownership tags and the one-shot
//! readiness registration (see `slab.rs`).
use crate::file::{MappedFile, StaticRoot};
use crate::http::{self, ERROR_CONTENT_TYPE, StatusCode};
use crate::parser::{ParseError, ParseStatus, RequestParser};
use crate::syscalls::{self, Poller};
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use thiserror::Error;
use tracing::{debug, warn};

pub const INVALID_FD: RawFd = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    /// Open, waiting for the first byte of a request.
    Idle,
    /// Accumulating request bytes.
    Reading,
    /// Response built, nothing sent yet.
    ReadyToRespond,
    /// Response partially sent.
    Writing,
    /// Descriptor released. Absorbing.
    #[default]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("connection is closed")]
    Closed,
    #[error("connection aborted after a processing failure")]
    Aborted,
}

/// What a successful `drain_read` left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Everything available was read (possibly nothing).
    Drained,
    /// The buffer was already full and the peer kept sending.
    Overflow,
}

/// Outcome of [`Conn::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Request incomplete; re-arm for read.
    NeedMore,
    /// Response ready; re-arm for write.
    Respond(StatusCode),
    /// Nothing sensible can be sent; the connection must be closed.
    Abort,
}

/// Outcome of a successful [`Conn::drain_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Socket buffer full; re-arm for write.
    Pending,
    /// Response sent on a persistent connection; re-arm for read.
    KeepAlive,
    /// Response sent; close the connection.
    Done,
}

/// Second write segment, after the generated head.
#[derive(Debug, Default)]
enum Body {
    #[default]
    None,
    Static(&'static [u8]),
    File(MappedFile),
}

impl Body {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Body::None => &[],
            Body::Static(bytes) => *bytes,
            Body::File(map) => map.as_slice(),
        }
    }
}

pub struct Conn {
    fd: RawFd,
    token: u64,
    peer: Option<SocketAddr>,
    state: ConnState,

    read_buf: Box<[u8]>,
    read_idx: usize,
    overflowed: bool,
    parser: RequestParser,

    write_buf: Box<[u8]>,
    head_len: usize,
    body: Body,
    bytes_to_send: usize,
    bytes_sent: usize,
    keep_alive: bool,
    status: Option<StatusCode>,
    aborted: bool,
    requests_served: u32,
}

impl Conn {
    /// A fresh unused connection slot. Buffers are allocated on first use.
    pub fn empty() -> Self {
        Self {
            fd: INVALID_FD,
            token: 0,
            peer: None,
            state: ConnState::Closed,
            read_buf: Box::default(),
            read_idx: 0,
            overflowed: false,
            parser: RequestParser::new(),
            write_buf: Box::default(),
            head_len: 0,
            body: Body::None,
            bytes_to_send: 0,
            bytes_sent: 0,
            keep_alive: false,
            status: None,
            aborted: false,
            requests_served: 0,
        }
    }

    /// Take over a freshly accepted descriptor. Registration with the poller
    /// is done by the owner right after, see `Owned::register`.
    pub fn init(
        &mut self,
        fd: RawFd,
        peer: Option<SocketAddr>,
        token: u64,
        read_capacity: usize,
        write_capacity: usize,
    ) {
        if self.read_buf.len() != read_capacity {
            self.read_buf = vec![0; read_capacity].into_boxed_slice();
        }
        if self.write_buf.len() != write_capacity {
            self.write_buf = vec![0; write_capacity].into_boxed_slice();
        }
        if let Err(e) = syscalls::set_reuseaddr(fd) {
            debug!(fd, error = %e, "SO_REUSEADDR not applied");
        }
        self.parser.set_limit(read_capacity);
        self.fd = fd;
        self.token = token;
        self.peer = peer;
        self.requests_served = 0;
        self.aborted = false;
        self.reset();
    }

    /// Back to `Idle` for the next request on the same descriptor.
    pub fn reset(&mut self) {
        self.state = ConnState::Idle;
        self.read_idx = 0;
        self.overflowed = false;
        self.parser.reset();
        self.head_len = 0;
        self.body = Body::None;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.keep_alive = false;
        self.status = None;
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.fd == INVALID_FD
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Status of the response being built or sent.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    /// Total bytes (head + body) of the response being sent.
    pub fn response_len(&self) -> usize {
        self.bytes_to_send
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Mark the connection for closing at its next readiness event.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.body = Body::None;
    }

    /// Receive everything the socket has right now.
    pub fn drain_read(&mut self) -> Result<ReadStatus, ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }

        if self.read_idx >= self.read_buf.len() {
            // Full without a complete request: decide between more data and a
            // closed peer without consuming anything.
            return match syscalls::peek_nonblocking(self.fd)? {
                Some(0) => Err(ConnError::PeerClosed),
                Some(_) => {
                    self.overflowed = true;
                    Ok(ReadStatus::Overflow)
                }
                None => Ok(ReadStatus::Drained),
            };
        }

        loop {
            match syscalls::recv_nonblocking(self.fd, &mut self.read_buf[self.read_idx..])? {
                Some(0) => return Err(ConnError::PeerClosed),
                Some(n) => {
                    self.read_idx += n;
                    self.state = ConnState::Reading;
                    if self.read_idx == self.read_buf.len() {
                        return Ok(ReadStatus::Drained);
                    }
                }
                None => return Ok(ReadStatus::Drained),
            }
        }
    }

    /// Parse what has been received and, once a request is complete, build
    /// its response. Runs on a worker thread.
    pub fn process(&mut self, root: &StaticRoot) -> Processed {
        if self.is_closed() || self.aborted {
            return Processed::Abort;
        }

        let parsed = if self.overflowed {
            Err(ParseError::TooLarge)
        } else {
            self.parser.advance(&self.read_buf[..self.read_idx])
        };

        let (status, body, content_type, keep_alive) = match parsed {
            Ok(ParseStatus::Incomplete) => return Processed::NeedMore,
            Ok(ParseStatus::Complete) => {
                let keep_alive = self.parser.keep_alive();
                match root.resolve(self.parser.path()) {
                    Ok(resource) => {
                        let body = resource.map.map_or(Body::None, Body::File);
                        (StatusCode::Ok, body, resource.content_type, keep_alive)
                    }
                    Err(status) => (status, Body::Static(status.error_body()), ERROR_CONTENT_TYPE, keep_alive),
                }
            }
            // Unparsed bytes may follow; the connection cannot be reused.
            Err(e) => {
                debug!(fd = self.fd, error = %e, "bad request");
                let status = StatusCode::BadRequest;
                (status, Body::Static(status.error_body()), ERROR_CONTENT_TYPE, false)
            }
        };

        match self.prepare_response(status, body, content_type, keep_alive) {
            Ok(()) => Processed::Respond(status),
            Err(http::HeadOverflow) => {
                warn!(fd = self.fd, "response head exceeds write buffer");
                let fallback = StatusCode::InternalError;
                let body = Body::Static(fallback.error_body());
                match self.prepare_response(fallback, body, ERROR_CONTENT_TYPE, false) {
                    Ok(()) => Processed::Respond(fallback),
                    Err(http::HeadOverflow) => {
                        self.abort();
                        Processed::Abort
                    }
                }
            }
        }
    }

    fn prepare_response(
        &mut self,
        status: StatusCode,
        body: Body,
        content_type: &str,
        keep_alive: bool,
    ) -> Result<(), http::HeadOverflow> {
        let body_len = body.as_bytes().len();
        self.body = Body::None;
        let head_len = http::write_head(&mut self.write_buf, status, content_type, body_len, keep_alive)?;

        self.head_len = head_len;
        self.body = body;
        self.bytes_to_send = head_len + body_len;
        self.bytes_sent = 0;
        self.keep_alive = keep_alive;
        self.status = Some(status);
        self.state = ConnState::ReadyToRespond;
        self.requests_served += 1;
        Ok(())
    }

    /// Unsent remainder of the response as at most two segments.
    fn pending_slices(&self) -> ([IoSlice<'_>; 2], usize) {
        let head = &self.write_buf[..self.head_len];
        let body = self.body.as_bytes();
        if self.bytes_sent < head.len() {
            ([IoSlice::new(&head[self.bytes_sent..]), IoSlice::new(body)], 2)
        } else {
            let offset = self.bytes_sent - head.len();
            ([IoSlice::new(&body[offset..]), IoSlice::new(&[])], 1)
        }
    }

    /// Send as much of the response as the socket takes. Runs on the reactor.
    pub fn drain_write(&mut self) -> Result<WriteStatus, ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        if self.aborted {
            return Err(ConnError::Aborted);
        }

        while self.bytes_sent < self.bytes_to_send {
            let (slices, count) = self.pending_slices();
            match syscalls::send_vectored(self.fd, &slices[..count]) {
                Ok(Some(n)) => {
                    self.bytes_sent += n;
                    self.state = ConnState::Writing;
                }
                Ok(None) => return Ok(WriteStatus::Pending),
                Err(e) => {
                    self.body = Body::None;
                    return Err(ConnError::Io(e));
                }
            }
        }

        self.body = Body::None;
        if self.keep_alive {
            self.reset();
            Ok(WriteStatus::KeepAlive)
        } else {
            Ok(WriteStatus::Done)
        }
    }

    /// Deregister and close the descriptor. Returns `false` when the
    /// connection was already closed.
    pub fn close(&mut self, poller: &Poller) -> bool {
        if self.is_closed() {
            return false;
        }
        if let Err(e) = poller.deregister(self.fd) {
            debug!(fd = self.fd, error = %e, "deregister failed");
        }
        syscalls::close_fd(self.fd);
        self.fd = INVALID_FD;
        self.peer = None;
        self.body = Body::None;
        self.state = ConnState::Closed;
        true
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("fd", &self.fd)
            .field("state", &self.state)
            .field("read_idx", &self.read_idx)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_to_send", &self.bytes_to_send)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Read, Write};
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    struct Harness {
        conn: Conn,
        peer: UnixStream,
        poller: Poller,
        dir: tempfile::TempDir,
        root: StaticRoot,
    }

    impl Harness {
        fn new(read_capacity: usize) -> Self {
            Self::with_capacities(read_capacity, 1024)
        }

        fn with_capacities(read_capacity: usize, write_capacity: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("index.html"), b"<p>index</p>").unwrap();
            let big: Vec<u8> = (0..1_500_000u32).map(|i| (i % 251) as u8).collect();
            fs::write(dir.path().join("big.bin"), &big).unwrap();

            let (server, peer) = UnixStream::pair().unwrap();
            server.set_nonblocking(true).unwrap();
            let mut conn = Conn::empty();
            conn.init(server.into_raw_fd(), None, 1, read_capacity, write_capacity);
            Self {
                conn,
                peer,
                poller: Poller::new().unwrap(),
                root: StaticRoot::new(dir.path(), "index.html"),
                dir,
            }
        }

        fn send(&mut self, bytes: &[u8]) {
            self.peer.write_all(bytes).unwrap();
        }

        /// Read exactly `n` bytes the connection wrote.
        fn receive(&mut self, n: usize) -> Vec<u8> {
            let mut out = vec![0; n];
            self.peer.read_exact(&mut out).unwrap();
            out
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.conn.close(&self.poller);
        }
    }

    #[test]
    fn test_full_cycle_keep_alive() {
        let mut h = Harness::new(2048);
        h.send(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");

        assert_eq!(h.conn.drain_read().unwrap(), ReadStatus::Drained);
        assert_eq!(h.conn.process(&h.root), Processed::Respond(StatusCode::Ok));
        assert_eq!(h.conn.state(), ConnState::ReadyToRespond);

        let total = h.conn.response_len();
        assert_eq!(h.conn.drain_write().unwrap(), WriteStatus::KeepAlive);
        assert_eq!(h.conn.state(), ConnState::Idle);

        let bytes = h.receive(total);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n<p>index</p>"));
    }

    #[test]
    fn test_partial_request_needs_more() {
        let mut h = Harness::new(2048);
        h.send(b"GET /index.html HTT");
        h.conn.drain_read().unwrap();
        assert_eq!(h.conn.process(&h.root), Processed::NeedMore);
        assert_eq!(h.conn.state(), ConnState::Reading);

        h.send(b"P/1.1\r\n\r\n");
        h.conn.drain_read().unwrap();
        assert_eq!(h.conn.process(&h.root), Processed::Respond(StatusCode::Ok));
    }

    #[test]
    fn test_non_get_is_bad_request() {
        let mut h = Harness::new(2048);
        h.send(b"DELETE /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        h.conn.drain_read().unwrap();
        assert_eq!(h.conn.process(&h.root), Processed::Respond(StatusCode::BadRequest));
        assert_eq!(h.conn.status(), Some(StatusCode::BadRequest));
    }

    #[test]
    fn test_huge_content_length_is_bad_request() {
        let mut h = Harness::new(2048);
        let req = format!(
            "GET / HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n",
            usize::MAX
        );
        h.send(req.as_bytes());
        h.conn.drain_read().unwrap();
        assert_eq!(h.conn.process(&h.root), Processed::Respond(StatusCode::BadRequest));
        assert!(!h.conn.keep_alive());

        let total = h.conn.response_len();
        assert_eq!(h.conn.drain_write().unwrap(), WriteStatus::Done);
        let text = String::from_utf8(h.receive(total)).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_body_larger_than_read_buffer_is_bad_request() {
        let mut h = Harness::new(256);
        h.send(b"GET / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n");
        h.conn.drain_read().unwrap();
        assert_eq!(h.conn.process(&h.root), Processed::Respond(StatusCode::BadRequest));
    }

    /// Head lengths for a 200 on `bundle.js` (1 MB, keep-alive) and for the
    /// 500 fallback, as written by `write_head`.
    fn head_lengths() -> (usize, usize) {
        let mut scratch = [0u8; 512];
        let ok = http::write_head(
            &mut scratch,
            StatusCode::Ok,
            "text/javascript; charset=utf-8",
            1_000_000,
            true,
        )
        .unwrap();
        let fallback = StatusCode::InternalError;
        let internal = http::write_head(
            &mut scratch,
            fallback,
            ERROR_CONTENT_TYPE,
            fallback.error_body().len(),
            false,
        )
        .unwrap();
        (ok, internal)
    }

    fn bundle_request(h: &mut Harness) {
        fs::write(h.dir.path().join("bundle.js"), vec![b';'; 1_000_000]).unwrap();
        h.send(b"GET /bundle.js HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        h.conn.drain_read().unwrap();
    }

    #[test]
    fn test_head_overflow_falls_back_to_internal_error() {
        let (ok, internal) = head_lengths();
        assert!(internal < ok);

        let mut h = Harness::with_capacities(2048, internal);
        bundle_request(&mut h);
        assert_eq!(h.conn.process(&h.root), Processed::Respond(StatusCode::InternalError));
        assert!(!h.conn.keep_alive());

        let total = h.conn.response_len();
        assert_eq!(h.conn.drain_write().unwrap(), WriteStatus::Done);
        let text = String::from_utf8(h.receive(total)).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Error\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("There was an unusual problem serving the requested file.\n"));
    }

    #[test]
    fn test_no_room_for_any_head_aborts() {
        let (_, internal) = head_lengths();
        let mut h = Harness::with_capacities(2048, internal - 1);
        bundle_request(&mut h);
        assert_eq!(h.conn.process(&h.root), Processed::Abort);
        assert!(h.conn.is_aborted());
        assert_eq!(h.conn.requests_served(), 0);
        assert!(matches!(h.conn.drain_write(), Err(ConnError::Aborted)));
    }

    #[test]
    fn test_peer_close_is_failure() {
        let mut h = Harness::new(2048);
        h.peer.shutdown(std::net::Shutdown::Write).unwrap();
        assert!(matches!(h.conn.drain_read(), Err(ConnError::PeerClosed)));
    }

    #[test]
    fn test_exactly_full_buffer_suspends_then_overflows() {
        let head = b"GET / HTTP/1.1\r\nX-Pad: ";
        let capacity = 64;
        let mut req = head.to_vec();
        req.resize(capacity - 2, b'a');
        req.extend_from_slice(b"\r\n");
        assert_eq!(req.len(), capacity);

        let mut h = Harness::new(capacity);
        h.send(&req);
        assert_eq!(h.conn.drain_read().unwrap(), ReadStatus::Drained);
        assert_eq!(h.conn.process(&h.root), Processed::NeedMore);

        // No more bytes yet: still suspended.
        assert_eq!(h.conn.drain_read().unwrap(), ReadStatus::Drained);

        h.send(b"Y");
        assert_eq!(h.conn.drain_read().unwrap(), ReadStatus::Overflow);
        assert_eq!(h.conn.process(&h.root), Processed::Respond(StatusCode::BadRequest));
        assert!(!h.conn.keep_alive());
    }

    #[test]
    fn test_exactly_full_buffer_then_peer_close() {
        let mut req = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        req.resize(62, b'b');
        req.extend_from_slice(b"\r\n");

        let mut h = Harness::new(64);
        h.send(&req);
        h.conn.drain_read().unwrap();
        assert_eq!(h.conn.process(&h.root), Processed::NeedMore);

        h.peer.shutdown(std::net::Shutdown::Write).unwrap();
        assert!(matches!(h.conn.drain_read(), Err(ConnError::PeerClosed)));
    }

    #[test]
    fn test_partial_writes_deliver_identical_bytes() {
        let mut h = Harness::new(2048);
        h.send(b"GET /big.bin HTTP/1.1\r\n\r\n");
        h.conn.drain_read().unwrap();
        assert_eq!(h.conn.process(&h.root), Processed::Respond(StatusCode::Ok));

        let total = h.conn.response_len();
        let mut received = Vec::with_capacity(total);
        let mut pending_rounds = 0;
        loop {
            match h.conn.drain_write().unwrap() {
                WriteStatus::Pending => {
                    pending_rounds += 1;
                    // Drain a small slice to force another short write.
                    let mut chunk = [0u8; 4096];
                    let n = h.peer.read(&mut chunk).unwrap();
                    received.extend_from_slice(&chunk[..n]);
                }
                WriteStatus::Done => break,
                WriteStatus::KeepAlive => panic!("request did not ask for keep-alive"),
            }
        }
        let rest = total - received.len();
        received.extend(h.receive(rest));

        assert!(pending_rounds > 0, "socket buffer never filled");
        let split = received.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let expected: Vec<u8> = (0..1_500_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(&received[split..], &expected[..]);
        assert!(std::str::from_utf8(&received[..split]).unwrap().contains("Content-Length: 1500000\r\n"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut h = Harness::new(2048);
        assert!(h.conn.close(&h.poller));
        assert!(!h.conn.close(&h.poller));
        assert_eq!(h.conn.state(), ConnState::Closed);
        assert!(matches!(h.conn.drain_read(), Err(ConnError::Closed)));
        assert!(matches!(h.conn.drain_write(), Err(ConnError::Closed)));
        assert_eq!(h.conn.process(&h.root), Processed::Abort);
    }

    #[test]
    fn test_aborted_connection_refuses_to_write() {
        let mut h = Harness::new(2048);
        h.send(b"GET / HTTP/1.1\r\n\r\n");
        h.conn.drain_read().unwrap();
        h.conn.process(&h.root);
        h.conn.abort();
        assert!(matches!(h.conn.drain_write(), Err(ConnError::Aborted)));
    }
}
