// src/syscalls.rs
//! Thin wrappers over the Linux socket and epoll calls the reactor and the
//! workers share. Every call is non-blocking; "would block" is reported as
//! `Ok(None)` so it can never be mistaken for end-of-stream.
use libc::{c_int, c_void, socklen_t};
use std::io::{self, IoSlice};
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking listening TCP socket with SO_REUSEADDR.
pub fn create_listen_socket(host: &str, port: u16, backlog: i32) -> io::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    // 1. Atomic non-blocking socket
    let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // 2. Address reuse must be set before bind
    set_reuseaddr(raw)?;

    // 3. Bind
    bind_addr(raw, &addr)?;

    // 4. Listen
    if unsafe { libc::listen(raw, backlog) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpListener::from(fd))
}

/// Bind a socket to an address.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    let res = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        }
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let one: c_int = 1;
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Make a write to a peer that already went away surface as EPIPE instead of
/// killing the process.
pub fn ignore_sigpipe() -> io::Result<()> {
    if unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) } == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// `Ok(Some(0))` is end-of-stream, `Ok(None)` means no data right now.
pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
    if res < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            io::ErrorKind::Interrupted => recv_nonblocking(fd, buf),
            _ => Err(err),
        };
    }
    Ok(Some(res as usize))
}

/// Look at (without consuming) whether more bytes are waiting.
pub fn peek_nonblocking(fd: RawFd) -> io::Result<Option<usize>> {
    let mut byte = [0u8; 1];
    let res = unsafe {
        libc::recv(
            fd,
            byte.as_mut_ptr() as *mut c_void,
            byte.len(),
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(res as usize))
}

/// Vectored write: all segments in a single `sendmsg`, never raising SIGPIPE.
pub fn send_vectored(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    // SAFETY: msghdr is plain data; the zeroed value is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    // IoSlice is guaranteed ABI compatible with iovec on unix.
    msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = bufs.len() as _;

    let res = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if res < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            io::ErrorKind::Interrupted => send_vectored(fd, bufs),
            _ => Err(err),
        };
    }
    Ok(Some(res as usize))
}

// ---- Epoll Operations ----

/// Which readiness a descriptor is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// Readiness flags of one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness(u32);

impl Readiness {
    pub fn is_readable(self) -> bool {
        self.0 & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    /// Peer reset, half-close or a socket error.
    pub fn is_hangup(self) -> bool {
        self.0 & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }
}

/// Fixed-size buffer of events filled by one [`Poller::wait`].
pub struct Events {
    buf: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, Readiness)> + '_ {
        self.buf[..self.len].iter().map(|ev| {
            // Copy out of the (possibly packed) struct before use.
            let token = ev.u64;
            let events = ev.events;
            (token, Readiness(events))
        })
    }
}

/// Owned epoll instance. Registration calls are safe from any thread; only
/// the reactor thread waits on it.
pub struct Poller {
    fd: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: freshly created descriptor.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    fn raw(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.fd.as_raw_fd()
    }

    fn ctl(&self, op: c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        if unsafe { libc::epoll_ctl(self.raw(), op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register a client socket: non-blocking, edge-triggered, and (when
    /// `one_shot`) silent after one delivery until re-armed.
    pub fn register(&self, fd: RawFd, token: u64, interest: Interest, one_shot: bool) -> io::Result<()> {
        set_nonblocking(fd)?;
        let mut events = interest.bits() | libc::EPOLLRDHUP as u32 | libc::EPOLLET as u32;
        if one_shot {
            events |= libc::EPOLLONESHOT as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    /// Register the listening socket, level-triggered so a backlog that
    /// could not be fully drained is reported again.
    pub fn register_listener(&self, fd: RawFd, token: u64) -> io::Result<()> {
        set_nonblocking(fd)?;
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32, token)
    }

    /// Re-arm a one-shot registration for exactly one more delivery.
    pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let events = interest.bits()
            | libc::EPOLLRDHUP as u32
            | libc::EPOLLET as u32
            | libc::EPOLLONESHOT as u32;
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        if unsafe { libc::epoll_ctl(self.raw(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Block until readiness or timeout. A signal interruption reports zero
    /// events; any other failure is returned.
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.raw(),
                events.buf.as_mut_ptr(),
                events.buf.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            events.len = 0;
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        events.len = res as usize;
        Ok(events.len)
    }
}
