// src/reactor.rs
//! The single event-loop thread and the pool-side connection processor.
//!
//! Ownership moves in a fixed cycle:
//! reactor (read) -> queue -> worker (parse, build) -> parked for write ->
//! reactor (send) -> parked for read or closed. Every hand-off parks or
//! queues the slot before the next party can observe it.
use crate::config::ServerConfig;
use crate::conn::{ConnError, Processed, ReadStatus, WriteStatus};
use crate::error::{NocturneError, NocturneResult};
use crate::file::StaticRoot;
use crate::http::StatusCode;
use crate::metrics::ServerStats;
use crate::pool::{PoolError, PoolOptions, Process, WorkerPool};
use crate::server::ShutdownHandle;
use crate::slab::{ArmFailed, ConnId, ConnTable, LISTENER_TOKEN, Owned, Owner};
use crate::syscalls::{self, Events, Interest, Poller, Readiness};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Runs the request step of a connection on a pool thread.
pub struct ConnProcessor {
    table: Arc<ConnTable>,
    poller: Arc<Poller>,
    root: StaticRoot,
    stats: Arc<ServerStats>,
}

impl ConnProcessor {
    pub fn new(table: Arc<ConnTable>, poller: Arc<Poller>, root: StaticRoot, stats: Arc<ServerStats>) -> Self {
        Self {
            table,
            poller,
            root,
            stats,
        }
    }

    /// Park for `interest`. If the kernel refuses the re-arm nothing will
    /// ever wake this connection again, so the worker closes it here.
    fn hand_back(&self, conn: Owned<'_>, interest: Interest) {
        if let Err(ArmFailed { conn, error }) = conn.arm(&self.poller, interest) {
            debug!(id = %conn.id(), %error, "re-arm failed, closing");
            // The one close done off the reactor thread; see "Worker-side failures" in DESIGN.md.
            conn.close(&self.poller);
            self.stats.inc_closed();
        }
    }
}

impl Process for ConnProcessor {
    type Task = ConnId;

    fn process(&self, id: ConnId) {
        let Some(mut conn) = self.table.claim(id, Owner::Queued, Owner::Worker) else {
            warn!(%id, "queued connection is not claimable");
            return;
        };

        let interest = match conn.process(&self.root) {
            Processed::NeedMore => Interest::Read,
            Processed::Respond(status) => {
                self.stats.inc_req();
                if status == StatusCode::BadRequest {
                    self.stats.inc_bad_req();
                }
                trace!(%id, %status, path = conn.parser().path(), "response ready");
                Interest::Write
            }
            Processed::Abort => {
                conn.abort();
                Interest::Write
            }
        };
        debug_assert_eq!(self.table.owner_of(id), Some(Owner::Worker));
        // Must stay the last thing done with `conn`: after it another thread
        // may own the slot.
        self.hand_back(conn, interest);
    }

    fn abort(&self, id: ConnId) {
        // The panicking task never handed the slot on, so it is still ours.
        if let Some(mut conn) = self.table.claim(id, Owner::Worker, Owner::Worker) {
            conn.abort();
            self.hand_back(conn, Interest::Write);
        }
    }
}

pub struct Reactor {
    listener: TcpListener,
    poller: Arc<Poller>,
    table: Arc<ConnTable>,
    pool: WorkerPool<ConnProcessor>,
    stats: Arc<ServerStats>,
    events: Events,
    poll_timeout_ms: i32,
    shutdown: ShutdownHandle,
}

impl Reactor {
    pub fn new(
        listener: TcpListener,
        config: &ServerConfig,
        stats: Arc<ServerStats>,
        shutdown: ShutdownHandle,
    ) -> NocturneResult<Self> {
        listener.set_nonblocking(true)?;
        let poller = Arc::new(Poller::new()?);
        poller.register_listener(listener.as_raw_fd(), LISTENER_TOKEN)?;

        let table = Arc::new(ConnTable::new(
            config.max_connections,
            config.read_buffer_size,
            config.write_buffer_size,
        ));
        let processor = Arc::new(ConnProcessor::new(
            Arc::clone(&table),
            Arc::clone(&poller),
            StaticRoot::new(&config.doc_root, config.index_file.as_str()),
            Arc::clone(&stats),
        ));
        let pool = WorkerPool::start(
            processor,
            PoolOptions {
                threads: config.workers,
                pin_threads: config.pin_workers,
            },
        )
        .map_err(|e| match e {
            PoolError::Spawn(e) => NocturneError::Spawn(e),
            PoolError::Rejected(_) => NocturneError::PoolShutdown,
        })?;

        Ok(Self {
            listener,
            poller,
            table,
            pool,
            stats,
            events: Events::with_capacity(config.max_events),
            poll_timeout_ms: i32::try_from(config.poll_timeout_ms).unwrap_or(i32::MAX),
            shutdown,
        })
    }

    pub fn table(&self) -> &ConnTable {
        &self.table
    }

    /// Serve until the shutdown handle fires or the wait fails, then tear
    /// everything down.
    pub fn run(&mut self) -> NocturneResult<()> {
        let result = self.event_loop();
        self.teardown();
        result
    }

    fn event_loop(&mut self) -> NocturneResult<()> {
        while !self.shutdown.is_triggered() {
            let n = self
                .poller
                .wait(&mut self.events, self.poll_timeout_ms)
                .map_err(NocturneError::Poll)?;
            if n == 0 {
                continue;
            }
            for (token, ready) in self.events.iter() {
                self.dispatch(token, ready);
            }
        }
        info!("shutdown requested, leaving event loop");
        Ok(())
    }

    fn dispatch(&self, token: u64, ready: Readiness) {
        if token == LISTENER_TOKEN {
            self.accept_all();
            return;
        }
        let Some(id) = ConnId::from_token(token) else {
            return;
        };
        let Some(conn) = self.table.claim(id, Owner::Parked, Owner::Reactor) else {
            debug!(%id, "event for a connection that is not parked");
            return;
        };

        if ready.is_hangup() {
            trace!(%id, "peer hung up");
            self.close(conn);
        } else if ready.is_readable() {
            self.on_readable(conn);
        } else if ready.is_writable() {
            self.on_writable(conn);
        } else {
            let interest = if conn.response_len() > 0 {
                Interest::Write
            } else {
                Interest::Read
            };
            self.rearm(conn, interest);
        }
    }

    fn accept_all(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if self.table.is_full() {
            self.stats.inc_rejected();
            debug!(%peer, live = self.table.live(), "connection table full, rejecting");
            return;
        }
        let fd = stream.into_raw_fd();
        let Some(conn) = self.table.insert(fd, Some(peer)) else {
            syscalls::close_fd(fd);
            self.stats.inc_rejected();
            return;
        };
        self.stats.inc_accepted();
        trace!(id = %conn.id(), %peer, "accepted");

        if let Err(ArmFailed { conn, error }) = conn.register(&self.poller, Interest::Read) {
            warn!(%peer, %error, "failed to register connection");
            self.close(conn);
        }
    }

    fn on_readable(&self, mut conn: Owned<'_>) {
        match conn.drain_read() {
            Ok(ReadStatus::Drained) | Ok(ReadStatus::Overflow) => {
                let id = conn.enqueue();
                if let Err(PoolError::Rejected(id)) = self.pool.submit(id) {
                    // Left queued; the teardown sweep closes it.
                    debug!(%id, "pool is shutting down, task dropped");
                }
            }
            Err(ConnError::PeerClosed) => self.close(conn),
            Err(e) => {
                debug!(id = %conn.id(), error = %e, "read failed");
                self.close(conn);
            }
        }
    }

    fn on_writable(&self, mut conn: Owned<'_>) {
        if conn.is_aborted() {
            self.close(conn);
            return;
        }

        let total = conn.response_len();
        let before = conn.bytes_sent();
        match conn.drain_write() {
            Ok(WriteStatus::Pending) => {
                self.stats.add_bytes(conn.bytes_sent() - before);
                self.rearm(conn, Interest::Write);
            }
            Ok(WriteStatus::KeepAlive) => {
                self.stats.add_bytes(total - before);
                self.rearm(conn, Interest::Read);
            }
            Ok(WriteStatus::Done) => {
                self.stats.add_bytes(total - before);
                self.close(conn);
            }
            Err(e) => {
                debug!(id = %conn.id(), error = %e, "write failed");
                self.close(conn);
            }
        }
    }

    fn rearm(&self, conn: Owned<'_>, interest: Interest) {
        if let Err(ArmFailed { conn, error }) = conn.arm(&self.poller, interest) {
            debug!(id = %conn.id(), %error, "re-arm failed, closing");
            self.close(conn);
        }
    }

    fn close(&self, conn: Owned<'_>) {
        conn.close(&self.poller);
        self.stats.inc_closed();
    }

    /// Stop the pool, then close whatever is still open.
    fn teardown(&mut self) {
        debug!(pending = self.pool.pending(), "draining worker pool");
        self.pool.shutdown();
        let closed = self.table.close_all(&self.poller);
        self.stats.add_closed(closed);
        if let Err(e) = self.poller.deregister(self.listener.as_raw_fd()) {
            error!(error = %e, "failed to deregister listener");
        }
        info!(closed, "connections closed at shutdown");
    }
}
