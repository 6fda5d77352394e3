// src/server.rs
use crate::config::ServerConfig;
use crate::error::NocturneResult;
use crate::metrics::{ServerStats, StatsSnapshot};
use crate::reactor::Reactor;
use crate::syscalls;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Asks a running server to stop. The reactor notices within one poll
/// timeout.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    stats: Arc<ServerStats>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Validate `config` and open the listening socket.
    pub fn bind(config: ServerConfig) -> NocturneResult<Self> {
        config.validate()?;
        let backlog = i32::try_from(config.listen_backlog).unwrap_or(i32::MAX);
        let listener = syscalls::create_listen_socket(&config.host, config.port, backlog)?;
        Self::from_listener(listener, config)
    }

    /// Serve on an already bound and listening socket.
    pub fn from_listener(listener: TcpListener, config: ServerConfig) -> NocturneResult<Self> {
        config.validate()?;
        if !config.doc_root.is_dir() {
            warn!(root = %config.doc_root.display(), "document root is not a directory");
        }
        Ok(Self {
            config,
            listener,
            stats: Arc::new(ServerStats::new()),
            shutdown: ShutdownHandle::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Block serving requests until shutdown. Returns the final counters.
    pub fn run(self) -> NocturneResult<StatsSnapshot> {
        let addr = self.local_addr()?;
        info!(
            %addr,
            workers = self.config.workers,
            max_connections = self.config.max_connections,
            root = %self.config.doc_root.display(),
            "nocturne listening"
        );

        let mut reactor = Reactor::new(
            self.listener,
            &self.config,
            Arc::clone(&self.stats),
            self.shutdown.clone(),
        )?;
        reactor.run()?;

        let snapshot = self.stats.snapshot();
        info!(
            accepted = snapshot.accepted,
            requests = snapshot.requests,
            bytes_sent = snapshot.bytes_sent,
            "server stopped"
        );
        Ok(snapshot)
    }
}
