// src/lib.rs
//! Static-file HTTP/1.1 server: one epoll reactor thread, a fixed pool of
//! worker threads, and one-shot readiness as the hand-off between them.
pub mod config;
pub mod conn;
pub mod error;
pub mod file;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod slab;
pub mod sync;
pub mod syscalls;

// Re-exports for users
pub use config::{ConfigError, ServerConfig};
pub use error::{NocturneError, NocturneResult};
pub use logging::{init_logging, try_init_logging};
pub use metrics::{ServerStats, StatsSnapshot};
pub use server::{Server, ShutdownHandle};
