// src/config.rs
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0}")]
    Invalid(&'static str),
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 8080)
    pub port: u16,

    /// Directory static files are served from (default: ./resources)
    pub doc_root: PathBuf,

    /// File served for `/` (default: index.html)
    pub index_file: String,

    /// Worker pool size (default: number of CPUs)
    pub workers: usize,

    /// Connection table capacity; connections past it are closed on accept.
    pub max_connections: usize,

    /// Readiness events handled per wait.
    pub max_events: usize,

    /// Per-connection request buffer. A request that does not fit gets 400.
    pub read_buffer_size: usize,

    /// Per-connection response head buffer.
    pub write_buffer_size: usize,

    /// Upper bound of one readiness wait, which bounds shutdown latency.
    pub poll_timeout_ms: u32,

    pub listen_backlog: u32,

    /// Pin worker threads to CPU cores.
    pub pin_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: PathBuf::from("./resources"),
            index_file: "index.html".to_string(),
            workers: num_cpus::get(),
            max_connections: 65536,
            max_events: 10000,
            read_buffer_size: 2048,
            write_buffer_size: 1024,
            poll_timeout_ms: 500,
            listen_backlog: 1024,
            pin_workers: false,
        }
    }
}

const ENV_PREFIX: &str = "NOCTURNE_";

impl ServerConfig {
    /// Smallest read buffer that still holds a minimal request line.
    pub const MIN_READ_BUFFER: usize = 64;
    /// Smallest write buffer that holds every generated error head.
    pub const MIN_WRITE_BUFFER: usize = 256;

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(doc: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(doc)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&doc).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults overridden by `.env` and `NOCTURNE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `.env` (if present) and the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`, which receives full variable names.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("HOST") {
            self.host = v;
        }
        if let Some(v) = var("PORT") {
            self.port = parse("NOCTURNE_PORT", v)?;
        }
        if let Some(v) = var("DOC_ROOT") {
            self.doc_root = PathBuf::from(v);
        }
        if let Some(v) = var("INDEX_FILE") {
            self.index_file = v;
        }
        if let Some(v) = var("WORKERS") {
            self.workers = parse("NOCTURNE_WORKERS", v)?;
        }
        if let Some(v) = var("MAX_CONNECTIONS") {
            self.max_connections = parse("NOCTURNE_MAX_CONNECTIONS", v)?;
        }
        if let Some(v) = var("MAX_EVENTS") {
            self.max_events = parse("NOCTURNE_MAX_EVENTS", v)?;
        }
        if let Some(v) = var("READ_BUFFER_SIZE") {
            self.read_buffer_size = parse("NOCTURNE_READ_BUFFER_SIZE", v)?;
        }
        if let Some(v) = var("WRITE_BUFFER_SIZE") {
            self.write_buffer_size = parse("NOCTURNE_WRITE_BUFFER_SIZE", v)?;
        }
        if let Some(v) = var("POLL_TIMEOUT_MS") {
            self.poll_timeout_ms = parse("NOCTURNE_POLL_TIMEOUT_MS", v)?;
        }
        if let Some(v) = var("LISTEN_BACKLOG") {
            self.listen_backlog = parse("NOCTURNE_LISTEN_BACKLOG", v)?;
        }
        if let Some(v) = var("PIN_WORKERS") {
            self.pin_workers = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.max_connections > u32::MAX as usize {
            return Err(ConfigError::Invalid("max_connections does not fit a connection id"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::Invalid("max_events must be at least 1"));
        }
        if self.read_buffer_size < Self::MIN_READ_BUFFER {
            return Err(ConfigError::Invalid("read_buffer_size must be at least 64 bytes"));
        }
        if self.write_buffer_size < Self::MIN_WRITE_BUFFER {
            return Err(ConfigError::Invalid("write_buffer_size must be at least 256 bytes"));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}
