use anyhow::Context;
use clap::Parser;
use nocturne::{Server, ServerConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "nocturne")]
#[command(about = "Static file server on an epoll reactor and a fixed worker pool")]
#[command(version)]
struct Cli {
    /// Port to listen on
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Directory to serve files from
    #[arg(long)]
    root: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Maximum simultaneous connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// TOML config file, applied before environment variables and flags
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_toml_file(path)?,
            None => ServerConfig::default(),
        };
        config.apply_env()?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(root) = self.root {
            config.doc_root = root;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    nocturne::init_logging();
    let config = Cli::parse().into_config()?;

    nocturne::syscalls::ignore_sigpipe().context("failed to ignore SIGPIPE")?;

    let server = Server::bind(config.clone())
        .with_context(|| format!("failed to listen on {}", config.server_addr()))?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("received interrupt, shutting down");
        shutdown.trigger();
    })
    .context("failed to install Ctrl-C handler")?;

    let stats = server.run()?;
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        requests = stats.requests,
        bad_requests = stats.bad_requests,
        bytes_sent = stats.bytes_sent,
        "final counters"
    );
    Ok(())
}
