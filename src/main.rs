//! pure-dns - A DNS forwarder that races all configured upstreams and answers with the first reply.

// Use jemalloc as the global allocator (Linux/macOS only, better performance)
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod config;
mod race;
mod reply;
mod server;
mod upstream;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::race::Resolver;
use crate::server::DnsServer;

/// pure-dns - A DNS forwarder that races all configured upstreams and answers with the first reply.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (default: /etc/pure-dns/config.toml, then ./config.toml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = Config::locate(args.config)?;

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config.server.log_level)?;

    info!("Config loaded from: {:?}", config_path);
    info!(
        "Racing {} upstreams with a {}ms timeout",
        config.upstreams.len(),
        config.server.timeout
    );

    // Misconfigured upstreams stop us here, before anything listens
    let resolver = Resolver::from_config(&config).context("Failed to initialize upstreams")?;

    let server = DnsServer::new(config.server.net, config.server.listen, Arc::new(resolver));
    server.run().await
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(!cfg!(windows))
        .init();

    Ok(())
}
