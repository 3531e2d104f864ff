use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

/// Serve a block device over HTTP byte-range requests.
#[derive(Debug, Clone, Parser)]
#[command(name = "httpdisk-server", version)]
pub struct Args {
    /// Block device or image file to serve.
    ///
    /// Environment variable: `HTTPDISK_DISK`.
    #[arg(long, env = "HTTPDISK_DISK")]
    pub disk: PathBuf,

    /// Address to listen on (all interfaces by default).
    ///
    /// Environment variable: `HTTPDISK_IP`.
    #[arg(long, env = "HTTPDISK_IP", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub ip: IpAddr,

    /// Environment variable: `HTTPDISK_PORT`.
    #[arg(long, env = "HTTPDISK_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `HTTPDISK_LOG_LEVEL`.
    #[arg(long, env = "HTTPDISK_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub disk: PathBuf,
    pub bind_addr: SocketAddr,
    pub log_level: String,
}

impl ServerConfig {
    pub fn load() -> Self {
        Self::from(Args::parse())
    }

    /// Config for serving `disk` on `bind_addr`, with default logging.
    pub fn new(disk: impl Into<PathBuf>, bind_addr: SocketAddr) -> Self {
        Self {
            disk: disk.into(),
            bind_addr,
            log_level: "info".to_string(),
        }
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let log_level = args
            .log_level
            .or_else(|| std::env::var("RUST_LOG").ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string());

        Self {
            disk: args.disk,
            bind_addr: SocketAddr::new(args.ip, args.port),
            log_level,
        }
    }
}
