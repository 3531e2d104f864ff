use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::supervisor::BridgeConfig;

/// Attach an HTTP-served disk to a local nbd device through a bridge daemon.
///
/// Prints the device path on stdout once attached and detaches on SIGINT/SIGTERM.
#[derive(Debug, Clone, Parser)]
#[command(name = "httpdisk-attach", version)]
pub struct Args {
    /// Unix socket the bridge listens on.
    ///
    /// Environment variable: `HTTPDISK_SOCKET_PATH`.
    #[arg(long, env = "HTTPDISK_SOCKET_PATH")]
    pub socket_path: PathBuf,

    /// Export name announced by the bridge and requested by the nbd client.
    ///
    /// Environment variable: `HTTPDISK_NBD_NAME`.
    #[arg(long, env = "HTTPDISK_NBD_NAME")]
    pub nbd_name: String,

    /// Disk server URLs, passed to the bridge plugin verbatim.
    ///
    /// Environment variable: `HTTPDISK_URLS`.
    #[arg(long, env = "HTTPDISK_URLS")]
    pub urls: String,

    /// Environment variable: `HTTPDISK_BRIDGE_BIN`.
    #[arg(long, env = "HTTPDISK_BRIDGE_BIN", default_value = "nbdkit")]
    pub bridge_bin: PathBuf,

    /// Environment variable: `HTTPDISK_BRIDGE_PLUGIN`.
    #[arg(long, env = "HTTPDISK_BRIDGE_PLUGIN", default_value = "httpdisk")]
    pub bridge_plugin: String,

    /// Environment variable: `HTTPDISK_NBD_CLIENT`.
    #[arg(long, env = "HTTPDISK_NBD_CLIENT", default_value = "nbd-client")]
    pub nbd_client: String,

    /// Seconds to wait for the bridge to create its socket.
    ///
    /// Environment variable: `HTTPDISK_SOCKET_WAIT_SECS`.
    #[arg(long, env = "HTTPDISK_SOCKET_WAIT_SECS", default_value_t = 5)]
    pub socket_wait_secs: u64,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `HTTPDISK_LOG_LEVEL`.
    #[arg(long, env = "HTTPDISK_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub socket_path: PathBuf,
    pub export: String,
    pub urls: String,
    pub nbd_client: String,
    pub bridge: BridgeConfig,
    pub log_level: String,
}

impl AttachConfig {
    pub fn load() -> Self {
        Self::from(Args::parse())
    }
}

impl From<Args> for AttachConfig {
    fn from(args: Args) -> Self {
        let log_level = args
            .log_level
            .or_else(|| std::env::var("RUST_LOG").ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string());

        Self {
            socket_path: args.socket_path,
            export: args.nbd_name,
            urls: args.urls,
            nbd_client: args.nbd_client,
            bridge: BridgeConfig {
                program: args.bridge_bin,
                plugin: args.bridge_plugin,
                socket_wait: Duration::from_secs(args.socket_wait_secs),
            },
            log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from([
            "httpdisk-attach",
            "--socket-path",
            "/run/disk.sock",
            "--nbd-name",
            "disk",
            "--urls",
            "http://10.0.0.1:8000/ http://10.0.0.2:8000/",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let config = AttachConfig::from(args);
        assert_eq!(config.socket_path, PathBuf::from("/run/disk.sock"));
        assert_eq!(config.export, "disk");
        assert_eq!(config.urls, "http://10.0.0.1:8000/ http://10.0.0.2:8000/");
        assert_eq!(config.nbd_client, "nbd-client");
        assert_eq!(config.bridge, BridgeConfig::default());
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn bridge_overrides() {
        let args = Args::try_parse_from([
            "httpdisk-attach",
            "--socket-path",
            "s",
            "--nbd-name",
            "n",
            "--urls",
            "u",
            "--bridge-bin",
            "/opt/nbdkit",
            "--bridge-plugin",
            "curl",
            "--socket-wait-secs",
            "12",
        ])
        .unwrap();
        let bridge = AttachConfig::from(args).bridge;
        assert_eq!(bridge.program, PathBuf::from("/opt/nbdkit"));
        assert_eq!(bridge.plugin, "curl");
        assert_eq!(bridge.socket_wait, Duration::from_secs(12));
    }

    #[test]
    fn socket_name_and_urls_are_required() {
        assert!(Args::try_parse_from(["httpdisk-attach", "--socket-path", "s"]).is_err());
        assert!(Args::try_parse_from(["httpdisk-attach", "--nbd-name", "n", "--urls", "u"]).is_err());
    }
}
