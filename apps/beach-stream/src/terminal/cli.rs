use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::StreamConfig;
use crate::protocol::Encoding;
use crate::sync::DimensionLimits;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "beach-stream",
    about = "Stream a terminal's output to remote viewers without losing bytes",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "BEACH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "BEACH_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read stdin into a new stream and serve it to WebSocket viewers
    Host(HostArgs),
    /// Attach to a hosted stream and write the reconstructed output to stdout
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    #[arg(
        long,
        env = "BEACH_STREAM_LISTEN",
        default_value = "127.0.0.1:7447",
        help = "Address to accept WebSocket viewers on"
    )]
    pub listen: SocketAddr,

    #[arg(long = "max-bytes", value_name = "BYTES", help = "Ring buffer retention budget")]
    pub max_bytes: Option<usize>,

    #[arg(
        long = "pending-limit",
        value_name = "CHUNKS",
        help = "Unacknowledged chunks per viewer before live sends are withheld"
    )]
    pub pending_limit: Option<u32>,

    #[arg(long = "max-cols", help = "Largest terminal width viewers may negotiate")]
    pub max_cols: Option<u16>,

    #[arg(long = "max-rows", help = "Largest terminal height viewers may negotiate")]
    pub max_rows: Option<u16>,

    #[arg(long, help = "Send frames with the binary codec instead of JSON")]
    pub binary: bool,

    #[arg(long = "dump-metrics", help = "Print Prometheus metrics to stderr on exit")]
    pub dump_metrics: bool,
}

impl HostArgs {
    /// Environment-derived config with explicit flags layered on top.
    pub fn stream_config(&self) -> StreamConfig {
        let mut config = StreamConfig::from_env();
        if let Some(max_bytes) = self.max_bytes {
            config.max_bytes = max_bytes.max(1);
        }
        if let Some(limit) = self.pending_limit {
            config.pending_limit = limit.max(1);
        }
        if self.max_cols.is_some() || self.max_rows.is_some() {
            let defaults = config.dimension_limits;
            config.dimension_limits = DimensionLimits::new(
                self.max_cols.unwrap_or(defaults.max_cols),
                self.max_rows.unwrap_or(defaults.max_rows),
            );
        }
        if self.binary {
            config.encoding = Encoding::Binary;
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// WebSocket URL printed by `beach-stream host`
    pub url: String,

    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    #[arg(long, default_value_t = 24)]
    pub rows: u16,

    #[arg(long, help = "Send frames with the binary codec instead of JSON")]
    pub binary: bool,
}
