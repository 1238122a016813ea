use std::env;

use tracing::warn;

use crate::protocol::Encoding;
use crate::sync::handler::{DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_CHUNKS, HandlerConfig};
use crate::sync::{DEFAULT_MAX_BYTES, DEFAULT_PENDING_LIMIT, DimensionLimits};

/// Live chunks buffered per receiver before a slow connection is told it lagged.
pub const DEFAULT_LIVE_CAPACITY: usize = 1024;

/// Per-session stream settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamConfig {
    /// Ring buffer retention budget in bytes.
    pub max_bytes: usize,
    pub pending_limit: u32,
    pub max_batch_bytes: usize,
    pub max_batch_chunks: usize,
    pub live_capacity: usize,
    pub encoding: Encoding,
    pub dimension_limits: DimensionLimits,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            pending_limit: DEFAULT_PENDING_LIMIT,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_chunks: DEFAULT_MAX_BATCH_CHUNKS,
            live_capacity: DEFAULT_LIVE_CAPACITY,
            encoding: Encoding::Json,
            dimension_limits: DimensionLimits::default(),
        }
    }
}

impl StreamConfig {
    /// Defaults overridden by `BEACH_STREAM_*` variables and `BEACH_PROTO_BINARY`.
    pub fn from_env() -> Self {
        let pending_limit = parse_usize_env(
            "BEACH_STREAM_PENDING_LIMIT",
            DEFAULT_PENDING_LIMIT as usize,
            1,
        );
        Self {
            max_bytes: parse_usize_env("BEACH_STREAM_MAX_BYTES", DEFAULT_MAX_BYTES, 1024),
            pending_limit: u32::try_from(pending_limit).unwrap_or(u32::MAX),
            max_batch_bytes: parse_usize_env(
                "BEACH_STREAM_BATCH_BYTES",
                DEFAULT_MAX_BATCH_BYTES,
                512,
            ),
            max_batch_chunks: parse_usize_env(
                "BEACH_STREAM_BATCH_CHUNKS",
                DEFAULT_MAX_BATCH_CHUNKS,
                1,
            ),
            live_capacity: DEFAULT_LIVE_CAPACITY,
            encoding: Encoding::from_env(),
            dimension_limits: DimensionLimits::default(),
        }
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            pending_limit: self.pending_limit,
            max_batch_bytes: self.max_batch_bytes,
            max_batch_chunks: self.max_batch_chunks,
        }
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target: "beach_stream::config",
                    var, parsed, min, default, "stream config below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target: "beach_stream::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse stream config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "BEACH_STREAM_MAX_BYTES",
        "BEACH_STREAM_PENDING_LIMIT",
        "BEACH_STREAM_BATCH_BYTES",
        "BEACH_STREAM_BATCH_CHUNKS",
        "BEACH_PROTO_BINARY",
    ];

    fn clear() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test_timeout::timeout]
    fn defaults_without_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        assert_eq!(StreamConfig::from_env(), StreamConfig::default());
    }

    #[test_timeout::timeout]
    fn env_overrides_and_minimums() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("BEACH_STREAM_MAX_BYTES", "65536");
            env::set_var("BEACH_STREAM_PENDING_LIMIT", "0");
            env::set_var("BEACH_STREAM_BATCH_CHUNKS", "many");
            env::set_var("BEACH_PROTO_BINARY", "on");
        }
        let config = StreamConfig::from_env();
        assert_eq!(config.max_bytes, 65_536);
        assert_eq!(config.pending_limit, DEFAULT_PENDING_LIMIT);
        assert_eq!(config.max_batch_chunks, DEFAULT_MAX_BATCH_CHUNKS);
        assert_eq!(config.encoding, Encoding::Binary);
        assert_eq!(config.handler_config().pending_limit, DEFAULT_PENDING_LIMIT);
        clear();
    }
}
