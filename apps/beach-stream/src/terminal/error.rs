use std::io;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("gave up connecting to {url}")]
    ConnectionFailed { url: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
