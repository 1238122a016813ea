use crate::telemetry::logging;
use crate::terminal::cli::{Cli, Command};
use crate::terminal::error::CliError;
use crate::terminal::{host, join};
use tracing::debug;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let Cli { logging: log_args, command } = cli;
    let log_config = log_args.to_config();
    logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match command {
        Command::Host(args) => host::run(args).await,
        Command::Join(args) => join::run(args).await,
    }
}
