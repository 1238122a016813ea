use std::io::{self, IsTerminal, Write};
use std::sync::Arc;

use tracing::{info, warn};

use crate::client::{ClientOptions, ConnectionState, StreamClient, TerminalSink, WebSocketConnector};
use crate::protocol::Encoding;
use crate::sync::Dimensions;
use crate::terminal::cli::JoinArgs;
use crate::terminal::error::CliError;

const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";

/// Writes the reconstructed stream straight to stdout.
struct StdoutSink {
    out: io::Stdout,
    interactive: bool,
}

impl StdoutSink {
    fn new() -> Self {
        let out = io::stdout();
        let interactive = out.is_terminal();
        Self { out, interactive }
    }

    fn emit(&mut self, bytes: &[u8]) {
        let mut lock = self.out.lock();
        if let Err(err) = lock.write_all(bytes).and_then(|_| lock.flush()) {
            warn!(target: "beach_stream::join", error = %err, "stdout write failed");
        }
    }
}

impl TerminalSink for StdoutSink {
    fn write(&mut self, bytes: &[u8]) {
        self.emit(bytes);
    }

    fn reset(&mut self) {
        // A snapshot replays the whole retained stream; start from a blank screen.
        if self.interactive {
            self.emit(CLEAR_SCREEN);
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        info!(target: "beach_stream::join", cols, rows, "host confirmed geometry");
    }

    fn state_changed(&mut self, from: ConnectionState, to: ConnectionState) {
        if matches!(to, ConnectionState::Reconnecting | ConnectionState::Failed) {
            eprintln!("\r\n🔌 connection {from} -> {to}\r");
        }
    }
}

pub async fn run(args: JoinArgs) -> Result<(), CliError> {
    if args.cols == 0 || args.rows == 0 {
        return Err(CliError::InvalidArgument(
            "--cols and --rows must be positive".into(),
        ));
    }

    let options = ClientOptions {
        dimensions: Dimensions::new(args.cols, args.rows),
        encoding: if args.binary {
            Encoding::Binary
        } else {
            Encoding::from_env()
        },
        ..ClientOptions::default()
    };
    let connector = Arc::new(WebSocketConnector::new(args.url.clone()));
    let (client, handle) = StreamClient::new(connector, StdoutSink::new(), options);
    let client_task = tokio::spawn(client.run());

    let mut watcher = handle.clone();
    let outcome = tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(CliError::from),
        _ = watcher.wait_for(ConnectionState::Failed) => Err(CliError::ConnectionFailed {
            url: args.url.clone(),
        }),
    };

    let _ = handle.shutdown();
    if let Err(err) = client_task.await {
        warn!(target: "beach_stream::join", error = %err, "client task ended abnormally");
    }
    if handle.state() != ConnectionState::Failed {
        info!(target: "beach_stream::join", url = %args.url, "detached");
    }
    outcome
}
