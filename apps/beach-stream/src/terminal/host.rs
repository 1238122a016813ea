use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::session::{ResizeHandler, SessionId, SessionRegistry, StreamHub, StreamProducer};
use crate::sync::ConfirmedDimensions;
use crate::terminal::cli::HostArgs;
use crate::terminal::error::CliError;
use crate::transport::websocket;

const STDIN_CHUNK: usize = 8 * 1024;

/// Without a PTY to resize, confirmed geometry is only reported.
struct LoggingResize;

impl ResizeHandler for LoggingResize {
    fn on_resize(&self, session: SessionId, dimensions: &ConfirmedDimensions) {
        info!(
            target: "beach_stream::host",
            %session,
            cols = dimensions.cols,
            rows = dimensions.rows,
            adjusted = dimensions.adjusted,
            "viewer geometry confirmed"
        );
    }
}

pub async fn run(args: HostArgs) -> Result<(), CliError> {
    let config = args.stream_config();
    let registry = SessionRegistry::new(config);
    let hub = registry.create_with(config, Some(Arc::new(LoggingResize)));
    let session = hub.id();

    let listener = TcpListener::bind(args.listen).await?;
    let local = listener.local_addr()?;
    eprintln!("🏖️  session {session} streaming on ws://{local}");
    info!(target: "beach_stream::host", %session, addr = %local, encoding = ?config.encoding, "host listening");

    let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&hub)));
    let pump_task = tokio::spawn(pump_stdin(hub.producer()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!(target: "beach_stream::host", "interrupted");
        }
        _ = wait_for_accept(accept_task) => {}
    }

    pump_task.abort();
    registry.remove(&session).await;
    if args.dump_metrics {
        eprintln!("{}", metrics::render());
    }
    Ok(())
}

async fn wait_for_accept(task: tokio::task::JoinHandle<Result<(), CliError>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(target: "beach_stream::host", error = %err, "accept loop failed"),
        Err(err) => warn!(target: "beach_stream::host", error = %err, "accept loop panicked"),
    }
}

async fn accept_loop(listener: TcpListener, hub: Arc<StreamHub>) -> Result<(), CliError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let hub = Arc::clone(&hub);
        tokio::spawn(async move { handshake(stream, peer, hub).await });
    }
}

async fn handshake(stream: tokio::net::TcpStream, peer: SocketAddr, hub: Arc<StreamHub>) {
    match websocket::accept(stream).await {
        Ok(transport) => {
            let connection = hub.attach(Arc::new(transport));
            info!(target: "beach_stream::host", %peer, %connection, "viewer attached");
        }
        Err(err) => warn!(target: "beach_stream::host", %peer, error = %err, "handshake failed"),
    }
}

/// Copies stdin into the stream until EOF. Viewers stay attached afterwards
/// and can still replay whatever is retained.
async fn pump_stdin(producer: StreamProducer) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => {
                info!(target: "beach_stream::host", session = %producer.session(), "stdin closed");
                break;
            }
            Ok(n) => {
                let outcome = producer.push(buf[..n].to_vec());
                debug!(target: "beach_stream::host", seq = outcome.seq, bytes = n, evicted = outcome.evicted, "pushed");
            }
            Err(err) => {
                warn!(target: "beach_stream::host", error = %err, "stdin read failed");
                break;
            }
        }
    }
}
