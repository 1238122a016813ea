use std::future::pending;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::health::{ConnectionHealth, ConnectionState, HealthAction, HealthConfig};
use super::tracker::{SequenceTracker, TrackerAction, TrackerConfig};
use crate::protocol::{ClientFrame, Encoding, HostFrame, decode_host_frame, encode_client_frame};
use crate::sync::ring_buffer::now_ms;
use crate::sync::{Dimensions, Seq};
use crate::telemetry::logging::hexdump;
use crate::transport::{Payload, Transport, TransportError, websocket};

/// Dials a fresh transport to the host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = websocket::connect(&self.url).await?;
        Ok(Arc::new(transport))
    }
}

/// Presentation side of the client: receives the reconstructed byte stream.
pub trait TerminalSink: Send {
    fn write(&mut self, bytes: &[u8]);

    /// Local screen state is about to be replaced by a full replay.
    fn reset(&mut self) {}

    /// Called only with geometry the host confirmed.
    fn resize(&mut self, _cols: u16, _rows: u16) {}

    fn state_changed(&mut self, _from: ConnectionState, _to: ConnectionState) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientCommand {
    Suspend,
    Resume,
    Retry,
    Resize(Dimensions),
    Shutdown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("stream client has stopped")]
    Stopped,
}

/// Control surface for a running `StreamClient`.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ClientHandle {
    pub fn suspend(&self) -> Result<(), ClientError> {
        self.send(ClientCommand::Suspend)
    }

    pub fn resume(&self) -> Result<(), ClientError> {
        self.send(ClientCommand::Resume)
    }

    pub fn retry(&self) -> Result<(), ClientError> {
        self.send(ClientCommand::Retry)
    }

    pub fn resize(&self, dimensions: Dimensions) -> Result<(), ClientError> {
        self.send(ClientCommand::Resize(dimensions))
    }

    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.send(ClientCommand::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for(&mut self, target: ConnectionState) -> Result<(), ClientError> {
        self.state
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Stopped)
    }

    fn send(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::Stopped)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub dimensions: Dimensions,
    pub encoding: Encoding,
    pub tracker: TrackerConfig,
    pub health: HealthConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dimensions: Dimensions::new(80, 24),
            encoding: Encoding::Json,
            tracker: TrackerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    /// Waiting for the host to confirm geometry; no sync may be requested yet.
    Negotiating,
    Syncing,
    Streaming,
}

struct Link {
    transport: Arc<dyn Transport>,
    phase: LinkPhase,
    adopted_suggestion: bool,
}

type ConnectResult = (u64, Result<Arc<dyn Transport>, TransportError>);

enum LoopEvent {
    Command(Option<ClientCommand>),
    Dialed(ConnectResult),
    Inbound(Result<Payload, TransportError>),
    Timer,
}

/// Viewer-side event loop: owns one connection at a time and feeds the
/// tracker and health machine from transport frames, commands and timers.
pub struct StreamClient<S: TerminalSink> {
    connector: Arc<dyn Connector>,
    sink: S,
    options: ClientOptions,
    dimensions: Dimensions,
    tracker: SequenceTracker,
    health: ConnectionHealth,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    state: watch::Sender<ConnectionState>,
    dialed_tx: mpsc::UnboundedSender<ConnectResult>,
    dialed_rx: mpsc::UnboundedReceiver<ConnectResult>,
    generation: u64,
    dialing: Option<JoinHandle<()>>,
    link: Option<Link>,
}

impl<S: TerminalSink> StreamClient<S> {
    pub fn new(connector: Arc<dyn Connector>, sink: S, options: ClientOptions) -> (Self, ClientHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Initial);
        let (dialed_tx, dialed_rx) = mpsc::unbounded_channel();
        let client = Self {
            connector,
            sink,
            options,
            dimensions: options.dimensions,
            tracker: SequenceTracker::new(options.tracker),
            health: ConnectionHealth::new(options.health),
            commands,
            state,
            dialed_tx,
            dialed_rx,
            generation: 0,
            dialing: None,
            link: None,
        };
        let handle = ClientHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (client, handle)
    }

    /// Run until `shutdown` is requested or every handle is dropped. Returns
    /// the sink.
    pub async fn run(mut self) -> S {
        let actions = self.health.start(Instant::now());
        self.apply_health(actions).await;

        loop {
            let event = self.next_event().await;
            let now = Instant::now();
            match event {
                LoopEvent::Command(None) | LoopEvent::Command(Some(ClientCommand::Shutdown)) => {
                    break;
                }
                LoopEvent::Command(Some(command)) => self.on_command(command, now).await,
                LoopEvent::Dialed((generation, result)) => {
                    self.on_dialed(generation, result, now).await
                }
                LoopEvent::Inbound(Ok(payload)) => {
                    let actions = self.health.on_traffic(now);
                    self.apply_health(actions).await;
                    self.on_payload(payload, now).await;
                }
                LoopEvent::Inbound(Err(err)) => {
                    debug!(target: "beach_stream::client", error = %err, "transport closed");
                    self.drop_link().await;
                    let actions = self.health.on_transport_closed(now);
                    self.apply_health(actions).await;
                }
                LoopEvent::Timer => {
                    let actions = self.health.poll(now);
                    self.apply_health(actions).await;
                    let actions = self.tracker.poll(now);
                    self.apply_tracker(actions).await;
                }
            }
        }

        info!(target: "beach_stream::client", last_seq = self.tracker.last_contiguous_seq(), "client shutting down");
        self.abort_dialing();
        self.drop_link().await;
        self.sink
    }

    async fn next_event(&mut self) -> LoopEvent {
        let transport = self.link.as_ref().map(|link| Arc::clone(&link.transport));
        let inbound = async move {
            match transport {
                Some(transport) => transport.recv().await,
                None => pending().await,
            }
        };
        let deadline = earliest(self.tracker.next_deadline(), self.health.next_deadline());
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => pending().await,
            }
        };
        tokio::select! {
            command = self.commands.recv() => LoopEvent::Command(command),
            Some(dialed) = self.dialed_rx.recv() => LoopEvent::Dialed(dialed),
            inbound = inbound => LoopEvent::Inbound(inbound),
            _ = timer => LoopEvent::Timer,
        }
    }

    async fn on_command(&mut self, command: ClientCommand, now: Instant) {
        match command {
            ClientCommand::Suspend => {
                let actions = self.health.suspend();
                self.apply_health(actions).await;
            }
            ClientCommand::Resume => {
                let actions = self.health.resume(now);
                self.apply_health(actions).await;
            }
            ClientCommand::Retry => {
                let actions = self.health.retry(now);
                self.apply_health(actions).await;
            }
            ClientCommand::Resize(dimensions) => {
                self.dimensions = dimensions;
                if let Some(link) = self.link.as_mut() {
                    link.adopted_suggestion = false;
                }
                self.negotiate().await;
            }
            ClientCommand::Shutdown => {}
        }
    }

    async fn on_dialed(
        &mut self,
        generation: u64,
        result: Result<Arc<dyn Transport>, TransportError>,
        now: Instant,
    ) {
        if generation != self.generation {
            if let Ok(stale) = result {
                stale.close().await;
            }
            return;
        }
        self.dialing = None;
        match result {
            Ok(transport) => {
                debug!(target: "beach_stream::client", transport = %transport.id(), "transport ready");
                self.link = Some(Link {
                    transport,
                    phase: LinkPhase::Negotiating,
                    adopted_suggestion: false,
                });
                let actions = self.health.on_connected(now);
                self.apply_health(actions).await;
                self.negotiate().await;
            }
            Err(err) => {
                warn!(target: "beach_stream::client", error = %err, "connect attempt failed");
                let actions = self.health.on_connect_failed(now);
                self.apply_health(actions).await;
            }
        }
    }

    async fn on_payload(&mut self, payload: Payload, now: Instant) {
        let frame = match decode_host_frame(&payload) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: "beach_stream::client", error = %err, len = payload.len(), "ignoring undecodable frame");
                trace!(target: "beach_stream::client", "frame dump:\n{}", hexdump(payload.as_bytes()));
                return;
            }
        };
        match frame {
            HostFrame::Chunk { seq, bytes, .. } => {
                self.ingest(seq, bytes, now).await;
            }
            HostFrame::ChunkBatch {
                start_seq,
                bytes,
                chunk_count,
                chunk_lens,
                is_complete,
            } => {
                let total: usize = chunk_lens.iter().map(|len| *len as usize).sum();
                if chunk_lens.len() != chunk_count as usize || total != bytes.len() {
                    warn!(
                        target: "beach_stream::client",
                        start_seq,
                        chunk_count,
                        lens = chunk_lens.len(),
                        bytes = bytes.len(),
                        "inconsistent chunk batch ignored"
                    );
                    return;
                }
                if start_seq.checked_add(u64::from(chunk_count)).is_none() {
                    warn!(
                        target: "beach_stream::client",
                        start_seq,
                        chunk_count,
                        "chunk batch runs past the sequence space; ignored"
                    );
                    return;
                }
                let mut offset = 0;
                let mut seq = start_seq;
                for len in &chunk_lens {
                    let len = *len as usize;
                    let chunk = bytes.slice(offset..offset + len);
                    offset += len;
                    self.ingest(seq, chunk, now).await;
                    seq += 1;
                }
                if is_complete {
                    self.set_phase(LinkPhase::Streaming);
                }
            }
            HostFrame::SyncResponse {
                buffer_start_seq,
                buffer_end_seq,
                full_buffer,
                requires_resync,
                ..
            } => {
                if let Some(snapshot) = full_buffer {
                    info!(
                        target: "beach_stream::client",
                        start_seq = buffer_start_seq,
                        end_seq = buffer_end_seq,
                        bytes = snapshot.len(),
                        requires_resync,
                        "resyncing from snapshot"
                    );
                    self.sink.reset();
                    self.sink.write(&snapshot);
                    self.tracker.reset_to(buffer_end_seq.saturating_sub(1));
                    self.set_phase(LinkPhase::Streaming);
                }
            }
            HostFrame::BufferOverflow { new_start_seq, .. } => {
                info!(
                    target: "beach_stream::client",
                    new_start_seq,
                    last_seq = self.tracker.last_contiguous_seq(),
                    "host no longer has the requested range"
                );
                self.tracker.reset();
                self.resync().await;
            }
            HostFrame::DimensionsConfirmed {
                cols,
                rows,
                adjusted,
                reason,
            } => {
                if adjusted {
                    info!(target: "beach_stream::client", cols, rows, reason = reason.as_deref().unwrap_or(""), "host adjusted dimensions");
                }
                self.sink.resize(cols, rows);
                let awaiting_sync = self
                    .link
                    .as_ref()
                    .is_some_and(|link| link.phase == LinkPhase::Negotiating);
                if awaiting_sync {
                    self.set_phase(LinkPhase::Syncing);
                    let last_seq = self.tracker.last_contiguous_seq();
                    self.send(ClientFrame::SyncRequest {
                        last_seq,
                        cols,
                        rows,
                    })
                    .await;
                }
            }
            HostFrame::DimensionsRejected {
                reason,
                suggested_cols,
                suggested_rows,
            } => {
                let Some(link) = self.link.as_mut() else {
                    return;
                };
                if link.adopted_suggestion {
                    warn!(target: "beach_stream::client", %reason, "host rejected suggested dimensions too");
                    return;
                }
                link.adopted_suggestion = true;
                warn!(
                    target: "beach_stream::client",
                    %reason,
                    suggested_cols,
                    suggested_rows,
                    "dimensions rejected; adopting host suggestion"
                );
                self.dimensions = Dimensions {
                    cols: suggested_cols,
                    rows: suggested_rows,
                    ..self.dimensions
                };
                self.negotiate().await;
            }
            HostFrame::HeartbeatAck {
                nonce,
                timestamp_ms,
            } => {
                trace!(
                    target: "beach_stream::client",
                    nonce,
                    rtt_ms = now_ms().saturating_sub(timestamp_ms),
                    "heartbeat ack"
                );
            }
            HostFrame::Unknown => {
                debug!(target: "beach_stream::client", "ignoring unknown host frame");
            }
        }
    }

    async fn ingest(&mut self, seq: Seq, bytes: Bytes, now: Instant) {
        let step = self.tracker.ingest(seq, bytes, now);
        for chunk in &step.delivered {
            self.sink.write(chunk);
        }
        self.apply_tracker(step.actions).await;
    }

    async fn apply_tracker(&mut self, actions: Vec<TrackerAction>) {
        for action in actions {
            match action {
                TrackerAction::Ack { ack_seq } => self.send(ClientFrame::Ack { ack_seq }).await,
                TrackerAction::RequestRange { start_seq, end_seq } => {
                    self.send(ClientFrame::RangeRequest { start_seq, end_seq })
                        .await
                }
                TrackerAction::Resync => self.resync().await,
            }
        }
    }

    async fn apply_health(&mut self, actions: Vec<HealthAction>) {
        for action in actions {
            match action {
                HealthAction::Connect => self.dial().await,
                HealthAction::SendHeartbeat { nonce } => {
                    self.send(ClientFrame::Heartbeat {
                        nonce,
                        timestamp_ms: now_ms(),
                    })
                    .await
                }
                HealthAction::StateChanged { from, to } => {
                    info!(target: "beach_stream::client", %from, %to, "connection state changed");
                    if matches!(
                        to,
                        ConnectionState::Backoff | ConnectionState::Failed | ConnectionState::Suspended
                    ) {
                        self.abort_dialing();
                        self.drop_link().await;
                    }
                    self.state.send_replace(to);
                    self.sink.state_changed(from, to);
                }
            }
        }
    }

    // Full replay: forget local position and ask for everything retained.
    async fn resync(&mut self) {
        self.sink.reset();
        if self.link.is_none() {
            return;
        }
        self.set_phase(LinkPhase::Syncing);
        self.send(ClientFrame::SyncRequest {
            last_seq: 0,
            cols: self.dimensions.cols,
            rows: self.dimensions.rows,
        })
        .await;
    }

    async fn negotiate(&mut self) {
        if self.link.is_none() {
            return;
        }
        let dims = self.dimensions;
        self.send(ClientFrame::NegotiateDimensions {
            cols: dims.cols,
            rows: dims.rows,
            confidence: dims.confidence,
            source: dims.source,
        })
        .await;
    }

    async fn dial(&mut self) {
        self.abort_dialing();
        self.drop_link().await;
        self.generation += 1;
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let dialed = self.dialed_tx.clone();
        debug!(target: "beach_stream::client", generation, "dialing");
        self.dialing = Some(tokio::spawn(async move {
            let result = connector.connect().await;
            let _ = dialed.send((generation, result));
        }));
    }

    fn abort_dialing(&mut self) {
        if let Some(task) = self.dialing.take() {
            task.abort();
        }
        // Results already queued from an aborted attempt are ignored by generation.
        self.generation += 1;
    }

    async fn drop_link(&mut self) {
        self.tracker.cancel_timers();
        if let Some(link) = self.link.take() {
            link.transport.close().await;
        }
    }

    fn set_phase(&mut self, phase: LinkPhase) {
        if let Some(link) = self.link.as_mut() {
            link.phase = phase;
        }
    }

    async fn send(&mut self, frame: ClientFrame) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let payload = match encode_client_frame(&frame, self.options.encoding) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "beach_stream::client", kind = frame.kind(), error = %err, "failed to encode frame");
                return;
            }
        };
        if let Err(err) = link.transport.send(payload).await {
            // The receive side reports the closure and drives reconnection.
            debug!(target: "beach_stream::client", kind = frame.kind(), error = %err, "send failed");
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
