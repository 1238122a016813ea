use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace, warn};

use super::SessionId;
use super::stream::{ResizeHandler, StreamHub};
use crate::metrics;
use crate::protocol::{Encoding, HostFrame, decode_client_frame, encode_host_frame};
use crate::sync::{Chunk, StreamProtocolHandler};
use crate::telemetry::logging::hexdump;
use crate::transport::{Payload, Transport, TransportError};

/// Task body serving one viewer. Owns the connection's handler exclusively.
pub(super) struct ConnectionTask {
    pub(super) session: SessionId,
    pub(super) handler: StreamProtocolHandler,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) live: broadcast::Receiver<Chunk>,
    pub(super) encoding: Encoding,
    pub(super) resize: Option<Arc<dyn ResizeHandler>>,
    pub(super) hub: Weak<StreamHub>,
}

/// Counts the connection for as long as its task lives, including tasks
/// aborted by `StreamHub::close_connection`.
struct ConnectedGauge;

impl ConnectedGauge {
    fn new() -> Self {
        metrics::CONNECTIONS.inc();
        Self
    }
}

impl Drop for ConnectedGauge {
    fn drop(&mut self) {
        metrics::CONNECTIONS.dec();
    }
}

impl ConnectionTask {
    pub(super) async fn run(mut self) {
        let _gauge = ConnectedGauge::new();
        let id = self.handler.id();
        let reason = loop {
            let frames = tokio::select! {
                inbound = self.transport.recv() => match inbound {
                    Ok(payload) => self.on_payload(payload),
                    Err(err) => break err,
                },
                live = self.live.recv() => match live {
                    Ok(chunk) => self.handler.on_chunk_available(&chunk),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(
                            target: "beach_stream::connection",
                            session = %self.session,
                            connection = %id,
                            skipped,
                            "live receiver lagged; catching up from ring"
                        );
                        self.handler.catch_up()
                    }
                    Err(RecvError::Closed) => break TransportError::ChannelClosed,
                },
            };
            if let Err(err) = self.send_all(frames).await {
                break err;
            }
        };
        debug!(
            target: "beach_stream::connection",
            session = %self.session,
            connection = %id,
            reason = %reason,
            acked = self.handler.state().ack_seq(),
            sent = self.handler.state().sent_seq(),
            "connection finished"
        );
        if let Some(hub) = self.hub.upgrade() {
            hub.forget(id);
        }
    }

    fn on_payload(&mut self, payload: Payload) -> Vec<HostFrame> {
        let frame = match decode_client_frame(&payload) {
            Ok(frame) => frame,
            Err(err) => {
                metrics::PROTOCOL_NOISE
                    .with_label_values(&["undecodable"])
                    .inc();
                debug!(
                    target: "beach_stream::connection",
                    session = %self.session,
                    connection = %self.handler.id(),
                    error = %err,
                    len = payload.len(),
                    "ignoring undecodable frame"
                );
                trace!(target: "beach_stream::connection", "frame dump:\n{}", hexdump(payload.as_bytes()));
                return Vec::new();
            }
        };
        trace!(
            target: "beach_stream::connection",
            connection = %self.handler.id(),
            kind = frame.kind(),
            "client frame"
        );
        let reply = self.handler.on_client_frame(frame, Instant::now());
        if let (Some(dimensions), Some(resize)) = (&reply.resize, &self.resize) {
            resize.on_resize(self.session, dimensions);
        }
        reply.frames
    }

    async fn send_all(&self, frames: Vec<HostFrame>) -> Result<(), TransportError> {
        for frame in frames {
            let payload = match encode_host_frame(&frame, self.encoding) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(
                        target: "beach_stream::connection",
                        connection = %self.handler.id(),
                        kind = frame.kind(),
                        error = %err,
                        "failed to encode host frame"
                    );
                    continue;
                }
            };
            self.transport.send(payload).await?;
        }
        Ok(())
    }
}
