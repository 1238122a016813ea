use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::trace;

use super::{Payload, Transport, TransportError, TransportId, TransportKind, next_transport_id};

/// In-process transport endpoint. Used by tests and by embedders that run the
/// host and the viewer in one process.
#[derive(Debug)]
pub struct MemoryTransport {
    id: TransportId,
    peer: TransportId,
    outbound: Mutex<Option<mpsc::UnboundedSender<Payload>>>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Payload>>,
}

impl MemoryTransport {
    pub fn peer(&self) -> TransportId {
        self.peer
    }
}

pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_id = next_transport_id();
    let b_id = next_transport_id();
    (
        MemoryTransport {
            id: a_id,
            peer: b_id,
            outbound: Mutex::new(Some(a_tx)),
            inbound: AsyncMutex::new(a_rx),
        },
        MemoryTransport {
            id: b_id,
            peer: a_id,
            outbound: Mutex::new(Some(b_tx)),
            inbound: AsyncMutex::new(b_rx),
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn id(&self) -> TransportId {
        self.id
    }

    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        let guard = self.outbound.lock();
        let sender = guard.as_ref().ok_or(TransportError::ChannelClosed)?;
        trace!(target: "beach_stream::transport::memory", transport = %self.id, len = payload.len(), "send");
        sender
            .send(payload)
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> Result<Payload, TransportError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(TransportError::ChannelClosed)
    }

    async fn close(&self) {
        self.outbound.lock().take();
        self.inbound.lock().await.close();
    }
}
