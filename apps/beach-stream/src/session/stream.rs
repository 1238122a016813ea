use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::SessionId;
use super::connection::ConnectionTask;
use crate::config::StreamConfig;
use crate::metrics;
use crate::sync::{
    Chunk, ConfirmedDimensions, ConnectionId, DimensionValidator, PushOutcome, RingBuffer,
    Snapshot, StreamProtocolHandler,
};
use crate::telemetry;
use crate::transport::Transport;

/// Receives geometry confirmed by a viewer so the owner of the terminal
/// process can apply it.
pub trait ResizeHandler: Send + Sync {
    fn on_resize(&self, session: SessionId, dimensions: &ConfirmedDimensions);
}

struct ConnectionHandle {
    transport: Arc<dyn Transport>,
    task: JoinHandle<()>,
}

/// One logical stream: its ring buffer, live fan-out channel and the
/// connections currently watching it.
pub struct StreamHub {
    id: SessionId,
    config: StreamConfig,
    ring: Arc<RwLock<RingBuffer>>,
    live: broadcast::Sender<Chunk>,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    next_connection: AtomicU64,
    resize: Option<Arc<dyn ResizeHandler>>,
}

impl StreamHub {
    pub fn new(id: SessionId, config: StreamConfig) -> Arc<Self> {
        Self::with_resize_handler(id, config, None)
    }

    pub fn with_resize_handler(
        id: SessionId,
        config: StreamConfig,
        resize: Option<Arc<dyn ResizeHandler>>,
    ) -> Arc<Self> {
        let (live, _) = broadcast::channel(config.live_capacity.max(1));
        Arc::new(Self {
            id,
            config,
            ring: Arc::new(RwLock::new(RingBuffer::new(config.max_bytes))),
            live,
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            resize,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Write handle for the process feeding this stream.
    pub fn producer(&self) -> StreamProducer {
        StreamProducer {
            session: self.id,
            label: self.id.to_string(),
            ring: Arc::clone(&self.ring),
            live: self.live.clone(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.ring.read().get_snapshot()
    }

    pub fn next_seq(&self) -> u64 {
        self.ring.read().next_seq()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Spawn the task serving one viewer over `transport`.
    pub fn attach(self: &Arc<Self>, transport: Arc<dyn Transport>) -> ConnectionId {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let handler = StreamProtocolHandler::new(
            id,
            Arc::clone(&self.ring),
            DimensionValidator::new(self.config.dimension_limits),
            self.config.handler_config(),
        );
        let task = ConnectionTask {
            session: self.id,
            handler,
            transport: Arc::clone(&transport),
            live: self.live.subscribe(),
            encoding: self.config.encoding,
            resize: self.resize.clone(),
            hub: Arc::downgrade(self),
        };
        // Hold the map lock across the spawn so a connection that ends
        // immediately cannot try to remove itself before it was inserted.
        let mut connections = self.connections.lock();
        let handle = tokio::spawn(task.run());
        connections.insert(
            id,
            ConnectionHandle {
                transport,
                task: handle,
            },
        );
        info!(
            target: "beach_stream::session",
            session = %self.id,
            connection = %id,
            viewers = connections.len(),
            "viewer attached"
        );
        id
    }

    /// Abort the connection's task and close its transport.
    pub async fn close_connection(&self, id: ConnectionId) -> bool {
        let Some(handle) = self.connections.lock().remove(&id) else {
            return false;
        };
        handle.task.abort();
        handle.transport.close().await;
        debug!(target: "beach_stream::session", session = %self.id, connection = %id, "viewer closed");
        true
    }

    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.connections.lock().drain().collect();
        for (id, handle) in handles {
            handle.task.abort();
            handle.transport.close().await;
            trace!(target: "beach_stream::session", session = %self.id, connection = %id, "viewer closed on shutdown");
        }
        let _ = metrics::BYTES_RETAINED.remove_label_values(&[&self.id.to_string()]);
    }

    pub(super) fn forget(&self, id: ConnectionId) {
        if self.connections.lock().remove(&id).is_some() {
            debug!(target: "beach_stream::session", session = %self.id, connection = %id, "viewer detached");
        }
    }
}

/// The only write path into a stream's ring buffer.
pub struct StreamProducer {
    session: SessionId,
    label: String,
    ring: Arc<RwLock<RingBuffer>>,
    live: broadcast::Sender<Chunk>,
}

impl StreamProducer {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Append bytes and fan the chunk out to live viewers. The ring's write
    /// lock is held only for the append itself.
    pub fn push(&self, bytes: impl Into<Bytes>) -> PushOutcome {
        let (outcome, chunk, retained) = {
            let mut ring = self.ring.write();
            let outcome = ring.push(bytes);
            (outcome, ring.latest().cloned(), ring.total_bytes())
        };

        metrics::CHUNKS_PUSHED.inc();
        if outcome.evicted > 0 {
            metrics::CHUNKS_EVICTED.inc_by(outcome.evicted as u64);
            trace!(
                target: "beach_stream::producer",
                session = %self.session,
                seq = outcome.seq,
                evicted = outcome.evicted,
                "evicted oldest chunks"
            );
        }
        metrics::BYTES_RETAINED
            .with_label_values(&[&self.label])
            .set(retained as i64);
        telemetry::record_gauge("ring_bytes_retained", retained as u64);

        if let Some(chunk) = chunk {
            telemetry::record_bytes("producer_push", chunk.len());
            // No receivers simply means nobody is watching yet.
            let _ = self.live.send(chunk);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientFrame, Encoding, HostFrame, decode_host_frame, encode_client_frame};
    use crate::transport::{Payload, memory};

    async fn send(transport: &memory::MemoryTransport, frame: ClientFrame) {
        transport
            .send(encode_client_frame(&frame, Encoding::Json).unwrap())
            .await
            .unwrap();
    }

    async fn next_frame(transport: &memory::MemoryTransport) -> HostFrame {
        let payload: Payload = transport.recv().await.unwrap();
        decode_host_frame(&payload).unwrap()
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn attached_viewer_receives_live_chunks_after_sync() {
        let hub = StreamHub::new(SessionId::new(), StreamConfig::default());
        let producer = hub.producer();
        producer.push(&b"before"[..]);

        let (server, client) = memory::pair();
        hub.attach(Arc::new(server));
        send(
            &client,
            ClientFrame::SyncRequest {
                last_seq: 0,
                cols: 80,
                rows: 24,
            },
        )
        .await;
        assert!(matches!(
            next_frame(&client).await,
            HostFrame::SyncResponse { buffer_start_seq: 1, buffer_end_seq: 2, .. }
        ));
        let HostFrame::ChunkBatch { bytes, .. } = next_frame(&client).await else {
            panic!("expected replay batch");
        };
        assert_eq!(&bytes[..], b"before");

        producer.push(&b"after"[..]);
        assert!(matches!(
            next_frame(&client).await,
            HostFrame::Chunk { seq: 2, .. }
        ));
        assert_eq!(hub.connection_count(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closed_viewer_is_forgotten() {
        let hub = StreamHub::new(SessionId::new(), StreamConfig::default());
        let (server, client) = memory::pair();
        let id = hub.attach(Arc::new(server));
        assert_eq!(hub.connection_ids(), vec![id]);
        client.close().await;
        while hub.connection_count() > 0 {
            tokio::task::yield_now().await;
        }
        assert!(!hub.close_connection(id).await);
    }
}
