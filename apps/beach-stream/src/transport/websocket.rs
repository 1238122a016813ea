use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, trace, warn};

use super::{Payload, Transport, TransportError, TransportId, TransportKind, next_transport_id};

/// WebSocket transport. Text messages carry JSON frames, binary messages the
/// wire codec; a single pump task owns the socket.
pub struct WebSocketTransport {
    id: TransportId,
    outbound: Mutex<Option<mpsc::UnboundedSender<Payload>>>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Payload>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

pub async fn connect(url: &str) -> Result<WebSocketTransport, TransportError> {
    let (stream, _) = connect_async(url)
        .await
        .map_err(|err| TransportError::Setup(format!("connect {url}: {err}")))?;
    debug!(target: "beach_stream::transport::websocket", %url, "connected");
    Ok(WebSocketTransport::spawn(stream))
}

pub async fn accept(stream: TcpStream) -> Result<WebSocketTransport, TransportError> {
    let peer = stream.peer_addr().ok();
    let stream = accept_async(stream)
        .await
        .map_err(|err| TransportError::Setup(format!("websocket handshake: {err}")))?;
    debug!(target: "beach_stream::transport::websocket", ?peer, "accepted");
    Ok(WebSocketTransport::spawn(stream))
}

impl WebSocketTransport {
    fn spawn<S>(stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = next_transport_id();
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let pump = tokio::spawn(run_pump(id, stream, rx_out, tx_in));
        Self {
            id,
            outbound: Mutex::new(Some(tx_out)),
            inbound: AsyncMutex::new(rx_in),
            pump: Mutex::new(Some(pump)),
        }
    }
}

async fn run_pump<S>(
    id: TransportId,
    stream: WebSocketStream<S>,
    mut rx_out: mpsc::UnboundedReceiver<Payload>,
    tx_in: mpsc::UnboundedSender<Payload>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            outgoing = rx_out.recv() => {
                let Some(payload) = outgoing else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let message = match payload {
                    Payload::Text(text) => Message::Text(text),
                    Payload::Binary(bytes) => Message::Binary(bytes.to_vec()),
                };
                if let Err(err) = sink.send(message).await {
                    warn!(target: "beach_stream::transport::websocket", transport = %id, error = %err, "send failed");
                    break;
                }
            }
            incoming = source.next() => {
                let payload = match incoming {
                    Some(Ok(Message::Text(text))) => Payload::Text(text),
                    Some(Ok(Message::Binary(data))) => Payload::Binary(Bytes::from(data)),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(target: "beach_stream::transport::websocket", transport = %id, error = %err, "receive failed");
                        break;
                    }
                };
                trace!(target: "beach_stream::transport::websocket", transport = %id, len = payload.len(), "recv");
                if tx_in.send(payload).is_err() {
                    break;
                }
            }
        }
    }
    debug!(target: "beach_stream::transport::websocket", transport = %id, "pump stopped");
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn id(&self) -> TransportId {
        self.id
    }

    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        let guard = self.outbound.lock();
        let sender = guard.as_ref().ok_or(TransportError::ChannelClosed)?;
        sender
            .send(payload)
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> Result<Payload, TransportError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(TransportError::ChannelClosed)
    }

    async fn close(&self) {
        // Dropping the sender makes the pump send a close frame and exit.
        self.outbound.lock().take();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test_timeout::tokio_timeout_test(10)]
    async fn text_and_binary_cross_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let transport = accept(stream).await.unwrap();
            let first = transport.recv().await.unwrap();
            transport.send(first).await.unwrap();
            let second = transport.recv().await.unwrap();
            transport.send(second).await.unwrap();
            transport
        });

        let client = connect(&format!("ws://{addr}")).await.unwrap();
        client.send(Payload::Text("{\"type\":\"ack\",\"ack_seq\":1}".into())).await.unwrap();
        client
            .send(Payload::Binary(Bytes::from_static(&[0x21, 0x01])))
            .await
            .unwrap();
        assert!(matches!(client.recv().await.unwrap(), Payload::Text(_)));
        assert_eq!(client.recv().await.unwrap().as_bytes(), &[0x21, 0x01]);

        let server_side = server.await.unwrap();
        client.close().await;
        assert!(server_side.recv().await.is_err());
    }
}
