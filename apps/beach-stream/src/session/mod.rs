//! Arena of live streams keyed by session id. Each entry owns its ring buffer
//! and connections; nothing is shared between sessions.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::client::Connector;
use crate::config::StreamConfig;
use crate::transport::{Transport, TransportError, memory};

mod connection;
pub mod stream;

pub use stream::{ResizeHandler, StreamHub, StreamProducer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<StreamHub>>>,
    config: StreamConfig,
}

impl SessionRegistry {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn create(&self) -> Arc<StreamHub> {
        self.create_with(self.config, None)
    }

    pub fn create_with(
        &self,
        config: StreamConfig,
        resize: Option<Arc<dyn ResizeHandler>>,
    ) -> Arc<StreamHub> {
        let id = SessionId::new();
        let hub = StreamHub::with_resize_handler(id, config, resize);
        self.sessions.write().insert(id, Arc::clone(&hub));
        info!(target: "beach_stream::session", session = %id, max_bytes = config.max_bytes, "session created");
        hub
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<StreamHub>> {
        self.sessions.read().get(id).cloned()
    }

    /// Drop the session and close every connection attached to it.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let Some(hub) = self.sessions.write().remove(id) else {
            return false;
        };
        hub.shutdown().await;
        info!(target: "beach_stream::session", session = %id, "session removed");
        true
    }

    pub fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

/// Connects viewers to a hub in the same process over a memory transport pair.
#[derive(Clone)]
pub struct LocalConnector {
    hub: Arc<StreamHub>,
}

impl LocalConnector {
    pub fn new(hub: Arc<StreamHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let (server, client) = memory::pair();
        self.hub.attach(Arc::new(server));
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(10)]
    async fn sessions_are_independent() {
        let registry = SessionRegistry::new(StreamConfig::default());
        let first = registry.create();
        let second = registry.create();
        first.producer().push(&b"only in first"[..]);

        assert_eq!(registry.len(), 2);
        assert_eq!(first.next_seq(), 2);
        assert_eq!(second.next_seq(), 1);
        assert!(registry.get(&second.id()).is_some());

        assert!(registry.remove(&first.id()).await);
        assert!(!registry.remove(&first.id()).await);
        assert_eq!(registry.list(), vec![second.id()]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn removing_session_closes_viewers() {
        let registry = SessionRegistry::default();
        let hub = registry.create();
        let connector = LocalConnector::new(Arc::clone(&hub));
        let viewer = connector.connect().await.unwrap();
        assert_eq!(hub.connection_count(), 1);

        registry.remove(&hub.id()).await;
        assert_eq!(hub.connection_count(), 0);
        assert!(matches!(
            viewer.recv().await,
            Err(TransportError::ChannelClosed)
        ));
    }

    #[test_timeout::timeout]
    fn session_id_parses_its_display_form() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }
}
