//! Viewer side of the stream: reassembly, liveness and the event loop that
//! drives both over a transport.

pub mod health;
pub mod runtime;
pub mod tracker;

pub use health::{ConnectionHealth, ConnectionState, HealthAction, HealthConfig};
pub use runtime::{
    ClientCommand, ClientError, ClientHandle, ClientOptions, Connector, StreamClient,
    TerminalSink, WebSocketConnector,
};
pub use tracker::{SequenceTracker, TrackerAction, TrackerConfig, TrackerStep};
