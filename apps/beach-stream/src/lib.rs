//! Sequenced terminal streaming for Beach.
//!
//! A producer pushes raw terminal bytes into a per-session ring buffer; every
//! connected viewer gets its own flow-controlled replay of that buffer, and the
//! client side stitches chunks back into one contiguous stream while surviving
//! drops, reordering and reconnects.

pub mod client;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod telemetry;
pub mod terminal;
pub mod transport;
