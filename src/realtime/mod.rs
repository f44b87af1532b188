//! Persistent realtime connection with automatic reconnection.

mod manager;
mod transport;
mod ws;

pub use manager::{
    ConnectionHandle, ConnectionStatus, RealtimeConnectionManager, RealtimeError, RealtimeEvent,
};
pub use transport::{realtime_endpoint, Channel, FallbackTransport, Transport, TransportError};
pub use ws::WsTransport;
