//! HTTP gateway applying admission control in front of the API.

mod proxy;
mod server;

pub use proxy::{forward, ProxyState};
pub use server::{router, GatewayServer};
