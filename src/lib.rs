//! Heartline - resilience core of the Heartline dating app
//!
//! Three pieces share one problem, bounding retries and resources under
//! failure. The gateway caps request rates per client with fixed-window
//! admission control; the push registrar registers a device's push handle
//! with bounded, backed-off retries; the realtime manager keeps one
//! persistent channel per session alive across drops.

pub mod backoff;
pub mod config;
pub mod error;
pub mod gateway;
pub mod push;
pub mod ratelimit;
pub mod realtime;
