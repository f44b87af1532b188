//! Push notification handle registration.

mod client;
mod provider;
mod registrar;

pub use client::{HttpRegistrationClient, RegistrationClient, RegistrationError};
pub use provider::{HandleUnavailable, PushHandleProvider, StaticHandle};
pub use registrar::{
    PushRegistrar, PushRegistrationState, RegistrationOutcome, RegistrationPhase,
};
