//! Sources of the device push handle.

use async_trait::async_trait;
use thiserror::Error;

/// Why no push handle could be obtained.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleUnavailable {
    #[error("push notification permission denied")]
    PermissionDenied,
    #[error("push notifications are not supported on this device")]
    Unsupported,
}

/// Obtains the platform's push handle for this device.
#[async_trait]
pub trait PushHandleProvider: Send + Sync {
    /// Ask the platform for a push handle, prompting for permission if needed.
    async fn device_handle(&self) -> Result<String, HandleUnavailable>;
}

/// A provider returning a handle fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticHandle {
    handle: Result<String, HandleUnavailable>,
}

impl StaticHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: Ok(handle.into()),
        }
    }

    pub fn unavailable(reason: HandleUnavailable) -> Self {
        Self {
            handle: Err(reason),
        }
    }
}

#[async_trait]
impl PushHandleProvider for StaticHandle {
    async fn device_handle(&self) -> Result<String, HandleUnavailable> {
        self.handle.clone()
    }
}
