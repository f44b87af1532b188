//! Counter key generation.

/// A key that uniquely identifies one client's counter within one limiter.
///
/// Limiters sharing a store stay independent because every key carries
/// the limiter's prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Prefix of the limiter this key belongs to (e.g. `login`)
    pub prefix: String,
    /// Client identifier, usually the source address
    pub client: String,
}

impl RateLimitKey {
    /// Create a new key from a limiter prefix and a client identifier.
    pub fn new(prefix: &str, client: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            client: client.to_string(),
        }
    }

    /// The string form used as the store key: `{prefix}:{client}`.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.prefix, self.client)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
