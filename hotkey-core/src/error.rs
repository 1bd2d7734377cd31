use thiserror::Error;

/// Failures of a single mDNS lookup. The orchestrator treats every variant
/// the same way: log it and end the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("no answer for '{name}' within {timeout_ms} ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("no usable A record for '{name}'")]
    NotFound { name: String },

    #[error("mDNS responder unavailable: {0}")]
    Responder(String),
}

/// Failures of the secure fetch/apply cycle. None of them leave the
/// update partition marked bootable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// TCP, TLS or HTTP level failure talking to the firmware server
    #[error("connection failed: {0}")]
    Connection(String),

    /// The image arrived truncated, oversized or failed validation
    #[error("image integrity check failed: {0}")]
    Integrity(String),

    /// The update partition refused the image
    #[error("install rejected: {0}")]
    Install(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("firmware fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("an update run is already in progress")]
    Busy,

    #[error("failed to spawn update task: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("invalid trust anchor: {0}")]
    TrustAnchor(&'static str),
}
