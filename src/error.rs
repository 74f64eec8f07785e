//! Error types for every DMM component, composed under `anyhow` at the binary boundary.

use thiserror::Error;

/// Errors raised while loading or validating the YAML configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration section: {0}")]
    MissingSection(String),
    #[error("authkey file unreadable: {0}")]
    AuthkeyUnreadable(#[source] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] config::ConfigError),
}

/// Errors raised by the SDN adapter.
#[derive(Debug, Error)]
pub enum SdnError {
    #[error("discovery failed for {rse_name}: {reason}")]
    Discovery { rse_name: String, reason: String },
    #[error("SDN controller rejected {operation}: {reason}")]
    Request { operation: &'static str, reason: String },
    #[error("circuit {link_id} is not in a deletable state ({status})")]
    InvalidState { link_id: String, status: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors raised by the metrics adapter.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("no device found for address {0}")]
    DeviceNotFound(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors raised while mutating a `Site`'s pools or priority sums.
#[derive(Debug, Error)]
pub enum SiteError {
    #[error("no free IPv6 subnet available for site {0}")]
    PoolExhausted(String),
    #[error("block {block} is not in the used pool of site {site}")]
    DoubleFree { site: String, block: String },
}

/// Errors raised by the DMM coordinator's RPC handlers.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("duplicate request: {0}")]
    DuplicateRequest(String),
    #[error("unknown request: {0}")]
    UnknownRequest(String),
    #[error(transparent)]
    Site(#[from] SiteError),
    #[error("HMAC authentication failed")]
    Auth,
    #[error("malformed message: {0}")]
    Protocol(String),
}

/// Errors raised by the persistence layer. Persistence failures never abort a
/// request's in-memory lifecycle; they are logged and the in-memory state remains
/// authoritative until the next successful write.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("row for request {0} could not be decoded: {1}")]
    Decode(String, String),
}
