//! Delivery error types.

use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed delivery.
///
/// Every caller matches all three variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying later: network failure, 429, 5xx or an open circuit.
    #[error("{0}")]
    Transient(String),

    /// Retrying will not help: any other 4xx.
    #[error("{0}")]
    Fatal(String),

    /// A local precondition failed before any request was made.
    #[error("{0}")]
    Validation(String),
}

impl DeliveryError {
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Fatal(m) | Self::Validation(m) => m,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::Validation(_) => "validation",
        }
    }
}

/// Failure below the HTTP status level.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No response within the request timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Could not connect
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other request or body read failure
    #[error("request failed: {0}")]
    Request(String),

    /// Client could not be built from the configuration
    #[error("invalid transport config: {0}")]
    InvalidConfig(String),
}
