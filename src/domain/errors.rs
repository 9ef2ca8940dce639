//! Broker error taxonomy
//!
//! Every adapter failure is normalized into one `BrokerError` variant
//! tagged with the originating broker and the broker's original error text.
//! Adapters never retry; callers decide based on `is_retryable`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::broker::BrokerKind;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum BrokerError {
    #[error("[{broker}] authentication failed: {detail}")]
    AuthenticationFailed { broker: BrokerKind, detail: String },

    #[error("[{broker}] connection error: {detail}")]
    ConnectionError { broker: BrokerKind, detail: String },

    #[error("[{broker}] invalid order: {detail}")]
    InvalidOrder { broker: BrokerKind, detail: String },

    #[error("[{broker}] order rejected: {detail}")]
    OrderRejected { broker: BrokerKind, detail: String },

    #[error("[{broker}] rate limited: {detail}")]
    RateLimited { broker: BrokerKind, detail: String },

    #[error("[{broker}] insufficient funds: {detail}")]
    InsufficientFunds { broker: BrokerKind, detail: String },

    #[error("[{broker}] invalid symbol: {symbol}")]
    InvalidSymbol { broker: BrokerKind, symbol: String },

    #[error("[{broker}] market closed")]
    MarketClosed { broker: BrokerKind },

    #[error("[{broker}] position not found: {symbol}")]
    PositionNotFound { broker: BrokerKind, symbol: String },

    #[error("[{broker}] unknown error: {detail}")]
    Unknown { broker: BrokerKind, detail: String },
}

impl BrokerError {
    pub fn broker(&self) -> BrokerKind {
        match self {
            BrokerError::AuthenticationFailed { broker, .. }
            | BrokerError::ConnectionError { broker, .. }
            | BrokerError::InvalidOrder { broker, .. }
            | BrokerError::OrderRejected { broker, .. }
            | BrokerError::RateLimited { broker, .. }
            | BrokerError::InsufficientFunds { broker, .. }
            | BrokerError::InvalidSymbol { broker, .. }
            | BrokerError::MarketClosed { broker }
            | BrokerError::PositionNotFound { broker, .. }
            | BrokerError::Unknown { broker, .. } => *broker,
        }
    }

    /// Transient failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::RateLimited { .. } | BrokerError::ConnectionError { .. }
        )
    }

    /// Failures that invalidate the stored credentials. The owning
    /// connection is deactivated and never auto-retried.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, BrokerError::AuthenticationFailed { .. })
    }

    /// Map an HTTP status from a broker response to an error variant.
    /// Used by adapters after broker-specific message parsing found no
    /// better classification.
    pub fn from_status(broker: BrokerKind, status: u16, body: &str) -> BrokerError {
        match status {
            401 | 403 => BrokerError::AuthenticationFailed {
                broker,
                detail: body.to_string(),
            },
            422 => BrokerError::InvalidOrder {
                broker,
                detail: body.to_string(),
            },
            429 => BrokerError::RateLimited {
                broker,
                detail: body.to_string(),
            },
            500..=599 => BrokerError::ConnectionError {
                broker,
                detail: format!("broker returned {}: {}", status, body),
            },
            _ => BrokerError::Unknown {
                broker,
                detail: format!("broker returned {}: {}", status, body),
            },
        }
    }

    /// Wrap a transport-level failure (timeout, DNS, TLS, refused).
    pub fn from_transport(broker: BrokerKind, err: &reqwest::Error) -> BrokerError {
        BrokerError::ConnectionError {
            broker,
            detail: err.to_string(),
        }
    }
}
