use thiserror::Error;

use crate::Side;

#[derive(Debug, Error)]
pub enum Error {
    #[error("insufficient balance: {available_btc} BTC available")]
    InsufficientBalance { available_btc: f64 },

    #[error("exposure limit exceeded: {side} refused at position {current_qty} (limit {limit})")]
    ExposureLimitExceeded {
        side: Side,
        current_qty: i64,
        limit: i64,
    },

    #[error("liquidation warning: {side} at {reference_price} is within band of liquidation {liquidation_price}")]
    LiquidationWarning {
        side: Side,
        reference_price: f64,
        liquidation_price: f64,
    },

    #[error("no open position to close")]
    NoOpenPosition,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The exchange already holds an order with this `clOrdID`.
    #[error("duplicate order: {0}")]
    DuplicateOrder(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Risk-gate rejections are final for a single call and never retried.
    pub fn is_risk_rejection(&self) -> bool {
        matches!(
            self,
            Error::InsufficientBalance { .. }
                | Error::ExposureLimitExceeded { .. }
                | Error::LiquidationWarning { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::UpstreamUnavailable(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
