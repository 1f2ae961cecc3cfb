//! Engine error taxonomy.
//!
//! Only `PositionDesync` escapes a symbol's lifecycle: it is promoted to a
//! global halt of the risk gate. Everything else is recovered locally.
//! A gate denial is not an error, see [`crate::risk::Admission`].

use crate::market::Side;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Stale, missing or non-finite market data. The cycle is skipped.
    #[error("insufficient data for {symbol}: {reason}")]
    InsufficientData { symbol: String, reason: String },

    /// The execution collaborator refused or failed an order.
    #[error("exchange rejected {side} order for {symbol}: {reason}")]
    ExchangeRejected {
        symbol: String,
        side: Side,
        reason: String,
    },

    /// Local and external position state can no longer be reconciled.
    #[error("position desync on {symbol}: {reason}")]
    PositionDesync { symbol: String, reason: String },

    /// Malformed strategy definition or threshold. Fatal at start-up.
    #[error("config error in {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("ledger storage error: {reason}")]
    Storage { reason: String },
}

impl EngineError {
    pub fn insufficient(symbol: &str, reason: impl Into<String>) -> Self {
        Self::InsufficientData {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    pub fn config(field: &str, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind used in log records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientData { .. } => "insufficient_data",
            Self::ExchangeRejected { .. } => "exchange_rejected",
            Self::PositionDesync { .. } => "position_desync",
            Self::Config { .. } => "config",
            Self::Storage { .. } => "storage",
        }
    }

    /// Errors that must halt every symbol, not just the one that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PositionDesync { .. })
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage {
            reason: err.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_desync_is_fatal() {
        let desync = EngineError::PositionDesync {
            symbol: "BTCUSDT".into(),
            reason: "close never confirmed".into(),
        };
        assert!(desync.is_fatal());
        assert!(!EngineError::insufficient("BTCUSDT", "nan trend").is_fatal());
        assert!(!EngineError::config("gate.stale_after_ms", "zero").is_fatal());
    }

    #[test]
    fn display_names_symbol_and_side() {
        let err = EngineError::ExchangeRejected {
            symbol: "ETHUSDT".into(),
            side: Side::Short,
            reason: "margin".into(),
        };
        assert_eq!(
            err.to_string(),
            "exchange rejected short order for ETHUSDT: margin"
        );
        assert_eq!(err.kind(), "exchange_rejected");
    }
}
