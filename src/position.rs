//! Open trade tracked by a symbol's lifecycle.

use serde::{Deserialize, Serialize};

use crate::exchange::OrderHandle;
use crate::market::Side;
use crate::regime::RegimeKind;
use crate::strategy::RiskParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub opened_at: u64,
    pub status: PositionStatus,
    pub regime: RegimeKind,
    pub handle: OrderHandle,
}

/// Stop and target prices for an entry at `entry` on `side`.
pub fn protective_levels(side: Side, entry: f64, params: &RiskParameters) -> (f64, f64) {
    match side {
        Side::Long => (
            entry * (1.0 - params.stop_loss_fraction),
            entry * (1.0 + params.take_profit_fraction),
        ),
        Side::Short => (
            entry * (1.0 + params.stop_loss_fraction),
            entry * (1.0 - params.take_profit_fraction),
        ),
    }
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size * self.side.sign()
    }

    /// Fractional return on the entry notional.
    pub fn return_at(&self, price: f64) -> f64 {
        let notional = self.entry_price * self.size;
        if notional <= 0.0 {
            return 0.0;
        }
        self.pnl_at(price) / notional
    }

    pub fn stop_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price <= self.stop_price,
            Side::Short => price >= self.stop_price,
        }
    }

    pub fn target_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price >= self.target_price,
            Side::Short => price <= self.target_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RiskParameters {
        RiskParameters {
            stop_loss_fraction: 0.02,
            take_profit_fraction: 0.04,
            position_size_fraction: 0.1,
        }
    }

    fn position(side: Side) -> Position {
        let (stop, target) = protective_levels(side, 100.0, &params());
        Position {
            strategy_id: "trend_long".into(),
            symbol: "BTCUSDT".into(),
            side,
            entry_price: 100.0,
            size: 2.0,
            stop_price: stop,
            target_price: target,
            opened_at: 0,
            status: PositionStatus::Open,
            regime: RegimeKind::TrendingBullish,
            handle: OrderHandle { order_id: "o-1".into(), client_order_id: "c-1".into() },
        }
    }

    #[test]
    fn long_levels_and_crossings() {
        let p = position(Side::Long);
        assert!((p.stop_price - 98.0).abs() < 1e-9);
        assert!((p.target_price - 104.0).abs() < 1e-9);
        assert!(p.stop_hit(97.5));
        assert!(!p.stop_hit(99.0));
        assert!(p.target_hit(104.0));
        assert!((p.pnl_at(103.0) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn short_levels_and_crossings() {
        let p = position(Side::Short);
        assert!((p.stop_price - 102.0).abs() < 1e-9);
        assert!((p.target_price - 96.0).abs() < 1e-9);
        assert!(p.stop_hit(102.5));
        assert!(p.target_hit(95.0));
        assert!((p.pnl_at(97.0) - 6.0).abs() < 1e-9);
        assert!((p.return_at(97.0) - 0.03).abs() < 1e-9);
    }
}
