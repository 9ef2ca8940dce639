//! Position model
//!
//! Positions are a derived cache: rebuilt wholesale from each broker sync,
//! never a source of truth. The broker's latest response always wins.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<PositionSide> {
        match s {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

/// A single holding as reported by a broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub cost_basis: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub current_price: f64,
}

impl Position {
    /// Recompute unrealized P&L from current figures.
    pub fn compute_pnl(&self) -> f64 {
        let entry_value = self.quantity * self.avg_entry_price;
        let current_value = self.quantity * self.current_price;
        match self.side {
            PositionSide::Long => current_value - entry_value,
            PositionSide::Short => entry_value - current_value,
        }
    }
}
