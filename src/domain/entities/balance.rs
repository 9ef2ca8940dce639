//! Account balance snapshot
//!
//! Read-only figures from the broker; never persisted as a source of truth.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub cash: f64,
    pub buying_power: f64,
    pub equity: f64,
    pub initial_margin: f64,
    pub maintenance_margin: f64,
    pub currency: String,
}

impl AccountBalance {
    pub fn new(cash: f64, buying_power: f64, equity: f64, currency: &str) -> Result<Self, String> {
        if !cash.is_finite() || !buying_power.is_finite() || !equity.is_finite() {
            return Err("Balance figures must be finite".to_string());
        }
        Ok(Self {
            cash,
            buying_power,
            equity,
            initial_margin: 0.0,
            maintenance_margin: 0.0,
            currency: currency.to_string(),
        })
    }
}
