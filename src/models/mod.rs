//! Shared wire models for the alert relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of a TradingView-style alert POST. Every field is optional; alerts
/// frequently arrive as an empty body and the desk falls back to its
/// configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertPayload {
    pub symbol: Option<String>,
    pub action: Option<String>,
    pub quantity: Option<u32>,
    pub price: Option<f64>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
}

/// Read-only position snapshot pulled from the broker. Never mutated
/// locally; the only way to change it is an offsetting order and a re-query.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: i64,
    pub average_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
}

/// Account-level figures, pulled per request.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub buying_power: f64,
    pub net_liquidation: f64,
    pub total_cash_value: f64,
    pub gross_position_value: f64,
}

impl AccountSummary {
    /// Builds a summary from the broker's tag/value pairs. Missing tags
    /// report as zero, matching the gateway's own behavior for accounts
    /// without the figure.
    pub fn from_tags(account_id: &str, tags: &[(String, f64)]) -> Self {
        let get = |tag: &str| {
            tags.iter()
                .find(|(t, _)| t == tag)
                .map(|(_, v)| *v)
                .unwrap_or(0.0)
        };
        Self {
            account_id: account_id.to_string(),
            buying_power: get("BuyingPower"),
            net_liquidation: get("NetLiquidation"),
            total_cash_value: get("TotalCashValue"),
            gross_position_value: get("GrossPositionValue"),
        }
    }
}

/// Timestamped envelope used by webhook responses.
#[derive(Debug, Clone, Serialize)]
pub struct AlertResponse<T: Serialize> {
    pub message: String,
    pub result: T,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> AlertResponse<T> {
    pub fn new(message: impl Into<String>, result: T) -> Self {
        Self {
            message: message.into(),
            result,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_summary_maps_known_tags() {
        let tags = vec![
            ("BuyingPower".to_string(), 250_000.0),
            ("NetLiquidation".to_string(), 120_500.5),
            ("TotalCashValue".to_string(), 80_000.0),
        ];
        let summary = AccountSummary::from_tags("DU12345", &tags);
        assert_eq!(summary.buying_power, 250_000.0);
        assert_eq!(summary.net_liquidation, 120_500.5);
        assert_eq!(summary.total_cash_value, 80_000.0);
        // Tag absent from the gateway reply.
        assert_eq!(summary.gross_position_value, 0.0);
    }
}
