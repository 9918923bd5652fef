//! One-shot market-data snapshots
//!
//! A snapshot is a subscribe -> settle -> read -> cancel round-trip, not a
//! standing subscription. The result is ephemeral and never cached.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::broker::api::{BrokerApi, BrokerError, RawTicker};
use crate::instruments::ResolvedContract;

/// Point-in-time bid/ask/last read. A side is `None` when the feed reported
/// a non-positive (unavailable) value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
}

impl MarketSnapshot {
    pub fn from_raw(raw: RawTicker) -> Self {
        let valid = |value: f64| if value > 0.0 { Some(value) } else { None };
        Self {
            bid: valid(raw.bid),
            ask: valid(raw.ask),
            last: valid(raw.last),
        }
    }

    /// `ask - bid`, only when both sides are present.
    pub fn spread(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }
}

/// Fetches a one-shot snapshot for the contract. The caller suspends for the
/// settling window while the feed populates derived ticks. The subscription
/// is released on both the success and the failure path.
pub async fn fetch_snapshot(
    gateway: &dyn BrokerApi,
    contract: &ResolvedContract,
    settle: Duration,
) -> Result<MarketSnapshot, BrokerError> {
    let subscription = gateway.subscribe_market_data(contract).await?;
    tokio::time::sleep(settle).await;
    let raw = gateway.read_ticker(subscription).await;
    gateway.cancel_market_data(subscription).await;
    let snapshot = MarketSnapshot::from_raw(raw?);
    debug!(
        "Market data for {}: bid={:?} ask={:?} last={:?}",
        contract.symbol, snapshot.bid, snapshot.ask, snapshot.last
    );
    Ok(snapshot)
}
