//! Request/response contract of the brokerage gateway

use async_trait::async_trait;
use thiserror::Error;

use crate::execution::order::OrderTicket;
use crate::instruments::{InstrumentDescriptor, ResolvedContract};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("not connected to broker gateway")]
    NotConnected,
    #[error("connection to {host}:{port} failed: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("gateway error: {0}")]
    Gateway(String),
}

/// Raw feed values as reported by the gateway. A non-positive value means
/// the side has not populated yet (or is unavailable).
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTicker {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
}

/// Broker-reported lifecycle state of a working order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOrderStatus {
    PendingSubmit,
    Submitted,
    Filled,
    Cancelled,
    Rejected,
}

impl BrokerOrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BrokerOrderStatus::Filled | BrokerOrderStatus::Cancelled | BrokerOrderStatus::Rejected
        )
    }
}

impl std::fmt::Display for BrokerOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BrokerOrderStatus::PendingSubmit => "PendingSubmit",
            BrokerOrderStatus::Submitted => "Submitted",
            BrokerOrderStatus::Filled => "Filled",
            BrokerOrderStatus::Cancelled => "Cancelled",
            BrokerOrderStatus::Rejected => "Rejected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct BrokerOrderState {
    pub status: BrokerOrderStatus,
    /// Cumulative filled quantity.
    pub filled: u32,
    /// Volume-weighted average fill price across partial fills.
    pub avg_fill_price: f64,
}

/// One line of the broker's portfolio/position report.
#[derive(Debug, Clone)]
pub struct PortfolioItem {
    pub contract: ResolvedContract,
    /// Signed net quantity: positive = long, negative = short.
    pub quantity: i64,
    pub average_cost: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
}

/// The gateway request/response contract.
///
/// Primitive operations only: the snapshot settling window, order polling
/// and position netting all live on this side of the boundary.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Establishes a session. Must be called before any other operation.
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<(), BrokerError>;

    /// Idempotent; safe to call on an unconnected session.
    async fn disconnect(&self);

    /// Live session health, not just "connect was called".
    async fn is_connected(&self) -> bool;

    /// Qualification round-trip: candidates matching the descriptor.
    async fn qualify(
        &self,
        descriptor: &InstrumentDescriptor,
    ) -> Result<Vec<ResolvedContract>, BrokerError>;

    async fn subscribe_market_data(&self, contract: &ResolvedContract)
        -> Result<u64, BrokerError>;

    async fn read_ticker(&self, subscription: u64) -> Result<RawTicker, BrokerError>;

    async fn cancel_market_data(&self, subscription: u64);

    /// Submits the order, returning the broker-assigned order id.
    async fn place_order(
        &self,
        contract: &ResolvedContract,
        ticket: &OrderTicket,
    ) -> Result<i64, BrokerError>;

    async fn order_state(&self, order_id: i64) -> Result<BrokerOrderState, BrokerError>;

    async fn cancel_order(&self, order_id: i64) -> Result<(), BrokerError>;

    /// Rich position view with valuation and P&L.
    async fn portfolio(&self) -> Result<Vec<PortfolioItem>, BrokerError>;

    /// Plain position view; quantity and cost only.
    async fn positions(&self) -> Result<Vec<PortfolioItem>, BrokerError>;

    /// Account figures as tag/value pairs.
    async fn account_summary(&self) -> Result<Vec<(String, f64)>, BrokerError>;
}
