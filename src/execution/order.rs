//! Order tickets and the submit/poll execution state machine
//!
//! `Submitted -> (Filled | Rejected | Cancelled) | TimedOut`. The submit path
//! places the order, then cooperatively polls the broker-reported state on a
//! fixed interval against a timeout budget, and emits exactly one
//! [`TradeOutcome`] per ticket.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::broker::api::{BrokerApi, BrokerOrderStatus};
use crate::instruments::ResolvedContract;
use crate::market::fetch_snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn action(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderKind {
    Market,
    Limit(f64),
}

/// Side/quantity/kind specification submitted for execution.
/// Submitted once; immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTicket {
    pub side: OrderSide,
    /// Always positive; direction is carried by `side`.
    pub quantity: u32,
    pub kind: OrderKind,
}

impl OrderTicket {
    pub fn market(side: OrderSide, quantity: u32) -> Self {
        Self {
            side,
            quantity,
            kind: OrderKind::Market,
        }
    }

    pub fn limit(side: OrderSide, quantity: u32, price: f64) -> Self {
        Self {
            side,
            quantity,
            kind: OrderKind::Limit(price),
        }
    }
}

/// Terminal result of one execution attempt. Produced exactly once per
/// ticket, at terminal state or timeout.
#[derive(Debug, Clone, Serialize)]
pub struct TradeOutcome {
    pub success: bool,
    pub message: String,
    pub order_id: Option<i64>,
    pub filled_quantity: Option<u32>,
    pub average_price: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn filled(message: String, order_id: i64, filled: u32, avg_price: f64) -> Self {
        Self {
            success: true,
            message,
            order_id: Some(order_id),
            filled_quantity: Some(filled),
            average_price: Some(avg_price),
            timestamp: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            order_id: None,
            filled_quantity: None,
            average_price: None,
            timestamp: Utc::now(),
        }
    }

    /// Failure carrying the broker order id so the caller can reconcile
    /// manually.
    pub fn failed_with_order(message: impl Into<String>, order_id: i64) -> Self {
        Self {
            order_id: Some(order_id),
            ..Self::failed(message)
        }
    }
}

/// Execution tuning. The poll interval and timeout budget are configuration,
/// not magic constants.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionConfig {
    pub poll_interval: Duration,
    pub fill_timeout: Duration,
    /// Settling window for one-shot market-data snapshots.
    pub snapshot_settle: Duration,
    /// When true, a timed-out order is actively cancelled at the broker
    /// before the failure outcome is reported. When false (the default) the
    /// order may still fill asynchronously after the caller has already seen
    /// a timeout failure; the outcome carries the order id for manual
    /// reconciliation.
    pub cancel_on_timeout: bool,
    /// Default limit pricing is aggressive: ask to buy, bid to sell.
    /// Passive pricing inverts that.
    pub passive_limit_pricing: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            fill_timeout: Duration::from_secs(30),
            snapshot_settle: Duration::from_secs(1),
            cancel_on_timeout: false,
            passive_limit_pricing: false,
        }
    }
}

/// Submits tickets and drives them to a terminal outcome.
pub struct OrderEngine {
    gateway: Arc<dyn BrokerApi>,
    config: ExecutionConfig,
}

impl OrderEngine {
    pub fn new(gateway: Arc<dyn BrokerApi>, config: ExecutionConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Resolves the price for a limit ticket. An explicit caller price wins;
    /// otherwise a one-shot snapshot supplies the side price. Absence of the
    /// required side is a hard error.
    pub async fn limit_price(
        &self,
        contract: &ResolvedContract,
        side: OrderSide,
        explicit: Option<f64>,
    ) -> Result<f64> {
        if let Some(price) = explicit {
            return Ok(price);
        }
        let snapshot = fetch_snapshot(
            self.gateway.as_ref(),
            contract,
            self.config.snapshot_settle,
        )
        .await?;
        let price = match (side, self.config.passive_limit_pricing) {
            (OrderSide::Buy, false) | (OrderSide::Sell, true) => snapshot.ask,
            (OrderSide::Sell, false) | (OrderSide::Buy, true) => snapshot.bid,
        };
        match price {
            Some(price) => {
                info!(
                    "Using {} price for {}: ${}",
                    if matches!(
                        (side, self.config.passive_limit_pricing),
                        (OrderSide::Buy, false) | (OrderSide::Sell, true)
                    ) {
                        "ask"
                    } else {
                        "bid"
                    },
                    side.action(),
                    price
                );
                Ok(price)
            }
            None => bail!("Could not get market price"),
        }
    }

    /// Places the ticket and polls until a terminal state or the timeout
    /// budget is exhausted. Never returns an error: every failure mode maps
    /// to an unsuccessful [`TradeOutcome`].
    pub async fn submit(&self, contract: &ResolvedContract, ticket: OrderTicket) -> TradeOutcome {
        match ticket.kind {
            OrderKind::Market => info!(
                "Placing {} market order for {} {}",
                ticket.side.action(),
                ticket.quantity,
                contract.label()
            ),
            OrderKind::Limit(price) => info!(
                "Placing {} limit order for {} {} at ${}",
                ticket.side.action(),
                ticket.quantity,
                contract.label(),
                price
            ),
        }

        let order_id = match self.gateway.place_order(contract, &ticket).await {
            Ok(id) => id,
            Err(e) => {
                let message = format!("Order submission failed: {e}");
                error!("{message}");
                return TradeOutcome::failed(message);
            }
        };

        let mut waited = Duration::ZERO;
        loop {
            let state = match self.gateway.order_state(order_id).await {
                Ok(state) => state,
                Err(e) => {
                    let message = format!("Lost track of order {order_id}: {e}");
                    error!("{message}");
                    return TradeOutcome::failed_with_order(message, order_id);
                }
            };

            match state.status {
                BrokerOrderStatus::Filled => {
                    let verb = match ticket.side {
                        OrderSide::Buy => "bought",
                        OrderSide::Sell => "sold",
                    };
                    let message = format!(
                        "Successfully {verb} {} {} at ${}",
                        state.filled,
                        contract.symbol,
                        state.avg_fill_price
                    );
                    info!("✅ Order {order_id} filled: {} at ${}", state.filled, state.avg_fill_price);
                    return TradeOutcome::filled(message, order_id, state.filled, state.avg_fill_price);
                }
                BrokerOrderStatus::Rejected | BrokerOrderStatus::Cancelled => {
                    let message = format!("Order not filled: {}", state.status);
                    error!("{message} (order {order_id})");
                    return TradeOutcome::failed_with_order(message, order_id);
                }
                BrokerOrderStatus::PendingSubmit | BrokerOrderStatus::Submitted => {}
            }

            if waited >= self.config.fill_timeout {
                if self.config.cancel_on_timeout {
                    warn!("Order {order_id} timed out, requesting cancel");
                    if let Err(e) = self.gateway.cancel_order(order_id).await {
                        error!("Cancel request for order {order_id} failed: {e}");
                    }
                } else {
                    warn!("Order {order_id} timed out; left working for manual reconciliation");
                }
                return TradeOutcome::failed_with_order(
                    format!(
                        "Order timed out after {}s",
                        self.config.fill_timeout.as_secs()
                    ),
                    order_id,
                );
            }

            tokio::time::sleep(self.config.poll_interval).await;
            waited += self.config.poll_interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::{FillBehavior, PaperGateway};
    use crate::instruments::InstrumentDescriptor;

    fn es_descriptor() -> InstrumentDescriptor {
        InstrumentDescriptor::future("ES", "20251219", "CME", "USD")
    }

    fn test_config() -> ExecutionConfig {
        ExecutionConfig {
            snapshot_settle: Duration::from_millis(1),
            ..ExecutionConfig::default()
        }
    }

    async fn connected_gateway() -> (Arc<PaperGateway>, ResolvedContract) {
        let gateway = Arc::new(
            PaperGateway::new()
                .with_instrument(&es_descriptor(), 1, "ESZ5")
                .with_ticker(1, 4499.0, 4500.25, 4499.75),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let contract = gateway.qualify(&es_descriptor()).await.unwrap().remove(0);
        (gateway, contract)
    }

    #[tokio::test]
    async fn market_order_fills_with_quantity_and_vwap() {
        let (gateway, contract) = connected_gateway().await;
        let engine = OrderEngine::new(gateway.clone(), test_config());

        let outcome = engine
            .submit(&contract, OrderTicket::market(OrderSide::Buy, 3))
            .await;

        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.filled_quantity, Some(3));
        assert_eq!(outcome.average_price, Some(4499.75));
        assert!(outcome.order_id.is_some());
    }

    #[tokio::test]
    async fn rejected_order_reports_failure_with_order_id() {
        let (gateway, contract) = connected_gateway().await;
        gateway.set_fill_behavior(FillBehavior::Reject);
        let engine = OrderEngine::new(gateway, test_config());

        let outcome = engine
            .submit(&contract, OrderTicket::market(OrderSide::Sell, 2))
            .await;

        assert!(!outcome.success);
        assert!(outcome.message.contains("Rejected"));
        assert!(outcome.order_id.is_some());
        assert_eq!(outcome.filled_quantity, None);
    }

    #[tokio::test]
    async fn fill_after_polls_is_awaited() {
        let (gateway, contract) = connected_gateway().await;
        gateway.set_fill_behavior(FillBehavior::AfterPolls(5));
        let engine = OrderEngine::new(gateway, test_config());

        let outcome = engine
            .submit(&contract, OrderTicket::market(OrderSide::Buy, 1))
            .await;

        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.filled_quantity, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bound_is_timeout_plus_one_poll() {
        let (gateway, contract) = connected_gateway().await;
        gateway.set_fill_behavior(FillBehavior::Never);
        let config = ExecutionConfig {
            fill_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            ..test_config()
        };
        let engine = OrderEngine::new(gateway, config);

        let started = tokio::time::Instant::now();
        let outcome = engine
            .submit(&contract, OrderTicket::market(OrderSide::Buy, 1))
            .await;
        let elapsed = started.elapsed();

        assert!(!outcome.success);
        assert!(outcome.message.contains("timed out"));
        assert!(outcome.order_id.is_some());
        assert!(
            elapsed <= Duration::from_secs(30) + Duration::from_millis(100),
            "took {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_on_timeout_issues_broker_cancel() {
        let (gateway, contract) = connected_gateway().await;
        gateway.set_fill_behavior(FillBehavior::Never);
        let config = ExecutionConfig {
            fill_timeout: Duration::from_secs(1),
            cancel_on_timeout: true,
            ..test_config()
        };
        let engine = OrderEngine::new(gateway.clone(), config);

        let outcome = engine
            .submit(&contract, OrderTicket::market(OrderSide::Buy, 1))
            .await;

        assert!(!outcome.success);
        let cancelled = gateway.cancelled_orders();
        assert_eq!(cancelled, vec![outcome.order_id.unwrap()]);
    }

    #[tokio::test]
    async fn limit_price_takes_ask_to_buy_and_bid_to_sell() {
        let (gateway, contract) = connected_gateway().await;
        let engine = OrderEngine::new(gateway, test_config());

        let buy = engine.limit_price(&contract, OrderSide::Buy, None).await.unwrap();
        let sell = engine.limit_price(&contract, OrderSide::Sell, None).await.unwrap();
        assert_eq!(buy, 4500.25);
        assert_eq!(sell, 4499.0);
    }

    #[tokio::test]
    async fn passive_pricing_inverts_the_side() {
        let (gateway, contract) = connected_gateway().await;
        let config = ExecutionConfig {
            passive_limit_pricing: true,
            ..test_config()
        };
        let engine = OrderEngine::new(gateway, config);

        let buy = engine.limit_price(&contract, OrderSide::Buy, None).await.unwrap();
        assert_eq!(buy, 4499.0);
    }

    #[tokio::test]
    async fn explicit_price_skips_the_snapshot() {
        let (gateway, contract) = connected_gateway().await;
        let engine = OrderEngine::new(gateway.clone(), test_config());

        let price = engine
            .limit_price(&contract, OrderSide::Buy, Some(4444.5))
            .await
            .unwrap();
        assert_eq!(price, 4444.5);
        assert_eq!(gateway.subscriptions_opened(), 0);
    }

    #[tokio::test]
    async fn missing_side_price_is_a_hard_error() {
        let gateway = Arc::new(
            PaperGateway::new()
                .with_instrument(&es_descriptor(), 1, "ESZ5")
                .with_ticker(1, 0.0, 0.0, 4499.75),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let contract = gateway.qualify(&es_descriptor()).await.unwrap().remove(0);
        let engine = OrderEngine::new(gateway, test_config());

        let err = engine
            .limit_price(&contract, OrderSide::Buy, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not get market price"));
    }
}
