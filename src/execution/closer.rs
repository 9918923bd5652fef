//! Position reconciliation and closing
//!
//! Enumerates open positions for an instrument family, nets each one with a
//! single offsetting order, and aggregates the results. Closing is strictly
//! sequential within one engine: each offsetting order is awaited to a
//! terminal state before the next position is touched.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use super::order::{OrderEngine, OrderSide, OrderTicket, TradeOutcome};
use crate::broker::api::{BrokerApi, BrokerError, PortfolioItem};
use crate::instruments::ResolvedContract;

/// How offsetting orders are priced.
#[derive(Debug, Clone, Copy)]
pub enum CloseMode {
    Market,
    /// Limit orders; `None` delegates pricing to the snapshot rule.
    Limit(Option<f64>),
}

/// One position's closing attempt.
#[derive(Debug, Clone, Serialize)]
pub struct CloseAction {
    pub action: &'static str,
    pub symbol: String,
    pub quantity: u32,
    pub outcome: TradeOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseReport {
    pub message: String,
    /// Sum of filled quantities across successful offsetting orders.
    pub closed_quantity: u32,
    pub results: Vec<CloseAction>,
}

impl CloseReport {
    fn nothing_to_close() -> Self {
        Self {
            message: "No positions to close".to_string(),
            closed_quantity: 0,
            results: Vec::new(),
        }
    }
}

pub struct PositionCloser {
    gateway: Arc<dyn BrokerApi>,
    engine: OrderEngine,
    fallback_exchange: String,
}

impl PositionCloser {
    pub fn new(gateway: Arc<dyn BrokerApi>, engine: OrderEngine, fallback_exchange: &str) -> Self {
        Self {
            gateway,
            engine,
            fallback_exchange: fallback_exchange.to_string(),
        }
    }

    /// Non-zero positions for the family. The richer portfolio view is
    /// preferred; the plain positions view is consulted only when the
    /// portfolio view has nothing for the family. The broker-reported net
    /// quantity is ground truth; nothing here sums local counters.
    pub(crate) async fn family_positions(
        &self,
        family: &(dyn Fn(&ResolvedContract) -> bool + Send + Sync),
    ) -> Result<Vec<PortfolioItem>, BrokerError> {
        let rich = self.gateway.portfolio().await?;
        info!("Portfolio items count: {}", rich.len());
        let mut found: Vec<PortfolioItem> = rich
            .into_iter()
            .filter(|item| item.quantity != 0 && family(&item.contract))
            .collect();
        if found.is_empty() {
            info!("No family positions in portfolio view, checking positions view...");
            let plain = self.gateway.positions().await?;
            found = plain
                .into_iter()
                .filter(|item| item.quantity != 0 && family(&item.contract))
                .collect();
        }
        Ok(found)
    }

    /// Closes every non-zero position in the family. Position query errors
    /// propagate so the caller can fall back to [`Self::force_close`]; a
    /// single position's failed offsetting order is recorded and the batch
    /// continues.
    pub async fn close_positions(
        &self,
        family: &(dyn Fn(&ResolvedContract) -> bool + Send + Sync),
        mode: CloseMode,
    ) -> Result<CloseReport, BrokerError> {
        info!("Starting close-positions run...");
        let positions = self.family_positions(family).await?;
        if positions.is_empty() {
            info!("No positions found - nothing to close");
            return Ok(CloseReport::nothing_to_close());
        }
        Ok(self.flatten(positions, mode).await)
    }

    /// Safety-net path: flattens every non-zero position the portfolio view
    /// reports, defaulting missing venues. Never errors; a failed query is
    /// reported in the message. `family` scopes the flatten to this desk's
    /// instruments; `None` flattens across families.
    pub async fn force_close(
        &self,
        family: Option<&(dyn Fn(&ResolvedContract) -> bool + Send + Sync)>,
    ) -> CloseReport {
        warn!("Starting FORCE close run...");
        let items = match self.gateway.portfolio().await {
            Ok(items) => items,
            Err(e) => {
                error!("Force close could not read portfolio: {e}");
                return CloseReport {
                    message: format!("Force close failed: {e}"),
                    closed_quantity: 0,
                    results: Vec::new(),
                };
            }
        };
        let positions: Vec<PortfolioItem> = items
            .into_iter()
            .filter(|item| item.quantity != 0 && family.map_or(true, |f| f(&item.contract)))
            .collect();
        if positions.is_empty() {
            info!("No non-zero positions found");
            return CloseReport::nothing_to_close();
        }
        self.flatten(positions, CloseMode::Market).await
    }

    async fn flatten(&self, positions: Vec<PortfolioItem>, mode: CloseMode) -> CloseReport {
        let total = positions.len();
        info!("Found {total} positions to close");
        let mut results = Vec::with_capacity(total);
        let mut closed: u32 = 0;

        for (index, position) in positions.into_iter().enumerate() {
            info!(
                "Processing position {}/{}: {} {}",
                index + 1,
                total,
                position.contract.symbol,
                position.quantity
            );

            let mut contract = position.contract.clone();
            if contract.ensure_exchange(&self.fallback_exchange) {
                info!(
                    "Set exchange to {} for contract {}",
                    self.fallback_exchange, contract.symbol
                );
            }

            // Netting: one offsetting order per position, sized by the
            // broker-reported net quantity.
            let (side, action, quantity) = if position.quantity > 0 {
                (OrderSide::Sell, "SELL", position.quantity as u32)
            } else {
                (OrderSide::Buy, "BUY_TO_CLOSE", position.quantity.unsigned_abs() as u32)
            };

            let ticket = match mode {
                CloseMode::Market => OrderTicket::market(side, quantity),
                CloseMode::Limit(explicit) => {
                    match self.engine.limit_price(&contract, side, explicit).await {
                        Ok(price) => OrderTicket::limit(side, quantity, price),
                        Err(e) => {
                            error!(
                                "Could not price offsetting order for {}: {e}",
                                contract.symbol
                            );
                            results.push(CloseAction {
                                action,
                                symbol: contract.symbol.clone(),
                                quantity,
                                outcome: TradeOutcome::failed(e.to_string()),
                            });
                            continue;
                        }
                    }
                }
            };

            let outcome = self.engine.submit(&contract, ticket).await;
            if outcome.success {
                closed += outcome.filled_quantity.unwrap_or(0);
                info!(
                    "✅ Closed position: {} {} {}",
                    action,
                    outcome.filled_quantity.unwrap_or(0),
                    contract.symbol
                );
            } else {
                // The position stays open; continue with the rest of the batch.
                error!("Failed to close {} position: {}", contract.symbol, outcome.message);
            }
            results.push(CloseAction {
                action,
                symbol: contract.symbol.clone(),
                quantity,
                outcome,
            });
        }

        info!("Close run complete: {closed} contracts closed across {total} positions");
        CloseReport {
            message: format!("Successfully closed {closed} contracts"),
            closed_quantity: closed,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::{FillBehavior, PaperGateway};
    use crate::execution::order::{ExecutionConfig, OrderKind};
    use crate::instruments::InstrumentDescriptor;

    fn es_contract(id: i32) -> ResolvedContract {
        let descriptor = InstrumentDescriptor::future("ES", "20251219", "CME", "USD");
        ResolvedContract::from_descriptor(&descriptor, id, "ESZ5")
    }

    fn is_es(contract: &ResolvedContract) -> bool {
        contract.symbol == "ES"
    }

    fn closer_for(gateway: Arc<PaperGateway>) -> PositionCloser {
        let config = ExecutionConfig {
            snapshot_settle: std::time::Duration::from_millis(1),
            ..ExecutionConfig::default()
        };
        let engine = OrderEngine::new(gateway.clone(), config);
        PositionCloser::new(gateway, engine, "CME")
    }

    #[tokio::test]
    async fn flat_book_closes_nothing_and_is_not_an_error() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let closer = closer_for(gateway.clone());

        let report = closer
            .close_positions(&is_es, CloseMode::Market)
            .await
            .unwrap();
        assert_eq!(report.closed_quantity, 0);
        assert_eq!(report.message, "No positions to close");
        assert!(gateway.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn long_position_nets_with_one_market_sell() {
        let contract = es_contract(1);
        let gateway = Arc::new(
            PaperGateway::new()
                .with_ticker(1, 4499.0, 4500.25, 4499.75)
                .with_position(&contract, 5, 4480.0),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let closer = closer_for(gateway.clone());

        let report = closer
            .close_positions(&is_es, CloseMode::Market)
            .await
            .unwrap();

        let orders = gateway.placed_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].quantity, 5);
        assert_eq!(orders[0].kind, OrderKind::Market);
        assert_eq!(report.closed_quantity, 5);
        assert_eq!(gateway.net_quantity(1), 0);
    }

    #[tokio::test]
    async fn short_position_nets_with_one_market_buy() {
        let contract = es_contract(1);
        let gateway = Arc::new(
            PaperGateway::new()
                .with_ticker(1, 4499.0, 4500.25, 4499.75)
                .with_position(&contract, -5, 4480.0),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let closer = closer_for(gateway.clone());

        let report = closer
            .close_positions(&is_es, CloseMode::Market)
            .await
            .unwrap();

        let orders = gateway.placed_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].quantity, 5);
        assert_eq!(report.closed_quantity, 5);
        assert_eq!(gateway.net_quantity(1), 0);
    }

    #[tokio::test]
    async fn one_failed_close_does_not_abort_the_batch() {
        let es = es_contract(1);
        let nq_descriptor = InstrumentDescriptor::future("NQ", "20251219", "CME", "USD");
        let nq = ResolvedContract::from_descriptor(&nq_descriptor, 2, "NQZ5");
        let gateway = Arc::new(
            PaperGateway::new()
                .with_ticker(1, 4499.0, 4500.25, 4499.75)
                .with_ticker(2, 16_000.0, 16_001.0, 16_000.5)
                .with_position(&es, 2, 4480.0)
                .with_position(&nq, 3, 15_900.0),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        gateway.script_fills(vec![FillBehavior::Reject, FillBehavior::Immediate]);
        let closer = closer_for(gateway.clone());

        let report = closer
            .close_positions(&|_| true, CloseMode::Market)
            .await
            .unwrap();

        assert_eq!(report.results.len(), 2);
        assert!(!report.results[0].outcome.success);
        assert!(report.results[1].outcome.success);
        assert_eq!(report.closed_quantity, 3);
    }

    #[tokio::test]
    async fn family_filter_skips_other_instruments() {
        let es = es_contract(1);
        let spy_descriptor = InstrumentDescriptor::equity("SPY", "SMART", "USD");
        let spy = ResolvedContract::from_descriptor(&spy_descriptor, 9, "SPY");
        let gateway = Arc::new(
            PaperGateway::new()
                .with_ticker(1, 4499.0, 4500.25, 4499.75)
                .with_position(&es, 2, 4480.0)
                .with_position(&spy, 100, 550.0),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let closer = closer_for(gateway.clone());

        closer
            .close_positions(&is_es, CloseMode::Market)
            .await
            .unwrap();

        let orders = gateway.placed_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].contract.symbol, "ES");
        assert_eq!(gateway.net_quantity(9), 100);
    }

    #[tokio::test]
    async fn positions_view_backs_up_an_empty_portfolio_view() {
        // PaperGateway serves both views from one book, so an empty portfolio
        // with a populated positions view can't be scripted directly; what
        // matters is that the plain view's zeroed valuation fields still net
        // correctly.
        let contract = es_contract(1);
        let gateway = Arc::new(
            PaperGateway::new()
                .with_ticker(1, 4499.0, 4500.25, 4499.75)
                .with_position(&contract, 4, 4480.0),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let plain = gateway.positions().await.unwrap();
        assert_eq!(plain[0].market_value, 0.0);

        let closer = closer_for(gateway.clone());
        let report = closer.flatten(plain, CloseMode::Market).await;
        assert_eq!(report.closed_quantity, 4);
    }

    #[tokio::test]
    async fn force_close_defaults_missing_venue() {
        let descriptor = InstrumentDescriptor::future("ES", "20251219", "", "USD");
        let contract = ResolvedContract::from_descriptor(&descriptor, 1, "ESZ5");
        let gateway = Arc::new(
            PaperGateway::new()
                .with_ticker(1, 4499.0, 4500.25, 4499.75)
                .with_position(&contract, 1, 4480.0),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let closer = closer_for(gateway.clone());

        let report = closer.force_close(None).await;
        assert_eq!(report.closed_quantity, 1);
        let orders = gateway.placed_orders();
        assert_eq!(orders[0].contract.exchange, "CME");
    }

    #[tokio::test]
    async fn force_close_can_be_scoped_to_a_family() {
        let es = es_contract(1);
        let spy_descriptor = InstrumentDescriptor::equity("SPY", "SMART", "USD");
        let spy = ResolvedContract::from_descriptor(&spy_descriptor, 9, "SPY");
        let gateway = Arc::new(
            PaperGateway::new()
                .with_ticker(1, 4499.0, 4500.25, 4499.75)
                .with_position(&es, 2, 4480.0)
                .with_position(&spy, 100, 550.0),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let closer = closer_for(gateway.clone());

        let family: &(dyn Fn(&ResolvedContract) -> bool + Send + Sync) = &is_es;
        let report = closer.force_close(Some(family)).await;
        assert_eq!(report.closed_quantity, 2);
        assert_eq!(gateway.net_quantity(9), 100);
    }

    #[tokio::test]
    async fn limit_mode_prices_from_the_snapshot() {
        let contract = es_contract(1);
        let gateway = Arc::new(
            PaperGateway::new()
                .with_ticker(1, 4499.0, 4500.25, 4499.75)
                .with_position(&contract, 2, 4480.0),
        );
        gateway.connect("127.0.0.1", 7497, 1).await.unwrap();
        let closer = closer_for(gateway.clone());

        let report = closer
            .close_positions(&is_es, CloseMode::Limit(None))
            .await
            .unwrap();
        assert_eq!(report.closed_quantity, 2);
        let orders = gateway.placed_orders();
        // Long position closes with a sell at the bid.
        assert_eq!(orders[0].kind, OrderKind::Limit(4499.0));
    }
}
