//! Per-asset-class trading desks
//!
//! One generic [`TradingDesk`] implements the buy/sell/close surface; the
//! per-asset-class differences (contract template, family membership,
//! default size) live behind the small [`InstrumentProfile`] capability
//! trait, so the ordering and closing logic exists exactly once.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::broker::api::{BrokerApi, BrokerError};
use crate::broker::session::BrokerSession;
use crate::config::{EquityConfig, FuturesConfig, OptionConfig};
use crate::execution::closer::{CloseMode, CloseReport, PositionCloser};
use crate::execution::order::{ExecutionConfig, OrderEngine, OrderSide, OrderTicket, TradeOutcome};
use crate::instruments::{
    load_watchlist, ContractResolver, InstrumentDescriptor, ResolvedContract, SecurityKind,
};
use crate::market::{fetch_snapshot, MarketSnapshot};
use crate::models::{AccountSummary, Position};

/// Asset-class capabilities a desk is parameterized by.
pub trait InstrumentProfile: Send + Sync {
    fn label(&self) -> &'static str;

    /// Broad search template covering every listed contract of the family.
    fn family(&self) -> InstrumentDescriptor;

    /// Candidate contracts in preference order; the first that qualifies
    /// becomes the desk's primary contract.
    fn watchlist(&self) -> Vec<InstrumentDescriptor>;

    /// Family membership test used to scope position queries and closes.
    fn family_matches(&self, contract: &ResolvedContract) -> bool;

    fn default_quantity(&self) -> u32;

    fn fallback_exchange(&self) -> &str;
}

/// Index-future desk profile. Consults the persisted watchlist file in
/// place of the static default descriptor when one is present.
pub struct FuturesProfile {
    config: FuturesConfig,
    watchlist: Vec<InstrumentDescriptor>,
}

impl FuturesProfile {
    pub fn from_config(config: &FuturesConfig) -> Self {
        let default = InstrumentDescriptor::future(
            &config.symbol,
            &config.expiry,
            &config.exchange,
            &config.currency,
        );
        let watchlist = match load_watchlist(Path::new(&config.watchlist_file)) {
            Ok(list) if !list.is_empty() => {
                info!("Loaded {} selected contracts", list.len());
                list
            }
            Ok(_) => {
                info!(
                    "Watchlist {} is empty, using default contract",
                    config.watchlist_file
                );
                vec![default]
            }
            Err(e) => {
                info!("No watchlist loaded ({e:#}), using default contract");
                vec![default]
            }
        };
        Self {
            config: config.clone(),
            watchlist,
        }
    }
}

impl InstrumentProfile for FuturesProfile {
    fn label(&self) -> &'static str {
        "futures"
    }

    fn family(&self) -> InstrumentDescriptor {
        InstrumentDescriptor::future_family(
            &self.config.symbol,
            &self.config.exchange,
            &self.config.currency,
        )
    }

    fn watchlist(&self) -> Vec<InstrumentDescriptor> {
        self.watchlist.clone()
    }

    fn family_matches(&self, contract: &ResolvedContract) -> bool {
        contract.kind == SecurityKind::Future && contract.symbol == self.config.symbol
    }

    fn default_quantity(&self) -> u32 {
        self.config.quantity
    }

    fn fallback_exchange(&self) -> &str {
        &self.config.exchange
    }
}

/// Index-option desk profile: one fixed expiry/strike/right contract.
pub struct IndexOptionProfile {
    config: OptionConfig,
}

impl IndexOptionProfile {
    pub fn from_config(config: &OptionConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn descriptor(&self) -> InstrumentDescriptor {
        InstrumentDescriptor::index_option(
            &self.config.symbol,
            &self.config.expiry,
            self.config.strike,
            self.config.right,
            &self.config.exchange,
            &self.config.currency,
            &self.config.trading_class,
        )
    }
}

impl InstrumentProfile for IndexOptionProfile {
    fn label(&self) -> &'static str {
        "options"
    }

    fn family(&self) -> InstrumentDescriptor {
        InstrumentDescriptor {
            expiry: None,
            strike: None,
            right: None,
            ..self.descriptor()
        }
    }

    fn watchlist(&self) -> Vec<InstrumentDescriptor> {
        vec![self.descriptor()]
    }

    fn family_matches(&self, contract: &ResolvedContract) -> bool {
        contract.kind == SecurityKind::IndexOption && contract.symbol == self.config.symbol
    }

    fn default_quantity(&self) -> u32 {
        self.config.quantity
    }

    fn fallback_exchange(&self) -> &str {
        &self.config.exchange
    }
}

/// Equity ETF desk profile.
pub struct EquityProfile {
    config: EquityConfig,
}

impl EquityProfile {
    pub fn from_config(config: &EquityConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn descriptor(&self) -> InstrumentDescriptor {
        InstrumentDescriptor::equity(&self.config.symbol, &self.config.exchange, &self.config.currency)
    }
}

impl InstrumentProfile for EquityProfile {
    fn label(&self) -> &'static str {
        "equity"
    }

    fn family(&self) -> InstrumentDescriptor {
        self.descriptor()
    }

    fn watchlist(&self) -> Vec<InstrumentDescriptor> {
        vec![self.descriptor()]
    }

    fn family_matches(&self, contract: &ResolvedContract) -> bool {
        contract.kind == SecurityKind::Equity && contract.symbol == self.config.symbol
    }

    fn default_quantity(&self) -> u32 {
        self.config.quantity
    }

    fn fallback_exchange(&self) -> &str {
        &self.config.exchange
    }
}

/// Connection settings for one desk.
#[derive(Debug, Clone)]
pub struct DeskSettings {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub account_id: String,
    pub execution: ExecutionConfig,
    pub force_close_all_families: bool,
}

struct CachedContract {
    contract: ResolvedContract,
    epoch: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeskStatus {
    pub desk: &'static str,
    pub connected: bool,
    pub contract: Option<ResolvedContract>,
    pub default_quantity: u32,
}

/// One per asset class. Owns its broker session, resolver, execution engine
/// and closing engine; exposes the buy/sell/close surface the webhook layer
/// calls into. Every operation returns a result value; failures never
/// propagate past this boundary.
pub struct TradingDesk {
    profile: Box<dyn InstrumentProfile>,
    session: BrokerSession,
    resolver: ContractResolver,
    engine: OrderEngine,
    closer: PositionCloser,
    account_id: String,
    force_close_all_families: bool,
    contract: tokio::sync::RwLock<Option<CachedContract>>,
    snapshot_settle: std::time::Duration,
}

impl TradingDesk {
    /// Connects the desk's session and resolves its primary contract.
    /// Either step failing is fatal to startup.
    pub async fn connect(
        profile: Box<dyn InstrumentProfile>,
        gateway: Arc<dyn BrokerApi>,
        settings: DeskSettings,
    ) -> Result<Self> {
        info!("⚡ Initializing {} desk", profile.label());
        let session = BrokerSession::new(
            Arc::clone(&gateway),
            &settings.host,
            settings.port,
            settings.client_id,
        );
        session.connect().await?;

        let resolver = ContractResolver::new(Arc::clone(&gateway), profile.fallback_exchange());
        let engine = OrderEngine::new(Arc::clone(&gateway), settings.execution);
        let closer = PositionCloser::new(
            Arc::clone(&gateway),
            OrderEngine::new(Arc::clone(&gateway), settings.execution),
            profile.fallback_exchange(),
        );

        let desk = Self {
            profile,
            session,
            resolver,
            engine,
            closer,
            account_id: settings.account_id,
            force_close_all_families: settings.force_close_all_families,
            contract: tokio::sync::RwLock::new(None),
            snapshot_settle: settings.execution.snapshot_settle,
        };
        let primary = desk.primary_contract().await?;
        info!("✅ {} desk ready, primary contract {}", desk.profile.label(), primary.label());
        Ok(desk)
    }

    pub fn label(&self) -> &'static str {
        self.profile.label()
    }

    pub async fn is_connected(&self) -> bool {
        self.session.is_connected().await
    }

    /// Reconnects the session. The cached contract handle is implicitly
    /// invalidated: the next operation re-resolves under the new epoch.
    pub async fn reconnect(&self) -> Result<(), BrokerError> {
        self.session.connect().await
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// The desk's resolved primary contract. Cached after the first
    /// resolution; re-resolved when the session epoch has moved.
    async fn primary_contract(&self) -> Result<ResolvedContract> {
        let epoch = self.session.epoch();
        {
            let cached = self.contract.read().await;
            if let Some(c) = cached.as_ref() {
                if c.epoch == epoch {
                    return Ok(c.contract.clone());
                }
            }
        }
        let resolved = self
            .resolver
            .resolve_primary(&self.profile.watchlist(), &self.profile.family())
            .await?;
        *self.contract.write().await = Some(CachedContract {
            contract: resolved.clone(),
            epoch,
        });
        Ok(resolved)
    }

    pub async fn buy(&self, quantity: Option<u32>) -> TradeOutcome {
        self.market_order(OrderSide::Buy, quantity).await
    }

    pub async fn sell(&self, quantity: Option<u32>) -> TradeOutcome {
        self.market_order(OrderSide::Sell, quantity).await
    }

    pub async fn buy_limit(&self, quantity: Option<u32>, price: Option<f64>) -> TradeOutcome {
        self.limit_order(OrderSide::Buy, quantity, price).await
    }

    pub async fn sell_limit(&self, quantity: Option<u32>, price: Option<f64>) -> TradeOutcome {
        self.limit_order(OrderSide::Sell, quantity, price).await
    }

    async fn market_order(&self, side: OrderSide, quantity: Option<u32>) -> TradeOutcome {
        if !self.session.is_connected().await {
            return TradeOutcome::failed("Not connected to broker gateway");
        }
        let contract = match self.primary_contract().await {
            Ok(contract) => contract,
            Err(e) => return TradeOutcome::failed(format!("No contract available: {e:#}")),
        };
        let quantity = quantity.unwrap_or_else(|| self.profile.default_quantity());
        self.engine
            .submit(&contract, OrderTicket::market(side, quantity))
            .await
    }

    async fn limit_order(
        &self,
        side: OrderSide,
        quantity: Option<u32>,
        price: Option<f64>,
    ) -> TradeOutcome {
        if !self.session.is_connected().await {
            return TradeOutcome::failed("Not connected to broker gateway");
        }
        let contract = match self.primary_contract().await {
            Ok(contract) => contract,
            Err(e) => return TradeOutcome::failed(format!("No contract available: {e:#}")),
        };
        let price = match self.engine.limit_price(&contract, side, price).await {
            Ok(price) => price,
            Err(e) => return TradeOutcome::failed(format!("{e:#}")),
        };
        let quantity = quantity.unwrap_or_else(|| self.profile.default_quantity());
        self.engine
            .submit(&contract, OrderTicket::limit(side, quantity, price))
            .await
    }

    /// Flattens the desk's family at market. Falls back to the force-close
    /// safety net (invoked exactly once) when the filtered path errors,
    /// and the fallback's result is what the caller receives.
    pub async fn close_all(&self) -> CloseReport {
        self.close_with_mode(CloseMode::Market).await
    }

    /// Flattens with limit orders priced per the snapshot rule.
    pub async fn close_all_limit(&self, price: Option<f64>) -> CloseReport {
        self.close_with_mode(CloseMode::Limit(price)).await
    }

    async fn close_with_mode(&self, mode: CloseMode) -> CloseReport {
        let family = |contract: &ResolvedContract| self.profile.family_matches(contract);
        match self.closer.close_positions(&family, mode).await {
            Ok(report) => report,
            Err(e) => {
                error!("Close positions failed on {} desk: {e}", self.profile.label());
                warn!("Falling back to force close...");
                let scoped: Option<&(dyn Fn(&ResolvedContract) -> bool + Send + Sync)> =
                    if self.force_close_all_families {
                        None
                    } else {
                        Some(&family)
                    };
                self.closer.force_close(scoped).await
            }
        }
    }

    /// One-shot bid/ask/last for the primary contract.
    pub async fn snapshot(&self) -> Result<MarketSnapshot> {
        let contract = self.primary_contract().await?;
        let snapshot = fetch_snapshot(
            self.session.gateway().as_ref(),
            &contract,
            self.snapshot_settle,
        )
        .await?;
        Ok(snapshot)
    }

    /// Broker-reported positions for this desk's family.
    pub async fn positions(&self) -> Result<Vec<Position>> {
        let family = |contract: &ResolvedContract| self.profile.family_matches(contract);
        let items = self.closer.family_positions(&family).await?;
        Ok(items
            .into_iter()
            .map(|item| Position {
                symbol: item.contract.symbol,
                quantity: item.quantity,
                average_price: item.average_cost,
                market_value: item.market_value,
                unrealized_pnl: item.unrealized_pnl,
                realized_pnl: item.realized_pnl,
            })
            .collect())
    }

    pub async fn account_summary(&self) -> Result<AccountSummary> {
        let tags = self.session.gateway().account_summary().await?;
        Ok(AccountSummary::from_tags(&self.account_id, &tags))
    }

    pub async fn status(&self) -> DeskStatus {
        let contract = self.contract.read().await.as_ref().map(|c| c.contract.clone());
        DeskStatus {
            desk: self.profile.label(),
            connected: self.is_connected().await,
            contract,
            default_quantity: self.profile.default_quantity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperGateway;
    use crate::execution::order::OrderKind;
    use std::time::Duration;

    fn futures_config() -> FuturesConfig {
        FuturesConfig {
            symbol: "ES".to_string(),
            expiry: "20251219".to_string(),
            exchange: "CME".to_string(),
            currency: "USD".to_string(),
            quantity: 3,
            watchlist_file: "/nonexistent/selected_contracts.txt".to_string(),
        }
    }

    fn settings() -> DeskSettings {
        DeskSettings {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 1,
            account_id: "DU12345".to_string(),
            execution: ExecutionConfig {
                snapshot_settle: Duration::from_millis(1),
                ..ExecutionConfig::default()
            },
            force_close_all_families: false,
        }
    }

    fn seeded_gateway() -> Arc<PaperGateway> {
        let descriptor = InstrumentDescriptor::future("ES", "20251219", "CME", "USD");
        Arc::new(
            PaperGateway::new()
                .with_instrument(&descriptor, 1, "ESZ5")
                .with_ticker(1, 4499.0, 4500.25, 4499.75),
        )
    }

    async fn futures_desk(gateway: Arc<PaperGateway>) -> TradingDesk {
        TradingDesk::connect(
            Box::new(FuturesProfile::from_config(&futures_config())),
            gateway,
            settings(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn buy_defaults_to_profile_quantity() {
        let gateway = seeded_gateway();
        let desk = futures_desk(gateway.clone()).await;

        let outcome = desk.buy(None).await;
        assert!(outcome.success, "{}", outcome.message);
        let orders = gateway.placed_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quantity, 3);
        assert_eq!(orders[0].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn buy_limit_without_price_uses_the_ask() {
        let gateway = seeded_gateway();
        let desk = futures_desk(gateway.clone()).await;

        let outcome = desk.buy_limit(Some(3), None).await;
        assert!(outcome.success, "{}", outcome.message);
        let orders = gateway.placed_orders();
        assert_eq!(orders[0].kind, OrderKind::Limit(4500.25));
        assert_eq!(orders[0].quantity, 3);
    }

    #[tokio::test]
    async fn operations_fail_softly_when_disconnected() {
        let gateway = seeded_gateway();
        let desk = futures_desk(gateway).await;
        desk.disconnect().await;

        let outcome = desk.buy(None).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Not connected"));
    }

    #[tokio::test]
    async fn close_all_uses_broker_net_quantity_as_ground_truth() {
        let gateway = seeded_gateway();
        let desk = futures_desk(gateway.clone()).await;
        // The broker nets per instrument: +2 and -1 arrive as a single +1.
        desk.buy(Some(2)).await;
        desk.sell(Some(1)).await;
        assert_eq!(gateway.net_quantity(1), 1);

        let report = desk.close_all().await;
        assert_eq!(report.closed_quantity, 1);
        let closing_order = gateway.placed_orders().pop().unwrap();
        assert_eq!(closing_order.side, OrderSide::Sell);
        assert_eq!(closing_order.quantity, 1);
        assert_eq!(gateway.net_quantity(1), 0);
    }

    #[tokio::test]
    async fn close_all_on_flat_book_reports_nothing_to_close() {
        let gateway = seeded_gateway();
        let desk = futures_desk(gateway).await;

        let report = desk.close_all().await;
        assert_eq!(report.closed_quantity, 0);
        assert_eq!(report.message, "No positions to close");
    }

    #[tokio::test]
    async fn filtered_close_failure_invokes_force_close_once() {
        let gateway = seeded_gateway();
        let desk = futures_desk(gateway.clone()).await;
        desk.buy(Some(2)).await;
        // The first portfolio query fails; the force-close retry succeeds.
        gateway.fail_position_queries(1);

        let report = desk.close_all().await;
        assert_eq!(report.closed_quantity, 2);
        assert_eq!(gateway.net_quantity(1), 0);
        // One entry order plus exactly one offsetting order from the single
        // force-close pass.
        assert_eq!(gateway.placed_orders().len(), 2);
    }

    #[tokio::test]
    async fn close_runs_on_a_spawned_task() {
        let gateway = seeded_gateway();
        let desk = Arc::new(futures_desk(gateway.clone()).await);
        desk.buy(Some(2)).await;

        // Spawning moves the close future across threads, so the whole
        // closing workflow, family filter included, must be Send.
        let handle = tokio::spawn({
            let desk = Arc::clone(&desk);
            async move { desk.close_all().await }
        });
        let report = handle.await.unwrap();
        assert_eq!(report.closed_quantity, 2);
        assert_eq!(gateway.net_quantity(1), 0);
    }

    #[tokio::test]
    async fn reconnect_invalidates_the_cached_contract() {
        let gateway = seeded_gateway();
        let desk = futures_desk(gateway.clone()).await;
        let after_connect = gateway.qualify_calls();

        desk.buy(Some(1)).await;
        assert_eq!(gateway.qualify_calls(), after_connect);

        desk.reconnect().await.unwrap();
        desk.buy(Some(1)).await;
        assert!(gateway.qualify_calls() > after_connect);
    }

    #[tokio::test]
    async fn status_reports_contract_and_connection() {
        let gateway = seeded_gateway();
        let desk = futures_desk(gateway).await;
        let status = desk.status().await;
        assert_eq!(status.desk, "futures");
        assert!(status.connected);
        assert_eq!(status.contract.unwrap().symbol, "ES");
        assert_eq!(status.default_quantity, 3);
    }
}
