//! In-process paper gateway
//!
//! Implements [`BrokerApi`] against an in-memory book with scripted fill
//! behavior. Backs paper-mode runtime and every scenario test: tests seed the
//! qualification table and ticker values, then script how orders and queries
//! behave.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::api::{
    BrokerApi, BrokerError, BrokerOrderState, BrokerOrderStatus, PortfolioItem, RawTicker,
};
use crate::execution::order::{OrderKind, OrderSide, OrderTicket};
use crate::instruments::{InstrumentDescriptor, ResolvedContract};

/// How the paper gateway completes placed orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillBehavior {
    /// Terminal `Filled` on the first state poll.
    Immediate,
    /// `Submitted` until the given number of state polls have elapsed.
    AfterPolls(u32),
    /// Terminal `Rejected` on the first state poll.
    Reject,
    /// Never reaches a terminal state; exercises the timeout path.
    Never,
}

#[derive(Debug)]
struct PaperOrder {
    contract: ResolvedContract,
    ticket: OrderTicket,
    behavior: FillBehavior,
    status: BrokerOrderStatus,
    filled: u32,
    avg_fill_price: f64,
    polls_remaining: u32,
    applied_to_book: bool,
}

#[derive(Default)]
struct PaperState {
    connected: bool,
    fail_connect: bool,
    instruments: Vec<ResolvedContract>,
    tickers: HashMap<i32, RawTicker>,
    fail_ticker_reads: bool,
    subscriptions: HashMap<u64, i32>,
    subscriptions_opened: u64,
    next_subscription: u64,
    orders: HashMap<i64, PaperOrder>,
    order_log: Vec<i64>,
    cancelled: Vec<i64>,
    next_order_id: i64,
    default_fill: Option<FillBehavior>,
    fill_script: Vec<FillBehavior>,
    book: Vec<PortfolioItem>,
    fail_position_queries: u32,
    account: Vec<(String, f64)>,
    qualify_calls: u64,
}

/// Order as the gateway saw it; used by tests to assert netting behavior.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: i64,
    pub contract: ResolvedContract,
    pub side: OrderSide,
    pub quantity: u32,
    pub kind: OrderKind,
}

pub struct PaperGateway {
    state: Mutex<PaperState>,
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                next_order_id: 1,
                next_subscription: 1,
                ..PaperState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        // Poison-tolerant: a panicking test thread must not wedge the rest.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a qualifiable instrument.
    pub fn with_instrument(
        self,
        descriptor: &InstrumentDescriptor,
        contract_id: i32,
        local_symbol: &str,
    ) -> Self {
        self.state().instruments.push(ResolvedContract::from_descriptor(
            descriptor,
            contract_id,
            local_symbol,
        ));
        self
    }

    pub fn with_ticker(self, contract_id: i32, bid: f64, ask: f64, last: f64) -> Self {
        self.state()
            .tickers
            .insert(contract_id, RawTicker { bid, ask, last });
        self
    }

    /// Seeds an existing position into the book.
    pub fn with_position(self, contract: &ResolvedContract, quantity: i64, average_cost: f64) -> Self {
        self.state().book.push(PortfolioItem {
            contract: contract.clone(),
            quantity,
            average_cost,
            market_value: quantity as f64 * average_cost,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
        });
        self
    }

    pub fn with_account_tag(self, tag: &str, value: f64) -> Self {
        self.state().account.push((tag.to_string(), value));
        self
    }

    pub fn failing_connect(self) -> Self {
        self.state().fail_connect = true;
        self
    }

    pub fn set_fill_behavior(&self, behavior: FillBehavior) {
        self.state().default_fill = Some(behavior);
    }

    /// Per-order script consumed in placement order; the default behavior
    /// applies once the script is exhausted.
    pub fn script_fills(&self, script: Vec<FillBehavior>) {
        let mut state = self.state();
        state.fill_script = script;
        state.fill_script.reverse(); // consumed via pop()
    }

    /// Makes the next `count` portfolio/position queries fail.
    pub fn fail_position_queries(&self, count: u32) {
        self.state().fail_position_queries = count;
    }

    pub fn fail_ticker_reads(&self, fail: bool) {
        self.state().fail_ticker_reads = fail;
    }

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        let state = self.state();
        state
            .order_log
            .iter()
            .filter_map(|id| {
                state.orders.get(id).map(|order| PlacedOrder {
                    order_id: *id,
                    contract: order.contract.clone(),
                    side: order.ticket.side,
                    quantity: order.ticket.quantity,
                    kind: order.ticket.kind,
                })
            })
            .collect()
    }

    pub fn cancelled_orders(&self) -> Vec<i64> {
        self.state().cancelled.clone()
    }

    pub fn open_subscriptions(&self) -> usize {
        self.state().subscriptions.len()
    }

    pub fn subscriptions_opened(&self) -> u64 {
        self.state().subscriptions_opened
    }

    pub fn qualify_calls(&self) -> u64 {
        self.state().qualify_calls
    }

    /// Net book quantity for a contract id; the broker-side ground truth.
    pub fn net_quantity(&self, contract_id: i32) -> i64 {
        self.state()
            .book
            .iter()
            .filter(|item| item.contract.contract_id == contract_id)
            .map(|item| item.quantity)
            .sum()
    }

    fn fill_price(state: &PaperState, order: &PaperOrder) -> f64 {
        match order.ticket.kind {
            OrderKind::Limit(price) => price,
            OrderKind::Market => state
                .tickers
                .get(&order.contract.contract_id)
                .map(|t| t.last)
                .filter(|last| *last > 0.0)
                .unwrap_or(100.0),
        }
    }

    fn apply_fill(state: &mut PaperState, order_id: i64) {
        let (contract, delta, price) = {
            let order = match state.orders.get(&order_id) {
                Some(order) if !order.applied_to_book => order,
                _ => return,
            };
            let signed = match order.ticket.side {
                OrderSide::Buy => order.filled as i64,
                OrderSide::Sell => -(order.filled as i64),
            };
            (order.contract.clone(), signed, order.avg_fill_price)
        };
        if let Some(item) = state
            .book
            .iter_mut()
            .find(|item| item.contract.contract_id == contract.contract_id)
        {
            item.quantity += delta;
            item.average_cost = price;
            item.market_value = item.quantity as f64 * price;
        } else {
            state.book.push(PortfolioItem {
                contract,
                quantity: delta,
                average_cost: price,
                market_value: delta as f64 * price,
                unrealized_pnl: 0.0,
                realized_pnl: 0.0,
            });
        }
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.applied_to_book = true;
        }
    }

    fn advance_order(state: &mut PaperState, order_id: i64) {
        let next = match state.orders.get(&order_id) {
            Some(order) if !order.status.is_terminal() => match order.behavior {
                FillBehavior::Never => BrokerOrderStatus::Submitted,
                FillBehavior::Reject => BrokerOrderStatus::Rejected,
                FillBehavior::Immediate => BrokerOrderStatus::Filled,
                FillBehavior::AfterPolls(_) => {
                    if order.polls_remaining > 0 {
                        BrokerOrderStatus::Submitted
                    } else {
                        BrokerOrderStatus::Filled
                    }
                }
            },
            _ => return,
        };
        let price = match state.orders.get(&order_id) {
            Some(order) => Self::fill_price(state, order),
            None => return,
        };
        let Some(order) = state.orders.get_mut(&order_id) else {
            return;
        };
        match next {
            BrokerOrderStatus::Submitted => {
                order.polls_remaining = order.polls_remaining.saturating_sub(1);
                order.status = BrokerOrderStatus::Submitted;
            }
            BrokerOrderStatus::Rejected => order.status = BrokerOrderStatus::Rejected,
            BrokerOrderStatus::Filled => {
                order.status = BrokerOrderStatus::Filled;
                order.filled = order.ticket.quantity;
                order.avg_fill_price = price;
            }
            _ => {}
        }
        if next == BrokerOrderStatus::Filled {
            Self::apply_fill(state, order_id);
        }
    }

    fn ensure_connected(state: &PaperState) -> Result<(), BrokerError> {
        if state.connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn matches(descriptor: &InstrumentDescriptor, contract: &ResolvedContract) -> bool {
        if descriptor.kind != contract.kind || descriptor.symbol != contract.symbol {
            return false;
        }
        if let Some(expiry) = &descriptor.expiry {
            if contract.expiry.as_deref() != Some(expiry.as_str()) {
                return false;
            }
        }
        if let Some(strike) = descriptor.strike {
            if contract.strike != Some(strike) {
                return false;
            }
        }
        if let Some(right) = descriptor.right {
            if contract.right != Some(right) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl BrokerApi for PaperGateway {
    async fn connect(&self, host: &str, port: u16, _client_id: i32) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.fail_connect {
            return Err(BrokerError::ConnectionFailed {
                host: host.to_string(),
                port,
                reason: "gateway refused session".to_string(),
            });
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        self.state().connected = false;
    }

    async fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn qualify(
        &self,
        descriptor: &InstrumentDescriptor,
    ) -> Result<Vec<ResolvedContract>, BrokerError> {
        let mut state = self.state();
        Self::ensure_connected(&state)?;
        state.qualify_calls += 1;
        Ok(state
            .instruments
            .iter()
            .filter(|contract| Self::matches(descriptor, contract))
            .cloned()
            .collect())
    }

    async fn subscribe_market_data(
        &self,
        contract: &ResolvedContract,
    ) -> Result<u64, BrokerError> {
        let mut state = self.state();
        Self::ensure_connected(&state)?;
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscriptions_opened += 1;
        state.subscriptions.insert(id, contract.contract_id);
        Ok(id)
    }

    async fn read_ticker(&self, subscription: u64) -> Result<RawTicker, BrokerError> {
        let state = self.state();
        Self::ensure_connected(&state)?;
        if state.fail_ticker_reads {
            return Err(BrokerError::Gateway("market data farm unavailable".to_string()));
        }
        let contract_id = state
            .subscriptions
            .get(&subscription)
            .ok_or_else(|| BrokerError::Gateway(format!("unknown subscription {subscription}")))?;
        Ok(state.tickers.get(contract_id).copied().unwrap_or_default())
    }

    async fn cancel_market_data(&self, subscription: u64) {
        self.state().subscriptions.remove(&subscription);
    }

    async fn place_order(
        &self,
        contract: &ResolvedContract,
        ticket: &OrderTicket,
    ) -> Result<i64, BrokerError> {
        let mut state = self.state();
        Self::ensure_connected(&state)?;
        let order_id = state.next_order_id;
        state.next_order_id += 1;
        let behavior = state
            .fill_script
            .pop()
            .or(state.default_fill)
            .unwrap_or(FillBehavior::Immediate);
        let polls_remaining = match behavior {
            FillBehavior::AfterPolls(n) => n,
            _ => 0,
        };
        state.orders.insert(
            order_id,
            PaperOrder {
                contract: contract.clone(),
                ticket: ticket.clone(),
                behavior,
                status: BrokerOrderStatus::PendingSubmit,
                filled: 0,
                avg_fill_price: 0.0,
                polls_remaining,
                applied_to_book: false,
            },
        );
        state.order_log.push(order_id);
        Ok(order_id)
    }

    async fn order_state(&self, order_id: i64) -> Result<BrokerOrderState, BrokerError> {
        let mut state = self.state();
        Self::ensure_connected(&state)?;
        if !state.orders.contains_key(&order_id) {
            return Err(BrokerError::Gateway(format!("unknown order {order_id}")));
        }
        Self::advance_order(&mut state, order_id);
        let order = &state.orders[&order_id];
        Ok(BrokerOrderState {
            status: order.status,
            filled: order.filled,
            avg_fill_price: order.avg_fill_price,
        })
    }

    async fn cancel_order(&self, order_id: i64) -> Result<(), BrokerError> {
        let mut state = self.state();
        Self::ensure_connected(&state)?;
        state.cancelled.push(order_id);
        if let Some(order) = state.orders.get_mut(&order_id) {
            if !order.status.is_terminal() {
                order.status = BrokerOrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn portfolio(&self) -> Result<Vec<PortfolioItem>, BrokerError> {
        let mut state = self.state();
        Self::ensure_connected(&state)?;
        if state.fail_position_queries > 0 {
            state.fail_position_queries -= 1;
            return Err(BrokerError::Gateway("portfolio query failed".to_string()));
        }
        Ok(state.book.clone())
    }

    async fn positions(&self) -> Result<Vec<PortfolioItem>, BrokerError> {
        let mut state = self.state();
        Self::ensure_connected(&state)?;
        if state.fail_position_queries > 0 {
            state.fail_position_queries -= 1;
            return Err(BrokerError::Gateway("position query failed".to_string()));
        }
        // The plain view carries no valuation data.
        Ok(state
            .book
            .iter()
            .map(|item| PortfolioItem {
                contract: item.contract.clone(),
                quantity: item.quantity,
                average_cost: item.average_cost,
                market_value: 0.0,
                unrealized_pnl: 0.0,
                realized_pnl: 0.0,
            })
            .collect())
    }

    async fn account_summary(&self) -> Result<Vec<(String, f64)>, BrokerError> {
        let state = self.state();
        Self::ensure_connected(&state)?;
        Ok(state.account.clone())
    }
}
