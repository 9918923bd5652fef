//! Order execution and position reconciliation

pub mod closer;
pub mod order;

pub use closer::{CloseMode, CloseReport, PositionCloser};
pub use order::{ExecutionConfig, OrderEngine, OrderKind, OrderSide, OrderTicket, TradeOutcome};
