//! osprey - webhook-driven order relay
//!
//! Receives TradingView-style alert webhooks and relays them to a brokerage
//! gateway as orders across three desks (index futures, index options,
//! equities). The broker wire protocol lives behind the [`broker::BrokerApi`]
//! trait; the bundled paper gateway backs tests and paper-trading runs.

pub mod broker;
pub mod config;
pub mod execution;
pub mod instruments;
pub mod market;
pub mod models;
pub mod server;
pub mod trading;
