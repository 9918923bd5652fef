//! Brokerage gateway boundary
//!
//! The gateway's wire protocol is external to this crate: everything here
//! depends only on the request/response contract in [`api::BrokerApi`].
//! [`paper::PaperGateway`] is the bundled in-process implementation used for
//! paper trading and tests; a live gateway implements the same trait.

pub mod api;
pub mod paper;
pub mod session;

pub use api::{BrokerApi, BrokerError, BrokerOrderState, BrokerOrderStatus, PortfolioItem, RawTicker};
pub use paper::{FillBehavior, PaperGateway};
pub use session::BrokerSession;
