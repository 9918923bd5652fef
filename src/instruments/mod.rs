//! Instrument descriptors and broker-resolved contracts

pub mod resolver;

pub use resolver::{load_watchlist, ContractResolver, ResolveError};

use serde::{Deserialize, Serialize};

/// Asset class of a tradable instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityKind {
    Future,
    IndexOption,
    Equity,
}

impl SecurityKind {
    pub fn code(&self) -> &'static str {
        match self {
            SecurityKind::Future => "FUT",
            SecurityKind::IndexOption => "OPT",
            SecurityKind::Equity => "STK",
        }
    }
}

/// Option right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Right {
    Call,
    Put,
}

impl Right {
    pub fn code(&self) -> &'static str {
        match self {
            Right::Call => "C",
            Right::Put => "P",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "C" | "CALL" => Some(Right::Call),
            "P" | "PUT" => Some(Right::Put),
            _ => None,
        }
    }
}

/// Symbolic specification of a contract before broker resolution.
/// Immutable once constructed; used as the resolution key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDescriptor {
    pub kind: SecurityKind,
    pub symbol: String,
    pub exchange: String,
    pub currency: String,
    /// Expiry month or date (`YYYYMM` / `YYYYMMDD`); `None` makes this a
    /// family search covering every listed expiry.
    pub expiry: Option<String>,
    pub strike: Option<f64>,
    pub right: Option<Right>,
    pub multiplier: Option<String>,
    pub trading_class: Option<String>,
}

impl InstrumentDescriptor {
    pub fn future(symbol: &str, expiry: &str, exchange: &str, currency: &str) -> Self {
        Self {
            kind: SecurityKind::Future,
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            currency: currency.to_string(),
            expiry: Some(expiry.to_string()),
            strike: None,
            right: None,
            multiplier: None,
            trading_class: None,
        }
    }

    /// Broad search template: every listed expiry for the symbol.
    pub fn future_family(symbol: &str, exchange: &str, currency: &str) -> Self {
        Self {
            expiry: None,
            ..Self::future(symbol, "", exchange, currency)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn index_option(
        symbol: &str,
        expiry: &str,
        strike: f64,
        right: Right,
        exchange: &str,
        currency: &str,
        trading_class: &str,
    ) -> Self {
        Self {
            kind: SecurityKind::IndexOption,
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            currency: currency.to_string(),
            expiry: Some(expiry.to_string()),
            strike: Some(strike),
            right: Some(right),
            multiplier: None,
            trading_class: Some(trading_class.to_string()),
        }
    }

    pub fn equity(symbol: &str, exchange: &str, currency: &str) -> Self {
        Self {
            kind: SecurityKind::Equity,
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            currency: currency.to_string(),
            expiry: None,
            strike: None,
            right: None,
            multiplier: None,
            trading_class: None,
        }
    }
}

/// Broker-qualified, order-ready reference to an instrument.
/// Invalidated (must be re-resolved) when the owning session reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedContract {
    pub contract_id: i32,
    pub kind: SecurityKind,
    pub symbol: String,
    pub exchange: String,
    pub currency: String,
    pub expiry: Option<String>,
    pub strike: Option<f64>,
    pub right: Option<Right>,
    pub local_symbol: String,
}

impl ResolvedContract {
    pub fn from_descriptor(
        descriptor: &InstrumentDescriptor,
        contract_id: i32,
        local_symbol: &str,
    ) -> Self {
        Self {
            contract_id,
            kind: descriptor.kind,
            symbol: descriptor.symbol.clone(),
            exchange: descriptor.exchange.clone(),
            currency: descriptor.currency.clone(),
            expiry: descriptor.expiry.clone(),
            strike: descriptor.strike,
            right: descriptor.right,
            local_symbol: local_symbol.to_string(),
        }
    }

    /// Fills in a missing venue. Orders are never submitted with an
    /// unresolved exchange. Returns true when the fallback was applied.
    pub fn ensure_exchange(&mut self, fallback: &str) -> bool {
        if self.exchange.is_empty() {
            self.exchange = fallback.to_string();
            return true;
        }
        false
    }

    /// Short human-readable form for logs.
    pub fn label(&self) -> String {
        match self.kind {
            SecurityKind::Future => {
                format!("{} {}", self.symbol, self.expiry.as_deref().unwrap_or("?"))
            }
            SecurityKind::IndexOption => format!(
                "{} {} {} {}",
                self.symbol,
                self.strike.unwrap_or(0.0),
                self.right.map(|r| r.code()).unwrap_or("?"),
                self.expiry.as_deref().unwrap_or("?"),
            ),
            SecurityKind::Equity => format!("{} {}", self.symbol, self.exchange),
        }
    }
}
