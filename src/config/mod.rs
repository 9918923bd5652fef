//! Environment-driven configuration
//!
//! All settings are read once at startup; nothing reloads at runtime.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::execution::ExecutionConfig;
use crate::instruments::Right;

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub futures: FuturesConfig,
    pub options: OptionConfig,
    pub equity: EquityConfig,
    pub execution: ExecutionSettings,
    pub http_bind: String,
    pub log_file: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Base session identity. Each desk offsets from it so the gateway never
    /// sees two concurrent logins with the same client id.
    pub client_id: i32,
    pub account_id: String,
}

impl BrokerConfig {
    pub fn futures_client_id(&self) -> i32 {
        self.client_id
    }

    pub fn options_client_id(&self) -> i32 {
        self.client_id + 10
    }

    pub fn equity_client_id(&self) -> i32 {
        self.client_id + 20
    }
}

#[derive(Debug, Clone)]
pub struct FuturesConfig {
    pub symbol: String,
    pub expiry: String,
    pub exchange: String,
    pub currency: String,
    pub quantity: u32,
    /// Optional persisted contract list consulted in place of the static
    /// default descriptor.
    pub watchlist_file: String,
}

#[derive(Debug, Clone)]
pub struct OptionConfig {
    pub symbol: String,
    pub expiry: String,
    pub strike: f64,
    pub right: Right,
    pub exchange: String,
    pub currency: String,
    pub trading_class: String,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct EquityConfig {
    pub symbol: String,
    pub exchange: String,
    pub currency: String,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub order_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub snapshot_settle_ms: u64,
    pub cancel_on_timeout: bool,
    pub passive_limit_pricing: bool,
    pub force_close_all_families: bool,
}

impl ExecutionSettings {
    pub fn to_execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            fill_timeout: Duration::from_secs(self.order_timeout_secs),
            snapshot_settle: Duration::from_millis(self.snapshot_settle_ms),
            cancel_on_timeout: self.cancel_on_timeout,
            passive_limit_pricing: self.passive_limit_pricing,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {value}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let right = env_or("OPTION_RIGHT", "C");
        let right = Right::parse(&right)
            .with_context(|| format!("invalid value for OPTION_RIGHT: {right}"))?;

        Ok(Self {
            broker: BrokerConfig {
                host: env_or("BROKER_HOST", "127.0.0.1"),
                port: env_parse("BROKER_PORT", 7497)?,
                client_id: env_parse("BROKER_CLIENT_ID", 1)?,
                account_id: env_or("BROKER_ACCOUNT_ID", ""),
            },
            futures: FuturesConfig {
                symbol: env_or("CONTRACT_SYMBOL", "ES"),
                expiry: env_or("CONTRACT_MONTH", "20251219"),
                exchange: env_or("CONTRACT_EXCHANGE", "CME"),
                currency: env_or("CONTRACT_CURRENCY", "USD"),
                quantity: env_parse("FUTURES_QUANTITY", 3)?,
                watchlist_file: env_or("WATCHLIST_FILE", "selected_contracts.txt"),
            },
            options: OptionConfig {
                symbol: env_or("OPTION_SYMBOL", "SPXW"),
                expiry: env_or("OPTION_EXPIRY", "20251010"),
                strike: env_parse("OPTION_STRIKE", 6675.0)?,
                right,
                exchange: env_or("OPTION_EXCHANGE", "SMART"),
                currency: env_or("OPTION_CURRENCY", "USD"),
                trading_class: env_or("OPTION_TRADING_CLASS", "SPXW"),
                quantity: env_parse("OPTION_QUANTITY", 1)?,
            },
            equity: EquityConfig {
                symbol: env_or("EQUITY_SYMBOL", "SPY"),
                exchange: env_or("EQUITY_EXCHANGE", "SMART"),
                currency: env_or("EQUITY_CURRENCY", "USD"),
                quantity: env_parse("EQUITY_QUANTITY", 5)?,
            },
            execution: ExecutionSettings {
                order_timeout_secs: env_parse("ORDER_TIMEOUT_SECS", 30)?,
                poll_interval_ms: env_parse("ORDER_POLL_INTERVAL_MS", 100)?,
                snapshot_settle_ms: env_parse("SNAPSHOT_SETTLE_MS", 1000)?,
                cancel_on_timeout: env_bool("CANCEL_ON_TIMEOUT", false),
                passive_limit_pricing: env_bool("PASSIVE_LIMIT_PRICING", false),
                force_close_all_families: env_bool("FORCE_CLOSE_ALL_FAMILIES", false),
            },
            http_bind: env_or("HTTP_BIND", "0.0.0.0:8000"),
            log_file: env_or("LOG_FILE", "osprey.log"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_settings_convert_to_durations() {
        let settings = ExecutionSettings {
            order_timeout_secs: 30,
            poll_interval_ms: 100,
            snapshot_settle_ms: 1000,
            cancel_on_timeout: false,
            passive_limit_pricing: true,
            force_close_all_families: false,
        };
        let config = settings.to_execution_config();
        assert_eq!(config.fill_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.snapshot_settle, Duration::from_secs(1));
        assert!(config.passive_limit_pricing);
    }

    #[test]
    fn desk_client_ids_are_distinct_offsets() {
        let broker = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 7,
            account_id: String::new(),
        };
        assert_eq!(broker.futures_client_id(), 7);
        assert_eq!(broker.options_client_id(), 17);
        assert_eq!(broker.equity_client_id(), 27);
    }
}
