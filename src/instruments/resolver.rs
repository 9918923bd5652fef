//! Contract qualification and startup contract selection

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{InstrumentDescriptor, ResolvedContract};
use crate::broker::api::{BrokerApi, BrokerError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("instrument {symbol} not found or not tradable")]
    NotFound { symbol: String },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Qualification front-end for one desk. Fills missing venues with the
/// desk's fallback exchange so an order is never submitted without one.
pub struct ContractResolver {
    gateway: Arc<dyn BrokerApi>,
    fallback_exchange: String,
}

impl ContractResolver {
    pub fn new(gateway: Arc<dyn BrokerApi>, fallback_exchange: &str) -> Self {
        Self {
            gateway,
            fallback_exchange: fallback_exchange.to_string(),
        }
    }

    /// Resolves a fully-specified descriptor. Zero candidates is an error;
    /// more than one is tolerated by taking the first (the gateway echoes
    /// the most specific match first).
    pub async fn resolve(
        &self,
        descriptor: &InstrumentDescriptor,
    ) -> Result<ResolvedContract, ResolveError> {
        let mut candidates = self.gateway.qualify(descriptor).await?;
        if candidates.is_empty() {
            return Err(ResolveError::NotFound {
                symbol: descriptor.symbol.clone(),
            });
        }
        if candidates.len() > 1 {
            debug!(
                "{} candidates for {}, using the first",
                candidates.len(),
                descriptor.symbol
            );
        }
        let mut contract = candidates.remove(0);
        if contract.ensure_exchange(&self.fallback_exchange) {
            info!(
                "Set exchange to {} for contract {}",
                self.fallback_exchange,
                contract.symbol
            );
        }
        Ok(contract)
    }

    /// Family search: every candidate for the template, sorted by expiry
    /// ascending. The earliest candidate is the family's primary contract.
    pub async fn resolve_family(
        &self,
        family: &InstrumentDescriptor,
    ) -> Result<Vec<ResolvedContract>, ResolveError> {
        let mut candidates = self.gateway.qualify(family).await?;
        if candidates.is_empty() {
            return Err(ResolveError::NotFound {
                symbol: family.symbol.clone(),
            });
        }
        candidates.sort_by(|a, b| a.expiry.cmp(&b.expiry));
        for contract in &mut candidates {
            if contract.ensure_exchange(&self.fallback_exchange) {
                info!(
                    "Set exchange to {} for contract {}",
                    self.fallback_exchange,
                    contract.symbol
                );
            }
        }
        Ok(candidates)
    }

    /// Startup selection: qualify the watchlist in order and take the first
    /// survivor. When nothing on the watchlist qualifies, degrade to a broad
    /// family search and substitute the earliest available contract: the
    /// desk is never left without a tradable contract while any exist for
    /// the family.
    pub async fn resolve_primary(
        &self,
        watchlist: &[InstrumentDescriptor],
        family: &InstrumentDescriptor,
    ) -> Result<ResolvedContract, ResolveError> {
        let mut qualified = Vec::new();
        for descriptor in watchlist {
            match self.resolve(descriptor).await {
                Ok(contract) => {
                    info!("Qualified contract: {}", contract.label());
                    qualified.push(contract);
                }
                Err(ResolveError::NotFound { .. }) => {
                    warn!(
                        "Could not qualify {} {}",
                        descriptor.symbol,
                        descriptor.expiry.as_deref().unwrap_or("")
                    );
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(primary) = qualified.into_iter().next() {
            return Ok(primary);
        }

        warn!(
            "Could not qualify any selected contracts, searching available {} contracts...",
            family.symbol
        );
        let mut candidates = self.resolve_family(family).await?;
        let primary = candidates.remove(0);
        warn!(
            "Substituting earliest available contract: {}",
            primary.label()
        );
        Ok(primary)
    }
}

/// Loads the persisted contract watchlist: one contract per line,
/// `symbol,expiry,exchange,currency[,multiplier]`. Blank lines and `#`
/// comments are skipped; short lines are ignored.
pub fn load_watchlist(path: &Path) -> Result<Vec<InstrumentDescriptor>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading watchlist {}", path.display()))?;
    let mut descriptors = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 4 {
            warn!("Skipping malformed watchlist line: {line}");
            continue;
        }
        let mut descriptor = InstrumentDescriptor::future(parts[0], parts[1], parts[2], parts[3]);
        if let Some(multiplier) = parts.get(4) {
            descriptor.multiplier = Some((*multiplier).to_string());
        }
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}
