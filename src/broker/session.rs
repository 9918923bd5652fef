//! Per-desk broker session
//!
//! Each trading desk owns one session with a distinct client id so the
//! gateway never sees two concurrent logins from the same logical client.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::api::{BrokerApi, BrokerError};

pub struct BrokerSession {
    gateway: Arc<dyn BrokerApi>,
    host: String,
    port: u16,
    client_id: i32,
    connected: AtomicBool,
    /// Bumped on every successful connect. Cached contract handles carry the
    /// epoch they were resolved under and re-resolve when it moves.
    epoch: AtomicU64,
}

impl BrokerSession {
    pub fn new(gateway: Arc<dyn BrokerApi>, host: &str, port: u16, client_id: i32) -> Self {
        Self {
            gateway,
            host: host.to_string(),
            port,
            client_id,
            connected: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn gateway(&self) -> Arc<dyn BrokerApi> {
        Arc::clone(&self.gateway)
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    /// Current connection epoch. Moves on every successful connect.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Connection failure is fatal to desk startup; no automatic retry.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.gateway
            .connect(&self.host, self.port, self.client_id)
            .await?;
        self.connected.store(true, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        info!(
            "Connected to broker gateway at {}:{} (client id {})",
            self.host, self.port, self.client_id
        );
        Ok(())
    }

    /// Idempotent. Does not clean up in-flight order tickets.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.gateway.disconnect().await;
            info!("Disconnected from broker gateway (client id {})", self.client_id);
        }
    }

    /// True only when connect succeeded and the gateway still reports the
    /// link alive.
    pub async fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        let live = self.gateway.is_connected().await;
        if !live {
            warn!("Broker session {} lost its link", self.client_id);
        }
        live
    }
}
