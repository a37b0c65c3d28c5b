//! Remote session lifecycle
//!
//! Sessions are opened lazily, re-opened after a fault and closed after a
//! period without foreground activity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use labvisor_core::{HypervisorError, Result, VimClient};
use log::{debug, info};
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct Session {
    client: Arc<dyn VimClient>,
    keep_alive: Duration,
    /// Serializes session establishment
    gate: Mutex<()>,
    last_activity: StdMutex<Instant>,
    /// Closed for idleness; background loops leave it closed
    parked: AtomicBool,
}

impl Session {
    pub fn new(client: Arc<dyn VimClient>, keep_alive: Duration) -> Self {
        Self {
            client,
            keep_alive,
            gate: Mutex::new(()),
            last_activity: StdMutex::new(Instant::now()),
            parked: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &str {
        self.client.host()
    }

    /// Record foreground activity.
    pub fn touch(&self) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        let last = self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last.elapsed()
    }

    pub async fn is_connected(&self) -> bool {
        self.client.is_connected().await
    }

    /// Open the session unless it is already up. Foreground callers use
    /// this before every remote call.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.touch();
        self.parked.store(false, Ordering::SeqCst);
        self.connect().await
    }

    /// True while the session is closed for idleness.
    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }

    /// Same as [`Session::ensure_connected`] without counting as activity.
    pub async fn connect(&self) -> Result<()> {
        if self.client.is_connected().await {
            return Ok(());
        }

        let _gate = self.gate.lock().await;
        if self.client.is_connected().await {
            return Ok(());
        }

        self.client.connect().await?;
        info!("Connected to {}", self.client.host());
        Ok(())
    }

    /// Drop the session after a connection fault so the next call opens a
    /// fresh one. Other errors are ignored.
    pub async fn fault(&self, error: &HypervisorError) {
        if !error.is_connection_fault() {
            return;
        }
        debug!("Session to {} faulted: {}", self.client.host(), error);
        self.close().await;
    }

    /// Close the session when it has been idle for longer than the keep
    /// alive window. Returns true if it was closed.
    pub async fn disconnect_if_idle(&self) -> bool {
        if self.idle_for() < self.keep_alive || !self.client.is_connected().await {
            return false;
        }
        info!(
            "Disconnecting idle session to {} after {:?}",
            self.client.host(),
            self.idle_for()
        );
        self.parked.store(true, Ordering::SeqCst);
        self.close().await;
        true
    }

    async fn close(&self) {
        let _gate = self.gate.lock().await;
        if let Err(e) = self.client.disconnect().await {
            debug!("Failed to disconnect from {}: {}", self.client.host(), e);
        }
    }
}
