//! Waiting for a freshly created domain to finish booting.
//!
//! Fully virtualized guests take a while before their console is usable.
//! The domain handle bounds every wait with the configured boot timeout.

use crate::error::Result;
use crate::state::DomainStateQuery;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default fixed boot delay for HVM guests.
pub const DEFAULT_BOOT_DELAY: Duration = Duration::from_secs(20);

/// Blocks until a domain is ready for use.
#[async_trait]
pub trait BootWaiter: Send + Sync {
    /// Wait for `domain` to boot.
    async fn wait_for_boot(&self, domain: &str) -> Result<()>;
}

/// Waits a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct SleepBootWaiter {
    delay: Duration,
}

impl SleepBootWaiter {
    /// Wait `delay` for every boot.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SleepBootWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_BOOT_DELAY)
    }
}

#[async_trait]
impl BootWaiter for SleepBootWaiter {
    async fn wait_for_boot(&self, domain: &str) -> Result<()> {
        tracing::debug!(domain, delay_ms = self.delay.as_millis() as u64, "Waiting for boot");
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Polls a state query until the domain reports running.
#[derive(Clone)]
pub struct PollingBootWaiter {
    query: Arc<dyn DomainStateQuery>,
    interval: Duration,
}

impl PollingBootWaiter {
    /// Poll `query` every `interval`.
    pub fn new(query: Arc<dyn DomainStateQuery>, interval: Duration) -> Self {
        Self { query, interval }
    }
}

#[async_trait]
impl BootWaiter for PollingBootWaiter {
    async fn wait_for_boot(&self, domain: &str) -> Result<()> {
        let start = std::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.query.is_running(domain).await? {
                tracing::debug!(
                    domain,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Domain booted"
                );
                return Ok(());
            }
            tracing::trace!(domain, attempt = attempts, "Domain not up yet, retrying...");
            tokio::time::sleep(self.interval).await;
        }
    }
}
