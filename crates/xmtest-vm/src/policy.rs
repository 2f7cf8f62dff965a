//! Security-policy hook run after a config file is written.

use crate::config::ConfigDocument;
use crate::error::Result;
use async_trait::async_trait;

/// Hook invoked with the full option set after a config has been persisted.
///
/// Implementations typically label the resources the domain refers to so
/// that an enforcing security module lets the domain start.
#[async_trait]
pub trait SecurityPolicy: Send + Sync {
    /// Whether the security subsystem is active. Disabled policies are
    /// never asked to prepare.
    fn enabled(&self) -> bool;

    /// Prepare the system for a domain using `config`.
    async fn prepare(&self, config: &ConfigDocument) -> Result<()>;
}

/// Policy used when no security module is enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecurityPolicy;

#[async_trait]
impl SecurityPolicy for NoSecurityPolicy {
    fn enabled(&self) -> bool {
        false
    }

    async fn prepare(&self, _config: &ConfigDocument) -> Result<()> {
        Ok(())
    }
}
