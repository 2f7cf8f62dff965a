//! Running-state queries by domain name.

use crate::error::Result;
use async_trait::async_trait;
use xmtest_vm::ControlTool;

/// Answers whether a domain is currently known to the hypervisor.
#[async_trait]
pub trait DomainStateQuery: Send + Sync {
    /// Whether `domain` is running.
    async fn is_running(&self, domain: &str) -> Result<bool>;
}

/// [`DomainStateQuery`] that asks the control tool for the domain id; a
/// domain with an id is running.
#[derive(Debug, Clone)]
pub struct ToolStateQuery {
    tool: ControlTool,
}

impl ToolStateQuery {
    /// Query through `tool`.
    pub fn new(tool: ControlTool) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl DomainStateQuery for ToolStateQuery {
    async fn is_running(&self, domain: &str) -> Result<bool> {
        Ok(self.tool.domid(domain).await?.is_some())
    }
}
