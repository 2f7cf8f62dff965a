//! Shared state and collaborators for a test run.

use crate::acm::AcmPolicy;
use crate::boot::{BootWaiter, SleepBootWaiter};
use crate::console::{ConsoleFactory, XmConsoleFactory};
use crate::error::Result;
use crate::settings::HarnessSettings;
use crate::state::{DomainStateQuery, ToolStateQuery};
use crate::tracker::ManagedDomainTracker;
use std::fmt;
use std::sync::Arc;
use xmtest_vm::{ControlTool, NoSecurityPolicy, SecurityPolicy};

/// Everything a [`DomainHandle`](crate::DomainHandle) needs besides its own
/// config: settings, the control tool, the managed-domain tracker and the
/// external collaborators.
///
/// Cloning is cheap; clones share the tracker and collaborators. Create one
/// context per run and call [`teardown`](Self::teardown) at the end.
#[derive(Clone)]
pub struct HarnessContext {
    settings: HarnessSettings,
    tool: ControlTool,
    tracker: ManagedDomainTracker,
    state_query: Arc<dyn DomainStateQuery>,
    boot_waiter: Arc<dyn BootWaiter>,
    console_factory: Arc<dyn ConsoleFactory>,
    security_policy: Arc<dyn SecurityPolicy>,
}

impl HarnessContext {
    /// Context driving the real control tool named in `settings`.
    pub fn new(settings: HarnessSettings) -> Self {
        let tool = ControlTool::new(settings.tool.clone());
        Self::with_tool(settings, tool)
    }

    /// Context driving `tool`, with default collaborators built on it.
    pub fn with_tool(settings: HarnessSettings, tool: ControlTool) -> Self {
        let security_policy: Arc<dyn SecurityPolicy> = match &settings.access_control {
            Some(_) => Arc::new(AcmPolicy::new(tool.clone())),
            None => Arc::new(NoSecurityPolicy),
        };

        Self {
            state_query: Arc::new(ToolStateQuery::new(tool.clone())),
            boot_waiter: Arc::new(SleepBootWaiter::new(settings.boot_delay)),
            console_factory: Arc::new(XmConsoleFactory::new(tool.program())),
            security_policy,
            tracker: ManagedDomainTracker::new(),
            tool,
            settings,
        }
    }

    /// Replace the running-state query.
    pub fn with_state_query(mut self, query: Arc<dyn DomainStateQuery>) -> Self {
        self.state_query = query;
        self
    }

    /// Replace the boot waiter.
    pub fn with_boot_waiter(mut self, waiter: Arc<dyn BootWaiter>) -> Self {
        self.boot_waiter = waiter;
        self
    }

    /// Replace the console factory.
    pub fn with_console_factory(mut self, factory: Arc<dyn ConsoleFactory>) -> Self {
        self.console_factory = factory;
        self
    }

    /// Replace the security policy hook.
    pub fn with_security_policy(mut self, policy: Arc<dyn SecurityPolicy>) -> Self {
        self.security_policy = policy;
        self
    }

    /// Share an existing tracker.
    pub fn with_tracker(mut self, tracker: ManagedDomainTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn tool(&self) -> &ControlTool {
        &self.tool
    }

    pub fn tracker(&self) -> &ManagedDomainTracker {
        &self.tracker
    }

    pub fn state_query(&self) -> &dyn DomainStateQuery {
        self.state_query.as_ref()
    }

    pub fn boot_waiter(&self) -> &dyn BootWaiter {
        self.boot_waiter.as_ref()
    }

    pub fn console_factory(&self) -> &dyn ConsoleFactory {
        self.console_factory.as_ref()
    }

    pub fn security_policy(&self) -> &dyn SecurityPolicy {
        self.security_policy.as_ref()
    }

    /// Destroy and delete every managed domain still tracked.
    pub async fn teardown(&self) -> Result<usize> {
        self.tracker.destroy_all(&self.tool).await
    }
}

impl fmt::Debug for HarnessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessContext")
            .field("settings", &self.settings)
            .field("tool", &self.tool)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acm::AccessLabel;

    #[test]
    fn test_security_policy_follows_settings() {
        let ctx = HarnessContext::new(HarnessSettings::default());
        assert!(!ctx.security_policy().enabled());

        let settings = HarnessSettings {
            access_control: Some(AccessLabel::default()),
            ..HarnessSettings::default()
        };
        let ctx = HarnessContext::new(settings);
        assert!(ctx.security_policy().enabled());
        assert_eq!(ctx.tool().program(), "xm");
    }

    #[test]
    fn test_clones_share_tracker() {
        let ctx = HarnessContext::new(HarnessSettings::default());
        let other = ctx.clone();
        ctx.tracker().track("dom");
        assert!(other.tracker().contains("dom"));
    }
}
