//! Access-control labelling of domain resources.

use async_trait::async_trait;
use xmtest_vm::{
    ConfigDocument, ControlTool, SecurityPolicy, ToolCommand, VmError, ACCESS_CONTROL_OPTION,
};

/// Default policy name for test domains.
pub const DEFAULT_ACM_POLICY: &str = "xm-test";

/// Default label for test domains.
pub const DEFAULT_ACM_LABEL: &str = "red";

/// Policy and label a domain runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLabel {
    pub policy: String,
    pub label: String,
}

impl Default for AccessLabel {
    fn default() -> Self {
        Self {
            policy: DEFAULT_ACM_POLICY.to_string(),
            label: DEFAULT_ACM_LABEL.to_string(),
        }
    }
}

impl AccessLabel {
    /// Parse an `access_control` entry of the form `policy=P,label=L`.
    pub fn parse(entry: &str) -> Option<Self> {
        let mut policy = None;
        let mut label = None;
        for part in entry.split(',') {
            match part.trim().split_once('=') {
                Some(("policy", value)) => policy = Some(value.trim().to_string()),
                Some(("label", value)) => label = Some(value.trim().to_string()),
                _ => {}
            }
        }
        Some(Self {
            policy: policy?,
            label: label?,
        })
    }
}

/// Labels every `disk` resource of a domain with the domain's access-control
/// label, so the enforcing policy lets the domain use its disks.
#[derive(Debug, Clone)]
pub struct AcmPolicy {
    tool: ControlTool,
}

impl AcmPolicy {
    /// Label resources through `tool`.
    pub fn new(tool: ControlTool) -> Self {
        Self { tool }
    }
}

/// Resource part of a disk entry: `phy:/dev/ram0,hda1,w` → `phy:/dev/ram0`.
fn disk_resource(entry: &str) -> Option<&str> {
    entry.split(',').next().map(str::trim).filter(|r| !r.is_empty())
}

#[async_trait]
impl SecurityPolicy for AcmPolicy {
    fn enabled(&self) -> bool {
        true
    }

    async fn prepare(&self, config: &ConfigDocument) -> xmtest_vm::Result<()> {
        let labels: Vec<AccessLabel> = config
            .get_opt(ACCESS_CONTROL_OPTION)
            .and_then(|value| value.as_list())
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| AccessLabel::parse(entry))
            .collect();
        let disks: Vec<String> = config
            .get_opt("disk")
            .and_then(|value| value.as_list())
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| disk_resource(entry).map(String::from))
            .collect();

        for access in &labels {
            for resource in &disks {
                let command = ToolCommand::AddLabel {
                    label: access.label.clone(),
                    resource: resource.clone(),
                    policy: access.policy.clone(),
                };
                let output = self.tool.exec(&command).await?;
                if !output.success() {
                    return Err(VmError::Policy(format!(
                        "failed to label {resource} with {}: {}",
                        access.label,
                        output.output.trim()
                    )));
                }
                tracing::debug!(resource = %resource, label = %access.label, "Resource labelled");
            }
        }
        Ok(())
    }
}
