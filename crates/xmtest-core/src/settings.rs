//! Harness settings.
//!
//! Settings are loaded from environment variables with sensible defaults.

use crate::acm::{AccessLabel, DEFAULT_ACM_LABEL, DEFAULT_ACM_POLICY};
use crate::arch::ArchDefaults;
use crate::boot::DEFAULT_BOOT_DELAY;
use crate::domain::DomainClass;
use crate::error::Result;
use std::path::PathBuf;
use std::time::Duration;
use xmtest_vm::DEFAULT_TOOL;

/// Default upper bound on waiting for an HVM guest to boot.
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings shared by every domain of a test run.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    /// Control tool program (`xm` or `xl`)
    pub tool: String,

    /// Create domains through `new` + `start` instead of `create`
    pub managed_domains: bool,

    /// Guest class for domains that do not choose one
    pub domain_class: DomainClass,

    /// Directory for generated config files
    pub work_dir: PathBuf,

    /// Bound on the HVM boot wait
    pub boot_timeout: Duration,

    /// Fixed delay used by the default boot waiter
    pub boot_delay: Duration,

    /// Access-control label applied to new domains, `None` when disabled
    pub access_control: Option<AccessLabel>,

    /// TOML file overriding the built-in architecture defaults
    pub arch_defaults_path: Option<PathBuf>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            tool: DEFAULT_TOOL.to_string(),
            managed_domains: false,
            domain_class: DomainClass::Pv,
            work_dir: PathBuf::from("/tmp/xm-test"),
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            boot_delay: DEFAULT_BOOT_DELAY,
            access_control: None,
            arch_defaults_path: None,
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl HarnessSettings {
    /// Load settings from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `XM_TEST_TOOL` | `xm` |
    /// | `XM_MANAGED_DOMAINS` | unset (legacy `create`) |
    /// | `XM_TEST_HVM` | unset (PV guests) |
    /// | `XM_TEST_WORKDIR` | `/tmp/xm-test` |
    /// | `XM_TEST_BOOT_TIMEOUT` | `60` (seconds) |
    /// | `XM_TEST_BOOT_DELAY` | `20` (seconds) |
    /// | `XM_TEST_ACM` | unset (no labelling) |
    /// | `XM_TEST_ACM_POLICY` | `xm-test` |
    /// | `XM_TEST_ACM_LABEL` | `red` |
    /// | `XM_TEST_ARCH_DEFAULTS` | unset (built-in defaults) |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let seconds = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        let access_control = lookup("XM_TEST_ACM")
            .filter(|v| truthy(v))
            .map(|_| AccessLabel {
                policy: lookup("XM_TEST_ACM_POLICY")
                    .unwrap_or_else(|| DEFAULT_ACM_POLICY.to_string()),
                label: lookup("XM_TEST_ACM_LABEL")
                    .unwrap_or_else(|| DEFAULT_ACM_LABEL.to_string()),
            });

        Self {
            tool: lookup("XM_TEST_TOOL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default.tool),
            managed_domains: lookup("XM_MANAGED_DOMAINS")
                .map(|v| truthy(&v))
                .unwrap_or(default.managed_domains),
            domain_class: lookup("XM_TEST_HVM")
                .map(|v| {
                    if truthy(&v) {
                        DomainClass::Hvm
                    } else {
                        DomainClass::Pv
                    }
                })
                .unwrap_or(default.domain_class),
            work_dir: lookup("XM_TEST_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or(default.work_dir),
            boot_timeout: seconds("XM_TEST_BOOT_TIMEOUT").unwrap_or(default.boot_timeout),
            boot_delay: seconds("XM_TEST_BOOT_DELAY").unwrap_or(default.boot_delay),
            access_control,
            arch_defaults_path: lookup("XM_TEST_ARCH_DEFAULTS").map(PathBuf::from),
        }
    }

    /// Architecture defaults for `class`: the configured TOML file when set,
    /// else the built-in set.
    pub fn arch_defaults(&self, class: DomainClass) -> Result<ArchDefaults> {
        match &self.arch_defaults_path {
            Some(path) => ArchDefaults::from_file(path),
            None => Ok(ArchDefaults::for_class(class)),
        }
    }

    /// Log warnings for settings that will make domain operations fail.
    pub fn validate_warn(&self) {
        if let Some(path) = &self.arch_defaults_path {
            if !path.exists() {
                tracing::warn!("Architecture defaults not found: {:?}", path);
            }
        }

        if self.boot_delay > self.boot_timeout {
            tracing::warn!(
                delay_secs = self.boot_delay.as_secs(),
                timeout_secs = self.boot_timeout.as_secs(),
                "Boot delay exceeds boot timeout, HVM starts will time out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_settings() {
        let settings = HarnessSettings::default();
        assert_eq!(settings.tool, "xm");
        assert!(!settings.managed_domains);
        assert_eq!(settings.domain_class, DomainClass::Pv);
        assert_eq!(settings.work_dir, PathBuf::from("/tmp/xm-test"));
        assert_eq!(settings.boot_timeout, Duration::from_secs(60));
        assert!(settings.access_control.is_none());
    }

    #[test]
    fn test_from_empty_lookup_uses_defaults() {
        let settings = HarnessSettings::from_lookup(|_| None);
        let default = HarnessSettings::default();
        assert_eq!(settings.tool, default.tool);
        assert_eq!(settings.work_dir, default.work_dir);
        assert_eq!(settings.boot_delay, default.boot_delay);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let settings = HarnessSettings::from_lookup(lookup_from(&[
            ("XM_TEST_TOOL", "xl"),
            ("XM_MANAGED_DOMAINS", "yes"),
            ("XM_TEST_HVM", "1"),
            ("XM_TEST_WORKDIR", "/var/tmp/run"),
            ("XM_TEST_BOOT_TIMEOUT", "90"),
            ("XM_TEST_BOOT_DELAY", "bogus"),
        ]));

        assert_eq!(settings.tool, "xl");
        assert!(settings.managed_domains);
        assert_eq!(settings.domain_class, DomainClass::Hvm);
        assert_eq!(settings.work_dir, PathBuf::from("/var/tmp/run"));
        assert_eq!(settings.boot_timeout, Duration::from_secs(90));
        assert_eq!(settings.boot_delay, DEFAULT_BOOT_DELAY);
    }

    #[test]
    fn test_falsy_flags() {
        let settings = HarnessSettings::from_lookup(lookup_from(&[
            ("XM_MANAGED_DOMAINS", "0"),
            ("XM_TEST_HVM", "false"),
            ("XM_TEST_ACM", "no"),
        ]));
        assert!(!settings.managed_domains);
        assert_eq!(settings.domain_class, DomainClass::Pv);
        assert!(settings.access_control.is_none());
    }

    #[test]
    fn test_access_control() {
        let settings = HarnessSettings::from_lookup(lookup_from(&[
            ("XM_TEST_ACM", "true"),
            ("XM_TEST_ACM_LABEL", "blue"),
        ]));
        assert_eq!(
            settings.access_control,
            Some(AccessLabel {
                policy: "xm-test".into(),
                label: "blue".into(),
            })
        );
    }

    #[test]
    fn test_arch_defaults_builtin() {
        let settings = HarnessSettings::default();
        let arch = settings.arch_defaults(DomainClass::Hvm).unwrap();
        assert_eq!(arch.min_safe_mem_mib, 54);
    }
}
