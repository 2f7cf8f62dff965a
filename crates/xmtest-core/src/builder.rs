//! Builder for test domains.

use crate::context::HarnessContext;
use crate::device::NetDevice;
use crate::domain::{unique_name, DomainClass, DomainHandle};
use crate::error::Result;
use crate::settings::HarnessSettings;
use xmtest_vm::{ConfigDocument, ConfigValue};

/// Fluent builder for test domains.
///
/// The config starts from the architecture defaults of the domain class,
/// overlaid with any extra options.
///
/// # Example
///
/// ```no_run
/// use xmtest_core::{DomainBuilder, HarnessContext, HarnessSettings};
///
/// # async fn example() -> xmtest_core::Result<()> {
/// let ctx = HarnessContext::new(HarnessSettings::from_env());
/// let mut domain = DomainBuilder::new()
///     .extra_opt("memory", 128)
///     .with_network()
///     .build(&ctx)
///     .await?;
///
/// domain.start(false).await?;
/// domain.destroy().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct DomainBuilder {
    name: Option<String>,
    base_config: Option<Vec<(String, ConfigValue)>>,
    extra: Vec<(String, ConfigValue)>,
    managed: bool,
    class: Option<DomainClass>,
    network: bool,
}

impl DomainBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the domain name. A unique name is generated otherwise.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Start from these options instead of the architecture defaults.
    pub fn base_config<I, K, V>(mut self, opts: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        self.base_config = Some(
            opts.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        );
        self
    }

    /// Overlay one option on the base config.
    pub fn extra_opt(mut self, name: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.extra.push((name.into(), value.into()));
        self
    }

    /// Overlay several options on the base config, in order.
    pub fn extra_opts<I, K, V>(mut self, opts: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        self.extra
            .extend(opts.into_iter().map(|(name, value)| (name.into(), value.into())));
        self
    }

    /// Register the domain through `new` + `start`.
    pub fn managed(mut self, managed: bool) -> Self {
        self.managed = managed;
        self
    }

    /// Set the guest class. Defaults to the harness settings.
    pub fn class(mut self, class: DomainClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Give the domain one network interface, `eth0`.
    pub fn with_network(mut self) -> Self {
        self.network = true;
        self
    }

    fn resolved_class(&self, settings: &HarnessSettings) -> DomainClass {
        self.class.unwrap_or(settings.domain_class)
    }

    /// Build the domain config without creating a handle.
    pub fn build_config(&self, settings: &HarnessSettings) -> Result<ConfigDocument> {
        let mut config = match &settings.access_control {
            Some(access) => ConfigDocument::with_access_control(&access.policy, &access.label),
            None => ConfigDocument::new(),
        };

        match &self.base_config {
            Some(base) => config.set_opts(base.iter().map(|(k, v)| (k.as_str(), v.clone()))),
            None => config.set_opts(settings.arch_defaults(self.resolved_class(settings))?.options()),
        }
        config.set_opts(self.extra.iter().map(|(k, v)| (k.as_str(), v.clone())));

        match &self.name {
            Some(name) => config.set_opt("name", name.as_str()),
            None if config.name().map_or(true, str::is_empty) => {
                config.set_opt("name", unique_name())
            }
            None => {}
        }

        Ok(config)
    }

    /// Build the domain handle.
    pub async fn build(self, ctx: &HarnessContext) -> Result<DomainHandle> {
        let config = self.build_config(ctx.settings())?;
        let class = self.resolved_class(ctx.settings());
        let mut domain = DomainHandle::new(ctx.clone(), config, self.managed, class);

        if self.network {
            domain.new_device(NetDevice::new("eth0")).await?;
        }

        Ok(domain)
    }
}
