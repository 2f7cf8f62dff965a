//! DomainHandle - lifecycle of one guest domain driven through the control
//! tool.

use crate::console::ConsoleSession;
use crate::context::HarnessContext;
use crate::device::{Device, DeviceCommand, DeviceRegistry, DeviceSpec};
use crate::error::{CoreError, DeviceError, DomainError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;
use xmtest_vm::{ConfigDocument, ToolCommand};

/// Input sent to a freshly attached console to activate it.
const CONSOLE_ACTIVATION_INPUT: &str = "input";

/// Guest execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainClass {
    /// Paravirtualized guest
    #[default]
    Pv,
    /// Fully virtualized guest
    Hvm,
}

impl fmt::Display for DomainClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainClass::Pv => write!(f, "PV"),
            DomainClass::Hvm => write!(f, "HVM"),
        }
    }
}

impl FromStr for DomainClass {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pv" => Ok(Self::Pv),
            "hvm" => Ok(Self::Hvm),
            other => Err(CoreError::Settings(format!("unknown domain class: {other}"))),
        }
    }
}

/// Lifecycle state as seen by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    /// Not started yet
    Unstarted,
    /// Created or started successfully
    Running,
    /// Shut down or destroyed
    Stopped,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainState::Unstarted => write!(f, "unstarted"),
            DomainState::Running => write!(f, "running"),
            DomainState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Domain name derived from `program` and a unix timestamp.
///
/// The program's file name is used with any `.test` suffix and every `/`
/// and `.` removed: `./01_create_basic.test` at 1700000000 becomes
/// `01_create_basic-1700000000`.
pub fn unique_name_for(program: &str, unix_ts: i64) -> String {
    let base = Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());
    let stem: String = base.replace(".test", "").replace(['/', '.'], "");
    let stem = if stem.is_empty() { "xmtest".to_string() } else { stem };
    format!("{stem}-{unix_ts}")
}

/// Unique domain name for the running program.
///
/// [`unique_name_for`] with the current time, followed by a short random
/// suffix so names generated within the same second differ.
pub fn unique_name() -> String {
    let program = std::env::args().next().unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        unique_name_for(&program, chrono::Utc::now().timestamp()),
        &suffix[..8]
    )
}

/// A guest domain and everything the harness knows about it.
///
/// The handle exclusively owns the domain's config, devices and console.
/// Only the handle closes a console: sessions are dropped by
/// [`close_console`](Self::close_console), [`get_console`](Self::get_console)
/// and the stop/destroy paths.
pub struct DomainHandle {
    /// Domain name, also the config's `name` option
    name: String,
    /// Configuration handed to the control tool
    config: ConfigDocument,
    /// At most one open console
    console: Option<Box<dyn ConsoleSession>>,
    /// Attached devices
    devices: DeviceRegistry,
    /// Registered through `new` + `start` rather than `create`
    managed: bool,
    /// Guest execution mode
    class: DomainClass,
    /// Lifecycle state
    state: DomainState,
    /// Network environment (`bridge`, `nat` or `route`)
    net_env: String,
    /// Config file last handed to the tool, removed on destroy
    config_path: Option<PathBuf>,
    ctx: HarnessContext,
}

impl DomainHandle {
    /// Wrap `config` in a handle.
    ///
    /// The name is taken from the config's `name` option, or generated and
    /// written back to the config when unset. `XM_MANAGED_DOMAINS` in the
    /// harness settings forces managed mode.
    pub fn new(
        ctx: HarnessContext,
        mut config: ConfigDocument,
        managed: bool,
        class: DomainClass,
    ) -> Self {
        let name = match config.name().filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => {
                let name = unique_name();
                config.set_opt("name", name.as_str());
                name
            }
        };
        let managed = managed || ctx.settings().managed_domains;

        tracing::debug!(domain = %name, managed, class = %class, "Domain handle created");

        Self {
            name,
            config,
            console: None,
            devices: DeviceRegistry::new(),
            managed,
            class,
            state: DomainState::Unstarted,
            net_env: "bridge".to_string(),
            config_path: None,
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConfigDocument {
        &self.config
    }

    /// Mutable config, for tests that tweak options before starting.
    pub fn config_mut(&mut self) -> &mut ConfigDocument {
        &mut self.config
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn class(&self) -> DomainClass {
        self.class
    }

    pub fn state(&self) -> DomainState {
        self.state
    }

    /// Network environment of the host (`bridge` unless changed).
    pub fn net_env(&self) -> &str {
        &self.net_env
    }

    pub fn set_net_env(&mut self, net_env: impl Into<String>) {
        self.net_env = net_env.into();
    }

    /// Smallest memory size, in MiB, guests of this class boot with.
    pub fn min_safe_mem(&self) -> Result<u32> {
        Ok(self.ctx.settings().arch_defaults(self.class)?.min_safe_mem_mib)
    }

    /// Start the domain.
    ///
    /// Unmanaged domains are created in one step; managed domains are
    /// defined, then started, and tracked once defined. A failed define is
    /// rolled back with `delete`. HVM guests are then waited on, bounded by
    /// the boot timeout, and every device's add hooks run.
    ///
    /// Returns the console unless `suppress_console` is set, in which case
    /// any open console is closed.
    ///
    /// # Errors
    /// [`DomainError`] when the tool refuses to create or start the domain,
    /// [`CoreError::BootTimeout`] when an HVM guest does not come up in time.
    pub async fn start(
        &mut self,
        suppress_console: bool,
    ) -> Result<Option<&mut Box<dyn ConsoleSession>>> {
        let settings = self.ctx.settings();
        let path = self
            .config
            .persist_transient(&settings.work_dir, self.ctx.security_policy())
            .await?;
        self.config_path = Some(path.clone());
        let tool = self.ctx.tool().clone();

        tracing::info!(domain = %self.name, managed = self.managed, config = %path.display(), "Starting domain");

        if self.managed {
            let defined = tool.exec(&ToolCommand::Define(path.clone())).await?;
            if !defined.success() {
                let deleted = tool.exec(&ToolCommand::Delete(self.name.clone())).await?;
                tracing::warn!(
                    domain = %self.name,
                    code = defined.code,
                    delete_code = deleted.code,
                    "Domain define failed, rolled back"
                );
                return Err(
                    DomainError::new("Failed to create domain", defined.output, defined.code)
                        .into(),
                );
            }

            let started = tool.exec(&ToolCommand::Start(self.name.clone())).await?;
            self.ctx.tracker().track(&self.name);
            if !started.success() {
                return Err(
                    DomainError::new("Failed to create domain", started.output, started.code)
                        .into(),
                );
            }
        } else {
            let created = tool.exec(&ToolCommand::Create(path)).await?;
            if !created.success() {
                return Err(
                    DomainError::new("Failed to create domain", created.output, created.code)
                        .into(),
                );
            }
        }

        self.state = DomainState::Running;

        if self.class == DomainClass::Hvm {
            let timeout = self.ctx.settings().boot_timeout;
            tokio::time::timeout(timeout, self.ctx.boot_waiter().wait_for_boot(&self.name))
                .await
                .map_err(|_| CoreError::BootTimeout {
                    domain: self.name.clone(),
                    timeout,
                })??;
        }

        self.run_add_hooks().await?;

        tracing::info!(domain = %self.name, "Domain started");

        match (self.console.is_some(), suppress_console) {
            (true, true) => {
                self.close_console();
                Ok(None)
            }
            (true, false) => Ok(self.console.as_mut()),
            (false, false) => self.get_console().await.map(Some),
            (false, true) => Ok(None),
        }
    }

    async fn run_add_hooks(&mut self) -> Result<()> {
        let hooks: Vec<(String, DeviceCommand)> = self
            .devices
            .iter()
            .flat_map(|dev| {
                dev.add_commands()
                    .iter()
                    .map(move |cmd| (dev.id().to_string(), cmd.clone()))
            })
            .collect();

        for (id, command) in hooks {
            match &command {
                DeviceCommand::Host { program, args } => {
                    let output = self.ctx.tool().run_host(program, args).await?;
                    if !output.success() {
                        return Err(DeviceError::HookFailed {
                            id,
                            command: command.to_string(),
                            code: output.code,
                            output: output.output,
                        }
                        .into());
                    }
                }
                DeviceCommand::Guest(line) => {
                    if self.console.is_none() {
                        self.get_console().await?;
                    }
                    if let Some(console) = self.console.as_mut() {
                        console.send_input(line).await?;
                    }
                }
            }
            tracing::debug!(domain = %self.name, device = %id, command = %command, "Device hook ran");
        }
        Ok(())
    }

    /// Gracefully shut the domain down.
    ///
    /// Devices are removed and the console closed first. Returns the tool's
    /// exit code; a nonzero code is not an error.
    pub async fn stop(&mut self) -> Result<i32> {
        self.remove_all_devices().await?;
        self.close_console();

        let output = self
            .ctx
            .tool()
            .exec(&ToolCommand::Shutdown(self.name.clone()))
            .await?;
        self.state = DomainState::Stopped;

        tracing::info!(domain = %self.name, code = output.code, "Domain shut down");
        Ok(output.code)
    }

    /// Forcibly destroy the domain, and delete it from the tool's store when
    /// managed.
    ///
    /// Devices are removed and the console closed first, and the config file
    /// written by [`start`](Self::start) is deleted afterwards. Returns the
    /// exit code of the last tool command run (`delete` when managed); a
    /// nonzero code is not an error. Calling it again is harmless.
    pub async fn destroy(&mut self) -> Result<i32> {
        self.remove_all_devices().await?;
        self.close_console();

        let tool = self.ctx.tool().clone();
        let mut output = tool.exec(&ToolCommand::Destroy(self.name.clone())).await?;
        if self.managed {
            output = tool.exec(&ToolCommand::Delete(self.name.clone())).await?;
            self.ctx.tracker().untrack(&self.name);
        }
        self.state = DomainState::Stopped;

        if let Some(path) = self.config_path.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(domain = %self.name, path = %path.display(), error = %e, "Failed to remove config file");
            }
        }

        tracing::info!(domain = %self.name, code = output.code, "Domain destroyed");
        Ok(output.code)
    }

    /// Whether the hypervisor currently knows the domain.
    pub async fn is_running(&self) -> Result<bool> {
        self.ctx.state_query().is_running(&self.name).await
    }

    /// Numeric domain id, `-1` when the domain is not known.
    pub async fn domain_id(&self) -> Result<i64> {
        Ok(self
            .ctx
            .tool()
            .domid(&self.name)
            .await?
            .map(i64::from)
            .unwrap_or(-1))
    }

    /// Attach a new device to the domain's config.
    ///
    /// # Errors
    /// [`DeviceError::Duplicate`] when the identifier is taken and
    /// [`CoreError::LiveAttachUnsupported`] when the domain is running. In
    /// both cases nothing is changed.
    pub async fn new_device(&mut self, spec: impl Into<DeviceSpec>) -> Result<&mut Device> {
        let spec = spec.into();
        let id = spec.id().to_string();

        if self.devices.contains(&id) {
            return Err(DeviceError::Duplicate {
                domain: self.name.clone(),
                id,
            }
            .into());
        }

        if self.is_running().await? {
            // TODO: hot-plug through block-attach/network-attach once device
            // kinds carry their attach commands.
            return Err(CoreError::LiveAttachUnsupported {
                domain: self.name.clone(),
                device: id,
            });
        }

        let device = Device::bind(spec, &self.name);
        self.config
            .append_opt(device.config_node(), device.config_entry());
        tracing::debug!(domain = %self.name, device = %id, kind = %device.kind(), "Device added");

        Ok(self.devices.insert(device))
    }

    /// Remove a device: run its removal hooks, then drop it from the
    /// registry and the config. No-op when `id` is unknown.
    ///
    /// Removal hooks are best effort: a hook that fails or cannot run is
    /// logged and the device is removed anyway. Guest-side hooks need an
    /// open console and are skipped without one.
    pub async fn remove_device(&mut self, id: &str) -> Result<()> {
        let Some(device) = self.devices.get(id) else {
            return Ok(());
        };
        let hooks = device.remove_commands().to_vec();

        for command in &hooks {
            match command {
                DeviceCommand::Host { program, args } => {
                    match self.ctx.tool().run_host(program, args).await {
                        Ok(output) if !output.success() => {
                            tracing::warn!(
                                domain = %self.name,
                                device = id,
                                command = %command,
                                code = output.code,
                                "Device removal hook failed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(domain = %self.name, device = id, command = %command, error = %e, "Device removal hook did not run");
                        }
                    }
                }
                DeviceCommand::Guest(line) => match self.console.as_mut() {
                    Some(console) => {
                        if let Err(e) = console.send_input(line).await {
                            tracing::warn!(domain = %self.name, device = id, command = %command, error = %e, "Console removal hook failed");
                        }
                    }
                    None => {
                        tracing::debug!(domain = %self.name, device = id, command = %command, "No console, skipping removal hook");
                    }
                },
            }
        }

        if let Some(device) = self.devices.remove(id) {
            self.config
                .remove_entry(device.config_node(), device.config_entry());
            tracing::debug!(domain = %self.name, device = id, "Device removed");
        }
        Ok(())
    }

    /// Remove every device.
    pub async fn remove_all_devices(&mut self) -> Result<()> {
        for id in self.devices.ids() {
            self.remove_device(&id).await?;
        }
        Ok(())
    }

    /// Look up a device.
    ///
    /// # Errors
    /// [`DeviceError::NotFound`] when `id` is unknown.
    pub fn device(&self, id: &str) -> Result<&Device> {
        self.devices.get(id).ok_or_else(|| {
            DeviceError::NotFound {
                domain: self.name.clone(),
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Look up a device for adding hook commands.
    pub fn device_mut(&mut self, id: &str) -> Result<&mut Device> {
        let domain = self.name.clone();
        self.devices.get_mut(id).ok_or_else(|| {
            DeviceError::NotFound {
                domain,
                id: id.to_string(),
            }
            .into()
        })
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Open a fresh console, closing any open one first, and activate it.
    pub async fn get_console(&mut self) -> Result<&mut Box<dyn ConsoleSession>> {
        self.close_console();

        let mut console = self.ctx.console_factory().open(&self.name).await?;
        console.send_input(CONSOLE_ACTIVATION_INPUT).await?;
        tracing::debug!(domain = %self.name, "Console attached");

        Ok(self.console.insert(console))
    }

    /// The open console, if any.
    pub fn console(&mut self) -> Option<&mut Box<dyn ConsoleSession>> {
        self.console.as_mut()
    }

    /// Close the open console. Its history is gone afterwards.
    pub fn close_console(&mut self) {
        if self.console.take().is_some() {
            tracing::debug!(domain = %self.name, "Console closed");
        }
    }
}

impl fmt::Debug for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainHandle")
            .field("name", &self.name)
            .field("managed", &self.managed)
            .field("class", &self.class)
            .field("state", &self.state)
            .field("devices", &self.devices.ids())
            .field("console_open", &self.console.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::HarnessSettings;

    #[test]
    fn test_unique_name_for() {
        assert_eq!(
            unique_name_for("./01_create_basic.test", 1_700_000_000),
            "01_create_basic-1700000000"
        );
        assert_eq!(
            unique_name_for("/usr/lib/xm-test/tests/create/07_create_mem64", 5),
            "07_create_mem64-5"
        );
        assert_eq!(unique_name_for("", 5), "xmtest-5");
    }

    #[test]
    fn test_unique_name_has_timestamp_and_suffix() {
        let name = unique_name();
        let (rest, suffix) = name.rsplit_once('-').unwrap();
        let (_, ts) = rest.rsplit_once('-').unwrap();
        assert!(ts.parse::<i64>().unwrap() > 0);
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_unique_names_differ_within_a_second() {
        assert_ne!(unique_name(), unique_name());
    }

    #[test]
    fn test_domain_class_parse_and_display() {
        assert_eq!("hvm".parse::<DomainClass>().unwrap(), DomainClass::Hvm);
        assert_eq!("PV".parse::<DomainClass>().unwrap(), DomainClass::Pv);
        assert!("kvm".parse::<DomainClass>().is_err());
        assert_eq!(DomainClass::Hvm.to_string(), "HVM");
        assert_eq!(DomainState::Running.to_string(), "running");
    }

    #[test]
    fn test_new_takes_name_from_config() {
        let ctx = HarnessContext::new(HarnessSettings::default());
        let mut config = ConfigDocument::new();
        config.set_opt("name", "dom1");

        let dom = DomainHandle::new(ctx, config, false, DomainClass::Pv);
        assert_eq!(dom.name(), "dom1");
        assert_eq!(dom.state(), DomainState::Unstarted);
        assert_eq!(dom.net_env(), "bridge");
        assert!(!dom.is_managed());
    }

    #[test]
    fn test_new_generates_name() {
        let ctx = HarnessContext::new(HarnessSettings::default());
        let dom = DomainHandle::new(ctx, ConfigDocument::new(), false, DomainClass::Pv);
        assert!(!dom.name().is_empty());
        assert_eq!(dom.config().name(), Some(dom.name()));
    }

    #[test]
    fn test_settings_force_managed() {
        let settings = HarnessSettings {
            managed_domains: true,
            ..HarnessSettings::default()
        };
        let ctx = HarnessContext::new(settings);
        let dom = DomainHandle::new(ctx, ConfigDocument::new(), false, DomainClass::Pv);
        assert!(dom.is_managed());
    }

    #[test]
    fn test_device_lookup_not_found() {
        let ctx = HarnessContext::new(HarnessSettings::default());
        let dom = DomainHandle::new(ctx, ConfigDocument::new(), false, DomainClass::Pv);
        let err = dom.device("eth0").unwrap_err();
        assert!(matches!(err, CoreError::Device(DeviceError::NotFound { .. })));
    }
}
