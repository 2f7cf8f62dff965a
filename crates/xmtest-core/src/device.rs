//! Virtual devices attached to a domain's configuration.
//!
//! Each device kind has its own typed constructor and contributes one entry
//! to a list option of the domain config (`disk`, `vif` or `vtpm`). Devices
//! may carry hook commands that run after the domain boots and when the
//! device is removed.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

/// A command run as part of a device hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Program run on the host (dom0)
    Host { program: String, args: Vec<String> },
    /// Command line typed into the guest console
    Guest(String),
}

impl DeviceCommand {
    /// Host-side command.
    pub fn host<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Host {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Guest-side command.
    pub fn guest(command: impl Into<String>) -> Self {
        Self::Guest(command.into())
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host { program, args } if args.is_empty() => write!(f, "{program}"),
            Self::Host { program, args } => write!(f, "{program} {}", args.join(" ")),
            Self::Guest(command) => write!(f, "{command}"),
        }
    }
}

/// The fixed set of device kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Virtual block device
    Block,
    /// Virtual network interface
    Net,
    /// Virtual TPM
    Vtpm,
}

impl DeviceKind {
    /// Config list option this kind contributes to.
    pub fn config_node(&self) -> &'static str {
        match self {
            Self::Block => "disk",
            Self::Net => "vif",
            Self::Vtpm => "vtpm",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Net => write!(f, "net"),
            Self::Vtpm => write!(f, "vtpm"),
        }
    }
}

/// Block device access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl BlockMode {
    fn flag(&self) -> &'static str {
        match self {
            Self::ReadWrite => "w",
            Self::ReadOnly => "r",
        }
    }
}

/// Virtual block device, e.g. `phy:/dev/ram0,hda1,w`.
///
/// The frontend device name is the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Backend resource (`phy:/dev/ram0`, `file:/images/disk.img`)
    pub backend: String,
    /// Guest device name (`hda1`, `xvda`)
    pub frontend: String,
    /// Access mode
    pub mode: BlockMode,
}

impl BlockDevice {
    /// Writable block device.
    pub fn new(backend: impl Into<String>, frontend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            frontend: frontend.into(),
            mode: BlockMode::ReadWrite,
        }
    }

    /// Make the device read-only.
    pub fn read_only(mut self) -> Self {
        self.mode = BlockMode::ReadOnly;
        self
    }

    fn config_entry(&self) -> String {
        format!("{},{},{}", self.backend, self.frontend, self.mode.flag())
    }
}

/// Default guest netmask for network devices given an IP.
pub const DEFAULT_NETMASK: &str = "255.255.255.0";

/// Virtual network interface. The guest interface name is the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetDevice {
    /// Guest interface name (`eth0`)
    pub iface: String,
    /// Guest MAC address
    pub mac: Option<String>,
    /// Guest IP address, configured through the console after boot
    pub ip: Option<String>,
    /// Guest netmask
    pub netmask: String,
    /// Host bridge
    pub bridge: Option<String>,
}

impl NetDevice {
    /// Interface with tool-chosen MAC and no guest address.
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            mac: None,
            ip: None,
            netmask: DEFAULT_NETMASK.to_string(),
            bridge: None,
        }
    }

    /// Set the guest MAC address.
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    /// Set the guest IP address and netmask.
    pub fn with_ip(mut self, ip: impl Into<String>, netmask: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self.netmask = netmask.into();
        self
    }

    /// Attach to a host bridge.
    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = Some(bridge.into());
        self
    }

    fn config_entry(&self) -> String {
        let mut parts = Vec::new();
        if let Some(mac) = &self.mac {
            parts.push(format!("mac={mac}"));
        }
        if let Some(ip) = &self.ip {
            parts.push(format!("ip={ip}"));
        }
        if let Some(bridge) = &self.bridge {
            parts.push(format!("bridge={bridge}"));
        }
        parts.join(",")
    }

    fn add_commands(&self) -> Vec<DeviceCommand> {
        match &self.ip {
            Some(ip) => vec![DeviceCommand::guest(format!(
                "ifconfig {} {} netmask {} up",
                self.iface, ip, self.netmask
            ))],
            None => Vec::new(),
        }
    }

    fn remove_commands(&self) -> Vec<DeviceCommand> {
        match &self.ip {
            Some(_) => vec![DeviceCommand::guest(format!("ifconfig {} down", self.iface))],
            None => Vec::new(),
        }
    }
}

/// Virtual TPM device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtpmDevice {
    /// Identifier within the domain
    pub id: String,
    /// Requested TPM instance
    pub instance: Option<u32>,
    /// Backend domain id
    pub backend: u32,
}

impl VtpmDevice {
    /// vTPM served by dom0.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance: None,
            backend: 0,
        }
    }

    /// Request a specific TPM instance.
    pub fn with_instance(mut self, instance: u32) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Serve the vTPM from another domain.
    pub fn with_backend(mut self, backend: u32) -> Self {
        self.backend = backend;
        self
    }

    fn config_entry(&self) -> String {
        match self.instance {
            Some(instance) => format!("instance={instance},backend={}", self.backend),
            None => format!("backend={}", self.backend),
        }
    }
}

/// A device to add to a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    Block(BlockDevice),
    Net(NetDevice),
    Vtpm(VtpmDevice),
}

impl DeviceSpec {
    /// Identifier, unique within a domain.
    pub fn id(&self) -> &str {
        match self {
            Self::Block(dev) => &dev.frontend,
            Self::Net(dev) => &dev.iface,
            Self::Vtpm(dev) => &dev.id,
        }
    }

    /// Device kind.
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Block(_) => DeviceKind::Block,
            Self::Net(_) => DeviceKind::Net,
            Self::Vtpm(_) => DeviceKind::Vtpm,
        }
    }

    /// Entry appended to the config list option.
    pub fn config_entry(&self) -> String {
        match self {
            Self::Block(dev) => dev.config_entry(),
            Self::Net(dev) => dev.config_entry(),
            Self::Vtpm(dev) => dev.config_entry(),
        }
    }

    fn add_commands(&self) -> Vec<DeviceCommand> {
        match self {
            Self::Net(dev) => dev.add_commands(),
            _ => Vec::new(),
        }
    }

    fn remove_commands(&self) -> Vec<DeviceCommand> {
        match self {
            Self::Net(dev) => dev.remove_commands(),
            _ => Vec::new(),
        }
    }
}

impl From<BlockDevice> for DeviceSpec {
    fn from(dev: BlockDevice) -> Self {
        Self::Block(dev)
    }
}

impl From<NetDevice> for DeviceSpec {
    fn from(dev: NetDevice) -> Self {
        Self::Net(dev)
    }
}

impl From<VtpmDevice> for DeviceSpec {
    fn from(dev: VtpmDevice) -> Self {
        Self::Vtpm(dev)
    }
}

/// A device bound to a domain.
#[derive(Debug, Clone)]
pub struct Device {
    domain: String,
    spec: DeviceSpec,
    entry: String,
    add_commands: Vec<DeviceCommand>,
    remove_commands: Vec<DeviceCommand>,
}

impl Device {
    pub(crate) fn bind(spec: DeviceSpec, domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            entry: spec.config_entry(),
            add_commands: spec.add_commands(),
            remove_commands: spec.remove_commands(),
            spec,
        }
    }

    /// Identifier.
    pub fn id(&self) -> &str {
        self.spec.id()
    }

    /// Name of the owning domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Device kind.
    pub fn kind(&self) -> DeviceKind {
        self.spec.kind()
    }

    /// The typed description this device was created from.
    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// Config list option this device contributes to.
    pub fn config_node(&self) -> &'static str {
        self.spec.kind().config_node()
    }

    /// Entry this device contributes to its config option.
    pub fn config_entry(&self) -> &str {
        &self.entry
    }

    /// Commands run after the domain has started.
    pub fn add_commands(&self) -> &[DeviceCommand] {
        &self.add_commands
    }

    /// Commands run when the device is removed.
    pub fn remove_commands(&self) -> &[DeviceCommand] {
        &self.remove_commands
    }

    /// Run `command` after the domain has started.
    pub fn push_add_command(&mut self, command: DeviceCommand) {
        self.add_commands.push(command);
    }

    /// Run `command` when the device is removed.
    pub fn push_remove_command(&mut self, command: DeviceCommand) {
        self.remove_commands.push(command);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entry)
    }
}

/// Devices of one domain, keyed and iterated by identifier.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Device>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Register a device, returning a reference to it. An existing device
    /// with the same identifier is replaced.
    pub(crate) fn insert(&mut self, device: Device) -> &mut Device {
        match self.devices.entry(device.id().to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(device);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(device),
        }
    }

    /// Unregister a device.
    pub(crate) fn remove(&mut self, id: &str) -> Option<Device> {
        self.devices.remove(id)
    }

    /// Look up a device.
    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Look up a device for adding hook commands.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    /// Identifiers in iteration order.
    pub fn ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Devices in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_entry() {
        let spec = DeviceSpec::from(BlockDevice::new("phy:/dev/ram0", "hda1"));
        assert_eq!(spec.id(), "hda1");
        assert_eq!(spec.kind().config_node(), "disk");
        assert_eq!(spec.config_entry(), "phy:/dev/ram0,hda1,w");

        let spec = DeviceSpec::from(BlockDevice::new("file:/img/disk.img", "xvdb").read_only());
        assert_eq!(spec.config_entry(), "file:/img/disk.img,xvdb,r");
    }

    #[test]
    fn test_net_entry_and_hooks() {
        let spec = DeviceSpec::from(
            NetDevice::new("eth0")
                .with_mac("00:16:3e:00:00:01")
                .with_ip("169.254.0.2", "255.255.0.0")
                .with_bridge("xenbr0"),
        );
        assert_eq!(spec.kind().config_node(), "vif");
        assert_eq!(
            spec.config_entry(),
            "mac=00:16:3e:00:00:01,ip=169.254.0.2,bridge=xenbr0"
        );

        let device = Device::bind(spec, "dom");
        assert_eq!(
            device.add_commands(),
            &[DeviceCommand::guest(
                "ifconfig eth0 169.254.0.2 netmask 255.255.0.0 up"
            )]
        );
        assert_eq!(
            device.remove_commands(),
            &[DeviceCommand::guest("ifconfig eth0 down")]
        );
    }

    #[test]
    fn test_net_without_ip_has_no_hooks() {
        let device = Device::bind(NetDevice::new("eth1").into(), "dom");
        assert_eq!(device.config_entry(), "");
        assert!(device.add_commands().is_empty());
        assert!(device.remove_commands().is_empty());
    }

    #[test]
    fn test_vtpm_entry() {
        let spec = DeviceSpec::from(VtpmDevice::new("vtpm0"));
        assert_eq!(spec.config_entry(), "backend=0");
        assert_eq!(spec.kind().config_node(), "vtpm");

        let spec = DeviceSpec::from(VtpmDevice::new("vtpm0").with_instance(2).with_backend(1));
        assert_eq!(spec.config_entry(), "instance=2,backend=1");
    }

    #[test]
    fn test_registry_order_and_lookup() {
        let mut registry = DeviceRegistry::new();
        registry.insert(Device::bind(NetDevice::new("eth1").into(), "dom"));
        registry.insert(Device::bind(NetDevice::new("eth0").into(), "dom"));

        assert_eq!(registry.ids(), vec!["eth0", "eth1"]);
        assert!(registry.contains("eth0"));
        assert_eq!(registry.get("eth1").map(|d| d.domain()), Some("dom"));

        assert!(registry.remove("eth0").is_some());
        assert!(registry.remove("eth0").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_host_command_display() {
        let cmd = DeviceCommand::host("brctl", ["show"]);
        assert_eq!(cmd.to_string(), "brctl show");
        let cmd = DeviceCommand::host("true", Vec::<String>::new());
        assert_eq!(cmd.to_string(), "true");
    }
}
