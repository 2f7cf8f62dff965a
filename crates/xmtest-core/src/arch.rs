//! Architecture defaults: base config options, kernel and ramdisk locations.

use crate::domain::DomainClass;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use xmtest_vm::ConfigValue;

fn default_kernel() -> PathBuf {
    PathBuf::from("/boot/vmlinuz-xen")
}

fn default_ramdisk_dir() -> PathBuf {
    PathBuf::from("/usr/share/xm-test/ramdisk")
}

fn default_min_safe_mem() -> u32 {
    32
}

/// Default option set and paths for one guest class.
///
/// Loadable from TOML:
///
/// ```toml
/// default_kernel = "/boot/vmlinuz-2.6-xen"
/// min_safe_mem_mib = 32
///
/// [options]
/// memory = 64
/// vcpus = 1
/// root = "/dev/ram0"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchDefaults {
    /// Kernel used when a test does not choose one
    #[serde(default = "default_kernel")]
    pub default_kernel: PathBuf,
    /// Directory holding the test ramdisk and disk images
    #[serde(default = "default_ramdisk_dir")]
    pub ramdisk_dir: PathBuf,
    /// Smallest memory size a guest boots reliably with
    #[serde(default = "default_min_safe_mem")]
    pub min_safe_mem_mib: u32,
    /// Base config options
    #[serde(default)]
    pub options: BTreeMap<String, ConfigValue>,
}

impl ArchDefaults {
    /// Paravirtualized guest defaults.
    pub fn pv() -> Self {
        let kernel = default_kernel();
        let ramdisk_dir = default_ramdisk_dir();

        let mut options = BTreeMap::new();
        options.insert("memory".into(), ConfigValue::Int(64));
        options.insert("vcpus".into(), ConfigValue::Int(1));
        options.insert(
            "kernel".into(),
            ConfigValue::from(kernel.to_string_lossy().into_owned()),
        );
        options.insert(
            "ramdisk".into(),
            ConfigValue::from(ramdisk_dir.join("initrd.img").to_string_lossy().into_owned()),
        );
        options.insert("root".into(), ConfigValue::from("/dev/ram0"));

        Self {
            default_kernel: kernel,
            ramdisk_dir,
            min_safe_mem_mib: default_min_safe_mem(),
            options,
        }
    }

    /// Fully virtualized (HVM) guest defaults.
    pub fn hvm() -> Self {
        let ramdisk_dir = default_ramdisk_dir();
        let disk = format!("file:{},ioemu:hda,w", ramdisk_dir.join("disk.img").display());

        let mut options = BTreeMap::new();
        options.insert("memory".into(), ConfigValue::Int(64));
        options.insert("vcpus".into(), ConfigValue::Int(1));
        options.insert("acpi".into(), ConfigValue::Int(0));
        options.insert("apic".into(), ConfigValue::Int(0));
        options.insert("disk".into(), ConfigValue::List(vec![disk]));
        options.insert(
            "kernel".into(),
            ConfigValue::from("/usr/lib/xen/boot/hvmloader"),
        );
        options.insert("builder".into(), ConfigValue::from("hvm"));
        options.insert("sdl".into(), ConfigValue::Int(0));
        options.insert("vnc".into(), ConfigValue::Int(0));
        options.insert("vncviewer".into(), ConfigValue::Int(0));
        options.insert("nographic".into(), ConfigValue::Int(1));
        options.insert("serial".into(), ConfigValue::from("pty"));

        Self {
            default_kernel: PathBuf::from("/usr/lib/xen/boot/hvmloader"),
            ramdisk_dir,
            min_safe_mem_mib: 54,
            options,
        }
    }

    /// Built-in defaults for a guest class.
    pub fn for_class(class: DomainClass) -> Self {
        match class {
            DomainClass::Pv => Self::pv(),
            DomainClass::Hvm => Self::hvm(),
        }
    }

    /// Parse defaults from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CoreError::Settings(format!("arch defaults: {e}")))
    }

    /// Load defaults from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Settings(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Base options, for [`xmtest_vm::ConfigDocument::set_opts`].
    pub fn options(&self) -> impl Iterator<Item = (&str, ConfigValue)> + '_ {
        self.options
            .iter()
            .map(|(name, value)| (name.as_str(), value.clone()))
    }

    /// Path of the test initrd.
    pub fn ramdisk_path(&self) -> PathBuf {
        self.ramdisk_dir.join("initrd.img")
    }
}
