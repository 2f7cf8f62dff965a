//! # xmtest-core
//!
//! Domain lifecycle orchestration for the xm-test harness.
//!
//! This crate drives guest domains through the hypervisor control tool:
//! it builds their configuration, creates/starts/stops/destroys them,
//! keeps the device bookkeeping that feeds the config, and owns console
//! sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      xmtest-core                         │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ HarnessContext  │────▶│  ManagedDomainTracker    │   │
//! │  │  - settings     │     │  (names of new+start'ed  │   │
//! │  │  - collaborators│     │   domains)               │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  DomainHandle   │────▶│   ConfigDocument         │   │
//! │  │  - start()      │     │   (from xmtest-vm)       │   │
//! │  │  - stop()       │     └──────────────────────────┘   │
//! │  │  - destroy()    │     ┌──────────────────────────┐   │
//! │  │  - new_device() │────▶│   DeviceRegistry         │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │           │                                              │
//! └───────────┼──────────────────────────────────────────────┘
//!             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │             xm / xl (create, new, start, ...)            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use xmtest_core::{BlockDevice, DomainBuilder, HarnessContext, HarnessSettings};
//!
//! # async fn example() -> xmtest_core::Result<()> {
//! let ctx = HarnessContext::new(HarnessSettings::from_env());
//!
//! let mut domain = DomainBuilder::new().extra_opt("memory", 64).build(&ctx).await?;
//! domain.new_device(BlockDevice::new("phy:/dev/ram1", "hdb1")).await?;
//!
//! if let Some(console) = domain.start(false).await? {
//!     let output = console.send_input("ls /").await?;
//!     println!("{output}");
//! }
//!
//! let code = domain.destroy().await?;
//! assert_eq!(code, 0);
//!
//! // Clean up managed domains a failing test left behind
//! ctx.teardown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Managed and Unmanaged Domains**: `create`, or `new` + `start` with rollback
//! - **Device Bookkeeping**: block, network and vTPM devices with hook commands
//! - **HVM Boot Wait**: pluggable waiter bounded by a timeout
//! - **Console Ownership**: sessions closed only through their domain

mod acm;
mod arch;
mod boot;
mod builder;
mod console;
mod context;
mod device;
mod domain;
mod error;
mod settings;
mod state;
mod tracker;

pub use acm::{AccessLabel, AcmPolicy, DEFAULT_ACM_LABEL, DEFAULT_ACM_POLICY};
pub use arch::ArchDefaults;
pub use boot::{BootWaiter, PollingBootWaiter, SleepBootWaiter, DEFAULT_BOOT_DELAY};
pub use builder::DomainBuilder;
pub use console::{ConsoleFactory, ConsoleSession, XmConsole, XmConsoleFactory};
pub use context::HarnessContext;
pub use device::{
    BlockDevice, BlockMode, Device, DeviceCommand, DeviceKind, DeviceRegistry, DeviceSpec,
    NetDevice, VtpmDevice, DEFAULT_NETMASK,
};
pub use domain::{unique_name, unique_name_for, DomainClass, DomainHandle, DomainState};
pub use error::{CoreError, DeviceError, DomainError, Result};
pub use settings::{HarnessSettings, DEFAULT_BOOT_TIMEOUT};
pub use state::{DomainStateQuery, ToolStateQuery};
pub use tracker::ManagedDomainTracker;
