//! # xmtest-vm
//!
//! Configuration and control-tool layer for the xm-test harness.
//! Builds the textual domain configuration the hypervisor control tool
//! (`xm`/`xl`) consumes and invokes the tool with typed commands.
//!
//! ## Quick Start
//!
//! ```no_run
//! use xmtest_vm::{ConfigDocument, ControlTool, NoSecurityPolicy, ToolCommand};
//!
//! # async fn example() -> xmtest_vm::Result<()> {
//! let mut config = ConfigDocument::new();
//! config.set_opt("name", "01_basic-1700000000");
//! config.set_opt("memory", 64);
//! config.set_opt("disk", "phy:/dev/ram0,hda1,w");
//!
//! let path = config
//!     .persist_transient(std::path::Path::new("/tmp/xm-test"), &NoSecurityPolicy)
//!     .await?;
//!
//! let tool = ControlTool::new("xm");
//! let output = tool.exec(&ToolCommand::Create(path)).await?;
//! assert!(output.success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Config Documents**: list coercion, accumulating `extra`, byte-exact rendering
//! - **Per-document Config Files**: no shared temporary path between domains
//! - **Typed Tool Commands**: create/new/start/shutdown/destroy/delete/domid
//! - **Runner Seam**: swap process spawning for a scripted runner in tests

mod config;
mod error;
mod policy;
mod tool;

pub use config::{
    ConfigDocument, ConfigValue, ACCESS_CONTROL_OPTION, CONFIG_HEADER, LIST_OPTIONS,
};
pub use error::{Result, ToolError, VmError};
pub use policy::{NoSecurityPolicy, SecurityPolicy};
pub use tool::{CommandRunner, ControlTool, ProcessRunner, ToolCommand, ToolOutput, DEFAULT_TOOL};
