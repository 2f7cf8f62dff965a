//! Typed invocation of the hypervisor control tool (`xm` or `xl`).
//!
//! Every lifecycle operation goes through [`ControlTool::exec`], which turns a
//! [`ToolCommand`] into an argument vector and hands it to a
//! [`CommandRunner`]. The runner is the process seam: [`ProcessRunner`] spawns
//! real processes, tests substitute a scripted runner.

use crate::error::{Result, ToolError};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

/// Default control tool program.
pub const DEFAULT_TOOL: &str = "xm";

/// Exit code and combined stdout/stderr of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Process exit status, `-1` when killed by a signal
    pub code: i32,
    /// stdout followed by stderr
    pub output: String,
}

impl ToolOutput {
    /// Create an output record.
    pub fn new(code: i32, output: impl Into<String>) -> Self {
        Self {
            code,
            output: output.into(),
        }
    }

    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs external programs to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, waiting for it to exit.
    async fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> std::result::Result<ToolOutput, ToolError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> std::result::Result<ToolOutput, ToolError> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ToolOutput {
            code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}

/// A control-tool operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCommand {
    /// Create and boot an ephemeral domain from a config file
    Create(PathBuf),
    /// Register a persistent (managed) domain from a config file
    Define(PathBuf),
    /// Boot a registered domain
    Start(String),
    /// Graceful shutdown
    Shutdown(String),
    /// Forced destroy
    Destroy(String),
    /// Unregister a managed domain
    Delete(String),
    /// Look up the numeric domain id
    DomId(String),
    /// List domains
    List,
    /// Attach a security label to a resource
    AddLabel {
        label: String,
        resource: String,
        policy: String,
    },
}

impl ToolCommand {
    /// The tool sub-command.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Define(_) => "new",
            Self::Start(_) => "start",
            Self::Shutdown(_) => "shutdown",
            Self::Destroy(_) => "destroy",
            Self::Delete(_) => "delete",
            Self::DomId(_) => "domid",
            Self::List => "list",
            Self::AddLabel { .. } => "addlabel",
        }
    }

    /// Full argument vector, verb first.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![self.verb().to_string()];
        match self {
            Self::Create(path) | Self::Define(path) => {
                args.push(path.to_string_lossy().into_owned());
            }
            Self::Start(name)
            | Self::Shutdown(name)
            | Self::Destroy(name)
            | Self::Delete(name)
            | Self::DomId(name) => args.push(name.clone()),
            Self::List => {}
            Self::AddLabel {
                label,
                resource,
                policy,
            } => {
                args.push(label.clone());
                args.push("res".to_string());
                args.push(resource.clone());
                args.push(policy.clone());
            }
        }
        args
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

/// Handle on the control tool program.
#[derive(Clone)]
pub struct ControlTool {
    program: String,
    runner: Arc<dyn CommandRunner>,
}

impl fmt::Debug for ControlTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlTool")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl Default for ControlTool {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL)
    }
}

impl ControlTool {
    /// Use `program` (e.g. `xm` or `xl`), spawning real processes.
    pub fn new(program: impl Into<String>) -> Self {
        Self::with_runner(program, Arc::new(ProcessRunner))
    }

    /// Use `program` through a custom runner.
    pub fn with_runner(program: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    /// The tool program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run a tool command.
    ///
    /// A nonzero exit is reported in the returned [`ToolOutput`], not as an
    /// error; callers decide which operations treat it as failure.
    pub async fn exec(&self, command: &ToolCommand) -> Result<ToolOutput> {
        let start = std::time::Instant::now();
        tracing::debug!(tool = %self.program, command = %command, "Running control tool");

        let output = self.runner.run(&self.program, &command.args()).await?;

        tracing::debug!(
            tool = %self.program,
            command = %command,
            code = output.code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Control tool finished"
        );
        if !output.success() {
            tracing::trace!(output = %output.output, "Control tool output");
        }
        Ok(output)
    }

    /// Run an arbitrary host program through the same runner.
    pub async fn run_host(&self, program: &str, args: &[String]) -> Result<ToolOutput> {
        tracing::debug!(program, ?args, "Running host command");
        let output = self.runner.run(program, args).await?;
        tracing::debug!(program, code = output.code, "Host command finished");
        Ok(output)
    }

    /// Numeric id of a domain, `None` when the tool does not know it.
    pub async fn domid(&self, name: &str) -> Result<Option<u32>> {
        let output = self.exec(&ToolCommand::DomId(name.to_string())).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output.output.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_command_args() {
        assert_eq!(
            ToolCommand::Create(PathBuf::from("/tmp/a.conf")).args(),
            vec!["create", "/tmp/a.conf"]
        );
        assert_eq!(
            ToolCommand::Define(PathBuf::from("/tmp/a.conf")).args(),
            vec!["new", "/tmp/a.conf"]
        );
        assert_eq!(ToolCommand::Delete("dom".into()).args(), vec!["delete", "dom"]);
        assert_eq!(ToolCommand::List.args(), vec!["list"]);
        assert_eq!(
            ToolCommand::AddLabel {
                label: "red".into(),
                resource: "phy:/dev/ram0".into(),
                policy: "xm-test".into(),
            }
            .args(),
            vec!["addlabel", "red", "res", "phy:/dev/ram0", "xm-test"]
        );
    }

    #[test]
    fn test_command_display() {
        assert_eq!(
            ToolCommand::Shutdown("01_basic-1700000000".into()).to_string(),
            "shutdown 01_basic-1700000000"
        );
    }

    struct FixedRunner {
        reply: ToolOutput,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl CommandRunner for FixedRunner {
        async fn run(
            &self,
            program: &str,
            args: &[String],
        ) -> std::result::Result<ToolOutput, ToolError> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn test_exec_uses_program_and_args() {
        let runner = Arc::new(FixedRunner {
            reply: ToolOutput::new(3, "Error: domain does not exist"),
            calls: Mutex::new(Vec::new()),
        });
        let tool = ControlTool::with_runner("xl", runner.clone());

        let output = tool
            .exec(&ToolCommand::Destroy("missing".into()))
            .await
            .unwrap();
        assert_eq!(output.code, 3);
        assert!(!output.success());

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, "xl");
        assert_eq!(calls[0].1, vec!["destroy", "missing"]);
    }

    #[tokio::test]
    async fn test_domid_parsing() {
        let runner = Arc::new(FixedRunner {
            reply: ToolOutput::new(0, "7\n"),
            calls: Mutex::new(Vec::new()),
        });
        let tool = ControlTool::with_runner("xm", runner);
        assert_eq!(tool.domid("dom").await.unwrap(), Some(7));

        let runner = Arc::new(FixedRunner {
            reply: ToolOutput::new(1, "Error: the domain 'dom' does not exist."),
            calls: Mutex::new(Vec::new()),
        });
        let tool = ControlTool::with_runner("xm", runner);
        assert_eq!(tool.domid("dom").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_process_runner_spawn_failure() {
        let err = ProcessRunner
            .run("/nonexistent/xmtest-tool", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
