//! Interactive console sessions on a domain.
//!
//! A session is opened through a [`ConsoleFactory`] and owned by the
//! [`DomainHandle`](crate::DomainHandle) it belongs to. Sessions have no close
//! operation of their own: the handle closes a session by dropping it, which
//! ends the underlying console process.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

/// How long the console must stay silent before a read is considered done.
const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(500);

/// Upper bound on collecting output for a single input.
const DEFAULT_READ_LIMIT: Duration = Duration::from_secs(30);

/// An open console on a domain.
#[async_trait]
pub trait ConsoleSession: Send {
    /// Domain the console is attached to.
    fn domain(&self) -> &str;

    /// Send a line of input and return the output it produced.
    async fn send_input(&mut self, input: &str) -> Result<String>;

    /// Output collected so far, one entry per input.
    fn history(&self) -> &[String];
}

/// Opens console sessions.
#[async_trait]
pub trait ConsoleFactory: Send + Sync {
    /// Attach a console to `domain`.
    async fn open(&self, domain: &str) -> Result<Box<dyn ConsoleSession>>;
}

/// Console attached via `<tool> console <domain>`.
pub struct XmConsole {
    domain: String,
    // Held so the console process is killed when the session is dropped.
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    history: Vec<String>,
    quiet_period: Duration,
    read_limit: Duration,
}

impl XmConsole {
    async fn collect_output(&mut self) -> Result<String> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let start = std::time::Instant::now();

        while start.elapsed() < self.read_limit {
            match timeout(self.quiet_period, self.stdout.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        Ok(String::from_utf8_lossy(&collected).into_owned())
    }
}

#[async_trait]
impl ConsoleSession for XmConsole {
    fn domain(&self) -> &str {
        &self.domain
    }

    async fn send_input(&mut self, input: &str) -> Result<String> {
        tracing::trace!(domain = %self.domain, input, "Console input");
        self.stdin.write_all(input.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let output = self.collect_output().await?;
        self.history.push(output.clone());
        Ok(output)
    }

    fn history(&self) -> &[String] {
        &self.history
    }
}

/// [`ConsoleFactory`] spawning the control tool's console command.
#[derive(Debug, Clone)]
pub struct XmConsoleFactory {
    program: String,
    quiet_period: Duration,
    read_limit: Duration,
}

impl XmConsoleFactory {
    /// Use `program` (`xm`/`xl`) to attach consoles.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            quiet_period: DEFAULT_QUIET_PERIOD,
            read_limit: DEFAULT_READ_LIMIT,
        }
    }

    /// Set how long output must pause before a read completes.
    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }
}

#[async_trait]
impl ConsoleFactory for XmConsoleFactory {
    async fn open(&self, domain: &str) -> Result<Box<dyn ConsoleSession>> {
        tracing::debug!(domain, tool = %self.program, "Attaching console");

        let mut child = Command::new(&self.program)
            .args(["console", domain])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::Console(format!("failed to attach to {domain}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Console("console stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Console("console stdout unavailable".into()))?;

        Ok(Box::new(XmConsole {
            domain: domain.to_string(),
            _child: child,
            stdin,
            stdout,
            history: Vec::new(),
            quiet_period: self.quiet_period,
            read_limit: self.read_limit,
        }))
    }
}
