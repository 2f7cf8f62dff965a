//! xmtest CLI entry point.
//!
//! Renders test domain configs and drives single domains from the shell,
//! using the same settings (`XM_TEST_*` environment variables) as the
//! harness library.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use xmtest_core::{
    BlockDevice, DeviceSpec, DomainBuilder, DomainClass, DomainHandle, HarnessContext,
    HarnessSettings, NetDevice,
};
use xmtest_vm::{ConfigDocument, ConfigValue};

/// xmtest - drive Xen test domains through xm/xl
#[derive(Parser, Debug)]
#[command(name = "xmtest")]
#[command(about = "Create, inspect and tear down xm-test domains")]
#[command(version)]
struct Cli {
    /// Control tool to run (overrides XM_TEST_TOOL)
    #[arg(long, global = true)]
    tool: Option<String>,

    /// Directory for generated config files (overrides XM_TEST_WORKDIR)
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the config a test domain would be created with
    Render {
        #[command(flatten)]
        domain: DomainArgs,

        /// Print the options as JSON instead of config-file syntax
        #[arg(long)]
        json: bool,
    },

    /// Create and start a test domain
    Create {
        #[command(flatten)]
        domain: DomainArgs,

        /// Register the domain with `new` + `start`
        #[arg(long)]
        managed: bool,

        /// Command to run on the guest console once it is up
        #[arg(long)]
        console_cmd: Option<String>,
    },

    /// Gracefully shut a domain down
    Stop {
        /// Domain name
        name: String,
    },

    /// Forcibly destroy a domain
    Destroy {
        /// Domain name
        name: String,

        /// Also delete the domain from the tool's store
        #[arg(long)]
        managed: bool,
    },

    /// Report whether a domain is running
    Status {
        /// Domain name
        name: String,
    },
}

#[derive(Args, Debug)]
struct DomainArgs {
    /// Domain name (generated when omitted)
    #[arg(long)]
    name: Option<String>,

    /// Fully virtualized guest (overrides XM_TEST_HVM)
    #[arg(long)]
    hvm: bool,

    /// Extra config option, `key=value`; integers and `[...]` JSON lists are
    /// recognised
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_opt)]
    opts: Vec<(String, ConfigValue)>,

    /// Block device, `backend,frontend` (e.g. `phy:/dev/ram1,hdb1`)
    #[arg(long = "disk", value_name = "BACKEND,FRONTEND")]
    disks: Vec<String>,

    /// Add the default network interface (eth0)
    #[arg(long)]
    net: bool,
}

/// Parse a `key=value` option.
fn parse_opt(s: &str) -> Result<(String, ConfigValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option name in `{s}`"));
    }

    let value = value.trim();
    let value = if let Ok(int) = value.parse::<i64>() {
        ConfigValue::Int(int)
    } else if value.starts_with('[') {
        let items: Vec<String> =
            serde_json::from_str(value).map_err(|e| format!("invalid list `{value}`: {e}"))?;
        ConfigValue::List(items)
    } else {
        ConfigValue::from(value)
    };

    Ok((key.to_string(), value))
}

impl DomainArgs {
    fn builder(&self, managed: bool) -> DomainBuilder {
        let mut builder = DomainBuilder::new()
            .extra_opts(self.opts.iter().cloned())
            .managed(managed);
        if let Some(name) = &self.name {
            builder = builder.name(name);
        }
        if self.hvm {
            builder = builder.class(DomainClass::Hvm);
        }
        builder
    }

    fn devices(&self) -> anyhow::Result<Vec<DeviceSpec>> {
        let mut devices: Vec<DeviceSpec> = Vec::new();
        for disk in &self.disks {
            let (backend, frontend) = disk
                .split_once(',')
                .with_context(|| format!("expected BACKEND,FRONTEND, got `{disk}`"))?;
            devices.push(BlockDevice::new(backend, frontend).into());
        }
        if self.net {
            devices.push(NetDevice::new("eth0").into());
        }
        Ok(devices)
    }

    async fn build(&self, ctx: &HarnessContext, managed: bool) -> anyhow::Result<DomainHandle> {
        let mut domain = self.builder(managed).build(ctx).await?;
        for device in self.devices()? {
            domain.new_device(device).await?;
        }
        Ok(domain)
    }
}

/// Handle on an existing domain, known only by name.
fn existing(ctx: &HarnessContext, name: &str, managed: bool) -> DomainHandle {
    let mut config = ConfigDocument::new();
    config.set_opt("name", name);
    DomainHandle::new(
        ctx.clone(),
        config,
        managed,
        ctx.settings().domain_class,
    )
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut settings = HarnessSettings::from_env();
    if let Some(tool) = cli.tool {
        settings.tool = tool;
    }
    if let Some(workdir) = cli.workdir {
        settings.work_dir = workdir;
    }
    tracing::debug!(?settings, "Settings loaded");
    settings.validate_warn();

    let ctx = HarnessContext::new(settings);

    match cli.command {
        Commands::Render { domain, json } => {
            let mut config = domain.builder(false).build_config(ctx.settings())?;
            for device in domain.devices()? {
                config.append_opt(device.kind().config_node(), device.config_entry());
            }

            if json {
                let opts = config
                    .options()
                    .map(|(k, v)| serde_json::to_value(v).map(|v| (k.to_string(), v)))
                    .collect::<Result<serde_json::Map<_, _>, _>>()?;
                println!("{}", serde_json::to_string_pretty(&opts)?);
            } else {
                print!("{config}");
            }
            Ok(0)
        }

        Commands::Create {
            domain,
            managed,
            console_cmd,
        } => {
            let mut handle = domain.build(&ctx, managed).await?;
            let name = handle.name().to_string();

            let console = handle
                .start(console_cmd.is_none())
                .await
                .with_context(|| format!("failed to start {name}"))?;
            if let (Some(console), Some(cmd)) = (console, &console_cmd) {
                let output = console.send_input(cmd).await?;
                print!("{output}");
            }
            handle.close_console();

            println!("{name}");
            Ok(0)
        }

        Commands::Stop { name } => {
            let code = existing(&ctx, &name, false).stop().await?;
            if code != 0 {
                tracing::warn!(domain = %name, code, "Shutdown returned nonzero");
            }
            Ok(code)
        }

        Commands::Destroy { name, managed } => {
            let code = existing(&ctx, &name, managed).destroy().await?;
            if code != 0 {
                tracing::warn!(domain = %name, code, "Destroy returned nonzero");
            }
            Ok(code)
        }

        Commands::Status { name } => {
            let domain = existing(&ctx, &name, false);
            let id = domain.domain_id().await?;
            if id < 0 {
                println!("{name}: not running");
                Ok(1)
            } else {
                println!("{name}: running (id {id})");
                Ok(0)
            }
        }
    }
}

/// Initialize the tracing subscriber. Logs go to stderr.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xmtest=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
