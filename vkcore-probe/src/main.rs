#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod config;
mod scenarios;

use std::{fs::File, path::PathBuf, sync::Arc};

use clap::Parser;
use tracing_subscriber::{
    Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};
use vkcore::{Device, DeviceConfig, GpuContext, Instance, QueueMode, VulkanLogLevel};

use crate::{
    config::ProbeConfig,
    scenarios::{Outcome, Probe, Scenario},
};

/// Exercise a Vulkan device through vkcore and report what works.
#[derive(clap::Parser, Debug)]
#[command(version)]
struct CliArgs {
    /// Console log level (off, error, warn, info, debug, trace). The log
    /// file always records everything.
    #[arg(short, long, default_value = "error")]
    log_level: LevelFilter,
    /// Enable the validation layer and forward messages at this severity.
    #[arg(short, long)]
    validation: Option<ValidationLevel>,
    #[arg(long, default_value = "auto")]
    queue_mode: QueueModeArg,
    /// Scenarios to run, comma separated. Runs all of them when omitted.
    #[arg(short, long, value_delimiter = ',')]
    scenario: Vec<Scenario>,
    /// Probe config (TOML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Shader compiler executable, overriding the config.
    #[arg(long)]
    compiler: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum QueueModeArg {
    Auto,
    Unified,
    Single,
}

impl From<QueueModeArg> for QueueMode {
    fn from(arg: QueueModeArg) -> Self {
        match arg {
            QueueModeArg::Auto => Self::Auto,
            QueueModeArg::Unified => Self::Unified,
            QueueModeArg::Single => Self::Single,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ValidationLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<ValidationLevel> for VulkanLogLevel {
    fn from(level: ValidationLevel) -> Self {
        match level {
            ValidationLevel::Verbose => Self::Verbose,
            ValidationLevel::Info => Self::Info,
            ValidationLevel::Warning => Self::Warning,
            ValidationLevel::Error => Self::Error,
        }
    }
}

/// Console output filtered at `console`, plus an unfiltered plain-text log
/// under the platform runtime (or data) directory. Returns the log file
/// path.
fn init_logging(console: LevelFilter) -> eyre::Result<Option<PathBuf>> {
    if console == LevelFilter::OFF {
        return Ok(None);
    }
    let dirs = directories::ProjectDirs::from("", "vkcore", "vkcore-probe");
    let log_dir = match dirs.as_ref() {
        Some(dirs) => dirs.runtime_dir().unwrap_or(dirs.data_dir()).to_owned(),
        None => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("probe-log.txt");
    let file = tracing_subscriber::fmt::layer()
        .with_writer(File::create(&log_path)?)
        .with_ansi(false);
    let console = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(console);

    tracing_subscriber::registry().with(console.and_then(file)).init();
    Ok(Some(log_path))
}

/// Prefer a device with dynamic rendering. Without it the pipeline-cache
/// scenario is skipped but everything else still runs.
fn open_device(instance: &Arc<Instance>, queue_mode: QueueMode) -> eyre::Result<Arc<Device>> {
    let with_rendering = DeviceConfig {
        dynamic_rendering: true,
        queue_mode,
    };
    let device = Device::create_compatible(instance, with_rendering).or_else(|e| {
        tracing::warn!("No device with dynamic rendering ({e}), retrying without it");
        Device::create_compatible(
            instance,
            DeviceConfig {
                dynamic_rendering: false,
                ..with_rendering
            },
        )
    })?;
    Ok(Arc::new(device))
}

fn main() -> eyre::Result<()> {
    let args = CliArgs::parse();
    if let Some(path) = init_logging(args.log_level)? {
        println!("Logging to {}", path.display());
    }

    let config = match &args.config {
        Some(path) => ProbeConfig::load(path)?,
        None => ProbeConfig::default(),
    };
    let mut compiler = config.compiler.compiler();
    if let Some(executable) = &args.compiler {
        compiler.executable.clone_from(executable);
    }

    // SAFETY: loading the system Vulkan loader is the one unavoidable
    // foreign-code dependency of this tool.
    let instance = Arc::new(unsafe {
        Instance::new("vkcore-probe", args.validation.map(VulkanLogLevel::from))
    }?);
    let device = open_device(&instance, args.queue_mode.into())?;
    let ctx = GpuContext::new(&device)?;

    let all = Scenario::ALL;
    let scenarios = match args.scenario.as_slice() {
        [] => &all[..],
        chosen => chosen,
    };
    let probe = Probe {
        ctx: &ctx,
        compiler: &compiler,
        config: &config,
    };

    let mut failed = Vec::new();
    for &scenario in scenarios {
        match probe.run(scenario) {
            Ok(Outcome::Passed) => println!("PASS {scenario:?}"),
            Ok(Outcome::Skipped(reason)) => println!("SKIP {scenario:?}: {reason}"),
            Err(e) => {
                tracing::error!("{scenario:?} failed: {e:?}");
                println!("FAIL {scenario:?}: {e}");
                failed.push(scenario);
            }
        }
    }
    tracing::debug!("{} resources still tracked", ctx.tracked_resources());

    if !failed.is_empty() {
        eyre::bail!("{} scenario(s) failed: {failed:?}", failed.len());
    }
    Ok(())
}
