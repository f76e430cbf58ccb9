use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};

use minidock::cgroups::{FixedMountpoint, ProcMounts, ResourceConfig};
use minidock::container::{RunOptions, run_container};
use minidock::error::EXIT_SETUP_FAILURE;
use minidock::init::run_container_init_process;
use minidock::logging::{self, LogConfig, LogFormat};

/// A minimal container runtime built on Linux namespaces and cgroups v2
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter directive, e.g. "info" or "minidock=debug"
    #[arg(long, global = true, env = "MINIDOCK_LOG", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, env = "MINIDOCK_LOG_FORMAT", value_enum, default_value_t = FormatArg::Text)]
    log_format: FormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a container with namespaces and cgroup limits: minidock run --ti [command]
    Run(RunArgs),
    /// Container init process. Do not call it outside
    #[command(hide = true)]
    Init,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Connect the container to this terminal
    #[arg(long = "ti")]
    tty: bool,

    /// Memory limit (e.g. "512m", "2G", "max")
    #[arg(short = 'm', long = "memory", default_value = "512m")]
    memory: String,

    /// CPUs the container may run on (e.g. "0", "0-3")
    #[arg(long, default_value = "0")]
    cpuset: String,

    /// Relative CPU weight, 1-10000
    #[arg(long, default_value = "1024")]
    cpushare: String,

    /// Name of the container's cgroup
    #[arg(long, default_value = "minidock")]
    name: String,

    /// Use this cgroup2 mountpoint instead of searching /proc/mounts
    #[arg(long, env = "MINIDOCK_CGROUP_ROOT")]
    cgroup_root: Option<PathBuf>,

    /// Command to execute in the container, with its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Text,
    Json,
}

impl From<FormatArg> for LogFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Text => LogFormat::Text,
            FormatArg::Json => LogFormat::Json,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log = LogConfig {
        filter: cli.log_level,
        format: cli.log_format.into(),
    };
    logging::init(&log);

    match cli.command {
        Commands::Run(args) => match run(args, log) {
            Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)),
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(EXIT_SETUP_FAILURE)
            }
        },
        Commands::Init => {
            tracing::info!("init process started");
            let Err(e) = run_container_init_process();
            tracing::error!(error = %e, "container init failed");
            let code = e.exit_code();
            eprintln!("Error: {:#}", anyhow::Error::from(e));
            ExitCode::from(code)
        }
    }
}

fn run(args: RunArgs, log: LogConfig) -> anyhow::Result<i32> {
    tracing::info!(tty = args.tty, command = ?args.command, "run");
    let options = RunOptions {
        command: args.command,
        interactive: args.tty,
        resources: ResourceConfig {
            memory_limit: Some(args.memory),
            cpu_share: Some(args.cpushare),
            cpu_set: Some(args.cpuset),
        },
        cgroup_name: args.name,
        log,
    };

    let result = match args.cgroup_root {
        Some(root) => run_container(&options, &FixedMountpoint(root)),
        None => run_container(&options, &ProcMounts::default()),
    };
    result.with_context(|| format!("failed to run container '{}'", options.cgroup_name))
}
