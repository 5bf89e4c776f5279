mod commands;

use clap::{Args, Parser, Subcommand, ValueEnum};
use commands::{Controller, EXIT_FAILURE, EXIT_LOCKED};
use kapstan_core::{install_signal_handler, StateLock};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kapstan",
    version,
    about = "Local single-node Kubernetes, managed like a desktop app"
)]
struct Cli {
    /// Directory for guest state (machine descriptors, sockets).
    #[arg(long, default_value = "~/.local/share/kapstan")]
    state_dir: String,

    /// Directory for downloaded release artifacts and the version catalog.
    #[arg(long, default_value = "~/.cache/kapstan")]
    cache_dir: String,

    /// Which virtualization backend to drive.
    #[arg(long, value_enum, default_value_t = Driver::Vm)]
    driver: Driver,

    /// VM manager CLI used by the vm driver.
    #[arg(long, default_value = "limactl")]
    vm_cli: String,

    /// Hypervisor CLI used by the native driver.
    #[arg(long, default_value = "hyperctl")]
    hypervisor: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Driver {
    /// Full virtual machine through an external VM manager.
    Vm,
    /// Direct hypervisor-backed instance.
    Native,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Number of virtual CPUs for the guest.
    #[arg(long, default_value_t = 2)]
    cpus: u32,

    /// Guest memory in GiB.
    #[arg(long, default_value_t = 4.0)]
    memory_gib: f64,

    /// Host port for the Kubernetes API server.
    #[arg(long, default_value_t = 6443)]
    port: u16,

    /// Kubernetes version to run (e.g. 1.23.6); newest known when omitted.
    #[arg(long)]
    kubernetes_version: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download (if needed) and start the Kubernetes guest.
    Start {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Stop the control plane and the guest.
    Stop,
    /// Stop and destroy the guest.
    Delete,
    /// Destroy and rebuild the guest from scratch.
    Reset {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Delete the guest and remove all kapstan state and caches.
    FactoryReset,
    /// List known Kubernetes versions.
    Versions {
        /// Use only the local catalog cache, skip the network refresh.
        #[arg(long, default_value_t = false)]
        cached: bool,
    },
    /// Show which settings changes need a guest restart to apply.
    RestartReasons {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Show the guest's current state, version, and runtime configuration.
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KAPSTAN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let state_dir = expand_tilde(&cli.state_dir);
    let cache_dir = expand_tilde(&cli.cache_dir);
    let controller: Controller = match commands::build_controller(
        matches!(cli.driver, Driver::Vm),
        &cli.vm_cli,
        &cli.hypervisor,
        &state_dir,
        &cache_dir,
    ) {
        Ok(controller) => controller,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    // Mutating commands are serialized across processes.
    let needs_lock = !matches!(
        cli.command,
        Commands::Versions { .. } | Commands::RestartReasons { .. } | Commands::Status
    );
    let _lock = if needs_lock {
        match StateLock::try_acquire(&state_dir) {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                eprintln!("error: another kapstan instance is already running");
                return ExitCode::from(EXIT_LOCKED);
            }
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::from(EXIT_FAILURE);
            }
        }
    } else {
        None
    };

    let json = cli.json;
    let result = match cli.command {
        Commands::Start { config } => commands::start::run(&controller, &config.into(), json),
        Commands::Stop => commands::stop::run(&controller, json),
        Commands::Delete => commands::delete::run(&controller, json),
        Commands::Reset { config } => commands::reset::run(&controller, &config.into(), json),
        Commands::FactoryReset => commands::factory_reset::run(&controller, json),
        Commands::Versions { cached } => commands::versions::run(&controller, cached, json),
        Commands::RestartReasons { config } => {
            commands::restart_reasons::run(&controller, &config.into(), json)
        }
        Commands::Status => commands::status::run(&controller, json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

impl From<ConfigArgs> for commands::PartialConfig {
    fn from(args: ConfigArgs) -> Self {
        Self {
            cpus: args.cpus,
            memory_bytes: commands::gib_to_bytes(args.memory_gib),
            port: args.port,
            kubernetes_version: args.kubernetes_version,
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
