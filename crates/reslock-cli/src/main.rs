mod commands;

use clap::{Parser, Subcommand};
use commands::{exit_code_for, load_error};
use reslock_backend::Cancellation;
use reslock_core::{install_signal_handler, Engine};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "reslock",
    version,
    about = "Multi-resolve requirement inference and lockfile management"
)]
struct Cli {
    /// Path to the environment store directory.
    #[arg(long, default_value = "~/.cache/reslock", global = true)]
    store: String,

    /// Path to the reslock configuration file.
    #[arg(long, default_value = "reslock.toml", global = true)]
    config: PathBuf,

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

#[derive(Debug, Subcommand)]
enum Commands {
    /// List resolves with their lockfiles and freshness.
    Resolves,
    /// Solve resolves and write their lockfiles.
    GenerateLockfiles {
        /// Resolve to generate; repeatable. Defaults to every resolve.
        #[arg(long = "resolve")]
        resolves: Vec<String>,
    },
    /// Validate the graph, lockfile freshness and dependency inference.
    Check,
    /// Show a unit's explicit and inferred dependencies.
    Dependencies {
        /// Unit or requirement address.
        address: String,
    },
    /// Install the environment for the closure of the given addresses.
    Install {
        /// Root addresses; all must belong to one resolve.
        #[arg(required = true)]
        roots: Vec<String>,
        /// Only compute and print the install plan.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

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
            tracing_subscriber::EnvFilter::try_from_env("RESLOCK_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cancel = Cancellation::new();
    install_signal_handler(cancel.clone());

    let store_path = expand_tilde(&cli.store);
    let json_output = cli.json;
    tracing::debug!(
        config = %cli.config.display(),
        store = %store_path.display(),
        "loading workspace"
    );

    let result = Engine::load(&cli.config, &store_path, cancel)
        .map_err(|e| load_error(&cli.config, &e))
        .and_then(|engine| match cli.command {
            Commands::Resolves => commands::resolves::run(&engine, json_output),
            Commands::GenerateLockfiles { resolves } => {
                commands::generate_lockfiles::run(&engine, &resolves, json_output)
            }
            Commands::Check => commands::check::run(&engine, json_output),
            Commands::Dependencies { address } => {
                commands::dependencies::run(&engine, &address, json_output)
            }
            Commands::Install { roots, dry_run } => {
                commands::install::run(&engine, &roots, dry_run, json_output)
            }
        });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
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
