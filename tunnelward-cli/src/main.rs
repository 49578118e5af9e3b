//! tunnelward CLI
//!
//! Opens detached, self-supervising local tunnels over SSH, AWS SSM and
//! Kubernetes. The same binary doubles as the tunnel worker.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::error;
use tunnelward_core::WorkerLaunch;
use tunnelward_observability::init_worker_logging;

#[derive(Parser)]
#[command(
    name = "tunnelward",
    author,
    version,
    about = "Detached local tunnels over SSH, AWS SSM and Kubernetes",
    long_about = "tunnelward opens a local port that forwards to a remote endpoint and \
                  returns immediately.\n\nEach tunnel runs in its own background process \
                  that exits when the watched process goes away.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a tunnel through an SSH bastion
    Ssh(commands::ssh::SshArgs),

    /// Open a tunnel through an AWS SSM port-forwarding session
    Ssm(commands::ssm::SsmArgs),

    /// Open a tunnel to a Kubernetes service
    Kubernetes(commands::kubernetes::KubernetesArgs),

    /// Close a tunnel opened earlier
    Close(commands::close::CloseArgs),

    /// Show version information
    Version,
}

fn install_crypto_provider() {
    // more than one rustls provider is linked in, so pick one explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn run_worker(launch: WorkerLaunch) -> ExitCode {
    install_crypto_provider();
    let result = runtime().and_then(|rt| Ok(rt.block_on(launch.run())?));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Tunnel worker failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ssh(args) => commands::ssh::run(args).await,
        Commands::Ssm(args) => commands::ssm::run(args).await,
        Commands::Kubernetes(args) => commands::kubernetes::run(args).await,
        Commands::Close(args) => commands::close::run(args).await,
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    // the worker role must be read before any thread exists
    match WorkerLaunch::from_env() {
        Ok(Some(launch)) => {
            init_worker_logging();
            return run_worker(launch);
        }
        Ok(None) => {}
        Err(e) => {
            init_worker_logging();
            error!("Invalid tunnel worker launch: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let cli = Cli::parse();
    install_crypto_provider();
    match runtime().and_then(|rt| rt.block_on(run(cli))) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
