//! # Command Line Interface
//!
//! `run` starts the controllers. `ca` and `cert` are offline PKI helpers that
//! work on PEM files and never touch the store.

pub mod ca;
pub mod cert;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "serving-cert-signer")]
#[command(about = "Issues and rotates TLS serving certificates for annotated Services")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging for offline commands
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the serving-cert and CA rotation controllers
    Run {
        /// YAML configuration file
        #[arg(long, env = "SERVING_CERT_CONFIG")]
        config: Option<PathBuf>,
    },

    /// CA management commands
    Ca {
        #[command(subcommand)]
        command: ca::CaCommands,
    },

    /// Serving certificate commands
    Cert {
        #[command(subcommand)]
        command: cert::CertCommands,
    },
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => crate::startup::run(config.as_deref()).await?,
        Commands::Ca { command } => {
            initialise_logging(cli.verbose);
            ca::handle_ca_command(command)?
        }
        Commands::Cert { command } => {
            initialise_logging(cli.verbose);
            cert::handle_cert_command(command)?
        }
    }

    Ok(())
}

fn initialise_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Already set elsewhere (e.g. integration tests); ignore.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
