//! Warden - supervised execution engine for coding agents

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{
    archive_command, init_command, resolve_edit_command, sessions_command, status_command,
    validate_command,
};

/// Warden - diagnostics for the agent execution engine
#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "◆ Supervised execution engine for coding agents")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config and workspace
    Init,
    /// Show config, live resource sample and admission
    Status,
    /// List stored sessions
    Sessions,
    /// Check a session history for unpaired tool calls
    Validate {
        /// Session ID
        session: String,
    },
    /// Archive a session
    Archive {
        /// Session ID
        session: String,
    },
    /// Resolve an edit against a file
    ResolveEdit {
        /// Target file
        file: PathBuf,
        /// Text to replace
        #[arg(long)]
        old: String,
        /// Replacement text
        #[arg(long)]
        new: String,
        /// Write the result back to the file
        #[arg(long)]
        apply: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (name, result) = match cli.command {
        Commands::Init => ("Init", init_command().await),
        Commands::Status => ("Status", status_command().await),
        Commands::Sessions => ("Sessions", sessions_command().await),
        Commands::Validate { session } => ("Validate", validate_command(&session).await),
        Commands::Archive { session } => ("Archive", archive_command(&session).await),
        Commands::ResolveEdit {
            file,
            old,
            new,
            apply,
        } => (
            "Resolve",
            resolve_edit_command(&file, &old, &new, apply).await,
        ),
    };

    if let Err(e) = result {
        error!("{} failed: {:#}", name, e);
        std::process::exit(1);
    }
}
