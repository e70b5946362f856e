// src/main.rs
//! guestpatch - CLI entry point
//!
//! The host agent's shim dispatches one lifecycle subcommand per
//! invocation. `enable` is the operational entry that runs the patch
//! core; the rest manage handler state and exit quickly. The host reads
//! run outcomes from the status file, not the exit code, so only startup
//! failures exit non-zero.

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use guestpatch::environment::HANDLER_ENVIRONMENT_FILE;
use guestpatch::orchestrator;
use std::io;
use std::path::PathBuf;

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "guestpatch")]
#[command(version)]
#[command(about = "Guest-side patch assessment and installation agent", long_about = None)]
struct Cli {
    /// Directory holding HandlerEnvironment.json
    #[arg(long, default_value = ".", global = true)]
    handler_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the patch operation requested by the newest settings sequence
    Enable,

    /// First-time handler setup (creates the state directory)
    Install,

    /// Stop participating in patch operations
    Disable,

    /// Remove handler state before the extension is deleted
    Uninstall,

    /// Handler version change; state carries over
    Update,

    /// Clear handler state (lock, markers, persisted modes)
    Reset,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.handler_dir);

    match cli.command {
        Some(Commands::Enable) => {
            let code = orchestrator::run_from_environment(&cli.handler_dir);
            std::process::exit(code);
        }

        Some(Commands::Install) | Some(Commands::Update) => {
            // State directory is created on demand by environment
            // resolution; nothing else to prepare
            Ok(())
        }

        Some(Commands::Disable) => {
            tracing::info!("Handler disabled; any in-flight run will observe SIGTERM from the agent");
            Ok(())
        }

        Some(Commands::Uninstall) | Some(Commands::Reset) => {
            clear_handler_state(&cli.handler_dir);
            Ok(())
        }

        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "guestpatch", &mut io::stdout());
            Ok(())
        }

        None => {
            println!("guestpatch v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'guestpatch --help' for usage information");
            Ok(())
        }
    }
}

/// Log to the handler's log folder when the descriptor is readable,
/// otherwise to stderr.
fn init_logging(handler_dir: &std::path::Path) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if let Some(log_file) = open_handler_log(handler_dir) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(log_file))
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn open_handler_log(handler_dir: &std::path::Path) -> Option<std::fs::File> {
    let descriptor = handler_dir.join(HANDLER_ENVIRONMENT_FILE);
    let content = std::fs::read_to_string(descriptor).ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&content).ok()?;
    let log_folder = parsed
        .get(0)?
        .get("handlerEnvironment")?
        .get("logFolder")?
        .as_str()?;
    std::fs::create_dir_all(log_folder).ok()?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(PathBuf::from(log_folder).join("guestpatch.core.log"))
        .ok()
}

fn clear_handler_state(handler_dir: &std::path::Path) {
    // The state directory lives beside the config folder named in the
    // descriptor; without a descriptor there is nothing to clear.
    let descriptor = handler_dir.join(HANDLER_ENVIRONMENT_FILE);
    let Some(state_dir) = std::fs::read_to_string(descriptor)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|parsed| {
            let config = parsed.get(0)?.get("handlerEnvironment")?.get("configFolder")?.as_str()?;
            let config = PathBuf::from(config);
            Some(config.parent().unwrap_or(&config).join("state"))
        })
    else {
        return;
    };

    if state_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&state_dir) {
            eprintln!("Could not clear handler state: {}", e);
        }
    }
}
