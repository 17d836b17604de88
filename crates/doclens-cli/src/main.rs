//! doclens - command-line client for the document-intelligence service.
//!
//! Signs in, browses and uploads documents, manages knowledge bases and
//! chats against them. The session token survives between runs in the
//! configured token store.

mod commands;

use std::io;
use std::process::ExitCode;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::Cli;

/// Directory for a daily-rolling log file, in addition to stderr.
const ENV_LOG_DIR: &str = "DOCLENS_LOG_DIR";

const LOG_FILE_PREFIX: &str = "doclens.log";

const USAGE: &str = "\
Usage: doclens <command> [args]

Commands:
  login [username]              Sign in (prompts for the password)
  register <username> <email>   Create an account
  logout                        Forget the saved session
  whoami                        Show the signed-in user
  tree                          Show folders and files
  mkdir <name> [parent_id]      Create a folder
  upload <path> [folder_id]     Upload a file
  rm-file <id>                  Delete a file
  rm-folder <id>                Delete a folder
  usage [daily|monthly|yearly]  Show API usage
  kb list                       List knowledge bases
  kb create <name> <file_id..>  Create a knowledge base from files
  kb delete <id>                Delete a knowledge base
  chat <message> [--kb id]      Ask a question
  forgot-password <email>       Request a password reset email
  reset-password <token>        Set a new password with a reset token

Environment:
  RUST_LOG                      Log filter (default: warn)
  DOCLENS_LOG_DIR               Also write logs to this directory
  DOCLENS_API_ORIGIN            Backend origin
  DOCLENS_API_PREFIX            API version prefix
  DOCLENS_TOKEN_STORAGE         file | keyring | memory";

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=doclens_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || matches!(args[0].as_str(), "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    info!(command = %args[0], "doclens starting");

    let result = match Cli::new() {
        Ok(mut cli) => cli.run(&args).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
