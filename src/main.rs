mod cli;
mod client;
mod engine;
mod error;
mod logging;
mod model;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use error::OrchestratorError;

/// Exit code for a job that ran and ended badly, as opposed to a failure to
/// reach or drive the server (exit code 1).
const EXIT_REMOTE_FAILURE: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init_logging(args.log_level.as_deref());

    match cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Error: {e:#}");
            let remote = e
                .downcast_ref::<OrchestratorError>()
                .is_some_and(OrchestratorError::is_remote_failure);
            std::process::exit(if remote { EXIT_REMOTE_FAILURE } else { 1 });
        }
    }
}
