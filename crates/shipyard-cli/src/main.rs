//! `shipyard` binary.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match shipyard_cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
