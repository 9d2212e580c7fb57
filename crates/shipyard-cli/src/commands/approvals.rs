//! `approve` and `reject`.

use anyhow::{Context, Result, anyhow};

use shipyard_core::ApprovalState;
use shipyard_events::History;
use shipyard_worker::ApprovalBook;

use super::engine::event_store;
use crate::config::ShipyardConfig;

/// Records a decision on the gated `job` of the run matching `run`
pub async fn decide(config: &ShipyardConfig, run: &str, job: &str, identity: &str, grant: bool) -> Result<()> {
    let store = event_store(config);
    let history = History::load(store.as_ref()).await.context("Failed to read the event log")?;
    let run_id = history
        .find_run(run)
        .map(|record| record.run_id)
        .ok_or_else(|| anyhow!("No single run matches '{run}'"))?;

    let book = ApprovalBook::new(store).with_source("cli");
    let request = if grant {
        book.grant(run_id, job, identity).await?
    } else {
        book.reject(run_id, job, identity).await?
    };

    match &request.state {
        ApprovalState::Open => {
            let waiting: Vec<&str> = request
                .required
                .difference(&request.granted)
                .map(String::as_str)
                .collect();
            println!("Approved by {identity}; '{job}' still waits for {}", waiting.join(", "));
        }
        ApprovalState::Approved => println!("'{job}' approved for {}", request.environment),
        ApprovalState::Rejected { by } => println!("'{job}' rejected by {by}"),
        ApprovalState::Expired => println!("Approval for '{job}' expired"),
    }
    Ok(())
}
