//! Adaptive status polling.
//!
//! The poller owns no remote state: it calls the supplied fetch closure,
//! classifies what comes back, and sleeps between rounds until the record is
//! terminal or the wall-clock deadline passes. Translating a timeout into the
//! caller's error (and deciding whether to stop anything) is left to the engine.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::StatusTable;
use crate::error::OrchestratorError;
use crate::model::{ExecutionRecord, PollPolicy, RawExecution};

/// Why polling stopped without a terminal record.
#[derive(Debug)]
pub(crate) enum PollError {
    /// The fetch closure failed; propagated untouched.
    Fetch(OrchestratorError),
    Timeout {
        last: Box<ExecutionRecord>,
        elapsed: Duration,
        polls: u32,
    },
    Cancelled {
        last: Option<Box<ExecutionRecord>>,
    },
}

/// Poll `fetch` until it reports a terminal status.
///
/// The first fetch happens immediately. After poll `n` the poller sleeps
/// `policy.interval_for(n)`, clipped so that the final fetch lands on the
/// deadline; a non-terminal record at or past the deadline is a timeout.
pub(crate) async fn poll_until_terminal<F, Fut>(
    mut fetch: F,
    table: &dyn StatusTable,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<ExecutionRecord, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RawExecution, OrchestratorError>>,
{
    let start = Instant::now();
    let mut polls: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled { last: None });
        }

        let raw = fetch().await.map_err(PollError::Fetch)?;
        let record = ExecutionRecord::classify(raw, table);
        polls += 1;

        if record.is_terminal() {
            debug!(
                execution = %record.execution_id,
                status = %record.classified_status,
                raw = %record.raw_status,
                polls,
                "execution reached terminal status"
            );
            return Ok(record);
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.deadline() {
            return Err(PollError::Timeout {
                last: Box::new(record),
                elapsed,
                polls,
            });
        }

        let wait = policy
            .interval_for(polls - 1)
            .min(policy.deadline() - elapsed);
        debug!(
            execution = %record.execution_id,
            status = %record.classified_status,
            raw = %record.raw_status,
            polls,
            next_in = %humantime::format_duration(wait),
            "execution still in progress"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(PollError::Cancelled { last: Some(Box::new(record)) });
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
