mod cancel;
mod classify;
mod conflict;
#[cfg(test)]
pub(crate) mod fake;
mod poller;

pub use classify::{classify, StatusTable};

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::client::{ControlPlane, ReloadPlane};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{CanonicalStatus, ConflictAction, EngineConfig, ExecutionRecord, Outcome};

/// Drives one orchestration call at a time against a single control plane.
///
/// The engine keeps no state between calls; everything it learns about remote
/// executions lives on the stack of the call that fetched it.
pub struct TaskEngine<C> {
    client: C,
    cfg: EngineConfig,
    cancel: CancellationToken,
}

impl<C> TaskEngine<C> {
    pub fn new(client: C, cfg: EngineConfig) -> Self {
        Self {
            client,
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    /// Honor `cancel` at every poll boundary.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl<C: ControlPlane> TaskEngine<C> {
    /// Run `job_id`, resolving any conflicting active execution on its target with `action`.
    #[instrument(skip(self))]
    pub async fn execute_with_policy(
        &self,
        job_id: &str,
        action: ConflictAction,
    ) -> OrchestratorResult<Outcome> {
        let job = self.client.get_job_info(job_id).await?;
        self.launch(&job, action).await
    }
}

impl<C: ReloadPlane> TaskEngine<C> {
    /// Request a reload of `target_id` and poll it to completion.
    #[instrument(skip(self))]
    pub async fn reload_and_wait(&self, target_id: &str) -> OrchestratorResult<Outcome> {
        let ticket = self.client.request_reload(target_id).await?;
        let table = self.client.reload_table();
        let record = poller::poll_until_terminal(
            || self.client.reload_status(&ticket),
            table,
            &self.cfg.policy,
            &self.cancel,
        )
        .await
        .map_err(|e| {
            cancel::unowned_poll_error(e, target_id, target_id, &self.cfg.policy)
        })?;

        ensure_succeeded(&record, table)?;
        info!(target = target_id, name = %ticket.display_name, "reload finished");
        let note = format!("reloaded \"{}\"", ticket.display_name);
        let outcome = Outcome::from_record(&record, note);
        Ok(outcome.with_target_reloaded_at(record.stopped_at))
    }
}

/// Turn a terminal record into an error unless it succeeded with a known status.
fn ensure_succeeded(record: &ExecutionRecord, table: &dyn StatusTable) -> OrchestratorResult<()> {
    if !record.recognized {
        return Err(OrchestratorError::UnknownStatus {
            job_id: record.job_id.clone(),
            execution_id: record.execution_id,
            target_id: record.target_id.clone(),
            domain: table.domain(),
            raw_status: record.raw_status.clone(),
        });
    }
    match record.classified_status {
        CanonicalStatus::Succeeded => Ok(()),
        status => Err(OrchestratorError::RemoteFailure {
            job_id: record.job_id.clone(),
            execution_id: record.execution_id,
            target_id: record.target_id.clone(),
            status,
            raw_status: record.raw_status.clone(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::fake::FakePlane;
    use super::TaskEngine;
    use crate::model::{EngineConfig, PollPolicy};
    use std::time::Duration;

    pub(crate) fn engine(plane: &FakePlane, deadline_secs: u64) -> TaskEngine<FakePlane> {
        let policy = PollPolicy::new(
            Duration::from_secs(10),
            Duration::from_secs(deadline_secs),
            60,
        )
        .unwrap();
        TaskEngine::new(
            plane.clone(),
            EngineConfig {
                policy,
                stop_settle: Duration::from_secs(5),
            },
        )
    }
}
