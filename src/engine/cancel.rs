//! Deadline and cancellation handling around the poller.
//!
//! Only executions started by the current call are ever stopped here, and a
//! stop attempt never replaces the timeout that triggered it.

use tracing::{info, warn};
use uuid::Uuid;

use super::poller::{poll_until_terminal, PollError};
use super::TaskEngine;
use crate::client::ControlPlane;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{ExecutionRecord, JobHandle, PollPolicy, RawExecution};

/// Map a poll failure on an execution this call does not own.
pub(super) fn unowned_poll_error(
    err: PollError,
    job_id: &str,
    target_id: &str,
    policy: &PollPolicy,
) -> OrchestratorError {
    match err {
        PollError::Fetch(e) => e,
        PollError::Timeout {
            last,
            elapsed,
            polls,
        } => {
            warn!(
                job = job_id,
                execution = %last.execution_id,
                status = %last.classified_status,
                elapsed = %humantime::format_duration(elapsed),
                "deadline exceeded"
            );
            OrchestratorError::Timeout {
                job_id: job_id.to_string(),
                execution_id: last.execution_id,
                target_id: target_id.to_string(),
                deadline_secs: policy.deadline().as_secs(),
                polls,
            }
        }
        PollError::Cancelled { last } => OrchestratorError::Cancelled {
            target_id: target_id.to_string(),
            execution_id: last.map(|r| r.execution_id),
            stop_succeeded: None,
        },
    }
}

impl<C: ControlPlane> TaskEngine<C> {
    async fn poll_execution(
        &self,
        job_id: &str,
        execution_id: Uuid,
    ) -> Result<ExecutionRecord, PollError> {
        poll_until_terminal(
            || self.client.get_execution_status(job_id, execution_id),
            self.client.execution_table(),
            &self.cfg.policy,
            &self.cancel,
        )
        .await
    }

    /// Follow an execution this call started. If the deadline passes or the
    /// call is cancelled, the job is stopped once, best effort.
    pub(super) async fn follow_own(
        &self,
        job: &JobHandle,
        execution_id: Uuid,
    ) -> OrchestratorResult<ExecutionRecord> {
        match self.poll_execution(&job.job_id, execution_id).await {
            Ok(record) => Ok(record),
            Err(PollError::Fetch(e)) => Err(e),
            Err(PollError::Timeout { elapsed, polls, .. }) => {
                warn!(
                    job = %job.job_id,
                    execution = %execution_id,
                    polls,
                    elapsed = %humantime::format_duration(elapsed),
                    "deadline exceeded, stopping the job"
                );
                let stop_succeeded = self.stop_best_effort(&job.job_id).await;
                Err(OrchestratorError::TimeoutAfterStopAttempt {
                    job_id: job.job_id.clone(),
                    execution_id,
                    target_id: job.target_id.clone(),
                    deadline_secs: self.cfg.policy.deadline().as_secs(),
                    stop_succeeded,
                })
            }
            Err(PollError::Cancelled { .. }) => {
                let stop_succeeded = self.stop_best_effort(&job.job_id).await;
                Err(OrchestratorError::Cancelled {
                    target_id: job.target_id.clone(),
                    execution_id: Some(execution_id),
                    stop_succeeded: Some(stop_succeeded),
                })
            }
        }
    }

    /// Follow an execution owned by some other run; it is never stopped.
    pub(super) async fn follow_foreign(
        &self,
        active: &RawExecution,
    ) -> OrchestratorResult<ExecutionRecord> {
        self.poll_execution(&active.job_id, active.execution_id)
            .await
            .map_err(|e| {
                unowned_poll_error(e, &active.job_id, &active.target_id, &self.cfg.policy)
            })
    }

    async fn stop_best_effort(&self, job_id: &str) -> bool {
        match self.client.stop_job(job_id).await {
            Ok(()) => {
                info!(job = job_id, "stop request accepted");
                true
            }
            Err(e) => {
                warn!(job = job_id, error = %e, "stop request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::{FakePlane, JOB, RUNNING};
    use super::super::test_support::engine;
    use crate::error::OrchestratorError;
    use crate::model::ConflictAction;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn own_timeout_stops_the_job_once() {
        let plane = FakePlane::new().with_started_script(vec![RUNNING]);

        let err = engine(&plane, 60)
            .execute_with_policy(JOB, ConflictAction::Proceed)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::TimeoutAfterStopAttempt {
                stop_succeeded: true,
                deadline_secs: 60,
                ..
            }
        ));
        assert_eq!(plane.calls(|c| c.stops.clone()), vec![JOB.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_still_surfaces_the_timeout() {
        let plane = FakePlane::new()
            .with_started_script(vec![RUNNING])
            .failing_stop();

        let err = engine(&plane, 60)
            .execute_with_policy(JOB, ConflictAction::Proceed)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::TimeoutAfterStopAttempt {
                stop_succeeded: false,
                ..
            }
        ));
        assert_eq!(plane.calls(|c| c.stops.len()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_an_own_execution_stops_it() {
        let plane = FakePlane::new().with_started_script(vec![RUNNING]);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let err = engine(&plane, 3600)
            .with_cancellation(token)
            .execute_with_policy(JOB, ConflictAction::Proceed)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Cancelled {
                execution_id: Some(_),
                stop_succeeded: Some(true),
                ..
            }
        ));
        assert_eq!(plane.calls(|c| c.stops.clone()), vec![JOB.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_reports_a_failed_stop() {
        let plane = FakePlane::new()
            .with_started_script(vec![RUNNING])
            .failing_stop();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let err = engine(&plane, 3600)
            .with_cancellation(token)
            .execute_with_policy(JOB, ConflictAction::Proceed)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Cancelled {
                stop_succeeded: Some(false),
                ..
            }
        ));
        assert!(err.to_string().contains("stop the job manually"));
        assert_eq!(plane.calls(|c| c.stops.len()), 1);
    }
}
