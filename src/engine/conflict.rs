//! Conflict resolution for the job-launch path.
//!
//! The server allows one active execution per target. When the requested
//! job's target is already busy, the caller's [`ConflictAction`] decides what
//! happens; with a free target the job is simply started and followed.

use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ensure_succeeded, TaskEngine};
use crate::client::ControlPlane;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{
    CanonicalStatus, ConflictAction, ExecutionRecord, JobHandle, Outcome, RawExecution,
};

impl<C: ControlPlane> TaskEngine<C> {
    pub(super) async fn launch(
        &self,
        job: &JobHandle,
        action: ConflictAction,
    ) -> OrchestratorResult<Outcome> {
        if !job.enabled {
            return Err(OrchestratorError::NotEnabled {
                job_id: job.job_id.clone(),
                display_name: job.display_name.clone(),
            });
        }

        let active = self
            .client
            .get_active_execution(&job.target_id)
            .await?
            .filter(RawExecution::is_active);
        let Some(active) = active else {
            let record = self.run_to_completion(job).await?;
            let outcome = Outcome::from_record(&record, "started fresh");
            return Ok(self.with_reload_time(outcome).await);
        };

        info!(
            job = %job.job_id,
            target = %job.target_id,
            blocking_job = %active.job_id,
            blocking_execution = %active.execution_id,
            %action,
            "target already has an active execution"
        );

        match action {
            ConflictAction::Proceed => {
                let record = self.follow_foreign(&active).await?;
                ensure_succeeded(&record, self.client.execution_table())?;
                let note = format!(
                    "followed the active execution {} of job {} instead of starting {}",
                    active.execution_id, active.job_id, job.job_id
                );
                let outcome = Outcome::from_record(&record, note)
                    .with_blocking(active.execution_id);
                Ok(self.with_reload_time(outcome).await)
            }
            ConflictAction::Skip => {
                let note = format!(
                    "skipped: execution {} of job {} is active on target {}",
                    active.execution_id, active.job_id, job.target_id
                );
                let mut outcome = Outcome::new(CanonicalStatus::Pending, note, &job.target_id)
                    .with_blocking(active.execution_id);
                outcome.job_id = Some(job.job_id.clone());
                Ok(outcome)
            }
            ConflictAction::Wait => {
                let blocking = self.follow_foreign(&active).await?;
                info!(
                    blocking_execution = %blocking.execution_id,
                    status = %blocking.classified_status,
                    "blocking execution finished"
                );
                let record = self.run_to_completion(job).await?;
                let note = format!(
                    "started execution {} after waiting for execution {} of job {} ({})",
                    record.execution_id,
                    active.execution_id,
                    active.job_id,
                    blocking.classified_status
                );
                let outcome = Outcome::from_record(&record, note)
                    .with_blocking(active.execution_id);
                Ok(self.with_reload_time(outcome).await)
            }
            ConflictAction::Stop => {
                self.stop_blocking(job, &active).await?;
                let record = self.run_to_completion(job).await?;
                let note = format!(
                    "started execution {} after stopping execution {} of job {}",
                    record.execution_id, active.execution_id, active.job_id
                );
                let outcome = Outcome::from_record(&record, note)
                    .with_blocking(active.execution_id);
                Ok(self.with_reload_time(outcome).await)
            }
            ConflictAction::Error => Err(OrchestratorError::ActiveConflict {
                job_id: job.job_id.clone(),
                target_id: job.target_id.clone(),
                blocking_job_id: active.job_id.clone(),
                blocking_execution_id: active.execution_id,
            }),
        }
    }

    /// Attach the target's last reload time to a successful outcome. A failed
    /// read leaves it out; the job itself already finished.
    async fn with_reload_time(&self, outcome: Outcome) -> Outcome {
        match self.client.target_reloaded_at(&outcome.target_id).await {
            Ok(at) => outcome.with_target_reloaded_at(at),
            Err(e) => {
                warn!(
                    target = %outcome.target_id,
                    error = %e,
                    "could not read the last reload time"
                );
                outcome
            }
        }
    }

    /// Stop the blocking job and confirm the target is free again.
    async fn stop_blocking(
        &self,
        job: &JobHandle,
        active: &RawExecution,
    ) -> OrchestratorResult<()> {
        self.client.stop_job(&active.job_id).await?;

        tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(OrchestratorError::Cancelled {
                    target_id: job.target_id.clone(),
                    execution_id: Some(active.execution_id),
                    stop_succeeded: None,
                });
            }
            _ = sleep(self.cfg.stop_settle) => {}
        }

        let still_active = self
            .client
            .get_active_execution(&job.target_id)
            .await?
            .filter(RawExecution::is_active);
        if let Some(still) = still_active {
            return Err(OrchestratorError::StopConflict {
                target_id: job.target_id.clone(),
                stopped_job_id: active.job_id.clone(),
                active_job_id: still.job_id,
                active_execution_id: still.execution_id,
            });
        }
        Ok(())
    }

    async fn start(&self, job: &JobHandle) -> OrchestratorResult<Uuid> {
        let execution_id = self
            .client
            .start_job(&job.job_id)
            .await
            .map_err(|e| match e {
                OrchestratorError::StartFailed { reason, .. } => OrchestratorError::StartFailed {
                    job_id: job.job_id.clone(),
                    display_name: job.display_name.clone(),
                    reason,
                },
                other => other,
            })?;
        if execution_id.is_nil() {
            return Err(OrchestratorError::StartFailed {
                job_id: job.job_id.clone(),
                display_name: job.display_name.clone(),
                reason: "server returned the nil execution id".into(),
            });
        }
        info!(job = %job.job_id, execution = %execution_id, "job started");
        Ok(execution_id)
    }

    async fn run_to_completion(&self, job: &JobHandle) -> OrchestratorResult<ExecutionRecord> {
        let execution_id = self.start(job).await?;
        let record = self.follow_own(job, execution_id).await?;
        ensure_succeeded(&record, self.client.execution_table())?;
        Ok(record)
    }
}
