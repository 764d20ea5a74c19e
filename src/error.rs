//! Orchestration error taxonomy.
//!
//! Every variant carries the identifiers a scheduler operator needs to act on
//! the failure (job, execution, target). Nothing here is retried internally.

use thiserror::Error;
use uuid::Uuid;

use crate::model::{CanonicalStatus, RawStatus};

/// Result type for orchestration operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Underlying cause of a transport failure.
#[derive(Debug, Error)]
pub enum TransportCause {
    /// Network, TLS or timeout failure raised by the HTTP client
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The server answered with a status the call does not accept
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),

    /// The server answered but the body was not what the call expects
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("transport error while trying to {context}: {cause}")]
    Transport {
        context: String,
        #[source]
        cause: TransportCause,
    },

    /// Deadline exceeded while polling an execution this call does not own.
    #[error(
        "timed out after {deadline_secs}s ({polls} polls) waiting for execution {execution_id} \
         of job {job_id} on target {target_id}"
    )]
    Timeout {
        job_id: String,
        execution_id: Uuid,
        target_id: String,
        deadline_secs: u64,
        polls: u32,
    },

    /// Deadline exceeded on the requested job's own execution; a stop was attempted.
    #[error(
        "timed out after {deadline_secs}s waiting for execution {execution_id} of job {job_id} \
         on target {target_id}; stop request {}",
        stop_verdict(.stop_succeeded)
    )]
    TimeoutAfterStopAttempt {
        job_id: String,
        execution_id: Uuid,
        target_id: String,
        deadline_secs: u64,
        stop_succeeded: bool,
    },

    #[error("job \"{display_name}\" ({job_id}) is not enabled to execute")]
    NotEnabled { job_id: String, display_name: String },

    #[error("the server did not accept a start of job \"{display_name}\" ({job_id}): {reason}")]
    StartFailed {
        job_id: String,
        display_name: String,
        reason: String,
    },

    #[error(
        "cannot execute job {job_id}: execution {blocking_execution_id} of job {blocking_job_id} \
         is still running on target {target_id}"
    )]
    ActiveConflict {
        job_id: String,
        target_id: String,
        blocking_job_id: String,
        blocking_execution_id: Uuid,
    },

    #[error(
        "stopped job {stopped_job_id} but execution {active_execution_id} of job {active_job_id} \
         is still running on target {target_id}; stop it manually"
    )]
    StopConflict {
        target_id: String,
        stopped_job_id: String,
        active_job_id: String,
        active_execution_id: Uuid,
    },

    #[error(
        "execution {execution_id} of job {job_id} on target {target_id} finished as {status} \
         (raw status {raw_status})"
    )]
    RemoteFailure {
        job_id: String,
        execution_id: Uuid,
        target_id: String,
        status: CanonicalStatus,
        raw_status: RawStatus,
    },

    /// Terminal by classification rule, but the raw value is not in the domain table.
    #[error(
        "execution {execution_id} of job {job_id} on target {target_id} reported unrecognized \
         {domain} status {raw_status}"
    )]
    UnknownStatus {
        job_id: String,
        execution_id: Uuid,
        target_id: String,
        domain: &'static str,
        raw_status: RawStatus,
    },

    /// `stop_succeeded` is set when the interrupted execution was started by
    /// this call and a stop was attempted.
    #[error(
        "cancelled while polling target {target_id}{}",
        cancel_stop_note(.stop_succeeded)
    )]
    Cancelled {
        target_id: String,
        execution_id: Option<Uuid>,
        stop_succeeded: Option<bool>,
    },

    #[error("invalid poll policy: {0}")]
    InvalidPolicy(String),
}

fn stop_verdict(succeeded: &bool) -> &'static str {
    if *succeeded {
        "succeeded"
    } else {
        "failed, stop the job manually"
    }
}

fn cancel_stop_note(stop_succeeded: &Option<bool>) -> String {
    stop_succeeded
        .map(|ok| format!("; stop request {}", stop_verdict(&ok)))
        .unwrap_or_default()
}

impl OrchestratorError {
    pub fn transport(context: impl Into<String>, cause: impl Into<TransportCause>) -> Self {
        Self::Transport {
            context: context.into(),
            cause: cause.into(),
        }
    }

    /// Whether the remote run itself (rather than this orchestrator) ended badly.
    #[must_use]
    pub const fn is_remote_failure(&self) -> bool {
        matches!(self, Self::RemoteFailure { .. } | Self::UnknownStatus { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_after_stop_reports_stop_result() {
        let err = OrchestratorError::TimeoutAfterStopAttempt {
            job_id: "task-1".into(),
            execution_id: Uuid::from_u128(7),
            target_id: "app-1".into(),
            deadline_secs: 60,
            stop_succeeded: false,
        };
        let msg = err.to_string();
        assert!(msg.contains("task-1"));
        assert!(msg.contains("app-1"));
        assert!(msg.contains("stop the job manually"));
    }

    #[test]
    fn cancellation_reports_the_stop_attempt_only_when_one_was_made() {
        let stopped = OrchestratorError::Cancelled {
            target_id: "app-1".into(),
            execution_id: Some(Uuid::from_u128(7)),
            stop_succeeded: Some(false),
        };
        assert_eq!(
            stopped.to_string(),
            "cancelled while polling target app-1; stop request failed, stop the job manually"
        );

        let untouched = OrchestratorError::Cancelled {
            target_id: "app-1".into(),
            execution_id: None,
            stop_succeeded: None,
        };
        assert_eq!(untouched.to_string(), "cancelled while polling target app-1");
    }

    #[test]
    fn unknown_status_counts_as_remote_failure() {
        let err = OrchestratorError::UnknownStatus {
            job_id: "task-1".into(),
            execution_id: Uuid::from_u128(7),
            target_id: "app-1".into(),
            domain: "qlik-sense task",
            raw_status: RawStatus::Code(42),
        };
        assert!(err.is_remote_failure());
        assert!(err.to_string().contains("unrecognized qlik-sense task status 42"));
    }

    #[test]
    fn transport_error_names_the_operation() {
        let err = OrchestratorError::transport(
            "start job task-1",
            TransportCause::Status(reqwest::StatusCode::FORBIDDEN),
        );
        assert_eq!(
            err.to_string(),
            "transport error while trying to start job task-1: unexpected HTTP status 403 Forbidden"
        );
    }
}
