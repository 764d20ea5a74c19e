use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::engine::StatusTable;
use crate::error::{OrchestratorError, OrchestratorResult};

/// A schedulable unit of remote work, as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    /// Resource the job acts on; the server allows one active execution per target.
    pub target_id: String,
    pub enabled: bool,
    pub display_name: String,
}

/// Domain-specific status value exactly as the server reported it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawStatus {
    Code(i64),
    Text(String),
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawStatus::Code(code) => write!(f, "{code}"),
            RawStatus::Text(text) => write!(f, "{text:?}"),
        }
    }
}

/// Execution state returned by a control plane client, before classification.
///
/// `stopped_at` is `None` while the execution has not stopped; clients map the
/// server's "never stopped" sentinel to `None` when decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExecution {
    pub execution_id: Uuid,
    pub job_id: String,
    pub target_id: String,
    pub started_at: Option<OffsetDateTime>,
    pub stopped_at: Option<OffsetDateTime>,
    pub raw_status: RawStatus,
}

impl RawExecution {
    /// Active means not yet stopped and not the nil "no execution" record.
    pub fn is_active(&self) -> bool {
        self.stopped_at.is_none() && !self.execution_id.is_nil()
    }
}

/// Canonical lifecycle state shared by every domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl CanonicalStatus {
    #[cfg(test)]
    pub const ALL: [CanonicalStatus; 5] = [
        CanonicalStatus::Pending,
        CanonicalStatus::Running,
        CanonicalStatus::Succeeded,
        CanonicalStatus::Failed,
        CanonicalStatus::Aborted,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CanonicalStatus::Succeeded | CanonicalStatus::Failed | CanonicalStatus::Aborted
        )
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One run of a job, classified against its domain's status table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub job_id: String,
    pub target_id: String,
    pub started_at: Option<OffsetDateTime>,
    pub stopped_at: Option<OffsetDateTime>,
    pub raw_status: RawStatus,
    pub classified_status: CanonicalStatus,
    /// False when `raw_status` is missing from the table and was forced to `Failed`.
    pub recognized: bool,
}

impl ExecutionRecord {
    pub fn classify(raw: RawExecution, table: &dyn StatusTable) -> Self {
        let classification = crate::engine::classify(table, &raw.raw_status);
        Self {
            execution_id: raw.execution_id,
            job_id: raw.job_id,
            target_id: raw.target_id,
            started_at: raw.started_at,
            stopped_at: raw.stopped_at,
            raw_status: raw.raw_status,
            classified_status: classification.status,
            recognized: classification.recognized,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.classified_status.is_terminal()
    }
}

/// What to do when the requested job's target already has an active execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    #[default]
    Proceed,
    Skip,
    Wait,
    Stop,
    Error,
}

impl ConflictAction {
    /// Parse a caller-supplied action, falling back to `Proceed` for anything
    /// unrecognized. The fallback is logged so it never goes unnoticed.
    pub fn from_request(raw: &str) -> Self {
        match raw.parse() {
            Ok(action) => action,
            Err(_) => {
                tracing::warn!(
                    requested = raw,
                    "unrecognized conflict action, falling back to proceed"
                );
                ConflictAction::Proceed
            }
        }
    }
}

impl FromStr for ConflictAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proceed" => Ok(ConflictAction::Proceed),
            "skip" => Ok(ConflictAction::Skip),
            "wait" => Ok(ConflictAction::Wait),
            "stop" => Ok(ConflictAction::Stop),
            "error" => Ok(ConflictAction::Error),
            other => Err(format!("unknown conflict action {other:?}")),
        }
    }
}

impl fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictAction::Proceed => "proceed",
            ConflictAction::Skip => "skip",
            ConflictAction::Wait => "wait",
            ConflictAction::Stop => "stop",
            ConflictAction::Error => "error",
        };
        f.write_str(s)
    }
}

/// Poll timing: the wait after poll `n` (0-based) is
/// `base_interval * (1 + n / growth_divisor)`, bounded overall by `deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PollPolicy {
    #[serde(with = "humantime_serde")]
    base_interval: Duration,
    #[serde(with = "humantime_serde")]
    deadline: Duration,
    growth_divisor: u32,
}

impl PollPolicy {
    pub fn new(
        base_interval: Duration,
        deadline: Duration,
        growth_divisor: u32,
    ) -> OrchestratorResult<Self> {
        if base_interval.is_zero() {
            return Err(OrchestratorError::InvalidPolicy(
                "base interval must be greater than zero".into(),
            ));
        }
        if deadline <= base_interval {
            return Err(OrchestratorError::InvalidPolicy(format!(
                "deadline {} must be longer than the base interval {}",
                humantime::format_duration(deadline),
                humantime::format_duration(base_interval)
            )));
        }
        if growth_divisor == 0 {
            return Err(OrchestratorError::InvalidPolicy(
                "growth divisor must be greater than zero".into(),
            ));
        }
        Ok(Self {
            base_interval,
            deadline,
            growth_divisor,
        })
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Wait that follows the poll with 0-based index `poll_index`.
    pub fn interval_for(&self, poll_index: u32) -> Duration {
        let factor = 1.0 + f64::from(poll_index) / f64::from(self.growth_divisor);
        self.base_interval.mul_f64(factor)
    }
}

/// Everything one orchestration call needs besides the client.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub policy: PollPolicy,
    /// Pause between a stop request and the re-check of the target's active execution.
    #[serde(with = "humantime_serde")]
    pub stop_settle: Duration,
}

/// Result of one orchestration call, reported back to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub timestamp_utc: String,
    pub final_status: CanonicalStatus,
    pub note: String,
    pub target_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub execution_id: Option<Uuid>,
    /// The other execution that was ridden, waited on, stopped or skipped for.
    #[serde(default)]
    pub blocking_execution_id: Option<Uuid>,
    #[serde(default)]
    pub raw_status: Option<RawStatus>,
    /// The target's last completed reload, RFC 3339, when the server reports it.
    #[serde(default)]
    pub target_reloaded_at: Option<String>,
}

impl Outcome {
    pub fn new(final_status: CanonicalStatus, note: impl Into<String>, target_id: &str) -> Self {
        Self {
            timestamp_utc: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            final_status,
            note: note.into(),
            target_id: target_id.to_string(),
            job_id: None,
            execution_id: None,
            blocking_execution_id: None,
            raw_status: None,
            target_reloaded_at: None,
        }
    }

    /// Outcome describing a finished execution record.
    pub fn from_record(record: &ExecutionRecord, note: impl Into<String>) -> Self {
        Self {
            job_id: Some(record.job_id.clone()),
            execution_id: (!record.execution_id.is_nil()).then_some(record.execution_id),
            raw_status: Some(record.raw_status.clone()),
            ..Self::new(record.classified_status, note, &record.target_id)
        }
    }

    pub fn with_blocking(mut self, execution_id: Uuid) -> Self {
        self.blocking_execution_id = Some(execution_id);
        self
    }

    pub fn with_target_reloaded_at(mut self, at: Option<OffsetDateTime>) -> Self {
        self.target_reloaded_at = at.and_then(|t| t.format(&Rfc3339).ok());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: u128, stopped: bool) -> RawExecution {
        RawExecution {
            execution_id: Uuid::from_u128(id),
            job_id: "task".into(),
            target_id: "app".into(),
            started_at: None,
            stopped_at: stopped.then(OffsetDateTime::now_utc),
            raw_status: RawStatus::Code(2),
        }
    }

    #[test]
    fn active_requires_unstopped_and_non_nil_id() {
        assert!(raw(1, false).is_active());
        assert!(!raw(1, true).is_active());
        assert!(!raw(0, false).is_active());
        assert!(!raw(0, true).is_active());
    }

    #[test]
    fn terminal_statuses_are_exactly_the_finished_ones() {
        let terminal: Vec<_> = CanonicalStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                CanonicalStatus::Succeeded,
                CanonicalStatus::Failed,
                CanonicalStatus::Aborted
            ]
        );
    }

    #[test]
    fn conflict_action_parses_case_insensitively() {
        assert_eq!(" Wait ".parse::<ConflictAction>(), Ok(ConflictAction::Wait));
        assert_eq!("STOP".parse::<ConflictAction>(), Ok(ConflictAction::Stop));
        assert!("restart".parse::<ConflictAction>().is_err());
    }

    #[test]
    fn unrecognized_conflict_action_falls_back_to_proceed() {
        assert_eq!(ConflictAction::from_request("restart"), ConflictAction::Proceed);
        assert_eq!(ConflictAction::from_request("skip"), ConflictAction::Skip);
    }

    #[test]
    fn poll_interval_grows_gently_with_poll_count() {
        let policy =
            PollPolicy::new(Duration::from_secs(10), Duration::from_secs(3600), 60).unwrap();
        assert_eq!(policy.interval_for(0), Duration::from_secs(10));
        assert_eq!(policy.interval_for(60), Duration::from_secs(20));
        assert_eq!(policy.interval_for(30), Duration::from_secs(15));
    }

    #[test]
    fn poll_policy_rejects_deadline_not_longer_than_interval() {
        let err = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(10), 60);
        assert!(matches!(err, Err(OrchestratorError::InvalidPolicy(_))));
        let err = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(60), 0);
        assert!(matches!(err, Err(OrchestratorError::InvalidPolicy(_))));
    }

    #[test]
    fn outcome_from_record_hides_nil_execution_id() {
        let record = ExecutionRecord {
            execution_id: Uuid::nil(),
            job_id: "app".into(),
            target_id: "app".into(),
            started_at: None,
            stopped_at: None,
            raw_status: RawStatus::Text("Reloaded".into()),
            classified_status: CanonicalStatus::Succeeded,
            recognized: true,
        };
        let outcome = Outcome::from_record(&record, "reloaded");
        assert_eq!(outcome.execution_id, None);
        assert_eq!(outcome.final_status, CanonicalStatus::Succeeded);
    }
}
