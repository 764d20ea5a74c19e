//! Scripted in-memory control plane for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{ControlPlane, ReloadPlane, ReloadTicket};
use crate::engine::StatusTable;
use crate::error::{OrchestratorError, OrchestratorResult, TransportCause};
use crate::model::{CanonicalStatus, JobHandle, RawExecution, RawStatus};

pub const PENDING: i64 = 0;
pub const RUNNING: i64 = 1;
pub const SUCCEEDED: i64 = 2;
pub const FAILED: i64 = 3;
pub const ABORTED: i64 = 4;

pub struct FakeTable;

impl StatusTable for FakeTable {
    fn domain(&self) -> &'static str {
        "fake"
    }

    fn lookup(&self, raw: &RawStatus) -> Option<CanonicalStatus> {
        match raw {
            RawStatus::Code(PENDING) => Some(CanonicalStatus::Pending),
            RawStatus::Code(RUNNING) => Some(CanonicalStatus::Running),
            RawStatus::Code(SUCCEEDED) => Some(CanonicalStatus::Succeeded),
            RawStatus::Code(FAILED) => Some(CanonicalStatus::Failed),
            RawStatus::Code(ABORTED) => Some(CanonicalStatus::Aborted),
            _ => None,
        }
    }
}

pub const TARGET: &str = "app-1";
pub const JOB: &str = "task-requested";
pub const BLOCKING_JOB: &str = "task-blocking";
pub const BLOCKING_EXECUTION: Uuid = Uuid::from_u128(0xB10C);

#[derive(Default)]
pub struct Calls {
    pub active_queries: u32,
    pub starts: u32,
    pub stops: Vec<String>,
    pub status_polls: u32,
}

struct State {
    job: JobHandle,
    active: Option<RawExecution>,
    scripts: HashMap<Uuid, VecDeque<i64>>,
    /// Script applied to every execution started through `start_job`.
    started_script: Vec<i64>,
    next_execution: u128,
    start_result: Option<Uuid>,
    start_accepted: bool,
    stop_succeeds: bool,
    stop_clears_active: bool,
    reload_script: VecDeque<i64>,
    reloaded_at: Option<OffsetDateTime>,
    calls: Calls,
}

/// Cloneable handle; clones share state so tests can inspect calls afterwards.
#[derive(Clone)]
pub struct FakePlane {
    state: Arc<Mutex<State>>,
}

impl FakePlane {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                job: JobHandle {
                    job_id: JOB.into(),
                    target_id: TARGET.into(),
                    enabled: true,
                    display_name: "Requested reload".into(),
                },
                active: None,
                scripts: HashMap::new(),
                started_script: vec![RUNNING, SUCCEEDED],
                next_execution: 1,
                start_result: None,
                start_accepted: true,
                stop_succeeds: true,
                stop_clears_active: true,
                reload_script: VecDeque::from(vec![RUNNING, SUCCEEDED]),
                reloaded_at: None,
                calls: Calls::default(),
            })),
        }
    }

    fn with_state(self, f: impl FnOnce(&mut State)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn disabled(self) -> Self {
        self.with_state(|s| s.job.enabled = false)
    }

    /// Put a blocking execution on the target that reports `script` in order
    /// (the last value repeats).
    pub fn with_active(self, script: Vec<i64>) -> Self {
        self.with_state(|s| {
            s.active = Some(execution(BLOCKING_EXECUTION, BLOCKING_JOB, RUNNING));
            s.scripts.insert(BLOCKING_EXECUTION, script.into());
        })
    }

    pub fn with_started_script(self, script: Vec<i64>) -> Self {
        self.with_state(|s| s.started_script = script)
    }

    pub fn with_start_result(self, id: Uuid) -> Self {
        self.with_state(|s| s.start_result = Some(id))
    }

    pub fn rejecting_start(self) -> Self {
        self.with_state(|s| s.start_accepted = false)
    }

    pub fn failing_stop(self) -> Self {
        self.with_state(|s| s.stop_succeeds = false)
    }

    /// Stop requests succeed but the blocking execution stays active.
    pub fn sticky_active(self) -> Self {
        self.with_state(|s| s.stop_clears_active = false)
    }

    pub fn with_reload_script(self, script: Vec<i64>) -> Self {
        self.with_state(|s| s.reload_script = script.into())
    }

    pub fn with_target_reloaded_at(self, at: OffsetDateTime) -> Self {
        self.with_state(|s| s.reloaded_at = Some(at))
    }

    pub fn calls<T>(&self, f: impl FnOnce(&Calls) -> T) -> T {
        f(&self.state.lock().unwrap().calls)
    }
}

fn execution(id: Uuid, job_id: &str, code: i64) -> RawExecution {
    RawExecution {
        execution_id: id,
        job_id: job_id.into(),
        target_id: TARGET.into(),
        started_at: Some(OffsetDateTime::UNIX_EPOCH),
        stopped_at: None,
        raw_status: RawStatus::Code(code),
    }
}

fn next_code(script: &mut VecDeque<i64>) -> i64 {
    if script.len() > 1 {
        script.pop_front().unwrap_or(RUNNING)
    } else {
        script.front().copied().unwrap_or(RUNNING)
    }
}

fn refused(context: &str) -> OrchestratorError {
    OrchestratorError::transport(
        context,
        TransportCause::Status(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
    )
}

#[async_trait]
impl ControlPlane for FakePlane {
    async fn get_active_execution(
        &self,
        target_id: &str,
    ) -> OrchestratorResult<Option<RawExecution>> {
        let mut s = self.state.lock().unwrap();
        s.calls.active_queries += 1;
        Ok(s.active
            .clone()
            .filter(|a| a.target_id == target_id && a.is_active()))
    }

    async fn get_execution_status(
        &self,
        job_id: &str,
        execution_id: Uuid,
    ) -> OrchestratorResult<RawExecution> {
        let mut s = self.state.lock().unwrap();
        s.calls.status_polls += 1;
        let script = s
            .scripts
            .get_mut(&execution_id)
            .ok_or_else(|| refused("fetch unknown execution"))?;
        let code = next_code(script);
        let mut raw = execution(execution_id, job_id, code);
        if FakeTable.lookup(&raw.raw_status).is_some_and(|c| c.is_terminal()) {
            raw.stopped_at = Some(OffsetDateTime::UNIX_EPOCH);
            if s.active.as_ref().map(|a| a.execution_id) == Some(execution_id) {
                s.active = None;
            }
        }
        Ok(raw)
    }

    async fn get_job_info(&self, job_id: &str) -> OrchestratorResult<JobHandle> {
        let s = self.state.lock().unwrap();
        if s.job.job_id == job_id {
            Ok(s.job.clone())
        } else {
            Err(refused("fetch job info"))
        }
    }

    async fn start_job(&self, job_id: &str) -> OrchestratorResult<Uuid> {
        let mut s = self.state.lock().unwrap();
        s.calls.starts += 1;
        if !s.start_accepted {
            return Err(OrchestratorError::StartFailed {
                job_id: job_id.into(),
                display_name: s.job.display_name.clone(),
                reason: "HTTP 409 Conflict".into(),
            });
        }
        if let Some(id) = s.start_result {
            return Ok(id);
        }
        let id = Uuid::from_u128(s.next_execution);
        s.next_execution += 1;
        let script = s.started_script.clone().into();
        s.scripts.insert(id, script);
        s.active = Some(execution(id, job_id, PENDING));
        Ok(id)
    }

    async fn stop_job(&self, job_id: &str) -> OrchestratorResult<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.stops.push(job_id.to_string());
        if !s.stop_succeeds {
            return Err(refused("stop job"));
        }
        if s.stop_clears_active && s.active.as_ref().is_some_and(|a| a.job_id == job_id) {
            s.active = None;
        }
        Ok(())
    }

    async fn target_reloaded_at(
        &self,
        _target_id: &str,
    ) -> OrchestratorResult<Option<OffsetDateTime>> {
        Ok(self.state.lock().unwrap().reloaded_at)
    }

    fn execution_table(&self) -> &dyn StatusTable {
        &FakeTable
    }
}

#[async_trait]
impl ReloadPlane for FakePlane {
    async fn request_reload(&self, target_id: &str) -> OrchestratorResult<ReloadTicket> {
        Ok(ReloadTicket::new(target_id, "Fake app", None))
    }

    async fn reload_status(&self, ticket: &ReloadTicket) -> OrchestratorResult<RawExecution> {
        let mut s = self.state.lock().unwrap();
        s.calls.status_polls += 1;
        let code = next_code(&mut s.reload_script);
        let mut raw = execution(Uuid::nil(), &ticket.target_id, code);
        raw.target_id = ticket.target_id.clone();
        Ok(raw)
    }

    fn reload_table(&self) -> &dyn StatusTable {
        &FakeTable
    }
}
