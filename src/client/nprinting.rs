//! Qlik NPrinting API v1 client.
//!
//! A task is its own target here: the server runs at most one execution of a
//! task at a time. Sessions are cookie based; the XSRF token handed out at
//! login must be echoed on every later request.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    decode_json, parse_timestamp, send_expecting, ControlPlane, Credentials, HttpConfig,
    ReloadPlane, ReloadTicket,
};
use crate::engine::StatusTable;
use crate::error::{OrchestratorError, OrchestratorResult, TransportCause};
use crate::model::{CanonicalStatus, JobHandle, RawExecution, RawStatus};

const XSRF_COOKIE: &str = "NPWEBCONSOLE_XSRF-TOKEN";
pub const DEFAULT_LOGIN_PATH: &str = "/api/v1/login/ntlm";
/// Executions fetched per page while looking for the active one.
const EXECUTION_PAGE_SIZE: usize = 50;
/// Reported for a requested metadata reload the server has not picked up yet.
const CACHE_ENQUEUED: &str = "Enqueued";

fn text_of(raw: &RawStatus) -> Option<String> {
    match raw {
        RawStatus::Text(s) => Some(s.trim().to_ascii_lowercase()),
        RawStatus::Code(_) => None,
    }
}

/// Task execution states.
pub struct TaskExecutionStatus;

impl StatusTable for TaskExecutionStatus {
    fn domain(&self) -> &'static str {
        "nprinting task"
    }

    fn lookup(&self, raw: &RawStatus) -> Option<CanonicalStatus> {
        let status = match text_of(raw)?.as_str() {
            "enqueued" | "queued" => CanonicalStatus::Pending,
            "running" | "aborting" => CanonicalStatus::Running,
            "completed" | "completedwithwarning" | "completedwithwarnings" | "warning" => {
                CanonicalStatus::Succeeded
            }
            "failed" => CanonicalStatus::Failed,
            "aborted" => CanonicalStatus::Aborted,
            _ => return None,
        };
        Some(status)
    }
}

/// Metadata cache generation states of a connection.
pub struct CacheStatus;

impl StatusTable for CacheStatus {
    fn domain(&self) -> &'static str {
        "nprinting metadata"
    }

    fn lookup(&self, raw: &RawStatus) -> Option<CanonicalStatus> {
        let status = match text_of(raw)?.as_str() {
            "enqueued" => CanonicalStatus::Pending,
            "generating" => CanonicalStatus::Running,
            "generated" => CanonicalStatus::Succeeded,
            "failed" => CanonicalStatus::Failed,
            "aborted" => CanonicalStatus::Aborted,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Debug, Clone)]
pub struct NPrintingConfig {
    pub http: HttpConfig,
    pub credentials: Option<Credentials>,
    pub login_path: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    name: String,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionList {
    #[serde(default)]
    items: Vec<Execution>,
    #[serde(default)]
    total_items: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct Execution {
    id: Uuid,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    completed: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StartedExecution {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    name: String,
    cache_status: String,
}

impl Execution {
    fn into_raw(self, task_id: &str, context: &str) -> OrchestratorResult<RawExecution> {
        let started_at = self
            .created
            .as_deref()
            .map(|s| parse_timestamp(s, context))
            .transpose()?;
        let stopped_at = self
            .completed
            .as_deref()
            .map(|s| parse_timestamp(s, context))
            .transpose()?;
        Ok(RawExecution {
            execution_id: self.id,
            job_id: task_id.to_string(),
            target_id: task_id.to_string(),
            started_at,
            stopped_at,
            raw_status: RawStatus::Text(self.status),
        })
    }
}

pub struct NPrintingClient {
    http: reqwest::Client,
    cfg: NPrintingConfig,
    xsrf_token: Option<String>,
}

impl NPrintingClient {
    pub fn new(cfg: NPrintingConfig) -> OrchestratorResult<Self> {
        let http = cfg
            .http
            .client_builder()
            .cookie_store(true)
            .build()
            .map_err(|e| {
                OrchestratorError::transport("build the NPrinting HTTP client", e)
            })?;
        Ok(Self {
            http,
            cfg,
            xsrf_token: None,
        })
    }

    /// Log in and keep the session's XSRF token for later requests.
    #[instrument(skip(self))]
    pub async fn connect(mut self) -> OrchestratorResult<Self> {
        let context = "log in to NPrinting";
        let mut req = self.http.get(self.cfg.http.url(&self.cfg.login_path));
        if let Some(creds) = &self.cfg.credentials {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }
        let resp = send_expecting(req, &[StatusCode::OK], context).await?;
        let token = resp
            .cookies()
            .find(|c| c.name() == XSRF_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or_else(|| {
                OrchestratorError::transport(
                    context,
                    TransportCause::Malformed(format!(
                        "login response carried no {XSRF_COOKIE} cookie"
                    )),
                )
            })?;
        debug!("session established");
        self.xsrf_token = Some(token);
        Ok(self)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, self.cfg.http.url(&format!("/api/v1{path}")));
        if let Some(token) = &self.xsrf_token {
            req = req.header("X-XSRF-TOKEN", token);
        }
        req
    }

    async fn fetch_data<T: for<'de> Deserialize<'de>>(
        &self,
        req: RequestBuilder,
        context: &str,
    ) -> OrchestratorResult<T> {
        let resp = send_expecting(req, &[StatusCode::OK], context).await?;
        let envelope: Envelope<T> = decode_json(resp, context).await?;
        Ok(envelope.data)
    }

    async fn get_data<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        context: &str,
    ) -> OrchestratorResult<T> {
        self.fetch_data(self.request(Method::GET, path), context).await
    }

    async fn get_connection(&self, connection_id: &str) -> OrchestratorResult<Connection> {
        self.get_data(
            &format!("/connections/{connection_id}"),
            &format!("fetch connection {connection_id}"),
        )
        .await
    }
}

fn is_generating(cache_status: &str) -> bool {
    matches!(
        CacheStatus.lookup(&RawStatus::Text(cache_status.to_string())),
        Some(CanonicalStatus::Pending | CanonicalStatus::Running)
    )
}

#[async_trait]
impl ControlPlane for NPrintingClient {
    async fn get_active_execution(
        &self,
        target_id: &str,
    ) -> OrchestratorResult<Option<RawExecution>> {
        let context = format!("list executions of task {target_id}");
        let path = format!("/tasks/{target_id}/executions");
        let mut offset = 0;
        loop {
            let req = self
                .request(Method::GET, &path)
                .query(&[("sort", "-created")])
                .query(&[("limit", EXECUTION_PAGE_SIZE), ("offset", offset)]);
            let page: ExecutionList = self.fetch_data(req, &context).await?;
            let fetched = page.items.len();
            for execution in page.items {
                let raw = execution.into_raw(target_id, &context)?;
                if raw.is_active() {
                    return Ok(Some(raw));
                }
            }
            offset += fetched;
            let exhausted = fetched < EXECUTION_PAGE_SIZE
                || page.total_items.is_some_and(|total| offset >= total);
            if exhausted {
                return Ok(None);
            }
        }
    }

    async fn get_execution_status(
        &self,
        job_id: &str,
        execution_id: Uuid,
    ) -> OrchestratorResult<RawExecution> {
        let context = format!("check execution {execution_id} of task {job_id}");
        let execution: Execution = self
            .get_data(
                &format!("/tasks/{job_id}/executions/{execution_id}"),
                &context,
            )
            .await?;
        execution.into_raw(job_id, &context)
    }

    async fn get_job_info(&self, job_id: &str) -> OrchestratorResult<JobHandle> {
        let task: TaskInfo = self
            .get_data(&format!("/tasks/{job_id}"), &format!("fetch task {job_id}"))
            .await?;
        Ok(JobHandle {
            job_id: job_id.to_string(),
            target_id: job_id.to_string(),
            enabled: task.enabled,
            display_name: task.name,
        })
    }

    #[instrument(skip(self))]
    async fn start_job(&self, job_id: &str) -> OrchestratorResult<Uuid> {
        let context = format!("execute task {job_id}");
        let resp = self
            .request(Method::POST, &format!("/tasks/{job_id}/executions"))
            .send()
            .await
            .map_err(|e| OrchestratorError::transport(&context, e))?;
        if resp.status() != StatusCode::ACCEPTED {
            return Err(OrchestratorError::StartFailed {
                job_id: job_id.to_string(),
                display_name: job_id.to_string(),
                reason: format!("HTTP {}", resp.status()),
            });
        }
        let started: Envelope<StartedExecution> = decode_json(resp, &context).await?;
        info!(task = job_id, execution = %started.data.id, "task execution created");
        Ok(started.data.id)
    }

    /// Abort whatever execution of the task is active; no-op if none is.
    #[instrument(skip(self))]
    async fn stop_job(&self, job_id: &str) -> OrchestratorResult<()> {
        let Some(active) = self.get_active_execution(job_id).await? else {
            debug!(task = job_id, "nothing to stop");
            return Ok(());
        };
        let path = format!("/tasks/{job_id}/executions/{}", active.execution_id);
        send_expecting(
            self.request(Method::PUT, &path)
                .json(&serde_json::json!({ "status": "Aborting" })),
            &[StatusCode::OK, StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
            &format!("abort execution {} of task {job_id}", active.execution_id),
        )
        .await?;
        info!(task = job_id, execution = %active.execution_id, "abort requested");
        Ok(())
    }

    fn execution_table(&self) -> &dyn StatusTable {
        &TaskExecutionStatus
    }
}

#[async_trait]
impl ReloadPlane for NPrintingClient {
    /// Request a metadata reload, unless one is already queued or generating.
    #[instrument(skip(self))]
    async fn request_reload(&self, target_id: &str) -> OrchestratorResult<ReloadTicket> {
        let connection = self.get_connection(target_id).await?;
        if is_generating(&connection.cache_status) {
            info!(
                connection = %connection.name,
                status = %connection.cache_status,
                "metadata reload already in progress"
            );
            return Ok(ReloadTicket::new(target_id, connection.name, None));
        }

        send_expecting(
            self.request(Method::POST, &format!("/connections/{target_id}/reload")),
            &[StatusCode::OK, StatusCode::ACCEPTED],
            &format!("reload metadata of connection {target_id}"),
        )
        .await?;
        info!(connection = %connection.name, "metadata reload requested");
        Ok(ReloadTicket::new(target_id, connection.name, None).issued())
    }

    /// Until the requested generation shows up as queued or running, a
    /// finished cache status is the previous run's and reads as enqueued.
    async fn reload_status(&self, ticket: &ReloadTicket) -> OrchestratorResult<RawExecution> {
        let connection = self.get_connection(&ticket.target_id).await?;
        let mut status = connection.cache_status;
        if ticket.awaiting_start() {
            if is_generating(&status) {
                ticket.mark_started();
            } else if CacheStatus
                .lookup(&RawStatus::Text(status.clone()))
                .is_some_and(CanonicalStatus::is_terminal)
            {
                debug!(
                    connection = %connection.name,
                    previous = %status,
                    "requested metadata reload not picked up yet"
                );
                status = CACHE_ENQUEUED.to_string();
            }
        }
        Ok(RawExecution {
            execution_id: Uuid::nil(),
            job_id: ticket.target_id.clone(),
            target_id: ticket.target_id.clone(),
            started_at: None,
            stopped_at: None,
            raw_status: RawStatus::Text(status),
        })
    }

    fn reload_table(&self) -> &dyn StatusTable {
        &CacheStatus
    }
}
