//! Qlik Sense Repository Service (QRS) client.
//!
//! Reload tasks run against apps; the repository allows one active execution
//! per app, which is what the conflict resolver queries. Every request carries
//! the cross-site key both as `xrfkey` query parameter and `X-Qlik-xrfkey` header.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    decode_json, parse_timestamp, send_expecting, ControlPlane, Credentials, HttpConfig,
    ReloadPlane, ReloadTicket,
};
use crate::engine::StatusTable;
use crate::error::{OrchestratorError, OrchestratorResult, TransportCause};
use crate::model::{CanonicalStatus, JobHandle, RawExecution, RawStatus};

/// Timestamp the repository reports for executions that have not stopped.
pub const NEVER_STOPPED: &str = "1753-01-01T00:00:00.000Z";

const HEALTH_CHECKS: [(&str, &str); 3] = [
    ("Qlik Repository", "/qrs/about"),
    ("Qlik Engine", "/engine/healthcheck"),
    ("Qlik Printing", "/printing/alive"),
];

const STARTED: i64 = 2;
const FINISHED_SUCCESS: i64 = 7;

const RELOADING: &str = "Reloading";
const RELOADED: &str = "Reloaded";

/// QRS task execution status codes.
pub struct TaskExecutionStatus;

impl TaskExecutionStatus {
    /// Repository name for a status code, for log output.
    pub fn name(code: i64) -> Option<&'static str> {
        let name = match code {
            0 => "NeverStarted",
            1 => "Triggered",
            2 => "Started",
            3 => "Queued",
            4 => "AbortInitiated",
            5 => "Aborting",
            6 => "Aborted",
            7 => "FinishedSuccess",
            8 => "FinishedFail",
            9 => "Skipped",
            10 => "Retry",
            11 => "Error",
            12 => "Reset",
            _ => return None,
        };
        Some(name)
    }
}

impl StatusTable for TaskExecutionStatus {
    fn domain(&self) -> &'static str {
        "qlik-sense task"
    }

    fn lookup(&self, raw: &RawStatus) -> Option<CanonicalStatus> {
        let RawStatus::Code(code) = raw else {
            return None;
        };
        let status = match code {
            0 | 1 | 3 => CanonicalStatus::Pending,
            2 | 4 | 5 | 10 => CanonicalStatus::Running,
            7 => CanonicalStatus::Succeeded,
            8 | 11 => CanonicalStatus::Failed,
            6 | 9 | 12 => CanonicalStatus::Aborted,
            _ => return None,
        };
        Some(status)
    }
}

/// App reload progress, derived from the app's last reload time.
pub struct AppReloadStatus;

impl StatusTable for AppReloadStatus {
    fn domain(&self) -> &'static str {
        "qlik-sense app reload"
    }

    fn lookup(&self, raw: &RawStatus) -> Option<CanonicalStatus> {
        match raw {
            RawStatus::Text(s) if s == RELOADING => Some(CanonicalStatus::Running),
            RawStatus::Text(s) if s == RELOADED => Some(CanonicalStatus::Succeeded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QlikSenseConfig {
    pub http: HttpConfig,
    /// Value for the `X-Qlik-User` header, e.g. `UserDirectory=CORP; UserId=svc_reload`.
    pub user_header: Option<String>,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppInfo {
    name: String,
    #[serde(default)]
    last_reload_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReloadTaskInfo {
    name: String,
    enabled: bool,
    app: AppRef,
}

#[derive(Debug, Deserialize)]
struct AppRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionResult {
    #[serde(rename = "executionID")]
    execution_id: Uuid,
    #[serde(rename = "taskID")]
    task_id: String,
    #[serde(rename = "appID")]
    app_id: String,
    status: i64,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    stop_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    value: Uuid,
}

/// Parse a repository timestamp, treating the "never" sentinel as absent.
fn parse_qrs_time(raw: Option<&str>, context: &str) -> OrchestratorResult<Option<OffsetDateTime>> {
    match raw {
        None | Some(NEVER_STOPPED) | Some("") => Ok(None),
        Some(s) => parse_timestamp(s, context).map(Some),
    }
}

impl ExecutionResult {
    fn into_raw(self, context: &str) -> OrchestratorResult<RawExecution> {
        Ok(RawExecution {
            started_at: parse_qrs_time(self.start_time.as_deref(), context)?,
            stopped_at: parse_qrs_time(self.stop_time.as_deref(), context)?,
            execution_id: self.execution_id,
            job_id: self.task_id,
            target_id: self.app_id,
            raw_status: RawStatus::Code(self.status),
        })
    }
}

fn generate_xrfkey() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

pub struct QlikSenseClient {
    http: reqwest::Client,
    cfg: QlikSenseConfig,
    xrfkey: String,
}

impl QlikSenseClient {
    pub fn new(cfg: QlikSenseConfig) -> OrchestratorResult<Self> {
        let http = cfg
            .http
            .client_builder()
            .build()
            .map_err(|e| {
                OrchestratorError::transport("build the Qlik Sense HTTP client", e)
            })?;
        Ok(Self {
            http,
            cfg,
            xrfkey: generate_xrfkey(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, self.cfg.http.url(path))
            .query(&[("xrfkey", self.xrfkey.as_str())])
            .header("X-Qlik-xrfkey", &self.xrfkey)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(user) = &self.cfg.user_header {
            req = req.header("X-Qlik-User", user);
        }
        if let Some(creds) = &self.cfg.credentials {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }
        req
    }

    /// Check the repository, engine and printing services; fails on the first unhealthy one.
    pub async fn check_health(&self) -> OrchestratorResult<()> {
        for (service, path) in HEALTH_CHECKS {
            let context = format!("check that {service} is running");
            send_expecting(
                self.request(Method::GET, path),
                &[StatusCode::OK],
                &context,
            )
            .await?;
            debug!(service, "service healthy");
        }
        Ok(())
    }

    async fn get_app(&self, app_id: &str) -> OrchestratorResult<AppInfo> {
        let context = format!("fetch app {app_id}");
        let resp = send_expecting(
            self.request(Method::GET, &format!("/qrs/app/{app_id}")),
            &[StatusCode::OK],
            &context,
        )
        .await?;
        decode_json(resp, &context).await
    }

    async fn execution_results(
        &self,
        filter: String,
        context: &str,
    ) -> OrchestratorResult<Vec<RawExecution>> {
        let req = self
            .request(Method::GET, "/qrs/executionresult/full")
            .query(&[("filter", filter)]);
        let resp = send_expecting(req, &[StatusCode::OK], context).await?;
        let results: Vec<ExecutionResult> = decode_json(resp, context).await?;
        results.into_iter().map(|r| r.into_raw(context)).collect()
    }
}

#[async_trait]
impl ControlPlane for QlikSenseClient {
    #[instrument(skip(self))]
    async fn get_active_execution(
        &self,
        target_id: &str,
    ) -> OrchestratorResult<Option<RawExecution>> {
        let context = format!("fetch the active execution of app {target_id}");
        let results = self
            .execution_results(format!("appId eq {target_id}"), &context)
            .await?;
        Ok(results.into_iter().find(RawExecution::is_active))
    }

    async fn get_execution_status(
        &self,
        _job_id: &str,
        execution_id: Uuid,
    ) -> OrchestratorResult<RawExecution> {
        let context = format!("check the status of execution {execution_id}");
        let mut raw = self
            .execution_results(format!("ExecutionId eq {execution_id}"), &context)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                OrchestratorError::transport(
                    &context,
                    TransportCause::Malformed("no execution result returned".into()),
                )
            })?;
        // Success only counts once the repository has recorded a stop time.
        if raw.raw_status == RawStatus::Code(FINISHED_SUCCESS) && raw.stopped_at.is_none() {
            debug!(execution = %execution_id, "success reported without a stop time yet");
            raw.raw_status = RawStatus::Code(STARTED);
        }
        if let RawStatus::Code(code) = raw.raw_status {
            debug!(
                execution = %execution_id,
                status = TaskExecutionStatus::name(code).unwrap_or("unknown"),
                "execution status"
            );
        }
        Ok(raw)
    }

    async fn get_job_info(&self, job_id: &str) -> OrchestratorResult<JobHandle> {
        let context = format!("fetch reload task {job_id}");
        let resp = send_expecting(
            self.request(Method::GET, &format!("/qrs/reloadtask/{job_id}")),
            &[StatusCode::OK],
            &context,
        )
        .await?;
        let task: ReloadTaskInfo = decode_json(resp, &context).await?;
        Ok(JobHandle {
            job_id: job_id.to_string(),
            target_id: task.app.id,
            enabled: task.enabled,
            display_name: task.name,
        })
    }

    #[instrument(skip(self))]
    async fn start_job(&self, job_id: &str) -> OrchestratorResult<Uuid> {
        let context = format!("start task {job_id}");
        let resp = self
            .request(
                Method::POST,
                &format!("/qrs/task/{job_id}/start/synchronous"),
            )
            .send()
            .await
            .map_err(|e| OrchestratorError::transport(&context, e))?;
        if resp.status() != StatusCode::CREATED {
            return Err(OrchestratorError::StartFailed {
                job_id: job_id.to_string(),
                display_name: job_id.to_string(),
                reason: format!("HTTP {}", resp.status()),
            });
        }
        let started: StartResponse = decode_json(resp, &context).await?;
        info!(task = job_id, execution = %started.value, "task started");
        Ok(started.value)
    }

    #[instrument(skip(self))]
    async fn stop_job(&self, job_id: &str) -> OrchestratorResult<()> {
        send_expecting(
            self.request(Method::POST, &format!("/qrs/task/{job_id}/stop")),
            &[StatusCode::NO_CONTENT],
            &format!("stop task {job_id}"),
        )
        .await?;
        info!(task = job_id, "stop requested");
        Ok(())
    }

    async fn target_reloaded_at(
        &self,
        target_id: &str,
    ) -> OrchestratorResult<Option<OffsetDateTime>> {
        let app = self.get_app(target_id).await?;
        let context = format!("read the last reload time of app {target_id}");
        parse_qrs_time(app.last_reload_time.as_deref(), &context)
    }

    fn execution_table(&self) -> &dyn StatusTable {
        &TaskExecutionStatus
    }
}

#[async_trait]
impl ReloadPlane for QlikSenseClient {
    #[instrument(skip(self))]
    async fn request_reload(&self, target_id: &str) -> OrchestratorResult<ReloadTicket> {
        let app = self.get_app(target_id).await?;
        let context = format!("request a reload of app {target_id}");
        let baseline = parse_qrs_time(app.last_reload_time.as_deref(), &context)?;
        send_expecting(
            self.request(Method::POST, &format!("/qrs/app/{target_id}/reload")),
            &[StatusCode::NO_CONTENT],
            &context,
        )
        .await?;
        info!(app = %app.name, "reload requested");
        Ok(ReloadTicket::new(target_id, app.name, baseline))
    }

    async fn reload_status(&self, ticket: &ReloadTicket) -> OrchestratorResult<RawExecution> {
        let app = self.get_app(&ticket.target_id).await?;
        let context = format!("read the last reload time of app {}", ticket.target_id);
        let last = parse_qrs_time(app.last_reload_time.as_deref(), &context)?;
        let reloaded = match (last, ticket.baseline) {
            (Some(last), Some(baseline)) => last > baseline,
            (Some(_), None) => true,
            (None, _) => false,
        };
        Ok(RawExecution {
            execution_id: Uuid::nil(),
            job_id: ticket.target_id.clone(),
            target_id: ticket.target_id.clone(),
            started_at: None,
            stopped_at: if reloaded { last } else { None },
            raw_status: RawStatus::Text(if reloaded { RELOADED } else { RELOADING }.into()),
        })
    }

    fn reload_table(&self) -> &dyn StatusTable {
        &AppReloadStatus
    }
}
