//! Remote control plane clients.
//!
//! The engine only sees the [`ControlPlane`] and [`ReloadPlane`] traits; each
//! server module implements them over its REST API and supplies the status
//! tables that interpret its raw values.

pub mod nprinting;
pub mod qlik_sense;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::engine::StatusTable;
use crate::error::{OrchestratorError, OrchestratorResult, TransportCause};
use crate::model::{JobHandle, RawExecution};

/// Task operations the conflict resolver and poller need from a server.
///
/// Every method maps non-2xx responses and network failures to
/// [`OrchestratorError::Transport`]; nothing is retried here.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// The execution currently holding `target_id`, if any.
    async fn get_active_execution(&self, target_id: &str)
        -> OrchestratorResult<Option<RawExecution>>;

    async fn get_execution_status(
        &self,
        job_id: &str,
        execution_id: Uuid,
    ) -> OrchestratorResult<RawExecution>;

    async fn get_job_info(&self, job_id: &str) -> OrchestratorResult<JobHandle>;

    /// Start `job_id` and return the new execution id. A refused start is
    /// [`OrchestratorError::StartFailed`].
    async fn start_job(&self, job_id: &str) -> OrchestratorResult<Uuid>;

    async fn stop_job(&self, job_id: &str) -> OrchestratorResult<()>;

    /// When the target last finished a reload, on servers that track it.
    async fn target_reloaded_at(
        &self,
        _target_id: &str,
    ) -> OrchestratorResult<Option<OffsetDateTime>> {
        Ok(None)
    }

    fn execution_table(&self) -> &dyn StatusTable;
}

/// A reload requested through [`ReloadPlane::request_reload`].
#[derive(Debug)]
pub struct ReloadTicket {
    pub target_id: String,
    pub display_name: String,
    /// Last completed reload seen before the request, when the server reports one.
    pub baseline: Option<OffsetDateTime>,
    /// Set while a reload this call issued has not yet been seen queued or
    /// running. Until then a finished status belongs to an earlier run.
    awaiting_start: AtomicBool,
}

impl ReloadTicket {
    pub fn new(
        target_id: impl Into<String>,
        display_name: impl Into<String>,
        baseline: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            display_name: display_name.into(),
            baseline,
            awaiting_start: AtomicBool::new(false),
        }
    }

    /// Mark the reload as issued by this call.
    pub fn issued(self) -> Self {
        self.awaiting_start.store(true, Ordering::Release);
        self
    }

    pub fn awaiting_start(&self) -> bool {
        self.awaiting_start.load(Ordering::Acquire)
    }

    pub fn mark_started(&self) {
        self.awaiting_start.store(false, Ordering::Release);
    }
}

/// Simple reload-and-poll of a target, no conflict handling.
#[async_trait]
pub trait ReloadPlane: Send + Sync {
    async fn request_reload(&self, target_id: &str) -> OrchestratorResult<ReloadTicket>;

    async fn reload_status(&self, ticket: &ReloadTicket) -> OrchestratorResult<RawExecution>;

    fn reload_table(&self) -> &dyn StatusTable;
}

/// Connection settings shared by both servers.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Accept self-signed or otherwise invalid server certificates.
    pub accept_invalid_certs: bool,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl HttpConfig {
    pub(crate) fn client_builder(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Send a prepared request, mapping network failures and unexpected statuses.
pub(crate) async fn send_expecting(
    req: reqwest::RequestBuilder,
    expected: &[StatusCode],
    context: &str,
) -> OrchestratorResult<Response> {
    let resp = req
        .send()
        .await
        .map_err(|e| OrchestratorError::transport(context, e))?;
    if !expected.contains(&resp.status()) {
        return Err(OrchestratorError::transport(
            context,
            TransportCause::Status(resp.status()),
        ));
    }
    Ok(resp)
}

pub(crate) async fn decode_json<T: DeserializeOwned>(
    resp: Response,
    context: &str,
) -> OrchestratorResult<T> {
    let body = resp
        .bytes()
        .await
        .map_err(|e| OrchestratorError::transport(context, e))?;
    serde_json::from_slice(&body).map_err(|e| {
        OrchestratorError::transport(context, TransportCause::Malformed(e.to_string()))
    })
}

pub(crate) fn parse_timestamp(raw: &str, context: &str) -> OrchestratorResult<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).map_err(|e| {
        let cause = TransportCause::Malformed(format!("bad timestamp {raw:?}: {e}"));
        OrchestratorError::transport(context, cause)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let cfg = HttpConfig {
            base_url: "https://qlik.example.com/".into(),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            accept_invalid_certs: false,
            user_agent: "test".into(),
        };
        assert_eq!(cfg.url("/qrs/about"), "https://qlik.example.com/qrs/about");
    }

    #[test]
    fn only_issued_tickets_wait_for_the_reload_to_start() {
        let adopted = ReloadTicket::new("conn-1", "Sales", None);
        assert!(!adopted.awaiting_start());

        let issued = ReloadTicket::new("conn-1", "Sales", None).issued();
        assert!(issued.awaiting_start());
        issued.mark_started();
        assert!(!issued.awaiting_start());
    }

    #[test]
    fn timestamps_with_microseconds_parse() {
        let ts = parse_timestamp("2021-11-05T01:52:59.336405Z", "parse").unwrap();
        assert_eq!(ts.year(), 2021);
        assert_eq!(ts.microsecond(), 336_405);
        assert!(parse_timestamp("yesterday", "parse").is_err());
    }
}
