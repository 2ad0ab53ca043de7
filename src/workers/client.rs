//! How a worker agent reaches the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::model::{
    Assignment, HeartbeatAck, HeartbeatRequest, ReportOutcome, ReportedStatus, ResultReport,
};
use crate::error::{ClientError, Error};
use crate::orchestrator::Orchestrator;

#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn heartbeat(
        &self,
        worker_id: &str,
        status: ReportedStatus,
    ) -> Result<HeartbeatAck, ClientError>;

    /// `None` when nothing is ready.
    async fn next_assignment(&self, worker_id: &str) -> Result<Option<Assignment>, ClientError>;

    async fn report(&self, report: ResultReport) -> Result<ReportOutcome, ClientError>;
}

/// Calls an orchestrator in the same process.
pub struct LocalClient {
    orchestrator: Arc<Orchestrator>,
}

impl LocalClient {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl OrchestratorClient for LocalClient {
    async fn heartbeat(
        &self,
        worker_id: &str,
        status: ReportedStatus,
    ) -> Result<HeartbeatAck, ClientError> {
        Ok(self.orchestrator.heartbeat(worker_id, status).await)
    }

    async fn next_assignment(&self, worker_id: &str) -> Result<Option<Assignment>, ClientError> {
        Ok(self.orchestrator.next_assignment(worker_id).await)
    }

    async fn report(&self, report: ResultReport) -> Result<ReportOutcome, ClientError> {
        self.orchestrator
            .report_result(report)
            .await
            .map_err(|e| match e {
                Error::Task(e) => ClientError::Status {
                    status: StatusCode::NOT_FOUND.as_u16(),
                    body: e.to_string(),
                },
                other => ClientError::Status {
                    status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    body: other.to_string(),
                },
            })
    }
}

/// Talks to a remote orchestrator over its worker-facing HTTP routes.
pub struct HttpClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Send `token` as a bearer token on every call.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    response
        .json()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))
}

#[async_trait]
impl OrchestratorClient for HttpClient {
    async fn heartbeat(
        &self,
        worker_id: &str,
        status: ReportedStatus,
    ) -> Result<HeartbeatAck, ClientError> {
        let response = self
            .post(&format!("/internal/workers/{worker_id}/heartbeat"))
            .json(&HeartbeatRequest { status })
            .send()
            .await?;
        decode(check(response).await?).await
    }

    async fn next_assignment(&self, worker_id: &str) -> Result<Option<Assignment>, ClientError> {
        let response = self
            .post(&format!("/internal/workers/{worker_id}/next"))
            .send()
            .await?;
        let response = check(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn report(&self, report: ResultReport) -> Result<ReportOutcome, ClientError> {
        let response = self
            .post("/internal/results")
            .json(&report)
            .send()
            .await?;
        decode(check(response).await?).await
    }
}
