//! Governance service client.

use async_trait::async_trait;
use common::protocol::{CleanroomPolicy, PolicyProposal};
use common::Result;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};

use super::http::{self, join_url, HttpClient};

/// Governance capability consumed by the envelope manager and version resolver.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GovernanceService: Send + Sync {
    /// Currently approved clean room policy for `contract_id`.
    async fn cleanroom_policy(&self, contract_id: &str) -> Result<CleanroomPolicy>;

    /// Submit a clean room policy proposal for `contract_id`; returns the
    /// service's response document.
    async fn propose_cleanroom_policy(
        &self,
        contract_id: &str,
        proposal: &PolicyProposal,
    ) -> Result<Value>;

    /// Raw text of the active constitution.
    async fn constitution(&self) -> Result<String>;

    /// Active JS application bundle.
    async fn jsapp_bundle(&self) -> Result<Value>;
}

/// HTTP client for the governance service front end.
#[derive(Clone, Debug)]
pub struct GovernanceClient {
    http: HttpClient,
    endpoint: String,
}

impl GovernanceClient {
    /// Create a client for the service at `endpoint`.
    pub fn new(http: HttpClient, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = join_url(&self.endpoint, path);
        debug!(url = %url, "governance request");
        let builder = self.http.request(Method::GET, &url, None);
        http::send_expect(&Method::GET, &url, builder).await
    }
}

#[async_trait]
impl GovernanceService for GovernanceClient {
    async fn cleanroom_policy(&self, contract_id: &str) -> Result<CleanroomPolicy> {
        let path = format!("contracts/{contract_id}/cleanroompolicy");
        let url = join_url(&self.endpoint, &path);
        let resp = self.get(&path).await?;
        http::json_body(&Method::GET, &url, resp).await
    }

    async fn propose_cleanroom_policy(
        &self,
        contract_id: &str,
        proposal: &PolicyProposal,
    ) -> Result<Value> {
        let url = join_url(
            &self.endpoint,
            &format!("contracts/{contract_id}/cleanroompolicy/propose"),
        );
        let builder = self.http.request(Method::POST, &url, None).json(proposal);
        let resp = http::send_expect(&Method::POST, &url, builder).await?;
        let body: Value = http::json_body(&Method::POST, &url, resp).await?;
        info!(contract_id = %contract_id, "clean room policy proposed");
        Ok(body)
    }

    async fn constitution(&self) -> Result<String> {
        let url = join_url(&self.endpoint, "constitution");
        let resp = self.get("constitution").await?;
        http::text_body(&Method::GET, &url, resp).await
    }

    async fn jsapp_bundle(&self) -> Result<Value> {
        let url = join_url(&self.endpoint, "jsapp/bundle");
        let resp = self.get("jsapp/bundle").await?;
        http::json_body(&Method::GET, &url, resp).await
    }
}
