//! Admin service HTTP client

use anyhow::{Context, Result};
use livefire_common::{PowerOnReceipt, RevertEvent, RevertReceipt, RevertTarget, SnapshotNode, VmRef};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

/// Error reported by the admin service
#[derive(Debug, thiserror::Error)]
#[error("{message} ({kind}, HTTP {status})")]
pub struct ServiceError {
    pub status: u16,
    pub kind: String,
    pub message: String,
    /// The VM was reverted but is not known to be running
    pub partial: bool,
    pub count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    partial: bool,
    count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertResponse {
    pub target: RevertTarget,
    pub receipt: RevertReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerOnResponse {
    pub target: RevertTarget,
    pub receipt: PowerOnReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotsResponse {
    pub vm: VmRef,
    pub snapshot_name: String,
    pub snapshots: Vec<SnapshotNode>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    /// Empty string clears the override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
}

/// Client for the Livefire admin service
pub struct AdminClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl AdminClient {
    pub fn new(base: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base, path));
        match &self.token {
            Some(token) => builder.header("x-livefire-admin-token", token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("cannot reach admin service at {}", self.base))?;
        let status = response.status();
        debug!("{} answered HTTP {}", response.url(), status);

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .context("unexpected response from admin service");
        }

        let text = response.text().await.unwrap_or_default();
        Err(service_error(status, &text).into())
    }

    /// Check if the admin service is up
    pub async fn health(&self) -> Result<serde_json::Value> {
        self.send(self.request(Method::GET, "/healthz")).await
    }

    pub async fn list_targets(&self) -> Result<Vec<RevertTarget>> {
        self.send(self.request(Method::GET, "/admin/targets")).await
    }

    pub async fn get_target(&self, id: &str) -> Result<RevertTarget> {
        self.send(self.request(Method::GET, &target_path(id, ""))).await
    }

    pub async fn create_target(
        &self,
        name: &str,
        vm_name: &str,
        snapshot_name: Option<String>,
    ) -> Result<RevertTarget> {
        let body = serde_json::json!({
            "name": name,
            "vm_name": vm_name,
            "snapshot_name": snapshot_name,
        });
        self.send(self.request(Method::POST, "/admin/targets").json(&body))
            .await
    }

    pub async fn update_target(&self, id: &str, update: &TargetUpdate) -> Result<RevertTarget> {
        self.send(self.request(Method::PUT, &target_path(id, "")).json(update))
            .await
    }

    pub async fn delete_target(&self, id: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, &target_path(id, ""))
            .send()
            .await
            .with_context(|| format!("cannot reach admin service at {}", self.base))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(service_error(status, &text).into())
    }

    pub async fn revert_target(&self, id: &str) -> Result<RevertResponse> {
        self.send(self.request(Method::POST, &target_path(id, "/revert")))
            .await
    }

    pub async fn power_on_target(&self, id: &str) -> Result<PowerOnResponse> {
        self.send(self.request(Method::POST, &target_path(id, "/power-on")))
            .await
    }

    pub async fn snapshots(&self, id: &str) -> Result<SnapshotsResponse> {
        self.send(self.request(Method::GET, &target_path(id, "/snapshots")))
            .await
    }

    pub async fn events(&self, id: &str, limit: usize) -> Result<Vec<RevertEvent>> {
        let path = format!("{}?limit={}", target_path(id, "/events"), limit);
        self.send(self.request(Method::GET, &path)).await
    }
}

fn target_path(id: &str, suffix: &str) -> String {
    format!("/admin/targets/{}{}", urlencoding::encode(id), suffix)
}

fn service_error(status: StatusCode, text: &str) -> ServiceError {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => ServiceError {
            status: status.as_u16(),
            kind: body.error,
            message: body.message,
            partial: body.partial,
            count: body.count,
        },
        Err(_) => ServiceError {
            status: status.as_u16(),
            kind: "http".to_string(),
            message: if text.is_empty() {
                status.to_string()
            } else {
                text.to_string()
            },
            partial: false,
            count: None,
        },
    }
}
