//! vCenter-style REST backend
//!
//! Speaks the JSON management API: a session token from `POST /api/session`
//! authenticates every later call via the `vmware-api-session-id` header.
//! Revert and power-on are issued as tasks and polled through `/api/cis/tasks`.

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::hypervisor::{HypervisorConnector, HypervisorSession};
use crate::types::{ConnectionParams, PowerState, SnapshotNode, TaskRef, TaskState, VmRef};
use crate::{Error, Result};

const SESSION_HEADER: &str = "vmware-api-session-id";
const MAX_ERROR_BODY: usize = 512;

/// Connector for vCenter-style management endpoints
#[derive(Debug, Clone)]
pub struct VsphereConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for VsphereConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl VsphereConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, request_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.request_timeout = request_timeout;
        self
    }

    /// `https://host:port`, or `host` as-is when it already carries a scheme.
    fn base_url(params: &ConnectionParams) -> Result<Url> {
        let raw = if params.host.starts_with("http://") || params.host.starts_with("https://") {
            params.host.clone()
        } else {
            format!("https://{}:{}", params.host, params.port)
        };
        Url::parse(&raw).map_err(|e| Error::Connection(format!("invalid endpoint {}: {}", raw, e)))
    }

    fn build_client(&self, params: &ConnectionParams) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(params.ignore_ssl)
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {}", e)))
    }
}

#[async_trait]
impl HypervisorConnector for VsphereConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn HypervisorSession>> {
        let base = Self::base_url(params)?;
        if params.ignore_ssl {
            debug!("TLS certificate validation disabled for {}", params.endpoint());
        }
        let client = self.build_client(params)?;

        let url = join(&base, &["api", "session"])?;
        let response = client
            .post(url)
            .basic_auth(&params.username, Some(&params.password))
            .send()
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", params.endpoint(), e)))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::Connection(format!(
                    "{} rejected credentials for {}",
                    params.endpoint(),
                    params.username
                )));
            }
            status if !status.is_success() => return Err(api_error(response).await),
            _ => {}
        }

        let token: String = decode(response).await?;
        info!("Opened session on {} as {}", params.endpoint(), params.username);

        Ok(Box::new(VsphereSession {
            client,
            base,
            token,
        }))
    }
}

/// Authenticated REST session
pub struct VsphereSession {
    client: reqwest::Client,
    base: Url,
    token: String,
}

impl VsphereSession {
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = join(&self.base, segments)?;
        trace!("{} {}", method, url);

        let response = self
            .client
            .request(method, url)
            .header(SESSION_HEADER, &self.token)
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        decode(response).await
    }

    async fn start_task(&self, segments: &[&str], action: &str) -> Result<TaskRef> {
        let id: String = self
            .request(
                Method::POST,
                segments,
                &[("action", action), ("vmw-tasks", "true")],
            )
            .await?;
        Ok(TaskRef::new(id))
    }
}

#[async_trait]
impl HypervisorSession for VsphereSession {
    async fn find_vms(&self, name: &str) -> Result<Vec<VmRef>> {
        // Filtered server-side; the unfiltered listing is refused on large inventories
        let summaries: Vec<VmSummary> = self
            .request(Method::GET, &["api", "vcenter", "vm"], &[("names", name)])
            .await?;
        debug!("Inventory lists {} VMs named {}", summaries.len(), name);
        Ok(summaries.into_iter().map(VmRef::from).collect())
    }

    async fn snapshot_tree(&self, vm: &VmRef) -> Result<Vec<SnapshotNode>> {
        let roots: Vec<SnapshotInfo> = self
            .request(Method::GET, &["api", "vcenter", "vm", vm.id.as_str(), "snapshots"], &[])
            .await?;
        Ok(roots.into_iter().map(SnapshotNode::from).collect())
    }

    async fn revert_to_snapshot(&self, vm: &VmRef, snapshot: &SnapshotNode) -> Result<TaskRef> {
        self.start_task(
            &["api", "vcenter", "vm", vm.id.as_str(), "snapshots", snapshot.id.as_str()],
            "revert",
        )
        .await
    }

    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef> {
        self.start_task(&["api", "vcenter", "vm", vm.id.as_str(), "power"], "start")
            .await
    }

    async fn task_state(&self, task: &TaskRef) -> Result<TaskState> {
        let info: TaskInfo = self
            .request(Method::GET, &["api", "cis", "tasks", task.id.as_str()], &[])
            .await?;
        Ok(info.into_state())
    }

    async fn disconnect(&self) -> Result<()> {
        let url = join(&self.base, &["api", "session"])?;
        let response = self
            .client
            .delete(url)
            .header(SESSION_HEADER, &self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        debug!("Closed session on {}", self.base);
        Ok(())
    }
}

fn join(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Connection(format!("{} cannot be a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn api_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .ok()
        .and_then(|b| b.first_message())
        .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY).collect());
    Error::Api { status, message }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
    #[serde(default)]
    power_state: Option<String>,
}

impl From<VmSummary> for VmRef {
    fn from(s: VmSummary) -> Self {
        let power_state = match s.power_state.as_deref() {
            Some("POWERED_ON") => PowerState::PoweredOn,
            Some("POWERED_OFF") => PowerState::PoweredOff,
            Some("SUSPENDED") => PowerState::Suspended,
            _ => PowerState::Unknown,
        };
        VmRef {
            id: s.vm,
            name: s.name,
            power_state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotInfo {
    snapshot: String,
    name: String,
    #[serde(default)]
    children: Vec<SnapshotInfo>,
}

impl From<SnapshotInfo> for SnapshotNode {
    fn from(s: SnapshotInfo) -> Self {
        SnapshotNode {
            id: s.snapshot,
            name: s.name,
            children: s.children.into_iter().map(SnapshotNode::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LocalizableMessage {
    #[serde(default)]
    default_message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    messages: Vec<LocalizableMessage>,
}

impl ApiErrorBody {
    fn first_message(&self) -> Option<String> {
        self.messages
            .iter()
            .map(|m| m.default_message.trim())
            .find(|m| !m.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    status: String,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

impl TaskInfo {
    fn into_state(self) -> TaskState {
        match self.status.as_str() {
            "SUCCEEDED" => TaskState::Succeeded,
            "FAILED" => TaskState::Failed(
                self.error
                    .and_then(|e| e.first_message())
                    .unwrap_or_else(|| "task failed without a reason".to_string()),
            ),
            "PENDING" => TaskState::Queued,
            _ => TaskState::Running,
        }
    }
}
