//! Core types for Livefire

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default management endpoint port
pub const DEFAULT_MANAGEMENT_PORT: u16 = 443;

/// Hypervisor connection parameters for a single operation.
///
/// `ignore_ssl` only affects the client built for this connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ignore_ssl: bool,
}

fn default_port() -> u16 {
    DEFAULT_MANAGEMENT_PORT
}

impl ConnectionParams {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_MANAGEMENT_PORT,
            username: username.into(),
            password: password.into(),
            ignore_ssl: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Skip TLS certificate validation for this connection only.
    pub fn with_ignore_ssl(mut self, ignore_ssl: bool) -> Self {
        self.ignore_ssl = ignore_ssl;
        self
    }

    /// `host:port` form used in logs and error messages
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ignore_ssl", &self.ignore_ssl)
            .finish()
    }
}

/// VM power state as reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    Unknown,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::PoweredOn => write!(f, "powered_on"),
            PowerState::PoweredOff => write!(f, "powered_off"),
            PowerState::Suspended => write!(f, "suspended"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Handle to a VM in the hypervisor inventory, valid for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRef {
    /// Hypervisor-assigned identifier
    pub id: String,
    /// Display name
    pub name: String,
    #[serde(default)]
    pub power_state: PowerState,
}

/// A node in a VM's snapshot tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<SnapshotNode>) -> Self {
        self.children = children;
        self
    }

    pub fn to_ref(&self) -> SnapshotRef {
        SnapshotRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Identity of a snapshot without its subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: String,
    pub name: String,
}

/// Remote task kinds issued by Livefire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Revert,
    PowerOn,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Revert => write!(f, "revert"),
            TaskKind::PowerOn => write!(f, "power-on"),
        }
    }
}

/// Handle to a remote task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
}

impl TaskRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Remote task state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed(_))
    }
}

/// Successful revert-and-power-on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertReceipt {
    pub vm: VmRef,
    pub snapshot: SnapshotRef,
    pub completed_at: DateTime<Utc>,
}

/// Successful power-on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerOnReceipt {
    pub vm: VmRef,
    pub completed_at: DateTime<Utc>,
}

/// Mapping from an admin-facing label (e.g. a challenge) to a VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertTarget {
    pub id: String,
    pub name: String,
    pub vm_name: String,
    /// Overrides the configured baseline snapshot name
    pub snapshot_name: Option<String>,
    pub last_revert_at: Option<DateTime<Utc>>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RevertTarget {
    pub fn new(name: impl Into<String>, vm_name: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            vm_name: vm_name.into(),
            snapshot_name: None,
            last_revert_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_snapshot_name(mut self, snapshot_name: Option<String>) -> Self {
        self.snapshot_name = snapshot_name;
        self
    }

    /// Snapshot to revert to, falling back to the configured baseline
    pub fn snapshot_or<'a>(&'a self, baseline: &'a str) -> &'a str {
        self.snapshot_name.as_deref().unwrap_or(baseline)
    }
}

/// Outcome recorded for each revert or power-on attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertOutcome {
    Succeeded,
    /// Reverted but not powered on
    Partial,
    Failed,
}

impl std::fmt::Display for RevertOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RevertOutcome::Succeeded => write!(f, "succeeded"),
            RevertOutcome::Partial => write!(f, "partial"),
            RevertOutcome::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RevertOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RevertOutcome::Succeeded),
            "partial" => Ok(RevertOutcome::Partial),
            "failed" => Ok(RevertOutcome::Failed),
            other => Err(format!("unknown outcome: {}", other)),
        }
    }
}

/// Audit row for a revert or power-on attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertEvent {
    pub id: String,
    pub target_id: String,
    pub action: String,
    pub vm_name: String,
    pub snapshot_name: Option<String>,
    pub outcome: RevertOutcome,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
