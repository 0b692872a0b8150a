//! Hypervisor backend traits
//!
//! A connector opens one session per operation. Sessions expose just the
//! inventory, snapshot and power calls the revert workflow needs.

use async_trait::async_trait;

use crate::types::{ConnectionParams, SnapshotNode, TaskRef, TaskState, VmRef};
use crate::Result;

/// Opens authenticated sessions against a management endpoint
#[async_trait]
pub trait HypervisorConnector: Send + Sync {
    /// Open a session. Unreachable endpoints and rejected credentials
    /// surface as [`crate::Error::Connection`].
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn HypervisorSession>>;
}

/// One authenticated session against a management endpoint
#[async_trait]
pub trait HypervisorSession: Send + Sync {
    /// VMs named `name`, across all folders and datacenters
    async fn find_vms(&self, name: &str) -> Result<Vec<VmRef>>;

    /// Root snapshots of a VM, each carrying its subtree
    async fn snapshot_tree(&self, vm: &VmRef) -> Result<Vec<SnapshotNode>>;

    /// Start reverting `vm` to `snapshot`
    async fn revert_to_snapshot(&self, vm: &VmRef, snapshot: &SnapshotNode) -> Result<TaskRef>;

    /// Start powering on `vm`
    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef>;

    async fn task_state(&self, task: &TaskRef) -> Result<TaskState>;

    /// Close the session. Called exactly once per session.
    async fn disconnect(&self) -> Result<()>;
}
