//! Snapshot revert operation
//!
//! connect → locate VM → locate snapshot → revert → power on → disconnect.
//! Every failure is terminal for the call and nothing is retried here; the
//! caller decides whether to run the whole operation again.
//!
//! Each operation runs on its own spawned task. Dropping the returned future
//! detaches from it: the remote work and the session teardown still finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::hypervisor::{HypervisorConnector, HypervisorSession};
use crate::snapshot;
use crate::task::{wait_for_task, TaskOutcome};
use crate::types::{
    ConnectionParams, PowerOnReceipt, RevertReceipt, SnapshotNode, TaskKind, VmRef,
};
use crate::{Error, Result};

/// Bounds on the remote task waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevertOptions {
    pub revert_timeout: Duration,
    pub power_on_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RevertOptions {
    fn default() -> Self {
        Self {
            revert_timeout: Duration::from_secs(600),
            power_on_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Reverts VMs to named snapshots through a hypervisor connector.
///
/// Holds no per-VM state: concurrent calls against the same VM must be
/// serialized by the caller.
#[derive(Clone)]
pub struct SnapshotRevert {
    connector: Arc<dyn HypervisorConnector>,
    options: RevertOptions,
}

impl SnapshotRevert {
    pub fn new(connector: Arc<dyn HypervisorConnector>, options: RevertOptions) -> Self {
        Self { connector, options }
    }

    pub fn options(&self) -> &RevertOptions {
        &self.options
    }

    /// Revert `vm_name` to its unique snapshot named `snapshot_name`, then power it on.
    pub async fn revert(
        &self,
        params: &ConnectionParams,
        vm_name: &str,
        snapshot_name: &str,
    ) -> Result<RevertReceipt> {
        require_non_empty("VM name", vm_name)?;
        require_non_empty("snapshot name", snapshot_name)?;

        info!(
            vm = %vm_name,
            snapshot = %snapshot_name,
            endpoint = %params.endpoint(),
            "Reverting VM to snapshot"
        );

        let vm_name = vm_name.to_string();
        let snapshot_name = snapshot_name.to_string();
        self.detached(params, move |this, session| async move {
            let result = this
                .revert_in_session(session.as_ref(), &vm_name, &snapshot_name)
                .await;
            match &result {
                Ok(receipt) => info!(
                    vm = %vm_name,
                    snapshot = %receipt.snapshot.id,
                    "Revert complete"
                ),
                Err(e) if e.is_partial() => warn!(vm = %vm_name, "VM reverted but not powered on: {}", e),
                Err(e) => warn!(vm = %vm_name, "Revert failed: {}", e),
            }
            result
        })
        .await
    }

    /// Power on `vm_name` without reverting it.
    ///
    /// Remediation for a revert that stopped after the snapshot was applied.
    pub async fn power_on(&self, params: &ConnectionParams, vm_name: &str) -> Result<PowerOnReceipt> {
        require_non_empty("VM name", vm_name)?;
        info!(vm = %vm_name, endpoint = %params.endpoint(), "Powering on VM");

        let vm_name = vm_name.to_string();
        self.detached(params, move |this, session| async move {
            let vm = locate_vm(session.as_ref(), &vm_name).await?;
            this.power_on_in_session(session.as_ref(), &vm).await?;
            Ok(PowerOnReceipt {
                vm,
                completed_at: Utc::now(),
            })
        })
        .await
    }

    /// Fetch the snapshot tree of `vm_name`. Read-only.
    pub async fn snapshot_tree(
        &self,
        params: &ConnectionParams,
        vm_name: &str,
    ) -> Result<(VmRef, Vec<SnapshotNode>)> {
        require_non_empty("VM name", vm_name)?;

        let vm_name = vm_name.to_string();
        self.detached(params, move |_, session| async move {
            let vm = locate_vm(session.as_ref(), &vm_name).await?;
            let tree = session.snapshot_tree(&vm).await?;
            Ok((vm, tree))
        })
        .await
    }

    /// Open a session and run `work` in it on a spawned task, closing the
    /// session once `work` settles whether or not anyone still awaits it.
    async fn detached<T, F, Fut>(&self, params: &ConnectionParams, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SnapshotRevert, Arc<dyn HypervisorSession>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let this = self.clone();
        let params = params.clone();

        let handle = tokio::spawn(async move {
            let session: Arc<dyn HypervisorSession> = Arc::from(this.open(&params).await?);
            let result = work(this, session.clone()).await;
            close(session.as_ref()).await;
            result
        });

        handle
            .await
            .map_err(|e| Error::Internal(format!("hypervisor task aborted: {}", e)))?
    }

    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn HypervisorSession>> {
        if params.host.trim().is_empty() {
            return Err(Error::Connection("hypervisor host is empty".to_string()));
        }
        self.connector.connect(params).await
    }

    async fn revert_in_session(
        &self,
        session: &dyn HypervisorSession,
        vm_name: &str,
        snapshot_name: &str,
    ) -> Result<RevertReceipt> {
        let vm = locate_vm(session, vm_name).await?;

        let tree = session.snapshot_tree(&vm).await?;
        let target = snapshot::select_unique(&tree, &vm.name, snapshot_name)?;
        debug!(
            "Selected snapshot {} ({}) out of {} on {}",
            target.name,
            target.id,
            snapshot::count_nodes(&tree),
            vm.name
        );

        let task = session.revert_to_snapshot(&vm, target).await?;
        match wait_for_task(
            session,
            &task,
            TaskKind::Revert,
            self.options.revert_timeout,
            self.options.poll_interval,
        )
        .await?
        {
            TaskOutcome::Succeeded => {}
            TaskOutcome::Failed(reason) => return Err(Error::RevertTask(reason)),
        }

        self.power_on_in_session(session, &vm).await?;

        Ok(RevertReceipt {
            vm,
            snapshot: target.to_ref(),
            completed_at: Utc::now(),
        })
    }

    async fn power_on_in_session(&self, session: &dyn HypervisorSession, vm: &VmRef) -> Result<()> {
        let task = session.power_on(vm).await?;
        match wait_for_task(
            session,
            &task,
            TaskKind::PowerOn,
            self.options.power_on_timeout,
            self.options.poll_interval,
        )
        .await?
        {
            TaskOutcome::Succeeded => Ok(()),
            TaskOutcome::Failed(reason) => Err(Error::PowerOnTask(reason)),
        }
    }
}

/// Resolve `name` to exactly one VM in the inventory.
async fn locate_vm(session: &dyn HypervisorSession, name: &str) -> Result<VmRef> {
    let mut matches: Vec<VmRef> = session
        .find_vms(name)
        .await?
        .into_iter()
        .filter(|vm| vm.name == name)
        .collect();

    match matches.len() {
        0 => Err(Error::vm_not_found(name)),
        1 => Ok(matches.remove(0)),
        count => Err(Error::AmbiguousVm {
            name: name.to_string(),
            count,
        }),
    }
}

/// Teardown never overrides the operation's own result.
async fn close(session: &dyn HypervisorSession) {
    if let Err(e) = session.disconnect().await {
        warn!("Failed to close hypervisor session: {}", e);
    }
}

fn require_non_empty(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{} must not be empty", what)));
    }
    Ok(())
}
