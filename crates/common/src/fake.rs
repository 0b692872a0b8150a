//! In-process fake hypervisor
//!
//! Records every call so tests can assert on ordering, and lets each test
//! script how revert and power-on tasks behave.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::hypervisor::{HypervisorConnector, HypervisorSession};
use crate::types::{ConnectionParams, PowerState, SnapshotNode, TaskRef, TaskState, VmRef};
use crate::{Error, Result};

/// Scripted behavior of a remote task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeTask {
    Succeed,
    /// Report `Running` for this many polls, then succeed
    SucceedAfter(u32),
    Fail(String),
    /// Never leave `Running`
    Hang,
}

/// A call made against the fake, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Connect,
    FindVms { name: String },
    SnapshotTree { vm: String },
    Revert { vm: String, snapshot: String },
    PowerOn { vm: String },
    Disconnect,
}

/// VM in the fake inventory
#[derive(Debug, Clone)]
pub struct FakeVm {
    pub id: String,
    pub name: String,
    pub power_state: PowerState,
    pub snapshots: Vec<SnapshotNode>,
    /// Snapshot the VM was last reverted to
    pub current_snapshot: Option<String>,
}

impl FakeVm {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            power_state: PowerState::PoweredOn,
            snapshots: Vec::new(),
            current_snapshot: None,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Vec<SnapshotNode>) -> Self {
        self.snapshots = snapshots;
        self
    }

    fn to_ref(&self) -> VmRef {
        VmRef {
            id: self.id.clone(),
            name: self.name.clone(),
            power_state: self.power_state,
        }
    }
}

enum Effect {
    Revert { vm_id: String, snapshot_id: String },
    PowerOn { vm_id: String },
}

struct PendingTask {
    script: FakeTask,
    polls: u32,
    effect: Option<Effect>,
}

struct FakeState {
    vms: Vec<FakeVm>,
    connect_error: Option<String>,
    revert_task: FakeTask,
    power_on_task: FakeTask,
    tasks: HashMap<String, PendingTask>,
    calls: Vec<FakeCall>,
    next_task: u64,
    task_polls: usize,
}

impl FakeState {
    fn vm_mut(&mut self, id: &str) -> Option<&mut FakeVm> {
        self.vms.iter_mut().find(|vm| vm.id == id)
    }

    fn start_task(&mut self, script: FakeTask, effect: Effect) -> TaskRef {
        self.next_task += 1;
        let id = format!("task-{}", self.next_task);
        self.tasks.insert(
            id.clone(),
            PendingTask {
                script,
                polls: 0,
                effect: Some(effect),
            },
        );
        TaskRef::new(id)
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Revert { vm_id, snapshot_id } => {
                if let Some(vm) = self.vm_mut(&vm_id) {
                    vm.power_state = PowerState::PoweredOff;
                    vm.current_snapshot = Some(snapshot_id);
                }
            }
            Effect::PowerOn { vm_id } => {
                if let Some(vm) = self.vm_mut(&vm_id) {
                    vm.power_state = PowerState::PoweredOn;
                }
            }
        }
    }
}

/// Fake connector; clones share state
#[derive(Clone)]
pub struct FakeHypervisor {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                vms: Vec::new(),
                connect_error: None,
                revert_task: FakeTask::Succeed,
                power_on_task: FakeTask::Succeed,
                tasks: HashMap::new(),
                calls: Vec::new(),
                next_task: 0,
                task_polls: 0,
            })),
        }
    }

    pub fn with_vm(self, vm: FakeVm) -> Self {
        self.state.lock().vms.push(vm);
        self
    }

    pub fn with_connect_error(self, message: impl Into<String>) -> Self {
        self.state.lock().connect_error = Some(message.into());
        self
    }

    pub fn with_revert_task(self, task: FakeTask) -> Self {
        self.state.lock().revert_task = task;
        self
    }

    pub fn with_power_on_task(self, task: FakeTask) -> Self {
        self.state.lock().power_on_task = task;
        self
    }

    /// All calls made so far
    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&FakeCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn disconnects(&self) -> usize {
        self.count_calls(|c| matches!(c, FakeCall::Disconnect))
    }

    pub fn reverts(&self) -> usize {
        self.count_calls(|c| matches!(c, FakeCall::Revert { .. }))
    }

    pub fn power_ons(&self) -> usize {
        self.count_calls(|c| matches!(c, FakeCall::PowerOn { .. }))
    }

    pub fn task_polls(&self) -> usize {
        self.state.lock().task_polls
    }

    /// Current state of a VM by id
    pub fn vm(&self, id: &str) -> Option<FakeVm> {
        self.state.lock().vms.iter().find(|vm| vm.id == id).cloned()
    }
}

#[async_trait]
impl HypervisorConnector for FakeHypervisor {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn HypervisorSession>> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::Connect);
        if let Some(message) = &state.connect_error {
            return Err(Error::Connection(format!(
                "{}: {}",
                params.endpoint(),
                message
            )));
        }
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    fn find_vm(state: &FakeState, vm: &VmRef) -> Result<FakeVm> {
        state
            .vms
            .iter()
            .find(|v| v.id == vm.id)
            .cloned()
            .ok_or_else(|| Error::vm_not_found(&vm.name))
    }
}

#[async_trait]
impl HypervisorSession for FakeSession {
    async fn find_vms(&self, name: &str) -> Result<Vec<VmRef>> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::FindVms {
            name: name.to_string(),
        });
        Ok(state
            .vms
            .iter()
            .filter(|vm| vm.name == name)
            .map(FakeVm::to_ref)
            .collect())
    }

    async fn snapshot_tree(&self, vm: &VmRef) -> Result<Vec<SnapshotNode>> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::SnapshotTree {
            vm: vm.name.clone(),
        });
        Ok(Self::find_vm(&state, vm)?.snapshots)
    }

    async fn revert_to_snapshot(&self, vm: &VmRef, snapshot: &SnapshotNode) -> Result<TaskRef> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::Revert {
            vm: vm.name.clone(),
            snapshot: snapshot.id.clone(),
        });
        Self::find_vm(&state, vm)?;
        let script = state.revert_task.clone();
        Ok(state.start_task(
            script,
            Effect::Revert {
                vm_id: vm.id.clone(),
                snapshot_id: snapshot.id.clone(),
            },
        ))
    }

    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::PowerOn {
            vm: vm.name.clone(),
        });
        Self::find_vm(&state, vm)?;
        let script = state.power_on_task.clone();
        Ok(state.start_task(
            script,
            Effect::PowerOn {
                vm_id: vm.id.clone(),
            },
        ))
    }

    async fn task_state(&self, task: &TaskRef) -> Result<TaskState> {
        let mut state = self.state.lock();
        state.task_polls += 1;

        let pending = state.tasks.get_mut(&task.id).ok_or_else(|| Error::NotFound {
            kind: "task".to_string(),
            name: task.id.clone(),
        })?;
        pending.polls += 1;

        let (task_state, settled) = match &pending.script {
            FakeTask::Succeed => (TaskState::Succeeded, true),
            FakeTask::SucceedAfter(n) if pending.polls > *n => (TaskState::Succeeded, true),
            FakeTask::SucceedAfter(_) | FakeTask::Hang => (TaskState::Running, false),
            FakeTask::Fail(reason) => (TaskState::Failed(reason.clone()), false),
        };

        if settled {
            if let Some(effect) = pending.effect.take() {
                state.apply(effect);
            }
        }
        Ok(task_state)
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().calls.push(FakeCall::Disconnect);
        Ok(())
    }
}
