//! Remote task completion
//!
//! Hypervisor tasks run asynchronously on the management endpoint; we poll
//! their state until they settle or the deadline passes.

use std::time::Duration;
use tracing::{debug, trace};

use crate::hypervisor::HypervisorSession;
use crate::types::{TaskKind, TaskRef, TaskState};
use crate::{Error, Result};

/// Terminal result of a remote task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(String),
}

/// Poll `task` until it succeeds or fails, bounded by `timeout`.
///
/// Errors while querying the task are returned as-is; an elapsed deadline
/// becomes [`Error::TaskTimeout`] tagged with `kind`.
pub async fn wait_for_task(
    session: &dyn HypervisorSession,
    task: &TaskRef,
    kind: TaskKind,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<TaskOutcome> {
    let poll = async {
        loop {
            let state = session.task_state(task).await?;
            trace!("{} task {} state: {:?}", kind, task.id, state);

            match state {
                TaskState::Succeeded => return Ok::<_, Error>(TaskOutcome::Succeeded),
                TaskState::Failed(reason) => return Ok(TaskOutcome::Failed(reason)),
                TaskState::Queued | TaskState::Running => {}
            }

            tokio::time::sleep(poll_interval).await;
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(result) => {
            debug!("{} task {} settled: {:?}", kind, task.id, result);
            result
        }
        Err(_) => Err(Error::TaskTimeout {
            task: kind,
            timeout,
        }),
    }
}
