//! Per-VM exclusion for revert and power-on work

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per VM name. Busy VMs are reported, never queued on.
#[derive(Clone, Default)]
pub struct VmLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl VmLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `vm_name`, or `None` if work on it is in flight.
    ///
    /// The guard releases the VM when dropped.
    pub fn try_acquire(&self, vm_name: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self.inner.entry(vm_name.to_string()).or_default().clone();
        lock.try_lock_owned().ok()
    }

    pub fn is_busy(&self, vm_name: &str) -> bool {
        self.inner
            .get(vm_name)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}
