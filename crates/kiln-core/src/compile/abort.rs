//! Cooperative cancellation for builds running on worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle for cooperative cancellation of a build.
///
/// Clones share one flag. The build worker checks it between pipeline
/// steps and while waiting on toolchain processes.
///
/// ```
/// use kiln_core::compile::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let worker_side = handle.clone();
/// assert!(!worker_side.is_aborted());
///
/// handle.abort();
/// assert!(worker_side.is_aborted());
/// ```
#[derive(Clone, Default, Debug)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Request abort.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// Raises the abort flag when dropped unless disarmed.
///
/// Held by the future that drives a shared build: if every waiter goes
/// away before the build finishes, the worker is told to stop.
pub(crate) struct AbortOnDrop {
    handle: AbortHandle,
    armed: bool,
}

impl AbortOnDrop {
    pub(crate) fn new(handle: AbortHandle) -> Self {
        Self {
            handle,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Build abandoned by all waiters, requesting abort");
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_on_drop_fires() {
        let handle = AbortHandle::new();
        drop(AbortOnDrop::new(handle.clone()));
        assert!(handle.is_aborted());
    }

    #[test]
    fn test_disarmed_guard_does_not_fire() {
        let handle = AbortHandle::new();
        let mut guard = AbortOnDrop::new(handle.clone());
        guard.disarm();
        drop(guard);
        assert!(!handle.is_aborted());
    }
}
