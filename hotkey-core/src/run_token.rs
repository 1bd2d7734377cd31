// Single-slot run token: at most one firmware install in flight

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared "update in progress" flag. Acquisition never waits; a second
/// caller is turned away rather than queued.
#[derive(Debug, Clone, Default)]
pub struct RunToken {
    busy: Arc<AtomicBool>,
}

impl RunToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { busy: Arc::clone(&self.busy) })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the lifetime of one orchestrator run; releases on drop.
#[derive(Debug)]
pub struct RunGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
