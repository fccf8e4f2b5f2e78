//! Skip-while-running guard for maintenance jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tracks whether a job is executing.
///
/// A cron tick that finds the previous run still active is skipped rather
/// than stacked.
#[derive(Debug, Clone, Default)]
pub struct OverlapGuard {
    is_running: Arc<AtomicBool>,
}

impl OverlapGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while another run holds the guard.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                flag: self.is_running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// Releases the guard on drop, including when the job panics.
#[derive(Debug)]
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
