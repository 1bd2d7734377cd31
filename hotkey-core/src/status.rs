// Outcome of the most recent update run, readable by the control plane

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::discovery::ServiceAddress;
use crate::fetch::AppliedImage;
use crate::orchestrator::RunState;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Boot,
    Control,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Boot => f.write_str("boot"),
            Trigger::Control => f.write_str("control"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// 0 until the first run starts
    pub run_id: u32,
    pub trigger: Option<Trigger>,
    pub state: RunState,
    pub address: Option<ServiceAddress>,
    pub bytes: Option<u64>,
    pub sha256: Option<String>,
    pub error: Option<String>,
    /// Update requests turned away because a run was active
    pub rejected: u32,
}

/// Shared status cell. Writers are the launcher and the running
/// orchestrator; the control plane only reads.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<RunReport>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RunReport {
        self.lock().clone()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&*self.lock()).unwrap_or_else(|e| {
            log::error!("Failed to serialize run report: {}", e);
            r#"{"error":"status unavailable"}"#.to_string()
        })
    }

    pub(crate) fn begin(&self, run_id: u32, trigger: Trigger) {
        let mut report = self.lock();
        let rejected = report.rejected;
        *report = RunReport {
            run_id,
            trigger: Some(trigger),
            rejected,
            ..Default::default()
        };
    }

    pub(crate) fn set_state(&self, run_id: u32, state: RunState) {
        self.update(run_id, |report| report.state = state);
    }

    pub(crate) fn record_address(&self, run_id: u32, address: ServiceAddress) {
        self.update(run_id, |report| report.address = Some(address));
    }

    pub(crate) fn record_image(&self, run_id: u32, image: &AppliedImage) {
        self.update(run_id, |report| {
            report.bytes = Some(image.bytes);
            report.sha256 = Some(image.sha256.clone());
        });
    }

    pub(crate) fn record_error(&self, run_id: u32, error: &str) {
        self.update(run_id, |report| {
            report.state = RunState::Failed;
            report.error = Some(error.to_string());
        });
    }

    pub(crate) fn record_rejection(&self) {
        self.lock().rejected += 1;
    }

    fn update(&self, run_id: u32, f: impl FnOnce(&mut RunReport)) {
        let mut report = self.lock();
        if report.run_id != run_id {
            log::warn!("Dropping status update from stale run {} (current {})", run_id, report.run_id);
            return;
        }
        f(&mut report);
    }

    fn lock(&self) -> MutexGuard<'_, RunReport> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
