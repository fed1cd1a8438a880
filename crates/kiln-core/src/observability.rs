use serde::{Deserialize, Serialize};

use crate::domain::JobStatus;

/// Job counts per status, taken from the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RegistryCounts {
    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed + self.cancelled
    }

    pub fn active(&self) -> usize {
        self.queued + self.processing
    }
}
