//! Job record and status views.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::JobError;
use super::ids::{FileId, JobId, SessionId};
use super::state::JobStatus;

/// Progress counters, updated after every committed artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total_inputs: usize,

    /// Files that have finished every requested stage.
    pub completed_inputs: usize,

    /// files × stages
    pub total_steps: usize,
    pub completed_steps: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
}

impl Progress {
    pub fn new(total_inputs: usize, stages: usize) -> Self {
        Self {
            total_inputs,
            completed_inputs: 0,
            total_steps: total_inputs * stages,
            completed_steps: 0,
            current_stage: None,
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.completed_steps as f64 / self.total_steps as f64) * 100.0
    }
}

/// Where a committed stage artifact lives, relative to the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub stage: String,
    pub file_id: FileId,
    pub path: String,
}

/// Job record: the authoritative state of one pipeline run.
///
/// State transitions go through the methods below; the registry is the only
/// caller and it persists the record after each one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub file_ids: Vec<FileId>,
    pub stages: Vec<String>,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    pub error: Option<JobError>,
    pub progress: Progress,

    #[serde(default)]
    pub cancel_requested: bool,

    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl JobRecord {
    pub fn new(
        job_id: JobId,
        session_id: SessionId,
        file_ids: Vec<FileId>,
        stages: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let progress = Progress::new(file_ids.len(), stages.len());
        Self {
            job_id,
            session_id,
            file_ids,
            stages,
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            error: None,
            progress,
            cancel_requested: false,
            artifacts: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change and stamp the matching timestamp.
    ///
    /// Callers check `can_transition_to` first; this only records.
    pub fn apply_status(&mut self, next: JobStatus, error: Option<JobError>, now: DateTime<Utc>) {
        self.status = next;
        match next {
            JobStatus::Queued => {}
            JobStatus::Processing => self.started_at = Some(now),
            JobStatus::Completed => {
                self.completed_at = Some(now);
                self.progress.current_stage = None;
            }
            JobStatus::Failed => {
                self.failed_at = Some(now);
                self.error = error;
            }
            JobStatus::Cancelled => self.cancelled_at = Some(now),
        }
    }

    /// Count one committed step of the stage at `stage_index`.
    ///
    /// A file only counts as completed once the final stage commits.
    pub fn record_step(&mut self, stage_index: usize, artifact: ArtifactRef) {
        self.progress.completed_steps += 1;
        self.progress.current_stage = self.stages.get(stage_index).cloned();
        if stage_index + 1 == self.stages.len() {
            self.progress.completed_inputs += 1;
        }
        self.artifacts.push(artifact);
    }

    /// Does the record carry the timestamps its status implies?
    ///
    /// A cached snapshot that fails this check is not trusted.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            JobStatus::Queued => self.started_at.is_none(),
            JobStatus::Processing => self.started_at.is_some(),
            JobStatus::Completed => self.completed_at.is_some(),
            JobStatus::Failed => self.failed_at.is_some() && self.error.is_some(),
            JobStatus::Cancelled => self.cancelled_at.is_some(),
        }
    }
}

/// Progress as reported to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    pub total_inputs: usize,
    pub completed_inputs: usize,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
}

impl From<&Progress> for ProgressView {
    fn from(p: &Progress) -> Self {
        Self {
            total_inputs: p.total_inputs,
            completed_inputs: p.completed_inputs,
            total_steps: p.total_steps,
            completed_steps: p.completed_steps,
            percentage: p.percentage(),
            current_stage: p.current_stage.clone(),
        }
    }
}

/// Job status for API responses.
///
/// `results` is only present once the job completed; `error` only once it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub status: JobStatus,
    pub stages: Vec<String>,
    pub progress: ProgressView,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(job: &JobRecord) -> Self {
        let results = (job.status == JobStatus::Completed).then(|| {
            let mut by_stage: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for artifact in &job.artifacts {
                by_stage
                    .entry(artifact.stage.clone())
                    .or_default()
                    .push(artifact.path.clone());
            }
            by_stage
        });
        let error = if job.status == JobStatus::Failed {
            job.error.clone()
        } else {
            None
        };
        Self {
            job_id: job.job_id,
            session_id: job.session_id,
            status: job.status,
            stages: job.stages.clone(),
            progress: ProgressView::from(&job.progress),
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            failed_at: job.failed_at,
            cancelled_at: job.cancelled_at,
            results,
            error,
        }
    }
}

/// Immediate answer to a submission: the job exists and is queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::JobErrorCode;
    use ulid::Ulid;

    fn job(files: usize, stages: &[&str]) -> JobRecord {
        JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            SessionId::from_ulid(Ulid::new()),
            (0..files).map(|_| FileId::from_ulid(Ulid::new())).collect(),
            stages.iter().map(|s| s.to_string()).collect(),
            Utc::now(),
        )
    }

    #[test]
    fn new_job_starts_queued_with_progress_totals() {
        let job = job(3, &["preprocess", "symbolic"]);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress.total_inputs, 3);
        assert_eq!(job.progress.total_steps, 6);
        assert!(job.is_consistent());
    }

    #[test]
    fn inputs_complete_only_after_last_stage() {
        let mut job = job(1, &["preprocess", "symbolic"]);
        let file_id = job.file_ids[0];
        let artifact = |stage: &str| ArtifactRef {
            stage: stage.to_string(),
            file_id,
            path: format!("x/{stage}"),
        };

        job.record_step(0, artifact("preprocess"));
        assert_eq!(job.progress.completed_inputs, 0);
        assert_eq!(job.progress.percentage(), 50.0);

        job.record_step(1, artifact("symbolic"));
        assert_eq!(job.progress.completed_inputs, 1);
        assert_eq!(job.progress.current_stage.as_deref(), Some("symbolic"));
    }

    #[test]
    fn completion_follows_stage_position_not_name() {
        let mut job = job(1, &["eval", "render", "export"]);
        let file_id = job.file_ids[0];
        for (index, stage) in ["eval", "render", "export"].into_iter().enumerate() {
            assert_eq!(job.progress.completed_inputs, 0);
            job.record_step(
                index,
                ArtifactRef {
                    stage: stage.to_string(),
                    file_id,
                    path: format!("x/{stage}"),
                },
            );
        }
        assert_eq!(job.progress.completed_inputs, 1);
        assert_eq!(job.progress.completed_steps, 3);
    }

    #[test]
    fn completed_without_timestamp_is_inconsistent() {
        let mut job = job(1, &["eval"]);
        job.status = JobStatus::Completed;
        assert!(!job.is_consistent());
    }

    #[test]
    fn view_exposes_error_only_when_failed() {
        let mut job = job(1, &["eval"]);
        let now = Utc::now();
        job.apply_status(JobStatus::Processing, None, now);
        job.apply_status(
            JobStatus::Failed,
            Some(JobError::new(JobErrorCode::StageFatal, "model missing")),
            now,
        );

        let view = JobStatusView::from(&job);
        assert!(view.results.is_none());
        assert_eq!(view.error.unwrap().code, JobErrorCode::StageFatal);
    }

    #[test]
    fn view_groups_results_by_stage() {
        let mut job = job(2, &["eval"]);
        let now = Utc::now();
        job.apply_status(JobStatus::Processing, None, now);
        for file_id in job.file_ids.clone() {
            job.record_step(
                0,
                ArtifactRef {
                    stage: "eval".into(),
                    file_id,
                    path: format!("p/{file_id}.json"),
                },
            );
        }
        job.apply_status(JobStatus::Completed, None, now);

        let view = JobStatusView::from(&job);
        assert_eq!(view.results.unwrap()["eval"].len(), 2);
        assert_eq!(view.progress.percentage, 100.0);
    }
}
