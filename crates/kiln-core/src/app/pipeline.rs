//! JobRunner - 1 ジョブ分のステージ実行
//!
//! # 実行順序
//! ステージ外側・ファイル内側。あるファイルの後段ステージは、前段の成果物が
//! rename で確定してから始まります（前段の成果物が後段の入力）。
//!
//! # 失敗ポリシー（ステージごと）
//! - Transient: `RetryPolicy` の上限まで指数バックオフで再試行。超えたら `MaxRetriesExceeded`
//! - ResourceExhaustion: fallback モードで 1 回だけ再試行。それも失敗なら `ResourceExhausted`
//! - Fatal: 即座に `StageFatal`
//!
//! どのファイルでも失敗した時点でジョブは failed。既に書いた成果物は消しません。
//!
//! # キャンセル
//! ファイルの境界ごとに `cancel_requested` を確認し、立っていれば cancelled で抜けます。
//!
//! # 台帳への書き込み失敗
//! registry / session への読み書きが一時的に失敗したら `io_retry` の範囲で再試行。
//! それでも駄目なら `StorageUnavailable` で failed への遷移を書けるまで繰り返す
//! （processing のまま取り残さない）。

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::{
    ArtifactRef, FailureClass, FileId, JobError, JobErrorCode, JobId, JobRecord, JobStatus,
    KilnError, Session, StageError,
};
use crate::ports::{ExecutionMode, StageRequest};
use crate::registry::{JobRegistry, RetryPolicy, TransitionOutcome};
use crate::storage::{SessionStore, StorageLayout};
use crate::storage::atomic::{commit_rename, ensure_dir, run_blocking, temp_sibling};

use super::stages::{RegisteredStage, StageRegistry};

pub struct JobRunner {
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionStore>,
    stages: Arc<StageRegistry>,
    /// Budget for transient registry and session I/O failures.
    io_retry: RetryPolicy,
}

/// One (stage, file) unit of work.
struct Step<'a> {
    job: &'a JobRecord,
    stage: &'a str,
    registered: &'a RegisteredStage,
    file_id: FileId,
    input: PathBuf,
    output: PathBuf,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionStore>,
        stages: Arc<StageRegistry>,
        io_retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            sessions,
            stages,
            io_retry,
        }
    }

    /// Drive a claimed job to a terminal state. Returns the status it ended in.
    ///
    /// Errs only when the job can no longer be addressed in the registry.
    pub async fn run(&self, job: JobRecord) -> Result<JobStatus, KilnError> {
        let job_id = job.job_id;
        match self.drive(&job).await {
            Ok(status) => Ok(status),
            Err(e) => self.abandon(job_id, e).await,
        }
    }

    async fn drive(&self, job: &JobRecord) -> Result<JobStatus, KilnError> {
        let job_id = job.job_id;

        let mut resolved = Vec::with_capacity(job.stages.len());
        for stage in &job.stages {
            match self.stages.get(stage) {
                Some(registered) => resolved.push(registered),
                None => {
                    let error = JobError::new(
                        JobErrorCode::StageUnavailable,
                        format!("no executor registered for stage '{stage}'"),
                    );
                    return self.fail(job, error).await;
                }
            }
        }

        let session_id = job.session_id;
        let loaded = self
            .retry_io(job_id, "load session", move || self.sessions.load(session_id))
            .await;
        let session = match loaded {
            Ok(session) => session,
            Err(KilnError::SessionNotFound(_)) => {
                let error = JobError::new(JobErrorCode::InputMissing, "session no longer exists");
                return self.fail(job, error).await;
            }
            Err(e) => return Err(e),
        };

        let layout = self.sessions.layout();
        for (index, (stage, registered)) in job.stages.iter().zip(&resolved).enumerate() {
            for &file_id in &job.file_ids {
                let cancelled = self
                    .retry_io(job_id, "read cancel flag", move || {
                        self.registry.is_cancel_requested(job_id)
                    })
                    .await?;
                if cancelled {
                    tracing::info!(job_id = %job_id, stage = %stage, "stopping at file boundary: cancellation requested");
                    return self.finish(job_id, JobStatus::Cancelled, None).await;
                }

                let input = if index == 0 {
                    match upload_path(&session, layout, file_id) {
                        Some(path) => path,
                        None => {
                            let error = JobError::new(
                                JobErrorCode::InputMissing,
                                "input file is not registered in the session",
                            )
                            .at(stage.as_str(), file_id);
                            return self.fail(job, error).await;
                        }
                    }
                } else {
                    let prev_stage = &job.stages[index - 1];
                    let prev = resolved[index - 1];
                    layout.artifact_path(
                        job.session_id,
                        job_id,
                        prev.executor.artifact_kind(),
                        prev_stage,
                        file_id,
                        prev.executor.extension(),
                    )
                };
                if !is_file(&input).await {
                    let error = JobError::new(
                        JobErrorCode::InputMissing,
                        format!("input {} is missing", layout.relative(&input)),
                    )
                    .at(stage.as_str(), file_id);
                    return self.fail(job, error).await;
                }

                let output = layout.artifact_path(
                    job.session_id,
                    job_id,
                    registered.executor.artifact_kind(),
                    stage,
                    file_id,
                    registered.executor.extension(),
                );
                let step = Step {
                    job,
                    stage,
                    registered,
                    file_id,
                    input,
                    output,
                };
                if let Err(error) = self.run_step(&step).await {
                    return self.fail(job, error).await;
                }

                let artifact = ArtifactRef {
                    stage: stage.clone(),
                    file_id,
                    path: layout.relative(&step.output),
                };
                self.retry_io(job_id, "record progress", move || {
                    self.registry.record_progress(job_id, index, artifact.clone())
                })
                .await?;
            }
        }

        let status = self.finish(job_id, JobStatus::Completed, None).await?;
        tracing::info!(job_id = %job_id, status = %status, "job finished");
        Ok(status)
    }

    async fn fail(&self, job: &JobRecord, error: JobError) -> Result<JobStatus, KilnError> {
        tracing::warn!(
            job_id = %job.job_id,
            code = ?error.code,
            stage = error.stage.as_deref().unwrap_or("-"),
            message = %error.message,
            "job failed"
        );
        self.finish(job.job_id, JobStatus::Failed, Some(error)).await
    }

    /// Terminal transition. A job that already ended keeps its status.
    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<JobError>,
    ) -> Result<JobStatus, KilnError> {
        let outcome = self
            .retry_io(job_id, "record terminal status", move || {
                self.registry.transition(job_id, status, error.clone())
            })
            .await?;
        Ok(match outcome {
            TransitionOutcome::Applied(record) => record.status,
            TransitionOutcome::Ignored(current) => current,
        })
    }

    /// Run `op`, retrying retryable failures within `io_retry`.
    async fn retry_io<T, F, Fut>(
        &self,
        job_id: JobId,
        what: &'static str,
        mut op: F,
    ) -> Result<T, KilnError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, KilnError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.io_retry.allows_retry(attempts) => {
                    tracing::warn!(job_id = %job_id, attempt = attempts, error = %e, "{what} failed; retrying");
                    tokio::time::sleep(self.io_retry.next_delay(attempts)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Registry I/O gave out mid-run. Keep trying to record the job as failed
    /// until that sticks or the job is already terminal.
    async fn abandon(&self, job_id: JobId, cause: KilnError) -> Result<JobStatus, KilnError> {
        tracing::error!(job_id = %job_id, error = %cause, "job bookkeeping failed; abandoning run");
        let error = JobError::new(
            JobErrorCode::StorageUnavailable,
            format!("job bookkeeping failed: {cause}"),
        );
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self
                .registry
                .transition(job_id, JobStatus::Failed, Some(error.clone()))
                .await
            {
                Ok(TransitionOutcome::Applied(_)) => return Ok(JobStatus::Failed),
                Ok(TransitionOutcome::Ignored(status)) => return Ok(status),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(job_id = %job_id, attempt = attempts, error = %e, "could not record failure; retrying");
                    tokio::time::sleep(self.io_retry.next_delay(attempts)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Execute one (stage, file) with the stage's failure policy.
    async fn run_step(&self, step: &Step<'_>) -> Result<(), JobError> {
        let policy = &step.registered.policy;
        let mut mode = ExecutionMode::Normal;
        let mut fallback_used = false;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let tmp = temp_sibling(&step.output);
            let result = self.attempt(step, &tmp, mode).await;
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            discard_partial(&tmp).await;

            tracing::warn!(
                job_id = %step.job.job_id,
                stage = step.stage,
                file_id = %step.file_id,
                attempt = attempts,
                class = ?err.class,
                error = %err.message,
                "stage attempt failed"
            );

            match err.class {
                FailureClass::Fatal => {
                    return Err(JobError::new(JobErrorCode::StageFatal, err.message)
                        .at(step.stage, step.file_id));
                }
                FailureClass::ResourceExhaustion => {
                    if policy.fallback && !fallback_used {
                        fallback_used = true;
                        mode = ExecutionMode::Fallback;
                        continue;
                    }
                    return Err(JobError::new(
                        JobErrorCode::ResourceExhausted,
                        format!("resources exhausted: {}", err.message),
                    )
                    .at(step.stage, step.file_id));
                }
                FailureClass::Transient => {
                    if !policy.retry.allows_retry(attempts) {
                        return Err(JobError::new(
                            JobErrorCode::MaxRetriesExceeded,
                            format!("gave up after {attempts} attempts: {}", err.message),
                        )
                        .at(step.stage, step.file_id));
                    }
                    tokio::time::sleep(policy.retry.next_delay(attempts)).await;
                }
            }
        }
    }

    /// Executor writes `tmp`; a successful attempt renames it over the artifact.
    async fn attempt(
        &self,
        step: &Step<'_>,
        tmp: &Path,
        mode: ExecutionMode,
    ) -> Result<(), StageError> {
        if let Some(dir) = step.output.parent() {
            let target = dir.to_path_buf();
            run_blocking(dir, move || ensure_dir(&target))
                .await
                .map_err(|e| StageError::transient(e.to_string()))?;
        }
        let request = StageRequest {
            job_id: step.job.job_id,
            file_id: step.file_id,
            stage: step.stage,
            input_path: &step.input,
            output_path: tmp,
            config: &step.registered.config,
            mode,
        };
        step.registered.executor.execute(request).await?;
        if !is_file(tmp).await {
            return Err(StageError::fatal("executor reported success without writing output"));
        }
        let (from, to) = (tmp.to_path_buf(), step.output.clone());
        run_blocking(tmp, move || commit_rename(&from, &to))
            .await
            .map_err(|e| StageError::transient(e.to_string()))
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Remove a failed attempt's partial output. A leftover is logged, not fatal.
async fn discard_partial(tmp: &Path) {
    match tokio::fs::remove_file(tmp).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %tmp.display(), error = %e, "failed to remove partial output");
        }
    }
}

fn upload_path(
    session: &Session,
    layout: &StorageLayout,
    file_id: FileId,
) -> Option<PathBuf> {
    let file = session.file(file_id)?;
    Some(layout.upload_path(session.session_id, &file.stored_name))
}
