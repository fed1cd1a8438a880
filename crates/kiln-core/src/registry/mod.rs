//! JobRegistry - ジョブの状態機械と claim キュー
//!
//! # 設計
//! - 正本は JobLog（追記専用）。StatusCache は参考値
//! - 変更は必ず「ログ追記 → キャッシュ更新」の順。間でクラッシュしても正本は失われない
//! - ロックはジョブ単位（`Arc<tokio::Mutex<JobRecord>>`）。無関係なジョブは並行に進む
//! - ready キューから pop できるのは 1 呼び出しだけ → claim は原子的
//!
//! # 状態遷移
//! ```text
//! queued ──claim──▶ processing ──▶ completed | failed | cancelled
//!    └────────cancel────────────────────────────▶ cancelled
//! ```
//! 終端状態への遷移要求は no-op（エラーにしない）。後退はしない。
//!
//! # 起動時の復元
//! ログを再生し、ジョブごとに最後のスナップショットを採用します。
//! - queued: ready キューへ戻す
//! - processing: 担当ワーカーは既に存在しないので `WorkerInterrupted` で failed にする

pub mod retry;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex, Notify};

use crate::domain::{
    ArtifactRef, FileId, JobError, JobErrorCode, JobId, JobRecord, JobStatus, KilnError,
    SessionId,
};
use crate::observability::RegistryCounts;
use crate::ports::{Clock, IdGenerator, JobLog, JobLogEntry, StatusCache};
use crate::storage::SessionStore;
use crate::storage::paths::is_valid_stage_name;

pub use self::retry::RetryPolicy;

type Slot = Arc<Mutex<JobRecord>>;

/// Result of `transition`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(JobRecord),

    /// The job was already terminal; nothing changed.
    Ignored(JobStatus),
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Slot>>,
    ready: Mutex<VecDeque<JobId>>,
    notify: Notify,
    seq: AtomicU64,

    log: Arc<dyn JobLog>,
    cache: Arc<dyn StatusCache>,
    sessions: Arc<SessionStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,

    /// Upper bound on how long `get` waits behind a writer.
    read_wait: Duration,
}

impl JobRegistry {
    /// Replay the log and recover in-flight jobs.
    pub async fn open(
        log: Arc<dyn JobLog>,
        cache: Arc<dyn StatusCache>,
        sessions: Arc<SessionStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        read_wait: Duration,
    ) -> Result<Self, KilnError> {
        let entries = log.replay().await?;
        let mut max_seq = 0;
        let mut latest: HashMap<JobId, JobRecord> = HashMap::new();
        for entry in entries {
            max_seq = max_seq.max(entry.seq);
            latest.insert(entry.record.job_id, entry.record);
        }

        let registry = Self {
            jobs: RwLock::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(max_seq + 1),
            log,
            cache,
            sessions,
            ids,
            clock,
            read_wait,
        };

        let mut records: Vec<JobRecord> = latest.into_values().collect();
        records.sort_by_key(|r| r.job_id);

        let mut requeued = 0;
        let mut interrupted = 0;
        for mut record in records {
            match record.status {
                JobStatus::Queued => {
                    registry.ready.lock().await.push_back(record.job_id);
                    requeued += 1;
                }
                JobStatus::Processing => {
                    let error = JobError::new(
                        JobErrorCode::WorkerInterrupted,
                        "worker stopped before the job finished",
                    );
                    record.apply_status(JobStatus::Failed, Some(error), registry.clock.now());
                    registry.persist(&record).await?;
                    interrupted += 1;
                }
                _ => {}
            }
            registry.cache.put(&record);
            registry
                .jobs
                .write()
                .insert(record.job_id, Arc::new(Mutex::new(record)));
        }

        if requeued + interrupted > 0 {
            tracing::info!(requeued, interrupted, "job registry recovered from log");
        }
        Ok(registry)
    }

    /// Log first, then cache.
    async fn persist(&self, record: &JobRecord) -> Result<(), KilnError> {
        let entry = JobLogEntry {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            at: self.clock.now(),
            record: record.clone(),
        };
        self.log.append(&entry).await?;
        self.cache.put(record);
        Ok(())
    }

    fn slot(&self, job_id: JobId) -> Result<Slot, KilnError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(KilnError::JobNotFound(job_id))
    }

    fn slots(&self) -> Vec<Slot> {
        self.jobs.read().values().cloned().collect()
    }

    /// Create a queued job over files of an active session.
    pub async fn create(
        &self,
        session_id: SessionId,
        file_ids: Vec<FileId>,
        stages: Vec<String>,
    ) -> Result<JobRecord, KilnError> {
        if file_ids.is_empty() {
            return Err(KilnError::EmptyInput);
        }
        if stages.is_empty() {
            return Err(KilnError::EmptyStages);
        }
        if let Some(bad) = stages.iter().find(|s| !is_valid_stage_name(s)) {
            return Err(KilnError::InvalidStageName(bad.clone()));
        }
        // stage names key artifact directories, so each may appear once
        if let Some((_, dup)) = stages
            .iter()
            .enumerate()
            .find(|&(i, s)| stages[..i].contains(s))
        {
            return Err(KilnError::DuplicateStage(dup.clone()));
        }
        let mut unique = Vec::with_capacity(file_ids.len());
        for id in file_ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }

        let job_id = self.ids.job_id();
        self.sessions.attach_job(session_id, job_id, &unique).await?;

        let record = JobRecord::new(job_id, session_id, unique, stages, self.clock.now());
        if let Err(e) = self.persist(&record).await {
            // the registry never saw this job, so the session must not list it
            if let Err(detach) = self.sessions.detach_job(session_id, job_id).await {
                tracing::warn!(job_id = %job_id, session_id = %session_id, error = %detach, "could not detach unpersisted job");
            }
            return Err(e);
        }
        self.jobs
            .write()
            .insert(job_id, Arc::new(Mutex::new(record.clone())));
        self.ready.lock().await.push_back(job_id);
        self.notify.notify_one();

        tracing::info!(
            job_id = %job_id,
            session_id = %session_id,
            files = record.file_ids.len(),
            stages = ?record.stages,
            "job queued"
        );
        Ok(record)
    }

    /// Take one queued job and move it to processing.
    ///
    /// Ids are popped under the queue lock, so each id reaches at most one
    /// caller; ids whose job left `queued` meanwhile (cancelled) are skipped.
    pub async fn claim(&self) -> Result<Option<JobRecord>, KilnError> {
        loop {
            let Some(job_id) = self.ready.lock().await.pop_front() else {
                return Ok(None);
            };
            let Ok(slot) = self.slot(job_id) else {
                continue;
            };
            let mut record = slot.lock().await;
            if record.status != JobStatus::Queued {
                continue;
            }

            let before = record.clone();
            record.apply_status(JobStatus::Processing, None, self.clock.now());
            if let Err(e) = self.persist(&record).await {
                *record = before;
                drop(record);
                self.ready.lock().await.push_front(job_id);
                return Err(e);
            }
            tracing::info!(job_id = %job_id, "job claimed");
            return Ok(Some(record.clone()));
        }
    }

    /// Wait until a job is queued or `idle_wait` passes.
    ///
    /// Cancel-safe: nothing is popped here, so callers may race it against shutdown.
    pub async fn wait_for_work(&self, idle_wait: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {},
            _ = tokio::time::sleep(idle_wait) => {},
        }
    }

    /// `claim`, waiting up to `idle_wait` for new work when the queue is empty.
    ///
    /// Not cancel-safe once the wait has ended; workers use `claim` and
    /// `wait_for_work` separately.
    pub async fn next_job(&self, idle_wait: Duration) -> Result<Option<JobRecord>, KilnError> {
        if let Some(job) = self.claim().await? {
            return Ok(Some(job));
        }
        self.wait_for_work(idle_wait).await;
        self.claim().await
    }

    /// Move a job to `next`, durably, before returning.
    pub async fn transition(
        &self,
        job_id: JobId,
        next: JobStatus,
        error: Option<JobError>,
    ) -> Result<TransitionOutcome, KilnError> {
        let slot = self.slot(job_id)?;
        let mut record = slot.lock().await;
        if record.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %record.status, requested = %next, "late transition ignored");
            return Ok(TransitionOutcome::Ignored(record.status));
        }
        if !record.status.can_transition_to(next) {
            return Err(KilnError::InvalidTransition {
                job_id,
                from: record.status,
                to: next,
            });
        }

        let before = record.clone();
        record.apply_status(next, error, self.clock.now());
        if let Err(e) = self.persist(&record).await {
            *record = before;
            return Err(e);
        }
        tracing::info!(job_id = %job_id, from = %before.status, to = %next, "job transitioned");
        Ok(TransitionOutcome::Applied(record.clone()))
    }

    /// Cancel a queued job outright, or flag a processing one for its worker.
    pub async fn request_cancel(&self, job_id: JobId) -> Result<JobRecord, KilnError> {
        let slot = self.slot(job_id)?;
        let mut record = slot.lock().await;
        let before = record.clone();
        match record.status {
            JobStatus::Queued => {
                record.apply_status(JobStatus::Cancelled, None, self.clock.now());
            }
            JobStatus::Processing if !record.cancel_requested => record.cancel_requested = true,
            _ => return Ok(record.clone()),
        }
        if let Err(e) = self.persist(&record).await {
            *record = before;
            return Err(e);
        }
        tracing::info!(job_id = %job_id, status = %record.status, "cancellation requested");
        Ok(record.clone())
    }

    pub async fn is_cancel_requested(&self, job_id: JobId) -> Result<bool, KilnError> {
        let slot = self.slot(job_id)?;
        let record = slot.lock().await;
        Ok(record.cancel_requested)
    }

    /// Count one committed artifact of the stage at `stage_index`.
    /// Ignored unless the job is processing.
    pub async fn record_progress(
        &self,
        job_id: JobId,
        stage_index: usize,
        artifact: ArtifactRef,
    ) -> Result<(), KilnError> {
        let slot = self.slot(job_id)?;
        let mut record = slot.lock().await;
        if record.status != JobStatus::Processing {
            return Ok(());
        }
        let before = record.clone();
        record.record_step(stage_index, artifact);
        if let Err(e) = self.persist(&record).await {
            *record = before;
            return Err(e);
        }
        Ok(())
    }

    /// Snapshot, waiting at most `read_wait` behind an in-flight writer.
    pub async fn get(&self, job_id: JobId) -> Result<JobRecord, KilnError> {
        let slot = self.slot(job_id)?;
        match tokio::time::timeout(self.read_wait, slot.lock()).await {
            Ok(record) => Ok(record.clone()),
            Err(_) => Err(KilnError::Busy(job_id)),
        }
    }

    pub async fn jobs_for_session(&self, session_id: SessionId) -> Vec<JobRecord> {
        let mut jobs = Vec::new();
        for slot in self.slots() {
            let record = slot.lock().await;
            if record.session_id == session_id {
                jobs.push(record.clone());
            }
        }
        jobs.sort_by_key(|r| r.job_id);
        jobs
    }

    /// Authoritative: waits on every job lock rather than reading the cache.
    pub async fn has_active_jobs(&self, session_id: SessionId) -> bool {
        for slot in self.slots() {
            let record = slot.lock().await;
            if record.session_id == session_id && !record.is_terminal() {
                return true;
            }
        }
        false
    }

    pub async fn counts_by_status(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for slot in self.slots() {
            counts.add(slot.lock().await.status);
        }
        counts
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::impls::{InMemoryStatusCache, MemoryJobLog};
    use crate::storage::session_store::testing::store_at;
    use crate::storage::validate::fixtures::png;

    pub struct Fixture {
        pub _dir: tempfile::TempDir,
        pub sessions: Arc<SessionStore>,
        pub log: Arc<MemoryJobLog>,
        pub cache: Arc<InMemoryStatusCache>,
        pub registry: Arc<JobRegistry>,
    }

    pub async fn registry_on(
        sessions: Arc<SessionStore>,
        log: Arc<MemoryJobLog>,
        cache: Arc<InMemoryStatusCache>,
    ) -> JobRegistry {
        let clock: Arc<dyn Clock> = Arc::new(crate::ports::SystemClock);
        JobRegistry::open(
            log,
            cache,
            sessions,
            Arc::new(crate::ports::UlidGenerator::new(clock.clone())),
            clock,
            Duration::from_millis(250),
        )
        .await
        .unwrap()
    }

    pub async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(store_at(dir.path()));
        let log = Arc::new(MemoryJobLog::new());
        let cache = Arc::new(InMemoryStatusCache::new());
        let registry = Arc::new(registry_on(sessions.clone(), log.clone(), cache.clone()).await);
        Fixture {
            _dir: dir,
            sessions,
            log,
            cache,
            registry,
        }
    }

    /// Active session with `n` registered files.
    pub async fn session_with_files(
        sessions: &SessionStore,
        n: usize,
    ) -> (SessionId, Vec<FileId>) {
        let sid = sessions.create_session(None).await.unwrap().session_id;
        let mut files = Vec::new();
        for i in 0..n {
            let f = sessions
                .register_file(sid, &format!("img{i}.png"), &png(64, 64))
                .await
                .unwrap();
            files.push(f.file_id);
        }
        (sid, files)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{fixture, registry_on, session_with_files};
    use super::*;
    use crate::domain::SessionStatus;
    use rstest::rstest;

    fn stages(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_rejects_empty_input() {
        let fx = fixture().await;
        let (sid, _) = session_with_files(&fx.sessions, 0).await;
        let err = fx
            .registry
            .create(sid, vec![], stages(&["eval"]))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::EmptyInput));
    }

    #[tokio::test]
    async fn create_rejects_inactive_session() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        fx.sessions.mark_completed(sid).await.unwrap();

        let err = fx
            .registry
            .create(sid, files, stages(&["eval"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KilnError::InvalidSession {
                status: SessionStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn create_rejects_path_like_stage() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let err = fx
            .registry
            .create(sid, files, stages(&["../etc"]))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::InvalidStageName(_)));
    }

    #[rstest]
    #[case::adjacent(&["eval", "eval"])]
    #[case::separated(&["eval", "render", "eval"])]
    #[tokio::test]
    async fn create_rejects_repeated_stage(#[case] names: &[&str]) {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 2).await;
        let err = fx
            .registry
            .create(sid, files, stages(names))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::DuplicateStage(ref s) if s == "eval"));
        assert!(fx.sessions.load(sid).await.unwrap().job_ids.is_empty());
        assert_eq!(fx.log.len().await, 0);
    }

    struct RejectingLog;

    #[async_trait::async_trait]
    impl JobLog for RejectingLog {
        async fn append(&self, _entry: &JobLogEntry) -> Result<(), KilnError> {
            Err(KilnError::io("jobs.jsonl", std::io::Error::other("disk full")))
        }

        async fn replay(&self) -> Result<Vec<JobLogEntry>, KilnError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_log_append_leaves_session_without_job() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let clock: Arc<dyn Clock> = Arc::new(crate::ports::SystemClock);
        let registry = JobRegistry::open(
            Arc::new(RejectingLog),
            fx.cache.clone(),
            fx.sessions.clone(),
            Arc::new(crate::ports::UlidGenerator::new(clock.clone())),
            clock,
            Duration::from_millis(250),
        )
        .await
        .unwrap();

        let err = registry.create(sid, files, stages(&["eval"])).await.unwrap_err();
        assert!(matches!(err, KilnError::Io { .. }));
        assert!(fx.sessions.load(sid).await.unwrap().job_ids.is_empty());
        assert!(registry.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_logs_before_returning() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 2).await;
        let job = fx
            .registry
            .create(sid, files, stages(&["preprocess", "eval"]))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress.total_steps, 4);
        assert_eq!(fx.log.len().await, 1);
        assert_eq!(fx.sessions.load(sid).await.unwrap().job_ids, vec![job.job_id]);
    }

    #[tokio::test]
    async fn concurrent_claims_have_single_winner() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        fx.registry.create(sid, files, stages(&["eval"])).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = fx.registry.clone();
            handles.push(tokio::spawn(async move { registry.claim().await.unwrap() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn terminal_transition_is_noop() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let job = fx.registry.create(sid, files, stages(&["eval"])).await.unwrap();
        fx.registry.claim().await.unwrap();
        fx.registry
            .transition(job.job_id, JobStatus::Completed, None)
            .await
            .unwrap();
        let done = fx.registry.get(job.job_id).await.unwrap();

        let late = fx
            .registry
            .transition(
                job.job_id,
                JobStatus::Failed,
                Some(JobError::new(JobErrorCode::StageFatal, "late")),
            )
            .await
            .unwrap();
        assert_eq!(late, TransitionOutcome::Ignored(JobStatus::Completed));
        assert_eq!(fx.registry.get(job.job_id).await.unwrap(), done);
    }

    #[rstest]
    #[case::skip_processing(JobStatus::Completed)]
    #[case::back_to_queued(JobStatus::Queued)]
    #[tokio::test]
    async fn illegal_transitions_are_rejected(#[case] next: JobStatus) {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let job = fx.registry.create(sid, files, stages(&["eval"])).await.unwrap();

        let err = fx
            .registry
            .transition(job.job_id, next, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cancel_queued_job_prevents_claim() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let job = fx.registry.create(sid, files, stages(&["eval"])).await.unwrap();

        let cancelled = fx.registry.request_cancel(job.job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(fx.registry.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_processing_job_sets_flag() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let job = fx.registry.create(sid, files, stages(&["eval"])).await.unwrap();
        fx.registry.claim().await.unwrap();

        let flagged = fx.registry.request_cancel(job.job_id).await.unwrap();
        assert_eq!(flagged.status, JobStatus::Processing);
        assert!(fx.registry.is_cancel_requested(job.job_id).await.unwrap());
        assert!(fx.registry.has_active_jobs(sid).await);
    }

    #[tokio::test]
    async fn reopen_recovers_queued_and_interrupts_processing() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let running = fx
            .registry
            .create(sid, files.clone(), stages(&["eval"]))
            .await
            .unwrap();
        fx.registry.claim().await.unwrap();
        let waiting = fx.registry.create(sid, files, stages(&["eval"])).await.unwrap();

        let reopened = registry_on(fx.sessions.clone(), fx.log.clone(), fx.cache.clone()).await;

        let interrupted = reopened.get(running.job_id).await.unwrap();
        assert_eq!(interrupted.status, JobStatus::Failed);
        assert_eq!(
            interrupted.error.unwrap().code,
            JobErrorCode::WorkerInterrupted
        );

        let claimed = reopened.claim().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, waiting.job_id);
    }

    #[tokio::test]
    async fn counts_reflect_statuses() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let a = fx.registry.create(sid, files.clone(), stages(&["eval"])).await.unwrap();
        fx.registry.create(sid, files, stages(&["eval"])).await.unwrap();
        fx.registry.request_cancel(a.job_id).await.unwrap();

        let counts = fx.registry.counts_by_status().await;
        assert_eq!((counts.queued, counts.cancelled), (1, 1));
        assert_eq!(counts.total(), 2);
    }
}
