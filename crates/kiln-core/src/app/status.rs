//! StatusQueryService - 読み取り専用のステータス照会
//!
//! キャッシュを先に見て、ない・矛盾している（例: completed なのに completed_at がない）
//! ときは registry を読み、キャッシュを直してから返します。
//! ジョブやセッションの状態は変更しません。

use std::sync::Arc;

use crate::domain::{JobId, JobStatusView, KilnError, SessionId, SessionStatus, UploadedFile};
use crate::ports::StatusCache;
use crate::registry::JobRegistry;
use crate::storage::SessionStore;

pub struct StatusQueryService {
    cache: Arc<dyn StatusCache>,
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionStore>,
}

impl StatusQueryService {
    pub fn new(
        cache: Arc<dyn StatusCache>,
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            cache,
            registry,
            sessions,
        }
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatusView, KilnError> {
        if let Some(cached) = self.cache.get(job_id) {
            if cached.is_consistent() {
                return Ok(JobStatusView::from(&cached));
            }
            tracing::warn!(job_id = %job_id, status = %cached.status, "inconsistent cache entry, reading registry");
            self.cache.invalidate(job_id);
        }
        let record = self.registry.get(job_id).await?;
        self.cache.put(&record);
        Ok(JobStatusView::from(&record))
    }

    pub async fn get_session_files(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<UploadedFile>, KilnError> {
        self.sessions.list_files(session_id).await
    }

    pub async fn get_session_status(&self, session_id: SessionId) -> Result<SessionStatus, KilnError> {
        self.sessions.status(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobStatus;
    use crate::registry::testing::{fixture, session_with_files};

    #[tokio::test]
    async fn cache_miss_falls_back_and_repairs() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let job = fx
            .registry
            .create(sid, files, vec!["eval".into()])
            .await
            .unwrap();
        fx.cache.invalidate(job.job_id);

        let service = StatusQueryService::new(fx.cache.clone(), fx.registry.clone(), fx.sessions.clone());
        let view = service.get_job_status(job.job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert!(fx.cache.get(job.job_id).is_some());
    }

    #[tokio::test]
    async fn inconsistent_cache_entry_is_not_served() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 1).await;
        let job = fx
            .registry
            .create(sid, files, vec!["eval".into()])
            .await
            .unwrap();

        // claims completed without a completion timestamp
        let mut bogus = job.clone();
        bogus.status = JobStatus::Completed;
        fx.cache.put(&bogus);

        let service = StatusQueryService::new(fx.cache.clone(), fx.registry.clone(), fx.sessions.clone());
        let view = service.get_job_status(job.job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert!(view.results.is_none());
        assert_eq!(fx.cache.get(job.job_id).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let fx = fixture().await;
        let service = StatusQueryService::new(fx.cache.clone(), fx.registry.clone(), fx.sessions.clone());
        let ids = crate::ports::UlidGenerator::new(Arc::new(crate::ports::SystemClock));
        let err = service
            .get_job_status(crate::ports::IdGenerator::job_id(&ids))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn session_files_are_listed() {
        let fx = fixture().await;
        let (sid, files) = session_with_files(&fx.sessions, 2).await;
        let service = StatusQueryService::new(fx.cache.clone(), fx.registry.clone(), fx.sessions.clone());
        let listed: Vec<_> = service
            .get_session_files(sid)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.file_id)
            .collect();
        assert_eq!(listed, files);
    }
}
