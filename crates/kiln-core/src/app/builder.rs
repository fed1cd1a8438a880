//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_stages()` で必要なステージ名を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば `BuildError::MissingStages` を返す（ジョブが走ってから気づかない）
//!
//! # ワイヤリング
//! 設定から Clock / IdGenerator / LockManager / JobLog / StatusCache を組み立て、
//! SessionStore → JobRegistry（ログ再生）→ JobRunner / LifecycleManager / StatusQueryService の順に作ります。
//! テストでは `with_clock` などで差し替えられます。

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{FileId, JobId, JobReceipt, JobStatusView, KilnError, SessionId};
use crate::impls::{FileJobLog, FileLockManager, InMemoryStatusCache, InProcessLockManager};
use crate::ports::{Clock, IdGenerator, JobLog, LockManager, StageExecutor, StatusCache, SystemClock, UlidGenerator};
use crate::registry::JobRegistry;
use crate::storage::atomic::ensure_dir;
use crate::storage::{ImageValidator, SessionStore, StorageLayout};

use super::config::{KilnConfig, LockBackend};
use super::lifecycle::{LifecycleHandle, LifecycleManager};
use super::pipeline::JobRunner;
use super::stages::{StagePolicy, StageRegistry, StageRegistryError};
use super::status::StatusQueryService;
use super::worker_loop::WorkerPool;

/// How long an idle worker sleeps before re-checking the queue.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(500);

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(config)
///     .register_stage("preprocess", Arc::new(Preprocess))?
///     .register_stage("eval", Arc::new(Eval))?
///     .expect_stages(&["preprocess", "eval"])
///     .build()
///     .await?;
/// ```
pub struct AppBuilder {
    config: KilnConfig,
    stages: StageRegistry,
    expected_stages: Option<Vec<String>>,
    clock: Option<Arc<dyn Clock>>,
    locks: Option<Arc<dyn LockManager>>,
    job_log: Option<Arc<dyn JobLog>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing stages: {0:?}. These stages were expected but not registered.")]
    MissingStages(Vec<String>),

    #[error(transparent)]
    Stage(#[from] StageRegistryError),

    #[error(transparent)]
    Kiln(#[from] KilnError),
}

impl AppBuilder {
    pub fn new(config: KilnConfig) -> Self {
        Self {
            config,
            stages: StageRegistry::new(),
            expected_stages: None,
            clock: None,
            locks: None,
            job_log: None,
        }
    }

    /// Register a stage with the configured default retry policy.
    pub fn register_stage(
        self,
        name: &str,
        executor: Arc<dyn StageExecutor>,
    ) -> Result<Self, BuildError> {
        let policy = StagePolicy::new(self.config.retry.clone());
        self.register_stage_with_policy(name, executor, policy)
    }

    pub fn register_stage_with_policy(
        mut self,
        name: &str,
        executor: Arc<dyn StageExecutor>,
        policy: StagePolicy,
    ) -> Result<Self, BuildError> {
        self.stages.register(name, executor, policy)?;
        Ok(self)
    }

    /// Opaque per-stage configuration handed to the executor.
    pub fn stage_config(mut self, name: &str, config: serde_json::Value) -> Result<Self, BuildError> {
        self.stages.configure(name, config)?;
        Ok(self)
    }

    pub fn expect_stages(mut self, stages: &[&str]) -> Self {
        self.expected_stages = Some(stages.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_job_log(mut self, log: Arc<dyn JobLog>) -> Self {
        self.job_log = Some(log);
        self
    }

    pub async fn build(self) -> Result<App, BuildError> {
        if let Some(expected) = &self.expected_stages {
            let registered = self.stages.registered_names();
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !registered.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingStages(missing));
            }
        }

        let config = self.config;
        let layout = StorageLayout::new(&config.storage_root);
        ensure_dir(&layout.sessions_dir())?;
        ensure_dir(&layout.staging_dir())?;
        ensure_dir(&layout.archive_root())?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let locks: Arc<dyn LockManager> = match self.locks {
            Some(locks) => locks,
            None => match config.lock_backend {
                LockBackend::InProcess => Arc::new(InProcessLockManager::new()),
                LockBackend::File => Arc::new(FileLockManager::new(layout.locks_dir())?),
            },
        };
        let job_log: Arc<dyn JobLog> = match self.job_log {
            Some(log) => log,
            None => Arc::new(FileJobLog::open(layout.job_log_path()).await?),
        };
        let cache: Arc<dyn StatusCache> = Arc::new(InMemoryStatusCache::new());

        let sessions = Arc::new(SessionStore::new(
            layout,
            locks,
            clock.clone(),
            ids.clone(),
            ImageValidator::new(config.limits.clone()),
            config.lock_timeout(),
        ));
        let registry = Arc::new(
            JobRegistry::open(
                job_log,
                cache.clone(),
                sessions.clone(),
                ids,
                clock.clone(),
                config.registry_read_wait(),
            )
            .await?,
        );
        let stages = Arc::new(self.stages);
        let runner = Arc::new(JobRunner::new(
            registry.clone(),
            sessions.clone(),
            stages.clone(),
            config.retry.clone(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            sessions.clone(),
            registry.clone(),
            clock,
            config.lifecycle.clone(),
        ));
        let status = StatusQueryService::new(cache, registry.clone(), sessions.clone());

        tracing::info!(
            root = %config.storage_root.display(),
            stages = ?stages.registered_names(),
            workers = config.workers,
            "kiln app built"
        );

        Ok(App {
            config,
            sessions,
            registry,
            runner,
            lifecycle,
            status,
            stages,
        })
    }
}

/// App は組み立て済みのコア
pub struct App {
    config: KilnConfig,
    sessions: Arc<SessionStore>,
    registry: Arc<JobRegistry>,
    runner: Arc<JobRunner>,
    lifecycle: Arc<LifecycleManager>,
    status: StatusQueryService,
    stages: Arc<StageRegistry>,
}

impl App {
    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn status(&self) -> &StatusQueryService {
        &self.status
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Queue a job. Stages must be registered; the session must be active.
    pub async fn submit(
        &self,
        session_id: SessionId,
        file_ids: Vec<FileId>,
        stages: Vec<String>,
    ) -> Result<JobReceipt, KilnError> {
        if let Some(unknown) = stages.iter().find(|s| self.stages.get(s).is_none()) {
            return Err(KilnError::InvalidStageName(unknown.clone()));
        }
        let record = self.registry.create(session_id, file_ids, stages).await?;
        Ok(JobReceipt {
            job_id: record.job_id,
            status: record.status,
        })
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatusView, KilnError> {
        let record = self.registry.request_cancel(job_id).await?;
        Ok(JobStatusView::from(&record))
    }

    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::spawn(
            self.config.workers.max(1),
            self.registry.clone(),
            self.runner.clone(),
            WORKER_IDLE_WAIT,
        )
    }

    pub fn start_lifecycle(&self) -> LifecycleHandle {
        self.lifecycle.clone().spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageError;
    use crate::impls::MemoryJobLog;
    use crate::ports::StageRequest;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl StageExecutor for Noop {
        async fn execute(&self, _request: StageRequest<'_>) -> Result<(), StageError> {
            Ok(())
        }
    }

    fn config(dir: &tempfile::TempDir) -> KilnConfig {
        KilnConfig {
            storage_root: dir.path().to_path_buf(),
            ..KilnConfig::default()
        }
    }

    #[tokio::test]
    async fn build_success() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppBuilder::new(config(&dir))
            .register_stage("eval", Arc::new(Noop))
            .unwrap()
            .expect_stages(&["eval"])
            .build()
            .await;
        assert!(app.is_ok());
        assert!(dir.path().join("registry/jobs.jsonl").exists());
    }

    #[tokio::test]
    async fn build_missing_stages() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppBuilder::new(config(&dir))
            .register_stage("eval", Arc::new(Noop))
            .unwrap()
            .expect_stages(&["eval", "nms"])
            .build()
            .await;
        assert!(matches!(
            app,
            Err(BuildError::MissingStages(missing)) if missing == vec!["nms".to_string()]
        ));
    }

    #[tokio::test]
    async fn duplicate_stage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppBuilder::new(config(&dir))
            .register_stage("eval", Arc::new(Noop))
            .unwrap()
            .register_stage("eval", Arc::new(Noop));
        assert!(matches!(
            result,
            Err(BuildError::Stage(StageRegistryError::AlreadyRegistered(_)))
        ));
    }

    #[tokio::test]
    async fn submit_rejects_unregistered_stage() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppBuilder::new(config(&dir))
            .with_job_log(Arc::new(MemoryJobLog::new()))
            .build()
            .await
            .unwrap();
        let session = app.sessions().create_session(None).await.unwrap();
        let err = app
            .submit(session.session_id, vec![], vec!["eval".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::InvalidStageName(_)));
    }
}
