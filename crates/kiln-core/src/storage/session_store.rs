//! SessionStore - セッションのメタデータとアップロード
//!
//! # 設計
//! - `metadata.json` の更新はすべて `update` を通る:
//!   セッション単位のロック → 読む → 変更 → 一時ファイルへ書く → rename → ロック解放
//! - ロックはタイムアウト付き。超えたら `LockTimeout` を返す（黙って捨てない）
//! - アップロードは staging で検証してから公開する。検証に落ちたファイルはセッションに触れない
//! - ファイル I/O は `run_blocking` で blocking プールに逃がす（ワーカースレッドを止めない）
//!
//! # アップロードの流れ
//! 1. ファイル名チェック
//! 2. `staging/` に書く
//! 3. 検証（サイズ・形式・寸法）。失敗なら staging を消して終了
//! 4. `uploads/raw/` へ no-clobber で公開
//! 5. 検証レポートを `uploads/validated/<fileID>.json` に書く
//! 6. ロックを取ってファイル一覧に追記

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::domain::{FileId, JobId, KilnError, Session, SessionId, SessionStatus, UploadedFile};
use crate::ports::{Clock, IdGenerator, LockGuard, LockManager, session_lock_key};

use super::atomic::{
    discard, ensure_dir, publish_no_clobber, read_json, run_blocking, write_json_atomic,
};
use super::paths::{ARCHIVE_EXTENSION, StorageLayout, canonical_stored_name};
use super::validate::{AcceptedUpload, ImageValidator};

pub struct SessionStore {
    layout: StorageLayout,
    locks: Arc<dyn LockManager>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    validator: ImageValidator,
    lock_timeout: Duration,
}

/// On-disk result of an accepted upload, before it is listed in metadata.
struct PublishedUpload {
    stored_name: String,
    path: PathBuf,
    report_path: PathBuf,
    accepted: AcceptedUpload,
}

impl SessionStore {
    pub fn new(
        layout: StorageLayout,
        locks: Arc<dyn LockManager>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        validator: ImageValidator,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            layout,
            locks,
            clock,
            ids,
            validator,
            lock_timeout,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Exclusive per-session lock, bounded by the configured timeout.
    pub async fn lock(&self, session_id: SessionId) -> Result<LockGuard, KilnError> {
        self.locks
            .acquire(&session_lock_key(&session_id), self.lock_timeout)
            .await
    }

    pub async fn create_session(&self, owner_id: Option<String>) -> Result<Session, KilnError> {
        let session_id = self.ids.session_id();
        let session = Session::new(session_id, owner_id, self.clock.now());

        let layout = self.layout.clone();
        let record = session.clone();
        run_blocking(&self.layout.session_dir(session_id), move || {
            ensure_dir(&layout.uploads_raw_dir(session_id))?;
            ensure_dir(&layout.uploads_validated_dir(session_id))?;
            write_json_atomic(&layout.metadata_path(session_id), &record)
        })
        .await?;

        tracing::info!(session_id = %session_id, "session created");
        Ok(session)
    }

    /// Current metadata. Lock-free: metadata is only ever replaced by rename.
    pub async fn load(&self, session_id: SessionId) -> Result<Session, KilnError> {
        let path = self.layout.metadata_path(session_id);
        let target = path.clone();
        run_blocking(&path, move || read_json::<Session>(&target))
            .await?
            .ok_or(KilnError::SessionNotFound(session_id))
    }

    async fn write_metadata(&self, session: &Session) -> Result<(), KilnError> {
        let path = self.layout.metadata_path(session.session_id);
        let (target, snapshot) = (path.clone(), session.clone());
        run_blocking(&path, move || write_json_atomic(&target, &snapshot)).await
    }

    /// Locked read-modify-write. `apply` returning an error leaves metadata untouched.
    pub async fn update<R>(
        &self,
        session_id: SessionId,
        apply: impl FnOnce(&mut Session) -> Result<R, KilnError>,
    ) -> Result<R, KilnError> {
        let guard = self.lock(session_id).await?;
        let mut session = self.load(session_id).await?;
        let out = apply(&mut session)?;
        session.updated_at = self.clock.now();
        self.write_metadata(&session).await?;
        guard.release();
        Ok(out)
    }

    /// Write metadata while the caller already holds the session lock.
    ///
    /// For callers that must await other components between read and write.
    pub async fn store_locked(
        &self,
        guard: &LockGuard,
        session: &mut Session,
    ) -> Result<(), KilnError> {
        debug_assert_eq!(guard.key(), session_lock_key(&session.session_id));
        session.updated_at = self.clock.now();
        self.write_metadata(session).await
    }

    pub async fn register_file(
        &self,
        session_id: SessionId,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<UploadedFile, KilnError> {
        let session = self.load(session_id).await?;
        if !session.status.accepts_work() {
            return Err(KilnError::InvalidSession {
                session_id,
                status: session.status,
            });
        }
        self.validator.check_name(original_name)?;

        let now = self.clock.now();
        let file_id = self.ids.file_id();
        let (validator, layout) = (self.validator.clone(), self.layout.clone());
        let (name, data) = (original_name.to_string(), bytes.to_vec());
        let published = run_blocking(&self.layout.staging_dir(), move || {
            stage_and_publish(&validator, &layout, session_id, file_id, &name, &data, now)
        })
        .await?;

        let file = UploadedFile {
            file_id,
            original_name: original_name.to_string(),
            stored_name: published.stored_name.clone(),
            size_bytes: published.accepted.report.size_bytes,
            dimensions: published.accepted.report.dimensions,
            validation: published.accepted.report.clone(),
            uploaded_at: now,
        };

        let record = file.clone();
        let appended = self
            .update(session_id, move |session| {
                if !session.status.accepts_work() {
                    return Err(KilnError::InvalidSession {
                        session_id,
                        status: session.status,
                    });
                }
                session.files.push(record);
                Ok(())
            })
            .await;
        if let Err(e) = appended {
            let dir = self.layout.uploads_raw_dir(session_id);
            let (path, report_path) = (published.path, published.report_path);
            run_blocking(&dir, move || {
                discard(&path);
                discard(&report_path);
                Ok(())
            })
            .await?;
            return Err(e);
        }

        tracing::info!(
            session_id = %session_id,
            file_id = %file.file_id,
            stored_name = %file.stored_name,
            size_bytes = file.size_bytes,
            "upload registered"
        );
        Ok(file)
    }

    pub async fn list_files(&self, session_id: SessionId) -> Result<Vec<UploadedFile>, KilnError> {
        Ok(self.load(session_id).await?.files)
    }

    /// Absolute path of an uploaded file's bytes.
    pub async fn upload_path(
        &self,
        session_id: SessionId,
        file_id: FileId,
    ) -> Result<PathBuf, KilnError> {
        let session = self.load(session_id).await?;
        let file = session.file(file_id).ok_or(KilnError::UnknownFile {
            session_id,
            file_id,
        })?;
        Ok(self.layout.upload_path(session_id, &file.stored_name))
    }

    pub async fn set_attribute(
        &self,
        session_id: SessionId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), KilnError> {
        let key = key.into();
        self.update(session_id, move |session| {
            session.attributes.insert(key, value);
            Ok(())
        })
        .await
    }

    /// Record a new job against an active session whose files all exist.
    pub async fn attach_job(
        &self,
        session_id: SessionId,
        job_id: JobId,
        file_ids: &[FileId],
    ) -> Result<(), KilnError> {
        self.update(session_id, |session| {
            if !session.status.accepts_work() {
                return Err(KilnError::InvalidSession {
                    session_id,
                    status: session.status,
                });
            }
            if let Some(&missing) = file_ids.iter().find(|id| session.file(**id).is_none()) {
                return Err(KilnError::UnknownFile {
                    session_id,
                    file_id: missing,
                });
            }
            session.job_ids.push(job_id);
            Ok(())
        })
        .await
    }

    /// Undo `attach_job` for a job that was never created.
    pub async fn detach_job(&self, session_id: SessionId, job_id: JobId) -> Result<(), KilnError> {
        self.update(session_id, |session| {
            session.job_ids.retain(|id| *id != job_id);
            Ok(())
        })
        .await
    }

    /// Active → Completed. Idempotent once completed.
    pub async fn mark_completed(&self, session_id: SessionId) -> Result<(), KilnError> {
        let now = self.clock.now();
        self.update(session_id, |session| match session.status {
            SessionStatus::Active => {
                session.status = SessionStatus::Completed;
                session.completed_at = Some(now);
                Ok(())
            }
            SessionStatus::Completed => Ok(()),
            status => Err(KilnError::InvalidSession { session_id, status }),
        })
        .await?;
        tracing::info!(session_id = %session_id, "session completed");
        Ok(())
    }

    /// Active → Expired. Returns false when the session had already left `active`.
    pub async fn mark_expired(&self, session_id: SessionId) -> Result<bool, KilnError> {
        self.update(session_id, |session| {
            if session.status != SessionStatus::Active {
                return Ok(false);
            }
            session.status = SessionStatus::Expired;
            Ok(true)
        })
        .await
    }

    /// Ids of sessions with a live directory, oldest first.
    pub async fn list_session_ids(&self) -> Result<Vec<SessionId>, KilnError> {
        let dir = self.layout.sessions_dir();
        let target = dir.clone();
        run_blocking(&dir, move || session_dirs(&target)).await
    }

    /// Live status, or `Archived` when only the bundle remains.
    pub async fn status(&self, session_id: SessionId) -> Result<SessionStatus, KilnError> {
        match self.load(session_id).await {
            Ok(session) => Ok(session.status),
            Err(KilnError::SessionNotFound(_)) => {
                let layout = self.layout.clone();
                let bundle = run_blocking(&self.layout.archive_root(), move || {
                    find_archive_in(&layout, session_id)
                })
                .await?;
                match bundle {
                    Some(_) => Ok(SessionStatus::Archived),
                    None => Err(KilnError::SessionNotFound(session_id)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Locate `archive/<yyyy>/<mm>/<sid>.tar.gz` for any bucket. Blocking.
    pub fn find_archive(&self, session_id: SessionId) -> Result<Option<PathBuf>, KilnError> {
        find_archive_in(&self.layout, session_id)
    }
}

/// Stage, validate and publish one upload, then write its validation report.
///
/// The staging file is removed on every path; a published file whose report
/// cannot be written is removed again.
fn stage_and_publish(
    validator: &ImageValidator,
    layout: &StorageLayout,
    session_id: SessionId,
    file_id: FileId,
    original_name: &str,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> Result<PublishedUpload, KilnError> {
    let staging = layout.staging_dir();
    ensure_dir(&staging)?;
    let mut staged = NamedTempFile::new_in(&staging).map_err(|e| KilnError::io(&staging, e))?;
    staged
        .write_all(bytes)
        .map_err(|e| KilnError::io(staged.path(), e))?;

    let accepted = match validator.validate(original_name, bytes, now) {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::info!(session_id = %session_id, original_name, code = e.code.as_str(), "upload rejected");
            return Err(e.into());
        }
    };

    let raw_dir = layout.uploads_raw_dir(session_id);
    let (stored_name, path) = publish_no_clobber(staged.path(), &raw_dir, || {
        let suffix = format!("{:08x}", rand::random::<u32>());
        canonical_stored_name(original_name, &accepted.extension, now, &suffix)
    })?;
    drop(staged);

    let report_path = layout.validation_report_path(session_id, file_id);
    if let Err(e) = write_json_atomic(&report_path, &accepted.report) {
        discard(&path);
        return Err(e);
    }
    Ok(PublishedUpload {
        stored_name,
        path,
        report_path,
        accepted,
    })
}

fn session_dirs(dir: &Path) -> Result<Vec<SessionId>, KilnError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(KilnError::io(dir, e)),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| KilnError::io(dir, e))?;
        let name = entry.file_name();
        match name.to_string_lossy().parse::<SessionId>() {
            Ok(id) => ids.push(id),
            Err(_) => tracing::debug!(name = ?name, "skipping non-session entry"),
        }
    }
    ids.sort();
    Ok(ids)
}

fn find_archive_in(layout: &StorageLayout, session_id: SessionId) -> Result<Option<PathBuf>, KilnError> {
    let root = layout.archive_root();
    let file_name = format!("{session_id}.{ARCHIVE_EXTENSION}");
    let years = match std::fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(KilnError::io(&root, e)),
    };
    for year in years {
        let year = year.map_err(|e| KilnError::io(&root, e))?.path();
        let Ok(months) = std::fs::read_dir(&year) else {
            continue;
        };
        for month in months.flatten() {
            let candidate = month.path().join(&file_name);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::impls::InProcessLockManager;
    use crate::ports::{SystemClock, UlidGenerator};

    pub fn store_at(root: &std::path::Path) -> SessionStore {
        store_with_timeout(root, Duration::from_secs(5))
    }

    pub fn store_with_timeout(root: &std::path::Path, lock_timeout: Duration) -> SessionStore {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        SessionStore::new(
            StorageLayout::new(root),
            Arc::new(InProcessLockManager::new()),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock)),
            ImageValidator::default(),
            lock_timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{store_at, store_with_timeout};
    use super::*;
    use crate::domain::ValidationCode;
    use crate::storage::validate::fixtures::png;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        let session = store.create_session(Some("owner-1".into())).await.unwrap();
        let loaded = store.load(session.session_id).await.unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.status, SessionStatus::Active);
        assert!(store.layout().uploads_raw_dir(session.session_id).is_dir());
    }

    #[tokio::test]
    async fn register_file_publishes_bytes_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let session = store.create_session(None).await.unwrap();
        let sid = session.session_id;

        let bytes = png(80, 80);
        let file = store.register_file(sid, "../cat.png", &bytes).await.unwrap();

        assert!(file.stored_name.starts_with("cat_"));
        assert!(file.stored_name.ends_with(".png"));
        let stored = std::fs::read(store.upload_path(sid, file.file_id).await.unwrap()).unwrap();
        assert_eq!(stored, bytes);
        assert!(store.layout().validation_report_path(sid, file.file_id).is_file());
        assert_eq!(store.list_files(sid).await.unwrap(), vec![file]);

        // staging is cleaned up after publish
        let staged = std::fs::read_dir(store.layout().staging_dir()).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn rejected_upload_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let sid = store.create_session(None).await.unwrap().session_id;

        let err = store
            .register_file(sid, "fake.png", &vec![0u8; 4096])
            .await
            .unwrap_err();
        match err {
            KilnError::Validation(v) => assert_eq!(v.code, ValidationCode::CorruptedFile),
            other => panic!("unexpected {other:?}"),
        }

        let raw = std::fs::read_dir(store.layout().uploads_raw_dir(sid)).unwrap().count();
        let staged = std::fs::read_dir(store.layout().staging_dir()).unwrap().count();
        assert_eq!((raw, staged), (0, 0));
        assert!(store.list_files(sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uploads_rejected_once_session_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let sid = store.create_session(None).await.unwrap().session_id;
        store.mark_completed(sid).await.unwrap();

        let err = store.register_file(sid, "a.png", &png(64, 64)).await.unwrap_err();
        assert!(matches!(err, KilnError::InvalidSession { .. }));
    }

    #[tokio::test]
    async fn attach_job_checks_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let sid = store.create_session(None).await.unwrap().session_id;
        let ids = crate::ports::UlidGenerator::new(Arc::new(crate::ports::SystemClock));

        let err = store
            .attach_job(sid, ids.job_id(), &[ids.file_id()])
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::UnknownFile { .. }));
        assert!(store.load(sid).await.unwrap().job_ids.is_empty());
    }

    #[tokio::test]
    async fn concurrent_attribute_writers_keep_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_at(dir.path()));
        let sid = store.create_session(None).await.unwrap().session_id;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set_attribute(sid, format!("k{i}"), json!(i)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let session = store.load(sid).await.unwrap();
        assert_eq!(session.attributes.len(), 16);
        assert_eq!(session.attributes["k7"], json!(7));
    }

    #[tokio::test]
    async fn update_times_out_while_session_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_timeout(dir.path(), Duration::from_millis(50));
        let sid = store.create_session(None).await.unwrap().session_id;
        let before = store.load(sid).await.unwrap();

        let held = store.lock(sid).await.unwrap();
        let err = store
            .set_attribute(sid, "label", json!("blocked"))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::LockTimeout { .. }));
        assert_eq!(store.load(sid).await.unwrap(), before);

        held.release();
        store.set_attribute(sid, "label", json!("ok")).await.unwrap();
        assert_eq!(store.load(sid).await.unwrap().attributes["label"], json!("ok"));
    }

    #[tokio::test]
    async fn detach_job_removes_only_that_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let sid = store.create_session(None).await.unwrap().session_id;
        let ids = crate::ports::UlidGenerator::new(Arc::new(crate::ports::SystemClock));
        let (kept, dropped) = (ids.job_id(), ids.job_id());
        store.attach_job(sid, kept, &[]).await.unwrap();
        store.attach_job(sid, dropped, &[]).await.unwrap();

        store.detach_job(sid, dropped).await.unwrap();
        assert_eq!(store.load(sid).await.unwrap().job_ids, vec![kept]);
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let sid = crate::ports::UlidGenerator::new(Arc::new(crate::ports::SystemClock)).session_id();
        assert!(matches!(
            store.status(sid).await,
            Err(KilnError::SessionNotFound(_))
        ));
    }
}
