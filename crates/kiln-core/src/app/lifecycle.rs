//! LifecycleManager - 保持ポリシー
//!
//! # ポリシー（それぞれ冪等、ワーカーと並行に実行してよい）
//! - **reap_staging**: TTL を過ぎた staging ファイルを削除（セッション状態に関係なく）
//! - **expire_idle**: 一定期間更新のない active セッションを expired に
//! - **archive_sessions**: completed / expired かつ非終端ジョブのないセッションを
//!   `.tar.gz` に固め、検証してからディレクトリを削除
//! - **purge_archives**: 保持期間を過ぎたアーカイブを削除し、空の年/月ディレクトリを片付ける
//!
//! # アーカイブの順序
//! 1. スキャン時点で条件を確認
//! 2. アーカイブを作成して読み戻し検証
//! 3. セッションロックを取り、状態・更新時刻・ジョブを再確認
//! 4. 再確認に通ったときだけ削除。通らなければ作ったアーカイブを消して見送る
//!
//! 削除の直前に再確認するので、スキャン後に動き出したジョブのセッションは消えません。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{KilnError, SessionId, SessionStatus};
use crate::ports::Clock;
use crate::registry::JobRegistry;
use crate::storage::SessionStore;
use crate::storage::archive::archive_and_verify;
use crate::storage::atomic::{remove_if_exists, run_blocking};
use crate::storage::paths::ARCHIVE_EXTENSION;

use super::config::LifecycleConfig;

/// What one pass touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleReport {
    pub staging_removed: Vec<PathBuf>,
    pub sessions_expired: Vec<SessionId>,
    pub sessions_archived: Vec<SessionId>,

    /// Archivable, but a job was still running.
    pub archive_deferred: Vec<SessionId>,
    pub archives_purged: Vec<PathBuf>,
    pub errors: Vec<String>,
}

pub struct LifecycleManager {
    sessions: Arc<SessionStore>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

/// Outcome of archiving one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived,
    Deferred,
    NotEligible,
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>, KilnError> {
    let meta = fs::metadata(path).map_err(|e| KilnError::io(path, e))?;
    let modified = meta.modified().map_err(|e| KilnError::io(path, e))?;
    Ok(DateTime::<Utc>::from(modified))
}

fn read_dir_paths(dir: &Path) -> Result<Vec<PathBuf>, KilnError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(KilnError::io(dir, e)),
    };
    let mut paths = Vec::new();
    for entry in entries {
        paths.push(entry.map_err(|e| KilnError::io(dir, e))?.path());
    }
    paths.sort();
    Ok(paths)
}

fn remove_dir_if_empty(dir: &Path) -> bool {
    // fails on non-empty directories, which is the point
    fs::remove_dir(dir).is_ok()
}

impl LifecycleManager {
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            sessions,
            registry,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub async fn reap_staging(&self) -> Result<Vec<PathBuf>, KilnError> {
        let now = self.clock.now();
        let ttl = self.config.staging_ttl();
        let mut removed = Vec::new();
        for path in read_dir_paths(&self.sessions.layout().staging_dir())? {
            if !path.is_file() {
                continue;
            }
            let age = now - modified_at(&path)?;
            if age > ttl && remove_if_exists(&path)? {
                tracing::info!(path = %path.display(), age_secs = age.num_seconds(), "staging file reaped");
                removed.push(path);
            }
        }
        Ok(removed)
    }

    pub async fn expire_idle(&self) -> Result<Vec<SessionId>, KilnError> {
        let now = self.clock.now();
        let ttl = self.config.idle_session_ttl();
        let mut expired = Vec::new();
        for session_id in self.sessions.list_session_ids().await? {
            let session = match self.sessions.load(session_id).await {
                Ok(session) => session,
                Err(KilnError::SessionNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if session.status != SessionStatus::Active || now - session.updated_at <= ttl {
                continue;
            }

            let guard = self.sessions.lock(session_id).await?;
            let mut session = self.sessions.load(session_id).await?;
            if session.status != SessionStatus::Active
                || now - session.updated_at <= ttl
                || self.registry.has_active_jobs(session_id).await
            {
                continue;
            }
            session.status = SessionStatus::Expired;
            self.sessions.store_locked(&guard, &mut session).await?;
            drop(guard);

            tracing::info!(session_id = %session_id, "idle session expired");
            expired.push(session_id);
        }
        Ok(expired)
    }

    /// Archive one session if it is eligible; see module docs for the ordering.
    pub async fn archive_session(&self, session_id: SessionId) -> Result<ArchiveOutcome, KilnError> {
        let snapshot = self.sessions.load(session_id).await?;
        if !snapshot.status.is_archivable() {
            return Ok(ArchiveOutcome::NotEligible);
        }
        if self.registry.has_active_jobs(session_id).await {
            tracing::info!(session_id = %session_id, "archive deferred: session has active jobs");
            return Ok(ArchiveOutcome::Deferred);
        }

        let layout = self.sessions.layout();
        let src = layout.session_dir(session_id);
        let dest = layout.archive_path(session_id, self.clock.now());
        let root_name = session_id.to_string();
        let (bundle_src, bundle_dest) = (src.clone(), dest.clone());
        let files = tokio::task::spawn_blocking(move || {
            archive_and_verify(&bundle_src, &bundle_dest, &root_name)
        })
        .await
        .map_err(|e| KilnError::Archive {
            path: dest.clone(),
            reason: e.to_string(),
        })??;

        // re-check under the session lock, immediately before deleting
        let guard = self.sessions.lock(session_id).await?;
        let current = self.sessions.load(session_id).await?;
        let still_eligible = current.status.is_archivable()
            && current.updated_at == snapshot.updated_at
            && !self.registry.has_active_jobs(session_id).await;
        if !still_eligible {
            drop(guard);
            remove_if_exists(&dest)?;
            tracing::info!(session_id = %session_id, "archive abandoned: session changed during bundling");
            return Ok(ArchiveOutcome::Deferred);
        }
        let doomed = src.clone();
        run_blocking(&src, move || {
            fs::remove_dir_all(&doomed).map_err(|e| KilnError::io(&doomed, e))
        })
        .await?;
        drop(guard);

        tracing::info!(
            session_id = %session_id,
            archive = %layout.relative(&dest),
            files,
            "session archived"
        );
        Ok(ArchiveOutcome::Archived)
    }

    /// Returns (archived, deferred).
    pub async fn archive_sessions(&self) -> Result<(Vec<SessionId>, Vec<SessionId>), KilnError> {
        let mut archived = Vec::new();
        let mut deferred = Vec::new();
        for session_id in self.sessions.list_session_ids().await? {
            match self.archive_session(session_id).await {
                Ok(ArchiveOutcome::Archived) => archived.push(session_id),
                Ok(ArchiveOutcome::Deferred) => deferred.push(session_id),
                Ok(ArchiveOutcome::NotEligible) | Err(KilnError::SessionNotFound(_)) => {}
                // one broken session must not block the rest; the next pass retries it
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "archiving failed")
                }
            }
        }
        Ok((archived, deferred))
    }

    pub async fn purge_archives(&self) -> Result<Vec<PathBuf>, KilnError> {
        let now = self.clock.now();
        let retention = self.config.archive_retention();
        let suffix = format!(".{ARCHIVE_EXTENSION}");
        let mut purged = Vec::new();

        for year in read_dir_paths(&self.sessions.layout().archive_root())? {
            if !year.is_dir() {
                continue;
            }
            for month in read_dir_paths(&year)? {
                if !month.is_dir() {
                    continue;
                }
                for archive in read_dir_paths(&month)? {
                    let is_archive = archive
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().ends_with(&suffix));
                    if !is_archive || now - modified_at(&archive)? <= retention {
                        continue;
                    }
                    if remove_if_exists(&archive)? {
                        tracing::info!(path = %archive.display(), "archive purged");
                        purged.push(archive);
                    }
                }
                if remove_dir_if_empty(&month) {
                    tracing::debug!(path = %month.display(), "pruned empty archive month");
                }
            }
            if remove_dir_if_empty(&year) {
                tracing::debug!(path = %year.display(), "pruned empty archive year");
            }
        }
        Ok(purged)
    }

    /// Run every policy once. A failing policy does not stop the others.
    pub async fn run_once(&self) -> LifecycleReport {
        let mut report = LifecycleReport::default();

        match self.reap_staging().await {
            Ok(removed) => report.staging_removed = removed,
            Err(e) => report.errors.push(format!("reap_staging: {e}")),
        }
        match self.expire_idle().await {
            Ok(expired) => report.sessions_expired = expired,
            Err(e) => report.errors.push(format!("expire_idle: {e}")),
        }
        match self.archive_sessions().await {
            Ok((archived, deferred)) => {
                report.sessions_archived = archived;
                report.archive_deferred = deferred;
            }
            Err(e) => report.errors.push(format!("archive_sessions: {e}")),
        }
        match self.purge_archives().await {
            Ok(purged) => report.archives_purged = purged,
            Err(e) => report.errors.push(format!("purge_archives: {e}")),
        }

        for error in &report.errors {
            tracing::error!(error = %error, "lifecycle policy failed");
        }
        report
    }

    /// Periodic ticker. Stops when the handle shuts down or is dropped.
    pub fn spawn(self: Arc<Self>) -> LifecycleHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.config.interval();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = self.run_once().await;
                        tracing::debug!(?report, "lifecycle pass finished");
                    }
                }
            }
        });
        LifecycleHandle { shutdown_tx, join }
    }
}

pub struct LifecycleHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LifecycleHandle {
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "lifecycle task panicked");
        }
    }
}
