//! JobLog の実装
//!
//! - FileJobLog: JSON Lines への追記。1 行 = 変更後のレコード全体
//! - MemoryJobLog: テスト用
//!
//! # FileJobLog の書き込み
//! 1. tokio Mutex で追記を直列化（行が混ざらない）
//! 2. `write_all` で 1 行を書く
//! 3. `sync_data` で永続化してから返す
//!
//! 最後の行が途中で切れている（書き込み中のクラッシュ）場合、replay はその行を捨てます。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::domain::KilnError;
use crate::ports::{JobLog, JobLogEntry};

pub struct FileJobLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileJobLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, KilnError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io(parent, e))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| KilnError::io(&path, e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JobLog for FileJobLog {
    async fn append(&self, entry: &JobLogEntry) -> Result<(), KilnError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| KilnError::io(&self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| KilnError::io(&self.path, e))?;
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<JobLogEntry>, KilnError> {
        // hold the writer lock so replay never sees a half-written line from us
        let _guard = self.file.lock().await;
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KilnError::io(&self.path, e)),
        };

        let mut entries = Vec::new();
        let mut lines = contents.lines().peekable();
        while let Some(line) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JobLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if lines.peek().is_none() => {
                    tracing::warn!(path = %self.path.display(), error = %e, "dropping torn tail line in job log");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }
}

#[derive(Default)]
pub struct MemoryJobLog {
    entries: Mutex<Vec<JobLogEntry>>,
}

impl MemoryJobLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl JobLog for MemoryJobLog {
    async fn append(&self, entry: &JobLogEntry) -> Result<(), KilnError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<JobLogEntry>, KilnError> {
        Ok(self.entries.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FileId, JobId, JobRecord, SessionId};
    use chrono::Utc;
    use ulid::Ulid;

    fn entry(seq: u64) -> JobLogEntry {
        let record = JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            SessionId::from_ulid(Ulid::new()),
            vec![FileId::from_ulid(Ulid::new())],
            vec!["eval".into()],
            Utc::now(),
        );
        JobLogEntry {
            seq,
            at: Utc::now(),
            record,
        }
    }

    #[tokio::test]
    async fn file_log_replays_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileJobLog::open(dir.path().join("registry/jobs.jsonl"))
            .await
            .unwrap();

        let first = entry(1);
        let second = entry(2);
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();

        let replayed = log.replay().await.unwrap();
        assert_eq!(replayed, vec![first, second]);
    }

    #[tokio::test]
    async fn torn_tail_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.jsonl");
        let log = FileJobLog::open(&path).await.unwrap();
        log.append(&entry(1)).await.unwrap();
        drop(log);

        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"{\"seq\":2,\"at\":");
        std::fs::write(&path, raw).unwrap();

        let log = FileJobLog::open(&path).await.unwrap();
        assert_eq!(log.replay().await.unwrap().len(), 1);
    }
}
