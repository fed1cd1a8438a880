//! FileLockManager - OS のファイルロック（flock / LockFileEx）
//!
//! 同じストレージを複数プロセスで共有するときに使います。
//! ロックファイルは `locks/<key>.lock` に置き、セッションディレクトリの外にあるので
//! アーカイブでディレクトリを消してもロックは残ります。

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fs2::FileExt;

use crate::domain::KilnError;
use crate::ports::{LockGuard, LockManager};

const POLL_MIN: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(100);

pub struct FileLockManager {
    dir: PathBuf,
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, KilnError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| KilnError::io(&dir, e))?;
        Ok(Self { dir })
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.lock"))
    }
}

/// Unlocks on drop.
struct HeldFileLock {
    file: File,
}

impl Drop for HeldFileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[async_trait]
impl LockManager for FileLockManager {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard, KilnError> {
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| KilnError::io(&path, e))?;

        let started = Instant::now();
        let mut poll = POLL_MIN;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard::new(key, Box::new(HeldFileLock { file }))),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(KilnError::io(&path, e)),
            }
            if started.elapsed() >= timeout {
                return Err(KilnError::LockTimeout {
                    key: key.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(poll).await;
            poll = (poll * 2).min(POLL_MAX);
        }
    }
}
