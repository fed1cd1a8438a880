//! Atomic file operations
//!
//! # 書き込み
//! 1. 同じディレクトリに一時ファイルを作る（rename が同一ファイルシステム内になる）
//! 2. 書き込んで `sync_all`
//! 3. 本来のパスへ rename
//!
//! 読み手は古い内容か新しい内容のどちらかを見ます。途中まで書かれたファイルは見えません。
//!
//! # 公開（no-clobber）
//! アップロードは hard link で公開します。宛先が既にあれば `AlreadyExists` になるので、
//! 同名アップロードが競合しても互いを上書きしません。

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::domain::KilnError;

const PUBLISH_ATTEMPTS: usize = 8;

fn parent_of(path: &Path) -> Result<&Path, KilnError> {
    path.parent().ok_or_else(|| {
        KilnError::io(
            path,
            std::io::Error::new(ErrorKind::InvalidInput, "path has no parent directory"),
        )
    })
}

pub fn ensure_dir(dir: &Path) -> Result<(), KilnError> {
    fs::create_dir_all(dir).map_err(|e| KilnError::io(dir, e))
}

/// Run blocking file I/O on tokio's blocking pool instead of a worker thread.
///
/// `path` only labels the error if the blocking task itself dies.
pub async fn run_blocking<T, F>(path: &Path, f: F) -> Result<T, KilnError>
where
    F: FnOnce() -> Result<T, KilnError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KilnError::io(path, std::io::Error::other(e)))?
}

/// Replace `path` with `bytes` in one rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), KilnError> {
    let parent = parent_of(path)?;
    ensure_dir(parent)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| KilnError::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| KilnError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| KilnError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| KilnError::io(path, e.error))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), KilnError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, KilnError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(KilnError::io(path, e)),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Hard-link `src` into `dir` under a fresh name, never replacing an existing file.
///
/// `next_name` is called again whenever the candidate is taken.
pub fn publish_no_clobber(
    src: &Path,
    dir: &Path,
    mut next_name: impl FnMut() -> String,
) -> Result<(String, PathBuf), KilnError> {
    ensure_dir(dir)?;
    let mut last_err = None;
    for _ in 0..PUBLISH_ATTEMPTS {
        let name = next_name();
        let target = dir.join(&name);
        match fs::hard_link(src, &target) {
            Ok(()) => return Ok((name, target)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(target = %target.display(), "stored name taken, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(KilnError::io(&target, e)),
        }
    }
    let err = last_err
        .unwrap_or_else(|| std::io::Error::new(ErrorKind::AlreadyExists, "no free stored name"));
    Err(KilnError::io(dir, err))
}

/// Sibling of `path` that a writer fills before `commit_rename`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix: u32 = rand::random();
    path.with_file_name(format!(".{name}.{suffix:08x}.tmp"))
}

/// Move a finished temp file over its final path.
pub fn commit_rename(tmp: &Path, path: &Path) -> Result<(), KilnError> {
    if let Ok(file) = fs::File::open(tmp) {
        file.sync_all().map_err(|e| KilnError::io(tmp, e))?;
    }
    fs::rename(tmp, path).map_err(|e| KilnError::io(path, e))
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool, KilnError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(KilnError::io(path, e)),
    }
}

/// Best-effort cleanup of a file that is no longer wanted. Failures are logged, not returned.
pub fn discard(path: &Path) {
    if let Err(e) = remove_if_exists(path) {
        tracing::warn!(path = %path.display(), error = %e, "cleanup failed");
    }
}
