//! Session archive bundling (`.tar.gz`).
//!
//! Blocking I/O; async callers run these on `spawn_blocking`.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;

use crate::domain::KilnError;

use super::atomic::{discard, ensure_dir};

fn archive_err(path: &Path, reason: impl ToString) -> KilnError {
    KilnError::Archive {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Bundle `src_dir` into `dest` under the top-level directory `root_name`.
///
/// The bundle is written to a temp file beside `dest` and renamed into place,
/// so `dest` is either absent or complete.
pub fn build_archive(src_dir: &Path, dest: &Path, root_name: &str) -> Result<(), KilnError> {
    let parent = dest
        .parent()
        .ok_or_else(|| archive_err(dest, "archive path has no parent"))?;
    ensure_dir(parent)?;

    let tmp = NamedTempFile::new_in(parent).map_err(|e| KilnError::io(parent, e))?;
    {
        let encoder = GzEncoder::new(tmp.as_file(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(root_name, src_dir)
            .map_err(|e| archive_err(dest, e))?;
        let encoder = builder.into_inner().map_err(|e| archive_err(dest, e))?;
        encoder.finish().map_err(|e| archive_err(dest, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| KilnError::io(tmp.path(), e))?;
    tmp.persist(dest).map_err(|e| KilnError::io(dest, e.error))?;
    Ok(())
}

/// Read every entry back; returns the number of regular files.
pub fn verify_archive(path: &Path) -> Result<usize, KilnError> {
    let file = File::open(path).map_err(|e| KilnError::io(path, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut files = 0;
    for entry in archive.entries().map_err(|e| archive_err(path, e))? {
        let mut entry = entry.map_err(|e| archive_err(path, e))?;
        let is_file = entry.header().entry_type().is_file();
        io::copy(&mut entry, &mut io::sink()).map_err(|e| archive_err(path, e))?;
        if is_file {
            files += 1;
        }
    }
    Ok(files)
}

/// Regular files under `dir`, recursively. Symlinks are not followed.
pub fn count_files(dir: &Path) -> Result<usize, KilnError> {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).map_err(|e| KilnError::io(&current, e))? {
            let entry = entry.map_err(|e| KilnError::io(&current, e))?;
            let file_type = entry.file_type().map_err(|e| KilnError::io(entry.path(), e))?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                total += 1;
            }
        }
    }
    Ok(total)
}

/// Build, then verify the bundle holds exactly the files of `src_dir`.
///
/// A bundle that fails verification is removed before the error is returned.
pub fn archive_and_verify(src_dir: &Path, dest: &Path, root_name: &str) -> Result<usize, KilnError> {
    let expected = count_files(src_dir)?;
    build_archive(src_dir, dest, root_name)?;
    let verified = match verify_archive(dest) {
        Ok(n) => n,
        Err(e) => {
            discard(dest);
            return Err(e);
        }
    };
    if verified != expected {
        discard(dest);
        return Err(archive_err(
            dest,
            format!("archive holds {verified} files, session directory has {expected}"),
        ));
    }
    Ok(verified)
}
