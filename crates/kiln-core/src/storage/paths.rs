//! Storage path resolver.
//!
//! Pure mapping from (session, job, stage, file) to paths under the storage
//! root. Nothing here touches the file system.
//!
//! ```text
//! <root>/sessions/<sid>/metadata.json
//! <root>/sessions/<sid>/uploads/raw/<stored_name>
//! <root>/sessions/<sid>/uploads/validated/<fid>.json
//! <root>/sessions/<sid>/jobs/<jid>/{predictions,visualizations}/<stage>/<fid>.<ext>
//! <root>/archive/<yyyy>/<mm>/<sid>.tar.gz
//! <root>/staging/
//! <root>/locks/
//! <root>/registry/jobs.jsonl
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};

use crate::domain::{FileId, JobId, SessionId};
use crate::ports::ArtifactKind;

pub const METADATA_FILE: &str = "metadata.json";
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

const MAX_STEM_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_dir(&self, session_id: SessionId) -> PathBuf {
        self.sessions_dir().join(session_id.to_string())
    }

    pub fn metadata_path(&self, session_id: SessionId) -> PathBuf {
        self.session_dir(session_id).join(METADATA_FILE)
    }

    pub fn uploads_raw_dir(&self, session_id: SessionId) -> PathBuf {
        self.session_dir(session_id).join("uploads").join("raw")
    }

    pub fn uploads_validated_dir(&self, session_id: SessionId) -> PathBuf {
        self.session_dir(session_id).join("uploads").join("validated")
    }

    pub fn upload_path(&self, session_id: SessionId, stored_name: &str) -> PathBuf {
        self.uploads_raw_dir(session_id).join(stored_name)
    }

    pub fn validation_report_path(&self, session_id: SessionId, file_id: FileId) -> PathBuf {
        self.uploads_validated_dir(session_id)
            .join(format!("{file_id}.json"))
    }

    pub fn job_dir(&self, session_id: SessionId, job_id: JobId) -> PathBuf {
        self.session_dir(session_id)
            .join("jobs")
            .join(job_id.to_string())
    }

    pub fn stage_dir(
        &self,
        session_id: SessionId,
        job_id: JobId,
        kind: ArtifactKind,
        stage: &str,
    ) -> PathBuf {
        self.job_dir(session_id, job_id)
            .join(kind.dir_name())
            .join(stage)
    }

    pub fn artifact_path(
        &self,
        session_id: SessionId,
        job_id: JobId,
        kind: ArtifactKind,
        stage: &str,
        file_id: FileId,
        extension: &str,
    ) -> PathBuf {
        self.stage_dir(session_id, job_id, kind, stage)
            .join(format!("{file_id}.{extension}"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn job_log_path(&self) -> PathBuf {
        self.root.join("registry").join("jobs.jsonl")
    }

    pub fn archive_root(&self) -> PathBuf {
        self.root.join("archive")
    }

    /// `archive/<yyyy>/<mm>/<sid>.tar.gz`, bucketed by archival time.
    pub fn archive_path(&self, session_id: SessionId, archived_at: DateTime<Utc>) -> PathBuf {
        self.archive_root()
            .join(format!("{:04}", archived_at.year()))
            .join(format!("{:02}", archived_at.month()))
            .join(format!("{session_id}.{ARCHIVE_EXTENSION}"))
    }

    /// Path relative to the root, `/`-separated, for status payloads.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Stage names become directory names, so keep them to a safe alphabet.
pub fn is_valid_stage_name(stage: &str) -> bool {
    !stage.is_empty()
        && stage.len() <= 64
        && stage
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

/// Last path component of an untrusted client-supplied name.
pub fn basename(original: &str) -> &str {
    original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original)
}

/// Lowercased extension of `name`, without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Stem reduced to `[A-Za-z0-9_-]`, anything else becomes `_`.
pub fn sanitize_stem(name: &str) -> String {
    let base = basename(name);
    let stem = base.rsplit_once('.').map_or(base, |(stem, _)| stem);
    let mut out: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect();
    if out.trim_matches('_').is_empty() {
        out = "upload".to_string();
    }
    out
}

/// `<stem>_<yyyymmddThhmmssmmm>_<suffix>.<ext>`
///
/// Deterministic in its inputs; the caller supplies a fresh random suffix so
/// two same-named uploads in the same millisecond still differ.
pub fn canonical_stored_name(
    original: &str,
    extension: &str,
    at: DateTime<Utc>,
    suffix: &str,
) -> String {
    format!(
        "{}_{}_{}.{}",
        sanitize_stem(original),
        at.format("%Y%m%dT%H%M%S%3f"),
        suffix,
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    #[test]
    fn layout_matches_documented_tree() {
        let layout = StorageLayout::new("/data");
        let sid = SessionId::from_ulid(Ulid::new());
        let jid = JobId::from_ulid(Ulid::new());
        let fid = FileId::from_ulid(Ulid::new());

        let path = layout.artifact_path(sid, jid, ArtifactKind::Prediction, "nms", fid, "json");
        assert_eq!(
            path,
            PathBuf::from(format!("/data/sessions/{sid}/jobs/{jid}/predictions/nms/{fid}.json"))
        );
        assert_eq!(
            layout.relative(&path),
            format!("sessions/{sid}/jobs/{jid}/predictions/nms/{fid}.json")
        );
    }

    #[test]
    fn archive_is_bucketed_by_year_and_month() {
        let layout = StorageLayout::new("/data");
        let sid = SessionId::from_ulid(Ulid::new());
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 0, 0, 0).unwrap();
        assert_eq!(
            layout.archive_path(sid, at),
            PathBuf::from(format!("/data/archive/2025/03/{sid}.tar.gz"))
        );
    }

    #[rstest]
    #[case::plain("cat.png", "cat")]
    #[case::traversal("../../etc/passwd.png", "passwd")]
    #[case::windows("C:\\img\\dog photo.jpg", "dog_photo")]
    #[case::shell("a;rm -rf.jpg", "a_rm_-rf")]
    #[case::only_junk("....png", "upload")]
    fn stems_are_sanitized(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_stem(input), expected);
    }

    #[test]
    fn stored_name_embeds_timestamp_and_suffix() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let name = canonical_stored_name("Cat.PNG", "png", at, "a1b2c3d4");
        assert_eq!(name, "Cat_20250102T030405000_a1b2c3d4.png");
    }

    #[rstest]
    #[case("preprocess", true)]
    #[case("nms_v2", true)]
    #[case("", false)]
    #[case("../x", false)]
    #[case("Eval", false)]
    fn stage_names(#[case] stage: &str, #[case] ok: bool) {
        assert_eq!(is_valid_stage_name(stage), ok);
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension_of("a.JPeG").as_deref(), Some("jpeg"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of("trailing."), None);
    }
}
