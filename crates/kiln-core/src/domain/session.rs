//! Session metadata and uploaded file records.
//!
//! `Session` is what `metadata.json` holds. It is only ever mutated through
//! the session store's locked read-modify-write cycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{FileId, JobId, SessionId};
use super::state::SessionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// What the validator established about an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub format: String,
    pub dimensions: Dimensions,
    pub size_bytes: u64,
    pub checked_at: DateTime<Utc>,
}

/// An accepted upload. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub file_id: FileId,

    /// As supplied by the client. Metadata only, never used as a path.
    pub original_name: String,

    /// `<stem>_<timestamp>_<suffix>.<ext>` under `uploads/raw/`.
    pub stored_name: String,

    pub size_bytes: u64,
    pub dimensions: Dimensions,
    pub validation: ValidationReport,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Append-only while the session is active.
    pub files: Vec<UploadedFile>,
    pub job_ids: Vec<JobId>,

    /// Free-form per-key metadata supplied by callers.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(session_id: SessionId, owner_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            owner_id,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            completed_at: None,
            files: Vec::new(),
            job_ids: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn file(&self, file_id: FileId) -> Option<&UploadedFile> {
        self.files.iter().find(|f| f.file_id == file_id)
    }
}
