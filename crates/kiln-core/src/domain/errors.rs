//! Errors - エラー型と分類
//!
//! # 運用分類（ErrorKind）
//! - Validation: 入力不正。リトライしない。コード付きでそのまま呼び出し元へ
//! - Transient: ストレージ / ランタイムの一時的な失敗。有界の指数バックオフで再試行
//! - ResourceExhaustion: メモリ不足など。fallback モードで 1 回だけ再試行
//! - Fatal: 入力や依存の欠落。即座に終端失敗
//! - Concurrency: ロック / claim の競合。呼び出し側がリトライする（握りつぶさない）

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{FileId, JobId, SessionId};
use super::state::{JobStatus, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transient,
    ResourceExhaustion,
    Fatal,
    Concurrency,
}

/// KilnError はコア全体のエラー
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {session_id} is {status}, not active")]
    InvalidSession {
        session_id: SessionId,
        status: SessionStatus,
    },

    #[error("job requires at least one input file")]
    EmptyInput,

    #[error("job requires at least one stage")]
    EmptyStages,

    #[error("invalid stage name `{0}`: use lowercase letters, digits, `-` or `_`")]
    InvalidStageName(String),

    #[error("stage `{0}` is listed more than once")]
    DuplicateStage(String),

    #[error("file {file_id} is not registered in session {session_id}")]
    UnknownFile {
        session_id: SessionId,
        file_id: FileId,
    },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("timed out acquiring lock `{key}` after {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    #[error("job {0} is being updated; retry shortly")]
    Busy(JobId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("archive {path}: {reason}")]
    Archive { path: PathBuf, reason: String },
}

impl KilnError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KilnError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KilnError::Validation(_)
            | KilnError::EmptyInput
            | KilnError::EmptyStages
            | KilnError::InvalidStageName(_)
            | KilnError::DuplicateStage(_)
            | KilnError::UnknownFile { .. }
            | KilnError::InvalidSession { .. } => ErrorKind::Validation,
            KilnError::LockTimeout { .. } | KilnError::Busy(_) => ErrorKind::Concurrency,
            KilnError::Io { .. } => ErrorKind::Transient,
            KilnError::SessionNotFound(_)
            | KilnError::JobNotFound(_)
            | KilnError::InvalidTransition { .. }
            | KilnError::Json(_)
            | KilnError::Toml(_)
            | KilnError::Archive { .. } => ErrorKind::Fatal,
        }
    }

    /// Stable machine-readable code for external callers.
    pub fn code(&self) -> &'static str {
        match self {
            KilnError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            KilnError::InvalidSession { .. } => "INVALID_SESSION",
            KilnError::EmptyInput => "NO_FILES",
            KilnError::EmptyStages => "NO_STAGES",
            KilnError::InvalidStageName(_) => "INVALID_STAGE",
            KilnError::DuplicateStage(_) => "DUPLICATE_STAGE",
            KilnError::UnknownFile { .. } => "FILE_NOT_FOUND",
            KilnError::JobNotFound(_) => "JOB_NOT_FOUND",
            KilnError::InvalidTransition { .. } => "INVALID_JOB_STATUS",
            KilnError::LockTimeout { .. } => "LOCK_TIMEOUT",
            KilnError::Busy(_) => "BUSY",
            KilnError::Validation(e) => e.code.as_str(),
            KilnError::Io { .. } => "STORAGE_ERROR",
            KilnError::Json(_) => "CORRUPTED_METADATA",
            KilnError::Toml(_) => "INVALID_CONFIG",
            KilnError::Archive { .. } => "ARCHIVE_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Concurrency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    InvalidFilename,
    InvalidFormat,
    FileTooSmall,
    FileTooLarge,
    CorruptedFile,
    DimensionsTooSmall,
    DimensionsExceeded,
}

impl ValidationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationCode::InvalidFilename => "INVALID_FILENAME",
            ValidationCode::InvalidFormat => "INVALID_FORMAT",
            ValidationCode::FileTooSmall => "FILE_TOO_SMALL",
            ValidationCode::FileTooLarge => "FILE_TOO_LARGE",
            ValidationCode::CorruptedFile => "CORRUPTED_FILE",
            ValidationCode::DimensionsTooSmall => "DIMENSIONS_TOO_SMALL",
            ValidationCode::DimensionsExceeded => "DIMENSIONS_EXCEEDED",
        }
    }
}

/// An upload that was rejected before it touched session storage.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {message}", code.as_str())]
pub struct ValidationError {
    pub code: ValidationCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Classification a stage executor attaches to its failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    ResourceExhaustion,
    Fatal,
}

impl From<FailureClass> for ErrorKind {
    fn from(class: FailureClass) -> Self {
        match class {
            FailureClass::Transient => ErrorKind::Transient,
            FailureClass::ResourceExhaustion => ErrorKind::ResourceExhaustion,
            FailureClass::Fatal => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class:?} stage failure: {message}")]
pub struct StageError {
    pub class: FailureClass,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::ResourceExhaustion,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Fatal,
            message: message.into(),
        }
    }
}

/// Stable codes recorded on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobErrorCode {
    MaxRetriesExceeded,
    ResourceExhausted,
    StageFatal,
    InputMissing,
    StageUnavailable,
    WorkerInterrupted,

    /// Job bookkeeping could not be written; the run was abandoned.
    StorageUnavailable,
}

/// User-visible failure detail: a stable code plus a readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stage: None,
            file_id: None,
        }
    }

    pub fn at(mut self, stage: impl Into<String>, file_id: FileId) -> Self {
        self.stage = Some(stage.into());
        self.file_id = Some(file_id);
        self
    }
}
