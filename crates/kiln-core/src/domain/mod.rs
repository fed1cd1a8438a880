//! Domain model (IDs, states, records, errors).
//!
//! I/O を一切持たない層です。ports / storage / registry / app はすべて
//! ここの型を共有します。

pub mod errors;
pub mod ids;
pub mod job;
pub mod session;
pub mod state;

pub use errors::{
    ErrorKind, FailureClass, JobError, JobErrorCode, KilnError, StageError, ValidationCode,
    ValidationError,
};
pub use ids::{FileId, Id, IdMarker, JobId, ParseIdError, SessionId};
pub use job::{ArtifactRef, JobReceipt, JobRecord, JobStatusView, Progress, ProgressView};
pub use session::{Dimensions, Session, UploadedFile, ValidationReport};
pub use state::{JobStatus, SessionStatus};
