//! StageExecutor port - パイプラインの 1 ステージ（推論 / NMS / 記号推論 など）
//!
//! 実際の変換処理はコアの外側にあります。worker は入力パス・出力パス・
//! ステージ設定を渡して呼び出し、失敗時は `FailureClass` を見てリトライ方針を決めます。
//!
//! # 出力の原子性
//! `output_path` は最終成果物の隣にある一時ファイルです。成功後に worker が
//! rename で確定させるので、読み手が書きかけの成果物を見ることはありません。

use std::path::Path;

use async_trait::async_trait;

use crate::domain::{FileId, JobId, StageError};

/// Which top-level artifact directory a stage writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Prediction,
    Visualization,
}

impl ArtifactKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Prediction => "predictions",
            ArtifactKind::Visualization => "visualizations",
        }
    }
}

/// Normal, or the degraded mode used once after a resource-exhaustion failure
/// (smaller batch, CPU instead of GPU, ...). What it means is up to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Normal,
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct StageRequest<'a> {
    pub job_id: JobId,
    pub file_id: FileId,
    pub stage: &'a str,
    pub input_path: &'a Path,
    pub output_path: &'a Path,
    pub config: &'a serde_json::Value,
    pub mode: ExecutionMode,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, request: StageRequest<'_>) -> Result<(), StageError>;

    fn artifact_kind(&self) -> ArtifactKind {
        ArtifactKind::Prediction
    }

    /// Extension of the artifact file, without the dot.
    fn extension(&self) -> &str {
        "json"
    }
}
