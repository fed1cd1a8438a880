//! StatusCache port - ポーリング用の高速キャッシュ
//!
//! best-effort で結果整合。権威はありません。読み手は不整合を見つけたら
//! レジストリに問い合わせてキャッシュを修復します。

use crate::domain::{JobId, JobRecord};

pub trait StatusCache: Send + Sync {
    fn get(&self, job_id: JobId) -> Option<JobRecord>;
    fn put(&self, record: &JobRecord);
    fn invalidate(&self, job_id: JobId);
}
