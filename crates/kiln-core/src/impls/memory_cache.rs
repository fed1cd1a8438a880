//! InMemoryStatusCache - プロセス内のステータスキャッシュ

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::domain::{JobId, JobRecord};
use crate::ports::StatusCache;

#[derive(Default)]
pub struct InMemoryStatusCache {
    entries: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StatusCache for InMemoryStatusCache {
    fn get(&self, job_id: JobId) -> Option<JobRecord> {
        self.entries.read().get(&job_id).cloned()
    }

    fn put(&self, record: &JobRecord) {
        self.entries.write().insert(record.job_id, record.clone());
    }

    fn invalidate(&self, job_id: JobId) {
        self.entries.write().remove(&job_id);
    }
}
