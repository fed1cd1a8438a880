//! WorkerPool - 固定数のワーカー
//!
//! # フロー（各ワーカー）
//! 1. `claim()` で queued ジョブを 1 件取る
//! 2. なければ `wait_for_work` と shutdown を select で待つ
//! 3. JobRunner で終端状態まで実行
//! 4. 1 に戻る
//!
//! shutdown は新しい claim を止めるだけで、実行中のジョブは最後まで走らせます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::registry::JobRegistry;

use super::pipeline::JobRunner;

/// Worker pool handle.
/// - `request_shutdown` で全ワーカーに停止を伝える
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers.
    pub fn spawn(
        n: usize,
        registry: Arc<JobRegistry>,
        runner: Arc<JobRunner>,
        idle_wait: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let registry = Arc::clone(&registry);
            let runner = Arc::clone(&runner);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, registry, runner, idle_wait, &mut rx).await;
            });
            joins.push(join);
        }
        tracing::info!(workers = n, "worker pool started");

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new jobs. In-flight jobs run to completion.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    registry: Arc<JobRegistry>,
    runner: Arc<JobRunner>,
    idle_wait: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let job = match registry.claim().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // pool handle dropped without a shutdown request
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = registry.wait_for_work(idle_wait) => {}
                }
                continue;
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "claim failed");
                tokio::time::sleep(idle_wait).await;
                continue;
            }
        };

        let job_id = job.job_id;
        match runner.run(job).await {
            Ok(status) => tracing::debug!(worker_id, job_id = %job_id, status = %status, "job finished"),
            Err(e) => {
                // job vanished from the registry; nothing left to record against
                tracing::error!(worker_id, job_id = %job_id, error = %e, "job run aborted");
            }
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}
