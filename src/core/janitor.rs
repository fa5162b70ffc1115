use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 后台清理作业
#[derive(Debug)]
pub(crate) enum CleanupJob {
    RemoveDir(PathBuf),
    RemoveFile(PathBuf),
}

/// 后台清理工作者
///
/// 合并成功后的分片目录、锁文件删除都从请求路径上摘出来，交给这个
/// 工作者顺序执行：清理耗时不计入客户端可见延迟，清理失败也只记
/// 日志，不回滚已经上报的成功。`shutdown` 等待队列清空后退出。
pub struct Janitor {
    job_tx: mpsc::UnboundedSender<CleanupJob>,
    handle: JoinHandle<()>,
}

impl Janitor {
    pub(crate) fn spawn() -> Self {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                run_job(job).await;
            }
            debug!("cleanup worker drained");
        });

        Self { job_tx, handle }
    }

    pub(crate) fn schedule(&self, job: CleanupJob) {
        if self.job_tx.send(job).is_err() {
            warn!("cleanup worker is gone, job dropped");
        }
    }

    /// 关闭工作者，等待在途清理完成
    pub async fn shutdown(self) {
        drop(self.job_tx);
        let _ = self.handle.await;
    }
}

async fn run_job(job: CleanupJob) {
    match job {
        CleanupJob::RemoveDir(path) => {
            if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove directory");
                }
            }
        }
        CleanupJob::RemoveFile(path) => {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scheduled_jobs_run_before_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        let lock_file = dir.path().join("task.lock");
        tokio::fs::create_dir_all(&chunk_dir).await.unwrap();
        tokio::fs::write(chunk_dir.join("000000.part"), b"x").await.unwrap();
        tokio::fs::write(&lock_file, b"").await.unwrap();

        let janitor = Janitor::spawn();
        janitor.schedule(CleanupJob::RemoveDir(chunk_dir.clone()));
        janitor.schedule(CleanupJob::RemoveFile(lock_file.clone()));
        janitor.shutdown().await;

        assert!(!tokio::fs::try_exists(&chunk_dir).await.unwrap());
        assert!(!tokio::fs::try_exists(&lock_file).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_targets_are_ignored() {
        let dir = tempfile::tempdir().unwrap();

        let janitor = Janitor::spawn();
        janitor.schedule(CleanupJob::RemoveDir(dir.path().join("nope")));
        janitor.schedule(CleanupJob::RemoveFile(dir.path().join("nope.lock")));
        janitor.shutdown().await;
    }
}
