use std::path::PathBuf;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use crate::core::{Result, UploadError};

/// 超过该阈值且无法续期的锁视为持有者已崩溃，可以回收
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

/// 基于独占创建语义的文件锁
///
/// 锁文件内容为持有者的进程号和获取时间（仅供排查），互斥完全依赖
/// `O_CREAT | O_EXCL`。获取失败返回 `Locked`，调用方应当将其作为
/// "操作进行中" 的信号处理，而不是在内部等待重试。
pub struct LockFile {
    path: PathBuf,
    stale_after: Duration,
    acquired: bool,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stale_after: DEFAULT_STALE_AFTER,
            acquired: false,
        }
    }

    /// 调整失效阈值（主要用于测试）
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// 获取锁
    ///
    /// 锁文件已存在时检查其是否失效：持有者写入的时间戳（或文件
    /// mtime）超过阈值则回收后重试一次，否则返回 `Locked`。
    pub async fn acquire(&mut self) -> Result<()> {
        if self.acquired {
            return Err(UploadError::Locked(self.path.display().to_string()));
        }

        match self.try_create().await {
            Ok(()) => {
                self.acquired = true;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.is_stale().await {
                    warn!(path = %self.path.display(), "reclaiming stale lock file");
                    let _ = tokio::fs::remove_file(&self.path).await;

                    match self.try_create().await {
                        Ok(()) => {
                            self.acquired = true;
                            Ok(())
                        }
                        // 回收后被其他请求抢先，仍按冲突处理
                        Err(_) => Err(UploadError::Locked(self.path.display().to_string())),
                    }
                } else {
                    Err(UploadError::Locked(self.path.display().to_string()))
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 释放锁，未持有时为空操作
    pub async fn release(&mut self) -> Result<()> {
        if !self.acquired {
            return Ok(());
        }

        self.acquired = false;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// 锁文件当前是否存在（不区分持有者）
    pub async fn is_locked(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    async fn try_create(&self) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await?;

        let body = format!(
            "pid: {}\nacquired_at: {}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.write_all(body.as_bytes()).await?;

        Ok(())
    }

    async fn is_stale(&self) -> bool {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        // 优先解析锁内容中的获取时间
        if let Ok(content) = tokio::fs::read_to_string(&self.path).await {
            for line in content.lines() {
                if let Some(ts) = line.strip_prefix("acquired_at: ") {
                    if let Ok(acquired_at) = DateTime::parse_from_rfc3339(ts.trim()) {
                        let age = Utc::now().signed_duration_since(acquired_at.with_timezone(&Utc));
                        return age > stale_after;
                    }
                }
            }
        }

        // 内容不可解析时退回到文件修改时间
        if let Ok(metadata) = tokio::fs::metadata(&self.path).await {
            if let Ok(modified) = metadata.modified() {
                if let Ok(age) = modified.elapsed() {
                    return age > self.stale_after;
                }
            }
        }

        false
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // 持有者异常退出时不留下永久锁
        if self.acquired {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
