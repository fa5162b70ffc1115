use std::path::{Path, PathBuf};
use md5::{Digest, Md5};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use crate::core::{Result, UploadError};

/// 原子写入器
///
/// 数据先写入同目录下的临时文件，`commit` 时 fsync 后原子重命名到目标路径。
/// 目标文件要么是完整的新内容，要么保持原样，不存在中间状态。
/// 写入过程中同步累计 MD5 和字节数。
pub struct AtomicWriter {
    target: PathBuf,
    temp: PathBuf,
    file: Option<File>,
    hasher: Md5,
    written: u64,
    finished: bool,
}

impl AtomicWriter {
    /// 创建写入器，确保目标目录存在并打开临时文件
    ///
    /// 临时文件与目标文件同目录，保证最终 rename 不跨文件系统。
    pub async fn create(target: impl Into<PathBuf>) -> Result<Self> {
        let target = target.into();

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = temp_path_for(&target);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await?;

        Ok(Self {
            target,
            temp,
            file: Some(file),
            hasher: Md5::new(),
            written: 0,
            finished: false,
        })
    }

    /// 追加数据，同时更新哈希和累计大小
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let file = self.file.as_mut().ok_or_else(|| {
            UploadError::Io(std::io::Error::other("atomic writer already finished"))
        })?;

        file.write_all(data).await?;
        self.hasher.update(data);
        self.written += data.len() as u64;

        Ok(data.len())
    }

    /// 当前已写入内容的 MD5（十六进制小写）
    pub fn digest_hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// 当前已写入的字节数
    pub fn size(&self) -> u64 {
        self.written
    }

    /// 提交：fsync、关闭临时文件并原子重命名到目标路径
    ///
    /// 任一步骤失败都会删除临时文件；rename 未执行时目标保持原样。
    pub async fn commit(mut self) -> Result<()> {
        let file = self.file.take().ok_or_else(|| {
            UploadError::Io(std::io::Error::other("atomic writer already finished"))
        })?;

        if let Err(err) = file.sync_all().await {
            drop(file);
            self.discard_temp().await;
            return Err(err.into());
        }
        drop(file);

        if let Err(err) = tokio::fs::rename(&self.temp, &self.target).await {
            self.discard_temp().await;
            return Err(err.into());
        }

        self.finished = true;
        Ok(())
    }

    /// 回滚：关闭并删除临时文件，目标路径不受影响
    pub async fn rollback(mut self) {
        self.file.take();
        self.discard_temp().await;
    }

    async fn discard_temp(&mut self) {
        let _ = tokio::fs::remove_file(&self.temp).await;
        self.finished = true;
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        // 既未提交也未回滚（例如操作被取消）时兜底清理临时文件
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp.{}", Uuid::new_v4().simple()));
    target.with_file_name(name)
}
