use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::config::WharfConfig;
use crate::utils::atomic::AtomicWriter;
use crate::utils::hash::{bytes_md5, file_md5};
use crate::utils::lock::LockFile;
use crate::utils::retry::retry_with_backoff;
use super::errors::{Result, UploadError};
use super::store::TaskStore;
use super::task::UploadTask;
use super::types::{ChunkInfo, ChunkReceipt, ChunkUpload};

/// 接收并持久化一个分片
///
/// 校验、建任务、取文件锁、原子写入、登记分片状态。写入部分包在
/// 重试策略里，整体受 `chunk_timeout` 限制；校验与完整性错误不重试。
pub(crate) async fn ingest_chunk(
    config: &WharfConfig,
    store: &TaskStore,
    req: ChunkUpload,
    cancel: &CancellationToken,
) -> Result<ChunkReceipt> {
    if req.file_id.is_empty() {
        return Err(UploadError::validation("file_id is required"));
    }
    if req.data.len() as u64 > config.max_chunk_size {
        return Err(UploadError::validation(format!(
            "chunk size exceeds limit: {} > {}",
            req.data.len(),
            config.max_chunk_size
        )));
    }
    if config.max_file_size > 0 && req.file_size > config.max_file_size {
        return Err(UploadError::validation(format!(
            "file size exceeds limit: {} > {}",
            req.file_size, config.max_file_size
        )));
    }

    // 首个分片建任务；预先创建的子任务从 pending 转入 uploading
    if store.get_task(&req.file_id).await.is_none() {
        store.save_task(UploadTask::from_first_chunk(&req)).await?;
    } else {
        store.ensure_uploading(&req.file_id).await?;
    }

    // 文件锁是尽力而为：不同索引的分片写入互不冲突，拿不到锁只告警
    let mut lock = LockFile::new(config.upload_lock_path(&req.file_id));
    if let Err(err) = lock.acquire().await {
        warn!(file_id = %req.file_id, error = %err, "chunk lock unavailable, proceeding without it");
    }

    let write_result = tokio::time::timeout(
        config.chunk_timeout(),
        retry_with_backoff(cancel, &config.retry, || write_chunk(config, &req)),
    )
    .await
    .unwrap_or(Err(UploadError::Cancelled));

    if let Err(err) = lock.release().await {
        warn!(file_id = %req.file_id, error = %err, "failed to release chunk lock");
    }

    match write_result {
        Ok(size) => {
            let chunk = ChunkInfo::completed(req.chunk_index, size, req.md5.clone());
            store.update_chunk(&req.file_id, req.chunk_index, chunk).await?;

            debug!(file_id = %req.file_id, index = req.chunk_index, size, "chunk stored");
            Ok(ChunkReceipt {
                chunk_index: req.chunk_index,
                md5_checked: req.md5.is_some() && config.enable_integrity_check,
                size,
            })
        }
        Err(err) => {
            let chunk = ChunkInfo::failed(req.chunk_index, req.data.len() as u64);
            if let Err(update_err) = store
                .update_chunk(&req.file_id, req.chunk_index, chunk)
                .await
            {
                warn!(file_id = %req.file_id, error = %update_err, "failed to record chunk failure");
            }
            Err(err)
        }
    }
}

/// 单次分片写入
///
/// 相同内容的分片已在磁盘上时直接成功，客户端重传因此是幂等且廉价的。
async fn write_chunk(config: &WharfConfig, req: &ChunkUpload) -> Result<u64> {
    let path = config.chunk_path(&req.file_id, req.chunk_index);

    if let Ok(meta) = tokio::fs::metadata(&path).await {
        if meta.len() == req.data.len() as u64 {
            match &req.md5 {
                Some(expected) => {
                    if let Ok(existing) = file_md5(&path).await {
                        if existing == *expected {
                            return Ok(meta.len());
                        }
                    }
                }
                // 没有校验值时按长度一致视为已存在
                None => return Ok(meta.len()),
            }
        }
    }

    if config.enable_integrity_check {
        if let Some(expected) = &req.md5 {
            let actual = bytes_md5(&req.data);
            if actual != *expected {
                return Err(UploadError::Integrity {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
    }

    if config.enable_atomic_writes {
        let mut writer = AtomicWriter::create(&path).await?;
        if let Err(err) = writer.write(&req.data).await {
            writer.rollback().await;
            return Err(err);
        }
        let written = writer.size();
        writer.commit().await?;
        Ok(written)
    } else {
        // 直写回退路径，崩溃一致性较弱
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &req.data).await?;
        Ok(req.data.len() as u64)
    }
}
