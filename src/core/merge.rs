use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use crate::config::WharfConfig;
use crate::utils::atomic::AtomicWriter;
use crate::utils::hash::file_md5;
use crate::utils::lock::LockFile;
use crate::utils::retry::retry_with_backoff;
use super::errors::{Result, UploadError};
use super::janitor::{CleanupJob, Janitor};
use super::store::TaskStore;
use super::types::{MergeOutcome, MergeRequest};

/// 把任务的全部分片按索引顺序合并为最终文件
///
/// 就绪校验要求 0..total_chunks 的每个索引都已完成。合并锁独占，
/// 冲突立即以 `Locked` 返回而不重试；合并体包在重试策略里，整体受
/// `merge_timeout` 限制。成功后的分片与锁文件清理交给后台工作者。
pub(crate) async fn merge_chunks(
    config: &WharfConfig,
    store: &TaskStore,
    janitor: &Janitor,
    req: MergeRequest,
    cancel: &CancellationToken,
) -> Result<MergeOutcome> {
    if req.file_id.is_empty() || req.filename.is_empty() {
        return Err(UploadError::validation("file_id and filename are required"));
    }
    if req.total_chunks == 0 {
        return Err(UploadError::validation("total_chunks must be positive"));
    }

    if store.get_task(&req.file_id).await.is_none() {
        return Err(UploadError::TaskNotFound(req.file_id.clone()));
    }

    // 就绪校验：断言索引集合相等，而不是只比较数量
    let uploaded = store.uploaded_chunks(&req.file_id).await;
    let ready = uploaded.len() as u32 == req.total_chunks
        && (0..req.total_chunks).all(|i| uploaded.contains(&i));
    if !ready {
        return Err(UploadError::Incomplete {
            uploaded: uploaded.len(),
            required: req.total_chunks,
        });
    }

    // 同一文件的合并绝不允许并发执行
    let mut lock = LockFile::new(config.merge_lock_path(&req.file_id));
    lock.acquire().await?;

    let started = Instant::now();
    let merge_result = tokio::time::timeout(
        config.merge_timeout(),
        retry_with_backoff(cancel, &config.retry, || run_merge(config, &req)),
    )
    .await
    .unwrap_or(Err(UploadError::Cancelled));

    match merge_result {
        Ok((file_path, md5, size)) => {
            store.mark_task_completed(&req.file_id, &md5).await?;

            // 分片目录和两个锁文件的删除是后台工作，失败只记日志
            janitor.schedule(CleanupJob::RemoveDir(config.chunk_dir(&req.file_id)));
            janitor.schedule(CleanupJob::RemoveFile(config.upload_lock_path(&req.file_id)));
            janitor.schedule(CleanupJob::RemoveFile(config.merge_lock_path(&req.file_id)));

            if let Err(err) = lock.release().await {
                warn!(file_id = %req.file_id, error = %err, "failed to release merge lock");
            }

            let elapsed = started.elapsed();
            info!(
                file_id = %req.file_id,
                path = %file_path.display(),
                size,
                elapsed_ms = elapsed.as_millis() as u64,
                "merge completed"
            );

            Ok(MergeOutcome {
                file_path,
                md5,
                size,
                elapsed,
            })
        }
        Err(err) => {
            // 失败的任务保留分片产物，等待恢复后重新合并
            if let Err(mark_err) = store.mark_task_failed(&req.file_id).await {
                warn!(file_id = %req.file_id, error = %mark_err, "failed to mark task failed");
            }
            if let Err(release_err) = lock.release().await {
                warn!(file_id = %req.file_id, error = %release_err, "failed to release merge lock");
            }
            Err(err)
        }
    }
}

/// 单次合并执行
async fn run_merge(config: &WharfConfig, req: &MergeRequest) -> Result<(PathBuf, String, u64)> {
    let dst_path = resolve_destination(config, req)?;
    if let Some(parent) = dst_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // 开始拷贝前确认每个分片文件都在磁盘上，避免复制到一半才发现缺口
    let mut chunk_paths = Vec::with_capacity(req.total_chunks as usize);
    for index in 0..req.total_chunks {
        let path = config.chunk_path(&req.file_id, index);
        if !tokio::fs::try_exists(&path).await? {
            return Err(UploadError::MissingChunk { index });
        }
        chunk_paths.push(path);
    }

    if config.enable_atomic_writes {
        let mut writer = AtomicWriter::create(&dst_path).await?;

        for path in &chunk_paths {
            if let Err(err) = copy_into(path, &mut writer).await {
                writer.rollback().await;
                return Err(err);
            }
        }

        let md5 = writer.digest_hex();
        let size = writer.size();
        writer.commit().await?;

        if config.enable_integrity_check {
            if let Some(expected) = &req.expected_md5 {
                if *expected != md5 {
                    let _ = tokio::fs::remove_file(&dst_path).await;
                    return Err(UploadError::Integrity {
                        expected: expected.clone(),
                        actual: md5,
                    });
                }
            }
        }

        Ok((dst_path, md5, size))
    } else {
        // 直写回退路径：目标文件直接创建，崩溃时可能残留半成品
        let mut dst = tokio::fs::File::create(&dst_path).await?;
        for path in &chunk_paths {
            let mut src = tokio::fs::File::open(path).await?;
            tokio::io::copy(&mut src, &mut dst).await?;
        }
        dst.sync_all().await?;
        drop(dst);

        let md5 = file_md5(&dst_path).await?;
        let size = tokio::fs::metadata(&dst_path).await?.len();

        if config.enable_integrity_check {
            if let Some(expected) = &req.expected_md5 {
                if *expected != md5 {
                    let _ = tokio::fs::remove_file(&dst_path).await;
                    return Err(UploadError::Integrity {
                        expected: expected.clone(),
                        actual: md5,
                    });
                }
            }
        }

        Ok((dst_path, md5, size))
    }
}

/// 解析目标路径，拒绝越出合并目录的相对路径
fn resolve_destination(config: &WharfConfig, req: &MergeRequest) -> Result<PathBuf> {
    match req.relative_path.as_deref().filter(|p| !p.is_empty()) {
        Some(relative) => {
            let relative = Path::new(relative);
            let escapes = relative.is_absolute()
                || relative
                    .components()
                    .any(|c| matches!(c, Component::ParentDir));
            if escapes {
                return Err(UploadError::validation(format!(
                    "invalid relative path: {}",
                    relative.display()
                )));
            }
            Ok(config.merged_dir.join(relative))
        }
        None => Ok(config.merged_dir.join(&req.filename)),
    }
}

async fn copy_into(path: &Path, writer: &mut AtomicWriter) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).await?;
    }

    Ok(())
}
