use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use crate::config::WharfConfig;
use super::errors::Result;
use super::ingest;
use super::janitor::Janitor;
use super::merge;
use super::store::TaskStore;
use super::task::UploadTask;
use super::types::{ChunkReceipt, ChunkUpload, FileSpec, FolderSummary, MergeOutcome, MergeRequest};

/// 上传引擎
///
/// 显式构造的服务门面：持有配置、任务存储和后台清理工作者，不依赖
/// 任何全局状态。HTTP 路由、鉴权等外层协作者只与这里的方法交互。
pub struct UploadManager {
    config: WharfConfig,
    store: Arc<TaskStore>,
    janitor: Janitor,
}

impl UploadManager {
    /// 创建引擎：初始化目录、加载任务记录、启动清理工作者
    pub async fn new(config: WharfConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.upload_dir).await?;
        tokio::fs::create_dir_all(&config.merged_dir).await?;

        let store = Arc::new(TaskStore::open(config.clone()).await?);
        let janitor = Janitor::spawn();

        info!(
            upload_dir = %config.upload_dir.display(),
            merged_dir = %config.merged_dir.display(),
            "upload manager ready"
        );

        Ok(Self {
            config,
            store,
            janitor,
        })
    }

    pub fn config(&self) -> &WharfConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<TaskStore> {
        self.store.clone()
    }

    /// 接收一个分片
    pub async fn ingest_chunk(
        &self,
        req: ChunkUpload,
        cancel: &CancellationToken,
    ) -> Result<ChunkReceipt> {
        ingest::ingest_chunk(&self.config, &self.store, req, cancel).await
    }

    /// 合并任务的全部分片为最终文件
    pub async fn merge(
        &self,
        req: MergeRequest,
        cancel: &CancellationToken,
    ) -> Result<MergeOutcome> {
        merge::merge_chunks(&self.config, &self.store, &self.janitor, req, cancel).await
    }

    /// 查询已完成的分片索引，供客户端断点续传
    pub async fn uploaded_chunks(&self, file_id: &str) -> HashSet<u32> {
        self.store.uploaded_chunks(file_id).await
    }

    pub async fn get_task(&self, file_id: &str) -> Option<UploadTask> {
        self.store.get_task(file_id).await
    }

    pub async fn all_tasks(&self) -> Vec<UploadTask> {
        self.store.all_tasks().await
    }

    pub async fn main_tasks(&self) -> Vec<UploadTask> {
        self.store.main_tasks().await
    }

    pub async fn failed_tasks(&self) -> Vec<UploadTask> {
        self.store.failed_tasks().await
    }

    pub async fn sub_tasks(&self, folder_id: &str) -> Result<Vec<UploadTask>> {
        self.store.sub_tasks(folder_id).await
    }

    pub async fn create_folder_task(
        &self,
        folder_name: &str,
        files: &[FileSpec],
    ) -> Result<UploadTask> {
        self.store.create_folder_task(folder_name, files).await
    }

    pub async fn folder_summary(&self, folder_id: &str) -> Result<FolderSummary> {
        self.store.folder_summary(folder_id).await
    }

    pub async fn delete_task(&self, file_id: &str) -> Result<()> {
        self.store.delete_task(file_id).await
    }

    pub async fn pause_task(&self, file_id: &str) -> Result<()> {
        self.store.pause_task(file_id).await
    }

    pub async fn resume_task(&self, file_id: &str) -> Result<()> {
        self.store.resume_task(file_id).await
    }

    pub async fn resume_all_failed(&self) -> Result<Vec<String>> {
        self.store.resume_all_failed().await
    }

    /// 按需清理过期任务；周期调度由外层服务负责
    pub async fn cleanup_expired_tasks(&self) -> Result<usize> {
        self.store.cleanup_expired_tasks().await
    }

    /// 关闭引擎，等待在途的后台清理收尾
    pub async fn shutdown(self) {
        self.janitor.shutdown().await;
    }
}
