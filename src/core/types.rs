use std::path::PathBuf;
use std::time::Duration;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待首个分片
    Pending,
    /// 上传中
    Uploading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 部分失败（文件夹任务中有子任务失败）
    PartialFailed,
    /// 已暂停
    Paused,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl Default for ChunkStatus {
    fn default() -> Self {
        ChunkStatus::Pending
    }
}

/// 单个分片的记录
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub size: u64,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub status: ChunkStatus,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

impl ChunkInfo {
    pub fn completed(index: u32, size: u64, md5: Option<String>) -> Self {
        Self {
            index,
            size,
            md5,
            status: ChunkStatus::Completed,
            uploaded_at: None,
            retry_count: 0,
        }
    }

    pub fn failed(index: u32, size: u64) -> Self {
        Self {
            index,
            size,
            md5: None,
            status: ChunkStatus::Failed,
            uploaded_at: None,
            retry_count: 0,
        }
    }
}

/// 文件夹任务的文件描述，创建子任务的输入
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSpec {
    pub file_id: String,
    pub filename: String,
    #[serde(default)]
    pub relative_path: Option<String>,
    pub total_chunks: u32,
    pub file_size: u64,
}

/// 文件夹任务摘要（派生数据，从不落盘）
#[derive(Debug, Clone)]
pub struct FolderSummary {
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub total_size: u64,
    /// 已完成子任务按实际大小计，进行中的按分片比例估算
    pub uploaded_size: u64,
    /// 字节完成率（百分比）
    pub completion_rate: f64,
    pub status: TaskStatus,
}

/// 一次分片上传请求
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub file_id: String,
    pub chunk_index: u32,
    pub data: Bytes,
    /// 客户端提供的分片 MD5（可选）
    pub md5: Option<String>,
    /// 目标相对路径（可选，文件夹上传使用）
    pub relative_path: Option<String>,
    pub filename: Option<String>,
    pub total_chunks: u32,
    pub file_size: u64,
}

/// 分片上传结果
#[derive(Debug, Clone)]
pub struct ChunkReceipt {
    pub chunk_index: u32,
    /// 本次是否执行了 MD5 校验
    pub md5_checked: bool,
    pub size: u64,
}

/// 一次合并请求
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub file_id: String,
    pub filename: String,
    /// 目标相对路径（可选）
    pub relative_path: Option<String>,
    pub total_chunks: u32,
    /// 期望的整文件 MD5（可选）
    pub expected_md5: Option<String>,
}

/// 合并结果
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub file_path: PathBuf,
    pub md5: String,
    pub size: u64,
    pub elapsed: Duration,
}

// 静态断言确保跨任务传递的类型是 Send 的
const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<ChunkUpload>();
        assert_send::<ChunkReceipt>();
        assert_send::<MergeRequest>();
        assert_send::<MergeOutcome>();
        assert_send::<FolderSummary>();
    }
};
