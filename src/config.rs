use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::{Result, UploadError};
use crate::utils::hash::sanitize_file_id;
use crate::utils::retry::RetryConfig;

/// 服务配置
///
/// 所有字段都有默认值，配置文件里只需要写想覆盖的项。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WharfConfig {
    /// 分片与元数据的落盘根目录
    pub upload_dir: PathBuf,
    /// 合并产物的根目录
    pub merged_dir: PathBuf,
    /// 单个文件的大小上限（字节），0 表示不限制
    pub max_file_size: u64,
    /// 单个分片的大小上限（字节）
    pub max_chunk_size: u64,
    /// 过期任务清理间隔（秒），由外层服务的定时器消费
    pub cleanup_interval_secs: u64,
    /// 并发上传数，供外层服务限流
    pub concurrent_uploads: usize,
    /// 是否启用 MD5 完整性校验
    pub enable_integrity_check: bool,
    /// 是否启用原子写入；关闭后退回直写，崩溃一致性较弱
    pub enable_atomic_writes: bool,
    /// 单个分片写入的超时（秒）
    pub chunk_timeout_secs: u64,
    /// 合并操作的超时（秒），合并 IO 多，预算比分片宽
    pub merge_timeout_secs: u64,
    /// 重试策略
    pub retry: RetryConfig,
}

impl Default for WharfConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./upload"),
            merged_dir: PathBuf::from("./merged"),
            max_file_size: 10 * 1024 * 1024 * 1024,
            max_chunk_size: 100 * 1024 * 1024,
            cleanup_interval_secs: 3600,
            concurrent_uploads: 5,
            enable_integrity_check: true,
            enable_atomic_writes: true,
            chunk_timeout_secs: 30,
            merge_timeout_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

impl WharfConfig {
    /// 从 toml 文件加载配置
    ///
    /// 文件不存在时写出一份默认配置再返回默认值。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            let body = toml::to_string_pretty(&config)
                .map_err(|e| UploadError::Config(e.to_string()))?;

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| UploadError::Config(e.to_string()))?;
                }
            }
            std::fs::write(path, body).map_err(|e| UploadError::Config(e.to_string()))?;

            return Ok(config);
        }

        let body =
            std::fs::read_to_string(path).map_err(|e| UploadError::Config(e.to_string()))?;
        toml::from_str(&body).map_err(|e| UploadError::Config(e.to_string()))
    }

    /// 任务元数据目录
    pub fn metadata_dir(&self) -> PathBuf {
        self.upload_dir.join(".metadata")
    }

    /// 任务的分片产物目录
    pub fn chunk_dir(&self, file_id: &str) -> PathBuf {
        self.upload_dir.join(sanitize_file_id(file_id))
    }

    /// 某个分片的落盘路径，索引零填充到六位保证字典序即数值序
    pub fn chunk_path(&self, file_id: &str, index: u32) -> PathBuf {
        self.chunk_dir(file_id).join(format!("{index:06}.part"))
    }

    /// 分片写入锁的路径
    pub fn upload_lock_path(&self, file_id: &str) -> PathBuf {
        self.upload_dir
            .join(format!("{}.lock", sanitize_file_id(file_id)))
    }

    /// 合并锁的路径
    pub fn merge_lock_path(&self, file_id: &str) -> PathBuf {
        self.upload_dir
            .join(format!("{}.merge.lock", sanitize_file_id(file_id)))
    }

    /// 任务元数据文件的路径
    pub fn task_file(&self, file_id: &str) -> PathBuf {
        self.metadata_dir()
            .join(format!("{}.json", sanitize_file_id(file_id)))
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }
}
