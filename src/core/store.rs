use std::collections::{HashMap, HashSet};
use std::path::Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;
use crate::config::WharfConfig;
use super::errors::{Result, UploadError};
use super::task::{TaskKind, UploadTask};
use super::types::{ChunkInfo, FileSpec, FolderSummary, TaskStatus};

/// 失败/暂停任务的保留期，超过后由清理操作删除
const RETENTION_DAYS: i64 = 7;

/// 任务存储
///
/// 内存任务表加每任务一个 JSON 文档的持久化，是任务与分片状态的唯一
/// 权威。所有读写都经过一把读写锁，临界区只有内存表操作加一次 JSON
/// 写入，以正确性换取粒度。
pub struct TaskStore {
    config: WharfConfig,
    tasks: RwLock<HashMap<String, UploadTask>>,
}

impl TaskStore {
    /// 打开存储并加载元数据目录下的全部任务记录
    ///
    /// 无法解析的记录跳过并告警，不阻塞启动。
    pub async fn open(config: WharfConfig) -> Result<Self> {
        let metadata_dir = config.metadata_dir();
        tokio::fs::create_dir_all(&metadata_dir).await?;

        let mut tasks = HashMap::new();
        let mut entries = tokio::fs::read_dir(&metadata_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match read_record(&path).await {
                Ok(task) => {
                    tasks.insert(task.file_id.clone(), task);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable task record");
                }
            }
        }

        debug!(count = tasks.len(), "task store loaded");

        Ok(Self {
            config,
            tasks: RwLock::new(tasks),
        })
    }

    /// 按 file_id 插入或更新任务并同步落盘
    ///
    /// 落盘失败时内存更新仍然生效，错误以 `Persistence` 返回。
    pub async fn save_task(&self, mut task: UploadTask) -> Result<()> {
        task.updated_at = Utc::now();

        let mut tasks = self.tasks.write().await;
        tasks.insert(task.file_id.clone(), task.clone());
        self.persist(&task).await
    }

    /// 查询任务，纯内存操作
    pub async fn get_task(&self, file_id: &str) -> Option<UploadTask> {
        let tasks = self.tasks.read().await;
        tasks.get(file_id).cloned()
    }

    /// 合并分片状态并重算任务完成度
    ///
    /// 子任务在此刻变为完成时，联动检查父文件夹任务是否整体完成。
    pub async fn update_chunk(&self, file_id: &str, index: u32, mut chunk: ChunkInfo) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(file_id)
            .ok_or_else(|| UploadError::TaskNotFound(file_id.to_string()))?;

        chunk.uploaded_at = Some(Utc::now());
        task.chunks.insert(index, chunk);
        task.updated_at = Utc::now();

        let was_completed = task.status == TaskStatus::Completed;
        if task.is_complete() {
            task.status = TaskStatus::Completed;
        }

        let snapshot = task.clone();
        let just_completed = !was_completed && snapshot.status == TaskStatus::Completed;
        self.persist(&snapshot).await?;

        if just_completed {
            if let Some(parent_id) = snapshot.parent_task_id.as_deref() {
                if let Some(parent) = reconcile_parent(&mut tasks, parent_id) {
                    self.persist(&parent).await?;
                }
            }
        }

        Ok(())
    }

    /// 已完成分片的索引集合，任务不存在时为空
    pub async fn uploaded_chunks(&self, file_id: &str) -> HashSet<u32> {
        let tasks = self.tasks.read().await;
        tasks
            .get(file_id)
            .map(|t| t.uploaded_indices())
            .unwrap_or_default()
    }

    /// 创建文件夹任务及其全部子任务
    ///
    /// 在存储锁内一次性分配，子任务先落盘、父任务最后落盘。
    pub async fn create_folder_task(
        &self,
        folder_name: &str,
        files: &[FileSpec],
    ) -> Result<UploadTask> {
        if files.is_empty() {
            return Err(UploadError::validation("file list must not be empty"));
        }

        let mut tasks = self.tasks.write().await;
        for spec in files {
            if spec.file_id.is_empty() {
                return Err(UploadError::validation("file_id is required for every file"));
            }
            if tasks.contains_key(&spec.file_id) {
                return Err(UploadError::validation(format!(
                    "file_id already in use: {}",
                    spec.file_id
                )));
            }
        }

        let folder_id = format!("folder_{}", Uuid::new_v4().simple());
        let sub_ids: Vec<String> = files.iter().map(|f| f.file_id.clone()).collect();
        let total_size: u64 = files.iter().map(|f| f.file_size).sum();

        for spec in files {
            let sub = UploadTask::new_sub_task(spec, &folder_id);
            self.persist(&sub).await?;
            tasks.insert(sub.file_id.clone(), sub);
        }

        let folder = UploadTask::new_folder(&folder_id, folder_name, sub_ids, total_size);
        self.persist(&folder).await?;
        tasks.insert(folder_id, folder.clone());

        Ok(folder)
    }

    /// 汇总文件夹任务的进度，纯读操作
    ///
    /// 父任务完成状态的写回发生在 `update_chunk` / `mark_task_completed`
    /// 的联动检查里，这里不产生副作用。
    pub async fn folder_summary(&self, folder_id: &str) -> Result<FolderSummary> {
        let tasks = self.tasks.read().await;
        let folder = tasks
            .get(folder_id)
            .ok_or_else(|| UploadError::TaskNotFound(folder_id.to_string()))?;

        let sub_ids = match &folder.kind {
            TaskKind::Folder { sub_tasks, .. } => sub_tasks,
            TaskKind::File => {
                return Err(UploadError::validation(format!(
                    "not a folder task: {folder_id}"
                )));
            }
        };

        let mut completed_files = 0usize;
        let mut failed_files = 0usize;
        let mut total_size = 0u64;
        let mut uploaded_size = 0u64;
        let mut any_uploading = false;
        let mut any_paused = false;

        for id in sub_ids {
            let Some(child) = tasks.get(id) else { continue };
            total_size += child.file_size;

            match child.status {
                TaskStatus::Completed => {
                    completed_files += 1;
                    uploaded_size += child.file_size;
                }
                TaskStatus::Failed | TaskStatus::PartialFailed => failed_files += 1,
                TaskStatus::Uploading => any_uploading = true,
                TaskStatus::Paused => any_paused = true,
                TaskStatus::Pending => {}
            }

            // 未完成的子任务按已完成分片的比例估算
            if child.status != TaskStatus::Completed && child.total_chunks > 0 {
                let fraction = child.completed_chunk_count() as f64 / child.total_chunks as f64;
                uploaded_size += (child.file_size as f64 * fraction) as u64;
            }
        }

        let total_files = sub_ids.len();
        let status = if total_files > 0 && completed_files == total_files {
            TaskStatus::Completed
        } else if total_files > 0 && failed_files == total_files {
            TaskStatus::Failed
        } else if any_uploading {
            TaskStatus::Uploading
        } else if any_paused {
            TaskStatus::Paused
        } else if failed_files > 0 {
            TaskStatus::PartialFailed
        } else {
            TaskStatus::Pending
        };

        let completion_rate = if total_size > 0 {
            uploaded_size as f64 / total_size as f64 * 100.0
        } else {
            0.0
        };

        Ok(FolderSummary {
            total_files,
            completed_files,
            failed_files,
            total_size,
            uploaded_size,
            completion_rate,
            status,
        })
    }

    /// 文件夹任务的子任务列表
    pub async fn sub_tasks(&self, folder_id: &str) -> Result<Vec<UploadTask>> {
        let tasks = self.tasks.read().await;
        let folder = tasks
            .get(folder_id)
            .ok_or_else(|| UploadError::TaskNotFound(folder_id.to_string()))?;

        Ok(folder
            .sub_task_ids()
            .iter()
            .filter_map(|id| tasks.get(id).cloned())
            .collect())
    }

    /// 所有主任务（过滤掉子任务）
    pub async fn main_tasks(&self) -> Vec<UploadTask> {
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .filter(|t| !t.is_sub_task())
            .cloned()
            .collect()
    }

    pub async fn all_tasks(&self) -> Vec<UploadTask> {
        let tasks = self.tasks.read().await;
        tasks.values().cloned().collect()
    }

    /// 失败（含部分失败）的任务列表
    pub async fn failed_tasks(&self) -> Vec<UploadTask> {
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::PartialFailed))
            .cloned()
            .collect()
    }

    /// 等待中的任务收到首个分片后转入上传中
    pub(crate) async fn ensure_uploading(&self, file_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(file_id)
            .ok_or_else(|| UploadError::TaskNotFound(file_id.to_string()))?;

        if task.status == TaskStatus::Pending {
            task.status = TaskStatus::Uploading;
            task.updated_at = Utc::now();
            let snapshot = task.clone();
            self.persist(&snapshot).await?;
        }

        Ok(())
    }

    /// 合并成功后记录整文件 MD5 并标记完成，联动检查父任务
    pub async fn mark_task_completed(&self, file_id: &str, file_md5: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(file_id)
            .ok_or_else(|| UploadError::TaskNotFound(file_id.to_string()))?;

        task.status = TaskStatus::Completed;
        task.file_md5 = Some(file_md5.to_string());
        task.updated_at = Utc::now();

        let snapshot = task.clone();
        self.persist(&snapshot).await?;

        if let Some(parent_id) = snapshot.parent_task_id.as_deref() {
            if let Some(parent) = reconcile_parent(&mut tasks, parent_id) {
                self.persist(&parent).await?;
            }
        }

        Ok(())
    }

    pub async fn mark_task_failed(&self, file_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(file_id)
            .ok_or_else(|| UploadError::TaskNotFound(file_id.to_string()))?;

        task.status = TaskStatus::Failed;
        task.updated_at = Utc::now();

        let snapshot = task.clone();
        self.persist(&snapshot).await
    }

    /// 暂停任务；文件夹任务级联暂停所有上传中的子任务
    pub async fn pause_task(&self, file_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get(file_id)
            .ok_or_else(|| UploadError::TaskNotFound(file_id.to_string()))?;

        if task.status == TaskStatus::Completed {
            return Err(UploadError::validation("completed task cannot be paused"));
        }

        let sub_ids = task.sub_task_ids().to_vec();
        for sub_id in &sub_ids {
            if let Some(child) = tasks.get_mut(sub_id) {
                if child.status == TaskStatus::Uploading {
                    child.status = TaskStatus::Paused;
                    child.updated_at = Utc::now();
                    let snapshot = child.clone();
                    self.persist(&snapshot).await?;
                }
            }
        }

        let task = tasks
            .get_mut(file_id)
            .ok_or_else(|| UploadError::TaskNotFound(file_id.to_string()))?;
        task.status = TaskStatus::Paused;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        self.persist(&snapshot).await
    }

    /// 恢复暂停/失败的任务
    ///
    /// 失败分片重置为 pending，重试计数加一；文件夹任务级联恢复所有
    /// 可恢复的子任务。
    pub async fn resume_task(&self, file_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(file_id)
            .ok_or_else(|| UploadError::TaskNotFound(file_id.to_string()))?;

        if !matches!(
            task.status,
            TaskStatus::Paused | TaskStatus::Failed | TaskStatus::PartialFailed
        ) {
            return Err(UploadError::validation(
                "only paused or failed tasks can be resumed",
            ));
        }

        resume_in_place(task);
        let snapshot = task.clone();
        self.persist(&snapshot).await?;

        for sub_id in snapshot.sub_task_ids() {
            if let Some(child) = tasks.get_mut(sub_id) {
                if matches!(child.status, TaskStatus::Paused | TaskStatus::Failed) {
                    resume_in_place(child);
                    let child_snapshot = child.clone();
                    self.persist(&child_snapshot).await?;
                }
            }
        }

        Ok(())
    }

    /// 批量恢复所有失败/暂停的主任务，返回恢复成功的任务 ID
    ///
    /// 子任务经由所属文件夹的级联恢复处理，避免重复累加重试计数。
    /// 单个任务落盘失败只告警，不中断整批操作。
    pub async fn resume_all_failed(&self) -> Result<Vec<String>> {
        let mut tasks = self.tasks.write().await;
        let ids: Vec<String> = tasks.keys().cloned().collect();
        let mut resumed = Vec::new();

        for id in ids {
            let eligible = tasks
                .get(&id)
                .map(|t| {
                    !t.is_sub_task()
                        && matches!(
                            t.status,
                            TaskStatus::Failed | TaskStatus::Paused | TaskStatus::PartialFailed
                        )
                })
                .unwrap_or(false);
            if !eligible {
                continue;
            }

            let snapshot = {
                let Some(task) = tasks.get_mut(&id) else { continue };
                resume_in_place(task);
                task.clone()
            };

            if let Err(err) = self.persist(&snapshot).await {
                warn!(file_id = %id, error = %err, "failed to persist resumed task");
                continue;
            }

            for sub_id in snapshot.sub_task_ids() {
                if let Some(child) = tasks.get_mut(sub_id) {
                    if matches!(child.status, TaskStatus::Paused | TaskStatus::Failed) {
                        resume_in_place(child);
                        let child_snapshot = child.clone();
                        if let Err(err) = self.persist(&child_snapshot).await {
                            warn!(file_id = %sub_id, error = %err, "failed to persist resumed sub task");
                        }
                    }
                }
            }

            resumed.push(id);
        }

        Ok(resumed)
    }

    /// 删除任务及其分片产物、锁文件和元数据
    ///
    /// 文件夹任务先递归删除子任务。对不存在的任务是幂等空操作。
    pub async fn delete_task(&self, file_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        self.delete_locked(&mut tasks, file_id).await;
        Ok(())
    }

    /// 清理过期任务：失败或暂停且超过保留期，返回删除数量
    pub async fn cleanup_expired_tasks(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(RETENTION_DAYS);

        let mut tasks = self.tasks.write().await;
        let expired: Vec<String> = tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Failed | TaskStatus::Paused) && t.updated_at < cutoff
            })
            .map(|t| t.file_id.clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            // 文件夹级联可能已经顺带删除了后续条目
            if tasks.contains_key(&id) {
                self.delete_locked(&mut tasks, &id).await;
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn delete_locked(&self, tasks: &mut HashMap<String, UploadTask>, file_id: &str) {
        let sub_ids = tasks
            .get(file_id)
            .map(|t| t.sub_task_ids().to_vec())
            .unwrap_or_default();
        for sub_id in sub_ids {
            tasks.remove(&sub_id);
            self.remove_task_files(&sub_id).await;
        }

        tasks.remove(file_id);
        self.remove_task_files(file_id).await;
    }

    /// 删除任务在磁盘上的所有痕迹，尽力而为
    async fn remove_task_files(&self, file_id: &str) {
        let chunk_dir = self.config.chunk_dir(file_id);
        if let Err(err) = tokio::fs::remove_dir_all(&chunk_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %chunk_dir.display(), error = %err, "failed to remove chunk directory");
            }
        }

        for path in [
            self.config.upload_lock_path(file_id),
            self.config.merge_lock_path(file_id),
            self.config.task_file(file_id),
        ] {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove task file");
                }
            }
        }
    }

    async fn persist(&self, task: &UploadTask) -> Result<()> {
        let path = self.config.task_file(&task.file_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UploadError::persistence(e.to_string()))?;
        }

        let record = TaskRecord::from(task);
        let data = serde_json::to_vec_pretty(&record)
            .map_err(|e| UploadError::persistence(e.to_string()))?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| UploadError::persistence(e.to_string()))?;

        Ok(())
    }
}

fn resume_in_place(task: &mut UploadTask) {
    task.status = TaskStatus::Uploading;
    task.retry_count += 1;
    task.reset_failed_chunks();
    task.updated_at = Utc::now();
}

/// 子任务完成后检查父文件夹任务是否整体完成
///
/// 返回需要落盘的父任务快照。
fn reconcile_parent(
    tasks: &mut HashMap<String, UploadTask>,
    parent_id: &str,
) -> Option<UploadTask> {
    let all_done = {
        let parent = tasks.get(parent_id)?;
        if parent.status == TaskStatus::Completed {
            return None;
        }
        let sub_ids = parent.sub_task_ids();
        !sub_ids.is_empty()
            && sub_ids.iter().all(|id| {
                tasks
                    .get(id)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
    };

    if !all_done {
        return None;
    }

    let parent = tasks.get_mut(parent_id)?;
    parent.status = TaskStatus::Completed;
    parent.updated_at = Utc::now();
    Some(parent.clone())
}

async fn read_record(path: &Path) -> Result<UploadTask> {
    let data = tokio::fs::read(path).await?;
    let record: TaskRecord =
        serde_json::from_slice(&data).map_err(|e| UploadError::persistence(e.to_string()))?;
    Ok(record.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaskType {
    File,
    Folder,
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::File
    }
}

/// 落盘格式
///
/// 与旧版保持字段兼容：缺失的字段取默认值（单文件任务、空分片表、
/// 空子任务列表），可选字段用空字符串表示缺省。
#[derive(Debug, Serialize, Deserialize)]
struct TaskRecord {
    file_id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    relative_path: String,
    #[serde(default)]
    total_chunks: u32,
    #[serde(default)]
    file_size: u64,
    #[serde(default)]
    file_md5: String,
    #[serde(default)]
    status: TaskStatus,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    chunks: HashMap<u32, ChunkInfo>,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    task_type: TaskType,
    #[serde(default)]
    folder_name: String,
    #[serde(default)]
    sub_tasks: Vec<String>,
    #[serde(default)]
    parent_task_id: String,
    #[serde(default)]
    is_sub_task: bool,
}

impl From<&UploadTask> for TaskRecord {
    fn from(task: &UploadTask) -> Self {
        let (task_type, folder_name, sub_tasks) = match &task.kind {
            TaskKind::File => (TaskType::File, String::new(), Vec::new()),
            TaskKind::Folder {
                folder_name,
                sub_tasks,
            } => (TaskType::Folder, folder_name.clone(), sub_tasks.clone()),
        };

        Self {
            file_id: task.file_id.clone(),
            filename: task.file_name.clone(),
            relative_path: task.relative_path.clone().unwrap_or_default(),
            total_chunks: task.total_chunks,
            file_size: task.file_size,
            file_md5: task.file_md5.clone().unwrap_or_default(),
            status: task.status,
            created_at: task.created_at,
            updated_at: task.updated_at,
            chunks: task.chunks.clone(),
            retry_count: task.retry_count,
            task_type,
            folder_name,
            sub_tasks,
            parent_task_id: task.parent_task_id.clone().unwrap_or_default(),
            is_sub_task: task.parent_task_id.is_some(),
        }
    }
}

impl From<TaskRecord> for UploadTask {
    fn from(record: TaskRecord) -> Self {
        let kind = match record.task_type {
            TaskType::Folder => TaskKind::Folder {
                folder_name: record.folder_name,
                sub_tasks: record.sub_tasks,
            },
            TaskType::File => TaskKind::File,
        };

        Self {
            file_id: record.file_id,
            file_name: record.filename,
            relative_path: non_empty(record.relative_path),
            total_chunks: record.total_chunks,
            file_size: record.file_size,
            file_md5: non_empty(record.file_md5),
            status: record.status,
            created_at: record.created_at,
            updated_at: record.updated_at,
            chunks: record.chunks,
            retry_count: record.retry_count,
            kind,
            parent_task_id: non_empty(record.parent_task_id),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::core::types::ChunkUpload;

    fn test_config(root: &Path) -> WharfConfig {
        WharfConfig {
            upload_dir: root.join("upload"),
            merged_dir: root.join("merged"),
            ..WharfConfig::default()
        }
    }

    async fn open_store(root: &Path) -> TaskStore {
        TaskStore::open(test_config(root)).await.unwrap()
    }

    fn file_task(file_id: &str, total_chunks: u32, file_size: u64) -> UploadTask {
        UploadTask::from_first_chunk(&ChunkUpload {
            file_id: file_id.to_string(),
            chunk_index: 0,
            data: Bytes::new(),
            md5: None,
            relative_path: None,
            filename: Some(format!("{file_id}.bin")),
            total_chunks,
            file_size,
        })
    }

    fn spec(file_id: &str, total_chunks: u32, file_size: u64) -> FileSpec {
        FileSpec {
            file_id: file_id.to_string(),
            filename: format!("{file_id}.bin"),
            relative_path: None,
            total_chunks,
            file_size,
        }
    }

    #[tokio::test]
    async fn test_save_and_get_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.save_task(file_task("f1", 2, 10)).await.unwrap();

        let task = store.get_task("f1").await.unwrap();
        assert_eq!(task.file_name, "f1.bin");
        assert_eq!(task.status, TaskStatus::Uploading);
        assert!(store.get_task("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_update_chunk_completes_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.save_task(file_task("f1", 2, 10)).await.unwrap();

        store
            .update_chunk("f1", 0, ChunkInfo::completed(0, 5, None))
            .await
            .unwrap();
        assert_eq!(store.get_task("f1").await.unwrap().status, TaskStatus::Uploading);

        store
            .update_chunk("f1", 1, ChunkInfo::completed(1, 5, None))
            .await
            .unwrap();
        let task = store.get_task("f1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(store.uploaded_chunks("f1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_update_chunk_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let err = store
            .update_chunk("nope", 0, ChunkInfo::completed(0, 1, None))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_folder_task_rejects_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let err = store.create_folder_task("photos", &[]).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn test_folder_completion_propagates_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let folder = store
            .create_folder_task("photos", &[spec("c1", 1, 4), spec("c2", 1, 4)])
            .await
            .unwrap();

        store
            .update_chunk("c1", 0, ChunkInfo::completed(0, 4, None))
            .await
            .unwrap();
        assert_eq!(
            store.get_task(&folder.file_id).await.unwrap().status,
            TaskStatus::Pending
        );

        store
            .update_chunk("c2", 0, ChunkInfo::completed(0, 4, None))
            .await
            .unwrap();
        assert_eq!(
            store.get_task(&folder.file_id).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_folder_summary_is_pure_and_proportional() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let folder = store
            .create_folder_task("photos", &[spec("c1", 2, 100), spec("c2", 2, 100)])
            .await
            .unwrap();

        // c1 全部完成，c2 完成一半
        store
            .update_chunk("c1", 0, ChunkInfo::completed(0, 50, None))
            .await
            .unwrap();
        store
            .update_chunk("c1", 1, ChunkInfo::completed(1, 50, None))
            .await
            .unwrap();
        store.ensure_uploading("c2").await.unwrap();
        store
            .update_chunk("c2", 0, ChunkInfo::completed(0, 50, None))
            .await
            .unwrap();

        let summary = store.folder_summary(&folder.file_id).await.unwrap();
        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.completed_files, 1);
        assert_eq!(summary.failed_files, 0);
        assert_eq!(summary.total_size, 200);
        assert_eq!(summary.uploaded_size, 150);
        assert_eq!(summary.status, TaskStatus::Uploading);
        assert!((summary.completion_rate - 75.0).abs() < f64::EPSILON);

        // 汇总是纯读操作，不改动父任务状态
        assert_eq!(
            store.get_task(&folder.file_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let folder = store
            .create_folder_task(
                "docs",
                &[spec("s1", 1, 1), spec("s2", 1, 1), spec("s3", 1, 1)],
            )
            .await
            .unwrap();

        for id in ["s1", "s2", "s3"] {
            store.ensure_uploading(id).await.unwrap();
        }

        store.pause_task(&folder.file_id).await.unwrap();
        assert_eq!(
            store.get_task(&folder.file_id).await.unwrap().status,
            TaskStatus::Paused
        );
        for id in ["s1", "s2", "s3"] {
            assert_eq!(store.get_task(id).await.unwrap().status, TaskStatus::Paused);
        }

        store.resume_task(&folder.file_id).await.unwrap();
        let parent = store.get_task(&folder.file_id).await.unwrap();
        assert_eq!(parent.status, TaskStatus::Uploading);
        assert_eq!(parent.retry_count, 1);
        for id in ["s1", "s2", "s3"] {
            let child = store.get_task(id).await.unwrap();
            assert_eq!(child.status, TaskStatus::Uploading);
            // 每次 resume 调用恰好加一
            assert_eq!(child.retry_count, 1);
        }
    }

    #[tokio::test]
    async fn test_pause_completed_task_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut task = file_task("f1", 1, 1);
        task.status = TaskStatus::Completed;
        store.save_task(task).await.unwrap();

        assert!(matches!(
            store.pause_task("f1").await,
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_resets_failed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.save_task(file_task("f1", 2, 10)).await.unwrap();
        store
            .update_chunk("f1", 0, ChunkInfo::completed(0, 5, None))
            .await
            .unwrap();
        store
            .update_chunk("f1", 1, ChunkInfo::failed(1, 5))
            .await
            .unwrap();
        store.mark_task_failed("f1").await.unwrap();

        store.resume_task("f1").await.unwrap();
        let task = store.get_task("f1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Uploading);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.chunks[&1].status, crate::core::types::ChunkStatus::Pending);
        assert_eq!(
            task.chunks[&0].status,
            crate::core::types::ChunkStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_resume_all_failed_increments_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let folder = store
            .create_folder_task("docs", &[spec("s1", 1, 1), spec("s2", 1, 1)])
            .await
            .unwrap();
        for id in ["s1", "s2"] {
            store.ensure_uploading(id).await.unwrap();
        }
        store.pause_task(&folder.file_id).await.unwrap();

        let mut standalone = file_task("alone", 1, 1);
        standalone.status = TaskStatus::Failed;
        store.save_task(standalone).await.unwrap();

        let resumed = store.resume_all_failed().await.unwrap();
        assert_eq!(resumed.len(), 2);

        for id in [folder.file_id.as_str(), "s1", "s2", "alone"] {
            let task = store.get_task(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Uploading, "task {id}");
            assert_eq!(task.retry_count, 1, "task {id}");
        }
    }

    #[tokio::test]
    async fn test_delete_folder_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let folder = store
            .create_folder_task("docs", &[spec("s1", 1, 1), spec("s2", 1, 1)])
            .await
            .unwrap();

        store.delete_task(&folder.file_id).await.unwrap();
        assert!(store.get_task(&folder.file_id).await.is_none());
        assert!(store.get_task("s1").await.is_none());
        assert!(store.get_task("s2").await.is_none());

        // 删除不存在的任务是幂等空操作
        store.delete_task("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_expired_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.save_task(file_task("old-failed", 1, 1)).await.unwrap();
        store.save_task(file_task("fresh-failed", 1, 1)).await.unwrap();
        store.save_task(file_task("old-active", 1, 1)).await.unwrap();
        store.mark_task_failed("old-failed").await.unwrap();
        store.mark_task_failed("fresh-failed").await.unwrap();

        {
            let mut tasks = store.tasks.write().await;
            let backdated = Utc::now() - chrono::Duration::days(8);
            tasks.get_mut("old-failed").unwrap().updated_at = backdated;
            tasks.get_mut("old-active").unwrap().updated_at = backdated;
        }

        let removed = store.cleanup_expired_tasks().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_task("old-failed").await.is_none());
        // 新近失败的和仍活跃的任务保留
        assert!(store.get_task("fresh-failed").await.is_some());
        assert!(store.get_task("old-active").await.is_some());
    }

    #[tokio::test]
    async fn test_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = open_store(dir.path()).await;
            store.save_task(file_task("f1", 2, 10)).await.unwrap();
            store
                .update_chunk("f1", 0, ChunkInfo::completed(0, 5, None))
                .await
                .unwrap();
            store
                .create_folder_task("docs", &[spec("s1", 1, 1)])
                .await
                .unwrap();
        }

        let store = open_store(dir.path()).await;
        let task = store.get_task("f1").await.unwrap();
        assert_eq!(task.total_chunks, 2);
        assert_eq!(task.completed_chunk_count(), 1);

        let folders: Vec<_> = store
            .main_tasks()
            .await
            .into_iter()
            .filter(|t| t.is_folder())
            .collect();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].sub_task_ids(), ["s1"]);
        assert!(store.get_task("s1").await.unwrap().is_sub_task());
    }

    #[tokio::test]
    async fn test_legacy_record_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        tokio::fs::create_dir_all(config.metadata_dir()).await.unwrap();

        // 旧版记录：没有 task_type / sub_tasks / parent_task_id 字段
        let legacy = r#"{
            "file_id": "legacy-1",
            "filename": "old.bin",
            "relative_path": "",
            "total_chunks": 1,
            "file_size": 10,
            "file_md5": "",
            "status": "uploading",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
            "retry_count": 0
        }"#;
        tokio::fs::write(config.task_file("legacy-1"), legacy)
            .await
            .unwrap();

        let store = TaskStore::open(config).await.unwrap();
        let task = store.get_task("legacy-1").await.unwrap();
        assert!(!task.is_folder());
        assert!(!task.is_sub_task());
        assert!(task.chunks.is_empty());
        assert_eq!(task.relative_path, None);
        assert_eq!(task.file_md5, None);
        assert_eq!(task.status, TaskStatus::Uploading);
    }

    #[tokio::test]
    async fn test_main_tasks_filters_sub_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.save_task(file_task("solo", 1, 1)).await.unwrap();
        store
            .create_folder_task("docs", &[spec("s1", 1, 1)])
            .await
            .unwrap();

        assert_eq!(store.all_tasks().await.len(), 3);
        let main: Vec<String> = store
            .main_tasks()
            .await
            .into_iter()
            .map(|t| t.file_id)
            .collect();
        assert_eq!(main.len(), 2);
        assert!(!main.contains(&"s1".to_string()));
    }
}
