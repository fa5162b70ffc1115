use std::collections::{HashMap, HashSet};
use chrono::{DateTime, Utc};
use super::types::{ChunkInfo, ChunkStatus, ChunkUpload, FileSpec, TaskStatus};

/// 任务种类
///
/// 文件夹任务持有子任务 ID 列表，普通文件任务不可能带子任务。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    File,
    Folder {
        folder_name: String,
        sub_tasks: Vec<String>,
    },
}

/// 上传任务
///
/// 单个文件或一个文件夹的持久化进度记录，所有变更都必须经由
/// `TaskStore` 进行。
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub file_id: String,
    pub file_name: String,
    pub relative_path: Option<String>,
    pub total_chunks: u32,
    pub file_size: u64,
    /// 合并成功后才会写入
    pub file_md5: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 分片索引 -> 分片记录
    pub chunks: HashMap<u32, ChunkInfo>,
    pub retry_count: u32,
    pub kind: TaskKind,
    /// 所属文件夹任务的 ID（仅子任务）
    pub parent_task_id: Option<String>,
}

impl UploadTask {
    /// 从首个分片创建单文件任务
    pub fn from_first_chunk(req: &ChunkUpload) -> Self {
        let now = Utc::now();
        Self {
            file_id: req.file_id.clone(),
            file_name: req
                .filename
                .clone()
                .unwrap_or_else(|| req.file_id.clone()),
            relative_path: req.relative_path.clone(),
            total_chunks: req.total_chunks,
            file_size: req.file_size,
            file_md5: None,
            status: TaskStatus::Uploading,
            created_at: now,
            updated_at: now,
            chunks: HashMap::new(),
            retry_count: 0,
            kind: TaskKind::File,
            parent_task_id: None,
        }
    }

    /// 为文件夹任务创建一个子任务，初始为 pending、分片表为空
    pub(crate) fn new_sub_task(spec: &FileSpec, parent_id: &str) -> Self {
        let now = Utc::now();
        Self {
            file_id: spec.file_id.clone(),
            file_name: spec.filename.clone(),
            relative_path: spec.relative_path.clone(),
            total_chunks: spec.total_chunks,
            file_size: spec.file_size,
            file_md5: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            chunks: HashMap::new(),
            retry_count: 0,
            kind: TaskKind::File,
            parent_task_id: Some(parent_id.to_string()),
        }
    }

    pub(crate) fn new_folder(
        folder_id: &str,
        folder_name: &str,
        sub_tasks: Vec<String>,
        total_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            file_id: folder_id.to_string(),
            file_name: folder_name.to_string(),
            relative_path: None,
            total_chunks: 0,
            file_size: total_size,
            file_md5: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            chunks: HashMap::new(),
            retry_count: 0,
            kind: TaskKind::Folder {
                folder_name: folder_name.to_string(),
                sub_tasks,
            },
            parent_task_id: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, TaskKind::Folder { .. })
    }

    pub fn is_sub_task(&self) -> bool {
        self.parent_task_id.is_some()
    }

    /// 子任务 ID 列表，文件任务返回空切片
    pub fn sub_task_ids(&self) -> &[String] {
        match &self.kind {
            TaskKind::Folder { sub_tasks, .. } => sub_tasks,
            TaskKind::File => &[],
        }
    }

    pub fn folder_name(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Folder { folder_name, .. } => Some(folder_name),
            TaskKind::File => None,
        }
    }

    pub fn completed_chunk_count(&self) -> usize {
        self.chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count()
    }

    /// 已完成分片的索引集合
    pub fn uploaded_indices(&self) -> HashSet<u32> {
        self.chunks
            .iter()
            .filter(|(_, c)| c.status == ChunkStatus::Completed)
            .map(|(index, _)| *index)
            .collect()
    }

    /// 所有分片是否都已完成
    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.completed_chunk_count() as u32 == self.total_chunks
    }

    /// 分片完成率（百分比），按分片数计
    pub fn chunk_completion_rate(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.completed_chunk_count() as f64 / self.total_chunks as f64 * 100.0
    }

    /// 把失败的分片重置为 pending，返回重置个数
    pub(crate) fn reset_failed_chunks(&mut self) -> usize {
        let mut reset = 0;
        for chunk in self.chunks.values_mut() {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
                chunk.retry_count = 0;
                reset += 1;
            }
        }
        reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk_request() -> ChunkUpload {
        ChunkUpload {
            file_id: "file-1".to_string(),
            chunk_index: 0,
            data: Bytes::from_static(b"abc"),
            md5: None,
            relative_path: None,
            filename: Some("report.pdf".to_string()),
            total_chunks: 2,
            file_size: 6,
        }
    }

    #[test]
    fn test_completion_by_chunk_count() {
        let mut task = UploadTask::from_first_chunk(&chunk_request());
        assert!(!task.is_complete());

        task.chunks.insert(0, ChunkInfo::completed(0, 3, None));
        task.chunks.insert(1, ChunkInfo::failed(1, 3));
        assert_eq!(task.completed_chunk_count(), 1);
        assert!(!task.is_complete());

        task.chunks.insert(1, ChunkInfo::completed(1, 3, None));
        assert!(task.is_complete());
        assert_eq!(task.uploaded_indices().len(), 2);
    }

    #[test]
    fn test_reset_failed_chunks() {
        let mut task = UploadTask::from_first_chunk(&chunk_request());
        task.chunks.insert(0, ChunkInfo::completed(0, 3, None));
        task.chunks.insert(1, ChunkInfo::failed(1, 3));

        assert_eq!(task.reset_failed_chunks(), 1);
        assert_eq!(task.chunks[&1].status, ChunkStatus::Pending);
        // 已完成的分片不受影响
        assert_eq!(task.chunks[&0].status, ChunkStatus::Completed);
    }

    #[test]
    fn test_folder_kind_accessors() {
        let folder = UploadTask::new_folder(
            "folder-1",
            "photos",
            vec!["a".to_string(), "b".to_string()],
            100,
        );
        assert!(folder.is_folder());
        assert!(!folder.is_sub_task());
        assert_eq!(folder.sub_task_ids().len(), 2);
        assert_eq!(folder.folder_name(), Some("photos"));

        let file = UploadTask::from_first_chunk(&chunk_request());
        assert!(!file.is_folder());
        assert!(file.sub_task_ids().is_empty());
    }
}
