pub mod config;
pub mod core;
pub mod utils;

// 重新导出核心类型
pub use config::WharfConfig;
pub use core::{
    ChunkInfo,
    ChunkReceipt,
    ChunkStatus,
    ChunkUpload,
    FileSpec,
    FolderSummary,
    MergeOutcome,
    MergeRequest,
    Result,
    TaskKind,
    TaskStatus,
    TaskStore,
    UploadError,
    UploadManager,
    UploadTask,
};
pub use utils::retry::RetryConfig;
