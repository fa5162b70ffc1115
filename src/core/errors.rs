use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("lock already held: {0}")]
    Locked(String),

    #[error("integrity check failed: expected {expected}, actual {actual}")]
    Integrity { expected: String, actual: String },

    #[error("chunk {index} is missing on disk")]
    MissingChunk { index: u32 },

    #[error("upload incomplete: {uploaded} of {required} chunks completed")]
    Incomplete { uploaded: usize, required: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("operation cancelled or deadline exceeded")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<UploadError>,
    },
}

/// 与原实现保持一致的瞬态错误特征串
const TRANSIENT_SIGNATURES: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "network is unreachable",
    "temporary failure",
    "service unavailable",
    "timeout",
    "timed out",
    "deadline exceeded",
    "broken pipe",
    "no route to host",
    "resource busy",
];

impl UploadError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// 该错误是否值得重试
    ///
    /// 只有被归类为瞬态的 IO 错误可以重试；校验、冲突、完整性等
    /// 错误重试也不会有不同结果，立即向调用方返回。
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Io(err) => is_transient_io(err),
            _ => false,
        }
    }
}

fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    ) {
        return true;
    }

    let text = err.to_string().to_ascii_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| text.contains(sig))
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
